use chrono::Utc;
use futures_util::StreamExt;
use std::{cmp::Ordering, sync::Arc, time::Duration};
use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::InputContext;
use super::lines::{LineSplitter, LogLine};
use crate::events::{DOCKER_SOURCE, LogEvent};
use crate::runtime::{ContainerDescriptor, ContainerRuntime, RuntimeError};
use crate::sincedb::{OffsetStore, Position};

/// Why a tailer stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailOutcome {
    /// The log stream ended, usually because the container stopped.
    Ended,
    /// The container no longer exists.
    Gone,
    Cancelled,
    /// Nobody is consuming events anymore.
    SinkClosed,
}

/// Drops the lines docker repeats when a stream is reopened, since `since`
/// only has second granularity. Replay ends with the first line newer than
/// the resume position; later lines are never dropped.
#[derive(Debug)]
struct Replay {
    resume: Position,
    /// Lines stamped exactly like `resume` still to drop.
    pending: u32,
    done: bool,
}

impl Replay {
    fn new(resume: Position) -> Self {
        Self {
            resume,
            pending: resume.seen(),
            done: false,
        }
    }

    /// Whether a line stamped `nanos` was consumed before the stream opened.
    fn is_replayed(&mut self, nanos: i64) -> bool {
        if self.done {
            return false;
        }
        match nanos.cmp(&self.resume.nanos()) {
            Ordering::Less => true,
            Ordering::Equal if self.pending > 0 => {
                self.pending -= 1;
                true
            }
            Ordering::Equal => false,
            Ordering::Greater => {
                self.done = true;
                false
            }
        }
    }
}

/// Follows the output of one container and publishes every line.
#[derive(Clone)]
pub struct Tailer {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<dyn OffsetStore>,
    sink: Sender<LogEvent>,
    hostname: Arc<str>,
    retry_interval: Duration,
    cancel: CancellationToken,
}

impl Tailer {
    pub fn new(ctx: &InputContext, retry_interval: Duration, cancel: CancellationToken) -> Self {
        Self {
            runtime: Arc::clone(&ctx.runtime),
            store: Arc::clone(&ctx.store),
            sink: ctx.sink.clone(),
            hostname: Arc::clone(&ctx.hostname),
            retry_interval,
            cancel,
        }
    }

    /// Tail `container` from `position` until its log ends, the input is
    /// cancelled or the sink goes away. Stream failures are retried after the
    /// retry interval from the last forwarded line.
    pub async fn run(&self, container: &ContainerDescriptor, mut position: Position) -> TailOutcome {
        log::info!(
            "Tailing container {} ({}) from position {}",
            container.display_name(),
            container.short_id(),
            position
        );

        loop {
            match self.follow(container, &mut position).await {
                Ok(outcome) => {
                    log::info!(
                        "Stopped tailing container {} ({}): {:?}",
                        container.display_name(),
                        container.short_id(),
                        outcome
                    );
                    return outcome;
                }
                Err(e) => {
                    log::warn!(
                        "Log stream of container {} failed: {}. Reconnecting in {:?}",
                        container.display_name(),
                        e,
                        self.retry_interval
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return TailOutcome::Cancelled,
                        _ = tokio::time::sleep(self.retry_interval) => {}
                    }
                }
            }
        }
    }

    async fn follow(
        &self,
        container: &ContainerDescriptor,
        position: &mut Position,
    ) -> Result<TailOutcome, RuntimeError> {
        let mut stream = self.runtime.open_log_stream(&container.id, *position);
        let mut splitter = LineSplitter::default();
        let mut replay = Replay::new(*position);

        loop {
            let item = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(TailOutcome::Cancelled),
                item = stream.next() => item,
            };

            match item {
                Some(Ok(chunk)) => {
                    for line in splitter.push(&chunk) {
                        let outcome = self.forward(container, line, &mut replay, position).await;
                        if let Some(outcome) = outcome {
                            return Ok(outcome);
                        }
                    }
                }
                Some(Err(RuntimeError::NotFound(_))) => {
                    if let Err(e) = self.store.remove(&container.id).await {
                        log::warn!(
                            "Failed to forget position of container {}: {}",
                            container.short_id(),
                            e
                        );
                    }
                    return Ok(TailOutcome::Gone);
                }
                Some(Err(e)) => return Err(e),
                None => {
                    for line in splitter.finish() {
                        let outcome = self.forward(container, line, &mut replay, position).await;
                        if let Some(outcome) = outcome {
                            return Ok(outcome);
                        }
                    }
                    return Ok(TailOutcome::Ended);
                }
            }
        }
    }

    /// Publish `line` unless it was consumed before. Returns an outcome when
    /// tailing has to stop.
    async fn forward(
        &self,
        container: &ContainerDescriptor,
        line: LogLine,
        replay: &mut Replay,
        position: &mut Position,
    ) -> Option<TailOutcome> {
        let nanos = line.nanos();
        if nanos.is_some_and(|nanos| replay.is_replayed(nanos)) {
            log::trace!(
                "Skipping already consumed line of container {}",
                container.short_id()
            );
            return None;
        }

        let event = LogEvent {
            event_id: Uuid::now_v7(),
            timestamp: line.timestamp.unwrap_or_else(Utc::now).timestamp_micros(),
            source: DOCKER_SOURCE.to_string(),
            message: line.message,
            host: self.hostname.to_string(),
            container_id: container.id.clone(),
            container_name: container.display_name().to_string(),
            stream: line.stream,
        };

        let sent = tokio::select! {
            _ = self.cancel.cancelled() => return Some(TailOutcome::Cancelled),
            sent = self.sink.send(event) => sent,
        };
        if sent.is_err() {
            return Some(TailOutcome::SinkClosed);
        }

        let Some(nanos) = nanos else {
            return None;
        };
        let advanced = position.advance(nanos);
        if advanced != *position {
            *position = advanced;
            if let Err(e) = self.store.set(&container.id, advanced).await {
                log::warn!(
                    "Failed to record position of container {}: {}",
                    container.short_id(),
                    e
                );
            }
        }
        None
    }
}
