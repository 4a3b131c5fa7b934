use futures_util::StreamExt;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};
use tokio::task::{Id, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use super::InputContext;
use super::matcher::{Decision, NameFilter};
use super::tailer::{TailOutcome, Tailer};
use crate::runtime::{ContainerDescriptor, ContainerRuntime, LifecycleAction, LifecycleEvent};
use crate::sincedb::{OffsetStore, Position};

/// Finds containers to tail and owns their tailer tasks.
///
/// Running containers are enumerated first, then the daemon's lifecycle
/// events are followed so containers started later are picked up as well.
/// At most one tailer runs per container at any time.
pub struct Discoverer {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<dyn OffsetStore>,
    filter: NameFilter,
    tailer: Tailer,
    retry_interval: Duration,
    cancel: CancellationToken,
    active: HashSet<String>,
    /// Active containers that started again before their tailer finished.
    restarts: HashSet<String>,
    tasks: HashMap<Id, String>,
    tailers: JoinSet<TailOutcome>,
}

impl Discoverer {
    pub fn new(
        ctx: &InputContext,
        filter: NameFilter,
        retry_interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            runtime: Arc::clone(&ctx.runtime),
            store: Arc::clone(&ctx.store),
            filter,
            tailer: Tailer::new(ctx, retry_interval, cancel.clone()),
            retry_interval,
            cancel,
            active: HashSet::new(),
            restarts: HashSet::new(),
            tasks: HashMap::new(),
            tailers: JoinSet::new(),
        }
    }

    /// Run until cancelled, then wait for every tailer to stop.
    pub async fn run(mut self) {
        let runtime = Arc::clone(&self.runtime);
        let cancel = self.cancel.clone();

        'discovery: loop {
            if !self.enumerate().await {
                break;
            }

            let mut events = runtime.subscribe_events();
            log::info!("Listening for container events");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break 'discovery,
                    Some(joined) = self.tailers.join_next_with_id(), if !self.tailers.is_empty() => {
                        self.reap(joined).await;
                    }
                    event = events.next() => match event {
                        Some(Ok(event)) => self.handle_event(event).await,
                        Some(Err(e)) => {
                            log::error!("Container event stream failed: {e}");
                            break;
                        }
                        None => {
                            log::warn!("Container event stream closed");
                            break;
                        }
                    }
                }
            }

            log::info!(
                "Resubscribing to container events in {:?}",
                self.retry_interval
            );
            if !self.pause().await {
                break;
            }
        }

        self.shutdown().await;
    }

    /// Sleep for the retry interval. Returns `false` when cancelled meanwhile.
    async fn pause(&self) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(self.retry_interval) => true,
        }
    }

    /// Start tailing the containers that are already running. Returns `false`
    /// when cancelled before the listing succeeded.
    async fn enumerate(&mut self) -> bool {
        let containers = loop {
            let listed = tokio::select! {
                _ = self.cancel.cancelled() => return false,
                listed = self.runtime.list_containers() => listed,
            };
            match listed {
                Ok(containers) => break containers,
                Err(e) => {
                    log::error!(
                        "Failed to list containers: {e}. Retrying in {:?}",
                        self.retry_interval
                    );
                    if !self.pause().await {
                        return false;
                    }
                }
            }
        };

        log::info!("Found {} running containers", containers.len());
        for container in containers {
            self.consider(container).await;
        }
        true
    }

    async fn handle_event(&mut self, event: LifecycleEvent) {
        match event.action {
            LifecycleAction::Start => {}
            LifecycleAction::Destroy => {
                self.restarts.remove(&event.container_id);
                if let Err(e) = self.store.remove(&event.container_id).await {
                    log::error!(
                        "Failed to forget position of removed container {}: {e}",
                        event.container_id
                    );
                }
                return;
            }
            LifecycleAction::Other(_) => {
                log::trace!(
                    "Ignoring {:?} event of container {}",
                    event.action,
                    event.container_id
                );
                return;
            }
        }
        if self.active.contains(&event.container_id) {
            // The old stream may still be draining, pick it up once reaped
            log::debug!(
                "Container {} started while still tailed, resuming after the current tailer",
                event.container_id
            );
            self.restarts.insert(event.container_id);
            return;
        }

        self.admit(&event.container_id).await;
    }

    /// Inspect a container by id and tail it if it passes the filter.
    async fn admit(&mut self, id: &str) {
        let inspected = self.runtime.inspect_container(id).await;
        match inspected {
            Ok(container) => self.consider(container).await,
            Err(e) => log::error!("Failed to inspect started container {id}: {e}"),
        }
    }

    async fn consider(&mut self, container: ContainerDescriptor) {
        if self.active.contains(&container.id) {
            return;
        }
        if self.filter.decide(&container.names) == Decision::Skip {
            log::debug!(
                "Skipping container {} {:?}",
                container.short_id(),
                container.names
            );
            return;
        }

        let position = self.store.get(&container.id).await;
        match position {
            Ok(position) => self.launch(container, position),
            Err(e) => log::error!(
                "Failed to read position of container {}: {e}",
                container.display_name()
            ),
        }
    }

    fn launch(&mut self, container: ContainerDescriptor, position: Position) {
        let tailer = self.tailer.clone();
        let id = container.id.clone();
        let handle = self
            .tailers
            .spawn(async move { tailer.run(&container, position).await });
        self.tasks.insert(handle.id(), id.clone());
        self.active.insert(id);
    }

    async fn reap(&mut self, joined: Result<(Id, TailOutcome), JoinError>) {
        let (task_id, outcome) = match joined {
            Ok((task_id, outcome)) => (task_id, Some(outcome)),
            Err(e) => {
                log::error!("Tailer task failed: {e}");
                (e.id(), None)
            }
        };

        let finished = self.tasks.remove(&task_id);
        if let Some(container_id) = &finished {
            self.active.remove(container_id);
        }

        if outcome == Some(TailOutcome::SinkClosed) && !self.cancel.is_cancelled() {
            log::error!("Event sink closed, stopping the docker input");
            self.cancel.cancel();
        }

        let Some(container_id) = finished else {
            return;
        };
        if self.restarts.remove(&container_id) && !self.cancel.is_cancelled() {
            log::info!("Tailing restarted container {container_id} again");
            self.admit(&container_id).await;
        }
    }

    async fn shutdown(&mut self) {
        log::info!("Waiting for {} tailers to stop", self.tailers.len());
        while let Some(joined) = self.tailers.join_next_with_id().await {
            self.reap(joined).await;
        }
        log::info!("Container discovery stopped");
    }
}
