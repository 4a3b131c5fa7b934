//! In-memory stand-ins for the docker daemon and the sincedb.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use std::{
    collections::{HashMap, VecDeque},
    path::PathBuf,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};
use tokio::sync::mpsc::{self, Sender, UnboundedSender};
use tokio::sync::oneshot;

use crate::events::LogEvent;
use crate::input::InputContext;
use crate::runtime::{
    ContainerDescriptor, ContainerRuntime, LifecycleAction, LifecycleEvent, LogChunk,
    RuntimeError, StreamKind,
};
use crate::sincedb::{OffsetStore, Position, SinceDbError};

type EventResult = Result<LifecycleEvent, RuntimeError>;

/// How a scripted log stream behaves after its items.
enum ScriptEnd {
    Close,
    /// Stay open like a running container that stays quiet.
    Open,
    /// Stay open until the paired sender fires or is dropped.
    Gate(oneshot::Receiver<()>),
}

/// Output served for one `open_log_stream` call.
pub struct LogScript {
    items: Vec<Result<LogChunk, RuntimeError>>,
    end: ScriptEnd,
}

impl LogScript {
    /// Every line becomes its own stdout chunk, then the stream ends.
    pub fn lines(lines: &[&str]) -> Self {
        let items = lines
            .iter()
            .map(|line| {
                Ok(LogChunk {
                    stream: StreamKind::Stdout,
                    bytes: Bytes::from(format!("{line}\n")),
                })
            })
            .collect();
        Self {
            items,
            end: ScriptEnd::Close,
        }
    }

    /// Raw frames served in order, newlines included.
    pub fn frames(frames: &[(StreamKind, &str)]) -> Self {
        let items = frames
            .iter()
            .map(|(stream, data)| {
                Ok(LogChunk {
                    stream: *stream,
                    bytes: Bytes::from(data.to_string()),
                })
            })
            .collect();
        Self {
            items,
            end: ScriptEnd::Close,
        }
    }

    pub fn failing(reason: &str) -> Self {
        Self::lines(&[]).then_fail(reason)
    }

    pub fn not_found(id: &str) -> Self {
        let mut script = Self::lines(&[]);
        script.items.push(Err(RuntimeError::NotFound(id.to_string())));
        script
    }

    pub fn then_fail(mut self, reason: &str) -> Self {
        self.items
            .push(Err(RuntimeError::Unexpected(reason.to_string())));
        self
    }

    /// Leave the stream open after the scripted items, like a running
    /// container that stays quiet.
    pub fn keep_open(mut self) -> Self {
        self.end = ScriptEnd::Open;
        self
    }

    /// Leave the stream open until the returned sender fires.
    pub fn gated(mut self) -> (Self, oneshot::Sender<()>) {
        let (tx, rx) = oneshot::channel();
        self.end = ScriptEnd::Gate(rx);
        (self, tx)
    }
}

#[derive(Default)]
pub struct FakeRuntime {
    containers: Mutex<Vec<ContainerDescriptor>>,
    list_failures: AtomicUsize,
    inspectable: Mutex<HashMap<String, ContainerDescriptor>>,
    events: Mutex<Option<mpsc::UnboundedReceiver<EventResult>>>,
    scripts: Mutex<HashMap<String, VecDeque<LogScript>>>,
    inspect_calls: Mutex<Vec<String>>,
    log_opens: Mutex<Vec<(String, Position)>>,
}

impl FakeRuntime {
    /// A container that is running at startup and can be inspected.
    pub fn add_running(&self, container: ContainerDescriptor) {
        self.add_inspectable(container.clone());
        self.containers.lock().unwrap().push(container);
    }

    /// A container the daemon knows about, e.g. one that starts later.
    pub fn add_inspectable(&self, container: ContainerDescriptor) {
        self.inspectable
            .lock()
            .unwrap()
            .insert(container.id.clone(), container);
    }

    pub fn fail_next_lists(&self, count: usize) {
        self.list_failures.store(count, Ordering::SeqCst);
    }

    pub fn script_logs(&self, id: &str, script: LogScript) {
        self.scripts
            .lock()
            .unwrap()
            .entry(id.to_string())
            .or_default()
            .push_back(script);
    }

    /// Sender feeding the next event subscription.
    pub fn event_sender(&self) -> UnboundedSender<EventResult> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.events.lock().unwrap() = Some(rx);
        tx
    }

    pub fn inspect_calls(&self) -> Vec<String> {
        self.inspect_calls.lock().unwrap().clone()
    }

    pub fn log_opens(&self) -> Vec<(String, Position)> {
        self.log_opens.lock().unwrap().clone()
    }
}

pub fn event(id: &str, action: &str) -> EventResult {
    Ok(LifecycleEvent {
        container_id: id.to_string(),
        action: LifecycleAction::from(action),
    })
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn list_containers(&self) -> Result<Vec<ContainerDescriptor>, RuntimeError> {
        let failures = self.list_failures.load(Ordering::SeqCst);
        if failures > 0 {
            self.list_failures.store(failures - 1, Ordering::SeqCst);
            return Err(RuntimeError::Unexpected("daemon unavailable".to_string()));
        }
        Ok(self.containers.lock().unwrap().clone())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerDescriptor, RuntimeError> {
        self.inspect_calls.lock().unwrap().push(id.to_string());
        self.inspectable
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))
    }

    fn subscribe_events(&self) -> BoxStream<'_, EventResult> {
        match self.events.lock().unwrap().take() {
            Some(rx) => stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|event| (event, rx))
            })
            .boxed(),
            None => stream::pending().boxed(),
        }
    }

    fn open_log_stream<'a>(
        &'a self,
        id: &'a str,
        since: Position,
    ) -> BoxStream<'a, Result<LogChunk, RuntimeError>> {
        self.log_opens
            .lock()
            .unwrap()
            .push((id.to_string(), since));

        let script = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(id)
            .and_then(|scripts| scripts.pop_front());

        let Some(LogScript { items, end }) = script else {
            return stream::pending().boxed();
        };
        let items = stream::iter(items);
        match end {
            ScriptEnd::Close => items.boxed(),
            ScriptEnd::Open => items.chain(stream::pending()).boxed(),
            ScriptEnd::Gate(gate) => items
                .chain(stream::once(gate).filter_map(|_| async { None }))
                .boxed(),
        }
    }
}

#[derive(Default)]
pub struct MemoryStore {
    positions: Mutex<HashMap<String, Position>>,
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn failing() -> Self {
        Self {
            failing: AtomicBool::new(true),
            ..Default::default()
        }
    }

    pub fn with_position(id: &str, position: Position) -> Self {
        let store = Self::default();
        store
            .positions
            .lock()
            .unwrap()
            .insert(id.to_string(), position);
        store
    }

    pub fn position(&self, id: &str) -> Option<Position> {
        self.positions.lock().unwrap().get(id).copied()
    }

    fn check(&self) -> Result<(), SinceDbError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SinceDbError::Io {
                path: PathBuf::from("memory"),
                source: std::io::Error::other("disk full"),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl OffsetStore for MemoryStore {
    async fn get(&self, id: &str) -> Result<Position, SinceDbError> {
        self.check()?;
        Ok(*self
            .positions
            .lock()
            .unwrap()
            .entry(id.to_string())
            .or_default())
    }

    async fn set(&self, id: &str, position: Position) -> Result<(), SinceDbError> {
        self.check()?;
        self.positions
            .lock()
            .unwrap()
            .insert(id.to_string(), position);
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), SinceDbError> {
        self.check()?;
        self.positions.lock().unwrap().remove(id);
        Ok(())
    }
}

pub fn test_context(
    runtime: Arc<FakeRuntime>,
    store: Arc<MemoryStore>,
    sink: Sender<LogEvent>,
) -> InputContext {
    InputContext {
        runtime,
        store,
        sink,
        hostname: Arc::from("test-host"),
    }
}
