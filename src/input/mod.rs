//! The docker input: container discovery, name filtering and log tailing.

use std::sync::Arc;
use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;

use crate::config_file::InputSettings;
use crate::events::LogEvent;
use crate::runtime::{ContainerRuntime, DockerRuntime, RuntimeError};
use crate::sincedb::{FileSinceDb, OffsetStore, SinceDbError};

pub mod discovery;
pub mod lines;
pub mod matcher;
pub mod tailer;

pub use discovery::Discoverer;
pub use matcher::NameFilter;

#[derive(Debug, thiserror::Error)]
pub enum InputError {
    #[error("invalid container name pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    SinceDb(#[from] SinceDbError),
    #[error("unable to determine hostname: {0}")]
    Hostname(#[from] nix::Error),
}

/// Live resources shared by the discovery loop and every tailer.
#[derive(Clone)]
pub struct InputContext {
    pub runtime: Arc<dyn ContainerRuntime>,
    pub store: Arc<dyn OffsetStore>,
    pub sink: Sender<LogEvent>,
    pub hostname: Arc<str>,
}

fn hostname() -> Result<String, InputError> {
    Ok(nix::unistd::gethostname()?.to_string_lossy().into_owned())
}

/// The docker input, connected and ready to run.
pub struct DockerInput {
    ctx: InputContext,
    filter: NameFilter,
    sincedb: Arc<FileSinceDb>,
    settings: InputSettings,
    cancel: CancellationToken,
}

impl DockerInput {
    /// Compile the filters, connect to docker and load the sincedb. Every
    /// failure here is fatal for the input.
    pub async fn connect(
        settings: &InputSettings,
        sink: Sender<LogEvent>,
        cancel: CancellationToken,
    ) -> Result<Self, InputError> {
        let filter = settings.name_filter()?;
        let runtime = DockerRuntime::connect(&settings.host).await?;
        let sincedb = Arc::new(FileSinceDb::open(&settings.since_path).await?);
        log::info!("Using sincedb at {}", sincedb.path().display());

        let ctx = InputContext {
            runtime: Arc::new(runtime),
            store: sincedb.clone(),
            sink,
            hostname: Arc::from(hostname()?),
        };

        Ok(Self {
            ctx,
            filter,
            sincedb,
            settings: settings.clone(),
            cancel,
        })
    }

    /// Tail the selected containers until cancelled. Anything going wrong
    /// while running is logged and retried.
    pub async fn run(self) {
        let Self {
            ctx,
            filter,
            sincedb,
            settings,
            cancel,
        } = self;

        let flusher = {
            let sincedb = Arc::clone(&sincedb);
            let interval = settings.flush_interval();
            let cancel = cancel.clone();
            tokio::spawn(async move { sincedb.run_flusher(interval, cancel).await })
        };

        let discoverer = Discoverer::new(&ctx, filter, settings.retry_interval(), cancel.clone());
        drop(ctx);
        discoverer.run().await;

        // The flusher writes the final positions once cancelled
        cancel.cancel();
        if let Err(e) = flusher.await {
            log::error!("Sincedb flusher panicked: {e}");
        }
    }
}
