//! Docker runtime using bollard.
//!
//! This module wraps a bollard [`Docker`] client and exposes it through the
//! [`ContainerRuntime`] capability used by the discovery loop and tailers.

use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::models::{EventMessage, EventMessageTypeEnum};
use bollard::query_parameters::{
    EventsOptions, EventsOptionsBuilder, InspectContainerOptions, InspectContainerOptionsBuilder,
    ListContainersOptions, ListContainersOptionsBuilder, LogsOptions, LogsOptionsBuilder,
};
use bollard::{API_DEFAULT_VERSION, Docker};
use futures_util::StreamExt;
use futures_util::stream::BoxStream;

use super::{
    ContainerDescriptor, ContainerRuntime, LifecycleAction, LifecycleEvent, LogChunk,
    RuntimeError, StreamKind,
};
use crate::sincedb::Position;

/// Request timeout handed to bollard, in seconds.
const DOCKER_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Clone, PartialEq, Eq)]
enum DockerHost<'a> {
    LocalDefaults,
    Unix(&'a str),
    Http(String),
}

fn parse_host(host: &str) -> DockerHost<'_> {
    let host = host.trim();
    if host.is_empty() {
        return DockerHost::LocalDefaults;
    }
    if let Some(path) = host.strip_prefix("unix://") {
        return DockerHost::Unix(path);
    }
    if let Some(addr) = host.strip_prefix("tcp://") {
        return DockerHost::Http(format!("http://{addr}"));
    }
    if host.starts_with("http://") {
        return DockerHost::Http(host.to_string());
    }
    // A bare path is treated as a unix socket
    DockerHost::Unix(host)
}

#[derive(Debug, Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect to the docker daemon at `host` and make sure it answers.
    ///
    /// `host` accepts `unix:///path/to/docker.sock`, `tcp://addr:port`,
    /// `http://addr:port` or an empty string for the platform defaults.
    pub async fn connect(host: &str) -> Result<Self, RuntimeError> {
        let connect_err = |source| RuntimeError::Connect {
            host: host.to_string(),
            source,
        };

        let docker = match parse_host(host) {
            DockerHost::LocalDefaults => Docker::connect_with_local_defaults(),
            DockerHost::Unix(path) => {
                Docker::connect_with_unix(path, DOCKER_TIMEOUT_SECS, API_DEFAULT_VERSION)
            }
            DockerHost::Http(addr) => {
                Docker::connect_with_http(&addr, DOCKER_TIMEOUT_SECS, API_DEFAULT_VERSION)
            }
        }
        .map_err(connect_err)?;

        docker.ping().await.map_err(connect_err)?;
        log::info!("Connected to docker daemon at {host}");

        Ok(Self { docker })
    }
}

fn lifecycle_event(message: EventMessage) -> Option<LifecycleEvent> {
    if message.typ != Some(EventMessageTypeEnum::CONTAINER) {
        return None;
    }
    let container_id = message.actor.and_then(|actor| actor.id)?;
    let action = message.action?;
    Some(LifecycleEvent {
        container_id,
        action: LifecycleAction::from(action.as_str()),
    })
}

fn log_chunk(output: LogOutput) -> Option<LogChunk> {
    let (stream, bytes) = match output {
        LogOutput::StdOut { message } => (StreamKind::Stdout, message),
        LogOutput::StdErr { message } => (StreamKind::Stderr, message),
        LogOutput::Console { message } => (StreamKind::Console, message),
        LogOutput::StdIn { .. } => return None,
    };
    Some(LogChunk { stream, bytes })
}

/// Docker takes `since` as 32 bit seconds. Positions past that range are
/// clamped so the log is never replayed from the start.
fn since_secs(id: &str, since: Position) -> i32 {
    i32::try_from(since.as_secs()).unwrap_or_else(|_| {
        log::warn!(
            "Position {since} of container {id} is out of range for docker, following from now"
        );
        i32::MAX
    })
}

fn map_not_found(id: &str, err: bollard::errors::Error) -> RuntimeError {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => RuntimeError::NotFound(id.to_string()),
        err => RuntimeError::Api(err),
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_containers(&self) -> Result<Vec<ContainerDescriptor>, RuntimeError> {
        let options: ListContainersOptions = ListContainersOptionsBuilder::new().all(false).build();

        let summaries = self.docker.list_containers(Some(options)).await?;

        Ok(summaries
            .into_iter()
            .filter_map(|summary| {
                let Some(id) = summary.id else {
                    log::warn!("Skipping listed container without id");
                    return None;
                };
                Some(ContainerDescriptor::new(
                    id,
                    summary.names.unwrap_or_default(),
                ))
            })
            .collect())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerDescriptor, RuntimeError> {
        let options: InspectContainerOptions = InspectContainerOptionsBuilder::new().build();

        let info = self
            .docker
            .inspect_container(id, Some(options))
            .await
            .map_err(|e| map_not_found(id, e))?;

        let name = info
            .name
            .ok_or_else(|| RuntimeError::Unexpected(format!("container {id} has no name")))?;

        Ok(ContainerDescriptor::new(
            info.id.unwrap_or_else(|| id.to_string()),
            vec![name],
        ))
    }

    fn subscribe_events(&self) -> BoxStream<'_, Result<LifecycleEvent, RuntimeError>> {
        let options: EventsOptions = EventsOptionsBuilder::new().build();

        self.docker
            .events(Some(options))
            .filter_map(|message| async move {
                match message {
                    Ok(message) => lifecycle_event(message).map(Ok),
                    Err(e) => Some(Err(RuntimeError::Api(e))),
                }
            })
            .boxed()
    }

    fn open_log_stream<'a>(
        &'a self,
        id: &'a str,
        since: Position,
    ) -> BoxStream<'a, Result<LogChunk, RuntimeError>> {
        let options: LogsOptions = LogsOptionsBuilder::new()
            .follow(true)
            .stdout(true)
            .stderr(true)
            .timestamps(true)
            .since(since_secs(id, since))
            .tail("all")
            .build();

        self.docker
            .logs(id, Some(options))
            .filter_map(move |output| async move {
                match output {
                    Ok(output) => log_chunk(output).map(Ok),
                    Err(e) => Some(Err(map_not_found(id, e))),
                }
            })
            .boxed()
    }
}
