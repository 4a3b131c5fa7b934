//! Container runtime capability.
//!
//! The input only talks to the container runtime through [`ContainerRuntime`].
//! The production implementation lives in [`docker`] and is backed by bollard;
//! tests use the in-memory fake in `crate::testing`.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::sincedb::Position;

pub mod docker;

pub use docker::DockerRuntime;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("unable to connect to docker at `{host}`: {source}")]
    Connect {
        host: String,
        #[source]
        source: bollard::errors::Error,
    },
    #[error("container `{0}` not found")]
    NotFound(String),
    #[error("docker API error: {0}")]
    Api(#[from] bollard::errors::Error),
    #[error("unexpected response from docker: {0}")]
    Unexpected(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerDescriptor {
    pub id: String,
    /// Names as reported by the runtime, docker prefixes them with `/`.
    pub names: Vec<String>,
}

impl ContainerDescriptor {
    pub fn new(id: impl Into<String>, names: Vec<String>) -> Self {
        Self {
            id: id.into(),
            names,
        }
    }

    /// Human readable name used in outbound events.
    pub fn display_name(&self) -> &str {
        self.names
            .first()
            .map(|name| name.trim_start_matches('/'))
            .unwrap_or(self.id.as_str())
    }

    pub fn short_id(&self) -> &str {
        self.id.get(..12).unwrap_or(&self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleAction {
    Start,
    /// The container was removed.
    Destroy,
    Other(String),
}

impl From<&str> for LifecycleAction {
    fn from(action: &str) -> Self {
        match action {
            "start" => Self::Start,
            "destroy" => Self::Destroy,
            other => Self::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleEvent {
    pub container_id: String,
    pub action: LifecycleAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Stdout,
    Stderr,
    Console,
}

#[derive(Debug, Clone)]
pub struct LogChunk {
    pub stream: StreamKind,
    pub bytes: Bytes,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Containers currently running on the host.
    async fn list_containers(&self) -> Result<Vec<ContainerDescriptor>, RuntimeError>;

    async fn inspect_container(&self, id: &str) -> Result<ContainerDescriptor, RuntimeError>;

    /// Live stream of container lifecycle events. The stream ends or yields an
    /// error when the subscription is lost.
    fn subscribe_events(&self) -> BoxStream<'_, Result<LifecycleEvent, RuntimeError>>;

    /// Follows the stdout/stderr of a container starting at `since`. Every
    /// line is prefixed with the RFC 3339 timestamp the runtime recorded.
    fn open_log_stream<'a>(
        &'a self,
        id: &'a str,
        since: Position,
    ) -> BoxStream<'a, Result<LogChunk, RuntimeError>>;
}
