use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::runtime::StreamKind;

/// Input type reported in [`LogEvent::source`].
pub const DOCKER_SOURCE: &str = "docker";

/// One line of container output, as published to the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    pub event_id: Uuid,
    /// Timestamp in microseconds (UTC)
    pub timestamp: i64,
    pub source: String,
    pub message: String,
    pub host: String,
    pub container_id: String,
    pub container_name: String,
    pub stream: StreamKind,
}
