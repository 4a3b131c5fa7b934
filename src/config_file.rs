use std::{
    num::{NonZeroU64, NonZeroUsize},
    path::{Path, PathBuf},
    time::Duration,
};

use crate::input::NameFilter;

/// Container name pattern excluded by default so the shipper does not tail
/// its own output.
pub const SELF_EXCLUDE_PATTERN: &str = "docktail";

fn default_host() -> String {
    "unix:///var/run/docker.sock".to_string()
}

fn default_exclude_patterns() -> Vec<String> {
    vec![SELF_EXCLUDE_PATTERN.to_string()]
}

fn default_since_path() -> PathBuf {
    PathBuf::from("sincedb")
}

fn default_retry_interval() -> NonZeroU64 {
    NonZeroU64::new(10).expect("non zero")
}

fn default_flush_interval() -> NonZeroU64 {
    NonZeroU64::new(5).expect("non zero")
}

fn default_event_buffer() -> NonZeroUsize {
    NonZeroUsize::new(1024).expect("non zero")
}

/// Static settings of the docker input.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct InputSettings {
    /// Docker daemon to connect to (default: unix:///var/run/docker.sock)
    #[serde(default = "default_host")]
    pub host: String,
    /// Only containers with a name matching one of these are tailed. Empty
    /// means every container.
    #[serde(default)]
    pub include_patterns: Vec<String>,
    /// Containers with a name matching one of these are never tailed.
    #[serde(default = "default_exclude_patterns")]
    pub exclude_patterns: Vec<String>,
    #[serde(default = "default_since_path", alias = "sincepath")]
    pub since_path: PathBuf,
    /// Seconds to wait before reconnecting a failed docker stream (default: 10)
    #[serde(default = "default_retry_interval")]
    pub connection_retry_interval: NonZeroU64,
    /// Seconds between sincedb writes (default: 5)
    #[serde(default = "default_flush_interval")]
    pub sincedb_flush_interval: NonZeroU64,
    /// Capacity of the outbound event channel (default: 1024)
    #[serde(default = "default_event_buffer")]
    pub event_buffer: NonZeroUsize,
}

impl Default for InputSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            include_patterns: Vec::new(),
            exclude_patterns: default_exclude_patterns(),
            since_path: default_since_path(),
            connection_retry_interval: default_retry_interval(),
            sincedb_flush_interval: default_flush_interval(),
            event_buffer: default_event_buffer(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid name pattern: {0}")]
    Pattern(#[from] regex::Error),
}

impl InputSettings {
    fn try_init_from_string(config: &str) -> Result<Self, ConfigError> {
        let settings: Self = toml::from_str(config)?;
        // Fail before anything is started
        settings.name_filter()?;
        Ok(settings)
    }

    fn try_init_from_path(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(config) => Self::try_init_from_string(&config),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::warn!(
                    "Config file {} not found, using defaults",
                    path.display()
                );
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn try_init() -> Result<Self, ConfigError> {
        Self::try_init_from_path(&crate::cli::get_cli_args().config)
    }

    pub fn name_filter(&self) -> Result<NameFilter, regex::Error> {
        NameFilter::new(
            self.include_patterns.as_slice(),
            self.exclude_patterns.as_slice(),
        )
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.connection_retry_interval.get())
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.sincedb_flush_interval.get())
    }
}
