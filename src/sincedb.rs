//! Per-container read positions ("sincedb").
//!
//! A position is the daemon timestamp of the last consumed log line, in
//! nanoseconds since the Unix epoch, together with how many lines carrying
//! exactly that timestamp were consumed. [`FileSinceDb`] keeps them in memory
//! and periodically writes them to a JSON file so a restarted input resumes
//! where the previous one stopped.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{
    cmp::Ordering,
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    sync::Mutex,
    time::Duration,
};
use tokio_util::sync::CancellationToken;

const SINCEDB_VERSION: u32 = 2;
/// Files of this version store bare nanosecond timestamps.
const LEGACY_SINCEDB_VERSION: u32 = 1;
const NANOS_PER_SEC: i64 = 1_000_000_000;

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Position {
    nanos: i64,
    /// Lines consumed that carry exactly `nanos`.
    #[serde(default)]
    seen: u32,
}

impl Position {
    /// Start of the log.
    pub const ZERO: Position = Position { nanos: 0, seen: 0 };

    /// Position right after the first line stamped `nanos`.
    pub fn after(nanos: i64) -> Self {
        Self {
            nanos: nanos.max(0),
            seen: 1,
        }
    }

    pub fn nanos(self) -> i64 {
        self.nanos
    }

    pub fn seen(self) -> u32 {
        self.seen
    }

    /// Whole seconds, rounded down. This is the granularity docker accepts
    /// for `since`.
    pub fn as_secs(self) -> i64 {
        self.nanos / NANOS_PER_SEC
    }

    /// Position once one more line stamped `nanos` is consumed. Lines older
    /// than the position leave it unchanged.
    pub fn advance(self, nanos: i64) -> Self {
        match nanos.cmp(&self.nanos) {
            Ordering::Greater => Self::after(nanos),
            Ordering::Equal => Self {
                nanos,
                seen: self.seen.saturating_add(1),
            },
            Ordering::Less => self,
        }
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}+{}", self.nanos, self.seen)
    }
}

/// A sincedb entry as found on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
enum StoredPosition {
    Current(Position),
    Legacy(i64),
}

impl From<StoredPosition> for Position {
    fn from(stored: StoredPosition) -> Self {
        match stored {
            StoredPosition::Current(position) => position,
            StoredPosition::Legacy(nanos) if nanos > 0 => Position::after(nanos),
            StoredPosition::Legacy(_) => Position::ZERO,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SinceDbError {
    #[error("IO error on sincedb `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid sincedb `{path}`: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("unsupported sincedb version {0}")]
    Version(u32),
    #[error("sincedb lock poisoned")]
    Poisoned,
}

#[async_trait]
pub trait OffsetStore: Send + Sync {
    /// Resume position of a container. Unknown containers start at
    /// [`Position::ZERO`] and are recorded from then on.
    async fn get(&self, id: &str) -> Result<Position, SinceDbError>;

    async fn set(&self, id: &str, position: Position) -> Result<(), SinceDbError>;

    /// Forget a container that no longer exists.
    async fn remove(&self, id: &str) -> Result<(), SinceDbError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct SinceDbFile {
    version: u32,
    #[serde(default)]
    containers: BTreeMap<String, StoredPosition>,
}

#[derive(Debug, Default)]
struct SinceDbState {
    positions: HashMap<String, Position>,
    dirty: bool,
}

#[derive(Debug)]
pub struct FileSinceDb {
    path: PathBuf,
    state: Mutex<SinceDbState>,
}

impl FileSinceDb {
    /// Load the sincedb at `path`. A missing file is an empty sincedb.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, SinceDbError> {
        let path = path.as_ref().to_path_buf();
        let positions = match tokio::fs::read_to_string(&path).await {
            Ok(content) if content.trim().is_empty() => HashMap::new(),
            Ok(content) => {
                let file: SinceDbFile =
                    serde_json::from_str(&content).map_err(|source| SinceDbError::Json {
                        path: path.clone(),
                        source,
                    })?;
                if file.version != SINCEDB_VERSION && file.version != LEGACY_SINCEDB_VERSION {
                    return Err(SinceDbError::Version(file.version));
                }
                file.containers
                    .into_iter()
                    .map(|(id, stored)| (id, Position::from(stored)))
                    .collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("No sincedb at {}, starting empty", path.display());
                HashMap::new()
            }
            Err(source) => return Err(SinceDbError::Io { path, source }),
        };

        log::debug!(
            "Loaded {} container positions from {}",
            positions.len(),
            path.display()
        );

        Ok(Self {
            path,
            state: Mutex::new(SinceDbState {
                positions,
                dirty: false,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot of the dirty state, `None` when there is nothing to write.
    fn take_snapshot(&self) -> Result<Option<SinceDbFile>, SinceDbError> {
        let mut state = self.state.lock().map_err(|_| SinceDbError::Poisoned)?;
        if !state.dirty {
            return Ok(None);
        }
        state.dirty = false;
        Ok(Some(SinceDbFile {
            version: SINCEDB_VERSION,
            containers: state
                .positions
                .iter()
                .map(|(id, position)| (id.clone(), StoredPosition::Current(*position)))
                .collect(),
        }))
    }

    fn mark_dirty(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.dirty = true;
        }
    }

    /// Write the positions to disk if anything changed since the last flush.
    ///
    /// The file is replaced atomically through a temporary sibling file.
    pub async fn flush(&self) -> Result<(), SinceDbError> {
        let Some(snapshot) = self.take_snapshot()? else {
            return Ok(());
        };

        let content = serde_json::to_vec_pretty(&snapshot).map_err(|source| SinceDbError::Json {
            path: self.path.clone(),
            source,
        })?;

        let tmp_path = self.path.with_extension("tmp");
        let io_err = |source| SinceDbError::Io {
            path: self.path.clone(),
            source,
        };
        let written = async {
            tokio::fs::write(&tmp_path, &content).await?;
            tokio::fs::rename(&tmp_path, &self.path).await
        }
        .await;

        if let Err(e) = written {
            // Keep the data around for the next attempt
            self.mark_dirty();
            return Err(io_err(e));
        }

        log::trace!(
            "Flushed {} container positions to {}",
            snapshot.containers.len(),
            self.path.display()
        );
        Ok(())
    }

    /// Flush every `interval` until `cancel` fires, then flush one last time.
    pub async fn run_flusher(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.flush().await {
                        log::error!("Failed to flush sincedb: {e}");
                    }
                }
            }
        }

        if let Err(e) = self.flush().await {
            log::error!("Failed to flush sincedb on shutdown: {e}");
        }
    }
}

#[async_trait]
impl OffsetStore for FileSinceDb {
    async fn get(&self, id: &str) -> Result<Position, SinceDbError> {
        let mut state = self.state.lock().map_err(|_| SinceDbError::Poisoned)?;
        if let Some(position) = state.positions.get(id) {
            return Ok(*position);
        }
        state.positions.insert(id.to_string(), Position::ZERO);
        state.dirty = true;
        Ok(Position::ZERO)
    }

    async fn set(&self, id: &str, position: Position) -> Result<(), SinceDbError> {
        let mut state = self.state.lock().map_err(|_| SinceDbError::Poisoned)?;
        state.positions.insert(id.to_string(), position);
        state.dirty = true;
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), SinceDbError> {
        let mut state = self.state.lock().map_err(|_| SinceDbError::Poisoned)?;
        if state.positions.remove(id).is_some() {
            state.dirty = true;
        }
        Ok(())
    }
}
