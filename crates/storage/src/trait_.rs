//! Backend trait abstraction.

use async_trait::async_trait;
use stablemaster_core::{MountId, ProgressionRecord};
use std::path::PathBuf;

/// Error type for backend operations.
pub type Result<T> = std::result::Result<T, BackendError>;

/// Errors that can occur during backend operations.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Database error
    #[cfg(feature = "sqlite")]
    #[error("SQLite error: {0}")]
    Sqlite(#[from] sqlx::Error),

    /// Persisted data could not be interpreted
    #[error("Corrupt data: {0}")]
    Corrupt(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// How a `load_all` call found its medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStatus {
    /// Records were read from an initialized medium
    Loaded,
    /// The medium has never been written; the collection is empty
    Uninitialized,
    /// The collection was recovered from a secondary copy and must be re-persisted
    Recovered,
}

/// Result of a `load_all` call.
#[derive(Debug, Clone)]
pub struct LoadOutcome {
    /// Every persisted record
    pub records: Vec<ProgressionRecord>,
    /// How the medium was found
    pub status: LoadStatus,
}

impl LoadOutcome {
    /// Records read from an initialized medium.
    pub fn loaded(records: Vec<ProgressionRecord>) -> Self {
        Self { records, status: LoadStatus::Loaded }
    }

    /// Empty outcome for a medium that was never written.
    pub fn uninitialized() -> Self {
        Self { records: Vec::new(), status: LoadStatus::Uninitialized }
    }
}

/// Durable storage for progression records.
///
/// Backends hold no records between calls; the store owns the canonical
/// collection and hands it over on every save.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Read every persisted record.
    ///
    /// A medium that was never written is not an error: it yields an empty
    /// collection with [`LoadStatus::Uninitialized`].
    async fn load_all(&mut self) -> Result<LoadOutcome>;

    /// Insert or update the given records.
    ///
    /// All-or-nothing: on error no record of the call is committed.
    async fn save_all(&mut self, records: &[ProgressionRecord]) -> Result<()>;

    /// Permanently remove records.
    async fn delete(&mut self, ids: &[MountId]) -> Result<()>;

    /// Copy the persisted data to a timestamped archive.
    ///
    /// Best-effort and rate-limited; failures are logged, never returned.
    /// Returns the archives written by this call.
    async fn backup(&mut self) -> Vec<PathBuf>;
}
