//! Persistence backends for Stablemaster.
//!
//! This crate provides a trait-based backend interface with a single-file
//! JSON implementation, an SQLite implementation, and a dual-write backend
//! that keeps both in step.

#![warn(missing_docs)]

pub mod trait_;
pub mod backup;
pub mod json_backend;
#[cfg(feature = "sqlite")]
pub mod sqlite_backend;
#[cfg(feature = "sqlite")]
pub mod dual;

pub use trait_::{Backend, BackendError, LoadOutcome, LoadStatus, Result};
pub use backup::{archive_name, BackupPolicy, DEFAULT_BACKUP_INTERVAL};
pub use json_backend::JsonBackend;
#[cfg(feature = "sqlite")]
pub use sqlite_backend::SqliteBackend;
#[cfg(feature = "sqlite")]
pub use dual::{Discrepancy, DiscrepancyKind, DualBackend};

use stablemaster_core::{BackendKind, StorageConfig};
use std::time::Duration;

/// Open the backend selected by the storage config.
pub async fn open_backend(config: &StorageConfig) -> Result<Box<dyn Backend>> {
    let backups = || {
        BackupPolicy::new(
            config.data_dir.join("backups"),
            Duration::from_secs(config.backup_interval_secs),
        )
    };

    match config.backend {
        BackendKind::Json => Ok(Box::new(
            JsonBackend::new(&config.data_dir, &config.file_name, backups()).await?,
        )),
        #[cfg(feature = "sqlite")]
        BackendKind::Sqlite => Ok(Box::new(
            SqliteBackend::open(&config.data_dir, &config.file_name, backups()).await?,
        )),
        #[cfg(feature = "sqlite")]
        BackendKind::Dual => {
            let secondary = SqliteBackend::open(&config.data_dir, &config.file_name, backups()).await?;
            let definitive = JsonBackend::new(&config.data_dir, &config.file_name, backups()).await?;
            Ok(Box::new(DualBackend::new(Box::new(secondary), Box::new(definitive))))
        }
        #[cfg(not(feature = "sqlite"))]
        other => Err(BackendError::Other(format!(
            "backend {:?} requires the `sqlite` feature",
            other
        ))),
    }
}
