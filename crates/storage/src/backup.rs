//! Timestamped backup copies of persisted files.
//!
//! Archives are named `<file-name>.<yyyy-MM-dd-HH>`, so at most one archive
//! per file and hour exists regardless of the configured interval.

use chrono::{DateTime, Utc};
use stablemaster_core::{Clock, RateLimiter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info, warn};

/// Default minimum delay between two backups.
pub const DEFAULT_BACKUP_INTERVAL: Duration = Duration::from_secs(3_600);

/// Archive file name for a source file at a given time.
pub fn archive_name(file_name: &str, at: DateTime<Utc>) -> String {
    format!("{}.{}", file_name, at.format("%Y-%m-%d-%H"))
}

/// Decides when and where a backend writes its backups.
#[derive(Debug)]
pub struct BackupPolicy {
    dir: PathBuf,
    limiter: RateLimiter,
}

impl BackupPolicy {
    /// Back up into `dir` at most once per `interval`.
    pub fn new(dir: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            dir: dir.into(),
            limiter: RateLimiter::new(interval),
        }
    }

    /// Same as [`BackupPolicy::new`] on a specific clock.
    pub fn with_clock(dir: impl Into<PathBuf>, interval: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            dir: dir.into(),
            limiter: RateLimiter::with_clock(interval, clock),
        }
    }

    /// Directory receiving archives.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Reserve the archive path for `file_name` if a backup is due.
    ///
    /// Returns `None` inside the cooldown, when this hour's archive already
    /// exists, or when the backup directory cannot be created.
    pub async fn claim(&mut self, file_name: &str) -> Option<PathBuf> {
        if !self.limiter.try_acquire() {
            debug!("Backup of {} skipped: interval not elapsed", file_name);
            return None;
        }

        if let Err(e) = fs::create_dir_all(&self.dir).await {
            warn!("Cannot create backup directory {}: {}", self.dir.display(), e);
            return None;
        }

        let target = self.dir.join(archive_name(file_name, Utc::now()));
        if fs::try_exists(&target).await.unwrap_or(false) {
            debug!("Backup {} already exists", target.display());
            return None;
        }
        Some(target)
    }

    /// Copy `source` to its archive if a backup is due.
    pub async fn copy(&mut self, source: &Path) -> Option<PathBuf> {
        if !fs::try_exists(source).await.unwrap_or(false) {
            debug!("Nothing to back up at {}", source.display());
            return None;
        }

        let file_name = source.file_name()?.to_string_lossy().into_owned();
        let target = self.claim(&file_name).await?;

        match fs::copy(source, &target).await {
            Ok(_) => {
                info!("Backed up {} to {}", source.display(), target.display());
                Some(target)
            }
            Err(e) => {
                warn!("Backup of {} failed: {}", source.display(), e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use stablemaster_core::ManualClock;

    #[test]
    fn test_archive_name_format() {
        let at = Utc.with_ymd_and_hms(2024, 3, 7, 9, 41, 12).unwrap();
        assert_eq!(archive_name("mounts.json", at), "mounts.json.2024-03-07-09");
    }

    #[tokio::test]
    async fn test_copy_is_rate_limited() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("mounts.json");
        std::fs::write(&source, b"{}").unwrap();

        let clock = ManualClock::new();
        let mut policy = BackupPolicy::with_clock(
            dir.path().join("backups"),
            DEFAULT_BACKUP_INTERVAL,
            Arc::new(clock.clone()),
        );

        let first = policy.copy(&source).await.unwrap();
        assert!(first.exists());
        assert_eq!(std::fs::read(&first).unwrap(), b"{}");

        clock.advance(Duration::from_secs(60));
        assert!(policy.copy(&source).await.is_none());
    }

    #[tokio::test]
    async fn test_missing_source_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut policy = BackupPolicy::new(dir.path().join("backups"), Duration::ZERO);
        assert!(policy.copy(&dir.path().join("absent.json")).await.is_none());
    }

    #[tokio::test]
    async fn test_existing_archive_for_this_hour_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("mounts.json");
        std::fs::write(&source, b"first").unwrap();

        let mut policy = BackupPolicy::new(dir.path().join("backups"), Duration::ZERO);
        let archive = policy.copy(&source).await.unwrap();

        std::fs::write(&source, b"second").unwrap();
        // Zero interval: only the hourly name stops the second copy.
        if let Some(other) = policy.copy(&source).await {
            assert_ne!(other, archive);
        }
        assert_eq!(std::fs::read(&archive).unwrap(), b"first");
    }
}
