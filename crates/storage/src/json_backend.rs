//! JSON file backend.
//!
//! Stores every record in a single pretty-printed JSON document keyed by the
//! mount UUID. Writes go to a temporary sibling file that is renamed over the
//! document, so a failed save leaves the previous document intact.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stablemaster_core::{MountId, ProgressionRecord};
use tokio::fs;
use tracing::{debug, warn};

use super::backup::BackupPolicy;
use super::{Backend, BackendError, LoadOutcome, Result};

const DOCUMENT_VERSION: u32 = 1;

/// On-disk layout of the document.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Document {
    version: u32,
    #[serde(default)]
    mounts: BTreeMap<String, ProgressionRecord>,
}

/// Single-file JSON backend.
pub struct JsonBackend {
    path: PathBuf,
    backups: BackupPolicy,
}

impl JsonBackend {
    /// Create the backend for `<dir>/<file_name>.json`, creating `dir` if needed.
    pub async fn new(dir: impl AsRef<Path>, file_name: &str, backups: BackupPolicy) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).await?;
        Ok(Self {
            path: dir.join(format!("{}.json", file_name)),
            backups,
        })
    }

    /// Path of the document.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        self.path.with_extension("json.tmp")
    }

    async fn read_document(&self) -> Result<Option<Document>> {
        match fs::read_to_string(&self.path).await {
            Ok(json) => Ok(Some(serde_json::from_str(&json)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_document(&self, document: &Document) -> Result<()> {
        let json = serde_json::to_string_pretty(document)?;
        let temp = self.temp_path();
        fs::write(&temp, json.as_bytes()).await?;
        if let Err(e) = fs::rename(&temp, &self.path).await {
            let _ = fs::remove_file(&temp).await;
            return Err(e.into());
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for JsonBackend {
    fn name(&self) -> &str {
        "json"
    }

    async fn load_all(&mut self) -> Result<LoadOutcome> {
        let Some(document) = self.read_document().await? else {
            debug!("{} does not exist yet", self.path.display());
            return Ok(LoadOutcome::uninitialized());
        };

        if document.version > DOCUMENT_VERSION {
            return Err(BackendError::Corrupt(format!(
                "{} has version {}, newer than supported {}",
                self.path.display(),
                document.version,
                DOCUMENT_VERSION
            )));
        }

        let mut records = Vec::with_capacity(document.mounts.len());
        for (key, record) in document.mounts {
            if key != record.id.to_string() {
                warn!("Record stored under {} carries id {}; using the record id", key, record.id);
            }
            records.push(record);
        }
        Ok(LoadOutcome::loaded(records))
    }

    async fn save_all(&mut self, records: &[ProgressionRecord]) -> Result<()> {
        let mut document = self.read_document().await?.unwrap_or_default();
        document.version = DOCUMENT_VERSION;
        for record in records {
            document.mounts.insert(record.id.to_string(), record.clone());
        }
        self.write_document(&document).await
    }

    async fn delete(&mut self, ids: &[MountId]) -> Result<()> {
        let Some(mut document) = self.read_document().await? else {
            return Ok(());
        };
        for id in ids {
            document.mounts.remove(&id.to_string());
        }
        self.write_document(&document).await
    }

    async fn backup(&mut self) -> Vec<PathBuf> {
        let path = self.path.clone();
        self.backups.copy(&path).await.into_iter().collect()
    }
}
