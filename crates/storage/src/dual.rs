//! Dual-write backend.
//!
//! Writes go to two backends. On load, the definitive backend is ground
//! truth: records only the secondary holds are reported, never resurrected.
//! The one exception is a definitive backend that has never been written,
//! in which case the secondary's records are adopted and flagged for
//! re-persisting.

use std::collections::BTreeSet;
use std::path::PathBuf;

use async_trait::async_trait;
use stablemaster_core::{MountId, ProgressionRecord};
use tracing::{error, info, warn};

use super::{Backend, BackendError, LoadOutcome, LoadStatus, Result};

/// Which side of the pair lacks a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscrepancyKind {
    /// Present in the secondary, lost from the definitive backend
    MissingFromDefinitive,
    /// Present in the definitive backend, never reached the secondary
    MissingFromSecondary,
}

/// One membership disagreement found while loading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discrepancy {
    /// Affected mount
    pub id: MountId,
    /// Which side lacks it
    pub kind: DiscrepancyKind,
}

/// Backend that writes to two backends and trusts one of them on load.
pub struct DualBackend {
    secondary: Box<dyn Backend>,
    definitive: Box<dyn Backend>,
    conflicts: Vec<Discrepancy>,
}

impl DualBackend {
    /// Pair a secondary backend with the definitive one.
    pub fn new(secondary: Box<dyn Backend>, definitive: Box<dyn Backend>) -> Self {
        Self {
            secondary,
            definitive,
            conflicts: Vec::new(),
        }
    }

    /// Discrepancies found by the last `load_all`.
    pub fn conflicts(&self) -> &[Discrepancy] {
        &self.conflicts
    }

    fn reconcile(&mut self, secondary: &LoadOutcome, definitive: &LoadOutcome) {
        let secondary_ids: BTreeSet<MountId> = secondary.records.iter().map(|r| r.id).collect();
        let definitive_ids: BTreeSet<MountId> = definitive.records.iter().map(|r| r.id).collect();

        for id in secondary_ids.difference(&definitive_ids) {
            warn!(
                "Integrity: mount {} exists in {} but was lost from {}; not restoring",
                id,
                self.secondary.name(),
                self.definitive.name()
            );
            self.conflicts.push(Discrepancy { id: *id, kind: DiscrepancyKind::MissingFromDefinitive });
        }
        for id in definitive_ids.difference(&secondary_ids) {
            warn!(
                "Integrity: mount {} exists in {} but is missing from {}",
                id,
                self.definitive.name(),
                self.secondary.name()
            );
            self.conflicts.push(Discrepancy { id: *id, kind: DiscrepancyKind::MissingFromSecondary });
        }
    }
}

#[async_trait]
impl Backend for DualBackend {
    fn name(&self) -> &str {
        "dual"
    }

    async fn load_all(&mut self) -> Result<LoadOutcome> {
        self.conflicts.clear();

        let definitive = self.definitive.load_all().await?;
        let secondary = match self.secondary.load_all().await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Loading {} failed, using {} alone: {}", self.secondary.name(), self.definitive.name(), e);
                return Ok(definitive);
            }
        };

        if definitive.status == LoadStatus::Uninitialized && !secondary.records.is_empty() {
            warn!(
                "{} has never been written; recovering {} mounts from {}",
                self.definitive.name(),
                secondary.records.len(),
                self.secondary.name()
            );
            return Ok(LoadOutcome {
                records: secondary.records,
                status: LoadStatus::Recovered,
            });
        }

        self.reconcile(&secondary, &definitive);
        if self.conflicts.is_empty() {
            info!("{} and {} agree on {} mounts", self.secondary.name(), self.definitive.name(), definitive.records.len());
        } else {
            warn!("{} discrepancies; keeping {} as ground truth", self.conflicts.len(), self.definitive.name());
        }
        Ok(definitive)
    }

    /// Writes the definitive backend, then the secondary. Each side is
    /// atomic on its own but the pair is not: when the secondary fails the
    /// definitive side has already committed and the error is still
    /// returned. The caller keeps the batch pending and retries it whole;
    /// both sides upsert, so the retry is idempotent. Until then the
    /// secondary lags, which `load_all` reports as discrepancies without
    /// losing data.
    async fn save_all(&mut self, records: &[ProgressionRecord]) -> Result<()> {
        self.definitive.save_all(records).await?;
        self.secondary.save_all(records).await.map_err(|e| {
            error!("{} saved but {} failed: {}", self.definitive.name(), self.secondary.name(), e);
            e
        })
    }

    async fn delete(&mut self, ids: &[MountId]) -> Result<()> {
        let definitive = self.definitive.delete(ids).await;
        let secondary = self.secondary.delete(ids).await;
        match (definitive, secondary) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
            (Err(a), Err(b)) => Err(BackendError::Other(format!(
                "{}: {}; {}: {}",
                self.definitive.name(),
                a,
                self.secondary.name(),
                b
            ))),
        }
    }

    async fn backup(&mut self) -> Vec<PathBuf> {
        let mut archives = self.definitive.backup().await;
        archives.extend(self.secondary.backup().await);
        archives
    }
}
