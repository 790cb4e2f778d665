//! Progression store - the authoritative in-memory map of mount records.
//!
//! All mutation goes through the store so that every change lands in the
//! pending set. `flush` and `load_from_backend` are the only operations that
//! touch the backend.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use chrono::Duration;
use stablemaster_core::{
    AbilitiesConfig, Ability, AbilityModels, ConfigError, EntitySnapshot, MountId, PlayerId,
    ProgressionRecord, ScanConfig, Time,
};
use stablemaster_storage::{Backend, LoadStatus, Result};
use tracing::{debug, error, info, warn};

use crate::training::{LevelSink, Training};

/// Store behaviour settings.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Owned mounts without owner activity for this long are abandoned
    pub abandon_after: Duration,
    /// Longest movement between observations credited as riding
    pub teleport_threshold: f64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::from(&ScanConfig::default())
    }
}

impl From<&ScanConfig> for StoreConfig {
    fn from(scan: &ScanConfig) -> Self {
        Self {
            abandon_after: Duration::days(i64::from(scan.abandon_after_days)),
            teleport_threshold: scan.teleport_threshold,
        }
    }
}

/// Outcome of a successful flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Records written
    pub saved: usize,
    /// Records deleted
    pub deleted: usize,
}

/// In-memory cache of progression records backed by a [`Backend`].
pub struct ProgressionStore {
    models: AbilityModels,
    config: StoreConfig,
    records: HashMap<MountId, ProgressionRecord>,
    pending: HashSet<MountId>,
    removed: HashSet<MountId>,
    debug: HashSet<MountId>,
    /// Freed mounts whose live entity may still report the former owner
    released: HashMap<MountId, PlayerId>,
    backend: Box<dyn Backend>,
}

impl ProgressionStore {
    /// Create an empty store.
    pub fn new(models: AbilityModels, config: StoreConfig, backend: Box<dyn Backend>) -> Self {
        Self {
            models,
            config,
            records: HashMap::new(),
            pending: HashSet::new(),
            removed: HashSet::new(),
            debug: HashSet::new(),
            released: HashMap::new(),
            backend,
        }
    }

    /// The active ability models.
    pub fn models(&self) -> &AbilityModels {
        &self.models
    }

    /// Re-fit the ability models; invalid definitions keep their old model.
    pub fn reload_models(&mut self, config: &AbilitiesConfig) -> Vec<ConfigError> {
        self.models.reload(config)
    }

    /// Number of cached records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Iterate over every cached record, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &ProgressionRecord> {
        self.records.values()
    }

    /// Look up a record.
    pub fn find(&self, id: MountId) -> Option<&ProgressionRecord> {
        self.records.get(&id)
    }

    /// Whether the record has changes not yet flushed.
    pub fn is_dirty(&self, id: MountId) -> bool {
        self.pending.contains(&id)
    }

    /// Number of records with unflushed changes.
    pub fn dirty_count(&self) -> usize {
        self.pending.len()
    }

    /// Enable or disable verbose logging for one record.
    pub fn set_debug(&mut self, id: MountId, enabled: bool) {
        if enabled {
            self.debug.insert(id);
        } else {
            self.debug.remove(&id);
        }
    }

    /// Whether verbose logging is enabled for the record.
    pub fn is_debug(&self, id: MountId) -> bool {
        self.debug.contains(&id)
    }

    /// Return the record, creating a level-1 record if it is unknown.
    pub fn get_or_create(&mut self, id: MountId, owner: Option<PlayerId>) -> &ProgressionRecord {
        self.entry(id, owner)
    }

    fn entry(&mut self, id: MountId, owner: Option<PlayerId>) -> &mut ProgressionRecord {
        if !self.records.contains_key(&id) {
            debug!("Tracking new mount {}", id);
            self.removed.remove(&id);
            self.pending.insert(id);
        }
        self.records
            .entry(id)
            .or_insert_with(|| ProgressionRecord::new(id, owner))
    }

    /// Mutate a record and mark it pending. Returns `None` for unknown ids.
    pub fn modify<R>(&mut self, id: MountId, f: impl FnOnce(&mut ProgressionRecord) -> R) -> Option<R> {
        let record = self.records.get_mut(&id)?;
        let result = f(record);
        self.pending.insert(id);
        Some(result)
    }

    /// Fold a live snapshot into the record, creating it if needed.
    pub fn observe(&mut self, snapshot: &EntitySnapshot, now: Time) {
        let teleport_threshold = self.config.teleport_threshold;
        let verbose = self.debug.contains(&snapshot.id);
        let former = self.released.get(&snapshot.id).copied();
        if former.is_some() && snapshot.owner != former {
            // The live entity dropped the former owner or was tamed again.
            self.released.remove(&snapshot.id);
        }
        let record = self.entry(snapshot.id, snapshot.owner);

        if let Some(owner) = snapshot.owner {
            if former == Some(owner) {
                debug!(mount = %record.id, "Live entity still reports freed owner {}", owner);
            } else if record.owner != Some(owner) {
                if verbose {
                    info!(mount = %record.id, "Owner changed from {:?} to {}", record.owner, owner);
                }
                record.owner = Some(owner);
                record.trusted.clear();
                record.last_ridden = Some(now);
            }
        }

        if snapshot.rider.is_some() {
            let moved = record
                .location
                .as_ref()
                .and_then(|previous| previous.distance_to(&snapshot.location));
            match moved {
                Some(distance) if distance <= teleport_threshold => {
                    record.distance_travelled += distance;
                    record.effort.speed += distance;
                    if verbose {
                        info!(mount = %record.id, "Ridden {:.2} blocks, speed effort now {:.2}", distance, record.effort.speed);
                    }
                }
                Some(distance) => {
                    debug!(mount = %record.id, "Ignoring {:.1} block jump between observations", distance);
                }
                None => {}
            }
            record.last_ridden = Some(now);
        }

        record.location = Some(snapshot.location.clone());
        record.last_observed = Some(now);
        self.pending.insert(snapshot.id);
    }

    /// Whether an owned mount has gone without owner activity for too long.
    pub fn is_abandoned(&self, id: MountId, now: Time) -> bool {
        let Some(record) = self.records.get(&id) else {
            return false;
        };
        if record.owner.is_none() {
            return false;
        }
        match record.last_ridden {
            Some(last) => now - last > self.config.abandon_after,
            None => false,
        }
    }

    /// Release ownership: clears the owner and the trusted players.
    ///
    /// The record itself is kept. Until a snapshot shows the live entity
    /// without the former owner, `observe` does not hand it back.
    pub fn free(&mut self, id: MountId) -> bool {
        let Some(former) = self.modify(id, |record| {
            record.trusted.clear();
            record.owner.take()
        }) else {
            return false;
        };
        if let Some(owner) = former {
            self.released.insert(id, owner);
        }
        info!("Freed mount {}", id);
        true
    }

    /// Whether a freed mount's live entity has not yet been seen released.
    pub fn is_release_pending(&self, id: MountId) -> bool {
        self.released.contains_key(&id)
    }

    /// Apply a training action. Returns the new level of the trained ability.
    pub fn train(&mut self, id: MountId, training: Training) -> Option<u32> {
        let Some(effort) = training.effort() else {
            warn!("Ignoring invalid training {:?} for {}", training, id);
            return None;
        };
        let ability = training.ability();
        let verbose = self.debug.contains(&id);
        let total = self.modify(id, |record| {
            training.apply(record, effort);
            record.effort.get(ability)
        })?;

        let level = self.models.get(ability).quantized_level(total);
        if verbose {
            info!(mount = %id, "{:?}: {} effort now {:.2} (level {})", training, ability, total, level);
        }
        Some(level)
    }

    /// Set the cumulative effort of an ability directly.
    pub fn set_effort(&mut self, id: MountId, ability: Ability, effort: f64) -> bool {
        if !effort.is_finite() || effort < 0.0 {
            warn!("Refusing effort {} for {} of {}", effort, ability, id);
            return false;
        }
        self.modify(id, |record| *record.effort.get_mut(ability) = effort).is_some()
    }

    /// Set the effort to exactly reach `level`. Levels above the cap are allowed.
    pub fn set_level(&mut self, id: MountId, ability: Ability, level: u32) -> bool {
        let effort = self.models.get(ability).effort_for_level(level);
        self.set_effort(id, ability, effort)
    }

    /// Push every ability's level of the record through `sink`.
    pub fn apply_levels(&self, id: MountId, sink: &mut dyn LevelSink) -> bool {
        let Some(record) = self.records.get(&id) else {
            return false;
        };
        for ability in Ability::ALL {
            let level = self.models.get(ability).quantized_level(record.effort.get(ability));
            sink.apply_level(record, ability, level);
        }
        true
    }

    /// Allow another player to ride the mount.
    pub fn trust(&mut self, id: MountId, player: PlayerId) -> bool {
        self.modify(id, |record| record.trusted.insert(player)).unwrap_or(false)
    }

    /// Revoke a trusted player.
    pub fn untrust(&mut self, id: MountId, player: PlayerId) -> bool {
        self.modify(id, |record| record.trusted.remove(&player)).unwrap_or(false)
    }

    /// Whether the player may ride the mount.
    pub fn can_use(&self, id: MountId, player: PlayerId) -> bool {
        self.records.get(&id).is_some_and(|record| record.can_use(player))
    }

    /// Top records by fractional level of an ability, ties by ascending id.
    pub fn rank(&self, ability: Ability, top_n: usize) -> Vec<&ProgressionRecord> {
        let model = self.models.get(ability);
        let mut ranked: Vec<(&ProgressionRecord, f64)> = self
            .records
            .values()
            .map(|record| (record, model.level_for_effort(record.effort.get(ability))))
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.id.cmp(&b.0.id)));
        ranked.into_iter().take(top_n).map(|(record, _)| record).collect()
    }

    /// Records owned by a player, ordered by id.
    pub fn list_owned(&self, owner: PlayerId) -> Vec<&ProgressionRecord> {
        let mut owned: Vec<&ProgressionRecord> = self
            .records
            .values()
            .filter(|record| record.owner == Some(owner))
            .collect();
        owned.sort_by_key(|record| record.id);
        owned
    }

    /// Drop a record for good; the deletion reaches the backend on the next flush.
    pub fn remove(&mut self, id: MountId) -> Option<ProgressionRecord> {
        let record = self.records.remove(&id)?;
        self.pending.remove(&id);
        self.debug.remove(&id);
        self.released.remove(&id);
        self.removed.insert(id);
        info!("Removed mount {}", id);
        Some(record)
    }

    /// Write pending changes and deletions to the backend.
    ///
    /// Records stay pending unless the backend accepted them, so a failed
    /// flush is retried in full by the next one.
    pub async fn flush(&mut self) -> Result<FlushReport> {
        let mut report = FlushReport::default();

        if !self.pending.is_empty() {
            let mut ids: Vec<MountId> = self.pending.iter().copied().collect();
            ids.sort();
            let batch: Vec<ProgressionRecord> = ids
                .iter()
                .filter_map(|id| self.records.get(id).cloned())
                .collect();

            if let Err(e) = self.backend.save_all(&batch).await {
                error!("Saving {} mounts to {} failed: {}", batch.len(), self.backend.name(), e);
                return Err(e);
            }
            for id in &ids {
                self.pending.remove(id);
            }
            report.saved = batch.len();
        }

        if !self.removed.is_empty() {
            let ids: Vec<MountId> = self.removed.iter().copied().collect();
            if let Err(e) = self.backend.delete(&ids).await {
                error!("Deleting {} mounts from {} failed: {}", ids.len(), self.backend.name(), e);
                return Err(e);
            }
            self.removed.clear();
            report.deleted = ids.len();
        }

        if report != FlushReport::default() {
            debug!("Flushed {} saved, {} deleted", report.saved, report.deleted);
        }
        Ok(report)
    }

    /// Flush from a timer: failures are logged and the pending records stay
    /// queued for the next attempt.
    pub async fn flush_or_log(&mut self) -> Option<FlushReport> {
        match self.flush().await {
            Ok(report) => {
                if report.saved > 0 || report.deleted > 0 {
                    debug!("Periodic flush saved {}, deleted {}", report.saved, report.deleted);
                }
                Some(report)
            }
            Err(e) => {
                warn!("Flush failed, {} records kept for the next attempt: {}", self.pending.len(), e);
                None
            }
        }
    }

    /// Best-effort backup through the backend. Rate-limited by the backend.
    pub async fn backup(&mut self) -> Vec<PathBuf> {
        self.backend.backup().await
    }

    /// Replace the cache with the backend's contents. Called once at startup.
    pub async fn load_from_backend(&mut self) -> Result<LoadStatus> {
        let outcome = self.backend.load_all().await?;

        self.records = outcome
            .records
            .into_iter()
            .map(|record| (record.id, record))
            .collect();
        self.removed.clear();
        self.debug.clear();
        self.released.clear();
        self.pending.clear();

        match outcome.status {
            LoadStatus::Loaded => info!("Loaded {} mounts from {}", self.records.len(), self.backend.name()),
            LoadStatus::Uninitialized => info!("{} is empty, starting fresh", self.backend.name()),
            LoadStatus::Recovered => {
                warn!("Recovered {} mounts; scheduling them for re-save", self.records.len());
                self.pending.extend(self.records.keys().copied());
            }
        }
        Ok(outcome.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use stablemaster_core::Location;
    use stablemaster_storage::{BackendError, LoadOutcome};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct TestBackend {
        saved: Arc<Mutex<Vec<ProgressionRecord>>>,
        deleted: Arc<Mutex<Vec<MountId>>>,
        fail: Arc<Mutex<bool>>,
        initial: Arc<Mutex<Option<LoadOutcome>>>,
    }

    #[async_trait]
    impl Backend for TestBackend {
        fn name(&self) -> &str {
            "test"
        }

        async fn load_all(&mut self) -> Result<LoadOutcome> {
            Ok(self.initial.lock().unwrap().take().unwrap_or_else(LoadOutcome::uninitialized))
        }

        async fn save_all(&mut self, records: &[ProgressionRecord]) -> Result<()> {
            if *self.fail.lock().unwrap() {
                return Err(BackendError::Other("injected failure".to_string()));
            }
            self.saved.lock().unwrap().extend_from_slice(records);
            Ok(())
        }

        async fn delete(&mut self, ids: &[MountId]) -> Result<()> {
            if *self.fail.lock().unwrap() {
                return Err(BackendError::Other("injected failure".to_string()));
            }
            self.deleted.lock().unwrap().extend_from_slice(ids);
            Ok(())
        }

        async fn backup(&mut self) -> Vec<PathBuf> {
            Vec::new()
        }
    }

    fn store() -> (ProgressionStore, TestBackend) {
        let backend = TestBackend::default();
        let store = ProgressionStore::new(
            AbilityModels::default(),
            StoreConfig::default(),
            Box::new(backend.clone()),
        );
        (store, backend)
    }

    fn t(hour: u32) -> Time {
        Utc.with_ymd_and_hms(2024, 6, 1, hour, 0, 0).unwrap()
    }

    fn ridden(id: MountId, rider: PlayerId, x: f64) -> EntitySnapshot {
        EntitySnapshot {
            rider: Some(rider),
            ..EntitySnapshot::new(id, Location::new("world", x, 64.0, 0.0))
        }
    }

    #[test]
    fn test_get_or_create_seeds_level_one_and_dirty() {
        let (mut store, _) = store();
        let id = MountId::new();
        store.get_or_create(id, None);

        let record = store.find(id).unwrap();
        for ability in Ability::ALL {
            assert_eq!(record.effort.get(ability), 0.0);
            assert_eq!(store.models().get(ability).quantized_level(record.effort.get(ability)), 1);
        }
        assert!(store.is_dirty(id));
    }

    #[test]
    fn test_get_or_create_returns_existing() {
        let (mut store, _) = store();
        let id = MountId::new();
        let owner = PlayerId::new();
        store.get_or_create(id, Some(owner));
        store.set_effort(id, Ability::Jump, 50.0);

        let record = store.get_or_create(id, None);
        assert_eq!(record.owner, Some(owner));
        assert_eq!(record.effort.jump, 50.0);
    }

    #[test]
    fn test_observe_credits_ridden_distance() {
        let (mut store, _) = store();
        let id = MountId::new();
        let rider = PlayerId::new();

        store.observe(&ridden(id, rider, 0.0), t(1));
        store.observe(&ridden(id, rider, 10.0), t(2));
        store.observe(&EntitySnapshot::new(id, Location::new("world", 30.0, 64.0, 0.0)), t(3));

        let record = store.find(id).unwrap();
        assert_eq!(record.distance_travelled, 10.0);
        assert_eq!(record.effort.speed, 10.0);
        assert_eq!(record.last_ridden, Some(t(2)));
        assert_eq!(record.last_observed, Some(t(3)));
        assert_eq!(record.location.as_ref().unwrap().x, 30.0);
    }

    #[test]
    fn test_observe_ignores_teleports_and_world_changes() {
        let (mut store, _) = store();
        let id = MountId::new();
        let rider = PlayerId::new();

        store.observe(&ridden(id, rider, 0.0), t(1));
        store.observe(&ridden(id, rider, 500.0), t(2));
        let mut nether = ridden(id, rider, 501.0);
        nether.location.world = "world_nether".to_string();
        store.observe(&nether, t(3));

        assert_eq!(store.find(id).unwrap().effort.speed, 0.0);
    }

    #[test]
    fn test_owner_change_clears_trust() {
        let (mut store, _) = store();
        let id = MountId::new();
        let first = PlayerId::new();
        let second = PlayerId::new();
        let friend = PlayerId::new();

        store.get_or_create(id, Some(first));
        store.trust(id, friend);
        assert!(store.can_use(id, friend));

        let mut snapshot = EntitySnapshot::new(id, Location::new("world", 0.0, 64.0, 0.0));
        snapshot.owner = Some(second);
        store.observe(&snapshot, t(1));

        assert!(!store.can_use(id, friend));
        assert!(store.can_use(id, second));
    }

    #[test]
    fn test_abandonment_and_free() {
        let (mut store, _) = store();
        let id = MountId::new();
        let owner = PlayerId::new();
        let friend = PlayerId::new();
        store.observe(&ridden(id, owner, 0.0), t(0));
        store.modify(id, |r| r.owner = Some(owner));
        store.trust(id, friend);

        let later = t(0) + Duration::days(29);
        assert!(!store.is_abandoned(id, later));
        let much_later = t(0) + Duration::days(31);
        assert!(store.is_abandoned(id, much_later));

        assert!(store.free(id));
        let record = store.find(id).unwrap();
        assert_eq!(record.owner, None);
        assert!(record.trusted.is_empty());
        assert!(!store.is_abandoned(id, much_later));
    }

    #[test]
    fn test_freed_mount_is_not_readopted_from_stale_snapshot() {
        let (mut store, _) = store();
        let id = MountId::new();
        let owner = PlayerId::new();
        store.get_or_create(id, Some(owner));
        store.modify(id, |r| r.last_ridden = Some(t(0)));

        let mut snapshot = EntitySnapshot::new(id, Location::new("world", 0.0, 64.0, 0.0));
        snapshot.owner = Some(owner);
        let later = t(0) + Duration::days(40);
        store.observe(&snapshot, later);
        assert!(store.is_abandoned(id, later));
        assert!(store.free(id));
        assert!(store.is_release_pending(id));

        store.observe(&snapshot, later + Duration::minutes(1));
        let record = store.find(id).unwrap();
        assert_eq!(record.owner, None);
        assert_eq!(record.last_ridden, Some(t(0)));
        assert!(store.is_release_pending(id));

        // Released live entity confirms the release.
        snapshot.owner = None;
        store.observe(&snapshot, later + Duration::minutes(2));
        assert!(!store.is_release_pending(id));

        // A later tame by the same player is adopted again.
        snapshot.owner = Some(owner);
        store.observe(&snapshot, later + Duration::minutes(3));
        assert_eq!(store.find(id).unwrap().owner, Some(owner));
    }

    #[test]
    fn test_freed_mount_tamed_by_someone_else_is_adopted() {
        let (mut store, _) = store();
        let id = MountId::new();
        let owner = PlayerId::new();
        let other = PlayerId::new();
        store.get_or_create(id, Some(owner));
        assert!(store.free(id));

        let mut snapshot = EntitySnapshot::new(id, Location::new("world", 0.0, 64.0, 0.0));
        snapshot.owner = Some(other);
        store.observe(&snapshot, t(1));

        assert_eq!(store.find(id).unwrap().owner, Some(other));
        assert!(!store.is_release_pending(id));
    }

    #[test]
    fn test_unknown_ids() {
        let (mut store, _) = store();
        let id = MountId::new();
        assert!(store.find(id).is_none());
        assert!(!store.free(id));
        assert!(!store.is_abandoned(id, t(0)));
        assert_eq!(store.train(id, Training::Fed(1)), None);
        assert!(!store.set_level(id, Ability::Speed, 3));
    }

    #[test]
    fn test_train_returns_new_level() {
        let (mut store, _) = store();
        let id = MountId::new();
        store.get_or_create(id, None);

        let model = store.models().get(Ability::Health).clone();
        let needed = model.effort_for_level(5).ceil() as u64;
        let level = store.train(id, Training::Fed(needed)).unwrap();
        assert_eq!(level, 5);
        assert_eq!(store.find(id).unwrap().consumed, needed);
    }

    #[test]
    fn test_set_level_above_cap() {
        let (mut store, _) = store();
        let id = MountId::new();
        store.get_or_create(id, None);

        assert!(store.set_level(id, Ability::Speed, 35));
        let model = store.models().get(Ability::Speed);
        let effort = store.find(id).unwrap().effort.speed;
        assert!(effort > model.definition().max_effort);
        assert_eq!(model.quantized_level(effort), 30);
        assert!(model.format_level(effort).ends_with("(max+)"));
    }

    #[test]
    fn test_apply_levels_through_sink() {
        let (mut store, _) = store();
        let id = MountId::new();
        store.get_or_create(id, None);
        store.set_level(id, Ability::Jump, 7);

        let mut applied = Vec::new();
        let mut sink = |_: &ProgressionRecord, ability: Ability, level: u32| applied.push((ability, level));
        assert!(store.apply_levels(id, &mut sink));
        assert_eq!(
            applied,
            vec![(Ability::Speed, 1), (Ability::Jump, 7), (Ability::Health, 1)]
        );
    }

    #[test]
    fn test_rank_orders_by_level_then_id() {
        let (mut store, _) = store();
        let mut ids: Vec<MountId> = (0..4).map(|_| MountId::new()).collect();
        for id in &ids {
            store.get_or_create(*id, None);
        }
        store.set_level(ids[3], Ability::Jump, 9);

        let ranked: Vec<MountId> = store.rank(Ability::Jump, 3).iter().map(|r| r.id).collect();
        assert_eq!(ranked.len(), 3);
        assert_eq!(ranked[0], ids[3]);

        ids.truncate(3);
        ids.sort();
        assert_eq!(ranked[1..], ids[..2]);
    }

    #[test]
    fn test_list_owned_is_sorted() {
        let (mut store, _) = store();
        let owner = PlayerId::new();
        let mut ids: Vec<MountId> = (0..5).map(|_| MountId::new()).collect();
        for id in &ids {
            store.get_or_create(*id, Some(owner));
        }
        store.get_or_create(MountId::new(), Some(PlayerId::new()));

        let owned: Vec<MountId> = store.list_owned(owner).iter().map(|r| r.id).collect();
        ids.sort();
        assert_eq!(owned, ids);
    }

    #[tokio::test]
    async fn test_flush_clears_dirty() {
        let (mut store, backend) = store();
        let a = MountId::new();
        let b = MountId::new();
        store.get_or_create(a, None);
        store.get_or_create(b, None);

        let report = store.flush().await.unwrap();
        assert_eq!(report.saved, 2);
        assert_eq!(store.dirty_count(), 0);
        assert_eq!(backend.saved.lock().unwrap().len(), 2);

        let report = store.flush().await.unwrap();
        assert_eq!(report, FlushReport::default());
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_dirty_and_retries() {
        let (mut store, backend) = store();
        let a = MountId::new();
        let b = MountId::new();
        store.get_or_create(a, None);
        store.get_or_create(b, None);

        *backend.fail.lock().unwrap() = true;
        assert!(store.flush().await.is_err());
        assert!(store.is_dirty(a));
        assert!(store.is_dirty(b));
        assert!(backend.saved.lock().unwrap().is_empty());

        *backend.fail.lock().unwrap() = false;
        let report = store.flush().await.unwrap();
        assert_eq!(report.saved, 2);
        assert_eq!(store.dirty_count(), 0);
    }

    #[tokio::test]
    async fn test_flush_or_log_swallows_failure_and_retries() {
        let (mut store, backend) = store();
        let id = MountId::new();
        store.get_or_create(id, None);

        *backend.fail.lock().unwrap() = true;
        assert_eq!(store.flush_or_log().await, None);
        assert!(store.is_dirty(id));

        *backend.fail.lock().unwrap() = false;
        let report = store.flush_or_log().await.unwrap();
        assert_eq!(report.saved, 1);
        assert!(!store.is_dirty(id));
        assert_eq!(store.flush_or_log().await, Some(FlushReport::default()));
    }

    #[tokio::test]
    async fn test_remove_reaches_backend_on_flush() {
        let (mut store, backend) = store();
        let id = MountId::new();
        store.get_or_create(id, None);
        store.flush().await.unwrap();

        assert!(store.remove(id).is_some());
        assert!(store.find(id).is_none());
        assert!(backend.deleted.lock().unwrap().is_empty());

        let report = store.flush().await.unwrap();
        assert_eq!(report.deleted, 1);
        assert_eq!(*backend.deleted.lock().unwrap(), vec![id]);
    }

    #[tokio::test]
    async fn test_load_replaces_cache() {
        let (mut store, backend) = store();
        let stale = MountId::new();
        store.get_or_create(stale, None);

        let persisted = ProgressionRecord::new(MountId::new(), Some(PlayerId::new()));
        *backend.initial.lock().unwrap() = Some(LoadOutcome::loaded(vec![persisted.clone()]));

        assert_eq!(store.load_from_backend().await.unwrap(), LoadStatus::Loaded);
        assert!(store.find(stale).is_none());
        assert_eq!(store.find(persisted.id), Some(&persisted));
        assert_eq!(store.dirty_count(), 0);
    }

    #[tokio::test]
    async fn test_recovered_load_marks_everything_dirty() {
        let (mut store, backend) = store();
        let record = ProgressionRecord::new(MountId::new(), None);
        *backend.initial.lock().unwrap() = Some(LoadOutcome {
            records: vec![record.clone()],
            status: LoadStatus::Recovered,
        });

        store.load_from_backend().await.unwrap();
        assert!(store.is_dirty(record.id));
    }

    #[test]
    fn test_debug_flag_is_transient() {
        let (mut store, _) = store();
        let id = MountId::new();
        store.get_or_create(id, None);
        store.set_debug(id, true);
        assert!(store.is_debug(id));
        store.remove(id);
        assert!(!store.is_debug(id));
    }
}
