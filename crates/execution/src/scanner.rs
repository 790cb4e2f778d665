//! Entity scanning.
//!
//! An [`EntityScanner`] walks the loaded regions of one world, one region
//! per step, and folds every mount it finds into the progression store.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use stablemaster_core::{EntitySnapshot, MountId, Time};
use stablemaster_progress::ProgressionStore;
use tracing::{debug, info};

use crate::scheduler::TaskScheduler;
use crate::sliced::Step;

/// Region coordinates within a world.
pub type RegionKey = (i32, i32);

/// Read access to the live world.
pub trait World {
    /// Regions currently loaded in a world, in any order.
    fn loaded_regions(&self, world: &str) -> Vec<RegionKey>;

    /// Mounts currently inside a region.
    fn mounts_in(&self, world: &str, region: RegionKey) -> Vec<EntitySnapshot>;
}

/// What a scanner needs from the process hosting it.
pub trait ScanHost {
    /// The live world.
    fn world(&self) -> &dyn World;

    /// The progression store to update.
    fn store_mut(&mut self) -> &mut ProgressionStore;

    /// Current wall-clock time.
    fn now(&self) -> Time;

    /// Clear the owner of a live mount whose record was just freed.
    fn release(&mut self, id: MountId);
}

/// Progress of one scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanState {
    /// Regions not yet listed
    NotStarted,
    /// Walking the region list captured at setup
    InProgress {
        /// Regions to visit
        regions: Vec<RegionKey>,
        /// Index of the next region
        next: usize,
    },
    /// Every region visited
    Done,
}

/// Counters for one scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    /// Regions visited
    pub regions: usize,
    /// Mounts observed
    pub observed: usize,
    /// Abandoned mounts freed
    pub freed: usize,
}

/// Resumable scan over one world.
#[derive(Debug, Clone)]
pub struct EntityScanner {
    world: String,
    state: ScanState,
    stats: ScanStats,
}

impl EntityScanner {
    /// A scanner that has not listed its regions yet.
    pub fn new(world: impl Into<String>) -> Self {
        Self {
            world: world.into(),
            state: ScanState::NotStarted,
            stats: ScanStats::default(),
        }
    }

    /// Name of the scanned world.
    pub fn world(&self) -> &str {
        &self.world
    }

    /// Current state.
    pub fn state(&self) -> &ScanState {
        &self.state
    }

    /// Counters so far.
    pub fn stats(&self) -> ScanStats {
        self.stats
    }

    /// Task name used for scans of a world.
    pub fn task_name(world: &str) -> String {
        format!("scan:{}", world)
    }

    fn scan_region<C: ScanHost + ?Sized>(&mut self, ctx: &mut C, region: RegionKey) {
        let mounts = ctx.world().mounts_in(&self.world, region);
        let now = ctx.now();
        let store = ctx.store_mut();
        let mut freed = Vec::new();

        for snapshot in &mounts {
            store.observe(snapshot, now);
            self.stats.observed += 1;
            if store.is_abandoned(snapshot.id, now) && store.free(snapshot.id) {
                freed.push(snapshot.id);
            }
        }

        self.stats.freed += freed.len();
        for id in freed {
            ctx.release(id);
        }

        self.stats.regions += 1;
        debug!(world = %self.world, "Scanned region {:?}: {} mounts", region, mounts.len());
    }
}

impl<C: ScanHost + ?Sized> Step<C> for EntityScanner {
    fn advance(&mut self, ctx: &mut C) -> bool {
        match &mut self.state {
            ScanState::NotStarted => {
                let regions = ctx.world().loaded_regions(&self.world);
                debug!(world = %self.world, "Scan started over {} regions", regions.len());
                self.state = ScanState::InProgress { regions, next: 0 };
                true
            }
            ScanState::InProgress { regions, next } => {
                let Some(&region) = regions.get(*next) else {
                    self.state = ScanState::Done;
                    return false;
                };
                *next += 1;
                let more = *next < regions.len();
                self.scan_region(ctx, region);

                if !more {
                    self.state = ScanState::Done;
                    info!(
                        world = %self.world,
                        "Scan complete: {} regions, {} mounts observed, {} freed",
                        self.stats.regions,
                        self.stats.observed,
                        self.stats.freed
                    );
                }
                more
            }
            ScanState::Done => false,
        }
    }
}

impl<C: ScanHost + ?Sized> TaskScheduler<C> {
    /// Start a scan of a world unless one is running or the world was
    /// scanned within the cooldown. Returns whether a scan was queued.
    pub fn start_scan(&mut self, world: &str) -> bool {
        let name = EntityScanner::task_name(world);
        let task = self.task(name.clone()).with_step(EntityScanner::new(world));
        self.submit_limited(&name, task)
    }
}

/// One region of a [`StaticWorld`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Region {
    /// Region x
    pub x: i32,
    /// Region z
    pub z: i32,
    /// Mounts inside
    #[serde(default)]
    pub mounts: Vec<EntitySnapshot>,
}

/// A fixed world snapshot, read from JSON.
///
/// ```json
/// { "worlds": { "world": [ { "x": 0, "z": 0, "mounts": [] } ] } }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StaticWorld {
    /// Regions per world name
    #[serde(default)]
    pub worlds: BTreeMap<String, Vec<Region>>,
}

impl StaticWorld {
    /// Parse a snapshot.
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// Names of every world in the snapshot.
    pub fn world_names(&self) -> impl Iterator<Item = &str> {
        self.worlds.keys().map(String::as_str)
    }

    /// Clear the owner of a mount wherever it appears. Returns whether it was found.
    pub fn release(&mut self, id: MountId) -> bool {
        let mut found = false;
        for mount in self.worlds.values_mut().flatten().flat_map(|r| r.mounts.iter_mut()) {
            if mount.id == id {
                mount.owner = None;
                found = true;
            }
        }
        found
    }

    /// Total number of mounts across all worlds.
    pub fn mount_count(&self) -> usize {
        self.worlds
            .values()
            .flatten()
            .map(|region| region.mounts.len())
            .sum()
    }
}

impl World for StaticWorld {
    fn loaded_regions(&self, world: &str) -> Vec<RegionKey> {
        self.worlds
            .get(world)
            .map(|regions| regions.iter().map(|r| (r.x, r.z)).collect())
            .unwrap_or_default()
    }

    fn mounts_in(&self, world: &str, region: RegionKey) -> Vec<EntitySnapshot> {
        self.worlds
            .get(world)
            .into_iter()
            .flatten()
            .filter(|r| (r.x, r.z) == region)
            .flat_map(|r| r.mounts.iter().cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Budget;
    use crate::sliced::{TaskState, TimeSlicedTask};
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use stablemaster_core::{AbilityModels, Location, ManualClock, MountId, PlayerId, ProgressionRecord};
    use stablemaster_progress::StoreConfig;
    use stablemaster_storage::{Backend, LoadOutcome, Result};
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;

    struct NullBackend;

    #[async_trait]
    impl Backend for NullBackend {
        fn name(&self) -> &str {
            "null"
        }

        async fn load_all(&mut self) -> Result<LoadOutcome> {
            Ok(LoadOutcome::uninitialized())
        }

        async fn save_all(&mut self, _records: &[ProgressionRecord]) -> Result<()> {
            Ok(())
        }

        async fn delete(&mut self, _ids: &[MountId]) -> Result<()> {
            Ok(())
        }

        async fn backup(&mut self) -> Vec<PathBuf> {
            Vec::new()
        }
    }

    struct Host {
        world: StaticWorld,
        store: ProgressionStore,
        now: Time,
        released: Vec<MountId>,
        apply_releases: bool,
    }

    impl ScanHost for Host {
        fn world(&self) -> &dyn World {
            &self.world
        }

        fn store_mut(&mut self) -> &mut ProgressionStore {
            &mut self.store
        }

        fn now(&self) -> Time {
            self.now
        }

        fn release(&mut self, id: MountId) {
            self.released.push(id);
            if self.apply_releases {
                self.world.release(id);
            }
        }
    }

    fn host(world: StaticWorld) -> Host {
        Host {
            world,
            store: ProgressionStore::new(
                AbilityModels::default(),
                StoreConfig::default(),
                Box::new(NullBackend),
            ),
            now: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            released: Vec::new(),
            apply_releases: true,
        }
    }

    fn world_with(regions: &[(i32, i32, usize)]) -> StaticWorld {
        let regions = regions
            .iter()
            .map(|&(x, z, count)| Region {
                x,
                z,
                mounts: (0..count)
                    .map(|i| {
                        let location = Location::new("world", f64::from(x * 16) + i as f64, 64.0, f64::from(z * 16));
                        EntitySnapshot::new(MountId::new(), location)
                    })
                    .collect(),
            })
            .collect();
        StaticWorld {
            worlds: BTreeMap::from([("world".to_string(), regions)]),
        }
    }

    #[test]
    fn test_scanner_walks_one_region_per_step() {
        let mut host = host(world_with(&[(0, 0, 2), (1, 0, 1), (0, 1, 0)]));
        let mut scanner = EntityScanner::new("world");

        // Setup lists the regions without observing anything.
        assert!(scanner.advance(&mut host));
        assert!(matches!(scanner.state(), ScanState::InProgress { next: 0, .. }));
        assert_eq!(host.store.len(), 0);

        assert!(scanner.advance(&mut host));
        assert_eq!(host.store.len(), 2);
        assert!(scanner.advance(&mut host));
        assert!(!scanner.advance(&mut host));

        assert_eq!(scanner.state(), &ScanState::Done);
        assert_eq!(scanner.stats(), ScanStats { regions: 3, observed: 3, freed: 0 });
        assert_eq!(host.store.len(), 3);
        assert_eq!(host.store.dirty_count(), 3);

        assert!(!scanner.advance(&mut host));
    }

    #[test]
    fn test_scanner_with_no_regions() {
        let mut host = host(StaticWorld::default());
        let mut scanner = EntityScanner::new("missing");
        assert!(scanner.advance(&mut host));
        assert!(!scanner.advance(&mut host));
        assert_eq!(scanner.state(), &ScanState::Done);
    }

    /// Two owned mounts, the first not ridden for 45 days.
    fn abandoned_host() -> (Host, PlayerId, MountId, MountId) {
        let owner = PlayerId::new();
        let mut world = world_with(&[(0, 0, 2)]);
        let regions = world.worlds.get_mut("world").unwrap();
        for mount in &mut regions[0].mounts {
            mount.owner = Some(owner);
        }
        let abandoned = regions[0].mounts[0].id;
        let kept = regions[0].mounts[1].id;

        let mut host = host(world);
        let long_ago = host.now - ChronoDuration::days(45);
        let recent = host.now - ChronoDuration::days(1);
        for id in [abandoned, kept] {
            host.store.get_or_create(id, Some(owner));
        }
        host.store.modify(abandoned, |r| r.last_ridden = Some(long_ago));
        host.store.modify(kept, |r| r.last_ridden = Some(recent));
        (host, owner, abandoned, kept)
    }

    fn full_scan(host: &mut Host) -> ScanStats {
        let mut scanner = EntityScanner::new("world");
        while scanner.advance(host) {}
        scanner.stats()
    }

    #[test]
    fn test_scanner_frees_abandoned_mounts() {
        let (mut host, owner, abandoned, kept) = abandoned_host();

        assert_eq!(full_scan(&mut host).freed, 1);
        assert_eq!(host.released, vec![abandoned]);
        assert_eq!(host.store.find(abandoned).unwrap().owner, None);
        assert_eq!(host.store.find(kept).unwrap().owner, Some(owner));
        assert_eq!(host.world.mounts_in("world", (0, 0))[0].owner, None);
    }

    #[test]
    fn test_freed_mount_stays_freed_on_next_scan() {
        for apply_releases in [true, false] {
            let (mut host, _, abandoned, _) = abandoned_host();
            host.apply_releases = apply_releases;
            let long_ago = host.now - ChronoDuration::days(45);

            full_scan(&mut host);
            host.now += ChronoDuration::minutes(1);
            let second = full_scan(&mut host);

            assert_eq!(second.freed, 0);
            let record = host.store.find(abandoned).unwrap();
            assert_eq!(record.owner, None);
            assert_eq!(record.last_ridden, Some(long_ago));
            assert_eq!(host.released, vec![abandoned]);
            // Only a host that released the entity confirms the release.
            assert_eq!(host.store.is_release_pending(abandoned), !apply_releases);
        }
    }

    #[test]
    fn test_scan_task_yields_between_regions() {
        let clock = ManualClock::new();
        let mut host = host(world_with(&[(0, 0, 1), (1, 0, 1), (2, 0, 1)]));
        let mut task: TimeSlicedTask<Host> = TimeSlicedTask::new("scan:world", 0, Arc::new(clock.clone()));
        let mut scanner = EntityScanner::new("world");
        let ticking = clock.clone();
        task.push(move |host: &mut Host| {
            ticking.advance_micros(1);
            scanner.advance(host)
        });

        let mut runs = 0;
        while task.run(&mut host) == TaskState::Suspended {
            runs += 1;
        }
        // Setup plus three regions, one invocation per run.
        assert_eq!(runs, 3);
        assert_eq!(host.store.len(), 3);
    }

    #[test]
    fn test_start_scan_is_rate_limited_per_world() {
        let clock = ManualClock::new();
        let budget = Budget::new().with_start_cooldown(Duration::from_millis(100));
        let mut scheduler: TaskScheduler<Host> = TaskScheduler::with_clock(budget, Arc::new(clock.clone()));
        let mut host = host(world_with(&[(0, 0, 1)]));

        assert!(scheduler.start_scan("world"));
        assert!(!scheduler.start_scan("world"));
        assert!(scheduler.start_scan("world_nether"));

        while scheduler.tick(&mut host) > 0 {}
        assert_eq!(host.store.len(), 1);
        assert!(!scheduler.start_scan("world"));

        clock.advance(Duration::from_millis(100));
        assert!(scheduler.start_scan("world"));
    }

    #[test]
    fn test_static_world_from_json() {
        let id = MountId::new();
        let rider = PlayerId::new();
        let text = format!(
            r#"{{"worlds":{{"world":[{{"x":2,"z":-1,"mounts":[
                {{"id":"{}","rider":"{}","location":{{"world":"world","x":1.5,"y":70,"z":-3}},"saddled":true}}
            ]}}]}}}}"#,
            id, rider
        );
        let world = StaticWorld::from_json(&text).unwrap();

        assert_eq!(world.loaded_regions("world"), vec![(2, -1)]);
        assert_eq!(world.mount_count(), 1);
        let mounts = world.mounts_in("world", (2, -1));
        assert_eq!(mounts[0].id, id);
        assert_eq!(mounts[0].rider, Some(rider));
        assert!(mounts[0].saddled);
        assert!(world.mounts_in("world", (0, 0)).is_empty());
        assert!(world.loaded_regions("world_nether").is_empty());
    }
}
