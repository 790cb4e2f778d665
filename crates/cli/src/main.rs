//! Stablemaster CLI - inspect and maintain mount progression data.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use stablemaster_core::{
    Ability, AbilityModels, MountId, PlayerId, ProgressionRecord, StableConfig, Time,
    DEFAULT_CONFIG_PATH,
};
use stablemaster_execution::{Budget, ScanHost, StaticWorld, TaskScheduler, World};
use stablemaster_progress::{ProgressionStore, StoreConfig};
use stablemaster_storage::{open_backend, LoadStatus};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const PAGE_SIZE: usize = 10;

#[derive(Parser)]
#[command(name = "stablemaster")]
#[command(about = "Mount progression store", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show one mount
    Show {
        /// Mount ID
        id: MountId,
    },
    /// Rank mounts by an ability
    Top {
        /// speed, jump or health
        ability: Ability,
        /// Number of mounts to list
        #[arg(long, default_value = "10")]
        limit: usize,
    },
    /// List a player's mounts
    Owned {
        /// Player ID
        player: PlayerId,
        /// Page number, starting at 1
        #[arg(long, default_value = "1")]
        page: usize,
    },
    /// Release a mount from its owner
    Free {
        /// Mount ID
        id: MountId,
    },
    /// Set an ability to an exact level
    SetLevel {
        /// Mount ID
        id: MountId,
        /// speed, jump or health
        ability: Ability,
        /// Target level
        level: u32,
    },
    /// Let another player ride a mount
    Trust {
        /// Mount ID
        id: MountId,
        /// Player ID
        player: PlayerId,
        /// Revoke instead of grant
        #[arg(long)]
        revoke: bool,
    },
    /// Delete a mount's record
    Remove {
        /// Mount ID
        id: MountId,
    },
    /// Print the level table of an ability
    Levels {
        /// speed, jump or health
        ability: Ability,
    },
    /// Back up the data files now
    Backup,
    /// Scan a world snapshot into the store
    Replay {
        /// World snapshot (JSON)
        world: PathBuf,
        /// Delay between scheduler ticks
        #[arg(long, default_value = "50")]
        tick_ms: u64,
        /// Log every observation of these mounts
        #[arg(long)]
        debug: Vec<MountId>,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = StableConfig::load(&cli.config)?;
    let models = AbilityModels::from_config(&config.abilities)
        .with_context(|| format!("Invalid abilities in {}", cli.config.display()))?;

    let backend = open_backend(&config.storage).await?;
    let mut store = ProgressionStore::new(models, StoreConfig::from(&config.scan), backend);
    if store.load_from_backend().await? == LoadStatus::Recovered {
        warn!("Definitive store was empty; data was recovered from the secondary backend");
    }

    match cli.command {
        Commands::Levels { ability } => {
            print_levels(store.models(), ability);
            return Ok(());
        }
        Commands::Show { id } => {
            let record = store.find(id).ok_or_else(|| anyhow!("Mount {} not found", id))?;
            print_record(&store, record);
        }
        Commands::Top { ability, limit } => {
            let model = store.models().get(ability);
            println!("Top {} by {}", limit, ability);
            for (rank, record) in store.rank(ability, limit).into_iter().enumerate() {
                let effort = record.effort.get(ability);
                println!(
                    "  {:>3}. {} | {} | {:.2} {}",
                    rank + 1,
                    label(record),
                    model.format_level(effort),
                    model.display_value_for_level(model.level_for_effort(effort)),
                    ability.unit(),
                );
            }
        }
        Commands::Owned { player, page } => {
            let owned = store.list_owned(player);
            let pages = owned.len().div_ceil(PAGE_SIZE).max(1);
            let page = page.clamp(1, pages);
            println!("Mounts of {} ({}), page {}/{}", player, owned.len(), page, pages);
            for record in owned.iter().skip((page - 1) * PAGE_SIZE).take(PAGE_SIZE) {
                println!("  {}", label(record));
            }
        }
        Commands::Free { id } => {
            if !store.free(id) {
                return Err(anyhow!("Mount {} not found", id));
            }
            println!("Freed {}", id);
        }
        Commands::SetLevel { id, ability, level } => {
            if level == 0 {
                return Err(anyhow!("Levels start at 1"));
            }
            if !store.set_level(id, ability, level) {
                return Err(anyhow!("Mount {} not found", id));
            }
            let model = store.models().get(ability);
            let effort = store.find(id).map(|r| r.effort.get(ability)).unwrap_or_default();
            println!("{} {} is now {}", id, ability, model.format_level(effort));
        }
        Commands::Trust { id, player, revoke } => {
            if store.find(id).is_none() {
                return Err(anyhow!("Mount {} not found", id));
            }
            let changed = if revoke {
                store.untrust(id, player)
            } else {
                store.trust(id, player)
            };
            match (revoke, changed) {
                (false, true) => println!("{} may now ride {}", player, id),
                (true, true) => println!("{} may no longer ride {}", player, id),
                (_, false) => println!("Nothing to change"),
            }
        }
        Commands::Remove { id } => {
            if store.remove(id).is_none() {
                return Err(anyhow!("Mount {} not found", id));
            }
            println!("Removed {}", id);
        }
        Commands::Backup => {
            let written = store.backup().await;
            if written.is_empty() {
                println!("No backup written (nothing to copy or already backed up this interval)");
            }
            for path in written {
                println!("Backed up to {}", path.display());
            }
            return Ok(());
        }
        Commands::Replay { world, tick_ms, debug } => {
            replay(&mut store, &config, &world, Duration::from_millis(tick_ms), &debug).await?;
        }
    }

    let report = store.flush().await?;
    info!("Saved {} mounts, deleted {}", report.saved, report.deleted);
    Ok(())
}

/// Host for scans driven from a static snapshot.
struct Replay<'a> {
    world: StaticWorld,
    store: &'a mut ProgressionStore,
}

impl ScanHost for Replay<'_> {
    fn world(&self) -> &dyn World {
        &self.world
    }

    fn store_mut(&mut self) -> &mut ProgressionStore {
        &mut *self.store
    }

    fn now(&self) -> Time {
        Utc::now()
    }

    fn release(&mut self, id: MountId) {
        self.world.release(id);
    }
}

async fn replay(
    store: &mut ProgressionStore,
    config: &StableConfig,
    path: &Path,
    tick: Duration,
    debug: &[MountId],
) -> Result<()> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let world = StaticWorld::from_json(&text).with_context(|| format!("Invalid world snapshot {}", path.display()))?;
    info!("Replaying {} mounts from {}", world.mount_count(), path.display());

    for &id in debug {
        store.set_debug(id, true);
    }

    let names: Vec<String> = world.world_names().map(str::to_string).collect();
    let mut host = Replay { world, store };
    let mut scheduler = TaskScheduler::new(Budget::from(&config.scan));
    for name in &names {
        scheduler.start_scan(name);
    }

    let flush_every = Duration::from_secs(config.storage.flush_interval_secs.max(1));
    let mut ticks = tokio::time::interval(tick.max(Duration::from_millis(1)));
    let mut flushes = tokio::time::interval_at(tokio::time::Instant::now() + flush_every, flush_every);
    while !scheduler.is_idle() {
        tokio::select! {
            _ = ticks.tick() => {
                scheduler.tick(&mut host);
            }
            _ = flushes.tick() => {
                host.store.flush_or_log().await;
            }
        }
    }
    info!("Replay finished after {} ticks", scheduler.ticks());

    let backups = host.store.backup().await;
    for path in backups {
        info!("Backed up to {}", path.display());
    }
    Ok(())
}

fn label(record: &ProgressionRecord) -> String {
    match &record.name {
        Some(name) => format!("{} ({})", record.id, name),
        None => record.id.to_string(),
    }
}

fn print_record(store: &ProgressionStore, record: &ProgressionRecord) {
    println!("Mount: {}", label(record));
    match record.owner {
        Some(owner) => println!("  Owner: {}", owner),
        None => println!("  Owner: none"),
    }
    if !record.trusted.is_empty() {
        let trusted: Vec<String> = record.trusted.iter().map(ToString::to_string).collect();
        println!("  Trusted: {}", trusted.join(", "));
    }

    let models = store.models();
    for ability in Ability::ALL {
        let model = models.get(ability);
        let effort = record.effort.get(ability);
        println!(
            "  {:<7} {:<14} {:.2} {} (effort {:.1})",
            ability.to_string(),
            model.format_level(effort),
            model.display_value_for_level(model.level_for_effort(effort)),
            ability.unit(),
            effort,
        );
    }

    println!("  Travelled: {:.1} blocks", record.distance_travelled);
    println!("  Jumped: {:.1} blocks", record.distance_jumped);
    println!("  Consumed: {}", record.consumed);
    if let Some(location) = &record.location {
        println!("  Location: {} {:.1} {:.1} {:.1}", location.world, location.x, location.y, location.z);
    }
    if let Some(seen) = record.last_observed {
        println!("  Last seen: {}", seen);
    }
    if let Some(ridden) = record.last_ridden {
        println!("  Last ridden: {}", ridden);
    }
}

fn print_levels(models: &AbilityModels, ability: Ability) {
    let model = models.get(ability);
    println!("{} levels (base {:.6})", ability, model.effort_base());
    println!("  {:>5} {:>14} {:>10} {:>10}", "level", "effort", "value", ability.unit());
    for level in 1..=model.max_level() {
        println!(
            "  {:>5} {:>14.1} {:>10.4} {:>10.2}",
            level,
            model.effort_for_level(level),
            model.value_for_level(f64::from(level)),
            model.display_value_for_level(f64::from(level)),
        );
    }
}
