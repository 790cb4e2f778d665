//! SQLite backend.
//!
//! Relational layout: one row per mount in `mounts`, one row per trusted
//! player in `mount_trusted`. Every save and delete runs in a single
//! transaction. `PRAGMA user_version` marks a database that has been written
//! at least once.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use stablemaster_core::{Efforts, Location, MountId, PlayerId, ProgressionRecord};
use tracing::{info, warn};

use super::backup::BackupPolicy;
use super::{Backend, BackendError, LoadOutcome, Result};

const SCHEMA_VERSION: i64 = 1;

/// SQLite backend implementation.
pub struct SqliteBackend {
    pool: SqlitePool,
    path: Option<PathBuf>,
    backups: Option<BackupPolicy>,
}

impl SqliteBackend {
    /// Open (creating if needed) the database at `<dir>/<file_name>.db`.
    pub async fn open(dir: impl AsRef<Path>, file_name: &str, backups: BackupPolicy) -> Result<Self> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(format!("{}.db", file_name));

        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let backend = Self {
            pool,
            path: Some(path),
            backups: Some(backups),
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    /// Create an in-memory database for testing. Backups are disabled.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        // A single connection that never expires keeps the in-memory database alive.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let backend = Self {
            pool,
            path: None,
            backups: None,
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    /// Path of the database file, if on disk.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Initialize the database schema.
    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS mounts (
                id TEXT PRIMARY KEY,
                owner TEXT,
                name TEXT,
                speed_effort REAL NOT NULL DEFAULT 0,
                jump_effort REAL NOT NULL DEFAULT 0,
                health_effort REAL NOT NULL DEFAULT 0,
                distance_travelled REAL NOT NULL DEFAULT 0,
                distance_jumped REAL NOT NULL DEFAULT 0,
                consumed INTEGER NOT NULL DEFAULT 0,
                world TEXT,
                x REAL,
                y REAL,
                z REAL,
                yaw REAL,
                pitch REAL,
                last_observed TEXT,
                last_ridden TEXT
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS mount_trusted (
                mount_id TEXT NOT NULL,
                player_id TEXT NOT NULL,
                PRIMARY KEY (mount_id, player_id)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_mounts_owner ON mounts(owner)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn user_version(&self) -> Result<i64> {
        let row = sqlx::query("PRAGMA user_version").fetch_one(&self.pool).await?;
        Ok(row.try_get(0)?)
    }

    fn parse_time(value: Option<String>, column: &str, id: MountId) -> Result<Option<DateTime<Utc>>> {
        value
            .map(|s| {
                DateTime::parse_from_rfc3339(&s)
                    .map(|t| t.with_timezone(&Utc))
                    .map_err(|e| BackendError::Corrupt(format!("{} of {}: {}", column, id, e)))
            })
            .transpose()
    }

    fn record_from_row(row: &SqliteRow) -> Result<ProgressionRecord> {
        let id_text: String = row.try_get("id")?;
        let id = MountId::from_str(&id_text)
            .map_err(|e| BackendError::Corrupt(format!("mount id {}: {}", id_text, e)))?;

        let owner = row
            .try_get::<Option<String>, _>("owner")?
            .map(|s| {
                PlayerId::from_str(&s)
                    .map_err(|e| BackendError::Corrupt(format!("owner of {}: {}", id, e)))
            })
            .transpose()?;

        let location = match row.try_get::<Option<String>, _>("world")? {
            Some(world) => Some(Location {
                world,
                x: row.try_get::<Option<f64>, _>("x")?.unwrap_or_default(),
                y: row.try_get::<Option<f64>, _>("y")?.unwrap_or_default(),
                z: row.try_get::<Option<f64>, _>("z")?.unwrap_or_default(),
                yaw: row.try_get::<Option<f64>, _>("yaw")?.unwrap_or_default() as f32,
                pitch: row.try_get::<Option<f64>, _>("pitch")?.unwrap_or_default() as f32,
            }),
            None => None,
        };

        let consumed: i64 = row.try_get("consumed")?;

        let mut record = ProgressionRecord::new(id, owner);
        record.name = row.try_get("name")?;
        record.effort = Efforts {
            speed: row.try_get("speed_effort")?,
            jump: row.try_get("jump_effort")?,
            health: row.try_get("health_effort")?,
        };
        record.distance_travelled = row.try_get("distance_travelled")?;
        record.distance_jumped = row.try_get("distance_jumped")?;
        record.consumed = u64::try_from(consumed).unwrap_or_default();
        record.location = location;
        record.last_observed = Self::parse_time(row.try_get("last_observed")?, "last_observed", id)?;
        record.last_ridden = Self::parse_time(row.try_get("last_ridden")?, "last_ridden", id)?;
        Ok(record)
    }
}

#[async_trait]
impl Backend for SqliteBackend {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn load_all(&mut self) -> Result<LoadOutcome> {
        if self.user_version().await? == 0 {
            return Ok(LoadOutcome::uninitialized());
        }

        let rows = sqlx::query("SELECT * FROM mounts ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        let mut records = rows
            .iter()
            .map(Self::record_from_row)
            .collect::<Result<Vec<_>>>()?;

        let trusted = sqlx::query("SELECT mount_id, player_id FROM mount_trusted")
            .fetch_all(&self.pool)
            .await?;
        let index: HashMap<MountId, usize> = records
            .iter()
            .enumerate()
            .map(|(i, record)| (record.id, i))
            .collect();
        for row in trusted {
            let mount_id: String = row.try_get("mount_id")?;
            let player_id: String = row.try_get("player_id")?;
            let (Ok(mount), Ok(player)) = (MountId::from_str(&mount_id), PlayerId::from_str(&player_id)) else {
                warn!("Skipping malformed trusted entry {} of {}", player_id, mount_id);
                continue;
            };
            match index.get(&mount) {
                Some(&i) => {
                    records[i].trusted.insert(player);
                }
                None => warn!("Trusted entry for unknown mount {}", mount_id),
            }
        }

        Ok(LoadOutcome::loaded(records))
    }

    async fn save_all(&mut self, records: &[ProgressionRecord]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for record in records {
            let id = record.id.to_string();
            let location = record.location.as_ref();

            sqlx::query(
                "INSERT INTO mounts (
                    id, owner, name, speed_effort, jump_effort, health_effort,
                    distance_travelled, distance_jumped, consumed,
                    world, x, y, z, yaw, pitch, last_observed, last_ridden
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    owner = excluded.owner,
                    name = excluded.name,
                    speed_effort = excluded.speed_effort,
                    jump_effort = excluded.jump_effort,
                    health_effort = excluded.health_effort,
                    distance_travelled = excluded.distance_travelled,
                    distance_jumped = excluded.distance_jumped,
                    consumed = excluded.consumed,
                    world = excluded.world,
                    x = excluded.x,
                    y = excluded.y,
                    z = excluded.z,
                    yaw = excluded.yaw,
                    pitch = excluded.pitch,
                    last_observed = excluded.last_observed,
                    last_ridden = excluded.last_ridden",
            )
            .bind(&id)
            .bind(record.owner.map(|o| o.to_string()))
            .bind(record.name.as_deref())
            .bind(record.effort.speed)
            .bind(record.effort.jump)
            .bind(record.effort.health)
            .bind(record.distance_travelled)
            .bind(record.distance_jumped)
            .bind(i64::try_from(record.consumed).unwrap_or(i64::MAX))
            .bind(location.map(|l| l.world.clone()))
            .bind(location.map(|l| l.x))
            .bind(location.map(|l| l.y))
            .bind(location.map(|l| l.z))
            .bind(location.map(|l| f64::from(l.yaw)))
            .bind(location.map(|l| f64::from(l.pitch)))
            .bind(record.last_observed.map(|t| t.to_rfc3339()))
            .bind(record.last_ridden.map(|t| t.to_rfc3339()))
            .execute(&mut *tx)
            .await?;

            sqlx::query("DELETE FROM mount_trusted WHERE mount_id = ?")
                .bind(&id)
                .execute(&mut *tx)
                .await?;

            for player in &record.trusted {
                sqlx::query("INSERT INTO mount_trusted (mount_id, player_id) VALUES (?, ?)")
                    .bind(&id)
                    .bind(player.to_string())
                    .execute(&mut *tx)
                    .await?;
            }
        }

        let mark_written = format!("PRAGMA user_version = {}", SCHEMA_VERSION);
        sqlx::query(&mark_written).execute(&mut *tx).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn delete(&mut self, ids: &[MountId]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for id in ids {
            let id = id.to_string();
            sqlx::query("DELETE FROM mount_trusted WHERE mount_id = ?")
                .bind(&id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM mounts WHERE id = ?")
                .bind(&id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn backup(&mut self) -> Vec<PathBuf> {
        let (Some(path), Some(backups)) = (self.path.as_ref(), self.backups.as_mut()) else {
            return Vec::new();
        };
        let Some(file_name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            return Vec::new();
        };
        let Some(target) = backups.claim(&file_name).await else {
            return Vec::new();
        };

        // VACUUM INTO writes a consistent snapshot even with the pool open.
        match sqlx::query("VACUUM INTO ?")
            .bind(target.to_string_lossy().into_owned())
            .execute(&self.pool)
            .await
        {
            Ok(_) => {
                info!("Backed up {} to {}", path.display(), target.display());
                vec![target]
            }
            Err(e) => {
                warn!("Backup of {} failed: {}", path.display(), e);
                Vec::new()
            }
        }
    }
}
