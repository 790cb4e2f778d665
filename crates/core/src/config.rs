//! Runtime configuration.
//!
//! Loaded from a TOML file; every section falls back to defaults so an
//! absent or partial file is valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::ability::{Ability, AbilityDefinition};

/// Default config file name, relative to the working directory
pub const DEFAULT_CONFIG_PATH: &str = "stablemaster.toml";

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Fewer than two levels leaves the curve base undefined
    #[error("{ability}: max_level must be at least 2, got {value}")]
    InvalidMaxLevel {
        /// Ability name
        ability: String,
        /// Rejected value
        value: u32,
    },

    /// max_effort below 1.0 or not finite
    #[error("{ability}: max_effort must be >= 1.0, got {value}")]
    InvalidMaxEffort {
        /// Ability name
        ability: String,
        /// Rejected value
        value: f64,
    },

    /// effort_scale not strictly positive
    #[error("{ability}: effort_scale must be > 0, got {value}")]
    InvalidEffortScale {
        /// Ability name
        ability: String,
        /// Rejected value
        value: f64,
    },

    /// min_value/max_value not finite
    #[error("{ability}: value range [{min}, {max}] is not finite")]
    InvalidValueRange {
        /// Ability name
        ability: String,
        /// Value at level 1
        min: f64,
        /// Value at the max level
        max: f64,
    },

    /// Parameters are individually valid but the base rounds to <= 1
    #[error("{ability}: derived effort base {base} is not > 1")]
    DegenerateCurve {
        /// Ability name
        ability: String,
        /// Derived effort base
        base: f64,
    },

    /// Config file could not be read
    #[error("failed to read {path}: {source}")]
    Read {
        /// File that failed
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid TOML for this schema
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Per-ability curve definitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbilitiesConfig {
    /// Speed curve
    #[serde(default = "default_speed")]
    pub speed: AbilityDefinition,

    /// Jump curve
    #[serde(default = "default_jump")]
    pub jump: AbilityDefinition,

    /// Health curve
    #[serde(default = "default_health")]
    pub health: AbilityDefinition,
}

fn default_speed() -> AbilityDefinition {
    AbilityDefinition::default_for(Ability::Speed)
}

fn default_jump() -> AbilityDefinition {
    AbilityDefinition::default_for(Ability::Jump)
}

fn default_health() -> AbilityDefinition {
    AbilityDefinition::default_for(Ability::Health)
}

impl AbilitiesConfig {
    /// Definition for an ability.
    pub fn get(&self, ability: Ability) -> &AbilityDefinition {
        match ability {
            Ability::Speed => &self.speed,
            Ability::Jump => &self.jump,
            Ability::Health => &self.health,
        }
    }
}

impl Default for AbilitiesConfig {
    fn default() -> Self {
        Self {
            speed: default_speed(),
            jump: default_jump(),
            health: default_health(),
        }
    }
}

/// Background scan settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Wall-clock budget for one time-sliced run, in microseconds
    #[serde(default = "default_budget_micros")]
    pub budget_micros: i64,

    /// Minimum delay between two scans of the same world, in milliseconds
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,

    /// Owned mounts not ridden for this many days are freed
    #[serde(default = "default_abandon_after_days")]
    pub abandon_after_days: u32,

    /// Movement between two observations longer than this is a teleport, not riding
    #[serde(default = "default_teleport_threshold")]
    pub teleport_threshold: f64,
}

fn default_budget_micros() -> i64 {
    5_000
}

fn default_cooldown_ms() -> u64 {
    60_000
}

fn default_abandon_after_days() -> u32 {
    30
}

fn default_teleport_threshold() -> f64 {
    64.0
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            budget_micros: default_budget_micros(),
            cooldown_ms: default_cooldown_ms(),
            abandon_after_days: default_abandon_after_days(),
            teleport_threshold: default_teleport_threshold(),
        }
    }
}

/// Which persistence backend to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Single JSON document
    Json,
    /// Embedded SQLite database
    Sqlite,
    /// Both, with the JSON document as ground truth
    Dual,
}

/// Persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Backend to use
    #[serde(default = "default_backend")]
    pub backend: BackendKind,

    /// Directory holding data files and backups
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Base file name, without extension
    #[serde(default = "default_file_name")]
    pub file_name: String,

    /// Minimum delay between two backups, in seconds
    #[serde(default = "default_backup_interval")]
    pub backup_interval_secs: u64,

    /// Delay between periodic flushes, in seconds
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,
}

fn default_backend() -> BackendKind {
    BackendKind::Dual
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".stablemaster")
}

fn default_file_name() -> String {
    "mounts".to_string()
}

fn default_backup_interval() -> u64 {
    3_600
}

fn default_flush_interval() -> u64 {
    60
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            data_dir: default_data_dir(),
            file_name: default_file_name(),
            backup_interval_secs: default_backup_interval(),
            flush_interval_secs: default_flush_interval(),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StableConfig {
    /// Ability curves
    #[serde(default)]
    pub abilities: AbilitiesConfig,

    /// Background scanning
    #[serde(default)]
    pub scan: ScanConfig,

    /// Persistence
    #[serde(default)]
    pub storage: StorageConfig,
}

impl StableConfig {
    /// Load from a TOML file, using defaults when the file does not exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let config = Self::parse(&content)?;
                info!("Loaded config from {}", path.display());
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("No config at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(source) => Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Parse TOML content.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }
}
