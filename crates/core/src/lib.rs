//! Stablemaster core data models.
//!
//! This crate defines the progression curve, the per-mount record, the
//! configuration schema and the small timing primitives shared by the
//! storage and scheduling layers.

#![warn(missing_docs)]

// Core identities
mod id;

// Progression
mod ability;
mod record;

// Configuration
mod config;

// Timing
mod clock;
mod limiter;

// Re-exports
pub use id::*;

pub use ability::{jump_height, Ability, AbilityDefinition, AbilityModel, AbilityModels};
pub use record::{EntitySnapshot, Efforts, Location, ProgressionRecord};
pub use config::{
    AbilitiesConfig, BackendKind, ConfigError, ScanConfig, StableConfig, StorageConfig,
    DEFAULT_CONFIG_PATH,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use limiter::RateLimiter;

/// Timestamp type
pub type Time = chrono::DateTime<chrono::Utc>;
