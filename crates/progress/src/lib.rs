//! Progression tracking.
//!
//! The in-memory store of mount records, training actions, and the sink
//! through which derived levels reach the live world.

#![warn(missing_docs)]

pub mod store;
pub mod training;

pub use store::{FlushReport, ProgressionStore, StoreConfig};
pub use training::{LevelSink, Training};
