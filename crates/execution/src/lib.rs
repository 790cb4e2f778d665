//! Execution layer - time-sliced tasks, scheduling, and entity scans.

#![warn(missing_docs)]

pub mod sliced;
pub mod scheduler;
pub mod scanner;

pub use sliced::{Step, TaskState, TimeSlicedTask};
pub use scheduler::{Budget, TaskScheduler};
pub use scanner::{EntityScanner, Region, RegionKey, ScanHost, ScanState, ScanStats, StaticWorld, World};
