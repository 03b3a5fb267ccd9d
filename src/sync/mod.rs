//! Catalog synchronization: per-vendor sync runs, isolated workers, the
//! periodic scheduler, and icon reconciliation.

pub mod icons;
pub mod scheduler;
pub mod synchronizer;
pub mod worker;

pub use scheduler::{Scheduler, SchedulerConfig};
pub use synchronizer::{SyncConfig, SyncSummary, Synchronizer};
pub use worker::{WorkerReport, WorkerStatus};
