//! `ionctl-tracker` – records of in-flight and finished experiment runs.
//!
//! # Modules
//!
//! - [`context`] – [`ExperimentContext`]: id, phase log, forward-only
//!   status, per-component results and an ordered error list.
//! - [`tracker`] – [`ExperimentTracker`]: thread-safe, addressable store of
//!   contexts with age-based garbage collection of terminal runs.
//! - [`archive`] – [`ExperimentArchive`]: optional SQLite archive that keeps
//!   terminal runs after they are evicted from memory.

pub mod archive;
pub mod context;
pub mod tracker;

pub use archive::{ArchiveError, ExperimentArchive};
pub use context::{ErrorRecord, ExperimentContext, ExperimentStatus};
pub use tracker::ExperimentTracker;
