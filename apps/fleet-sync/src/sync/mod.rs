//! Offline-first sync engine
//!
//! Provides:
//! - A durable pending change log replayed in creation order
//! - Per-table delta download against a monotonic watermark
//! - Conflict detection and resolution
//!
//! # Sync Cycle
//!
//! 1. Upload: each pending change of a table is pushed to the remote store;
//!    accepted changes are removed, failing ones are kept with their error
//! 2. Download: records changed remotely since the watermark are reconciled
//!    against local state in one transaction, then the watermark advances
//! 3. Tables run concurrently; one table's failure does not stop the others
//!
//! # Conflict Resolution
//!
//! - `use_local` re-asserts the local snapshot through the pending log
//! - `use_remote` adopts the remote snapshot
//! - `merge` takes a shallow union, local wins on shared keys

mod conflict;
mod context;
mod download;
mod engine;
mod scheduler;
mod types;
mod upload;

pub use conflict::{classify, merge_fields, plan_resolution, reconcile, Reconcile, ResolutionPlan};
pub use engine::SyncEngine;
pub use scheduler::SyncScheduler;
pub use types::{
    Conflict, ConflictKind, Fields, LocalRecord, Operation, PendingChange, ResolutionOutcome,
    ResolutionStrategy, StatusSummary, SyncReport, SyncStatus, SyncWatermark, TableError,
};
