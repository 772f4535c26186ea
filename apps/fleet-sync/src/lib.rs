//! Fleet Sync Library
//!
//! Offline-first synchronization between a device-local SQLite store and a
//! remote authoritative store.
//!
//! # Modules
//!
//! - `store`: local store, pending change log, conflicts and watermarks
//! - `remote`: remote store client (HTTP and in-memory)
//! - `sync`: sync engine, conflict resolution and scheduler
//! - `server`: reference remote store server

pub mod config;
pub mod error;
pub mod remote;
pub mod server;
pub mod store;
pub mod sync;

pub use config::Config;
pub use error::{AppError, ErrorKind, RemoteError, Result, SyncError};
pub use remote::{HttpRemoteStore, MemoryRemoteStore, RemoteRecord, RemoteStore};
pub use store::LocalStore;
pub use sync::{SyncEngine, SyncScheduler};
