//! Remote store client
//!
//! The only place network protocol details live. The engine talks to the
//! backend through [`RemoteStore`]; two implementations ship with the crate:
//!
//! - [`HttpRemoteStore`]: JSON over HTTP against the reference server
//! - [`MemoryRemoteStore`]: in-process store with failure injection
//!
//! Mutations must have upsert-by-id semantics so a retried upload has exactly
//! one effect.

mod http;
mod memory;

pub use http::HttpRemoteStore;
pub use memory::MemoryRemoteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RemoteError;
use crate::sync::Fields;

/// A record as held by the remote authoritative store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub id: String,
    pub fields: Fields,
    /// Assigned by the remote store on every write
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
    /// Tombstone left by a remote delete
    #[serde(default)]
    pub deleted: bool,
}

impl RemoteRecord {
    pub fn snapshot(&self) -> Option<Fields> {
        if self.deleted {
            None
        } else {
            Some(self.fields.clone())
        }
    }
}

/// Backend query/mutate API
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Create a record (upsert by id)
    async fn insert(&self, table: &str, id: &str, payload: &Fields) -> Result<(), RemoteError>;

    /// Replace a record's fields (upsert by id)
    async fn update(&self, table: &str, id: &str, payload: &Fields) -> Result<(), RemoteError>;

    /// Delete a record; deleting a missing record succeeds
    async fn delete(&self, table: &str, id: &str) -> Result<(), RemoteError>;

    /// Current version of one record; `None` if the remote never had it
    async fn fetch(&self, table: &str, id: &str) -> Result<Option<RemoteRecord>, RemoteError>;

    /// Records of `table` changed strictly after `since`, oldest first,
    /// restricted to the caller's authorization `scope`
    async fn query_updated_since(
        &self,
        table: &str,
        since: Option<DateTime<Utc>>,
        scope: Option<&str>,
    ) -> Result<Vec<RemoteRecord>, RemoteError>;
}
