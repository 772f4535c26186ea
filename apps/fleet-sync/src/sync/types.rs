//! Sync data types
//!
//! Defines the records, change log entries, conflicts and reports exchanged
//! between the local store, the orchestrator and the host application.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;

/// Opaque field map of a domain record. Shape is validated by the domain layer.
pub type Fields = serde_json::Map<String, serde_json::Value>;

/// Sync state of a local record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Local edit not yet acknowledged remotely
    Pending,
    /// Matches the remote store as of the last cycle
    Synced,
    /// Concurrent local and remote edits await resolution
    Conflicted,
    /// The remote store rejected the last local edit
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Synced => "synced",
            SyncStatus::Conflicted => "conflicted",
            SyncStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SyncStatus::Pending),
            "synced" => Some(SyncStatus::Synced),
            "conflicted" => Some(SyncStatus::Conflicted),
            "error" => Some(SyncStatus::Error),
            _ => None,
        }
    }
}

/// One domain entity instance held by the local store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalRecord {
    pub table: String,
    pub id: String,
    pub fields: Fields,
    #[serde(rename = "syncStatus")]
    pub sync_status: SyncStatus,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
    /// Tombstone kept until a local delete is acknowledged
    #[serde(default)]
    pub deleted: bool,
}

impl LocalRecord {
    /// A record freshly pulled from the remote store
    pub fn synced(table: &str, id: &str, fields: Fields, updated_at: DateTime<Utc>) -> Self {
        Self {
            table: table.to_string(),
            id: id.to_string(),
            fields,
            sync_status: SyncStatus::Synced,
            updated_at,
            deleted: false,
        }
    }

    /// Snapshot used on the local side of a conflict. Tombstones have none.
    pub fn snapshot(&self) -> Option<Fields> {
        if self.deleted {
            None
        } else {
            Some(self.fields.clone())
        }
    }
}

/// Kind of local mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "insert" => Some(Operation::Insert),
            "update" => Some(Operation::Update),
            "delete" => Some(Operation::Delete),
            _ => None,
        }
    }
}

/// A local mutation not yet acknowledged by the remote store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingChange {
    /// Sequence id; creation order
    pub id: i64,
    pub table: String,
    #[serde(rename = "recordId")]
    pub record_id: String,
    pub operation: Operation,
    pub payload: Fields,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "retryCount")]
    pub retry_count: u32,
    #[serde(rename = "lastError", skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(rename = "failureKind", skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<ErrorKind>,
}

impl PendingChange {
    /// Validation failures past the retry budget wait for an explicit retry
    pub fn is_parked(&self, max_validation_retries: u32) -> bool {
        self.failure_kind == Some(ErrorKind::RemoteValidation)
            && self.retry_count >= max_validation_retries
    }
}

/// Why a conflict was raised
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Concurrent edits, remote at least as recent as the local edit
    Timestamp,
    /// A shared field holds values of different types on each side
    SchemaMismatch,
}

impl ConflictKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictKind::Timestamp => "timestamp",
            ConflictKind::SchemaMismatch => "schema_mismatch",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "timestamp" => Some(ConflictKind::Timestamp),
            "schema_mismatch" => Some(ConflictKind::SchemaMismatch),
            _ => None,
        }
    }
}

/// How to resolve a conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Re-assert the local snapshot against the remote record
    UseLocal,
    /// Adopt the remote snapshot and drop local edits
    UseRemote,
    /// Shallow field union, local wins on shared keys
    Merge,
}

impl ResolutionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStrategy::UseLocal => "use_local",
            ResolutionStrategy::UseRemote => "use_remote",
            ResolutionStrategy::Merge => "merge",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "use_local" => Some(ResolutionStrategy::UseLocal),
            "use_remote" => Some(ResolutionStrategy::UseRemote),
            "merge" => Some(ResolutionStrategy::Merge),
            _ => None,
        }
    }
}

/// A conflict between a pending local edit and a newer remote edit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub id: String,
    pub table: String,
    #[serde(rename = "recordId")]
    pub record_id: String,
    /// Local data at detection time; `None` if the local side deleted it
    #[serde(rename = "localSnapshot")]
    pub local_snapshot: Option<Fields>,
    /// Remote data; `None` if the remote side deleted it
    #[serde(rename = "remoteSnapshot")]
    pub remote_snapshot: Option<Fields>,
    #[serde(rename = "remoteUpdatedAt")]
    pub remote_updated_at: DateTime<Utc>,
    pub kind: ConflictKind,
    #[serde(rename = "detectedAt")]
    pub detected_at: DateTime<Utc>,
    pub resolved: bool,
    #[serde(rename = "resolvedAt", skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<ResolutionStrategy>,
}

/// Per-table "last synced at" marker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncWatermark {
    pub table: String,
    #[serde(rename = "lastSyncedAt")]
    pub last_synced_at: DateTime<Utc>,
}

/// A failure reported by a sync cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableError {
    pub table: String,
    /// Set for per-record upload failures, absent for table-level aborts
    #[serde(rename = "recordId", skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    pub kind: ErrorKind,
    pub message: String,
}

/// Outcome of one sync cycle
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    /// Pending changes acknowledged by the remote store
    pub uploaded: usize,
    /// Remote records applied to the local store
    pub downloaded: usize,
    /// Conflicts detected or refreshed during download
    pub conflicts: usize,
    /// Changes left for a later cycle behind a failure or parked entry
    pub deferred: usize,
    pub errors: Vec<TableError>,
}

impl SyncReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    /// Tables with a table-level failure (partial-sync indicator)
    pub fn failed_tables(&self) -> Vec<&str> {
        let mut tables: Vec<&str> = self
            .errors
            .iter()
            .filter(|e| e.record_id.is_none())
            .map(|e| e.table.as_str())
            .collect();
        tables.sort_unstable();
        tables.dedup();
        tables
    }

    pub(crate) fn absorb(&mut self, other: SyncReport) {
        self.uploaded += other.uploaded;
        self.downloaded += other.downloaded;
        self.conflicts += other.conflicts;
        self.deferred += other.deferred;
        self.errors.extend(other.errors);
    }
}

/// Result of resolving a conflict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionOutcome {
    #[serde(rename = "conflictId")]
    pub conflict_id: String,
    pub strategy: ResolutionStrategy,
    /// Change enqueued to re-assert local data, if any
    #[serde(rename = "pendingChange", skip_serializing_if = "Option::is_none")]
    pub pending_change: Option<PendingChange>,
    /// True when the conflict had already been resolved and nothing changed
    #[serde(rename = "alreadyResolved")]
    pub already_resolved: bool,
}

/// Counts backing the sync-status indicator
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusSummary {
    #[serde(rename = "pendingChanges")]
    pub pending_changes: usize,
    #[serde(rename = "pendingRecords")]
    pub pending_records: usize,
    pub conflicted: usize,
    pub errored: usize,
    pub watermarks: BTreeMap<String, DateTime<Utc>>,
    #[serde(rename = "inProgress")]
    pub in_progress: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enum_string_forms_roundtrip() {
        for status in [
            SyncStatus::Pending,
            SyncStatus::Synced,
            SyncStatus::Conflicted,
            SyncStatus::Error,
        ] {
            assert_eq!(SyncStatus::parse(status.as_str()), Some(status));
        }
        for op in [Operation::Insert, Operation::Update, Operation::Delete] {
            assert_eq!(Operation::parse(op.as_str()), Some(op));
        }
        assert_eq!(
            ResolutionStrategy::parse("use_remote"),
            Some(ResolutionStrategy::UseRemote)
        );
        assert_eq!(ConflictKind::parse("bogus"), None);
    }

    #[test]
    fn test_tombstone_has_no_snapshot() {
        let mut record = LocalRecord::synced("boats", "b1", Fields::new(), Utc::now());
        assert_eq!(record.snapshot(), Some(Fields::new()));

        record.deleted = true;
        assert_eq!(record.snapshot(), None);
    }

    #[test]
    fn test_parked_change() {
        let mut change = PendingChange {
            id: 1,
            table: "boats".to_string(),
            record_id: "b1".to_string(),
            operation: Operation::Update,
            payload: Fields::new(),
            created_at: Utc::now(),
            retry_count: 3,
            last_error: Some("bad hull number".to_string()),
            failure_kind: Some(ErrorKind::RemoteValidation),
        };
        assert!(change.is_parked(3));

        change.failure_kind = Some(ErrorKind::TransientNetwork);
        assert!(!change.is_parked(3));
    }

    #[test]
    fn test_report_serialization() {
        let report = SyncReport {
            uploaded: 2,
            errors: vec![TableError {
                table: "stock".to_string(),
                record_id: None,
                kind: ErrorKind::TransientNetwork,
                message: "connection reset".to_string(),
            }],
            ..Default::default()
        };

        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"uploaded\":2"));
        assert!(json.contains("transient_network"));
        assert!(!json.contains("recordId"));
        assert_eq!(report.failed_tables(), vec!["stock"]);
    }
}
