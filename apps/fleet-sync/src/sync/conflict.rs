//! Conflict detection and resolution
//!
//! Decides how one remote record reconciles against local state and what
//! each resolution strategy writes back.
//!
//! A remote record at least as new as a pending local edit is a conflict.
//! Timestamps are wall-clock values, so besides clock skew this also flags
//! the device's own writes: when a record's first change uploads and a later
//! change for it fails in the same cycle, the download returns the uploaded
//! version stamped after the still-pending edit, and it is reported as a
//! conflict against that edit.
//!
//! A record in `Error` status takes the remote version like a synced one;
//! the download phase also drops its rejected changes.

use serde_json::Value;

use super::types::{
    Conflict, ConflictKind, Fields, LocalRecord, Operation, ResolutionStrategy, SyncStatus,
};
use crate::remote::RemoteRecord;

/// What the download phase does with one remote record
#[derive(Debug, Clone, PartialEq)]
pub enum Reconcile {
    /// Nothing to apply
    Skip,
    /// Write the remote record locally as synced
    Apply,
    /// Remove the local row after a remote delete
    Remove,
    /// Concurrent edits: record a conflict holding the local snapshot
    Conflict {
        kind: ConflictKind,
        local_snapshot: Option<Fields>,
    },
    /// The record already has an open conflict; update its remote side
    Refresh { local_snapshot: Option<Fields> },
}

/// Reconcile a remote record against the local row, if any
pub fn reconcile(local: Option<&LocalRecord>, remote: &RemoteRecord) -> Reconcile {
    let Some(local) = local else {
        // A delete of a record this device never saw
        return if remote.deleted {
            Reconcile::Skip
        } else {
            Reconcile::Apply
        };
    };

    match local.sync_status {
        SyncStatus::Synced | SyncStatus::Error => {
            if remote.deleted {
                Reconcile::Remove
            } else {
                Reconcile::Apply
            }
        }
        SyncStatus::Pending => {
            if local.deleted && remote.deleted {
                Reconcile::Skip
            } else if local.updated_at > remote.updated_at {
                Reconcile::Skip
            } else {
                let local_snapshot = local.snapshot();
                Reconcile::Conflict {
                    kind: classify(local_snapshot.as_ref(), remote.snapshot().as_ref()),
                    local_snapshot,
                }
            }
        }
        SyncStatus::Conflicted => Reconcile::Refresh {
            local_snapshot: local.snapshot(),
        },
    }
}

/// Classify a conflict from its two snapshots
///
/// A key present on both sides whose values have different JSON types is a
/// schema mismatch. Nulls match anything.
pub fn classify(local: Option<&Fields>, remote: Option<&Fields>) -> ConflictKind {
    let (Some(local), Some(remote)) = (local, remote) else {
        return ConflictKind::Timestamp;
    };

    let mismatch = local.iter().any(|(key, value)| {
        remote
            .get(key)
            .is_some_and(|other| !same_json_type(value, other))
    });

    if mismatch {
        ConflictKind::SchemaMismatch
    } else {
        ConflictKind::Timestamp
    }
}

fn same_json_type(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, _) | (_, Value::Null) => true,
        (Value::Bool(_), Value::Bool(_))
        | (Value::Number(_), Value::Number(_))
        | (Value::String(_), Value::String(_))
        | (Value::Array(_), Value::Array(_))
        | (Value::Object(_), Value::Object(_)) => true,
        _ => false,
    }
}

/// Shallow field union, local wins on shared keys
///
/// A deletion on the local side wins outright; a deletion on the remote side
/// leaves the local fields. Not a CRDT merge: nested maps are replaced whole.
pub fn merge_fields(local: Option<&Fields>, remote: Option<&Fields>) -> Option<Fields> {
    let local = local?;
    let mut merged = remote.cloned().unwrap_or_default();
    for (key, value) in local {
        merged.insert(key.clone(), value.clone());
    }
    Some(merged)
}

/// Writes a resolution performs
#[derive(Debug, Clone, PartialEq)]
pub enum ResolutionPlan {
    /// Re-assert data through the pending change log
    Reassert { operation: Operation, fields: Fields },
    /// Adopt the remote side; `None` removes the record locally
    AdoptRemote(Option<Fields>),
}

/// Plan how `strategy` resolves `conflict`
///
/// `data` is only honored by [`ResolutionStrategy::Merge`], where it replaces
/// the computed merge.
pub fn plan_resolution(
    conflict: &Conflict,
    strategy: ResolutionStrategy,
    data: Option<&Fields>,
) -> ResolutionPlan {
    let target = match strategy {
        ResolutionStrategy::UseRemote => {
            return ResolutionPlan::AdoptRemote(conflict.remote_snapshot.clone());
        }
        ResolutionStrategy::UseLocal => conflict.local_snapshot.clone(),
        ResolutionStrategy::Merge => match data {
            Some(manual) => Some(manual.clone()),
            None => merge_fields(
                conflict.local_snapshot.as_ref(),
                conflict.remote_snapshot.as_ref(),
            ),
        },
    };

    match target {
        None => ResolutionPlan::Reassert {
            operation: Operation::Delete,
            fields: Fields::new(),
        },
        Some(fields) if conflict.remote_snapshot.is_none() => ResolutionPlan::Reassert {
            operation: Operation::Insert,
            fields,
        },
        Some(fields) => ResolutionPlan::Reassert {
            operation: Operation::Update,
            fields,
        },
    }
}
