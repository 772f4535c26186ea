//! Download phase: pull remote deltas and reconcile them locally

use chrono::{DateTime, Utc};

use super::conflict::{self, Reconcile};
use super::context::CycleContext;
use super::types::{Conflict, ConflictKind, Fields, LocalRecord, SyncReport, SyncStatus};
use crate::error::{Result, SyncError};
use crate::remote::RemoteRecord;
use crate::store::{now, LocalStore, WriteTxn};

#[derive(Debug, Default)]
struct Applied {
    downloaded: usize,
    conflicts: usize,
}

/// Pull everything changed remotely since the table's watermark
///
/// The whole batch is reconciled in one transaction and the watermark only
/// moves when that transaction commits.
pub(crate) async fn download_table(ctx: &CycleContext<'_>, table: &str, report: &mut SyncReport) -> Result<()> {
    let since = ctx.store.watermark(table).await?;
    let records = ctx
        .call(ctx.remote.query_updated_since(table, since, ctx.config.scope.as_deref()))
        .await?;

    if records.is_empty() {
        return Ok(());
    }
    if ctx.is_cancelled() {
        return Err(SyncError::Cancelled);
    }

    tracing::debug!("Reconciling {} remote records for {}", records.len(), table);

    let batch = records.as_slice();
    let applied = ctx
        .store
        .with_recovery(ctx.config.stale_record_retention(), || {
            apply_batch(ctx.store, table, batch)
        })
        .await?;

    report.downloaded += applied.downloaded;
    report.conflicts += applied.conflicts;
    Ok(())
}

async fn apply_batch(store: &LocalStore, table: &str, records: &[RemoteRecord]) -> Result<Applied> {
    let mut txn = store.begin_write().await?;
    let mut applied = Applied::default();
    let mut newest: Option<DateTime<Utc>> = None;

    for remote in records {
        newest = newest.max(Some(remote.updated_at));

        let local = txn.records().get(table, &remote.id).await?;
        let rejected = local
            .as_ref()
            .is_some_and(|record| record.sync_status == SyncStatus::Error);

        match conflict::reconcile(local.as_ref(), remote) {
            Reconcile::Skip => {}
            Reconcile::Apply => {
                let record = LocalRecord::synced(table, &remote.id, remote.fields.clone(), remote.updated_at);
                txn.records().upsert(&record).await?;
                if rejected {
                    drop_rejected(&mut txn, table, &remote.id).await?;
                }
                applied.downloaded += 1;
            }
            Reconcile::Remove => {
                txn.records().delete(table, &remote.id).await?;
                if rejected {
                    drop_rejected(&mut txn, table, &remote.id).await?;
                }
                applied.downloaded += 1;
            }
            Reconcile::Conflict { kind, local_snapshot } => {
                open_conflict(&mut txn, table, remote, kind, local_snapshot).await?;
                applied.conflicts += 1;
            }
            Reconcile::Refresh { local_snapshot } => {
                let open = txn.conflicts().open_for_record(table, &remote.id).await?;
                match open {
                    Some(open) if open.remote_updated_at < remote.updated_at => {
                        let remote_snapshot = remote.snapshot();
                        let kind = conflict::classify(open.local_snapshot.as_ref(), remote_snapshot.as_ref());
                        txn.conflicts()
                            .refresh_remote(&open.id, &remote_snapshot, remote.updated_at, kind)
                            .await?;
                        tracing::info!("Refreshed conflict {} for {}/{}", open.id, table, remote.id);
                        applied.conflicts += 1;
                    }
                    Some(_) => {}
                    None => {
                        let kind = conflict::classify(local_snapshot.as_ref(), remote.snapshot().as_ref());
                        open_conflict(&mut txn, table, remote, kind, local_snapshot).await?;
                        applied.conflicts += 1;
                    }
                }
            }
        }
    }

    if let Some(newest) = newest {
        txn.watermarks().advance(table, newest).await?;
    }

    txn.commit().await?;
    Ok(applied)
}

/// The remote version replaced a record the remote had rejected; its
/// changes must not be replayed over it
async fn drop_rejected(txn: &mut WriteTxn<'_>, table: &str, id: &str) -> Result<()> {
    let dropped = txn.pending().remove_for_record(table, id).await?;
    if dropped > 0 {
        tracing::warn!(
            "Remote version of {}/{} supersedes {} rejected changes",
            table,
            id,
            dropped
        );
    }
    Ok(())
}

/// Record a conflict and fold the record's pending changes into it
async fn open_conflict(
    txn: &mut WriteTxn<'_>,
    table: &str,
    remote: &RemoteRecord,
    kind: ConflictKind,
    local_snapshot: Option<Fields>,
) -> Result<()> {
    let conflict = Conflict {
        id: uuid::Uuid::new_v4().to_string(),
        table: table.to_string(),
        record_id: remote.id.clone(),
        local_snapshot,
        remote_snapshot: remote.snapshot(),
        remote_updated_at: remote.updated_at,
        kind,
        detected_at: now(),
        resolved: false,
        resolved_at: None,
        resolution: None,
    };

    txn.conflicts().insert(&conflict).await?;
    let folded = txn.pending().remove_for_record(table, &remote.id).await?;
    txn.records()
        .set_status(table, &remote.id, SyncStatus::Conflicted)
        .await?;

    tracing::warn!(
        "Conflict {} detected for {}/{} ({}), {} pending changes folded",
        conflict.id,
        table,
        remote.id,
        kind.as_str(),
        folded
    );

    Ok(())
}
