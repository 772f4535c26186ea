//! Upload phase: drain the pending change log of one table

use std::collections::HashSet;

use super::context::CycleContext;
use super::types::{Operation, PendingChange, SyncReport, SyncStatus, TableError};
use crate::error::{ErrorKind, RemoteError, Result, SyncError};
use crate::remote::RemoteStore;
use crate::store::LocalStore;

/// Push every pending change of `table` in creation order
///
/// Failing changes stay in the log and hold back later changes of the same
/// record; other records continue. Returns an error only when the table (or
/// the whole cycle) must stop.
pub(crate) async fn upload_table(ctx: &CycleContext<'_>, table: &str, report: &mut SyncReport) -> Result<()> {
    let changes = ctx.store.list_pending(table).await?;
    if changes.is_empty() {
        return Ok(());
    }

    tracing::debug!("Uploading {} pending changes for {}", changes.len(), table);

    let retention = ctx.config.stale_record_retention();
    let mut blocked: HashSet<String> = HashSet::new();

    for change in &changes {
        if ctx.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        if blocked.contains(&change.record_id) {
            report.deferred += 1;
            continue;
        }

        if change.is_parked(ctx.config.max_validation_retries) {
            tracing::debug!(
                "Skipping parked change {} for {}/{}",
                change.id,
                table,
                change.record_id
            );
            blocked.insert(change.record_id.clone());
            report.deferred += 1;
            continue;
        }

        match ctx.call(push(ctx.remote, change)).await {
            Ok(()) => {
                ctx.store
                    .with_recovery(retention, || acknowledge(ctx.store, change))
                    .await?;
                report.uploaded += 1;
            }
            Err(RemoteError::AuthExpired) => return Err(SyncError::AuthExpired),
            Err(RemoteError::Cancelled) => return Err(SyncError::Cancelled),
            Err(err) => {
                tracing::warn!(
                    "Upload of change {} for {}/{} failed: {}",
                    change.id,
                    table,
                    change.record_id,
                    err
                );
                let failure = &err;
                ctx.store
                    .with_recovery(retention, || record_failure(ctx.store, change, failure))
                    .await?;
                blocked.insert(change.record_id.clone());
                report.errors.push(TableError {
                    table: table.to_string(),
                    record_id: Some(change.record_id.clone()),
                    kind: err.kind(),
                    message: err.to_string(),
                });
            }
        }
    }

    Ok(())
}

async fn push(remote: &dyn RemoteStore, change: &PendingChange) -> std::result::Result<(), RemoteError> {
    match change.operation {
        Operation::Insert => remote.insert(&change.table, &change.record_id, &change.payload).await,
        Operation::Update => remote.update(&change.table, &change.record_id, &change.payload).await,
        Operation::Delete => remote.delete(&change.table, &change.record_id).await,
    }
}

/// Drop an accepted change; settle the record once its log is empty
async fn acknowledge(store: &LocalStore, change: &PendingChange) -> Result<()> {
    let mut txn = store.begin_write().await?;
    txn.pending().remove(change.id).await?;

    let settled = !txn
        .pending()
        .has_changes_for_record(&change.table, &change.record_id)
        .await?;

    if settled {
        match change.operation {
            Operation::Delete => {
                let tombstone = txn
                    .records()
                    .get(&change.table, &change.record_id)
                    .await?
                    .is_some_and(|record| record.deleted);
                if tombstone {
                    txn.records().delete(&change.table, &change.record_id).await?;
                }
            }
            Operation::Insert | Operation::Update => {
                txn.records()
                    .set_status(&change.table, &change.record_id, SyncStatus::Synced)
                    .await?;
            }
        }
    }

    txn.commit().await
}

async fn record_failure(store: &LocalStore, change: &PendingChange, err: &RemoteError) -> Result<()> {
    let mut txn = store.begin_write().await?;
    txn.pending()
        .record_failure(change.id, &err.to_string(), err.kind())
        .await?;

    if err.kind() == ErrorKind::RemoteValidation {
        txn.records()
            .set_status(&change.table, &change.record_id, SyncStatus::Error)
            .await?;
    }

    txn.commit().await
}
