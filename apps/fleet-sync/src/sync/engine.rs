//! Sync orchestrator
//!
//! [`SyncEngine`] is the host application's entry point: it records local
//! mutations, runs sync cycles (upload then download, per table, tables in
//! parallel), exposes conflicts and applies resolutions.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{watch, Mutex, MutexGuard, Notify};

use super::conflict::{plan_resolution, ResolutionPlan};
use super::context::CycleContext;
use super::download::download_table;
use super::types::{
    Conflict, Fields, LocalRecord, Operation, PendingChange, ResolutionOutcome, ResolutionStrategy,
    StatusSummary, SyncReport, SyncStatus, TableError,
};
use super::upload::upload_table;
use crate::config::{Config, SyncConfig};
use crate::error::{RemoteError, Result, SyncError};
use crate::remote::{HttpRemoteStore, RemoteRecord, RemoteStore};
use crate::store::{now, ConflictRepository, LocalStore, PendingRepository, RecordRepository};

/// Offline-first sync engine over one local store and one remote store
pub struct SyncEngine {
    store: LocalStore,
    remote: Arc<dyn RemoteStore>,
    config: SyncConfig,
    cycle: Mutex<()>,
    cancel: watch::Sender<bool>,
    sync_requested: Notify,
}

impl SyncEngine {
    pub fn new(store: LocalStore, remote: Arc<dyn RemoteStore>, config: SyncConfig) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            store,
            remote,
            config,
            cycle: Mutex::new(()),
            cancel,
            sync_requested: Notify::new(),
        }
    }

    /// Open the configured local store and reach the remote store over HTTP
    pub async fn connect(config: &Config) -> Result<Self> {
        let store = LocalStore::open(&config.local.url).await?;
        let remote = HttpRemoteStore::from_config(&config.remote, config.sync.scope.as_deref())?;

        tracing::info!(
            "Sync engine ready: local store {}, remote {}",
            config.local.url,
            config.remote.base_url
        );

        Ok(Self::new(store, Arc::new(remote), config.sync.clone()))
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Apply a local mutation and append it to the pending change log
    ///
    /// Updates are merged over the current fields and the full result is
    /// logged, so replaying it remotely is a plain replace.
    pub async fn record_mutation(
        &self,
        table: &str,
        id: &str,
        operation: Operation,
        payload: Fields,
    ) -> Result<PendingChange> {
        if table.is_empty() || id.is_empty() {
            return Err(SyncError::InvalidInput(
                "table and record id must not be empty".to_string(),
            ));
        }

        let payload = &payload;
        let change = self
            .store
            .with_recovery(self.config.stale_record_retention(), || {
                self.append_mutation(table, id, operation, payload)
            })
            .await?;

        tracing::debug!(
            "Recorded {} of {}/{} as change {}",
            operation.as_str(),
            table,
            id,
            change.id
        );
        Ok(change)
    }

    async fn append_mutation(
        &self,
        table: &str,
        id: &str,
        operation: Operation,
        payload: &Fields,
    ) -> Result<PendingChange> {
        let mut txn = self.store.begin_write().await?;

        let existing = txn.records().get(table, id).await?;
        if existing
            .as_ref()
            .is_some_and(|record| record.sync_status == SyncStatus::Conflicted)
        {
            return Err(SyncError::RecordConflicted {
                table: table.to_string(),
                id: id.to_string(),
            });
        }

        let live_fields = existing.filter(|record| !record.deleted).map(|record| record.fields);
        let (fields, logged, deleted) = match operation {
            Operation::Insert => (payload.clone(), payload.clone(), false),
            Operation::Update => {
                let mut merged = live_fields.unwrap_or_default();
                for (key, value) in payload {
                    merged.insert(key.clone(), value.clone());
                }
                (merged.clone(), merged, false)
            }
            Operation::Delete => (live_fields.unwrap_or_default(), Fields::new(), true),
        };

        let at = now();
        txn.records()
            .upsert(&LocalRecord {
                table: table.to_string(),
                id: id.to_string(),
                fields,
                sync_status: SyncStatus::Pending,
                updated_at: at,
                deleted,
            })
            .await?;
        let change = txn.pending().append(table, id, operation, &logged, at).await?;

        txn.commit().await?;
        Ok(change)
    }

    /// Run one sync cycle over `tables` (all configured tables when `None`)
    ///
    /// Rejected with [`SyncError::SyncInProgress`] while another cycle runs.
    /// Per-record and per-table failures are reported; only cycle-fatal
    /// errors (expired auth, full storage) are returned as `Err`.
    pub async fn run_sync_cycle(&self, tables: Option<&[String]>) -> Result<SyncReport> {
        let guard = self.cycle.try_lock().map_err(|_| SyncError::SyncInProgress)?;
        self.run_locked(guard, tables).await
    }

    /// Wait for any running cycle, then run one
    pub(crate) async fn run_queued_cycle(&self) -> Result<SyncReport> {
        let guard = self.cycle.lock().await;
        self.run_locked(guard, None).await
    }

    async fn run_locked(&self, _guard: MutexGuard<'_, ()>, tables: Option<&[String]>) -> Result<SyncReport> {
        let tables: Vec<String> = match tables {
            Some(tables) => tables.to_vec(),
            None => self.config.tables.clone(),
        };

        tracing::info!("Starting sync cycle for {} tables", tables.len());

        let ctx = CycleContext::new(
            &self.store,
            self.remote.as_ref(),
            &self.config,
            self.cancel.subscribe(),
        );

        let outcomes = join_all(tables.iter().map(|table| sync_table(&ctx, table))).await;

        let mut report = SyncReport::default();
        let mut fatal = None;
        for (table, (table_report, outcome)) in tables.iter().zip(outcomes) {
            report.absorb(table_report);
            match outcome {
                Ok(()) => {}
                Err(err) if err.is_cycle_fatal() => {
                    fatal.get_or_insert(err);
                }
                Err(err) => report.errors.push(TableError {
                    table: table.clone(),
                    record_id: None,
                    kind: err.kind(),
                    message: err.to_string(),
                }),
            }
        }

        if let Some(err) = fatal {
            tracing::error!("Sync cycle aborted: {}", err);
            return Err(err);
        }

        tracing::info!(
            "Sync cycle finished: {} uploaded, {} downloaded, {} conflicts, {} deferred, {} errors",
            report.uploaded,
            report.downloaded,
            report.conflicts,
            report.deferred,
            report.errors.len()
        );

        Ok(report)
    }

    /// Unresolved conflicts, oldest first
    pub async fn get_conflicts(&self) -> Result<Vec<Conflict>> {
        let mut conn = self.store.reader().await?;
        ConflictRepository::new(&mut *conn).list_open().await
    }

    pub async fn get_conflict(&self, id: &str) -> Result<Conflict> {
        let mut conn = self.store.reader().await?;
        ConflictRepository::new(&mut *conn)
            .get(id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("conflict {}", id)))
    }

    /// Resolve a conflict with `strategy`
    ///
    /// `data` is a manual merge result and is only used with
    /// [`ResolutionStrategy::Merge`]. Resolving twice is a no-op.
    pub async fn resolve_conflict(
        &self,
        id: &str,
        strategy: ResolutionStrategy,
        data: Option<Fields>,
    ) -> Result<ResolutionOutcome> {
        let data = data.as_ref();
        self.store
            .with_recovery(self.config.stale_record_retention(), || {
                self.apply_resolution(id, strategy, data)
            })
            .await
    }

    async fn apply_resolution(
        &self,
        id: &str,
        strategy: ResolutionStrategy,
        data: Option<&Fields>,
    ) -> Result<ResolutionOutcome> {
        let mut txn = self.store.begin_write().await?;

        let conflict = txn
            .conflicts()
            .get(id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("conflict {}", id)))?;

        if conflict.resolved {
            return Ok(ResolutionOutcome {
                conflict_id: conflict.id,
                strategy: conflict.resolution.unwrap_or(strategy),
                pending_change: None,
                already_resolved: true,
            });
        }

        let table = conflict.table.as_str();
        let record_id = conflict.record_id.as_str();
        let at = now();

        txn.pending().remove_for_record(table, record_id).await?;

        let pending_change = match plan_resolution(&conflict, strategy, data) {
            ResolutionPlan::AdoptRemote(Some(fields)) => {
                let record = LocalRecord::synced(table, record_id, fields, conflict.remote_updated_at);
                txn.records().upsert(&record).await?;
                None
            }
            ResolutionPlan::AdoptRemote(None) => {
                txn.records().delete(table, record_id).await?;
                None
            }
            ResolutionPlan::Reassert { operation, fields } => {
                let deleted = operation == Operation::Delete;
                txn.records()
                    .upsert(&LocalRecord {
                        table: table.to_string(),
                        id: record_id.to_string(),
                        fields: fields.clone(),
                        sync_status: SyncStatus::Pending,
                        updated_at: at,
                        deleted,
                    })
                    .await?;
                Some(txn.pending().append(table, record_id, operation, &fields, at).await?)
            }
        };

        txn.conflicts().mark_resolved(id, strategy, at).await?;
        txn.commit().await?;

        tracing::info!(
            "Resolved conflict {} for {}/{} with {}",
            id,
            table,
            record_id,
            strategy.as_str()
        );

        Ok(ResolutionOutcome {
            conflict_id: conflict.id.clone(),
            strategy,
            pending_change,
            already_resolved: false,
        })
    }

    /// Make a parked or failing change eligible for upload again
    pub async fn retry_change(&self, change_id: i64) -> Result<PendingChange> {
        let mut txn = self.store.begin_write().await?;

        if !txn.pending().reset_retries(change_id).await? {
            return Err(SyncError::NotFound(format!("pending change {}", change_id)));
        }
        let change = txn
            .pending()
            .get(change_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("pending change {}", change_id)))?;

        let errored = txn
            .records()
            .get(&change.table, &change.record_id)
            .await?
            .is_some_and(|record| record.sync_status == SyncStatus::Error);
        if errored {
            txn.records()
                .set_status(&change.table, &change.record_id, SyncStatus::Pending)
                .await?;
        }

        txn.commit().await?;
        tracing::info!("Change {} queued for retry", change_id);
        Ok(change)
    }

    /// Drop a pending change at the user's request
    ///
    /// When it was the record's last change, local state falls back to what
    /// the remote holds: a never-uploaded insert is removed, anything else is
    /// replaced by the record fetched from the remote (or removed if the
    /// remote has none). That fetch needs the remote to be reachable; if it
    /// fails, nothing is discarded.
    pub async fn discard_change(&self, change_id: i64) -> Result<PendingChange> {
        let (change, siblings) = {
            let mut conn = self.store.reader().await?;
            let change = PendingRepository::new(&mut *conn)
                .get(change_id)
                .await?
                .ok_or_else(|| SyncError::NotFound(format!("pending change {}", change_id)))?;
            let siblings = PendingRepository::new(&mut *conn)
                .list_for_record(&change.table, &change.record_id)
                .await?;
            (change, siblings)
        };

        let last = siblings.iter().all(|sibling| sibling.id == change.id);
        let restore = if last && change.operation != Operation::Insert {
            Some(self.fetch_remote(&change.table, &change.record_id).await?)
        } else {
            None
        };

        let mut txn = self.store.begin_write().await?;
        if !txn.pending().remove(change_id).await? {
            return Err(SyncError::NotFound(format!("pending change {}", change_id)));
        }

        let settled = !txn
            .pending()
            .has_changes_for_record(&change.table, &change.record_id)
            .await?;
        if settled {
            match (change.operation, restore) {
                (Operation::Insert, _) | (_, Some(None)) => {
                    txn.records().delete(&change.table, &change.record_id).await?;
                }
                (_, Some(Some(remote))) => {
                    let record =
                        LocalRecord::synced(&change.table, &change.record_id, remote.fields, remote.updated_at);
                    txn.records().upsert(&record).await?;
                }
                // Earlier changes were acknowledged meanwhile; the local row matches the remote
                (_, None) => {
                    txn.records()
                        .set_status(&change.table, &change.record_id, SyncStatus::Synced)
                        .await?;
                }
            }
        }

        txn.commit().await?;
        tracing::warn!(
            "Discarded change {} ({} of {}/{})",
            change.id,
            change.operation.as_str(),
            change.table,
            change.record_id
        );
        Ok(change)
    }

    /// Live remote version of one record, outside any sync cycle
    async fn fetch_remote(&self, table: &str, id: &str) -> Result<Option<RemoteRecord>> {
        let timeout = self.config.request_timeout();
        let fetched = tokio::time::timeout(timeout, self.remote.fetch(table, id))
            .await
            .map_err(|_| RemoteError::Timeout(timeout))??;
        Ok(fetched.filter(|record| !record.deleted))
    }

    /// Counts for the sync-status indicator
    pub async fn status(&self) -> Result<StatusSummary> {
        let mut conn = self.store.reader().await?;

        let pending_changes = PendingRepository::new(&mut *conn).count().await?;
        let pending_records = PendingRepository::new(&mut *conn).count_records().await?;
        let conflicted = RecordRepository::new(&mut *conn)
            .count_by_status(SyncStatus::Conflicted)
            .await?;
        let errored = RecordRepository::new(&mut *conn)
            .count_by_status(SyncStatus::Error)
            .await?;
        drop(conn);

        let watermarks: BTreeMap<_, _> = self
            .store
            .watermarks()
            .await?
            .into_iter()
            .map(|w| (w.table, w.last_synced_at))
            .collect();

        Ok(StatusSummary {
            pending_changes,
            pending_records,
            conflicted,
            errored,
            watermarks,
            in_progress: self.is_syncing(),
        })
    }

    pub fn is_syncing(&self) -> bool {
        self.cycle.try_lock().is_err()
    }

    /// Abort in-flight remote calls; they leave local state untouched
    pub fn cancel(&self) {
        if !self.cancel.send_replace(true) {
            tracing::info!("Sync cancelled");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Host is about to be suspended: cancel remote calls and make every
    /// committed write durable in the main database file
    pub async fn flush_on_suspend(&self) -> Result<()> {
        self.cancel();
        self.store.flush().await?;
        tracing::info!("Local store flushed for suspend");
        Ok(())
    }

    /// Host is back: allow remote calls again and ask for a sync
    pub fn on_resume(&self) {
        self.cancel.send_replace(false);
        self.request_sync();
        tracing::info!("Resumed, sync requested");
    }

    /// Ask the scheduler for a cycle; requests made during a cycle collapse
    /// into a single follow-up
    pub fn request_sync(&self) {
        self.sync_requested.notify_one();
    }

    pub(crate) fn sync_requested(&self) -> &Notify {
        &self.sync_requested
    }
}

/// Upload then download one table
async fn sync_table(ctx: &CycleContext<'_>, table: &str) -> (SyncReport, Result<()>) {
    let mut report = SyncReport::default();

    let mut outcome = upload_table(ctx, table, &mut report).await;
    if outcome.is_ok() {
        outcome = download_table(ctx, table, &mut report).await;
    }

    if let Err(err) = &outcome {
        if err.is_cycle_fatal() {
            ctx.abort();
        }
        tracing::warn!("Sync of {} stopped: {}", table, err);
    }

    (report, outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, RemoteError};
    use crate::remote::{MemoryRemoteStore, RemoteRecord};
    use crate::sync::ConflictKind;
    use chrono::{DateTime, Utc};
    use serde_json::json;
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        engine: SyncEngine,
        remote: Arc<MemoryRemoteStore>,
    }

    async fn setup() -> Harness {
        setup_with(SyncConfig::with_tables(["stock", "boats"])).await
    }

    async fn setup_with(config: SyncConfig) -> Harness {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::open_path(dir.path().join("local.db")).await.unwrap();
        let remote = Arc::new(MemoryRemoteStore::new());
        let engine = SyncEngine::new(store, remote.clone(), config);
        Harness {
            _dir: dir,
            engine,
            remote,
        }
    }

    fn fields(value: serde_json::Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    /// Put a local pending edit with an explicit timestamp
    async fn local_edit(engine: &SyncEngine, table: &str, id: &str, data: Fields, updated_at: DateTime<Utc>) {
        let mut txn = engine.store().begin_write().await.unwrap();
        txn.records()
            .upsert(&LocalRecord {
                table: table.to_string(),
                id: id.to_string(),
                fields: data.clone(),
                sync_status: SyncStatus::Pending,
                updated_at,
                deleted: false,
            })
            .await
            .unwrap();
        txn.pending()
            .append(table, id, Operation::Update, &data, updated_at)
            .await
            .unwrap();
        txn.commit().await.unwrap();
    }

    async fn set_watermark(engine: &SyncEngine, table: &str, to: DateTime<Utc>) {
        let mut txn = engine.store().begin_write().await.unwrap();
        txn.watermarks().advance(table, to).await.unwrap();
        txn.commit().await.unwrap();
    }

    /// Local A edited at 100 (watermark 90), remote A edited at 150
    async fn conflicted(h: &Harness, local: Fields, remote: Fields) -> Conflict {
        set_watermark(&h.engine, "stock", at(90)).await;
        local_edit(&h.engine, "stock", "A", local, at(100)).await;
        h.remote.seed("stock", "A", remote, at(150));
        h.remote.fail_writes("stock", Some("A"), RemoteError::Network("offline".into()), 1);

        let report = h.engine.run_sync_cycle(Some(&["stock".to_string()])).await.unwrap();
        assert_eq!(report.conflicts, 1);
        h.engine.get_conflicts().await.unwrap().remove(0)
    }

    #[tokio::test]
    async fn test_insert_then_update_uploads_in_order() {
        let h = setup().await;

        h.engine
            .record_mutation("stock", "A", Operation::Insert, fields(json!({"name": "rope", "qty": 1})))
            .await
            .unwrap();
        h.engine
            .record_mutation("stock", "A", Operation::Update, fields(json!({"qty": 5})))
            .await
            .unwrap();

        let report = h.engine.run_sync_cycle(None).await.unwrap();
        assert_eq!(report.uploaded, 2);
        assert!(report.is_clean());

        let remote = h.remote.record("stock", "A").unwrap();
        assert_eq!(remote.fields, fields(json!({"name": "rope", "qty": 5})));
        assert!(h.engine.store().list_pending("stock").await.unwrap().is_empty());

        let local = h.engine.store().get("stock", "A").await.unwrap().unwrap();
        assert_eq!(local.sync_status, SyncStatus::Synced);
        assert_eq!(local.fields["qty"], 5);
    }

    #[tokio::test]
    async fn test_concurrent_remote_edit_raises_conflict() {
        let h = setup().await;
        let local = fields(json!({"qty": 3}));
        let remote = fields(json!({"qty": 8}));

        let conflict = conflicted(&h, local.clone(), remote.clone()).await;

        assert_eq!(conflict.record_id, "A");
        assert_eq!(conflict.local_snapshot, Some(local.clone()));
        assert_eq!(conflict.remote_snapshot, Some(remote));
        assert_eq!(conflict.kind, ConflictKind::Timestamp);

        let record = h.engine.store().get("stock", "A").await.unwrap().unwrap();
        assert_eq!(record.sync_status, SyncStatus::Conflicted);
        assert_eq!(record.fields, local);
        assert!(h.engine.store().list_pending("stock").await.unwrap().is_empty());
        assert_eq!(h.engine.store().watermark("stock").await.unwrap(), Some(at(150)));
    }

    #[tokio::test]
    async fn test_use_remote_adopts_remote_snapshot() {
        let h = setup().await;
        let remote = fields(json!({"qty": 8}));
        let conflict = conflicted(&h, fields(json!({"qty": 3})), remote.clone()).await;

        let outcome = h
            .engine
            .resolve_conflict(&conflict.id, ResolutionStrategy::UseRemote, None)
            .await
            .unwrap();
        assert!(outcome.pending_change.is_none());
        assert!(!outcome.already_resolved);

        let record = h.engine.store().get("stock", "A").await.unwrap().unwrap();
        assert_eq!(record.fields, remote);
        assert_eq!(record.sync_status, SyncStatus::Synced);
        assert!(h.engine.store().list_pending("stock").await.unwrap().is_empty());

        let stored = h.engine.get_conflict(&conflict.id).await.unwrap();
        assert!(stored.resolved);
        assert_eq!(stored.resolution, Some(ResolutionStrategy::UseRemote));
        assert!(h.engine.get_conflicts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_merge_prefers_local_fields() {
        let h = setup().await;
        let conflict = conflicted(
            &h,
            fields(json!({"color": "red"})),
            fields(json!({"color": "blue", "size": "M"})),
        )
        .await;

        let outcome = h
            .engine
            .resolve_conflict(&conflict.id, ResolutionStrategy::Merge, None)
            .await
            .unwrap();

        let change = outcome.pending_change.unwrap();
        assert_eq!(change.operation, Operation::Update);
        assert_eq!(change.payload, fields(json!({"color": "red", "size": "M"})));

        let record = h.engine.store().get("stock", "A").await.unwrap().unwrap();
        assert_eq!(record.sync_status, SyncStatus::Pending);
        assert_eq!(record.fields, change.payload);

        h.engine.run_sync_cycle(None).await.unwrap();
        assert_eq!(
            h.remote.record("stock", "A").unwrap().fields,
            fields(json!({"color": "red", "size": "M"}))
        );
        let record = h.engine.store().get("stock", "A").await.unwrap().unwrap();
        assert_eq!(record.sync_status, SyncStatus::Synced);
    }

    #[tokio::test]
    async fn test_failed_change_is_isolated() {
        let h = setup().await;

        for n in 1..=5 {
            h.engine
                .record_mutation("stock", &format!("item-{}", n), Operation::Insert, fields(json!({"n": n})))
                .await
                .unwrap();
        }
        h.remote
            .fail_writes("stock", Some("item-3"), RemoteError::Network("reset".into()), 1);

        let report = h.engine.run_sync_cycle(Some(&["stock".to_string()])).await.unwrap();
        assert_eq!(report.uploaded, 4);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].record_id.as_deref(), Some("item-3"));
        assert_eq!(report.errors[0].kind, ErrorKind::TransientNetwork);

        let pending = h.engine.store().list_pending("stock").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].record_id, "item-3");
        assert_eq!(pending[0].retry_count, 1);
        assert!(pending[0].last_error.is_some());

        for id in ["item-1", "item-2", "item-4", "item-5"] {
            let record = h.engine.store().get("stock", id).await.unwrap().unwrap();
            assert_eq!(record.sync_status, SyncStatus::Synced);
            assert!(h.remote.record("stock", id).is_some());
        }

        let report = h.engine.run_sync_cycle(Some(&["stock".to_string()])).await.unwrap();
        assert_eq!(report.uploaded, 1);
        assert!(h.engine.store().list_pending("stock").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_later_changes_of_failed_record_wait() {
        let h = setup().await;

        h.engine
            .record_mutation("stock", "A", Operation::Insert, fields(json!({"qty": 1})))
            .await
            .unwrap();
        h.engine
            .record_mutation("stock", "A", Operation::Update, fields(json!({"qty": 2})))
            .await
            .unwrap();
        h.remote
            .fail_writes("stock", Some("A"), RemoteError::Network("reset".into()), 1);

        let report = h.engine.run_sync_cycle(Some(&["stock".to_string()])).await.unwrap();
        assert_eq!(report.uploaded, 0);
        assert_eq!(report.deferred, 1);
        assert!(h.remote.record("stock", "A").is_none());

        let pending = h.engine.store().list_pending("stock").await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[1].retry_count, 0);
    }

    #[tokio::test]
    async fn test_download_is_idempotent() {
        let h = setup().await;
        h.remote.put_remote("boats", "b1", fields(json!({"name": "Aurora"})));
        h.remote.put_remote("boats", "b2", fields(json!({"name": "Borealis"})));

        let report = h.engine.run_sync_cycle(None).await.unwrap();
        assert_eq!(report.downloaded, 2);
        let first = h.engine.store().list("boats").await.unwrap();
        let watermark = h.engine.store().watermark("boats").await.unwrap();

        let report = h.engine.run_sync_cycle(None).await.unwrap();
        assert_eq!(report.downloaded, 0);
        assert_eq!(h.engine.store().list("boats").await.unwrap(), first);
        assert_eq!(h.engine.store().watermark("boats").await.unwrap(), watermark);
    }

    #[tokio::test]
    async fn test_watermark_tracks_newest_remote_edit() {
        let h = setup().await;
        h.remote.seed("boats", "b1", Fields::new(), at(10));
        h.remote.seed("boats", "b2", Fields::new(), at(30));

        h.engine.run_sync_cycle(None).await.unwrap();
        assert_eq!(h.engine.store().watermark("boats").await.unwrap(), Some(at(30)));

        h.engine.run_sync_cycle(None).await.unwrap();
        assert_eq!(h.engine.store().watermark("boats").await.unwrap(), Some(at(30)));
    }

    #[tokio::test]
    async fn test_newer_local_edit_survives_download() {
        let h = setup().await;
        h.remote.seed("stock", "A", fields(json!({"qty": 8})), at(50));
        local_edit(&h.engine, "stock", "A", fields(json!({"qty": 3})), at(100)).await;
        h.remote.fail_writes("stock", Some("A"), RemoteError::Network("offline".into()), 1);

        let report = h.engine.run_sync_cycle(Some(&["stock".to_string()])).await.unwrap();
        assert_eq!(report.conflicts, 0);
        let record = h.engine.store().get("stock", "A").await.unwrap().unwrap();
        assert_eq!(record.sync_status, SyncStatus::Pending);
        assert_eq!(record.fields["qty"], 3);
    }

    #[tokio::test]
    async fn test_remote_delete_removes_synced_record() {
        let h = setup().await;
        h.remote.put_remote("boats", "b1", Fields::new());
        h.engine.run_sync_cycle(None).await.unwrap();

        h.remote.delete_remote("boats", "b1");
        let report = h.engine.run_sync_cycle(None).await.unwrap();
        assert_eq!(report.downloaded, 1);
        assert!(h.engine.store().get("boats", "b1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_local_delete_keeps_tombstone_until_acknowledged() {
        let h = setup().await;
        h.remote.put_remote("boats", "b1", fields(json!({"name": "Aurora"})));
        h.engine.run_sync_cycle(None).await.unwrap();

        h.engine
            .record_mutation("boats", "b1", Operation::Delete, Fields::new())
            .await
            .unwrap();
        assert!(h.engine.store().list("boats").await.unwrap().is_empty());
        assert!(h.engine.store().get("boats", "b1").await.unwrap().unwrap().deleted);

        h.engine.run_sync_cycle(None).await.unwrap();
        assert!(h.engine.store().get("boats", "b1").await.unwrap().is_none());
        assert!(h.remote.records("boats").is_empty());
    }

    #[tokio::test]
    async fn test_conflicted_record_rejects_mutation() {
        let h = setup().await;
        conflicted(&h, fields(json!({"qty": 3})), fields(json!({"qty": 8}))).await;

        let err = h
            .engine
            .record_mutation("stock", "A", Operation::Update, fields(json!({"qty": 4})))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::RecordConflicted { .. }));
    }

    #[tokio::test]
    async fn test_newer_remote_edit_refreshes_open_conflict() {
        let h = setup().await;
        let conflict = conflicted(&h, fields(json!({"qty": 3})), fields(json!({"qty": 8}))).await;

        h.remote.seed("stock", "A", fields(json!({"qty": "many"})), at(200));
        let report = h.engine.run_sync_cycle(Some(&["stock".to_string()])).await.unwrap();
        assert_eq!(report.conflicts, 1);

        let open = h.engine.get_conflicts().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, conflict.id);
        assert_eq!(open[0].remote_updated_at, at(200));
        assert_eq!(open[0].kind, ConflictKind::SchemaMismatch);
    }

    #[tokio::test]
    async fn test_resolution_is_idempotent() {
        let h = setup().await;
        let conflict = conflicted(&h, fields(json!({"qty": 3})), fields(json!({"qty": 8}))).await;

        let first = h
            .engine
            .resolve_conflict(&conflict.id, ResolutionStrategy::UseLocal, None)
            .await
            .unwrap();
        assert!(first.pending_change.is_some());

        let second = h
            .engine
            .resolve_conflict(&conflict.id, ResolutionStrategy::UseRemote, None)
            .await
            .unwrap();
        assert!(second.already_resolved);
        assert_eq!(second.strategy, ResolutionStrategy::UseLocal);
        assert_eq!(h.engine.store().list_pending("stock").await.unwrap().len(), 1);

        let err = h
            .engine
            .resolve_conflict("missing", ResolutionStrategy::UseLocal, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_use_local_against_remote_delete_reinserts() {
        let h = setup().await;
        set_watermark(&h.engine, "stock", at(90)).await;
        local_edit(&h.engine, "stock", "A", fields(json!({"qty": 3})), at(100)).await;
        h.remote.seed_record(
            "stock",
            None,
            RemoteRecord {
                id: "A".to_string(),
                fields: Fields::new(),
                updated_at: at(150),
                deleted: true,
            },
        );
        h.remote.fail_writes("stock", Some("A"), RemoteError::Network("offline".into()), 1);
        h.engine.run_sync_cycle(Some(&["stock".to_string()])).await.unwrap();

        let conflict = h.engine.get_conflicts().await.unwrap().remove(0);
        assert!(conflict.remote_snapshot.is_none());

        let outcome = h
            .engine
            .resolve_conflict(&conflict.id, ResolutionStrategy::UseLocal, None)
            .await
            .unwrap();
        assert_eq!(outcome.pending_change.unwrap().operation, Operation::Insert);

        h.engine.run_sync_cycle(Some(&["stock".to_string()])).await.unwrap();
        assert_eq!(h.remote.record("stock", "A").unwrap().fields["qty"], 3);
    }

    #[tokio::test]
    async fn test_auth_expiry_aborts_cycle() {
        let h = setup().await;
        h.engine
            .record_mutation("stock", "A", Operation::Insert, fields(json!({"qty": 1})))
            .await
            .unwrap();
        h.remote.fail_writes("stock", None, RemoteError::AuthExpired, 1);

        let err = h.engine.run_sync_cycle(None).await.unwrap_err();
        assert!(matches!(err, SyncError::AuthExpired));

        let pending = h.engine.store().list_pending("stock").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].retry_count, 0);
        assert!(h.engine.store().watermark("stock").await.unwrap().is_none());

        // Nothing was lost: the next cycle goes through
        let report = h.engine.run_sync_cycle(None).await.unwrap();
        assert_eq!(report.uploaded, 1);
    }

    #[tokio::test]
    async fn test_table_failure_is_reported_per_table() {
        let h = setup().await;
        h.remote.put_remote("boats", "b1", Fields::new());
        h.remote.put_remote("stock", "s1", Fields::new());
        h.remote.fail_queries("stock", RemoteError::Network("reset".into()), 1);

        let report = h.engine.run_sync_cycle(None).await.unwrap();
        assert_eq!(report.failed_tables(), vec!["stock"]);
        assert!(h.engine.store().get("boats", "b1").await.unwrap().is_some());
        assert!(h.engine.store().watermark("stock").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_slow_remote_times_out_as_transient() {
        let mut config = SyncConfig::with_tables(["boats"]);
        config.request_timeout_secs = 1;
        let h = setup_with(config).await;
        h.remote.put_remote("boats", "b1", Fields::new());
        h.remote.set_latency(Some(std::time::Duration::from_secs(3)));

        let report = h.engine.run_sync_cycle(None).await.unwrap();
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].kind, ErrorKind::TransientNetwork);
        assert!(h.engine.store().watermark("boats").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancel_leaves_state_untouched() {
        let h = Arc::new(setup().await);
        h.engine
            .record_mutation("stock", "A", Operation::Insert, fields(json!({"qty": 1})))
            .await
            .unwrap();
        h.remote.set_latency(Some(std::time::Duration::from_secs(5)));

        let running = {
            let h = h.clone();
            tokio::spawn(async move { h.engine.run_sync_cycle(None).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(h.engine.status().await.unwrap().in_progress);
        h.engine.flush_on_suspend().await.unwrap();

        let report = running.await.unwrap().unwrap();
        assert!(report.errors.iter().all(|e| e.kind == ErrorKind::Cancelled));
        assert_eq!(report.uploaded, 0);

        let pending = h.engine.store().list_pending("stock").await.unwrap();
        assert_eq!(pending[0].retry_count, 0);
        assert_eq!(h.remote.write_count(), 0);

        h.remote.set_latency(None);
        h.engine.on_resume();
        let report = h.engine.run_sync_cycle(None).await.unwrap();
        assert_eq!(report.uploaded, 1);
    }

    #[tokio::test]
    async fn test_overlapping_cycle_is_rejected() {
        let h = Arc::new(setup().await);
        h.remote.set_latency(Some(std::time::Duration::from_millis(500)));
        h.remote.put_remote("boats", "b1", Fields::new());

        let running = {
            let h = h.clone();
            tokio::spawn(async move { h.engine.run_sync_cycle(None).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let err = h.engine.run_sync_cycle(None).await.unwrap_err();
        assert!(matches!(err, SyncError::SyncInProgress));
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_validation_failures_park_change() {
        let mut config = SyncConfig::with_tables(["stock"]);
        config.max_validation_retries = 2;
        let h = setup_with(config).await;

        let change = h
            .engine
            .record_mutation("stock", "A", Operation::Insert, fields(json!({"qty": -1})))
            .await
            .unwrap();
        h.remote.fail_writes(
            "stock",
            Some("A"),
            RemoteError::Validation("qty must be positive".into()),
            2,
        );

        for _ in 0..2 {
            h.engine.run_sync_cycle(None).await.unwrap();
        }
        let record = h.engine.store().get("stock", "A").await.unwrap().unwrap();
        assert_eq!(record.sync_status, SyncStatus::Error);

        let report = h.engine.run_sync_cycle(None).await.unwrap();
        assert_eq!(report.deferred, 1);
        assert_eq!(report.uploaded, 0);
        assert_eq!(h.engine.status().await.unwrap().errored, 1);

        h.engine.retry_change(change.id).await.unwrap();
        let report = h.engine.run_sync_cycle(None).await.unwrap();
        assert_eq!(report.uploaded, 1);
        let record = h.engine.store().get("stock", "A").await.unwrap().unwrap();
        assert_eq!(record.sync_status, SyncStatus::Synced);
    }

    #[tokio::test]
    async fn test_remote_edit_supersedes_rejected_change() {
        let h = setup().await;
        h.engine
            .record_mutation("stock", "A", Operation::Insert, fields(json!({"qty": -1})))
            .await
            .unwrap();
        h.remote.fail_writes(
            "stock",
            Some("A"),
            RemoteError::Validation("qty must be positive".into()),
            1,
        );
        h.remote.put_remote("stock", "A", fields(json!({"qty": 42})));

        let report = h.engine.run_sync_cycle(None).await.unwrap();
        assert_eq!(report.conflicts, 0);
        let record = h.engine.store().get("stock", "A").await.unwrap().unwrap();
        assert_eq!(record.fields["qty"], 42);
        assert_eq!(record.sync_status, SyncStatus::Synced);
        assert!(h.engine.store().list_pending("stock").await.unwrap().is_empty());

        let report = h.engine.run_sync_cycle(None).await.unwrap();
        assert_eq!(report.uploaded, 0);
        assert_eq!(h.remote.record("stock", "A").unwrap().fields["qty"], 42);
    }

    #[tokio::test]
    async fn test_discard_unsent_insert_removes_record() {
        let h = setup().await;
        let change = h
            .engine
            .record_mutation("stock", "A", Operation::Insert, fields(json!({"qty": 1})))
            .await
            .unwrap();

        let discarded = h.engine.discard_change(change.id).await.unwrap();
        assert_eq!(discarded.id, change.id);
        assert!(h.engine.store().list_pending("stock").await.unwrap().is_empty());
        assert!(h.engine.store().get("stock", "A").await.unwrap().is_none());

        let report = h.engine.run_sync_cycle(None).await.unwrap();
        assert_eq!(report.uploaded, 0);
        assert!(h.remote.record("stock", "A").is_none());
        assert!(h.engine.store().get("stock", "A").await.unwrap().is_none());

        assert!(matches!(
            h.engine.discard_change(change.id).await.unwrap_err(),
            SyncError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_discard_update_restores_remote_version() {
        let h = setup().await;
        let synced = h.remote.put_remote("stock", "A", fields(json!({"qty": 3})));
        h.engine.run_sync_cycle(None).await.unwrap();

        let change = h
            .engine
            .record_mutation("stock", "A", Operation::Update, fields(json!({"qty": 9})))
            .await
            .unwrap();

        h.remote.fail_queries("stock", RemoteError::Network("offline".into()), 1);
        assert_eq!(
            h.engine.discard_change(change.id).await.unwrap_err().kind(),
            ErrorKind::TransientNetwork
        );
        assert_eq!(h.engine.store().list_pending("stock").await.unwrap().len(), 1);

        h.engine.discard_change(change.id).await.unwrap();
        let record = h.engine.store().get("stock", "A").await.unwrap().unwrap();
        assert_eq!(record.fields["qty"], 3);
        assert_eq!(record.sync_status, SyncStatus::Synced);
        assert_eq!(record.updated_at, synced.updated_at);
    }

    #[tokio::test]
    async fn test_discard_keeps_record_with_later_changes() {
        let h = setup().await;
        let insert = h
            .engine
            .record_mutation("stock", "A", Operation::Insert, fields(json!({"qty": 1})))
            .await
            .unwrap();
        h.engine
            .record_mutation("stock", "A", Operation::Update, fields(json!({"qty": 2})))
            .await
            .unwrap();

        h.engine.discard_change(insert.id).await.unwrap();
        let record = h.engine.store().get("stock", "A").await.unwrap().unwrap();
        assert_eq!(record.sync_status, SyncStatus::Pending);
        assert_eq!(h.engine.store().list_pending("stock").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_status_summary() {
        let h = setup().await;
        h.engine
            .record_mutation("stock", "A", Operation::Insert, Fields::new())
            .await
            .unwrap();
        h.engine
            .record_mutation("stock", "A", Operation::Update, fields(json!({"qty": 2})))
            .await
            .unwrap();
        h.engine
            .record_mutation("boats", "b1", Operation::Insert, Fields::new())
            .await
            .unwrap();

        let status = h.engine.status().await.unwrap();
        assert_eq!(status.pending_changes, 3);
        assert_eq!(status.pending_records, 2);
        assert!(!status.in_progress);
        assert!(status.watermarks.is_empty());

        h.remote.put_remote("boats", "b9", Fields::new());
        h.engine.run_sync_cycle(None).await.unwrap();
        let status = h.engine.status().await.unwrap();
        assert_eq!(status.pending_changes, 0);
        assert!(status.watermarks.contains_key("boats"));
    }

    #[tokio::test]
    async fn test_connect_from_config() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.local.url = format!("sqlite://{}", dir.path().join("device.db").display());
        config.sync = SyncConfig::with_tables(["boats"]);

        let engine = SyncEngine::connect(&config).await.unwrap();
        assert_eq!(engine.config().tables, vec!["boats".to_string()]);
        assert_eq!(engine.status().await.unwrap().pending_changes, 0);
    }

    #[tokio::test]
    async fn test_empty_identifiers_rejected() {
        let h = setup().await;
        let err = h
            .engine
            .record_mutation("", "A", Operation::Insert, Fields::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidInput(_)));
    }
}
