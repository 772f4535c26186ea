//! Local store
//!
//! Embedded SQLite store holding domain records, the pending change log,
//! conflicts and watermarks. Every write goes through [`LocalStore::begin_write`],
//! which serializes writers behind one lock and wraps them in a transaction.
//! Reads use the pool directly and never wait on the writer (WAL journal).

mod conflicts;
mod pending;
mod records;
mod schema;
mod watermarks;

pub use conflicts::ConflictRepository;
pub use pending::PendingRepository;
pub use records::RecordRepository;
pub use schema::initialize_schema;
pub use watermarks::WatermarkRepository;

use std::future::Future;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::Serialize;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Sqlite, Transaction};
use tokio::sync::{Mutex, MutexGuard};

use crate::error::{Result, SyncError};
use crate::sync::{Fields, LocalRecord, PendingChange, SyncWatermark};

/// Handle to the device-local store. Cheap to clone.
#[derive(Clone)]
pub struct LocalStore {
    inner: Arc<LocalStoreInner>,
}

struct LocalStoreInner {
    pool: SqlitePool,
    writer: Mutex<()>,
}

/// What a storage cleanup removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub resolved_conflicts: u64,
    pub stale_records: u64,
}

impl LocalStore {
    /// Open (or create) the store at a sqlx SQLite URL
    pub async fn open(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?;
        Self::connect(options).await
    }

    /// Open (or create) the store in a database file
    pub async fn open_path(path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new().filename(path.as_ref());
        Self::connect(options).await
    }

    async fn connect(options: SqliteConnectOptions) -> Result<Self> {
        let options = options
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        initialize_schema(&pool).await?;

        Ok(Self {
            inner: Arc::new(LocalStoreInner {
                pool,
                writer: Mutex::new(()),
            }),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.inner.pool
    }

    /// Start a serialized write transaction
    pub async fn begin_write(&self) -> Result<WriteTxn<'_>> {
        let guard = self.inner.writer.lock().await;
        let tx = self.inner.pool.begin().await?;
        Ok(WriteTxn { tx, _guard: guard })
    }

    /// A pooled connection for reads
    pub async fn reader(&self) -> Result<PoolConnection<Sqlite>> {
        Ok(self.inner.pool.acquire().await?)
    }

    pub async fn get(&self, table: &str, id: &str) -> Result<Option<LocalRecord>> {
        let mut conn = self.reader().await?;
        RecordRepository::new(&mut *conn).get(table, id).await
    }

    /// Live records of a table (tombstones hidden)
    pub async fn list(&self, table: &str) -> Result<Vec<LocalRecord>> {
        let mut conn = self.reader().await?;
        RecordRepository::new(&mut *conn).list(table).await
    }

    pub async fn upsert(&self, record: &LocalRecord) -> Result<()> {
        let mut txn = self.begin_write().await?;
        txn.records().upsert(record).await?;
        txn.commit().await
    }

    pub async fn delete(&self, table: &str, id: &str) -> Result<bool> {
        let mut txn = self.begin_write().await?;
        let deleted = txn.records().delete(table, id).await?;
        txn.commit().await?;
        Ok(deleted)
    }

    /// Pending changes of a table in creation order
    pub async fn list_pending(&self, table: &str) -> Result<Vec<PendingChange>> {
        let mut conn = self.reader().await?;
        PendingRepository::new(&mut *conn).list_for_table(table).await
    }

    pub async fn watermark(&self, table: &str) -> Result<Option<DateTime<Utc>>> {
        let mut conn = self.reader().await?;
        WatermarkRepository::new(&mut *conn).get(table).await
    }

    pub async fn watermarks(&self) -> Result<Vec<SyncWatermark>> {
        let mut conn = self.reader().await?;
        WatermarkRepository::new(&mut *conn).list().await
    }

    /// Push every committed write from the WAL into the main database file
    ///
    /// Fails with [`SyncError::CheckpointBusy`] when a reader kept the
    /// checkpoint from completing within the busy timeout.
    pub async fn flush(&self) -> Result<()> {
        let _guard = self.inner.writer.lock().await;
        let (busy, log, checkpointed): (i64, i64, i64) = sqlx::query_as("PRAGMA wal_checkpoint(FULL)")
            .fetch_one(&self.inner.pool)
            .await?;

        if busy != 0 {
            tracing::warn!("WAL checkpoint blocked: {} of {} frames written", checkpointed, log);
            return Err(SyncError::CheckpointBusy { log, checkpointed });
        }

        tracing::debug!("WAL checkpoint wrote {} frames", checkpointed);
        Ok(())
    }

    /// Free space: purge resolved conflicts and synced records older than `retention`
    pub async fn cleanup(&self, retention: chrono::Duration) -> Result<CleanupReport> {
        let cutoff = now() - retention;

        let mut txn = self.begin_write().await?;
        let resolved_conflicts = txn.conflicts().purge_resolved().await?;
        let stale_records = txn.records().delete_stale_synced(cutoff).await?;
        txn.commit().await?;

        tracing::info!(
            "Storage cleanup removed {} resolved conflicts and {} stale records",
            resolved_conflicts,
            stale_records
        );

        Ok(CleanupReport {
            resolved_conflicts,
            stale_records,
        })
    }

    /// Run a write; if the disk is full, clean up once and retry it
    pub async fn with_recovery<T, F, Fut>(&self, retention: chrono::Duration, mut write: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match write().await {
            Err(SyncError::StorageFull) => {
                tracing::warn!("Local storage full, running cleanup before retrying write");
                self.cleanup(retention).await?;
                write().await
            }
            other => other,
        }
    }
}

/// A write transaction holding the store's writer lock until commit or drop
pub struct WriteTxn<'a> {
    // Declared first so a dropped transaction rolls back before the lock is released
    tx: Transaction<'static, Sqlite>,
    _guard: MutexGuard<'a, ()>,
}

impl<'a> WriteTxn<'a> {
    pub fn records(&mut self) -> RecordRepository<'_> {
        RecordRepository::new(&mut *self.tx)
    }

    pub fn pending(&mut self) -> PendingRepository<'_> {
        PendingRepository::new(&mut *self.tx)
    }

    pub fn conflicts(&mut self) -> ConflictRepository<'_> {
        ConflictRepository::new(&mut *self.tx)
    }

    pub fn watermarks(&mut self) -> WatermarkRepository<'_> {
        WatermarkRepository::new(&mut *self.tx)
    }

    pub async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

/// Current time at the precision timestamps are stored with
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Fixed-width RFC 3339 so string order equals time order
pub(crate) fn encode_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn decode_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SyncError::CorruptRow(format!("invalid timestamp {:?}: {}", s, e)))
}

pub(crate) fn decode_fields(s: &str) -> Result<Fields> {
    Ok(serde_json::from_str(s)?)
}
