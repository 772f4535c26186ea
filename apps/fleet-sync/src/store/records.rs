//! Local record persistence

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;

use super::{decode_fields, decode_ts, encode_ts};
use crate::error::{Result, SyncError};
use crate::sync::{LocalRecord, SyncStatus};

/// Repository for domain records and their sync metadata
pub struct RecordRepository<'c> {
    conn: &'c mut SqliteConnection,
}

impl<'c> RecordRepository<'c> {
    pub fn new(conn: &'c mut SqliteConnection) -> Self {
        Self { conn }
    }

    /// Get a record, tombstones included
    pub async fn get(&mut self, table: &str, id: &str) -> Result<Option<LocalRecord>> {
        let row = sqlx::query_as::<_, RecordRow>(
            r#"
            SELECT table_name, id, fields, sync_status, updated_at, deleted
            FROM local_records
            WHERE table_name = ? AND id = ?
            "#,
        )
        .bind(table)
        .bind(id)
        .fetch_optional(&mut *self.conn)
        .await?;

        row.map(RecordRow::into_record).transpose()
    }

    /// List live records of a table
    pub async fn list(&mut self, table: &str) -> Result<Vec<LocalRecord>> {
        let rows = sqlx::query_as::<_, RecordRow>(
            r#"
            SELECT table_name, id, fields, sync_status, updated_at, deleted
            FROM local_records
            WHERE table_name = ? AND deleted = 0
            ORDER BY id ASC
            "#,
        )
        .bind(table)
        .fetch_all(&mut *self.conn)
        .await?;

        rows.into_iter().map(RecordRow::into_record).collect()
    }

    /// Insert or replace a record
    pub async fn upsert(&mut self, record: &LocalRecord) -> Result<()> {
        let fields = serde_json::to_string(&record.fields)?;

        sqlx::query(
            r#"
            INSERT INTO local_records (table_name, id, fields, sync_status, updated_at, deleted)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(table_name, id) DO UPDATE SET
                fields = excluded.fields,
                sync_status = excluded.sync_status,
                updated_at = excluded.updated_at,
                deleted = excluded.deleted
            "#,
        )
        .bind(&record.table)
        .bind(&record.id)
        .bind(&fields)
        .bind(record.sync_status.as_str())
        .bind(encode_ts(&record.updated_at))
        .bind(record.deleted)
        .execute(&mut *self.conn)
        .await?;

        Ok(())
    }

    /// Remove a record row entirely
    pub async fn delete(&mut self, table: &str, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM local_records WHERE table_name = ? AND id = ?")
            .bind(table)
            .bind(id)
            .execute(&mut *self.conn)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn set_status(&mut self, table: &str, id: &str, status: SyncStatus) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE local_records SET sync_status = ? WHERE table_name = ? AND id = ?",
        )
        .bind(status.as_str())
        .bind(table)
        .bind(id)
        .execute(&mut *self.conn)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Count records in a given state across all tables
    pub async fn count_by_status(&mut self, status: SyncStatus) -> Result<usize> {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM local_records WHERE sync_status = ?")
                .bind(status.as_str())
                .fetch_one(&mut *self.conn)
                .await?;

        Ok(count.0 as usize)
    }

    /// Evict synced records not touched since `older_than`
    pub async fn delete_stale_synced(&mut self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM local_records WHERE sync_status = 'synced' AND updated_at < ?",
        )
        .bind(encode_ts(&older_than))
        .execute(&mut *self.conn)
        .await?;

        Ok(result.rows_affected())
    }
}

#[derive(sqlx::FromRow)]
struct RecordRow {
    table_name: String,
    id: String,
    fields: String,
    sync_status: String,
    updated_at: String,
    deleted: bool,
}

impl RecordRow {
    fn into_record(self) -> Result<LocalRecord> {
        let sync_status = SyncStatus::parse(&self.sync_status).ok_or_else(|| {
            SyncError::CorruptRow(format!("unknown sync status {:?}", self.sync_status))
        })?;

        Ok(LocalRecord {
            fields: decode_fields(&self.fields)?,
            updated_at: decode_ts(&self.updated_at)?,
            table: self.table_name,
            id: self.id,
            sync_status,
            deleted: self.deleted,
        })
    }
}
