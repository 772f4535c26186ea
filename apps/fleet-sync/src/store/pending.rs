//! Pending change log persistence

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;

use super::{decode_fields, decode_ts, encode_ts};
use crate::error::{ErrorKind, Result, SyncError};
use crate::sync::{Fields, Operation, PendingChange};

/// Repository for the ordered queue of unacknowledged local mutations
pub struct PendingRepository<'c> {
    conn: &'c mut SqliteConnection,
}

impl<'c> PendingRepository<'c> {
    pub fn new(conn: &'c mut SqliteConnection) -> Self {
        Self { conn }
    }

    /// Append a change at the tail of the log
    pub async fn append(
        &mut self,
        table: &str,
        record_id: &str,
        operation: Operation,
        payload: &Fields,
        created_at: DateTime<Utc>,
    ) -> Result<PendingChange> {
        let payload_json = serde_json::to_string(payload)?;

        let result = sqlx::query(
            r#"
            INSERT INTO pending_changes (table_name, record_id, operation, payload, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(table)
        .bind(record_id)
        .bind(operation.as_str())
        .bind(&payload_json)
        .bind(encode_ts(&created_at))
        .execute(&mut *self.conn)
        .await?;

        Ok(PendingChange {
            id: result.last_insert_rowid(),
            table: table.to_string(),
            record_id: record_id.to_string(),
            operation,
            payload: payload.clone(),
            created_at,
            retry_count: 0,
            last_error: None,
            failure_kind: None,
        })
    }

    pub async fn get(&mut self, id: i64) -> Result<Option<PendingChange>> {
        let row = sqlx::query_as::<_, PendingRow>(
            r#"
            SELECT seq, table_name, record_id, operation, payload, created_at,
                   retry_count, last_error, failure_kind
            FROM pending_changes
            WHERE seq = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *self.conn)
        .await?;

        row.map(PendingRow::into_change).transpose()
    }

    /// All changes for a table in creation order
    pub async fn list_for_table(&mut self, table: &str) -> Result<Vec<PendingChange>> {
        let rows = sqlx::query_as::<_, PendingRow>(
            r#"
            SELECT seq, table_name, record_id, operation, payload, created_at,
                   retry_count, last_error, failure_kind
            FROM pending_changes
            WHERE table_name = ?
            ORDER BY seq ASC
            "#,
        )
        .bind(table)
        .fetch_all(&mut *self.conn)
        .await?;

        rows.into_iter().map(PendingRow::into_change).collect()
    }

    pub async fn list_for_record(&mut self, table: &str, record_id: &str) -> Result<Vec<PendingChange>> {
        let rows = sqlx::query_as::<_, PendingRow>(
            r#"
            SELECT seq, table_name, record_id, operation, payload, created_at,
                   retry_count, last_error, failure_kind
            FROM pending_changes
            WHERE table_name = ? AND record_id = ?
            ORDER BY seq ASC
            "#,
        )
        .bind(table)
        .bind(record_id)
        .fetch_all(&mut *self.conn)
        .await?;

        rows.into_iter().map(PendingRow::into_change).collect()
    }

    /// Remove an acknowledged change
    pub async fn remove(&mut self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM pending_changes WHERE seq = ?")
            .bind(id)
            .execute(&mut *self.conn)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Drop every change of a record, returning how many were removed
    pub async fn remove_for_record(&mut self, table: &str, record_id: &str) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM pending_changes WHERE table_name = ? AND record_id = ?")
                .bind(table)
                .bind(record_id)
                .execute(&mut *self.conn)
                .await?;

        Ok(result.rows_affected())
    }

    pub async fn has_changes_for_record(&mut self, table: &str, record_id: &str) -> Result<bool> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM pending_changes WHERE table_name = ? AND record_id = ?",
        )
        .bind(table)
        .bind(record_id)
        .fetch_one(&mut *self.conn)
        .await?;

        Ok(count.0 > 0)
    }

    /// Record a failed attempt: bump the retry count, keep the entry
    pub async fn record_failure(&mut self, id: i64, message: &str, kind: ErrorKind) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE pending_changes
            SET retry_count = retry_count + 1,
                last_error = ?,
                failure_kind = ?
            WHERE seq = ?
            "#,
        )
        .bind(message)
        .bind(kind.as_str())
        .bind(id)
        .execute(&mut *self.conn)
        .await?;

        Ok(())
    }

    /// Make a parked change eligible for upload again
    pub async fn reset_retries(&mut self, id: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE pending_changes
            SET retry_count = 0, last_error = NULL, failure_kind = NULL
            WHERE seq = ?
            "#,
        )
        .bind(id)
        .execute(&mut *self.conn)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn count(&mut self) -> Result<usize> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM pending_changes")
            .fetch_one(&mut *self.conn)
            .await?;

        Ok(count.0 as usize)
    }

    /// Number of distinct records with at least one pending change
    pub async fn count_records(&mut self) -> Result<usize> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM (SELECT DISTINCT table_name, record_id FROM pending_changes)",
        )
        .fetch_one(&mut *self.conn)
        .await?;

        Ok(count.0 as usize)
    }
}

#[derive(sqlx::FromRow)]
struct PendingRow {
    seq: i64,
    table_name: String,
    record_id: String,
    operation: String,
    payload: String,
    created_at: String,
    retry_count: i64,
    last_error: Option<String>,
    failure_kind: Option<String>,
}

impl PendingRow {
    fn into_change(self) -> Result<PendingChange> {
        let operation = Operation::parse(&self.operation).ok_or_else(|| {
            SyncError::CorruptRow(format!("unknown operation {:?}", self.operation))
        })?;

        Ok(PendingChange {
            id: self.seq,
            payload: decode_fields(&self.payload)?,
            created_at: decode_ts(&self.created_at)?,
            table: self.table_name,
            record_id: self.record_id,
            operation,
            retry_count: self.retry_count.max(0) as u32,
            last_error: self.last_error,
            failure_kind: self.failure_kind.as_deref().and_then(ErrorKind::parse),
        })
    }
}
