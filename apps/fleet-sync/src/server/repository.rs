//! Authoritative record storage for the reference server

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};

use crate::error::{AppError, AppResult};
use crate::remote::RemoteRecord;
use crate::store::{decode_ts, encode_ts, now};
use crate::sync::Fields;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS remote_records (
    table_name TEXT NOT NULL,
    id TEXT NOT NULL,
    fields TEXT NOT NULL,
    scope TEXT,
    updated_at TEXT NOT NULL,
    deleted INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (table_name, id)
);

CREATE INDEX IF NOT EXISTS idx_remote_records_updated ON remote_records(table_name, updated_at);
"#;

/// Initialize the server schema
pub async fn initialize_schema(pool: &SqlitePool) -> AppResult<()> {
    sqlx::query(SCHEMA_SQL).execute(pool).await?;
    tracing::info!("Remote store schema initialized");
    Ok(())
}

/// Repository for the records the server holds
pub struct RemoteRecordRepository<'c> {
    conn: &'c mut SqliteConnection,
}

impl<'c> RemoteRecordRepository<'c> {
    pub fn new(conn: &'c mut SqliteConnection) -> Self {
        Self { conn }
    }

    pub async fn get(&mut self, table: &str, id: &str) -> AppResult<Option<RemoteRecord>> {
        let row = sqlx::query_as::<_, RemoteRow>(
            r#"
            SELECT id, fields, updated_at, deleted
            FROM remote_records
            WHERE table_name = ? AND id = ?
            "#,
        )
        .bind(table)
        .bind(id)
        .fetch_optional(&mut *self.conn)
        .await?;

        row.map(RemoteRow::into_record).transpose()
    }

    /// Records changed strictly after `since`, oldest first, tombstones included
    ///
    /// With a scope, records owned by another scope are hidden; records
    /// without a scope are visible to everyone.
    pub async fn list_since(
        &mut self,
        table: &str,
        since: Option<DateTime<Utc>>,
        scope: Option<&str>,
    ) -> AppResult<Vec<RemoteRecord>> {
        let since = since.as_ref().map(encode_ts);

        let rows = sqlx::query_as::<_, RemoteRow>(
            r#"
            SELECT id, fields, updated_at, deleted
            FROM remote_records
            WHERE table_name = ?
              AND (? IS NULL OR updated_at > ?)
              AND (? IS NULL OR scope IS NULL OR scope = ?)
            ORDER BY updated_at ASC, id ASC
            "#,
        )
        .bind(table)
        .bind(&since)
        .bind(&since)
        .bind(scope)
        .bind(scope)
        .fetch_all(&mut *self.conn)
        .await?;

        rows.into_iter().map(RemoteRow::into_record).collect()
    }

    /// Write a record (or tombstone) stamped after every earlier write
    pub async fn write(
        &mut self,
        table: &str,
        id: &str,
        fields: &Fields,
        scope: Option<&str>,
        deleted: bool,
    ) -> AppResult<RemoteRecord> {
        let updated_at = self.next_stamp().await?;
        let fields_json = serde_json::to_string(fields)?;

        sqlx::query(
            r#"
            INSERT INTO remote_records (table_name, id, fields, scope, updated_at, deleted)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(table_name, id) DO UPDATE SET
                fields = excluded.fields,
                scope = COALESCE(excluded.scope, remote_records.scope),
                updated_at = excluded.updated_at,
                deleted = excluded.deleted
            "#,
        )
        .bind(table)
        .bind(id)
        .bind(&fields_json)
        .bind(scope)
        .bind(encode_ts(&updated_at))
        .bind(deleted)
        .execute(&mut *self.conn)
        .await?;

        Ok(RemoteRecord {
            id: id.to_string(),
            fields: fields.clone(),
            updated_at,
            deleted,
        })
    }

    async fn next_stamp(&mut self) -> AppResult<DateTime<Utc>> {
        let last: (Option<String>,) = sqlx::query_as("SELECT MAX(updated_at) FROM remote_records")
            .fetch_one(&mut *self.conn)
            .await?;

        let stamp = now();
        match last.0.as_deref().map(parse_ts).transpose()? {
            Some(last) if stamp <= last => Ok(last + chrono::Duration::microseconds(1)),
            _ => Ok(stamp),
        }
    }
}

fn parse_ts(s: &str) -> AppResult<DateTime<Utc>> {
    decode_ts(s).map_err(|e| AppError::Internal(e.to_string()))
}

#[derive(sqlx::FromRow)]
struct RemoteRow {
    id: String,
    fields: String,
    updated_at: String,
    deleted: bool,
}

impl RemoteRow {
    fn into_record(self) -> AppResult<RemoteRecord> {
        Ok(RemoteRecord {
            id: self.id,
            fields: serde_json::from_str(&self.fields)?,
            updated_at: parse_ts(&self.updated_at)?,
            deleted: self.deleted,
        })
    }
}
