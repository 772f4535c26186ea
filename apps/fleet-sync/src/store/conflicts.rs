//! Conflict store persistence

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;

use super::{decode_ts, encode_ts};
use crate::error::{Result, SyncError};
use crate::sync::{Conflict, ConflictKind, Fields, ResolutionStrategy};

/// Repository for detected conflicts
pub struct ConflictRepository<'c> {
    conn: &'c mut SqliteConnection,
}

impl<'c> ConflictRepository<'c> {
    pub fn new(conn: &'c mut SqliteConnection) -> Self {
        Self { conn }
    }

    pub async fn insert(&mut self, conflict: &Conflict) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO conflicts (
                id, table_name, record_id, local_snapshot, remote_snapshot,
                remote_updated_at, kind, detected_at, resolved, resolved_at, resolution
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&conflict.id)
        .bind(&conflict.table)
        .bind(&conflict.record_id)
        .bind(encode_snapshot(&conflict.local_snapshot)?)
        .bind(encode_snapshot(&conflict.remote_snapshot)?)
        .bind(encode_ts(&conflict.remote_updated_at))
        .bind(conflict.kind.as_str())
        .bind(encode_ts(&conflict.detected_at))
        .bind(conflict.resolved)
        .bind(conflict.resolved_at.as_ref().map(encode_ts))
        .bind(conflict.resolution.map(|r| r.as_str()))
        .execute(&mut *self.conn)
        .await?;

        Ok(())
    }

    pub async fn get(&mut self, id: &str) -> Result<Option<Conflict>> {
        let row = sqlx::query_as::<_, ConflictRow>(
            r#"
            SELECT id, table_name, record_id, local_snapshot, remote_snapshot,
                   remote_updated_at, kind, detected_at, resolved, resolved_at, resolution
            FROM conflicts
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *self.conn)
        .await?;

        row.map(ConflictRow::into_conflict).transpose()
    }

    /// The unresolved conflict of a record, if any
    pub async fn open_for_record(&mut self, table: &str, record_id: &str) -> Result<Option<Conflict>> {
        let row = sqlx::query_as::<_, ConflictRow>(
            r#"
            SELECT id, table_name, record_id, local_snapshot, remote_snapshot,
                   remote_updated_at, kind, detected_at, resolved, resolved_at, resolution
            FROM conflicts
            WHERE table_name = ? AND record_id = ? AND resolved = 0
            ORDER BY detected_at DESC
            LIMIT 1
            "#,
        )
        .bind(table)
        .bind(record_id)
        .fetch_optional(&mut *self.conn)
        .await?;

        row.map(ConflictRow::into_conflict).transpose()
    }

    /// All unresolved conflicts, oldest first
    pub async fn list_open(&mut self) -> Result<Vec<Conflict>> {
        let rows = sqlx::query_as::<_, ConflictRow>(
            r#"
            SELECT id, table_name, record_id, local_snapshot, remote_snapshot,
                   remote_updated_at, kind, detected_at, resolved, resolved_at, resolution
            FROM conflicts
            WHERE resolved = 0
            ORDER BY detected_at ASC, id ASC
            "#,
        )
        .fetch_all(&mut *self.conn)
        .await?;

        rows.into_iter().map(ConflictRow::into_conflict).collect()
    }

    /// Replace the remote side of an open conflict with a newer remote edit
    pub async fn refresh_remote(
        &mut self,
        id: &str,
        remote_snapshot: &Option<Fields>,
        remote_updated_at: DateTime<Utc>,
        kind: ConflictKind,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE conflicts
            SET remote_snapshot = ?, remote_updated_at = ?, kind = ?
            WHERE id = ? AND resolved = 0
            "#,
        )
        .bind(encode_snapshot(remote_snapshot)?)
        .bind(encode_ts(&remote_updated_at))
        .bind(kind.as_str())
        .bind(id)
        .execute(&mut *self.conn)
        .await?;

        Ok(())
    }

    pub async fn mark_resolved(
        &mut self,
        id: &str,
        strategy: ResolutionStrategy,
        resolved_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE conflicts
            SET resolved = 1, resolved_at = ?, resolution = ?
            WHERE id = ? AND resolved = 0
            "#,
        )
        .bind(encode_ts(&resolved_at))
        .bind(strategy.as_str())
        .bind(id)
        .execute(&mut *self.conn)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn count_open(&mut self) -> Result<usize> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM conflicts WHERE resolved = 0")
            .fetch_one(&mut *self.conn)
            .await?;

        Ok(count.0 as usize)
    }

    /// Delete resolved conflicts; they carry no state the engine still needs
    pub async fn purge_resolved(&mut self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM conflicts WHERE resolved = 1")
            .execute(&mut *self.conn)
            .await?;

        Ok(result.rows_affected())
    }
}

fn encode_snapshot(snapshot: &Option<Fields>) -> Result<Option<String>> {
    snapshot
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(SyncError::from)
}

#[derive(sqlx::FromRow)]
struct ConflictRow {
    id: String,
    table_name: String,
    record_id: String,
    local_snapshot: Option<String>,
    remote_snapshot: Option<String>,
    remote_updated_at: String,
    kind: String,
    detected_at: String,
    resolved: bool,
    resolved_at: Option<String>,
    resolution: Option<String>,
}

impl ConflictRow {
    fn into_conflict(self) -> Result<Conflict> {
        let kind = ConflictKind::parse(&self.kind)
            .ok_or_else(|| SyncError::CorruptRow(format!("unknown conflict kind {:?}", self.kind)))?;

        let local_snapshot: Option<Fields> = self
            .local_snapshot
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        let remote_snapshot: Option<Fields> = self
            .remote_snapshot
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;

        Ok(Conflict {
            id: self.id,
            table: self.table_name,
            record_id: self.record_id,
            local_snapshot,
            remote_snapshot,
            remote_updated_at: decode_ts(&self.remote_updated_at)?,
            kind,
            detected_at: decode_ts(&self.detected_at)?,
            resolved: self.resolved,
            resolved_at: self.resolved_at.as_deref().map(decode_ts).transpose()?,
            resolution: self.resolution.as_deref().and_then(ResolutionStrategy::parse),
        })
    }
}
