//! Per-table sync watermarks

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;

use super::{decode_ts, encode_ts};
use crate::error::Result;
use crate::sync::SyncWatermark;

pub struct WatermarkRepository<'c> {
    conn: &'c mut SqliteConnection,
}

impl<'c> WatermarkRepository<'c> {
    pub fn new(conn: &'c mut SqliteConnection) -> Self {
        Self { conn }
    }

    /// Newest remote change already pulled for `table`
    pub async fn get(&mut self, table: &str) -> Result<Option<DateTime<Utc>>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT last_synced_at FROM sync_watermarks WHERE table_name = ?")
                .bind(table)
                .fetch_optional(&mut *self.conn)
                .await?;

        row.map(|(ts,)| decode_ts(&ts)).transpose()
    }

    /// Move the watermark forward. An older timestamp leaves it unchanged.
    pub async fn advance(&mut self, table: &str, to: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_watermarks (table_name, last_synced_at)
            VALUES (?, ?)
            ON CONFLICT(table_name) DO UPDATE SET
                last_synced_at = MAX(last_synced_at, excluded.last_synced_at)
            "#,
        )
        .bind(table)
        .bind(encode_ts(&to))
        .execute(&mut *self.conn)
        .await?;

        Ok(())
    }

    pub async fn list(&mut self) -> Result<Vec<SyncWatermark>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT table_name, last_synced_at FROM sync_watermarks ORDER BY table_name",
        )
        .fetch_all(&mut *self.conn)
        .await?;

        rows.into_iter()
            .map(|(table, ts)| {
                Ok(SyncWatermark {
                    table,
                    last_synced_at: decode_ts(&ts)?,
                })
            })
            .collect()
    }
}
