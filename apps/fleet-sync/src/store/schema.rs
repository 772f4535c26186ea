//! Local store schema initialization

use sqlx::SqlitePool;

use crate::error::Result;

/// Initialize the local store schema
pub async fn initialize_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(SCHEMA_SQL).execute(pool).await?;

    Ok(())
}

const SCHEMA_SQL: &str = r#"
-- One row per domain record plus its sync metadata
CREATE TABLE IF NOT EXISTS local_records (
    table_name TEXT NOT NULL,
    id TEXT NOT NULL,
    fields TEXT NOT NULL,
    sync_status TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    -- Tombstone for a delete that is not acknowledged yet
    deleted INTEGER NOT NULL DEFAULT 0,

    PRIMARY KEY (table_name, id)
);

CREATE INDEX IF NOT EXISTS idx_local_records_status ON local_records(table_name, sync_status);
CREATE INDEX IF NOT EXISTS idx_local_records_updated ON local_records(updated_at);

-- Pending change log, replayed in seq order
CREATE TABLE IF NOT EXISTS pending_changes (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    table_name TEXT NOT NULL,
    record_id TEXT NOT NULL,
    operation TEXT NOT NULL,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    failure_kind TEXT
);

CREATE INDEX IF NOT EXISTS idx_pending_table ON pending_changes(table_name, seq);
CREATE INDEX IF NOT EXISTS idx_pending_record ON pending_changes(table_name, record_id);

-- Conflicts awaiting resolution (resolved rows are kept until cleanup)
CREATE TABLE IF NOT EXISTS conflicts (
    id TEXT PRIMARY KEY,
    table_name TEXT NOT NULL,
    record_id TEXT NOT NULL,
    local_snapshot TEXT,
    remote_snapshot TEXT,
    remote_updated_at TEXT NOT NULL,
    kind TEXT NOT NULL,
    detected_at TEXT NOT NULL,
    resolved INTEGER NOT NULL DEFAULT 0,
    resolved_at TEXT,
    resolution TEXT
);

CREATE INDEX IF NOT EXISTS idx_conflicts_record ON conflicts(table_name, record_id, resolved);
CREATE INDEX IF NOT EXISTS idx_conflicts_detected ON conflicts(detected_at);

-- Newest remote change already pulled, per table
CREATE TABLE IF NOT EXISTS sync_watermarks (
    table_name TEXT PRIMARY KEY,
    last_synced_at TEXT NOT NULL
);
"#;
