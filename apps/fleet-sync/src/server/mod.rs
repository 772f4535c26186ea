//! Reference remote store server
//!
//! Serves the records API that [`crate::remote::HttpRemoteStore`] talks to,
//! with upsert-by-id writes and server-assigned update timestamps.

mod repository;
mod routes;
mod state;

pub use repository::{initialize_schema, RemoteRecordRepository};
pub use routes::{health_check, records_router, HealthResponse};
pub use state::ServerState;

use std::str::FromStr;

use axum::{routing::get, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::AppResult;
use crate::sync::Fields;

/// Query string of the records listing
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordsQuery {
    /// Exclusive lower bound on `updated_at`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// Body of insert and update requests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpsertRequest {
    pub fields: Fields,
    /// Authorization scope owning the record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// Create the server database pool
pub async fn create_pool(database_url: &str) -> AppResult<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    initialize_schema(&pool).await?;

    Ok(pool)
}

/// Build the full application router
pub fn router(state: ServerState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/api/v1/health", get(health_check))
        .nest("/api/v1/tables", records_router(state.clone()))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
