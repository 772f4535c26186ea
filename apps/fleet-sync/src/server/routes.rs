//! Records API and health endpoints

use axum::{
    extract::{Path, Query, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::Response,
    routing::get,
    Json, Router,
};
use serde::Serialize;

use super::repository::RemoteRecordRepository;
use super::state::ServerState;
use super::{RecordsQuery, UpsertRequest};
use crate::error::{AppError, AppResult};
use crate::remote::RemoteRecord;
use crate::sync::Fields;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub service: &'static str,
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        service: "fleet-sync-server",
    })
}

/// Create the records router, mounted under `/api/v1/tables`
pub fn records_router(state: ServerState) -> Router<ServerState> {
    Router::new()
        .route("/:table/records", get(list_records))
        .route(
            "/:table/records/:id",
            get(get_record)
                .post(insert_record)
                .put(update_record)
                .delete(delete_record),
        )
        .route_layer(middleware::from_fn_with_state(state, require_token))
}

/// Reject requests without the configured bearer token
async fn require_token(State(state): State<ServerState>, request: Request, next: Next) -> AppResult<Response> {
    if let Some(expected) = state.api_token() {
        let presented = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "));

        if presented != Some(expected) {
            return Err(AppError::Unauthorized);
        }
    }

    Ok(next.run(request).await)
}

/// Table names are plain identifiers
fn validate_table(table: &str) -> AppResult<()> {
    let valid = !table.is_empty()
        && table.len() <= 64
        && table
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');

    if valid {
        Ok(())
    } else {
        Err(AppError::BadRequest(format!("Invalid table name: {:?}", table)))
    }
}

/// List records changed since a timestamp
async fn list_records(
    State(state): State<ServerState>,
    Path(table): Path<String>,
    Query(query): Query<RecordsQuery>,
) -> AppResult<Json<Vec<RemoteRecord>>> {
    validate_table(&table)?;

    let mut conn = state.db().acquire().await?;
    let records = RemoteRecordRepository::new(&mut *conn)
        .list_since(&table, query.since, query.scope.as_deref())
        .await?;

    Ok(Json(records))
}

async fn get_record(
    State(state): State<ServerState>,
    Path((table, id)): Path<(String, String)>,
) -> AppResult<Json<RemoteRecord>> {
    validate_table(&table)?;

    let mut conn = state.db().acquire().await?;
    let record = RemoteRecordRepository::new(&mut *conn)
        .get(&table, &id)
        .await?
        .filter(|record| !record.deleted)
        .ok_or_else(|| AppError::NotFound(format!("Record not found: {}/{}", table, id)))?;

    Ok(Json(record))
}

/// Create a record (upsert by id)
async fn insert_record(
    State(state): State<ServerState>,
    Path((table, id)): Path<(String, String)>,
    Json(body): Json<UpsertRequest>,
) -> AppResult<(StatusCode, Json<RemoteRecord>)> {
    let record = write_record(&state, &table, &id, &body.fields, body.scope.as_deref()).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

/// Replace a record's fields (upsert by id)
async fn update_record(
    State(state): State<ServerState>,
    Path((table, id)): Path<(String, String)>,
    Json(body): Json<UpsertRequest>,
) -> AppResult<Json<RemoteRecord>> {
    let record = write_record(&state, &table, &id, &body.fields, body.scope.as_deref()).await?;
    Ok(Json(record))
}

/// Delete a record, leaving a tombstone for delta queries
async fn delete_record(
    State(state): State<ServerState>,
    Path((table, id)): Path<(String, String)>,
) -> AppResult<StatusCode> {
    validate_table(&table)?;

    let _guard = state.write_lock().await;
    let mut tx = state.db().begin().await?;

    let live = RemoteRecordRepository::new(&mut *tx)
        .get(&table, &id)
        .await?
        .is_some_and(|record| !record.deleted);
    if live {
        RemoteRecordRepository::new(&mut *tx)
            .write(&table, &id, &Fields::new(), None, true)
            .await?;
        tracing::debug!("Deleted {}/{}", table, id);
    }

    tx.commit().await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn write_record(
    state: &ServerState,
    table: &str,
    id: &str,
    fields: &Fields,
    scope: Option<&str>,
) -> AppResult<RemoteRecord> {
    validate_table(table)?;
    if id.is_empty() {
        return Err(AppError::BadRequest("Record id must not be empty".to_string()));
    }

    let _guard = state.write_lock().await;
    let mut tx = state.db().begin().await?;
    let record = RemoteRecordRepository::new(&mut *tx)
        .write(table, id, fields, scope, false)
        .await?;
    tx.commit().await?;

    tracing::debug!("Wrote {}/{} at {}", table, id, record.updated_at);
    Ok(record)
}
