//! Error types for the sync engine and the reference remote store server

use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Engine-wide result type
pub type Result<T> = std::result::Result<T, SyncError>;

/// SQLite primary result code for a full database or disk
const SQLITE_FULL: &str = "13";

/// Failure taxonomy shared by reports, pending changes and the status indicator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Retry on the next cycle, nothing is lost
    TransientNetwork,
    /// The remote store rejected the payload
    RemoteValidation,
    /// Not a failure: a conflict awaits resolution
    ConflictDetected,
    /// Local database is out of space
    LocalStorageFull,
    /// Credentials must be refreshed before syncing again
    AuthExpired,
    /// The operation was cancelled by the host
    Cancelled,
    /// Anything else (local database errors, corrupt rows)
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::TransientNetwork => "transient_network",
            ErrorKind::RemoteValidation => "remote_validation",
            ErrorKind::ConflictDetected => "conflict_detected",
            ErrorKind::LocalStorageFull => "local_storage_full",
            ErrorKind::AuthExpired => "auth_expired",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "transient_network" => Some(ErrorKind::TransientNetwork),
            "remote_validation" => Some(ErrorKind::RemoteValidation),
            "conflict_detected" => Some(ErrorKind::ConflictDetected),
            "local_storage_full" => Some(ErrorKind::LocalStorageFull),
            "auth_expired" => Some(ErrorKind::AuthExpired),
            "cancelled" => Some(ErrorKind::Cancelled),
            "internal" => Some(ErrorKind::Internal),
            _ => None,
        }
    }
}

/// Errors raised at the remote store boundary
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Remote rejected payload: {0}")]
    Validation(String),

    #[error("Authorization expired")]
    AuthExpired,

    #[error("Request cancelled")]
    Cancelled,
}

impl RemoteError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RemoteError::Network(_) | RemoteError::Timeout(_) => ErrorKind::TransientNetwork,
            RemoteError::Validation(_) => ErrorKind::RemoteValidation,
            RemoteError::AuthExpired => ErrorKind::AuthExpired,
            RemoteError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether the same request may succeed unchanged on a later cycle
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::TransientNetwork
    }
}

/// Sync engine error type
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Remote error: {0}")]
    Remote(RemoteError),

    #[error("Authorization expired, sync cycle aborted")]
    AuthExpired,

    #[error("Local storage is full")]
    StorageFull,

    #[error("A sync cycle is already in progress")]
    SyncInProgress,

    #[error("Sync cancelled")]
    Cancelled,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Record {table}/{id} has an unresolved conflict")]
    RecordConflicted { table: String, id: String },

    #[error("Corrupt row: {0}")]
    CorruptRow(String),

    #[error("WAL checkpoint blocked by a reader ({checkpointed} of {log} frames written)")]
    CheckpointBusy { log: i64, checkpointed: i64 },

    #[error("Database error: {0}")]
    Database(sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Remote(e) => e.kind(),
            SyncError::AuthExpired => ErrorKind::AuthExpired,
            SyncError::StorageFull => ErrorKind::LocalStorageFull,
            SyncError::Cancelled => ErrorKind::Cancelled,
            SyncError::RecordConflicted { .. } => ErrorKind::ConflictDetected,
            _ => ErrorKind::Internal,
        }
    }

    /// Errors that abort the whole cycle rather than one table or record
    pub fn is_cycle_fatal(&self) -> bool {
        matches!(self, SyncError::AuthExpired | SyncError::StorageFull)
    }
}

impl From<RemoteError> for SyncError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::AuthExpired => SyncError::AuthExpired,
            RemoteError::Cancelled => SyncError::Cancelled,
            other => SyncError::Remote(other),
        }
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(err: sqlx::Error) -> Self {
        if is_storage_full(&err) {
            SyncError::StorageFull
        } else {
            SyncError::Database(err)
        }
    }
}

fn is_storage_full(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            db.code().as_deref() == Some(SQLITE_FULL)
                || db.message().contains("database or disk is full")
        }
        _ => false,
    }
}

/// Server application error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Server result type
pub type AppResult<T> = std::result::Result<T, AppError>;

/// Error response body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone()),
            AppError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "Missing or invalid bearer token".to_string(),
            ),
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "An internal error occurred".to_string(),
                )
            }
            AppError::Database(e) => {
                tracing::error!("Database error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "database_error",
                    "Database error".to_string(),
                )
            }
            AppError::Serialization(e) => {
                tracing::error!("Serialization error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "serialization_error",
                    "Failed to encode record".to_string(),
                )
            }
        };

        let body = Json(ErrorResponse {
            error: error_type.to_string(),
            message,
            details: if cfg!(debug_assertions) {
                Some(self.to_string())
            } else {
                None
            },
        });

        (status, body).into_response()
    }
}
