//! Reference server state

use std::sync::Arc;

use sqlx::SqlitePool;
use tokio::sync::{Mutex, MutexGuard};

/// Shared server state
#[derive(Clone)]
pub struct ServerState {
    inner: Arc<ServerStateInner>,
}

struct ServerStateInner {
    db: SqlitePool,
    api_token: Option<String>,
    writer: Mutex<()>,
}

impl ServerState {
    /// `api_token`: bearer token required on the records API, open access when `None`
    pub fn new(db: SqlitePool, api_token: Option<String>) -> Self {
        Self {
            inner: Arc::new(ServerStateInner {
                db,
                api_token,
                writer: Mutex::new(()),
            }),
        }
    }

    pub fn db(&self) -> &SqlitePool {
        &self.inner.db
    }

    pub fn api_token(&self) -> Option<&str> {
        self.inner.api_token.as_deref()
    }

    /// Serializes writes so update stamps follow commit order
    pub async fn write_lock(&self) -> MutexGuard<'_, ()> {
        self.inner.writer.lock().await
    }
}
