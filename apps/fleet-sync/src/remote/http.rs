//! HTTP remote store client
//!
//! Talks JSON to the records API served by [`crate::server`]:
//!
//! - `GET    /api/v1/tables/{table}/records?since=&scope=`
//! - `GET    /api/v1/tables/{table}/records/{id}`
//! - `POST   /api/v1/tables/{table}/records/{id}`
//! - `PUT    /api/v1/tables/{table}/records/{id}`
//! - `DELETE /api/v1/tables/{table}/records/{id}`

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Method, RequestBuilder, Response, StatusCode, Url};

use super::{RemoteRecord, RemoteStore};
use crate::config::RemoteConfig;
use crate::error::RemoteError;
use crate::server::{RecordsQuery, UpsertRequest};
use crate::sync::Fields;

/// Remote store reached over HTTP
#[derive(Clone)]
pub struct HttpRemoteStore {
    client: reqwest::Client,
    base_url: Url,
    auth_token: Option<String>,
    scope: Option<String>,
    timeout: Duration,
}

impl HttpRemoteStore {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, RemoteError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| RemoteError::Validation(format!("Invalid base URL {}: {}", base_url, e)))?;

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Network(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url,
            auth_token: None,
            scope: None,
            timeout,
        })
    }

    pub fn from_config(config: &RemoteConfig, scope: Option<&str>) -> Result<Self, RemoteError> {
        let mut store = Self::new(&config.base_url, config.timeout())?;
        store.auth_token = config.auth_token.clone();
        store.scope = scope.map(str::to_string);
        Ok(store)
    }

    pub fn with_auth_token(mut self, token: &str) -> Self {
        self.auth_token = Some(token.to_string());
        self
    }

    /// Scope stamped on records this client writes
    pub fn with_scope(mut self, scope: &str) -> Self {
        self.scope = Some(scope.to_string());
        self
    }

    fn records_url(&self, table: &str, id: Option<&str>) -> Result<Url, RemoteError> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| RemoteError::Validation("Base URL cannot be a base".to_string()))?;
            segments
                .pop_if_empty()
                .extend(["api", "v1", "tables", table, "records"]);
            if let Some(id) = id {
                segments.push(id);
            }
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.auth_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, RemoteError> {
        let response = builder.send().await.map_err(|e| self.transport_error(e))?;
        check_status(response).await
    }

    fn transport_error(&self, err: reqwest::Error) -> RemoteError {
        if err.is_timeout() {
            RemoteError::Timeout(self.timeout)
        } else {
            RemoteError::Network(err.to_string())
        }
    }

    async fn upsert(&self, method: Method, table: &str, id: &str, payload: &Fields) -> Result<(), RemoteError> {
        let url = self.records_url(table, Some(id))?;
        let body = UpsertRequest {
            fields: payload.clone(),
            scope: self.scope.clone(),
        };

        self.send(self.request(method, url).json(&body)).await?;
        Ok(())
    }
}

/// Map a non-success status onto the error taxonomy
async fn check_status(response: Response) -> Result<Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = format!("{}: {}", status, body);

    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RemoteError::AuthExpired,
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => RemoteError::Network(message),
        s if s.is_server_error() => RemoteError::Network(message),
        _ => RemoteError::Validation(message),
    })
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn insert(&self, table: &str, id: &str, payload: &Fields) -> Result<(), RemoteError> {
        self.upsert(Method::POST, table, id, payload).await
    }

    async fn update(&self, table: &str, id: &str, payload: &Fields) -> Result<(), RemoteError> {
        self.upsert(Method::PUT, table, id, payload).await
    }

    async fn delete(&self, table: &str, id: &str) -> Result<(), RemoteError> {
        let url = self.records_url(table, Some(id))?;
        self.send(self.request(Method::DELETE, url)).await?;
        Ok(())
    }

    async fn fetch(&self, table: &str, id: &str) -> Result<Option<RemoteRecord>, RemoteError> {
        let url = self.records_url(table, Some(id))?;
        let response = self
            .request(Method::GET, url)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        // Missing and deleted records both answer 404
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        check_status(response)
            .await?
            .json::<RemoteRecord>()
            .await
            .map(Some)
            .map_err(|e| RemoteError::Network(format!("Invalid record response: {}", e)))
    }

    async fn query_updated_since(
        &self,
        table: &str,
        since: Option<DateTime<Utc>>,
        scope: Option<&str>,
    ) -> Result<Vec<RemoteRecord>, RemoteError> {
        let url = self.records_url(table, None)?;
        let query = RecordsQuery {
            since,
            scope: scope.map(str::to_string),
        };

        let response = self.send(self.request(Method::GET, url).query(&query)).await?;

        response
            .json::<Vec<RemoteRecord>>()
            .await
            .map_err(|e| RemoteError::Network(format!("Invalid records response: {}", e)))
    }
}
