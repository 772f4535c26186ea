//! Configuration management for Fleet Sync

use serde::Deserialize;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub local: LocalStoreConfig,
    pub remote: RemoteConfig,
    pub sync: SyncConfig,
}

/// Reference remote store server settings
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Bearer token clients must present; open access when unset
    pub api_token: Option<String>,
}

/// Server-side database holding the authoritative records
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

/// Device-local store
#[derive(Debug, Clone, Deserialize)]
pub struct LocalStoreConfig {
    pub url: String,
}

/// How the engine reaches the remote store
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    pub base_url: String,
    pub auth_token: Option<String>,
    pub timeout_secs: u64,
}

impl RemoteConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Sync engine tuning
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Domain tables synchronized by a full cycle
    pub tables: Vec<String>,
    /// Authorization boundary passed to delta queries
    pub scope: Option<String>,
    /// Deadline applied to every remote call
    pub request_timeout_secs: u64,
    /// Background scheduler period
    pub interval_secs: u64,
    /// Validation failures tolerated before a change is parked
    pub max_validation_retries: u32,
    /// Age after which synced records may be evicted when storage is full
    pub stale_record_retention_days: i64,
}

/// Upper bound on the stale record retention (a century)
pub const MAX_RETENTION_DAYS: i64 = 36_500;

impl SyncConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Retention clamped to `0..=MAX_RETENTION_DAYS`
    pub fn stale_record_retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.stale_record_retention_days.clamp(0, MAX_RETENTION_DAYS))
    }

    pub fn with_tables<I, S>(tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tables: tables.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            tables: Vec::new(),
            scope: None,
            request_timeout_secs: 30,
            interval_secs: 300,
            max_validation_retries: 3,
            stale_record_retention_days: 30,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 3000,
                api_token: None,
            },
            database: DatabaseConfig {
                url: "sqlite:./fleet-remote.db".to_string(),
            },
            local: LocalStoreConfig {
                url: "sqlite:./fleet-local.db".to_string(),
            },
            remote: RemoteConfig {
                base_url: "http://localhost:3000".to_string(),
                auth_token: None,
                timeout_secs: 30,
            },
            sync: SyncConfig::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, env::VarError> {
        let defaults = Config::default();

        Ok(Config {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or(defaults.server.host),
                port: parse_var("SERVER_PORT", defaults.server.port),
                api_token: env::var("REMOTE_API_TOKEN").ok(),
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").unwrap_or(defaults.database.url),
            },
            local: LocalStoreConfig {
                url: env::var("LOCAL_DATABASE_URL").unwrap_or(defaults.local.url),
            },
            remote: RemoteConfig {
                base_url: env::var("REMOTE_BASE_URL").unwrap_or(defaults.remote.base_url),
                auth_token: env::var("REMOTE_AUTH_TOKEN").ok(),
                timeout_secs: parse_var("REMOTE_TIMEOUT_SECS", defaults.remote.timeout_secs),
            },
            sync: SyncConfig {
                tables: env::var("SYNC_TABLES")
                    .map(|v| parse_tables(&v))
                    .unwrap_or_default(),
                scope: env::var("REMOTE_SCOPE").ok(),
                request_timeout_secs: parse_var(
                    "REMOTE_TIMEOUT_SECS",
                    defaults.sync.request_timeout_secs,
                ),
                interval_secs: parse_var("SYNC_INTERVAL_SECS", defaults.sync.interval_secs),
                max_validation_retries: parse_var(
                    "SYNC_MAX_VALIDATION_RETRIES",
                    defaults.sync.max_validation_retries,
                ),
                stale_record_retention_days: parse_var(
                    "SYNC_STALE_RETENTION_DAYS",
                    defaults.sync.stale_record_retention_days,
                ),
            },
        })
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_tables(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}
