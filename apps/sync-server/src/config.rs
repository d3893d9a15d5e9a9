//! Sync server configuration.
//!
//! Loaded from environment variables with fallback to defaults.

use billbook_core::MAX_PUSH_BATCH;
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;

/// Sync server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address
    pub bind_addr: String,

    /// SQLite connection string
    pub database_url: String,

    /// Upper bound on rows returned by one pull
    pub pull_page_size: u32,

    /// Upper bound on changes accepted in one push
    pub max_push_batch: usize,

    /// Pool size
    pub max_connections: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_addr: "0.0.0.0:8080".to_string(),
            database_url: "sqlite://billbook-server.db?mode=rwc".to_string(),
            pull_page_size: 500,
            max_push_batch: MAX_PUSH_BATCH,
            max_connections: 8,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let defaults = ServerConfig::default();

        let config = ServerConfig {
            bind_addr: env::var("BILLBOOK_BIND_ADDR").unwrap_or(defaults.bind_addr),
            database_url: env::var("BILLBOOK_DATABASE_URL").unwrap_or(defaults.database_url),
            pull_page_size: parse_var("BILLBOOK_PULL_PAGE_SIZE", defaults.pull_page_size)?,
            max_push_batch: parse_var("BILLBOOK_MAX_PUSH_BATCH", defaults.max_push_batch)?,
            max_connections: parse_var("BILLBOOK_DB_MAX_CONNECTIONS", defaults.max_connections)?,
        };

        if config.pull_page_size == 0 {
            return Err(ConfigError::InvalidValue("BILLBOOK_PULL_PAGE_SIZE".to_string()));
        }
        if config.max_push_batch == 0 {
            return Err(ConfigError::InvalidValue("BILLBOOK_MAX_PUSH_BATCH".to_string()));
        }

        Ok(config)
    }

    /// In-memory store, for tests.
    pub fn in_memory() -> Self {
        ServerConfig {
            database_url: "sqlite::memory:".to_string(),
            max_connections: 1,
            ..Default::default()
        }
    }
}

fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::InvalidValue(name.to_string())),
        Err(_) => Ok(default),
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}")]
    InvalidValue(String),
}
