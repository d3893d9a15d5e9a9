//! # Sync Configuration
//!
//! Configuration for the client sync engine.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     BILLBOOK_SERVER_URL=https://sync.example.com                       │
//! │     BILLBOOK_DEVICE_ID=abc-123                                         │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/billbook-sync/sync.toml (Linux)                          │
//! │     ~/Library/Application Support/com.billbook.sync/sync.toml (macOS)  │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     localhost server, auto-generated device id                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # sync.toml
//! [device]
//! id = "550e8400-e29b-41d4-a716-446655440000"
//! owner_id = "biz-42"
//! user_id = "cashier-1"
//!
//! [server]
//! base_url = "https://sync.example.com"
//! request_timeout_secs = 15
//!
//! [dispatch]
//! batch_size = 50
//! worker_pool = 4
//!
//! [retry]
//! max_attempts = 5
//! jitter = 0.25
//! ```

use billbook_core::Provenance;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};
use crate::retry::RetryPolicy;

// =============================================================================
// Device Configuration
// =============================================================================

/// Who this device is. Stamped onto every queued mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Unique device identifier (UUID v4).
    /// Auto-generated on first run if not provided.
    #[serde(default = "generate_device_id")]
    pub id: String,

    /// Tenant (business) the device belongs to.
    #[serde(default = "default_owner_id")]
    pub owner_id: String,

    /// Signed-in user.
    #[serde(default = "default_user_id")]
    pub user_id: String,
}

fn generate_device_id() -> String {
    Uuid::new_v4().to_string()
}

fn default_owner_id() -> String {
    "default-business".to_string()
}

fn default_user_id() -> String {
    "local-user".to_string()
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            id: generate_device_id(),
            owner_id: default_owner_id(),
            user_id: default_user_id(),
        }
    }
}

// =============================================================================
// Server Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Base URL of the reconciliation server (no trailing `/sync`).
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Upper bound for one push or pull request. Expiry counts as transient.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_base_url() -> String {
    "http://localhost:8080".to_string()
}
fn default_request_timeout() -> u64 {
    15
}

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings {
            base_url: default_base_url(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

// =============================================================================
// Dispatch Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchSettings {
    /// Records claimed per round.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Concurrent pushes in flight.
    #[serde(default = "default_worker_pool")]
    pub worker_pool: usize,

    /// Rounds per cycle before yielding back to the timer.
    #[serde(default = "default_max_rounds")]
    pub max_rounds_per_cycle: u32,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_pull_interval")]
    pub pull_interval_secs: u64,

    /// How long SYNCED records stay in the queue before being purged.
    #[serde(default = "default_retention")]
    pub synced_retention_hours: u64,

    /// Page size requested from the pull endpoint.
    #[serde(default = "default_pull_page_size")]
    pub pull_page_size: u32,
}

fn default_batch_size() -> u32 {
    50
}
fn default_worker_pool() -> usize {
    4
}
fn default_max_rounds() -> u32 {
    20
}
fn default_poll_interval() -> u64 {
    30
}
fn default_pull_interval() -> u64 {
    60
}
fn default_retention() -> u64 {
    24
}
fn default_pull_page_size() -> u32 {
    500
}

impl Default for DispatchSettings {
    fn default() -> Self {
        DispatchSettings {
            batch_size: default_batch_size(),
            worker_pool: default_worker_pool(),
            max_rounds_per_cycle: default_max_rounds(),
            poll_interval_secs: default_poll_interval(),
            pull_interval_secs: default_pull_interval(),
            synced_retention_hours: default_retention(),
            pull_page_size: default_pull_page_size(),
        }
    }
}

// =============================================================================
// Retry Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Attempts allowed in total, the first one included, before a record
    /// is dead-lettered.
    #[serde(default = "default_max_attempts", alias = "max_retries")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Randomization factor, `0.25` means ±25 %.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_max_attempts() -> u32 {
    billbook_core::DEFAULT_MAX_ATTEMPTS
}
fn default_initial_backoff() -> u64 {
    1000
}
fn default_max_backoff() -> u64 {
    300
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_jitter() -> f64 {
    0.25
}

impl Default for RetrySettings {
    fn default() -> Self {
        RetrySettings {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

// =============================================================================
// Channel Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSettings {
    /// Attempt events buffered per subscriber. Slow subscribers skip ahead.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_event_buffer() -> usize {
    256
}

impl Default for ChannelSettings {
    fn default() -> Self {
        ChannelSettings {
            event_buffer: default_event_buffer(),
        }
    }
}

// =============================================================================
// Main Sync Configuration
// =============================================================================

/// Complete client sync configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub device: DeviceConfig,

    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub dispatch: DispatchSettings,

    #[serde(default)]
    pub retry: RetrySettings,

    #[serde(default)]
    pub channels: ChannelSettings,
}

impl SyncConfig {
    /// Creates a new config with defaults and a generated device ID.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (sync.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading sync config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load sync config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Sync config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.device.id.is_empty() {
            return Err(SyncError::MissingDeviceId);
        }

        if self.device.owner_id.is_empty() {
            return Err(SyncError::InvalidConfig("device.owner_id must be set".into()));
        }

        let url = &self.server.base_url;
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(SyncError::InvalidUrl(format!(
                "Server URL must start with http:// or https://, got: {}",
                url
            )));
        }

        if self.dispatch.batch_size == 0 {
            return Err(SyncError::InvalidConfig(
                "batch_size must be greater than 0".into(),
            ));
        }

        if self.dispatch.worker_pool == 0 {
            return Err(SyncError::InvalidConfig(
                "worker_pool must be greater than 0".into(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(SyncError::InvalidConfig("max_attempts must be at least 1".into()));
        }

        if !(0.0..1.0).contains(&self.retry.jitter) {
            return Err(SyncError::InvalidConfig(format!(
                "jitter must be in [0, 1), got {}",
                self.retry.jitter
            )));
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(id) = std::env::var("BILLBOOK_DEVICE_ID") {
            debug!(device_id = %id, "Overriding device ID from environment");
            self.device.id = id;
        }

        if let Ok(owner) = std::env::var("BILLBOOK_OWNER_ID") {
            self.device.owner_id = owner;
        }

        if let Ok(user) = std::env::var("BILLBOOK_USER_ID") {
            self.device.user_id = user;
        }

        if let Ok(url) = std::env::var("BILLBOOK_SERVER_URL") {
            debug!(url = %url, "Overriding server URL from environment");
            self.server.base_url = url;
        }

        if let Ok(value) = std::env::var("BILLBOOK_BATCH_SIZE") {
            match value.parse::<u32>() {
                Ok(n) => self.dispatch.batch_size = n,
                Err(_) => warn!(value = %value, "Ignoring invalid BILLBOOK_BATCH_SIZE"),
            }
        }

        if let Ok(value) = std::env::var("BILLBOOK_MAX_ATTEMPTS") {
            match value.parse::<u32>() {
                Ok(n) => self.retry.max_attempts = n,
                Err(_) => warn!(value = %value, "Ignoring invalid BILLBOOK_MAX_ATTEMPTS"),
            }
        }
    }

    /// Returns the default config file path.
    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "billbook", "sync")
            .map(|dirs| dirs.config_dir().join("sync.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    pub fn device_id(&self) -> &str {
        &self.device.id
    }

    pub fn owner_id(&self) -> &str {
        &self.device.owner_id
    }

    /// Provenance stamped on every mutation enqueued by this device.
    pub fn provenance(&self) -> Provenance {
        Provenance {
            owner_id: self.device.owner_id.clone(),
            user_id: self.device.user_id.clone(),
            device_id: self.device.id.clone(),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.dispatch.poll_interval_secs)
    }

    pub fn pull_interval(&self) -> Duration {
        Duration::from_secs(self.dispatch.pull_interval_secs)
    }

    pub fn synced_retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.dispatch.synced_retention_hours as i64)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from_settings(&self.retry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert!(!config.device.id.is_empty());
        assert_eq!(config.server.base_url, "http://localhost:8080");
        assert_eq!(config.dispatch.batch_size, 50);
        assert_eq!(config.dispatch.worker_pool, 4);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.channels.event_buffer, 256);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = SyncConfig::default();

        config.device.id = String::new();
        assert!(matches!(config.validate(), Err(SyncError::MissingDeviceId)));

        config.device.id = "dev".to_string();
        config.server.base_url = "ws://nope".to_string();
        assert!(matches!(config.validate(), Err(SyncError::InvalidUrl(_))));

        config.server.base_url = "https://sync.example.com".to_string();
        assert!(config.validate().is_ok());

        config.retry.jitter = 1.0;
        assert!(config.validate().is_err());

        config.retry.jitter = 0.0;
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());

        config.retry.max_attempts = 1;
        config.dispatch.worker_pool = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: SyncConfig = toml::from_str(
            r#"
            [device]
            id = "dev-9"
            owner_id = "biz-42"

            [retry]
            max_attempts = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.device.id, "dev-9");
        assert_eq!(config.device.user_id, "local-user");
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.initial_backoff_ms, 1000);
        assert_eq!(config.dispatch.poll_interval_secs, 30);
    }

    #[test]
    fn test_legacy_max_retries_key() {
        let config: SyncConfig = toml::from_str(
            r#"
            [retry]
            max_retries = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.retry.max_attempts, 2);
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("sync.toml");

        let mut config = SyncConfig::default();
        config.device.owner_id = "biz-7".to_string();
        config.dispatch.batch_size = 10;
        config.save(Some(path.clone())).unwrap();

        let loaded = SyncConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.device.id, config.device.id);
        assert_eq!(loaded.owner_id(), "biz-7");
        assert_eq!(loaded.dispatch.batch_size, 10);
    }

    #[test]
    fn test_provenance() {
        let config = SyncConfig::default();
        let provenance = config.provenance();
        assert_eq!(provenance.device_id, config.device.id);
        assert_eq!(provenance.owner_id, "default-business");
    }
}
