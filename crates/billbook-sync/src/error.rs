//! # Sync Error Types
//!
//! Error types for the client sync engine.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Transport     │  │     Server Verdict      │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Connection     │  │  Rejected(reason)       │ │
//! │  │  MissingDeviceId│  │  Timeout        │  │  ServerError(5xx)       │ │
//! │  │  InvalidUrl     │  │  InvalidResponse│  │  ClientError(4xx)       │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │    Database     │  │    Payload      │  │      Internal           │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  DatabaseError  │  │  InvalidPayload │  │  ShuttingDown           │ │
//! │  │                 │  │  Serialization  │  │  ChannelError           │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Failure Classes
//! Every error that can end a push attempt is either transient (the record
//! goes to RETRY) or permanent (straight to the dead-letter store, no retries
//! consumed). See [`SyncError::classify`].

use billbook_core::{ConflictReason, CoreError};
use thiserror::Error;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// How the dispatcher treats a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Worth retrying after a backoff.
    Transient,
    /// Retrying can never succeed.
    Permanent,
}

#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// Missing device ID (required for provenance).
    #[error("Device ID not configured. Run initial setup first.")]
    MissingDeviceId,

    #[error("Invalid server URL: {0}")]
    InvalidUrl(String),

    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Transport Errors
    // =========================================================================
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// 5xx from the server.
    #[error("Server error {status}: {message}")]
    ServerError { status: u16, message: String },

    /// 4xx from the server. The request itself was refused.
    #[error("Request rejected with {status}: {message}")]
    ClientError { status: u16, message: String },

    /// The server answered with a body we could not interpret.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    // =========================================================================
    // Server Verdicts
    // =========================================================================
    /// The server refused one change.
    #[error("Change rejected ({reason}): {message}")]
    Rejected {
        reason: ConflictReason,
        message: String,
    },

    // =========================================================================
    // Payload Errors
    // =========================================================================
    /// A local write did not pass its table codec.
    #[error("Invalid payload: {0}")]
    InvalidPayload(#[from] CoreError),

    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    // =========================================================================
    // Database Errors
    // =========================================================================
    #[error("Database error: {0}")]
    DatabaseError(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Sync engine is shutting down")]
    ShuttingDown,

    #[error("Channel error: {0}")]
    ChannelError(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<billbook_db::DbError> for SyncError {
    fn from(err: billbook_db::DbError) -> Self {
        match err {
            billbook_db::DbError::Core(core) => SyncError::InvalidPayload(core),
            billbook_db::DbError::NotFound { entity, id } => {
                SyncError::NotFound(format!("{entity} {id}"))
            }
            other => SyncError::DatabaseError(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SyncError::Timeout(0)
        } else if err.is_decode() {
            SyncError::InvalidResponse(err.to_string())
        } else if let Some(status) = err.status() {
            status_error(status.as_u16(), err.to_string())
        } else {
            SyncError::ConnectionFailed(err.to_string())
        }
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(err: sqlx::Error) -> Self {
        SyncError::DatabaseError(err.to_string())
    }
}

/// Error for a non-success HTTP status.
pub fn status_error(status: u16, message: impl Into<String>) -> SyncError {
    let message = message.into();
    if status >= 500 {
        SyncError::ServerError { status, message }
    } else {
        SyncError::ClientError { status, message }
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl SyncError {
    /// Transient or permanent, for one failed push attempt.
    ///
    /// ## Transient
    /// - Connection failures and timeouts
    /// - 5xx, 408 and 429 responses
    /// - Unreadable responses and local database hiccups
    ///
    /// ## Permanent
    /// - Server rejections (duplicate, not found, validation, unknown table)
    /// - Any other 4xx
    /// - Payloads that fail their codec
    pub fn classify(&self) -> FailureClass {
        match self {
            SyncError::ConnectionFailed(_)
            | SyncError::Timeout(_)
            | SyncError::ServerError { .. }
            | SyncError::InvalidResponse(_)
            | SyncError::DatabaseError(_)
            | SyncError::ChannelError(_) => FailureClass::Transient,
            SyncError::ClientError { status, .. } if *status == 408 || *status == 429 => {
                FailureClass::Transient
            }
            SyncError::Rejected { reason, .. } if !reason.is_permanent() => {
                FailureClass::Transient
            }
            _ => FailureClass::Permanent,
        }
    }

    /// Returns true if the attempt can be retried.
    pub fn is_retryable(&self) -> bool {
        self.classify() == FailureClass::Transient
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::MissingDeviceId
                | SyncError::InvalidUrl(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        assert!(SyncError::ConnectionFailed("refused".into()).is_retryable());
        assert!(SyncError::Timeout(15).is_retryable());
        assert!(status_error(503, "unavailable").is_retryable());
        assert!(status_error(429, "slow down").is_retryable());
    }

    #[test]
    fn test_permanent_errors() {
        for reason in [
            ConflictReason::Duplicate,
            ConflictReason::NotFound,
            ConflictReason::Validation,
            ConflictReason::UnknownTable,
        ] {
            let err = SyncError::Rejected {
                reason,
                message: String::new(),
            };
            assert_eq!(err.classify(), FailureClass::Permanent, "{reason}");
        }
        assert_eq!(status_error(400, "bad").classify(), FailureClass::Permanent);
        assert!(!SyncError::InvalidConfig("bad".into()).is_retryable());
    }

    #[test]
    fn test_config_errors() {
        assert!(SyncError::MissingDeviceId.is_config_error());
        assert!(!SyncError::Timeout(1).is_config_error());
    }

    #[test]
    fn test_db_not_found_maps_to_not_found() {
        let err: SyncError = billbook_db::DbError::not_found("DeadLetter", "dl-1").into();
        assert!(matches!(err, SyncError::NotFound(_)));
    }
}
