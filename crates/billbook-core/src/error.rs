//! # Error Types
//!
//! Domain-specific error types for billbook-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  billbook-core errors (this file)                                      │
//! │  ├── CoreError        - State machine and codec failures               │
//! │  └── ValidationError  - Payload field validation failures              │
//! │                                                                         │
//! │  billbook-db errors                                                    │
//! │  └── DbError          - Local SQLite failures                          │
//! │                                                                         │
//! │  billbook-sync errors                                                  │
//! │  └── SyncError        - Classified transient / permanent               │
//! │                                                                         │
//! │  sync-server errors                                                    │
//! │  └── ServerError      - Serialized as JSON HTTP responses              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

use crate::types::MutationStatus;

// =============================================================================
// Core Error
// =============================================================================

/// Core sync domain errors.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A status change that the queue state machine does not allow.
    ///
    /// ## When This Occurs
    /// - Marking a PENDING record SYNCED without claiming it first
    /// - Touching a record that already reached a terminal state
    #[error("Illegal status transition for {operation_id}: {from} -> {to}")]
    InvalidTransition {
        operation_id: String,
        from: MutationStatus,
        to: MutationStatus,
    },

    /// No codec is registered for the table.
    #[error("Unknown table: {0}")]
    UnknownTable(String),

    /// The payload could not be decoded into the table's document type.
    #[error("Invalid payload for {table}: {reason}")]
    InvalidPayload { table: String, reason: String },

    /// A status or operation string read back from storage is not recognised.
    #[error("Unrecognised {kind}: '{value}'")]
    Unrecognised { kind: &'static str, value: String },

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// Field validation errors for synced documents.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Numeric value is out of range.
    #[error("{field} must be between {min} and {max}")]
    OutOfRange { field: String, min: i64, max: i64 },

    /// Value must be positive.
    #[error("{field} must be positive")]
    MustBePositive { field: String },

    /// Invalid format (e.g., invalid UUID, invalid email).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },

    /// Value is not in allowed set.
    #[error("{field} must be one of: {allowed:?}")]
    NotAllowed { field: String, allowed: Vec<String> },

    /// Two fields that must agree do not.
    #[error("{field} is inconsistent: {reason}")]
    Inconsistent { field: String, reason: String },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_error_message() {
        let err = CoreError::InvalidTransition {
            operation_id: "op-1".to_string(),
            from: MutationStatus::Pending,
            to: MutationStatus::Synced,
        };
        assert_eq!(
            err.to_string(),
            "Illegal status transition for op-1: pending -> synced"
        );
    }

    #[test]
    fn test_validation_error_messages() {
        let err = ValidationError::Required {
            field: "name".to_string(),
        };
        assert_eq!(err.to_string(), "name is required");

        let err = ValidationError::MustBePositive {
            field: "qty".to_string(),
        };
        assert_eq!(err.to_string(), "qty must be positive");
    }

    #[test]
    fn test_validation_converts_to_core_error() {
        let validation_err = ValidationError::Required {
            field: "sku".to_string(),
        };
        let core_err: CoreError = validation_err.into();
        assert!(matches!(core_err, CoreError::Validation(_)));
    }
}
