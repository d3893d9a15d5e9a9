//! # Validation Module
//!
//! Field validators shared by the client (before a mutation is enqueued) and
//! the server (before a change is applied).
//!
//! ## Validation Strategy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Validation Layers                                  │
//! │                                                                         │
//! │  Layer 1: enqueue (client)                                             │
//! │  ├── Codec decodes payload into the table's document type              │
//! │  └── THIS MODULE: field rules                                          │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: push (server)                                                │
//! │  ├── Same codec, same rules, on the merged document                    │
//! │  └── Rejected with reason "validation" (permanent, no retries)         │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 3: SQLite constraints                                           │
//! │  └── NOT NULL / CHECK / PRIMARY KEY                                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use billbook_core::validation::{validate_name, validate_quantity};
//!
//! validate_name("name", "Masala Tea", 200).unwrap();
//! assert!(validate_quantity("qty", 0).is_err());
//! ```

use crate::error::ValidationError;

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Longest identifier accepted for documents, tables and operations.
pub const MAX_ID_LEN: usize = 128;

// =============================================================================
// String Validators
// =============================================================================

/// Validates a required display name.
///
/// ## Rules
/// - Must not be empty after trimming
/// - Must be at most `max` characters
pub fn validate_name(field: &str, value: &str, max: usize) -> ValidationResult<()> {
    let value = value.trim();

    if value.is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }

    if value.chars().count() > max {
        return Err(ValidationError::TooLong {
            field: field.to_string(),
            max,
        });
    }

    Ok(())
}

/// Validates an identifier such as a document id or table name.
///
/// ## Rules
/// - Non-empty, at most [`MAX_ID_LEN`] characters
/// - Letters, digits, `-`, `_` and `.` only
///
/// ## Example
/// ```rust
/// use billbook_core::validation::validate_identifier;
///
/// assert!(validate_identifier("id", "bill-0042").is_ok());
/// assert!(validate_identifier("id", "has space").is_err());
/// ```
pub fn validate_identifier(field: &str, value: &str) -> ValidationResult<()> {
    if value.is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }

    if value.len() > MAX_ID_LEN {
        return Err(ValidationError::TooLong {
            field: field.to_string(),
            max: MAX_ID_LEN,
        });
    }

    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(ValidationError::InvalidFormat {
            field: field.to_string(),
            reason: "must contain only letters, numbers, '-', '_' and '.'".to_string(),
        });
    }

    Ok(())
}

/// Validates an optional e-mail address (very loosely: `local@domain`).
pub fn validate_email(field: &str, value: Option<&str>) -> ValidationResult<()> {
    let Some(value) = value.map(str::trim).filter(|v| !v.is_empty()) else {
        return Ok(());
    };

    match value.split_once('@') {
        Some((local, domain)) if !local.is_empty() && domain.contains('.') => Ok(()),
        _ => Err(ValidationError::InvalidFormat {
            field: field.to_string(),
            reason: "must look like name@example.com".to_string(),
        }),
    }
}

// =============================================================================
// Numeric Validators
// =============================================================================

/// Validates a monetary amount in the smallest currency unit.
///
/// Zero is allowed (free items, settled balances).
pub fn validate_non_negative_cents(field: &str, cents: i64) -> ValidationResult<()> {
    if cents < 0 {
        return Err(ValidationError::OutOfRange {
            field: field.to_string(),
            min: 0,
            max: i64::MAX,
        });
    }

    Ok(())
}

/// Validates a line quantity.
pub fn validate_quantity(field: &str, qty: i64) -> ValidationResult<()> {
    if qty <= 0 {
        return Err(ValidationError::MustBePositive {
            field: field.to_string(),
        });
    }

    Ok(())
}

/// Validates that a value is one of an allowed set.
pub fn validate_one_of(field: &str, value: &str, allowed: &[&str]) -> ValidationResult<()> {
    if allowed.contains(&value) {
        return Ok(());
    }

    Err(ValidationError::NotAllowed {
        field: field.to_string(),
        allowed: allowed.iter().map(|s| s.to_string()).collect(),
    })
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name() {
        assert!(validate_name("name", "Chai", 200).is_ok());
        assert!(validate_name("name", "   ", 200).is_err());
        assert!(validate_name("name", &"A".repeat(201), 200).is_err());
    }

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("id", "550e8400-e29b-41d4-a716-446655440000").is_ok());
        assert!(validate_identifier("table", "bill_items").is_ok());
        assert!(validate_identifier("id", "").is_err());
        assert!(validate_identifier("id", "a/b").is_err());
        assert!(validate_identifier("id", &"x".repeat(MAX_ID_LEN + 1)).is_err());
    }

    #[test]
    fn test_validate_email() {
        assert!(validate_email("email", None).is_ok());
        assert!(validate_email("email", Some("")).is_ok());
        assert!(validate_email("email", Some("owner@shop.in")).is_ok());
        assert!(validate_email("email", Some("owner")).is_err());
        assert!(validate_email("email", Some("@shop.in")).is_err());
    }

    #[test]
    fn test_numeric_validators() {
        assert!(validate_non_negative_cents("price", 0).is_ok());
        assert!(validate_non_negative_cents("price", -1).is_err());
        assert!(validate_quantity("qty", 1).is_ok());
        assert!(validate_quantity("qty", 0).is_err());
    }

    #[test]
    fn test_validate_one_of() {
        assert!(validate_one_of("status", "paid", &["draft", "paid"]).is_ok());
        assert!(validate_one_of("status", "lost", &["draft", "paid"]).is_err());
    }
}
