//! # Syncable Documents
//!
//! The business tables replicated between devices and the server. Each
//! document is the JSON payload of a mutation; the row id travels separately
//! as the mutation's `document_id`.
//!
//! ## Tables
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐                              │
//! │  │   customers     │   │    products     │                              │
//! │  │  name, phone    │   │  name, sku      │                              │
//! │  │  email          │   │  price_cents    │                              │
//! │  │  balance_cents  │   │  stock_qty,unit │                              │
//! │  └────────┬────────┘   └────────┬────────┘                              │
//! │           │ customer_id         │ product_id                            │
//! │  ┌────────▼────────┐   ┌────────▼────────┐                              │
//! │  │     bills       │◄──│   bill_items    │  bill_id                     │
//! │  │  invoice_number │   │  qty            │                              │
//! │  │  bill_date      │   │  price_cents    │                              │
//! │  │  total_cents    │   │  total_cents    │                              │
//! │  │  status         │   │                 │                              │
//! │  └─────────────────┘   └─────────────────┘                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Money is always integer cents. Unknown extra fields are tolerated so that
//! newer clients can add columns without breaking older servers.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::validation::{
    validate_email, validate_identifier, validate_name, validate_non_negative_cents,
    validate_one_of, validate_quantity, ValidationResult,
};

/// Longest display name accepted.
pub const MAX_NAME_LEN: usize = 200;

/// Allowed bill statuses.
pub const BILL_STATUSES: [&str; 3] = ["PAID", "UNPAID", "PARTIAL"];

// =============================================================================
// Sync Entity Trait
// =============================================================================

/// A document type that can be replicated.
pub trait SyncEntity: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Table name on the wire and in storage.
    const TABLE: &'static str;

    /// Field-level rules beyond what deserialization enforces.
    fn validate(&self) -> ValidationResult<()>;
}

// =============================================================================
// Customer
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub name: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    /// Amount the customer owes. May be negative for advance payments.
    #[serde(default)]
    pub balance_cents: i64,
}

impl SyncEntity for Customer {
    const TABLE: &'static str = "customers";

    fn validate(&self) -> ValidationResult<()> {
        validate_name("name", &self.name, MAX_NAME_LEN)?;
        validate_email("email", self.email.as_deref())?;
        Ok(())
    }
}

// =============================================================================
// Product
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub name: String,
    #[serde(default)]
    pub sku: Option<String>,
    pub price_cents: i64,
    #[serde(default)]
    pub stock_qty: i64,
    #[serde(default)]
    pub unit: Option<String>,
}

impl SyncEntity for Product {
    const TABLE: &'static str = "products";

    fn validate(&self) -> ValidationResult<()> {
        validate_name("name", &self.name, MAX_NAME_LEN)?;
        validate_non_negative_cents("price_cents", self.price_cents)?;
        Ok(())
    }
}

// =============================================================================
// Bill
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bill {
    #[serde(default)]
    pub customer_id: Option<String>,
    pub invoice_number: String,
    /// Epoch milliseconds.
    pub bill_date: i64,
    pub total_amount_cents: i64,
    #[serde(default = "default_bill_status")]
    pub status: String,
}

fn default_bill_status() -> String {
    "PAID".to_string()
}

impl SyncEntity for Bill {
    const TABLE: &'static str = "bills";

    fn validate(&self) -> ValidationResult<()> {
        if let Some(customer_id) = &self.customer_id {
            validate_identifier("customer_id", customer_id)?;
        }
        validate_name("invoice_number", &self.invoice_number, MAX_NAME_LEN)?;
        validate_non_negative_cents("total_amount_cents", self.total_amount_cents)?;
        validate_one_of("status", &self.status, &BILL_STATUSES)?;
        Ok(())
    }
}

// =============================================================================
// Bill Item
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillItem {
    pub bill_id: String,
    #[serde(default)]
    pub product_id: Option<String>,
    pub qty: i64,
    pub price_cents: i64,
    pub total_cents: i64,
}

impl SyncEntity for BillItem {
    const TABLE: &'static str = "bill_items";

    fn validate(&self) -> ValidationResult<()> {
        validate_identifier("bill_id", &self.bill_id)?;
        if let Some(product_id) = &self.product_id {
            validate_identifier("product_id", product_id)?;
        }
        validate_quantity("qty", self.qty)?;
        validate_non_negative_cents("price_cents", self.price_cents)?;

        if self.qty.checked_mul(self.price_cents) != Some(self.total_cents) {
            return Err(crate::error::ValidationError::Inconsistent {
                field: "total_cents".to_string(),
                reason: "must equal qty * price_cents".to_string(),
            });
        }

        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
