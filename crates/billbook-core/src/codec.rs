//! # Table Codec Registry
//!
//! Payloads are opaque JSON blobs in the queue and on the wire. Each table
//! registers a codec that knows how to check a payload against its document
//! type, and both the client and the server look tables up here instead of
//! switching on table names.
//!
//! ```rust
//! use billbook_core::CodecRegistry;
//! use serde_json::json;
//!
//! let registry = CodecRegistry::with_defaults();
//! assert!(registry.validate("products", &json!({"name": "Tea", "price_cents": 150})).is_ok());
//! assert!(registry.validate("invoices", &json!({})).is_err());
//! ```

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::entities::{Bill, BillItem, Customer, Product, SyncEntity};
use crate::error::{CoreError, CoreResult};

// =============================================================================
// Codec Trait
// =============================================================================

/// Per-table payload handler.
pub trait TableCodec: Send + Sync {
    fn table(&self) -> &'static str;

    /// Checks a complete document for this table.
    fn validate(&self, data: &Value) -> CoreResult<()>;
}

/// Codec backed by a serde document type.
pub struct TypedCodec<T> {
    _entity: PhantomData<fn() -> T>,
}

impl<T> TypedCodec<T> {
    pub fn new() -> Self {
        TypedCodec {
            _entity: PhantomData,
        }
    }
}

impl<T> Default for TypedCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: SyncEntity> TableCodec for TypedCodec<T> {
    fn table(&self) -> &'static str {
        T::TABLE
    }

    fn validate(&self, data: &Value) -> CoreResult<()> {
        let document: T =
            T::deserialize(data).map_err(|e| CoreError::InvalidPayload {
                table: T::TABLE.to_string(),
                reason: e.to_string(),
            })?;
        document.validate()?;
        Ok(())
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Table name → codec lookup.
#[derive(Clone, Default)]
pub struct CodecRegistry {
    codecs: BTreeMap<String, Arc<dyn TableCodec>>,
}

impl CodecRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in business table.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(TypedCodec::<Customer>::new());
        registry.register(TypedCodec::<Product>::new());
        registry.register(TypedCodec::<Bill>::new());
        registry.register(TypedCodec::<BillItem>::new());
        registry
    }

    /// Adds or replaces the codec for its table.
    pub fn register<C: TableCodec + 'static>(&mut self, codec: C) {
        self.codecs
            .insert(codec.table().to_string(), Arc::new(codec));
    }

    pub fn get(&self, table: &str) -> CoreResult<&Arc<dyn TableCodec>> {
        self.codecs
            .get(table)
            .ok_or_else(|| CoreError::UnknownTable(table.to_string()))
    }

    pub fn contains(&self, table: &str) -> bool {
        self.codecs.contains_key(table)
    }

    /// Validates a complete document for a table.
    pub fn validate(&self, table: &str, data: &Value) -> CoreResult<()> {
        self.get(table)?.validate(data)
    }

    /// Registered table names in sorted order.
    pub fn tables(&self) -> Vec<String> {
        self.codecs.keys().cloned().collect()
    }
}

impl std::fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecRegistry")
            .field("tables", &self.tables())
            .finish()
    }
}

// =============================================================================
// Partial Updates
// =============================================================================

/// Applies an UPDATE payload to an existing document.
///
/// Top-level fields of `patch` replace those of `existing`; other fields are
/// kept. A non-object `existing` is replaced outright.
pub fn merge_fields(existing: &Value, patch: &Value) -> Value {
    let mut merged = match existing {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };

    if let Value::Object(patch) = patch {
        for (key, value) in patch {
            merged.insert(key.clone(), value.clone());
        }
    }

    Value::Object(merged)
}

// =============================================================================
// Unit Tests
// =============================================================================
