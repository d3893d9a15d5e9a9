//! # Conflict Log Entries
//!
//! When the server's canonical copy of a document disagrees with a local copy
//! that was itself changed since the last common version, the server value
//! wins and the divergence is recorded here. Entries are append-only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;

/// Bookkeeping fields that always differ between copies and are not
/// reported as divergent.
const IGNORED_FIELDS: [&str; 2] = ["created_at", "updated_at"];

/// How a conflict was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// The server copy replaced the local copy.
    ServerWins,
}

impl ConflictResolution {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ConflictResolution::ServerWins => "server_wins",
        }
    }
}

impl fmt::Display for ConflictResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One audit record of a reconciliation conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictLogEntry {
    pub id: String,
    /// Table name.
    pub entity_type: String,
    pub entity_id: String,
    /// The local mutation involved, when one is known.
    pub operation_id: Option<String>,
    pub local_snapshot: Value,
    pub server_snapshot: Value,
    pub divergent_fields: Vec<String>,
    pub resolution: ConflictResolution,
    pub detected_at: DateTime<Utc>,
}

impl ConflictLogEntry {
    /// Builds a server-wins entry, computing the divergent fields.
    pub fn server_wins(
        id: impl Into<String>,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        operation_id: Option<String>,
        local_snapshot: Value,
        server_snapshot: Value,
        detected_at: DateTime<Utc>,
    ) -> Self {
        let divergent_fields = divergent_fields(&local_snapshot, &server_snapshot);
        ConflictLogEntry {
            id: id.into(),
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            operation_id,
            local_snapshot,
            server_snapshot,
            divergent_fields,
            resolution: ConflictResolution::ServerWins,
            detected_at,
        }
    }
}

/// Top-level fields whose values differ between two documents, sorted.
///
/// A field present on one side only counts as divergent. Non-object
/// documents are compared whole and reported as `"*"`.
///
/// ## Example
/// ```rust
/// use billbook_core::conflict::divergent_fields;
/// use serde_json::json;
///
/// let local = json!({"name": "Tea", "price_cents": 150});
/// let server = json!({"name": "Tea", "price_cents": 175, "sku": "T-1"});
/// assert_eq!(divergent_fields(&local, &server), vec!["price_cents", "sku"]);
/// ```
pub fn divergent_fields(local: &Value, server: &Value) -> Vec<String> {
    let (Some(local), Some(server)) = (local.as_object(), server.as_object()) else {
        return if local == server {
            Vec::new()
        } else {
            vec!["*".to_string()]
        };
    };

    let keys: BTreeSet<&String> = local.keys().chain(server.keys()).collect();
    keys.into_iter()
        .filter(|key| !IGNORED_FIELDS.contains(&key.as_str()))
        .filter(|key| local.get(*key) != server.get(*key))
        .map(|key| key.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::from_millis;
    use serde_json::json;

    #[test]
    fn test_identical_documents_do_not_diverge() {
        let doc = json!({"name": "Tea", "updated_at": 5});
        assert!(divergent_fields(&doc, &doc).is_empty());
    }

    #[test]
    fn test_timestamps_are_ignored() {
        let local = json!({"name": "Tea", "updated_at": 5, "created_at": 1});
        let server = json!({"name": "Tea", "updated_at": 9, "created_at": 2});
        assert!(divergent_fields(&local, &server).is_empty());
    }

    #[test]
    fn test_missing_field_is_divergent() {
        let local = json!({"name": "Tea", "phone": "123"});
        let server = json!({"name": "Tea"});
        assert_eq!(divergent_fields(&local, &server), vec!["phone"]);
    }

    #[test]
    fn test_non_object_documents() {
        assert_eq!(divergent_fields(&json!(null), &json!({"a": 1})), vec!["*"]);
        assert!(divergent_fields(&json!(null), &json!(null)).is_empty());
    }

    #[test]
    fn test_server_wins_entry() {
        let entry = ConflictLogEntry::server_wins(
            "c-1",
            "customers",
            "cust-1",
            Some("op-1".to_string()),
            json!({"name": "Asha", "phone": "1"}),
            json!({"name": "Asha", "phone": "2"}),
            from_millis(10),
        );
        assert_eq!(entry.divergent_fields, vec!["phone"]);
        assert_eq!(entry.resolution, ConflictResolution::ServerWins);
        assert_eq!(entry.resolution.to_string(), "server_wins");
    }
}
