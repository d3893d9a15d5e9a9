//! # Push/Pull Wire Protocol
//!
//! JSON bodies exchanged between the client engine and the reconciliation
//! server. Field names are camelCase on the wire.
//!
//! ## Exchange
//! ```text
//! ┌──────────────┐   POST /sync/push  {changes, deviceId, lastSyncedAt}   ┌──────────────┐
//! │              │ ─────────────────────────────────────────────────────► │              │
//! │   client     │ ◄───────────────────────────────────────────────────── │   server     │
//! │   engine     │   {accepted, rejected, conflicts, applied, serverTs}   │              │
//! │              │                                                        │              │
//! │              │   POST /sync/pull  {lastSyncedAt, tables, afterId}     │              │
//! │              │ ─────────────────────────────────────────────────────► │              │
//! │              │ ◄───────────────────────────────────────────────────── │              │
//! └──────────────┘   {changes, serverTimestamp, hasMore}                  └──────────────┘
//! ```
//!
//! Timestamps are epoch milliseconds.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::mutation::MutationRecord;
use crate::types::OperationType;

// =============================================================================
// Change Action
// =============================================================================

/// Row-level action carried by a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    Insert,
    Update,
    Delete,
}

impl ChangeAction {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ChangeAction::Insert => "insert",
            ChangeAction::Update => "update",
            ChangeAction::Delete => "delete",
        }
    }
}

impl From<OperationType> for ChangeAction {
    fn from(op: OperationType) -> Self {
        match op {
            OperationType::Create => ChangeAction::Insert,
            OperationType::Update => ChangeAction::Update,
            OperationType::Delete => ChangeAction::Delete,
        }
    }
}

impl fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Push
// =============================================================================

/// One local change submitted in a push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    pub table: String,
    pub action: ChangeAction,
    pub id: String,
    #[serde(default)]
    pub data: Value,
    /// When the change was made on the device.
    pub local_timestamp: i64,
    /// Idempotency key. Older clients may omit it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_hash: Option<String>,
}

impl ChangeRecord {
    /// Wire form of a queued mutation.
    pub fn from_mutation(record: &MutationRecord) -> Self {
        ChangeRecord {
            table: record.target_collection.clone(),
            action: record.operation_type.into(),
            id: record.document_id.clone(),
            data: record.payload.clone(),
            local_timestamp: record.created_at.timestamp_millis(),
            operation_id: Some(record.operation_id.clone()),
            payload_hash: Some(record.payload_hash.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    pub changes: Vec<ChangeRecord>,
    pub device_id: String,
    #[serde(default)]
    pub last_synced_at: Option<i64>,
}

/// Why a pushed change was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictReason {
    /// INSERT of an id that already exists, or an operation id replayed with
    /// a different payload.
    Duplicate,
    /// UPDATE or DELETE of a row that does not exist (or is soft-deleted).
    NotFound,
    /// The resulting document fails the table's validation.
    Validation,
    /// No handler is registered for the table.
    UnknownTable,
    /// The operation id was already applied with the same payload.
    AlreadyApplied,
    /// A newer write already reached the server. The current row is echoed
    /// back in `applied`.
    Superseded,
}

impl ConflictReason {
    /// Retrying the same change can never succeed.
    pub fn is_permanent(self) -> bool {
        matches!(
            self,
            ConflictReason::Duplicate
                | ConflictReason::NotFound
                | ConflictReason::Validation
                | ConflictReason::UnknownTable
        )
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            ConflictReason::Duplicate => "duplicate",
            ConflictReason::NotFound => "not_found",
            ConflictReason::Validation => "validation",
            ConflictReason::UnknownTable => "unknown_table",
            ConflictReason::AlreadyApplied => "already_applied",
            ConflictReason::Superseded => "superseded",
        }
    }
}

impl fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushConflict {
    pub id: String,
    pub table: String,
    pub reason: ConflictReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<String>,
}

/// A server row as it is after a push, or as returned by a pull.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerChange {
    pub table: String,
    pub action: ChangeAction,
    pub id: String,
    pub data: Value,
    /// Server-assigned version, strictly increasing per tenant table.
    pub updated_at: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResponse {
    pub accepted: u32,
    pub rejected: u32,
    pub conflicts: Vec<PushConflict>,
    /// Canonical copies of accepted or superseded rows.
    #[serde(default)]
    pub applied: Vec<ServerChange>,
    pub server_timestamp: i64,
}

impl PushResponse {
    /// Conflict reported for a document, if any.
    pub fn conflict_for(&self, table: &str, id: &str) -> Option<&PushConflict> {
        self.conflicts
            .iter()
            .find(|c| c.table == table && c.id == id)
    }

    /// Canonical row echoed for a document, if any.
    pub fn applied_for(&self, table: &str, id: &str) -> Option<&ServerChange> {
        self.applied.iter().find(|c| c.table == table && c.id == id)
    }
}

// =============================================================================
// Pull
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    /// Return rows with `updatedAt` greater than this. `None` means everything.
    #[serde(default)]
    pub last_synced_at: Option<i64>,
    /// Restrict to these tables. `None` means every registered table.
    #[serde(default)]
    pub tables: Option<Vec<String>>,
    /// Tie-breaker for rows sharing `lastSyncedAt`: only ids greater than
    /// this are returned at exactly that timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_id: Option<String>,
    /// Table of the row `afterId` names. Required with `afterId` when more
    /// than one table is pulled; rows at `lastSyncedAt` order by `(table, id)`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_table: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

impl PullRequest {
    /// Request for one table starting after a cursor.
    pub fn for_table(table: impl Into<String>, cursor: Option<&PullCursor>, limit: u32) -> Self {
        PullRequest {
            last_synced_at: cursor.map(|c| c.watermark),
            tables: Some(vec![table.into()]),
            after_id: cursor.and_then(|c| c.last_id.clone()),
            after_table: None,
            limit: Some(limit),
        }
    }

    /// The same request advanced past the last row of `page`.
    pub fn resume_after(&self, page: &PullResponse) -> Self {
        match page.changes.last() {
            Some(last) => PullRequest {
                last_synced_at: Some(last.updated_at),
                after_id: Some(last.id.clone()),
                after_table: Some(last.table.clone()),
                ..self.clone()
            },
            None => self.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponse {
    /// Ascending by `(updatedAt, table, id)`.
    pub changes: Vec<ServerChange>,
    /// Watermark covering every returned row. Pulling again from it with no
    /// tie-breaker returns nothing already seen; while `hasMore` it is the
    /// last row's `updatedAt`.
    pub server_timestamp: i64,
    pub has_more: bool,
}

impl PullResponse {
    /// Cursor positioned after the last change in this page.
    pub fn next_cursor(&self) -> Option<PullCursor> {
        self.changes.last().map(|c| PullCursor {
            watermark: c.updated_at,
            last_id: Some(c.id.clone()),
        })
    }
}

/// Per-table pull position persisted by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullCursor {
    pub watermark: i64,
    pub last_id: Option<String>,
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_push_request_wire_format() {
        let request = PushRequest {
            changes: vec![ChangeRecord {
                table: "customers".to_string(),
                action: ChangeAction::Insert,
                id: "c-1".to_string(),
                data: json!({"name": "Asha"}),
                local_timestamp: 42,
                operation_id: Some("op-1".to_string()),
                payload_hash: None,
            }],
            device_id: "dev-1".to_string(),
            last_synced_at: None,
        };

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["deviceId"], "dev-1");
        assert_eq!(value["changes"][0]["action"], "insert");
        assert_eq!(value["changes"][0]["localTimestamp"], 42);
        assert_eq!(value["changes"][0]["operationId"], "op-1");
        assert!(value["changes"][0].get("payloadHash").is_none());
    }

    #[test]
    fn test_conflict_reason_wire_and_permanence() {
        let conflict: PushConflict = serde_json::from_value(json!({
            "id": "p-1",
            "table": "products",
            "reason": "not_found"
        }))
        .unwrap();
        assert_eq!(conflict.reason, ConflictReason::NotFound);
        assert!(conflict.reason.is_permanent());
        assert!(!ConflictReason::AlreadyApplied.is_permanent());
        assert!(!ConflictReason::Superseded.is_permanent());
    }

    #[test]
    fn test_operation_type_maps_to_action() {
        assert_eq!(ChangeAction::from(OperationType::Create), ChangeAction::Insert);
        assert_eq!(ChangeAction::from(OperationType::Delete), ChangeAction::Delete);
    }

    #[test]
    fn test_pull_next_cursor() {
        let response = PullResponse {
            changes: vec![
                ServerChange {
                    table: "products".to_string(),
                    action: ChangeAction::Update,
                    id: "a".to_string(),
                    data: json!({}),
                    updated_at: 5,
                },
                ServerChange {
                    table: "products".to_string(),
                    action: ChangeAction::Delete,
                    id: "b".to_string(),
                    data: json!({}),
                    updated_at: 7,
                },
            ],
            server_timestamp: 10,
            has_more: true,
        };

        let cursor = response.next_cursor().unwrap();
        assert_eq!(cursor.watermark, 7);
        assert_eq!(cursor.last_id.as_deref(), Some("b"));
        assert!(PullResponse::default().next_cursor().is_none());
    }

    #[test]
    fn test_pull_request_for_table() {
        let cursor = PullCursor {
            watermark: 9,
            last_id: Some("x".to_string()),
        };
        let request = PullRequest::for_table("bills", Some(&cursor), 100);
        assert_eq!(request.last_synced_at, Some(9));
        assert_eq!(request.after_id.as_deref(), Some("x"));
        assert_eq!(request.tables, Some(vec!["bills".to_string()]));
        assert!(request.after_table.is_none());
    }

    #[test]
    fn test_resume_after_carries_table() {
        let request = PullRequest {
            limit: Some(2),
            ..PullRequest::default()
        };
        let page = PullResponse {
            changes: vec![ServerChange {
                table: "customers".to_string(),
                action: ChangeAction::Update,
                id: "c-1".to_string(),
                data: json!({}),
                updated_at: 1_000,
            }],
            server_timestamp: 1_000,
            has_more: true,
        };

        let next = request.resume_after(&page);
        assert_eq!(next.last_synced_at, Some(1_000));
        assert_eq!(next.after_id.as_deref(), Some("c-1"));
        assert_eq!(next.after_table.as_deref(), Some("customers"));
        assert_eq!(next.limit, Some(2));
        assert!(next.tables.is_none());

        let value = serde_json::to_value(&next).unwrap();
        assert_eq!(value["afterTable"], "customers");
        assert_eq!(request.resume_after(&PullResponse::default()), request);
    }
}
