//! Dead-letter entries.
//!
//! A dead-lettered mutation is removed from the active queue and kept here,
//! with its full original record, until an operator resolves it. Resolving
//! never resurrects the record; retrying means enqueuing a fresh operation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::mutation::MutationRecord;

/// A permanently failed mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterEntry {
    pub id: String,
    pub original_operation_id: String,
    /// The record as it was when it left the queue.
    pub record: MutationRecord,
    pub failure_reason: String,
    pub total_attempts: u32,
    pub first_attempt_at: Option<DateTime<Utc>>,
    pub moved_to_dead_letter_at: DateTime<Utc>,
    pub is_resolved: bool,
    pub resolution_notes: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl DeadLetterEntry {
    /// Wraps a record that is leaving the queue.
    pub fn new(
        id: impl Into<String>,
        record: MutationRecord,
        failure_reason: impl Into<String>,
        total_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        DeadLetterEntry {
            id: id.into(),
            original_operation_id: record.operation_id.clone(),
            first_attempt_at: record.first_attempt_at,
            record,
            failure_reason: failure_reason.into(),
            total_attempts,
            moved_to_dead_letter_at: now,
            is_resolved: false,
            resolution_notes: None,
            resolved_at: None,
        }
    }

    pub fn owner_id(&self) -> &str {
        &self.record.owner_id
    }
}
