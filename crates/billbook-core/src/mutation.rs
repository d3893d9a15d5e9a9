//! # Mutation Record
//!
//! One durable, queued description of a pending local change.
//!
//! ## Record Anatomy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  MutationRecord                                                         │
//! │                                                                         │
//! │  identity     operation_id (idempotency key, client generated)         │
//! │  target       operation_type, target_collection, document_id           │
//! │  content      payload (JSON), payload_hash (sha256)                    │
//! │  lifecycle    status, retry_count, last_error, timestamps              │
//! │  ordering     priority (lower first)                                   │
//! │               dependency_group / parent_operation_id /                 │
//! │               step_number of total_steps                               │
//! │  provenance   owner_id (tenant), user_id, device_id                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Dependency Groups
//! A bill and its line items are enqueued as one group. Step `n + 1` is not
//! offered to the dispatcher until step `n` is SYNCED:
//! ```text
//!   group "g-1":  [1] bills/B-7  ──►  [2] bill_items/I-1  ──►  [3] bill_items/I-2
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, CoreResult};
use crate::hash::payload_hash;
use crate::types::{MutationStatus, OperationType};
use crate::DEFAULT_PRIORITY;

// =============================================================================
// Provenance
// =============================================================================

/// Who produced a mutation. Supplied by the engine, not by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    /// Tenant (business) the data belongs to.
    pub owner_id: String,
    pub user_id: String,
    pub device_id: String,
}

// =============================================================================
// Step Position
// =============================================================================

/// Position of a record inside an ordered multi-step transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepPosition {
    pub dependency_group: String,
    /// Operation id of step 1. `None` for step 1 itself.
    pub parent_operation_id: Option<String>,
    /// 1-based.
    pub step_number: u32,
    pub total_steps: u32,
}

// =============================================================================
// New Mutation (enqueue input)
// =============================================================================

/// What a caller hands to `enqueue`.
///
/// ## Example
/// ```rust
/// use billbook_core::NewMutation;
/// use serde_json::json;
///
/// let m = NewMutation::create("products", "p-1", json!({"name": "Tea", "price_cents": 150}))
///     .with_priority(10);
/// assert_eq!(m.priority, 10);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct NewMutation {
    pub operation_type: OperationType,
    pub target_collection: String,
    pub document_id: String,
    pub payload: Value,
    pub priority: i32,
}

impl NewMutation {
    pub fn new(
        operation_type: OperationType,
        target_collection: impl Into<String>,
        document_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        NewMutation {
            operation_type,
            target_collection: target_collection.into(),
            document_id: document_id.into(),
            payload,
            priority: DEFAULT_PRIORITY,
        }
    }

    /// A full new document.
    pub fn create(
        collection: impl Into<String>,
        document_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self::new(OperationType::Create, collection, document_id, payload)
    }

    /// Changed top-level fields of an existing document.
    pub fn update(
        collection: impl Into<String>,
        document_id: impl Into<String>,
        changes: Value,
    ) -> Self {
        Self::new(OperationType::Update, collection, document_id, changes)
    }

    /// Soft delete.
    pub fn delete(collection: impl Into<String>, document_id: impl Into<String>) -> Self {
        Self::new(
            OperationType::Delete,
            collection,
            document_id,
            Value::Object(Default::default()),
        )
    }

    /// Lower values dispatch first.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

// =============================================================================
// Mutation Record
// =============================================================================

/// A queued change and its sync lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationRecord {
    pub operation_id: String,
    pub operation_type: OperationType,
    pub target_collection: String,
    pub document_id: String,
    pub payload: Value,
    pub payload_hash: String,
    pub status: MutationStatus,
    /// Transient failures so far.
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub first_attempt_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Earliest time a RETRY record may be claimed again.
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub synced_at: Option<DateTime<Utc>>,
    pub priority: i32,
    pub parent_operation_id: Option<String>,
    pub step_number: u32,
    pub total_steps: u32,
    pub dependency_group: Option<String>,
    pub owner_id: String,
    pub user_id: String,
    pub device_id: String,
}

impl MutationRecord {
    /// Builds a PENDING record ready to be inserted.
    pub fn new(
        operation_id: impl Into<String>,
        mutation: NewMutation,
        provenance: &Provenance,
        step: Option<StepPosition>,
        now: DateTime<Utc>,
    ) -> Self {
        let payload_hash = payload_hash(&mutation.payload);
        let (dependency_group, parent_operation_id, step_number, total_steps) = match step {
            Some(step) => (
                Some(step.dependency_group),
                step.parent_operation_id,
                step.step_number,
                step.total_steps,
            ),
            None => (None, None, 1, 1),
        };

        MutationRecord {
            operation_id: operation_id.into(),
            operation_type: mutation.operation_type,
            target_collection: mutation.target_collection,
            document_id: mutation.document_id,
            payload: mutation.payload,
            payload_hash,
            status: MutationStatus::Pending,
            retry_count: 0,
            last_error: None,
            created_at: now,
            first_attempt_at: None,
            last_attempt_at: None,
            next_attempt_at: None,
            synced_at: None,
            priority: mutation.priority,
            parent_operation_id,
            step_number,
            total_steps,
            dependency_group,
            owner_id: provenance.owner_id.clone(),
            user_id: provenance.user_id.clone(),
            device_id: provenance.device_id.clone(),
        }
    }

    /// Fails unless the state machine allows moving this record to `next`.
    pub fn ensure_transition(&self, next: MutationStatus) -> CoreResult<()> {
        if self.status.can_transition_to(next) {
            Ok(())
        } else {
            Err(CoreError::InvalidTransition {
                operation_id: self.operation_id.clone(),
                from: self.status,
                to: next,
            })
        }
    }

    /// Applies a transition to the in-memory copy.
    ///
    /// Mirrors the guarded UPDATE statements in the queue repository.
    pub fn transition(&mut self, next: MutationStatus, now: DateTime<Utc>) -> CoreResult<()> {
        self.ensure_transition(next)?;

        match next {
            MutationStatus::InProgress => {
                self.last_attempt_at = Some(now);
                self.first_attempt_at.get_or_insert(now);
            }
            MutationStatus::Retry => {
                self.retry_count += 1;
            }
            MutationStatus::Synced => {
                self.synced_at = Some(now);
                self.next_attempt_at = None;
            }
            MutationStatus::Pending | MutationStatus::DeadLetter => {}
        }

        self.status = next;
        Ok(())
    }

    /// PENDING, or RETRY whose backoff has elapsed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            MutationStatus::Pending => true,
            MutationStatus::Retry => self.next_attempt_at.map_or(true, |at| at <= now),
            _ => false,
        }
    }

    /// Attempts made including the one currently in flight.
    pub fn attempts_including_current(&self) -> u32 {
        self.retry_count + 1
    }

    /// True if this record is one step of a multi-step transaction.
    pub fn is_grouped(&self) -> bool {
        self.dependency_group.is_some()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
