//! # Queue Types
//!
//! Status enums and counters for the local mutation queue.
//!
//! ## Queue State Machine
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Mutation Lifecycle                                │
//! │                                                                         │
//! │   enqueue                                                              │
//! │      │                                                                  │
//! │      ▼                                                                  │
//! │  ┌─────────┐  claim (CAS)  ┌─────────────┐   accepted   ┌────────┐     │
//! │  │ PENDING │ ────────────► │ IN_PROGRESS │ ───────────► │ SYNCED │     │
//! │  └─────────┘               └──────┬──────┘              └────────┘     │
//! │       ▲                        │  │  │                                  │
//! │       │ crash recovery         │  │  │ permanent / ceiling              │
//! │       └────────────────────────┘  │  ▼                                  │
//! │                                   │ ┌─────────────┐                     │
//! │  ┌───────┐   transient failure    │ │ DEAD_LETTER │                     │
//! │  │ RETRY │ ◄──────────────────────┘ └─────────────┘                     │
//! │  └───┬───┘                                ▲                             │
//! │      │ backoff elapsed, claim             │ predecessor step failed     │
//! │      └──────────► IN_PROGRESS             │ (PENDING / RETRY followers) │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ts_rs::TS;

use crate::error::CoreError;

// =============================================================================
// Operation Type
// =============================================================================

/// The kind of change a mutation describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[ts(export)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationType {
    Create,
    Update,
    Delete,
}

impl OperationType {
    /// Storage representation.
    pub const fn as_str(&self) -> &'static str {
        match self {
            OperationType::Create => "create",
            OperationType::Update => "update",
            OperationType::Delete => "delete",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "create" => Ok(OperationType::Create),
            "update" => Ok(OperationType::Update),
            "delete" => Ok(OperationType::Delete),
            other => Err(CoreError::Unrecognised {
                kind: "operation type",
                value: other.to_string(),
            }),
        }
    }
}

// =============================================================================
// Mutation Status
// =============================================================================

/// Lifecycle state of a queued mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[ts(export)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MutationStatus {
    /// Recorded locally, never attempted (or recovered after a crash).
    Pending,
    /// Claimed by a dispatcher worker.
    InProgress,
    /// Failed transiently, waiting for its backoff to elapse.
    Retry,
    /// Accepted by the server.
    Synced,
    /// Permanently failed. Only visible on the dead-letter entry.
    DeadLetter,
}

impl MutationStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [MutationStatus; 5] = [
        MutationStatus::Pending,
        MutationStatus::InProgress,
        MutationStatus::Retry,
        MutationStatus::Synced,
        MutationStatus::DeadLetter,
    ];

    /// Storage representation.
    pub const fn as_str(&self) -> &'static str {
        match self {
            MutationStatus::Pending => "pending",
            MutationStatus::InProgress => "in_progress",
            MutationStatus::Retry => "retry",
            MutationStatus::Synced => "synced",
            MutationStatus::DeadLetter => "dead_letter",
        }
    }

    /// Returns true if the queue state machine allows `self -> next`.
    ///
    /// ## Allowed Edges
    /// - `PENDING -> IN_PROGRESS` and `RETRY -> IN_PROGRESS` (claim)
    /// - `IN_PROGRESS -> SYNCED | RETRY | DEAD_LETTER` (attempt outcome)
    /// - `IN_PROGRESS -> PENDING` (startup recovery of an interrupted attempt)
    /// - `PENDING | RETRY -> DEAD_LETTER` (an earlier step of the group failed)
    pub fn can_transition_to(self, next: MutationStatus) -> bool {
        use MutationStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress)
                | (Retry, InProgress)
                | (InProgress, Synced)
                | (InProgress, Retry)
                | (InProgress, DeadLetter)
                | (InProgress, Pending)
                | (Pending, DeadLetter)
                | (Retry, DeadLetter)
        )
    }

    /// Records in these states are re-offered to the dispatcher after a restart.
    pub fn is_resumable(self) -> bool {
        matches!(
            self,
            MutationStatus::Pending | MutationStatus::InProgress | MutationStatus::Retry
        )
    }

    /// No further transitions are possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, MutationStatus::Synced | MutationStatus::DeadLetter)
    }
}

impl Default for MutationStatus {
    fn default() -> Self {
        MutationStatus::Pending
    }
}

impl fmt::Display for MutationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MutationStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MutationStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| CoreError::Unrecognised {
                kind: "mutation status",
                value: s.to_string(),
            })
    }
}

// =============================================================================
// Queue Statistics
// =============================================================================

/// Live counts per status, published on the stats stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub pending: u32,
    pub in_progress: u32,
    pub retry: u32,
    pub synced: u32,
    /// Unresolved dead-letter entries.
    pub dead_letter: u32,
}

impl QueueStats {
    /// Records still waiting to reach the server.
    pub fn outstanding(&self) -> u32 {
        self.pending + self.in_progress + self.retry
    }

    /// Sets the counter for one status.
    pub fn set(&mut self, status: MutationStatus, count: u32) {
        match status {
            MutationStatus::Pending => self.pending = count,
            MutationStatus::InProgress => self.in_progress = count,
            MutationStatus::Retry => self.retry = count,
            MutationStatus::Synced => self.synced = count,
            MutationStatus::DeadLetter => self.dead_letter = count,
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
