//! # billbook-core: Pure Sync Types for Billbook
//!
//! The vocabulary shared by the offline client engine and the reconciliation
//! server. Nothing in here touches a database, a socket or the wall clock.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Billbook Sync Architecture                       │
//! │                                                                         │
//! │  ┌──────────────────────────┐          ┌──────────────────────────┐    │
//! │  │   billbook-sync (client) │  HTTP    │   sync-server            │    │
//! │  │   Dispatcher, Reconciler │ ───────► │   push / pull            │    │
//! │  └────────────┬─────────────┘          └────────────┬─────────────┘    │
//! │               │                                     │                   │
//! │  ┌────────────▼─────────────────────────────────────▼─────────────┐    │
//! │  │               ★ billbook-core (THIS CRATE) ★                    │    │
//! │  │                                                                 │    │
//! │  │   ┌──────────┐ ┌──────────┐ ┌──────────┐ ┌──────────┐          │    │
//! │  │   │ mutation │ │ protocol │ │  codec   │ │  clock   │          │    │
//! │  │   │  record  │ │ push/pull│ │ per-table│ │  ids     │          │    │
//! │  │   │  states  │ │   DTOs   │ │ registry │ │  hashes  │          │    │
//! │  │   └──────────┘ └──────────┘ └──────────┘ └──────────┘          │    │
//! │  │                                                                 │    │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │    │
//! │  └─────────────────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Status enums and queue statistics
//! - [`mutation`] - The Mutation Record and its state machine
//! - [`dead_letter`] - Dead-letter entries
//! - [`conflict`] - Conflict log entries and field diffing
//! - [`protocol`] - Push/pull wire format
//! - [`entities`] - Syncable business documents (customers, products, bills)
//! - [`codec`] - Table name → payload codec registry
//! - [`clock`] - Injectable clock and id generator
//! - [`hash`] - Payload fingerprints
//! - [`validation`] - Field validators
//! - [`error`] - Domain error types
//!
//! ## Example Usage
//!
//! ```rust
//! use billbook_core::{MutationStatus, OperationType};
//!
//! assert!(MutationStatus::Pending.can_transition_to(MutationStatus::InProgress));
//! assert!(!MutationStatus::Pending.can_transition_to(MutationStatus::Synced));
//! assert_eq!(OperationType::Create.as_str(), "create");
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod clock;
pub mod codec;
pub mod conflict;
pub mod dead_letter;
pub mod entities;
pub mod error;
pub mod hash;
pub mod mutation;
pub mod protocol;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use clock::{Clock, IdGenerator, ManualClock, SequentialIds, SystemClock, UuidGenerator};
pub use codec::{CodecRegistry, TableCodec};
pub use conflict::{ConflictLogEntry, ConflictResolution};
pub use dead_letter::DeadLetterEntry;
pub use error::{CoreError, CoreResult, ValidationError};
pub use hash::payload_hash;
pub use mutation::{MutationRecord, NewMutation, Provenance, StepPosition};
pub use protocol::{
    ChangeAction, ChangeRecord, ConflictReason, PullCursor, PullRequest, PullResponse,
    PushConflict, PushRequest, PushResponse, ServerChange,
};
pub use types::{MutationStatus, OperationType, QueueStats};

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Default priority for a mutation. Lower values dispatch first.
pub const DEFAULT_PRIORITY: i32 = 100;

/// Default attempt ceiling, the first attempt included. A transient failure
/// on the last attempt becomes a dead letter.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Maximum number of changes accepted in one push request.
pub const MAX_PUSH_BATCH: usize = 500;
