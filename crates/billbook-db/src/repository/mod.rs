//! # Repository Module
//!
//! Repositories over the device's SQLite store.
//!
//! ## Repository Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  Sync dispatcher / reconciler                                          │
//! │       │                                                                 │
//! │       │  db.mutation_queue().claim(&record, now)                       │
//! │       ▼                                                                 │
//! │  MutationQueueRepository                                               │
//! │  ├── select_eligible(now, limit)                                       │
//! │  ├── claim / mark_synced / mark_retry                                  │
//! │  └── insert_in(&mut tx, record)   ← joins the caller's transaction     │
//! │       │                                                                 │
//! │       │  SQL                                                            │
//! │       ▼                                                                 │
//! │  SQLite Database                                                       │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Methods ending in `_in` take a `&mut SqliteConnection` so they can run
//! inside a transaction the caller already holds.
//!
//! ## Available Repositories
//!
//! - [`MutationQueueRepository`](mutation_queue::MutationQueueRepository) - queue and state transitions
//! - [`DeadLetterRepository`](dead_letter::DeadLetterRepository) - terminal failures
//! - [`ConflictLogRepository`](conflict_log::ConflictLogRepository) - append-only conflict audit
//! - [`DocumentRepository`](documents::DocumentRepository) - local document copies
//! - [`SyncStateRepository`](sync_state::SyncStateRepository) - pull watermarks

pub mod conflict_log;
pub mod dead_letter;
pub mod documents;
pub mod mutation_queue;
pub mod sync_state;
