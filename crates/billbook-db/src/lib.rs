//! # billbook-db: Local Store for the Billbook Sync Engine
//!
//! SQLite persistence for everything the device must not lose: queued
//! mutations, dead letters, local document copies, the conflict log and
//! pull watermarks.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  billbook-sync (dispatcher, reconciler)                                │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                    billbook-db (THIS CRATE)                     │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌────────────────────┐  ┌────────────┐  │   │
//! │  │   │   Database    │    │    Repositories    │  │ Migrations │  │   │
//! │  │   │   (pool.rs)   │◄───│ mutation_queue     │  │ (embedded) │  │   │
//! │  │   │  SqlitePool   │    │ dead_letter        │  │            │  │   │
//! │  │   │               │    │ documents          │  │ 001..003   │  │   │
//! │  │   │               │    │ conflict_log       │  │            │  │   │
//! │  │   │               │    │ sync_state         │  │            │  │   │
//! │  │   └───────────────┘    └────────────────────┘  └────────────┘  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SQLite file (WAL)                                                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use billbook_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("billbook.db")).await?;
//! let stats = db.mutation_queue().stats().await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

#[cfg(test)]
pub(crate) mod test_support;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};

pub use repository::conflict_log::ConflictLogRepository;
pub use repository::dead_letter::DeadLetterRepository;
pub use repository::documents::{DocumentRepository, LocalDocument};
pub use repository::mutation_queue::MutationQueueRepository;
pub use repository::sync_state::SyncStateRepository;

/// SQLite connection type accepted by the `*_in` repository methods.
pub use sqlx::SqliteConnection;
