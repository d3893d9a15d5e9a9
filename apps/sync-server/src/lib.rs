//! # Billbook Sync Server
//!
//! Reconciliation service devices push their queued mutations to and pull
//! server-side changes from. The server is the source of truth: when two
//! devices disagree, the row stored here wins.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Sync Server                                     │
//! │                                                                         │
//! │  Device ──► POST /sync/push ──┐                                         │
//! │  Device ──► POST /sync/pull ──┼──► Identity (tenant, user headers)      │
//! │                               │                                         │
//! │                               ▼                                         │
//! │                ┌──────────────────────────────┐                         │
//! │                │    ReconciliationService     │                         │
//! │                │  table codecs (validation)   │                         │
//! │                │  idempotency ledger          │                         │
//! │                │  per-table version allocator │                         │
//! │                └──────────────┬───────────────┘                         │
//! │                               ▼                                         │
//! │                         SQLite (ServerStore)                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration
//! Environment variables:
//! - `BILLBOOK_BIND_ADDR` - listen address (default: 0.0.0.0:8080)
//! - `BILLBOOK_DATABASE_URL` - SQLite URL (default: sqlite://billbook-server.db?mode=rwc)
//! - `BILLBOOK_PULL_PAGE_SIZE` - rows per pull page (default: 500)
//! - `BILLBOOK_MAX_PUSH_BATCH` - changes per push (default: 500)
//! - `BILLBOOK_DB_MAX_CONNECTIONS` - pool size (default: 8)

pub mod config;
pub mod error;
pub mod identity;
pub mod routes;
pub mod service;
pub mod store;

// Re-exports
pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use identity::Identity;
pub use routes::router;
pub use service::ReconciliationService;
pub use store::ServerStore;
