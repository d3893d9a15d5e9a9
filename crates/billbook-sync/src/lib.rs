//! # billbook-sync: Client Sync Engine for Billbook
//!
//! Every local write in the POS lands in SQLite first and is queued as a
//! mutation record. This crate drains that queue to the reconciliation
//! server in the background and folds the server's canonical rows back into
//! the local store.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Client Sync Architecture                        │
//! │                                                                         │
//! │   app code ──► LocalWriter ──► local_documents + mutation_queue (1 tx)  │
//! │                                        │                                │
//! │  ┌─────────────────────────────────────┴────────────────────────────┐  │
//! │  │                        SyncEngine (loop)                         │  │
//! │  │   wake / poll tick ──► SyncDispatcher::trigger_manual_sync       │  │
//! │  │   pull tick        ──► SyncDispatcher::pull_changes              │  │
//! │  └─────────────────────────────────────┬────────────────────────────┘  │
//! │                                        │                                │
//! │         ┌──────────────────────────────┼──────────────────────┐        │
//! │         ▼                              ▼                      ▼         │
//! │  ┌──────────────┐            ┌──────────────────┐   ┌────────────────┐ │
//! │  │ SyncClient   │            │ Reconciler       │   │ EventBus       │ │
//! │  │ POST /sync/* │            │ server row wins, │   │ attempt events │ │
//! │  │ (reqwest)    │            │ conflicts logged │   │ queue stats    │ │
//! │  └──────────────┘            └──────────────────┘   └────────────────┘ │
//! │                                                                         │
//! │  Failures:  transient ──► RETRY with backoff ──► DEAD_LETTER at ceiling │
//! │             permanent ──► DEAD_LETTER (group followers cascade)         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`config`] - TOML configuration with env overrides
//! - [`error`] - Sync errors and their transient/permanent classification
//! - [`retry`] - Backoff policy
//! - [`client`] - `SyncClient` trait and the HTTP implementation
//! - [`writer`] - Atomic local write + enqueue
//! - [`reconciler`] - Applies server rows, logs conflicts
//! - [`events`] - Attempt events and live queue stats
//! - [`dispatcher`] - Claim, push, settle; pull; dead-letter handling
//! - [`engine`] - Background loop
//!
//! ## Usage
//!
//! ```rust,ignore
//! use billbook_sync::{HttpSyncClient, SyncConfig, SyncDispatcher, SyncEngine};
//!
//! let config = SyncConfig::load_or_default(None);
//! let client = Arc::new(HttpSyncClient::new(&config)?);
//! let dispatcher = Arc::new(SyncDispatcher::builder(config.clone(), db, client).build()?);
//!
//! let mut engine = SyncEngine::new(dispatcher, &config);
//! let handle = engine.start().await?;
//! handle.enqueue(NewMutation::create("products", id, product)).await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod client;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod events;
pub mod reconciler;
pub mod retry;
pub mod writer;

// =============================================================================
// Re-exports
// =============================================================================

pub use client::{HttpSyncClient, SyncClient};
pub use config::SyncConfig;
pub use dispatcher::{CycleReport, PullReport, SyncDispatcher, SyncDispatcherBuilder, SyncTrigger};
pub use engine::{SyncEngine, SyncEngineHandle};
pub use error::{FailureClass, SyncError, SyncResult};
pub use events::{AttemptOutcome, EventBus, EventSubscription, StatsSubscription, SyncEvent};
pub use reconciler::{ReconcileOutcome, ReconcileSource, Reconciler};
pub use retry::RetryPolicy;
pub use writer::LocalWriter;
