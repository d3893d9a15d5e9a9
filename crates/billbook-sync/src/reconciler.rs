//! # Conflict Reconciler
//!
//! Folds server-canonical rows back into the local document store.
//!
//! ## Rules
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  server row (table, id, data, updatedAt)                                │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  local.server_version >= updatedAt ? ──yes──► skip (already have it)   │
//! │        │ no                                                             │
//! │        ▼                                                                │
//! │  did the device change the document since its last server version?     │
//! │        │                                                                │
//! │        ├── no ─────────────────────────────► overwrite silently (LWW)   │
//! │        │                                                                │
//! │        └── yes ─► genuine conflict                                      │
//! │                   log {local, server, divergent fields} ─► server wins  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A push that was accepted is not a conflict for its own record; but if the
//! device has already queued later edits of the same document, the local
//! copy is left alone and only its server version moves forward, so those
//! edits are not clobbered before they are pushed.
//!
//! Conflicts never fail the caller. They are logged and sync continues.

use billbook_core::conflict::divergent_fields;
use billbook_core::{
    ChangeAction, Clock, ConflictLogEntry, IdGenerator, MutationRecord, ServerChange,
};
use billbook_db::{
    ConflictLogRepository, Database, DocumentRepository, MutationQueueRepository,
    SqliteConnection,
};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use crate::error::SyncResult;

/// Where a server row came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileSource<'a> {
    /// Echo of a change the server just applied for this operation.
    PushAccepted { operation_id: &'a str },
    /// The server kept a newer write and refused this operation's change.
    PushSuperseded { operation_id: &'a str },
    /// Delivered by a pull.
    Pull,
}

impl ReconcileSource<'_> {
    fn operation_id(&self) -> Option<&str> {
        match self {
            ReconcileSource::PushAccepted { operation_id }
            | ReconcileSource::PushSuperseded { operation_id } => Some(operation_id),
            ReconcileSource::Pull => None,
        }
    }
}

/// What happened to one server row.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    /// Local copy replaced with the server row.
    Applied,
    /// Local copy kept because later local edits are still queued; only the
    /// known server version moved.
    VersionOnly,
    /// Local copy was already at or past this version.
    Skipped,
    /// Both sides changed; the server row won and the divergence was logged.
    Conflict(ConflictLogEntry),
}

#[derive(Clone)]
pub struct Reconciler {
    db: Database,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl Reconciler {
    pub fn new(db: Database, clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        Reconciler { db, clock, ids }
    }

    /// Applies one server row in its own transaction.
    pub async fn apply(
        &self,
        change: &ServerChange,
        source: ReconcileSource<'_>,
    ) -> SyncResult<ReconcileOutcome> {
        let mut tx = self.db.begin().await?;
        let outcome = self.apply_in(&mut tx, change, source).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    /// Applies one server row inside the caller's transaction.
    pub async fn apply_in(
        &self,
        conn: &mut SqliteConnection,
        change: &ServerChange,
        source: ReconcileSource<'_>,
    ) -> SyncResult<ReconcileOutcome> {
        let now = self.clock.now();
        let local = DocumentRepository::get_in(conn, &change.table, &change.id).await?;

        if let Some(version) = local.as_ref().and_then(|doc| doc.server_version) {
            if version >= change.updated_at {
                debug!(
                    table = %change.table,
                    document_id = %change.id,
                    local_version = version,
                    server_version = change.updated_at,
                    "Server row already applied"
                );
                return Ok(ReconcileOutcome::Skipped);
            }
        }

        let own_operation = source.operation_id();
        let queued: Vec<MutationRecord> =
            MutationQueueRepository::active_for_document_in(conn, &change.table, &change.id)
                .await?
                .into_iter()
                .filter(|record| Some(record.operation_id.as_str()) != own_operation)
                .collect();

        let locally_modified = match source {
            ReconcileSource::PushAccepted { .. } => false,
            ReconcileSource::PushSuperseded { .. } => true,
            ReconcileSource::Pull => !queued.is_empty(),
        };

        if matches!(source, ReconcileSource::PushAccepted { .. }) && !queued.is_empty() {
            DocumentRepository::set_server_version_in(
                conn,
                &change.table,
                &change.id,
                change.updated_at,
            )
            .await?;
            debug!(
                table = %change.table,
                document_id = %change.id,
                queued = queued.len(),
                "Later local edits queued, keeping local copy"
            );
            return Ok(ReconcileOutcome::VersionOnly);
        }

        let is_deleted = change.action == ChangeAction::Delete;
        let conflict = if locally_modified {
            let local_snapshot = local
                .as_ref()
                .map(|doc| doc.data.clone())
                .unwrap_or(Value::Null);
            let fields = divergent_fields(&local_snapshot, &change.data);
            let deletion_differs = local.as_ref().map(|doc| doc.is_deleted) != Some(is_deleted);

            if fields.is_empty() && !deletion_differs {
                None
            } else {
                let entry = ConflictLogEntry::server_wins(
                    self.ids.next_id(),
                    change.table.clone(),
                    change.id.clone(),
                    own_operation.map(str::to_string),
                    local_snapshot,
                    change.data.clone(),
                    now,
                );
                ConflictLogRepository::append_in(conn, &entry).await?;
                Some(entry)
            }
        } else {
            None
        };

        DocumentRepository::apply_canonical_in(
            conn,
            &change.table,
            &change.id,
            &change.data,
            change.updated_at,
            is_deleted,
            now,
        )
        .await?;

        debug!(
            table = %change.table,
            document_id = %change.id,
            server_version = change.updated_at,
            deleted = is_deleted,
            "Applied server row"
        );

        Ok(match conflict {
            Some(entry) => ReconcileOutcome::Conflict(entry),
            None => ReconcileOutcome::Applied,
        })
    }
}
