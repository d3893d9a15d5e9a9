//! # Local Writer
//!
//! The only way application code changes a synced document. The document
//! write and its queue record commit in the same SQLite transaction, so a
//! crash can never leave one without the other.
//!
//! ```text
//!   LocalWriter::enqueue(NewMutation)
//!        │
//!        ├── codec check (table known, payload valid after merge)
//!        │
//!        ├── BEGIN
//!        │     local_documents  ← put / merge / soft delete
//!        │     mutation_queue   ← PENDING record
//!        └── COMMIT  ──► operation id returned, caller never waits on sync
//! ```
//!
//! Multi-step writes (a bill and its line items) go through
//! [`LocalWriter::enqueue_transaction`], which stamps every record with the
//! same dependency group and consecutive step numbers.

use billbook_core::codec::merge_fields;
use billbook_core::{
    Clock, CodecRegistry, IdGenerator, MutationRecord, NewMutation, OperationType, Provenance,
    StepPosition,
};
use billbook_db::{Database, DocumentRepository, MutationQueueRepository, SqliteConnection};
use std::sync::Arc;
use tracing::debug;

use crate::error::{SyncError, SyncResult};

#[derive(Clone)]
pub struct LocalWriter {
    db: Database,
    codecs: Arc<CodecRegistry>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    provenance: Provenance,
}

impl LocalWriter {
    pub fn new(
        db: Database,
        codecs: Arc<CodecRegistry>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        provenance: Provenance,
    ) -> Self {
        LocalWriter {
            db,
            codecs,
            clock,
            ids,
            provenance,
        }
    }

    pub fn provenance(&self) -> &Provenance {
        &self.provenance
    }

    /// Writes one change locally and queues it.
    ///
    /// ## Returns
    /// The new record's operation id.
    ///
    /// ## Errors
    /// Unknown tables, invalid payloads and updates of documents this device
    /// has never seen are refused before anything is written.
    pub async fn enqueue(&self, mutation: NewMutation) -> SyncResult<String> {
        let mut tx = self.db.begin().await?;
        let record = self.enqueue_in(&mut tx, mutation, None).await?;
        tx.commit().await?;
        Ok(record.operation_id)
    }

    /// Writes and queues a change inside the caller's transaction, so it can
    /// commit together with other application writes.
    pub async fn enqueue_in(
        &self,
        conn: &mut SqliteConnection,
        mutation: NewMutation,
        step: Option<StepPosition>,
    ) -> SyncResult<MutationRecord> {
        let now = self.clock.now();
        let table = mutation.target_collection.clone();
        let document_id = mutation.document_id.clone();

        match mutation.operation_type {
            OperationType::Create => {
                self.codecs.validate(&table, &mutation.payload)?;
                DocumentRepository::put_in(conn, &table, &document_id, &mutation.payload, now)
                    .await?;
            }
            OperationType::Update => {
                self.codecs.get(&table)?;
                let existing = DocumentRepository::get_in(conn, &table, &document_id)
                    .await?
                    .filter(|doc| !doc.is_deleted)
                    .ok_or_else(|| SyncError::NotFound(format!("{table} {document_id}")))?;

                let merged = merge_fields(&existing.data, &mutation.payload);
                self.codecs.validate(&table, &merged)?;
                DocumentRepository::put_in(conn, &table, &document_id, &merged, now).await?;
            }
            OperationType::Delete => {
                self.codecs.get(&table)?;
                DocumentRepository::mark_deleted_in(conn, &table, &document_id, now).await?;
            }
        }

        let record = MutationRecord::new(
            self.ids.next_id(),
            mutation,
            &self.provenance,
            step,
            now,
        );
        MutationQueueRepository::insert_in(conn, &record).await?;

        debug!(
            operation_id = %record.operation_id,
            table = %record.target_collection,
            document_id = %record.document_id,
            step = record.step_number,
            "Local write queued"
        );

        Ok(record)
    }

    /// Writes and queues an ordered multi-step change atomically.
    ///
    /// Step `n + 1` is not dispatched until step `n` has synced; if a step is
    /// dead-lettered the remaining steps follow it.
    ///
    /// ## Example
    /// ```rust,ignore
    /// let ids = writer.enqueue_transaction(vec![
    ///     NewMutation::create("bills", "b-1", bill),
    ///     NewMutation::create("bill_items", "i-1", item),
    /// ]).await?;
    /// ```
    pub async fn enqueue_transaction(&self, steps: Vec<NewMutation>) -> SyncResult<Vec<String>> {
        if steps.is_empty() {
            return Ok(Vec::new());
        }

        let group = self.ids.next_id();
        let total = steps.len() as u32;
        let mut tx = self.db.begin().await?;
        let mut operation_ids: Vec<String> = Vec::with_capacity(steps.len());

        for (index, mutation) in steps.into_iter().enumerate() {
            let step = StepPosition {
                dependency_group: group.clone(),
                parent_operation_id: operation_ids.first().cloned(),
                step_number: index as u32 + 1,
                total_steps: total,
            };
            let record = self.enqueue_in(&mut tx, mutation, Some(step)).await?;
            operation_ids.push(record.operation_id);
        }

        tx.commit().await?;
        debug!(group = %group, steps = total, "Multi-step write queued");
        Ok(operation_ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use billbook_core::{ManualClock, MutationStatus, SequentialIds};
    use billbook_db::DbConfig;
    use serde_json::json;

    async fn writer() -> (Database, LocalWriter) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let writer = LocalWriter::new(
            db.clone(),
            Arc::new(CodecRegistry::with_defaults()),
            Arc::new(ManualClock::at_millis(1_000)),
            Arc::new(SequentialIds::new("op")),
            Provenance {
                owner_id: "biz-1".to_string(),
                user_id: "user-1".to_string(),
                device_id: "dev-1".to_string(),
            },
        );
        (db, writer)
    }

    #[tokio::test]
    async fn test_enqueue_writes_document_and_record() {
        let (db, writer) = writer().await;
        let op = writer
            .enqueue(NewMutation::create(
                "products",
                "p-1",
                json!({"name": "Tea", "price_cents": 150}),
            ))
            .await
            .unwrap();

        let record = db.mutation_queue().get(&op).await.unwrap().unwrap();
        assert_eq!(record.status, MutationStatus::Pending);
        assert_eq!(record.owner_id, "biz-1");

        let doc = db.documents().get("products", "p-1").await.unwrap().unwrap();
        assert_eq!(doc.data["name"], "Tea");
    }

    #[tokio::test]
    async fn test_invalid_payload_writes_nothing() {
        let (db, writer) = writer().await;
        let err = writer
            .enqueue(NewMutation::create("products", "p-1", json!({"name": ""})))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidPayload(_)));

        assert!(db.documents().get("products", "p-1").await.unwrap().is_none());
        assert_eq!(db.mutation_queue().stats().await.unwrap().pending, 0);
    }

    #[tokio::test]
    async fn test_unknown_table_is_refused() {
        let (_db, writer) = writer().await;
        let err = writer
            .enqueue(NewMutation::create("invoices", "x", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidPayload(_)));
    }

    #[tokio::test]
    async fn test_update_merges_into_local_copy() {
        let (db, writer) = writer().await;
        writer
            .enqueue(NewMutation::create(
                "products",
                "p-1",
                json!({"name": "Tea", "price_cents": 150}),
            ))
            .await
            .unwrap();
        writer
            .enqueue(NewMutation::update("products", "p-1", json!({"price_cents": 175})))
            .await
            .unwrap();

        let doc = db.documents().get("products", "p-1").await.unwrap().unwrap();
        assert_eq!(doc.data, json!({"name": "Tea", "price_cents": 175}));

        let missing = writer
            .enqueue(NewMutation::update("products", "nope", json!({"price_cents": 1})))
            .await
            .unwrap_err();
        assert!(matches!(missing, SyncError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_transaction_is_one_dependency_group() {
        let (db, writer) = writer().await;
        let ids = writer
            .enqueue_transaction(vec![
                NewMutation::create(
                    "bills",
                    "b-1",
                    json!({"invoice_number": "INV-1", "bill_date": 1_714_521_600_000i64, "total_amount_cents": 300}),
                ),
                NewMutation::create(
                    "bill_items",
                    "i-1",
                    json!({"bill_id": "b-1", "product_id": "p-1", "qty": 2, "price_cents": 150, "total_cents": 300}),
                ),
            ])
            .await
            .unwrap();
        assert_eq!(ids.len(), 2);

        let first = db.mutation_queue().get(&ids[0]).await.unwrap().unwrap();
        let second = db.mutation_queue().get(&ids[1]).await.unwrap().unwrap();
        assert_eq!(first.dependency_group, second.dependency_group);
        assert_eq!((first.step_number, second.step_number), (1, 2));
        assert_eq!(second.total_steps, 2);
        assert_eq!(second.parent_operation_id.as_deref(), Some(ids[0].as_str()));
        assert_eq!(first.parent_operation_id, None);
    }

    #[tokio::test]
    async fn test_failed_step_rolls_back_whole_transaction() {
        let (db, writer) = writer().await;
        let err = writer
            .enqueue_transaction(vec![
                NewMutation::create(
                    "bills",
                    "b-1",
                    json!({"invoice_number": "INV-1", "bill_date": 1_714_521_600_000i64, "total_amount_cents": 300}),
                ),
                NewMutation::create("bill_items", "i-1", json!({"qty": 0})),
            ])
            .await;
        assert!(err.is_err());

        assert!(db.documents().get("bills", "b-1").await.unwrap().is_none());
        assert_eq!(db.mutation_queue().stats().await.unwrap().pending, 0);
    }
}
