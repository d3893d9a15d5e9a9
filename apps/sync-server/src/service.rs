//! # Reconciliation Service
//!
//! Applies pushed changes and serves pulls, per tenant.
//!
//! ## Push, per change (one transaction each)
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  table has no codec                       ──► unknown_table             │
//! │  operation id seen, same payload          ──► already_applied + echo    │
//! │  operation id seen, other payload         ──► duplicate                 │
//! │                                                                         │
//! │  insert  row exists (even soft-deleted)   ──► duplicate                 │
//! │          payload invalid                  ──► validation                │
//! │          otherwise                        ──► write                     │
//! │                                                                         │
//! │  update  row missing or soft-deleted      ──► not_found                 │
//! │          older than the stored write      ──► superseded + echo         │
//! │          merged document invalid          ──► validation                │
//! │          otherwise                        ──► merge fields, write       │
//! │                                                                         │
//! │  delete  row missing                      ──► not_found                 │
//! │          already soft-deleted             ──► accepted, no new version  │
//! │          older than the stored write      ──► superseded + echo         │
//! │          otherwise                        ──► set is_deleted, write     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every write gets a fresh server version and lands in the idempotency
//! ledger in the same transaction, so a replay never applies twice.

use billbook_core::clock::to_millis;
use billbook_core::codec::merge_fields;
use billbook_core::{
    payload_hash, ChangeAction, ChangeRecord, Clock, CodecRegistry, ConflictReason, PullRequest,
    PullResponse, PushConflict, PushRequest, PushResponse, ServerChange, SystemClock,
};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::identity::Identity;
use crate::store::{RowWrite, ServerStore, StoredRow};

/// What happened to one pushed change.
#[derive(Debug)]
enum ChangeOutcome {
    Applied(ServerChange),
    Rejected {
        conflict: PushConflict,
        current: Option<ServerChange>,
    },
}

/// Server side of the sync protocol.
pub struct ReconciliationService {
    store: ServerStore,
    codecs: Arc<CodecRegistry>,
    clock: Arc<dyn Clock>,
    pull_page_size: u32,
    max_push_batch: usize,
}

impl ReconciliationService {
    pub fn new(store: ServerStore, config: &ServerConfig) -> Self {
        ReconciliationService {
            store,
            codecs: Arc::new(CodecRegistry::with_defaults()),
            clock: Arc::new(SystemClock),
            pull_page_size: config.pull_page_size.max(1),
            max_push_batch: config.max_push_batch.max(1),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_codecs(mut self, codecs: Arc<CodecRegistry>) -> Self {
        self.codecs = codecs;
        self
    }

    pub fn store(&self) -> &ServerStore {
        &self.store
    }

    // =========================================================================
    // Push
    // =========================================================================

    /// Applies a batch of changes, each in its own transaction.
    ///
    /// A rejected change never affects the others. Only storage failures
    /// fail the whole request.
    pub async fn push(&self, identity: &Identity, request: PushRequest) -> ServerResult<PushResponse> {
        if request.changes.len() > self.max_push_batch {
            return Err(ServerError::InvalidRequest(format!(
                "push carries {} changes, limit is {}",
                request.changes.len(),
                self.max_push_batch
            )));
        }

        let device_id = identity
            .device_id
            .clone()
            .unwrap_or_else(|| request.device_id.clone());
        let mut response = PushResponse::default();

        for change in &request.changes {
            match self.apply_change(identity, &device_id, change).await? {
                ChangeOutcome::Applied(echo) => {
                    response.accepted += 1;
                    response.applied.push(echo);
                }
                ChangeOutcome::Rejected { conflict, current } => {
                    debug!(
                        tenant = %identity.tenant_id,
                        table = %conflict.table,
                        id = %conflict.id,
                        reason = %conflict.reason,
                        "Change not applied"
                    );
                    response.rejected += 1;
                    response.conflicts.push(conflict);
                    response.applied.extend(current);
                }
            }
        }

        // Versions can run ahead of the clock within one millisecond.
        response.server_timestamp = response
            .applied
            .iter()
            .map(|c| c.updated_at)
            .fold(to_millis(self.clock.now()), i64::max);
        info!(
            tenant = %identity.tenant_id,
            device_id = %device_id,
            accepted = response.accepted,
            rejected = response.rejected,
            "Push processed"
        );
        Ok(response)
    }

    async fn apply_change(
        &self,
        identity: &Identity,
        device_id: &str,
        change: &ChangeRecord,
    ) -> ServerResult<ChangeOutcome> {
        let tenant = identity.tenant_id.as_str();
        let now = to_millis(self.clock.now());
        let reject = |reason: ConflictReason, message: String, current: Option<ServerChange>| {
            ChangeOutcome::Rejected {
                conflict: PushConflict {
                    id: change.id.clone(),
                    table: change.table.clone(),
                    reason,
                    message: Some(message),
                    operation_id: change.operation_id.clone(),
                },
                current,
            }
        };

        let codec = match self.codecs.get(&change.table) {
            Ok(codec) => codec.clone(),
            Err(e) => return Ok(reject(ConflictReason::UnknownTable, e.to_string(), None)),
        };
        let hash = payload_hash(&change.data);
        let mut tx = self.store.begin().await?;

        if let Some(operation_id) = &change.operation_id {
            if let Some(prior) = ServerStore::find_operation_in(&mut tx, tenant, operation_id).await? {
                let same = prior.payload_hash == hash
                    && prior.table_name == change.table
                    && prior.record_id == change.id;
                if !same {
                    warn!(tenant = %tenant, operation_id = %operation_id, "Operation id replayed with a different payload");
                    return Ok(reject(
                        ConflictReason::Duplicate,
                        format!("operation {operation_id} was already used for another change"),
                        None,
                    ));
                }
                let current = ServerStore::get_in(&mut tx, tenant, &change.table, &change.id)
                    .await?
                    .map(|row| row.to_change());
                return Ok(reject(
                    ConflictReason::AlreadyApplied,
                    format!("operation {operation_id} already applied"),
                    current,
                ));
            }
        }

        let existing = ServerStore::get_in(&mut tx, tenant, &change.table, &change.id).await?;

        let (data, is_deleted) = match change.action {
            ChangeAction::Insert => {
                if existing.is_some() {
                    return Ok(reject(
                        ConflictReason::Duplicate,
                        format!("{}/{} already exists", change.table, change.id),
                        None,
                    ));
                }
                if let Err(e) = codec.validate(&change.data) {
                    return Ok(reject(ConflictReason::Validation, e.to_string(), None));
                }
                (change.data.clone(), false)
            }
            ChangeAction::Update => {
                let Some(row) = existing.as_ref().filter(|row| !row.is_deleted) else {
                    return Ok(reject(
                        ConflictReason::NotFound,
                        format!("{}/{} does not exist", change.table, change.id),
                        None,
                    ));
                };
                if change.local_timestamp < row.client_timestamp {
                    return self.supersede(tx, identity, change, &hash, row, now).await;
                }
                let merged = merge_fields(&row.data, &change.data);
                if let Err(e) = codec.validate(&merged) {
                    return Ok(reject(ConflictReason::Validation, e.to_string(), None));
                }
                (merged, false)
            }
            ChangeAction::Delete => {
                let Some(row) = existing.as_ref() else {
                    return Ok(reject(
                        ConflictReason::NotFound,
                        format!("{}/{} does not exist", change.table, change.id),
                        None,
                    ));
                };
                if row.is_deleted {
                    self.record(&mut tx, tenant, change, &hash, now).await?;
                    tx.commit().await?;
                    return Ok(ChangeOutcome::Applied(row.to_change()));
                }
                if change.local_timestamp < row.client_timestamp {
                    return self.supersede(tx, identity, change, &hash, row, now).await;
                }
                (row.data.clone(), true)
            }
        };

        let version = ServerStore::next_version_in(&mut tx, tenant, &change.table, now).await?;
        let written = ServerStore::write_in(
            &mut tx,
            tenant,
            &RowWrite {
                table: &change.table,
                id: &change.id,
                data: &data,
                is_deleted,
                version,
                client_timestamp: change.local_timestamp,
                device_id,
                user_id: &identity.user_id,
            },
            now,
        )
        .await?;
        self.record(&mut tx, tenant, change, &hash, now).await?;
        tx.commit().await?;

        debug!(
            tenant = %tenant,
            table = %change.table,
            id = %change.id,
            action = %change.action,
            version,
            "Change applied"
        );
        Ok(ChangeOutcome::Applied(written.to_change()))
    }

    /// A newer write already landed. The stale one is recorded as handled
    /// and the current row is echoed back.
    async fn supersede(
        &self,
        mut tx: sqlx::Transaction<'static, sqlx::Sqlite>,
        identity: &Identity,
        change: &ChangeRecord,
        hash: &str,
        current: &StoredRow,
        now: i64,
    ) -> ServerResult<ChangeOutcome> {
        self.record(&mut tx, &identity.tenant_id, change, hash, now).await?;
        tx.commit().await?;

        Ok(ChangeOutcome::Rejected {
            conflict: PushConflict {
                id: change.id.clone(),
                table: change.table.clone(),
                reason: ConflictReason::Superseded,
                message: Some(format!(
                    "change from {} is older than the stored write from {}",
                    change.local_timestamp, current.client_timestamp
                )),
                operation_id: change.operation_id.clone(),
            },
            current: Some(current.to_change()),
        })
    }

    async fn record(
        &self,
        conn: &mut sqlx::SqliteConnection,
        tenant: &str,
        change: &ChangeRecord,
        hash: &str,
        now: i64,
    ) -> ServerResult<()> {
        match &change.operation_id {
            Some(operation_id) => {
                ServerStore::record_operation_in(
                    conn,
                    tenant,
                    operation_id,
                    hash,
                    &change.table,
                    &change.id,
                    now,
                )
                .await
            }
            None => Ok(()),
        }
    }

    // =========================================================================
    // Pull
    // =========================================================================

    /// Rows changed after the caller's watermark, oldest first.
    ///
    /// Rows sharing the watermark version are ordered by `(table, id)`; the
    /// `afterTable`/`afterId` pair resumes inside that run. A single-table
    /// pull may omit `afterTable`.
    pub async fn pull(&self, identity: &Identity, request: PullRequest) -> ServerResult<PullResponse> {
        let tables = match request.tables {
            Some(tables) if !tables.is_empty() => {
                if let Some(unknown) = tables.iter().find(|t| !self.codecs.contains(t)) {
                    return Err(ServerError::InvalidRequest(format!("unknown table: {unknown}")));
                }
                tables
            }
            _ => self.codecs.tables(),
        };

        let limit = request
            .limit
            .unwrap_or(self.pull_page_size)
            .clamp(1, self.pull_page_size);
        let resume = match (request.after_id.as_deref(), request.after_table.as_deref()) {
            (Some(id), Some(table)) => Some((table, id)),
            (Some(id), None) => match tables.as_slice() {
                [only] => Some((only.as_str(), id)),
                _ => {
                    return Err(ServerError::InvalidRequest(
                        "afterId on a multi-table pull requires afterTable".to_string(),
                    ))
                }
            },
            (None, _) => None,
        };

        let mut rows: Vec<StoredRow> = Vec::new();
        for table in &tables {
            let after_id = resume.and_then(|(after_table, id)| tie_break(table, after_table, id));
            rows.extend(
                self.store
                    .changes_since(&identity.tenant_id, table, request.last_synced_at, after_id, limit + 1)
                    .await?,
            );
        }
        rows.sort_by(|a, b| {
            (a.updated_at, &a.table, &a.id).cmp(&(b.updated_at, &b.table, &b.id))
        });

        let has_more = rows.len() > limit as usize;
        rows.truncate(limit as usize);

        let server_timestamp = match rows.last() {
            Some(last) if has_more => last.updated_at,
            Some(last) => last.updated_at.max(to_millis(self.clock.now())),
            None => request
                .last_synced_at
                .unwrap_or(i64::MIN)
                .max(to_millis(self.clock.now())),
        };

        debug!(
            tenant = %identity.tenant_id,
            tables = tables.len(),
            returned = rows.len(),
            has_more,
            server_timestamp,
            "Pull served"
        );

        Ok(PullResponse {
            changes: rows.iter().map(StoredRow::to_change).collect(),
            server_timestamp,
            has_more,
        })
    }
}

/// Id lower bound for `table` at the watermark version, resuming after
/// `(after_table, after_id)`. `None` admits only newer versions.
fn tie_break<'a>(table: &str, after_table: &str, after_id: &'a str) -> Option<&'a str> {
    match table.cmp(after_table) {
        Ordering::Less => None,
        Ordering::Equal => Some(after_id),
        Ordering::Greater => Some(""),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use billbook_core::ManualClock;
    use serde_json::{json, Value};

    async fn service() -> (ReconciliationService, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at_millis(1_000));
        let store = ServerStore::connect(&ServerConfig::in_memory()).await.unwrap();
        let mut config = ServerConfig::in_memory();
        config.pull_page_size = 2;
        let service = ReconciliationService::new(store, &config).with_clock(clock.clone());
        (service, clock)
    }

    fn who() -> Identity {
        Identity::new("biz-1", "user-1")
    }

    fn change(action: ChangeAction, id: &str, data: Value, at: i64, op: &str) -> ChangeRecord {
        ChangeRecord {
            table: "products".to_string(),
            action,
            id: id.to_string(),
            data,
            local_timestamp: at,
            operation_id: Some(op.to_string()),
            payload_hash: None,
        }
    }

    fn push(changes: Vec<ChangeRecord>) -> PushRequest {
        PushRequest {
            changes,
            device_id: "dev-1".to_string(),
            last_synced_at: None,
        }
    }

    fn tea() -> Value {
        json!({"name": "Tea", "price_cents": 150})
    }

    #[tokio::test]
    async fn test_insert_then_update_merges() {
        let (service, _) = service().await;
        let response = service
            .push(&who(), push(vec![
                change(ChangeAction::Insert, "p-1", tea(), 10, "op-1"),
                change(ChangeAction::Update, "p-1", json!({"price_cents": 175}), 20, "op-2"),
            ]))
            .await
            .unwrap();

        assert_eq!((response.accepted, response.rejected), (2, 0));
        let row = service.store().get("biz-1", "products", "p-1").await.unwrap().unwrap();
        assert_eq!(row.data, json!({"name": "Tea", "price_cents": 175}));
        assert!(response.applied[1].updated_at > response.applied[0].updated_at);
    }

    #[tokio::test]
    async fn test_replay_is_already_applied() {
        let (service, _) = service().await;
        let insert = change(ChangeAction::Insert, "p-1", tea(), 10, "op-1");

        service.push(&who(), push(vec![insert.clone()])).await.unwrap();
        let replay = service.push(&who(), push(vec![insert])).await.unwrap();

        assert_eq!(replay.accepted, 0);
        let conflict = replay.conflict_for("products", "p-1").unwrap();
        assert_eq!(conflict.reason, ConflictReason::AlreadyApplied);
        assert!(replay.applied_for("products", "p-1").is_some());
        assert_eq!(service.store().count_operations("biz-1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_reused_operation_id_is_duplicate() {
        let (service, _) = service().await;
        service
            .push(&who(), push(vec![change(ChangeAction::Insert, "p-1", tea(), 10, "op-1")]))
            .await
            .unwrap();

        let response = service
            .push(&who(), push(vec![change(ChangeAction::Insert, "p-2", tea(), 10, "op-1")]))
            .await
            .unwrap();
        assert_eq!(
            response.conflict_for("products", "p-2").unwrap().reason,
            ConflictReason::Duplicate
        );
        assert!(service.store().get("biz-1", "products", "p-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_insert_existing_id_is_duplicate() {
        let (service, _) = service().await;
        let response = service
            .push(&who(), push(vec![
                change(ChangeAction::Insert, "p-1", tea(), 10, "op-1"),
                change(ChangeAction::Insert, "p-1", tea(), 11, "op-2"),
            ]))
            .await
            .unwrap();
        assert_eq!((response.accepted, response.rejected), (1, 1));
        assert_eq!(response.conflicts[0].reason, ConflictReason::Duplicate);
    }

    #[tokio::test]
    async fn test_update_of_deleted_row_is_not_found() {
        let (service, _) = service().await;
        let response = service
            .push(&who(), push(vec![
                change(ChangeAction::Insert, "p-1", tea(), 10, "op-1"),
                change(ChangeAction::Delete, "p-1", json!({}), 20, "op-2"),
                change(ChangeAction::Update, "p-1", json!({"price_cents": 1}), 30, "op-3"),
                change(ChangeAction::Update, "nope", json!({"price_cents": 1}), 30, "op-4"),
            ]))
            .await
            .unwrap();

        assert_eq!(response.accepted, 2);
        assert_eq!(
            response.conflict_for("products", "p-1").unwrap().reason,
            ConflictReason::NotFound
        );
        assert_eq!(
            response.conflict_for("products", "nope").unwrap().reason,
            ConflictReason::NotFound
        );

        let row = service.store().get("biz-1", "products", "p-1").await.unwrap().unwrap();
        assert!(row.is_deleted);
        assert_eq!(row.data["name"], "Tea");
    }

    #[tokio::test]
    async fn test_repeated_delete_is_accepted() {
        let (service, _) = service().await;
        let response = service
            .push(&who(), push(vec![
                change(ChangeAction::Insert, "p-1", tea(), 10, "op-1"),
                change(ChangeAction::Delete, "p-1", json!({}), 20, "op-2"),
                change(ChangeAction::Delete, "p-1", json!({}), 30, "op-3"),
            ]))
            .await
            .unwrap();
        assert_eq!(response.accepted, 3);
        assert_eq!(response.applied[2].action, ChangeAction::Delete);
        assert_eq!(response.applied[2].updated_at, response.applied[1].updated_at);
    }

    #[tokio::test]
    async fn test_stale_update_is_superseded() {
        let (service, _) = service().await;
        let response = service
            .push(&who(), push(vec![
                change(ChangeAction::Insert, "p-1", tea(), 10, "op-1"),
                change(ChangeAction::Update, "p-1", json!({"price_cents": 300}), 50, "op-2"),
                change(ChangeAction::Update, "p-1", json!({"price_cents": 200}), 40, "op-3"),
            ]))
            .await
            .unwrap();

        let conflict = response.conflict_for("products", "p-1").unwrap();
        assert_eq!(conflict.reason, ConflictReason::Superseded);
        assert_eq!(response.applied.last().unwrap().data["price_cents"], 300);

        let row = service.store().get("biz-1", "products", "p-1").await.unwrap().unwrap();
        assert_eq!(row.data["price_cents"], 300);
    }

    #[tokio::test]
    async fn test_validation_and_unknown_table() {
        let (service, _) = service().await;
        let mut unknown = change(ChangeAction::Insert, "x", json!({}), 10, "op-2");
        unknown.table = "invoices".to_string();

        let response = service
            .push(&who(), push(vec![
                change(ChangeAction::Insert, "p-1", json!({"name": ""}), 10, "op-1"),
                unknown,
            ]))
            .await
            .unwrap();
        assert_eq!(response.rejected, 2);
        assert_eq!(response.conflicts[0].reason, ConflictReason::Validation);
        assert_eq!(response.conflicts[1].reason, ConflictReason::UnknownTable);
    }

    #[tokio::test]
    async fn test_push_batch_limit() {
        let (service, _) = service().await;
        let changes = (0..501)
            .map(|i| change(ChangeAction::Insert, &format!("p-{i}"), tea(), 10, &format!("op-{i}")))
            .collect();
        assert!(matches!(
            service.push(&who(), push(changes)).await,
            Err(ServerError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_pull_returns_only_newer_rows_and_pages() {
        let (service, clock) = service().await;
        for i in 0..3 {
            clock.advance(chrono::Duration::milliseconds(10));
            service
                .push(&who(), push(vec![change(
                    ChangeAction::Insert,
                    &format!("p-{i}"),
                    tea(),
                    10,
                    &format!("op-{i}"),
                )]))
                .await
                .unwrap();
        }

        let first = service.pull(&who(), PullRequest::default()).await.unwrap();
        assert_eq!(first.changes.len(), 2);
        assert!(first.has_more);

        let cursor = first.next_cursor().unwrap();
        let second = service
            .pull(&who(), PullRequest::for_table("products", Some(&cursor), 10))
            .await
            .unwrap();
        assert_eq!(second.changes.len(), 1);
        assert_eq!(second.changes[0].id, "p-2");
        assert!(!second.has_more);

        let done = service
            .pull(&who(), PullRequest::for_table("products", second.next_cursor().as_ref(), 10))
            .await
            .unwrap();
        assert!(done.changes.is_empty());
    }

    #[tokio::test]
    async fn test_pull_is_tenant_scoped() {
        let (service, _) = service().await;
        service
            .push(&who(), push(vec![change(ChangeAction::Insert, "p-1", tea(), 10, "op-1")]))
            .await
            .unwrap();

        let other = Identity::new("biz-2", "user-9");
        let response = service.pull(&other, PullRequest::default()).await.unwrap();
        assert!(response.changes.is_empty());

        let unknown = PullRequest {
            tables: Some(vec!["invoices".to_string()]),
            ..Default::default()
        };
        assert!(service.pull(&who(), unknown).await.is_err());
    }

    #[tokio::test]
    async fn test_deleted_rows_pull_as_delete() {
        let (service, _) = service().await;
        service
            .push(&who(), push(vec![
                change(ChangeAction::Insert, "p-1", tea(), 10, "op-1"),
                change(ChangeAction::Delete, "p-1", json!({}), 20, "op-2"),
            ]))
            .await
            .unwrap();

        let response = service.pull(&who(), PullRequest::default()).await.unwrap();
        assert_eq!(response.changes.len(), 1);
        assert_eq!(response.changes[0].action, ChangeAction::Delete);
    }

    #[tokio::test]
    async fn test_repull_from_server_timestamp_is_empty() {
        let (service, _) = service().await;
        let pushed = service
            .push(&who(), push(vec![
                change(ChangeAction::Insert, "p-1", tea(), 10, "op-1"),
                change(ChangeAction::Insert, "p-2", tea(), 10, "op-2"),
            ]))
            .await
            .unwrap();
        // Both writes land in the same millisecond.
        let versions: Vec<i64> = pushed.applied.iter().map(|c| c.updated_at).collect();
        assert_eq!(versions, vec![1_000, 1_001]);
        assert_eq!(pushed.server_timestamp, 1_001);

        let products = || PullRequest {
            tables: Some(vec!["products".to_string()]),
            ..Default::default()
        };
        let first = service.pull(&who(), products()).await.unwrap();
        assert_eq!(first.changes.len(), 2);
        assert!(!first.has_more);
        assert_eq!(first.server_timestamp, 1_001);

        let again = service
            .pull(&who(), PullRequest {
                last_synced_at: Some(first.server_timestamp),
                ..products()
            })
            .await
            .unwrap();
        assert!(again.changes.is_empty());
        assert_eq!(again.server_timestamp, 1_001);
    }

    #[tokio::test]
    async fn test_multi_table_pages_split_equal_versions() {
        let (service, clock) = service().await;
        let mut bill = change(
            ChangeAction::Insert,
            "b-1",
            json!({"invoice_number": "INV-1", "bill_date": 1_700_000_000_000i64, "total_amount_cents": 300}),
            10,
            "op-b",
        );
        bill.table = "bills".to_string();
        let mut customer = change(ChangeAction::Insert, "c-1", json!({"name": "Asha"}), 10, "op-c");
        customer.table = "customers".to_string();
        let pushed = service
            .push(&who(), push(vec![
                bill,
                customer,
                change(ChangeAction::Insert, "p-1", tea(), 10, "op-p"),
            ]))
            .await
            .unwrap();
        assert_eq!(pushed.accepted, 3);
        assert!(pushed.applied.iter().all(|c| c.updated_at == 1_000));
        clock.advance(chrono::Duration::seconds(4));

        let request = PullRequest::default();
        let first = service.pull(&who(), request.clone()).await.unwrap();
        let ids: Vec<&str> = first.changes.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["b-1", "c-1"]);
        assert!(first.has_more);
        assert_eq!(first.server_timestamp, 1_000);

        let second = service.pull(&who(), request.resume_after(&first)).await.unwrap();
        let ids: Vec<&str> = second.changes.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["p-1"]);
        assert!(!second.has_more);
        assert_eq!(second.server_timestamp, 5_000);

        let done = service
            .pull(&who(), PullRequest {
                last_synced_at: Some(second.server_timestamp),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(done.changes.is_empty());
    }

    #[tokio::test]
    async fn test_multi_table_after_id_needs_table() {
        let (service, _) = service().await;
        let request = PullRequest {
            last_synced_at: Some(1_000),
            after_id: Some("c-1".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            service.pull(&who(), request).await,
            Err(ServerError::InvalidRequest(_))
        ));

        assert_eq!(tie_break("bills", "customers", "c-1"), None);
        assert_eq!(tie_break("customers", "customers", "c-1"), Some("c-1"));
        assert_eq!(tie_break("products", "customers", "c-1"), Some(""));
    }
}
