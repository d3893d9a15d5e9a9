//! Devices syncing against an in-process reconciliation service.

use async_trait::async_trait;
use billbook_core::{
    ManualClock, MutationStatus, NewMutation, PullRequest, PullResponse, PushRequest,
    PushResponse, SequentialIds,
};
use billbook_db::{Database, DbConfig};
use billbook_sync::error::status_error;
use billbook_sync::{SyncClient, SyncConfig, SyncDispatcher, SyncError, SyncResult, SyncTrigger};
use billbook_sync_server::{Identity, ReconciliationService, ServerConfig, ServerError, ServerStore};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Calls the service directly with the identity the HTTP layer would derive.
struct LoopbackClient {
    service: Arc<ReconciliationService>,
    identity: Identity,
    /// Applies the next push but loses the response on the way back.
    drop_next_reply: AtomicBool,
}

fn to_sync_error(err: ServerError) -> SyncError {
    let status = match err {
        ServerError::Unauthenticated(_) => 401,
        ServerError::InvalidRequest(_) => 400,
        _ => 500,
    };
    status_error(status, err.to_string())
}

#[async_trait]
impl SyncClient for LoopbackClient {
    async fn push(&self, request: PushRequest) -> SyncResult<PushResponse> {
        let response = self
            .service
            .push(&self.identity, request)
            .await
            .map_err(to_sync_error)?;
        if self.drop_next_reply.swap(false, Ordering::SeqCst) {
            return Err(SyncError::ConnectionFailed("connection reset".into()));
        }
        Ok(response)
    }

    async fn pull(&self, request: PullRequest) -> SyncResult<PullResponse> {
        self.service
            .pull(&self.identity, request)
            .await
            .map_err(to_sync_error)
    }
}

struct Device {
    db: Database,
    clock: Arc<ManualClock>,
    client: Arc<LoopbackClient>,
    dispatcher: Arc<SyncDispatcher>,
}

async fn server() -> Arc<ReconciliationService> {
    let config = ServerConfig::in_memory();
    let store = ServerStore::connect(&config).await.unwrap();
    Arc::new(ReconciliationService::new(store, &config))
}

async fn device(service: &Arc<ReconciliationService>, name: &str) -> Device {
    let db = Database::new(DbConfig::in_memory()).await.unwrap();
    let clock = Arc::new(ManualClock::at_millis(1_700_000_000_000));

    let mut config = SyncConfig::default();
    config.device.id = name.to_string();
    config.device.owner_id = "biz-1".to_string();
    config.device.user_id = format!("{name}-user");
    config.retry.jitter = 0.0;

    let mut identity = Identity::new(&config.device.owner_id, &config.device.user_id);
    identity.device_id = Some(config.device.id.clone());
    let client = Arc::new(LoopbackClient {
        service: service.clone(),
        identity,
        drop_next_reply: AtomicBool::new(false),
    });

    let dispatcher = SyncDispatcher::builder(config, db.clone(), client.clone())
        .with_clock(clock.clone())
        .with_ids(Arc::new(SequentialIds::new(name)))
        .build()
        .unwrap();

    Device {
        db,
        clock,
        client,
        dispatcher: Arc::new(dispatcher),
    }
}

async fn sync(device: &Device) -> billbook_sync::CycleReport {
    match device.dispatcher.trigger_manual_sync().await.unwrap() {
        SyncTrigger::Completed(report) => report,
        SyncTrigger::Coalesced => panic!("unexpected coalesce"),
    }
}

fn customer(id: &str, name: &str) -> NewMutation {
    NewMutation::create("customers", id, json!({"name": name}))
}

#[tokio::test]
async fn test_queue_drains_to_server() {
    let service = server().await;
    let a = device(&service, "dev-a").await;

    a.dispatcher
        .enqueue(NewMutation::create(
            "products",
            "p-1",
            json!({"name": "Tea", "price_cents": 150}),
        ))
        .await
        .unwrap();
    a.dispatcher
        .enqueue_transaction(vec![
            NewMutation::create(
                "bills",
                "b-1",
                json!({"invoice_number": "INV-1", "bill_date": 1_700_000_000_000i64, "total_amount_cents": 150}),
            ),
            NewMutation::create(
                "bill_items",
                "i-1",
                json!({"bill_id": "b-1", "qty": 1, "price_cents": 150, "total_cents": 150}),
            ),
        ])
        .await
        .unwrap();

    let report = sync(&a).await;
    assert_eq!(report.synced, 3);
    assert_eq!(report.dead_lettered, 0);

    let stats = a.dispatcher.stats().await.unwrap();
    assert_eq!(stats.outstanding(), 0);

    let store = service.store();
    for (table, id) in [("products", "p-1"), ("bills", "b-1"), ("bill_items", "i-1")] {
        let row = store.get("biz-1", table, id).await.unwrap();
        assert!(row.is_some(), "{table}/{id} missing on server");
    }

    // Local copies carry the server version.
    let doc = a.db.documents().get("products", "p-1").await.unwrap().unwrap();
    let server_row = store.get("biz-1", "products", "p-1").await.unwrap().unwrap();
    assert_eq!(doc.server_version, Some(server_row.updated_at));
}

#[tokio::test]
async fn test_lost_reply_is_replayed_idempotently() {
    let service = server().await;
    let a = device(&service, "dev-a").await;

    let op = a.dispatcher.enqueue(customer("c-1", "Asha")).await.unwrap();
    a.client.drop_next_reply.store(true, Ordering::SeqCst);

    let report = sync(&a).await;
    assert_eq!(report.retried, 1);
    let record = a.db.mutation_queue().get(&op).await.unwrap().unwrap();
    assert_eq!(record.status, MutationStatus::Retry);

    a.clock.advance(chrono::Duration::seconds(1));
    let report = sync(&a).await;
    assert_eq!(report.synced, 1);

    let record = a.db.mutation_queue().get(&op).await.unwrap().unwrap();
    assert_eq!(record.status, MutationStatus::Synced);
    assert_eq!(service.store().count_operations("biz-1").await.unwrap(), 1);
}

#[tokio::test]
async fn test_changes_flow_between_devices() {
    let service = server().await;
    let a = device(&service, "dev-a").await;
    let b = device(&service, "dev-b").await;

    a.dispatcher.enqueue(customer("c-1", "Asha")).await.unwrap();
    sync(&a).await;

    let report = b.dispatcher.pull_changes().await.unwrap();
    assert_eq!(report.applied, 1);
    let doc = b.db.documents().get("customers", "c-1").await.unwrap().unwrap();
    assert_eq!(doc.data["name"], "Asha");

    b.clock.advance(chrono::Duration::seconds(5));
    b.dispatcher
        .enqueue(NewMutation::update("customers", "c-1", json!({"name": "Asha K"})))
        .await
        .unwrap();
    assert_eq!(sync(&b).await.synced, 1);

    a.dispatcher.pull_changes().await.unwrap();
    let doc = a.db.documents().get("customers", "c-1").await.unwrap().unwrap();
    assert_eq!(doc.data["name"], "Asha K");
}

#[tokio::test]
async fn test_update_after_remote_delete_is_dead_lettered() {
    let service = server().await;
    let a = device(&service, "dev-a").await;
    let b = device(&service, "dev-b").await;

    a.dispatcher.enqueue(customer("c-1", "Asha")).await.unwrap();
    sync(&a).await;
    b.dispatcher.pull_changes().await.unwrap();

    a.clock.advance(chrono::Duration::seconds(1));
    a.dispatcher
        .enqueue(NewMutation::delete("customers", "c-1"))
        .await
        .unwrap();
    assert_eq!(sync(&a).await.synced, 1);

    b.clock.advance(chrono::Duration::seconds(2));
    let op = b
        .dispatcher
        .enqueue(NewMutation::update("customers", "c-1", json!({"name": "Asha K"})))
        .await
        .unwrap();
    let report = sync(&b).await;
    assert_eq!(report.dead_lettered, 1);

    let dead = b.dispatcher.dead_letters().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].original_operation_id, op);
    assert!(dead[0].failure_reason.contains("does not exist"));
    assert_eq!(b.dispatcher.stats().await.unwrap().dead_letter, 1);
}
