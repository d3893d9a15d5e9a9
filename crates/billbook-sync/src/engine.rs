//! # Sync Engine
//!
//! Runs the dispatcher in the background for the lifetime of the app.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           SyncEngine loop                               │
//! │                                                                         │
//! │   start()  ──► recover IN_PROGRESS ──► spawn loop                       │
//! │                                                                         │
//! │   loop select! {                                                        │
//! │       shutdown          ──► break                                       │
//! │       wake (enqueue)    ──► push cycle                                  │
//! │       poll interval     ──► push cycle   (picks up due RETRY records)   │
//! │       pull interval     ──► pull all tables, then push cycle            │
//! │   }                                                                     │
//! │                                                                         │
//! │   Errors inside the loop are logged and the loop keeps going; the       │
//! │   queue is durable so nothing is lost between ticks.                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use billbook_core::{NewMutation, QueueStats};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::dispatcher::{SyncDispatcher, SyncTrigger};
use crate::error::{SyncError, SyncResult};
use crate::events::{EventSubscription, StatsSubscription};

// =============================================================================
// Engine
// =============================================================================

/// Owns the background loop. Drop or [`shutdown`](Self::shutdown) to stop it.
pub struct SyncEngine {
    dispatcher: Arc<SyncDispatcher>,
    poll_interval: Duration,
    pull_interval: Duration,
    wake: Arc<Notify>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl SyncEngine {
    pub fn new(dispatcher: Arc<SyncDispatcher>, config: &SyncConfig) -> Self {
        SyncEngine {
            dispatcher,
            poll_interval: config.poll_interval(),
            pull_interval: config.pull_interval(),
            wake: Arc::new(Notify::new()),
            shutdown_tx: None,
            task: None,
        }
    }

    pub fn dispatcher(&self) -> &Arc<SyncDispatcher> {
        &self.dispatcher
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Recovers interrupted attempts and spawns the loop.
    ///
    /// ## Returns
    /// A handle the app keeps for enqueueing and manual syncs.
    pub async fn start(&mut self) -> SyncResult<SyncEngineHandle> {
        if self.task.is_some() {
            return Err(SyncError::Internal("sync engine already started".into()));
        }

        let recovered = self.dispatcher.recover().await?;
        info!(
            recovered,
            poll_secs = self.poll_interval.as_secs(),
            pull_secs = self.pull_interval.as_secs(),
            "Starting sync engine"
        );

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        self.task = Some(tokio::spawn(run_loop(
            self.dispatcher.clone(),
            self.wake.clone(),
            shutdown_rx,
            self.poll_interval,
            self.pull_interval,
        )));
        self.shutdown_tx = Some(shutdown_tx.clone());

        // First cycle right away rather than one poll interval later.
        self.wake.notify_one();

        Ok(SyncEngineHandle {
            dispatcher: self.dispatcher.clone(),
            wake: self.wake.clone(),
            shutdown_tx,
        })
    }

    /// Stops the loop and waits for the cycle in flight to finish.
    pub async fn shutdown(&mut self) -> SyncResult<()> {
        info!("Shutting down sync engine");

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
        if let Some(task) = self.task.take() {
            task.await
                .map_err(|e| SyncError::Internal(format!("sync loop panicked: {e}")))?;
        }

        info!("Sync engine stopped");
        Ok(())
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Cheap handle for app code. Every call returns without waiting on the
/// network.
#[derive(Clone)]
pub struct SyncEngineHandle {
    dispatcher: Arc<SyncDispatcher>,
    wake: Arc<Notify>,
    shutdown_tx: mpsc::Sender<()>,
}

impl SyncEngineHandle {
    /// Writes locally, queues, and nudges the loop.
    pub async fn enqueue(&self, mutation: NewMutation) -> SyncResult<String> {
        let operation_id = self.dispatcher.enqueue(mutation).await?;
        self.wake.notify_one();
        Ok(operation_id)
    }

    pub async fn enqueue_transaction(&self, steps: Vec<NewMutation>) -> SyncResult<Vec<String>> {
        let operation_ids = self.dispatcher.enqueue_transaction(steps).await?;
        self.wake.notify_one();
        Ok(operation_ids)
    }

    /// Asks the loop for a push cycle now.
    pub fn sync_now(&self) {
        self.wake.notify_one();
    }

    pub async fn stats(&self) -> SyncResult<QueueStats> {
        self.dispatcher.stats().await
    }

    pub fn subscribe_events(&self) -> EventSubscription {
        self.dispatcher.subscribe_events()
    }

    pub fn subscribe_stats(&self) -> StatsSubscription {
        self.dispatcher.subscribe_stats()
    }

    pub fn dispatcher(&self) -> &Arc<SyncDispatcher> {
        &self.dispatcher
    }

    /// Signals the loop to stop after the current cycle.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

// =============================================================================
// Loop
// =============================================================================

async fn run_loop(
    dispatcher: Arc<SyncDispatcher>,
    wake: Arc<Notify>,
    mut shutdown_rx: mpsc::Receiver<()>,
    poll_interval: Duration,
    pull_interval: Duration,
) {
    let mut poll = tokio::time::interval(poll_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    poll.reset();

    let mut pull = tokio::time::interval(pull_interval);
    pull.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.recv() => {
                debug!("Sync loop received shutdown");
                break;
            }

            _ = wake.notified() => {
                push(&dispatcher).await;
            }

            _ = poll.tick() => {
                push(&dispatcher).await;
            }

            _ = pull.tick() => {
                match dispatcher.pull_changes().await {
                    Ok(report) => debug!(received = report.received, "Pull finished"),
                    Err(e) if e.is_retryable() => {
                        debug!(error = %e, "Pull skipped, server unreachable")
                    }
                    Err(e) => warn!(error = %e, "Pull failed"),
                }
                push(&dispatcher).await;
            }
        }
    }

    info!("Sync loop stopped");
}

async fn push(dispatcher: &SyncDispatcher) {
    match dispatcher.trigger_manual_sync().await {
        Ok(SyncTrigger::Completed(report)) => {
            if report.attempted > 0 {
                debug!(synced = report.synced, retried = report.retried, "Push cycle done");
            }
        }
        Ok(SyncTrigger::Coalesced) => {}
        Err(e) => warn!(error = %e, "Push cycle failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::SyncClient;
    use async_trait::async_trait;
    use billbook_core::{PullRequest, PullResponse, PushRequest, PushResponse};
    use billbook_db::{Database, DbConfig};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct AcceptAll {
        pulls: AtomicU32,
    }

    #[async_trait]
    impl SyncClient for AcceptAll {
        async fn push(&self, request: PushRequest) -> SyncResult<PushResponse> {
            Ok(PushResponse {
                accepted: request.changes.len() as u32,
                ..Default::default()
            })
        }

        async fn pull(&self, _request: PullRequest) -> SyncResult<PullResponse> {
            self.pulls.fetch_add(1, Ordering::SeqCst);
            Ok(PullResponse::default())
        }
    }

    async fn engine(client: Arc<AcceptAll>) -> (Database, SyncEngine) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let mut config = SyncConfig::default();
        config.dispatch.poll_interval_secs = 3600;
        config.dispatch.pull_interval_secs = 3600;

        let dispatcher = SyncDispatcher::builder(config.clone(), db.clone(), client)
            .build()
            .unwrap();
        (db, SyncEngine::new(Arc::new(dispatcher), &config))
    }

    #[tokio::test]
    async fn test_enqueue_wakes_the_loop() {
        let (db, mut engine) = engine(Arc::new(AcceptAll::default())).await;
        let handle = engine.start().await.unwrap();
        let mut events = handle.subscribe_events();

        let op = handle
            .enqueue(NewMutation::create(
                "products",
                "p-1",
                json!({"name": "Tea", "price_cents": 150}),
            ))
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.operation_id, op);
        assert!(event.is_synced());
        assert!(db.mutation_queue().get(&op).await.unwrap().unwrap().synced_at.is_some());

        engine.shutdown().await.unwrap();
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn test_first_pull_runs_on_start() {
        let client = Arc::new(AcceptAll::default());
        let (_db, mut engine) = engine(client.clone()).await;
        engine.start().await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while client.pulls.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_twice_is_refused() {
        let (_db, mut engine) = engine(Arc::new(AcceptAll::default())).await;
        engine.start().await.unwrap();
        assert!(engine.start().await.is_err());
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_handle_shutdown_stops_loop() {
        let (_db, mut engine) = engine(Arc::new(AcceptAll::default())).await;
        let handle = engine.start().await.unwrap();

        handle.shutdown().await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while engine.is_running() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }
}
