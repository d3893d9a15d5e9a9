//! # Sync Dispatcher
//!
//! Drains the local mutation queue to the server and pulls server changes
//! back.
//!
//! ## Cycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  trigger_manual_sync()  (single flight, extra calls coalesce)           │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  ┌─ round ──────────────────────────────────────────────────────────┐  │
//! │  │ 1. select eligible   PENDING, or RETRY past its backoff          │  │
//! │  │                      priority asc, created_at asc                │  │
//! │  │                      group step n+1 waits for step n SYNCED      │  │
//! │  │ 2. claim             CAS PENDING/RETRY ──► IN_PROGRESS           │  │
//! │  │ 3. push              up to `worker_pool` in flight, timeout each │  │
//! │  │ 4. settle            accepted   ──► reconcile ──► SYNCED         │  │
//! │  │                      transient  ──► RETRY (+backoff)             │  │
//! │  │                                     or DEAD_LETTER at ceiling    │  │
//! │  │                      permanent  ──► DEAD_LETTER                  │  │
//! │  └──────────────────────────────────────────────────────────────────┘  │
//! │        │ repeat until nothing is eligible or max rounds                 │
//! │        ▼                                                                │
//! │  purge old SYNCED records, publish stats                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The caller of `enqueue` never waits on any of this. Failures surface
//! through the event and stats streams and the dead-letter store.

use billbook_core::{
    ChangeRecord, Clock, CodecRegistry, ConflictReason, DeadLetterEntry, IdGenerator,
    MutationRecord, NewMutation, Provenance, PullRequest, PushRequest, PushResponse, QueueStats,
    ServerChange, StepPosition, SystemClock, UuidGenerator,
};
use billbook_db::{Database, DeadLetterRepository, MutationQueueRepository};
use futures_util::stream::{self, StreamExt};
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::client::SyncClient;
use crate::config::{DispatchSettings, SyncConfig};
use crate::error::{FailureClass, SyncError, SyncResult};
use crate::events::{AttemptOutcome, EventBus, EventSubscription, StatsSubscription, SyncEvent};
use crate::reconciler::{ReconcileOutcome, ReconcileSource, Reconciler};
use crate::retry::RetryPolicy;
use crate::writer::LocalWriter;

// =============================================================================
// Reports
// =============================================================================

/// Totals for one or more drain cycles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub cycles: u32,
    pub rounds: u32,
    pub attempted: u32,
    pub synced: u32,
    pub retried: u32,
    /// Entries created, cascaded group steps included.
    pub dead_lettered: u32,
    pub conflicts: u32,
    pub purged: u64,
}

impl CycleReport {
    fn absorb(&mut self, other: CycleReport) {
        self.cycles += other.cycles;
        self.rounds += other.rounds;
        self.attempted += other.attempted;
        self.synced += other.synced;
        self.retried += other.retried;
        self.dead_lettered += other.dead_lettered;
        self.conflicts += other.conflicts;
        self.purged += other.purged;
    }

    fn record(&mut self, attempt: &Attempt) {
        match attempt {
            Attempt::Lost => {}
            Attempt::Synced { conflict } => {
                self.attempted += 1;
                self.synced += 1;
                self.conflicts += u32::from(*conflict);
            }
            Attempt::Retry => {
                self.attempted += 1;
                self.retried += 1;
            }
            Attempt::DeadLettered { entries } => {
                self.attempted += 1;
                self.dead_lettered += *entries;
            }
        }
    }
}

/// Result of [`SyncDispatcher::trigger_manual_sync`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    /// This call ran the cycle(s).
    Completed(CycleReport),
    /// A cycle was already running; it runs once more when it finishes.
    Coalesced,
}

/// Totals for one pull pass over every table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PullReport {
    pub pages: u32,
    pub received: u32,
    pub applied: u32,
    pub skipped: u32,
    pub conflicts: u32,
}

/// What one attempt ended as.
#[derive(Debug)]
enum Attempt {
    /// Someone else claimed the record first.
    Lost,
    Synced { conflict: bool },
    Retry,
    DeadLettered { entries: u32 },
}

/// How the server answered for one record.
#[derive(Debug)]
enum Verdict {
    Accepted {
        superseded: bool,
        echo: Option<ServerChange>,
    },
    Failed(SyncError),
}

/// Reads the server's answer for one pushed record.
fn verdict_for(record: &MutationRecord, response: PushResponse) -> Verdict {
    let table = &record.target_collection;
    let id = &record.document_id;
    let echo = response.applied_for(table, id).cloned();

    if let Some(conflict) = response.conflict_for(table, id) {
        return match conflict.reason {
            ConflictReason::AlreadyApplied => Verdict::Accepted {
                superseded: false,
                echo,
            },
            ConflictReason::Superseded => Verdict::Accepted {
                superseded: true,
                echo,
            },
            reason => Verdict::Failed(SyncError::Rejected {
                reason,
                message: conflict.message.clone().unwrap_or_default(),
            }),
        };
    }

    if response.accepted > 0 {
        Verdict::Accepted {
            superseded: false,
            echo,
        }
    } else {
        Verdict::Failed(SyncError::InvalidResponse(format!(
            "no verdict for {table}/{id}"
        )))
    }
}

// =============================================================================
// Single Flight
// =============================================================================

#[derive(Debug, Default)]
struct Flight {
    running: bool,
    rerun: bool,
}

/// Clears the running flag if a cycle is abandoned midway.
struct FlightGuard<'a> {
    flight: &'a Mutex<Flight>,
    armed: bool,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut flight = self.flight.lock().unwrap_or_else(|e| e.into_inner());
            flight.running = false;
            flight.rerun = false;
        }
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

/// The client sync engine's working core.
///
/// Built with [`SyncDispatcher::builder`]. Store, network client, clock and
/// id generator are all injected.
pub struct SyncDispatcher {
    db: Database,
    client: Arc<dyn SyncClient>,
    codecs: Arc<CodecRegistry>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    writer: LocalWriter,
    reconciler: Reconciler,
    policy: RetryPolicy,
    settings: DispatchSettings,
    request_timeout: Duration,
    provenance: Provenance,
    bus: EventBus,
    flight: Mutex<Flight>,
}

impl SyncDispatcher {
    pub fn builder(
        config: SyncConfig,
        db: Database,
        client: Arc<dyn SyncClient>,
    ) -> SyncDispatcherBuilder {
        SyncDispatcherBuilder {
            config,
            db,
            client,
            codecs: None,
            clock: None,
            ids: None,
            policy: None,
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    // =========================================================================
    // Local Writes
    // =========================================================================

    /// Writes a change locally and queues it. Never touches the network.
    pub async fn enqueue(&self, mutation: NewMutation) -> SyncResult<String> {
        let operation_id = self.writer.enqueue(mutation).await?;
        self.publish_stats().await;
        Ok(operation_id)
    }

    /// Writes and queues an ordered multi-step change atomically.
    pub async fn enqueue_transaction(&self, steps: Vec<NewMutation>) -> SyncResult<Vec<String>> {
        let operation_ids = self.writer.enqueue_transaction(steps).await?;
        self.publish_stats().await;
        Ok(operation_ids)
    }

    /// The writer, for callers that enqueue inside their own transaction.
    pub fn writer(&self) -> &LocalWriter {
        &self.writer
    }

    // =========================================================================
    // Streams
    // =========================================================================

    /// One event per completed attempt.
    pub fn subscribe_events(&self) -> EventSubscription {
        self.bus.subscribe()
    }

    /// Live per-status counts.
    pub fn subscribe_stats(&self) -> StatsSubscription {
        self.bus.subscribe_stats()
    }

    pub async fn stats(&self) -> SyncResult<QueueStats> {
        let stats = self.db.mutation_queue().stats().await?;
        self.bus.publish_stats(stats);
        Ok(stats)
    }

    async fn publish_stats(&self) {
        match self.db.mutation_queue().stats().await {
            Ok(stats) => self.bus.publish_stats(stats),
            Err(e) => warn!(error = %e, "Failed to read queue stats"),
        }
    }

    // =========================================================================
    // Recovery
    // =========================================================================

    /// Startup recovery. Run once before the first cycle.
    ///
    /// IN_PROGRESS records belong to an attempt that died with the process;
    /// they go back to PENDING. PENDING and RETRY records need nothing.
    pub async fn recover(&self) -> SyncResult<u64> {
        let recovered = self.db.mutation_queue().recover_in_progress().await?;
        self.publish_stats().await;
        Ok(recovered)
    }

    // =========================================================================
    // Push
    // =========================================================================

    /// Runs a drain cycle unless one is already running, in which case the
    /// running one repeats once more before it returns.
    pub async fn trigger_manual_sync(&self) -> SyncResult<SyncTrigger> {
        {
            let mut flight = self.flight.lock().unwrap_or_else(|e| e.into_inner());
            if flight.running {
                flight.rerun = true;
                debug!("Sync already running, coalescing trigger");
                return Ok(SyncTrigger::Coalesced);
            }
            flight.running = true;
        }

        let mut guard = FlightGuard {
            flight: &self.flight,
            armed: true,
        };
        let mut total = CycleReport::default();

        loop {
            total.absorb(self.run_cycle().await?);

            let rerun = {
                let mut flight = self.flight.lock().unwrap_or_else(|e| e.into_inner());
                if flight.rerun {
                    flight.rerun = false;
                    true
                } else {
                    flight.running = false;
                    false
                }
            };
            if !rerun {
                guard.armed = false;
                break;
            }
        }

        Ok(SyncTrigger::Completed(total))
    }

    /// One drain cycle. [`trigger_manual_sync`](Self::trigger_manual_sync)
    /// keeps cycles from overlapping; this does not.
    pub async fn run_cycle(&self) -> SyncResult<CycleReport> {
        let queue = self.db.mutation_queue();
        let mut report = CycleReport {
            cycles: 1,
            ..CycleReport::default()
        };

        for _ in 0..self.settings.max_rounds_per_cycle.max(1) {
            let eligible = queue
                .select_eligible(self.clock.now(), self.settings.batch_size)
                .await?;
            if eligible.is_empty() {
                break;
            }

            report.rounds += 1;
            debug!(count = eligible.len(), "Dispatching round");

            let attempts: Vec<SyncResult<Attempt>> = stream::iter(eligible)
                .map(|record| self.dispatch_one(record))
                .buffer_unordered(self.settings.worker_pool.max(1))
                .collect()
                .await;

            let mut progressed = false;
            for attempt in attempts {
                let attempt = attempt?;
                progressed |= !matches!(attempt, Attempt::Lost);
                report.record(&attempt);
            }
            if !progressed {
                break;
            }
        }

        let retention = chrono::Duration::hours(self.settings.synced_retention_hours as i64);
        report.purged = queue.purge_synced(self.clock.now() - retention).await?;
        self.publish_stats().await;

        if report.attempted > 0 {
            info!(
                attempted = report.attempted,
                synced = report.synced,
                retried = report.retried,
                dead_lettered = report.dead_lettered,
                conflicts = report.conflicts,
                "Sync cycle finished"
            );
        }

        Ok(report)
    }

    /// Claim, push and settle one record.
    async fn dispatch_one(&self, record: MutationRecord) -> SyncResult<Attempt> {
        let Some(claimed) = self.db.mutation_queue().claim(&record, self.clock.now()).await? else {
            return Ok(Attempt::Lost);
        };

        debug!(
            operation_id = %claimed.operation_id,
            table = %claimed.target_collection,
            retry_count = claimed.retry_count,
            "Pushing mutation"
        );

        let request = PushRequest {
            changes: vec![ChangeRecord::from_mutation(&claimed)],
            device_id: self.provenance.device_id.clone(),
            last_synced_at: None,
        };
        let verdict = match self.with_timeout(self.client.push(request)).await {
            Ok(response) => verdict_for(&claimed, response),
            Err(err) => Verdict::Failed(err),
        };

        match verdict {
            Verdict::Accepted { superseded, echo } => {
                match self.settle_accepted(&claimed, superseded, echo).await {
                    Ok(attempt) => Ok(attempt),
                    Err(err) => self.settle_failure(&claimed, err).await,
                }
            }
            Verdict::Failed(err) => self.settle_failure(&claimed, err).await,
        }
    }

    /// Server has the change (or a newer one): reconcile, then SYNCED.
    async fn settle_accepted(
        &self,
        claimed: &MutationRecord,
        superseded: bool,
        echo: Option<ServerChange>,
    ) -> SyncResult<Attempt> {
        let mut conflict = false;

        if let Some(change) = echo {
            let source = if superseded {
                ReconcileSource::PushSuperseded {
                    operation_id: &claimed.operation_id,
                }
            } else {
                ReconcileSource::PushAccepted {
                    operation_id: &claimed.operation_id,
                }
            };
            let outcome = self.reconciler.apply(&change, source).await?;
            conflict = matches!(outcome, ReconcileOutcome::Conflict(_));
        }

        let now = self.clock.now();
        let synced = self.db.mutation_queue().mark_synced(claimed, now).await?;

        debug!(operation_id = %synced.operation_id, superseded, "Mutation synced");
        self.publish_attempt(claimed, AttemptOutcome::Synced);

        Ok(Attempt::Synced { conflict })
    }

    /// Transient failures go to RETRY until the ceiling; everything else is
    /// dead-lettered.
    async fn settle_failure(&self, claimed: &MutationRecord, err: SyncError) -> SyncResult<Attempt> {
        let now = self.clock.now();
        let attempts = claimed.attempts_including_current();
        let class = err.classify();

        if class == FailureClass::Transient && !self.policy.is_exhausted(attempts) {
            let delay = self.policy.delay_for_attempt(attempts);
            let next_attempt_at = now + chrono::Duration::milliseconds(delay.as_millis() as i64);
            let error = err.to_string();

            warn!(
                operation_id = %claimed.operation_id,
                table = %claimed.target_collection,
                retry_count = claimed.retry_count + 1,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Push failed, will retry"
            );

            self.db
                .mutation_queue()
                .mark_retry(claimed, &error, next_attempt_at, now)
                .await?;
            self.publish_attempt(
                claimed,
                AttemptOutcome::Retry {
                    error,
                    next_attempt_at,
                },
            );
            return Ok(Attempt::Retry);
        }

        let reason = match class {
            FailureClass::Transient => {
                format!("retry limit reached after {attempts} attempts: {err}")
            }
            FailureClass::Permanent => err.to_string(),
        };

        let entries = self
            .db
            .dead_letters()
            .move_to_dead_letter(
                &claimed.operation_id,
                &reason,
                attempts,
                now,
                self.ids.as_ref(),
            )
            .await?;
        self.publish_attempt(claimed, AttemptOutcome::DeadLettered { reason });

        Ok(Attempt::DeadLettered {
            entries: entries.len() as u32,
        })
    }

    fn publish_attempt(&self, record: &MutationRecord, outcome: AttemptOutcome) {
        self.bus.publish(SyncEvent {
            operation_id: record.operation_id.clone(),
            table: record.target_collection.clone(),
            document_id: record.document_id.clone(),
            attempt: record.attempts_including_current(),
            outcome,
            at: self.clock.now(),
        });
    }

    async fn with_timeout<T>(
        &self,
        request: impl Future<Output = SyncResult<T>>,
    ) -> SyncResult<T> {
        match tokio::time::timeout(self.request_timeout, request).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout(self.request_timeout.as_secs())),
        }
    }

    // =========================================================================
    // Pull
    // =========================================================================

    /// Pulls every registered table from its stored watermark until the
    /// server reports no more pages.
    pub async fn pull_changes(&self) -> SyncResult<PullReport> {
        let state = self.db.sync_state();
        let mut report = PullReport::default();

        for table in self.codecs.tables() {
            loop {
                let cursor = state.get_cursor(&table).await?;
                let request = PullRequest::for_table(
                    table.clone(),
                    cursor.as_ref(),
                    self.settings.pull_page_size,
                );
                let response = self.with_timeout(self.client.pull(request)).await?;
                report.pages += 1;
                report.received += response.changes.len() as u32;

                if !response.changes.is_empty() {
                    let mut tx = self.db.begin().await?;
                    for change in response.changes.iter().filter(|c| c.table == table) {
                        match self
                            .reconciler
                            .apply_in(&mut tx, change, ReconcileSource::Pull)
                            .await?
                        {
                            ReconcileOutcome::Applied | ReconcileOutcome::VersionOnly => {
                                report.applied += 1
                            }
                            ReconcileOutcome::Skipped => report.skipped += 1,
                            ReconcileOutcome::Conflict(_) => {
                                report.applied += 1;
                                report.conflicts += 1;
                            }
                        }
                    }
                    tx.commit().await?;
                }

                match response.next_cursor() {
                    Some(next) if Some(&next) != cursor.as_ref() => {
                        state.set_cursor(&table, &next, self.clock.now()).await?;
                    }
                    _ => break,
                }
                if !response.has_more {
                    break;
                }
            }
        }

        if report.received > 0 {
            info!(
                received = report.received,
                applied = report.applied,
                conflicts = report.conflicts,
                "Pulled server changes"
            );
        }
        Ok(report)
    }

    // =========================================================================
    // Dead Letters
    // =========================================================================

    /// Unresolved dead letters of this device's tenant, oldest first.
    pub async fn dead_letters(&self) -> SyncResult<Vec<DeadLetterEntry>> {
        Ok(self
            .db
            .dead_letters()
            .get_unresolved(&self.provenance.owner_id)
            .await?)
    }

    /// Marks an entry resolved without retrying it.
    pub async fn resolve_dead_letter(&self, id: &str, notes: &str) -> SyncResult<DeadLetterEntry> {
        let entry = self
            .db
            .dead_letters()
            .resolve(id, notes, self.clock.now())
            .await?;
        self.publish_stats().await;
        Ok(entry)
    }

    /// Re-enqueues selected unresolved entries as fresh operations and
    /// resolves the originals, all in one transaction.
    ///
    /// Entries that shared a dependency group are re-grouped under a new
    /// group in their original step order. Already resolved entries are
    /// skipped.
    ///
    /// ## Returns
    /// The new operation ids.
    pub async fn retry_dead_letters(&self, ids: &[String]) -> SyncResult<Vec<String>> {
        let now = self.clock.now();
        let mut tx = self.db.begin().await?;

        let mut entries: Vec<DeadLetterEntry> = Vec::with_capacity(ids.len());
        for id in ids {
            let entry = DeadLetterRepository::get_in(&mut tx, id)
                .await?
                .ok_or_else(|| SyncError::NotFound(format!("dead letter {id}")))?;
            if entry.is_resolved {
                warn!(id = %id, "Dead letter already resolved, not retrying");
                continue;
            }
            entries.push(entry);
        }

        let mut new_ids = Vec::with_capacity(entries.len());
        let mut done_groups: HashSet<String> = HashSet::new();

        for entry in &entries {
            let batch: Vec<&DeadLetterEntry> = match &entry.record.dependency_group {
                Some(group) => {
                    if !done_groups.insert(group.clone()) {
                        continue;
                    }
                    let mut members: Vec<&DeadLetterEntry> = entries
                        .iter()
                        .filter(|e| e.record.dependency_group.as_ref() == Some(group))
                        .collect();
                    members.sort_by_key(|e| e.record.step_number);
                    members
                }
                None => vec![entry],
            };

            let new_group = (batch.len() > 1).then(|| self.ids.next_id());
            let total = batch.len() as u32;
            let mut first_op: Option<String> = None;

            for (index, original) in batch.into_iter().enumerate() {
                let step = new_group.as_ref().map(|group| StepPosition {
                    dependency_group: group.clone(),
                    parent_operation_id: first_op.clone(),
                    step_number: index as u32 + 1,
                    total_steps: total,
                });
                let old = &original.record;
                let mutation = NewMutation::new(
                    old.operation_type,
                    old.target_collection.clone(),
                    old.document_id.clone(),
                    old.payload.clone(),
                )
                .with_priority(old.priority);
                let provenance = Provenance {
                    owner_id: old.owner_id.clone(),
                    user_id: old.user_id.clone(),
                    device_id: old.device_id.clone(),
                };

                let record = MutationRecord::new(self.ids.next_id(), mutation, &provenance, step, now);
                MutationQueueRepository::insert_in(&mut tx, &record).await?;
                DeadLetterRepository::resolve_in(
                    &mut tx,
                    &original.id,
                    &format!("re-enqueued as {}", record.operation_id),
                    now,
                )
                .await?;

                info!(
                    dead_letter = %original.id,
                    operation_id = %record.operation_id,
                    "Dead letter re-enqueued"
                );
                first_op.get_or_insert_with(|| record.operation_id.clone());
                new_ids.push(record.operation_id);
            }
        }

        tx.commit().await?;
        self.publish_stats().await;
        Ok(new_ids)
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`SyncDispatcher`]. Anything not set uses the production
/// default (wall clock, UUIDs, default table codecs, policy from config).
pub struct SyncDispatcherBuilder {
    config: SyncConfig,
    db: Database,
    client: Arc<dyn SyncClient>,
    codecs: Option<Arc<CodecRegistry>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    policy: Option<RetryPolicy>,
}

impl SyncDispatcherBuilder {
    pub fn with_codecs(mut self, codecs: Arc<CodecRegistry>) -> Self {
        self.codecs = Some(codecs);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_ids(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Validates the config and assembles the dispatcher.
    pub fn build(self) -> SyncResult<SyncDispatcher> {
        self.config.validate()?;

        let codecs = self
            .codecs
            .unwrap_or_else(|| Arc::new(CodecRegistry::with_defaults()));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let ids = self.ids.unwrap_or_else(|| Arc::new(UuidGenerator));
        let policy = self
            .policy
            .unwrap_or_else(|| self.config.retry_policy());
        let provenance = self.config.provenance();

        let writer = LocalWriter::new(
            self.db.clone(),
            codecs.clone(),
            clock.clone(),
            ids.clone(),
            provenance.clone(),
        );
        let reconciler = Reconciler::new(self.db.clone(), clock.clone(), ids.clone());

        Ok(SyncDispatcher {
            request_timeout: self.config.request_timeout(),
            settings: self.config.dispatch.clone(),
            bus: EventBus::new(self.config.channels.event_buffer),
            db: self.db,
            client: self.client,
            codecs,
            clock,
            ids,
            writer,
            reconciler,
            policy,
            provenance,
            flight: Mutex::new(Flight::default()),
        })
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
