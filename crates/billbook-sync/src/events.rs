//! # Sync Events and Queue Stats
//!
//! Two channels fan out from the dispatcher:
//!
//! ```text
//!                       ┌──────────────────────────┐
//!   dispatcher ───────► │ EventBus                 │
//!                       │                          │
//!                       │  events: broadcast(N)  ──┼──► EventSubscription (per UI panel)
//!                       │  stats:  watch         ──┼──► StatsSubscription (badge counters)
//!                       └──────────────────────────┘
//! ```
//!
//! ## Backpressure
//! - Events: bounded ring of `event_buffer` entries. A subscriber that falls
//!   behind skips the oldest events and is told how many it missed. The
//!   dispatcher never waits on a subscriber.
//! - Stats: only the latest value is kept.
//!
//! Subscriptions end when [`EventSubscription::unsubscribe`] is called or the
//! subscription is dropped.

use billbook_core::QueueStats;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

// =============================================================================
// Events
// =============================================================================

/// Result of one push attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Synced,
    /// Transient failure, will be offered again at `next_attempt_at`.
    Retry {
        error: String,
        next_attempt_at: DateTime<Utc>,
    },
    DeadLettered { reason: String },
}

/// One completed attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEvent {
    pub operation_id: String,
    pub table: String,
    pub document_id: String,
    /// 1-based attempt number.
    pub attempt: u32,
    #[serde(flatten)]
    pub outcome: AttemptOutcome,
    pub at: DateTime<Utc>,
}

impl SyncEvent {
    pub fn is_synced(&self) -> bool {
        matches!(self.outcome, AttemptOutcome::Synced)
    }

    pub fn is_dead_lettered(&self) -> bool {
        matches!(self.outcome, AttemptOutcome::DeadLettered { .. })
    }
}

// =============================================================================
// Event Bus
// =============================================================================

#[derive(Debug)]
struct BusInner {
    events: broadcast::Sender<SyncEvent>,
    stats: watch::Sender<QueueStats>,
    subscribers: AtomicUsize,
}

/// Publisher side of both channels. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new(event_buffer: usize) -> Self {
        let (events, _) = broadcast::channel(event_buffer.max(1));
        let (stats, _) = watch::channel(QueueStats::default());
        EventBus {
            inner: Arc::new(BusInner {
                events,
                stats,
                subscribers: AtomicUsize::new(0),
            }),
        }
    }

    /// Publishes an attempt event. Dropped silently when nobody listens.
    pub fn publish(&self, event: SyncEvent) {
        let _ = self.inner.events.send(event);
    }

    /// Publishes new stats if they changed.
    pub fn publish_stats(&self, stats: QueueStats) {
        self.inner.stats.send_if_modified(|current| {
            if *current != stats {
                *current = stats;
                true
            } else {
                false
            }
        });
    }

    /// Latest published stats.
    pub fn stats(&self) -> QueueStats {
        *self.inner.stats.borrow()
    }

    pub fn subscribe(&self) -> EventSubscription {
        let count = self.inner.subscribers.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(subscribers = count, "Event subscriber added");
        EventSubscription {
            receiver: self.inner.events.subscribe(),
            bus: self.inner.clone(),
        }
    }

    pub fn subscribe_stats(&self) -> StatsSubscription {
        StatsSubscription {
            receiver: self.inner.stats.subscribe(),
        }
    }

    /// Live event subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.load(Ordering::SeqCst)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

// =============================================================================
// Subscriptions
// =============================================================================

/// Receiving end of the attempt event stream.
#[derive(Debug)]
pub struct EventSubscription {
    receiver: broadcast::Receiver<SyncEvent>,
    bus: Arc<BusInner>,
}

impl EventSubscription {
    /// Next event. `None` once the engine is gone.
    ///
    /// A subscriber that lagged behind resumes at the oldest retained event.
    pub async fn recv(&mut self) -> Option<SyncEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "Event subscriber lagged, skipping ahead");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<SyncEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                    warn!(missed, "Event subscriber lagged, skipping ahead");
                }
                Err(_) => return None,
            }
        }
    }

    /// Ends the subscription.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        let left = self.bus.subscribers.fetch_sub(1, Ordering::SeqCst) - 1;
        debug!(subscribers = left, "Event subscriber removed");
    }
}

/// Receiving end of the stats stream.
#[derive(Debug)]
pub struct StatsSubscription {
    receiver: watch::Receiver<QueueStats>,
}

impl StatsSubscription {
    pub fn current(&self) -> QueueStats {
        *self.receiver.borrow()
    }

    /// Waits for the next change. `None` once the engine is gone.
    pub async fn changed(&mut self) -> Option<QueueStats> {
        self.receiver.changed().await.ok()?;
        Some(*self.receiver.borrow_and_update())
    }

    pub fn unsubscribe(self) {}
}
