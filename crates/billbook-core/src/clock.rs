//! # Clock and Identifier Sources
//!
//! The engine never calls `Utc::now()` or `Uuid::new_v4()` directly. Both are
//! injected so tests can pin time and ids.
//!
//! Timestamps are persisted as unix epoch milliseconds; [`to_millis`] and
//! [`from_millis`] are the only conversions used across the workspace.

use chrono::{DateTime, Duration, Utc};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use uuid::Uuid;

// =============================================================================
// Clock
// =============================================================================

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
///
/// ## Example
/// ```rust
/// use billbook_core::clock::{Clock, ManualClock};
/// use chrono::Duration;
///
/// let clock = ManualClock::at_millis(1_000);
/// clock.advance(Duration::seconds(5));
/// assert_eq!(clock.now().timestamp_millis(), 6_000);
/// ```
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicI64,
}

impl ManualClock {
    /// Creates a clock pinned to the given instant.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self::at_millis(to_millis(start))
    }

    /// Creates a clock pinned to the given epoch milliseconds.
    pub fn at_millis(millis: i64) -> Self {
        ManualClock {
            millis: AtomicI64::new(millis),
        }
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: Duration) {
        self.millis.fetch_add(by.num_milliseconds(), Ordering::SeqCst);
    }

    /// Jumps to an absolute instant.
    pub fn set(&self, at: DateTime<Utc>) {
        self.millis.store(to_millis(at), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        from_millis(self.millis.load(Ordering::SeqCst))
    }
}

// =============================================================================
// Identifier Generation
// =============================================================================

/// Source of globally unique identifiers (operation ids, dead-letter ids).
pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> String;
}

/// UUID v4 ids. Safe to generate offline without coordination.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn next_id(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

/// Deterministic `prefix-000001` style ids.
#[derive(Debug)]
pub struct SequentialIds {
    prefix: String,
    next: AtomicU64,
}

impl SequentialIds {
    pub fn new(prefix: impl Into<String>) -> Self {
        SequentialIds {
            prefix: prefix.into(),
            next: AtomicU64::new(1),
        }
    }
}

impl IdGenerator for SequentialIds {
    fn next_id(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        format!("{}-{:06}", self.prefix, n)
    }
}

// =============================================================================
// Millisecond Conversions
// =============================================================================

/// Converts a timestamp to epoch milliseconds for storage.
#[inline]
pub fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

/// Converts stored epoch milliseconds back to a timestamp.
///
/// Out-of-range values collapse to the unix epoch.
#[inline]
pub fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::at_millis(10_000);
        assert_eq!(to_millis(clock.now()), 10_000);

        clock.advance(Duration::milliseconds(250));
        assert_eq!(to_millis(clock.now()), 10_250);
    }

    #[test]
    fn test_sequential_ids() {
        let ids = SequentialIds::new("op");
        assert_eq!(ids.next_id(), "op-000001");
        assert_eq!(ids.next_id(), "op-000002");
    }

    #[test]
    fn test_uuid_generator_unique() {
        let ids = UuidGenerator;
        assert_ne!(ids.next_id(), ids.next_id());
    }

    #[test]
    fn test_millis_round_trip_truncates_to_millis() {
        let at = from_millis(1_700_000_000_123);
        assert_eq!(to_millis(at), 1_700_000_000_123);
    }
}
