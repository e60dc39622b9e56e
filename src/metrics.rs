//! Soft-failure counters for the routing core.
//!
//! ML-path failures are recovered locally and must never surface to callers,
//! so they are observable only here. Counters are lock-free `AtomicU64`s;
//! `snapshot` returns a plain serializable struct for status endpoints.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Counters shared by the router, shadow recorder, and feedback ingestor.
#[derive(Debug, Default)]
pub struct RouterMetrics {
    /// ML evaluations attempted.
    pub ml_attempts: AtomicU64,
    /// ML evaluations that succeeded within budget.
    pub ml_successes: AtomicU64,
    /// ML evaluations cancelled on deadline expiry.
    pub ml_timeouts: AtomicU64,
    /// ML evaluations that returned an error.
    pub ml_errors: AtomicU64,
    /// ML-eligible requests rejected by the circuit breaker.
    pub ml_rejected_by_breaker: AtomicU64,
    /// ML-eligible requests shed because the dispatch queue was full.
    pub ml_saturated: AtomicU64,
    /// Shadow events dropped due to queue overflow.
    pub dropped_events: AtomicU64,
    /// Feedback dropped because the decision reference no longer resolves.
    pub stale_feedback_dropped: AtomicU64,
    /// Feedback ignored as an idempotent duplicate.
    pub duplicate_feedback: AtomicU64,
    /// Automatic rollbacks triggered by the feedback ingestor.
    pub auto_rollbacks: AtomicU64,
}

impl RouterMetrics {
    /// Creates zeroed metrics.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Increments a counter by one.
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Takes a point-in-time snapshot of all counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            ml_attempts: self.ml_attempts.load(Ordering::Relaxed),
            ml_successes: self.ml_successes.load(Ordering::Relaxed),
            ml_timeouts: self.ml_timeouts.load(Ordering::Relaxed),
            ml_errors: self.ml_errors.load(Ordering::Relaxed),
            ml_rejected_by_breaker: self.ml_rejected_by_breaker.load(Ordering::Relaxed),
            ml_saturated: self.ml_saturated.load(Ordering::Relaxed),
            dropped_events: self.dropped_events.load(Ordering::Relaxed),
            stale_feedback_dropped: self.stale_feedback_dropped.load(Ordering::Relaxed),
            duplicate_feedback: self.duplicate_feedback.load(Ordering::Relaxed),
            auto_rollbacks: self.auto_rollbacks.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the router counters.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub ml_attempts: u64,
    pub ml_successes: u64,
    pub ml_timeouts: u64,
    pub ml_errors: u64,
    pub ml_rejected_by_breaker: u64,
    pub ml_saturated: u64,
    pub dropped_events: u64,
    pub stale_feedback_dropped: u64,
    pub duplicate_feedback: u64,
    pub auto_rollbacks: u64,
}
