//! Feedback ingestor.
//!
//! Outcome signals arrive late and out of band ("suggestion accepted",
//! "deploy failed"). The ingestor attaches them to prior decision events,
//! deduplicates replays, and aggregates a rolling window of ML-path outcomes
//! per `(agent, capability)`. When a full window's negative rate crosses the
//! rollback threshold it forces the rollout percentage to 0 through the
//! controller, which propagates fleet-wide within the policy cache TTL.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use crate::context::CapabilityKey;
use crate::event::{DecisionId, FeedbackSignal, FeedbackSource, OutcomeFeedback};
use crate::metrics::RouterMetrics;
use crate::rollout::{PolicyActor, RolloutController};
use crate::store::{OutcomeStore, StoreError};

/// Ingestor tuning.
#[derive(Debug, Clone)]
pub struct FeedbackConfig {
    /// Rolling window length per capability.
    pub window_size: usize,

    /// Negative-outcome rate that triggers auto-rollback, in (0.0, 1.0].
    pub rollback_threshold: f64,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            window_size: 20,
            rollback_threshold: 0.5,
        }
    }
}

/// Fixed-capacity window of outcome polarities (true = negative).
#[derive(Debug)]
pub struct RollingWindow {
    capacity: usize,
    outcomes: VecDeque<bool>,
}

impl RollingWindow {
    /// Creates a window; capacity is clamped to at least 1.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            outcomes: VecDeque::new(),
        }
    }

    /// Pushes one outcome, evicting the oldest when full.
    pub fn push(&mut self, negative: bool) {
        if self.outcomes.len() == self.capacity {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(negative);
    }

    /// Fraction of negative outcomes currently in the window.
    #[must_use]
    pub fn negative_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        let negatives = self.outcomes.iter().filter(|&&n| n).count();
        negatives as f64 / self.outcomes.len() as f64
    }

    /// True once the window holds `capacity` samples.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.outcomes.len() == self.capacity
    }

    /// Number of samples currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    /// True when no samples are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    fn clear(&mut self) {
        self.outcomes.clear();
    }
}

/// What happened to an ingested signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestStatus {
    /// Stored and aggregated.
    Recorded,

    /// The identical `(decision, signal, observed_at)` tuple was already
    /// stored; ignored.
    Duplicate,

    /// The decision reference no longer resolves (retention expired or
    /// never existed); dropped with a metric.
    DroppedUnknownDecision,
}

/// Attaches delayed outcome signals to decisions and drives auto-rollback.
pub struct FeedbackIngestor {
    outcomes: Arc<dyn OutcomeStore>,
    rollout: Arc<RolloutController>,
    metrics: Arc<RouterMetrics>,
    config: FeedbackConfig,
    windows: Mutex<HashMap<CapabilityKey, RollingWindow>>,
}

impl FeedbackIngestor {
    /// Creates an ingestor.
    #[must_use]
    pub fn new(
        outcomes: Arc<dyn OutcomeStore>,
        rollout: Arc<RolloutController>,
        metrics: Arc<RouterMetrics>,
        config: FeedbackConfig,
    ) -> Self {
        Self {
            outcomes,
            rollout,
            metrics,
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Ingests one outcome signal.
    ///
    /// Idempotent on `(decision_id, signal, observed_at)`. Signals whose
    /// decision no longer resolves are dropped softly: stale feedback is a
    /// metric, not an error.
    ///
    /// # Errors
    ///
    /// Propagates storage backend failures only.
    pub fn ingest(
        &self,
        decision_id: DecisionId,
        signal: FeedbackSignal,
        observed_at: DateTime<Utc>,
        source: FeedbackSource,
    ) -> Result<IngestStatus, StoreError> {
        let decision = match self.outcomes.event(decision_id)? {
            Some(decision) => decision,
            None => {
                RouterMetrics::bump(&self.metrics.stale_feedback_dropped);
                return Ok(IngestStatus::DroppedUnknownDecision);
            }
        };

        let feedback = OutcomeFeedback::new(decision_id, signal, observed_at, source);
        match self.outcomes.append_feedback(feedback) {
            Ok(true) => {}
            Ok(false) => {
                RouterMetrics::bump(&self.metrics.duplicate_feedback);
                return Ok(IngestStatus::Duplicate);
            }
            Err(StoreError::DecisionNotFound(_)) => {
                // Retention raced the lookup.
                RouterMetrics::bump(&self.metrics.stale_feedback_dropped);
                return Ok(IngestStatus::DroppedUnknownDecision);
            }
            Err(err) => return Err(err),
        }

        // Only the ML path's outcomes drive the rollback rule; deterministic
        // decisions say nothing about ML quality.
        if decision.took_ml_path() {
            self.observe(&decision.key(), signal.is_negative());
        }

        Ok(IngestStatus::Recorded)
    }

    /// Recent negative-outcome rate for a key, and whether the window is
    /// full enough to be meaningful.
    #[must_use]
    pub fn window_snapshot(&self, key: &CapabilityKey) -> (f64, usize) {
        let windows = self.windows.lock().expect("feedback windows lock poisoned");
        windows
            .get(key)
            .map_or((0.0, 0), |w| (w.negative_rate(), w.len()))
    }

    fn observe(&self, key: &CapabilityKey, negative: bool) {
        let should_rollback = {
            let mut windows = self.windows.lock().expect("feedback windows lock poisoned");
            let window = windows
                .entry(key.clone())
                .or_insert_with(|| RollingWindow::new(self.config.window_size));
            window.push(negative);
            if window.is_full() && window.negative_rate() > self.config.rollback_threshold {
                // One rollback per spike: restart the window so stale samples
                // cannot re-trigger while fresh outcomes accumulate.
                window.clear();
                true
            } else {
                false
            }
        };

        if should_rollback && self.rollout.percentage(key) > 0 {
            if self
                .rollout
                .force_rollback(key, PolicyActor::AutoRollback)
                .is_ok()
            {
                RouterMetrics::bump(&self.metrics.auto_rollbacks);
            }
        }
    }
}
