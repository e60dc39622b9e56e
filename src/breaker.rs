//! Circuit breaker for the ML evaluation path.
//!
//! One breaker record exists per `(agent, capability)`. The record lives in
//! the shared policy store so many router replicas see the same state; every
//! transition is a compare-and-swap read-modify-write with a bounded retry
//! loop, never a global lock. While half-open, exactly one probe may be in
//! flight fleet-wide: the CAS that sets `probe_in_flight` decides the winner.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::context::CapabilityKey;
use crate::store::{PolicyStore, StoreError};

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// ML attempts flow freely.
    Closed,

    /// ML attempts are skipped until the cooldown elapses.
    Open,

    /// Cooldown elapsed; a single probe decides recovery.
    HalfOpen,
}

impl Default for CircuitState {
    fn default() -> Self {
        Self::Closed
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// The per-key breaker record as stored in the policy store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BreakerRecord {
    /// Current state.
    pub state: CircuitState,

    /// Consecutive ML failures; resets to 0 on any success while closed or
    /// half-open.
    pub consecutive_failures: u32,

    /// When the most recent failure was recorded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure_at: Option<DateTime<Utc>>,

    /// When the breaker last tripped open.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opened_at: Option<DateTime<Utc>>,

    /// True while the single half-open probe is in flight.
    pub probe_in_flight: bool,
}

/// Breaker tuning.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the breaker open.
    pub failure_threshold: u32,

    /// How long the breaker stays open before allowing a probe.
    pub cooldown: Duration,

    /// CAS retries before giving up on a transition.
    pub cas_retries: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            cas_retries: 8,
        }
    }
}

/// Per-capability circuit breaker backed by the shared policy store.
pub struct CircuitBreaker {
    store: Arc<dyn PolicyStore>,
    config: BreakerConfig,
}

impl CircuitBreaker {
    /// Creates a breaker over a policy store.
    #[must_use]
    pub fn new(store: Arc<dyn PolicyStore>, config: BreakerConfig) -> Self {
        Self { store, config }
    }

    /// Returns the current state for a key. A key with no record is closed.
    ///
    /// # Errors
    ///
    /// Propagates policy store read failures.
    pub fn state(&self, key: &CapabilityKey) -> Result<CircuitState, StoreError> {
        let record = self.store.breaker(key)?;
        Ok(record.map_or(CircuitState::Closed, |v| {
            self.effective_state(&v.value, Utc::now())
        }))
    }

    /// Returns the stored record, if any.
    ///
    /// # Errors
    ///
    /// Propagates policy store read failures.
    pub fn record(&self, key: &CapabilityKey) -> Result<Option<BreakerRecord>, StoreError> {
        Ok(self.store.breaker(key)?.map(|v| v.value))
    }

    /// Decides whether an ML attempt may proceed.
    ///
    /// - Closed: yes, without a store write.
    /// - Open: no until the cooldown elapses, then the single CAS winner
    ///   transitions to half-open and owns the probe.
    /// - Half-open: only the probe owner; everyone else is rejected.
    ///
    /// Store errors fail safe: the attempt is rejected and the deterministic
    /// path serves the request.
    #[must_use]
    pub fn allow_attempt(&self, key: &CapabilityKey) -> bool {
        for _ in 0..=self.config.cas_retries {
            let now = Utc::now();
            let Ok(stored) = self.store.breaker(key) else {
                return false;
            };
            let Some(versioned) = stored else {
                // No record yet means no failures yet.
                return true;
            };

            let record = versioned.value;
            match self.effective_state(&record, now) {
                CircuitState::Closed => return true,
                CircuitState::Open => return false,
                CircuitState::HalfOpen => {
                    if record.state == CircuitState::HalfOpen && record.probe_in_flight {
                        return false;
                    }
                    let mut next = record;
                    next.state = CircuitState::HalfOpen;
                    next.probe_in_flight = true;
                    match self
                        .store
                        .put_breaker(key, next, Some(versioned.version))
                    {
                        Ok(_) => return true,
                        Err(StoreError::VersionConflict { .. }) => continue,
                        Err(_) => return false,
                    }
                }
            }
        }
        false
    }

    /// Releases a half-open probe slot without recording an outcome.
    ///
    /// For attempts that were granted by `allow_attempt` but never reached
    /// the evaluator (local dispatch shedding): the shed attempt says nothing
    /// about model health, but the probe slot it claimed must be returned or
    /// the key stays half-open with a phantom probe forever.
    ///
    /// # Errors
    ///
    /// `VersionConflict` if the retry budget is exhausted under contention;
    /// other store failures propagate.
    pub fn release_probe(&self, key: &CapabilityKey) -> Result<(), StoreError> {
        for _ in 0..=self.config.cas_retries {
            let stored = self.store.breaker(key)?;
            let Some(versioned) = stored else {
                return Ok(());
            };
            let record = versioned.value;
            if record.state != CircuitState::HalfOpen || !record.probe_in_flight {
                return Ok(());
            }
            let mut next = record;
            next.probe_in_flight = false;
            match self.store.put_breaker(key, next, Some(versioned.version)) {
                Ok(_) => return Ok(()),
                Err(StoreError::VersionConflict { .. }) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(StoreError::VersionConflict {
            expected: None,
            found: None,
        })
    }

    /// Records the outcome of an ML attempt.
    ///
    /// # Errors
    ///
    /// `VersionConflict` if the retry budget is exhausted under contention;
    /// other store failures propagate.
    pub fn record_outcome(&self, key: &CapabilityKey, success: bool) -> Result<(), StoreError> {
        for _ in 0..=self.config.cas_retries {
            let now = Utc::now();
            let stored = self.store.breaker(key)?;
            let (record, expected) = match &stored {
                Some(v) => (v.value.clone(), Some(v.version)),
                None => (BreakerRecord::default(), None),
            };

            let next = self.transition(record, success, now);
            match self.store.put_breaker(key, next, expected) {
                Ok(_) => return Ok(()),
                Err(StoreError::VersionConflict { .. }) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(StoreError::VersionConflict {
            expected: None,
            found: None,
        })
    }

    /// Maps a stored record to its state as of `now`, accounting for an
    /// elapsed cooldown that has not yet been written back.
    fn effective_state(&self, record: &BreakerRecord, now: DateTime<Utc>) -> CircuitState {
        match record.state {
            CircuitState::Open => {
                let cooldown = chrono::Duration::from_std(self.config.cooldown)
                    .unwrap_or_else(|_| chrono::Duration::seconds(30));
                match record.opened_at {
                    Some(opened) if now.signed_duration_since(opened) >= cooldown => {
                        CircuitState::HalfOpen
                    }
                    _ => CircuitState::Open,
                }
            }
            other => other,
        }
    }

    fn transition(&self, mut record: BreakerRecord, success: bool, now: DateTime<Utc>) -> BreakerRecord {
        let state = self.effective_state(&record, now);
        if success {
            match state {
                CircuitState::Closed | CircuitState::HalfOpen => {
                    record.state = CircuitState::Closed;
                    record.consecutive_failures = 0;
                    record.probe_in_flight = false;
                    record.opened_at = None;
                }
                // A late success while open does not close the breaker;
                // recovery goes through the probe.
                CircuitState::Open => {}
            }
        } else {
            record.last_failure_at = Some(now);
            match state {
                CircuitState::Closed => {
                    record.consecutive_failures = record.consecutive_failures.saturating_add(1);
                    if record.consecutive_failures >= self.config.failure_threshold {
                        record.state = CircuitState::Open;
                        record.opened_at = Some(now);
                    }
                }
                CircuitState::HalfOpen => {
                    // Probe failed: reopen and restart the cooldown.
                    record.state = CircuitState::Open;
                    record.opened_at = Some(now);
                    record.probe_in_flight = false;
                    record.consecutive_failures = record.consecutive_failures.saturating_add(1);
                }
                CircuitState::Open => {}
            }
        }
        record
    }
}
