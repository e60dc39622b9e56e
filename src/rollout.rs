//! Percentage-based rollout control.
//!
//! One `RolloutPolicy` exists per `(agent, capability)`, versioned in the
//! shared policy store. Router replicas read through a short-TTL local cache
//! so the hot path never blocks on the store; any policy write is visible
//! fleet-wide within one TTL. Writes go through compare-and-swap with a
//! small retry budget, and cached values are replaced only by a newer
//! version (last-writer-wins by version, not wall clock).

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::context::CapabilityKey;
use crate::error::{AdminError, ValidationError};
use crate::store::{PolicyStore, StoreError, Versioned};

/// Who performed a policy update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyActor {
    /// An operator via the administrative surface.
    Manual,

    /// The feedback ingestor's auto-rollback rule.
    AutoRollback,

    /// An automated advancement job.
    AutoAdvance,
}

impl std::fmt::Display for PolicyActor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Manual => write!(f, "manual"),
            Self::AutoRollback => write!(f, "auto-rollback"),
            Self::AutoAdvance => write!(f, "auto-advance"),
        }
    }
}

/// The traffic-split policy for one capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloutPolicy {
    /// Fraction of eligible requests routed to the ML path, 0-100.
    pub percentage: u8,

    /// When this policy was written.
    pub updated_at: DateTime<Utc>,

    /// Who wrote it.
    pub updated_by: PolicyActor,
}

impl RolloutPolicy {
    /// Creates a policy stamped now.
    #[must_use]
    pub fn initial(percentage: u8, updated_by: PolicyActor) -> Self {
        Self {
            percentage,
            updated_at: Utc::now(),
            updated_by,
        }
    }
}

/// Rollout controller tuning.
#[derive(Debug, Clone)]
pub struct RolloutConfig {
    /// Local cache TTL. Bounds fleet-wide propagation of policy changes.
    pub cache_ttl: Duration,

    /// CAS retries before surfacing `PolicyConflict`.
    pub cas_retries: u32,

    /// The manual advancement ladder. Increases must land on the next step.
    pub steps: Vec<u8>,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(1),
            cas_retries: 3,
            steps: vec![5, 25, 50, 100],
        }
    }
}

#[derive(Debug, Clone)]
struct CachedPolicy {
    policy: Versioned<RolloutPolicy>,
    fetched_at: Instant,
}

/// Reads and writes rollout policies through the shared policy store.
///
/// Each router replica holds one controller instance; instances sharing a
/// store converge within the cache TTL.
pub struct RolloutController {
    store: Arc<dyn PolicyStore>,
    config: RolloutConfig,
    cache: RwLock<HashMap<CapabilityKey, CachedPolicy>>,
}

impl RolloutController {
    /// Creates a controller over a policy store.
    #[must_use]
    pub fn new(store: Arc<dyn PolicyStore>, config: RolloutConfig) -> Self {
        Self {
            store,
            config,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Current rollout percentage for a key. A key without a stored policy
    /// reads as 0 (deterministic-only).
    ///
    /// Served from the local cache when fresh; a cache miss does one store
    /// read. Store failures also read as 0: the deterministic path is always
    /// safe.
    #[must_use]
    pub fn percentage(&self, key: &CapabilityKey) -> u8 {
        self.current(key).map_or(0, |v| v.value.percentage)
    }

    /// Current versioned policy, consulting the cache first.
    #[must_use]
    pub fn current(&self, key: &CapabilityKey) -> Option<Versioned<RolloutPolicy>> {
        {
            let cache = self.cache.read().expect("rollout cache lock poisoned");
            if let Some(entry) = cache.get(key) {
                if entry.fetched_at.elapsed() < self.config.cache_ttl {
                    return Some(entry.policy.clone());
                }
            }
        }

        let fetched = self.store.rollout(key).ok().flatten()?;
        self.cache_put(key, fetched.clone());
        Some(fetched)
    }

    /// Sets the rollout percentage through the step ladder.
    ///
    /// Decreases are unrestricted. Increases must land exactly on the next
    /// ladder step above the current percentage; gating-metric judgement is
    /// the caller's job, the controller is mechanism only.
    ///
    /// # Errors
    ///
    /// - `InvalidPercentage` for values over 100
    /// - `InvalidStep` for ladder violations
    /// - `PolicyConflict` when the CAS retry budget is exhausted
    pub fn set_percentage(
        &self,
        key: &CapabilityKey,
        percentage: u8,
        actor: PolicyActor,
    ) -> Result<Versioned<RolloutPolicy>, AdminError> {
        validate_percentage(percentage)?;

        for attempt in 0..=self.config.cas_retries {
            let stored = self.store.rollout(key)?;
            let (current_pct, expected) = match &stored {
                Some(v) => (v.value.percentage, Some(v.version)),
                None => (0, None),
            };

            if percentage > current_pct && actor == PolicyActor::Manual {
                self.check_step(current_pct, percentage)?;
            }

            let policy = RolloutPolicy::initial(percentage, actor);
            match self.store.put_rollout(key, policy.clone(), expected) {
                Ok(version) => {
                    let versioned = Versioned {
                        value: policy,
                        version,
                    };
                    self.cache_put(key, versioned.clone());
                    return Ok(versioned);
                }
                Err(StoreError::VersionConflict { .. }) if attempt < self.config.cas_retries => {
                    continue;
                }
                Err(StoreError::VersionConflict { .. }) => {
                    return Err(AdminError::PolicyConflict {
                        attempts: self.config.cas_retries + 1,
                    });
                }
                Err(err) => return Err(AdminError::Store(err)),
            }
        }

        Err(AdminError::PolicyConflict {
            attempts: self.config.cas_retries + 1,
        })
    }

    /// Forces the percentage to 0 immediately, bypassing the step ladder.
    ///
    /// Used by the auto-rollback rule (`PolicyActor::AutoRollback`) and the
    /// administrative `force-rollback` verb (`PolicyActor::Manual`).
    ///
    /// # Errors
    ///
    /// `PolicyConflict` when the CAS retry budget is exhausted.
    pub fn force_rollback(
        &self,
        key: &CapabilityKey,
        actor: PolicyActor,
    ) -> Result<Versioned<RolloutPolicy>, AdminError> {
        for attempt in 0..=self.config.cas_retries {
            let stored = self.store.rollout(key)?;
            let expected = stored.as_ref().map(|v| v.version);
            let policy = RolloutPolicy::initial(0, actor);
            match self.store.put_rollout(key, policy.clone(), expected) {
                Ok(version) => {
                    let versioned = Versioned {
                        value: policy,
                        version,
                    };
                    self.cache_put(key, versioned.clone());
                    return Ok(versioned);
                }
                Err(StoreError::VersionConflict { .. }) if attempt < self.config.cas_retries => {
                    continue;
                }
                Err(StoreError::VersionConflict { .. }) => {
                    return Err(AdminError::PolicyConflict {
                        attempts: self.config.cas_retries + 1,
                    });
                }
                Err(err) => return Err(AdminError::Store(err)),
            }
        }

        Err(AdminError::PolicyConflict {
            attempts: self.config.cas_retries + 1,
        })
    }

    /// Drops the cached entry for a key (push-based invalidation).
    pub fn invalidate(&self, key: &CapabilityKey) {
        let mut cache = self.cache.write().expect("rollout cache lock poisoned");
        cache.remove(key);
    }

    /// Replaces the cached entry, keeping the newest version.
    fn cache_put(&self, key: &CapabilityKey, policy: Versioned<RolloutPolicy>) {
        let mut cache = self.cache.write().expect("rollout cache lock poisoned");
        match cache.get(key) {
            // Never step backwards: an older version must not overwrite a
            // newer one observed by a concurrent writer.
            Some(existing) if existing.policy.version > policy.version => {}
            _ => {
                cache.insert(
                    key.clone(),
                    CachedPolicy {
                        policy,
                        fetched_at: Instant::now(),
                    },
                );
            }
        }
    }

    fn check_step(&self, current: u8, requested: u8) -> Result<(), AdminError> {
        let next = self
            .config
            .steps
            .iter()
            .copied()
            .find(|&s| s > current)
            .unwrap_or(100);
        if requested != next {
            return Err(AdminError::InvalidStep {
                current,
                requested,
                next,
            });
        }
        Ok(())
    }
}

fn validate_percentage(value: u8) -> Result<(), ValidationError> {
    if value > 100 {
        return Err(ValidationError::PercentageOutOfRange {
            value: u32::from(value),
        });
    }
    Ok(())
}
