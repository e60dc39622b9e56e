//! Administrative surface.
//!
//! A thin library facade over the controller, breaker, and feedback
//! aggregates. Operators advance or roll back rollouts and inspect per-key
//! health; nothing here touches the hot path directly. Transport bindings
//! (HTTP, CLI) live outside the core.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::breaker::{CircuitBreaker, CircuitState};
use crate::context::CapabilityKey;
use crate::error::AdminError;
use crate::evaluator::CapabilityRegistry;
use crate::feedback::FeedbackIngestor;
use crate::rollout::{PolicyActor, RolloutController};

/// Point-in-time health of one `(agent, capability)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    /// The key the report describes.
    pub key: CapabilityKey,

    /// Circuit breaker state as of the read.
    pub circuit_state: CircuitState,

    /// Current rollout percentage (0 when no policy exists).
    pub rollout_percentage: u8,

    /// Version of the stored rollout policy, if one exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_version: Option<u64>,

    /// Who last wrote the rollout policy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<PolicyActor>,

    /// When the rollout policy was last written.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,

    /// Negative-outcome rate over the recent feedback window.
    pub recent_failure_rate: f64,

    /// How many samples back that rate.
    pub window_samples: usize,
}

/// Operator entry point for rollout and health management.
pub struct AdminApi {
    registry: Arc<CapabilityRegistry>,
    rollout: Arc<RolloutController>,
    breaker: Arc<CircuitBreaker>,
    feedback: Arc<FeedbackIngestor>,
}

impl AdminApi {
    /// Creates the facade.
    #[must_use]
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        rollout: Arc<RolloutController>,
        breaker: Arc<CircuitBreaker>,
        feedback: Arc<FeedbackIngestor>,
    ) -> Self {
        Self {
            registry,
            rollout,
            breaker,
            feedback,
        }
    }

    /// Sets the rollout percentage for a registered capability.
    ///
    /// Increases walk the step ladder; decreases are unrestricted. The
    /// write is visible fleet-wide within the policy cache TTL.
    ///
    /// # Errors
    ///
    /// - `NotFound` for unregistered keys
    /// - ladder and validation errors from the controller
    pub fn set_rollout(&self, key: &CapabilityKey, percentage: u8) -> Result<u8, AdminError> {
        self.ensure_registered(key)?;
        let versioned = self
            .rollout
            .set_percentage(key, percentage, PolicyActor::Manual)?;
        Ok(versioned.value.percentage)
    }

    /// Forces the rollout percentage to 0, bypassing the step ladder.
    ///
    /// # Errors
    ///
    /// - `NotFound` for unregistered keys
    /// - `PolicyConflict` under sustained write contention
    pub fn force_rollback(&self, key: &CapabilityKey) -> Result<(), AdminError> {
        self.ensure_registered(key)?;
        self.rollout.force_rollback(key, PolicyActor::Manual)?;
        Ok(())
    }

    /// Reads the current health of a registered capability.
    ///
    /// # Errors
    ///
    /// - `NotFound` for unregistered keys
    /// - store read failures
    pub fn status(&self, key: &CapabilityKey) -> Result<StatusReport, AdminError> {
        self.ensure_registered(key)?;

        let circuit_state = self.breaker.state(key)?;
        let policy = self.rollout.current(key);
        let (rate, samples) = self.feedback.window_snapshot(key);

        Ok(StatusReport {
            key: key.clone(),
            circuit_state,
            rollout_percentage: policy.as_ref().map_or(0, |v| v.value.percentage),
            policy_version: policy.as_ref().map(|v| v.version),
            updated_by: policy.as_ref().map(|v| v.value.updated_by),
            updated_at: policy.as_ref().map(|v| v.value.updated_at),
            recent_failure_rate: rate,
            window_samples: samples,
        })
    }

    /// Health reports for every registered capability.
    ///
    /// # Errors
    ///
    /// Propagates the first store read failure.
    pub fn status_all(&self) -> Result<Vec<StatusReport>, AdminError> {
        let mut reports = Vec::new();
        for key in self.registry.keys() {
            reports.push(self.status(&key)?);
        }
        Ok(reports)
    }

    fn ensure_registered(&self, key: &CapabilityKey) -> Result<(), AdminError> {
        if self.registry.contains(key) {
            Ok(())
        } else {
            Err(AdminError::NotFound {
                agent: key.agent.clone(),
                capability: key.capability.clone(),
            })
        }
    }
}
