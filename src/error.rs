//! Error types for shadowroute.
//!
//! All errors are strongly typed using thiserror. Errors are split by layer:
//! callers of the router see only `RouteError`; the ML path's failures stay
//! internal (`MlError`) and surface as metrics; the administrative surface
//! has its own small set (`AdminError`).

use thiserror::Error;

use crate::context::{AgentId, Capability};

/// Validation errors that occur during input validation.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Percentage {value} is out of range [0, 100]")]
    PercentageOutOfRange {
        value: u32,
    },

    #[error("Confidence value {value} is out of range [0.0, 1.0]")]
    ConfidenceOutOfRange {
        value: f32,
    },

    #[error("Agent id cannot be empty")]
    EmptyAgentId,

    #[error("Capability cannot be empty")]
    EmptyCapability,

    #[error("Signature dimension must be non-zero")]
    ZeroSignatureDimension,

    #[error("Rolling window size must be at least 1, got {size}")]
    WindowTooSmall {
        size: usize,
    },
}

/// Errors a caller of the decision router can observe.
///
/// This is the complete caller-visible set. Failures of the ML path are
/// recovered locally by falling back to the deterministic result and are
/// never propagated here.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("Unknown capability: {agent}/{capability}")]
    UnknownCapability {
        agent: AgentId,
        capability: Capability,
    },

    #[error("Context payload is {size} bytes, exceeds limit of {max} bytes")]
    ContextTooLarge {
        size: usize,
        max: usize,
    },

    /// The deterministic evaluator failed. Fatal: no further fallback exists.
    #[error("Deterministic evaluation failed: {0}")]
    Deterministic(#[from] EvalError),
}

/// Failure of a deterministic evaluator.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct EvalError {
    /// Human-readable failure description.
    pub message: String,
}

impl EvalError {
    /// Creates an evaluation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Internal failures of the ML evaluation path.
///
/// These never reach the router's caller; they feed the circuit breaker and
/// the soft-failure metrics.
#[derive(Debug, Error)]
pub enum MlError {
    #[error("ML evaluation exceeded the {budget_ms}ms deadline")]
    Timeout {
        budget_ms: u64,
    },

    #[error("ML evaluation failed: {message}")]
    Evaluation {
        message: String,
    },

    #[error("ML dispatch worker disconnected")]
    Disconnected,

    /// The dispatch queue was full; the attempt was shed locally without
    /// charging the circuit breaker.
    #[error("ML dispatch queue is full")]
    Saturated,
}

impl MlError {
    /// Creates an evaluation error.
    #[must_use]
    pub fn evaluation(message: impl Into<String>) -> Self {
        Self::Evaluation {
            message: message.into(),
        }
    }

    /// Returns true if the failure was a deadline expiry.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Errors surfaced to the administrative caller.
#[derive(Debug, Error)]
pub enum AdminError {
    #[error("Unknown agent/capability: {agent}/{capability}")]
    NotFound {
        agent: AgentId,
        capability: Capability,
    },

    #[error("Policy version conflict after {attempts} attempts")]
    PolicyConflict {
        attempts: u32,
    },

    #[error("Invalid percentage: {0}")]
    InvalidPercentage(#[from] ValidationError),

    #[error("Rollout step {requested} is not reachable from {current}; next allowed step is {next}")]
    InvalidStep {
        current: u8,
        requested: u8,
        next: u8,
    },

    #[error("Policy store error: {0}")]
    Store(#[from] crate::store::StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{AgentId, Capability};

    #[test]
    fn test_route_error_unknown_capability_display() {
        let err = RouteError::UnknownCapability {
            agent: AgentId::new("code-review").unwrap(),
            capability: Capability::new("risk-score").unwrap(),
        };
        let msg = format!("{err}");
        assert!(msg.contains("code-review"));
        assert!(msg.contains("risk-score"));
    }

    #[test]
    fn test_route_error_context_too_large_display() {
        let err = RouteError::ContextTooLarge {
            size: 70_000,
            max: 65_536,
        };
        let msg = format!("{err}");
        assert!(msg.contains("70000"));
        assert!(msg.contains("65536"));
    }

    #[test]
    fn test_ml_error_timeout() {
        let err = MlError::Timeout { budget_ms: 150 };
        assert!(err.is_timeout());
        assert!(format!("{err}").contains("150ms"));
    }

    #[test]
    fn test_ml_error_evaluation_not_timeout() {
        let err = MlError::evaluation("model unavailable");
        assert!(!err.is_timeout());
        assert!(format!("{err}").contains("model unavailable"));
    }

    #[test]
    fn test_admin_error_invalid_step_display() {
        let err = AdminError::InvalidStep {
            current: 5,
            requested: 100,
            next: 25,
        };
        let msg = format!("{err}");
        assert!(msg.contains("100"));
        assert!(msg.contains("25"));
    }

    #[test]
    fn test_validation_error_percentage() {
        let err = ValidationError::PercentageOutOfRange { value: 150 };
        assert!(format!("{err}").contains("150"));
    }
}
