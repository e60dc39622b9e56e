//! Decision events and outcome feedback.
//!
//! A `DecisionEvent` is the durable record of one routed request: what both
//! evaluators said, which path was taken, and what the caller received.
//! Events are immutable once created; delayed outcome signals arrive as
//! separate append-only `OutcomeFeedback` records.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::{AgentId, Capability, CapabilityKey, Fingerprint};

/// Unique identifier for a decision event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DecisionId(Uuid);

impl DecisionId {
    /// Creates a new random decision ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DecisionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DecisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which evaluation path produced the authoritative result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathTaken {
    /// The deterministic result was returned.
    Deterministic,

    /// The ML result was returned (circuit closed, within budget).
    Ml,

    /// Reserved for capabilities that merge both results. The current
    /// router never emits this variant.
    Hybrid,
}

impl fmt::Display for PathTaken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deterministic => write!(f, "deterministic"),
            Self::Ml => write!(f, "ml"),
            Self::Hybrid => write!(f, "hybrid"),
        }
    }
}

/// The result of one evaluator run.
///
/// The routing core treats results as opaque: `decision` is the label an
/// agent acts on (e.g. "approve", "block"), `score` a scalar the agent may
/// attach, `details` an arbitrary blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assessment {
    /// Decision label.
    pub decision: String,

    /// Scalar score attached by the evaluator.
    pub score: f32,

    /// Evaluator-specific detail payload.
    #[serde(default)]
    pub details: serde_json::Value,
}

impl Assessment {
    /// Creates an assessment with no detail payload.
    #[must_use]
    pub fn new(decision: impl Into<String>, score: f32) -> Self {
        Self {
            decision: decision.into(),
            score,
            details: serde_json::Value::Null,
        }
    }

    /// Attaches a detail payload.
    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// One routed request, recorded for shadow learning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionEvent {
    /// Unique identifier, generated at creation.
    pub id: DecisionId,

    /// The agent that handled the request.
    pub agent: AgentId,

    /// The capability invoked.
    pub capability: Capability,

    /// Stable hash of the input context.
    pub context_fingerprint: Fingerprint,

    /// The opaque input payload (size-bounded at routing time).
    pub context_payload: serde_json::Value,

    /// Which path produced the chosen result.
    pub path_taken: PathTaken,

    /// The deterministic result. Always present: it is the fallback of record.
    pub deterministic_result: Assessment,

    /// The ML result, when one was computed within budget.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ml_result: Option<Assessment>,

    /// The authoritative result returned to the caller.
    pub chosen_result: Assessment,

    /// End-to-end routing latency in milliseconds.
    pub latency_ms: u64,

    /// When the decision was made.
    pub created_at: DateTime<Utc>,
}

impl DecisionEvent {
    /// Returns the addressing key of this event.
    #[must_use]
    pub fn key(&self) -> CapabilityKey {
        CapabilityKey::new(self.agent.clone(), self.capability.clone())
    }

    /// Returns true if the chosen result came from the ML path.
    #[must_use]
    pub const fn took_ml_path(&self) -> bool {
        matches!(self.path_taken, PathTaken::Ml)
    }
}

/// A delayed, out-of-band outcome signal for a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackSignal {
    /// A human accepted the suggestion.
    Accepted,

    /// A human rejected the suggestion.
    Rejected,

    /// The decision led to a successful outcome.
    Success,

    /// The decision led to a failure.
    Failure,
}

impl FeedbackSignal {
    /// Returns true for signals that count against the ML path.
    #[must_use]
    pub const fn is_negative(&self) -> bool {
        matches!(self, Self::Rejected | Self::Failure)
    }
}

impl fmt::Display for FeedbackSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accepted => write!(f, "accepted"),
            Self::Rejected => write!(f, "rejected"),
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
        }
    }
}

/// Where a feedback signal originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackSource {
    /// A human reviewer.
    Human,

    /// An automated monitor.
    AutomatedMonitor,
}

/// An append-only outcome record attached to a prior decision.
///
/// Feedback may arrive out of order. The tuple
/// `(decision_id, signal, observed_at)` is the dedup identity: re-ingesting
/// the same tuple is a no-op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeFeedback {
    /// The decision this feedback refers to.
    pub decision_id: DecisionId,

    /// The observed signal.
    pub signal: FeedbackSignal,

    /// When the outcome was observed.
    pub observed_at: DateTime<Utc>,

    /// Who observed it.
    pub source: FeedbackSource,
}

impl OutcomeFeedback {
    /// Creates a feedback record.
    #[must_use]
    pub fn new(
        decision_id: DecisionId,
        signal: FeedbackSignal,
        observed_at: DateTime<Utc>,
        source: FeedbackSource,
    ) -> Self {
        Self {
            decision_id,
            signal,
            observed_at,
            source,
        }
    }

    /// The idempotency key for deduplication.
    #[must_use]
    pub fn dedup_key(&self) -> (DecisionId, FeedbackSignal, DateTime<Utc>) {
        (self.decision_id, self.signal, self.observed_at)
    }
}
