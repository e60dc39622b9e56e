//! Abstract storage contracts for the routing core.
//!
//! The core does not mandate a storage engine; it defines narrow access
//! contracts:
//! - `OutcomeStore`: append-only decision events and feedback, safe for
//!   concurrent writers
//! - `PolicyStore`: versioned rollout/breaker records with compare-and-swap
//!   writes
//! - `PatternStore`: learned patterns and their relation graph

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::context::CapabilityKey;
use crate::event::{DecisionEvent, DecisionId, OutcomeFeedback};
use crate::pattern::{Pattern, PatternId, PatternRelation};
use crate::rollout::RolloutPolicy;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Decision event not found.
    #[error("Decision not found: {0}")]
    DecisionNotFound(DecisionId),

    /// No policy record exists for the key.
    #[error("Policy not found: {0}")]
    PolicyNotFound(CapabilityKey),

    /// Pattern not found.
    #[error("Pattern not found: {0}")]
    PatternNotFound(PatternId),

    /// Compare-and-swap write lost to a concurrent writer.
    #[error("Version conflict: expected {expected:?}, found {found:?}")]
    VersionConflict {
        /// The version the writer observed.
        expected: Option<u64>,
        /// The version actually stored.
        found: Option<u64>,
    },

    /// Backend error.
    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// A value paired with its monotonic store version.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    /// The stored value.
    pub value: T,

    /// Monotonically increasing version; last-writer-wins by version.
    pub version: u64,
}

/// Filter for querying decision events.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Restrict to one `(agent, capability)`.
    pub key: Option<CapabilityKey>,

    /// Only events created at or after this time.
    pub since: Option<DateTime<Utc>>,

    /// Only events created before this time.
    pub until: Option<DateTime<Utc>>,
}

impl EventFilter {
    /// Returns true if the event passes the filter.
    #[must_use]
    pub fn matches(&self, event: &DecisionEvent) -> bool {
        if let Some(key) = &self.key {
            if event.key() != *key {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.created_at >= until {
                return false;
            }
        }
        true
    }
}

/// Append-only log of decision events and outcome feedback.
///
/// Safe for concurrent writers. Events are immutable once appended; feedback
/// is deduplicated on `(decision_id, signal, observed_at)`.
pub trait OutcomeStore: Send + Sync {
    /// Appends one decision event.
    fn append_event(&self, event: DecisionEvent) -> Result<(), StoreError>;

    /// Appends a batch of decision events.
    fn append_events(&self, events: Vec<DecisionEvent>) -> Result<(), StoreError>;

    /// Appends feedback. Returns `false` if the identical tuple was already
    /// stored (idempotent merge).
    ///
    /// # Errors
    ///
    /// `DecisionNotFound` if the referenced decision does not resolve.
    fn append_feedback(&self, feedback: OutcomeFeedback) -> Result<bool, StoreError>;

    /// Fetches one decision event.
    fn event(&self, id: DecisionId) -> Result<Option<DecisionEvent>, StoreError>;

    /// Queries events in append order.
    fn query_events(&self, filter: &EventFilter) -> Result<Vec<DecisionEvent>, StoreError>;

    /// All feedback recorded for a decision.
    fn feedback_for(&self, id: DecisionId) -> Result<Vec<OutcomeFeedback>, StoreError>;

    /// Deletes events created before the cutoff (retention policy).
    /// Returns the number of events removed.
    fn purge_events_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;
}

/// Circuit breaker state as stored in the policy store.
pub use crate::breaker::BreakerRecord;

/// Versioned policy records with compare-and-swap writes.
///
/// `expected_version == None` on a put means "create; must not already
/// exist". A mismatch fails with `VersionConflict` and the caller re-reads
/// and retries.
pub trait PolicyStore: Send + Sync {
    /// Reads the rollout policy for a key.
    fn rollout(&self, key: &CapabilityKey) -> Result<Option<Versioned<RolloutPolicy>>, StoreError>;

    /// Writes a rollout policy iff the stored version matches.
    /// Returns the new version.
    fn put_rollout(
        &self,
        key: &CapabilityKey,
        policy: RolloutPolicy,
        expected_version: Option<u64>,
    ) -> Result<u64, StoreError>;

    /// Reads the breaker record for a key.
    fn breaker(&self, key: &CapabilityKey) -> Result<Option<Versioned<BreakerRecord>>, StoreError>;

    /// Writes a breaker record iff the stored version matches.
    /// Returns the new version.
    fn put_breaker(
        &self,
        key: &CapabilityKey,
        record: BreakerRecord,
        expected_version: Option<u64>,
    ) -> Result<u64, StoreError>;
}

/// Storage for learned patterns and the relation graph.
pub trait PatternStore: Send + Sync {
    /// Inserts a new pattern.
    fn insert(&self, pattern: Pattern) -> Result<(), StoreError>;

    /// Updates an existing pattern.
    ///
    /// # Errors
    ///
    /// `PatternNotFound` if the pattern was never inserted.
    fn update(&self, pattern: Pattern) -> Result<(), StoreError>;

    /// Fetches a pattern by ID.
    fn pattern(&self, id: PatternId) -> Result<Option<Pattern>, StoreError>;

    /// All patterns currently applying to an agent.
    fn patterns_for_agent(&self, agent: &crate::context::AgentId)
        -> Result<Vec<Pattern>, StoreError>;

    /// All active patterns.
    fn active_patterns(&self) -> Result<Vec<Pattern>, StoreError>;

    /// Every stored pattern, including conflicted and expired ones.
    fn all_patterns(&self) -> Result<Vec<Pattern>, StoreError>;

    /// Records a relation edge.
    fn insert_relation(&self, relation: PatternRelation) -> Result<(), StoreError>;

    /// All edges touching a pattern (either direction).
    fn relations_for(&self, id: PatternId) -> Result<Vec<PatternRelation>, StoreError>;
}
