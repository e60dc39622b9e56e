//! Learned, transferable behavioral patterns.
//!
//! A pattern is a decision rule mined from accumulated outcomes: "for this
//! capability, this decision label keeps getting validated". Patterns carry
//! a confidence that decays without reinforcement, and relate to each other
//! through explicit `supersedes` / `conflicts_with` graph edges instead of a
//! single globally consistent ruleset.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::{AgentId, Capability};
use crate::error::ValidationError;

/// Unique identifier for a pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PatternId(Uuid);

impl PatternId {
    /// Creates a new random pattern ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PatternId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PatternId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum PatternStatus {
    /// Eligible for propagation and active use.
    Active,

    /// Lost a conflict resolution; excluded from active use, kept for audit.
    Conflicted {
        /// The pattern that won the resolution.
        winner: PatternId,
    },

    /// Replaced by a newer pattern.
    Superseded {
        /// The replacement.
        by: PatternId,
    },

    /// Confidence decayed below the active floor; soft-deleted.
    Expired,
}

/// A learned, transferable behavioral rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pattern {
    /// Unique identifier.
    pub id: PatternId,

    /// The agent the pattern was mined from.
    pub origin_agent: AgentId,

    /// The agent the pattern currently applies to. Equals `origin_agent`
    /// for mined patterns; differs after a cross-agent transfer.
    pub applies_to: AgentId,

    /// The capability the pattern applies to.
    pub capability: Capability,

    /// The recommended decision label.
    pub decision: String,

    /// Feature-hash signature used for similarity scoring.
    pub signature: Vec<f32>,

    /// Confidence in [0.0, 1.0]; decays without reinforcement.
    pub confidence: f32,

    /// How many outcomes contributed to this pattern.
    pub usage_count: u64,

    /// Fraction of positive outcomes observed.
    pub success_rate: f32,

    /// When the pattern was first created.
    pub created_at: DateTime<Utc>,

    /// Last time the pattern was reinforced by fresh outcomes.
    pub last_reinforced_at: DateTime<Utc>,

    /// Hard expiry, if one was set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,

    /// Lifecycle status.
    pub status: PatternStatus,
}

impl Pattern {
    /// Creates an active pattern.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::ConfidenceOutOfRange` if `confidence` or
    /// `success_rate` is not in [0.0, 1.0].
    pub fn new(
        origin_agent: AgentId,
        capability: Capability,
        decision: impl Into<String>,
        signature: Vec<f32>,
        confidence: f32,
        usage_count: u64,
        success_rate: f32,
    ) -> Result<Self, ValidationError> {
        validate_unit(confidence)?;
        validate_unit(success_rate)?;
        let now = Utc::now();
        Ok(Self {
            id: PatternId::new(),
            applies_to: origin_agent.clone(),
            origin_agent,
            capability,
            decision: decision.into(),
            signature,
            confidence,
            usage_count,
            success_rate,
            created_at: now,
            last_reinforced_at: now,
            expires_at: None,
            status: PatternStatus::Active,
        })
    }

    /// Returns true if the pattern may be propagated and applied.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self.status, PatternStatus::Active)
    }

    /// Conflict-resolution weight: `confidence * usage_count`.
    #[must_use]
    pub fn weight(&self) -> f64 {
        f64::from(self.confidence) * self.usage_count as f64
    }

    /// Reinforces the pattern with freshly observed outcomes.
    pub fn reinforce(&mut self, confidence: f32, usage_count: u64, success_rate: f32) {
        self.confidence = confidence.clamp(0.0, 1.0);
        self.usage_count = usage_count;
        self.success_rate = success_rate.clamp(0.0, 1.0);
        self.last_reinforced_at = Utc::now();
    }

    /// Applies time decay: `confidence -= rate_per_day * days_since_reinforcement`.
    ///
    /// Returns the decayed confidence. Does not change status; expiry is the
    /// propagator's call.
    pub fn apply_decay(&mut self, rate_per_day: f32, now: DateTime<Utc>) -> f32 {
        let elapsed = now.signed_duration_since(self.last_reinforced_at);
        let days = elapsed.num_seconds().max(0) as f32 / 86_400.0;
        self.confidence = (self.confidence - rate_per_day * days).max(0.0);
        self.confidence
    }

    /// Marks the pattern as having lost a conflict resolution.
    pub fn mark_conflicted(&mut self, winner: PatternId) {
        self.status = PatternStatus::Conflicted { winner };
    }

    /// Marks the pattern as expired (soft delete).
    pub fn mark_expired(&mut self) {
        self.status = PatternStatus::Expired;
    }

    /// Clones the pattern for another agent, preserving provenance.
    #[must_use]
    pub fn transferred_to(&self, target: AgentId) -> Self {
        let mut clone = self.clone();
        clone.id = PatternId::new();
        clone.applies_to = target;
        clone.created_at = Utc::now();
        clone.status = PatternStatus::Active;
        clone
    }
}

fn validate_unit(value: f32) -> Result<(), ValidationError> {
    if value.is_nan() || !(0.0..=1.0).contains(&value) {
        return Err(ValidationError::ConfidenceOutOfRange { value });
    }
    Ok(())
}

/// Kind of edge between two patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    /// `from` replaces `to`.
    Supersedes,

    /// `from` won a conflict resolution against `to`.
    ConflictsWith,
}

/// A directed edge in the pattern graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternRelation {
    /// Edge source.
    pub from: PatternId,

    /// Edge target.
    pub to: PatternId,

    /// What the edge means.
    pub kind: RelationKind,

    /// Signature similarity at the time the edge was created.
    pub similarity_score: f32,

    /// When the edge was created.
    pub created_at: DateTime<Utc>,
}

impl PatternRelation {
    /// Creates an edge.
    #[must_use]
    pub fn new(from: PatternId, to: PatternId, kind: RelationKind, similarity_score: f32) -> Self {
        Self {
            from,
            to,
            kind,
            similarity_score,
            created_at: Utc::now(),
        }
    }
}

/// Default signature dimensionality.
///
/// Kept modest: signatures are compared pairwise every propagation cycle.
pub const DEFAULT_SIGNATURE_DIM: usize = 64;

/// Builds a deterministic feature-hash signature from a label.
///
/// Tokens are hashed with blake3 into signed buckets and the vector is
/// L2-normalized. Not a neural embedding: a stable, offline baseline that
/// makes signatures from structurally different agents comparable when they
/// describe the same capability and decision.
#[must_use]
pub fn signature_from_label(label: &str, dim: usize) -> Vec<f32> {
    if dim == 0 {
        return Vec::new();
    }

    let mut vec = vec![0.0f32; dim];
    let mut count = 0u32;

    for token in label
        .to_ascii_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
    {
        let hash = blake3::hash(token.as_bytes());
        let bytes = hash.as_bytes();
        let mut head = [0u8; 8];
        head.copy_from_slice(&bytes[..8]);
        let bucket = u64::from_le_bytes(head) as usize % dim;
        let sign = if (bytes[8] & 1) == 0 { 1.0f32 } else { -1.0f32 };
        vec[bucket] += sign;
        count = count.saturating_add(1);
    }

    if count == 0 {
        return vec;
    }

    let mut norm2 = 0.0f64;
    for &x in &vec {
        norm2 += f64::from(x) * f64::from(x);
    }
    if norm2 > 0.0 {
        #[allow(clippy::cast_possible_truncation)]
        let inv = norm2.sqrt().recip() as f32;
        for x in &mut vec {
            *x *= inv;
        }
    }

    vec
}

/// Cosine similarity between two signatures.
///
/// Returns 0.0 for empty or zero-norm inputs and for dimension mismatches;
/// similarity across incompatible signature spaces is meaningless, not an
/// error.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (&x, &y) in a.iter().zip(b.iter()) {
        let xf = f64::from(x);
        let yf = f64::from(y);
        dot += xf * yf;
        norm_a += xf * xf;
        norm_b += yf * yf;
    }

    if norm_a <= 0.0 || norm_b <= 0.0 {
        return 0.0;
    }

    let sim = dot / (norm_a.sqrt() * norm_b.sqrt());
    if sim.is_finite() {
        #[allow(clippy::cast_possible_truncation)]
        {
            sim as f32
        }
    } else {
        0.0
    }
}
