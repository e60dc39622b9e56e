//! Request context, capability addressing, and stable bucketing.
//!
//! Every routed request carries a context. The routing core is agent-agnostic:
//! requests are addressed by `(agent, capability)` and the context payload is
//! an opaque, size-bounded blob. Bucketing is derived from a blake3 hash of
//! the payload so the same input always lands in the same traffic bucket,
//! across calls and across process restarts.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Identifier of a decision-making agent (e.g. "code-review").
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    /// Creates an agent ID.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::EmptyAgentId` if the ID is empty.
    pub fn new(id: impl Into<String>) -> Result<Self, ValidationError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(ValidationError::EmptyAgentId);
        }
        Ok(Self(id))
    }

    /// Returns the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A capability exposed by an agent (e.g. "risk-score").
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capability(String);

impl Capability {
    /// Creates a capability name.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::EmptyCapability` if the name is empty.
    pub fn new(name: impl Into<String>) -> Result<Self, ValidationError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ValidationError::EmptyCapability);
        }
        Ok(Self(name))
    }

    /// Returns the capability as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Addressing key for all routing state: `(agent, capability)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CapabilityKey {
    /// The owning agent.
    pub agent: AgentId,
    /// The capability within that agent.
    pub capability: Capability,
}

impl CapabilityKey {
    /// Creates a capability key.
    #[must_use]
    pub fn new(agent: AgentId, capability: Capability) -> Self {
        Self { agent, capability }
    }
}

impl fmt::Display for CapabilityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.agent, self.capability)
    }
}

/// Stable hash of a request context payload.
///
/// Computed with blake3 over the canonical JSON encoding of the payload.
/// The fingerprint is the identity used for traffic bucketing and for
/// correlating shadow records with later feedback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Computes the fingerprint of a payload.
    #[must_use]
    pub fn of(payload: &serde_json::Value) -> Self {
        // serde_json renders map keys in a stable order for a given Value,
        // so the same payload always produces the same bytes.
        let bytes = payload.to_string();
        Self(*blake3::hash(bytes.as_bytes()).as_bytes())
    }

    /// Maps the fingerprint to a traffic bucket in `0..100`.
    ///
    /// A request is ML-eligible iff `bucket < rollout percentage`.
    #[must_use]
    pub fn bucket(&self) -> u8 {
        let mut head = [0u8; 8];
        head.copy_from_slice(&self.0[..8]);
        #[allow(clippy::cast_possible_truncation)]
        {
            (u64::from_le_bytes(head) % 100) as u8
        }
    }

    /// Returns the raw hash bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// The input to a routed decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestContext {
    /// The agent this request addresses.
    pub agent: AgentId,

    /// The capability being invoked.
    pub capability: Capability,

    /// Opaque, size-bounded payload. The routing core never interprets it.
    pub payload: serde_json::Value,
}

impl RequestContext {
    /// Creates a request context.
    #[must_use]
    pub fn new(agent: AgentId, capability: Capability, payload: serde_json::Value) -> Self {
        Self {
            agent,
            capability,
            payload,
        }
    }

    /// Returns the addressing key for this request.
    #[must_use]
    pub fn key(&self) -> CapabilityKey {
        CapabilityKey::new(self.agent.clone(), self.capability.clone())
    }

    /// Computes the stable fingerprint of the payload.
    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(&self.payload)
    }

    /// Size of the serialized payload in bytes.
    #[must_use]
    pub fn payload_size(&self) -> usize {
        self.payload.to_string().len()
    }
}
