//! # shadowroute - Adaptive Decision Routing
//!
//! shadowroute routes per-request decisions between a deterministic
//! evaluator and an ML-enhanced candidate, learning which to trust without
//! betting production on the answer. The ML path runs in shadow until a
//! percentage rollout promotes it, a circuit breaker sheds it when it
//! degrades, and outcome feedback rolls it back automatically.
//!
//! ## Core Concepts
//!
//! - **CapabilityKey**: the `(agent, capability)` pair every policy and
//!   decision is addressed by
//! - **DecisionEvent**: the durable record of one routed request, with both
//!   evaluators' results
//! - **RolloutPolicy**: the versioned traffic split, advanced through a step
//!   ladder and shared across router replicas
//! - **Pattern**: a validated decision rule mined from outcomes and
//!   transferable between agents
//!
//! ## Usage
//!
//! ```rust,ignore
//! use shadowroute::{
//!     AgentId, Capability, CapabilityKey, CapabilityRegistry, DecisionRouter,
//!     RequestContext,
//! };
//!
//! let key = CapabilityKey::new(
//!     AgentId::new("code-review")?,
//!     Capability::new("risk-score")?,
//! );
//! registry.register(key.clone(), deterministic, Some(ml));
//!
//! let ctx = RequestContext::new(
//!     key.agent.clone(),
//!     key.capability.clone(),
//!     serde_json::json!({"file": "main.rs"}),
//! );
//! let response = router.route(&ctx)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod context;
pub mod error;
pub mod event;
pub mod evaluator;
pub mod pattern;

// Routing and control
pub mod breaker;
pub mod metrics;
pub mod rollout;
pub mod router;
pub mod shadow;
pub mod store;

// Learning loop
pub mod admin;
pub mod feedback;
pub mod propagator;

// Re-export primary types at crate root for convenience
pub use admin::{AdminApi, StatusReport};
pub use breaker::{BreakerConfig, BreakerRecord, CircuitBreaker, CircuitState};
pub use context::{AgentId, Capability, CapabilityKey, Fingerprint, RequestContext};
pub use error::{AdminError, EvalError, MlError, RouteError, ValidationError};
pub use evaluator::{
    CancelToken, CapabilityEntry, CapabilityRegistry, DeterministicEvaluator, MlEvaluator,
};
pub use event::{
    Assessment, DecisionEvent, DecisionId, FeedbackSignal, FeedbackSource, OutcomeFeedback,
    PathTaken,
};
pub use feedback::{FeedbackConfig, FeedbackIngestor, IngestStatus, RollingWindow};
pub use metrics::{MetricsSnapshot, RouterMetrics};
pub use pattern::{Pattern, PatternId, PatternRelation, PatternStatus, RelationKind};
pub use propagator::{
    CycleOutcome, CycleReport, KnowledgePropagator, PropagatorConfig, PropagatorWorker,
    TransferProposal,
};
pub use rollout::{PolicyActor, RolloutConfig, RolloutController, RolloutPolicy};
pub use router::{DecisionRouter, RouteResponse, RouterConfig};
pub use shadow::{ShadowConfig, ShadowRecorder};
pub use store::{
    EventFilter, InMemoryOutcomeStore, InMemoryPatternStore, InMemoryPolicyStore, OutcomeStore,
    PatternStore, PolicyStore, StoreError, Versioned,
};
