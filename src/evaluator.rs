//! Evaluator seams and the capability registry.
//!
//! The routing core is agent-agnostic. Each `(agent, capability)` pair
//! registers a deterministic evaluator (always required) and optionally an
//! ML evaluator. Both are external collaborators behind narrow traits; the
//! core never interprets their results.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::context::{CapabilityKey, RequestContext};
use crate::error::{EvalError, MlError};
use crate::event::Assessment;

/// Cooperative cancellation flag for an in-flight ML call.
///
/// The router sets the token when the deadline expires. Evaluators must
/// poll it (or honor the deadline directly) and return promptly; a cancelled
/// call's result is discarded.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Creates an unset token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Returns true if cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// The always-available production evaluator. Failures here are fatal to the
/// request: no further fallback exists.
pub trait DeterministicEvaluator: Send + Sync {
    /// Evaluates the context synchronously.
    fn evaluate(&self, ctx: &RequestContext) -> Result<Assessment, EvalError>;
}

/// The candidate ML evaluator, run under a hard deadline.
pub trait MlEvaluator: Send + Sync {
    /// Predicts a result for the context.
    ///
    /// Implementations must respect `deadline` and return promptly once
    /// `cancel` is set.
    fn predict(
        &self,
        ctx: &RequestContext,
        deadline: Duration,
        cancel: &CancelToken,
    ) -> Result<Assessment, MlError>;
}

/// The evaluators registered for one capability.
#[derive(Clone)]
pub struct CapabilityEntry {
    /// The fallback of record.
    pub deterministic: Arc<dyn DeterministicEvaluator>,

    /// The candidate path, if this capability has one.
    pub ml: Option<Arc<dyn MlEvaluator>>,
}

/// Registry of evaluators keyed by `(agent, capability)`.
///
/// Read-mostly: lookups happen on every routed request, registration only
/// at startup or reconfiguration.
#[derive(Default)]
pub struct CapabilityRegistry {
    entries: RwLock<HashMap<CapabilityKey, CapabilityEntry>>,
}

impl CapabilityRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the evaluators for a capability.
    pub fn register(
        &self,
        key: CapabilityKey,
        deterministic: Arc<dyn DeterministicEvaluator>,
        ml: Option<Arc<dyn MlEvaluator>>,
    ) {
        let mut guard = self.entries.write().expect("registry lock poisoned");
        guard.insert(key, CapabilityEntry { deterministic, ml });
    }

    /// Looks up the evaluators for a capability.
    #[must_use]
    pub fn lookup(&self, key: &CapabilityKey) -> Option<CapabilityEntry> {
        let guard = self.entries.read().expect("registry lock poisoned");
        guard.get(key).cloned()
    }

    /// Returns true if the capability is registered.
    #[must_use]
    pub fn contains(&self, key: &CapabilityKey) -> bool {
        let guard = self.entries.read().expect("registry lock poisoned");
        guard.contains_key(key)
    }

    /// All registered keys.
    #[must_use]
    pub fn keys(&self) -> Vec<CapabilityKey> {
        let guard = self.entries.read().expect("registry lock poisoned");
        guard.keys().cloned().collect()
    }
}
