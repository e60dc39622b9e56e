//! In-memory storage backends.
//!
//! Thread-safe reference implementations of the storage contracts, intended
//! for embedded use, tests, and single-process fleets. A shared
//! `InMemoryPolicyStore` behind an `Arc` stands in for the fleet-wide policy
//! store in multi-replica simulations.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use crate::context::{AgentId, CapabilityKey};
use crate::event::{DecisionEvent, DecisionId, FeedbackSignal, OutcomeFeedback};
use crate::pattern::{Pattern, PatternId, PatternRelation};
use crate::rollout::RolloutPolicy;
use crate::store::traits::{
    BreakerRecord, EventFilter, OutcomeStore, PatternStore, PolicyStore, StoreError, Versioned,
};

fn lock_err(context: &'static str) -> StoreError {
    StoreError::Backend(format!("poisoned lock: {context}"))
}

#[derive(Debug, Default)]
struct OutcomeState {
    // Append order is preserved: events are a log, not a map.
    events: Vec<DecisionEvent>,
    by_id: HashMap<DecisionId, usize>,
    feedback: HashMap<DecisionId, Vec<OutcomeFeedback>>,
    feedback_seen: HashSet<(DecisionId, FeedbackSignal, DateTime<Utc>)>,
}

/// In-memory append-only outcome log.
#[derive(Debug, Default)]
pub struct InMemoryOutcomeStore {
    state: RwLock<OutcomeState>,
}

impl InMemoryOutcomeStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored events.
    ///
    /// # Errors
    ///
    /// `Backend` if the lock is poisoned.
    pub fn event_count(&self) -> Result<usize, StoreError> {
        let state = self.state.read().map_err(|_| lock_err("outcome state"))?;
        Ok(state.events.len())
    }
}

impl OutcomeStore for InMemoryOutcomeStore {
    fn append_event(&self, event: DecisionEvent) -> Result<(), StoreError> {
        let mut state = self.state.write().map_err(|_| lock_err("outcome state"))?;
        let index = state.events.len();
        state.by_id.insert(event.id, index);
        state.events.push(event);
        Ok(())
    }

    fn append_events(&self, events: Vec<DecisionEvent>) -> Result<(), StoreError> {
        let mut state = self.state.write().map_err(|_| lock_err("outcome state"))?;
        for event in events {
            let index = state.events.len();
            state.by_id.insert(event.id, index);
            state.events.push(event);
        }
        Ok(())
    }

    fn append_feedback(&self, feedback: OutcomeFeedback) -> Result<bool, StoreError> {
        let mut state = self.state.write().map_err(|_| lock_err("outcome state"))?;
        if !state.by_id.contains_key(&feedback.decision_id) {
            return Err(StoreError::DecisionNotFound(feedback.decision_id));
        }
        if !state.feedback_seen.insert(feedback.dedup_key()) {
            return Ok(false);
        }
        state
            .feedback
            .entry(feedback.decision_id)
            .or_default()
            .push(feedback);
        Ok(true)
    }

    fn event(&self, id: DecisionId) -> Result<Option<DecisionEvent>, StoreError> {
        let state = self.state.read().map_err(|_| lock_err("outcome state"))?;
        Ok(state
            .by_id
            .get(&id)
            .and_then(|&idx| state.events.get(idx))
            .cloned())
    }

    fn query_events(&self, filter: &EventFilter) -> Result<Vec<DecisionEvent>, StoreError> {
        let state = self.state.read().map_err(|_| lock_err("outcome state"))?;
        Ok(state
            .events
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect())
    }

    fn feedback_for(&self, id: DecisionId) -> Result<Vec<OutcomeFeedback>, StoreError> {
        let state = self.state.read().map_err(|_| lock_err("outcome state"))?;
        Ok(state.feedback.get(&id).cloned().unwrap_or_default())
    }

    fn purge_events_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut state = self.state.write().map_err(|_| lock_err("outcome state"))?;
        let before = state.events.len();
        let retained: Vec<DecisionEvent> = state
            .events
            .drain(..)
            .filter(|e| e.created_at >= cutoff)
            .collect();
        let purged = before - retained.len();

        state.by_id.clear();
        let mut kept_feedback: HashMap<DecisionId, Vec<OutcomeFeedback>> = HashMap::new();
        for (index, event) in retained.iter().enumerate() {
            state.by_id.insert(event.id, index);
            if let Some(fb) = state.feedback.remove(&event.id) {
                kept_feedback.insert(event.id, fb);
            }
        }
        state.events = retained;
        state.feedback = kept_feedback;
        let OutcomeState {
            by_id,
            feedback_seen,
            ..
        } = &mut *state;
        feedback_seen.retain(|(id, _, _)| by_id.contains_key(id));
        Ok(purged)
    }
}

#[derive(Debug, Default)]
struct PolicyState {
    rollouts: HashMap<CapabilityKey, Versioned<RolloutPolicy>>,
    breakers: HashMap<CapabilityKey, Versioned<BreakerRecord>>,
}

/// In-memory versioned policy store with compare-and-swap writes.
#[derive(Debug, Default)]
pub struct InMemoryPolicyStore {
    state: RwLock<PolicyState>,
}

impl InMemoryPolicyStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn cas_put<T: Clone>(
    slot: &mut HashMap<CapabilityKey, Versioned<T>>,
    key: &CapabilityKey,
    value: T,
    expected_version: Option<u64>,
) -> Result<u64, StoreError> {
    let found = slot.get(key).map(|v| v.version);
    if found != expected_version {
        return Err(StoreError::VersionConflict {
            expected: expected_version,
            found,
        });
    }
    let version = found.unwrap_or(0) + 1;
    slot.insert(key.clone(), Versioned { value, version });
    Ok(version)
}

impl PolicyStore for InMemoryPolicyStore {
    fn rollout(&self, key: &CapabilityKey) -> Result<Option<Versioned<RolloutPolicy>>, StoreError> {
        let state = self.state.read().map_err(|_| lock_err("policy state"))?;
        Ok(state.rollouts.get(key).cloned())
    }

    fn put_rollout(
        &self,
        key: &CapabilityKey,
        policy: RolloutPolicy,
        expected_version: Option<u64>,
    ) -> Result<u64, StoreError> {
        let mut state = self.state.write().map_err(|_| lock_err("policy state"))?;
        cas_put(&mut state.rollouts, key, policy, expected_version)
    }

    fn breaker(&self, key: &CapabilityKey) -> Result<Option<Versioned<BreakerRecord>>, StoreError> {
        let state = self.state.read().map_err(|_| lock_err("policy state"))?;
        Ok(state.breakers.get(key).cloned())
    }

    fn put_breaker(
        &self,
        key: &CapabilityKey,
        record: BreakerRecord,
        expected_version: Option<u64>,
    ) -> Result<u64, StoreError> {
        let mut state = self.state.write().map_err(|_| lock_err("policy state"))?;
        cas_put(&mut state.breakers, key, record, expected_version)
    }
}

#[derive(Debug, Default)]
struct PatternState {
    patterns: HashMap<PatternId, Pattern>,
    relations: Vec<PatternRelation>,
}

/// In-memory pattern store.
#[derive(Debug, Default)]
pub struct InMemoryPatternStore {
    state: RwLock<PatternState>,
}

impl InMemoryPatternStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl PatternStore for InMemoryPatternStore {
    fn insert(&self, pattern: Pattern) -> Result<(), StoreError> {
        let mut state = self.state.write().map_err(|_| lock_err("pattern state"))?;
        state.patterns.insert(pattern.id, pattern);
        Ok(())
    }

    fn update(&self, pattern: Pattern) -> Result<(), StoreError> {
        let mut state = self.state.write().map_err(|_| lock_err("pattern state"))?;
        if !state.patterns.contains_key(&pattern.id) {
            return Err(StoreError::PatternNotFound(pattern.id));
        }
        state.patterns.insert(pattern.id, pattern);
        Ok(())
    }

    fn pattern(&self, id: PatternId) -> Result<Option<Pattern>, StoreError> {
        let state = self.state.read().map_err(|_| lock_err("pattern state"))?;
        Ok(state.patterns.get(&id).cloned())
    }

    fn patterns_for_agent(&self, agent: &AgentId) -> Result<Vec<Pattern>, StoreError> {
        let state = self.state.read().map_err(|_| lock_err("pattern state"))?;
        Ok(state
            .patterns
            .values()
            .filter(|p| p.applies_to == *agent)
            .cloned()
            .collect())
    }

    fn active_patterns(&self) -> Result<Vec<Pattern>, StoreError> {
        let state = self.state.read().map_err(|_| lock_err("pattern state"))?;
        Ok(state
            .patterns
            .values()
            .filter(|p| p.is_active())
            .cloned()
            .collect())
    }

    fn all_patterns(&self) -> Result<Vec<Pattern>, StoreError> {
        let state = self.state.read().map_err(|_| lock_err("pattern state"))?;
        Ok(state.patterns.values().cloned().collect())
    }

    fn insert_relation(&self, relation: PatternRelation) -> Result<(), StoreError> {
        let mut state = self.state.write().map_err(|_| lock_err("pattern state"))?;
        state.relations.push(relation);
        Ok(())
    }

    fn relations_for(&self, id: PatternId) -> Result<Vec<PatternRelation>, StoreError> {
        let state = self.state.read().map_err(|_| lock_err("pattern state"))?;
        Ok(state
            .relations
            .iter()
            .filter(|r| r.from == id || r.to == id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::tests::sample_event;
    use crate::event::{FeedbackSource, PathTaken};
    use crate::pattern::signature_from_label;
    use crate::rollout::PolicyActor;
    use chrono::Duration;

    fn key() -> CapabilityKey {
        CapabilityKey::new(
            AgentId::new("code-review").unwrap(),
            crate::context::Capability::new("risk-score").unwrap(),
        )
    }

    #[test]
    fn test_append_and_fetch_event() {
        let store = InMemoryOutcomeStore::new();
        let event = sample_event(PathTaken::Ml);
        let id = event.id;
        store.append_event(event).unwrap();

        let fetched = store.event(id).unwrap().unwrap();
        assert_eq!(fetched.id, id);
        assert!(store.event(DecisionId::new()).unwrap().is_none());
    }

    #[test]
    fn test_batch_append_preserves_order() {
        let store = InMemoryOutcomeStore::new();
        let events: Vec<_> = (0..5).map(|_| sample_event(PathTaken::Deterministic)).collect();
        let ids: Vec<_> = events.iter().map(|e| e.id).collect();
        store.append_events(events).unwrap();

        let all = store.query_events(&EventFilter::default()).unwrap();
        let fetched_ids: Vec<_> = all.iter().map(|e| e.id).collect();
        assert_eq!(fetched_ids, ids);
    }

    #[test]
    fn test_feedback_idempotent_merge() {
        let store = InMemoryOutcomeStore::new();
        let event = sample_event(PathTaken::Ml);
        let id = event.id;
        store.append_event(event).unwrap();

        let at = Utc::now();
        let fb = OutcomeFeedback::new(id, FeedbackSignal::Rejected, at, FeedbackSource::Human);
        assert!(store.append_feedback(fb.clone()).unwrap());
        assert!(!store.append_feedback(fb).unwrap());
        assert_eq!(store.feedback_for(id).unwrap().len(), 1);
    }

    #[test]
    fn test_feedback_unknown_decision() {
        let store = InMemoryOutcomeStore::new();
        let fb = OutcomeFeedback::new(
            DecisionId::new(),
            FeedbackSignal::Accepted,
            Utc::now(),
            FeedbackSource::Human,
        );
        let err = store.append_feedback(fb).unwrap_err();
        assert!(matches!(err, StoreError::DecisionNotFound(_)));
    }

    #[test]
    fn test_purge_removes_old_events_and_feedback() {
        let store = InMemoryOutcomeStore::new();
        let mut old = sample_event(PathTaken::Ml);
        old.created_at = Utc::now() - Duration::days(30);
        let old_id = old.id;
        let fresh = sample_event(PathTaken::Ml);
        let fresh_id = fresh.id;
        store.append_event(old).unwrap();
        store.append_event(fresh).unwrap();
        store
            .append_feedback(OutcomeFeedback::new(
                old_id,
                FeedbackSignal::Success,
                Utc::now(),
                FeedbackSource::AutomatedMonitor,
            ))
            .unwrap();

        let purged = store
            .purge_events_before(Utc::now() - Duration::days(7))
            .unwrap();
        assert_eq!(purged, 1);
        assert!(store.event(old_id).unwrap().is_none());
        assert!(store.event(fresh_id).unwrap().is_some());
        assert!(store.feedback_for(old_id).unwrap().is_empty());
    }

    #[test]
    fn test_purge_prunes_feedback_dedup_state() {
        let store = InMemoryOutcomeStore::new();
        let mut event = sample_event(PathTaken::Ml);
        event.created_at = Utc::now() - Duration::days(30);
        let replay = event.clone();
        let at = Utc::now();
        let fb = OutcomeFeedback::new(
            event.id,
            FeedbackSignal::Rejected,
            at,
            FeedbackSource::Human,
        );
        store.append_event(event).unwrap();
        assert!(store.append_feedback(fb.clone()).unwrap());

        assert_eq!(
            store
                .purge_events_before(Utc::now() - Duration::days(7))
                .unwrap(),
            1
        );

        // The dedup identity of purged feedback must not outlive the event:
        // re-ingesting the event and the identical tuple is a fresh insert.
        store.append_event(replay).unwrap();
        assert!(store.append_feedback(fb).unwrap());
    }

    #[test]
    fn test_policy_cas_create_and_update() {
        let store = InMemoryPolicyStore::new();
        let k = key();
        assert!(store.rollout(&k).unwrap().is_none());

        let v1 = store
            .put_rollout(&k, RolloutPolicy::initial(5, PolicyActor::Manual), None)
            .unwrap();
        assert_eq!(v1, 1);

        // Create over existing record must conflict.
        let err = store
            .put_rollout(&k, RolloutPolicy::initial(25, PolicyActor::Manual), None)
            .unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { .. }));

        let v2 = store
            .put_rollout(&k, RolloutPolicy::initial(25, PolicyActor::Manual), Some(v1))
            .unwrap();
        assert_eq!(v2, 2);

        // Stale writer loses.
        let err = store
            .put_rollout(&k, RolloutPolicy::initial(50, PolicyActor::Manual), Some(v1))
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::VersionConflict {
                expected: Some(1),
                found: Some(2)
            }
        ));
    }

    #[test]
    fn test_breaker_cas() {
        let store = InMemoryPolicyStore::new();
        let k = key();
        let v1 = store.put_breaker(&k, BreakerRecord::default(), None).unwrap();
        assert_eq!(v1, 1);
        let fetched = store.breaker(&k).unwrap().unwrap();
        assert_eq!(fetched.version, 1);
    }

    #[test]
    fn test_pattern_store_roundtrip() {
        let store = InMemoryPatternStore::new();
        let agent = AgentId::new("code-review").unwrap();
        let mut p = Pattern::new(
            agent.clone(),
            crate::context::Capability::new("risk-score").unwrap(),
            "block",
            signature_from_label("risk-score block", 64),
            0.9,
            10,
            0.9,
        )
        .unwrap();
        store.insert(p.clone()).unwrap();

        assert_eq!(store.patterns_for_agent(&agent).unwrap().len(), 1);
        assert_eq!(store.active_patterns().unwrap().len(), 1);

        p.mark_expired();
        store.update(p.clone()).unwrap();
        assert!(store.active_patterns().unwrap().is_empty());
        assert_eq!(store.all_patterns().unwrap().len(), 1);
    }

    #[test]
    fn test_pattern_update_requires_existing() {
        let store = InMemoryPatternStore::new();
        let p = Pattern::new(
            AgentId::new("a").unwrap(),
            crate::context::Capability::new("c").unwrap(),
            "d",
            Vec::new(),
            0.5,
            1,
            0.5,
        )
        .unwrap();
        assert!(matches!(
            store.update(p).unwrap_err(),
            StoreError::PatternNotFound(_)
        ));
    }

    #[test]
    fn test_relations_bidirectional_lookup() {
        let store = InMemoryPatternStore::new();
        let a = PatternId::new();
        let b = PatternId::new();
        store
            .insert_relation(PatternRelation::new(
                a,
                b,
                crate::pattern::RelationKind::ConflictsWith,
                0.92,
            ))
            .unwrap();
        assert_eq!(store.relations_for(a).unwrap().len(), 1);
        assert_eq!(store.relations_for(b).unwrap().len(), 1);
        assert!(store.relations_for(PatternId::new()).unwrap().is_empty());
    }
}
