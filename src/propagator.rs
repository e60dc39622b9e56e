//! Knowledge propagator.
//!
//! A background service that mines the outcome log for high-confidence
//! behavioral patterns, proposes transfers between agents sharing a
//! capability, and resolves contradictions with confidence-weighted
//! arbitration over explicit graph edges. It communicates with the request
//! path only through the stores: the synchronous path has zero dependency
//! on this job's health.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};

use crate::context::{AgentId, CapabilityKey};
use crate::pattern::{
    cosine_similarity, signature_from_label, Pattern, PatternId, PatternRelation, RelationKind,
    DEFAULT_SIGNATURE_DIM,
};
use crate::store::{EventFilter, OutcomeStore, PatternStore, StoreError};

/// Propagator tuning.
#[derive(Debug, Clone)]
pub struct PropagatorConfig {
    /// Interval between cycles.
    pub interval: Duration,

    /// How far back each cycle mines the outcome log.
    pub lookback: chrono::Duration,

    /// Minimum signature similarity for a transfer proposal.
    pub transfer_threshold: f32,

    /// Minimum origin confidence for a transfer proposal, and the floor
    /// below which decayed patterns expire.
    pub min_confidence: f32,

    /// Confidence margin a challenger needs to displace an incumbent.
    pub improvement_margin: f32,

    /// Daily confidence decay without reinforcement.
    pub decay_rate_per_day: f32,

    /// Minimum feedback samples before a pattern is mined.
    pub min_samples: usize,

    /// Signature dimensionality.
    pub signature_dim: usize,
}

impl Default for PropagatorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            lookback: chrono::Duration::hours(1),
            transfer_threshold: 0.8,
            min_confidence: 0.75,
            improvement_margin: 0.05,
            decay_rate_per_day: 0.02,
            min_samples: 10,
            signature_dim: DEFAULT_SIGNATURE_DIM,
        }
    }
}

/// A proposed cross-agent pattern transfer.
#[derive(Debug, Clone)]
pub struct TransferProposal {
    /// The pattern to transfer.
    pub pattern_id: PatternId,

    /// The agent it was mined from.
    pub from_agent: AgentId,

    /// The agent it would be applied to.
    pub to_agent: AgentId,

    /// Signature similarity that justified the proposal.
    pub similarity_score: f32,
}

/// Summary of one propagation cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Patterns newly mined or reinforced.
    pub discovered: usize,

    /// Transfers proposed this cycle.
    pub proposed: usize,

    /// Transfers applied (target gained a pattern).
    pub applied: usize,

    /// Conflicts resolved (a loser was marked).
    pub conflicts_resolved: usize,

    /// Patterns expired by decay.
    pub expired: usize,
}

/// Outcome of triggering a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The cycle ran.
    Ran(CycleReport),

    /// Another cycle already held the lease; nothing ran.
    Skipped,
}

/// Mines patterns and propagates them between agents.
pub struct KnowledgePropagator {
    outcomes: Arc<dyn OutcomeStore>,
    patterns: Arc<dyn PatternStore>,
    config: PropagatorConfig,
    // Lightweight lease: a cycle triggered while one is running is skipped,
    // making re-triggering safe.
    lease: AtomicBool,
}

impl KnowledgePropagator {
    /// Creates a propagator.
    #[must_use]
    pub fn new(
        outcomes: Arc<dyn OutcomeStore>,
        patterns: Arc<dyn PatternStore>,
        config: PropagatorConfig,
    ) -> Self {
        Self {
            outcomes,
            patterns,
            config,
            lease: AtomicBool::new(false),
        }
    }

    /// Runs one full cycle under the lease: decay, discovery, transfer.
    ///
    /// # Errors
    ///
    /// Propagates storage failures; the lease is released either way.
    pub fn run_once(&self) -> Result<CycleOutcome, StoreError> {
        if self
            .lease
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(CycleOutcome::Skipped);
        }
        let result = self.cycle(Utc::now());
        self.lease.store(false, Ordering::Release);
        result.map(CycleOutcome::Ran)
    }

    fn cycle(&self, now: DateTime<Utc>) -> Result<CycleReport, StoreError> {
        let mut report = CycleReport {
            expired: self.decay_cycle(now)?,
            ..CycleReport::default()
        };
        report.discovered = self.discover_patterns()?.len();

        let proposals = self.propose_transfers()?;
        report.proposed = proposals.len();
        for proposal in proposals {
            let (applied, resolved) = self.apply_transfer(&proposal)?;
            report.applied += usize::from(applied);
            report.conflicts_resolved += resolved;
        }
        Ok(report)
    }

    /// Applies time decay to active patterns; expires those whose confidence
    /// crosses below the floor. Expired patterns are retained for audit.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn decay_cycle(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut expired = 0;
        for mut pattern in self.patterns.active_patterns()? {
            let hard_expired = pattern.expires_at.is_some_and(|at| now >= at);
            pattern.apply_decay(self.config.decay_rate_per_day, now);
            if hard_expired || pattern.confidence < self.config.min_confidence {
                pattern.mark_expired();
                expired += 1;
            }
            self.patterns.update(pattern)?;
        }
        Ok(expired)
    }

    /// Mines the recent outcome log for validated decision rules.
    ///
    /// Groups ML-path decisions by `(agent, capability, decision label)`,
    /// aggregates their feedback, and creates (or reinforces) a pattern once
    /// a group has enough samples. Pattern confidence is the observed
    /// success rate; the signature is a deterministic feature-hash of
    /// `capability + decision label`, which makes signatures comparable
    /// across structurally different agents.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn discover_patterns(&self) -> Result<Vec<Pattern>, StoreError> {
        let since = Utc::now() - self.config.lookback;
        let events = self.outcomes.query_events(&EventFilter {
            since: Some(since),
            ..EventFilter::default()
        })?;

        // (key, decision label) -> (positives, total)
        let mut groups: HashMap<(CapabilityKey, String), (usize, usize)> = HashMap::new();
        for event in events.iter().filter(|e| e.took_ml_path()) {
            let mut positives = 0;
            let mut total = 0;
            for feedback in self.outcomes.feedback_for(event.id)? {
                total += 1;
                if !feedback.signal.is_negative() {
                    positives += 1;
                }
            }
            if total == 0 {
                continue;
            }
            let entry = groups
                .entry((event.key(), event.chosen_result.decision.clone()))
                .or_insert((0, 0));
            entry.0 += positives;
            entry.1 += total;
        }

        let mut touched = Vec::new();
        for ((key, decision), (positives, total)) in groups {
            if total < self.config.min_samples {
                continue;
            }
            #[allow(clippy::cast_precision_loss)]
            let success_rate = positives as f32 / total as f32;

            let existing = self
                .patterns
                .patterns_for_agent(&key.agent)?
                .into_iter()
                .find(|p| {
                    p.is_active() && p.capability == key.capability && p.decision == decision
                });

            match existing {
                Some(mut pattern) => {
                    pattern.reinforce(success_rate, total as u64, success_rate);
                    self.patterns.update(pattern.clone())?;
                    touched.push(pattern);
                }
                None => {
                    let signature = signature_from_label(
                        &format!("{} {}", key.capability, decision),
                        self.config.signature_dim,
                    );
                    let pattern = Pattern::new(
                        key.agent.clone(),
                        key.capability.clone(),
                        decision,
                        signature,
                        success_rate,
                        total as u64,
                        success_rate,
                    )
                    .map_err(|err| StoreError::Backend(err.to_string()))?;
                    self.patterns.insert(pattern.clone())?;
                    touched.push(pattern);
                }
            }
        }
        Ok(touched)
    }

    /// Proposes transfers of high-confidence patterns to other agents that
    /// exercise the same capability.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn propose_transfers(&self) -> Result<Vec<TransferProposal>, StoreError> {
        let active = self.patterns.active_patterns()?;
        let mut agents: Vec<&AgentId> = active.iter().map(|p| &p.applies_to).collect();
        agents.sort_by_key(|a| a.as_str().to_string());
        agents.dedup();

        let mut proposals = Vec::new();
        for pattern in &active {
            if pattern.confidence < self.config.min_confidence {
                continue;
            }
            for &target in &agents {
                if *target == pattern.applies_to {
                    continue;
                }
                // Skip targets that already hold this rule.
                let already = active.iter().any(|p| {
                    p.applies_to == *target
                        && p.capability == pattern.capability
                        && p.decision == pattern.decision
                });
                if already {
                    continue;
                }
                // Only propose to agents that exercise the capability.
                let exercises = active
                    .iter()
                    .any(|p| p.applies_to == *target && p.capability == pattern.capability);
                if !exercises {
                    continue;
                }

                let reference = signature_from_label(
                    &format!("{} {}", pattern.capability, pattern.decision),
                    self.config.signature_dim,
                );
                let similarity = cosine_similarity(&pattern.signature, &reference);
                if similarity >= self.config.transfer_threshold {
                    proposals.push(TransferProposal {
                        pattern_id: pattern.id,
                        from_agent: pattern.applies_to.clone(),
                        to_agent: target.clone(),
                        similarity_score: similarity,
                    });
                }
            }
        }
        Ok(proposals)
    }

    /// Applies a transfer proposal, resolving conflicts against the target's
    /// incumbent patterns.
    ///
    /// A conflict is an active incumbent in the same feature region (same
    /// capability) with the opposite recommendation. Resolution is
    /// confidence-weighted: higher `confidence * usage_count` wins, the
    /// incumbent keeps ties, and a challenger must additionally clear the
    /// improvement margin in confidence. The loser is marked conflicted,
    /// linked with a `ConflictsWith` edge, and retained for audit.
    ///
    /// Returns `(applied, conflicts_resolved)`.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn apply_transfer(&self, proposal: &TransferProposal) -> Result<(bool, usize), StoreError> {
        let Some(source) = self.patterns.pattern(proposal.pattern_id)? else {
            return Ok((false, 0));
        };
        if !source.is_active() {
            return Ok((false, 0));
        }

        let incumbents: Vec<Pattern> = self
            .patterns
            .patterns_for_agent(&proposal.to_agent)?
            .into_iter()
            .filter(|p| {
                p.is_active() && p.capability == source.capability && p.decision != source.decision
            })
            .collect();

        let mut challenger = source.transferred_to(proposal.to_agent.clone());
        let mut resolved = 0;
        for mut incumbent in incumbents {
            let similarity = cosine_similarity(&challenger.signature, &incumbent.signature);
            let challenger_wins = challenger.weight() > incumbent.weight()
                && challenger.confidence >= incumbent.confidence + self.config.improvement_margin;

            if challenger_wins {
                incumbent.mark_conflicted(challenger.id);
                self.patterns.insert_relation(PatternRelation::new(
                    challenger.id,
                    incumbent.id,
                    RelationKind::ConflictsWith,
                    similarity,
                ))?;
                self.patterns.update(incumbent)?;
                resolved += 1;
            } else {
                challenger.mark_conflicted(incumbent.id);
                self.patterns.insert_relation(PatternRelation::new(
                    incumbent.id,
                    challenger.id,
                    RelationKind::ConflictsWith,
                    similarity,
                ))?;
                resolved += 1;
                // First winning incumbent settles it.
                break;
            }
        }

        let applied = challenger.is_active();
        self.patterns.insert(challenger)?;
        Ok((applied, resolved))
    }

    /// Spawns the interval loop. The returned worker stops the loop on drop.
    #[must_use]
    pub fn start(self: &Arc<Self>) -> PropagatorWorker {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let propagator = Arc::clone(self);
        let interval = propagator.config.interval;
        let join = thread::Builder::new()
            .name("shadowroute-propagator".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                    Err(RecvTimeoutError::Timeout) => {
                        // Failures are retried next tick; the request path
                        // does not depend on this job.
                        let _ = propagator.run_once();
                    }
                }
            })
            .expect("failed to spawn shadowroute propagator worker");

        PropagatorWorker {
            stop_tx,
            join: Mutex::new(Some(join)),
        }
    }
}

/// Handle for the background propagation loop.
pub struct PropagatorWorker {
    stop_tx: Sender<()>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl PropagatorWorker {
    /// Stops the loop and joins the worker thread.
    pub fn stop(&self) {
        let _ = self.stop_tx.try_send(());
        let handle = self.join.lock().ok().and_then(|mut guard| guard.take());
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl Drop for PropagatorWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Capability;
    use crate::event::tests::sample_event;
    use crate::event::{FeedbackSignal, FeedbackSource, OutcomeFeedback, PathTaken};
    use crate::store::{InMemoryOutcomeStore, InMemoryPatternStore};
    use crate::pattern::PatternStatus;

    fn propagator() -> (
        Arc<InMemoryOutcomeStore>,
        Arc<InMemoryPatternStore>,
        KnowledgePropagator,
    ) {
        let outcomes = Arc::new(InMemoryOutcomeStore::new());
        let patterns = Arc::new(InMemoryPatternStore::new());
        let propagator = KnowledgePropagator::new(
            Arc::clone(&outcomes) as Arc<dyn OutcomeStore>,
            Arc::clone(&patterns) as Arc<dyn PatternStore>,
            PropagatorConfig {
                min_samples: 5,
                ..PropagatorConfig::default()
            },
        );
        (outcomes, patterns, propagator)
    }

    fn mined_pattern(agent: &str, decision: &str, confidence: f32, usage: u64) -> Pattern {
        let capability = Capability::new("risk-score").unwrap();
        Pattern::new(
            AgentId::new(agent).unwrap(),
            capability.clone(),
            decision,
            signature_from_label(
                &format!("{capability} {decision}"),
                DEFAULT_SIGNATURE_DIM,
            ),
            confidence,
            usage,
            confidence,
        )
        .unwrap()
    }

    fn seed_outcomes(
        outcomes: &InMemoryOutcomeStore,
        n: usize,
        positive: usize,
    ) {
        for i in 0..n {
            let event = sample_event(PathTaken::Ml);
            let id = event.id;
            outcomes.append_event(event).unwrap();
            let signal = if i < positive {
                FeedbackSignal::Accepted
            } else {
                FeedbackSignal::Rejected
            };
            outcomes
                .append_feedback(OutcomeFeedback::new(
                    id,
                    signal,
                    Utc::now(),
                    FeedbackSource::Human,
                ))
                .unwrap();
        }
    }

    #[test]
    fn test_discovery_requires_min_samples() {
        let (outcomes, patterns, propagator) = propagator();
        seed_outcomes(&outcomes, 3, 3);
        assert!(propagator.discover_patterns().unwrap().is_empty());
        assert!(patterns.all_patterns().unwrap().is_empty());
    }

    #[test]
    fn test_discovery_mines_success_rate() {
        let (outcomes, patterns, propagator) = propagator();
        seed_outcomes(&outcomes, 10, 9);

        let mined = propagator.discover_patterns().unwrap();
        assert_eq!(mined.len(), 1);
        let pattern = &mined[0];
        assert!((pattern.success_rate - 0.9).abs() < 1e-5);
        assert!((pattern.confidence - 0.9).abs() < 1e-5);
        assert_eq!(pattern.usage_count, 10);
        // The sample events all chose "block" on the ML path.
        assert_eq!(pattern.decision, "block");
        assert_eq!(patterns.active_patterns().unwrap().len(), 1);
    }

    #[test]
    fn test_rediscovery_reinforces_instead_of_duplicating() {
        let (outcomes, patterns, propagator) = propagator();
        seed_outcomes(&outcomes, 10, 9);
        propagator.discover_patterns().unwrap();
        seed_outcomes(&outcomes, 10, 5);
        propagator.discover_patterns().unwrap();
        assert_eq!(patterns.all_patterns().unwrap().len(), 1);
    }

    #[test]
    fn test_transfer_proposed_between_agents_sharing_capability() {
        let (_, patterns, propagator) = propagator();
        patterns
            .insert(mined_pattern("code-review", "block", 0.9, 20))
            .unwrap();
        patterns
            .insert(mined_pattern("deploy-risk", "approve", 0.5, 5))
            .unwrap();

        let proposals = propagator.propose_transfers().unwrap();
        // The high-confidence "block" rule is proposed for deploy-risk; the
        // 0.5-confidence rule is below min_confidence and proposes nothing.
        assert_eq!(proposals.len(), 1);
        let proposal = &proposals[0];
        assert_eq!(proposal.from_agent.as_str(), "code-review");
        assert_eq!(proposal.to_agent.as_str(), "deploy-risk");
        assert!(proposal.similarity_score >= 0.8);
    }

    #[test]
    fn test_no_transfer_without_shared_capability() {
        let (_, patterns, propagator) = propagator();
        patterns
            .insert(mined_pattern("code-review", "block", 0.9, 20))
            .unwrap();
        let mut other = mined_pattern("docs", "approve", 0.9, 20);
        other.capability = Capability::new("summarize").unwrap();
        patterns.insert(other).unwrap();

        assert!(propagator.propose_transfers().unwrap().is_empty());
    }

    #[test]
    fn test_conflict_resolution_is_order_independent() {
        for stronger_first in [true, false] {
            let (_, patterns, propagator) = propagator();
            let strong = mined_pattern("code-review", "block", 0.9, 10);
            let weak = mined_pattern("deploy-risk", "approve", 0.6, 10);
            let (first, second) = if stronger_first {
                (strong.clone(), weak.clone())
            } else {
                (weak.clone(), strong.clone())
            };
            patterns.insert(first).unwrap();
            patterns.insert(second).unwrap();

            // Run until proposals settle (transfers can enable new ones).
            for _ in 0..3 {
                for proposal in propagator.propose_transfers().unwrap() {
                    propagator.apply_transfer(&proposal).unwrap();
                }
            }

            let all = patterns.all_patterns().unwrap();
            let active_block = all
                .iter()
                .filter(|p| p.is_active() && p.decision == "block")
                .count();
            // The 0.9 "block" rule survives everywhere it landed; every
            // "approve" copy that met it lost.
            assert!(active_block >= 1, "stronger_first={stronger_first}");
            let conflicted = all
                .iter()
                .filter(|p| matches!(p.status, PatternStatus::Conflicted { .. }))
                .count();
            assert!(conflicted >= 1, "stronger_first={stronger_first}");
            // The original weak incumbent on deploy-risk must have lost to
            // the transferred strong rule.
            let deploy_approve_active = all.iter().any(|p| {
                p.is_active()
                    && p.applies_to.as_str() == "deploy-risk"
                    && p.decision == "approve"
            });
            assert!(!deploy_approve_active, "stronger_first={stronger_first}");
        }
    }

    #[test]
    fn test_tie_keeps_incumbent() {
        let (_, patterns, propagator) = propagator();
        let incumbent = mined_pattern("deploy-risk", "approve", 0.8, 10);
        let challenger_source = mined_pattern("code-review", "block", 0.8, 10);
        let incumbent_id = incumbent.id;
        patterns.insert(incumbent).unwrap();
        patterns.insert(challenger_source.clone()).unwrap();

        let proposal = TransferProposal {
            pattern_id: challenger_source.id,
            from_agent: AgentId::new("code-review").unwrap(),
            to_agent: AgentId::new("deploy-risk").unwrap(),
            similarity_score: 1.0,
        };
        let (applied, resolved) = propagator.apply_transfer(&proposal).unwrap();
        assert!(!applied);
        assert_eq!(resolved, 1);

        let incumbent = patterns.pattern(incumbent_id).unwrap().unwrap();
        assert!(incumbent.is_active());
    }

    #[test]
    fn test_margin_blocks_narrow_improvement() {
        let (_, patterns, propagator) = propagator();
        // Challenger is better, but not by the +0.05 margin.
        let incumbent = mined_pattern("deploy-risk", "approve", 0.80, 10);
        let challenger_source = mined_pattern("code-review", "block", 0.83, 10);
        let incumbent_id = incumbent.id;
        patterns.insert(incumbent).unwrap();
        patterns.insert(challenger_source.clone()).unwrap();

        let proposal = TransferProposal {
            pattern_id: challenger_source.id,
            from_agent: AgentId::new("code-review").unwrap(),
            to_agent: AgentId::new("deploy-risk").unwrap(),
            similarity_score: 1.0,
        };
        let (applied, _) = propagator.apply_transfer(&proposal).unwrap();
        assert!(!applied);
        assert!(patterns.pattern(incumbent_id).unwrap().unwrap().is_active());
    }

    #[test]
    fn test_loser_retained_with_conflict_edge() {
        let (_, patterns, propagator) = propagator();
        let incumbent = mined_pattern("deploy-risk", "approve", 0.6, 10);
        let challenger_source = mined_pattern("code-review", "block", 0.9, 10);
        let incumbent_id = incumbent.id;
        patterns.insert(incumbent).unwrap();
        patterns.insert(challenger_source.clone()).unwrap();

        let proposal = TransferProposal {
            pattern_id: challenger_source.id,
            from_agent: AgentId::new("code-review").unwrap(),
            to_agent: AgentId::new("deploy-risk").unwrap(),
            similarity_score: 1.0,
        };
        let (applied, resolved) = propagator.apply_transfer(&proposal).unwrap();
        assert!(applied);
        assert_eq!(resolved, 1);

        let loser = patterns.pattern(incumbent_id).unwrap().unwrap();
        assert!(matches!(loser.status, PatternStatus::Conflicted { .. }));
        assert_eq!(patterns.relations_for(incumbent_id).unwrap().len(), 1);
    }

    #[test]
    fn test_decay_expires_below_floor() {
        let (_, patterns, propagator) = propagator();
        let mut pattern = mined_pattern("code-review", "block", 0.76, 10);
        pattern.last_reinforced_at = Utc::now() - chrono::Duration::days(5);
        let id = pattern.id;
        patterns.insert(pattern).unwrap();

        // 5 days at 0.02/day pulls 0.76 to 0.66, below the 0.75 floor.
        let expired = propagator.decay_cycle(Utc::now()).unwrap();
        assert_eq!(expired, 1);
        let stored = patterns.pattern(id).unwrap().unwrap();
        assert_eq!(stored.status, PatternStatus::Expired);
        assert!(patterns.active_patterns().unwrap().is_empty());
    }

    #[test]
    fn test_lease_skips_concurrent_cycle() {
        let (_, _, propagator) = propagator();
        propagator.lease.store(true, Ordering::Release);
        assert_eq!(propagator.run_once().unwrap(), CycleOutcome::Skipped);
        propagator.lease.store(false, Ordering::Release);
        assert!(matches!(
            propagator.run_once().unwrap(),
            CycleOutcome::Ran(_)
        ));
    }

    #[test]
    fn test_worker_start_and_stop() {
        let (outcomes, patterns, _) = propagator();
        let propagator = Arc::new(KnowledgePropagator::new(
            outcomes as Arc<dyn OutcomeStore>,
            patterns as Arc<dyn PatternStore>,
            PropagatorConfig {
                interval: Duration::from_millis(10),
                ..PropagatorConfig::default()
            },
        ));
        let worker = propagator.start();
        std::thread::sleep(Duration::from_millis(50));
        worker.stop();
    }
}
