//! The decision router: the synchronous request path.
//!
//! `route` always computes the deterministic result first; that is the
//! fallback of record. The ML path is attempted only when the request's
//! stable bucket falls inside the rollout percentage and the circuit breaker
//! allows it, and it runs on a separate bounded worker pool under a hard
//! deadline. ML failures of any kind fall back to the deterministic result
//! and are visible only as metrics and breaker signals, never to the caller.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Utc;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::breaker::CircuitBreaker;
use crate::context::RequestContext;
use crate::error::{MlError, RouteError};
use crate::evaluator::{CancelToken, CapabilityRegistry, MlEvaluator};
use crate::event::{Assessment, DecisionEvent, DecisionId, PathTaken};
use crate::metrics::RouterMetrics;
use crate::rollout::RolloutController;
use crate::shadow::ShadowRecorder;

/// Router tuning.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Hard deadline for the ML branch.
    pub ml_timeout: Duration,

    /// Max serialized context payload size in bytes.
    pub max_context_bytes: usize,

    /// ML dispatch worker threads.
    pub ml_workers: usize,

    /// Max queued ML jobs before local shedding applies.
    pub ml_queue_capacity: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            ml_timeout: Duration::from_millis(150),
            max_context_bytes: 64 * 1024,
            ml_workers: 2,
            ml_queue_capacity: 256,
        }
    }
}

/// What the router hands back to the caller.
#[derive(Debug, Clone)]
pub struct RouteResponse {
    /// The authoritative result.
    pub chosen: Assessment,

    /// The full decision record (also enqueued to the shadow recorder).
    pub event: DecisionEvent,
}

struct MlJob {
    evaluator: Arc<dyn MlEvaluator>,
    ctx: RequestContext,
    deadline: Duration,
    cancel: CancelToken,
    reply: Sender<Result<Assessment, MlError>>,
}

/// Bounded worker pool isolating ML calls from the caller's thread.
struct MlDispatch {
    tx: Sender<MlJob>,
    workers: Vec<JoinHandle<()>>,
}

impl MlDispatch {
    fn start(workers: usize, queue_capacity: usize) -> Self {
        let workers = workers.max(1);
        let (tx, rx) = bounded::<MlJob>(queue_capacity.max(1));

        let mut handles = Vec::with_capacity(workers);
        for idx in 0..workers {
            let rx: Receiver<MlJob> = rx.clone();
            let name = format!("shadowroute-ml-{idx}");
            let handle = thread::Builder::new()
                .name(name)
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        if job.cancel.is_cancelled() {
                            continue;
                        }
                        let result = job.evaluator.predict(&job.ctx, job.deadline, &job.cancel);
                        // The router may have timed out and gone away.
                        let _ = job.reply.send(result);
                    }
                })
                .expect("failed to spawn shadowroute ml worker");
            handles.push(handle);
        }

        Self {
            tx,
            workers: handles,
        }
    }

    fn try_submit(&self, job: MlJob) -> Result<(), TrySendError<MlJob>> {
        self.tx.try_send(job)
    }

    fn shutdown(&mut self) {
        let (closed_tx, _) = bounded::<MlJob>(1);
        drop(std::mem::replace(&mut self.tx, closed_tx));
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for MlDispatch {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Routes requests between the deterministic and ML evaluation paths.
pub struct DecisionRouter {
    registry: Arc<CapabilityRegistry>,
    rollout: Arc<RolloutController>,
    breaker: Arc<CircuitBreaker>,
    shadow: Arc<ShadowRecorder>,
    metrics: Arc<RouterMetrics>,
    dispatch: MlDispatch,
    config: RouterConfig,
}

impl DecisionRouter {
    /// Creates a router over its collaborators.
    #[must_use]
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        rollout: Arc<RolloutController>,
        breaker: Arc<CircuitBreaker>,
        shadow: Arc<ShadowRecorder>,
        metrics: Arc<RouterMetrics>,
        config: RouterConfig,
    ) -> Self {
        let dispatch = MlDispatch::start(config.ml_workers, config.ml_queue_capacity);
        Self {
            registry,
            rollout,
            breaker,
            shadow,
            metrics,
            dispatch,
            config,
        }
    }

    /// Routes one request.
    ///
    /// # Errors
    ///
    /// - `UnknownCapability` if `(agent, capability)` is not registered
    /// - `ContextTooLarge` if the payload exceeds the configured limit
    /// - `Deterministic` if the deterministic evaluator fails (fatal; no
    ///   further fallback exists)
    pub fn route(&self, ctx: &RequestContext) -> Result<RouteResponse, RouteError> {
        let started = Instant::now();
        let key = ctx.key();

        let entry = self
            .registry
            .lookup(&key)
            .ok_or_else(|| RouteError::UnknownCapability {
                agent: ctx.agent.clone(),
                capability: ctx.capability.clone(),
            })?;

        let size = ctx.payload_size();
        if size > self.config.max_context_bytes {
            return Err(RouteError::ContextTooLarge {
                size,
                max: self.config.max_context_bytes,
            });
        }

        // Step 1: the fallback of record, always computed.
        let deterministic = entry.deterministic.evaluate(ctx)?;

        // Step 2: stable bucketing against the current rollout percentage.
        let fingerprint = ctx.fingerprint();
        let percentage = self.rollout.percentage(&key);
        let eligible = fingerprint.bucket() < percentage;

        // Steps 3-5: the ML branch, gated by the circuit breaker.
        let mut ml_result = None;
        let mut path = PathTaken::Deterministic;
        if let Some(evaluator) = entry.ml.clone().filter(|_| eligible) {
            if self.breaker.allow_attempt(&key) {
                RouterMetrics::bump(&self.metrics.ml_attempts);
                match self.attempt_ml(evaluator, ctx) {
                    Ok(assessment) => {
                        RouterMetrics::bump(&self.metrics.ml_successes);
                        let _ = self.breaker.record_outcome(&key, true);
                        ml_result = Some(assessment);
                        path = PathTaken::Ml;
                    }
                    Err(MlError::Timeout { .. }) => {
                        RouterMetrics::bump(&self.metrics.ml_timeouts);
                        let _ = self.breaker.record_outcome(&key, false);
                    }
                    Err(MlError::Saturated) => {
                        // Local shedding, not an ML quality signal: the
                        // breaker is not charged, but a half-open probe slot
                        // this attempt claimed must be returned.
                        RouterMetrics::bump(&self.metrics.ml_saturated);
                        let _ = self.breaker.release_probe(&key);
                    }
                    Err(_) => {
                        RouterMetrics::bump(&self.metrics.ml_errors);
                        let _ = self.breaker.record_outcome(&key, false);
                    }
                }
            } else {
                RouterMetrics::bump(&self.metrics.ml_rejected_by_breaker);
            }
        }

        let chosen = match (&path, &ml_result) {
            (PathTaken::Ml, Some(ml)) => ml.clone(),
            _ => deterministic.clone(),
        };

        let event = DecisionEvent {
            id: DecisionId::new(),
            agent: ctx.agent.clone(),
            capability: ctx.capability.clone(),
            context_fingerprint: fingerprint,
            context_payload: ctx.payload.clone(),
            path_taken: path,
            deterministic_result: deterministic,
            ml_result,
            chosen_result: chosen.clone(),
            latency_ms: started.elapsed().as_millis().min(u128::from(u64::MAX)) as u64,
            created_at: Utc::now(),
        };

        // Strictly observational: a full queue drops the event, never the
        // request.
        self.shadow.enqueue(event.clone());

        Ok(RouteResponse { chosen, event })
    }

    /// Runs the ML evaluator on the dispatch pool under the deadline.
    fn attempt_ml(
        &self,
        evaluator: Arc<dyn MlEvaluator>,
        ctx: &RequestContext,
    ) -> Result<Assessment, MlError> {
        let deadline = self.config.ml_timeout;
        let cancel = CancelToken::new();
        let (reply_tx, reply_rx) = bounded::<Result<Assessment, MlError>>(1);

        let job = MlJob {
            evaluator,
            ctx: ctx.clone(),
            deadline,
            cancel: cancel.clone(),
            reply: reply_tx,
        };
        if self.dispatch.try_submit(job).is_err() {
            return Err(MlError::Saturated);
        }

        match reply_rx.recv_timeout(deadline) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                // Cancel, do not merely ignore: the worker must not keep
                // burning on an abandoned call.
                cancel.cancel();
                Err(MlError::Timeout {
                    budget_ms: deadline.as_millis().min(u128::from(u64::MAX)) as u64,
                })
            }
            Err(RecvTimeoutError::Disconnected) => Err(MlError::Disconnected),
        }
    }

    /// The shared metrics handle.
    #[must_use]
    pub fn metrics(&self) -> &RouterMetrics {
        &self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{BreakerConfig, CircuitState};
    use crate::context::{AgentId, Capability, CapabilityKey};
    use crate::error::EvalError;
    use crate::evaluator::DeterministicEvaluator;
    use crate::rollout::{PolicyActor, RolloutConfig};
    use crate::shadow::ShadowConfig;
    use crate::store::{InMemoryOutcomeStore, InMemoryPolicyStore, OutcomeStore, PolicyStore};
    use serde_json::json;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct OkEvaluator;

    impl DeterministicEvaluator for OkEvaluator {
        fn evaluate(&self, _ctx: &RequestContext) -> Result<Assessment, EvalError> {
            Ok(Assessment::new("approve", 0.4))
        }
    }

    struct FailingEvaluator;

    impl DeterministicEvaluator for FailingEvaluator {
        fn evaluate(&self, _ctx: &RequestContext) -> Result<Assessment, EvalError> {
            Err(EvalError::new("rule engine unavailable"))
        }
    }

    #[derive(Default)]
    struct CountingMl {
        calls: AtomicU64,
        fail: bool,
        sleep: Option<Duration>,
    }

    impl MlEvaluator for CountingMl {
        fn predict(
            &self,
            _ctx: &RequestContext,
            _deadline: Duration,
            cancel: &CancelToken,
        ) -> Result<Assessment, MlError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(sleep) = self.sleep {
                let step = Duration::from_millis(5);
                let mut slept = Duration::ZERO;
                while slept < sleep {
                    if cancel.is_cancelled() {
                        return Err(MlError::evaluation("cancelled"));
                    }
                    thread::sleep(step);
                    slept += step;
                }
            }
            if self.fail {
                return Err(MlError::evaluation("model failure"));
            }
            Ok(Assessment::new("block", 0.95))
        }
    }

    struct Fixture {
        router: DecisionRouter,
        rollout: Arc<RolloutController>,
        breaker: Arc<CircuitBreaker>,
        outcomes: Arc<InMemoryOutcomeStore>,
        key: CapabilityKey,
    }

    fn fixture(ml: Option<Arc<CountingMl>>, timeout_ms: u64) -> Fixture {
        let policy_store: Arc<dyn PolicyStore> = Arc::new(InMemoryPolicyStore::new());
        let outcomes = Arc::new(InMemoryOutcomeStore::new());
        let metrics = Arc::new(RouterMetrics::new());

        let registry = Arc::new(CapabilityRegistry::new());
        let key = CapabilityKey::new(
            AgentId::new("code-review").unwrap(),
            Capability::new("risk-score").unwrap(),
        );
        registry.register(
            key.clone(),
            Arc::new(OkEvaluator),
            ml.map(|m| m as Arc<dyn MlEvaluator>),
        );

        let rollout = Arc::new(RolloutController::new(
            Arc::clone(&policy_store),
            RolloutConfig {
                cache_ttl: Duration::from_millis(0),
                ..RolloutConfig::default()
            },
        ));
        let breaker = Arc::new(CircuitBreaker::new(
            Arc::clone(&policy_store),
            BreakerConfig::default(),
        ));
        let shadow = Arc::new(ShadowRecorder::start(
            ShadowConfig {
                queue_capacity: 4096,
                batch_size: 64,
                flush_interval: Duration::from_millis(10),
            },
            Arc::clone(&outcomes) as Arc<dyn OutcomeStore>,
            Arc::clone(&metrics),
        ));

        let router = DecisionRouter::new(
            registry,
            Arc::clone(&rollout),
            Arc::clone(&breaker),
            shadow,
            metrics,
            RouterConfig {
                ml_timeout: Duration::from_millis(timeout_ms),
                ..RouterConfig::default()
            },
        );

        Fixture {
            router,
            rollout,
            breaker,
            outcomes,
            key,
        }
    }

    fn ctx(i: u64) -> RequestContext {
        RequestContext::new(
            AgentId::new("code-review").unwrap(),
            Capability::new("risk-score").unwrap(),
            json!({ "request": i }),
        )
    }

    #[test]
    fn test_unknown_capability() {
        let f = fixture(None, 150);
        let unknown = RequestContext::new(
            AgentId::new("nobody").unwrap(),
            Capability::new("nothing").unwrap(),
            json!({}),
        );
        assert!(matches!(
            f.router.route(&unknown).unwrap_err(),
            RouteError::UnknownCapability { .. }
        ));
    }

    #[test]
    fn test_context_too_large() {
        let f = fixture(None, 150);
        let big = RequestContext::new(
            AgentId::new("code-review").unwrap(),
            Capability::new("risk-score").unwrap(),
            json!({ "blob": "x".repeat(70 * 1024) }),
        );
        assert!(matches!(
            f.router.route(&big).unwrap_err(),
            RouteError::ContextTooLarge { .. }
        ));
    }

    #[test]
    fn test_deterministic_failure_is_fatal() {
        let f = fixture(None, 150);
        let registry = Arc::new(CapabilityRegistry::new());
        registry.register(f.key.clone(), Arc::new(FailingEvaluator), None);
        let router = DecisionRouter::new(
            registry,
            f.rollout,
            f.breaker,
            Arc::new(ShadowRecorder::start(
                ShadowConfig::default(),
                f.outcomes as Arc<dyn OutcomeStore>,
                Arc::new(RouterMetrics::new()),
            )),
            Arc::new(RouterMetrics::new()),
            RouterConfig::default(),
        );
        assert!(matches!(
            router.route(&ctx(1)).unwrap_err(),
            RouteError::Deterministic(_)
        ));
    }

    #[test]
    fn test_zero_percent_never_calls_ml() {
        let ml = Arc::new(CountingMl::default());
        let f = fixture(Some(Arc::clone(&ml)), 150);
        for i in 0..50 {
            let response = f.router.route(&ctx(i)).unwrap();
            assert_eq!(response.event.path_taken, PathTaken::Deterministic);
        }
        assert_eq!(ml.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_full_rollout_uses_ml() {
        let ml = Arc::new(CountingMl::default());
        let f = fixture(Some(Arc::clone(&ml)), 500);
        f.rollout
            .force_rollback(&f.key, PolicyActor::Manual)
            .unwrap();
        // Walk the ladder to 100.
        for pct in [5, 25, 50, 100] {
            f.rollout
                .set_percentage(&f.key, pct, PolicyActor::Manual)
                .unwrap();
        }

        let response = f.router.route(&ctx(7)).unwrap();
        assert_eq!(response.event.path_taken, PathTaken::Ml);
        assert_eq!(response.chosen.decision, "block");
        assert_eq!(
            response.event.ml_result.as_ref().unwrap().decision,
            "block"
        );
        assert!(ml.calls.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn test_ml_error_falls_back_and_charges_breaker() {
        let ml = Arc::new(CountingMl {
            fail: true,
            ..CountingMl::default()
        });
        let f = fixture(Some(Arc::clone(&ml)), 500);
        for pct in [5, 25, 50, 100] {
            f.rollout
                .set_percentage(&f.key, pct, PolicyActor::Manual)
                .unwrap();
        }

        let response = f.router.route(&ctx(1)).unwrap();
        assert_eq!(response.event.path_taken, PathTaken::Deterministic);
        assert_eq!(response.chosen.decision, "approve");
        assert!(response.event.ml_result.is_none());

        let record = f.breaker.record(&f.key).unwrap().unwrap();
        assert_eq!(record.consecutive_failures, 1);
        assert_eq!(f.router.metrics().snapshot().ml_errors, 1);
    }

    #[test]
    fn test_ml_timeout_is_cancelled_and_falls_back() {
        let ml = Arc::new(CountingMl {
            sleep: Some(Duration::from_millis(500)),
            ..CountingMl::default()
        });
        let f = fixture(Some(Arc::clone(&ml)), 40);
        for pct in [5, 25, 50, 100] {
            f.rollout
                .set_percentage(&f.key, pct, PolicyActor::Manual)
                .unwrap();
        }

        let started = Instant::now();
        let response = f.router.route(&ctx(1)).unwrap();
        assert!(started.elapsed() < Duration::from_millis(300));
        assert_eq!(response.event.path_taken, PathTaken::Deterministic);
        assert_eq!(f.router.metrics().snapshot().ml_timeouts, 1);

        let record = f.breaker.record(&f.key).unwrap().unwrap();
        assert_eq!(record.consecutive_failures, 1);
    }

    #[test]
    fn test_breaker_open_skips_ml_locally() {
        let ml = Arc::new(CountingMl {
            fail: true,
            ..CountingMl::default()
        });
        let f = fixture(Some(Arc::clone(&ml)), 500);
        for pct in [5, 25, 50, 100] {
            f.rollout
                .set_percentage(&f.key, pct, PolicyActor::Manual)
                .unwrap();
        }

        // 5 failures trip the breaker; the 6th attempt must be rejected
        // before reaching the evaluator.
        for i in 0..6 {
            f.router.route(&ctx(i)).unwrap();
        }
        assert_eq!(ml.calls.load(Ordering::SeqCst), 5);
        assert_eq!(f.breaker.state(&f.key).unwrap(), CircuitState::Open);
        assert_eq!(f.router.metrics().snapshot().ml_rejected_by_breaker, 1);
    }

    /// Holds the worker for the full duration, ignoring cancellation.
    struct StallingMl {
        hold: Duration,
    }

    impl MlEvaluator for StallingMl {
        fn predict(
            &self,
            _ctx: &RequestContext,
            _deadline: Duration,
            _cancel: &CancelToken,
        ) -> Result<Assessment, MlError> {
            thread::sleep(self.hold);
            Ok(Assessment::new("block", 0.95))
        }
    }

    #[test]
    fn test_saturated_shedding_returns_half_open_probe_slot() {
        let policy_store: Arc<dyn PolicyStore> = Arc::new(InMemoryPolicyStore::new());
        let outcomes = Arc::new(InMemoryOutcomeStore::new());
        let metrics = Arc::new(RouterMetrics::new());

        // Two capabilities share one single-worker, single-slot dispatch
        // pool: a stalling model on the first can starve the second.
        let stalled_key = CapabilityKey::new(
            AgentId::new("code-review").unwrap(),
            Capability::new("risk-score").unwrap(),
        );
        let probed_key = CapabilityKey::new(
            AgentId::new("deploy").unwrap(),
            Capability::new("risk-score").unwrap(),
        );
        let healthy_ml = Arc::new(CountingMl::default());
        let registry = Arc::new(CapabilityRegistry::new());
        registry.register(
            stalled_key.clone(),
            Arc::new(OkEvaluator),
            Some(Arc::new(StallingMl {
                hold: Duration::from_millis(400),
            })),
        );
        registry.register(
            probed_key.clone(),
            Arc::new(OkEvaluator),
            Some(Arc::clone(&healthy_ml) as Arc<dyn MlEvaluator>),
        );

        let rollout = Arc::new(RolloutController::new(
            Arc::clone(&policy_store),
            RolloutConfig {
                cache_ttl: Duration::from_millis(0),
                ..RolloutConfig::default()
            },
        ));
        for key in [&stalled_key, &probed_key] {
            for pct in [5, 25, 50, 100] {
                rollout.set_percentage(key, pct, PolicyActor::Manual).unwrap();
            }
        }

        let breaker = Arc::new(CircuitBreaker::new(
            Arc::clone(&policy_store),
            BreakerConfig {
                failure_threshold: 2,
                cooldown: Duration::from_millis(40),
                cas_retries: 8,
            },
        ));
        let shadow = Arc::new(ShadowRecorder::start(
            ShadowConfig::default(),
            Arc::clone(&outcomes) as Arc<dyn OutcomeStore>,
            Arc::clone(&metrics),
        ));
        let router = DecisionRouter::new(
            registry,
            rollout,
            Arc::clone(&breaker),
            shadow,
            metrics,
            RouterConfig {
                ml_timeout: Duration::from_millis(30),
                ml_workers: 1,
                ml_queue_capacity: 1,
                ..RouterConfig::default()
            },
        );

        // Trip the probed key's breaker, then let its cooldown pass.
        for _ in 0..2 {
            breaker.record_outcome(&probed_key, false).unwrap();
        }
        std::thread::sleep(Duration::from_millis(60));

        // Two stalled requests: one occupies the worker past its timeout,
        // the next fills the only queue slot.
        for i in 0..2 {
            let ctx = RequestContext::new(
                stalled_key.agent.clone(),
                stalled_key.capability.clone(),
                json!({ "request": i }),
            );
            let response = router.route(&ctx).unwrap();
            assert_eq!(response.event.path_taken, PathTaken::Deterministic);
        }

        // The half-open probe is granted, then shed at the full queue. The
        // slot must come back: no phantom probe left in flight.
        let probe_ctx = RequestContext::new(
            probed_key.agent.clone(),
            probed_key.capability.clone(),
            json!({ "request": "probe" }),
        );
        let response = router.route(&probe_ctx).unwrap();
        assert_eq!(response.event.path_taken, PathTaken::Deterministic);
        assert_eq!(router.metrics().snapshot().ml_saturated, 1);
        assert_eq!(healthy_ml.calls.load(Ordering::SeqCst), 0);

        let record = breaker.record(&probed_key).unwrap().unwrap();
        assert_eq!(record.state, CircuitState::HalfOpen);
        assert!(!record.probe_in_flight);

        // Once the pool drains, the next probe runs and recovery completes.
        std::thread::sleep(Duration::from_millis(600));
        let response = router.route(&probe_ctx).unwrap();
        assert_eq!(response.event.path_taken, PathTaken::Ml);
        assert_eq!(healthy_ml.calls.load(Ordering::SeqCst), 1);
        assert_eq!(breaker.state(&probed_key).unwrap(), CircuitState::Closed);
    }

    #[test]
    fn test_events_are_shadow_recorded() {
        let f = fixture(None, 150);
        for i in 0..10 {
            f.router.route(&ctx(i)).unwrap();
        }
        // Give the drain worker a moment.
        thread::sleep(Duration::from_millis(100));
        assert_eq!(f.outcomes.event_count().unwrap(), 10);
    }
}
