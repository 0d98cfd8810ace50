//! Model selection under cost/latency policy, with budgeted, retried invocation.

pub mod backend;
pub mod budget;

pub use backend::{
    build_backends, Completion, CompletionBackend, CompletionError, CompletionParams, EchoBackend,
};
pub use budget::{Budget, BudgetSnapshot, Reservation};

use backoff::{backoff::Backoff, ExponentialBackoff};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::{OrchestratorError, Result};
use crate::settings::SelectorConfig;
use crate::task::TaskType;

/// Per-call constraints. Cost is hard, latency is soft.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionPolicy {
    pub max_cost_per_call: f64,
    pub max_latency_ms: u64,
    #[serde(default)]
    pub prefer_local: bool,
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        Self {
            max_cost_per_call: 0.05,
            max_latency_ms: 10_000,
            prefer_local: false,
        }
    }
}

/// Static description of a backend from configuration.
#[derive(Debug, Clone)]
pub struct BackendProfile {
    pub id: String,
    pub cost_per_call: f64,
    pub latency_ms: u64,
    pub local: bool,
}

#[derive(Debug, Default, Clone)]
struct Observed {
    successes: u64,
    failures: u64,
    avg_latency_ms: f64,
    avg_cost: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackendStats {
    pub id: String,
    pub successes: u64,
    pub failures: u64,
    pub avg_latency_ms: f64,
    pub avg_cost: f64,
    pub estimated_cost: f64,
    pub estimated_latency_ms: f64,
}

/// A backend that satisfies the cost ceiling, in the order it would be tried.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub backend: String,
    pub estimated_cost: f64,
    pub estimated_latency_ms: f64,
    pub local: bool,
    pub meets_latency: bool,
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl RetryConfig {
    fn backoff(&self) -> ExponentialBackoff {
        let mut b = ExponentialBackoff {
            initial_interval: self.initial_backoff,
            max_interval: self.max_backoff,
            multiplier: self.multiplier,
            max_elapsed_time: None,
            randomization_factor: 0.1,
            ..Default::default()
        };
        b.reset();
        b
    }
}

#[derive(Debug, Clone)]
pub struct Invocation {
    pub text: String,
    pub backend: String,
    pub cost: f64,
    pub attempts: usize,
    pub latency: Duration,
}

pub struct ModelSelector {
    profiles: HashMap<String, BackendProfile>,
    routes: HashMap<TaskType, Vec<String>>,
    backends: HashMap<String, Arc<dyn CompletionBackend>>,
    observed: DashMap<String, Observed>,
    budget: Arc<Budget>,
    retry: RetryConfig,
    call_timeout: Duration,
}

impl ModelSelector {
    pub fn new(
        config: &SelectorConfig,
        backends: HashMap<String, Arc<dyn CompletionBackend>>,
        budget: Arc<Budget>,
    ) -> Result<Self> {
        let profiles: HashMap<String, BackendProfile> = config
            .backends
            .iter()
            .map(|b| {
                (
                    b.id.clone(),
                    BackendProfile {
                        id: b.id.clone(),
                        cost_per_call: b.cost_per_call,
                        latency_ms: b.latency_ms,
                        local: b.local,
                    },
                )
            })
            .collect();

        let mut routes = HashMap::new();
        for (task_type, ranked) in &config.routes {
            for id in ranked {
                if !profiles.contains_key(id) {
                    return Err(OrchestratorError::Config(format!(
                        "route '{}' references unknown backend '{}'",
                        task_type, id
                    )));
                }
                if !backends.contains_key(id) {
                    return Err(OrchestratorError::Config(format!(
                        "backend '{}' has no completion implementation",
                        id
                    )));
                }
            }
            routes.insert(TaskType::from(task_type.as_str()), ranked.clone());
        }

        Ok(Self {
            profiles,
            routes,
            backends,
            observed: DashMap::new(),
            budget,
            retry: RetryConfig {
                max_attempts: config.max_attempts.max(1),
                initial_backoff: Duration::from_millis(config.initial_backoff_ms),
                max_backoff: Duration::from_millis(config.max_backoff_ms),
                multiplier: config.backoff_multiplier,
            },
            call_timeout: Duration::from_millis(config.call_timeout_ms),
        })
    }

    pub fn budget(&self) -> &Arc<Budget> {
        &self.budget
    }

    fn ranked(&self, task_type: &TaskType) -> Option<&Vec<String>> {
        self.routes
            .get(task_type)
            .or_else(|| self.routes.get(&TaskType::General))
    }

    fn estimate(&self, profile: &BackendProfile) -> (f64, f64) {
        match self.observed.get(&profile.id) {
            Some(o) if o.successes > 0 => (o.avg_cost, o.avg_latency_ms),
            _ => (profile.cost_per_call, profile.latency_ms as f64),
        }
    }

    /// Backends affordable under `policy`, ordered cheapest-first among those meeting
    /// the latency bound, then cheapest-first among those violating it.
    pub fn candidates(&self, task_type: &TaskType, policy: &SelectionPolicy) -> Result<Vec<Candidate>> {
        let ranked = self.ranked(task_type).ok_or_else(|| {
            OrchestratorError::Config(format!("no backend route for task type '{}'", task_type))
        })?;

        let mut all = Vec::with_capacity(ranked.len());
        for id in ranked {
            let Some(profile) = self.profiles.get(id) else {
                continue;
            };
            let (cost, latency) = self.estimate(profile);
            all.push(Candidate {
                backend: id.clone(),
                estimated_cost: cost,
                estimated_latency_ms: latency,
                local: profile.local,
                meets_latency: latency <= policy.max_latency_ms as f64,
            });
        }

        let cheapest = all
            .iter()
            .map(|c| c.estimated_cost)
            .fold(f64::INFINITY, f64::min);

        let mut affordable: Vec<Candidate> = all
            .into_iter()
            .filter(|c| c.estimated_cost <= policy.max_cost_per_call)
            .collect();

        if affordable.is_empty() {
            return Err(OrchestratorError::budget(format!(
                "cheapest backend for '{}' costs {:.4}, above max_cost_per_call {:.4}",
                task_type, cheapest, policy.max_cost_per_call
            )));
        }

        // stable: equal keys keep the configured rank
        affordable.sort_by(|a, b| {
            b.meets_latency
                .cmp(&a.meets_latency)
                .then_with(|| {
                    if policy.prefer_local && a.meets_latency {
                        b.local.cmp(&a.local)
                    } else {
                        Ordering::Equal
                    }
                })
                .then_with(|| {
                    a.estimated_cost
                        .partial_cmp(&b.estimated_cost)
                        .unwrap_or(Ordering::Equal)
                })
        });

        Ok(affordable)
    }

    /// Pick the backend a call for `task_type` would start with.
    pub fn select(&self, task_type: &TaskType, policy: &SelectionPolicy) -> Result<String> {
        let candidates = self.candidates(task_type, policy)?;
        let chosen = &candidates[0];
        if !chosen.meets_latency {
            debug!(
                "No backend for '{}' meets {}ms; using '{}' at {:.0}ms",
                task_type, policy.max_latency_ms, chosen.backend, chosen.estimated_latency_ms
            );
        }
        Ok(chosen.backend.clone())
    }

    /// Mean expected cost of a call for `task_type`, used to break routing ties.
    pub fn average_cost(&self, task_type: &TaskType) -> Option<f64> {
        let ranked = self.ranked(task_type)?;
        let costs: Vec<f64> = ranked
            .iter()
            .filter_map(|id| self.profiles.get(id))
            .map(|p| self.estimate(p).0)
            .collect();
        if costs.is_empty() {
            None
        } else {
            Some(costs.iter().sum::<f64>() / costs.len() as f64)
        }
    }

    /// Run a completion against the ranked candidates, moving to the next backend
    /// after each failure.
    #[instrument(skip(self, task_type, prompt, params, cancel), fields(task_type = %task_type))]
    pub async fn invoke(
        &self,
        task_type: &TaskType,
        policy: &SelectionPolicy,
        prompt: &str,
        params: &CompletionParams,
        cancel: &CancellationToken,
    ) -> Result<Invocation> {
        let candidates = self.candidates(task_type, policy)?;
        let mut backoff = self.retry.backoff();
        let mut last_failure: Option<(String, CompletionError)> = None;
        let attempts = candidates.len().min(self.retry.max_attempts);

        for (attempt, candidate) in candidates.iter().take(attempts).enumerate() {
            if attempt > 0 {
                let delay = backoff.next_backoff().unwrap_or(self.retry.max_backoff);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(OrchestratorError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let backend = self.backends.get(&candidate.backend).ok_or_else(|| {
                OrchestratorError::Internal(format!("backend '{}' vanished", candidate.backend))
            })?;

            let reservation = self.budget.reserve(candidate.estimated_cost)?;
            let timeout = params.timeout.min(self.call_timeout);
            let started = Instant::now();

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.budget.refund(reservation);
                    info!("Backend call to '{}' aborted by cancellation", candidate.backend);
                    return Err(OrchestratorError::Cancelled);
                }
                r = tokio::time::timeout(timeout, backend.complete(prompt, params)) => r,
            };
            let elapsed = started.elapsed();

            let failure = match outcome {
                Ok(Ok(completion)) => {
                    let cost = completion.cost.unwrap_or(candidate.estimated_cost);
                    self.budget.settle(reservation, cost);
                    self.record_success(&candidate.backend, elapsed, cost);
                    debug!(
                        "Backend '{}' answered in {:?} (attempt {})",
                        candidate.backend,
                        elapsed,
                        attempt + 1
                    );
                    return Ok(Invocation {
                        text: completion.text,
                        backend: candidate.backend.clone(),
                        cost,
                        attempts: attempt + 1,
                        latency: elapsed,
                    });
                }
                Ok(Err(e)) => e,
                Err(_) => CompletionError::Timeout,
            };

            self.budget.refund(reservation);
            self.record_failure(&candidate.backend);
            warn!(
                "Backend '{}' failed on attempt {}/{}: {}",
                candidate.backend,
                attempt + 1,
                attempts,
                failure
            );
            last_failure = Some((candidate.backend.clone(), failure));
        }

        let (backend, error) = last_failure.ok_or_else(|| {
            OrchestratorError::Internal("no backend attempt was made".to_string())
        })?;
        Err(OrchestratorError::provider(
            backend,
            format!("all {} attempts failed; last error: {}", attempts, error),
        ))
    }

    fn record_success(&self, id: &str, latency: Duration, cost: f64) {
        let mut o = self.observed.entry(id.to_string()).or_default();
        o.successes += 1;
        let n = o.successes as f64;
        o.avg_latency_ms += (latency.as_secs_f64() * 1_000.0 - o.avg_latency_ms) / n;
        o.avg_cost += (cost - o.avg_cost) / n;
    }

    fn record_failure(&self, id: &str) {
        self.observed.entry(id.to_string()).or_default().failures += 1;
    }

    pub fn stats(&self) -> Vec<BackendStats> {
        let mut stats: Vec<BackendStats> = self
            .profiles
            .values()
            .map(|p| {
                let o = self.observed.get(&p.id).map(|o| o.clone()).unwrap_or_default();
                let (estimated_cost, estimated_latency_ms) = self.estimate(p);
                BackendStats {
                    id: p.id.clone(),
                    successes: o.successes,
                    failures: o.failures,
                    avg_latency_ms: o.avg_latency_ms,
                    avg_cost: o.avg_cost,
                    estimated_cost,
                    estimated_latency_ms,
                }
            })
            .collect();
        stats.sort_by(|a, b| a.id.cmp(&b.id));
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::BackendConfig;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    struct ScriptedBackend {
        id: String,
        fail_with: Option<CompletionError>,
        calls: AtomicUsize,
    }

    impl ScriptedBackend {
        fn ok(id: &str) -> Arc<Self> {
            Arc::new(Self { id: id.to_string(), fail_with: None, calls: AtomicUsize::new(0) })
        }

        fn failing(id: &str, e: CompletionError) -> Arc<Self> {
            Arc::new(Self { id: id.to_string(), fail_with: Some(e), calls: AtomicUsize::new(0) })
        }
    }

    #[async_trait]
    impl CompletionBackend for ScriptedBackend {
        fn id(&self) -> &str {
            &self.id
        }

        async fn complete(&self, _prompt: &str, _p: &CompletionParams) -> Result<Completion, CompletionError> {
            self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            match &self.fail_with {
                Some(e) => Err(e.clone()),
                None => Ok(Completion::text(format!("from {}", self.id))),
            }
        }
    }

    fn backend_cfg(id: &str, cost: f64, latency_ms: u64, local: bool) -> BackendConfig {
        BackendConfig {
            id: id.to_string(),
            provider: "scripted".to_string(),
            cost_per_call: cost,
            latency_ms,
            local,
        }
    }

    fn selector_with(
        profiles: Vec<BackendConfig>,
        route: &[&str],
        impls: Vec<Arc<ScriptedBackend>>,
        budget: f64,
    ) -> ModelSelector {
        let mut config = SelectorConfig::default();
        config.backends = profiles;
        config.routes = HashMap::new();
        config
            .routes
            .insert("metrics_report".to_string(), route.iter().map(|s| s.to_string()).collect());
        config.initial_backoff_ms = 1;
        config.max_backoff_ms = 5;
        let backends = impls
            .into_iter()
            .map(|b| (b.id.clone(), b as Arc<dyn CompletionBackend>))
            .collect();
        ModelSelector::new(&config, backends, Arc::new(Budget::new(budget, Duration::from_secs(3600))))
            .unwrap()
    }

    fn metrics() -> TaskType {
        TaskType::named("metrics_report")
    }

    #[test]
    fn test_select_cheapest_meeting_latency() {
        let selector = selector_with(
            vec![
                backend_cfg("fast", 0.03, 100, false),
                backend_cfg("cheap", 0.01, 200, false),
                backend_cfg("slow", 0.001, 9_000, false),
            ],
            &["fast", "cheap", "slow"],
            vec![ScriptedBackend::ok("fast"), ScriptedBackend::ok("cheap"), ScriptedBackend::ok("slow")],
            10.0,
        );
        let policy = SelectionPolicy { max_cost_per_call: 0.05, max_latency_ms: 500, prefer_local: false };
        assert_eq!(selector.select(&metrics(), &policy).unwrap(), "cheap");
    }

    #[test]
    fn test_latency_is_soft_constraint() {
        let selector = selector_with(
            vec![backend_cfg("slow-a", 0.02, 3_000, false), backend_cfg("slow-b", 0.01, 4_000, false)],
            &["slow-a", "slow-b"],
            vec![ScriptedBackend::ok("slow-a"), ScriptedBackend::ok("slow-b")],
            10.0,
        );
        let policy = SelectionPolicy { max_cost_per_call: 0.05, max_latency_ms: 100, prefer_local: false };
        let candidates = selector.candidates(&metrics(), &policy).unwrap();
        assert_eq!(candidates[0].backend, "slow-b");
        assert!(!candidates[0].meets_latency);
    }

    #[test]
    fn test_prefer_local_wins_over_cost() {
        let selector = selector_with(
            vec![backend_cfg("hosted", 0.001, 100, false), backend_cfg("laptop", 0.01, 200, true)],
            &["hosted", "laptop"],
            vec![ScriptedBackend::ok("hosted"), ScriptedBackend::ok("laptop")],
            10.0,
        );
        let policy = SelectionPolicy { max_cost_per_call: 0.05, max_latency_ms: 1_000, prefer_local: true };
        assert_eq!(selector.select(&metrics(), &policy).unwrap(), "laptop");
    }

    #[tokio::test]
    async fn test_cost_ceiling_fails_without_invoking_backend() {
        let pricey = ScriptedBackend::ok("pricey");
        let selector = selector_with(
            vec![backend_cfg("pricey", 0.02, 100, false)],
            &["pricey"],
            vec![pricey.clone()],
            10.0,
        );
        let policy = SelectionPolicy { max_cost_per_call: 0.01, max_latency_ms: 1_000, prefer_local: false };
        let before = selector.budget().snapshot().spent;

        let err = selector
            .invoke(&metrics(), &policy, "hi", &CompletionParams::default(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, OrchestratorError::BudgetExceeded { .. }));
        assert_eq!(pricey.calls.load(AtomicOrdering::SeqCst), 0);
        assert_eq!(selector.budget().snapshot().spent, before);
    }

    #[tokio::test]
    async fn test_failure_retries_next_backend_not_same() {
        let flaky = ScriptedBackend::failing("flaky", CompletionError::RateLimited);
        let steady = ScriptedBackend::ok("steady");
        let selector = selector_with(
            vec![backend_cfg("flaky", 0.001, 100, false), backend_cfg("steady", 0.002, 100, false)],
            &["flaky", "steady"],
            vec![flaky.clone(), steady.clone()],
            10.0,
        );

        let out = selector
            .invoke(&metrics(), &SelectionPolicy::default(), "hi", &CompletionParams::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(out.backend, "steady");
        assert_eq!(out.attempts, 2);
        assert_eq!(flaky.calls.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(steady.calls.load(AtomicOrdering::SeqCst), 1);
        // failed attempt refunded, successful one charged
        assert!((selector.budget().snapshot().spent - 0.002).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_exhausted_candidates_surface_provider_error() {
        let a = ScriptedBackend::failing("a", CompletionError::ProviderError("500".into()));
        let b = ScriptedBackend::failing("b", CompletionError::Timeout);
        let selector = selector_with(
            vec![backend_cfg("a", 0.001, 100, false), backend_cfg("b", 0.002, 100, false)],
            &["a", "b"],
            vec![a.clone(), b.clone()],
            10.0,
        );

        let err = selector
            .invoke(&metrics(), &SelectionPolicy::default(), "hi", &CompletionParams::default(), &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            OrchestratorError::Provider { backend, reason } => {
                assert_eq!(backend, "b");
                assert!(reason.contains("all 2 attempts failed"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(selector.budget().snapshot().spent, 0.0);
        let stats = selector.stats();
        assert!(stats.iter().all(|s| s.failures == 1));
    }

    #[tokio::test]
    async fn test_insufficient_budget_fails_fast() {
        let backend = ScriptedBackend::ok("only");
        let selector = selector_with(
            vec![backend_cfg("only", 0.04, 100, false)],
            &["only"],
            vec![backend.clone()],
            0.03,
        );
        let err = selector
            .invoke(&metrics(), &SelectionPolicy::default(), "hi", &CompletionParams::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::BudgetExceeded { .. }));
        assert_eq!(backend.calls.load(AtomicOrdering::SeqCst), 0);
    }

    #[test]
    fn test_unrouted_type_uses_general_route() {
        let mut config = SelectorConfig::default();
        config.initial_backoff_ms = 1;
        let backends = build_backends(&config.backends).unwrap();
        let selector = ModelSelector::new(&config, backends, Arc::new(Budget::new(1.0, Duration::from_secs(60)))).unwrap();
        let chosen = selector.select(&TaskType::named("anything"), &SelectionPolicy::default()).unwrap();
        assert_eq!(chosen, "local-echo");
        assert!(selector.average_cost(&TaskType::named("anything")).is_some());
    }
}
