//! Task-submission facade: classify, route, execute, remember.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::agent::{AgentFactory, DefaultAgentFactory, ExecutionContext};
use crate::classifier::IntentClassifier;
use crate::error::{ErrorKind, OrchestratorError, Result};
use crate::memory::{ConsolidationReport, FactQuery, FactStore, MemoryFact, MemoryPipeline};
use crate::pool::{AgentPoolManager, PoolStats, ReleaseOutcome};
use crate::registry::CapabilityRegistry;
use crate::router::{Routed, TaskRouter};
use crate::selector::{
    build_backends, BackendStats, Budget, BudgetSnapshot, CompletionBackend, CompletionParams,
    ModelSelector, SelectionPolicy,
};
use crate::settings::Settings;
use crate::task::{RoutingDecision, SubmitContext, Task, TaskId, TaskStatus};

struct TaskRecord {
    task: Task,
    status: watch::Sender<TaskStatus>,
    cancel: CancellationToken,
}

struct Inner {
    pools: Arc<AgentPoolManager>,
    classifier: IntentClassifier,
    router: TaskRouter,
    selector: Arc<ModelSelector>,
    memory: Arc<MemoryPipeline>,
    tasks: DashMap<TaskId, TaskRecord>,
    decisions: DashMap<TaskId, RoutingDecision>,
    /// Finished tasks, oldest first; trimmed to `retention`.
    finished: Mutex<VecDeque<TaskId>>,
    retention: usize,
    default_policy: SelectionPolicy,
    accepting: AtomicBool,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// Cheap to clone; all clones share the same components.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

pub struct OrchestratorBuilder {
    settings: Settings,
    backends: HashMap<String, Arc<dyn CompletionBackend>>,
    factory: Option<Arc<dyn AgentFactory>>,
    store: Option<Arc<dyn FactStore>>,
}

impl OrchestratorBuilder {
    /// Supply the implementation for a configured backend id.
    pub fn with_backend(mut self, id: impl Into<String>, backend: Arc<dyn CompletionBackend>) -> Self {
        self.backends.insert(id.into(), backend);
        self
    }

    pub fn with_agent_factory(mut self, factory: Arc<dyn AgentFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn with_fact_store(mut self, store: Arc<dyn FactStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Wire the components and start the background workers. Needs a Tokio runtime.
    pub fn build(self) -> Result<Orchestrator> {
        let settings = self.settings;
        settings
            .validate()
            .map_err(|e| OrchestratorError::Config(e.to_string()))?;

        let unresolved: Vec<_> = settings
            .selector
            .backends
            .iter()
            .filter(|b| !self.backends.contains_key(&b.id))
            .cloned()
            .collect();
        let mut backends = build_backends(&unresolved)?;
        backends.extend(self.backends);

        let registry = Arc::new(CapabilityRegistry::from_settings(&settings.agents)?);
        let budget = Arc::new(Budget::new(
            settings.budget.limit_per_window,
            Duration::from_secs(settings.budget.window_secs),
        ));
        let selector = Arc::new(ModelSelector::new(&settings.selector, backends, budget)?);

        let factory = self
            .factory
            .unwrap_or_else(|| Arc::new(DefaultAgentFactory::new()));
        let pools = Arc::new(AgentPoolManager::new(registry.clone(), factory, &settings.pool));

        let classifier = IntentClassifier::new(&settings.classifier, registry.task_types())?
            .with_model(selector.clone(), settings.selector.default_policy.clone());
        let router = TaskRouter::new(
            registry.clone(),
            pools.clone(),
            selector.clone(),
            settings.routing.min_routing_confidence,
        );

        let store = match self.store {
            Some(store) => store,
            None => MemoryPipeline::open_store(&settings.memory)?,
        };
        let memory = Arc::new(MemoryPipeline::new(store, &settings.memory));

        let shutdown = CancellationToken::new();
        let mut workers = memory.spawn_workers(shutdown.clone());
        workers.push(pools.spawn_sweeper(shutdown.clone()));

        info!(
            "Orchestrator ready: {} agent kinds, {} backends",
            registry.kinds().len(),
            settings.selector.backends.len()
        );

        Ok(Orchestrator {
            inner: Arc::new(Inner {
                pools,
                classifier,
                router,
                selector,
                memory,
                tasks: DashMap::new(),
                decisions: DashMap::new(),
                finished: Mutex::new(VecDeque::new()),
                retention: settings.tasks.retention,
                default_policy: settings.selector.default_policy.clone(),
                accepting: AtomicBool::new(true),
                shutdown,
                workers: Mutex::new(workers),
            }),
        })
    }
}

/// Instance outcome for a task that failed with `err`.
fn release_outcome(err: &OrchestratorError) -> ReleaseOutcome {
    match err.kind() {
        ErrorKind::Provider | ErrorKind::Internal => ReleaseOutcome::Failure,
        _ => ReleaseOutcome::Success,
    }
}

impl Orchestrator {
    pub fn builder(settings: Settings) -> OrchestratorBuilder {
        OrchestratorBuilder {
            settings,
            backends: HashMap::new(),
            factory: None,
            store: None,
        }
    }

    pub fn from_settings(settings: Settings) -> Result<Self> {
        Self::builder(settings).build()
    }

    /// Accept a request and start working on it in the background.
    #[instrument(skip(self, text, context))]
    pub fn submit(&self, text: impl Into<String>, context: SubmitContext) -> Result<TaskId> {
        if !self.inner.accepting.load(Ordering::SeqCst) {
            return Err(OrchestratorError::admission("orchestrator is shutting down"));
        }

        let task = Task::new(text, context);
        let id = task.id;
        let deadline = task.deadline;
        let cancel = self.inner.shutdown.child_token();
        let (status, _) = watch::channel(TaskStatus::Pending);

        self.inner.tasks.insert(
            id,
            TaskRecord {
                task,
                status,
                cancel: cancel.clone(),
            },
        );
        debug!("Accepted task {}", id);

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let deadline_hit = Arc::new(AtomicBool::new(false));
            let timer = deadline.map(|at| {
                let wait = (at - chrono::Utc::now()).to_std().unwrap_or(Duration::ZERO);
                let token = cancel.clone();
                let hit = deadline_hit.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(wait).await;
                    hit.store(true, Ordering::SeqCst);
                    token.cancel();
                })
            });

            let result = inner.execute(id, &cancel).await;
            if let Some(timer) = timer {
                timer.abort();
            }

            let status = match result {
                Ok(text) => TaskStatus::Completed { result: text },
                Err(OrchestratorError::Cancelled) if deadline_hit.load(Ordering::SeqCst) => {
                    TaskStatus::Failed {
                        kind: ErrorKind::Cancellation,
                        reason: "deadline exceeded".to_string(),
                    }
                }
                Err(e) => TaskStatus::failed(&e),
            };
            match &status {
                TaskStatus::Completed { .. } => info!("Task {} completed", id),
                other => warn!("Task {} ended as {:?}", id, other),
            }
            inner.set_status(id, status);
        });

        Ok(id)
    }

    pub fn status(&self, id: TaskId) -> Option<TaskStatus> {
        self.inner.tasks.get(&id).map(|r| r.status.borrow().clone())
    }

    pub fn task(&self, id: TaskId) -> Option<Task> {
        self.inner.tasks.get(&id).map(|r| r.task.clone())
    }

    /// Wait for the task to reach Completed or Failed.
    pub async fn wait(&self, id: TaskId) -> Result<TaskStatus> {
        let mut rx = self
            .inner
            .tasks
            .get(&id)
            .map(|r| r.status.subscribe())
            .ok_or_else(|| OrchestratorError::Internal(format!("unknown task {}", id)))?;

        let status = rx
            .wait_for(|s| s.is_terminal())
            .await
            .map_err(|_| OrchestratorError::Internal(format!("task {} vanished", id)))?;
        Ok(status.clone())
    }

    /// Request cancellation. Returns false if the task is unknown or already finished.
    pub fn cancel(&self, id: TaskId) -> bool {
        let Some(record) = self.inner.tasks.get(&id) else {
            return false;
        };
        if record.status.borrow().is_terminal() {
            return false;
        }
        info!("Cancelling task {}", id);
        record.cancel.cancel();
        true
    }

    pub async fn query_facts(
        &self,
        query: &FactQuery,
        include_superseded: bool,
    ) -> Result<Vec<MemoryFact>> {
        self.inner.memory.query(query, include_superseded).await
    }

    /// Block until queued extractions are stored and consolidated.
    pub async fn flush_memory(&self) -> Result<ConsolidationReport> {
        self.inner.memory.flush().await
    }

    pub async fn reconsolidate(&self) -> Result<ConsolidationReport> {
        self.inner.memory.consolidator().reconsolidate_all().await
    }

    /// Retained decisions in the order they were made.
    pub fn routing_decisions(&self) -> Vec<RoutingDecision> {
        let mut decisions: Vec<RoutingDecision> =
            self.inner.decisions.iter().map(|d| d.value().clone()).collect();
        decisions.sort_by_key(|d| d.decided_at);
        decisions
    }

    pub fn routing_decision(&self, id: TaskId) -> Option<RoutingDecision> {
        self.inner.decisions.get(&id).map(|d| d.clone())
    }

    pub fn pool_stats(&self) -> Vec<PoolStats> {
        self.inner.pools.all_stats()
    }

    pub fn pools(&self) -> &Arc<AgentPoolManager> {
        &self.inner.pools
    }

    pub fn budget(&self) -> BudgetSnapshot {
        self.inner.selector.budget().snapshot()
    }

    pub fn backend_stats(&self) -> Vec<BackendStats> {
        self.inner.selector.stats()
    }

    /// Stop accepting work, let in-flight tasks return their instances, persist
    /// pending facts and stop the background workers.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<()> {
        if !self.inner.accepting.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Shutting down orchestrator");

        self.inner.pools.drain_all().await;
        let report = self.inner.memory.flush().await;
        self.inner.shutdown.cancel();

        let workers: Vec<_> = self.inner.workers.lock().drain(..).collect();
        for worker in workers {
            if let Err(e) = worker.await {
                error!("Background worker ended abnormally: {}", e);
            }
        }

        let report = report?;
        info!("Shutdown complete; final consolidation scanned {} facts", report.scanned);
        Ok(())
    }
}

impl Inner {
    fn set_status(&self, id: TaskId, status: TaskStatus) {
        {
            let Some(mut record) = self.tasks.get_mut(&id) else {
                return;
            };
            if record.task.status.is_terminal() {
                return;
            }
            record.task.status = status.clone();
        }
        // evict before publishing so a waiter never observes the old set
        if status.is_terminal() {
            self.retire(id);
        }
        if let Some(record) = self.tasks.get(&id) {
            record.status.send_replace(status);
        }
    }

    /// Forget the oldest finished tasks once more than `retention` are kept.
    fn retire(&self, id: TaskId) {
        let evicted: Vec<TaskId> = {
            let mut finished = self.finished.lock();
            finished.push_back(id);
            let excess = finished.len().saturating_sub(self.retention);
            finished.drain(..excess).collect()
        };
        for old in evicted {
            self.tasks.remove(&old);
            self.decisions.remove(&old);
            debug!("Evicted finished task {}", old);
        }
    }

    fn snapshot(&self, id: TaskId) -> Result<Task> {
        self.tasks
            .get(&id)
            .map(|r| r.task.clone())
            .ok_or_else(|| OrchestratorError::Internal(format!("unknown task {}", id)))
    }

    async fn execute(&self, id: TaskId, cancel: &CancellationToken) -> Result<String> {
        let task = self.snapshot(id)?;
        let policy = task
            .context
            .policy
            .clone()
            .unwrap_or_else(|| self.default_policy.clone());

        let intents = self
            .classifier
            .classify(&task.request, &task.context, cancel)
            .await;
        if cancel.is_cancelled() {
            return Err(OrchestratorError::Cancelled);
        }

        // dropping a pending acquisition is safe; the pool reclaims its place
        let Routed { mut decision, lease } = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(OrchestratorError::Cancelled),
            routed = self.router.route(&task, &intents, &policy) => routed?,
        };

        if let Some(mut record) = self.tasks.get_mut(&id) {
            record.task.task_type = Some(decision.task_type.clone());
        }
        self.set_status(id, TaskStatus::Routed);

        let ctx = ExecutionContext {
            task_type: decision.task_type.clone(),
            selector: self.selector.clone(),
            policy,
            params: CompletionParams::default(),
            cancel: cancel.clone(),
        };

        self.set_status(id, TaskStatus::Running);
        let agent = lease.agent().clone();
        let result = agent.execute(&task, &ctx).await;

        // recorded once, after the agent's call settles which backend answered
        if let Ok(output) = &result {
            decision.backend = Some(output.backend.clone());
        }
        self.decisions.insert(id, decision);

        match result {
            Ok(output) => {
                lease.release(ReleaseOutcome::Success);
                if let Err(e) = self.memory.record_completion(id, output.text.clone()).await {
                    warn!("Task {} output was not queued for extraction: {}", id, e);
                }
                Ok(output.text)
            }
            Err(e) => {
                lease.release(release_outcome(&e));
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::{Completion, CompletionError};
    use async_trait::async_trait;

    struct SlowBackend;

    #[async_trait]
    impl CompletionBackend for SlowBackend {
        fn id(&self) -> &str {
            "local-echo"
        }

        async fn complete(&self, _prompt: &str, _p: &CompletionParams) -> std::result::Result<Completion, CompletionError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Completion::text("too late"))
        }
    }

    async fn wait_until_running(orch: &Orchestrator, id: TaskId) {
        while orch.status(id) != Some(TaskStatus::Running) {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    #[tokio::test]
    async fn test_submit_and_wait_completes() {
        let orch = Orchestrator::from_settings(Settings::default()).unwrap();
        let id = orch
            .submit("weekly kpi report", SubmitContext::default())
            .unwrap();

        let status = orch.wait(id).await.unwrap();
        assert_eq!(
            status,
            TaskStatus::Completed { result: "[local-echo] weekly kpi report".to_string() }
        );
        let decision = orch.routing_decision(id).unwrap();
        assert_eq!(decision.agent_kind, "MetricsAgent");
        assert_eq!(orch.task(id).unwrap().task_type, Some(decision.task_type));
        orch.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_running_task_releases_instance() {
        let orch = Orchestrator::builder(Settings::default())
            .with_backend("local-echo", Arc::new(SlowBackend))
            .build()
            .unwrap();
        let id = orch.submit("kpi report", SubmitContext::default()).unwrap();
        wait_until_running(&orch, id).await;

        assert!(orch.cancel(id));
        let status = orch.wait(id).await.unwrap();
        assert!(matches!(status, TaskStatus::Failed { kind: ErrorKind::Cancellation, .. }));
        assert!(!orch.cancel(id));

        let metrics = orch.pools().stats("MetricsAgent").unwrap();
        assert_eq!(metrics.busy, 0);
        assert_eq!(orch.budget().spent, 0.0);
    }

    #[tokio::test]
    async fn test_deadline_fails_task() {
        let orch = Orchestrator::builder(Settings::default())
            .with_backend("local-echo", Arc::new(SlowBackend))
            .build()
            .unwrap();
        let ctx = SubmitContext::default()
            .with_deadline(chrono::Utc::now() + chrono::Duration::milliseconds(50));
        let id = orch.submit("kpi report", ctx).unwrap();

        match orch.wait(id).await.unwrap() {
            TaskStatus::Failed { kind, reason } => {
                assert_eq!(kind, ErrorKind::Cancellation);
                assert_eq!(reason, "deadline exceeded");
            }
            other => panic!("unexpected status {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_work() {
        let orch = Orchestrator::from_settings(Settings::default()).unwrap();
        orch.shutdown().await.unwrap();
        let err = orch.submit("anything", SubmitContext::default()).unwrap_err();
        assert!(matches!(err, OrchestratorError::Admission { .. }));
        // second shutdown is a no-op
        orch.shutdown().await.unwrap();
    }

    struct DownBackend;

    #[async_trait]
    impl CompletionBackend for DownBackend {
        fn id(&self) -> &str {
            "local-echo"
        }

        async fn complete(&self, _prompt: &str, _p: &CompletionParams) -> std::result::Result<Completion, CompletionError> {
            Err(CompletionError::ProviderError("offline".into()))
        }
    }

    #[tokio::test]
    async fn test_decision_records_backend_that_answered() {
        let orch = Orchestrator::builder(Settings::default())
            .with_backend("local-echo", Arc::new(DownBackend))
            .build()
            .unwrap();
        let id = orch.submit("weekly kpi report", SubmitContext::default()).unwrap();

        let status = orch.wait(id).await.unwrap();
        assert_eq!(
            status,
            TaskStatus::Completed { result: "[hosted-echo] weekly kpi report".to_string() }
        );
        let decision = orch.routing_decision(id).unwrap();
        assert_eq!(decision.backend.as_deref(), Some("hosted-echo"));
        orch.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_finished_tasks_beyond_retention_are_evicted() {
        let mut settings = Settings::default();
        settings.tasks.retention = 2;
        let orch = Orchestrator::from_settings(settings).unwrap();

        let mut ids = Vec::new();
        for _ in 0..4 {
            let id = orch.submit("kpi report", SubmitContext::default()).unwrap();
            orch.wait(id).await.unwrap();
            ids.push(id);
        }

        for old in &ids[..2] {
            assert!(orch.status(*old).is_none());
            assert!(orch.routing_decision(*old).is_none());
        }
        for kept in &ids[2..] {
            assert!(orch.status(*kept).unwrap().is_terminal());
            assert!(orch.routing_decision(*kept).is_some());
        }
        let decisions = orch.routing_decisions();
        assert_eq!(decisions.len(), 2);
        assert_eq!(decisions[0].task_id, ids[2]);
        orch.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_task() {
        let orch = Orchestrator::from_settings(Settings::default()).unwrap();
        let missing = uuid::Uuid::new_v4();
        assert!(orch.status(missing).is_none());
        assert!(!orch.cancel(missing));
        assert!(orch.wait(missing).await.is_err());
    }
}
