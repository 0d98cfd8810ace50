use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::error::Result;
use crate::registry::AgentKind;
use crate::selector::{CompletionParams, ModelSelector, SelectionPolicy};
use crate::task::{Task, TaskType};

/// Everything an agent needs from the orchestrator to run one task.
#[derive(Clone)]
pub struct ExecutionContext {
    pub task_type: TaskType,
    pub selector: Arc<ModelSelector>,
    pub policy: SelectionPolicy,
    pub params: CompletionParams,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentOutput {
    pub text: String,
    pub backend: String,
    pub cost: f64,
}

/// A worker instance of some agent kind. Instances are pooled and reused.
#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;
    fn kind(&self) -> &str;
    async fn execute(&self, task: &Task, ctx: &ExecutionContext) -> Result<AgentOutput>;
    fn health(&self) -> AgentHealth;
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AgentHealth {
    pub uptime_seconds: u64,
    pub total_requests: u64,
    pub error_count: u64,
    pub average_response_time_ms: f64,
}

/// Builds agent instances for the pool.
#[async_trait]
pub trait AgentFactory: Send + Sync {
    async fn create(&self, kind: &AgentKind) -> Result<Arc<dyn Agent>>;
}

// --- Built-in worker ---

/// Agent that phrases the task as a prompt and runs it through the model selector.
pub struct LlmWorker {
    name: String,
    kind: Arc<AgentKind>,
    request_count: AtomicU64,
    error_count: AtomicU64,
    total_response_ms: AtomicU64,
    start_time: Instant,
}

impl LlmWorker {
    pub fn new(kind: Arc<AgentKind>, ordinal: u64) -> Self {
        Self {
            name: format!("{}-{}", kind.name, ordinal),
            kind,
            request_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            total_response_ms: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    fn prompt(&self, task: &Task, task_type: &TaskType) -> String {
        let mut prompt = String::new();
        if let Some(instructions) = &self.kind.instructions {
            prompt.push_str(instructions);
            prompt.push('\n');
        }
        prompt.push_str(&format!("Task type: {}\n", task_type));
        for (key, value) in &task.context.metadata {
            prompt.push_str(&format!("{}: {}\n", key, value));
        }
        prompt.push_str(&task.request);
        prompt
    }
}

#[async_trait]
impl Agent for LlmWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        &self.kind.name
    }

    #[instrument(skip(self, task, ctx), fields(agent = %self.name, task_id = %task.id))]
    async fn execute(&self, task: &Task, ctx: &ExecutionContext) -> Result<AgentOutput> {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();

        let prompt = self.prompt(task, &ctx.task_type);
        let result = ctx
            .selector
            .invoke(&ctx.task_type, &ctx.policy, &prompt, &ctx.params, &ctx.cancel)
            .await;

        self.total_response_ms
            .fetch_add(started.elapsed().as_millis() as u64, Ordering::Relaxed);

        match result {
            Ok(invocation) => {
                debug!(
                    "Worker {} completed via '{}' after {} attempt(s)",
                    self.name, invocation.backend, invocation.attempts
                );
                Ok(AgentOutput {
                    text: invocation.text,
                    backend: invocation.backend,
                    cost: invocation.cost,
                })
            }
            Err(e) => {
                self.error_count.fetch_add(1, Ordering::Relaxed);
                warn!("Worker {} failed: {}", self.name, e);
                Err(e)
            }
        }
    }

    fn health(&self) -> AgentHealth {
        let requests = self.request_count.load(Ordering::Relaxed);
        let total_ms = self.total_response_ms.load(Ordering::Relaxed);
        AgentHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            total_requests: requests,
            error_count: self.error_count.load(Ordering::Relaxed),
            average_response_time_ms: if requests == 0 {
                0.0
            } else {
                total_ms as f64 / requests as f64
            },
        }
    }
}

/// Creates [`LlmWorker`] instances, numbering them per process.
#[derive(Default)]
pub struct DefaultAgentFactory {
    created: AtomicU64,
}

impl DefaultAgentFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AgentFactory for DefaultAgentFactory {
    async fn create(&self, kind: &AgentKind) -> Result<Arc<dyn Agent>> {
        let ordinal = self.created.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(Arc::new(LlmWorker::new(Arc::new(kind.clone()), ordinal)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::{build_backends, Budget};
    use crate::settings::SelectorConfig;
    use crate::task::SubmitContext;
    use std::time::Duration;

    fn context(task_type: TaskType) -> ExecutionContext {
        let config = SelectorConfig::default();
        let backends = build_backends(&config.backends).unwrap();
        let budget = Arc::new(Budget::new(1.0, Duration::from_secs(60)));
        ExecutionContext {
            task_type,
            selector: Arc::new(ModelSelector::new(&config, backends, budget).unwrap()),
            policy: SelectionPolicy::default(),
            params: CompletionParams::default(),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_worker_runs_request_through_selector() {
        let factory = DefaultAgentFactory::new();
        let kind = AgentKind::new("MetricsAgent", &["metrics_report"], 1)
            .with_instructions("Be brief.");
        let agent = factory.create(&kind).await.unwrap();
        assert_eq!(agent.kind(), "MetricsAgent");
        assert_eq!(agent.name(), "MetricsAgent-1");

        let task = Task::new("weekly kpi report", SubmitContext::default());
        let out = agent
            .execute(&task, &context(TaskType::named("metrics_report")))
            .await
            .unwrap();

        assert_eq!(out.backend, "local-echo");
        assert!(out.text.ends_with("weekly kpi report"));
        assert_eq!(agent.health().total_requests, 1);
        assert_eq!(agent.health().error_count, 0);
    }

    #[tokio::test]
    async fn test_cancelled_execution_counts_as_error() {
        let kind = AgentKind::new("GeneralAgent", &["general"], 1);
        let agent = LlmWorker::new(Arc::new(kind), 7);
        let ctx = context(TaskType::General);
        ctx.cancel.cancel();

        let task = Task::new("anything", SubmitContext::default());
        let err = agent.execute(&task, &ctx).await.unwrap_err();
        assert!(matches!(err, crate::error::OrchestratorError::Cancelled));
        assert_eq!(agent.health().total_requests, 1);
        assert_eq!(agent.health().error_count, 1);
    }
}
