//! Routes classified tasks to an agent kind and acquires an instance for them.

use chrono::Utc;
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::classifier::Intent;
use crate::error::{OrchestratorError, Result};
use crate::pool::{AgentLease, AgentPoolManager};
use crate::registry::{AgentKind, CapabilityRegistry};
use crate::selector::{ModelSelector, SelectionPolicy};
use crate::task::{RoutingDecision, Task, TaskType};

/// A routing decision together with the instance leased for it.
#[derive(Debug)]
pub struct Routed {
    pub decision: RoutingDecision,
    pub lease: AgentLease,
}

pub struct TaskRouter {
    registry: Arc<CapabilityRegistry>,
    pools: Arc<AgentPoolManager>,
    selector: Arc<ModelSelector>,
    min_routing_confidence: f32,
}

struct Target {
    task_type: TaskType,
    confidence: f32,
    kinds: Vec<Arc<AgentKind>>,
}

impl TaskRouter {
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        pools: Arc<AgentPoolManager>,
        selector: Arc<ModelSelector>,
        min_routing_confidence: f32,
    ) -> Self {
        Self {
            registry,
            pools,
            selector,
            min_routing_confidence,
        }
    }

    /// Intents by confidence, then cheaper average backend cost, then name.
    fn rank(&self, intents: &[Intent]) -> Vec<Intent> {
        let mut ranked = intents.to_vec();
        ranked.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(Ordering::Equal)
                .then_with(|| {
                    let ca = self.selector.average_cost(&a.task_type).unwrap_or(f64::INFINITY);
                    let cb = self.selector.average_cost(&b.task_type).unwrap_or(f64::INFINITY);
                    ca.partial_cmp(&cb).unwrap_or(Ordering::Equal)
                })
                .then_with(|| a.task_type.as_str().cmp(b.task_type.as_str()))
        });
        ranked
    }

    fn target(&self, intents: &[Intent]) -> Result<Target> {
        let ranked = self.rank(intents);
        let top = ranked.first().ok_or_else(|| {
            OrchestratorError::no_capable_agent("classification produced no task type")
        })?;

        if top.confidence < self.min_routing_confidence {
            let general = self.registry.fallback_kinds();
            if !general.is_empty() {
                debug!(
                    "Top intent '{}' at {:.2} is below {:.2}; using general agents",
                    top.task_type, top.confidence, self.min_routing_confidence
                );
                return Ok(Target {
                    task_type: TaskType::General,
                    confidence: top.confidence,
                    kinds: general,
                });
            }
        }

        for intent in &ranked {
            let kinds = self.registry.capable_kinds(&intent.task_type);
            if !kinds.is_empty() {
                return Ok(Target {
                    task_type: intent.task_type.clone(),
                    confidence: intent.confidence,
                    kinds,
                });
            }
            debug!("No agent kind handles '{}'; trying next intent", intent.task_type);
        }

        let types: Vec<&str> = ranked.iter().map(|i| i.task_type.as_str()).collect();
        Err(OrchestratorError::no_capable_agent(format!(
            "no registered agent handles any of [{}]",
            types.join(", ")
        )))
    }

    async fn lease(&self, target: &Target) -> Result<AgentLease> {
        let mut reasons = Vec::new();

        for kind in &target.kinds {
            match self.pools.try_acquire(&kind.name).await {
                Ok(lease) => return Ok(lease),
                Err(e) => reasons.push(e.to_string()),
            }
        }

        let share = self.pools.acquire_timeout() / target.kinds.len().max(1) as u32;
        for kind in &target.kinds {
            match self.pools.acquire_with_timeout(&kind.name, share).await {
                Ok(lease) => return Ok(lease),
                Err(e) => reasons.push(e.to_string()),
            }
        }

        Err(OrchestratorError::admission(format!(
            "all pools exhausted for '{}': {}",
            target.task_type,
            reasons.join("; ")
        )))
    }

    #[instrument(skip(self, task, intents, policy), fields(task_id = %task.id))]
    pub async fn route(
        &self,
        task: &Task,
        intents: &[Intent],
        policy: &SelectionPolicy,
    ) -> Result<Routed> {
        let target = self.target(intents)?;
        let lease = self.lease(&target).await?;
        let backend = self.selector.select(&target.task_type, policy).ok();

        let decision = RoutingDecision {
            task_id: task.id,
            agent_kind: lease.kind().to_string(),
            task_type: target.task_type.clone(),
            backend,
            confidence: target.confidence,
            decided_at: Utc::now(),
        };

        info!(
            "Routed task {} as '{}' ({:.2}) to {}",
            task.id, decision.task_type, decision.confidence, decision.agent_kind
        );
        Ok(Routed { decision, lease })
    }
}
