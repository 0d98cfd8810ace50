//! Task, task-type and routing-decision records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::error::{ErrorKind, OrchestratorError};
use crate::selector::SelectionPolicy;

pub type TaskId = Uuid;

/// Name of the fallback task type in configuration.
pub const GENERAL_TASK_TYPE: &str = "general";

/// A category of request, resolved through the capability registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TaskType {
    Named(String),
    General,
}

impl TaskType {
    pub fn named(name: impl Into<String>) -> Self {
        TaskType::from(name.into())
    }

    pub fn as_str(&self) -> &str {
        match self {
            TaskType::Named(name) => name,
            TaskType::General => GENERAL_TASK_TYPE,
        }
    }

    pub fn is_general(&self) -> bool {
        matches!(self, TaskType::General)
    }
}

impl From<String> for TaskType {
    fn from(name: String) -> Self {
        let trimmed = name.trim();
        if trimmed.eq_ignore_ascii_case(GENERAL_TASK_TYPE) {
            TaskType::General
        } else {
            TaskType::Named(trimmed.to_lowercase())
        }
    }
}

impl From<&str> for TaskType {
    fn from(name: &str) -> Self {
        TaskType::from(name.to_string())
    }
}

impl From<TaskType> for String {
    fn from(t: TaskType) -> Self {
        t.as_str().to_string()
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low = 1,
    #[default]
    Normal = 2,
    High = 3,
    Critical = 4,
}

/// Caller-supplied context accompanying a request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmitContext {
    /// Free-form metadata; `task_type` acts as an explicit classification hint.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    /// Overrides the configured default selection policy.
    #[serde(default)]
    pub policy: Option<SelectionPolicy>,
}

impl SubmitContext {
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_policy(mut self, policy: SelectionPolicy) -> Self {
        self.policy = Some(policy);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Routed,
    Running,
    Completed { result: String },
    Failed { kind: ErrorKind, reason: String },
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed { .. } | TaskStatus::Failed { .. })
    }

    pub fn failed(err: &OrchestratorError) -> Self {
        TaskStatus::Failed {
            kind: err.kind(),
            reason: err.to_string(),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Routed => "routed",
            TaskStatus::Running => "running",
            TaskStatus::Completed { .. } => "completed",
            TaskStatus::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub request: String,
    pub context: SubmitContext,
    pub task_type: Option<TaskType>,
    pub priority: TaskPriority,
    pub deadline: Option<DateTime<Utc>>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(request: impl Into<String>, context: SubmitContext) -> Self {
        Self {
            id: Uuid::new_v4(),
            request: request.into(),
            priority: context.priority,
            deadline: context.deadline,
            context,
            task_type: None,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
        }
    }
}

/// Audit record of where a task was sent. Immutable once recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub task_id: TaskId,
    pub agent_kind: String,
    pub task_type: TaskType,
    /// Backend that answered the task. The router fills in the selector's pick for the
    /// task type and policy, if one was affordable; the orchestrator replaces it with
    /// the backend that actually answered before recording the decision.
    pub backend: Option<String>,
    pub confidence: f32,
    pub decided_at: DateTime<Utc>,
}
