//! Error taxonomy shared by every orchestration component.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Coarse error classes exposed on failed tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Admission,
    Capability,
    BudgetExceeded,
    Provider,
    Cancellation,
    Config,
    Storage,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Admission => "admission",
            ErrorKind::Capability => "capability",
            ErrorKind::BudgetExceeded => "budget_exceeded",
            ErrorKind::Provider => "provider",
            ErrorKind::Cancellation => "cancellation",
            ErrorKind::Config => "config",
            ErrorKind::Storage => "storage",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OrchestratorError {
    /// Pool exhausted, draining, or the acquisition wait timed out.
    #[error("admission rejected: {reason}")]
    Admission { reason: String },

    /// No registered agent kind can handle any classified task type.
    #[error("no capable agent: {reason}")]
    NoCapableAgent { reason: String },

    #[error("budget exceeded: {reason}")]
    BudgetExceeded { reason: String },

    #[error("provider error ({backend}): {reason}")]
    Provider { backend: String, reason: String },

    #[error("task cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    pub fn admission(reason: impl Into<String>) -> Self {
        OrchestratorError::Admission { reason: reason.into() }
    }

    pub fn no_capable_agent(reason: impl Into<String>) -> Self {
        OrchestratorError::NoCapableAgent { reason: reason.into() }
    }

    pub fn budget(reason: impl Into<String>) -> Self {
        OrchestratorError::BudgetExceeded { reason: reason.into() }
    }

    pub fn provider(backend: impl Into<String>, reason: impl Into<String>) -> Self {
        OrchestratorError::Provider {
            backend: backend.into(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestratorError::Admission { .. } => ErrorKind::Admission,
            OrchestratorError::NoCapableAgent { .. } => ErrorKind::Capability,
            OrchestratorError::BudgetExceeded { .. } => ErrorKind::BudgetExceeded,
            OrchestratorError::Provider { .. } => ErrorKind::Provider,
            OrchestratorError::Cancelled => ErrorKind::Cancellation,
            OrchestratorError::Config(_) => ErrorKind::Config,
            OrchestratorError::Storage(_) => ErrorKind::Storage,
            OrchestratorError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether the caller may usefully retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::Admission { .. } | OrchestratorError::BudgetExceeded { .. }
        )
    }
}

impl From<sled::Error> for OrchestratorError {
    fn from(e: sled::Error) -> Self {
        OrchestratorError::Storage(e.to_string())
    }
}

impl From<bincode::Error> for OrchestratorError {
    fn from(e: bincode::Error) -> Self {
        OrchestratorError::Storage(format!("fact encoding: {}", e))
    }
}

pub type Result<T, E = OrchestratorError> = std::result::Result<T, E>;
