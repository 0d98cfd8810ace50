//! Agent Orchestrator - Core Library
//!
//! Classifies incoming requests, routes them to pooled agent instances, picks a
//! model backend under a spending budget and keeps a consolidated memory of the
//! facts produced by completed tasks.

pub mod agent;
pub mod batch;
pub mod classifier;
pub mod cli;
pub mod error;
pub mod memory;
pub mod orchestrator;
pub mod pool;
pub mod registry;
pub mod router;
pub mod selector;
pub mod settings;
pub mod task;
pub mod telemetry;

pub use agent::{Agent, AgentFactory};
pub use error::{ErrorKind, OrchestratorError, Result};
pub use orchestrator::{Orchestrator, OrchestratorBuilder};
pub use task::{SubmitContext, Task, TaskId, TaskStatus, TaskType};
