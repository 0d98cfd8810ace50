//! Batch submission of pre-configured requests.
//!
//! A batch file lists requests with optional metadata, per-request deadlines and
//! dependencies. Requests whose dependencies have all succeeded are submitted
//! concurrently (bounded by `max_concurrent_tasks`), highest priority first;
//! dependents of a failed request are skipped. Results are summarised and optionally written as JSON.

use crate::{
    error::{ErrorKind, OrchestratorError},
    orchestrator::Orchestrator,
    settings::Settings,
    task::{SubmitContext, TaskPriority, TaskStatus},
};
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{error, info, instrument, warn};

/// Batch job configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    pub job: JobMetadata,

    pub requests: Vec<RequestConfig>,

    #[serde(default)]
    pub settings: BatchSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMetadata {
    pub name: String,
    pub description: Option<String>,

    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestConfig {
    /// Unique identifier within the batch
    pub id: String,

    /// Request text handed to the classifier
    pub text: String,

    /// Submit metadata; `task_type` forces classification
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,

    #[serde(default)]
    pub priority: TaskPriority,

    #[serde(default)]
    pub settings: RequestSettings,

    /// Requests that must succeed first
    #[serde(default)]
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestSettings {
    /// Deadline relative to submission, in seconds
    #[serde(default = "default_request_timeout")]
    pub timeout_seconds: u64,

    /// Resubmissions after a retryable failure (admission or budget)
    #[serde(default)]
    pub retries: u32,
}

impl Default for RequestSettings {
    fn default() -> Self {
        Self {
            timeout_seconds: default_request_timeout(),
            retries: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSettings {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_tasks: usize,

    /// Output file for results
    pub output_file: Option<PathBuf>,

    /// Stop submitting new requests after the first failure
    #[serde(default)]
    pub fail_fast: bool,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent(),
            output_file: None,
            fail_fast: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestResult {
    pub request_id: String,
    pub status: RequestStatus,
    pub agent_kind: Option<String>,
    pub task_type: Option<String>,
    pub output: Option<String>,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub retries_used: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Success,
    Failed,
    Skipped,
    Timeout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult {
    pub job_name: String,
    pub status: BatchStatus,
    pub total_requests: usize,
    pub successful: usize,
    pub failed: usize,
    pub skipped: usize,
    pub total_duration_ms: u64,
    pub results: Vec<RequestResult>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Success,
    PartialSuccess,
    Failed,
}

/// Execute a batch file against a fresh orchestrator.
#[instrument(skip(settings))]
pub async fn run(config_path: PathBuf, settings: Settings) -> Result<()> {
    info!("Starting batch execution from {:?}", config_path);

    let config = load_batch_config(&config_path).context("Failed to load batch configuration")?;
    info!("Loaded batch job '{}' with {} requests", config.job.name, config.requests.len());
    let output_file = config.settings.output_file.clone();

    let orchestrator = Orchestrator::from_settings(settings).context("Failed to build orchestrator")?;
    let result = execute_batch(&orchestrator, config).await;
    orchestrator
        .shutdown()
        .await
        .context("Orchestrator shutdown failed")?;
    let result = result.context("Batch execution failed")?;

    print_batch_summary(&result);

    if let Some(ref path) = output_file {
        save_batch_results(&result, path).context("Failed to save batch results")?;
    }

    match result.status {
        BatchStatus::Success => Ok(()),
        BatchStatus::PartialSuccess => {
            warn!("Batch completed with some failures");
            Ok(())
        }
        BatchStatus::Failed => {
            error!("Batch execution failed");
            Err(anyhow!(
                "Batch execution failed: {}",
                result.error.unwrap_or_else(|| "every request failed".to_string())
            ))
        }
    }
}

pub fn load_batch_config(config_path: &Path) -> Result<BatchConfig> {
    let contents = std::fs::read_to_string(config_path)
        .with_context(|| format!("Failed to read batch file: {:?}", config_path))?;

    let config: BatchConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse batch file: {:?}", config_path))?;

    validate_batch_config(&config)?;
    Ok(config)
}

fn validate_batch_config(config: &BatchConfig) -> Result<()> {
    if config.requests.is_empty() {
        return Err(anyhow!("Batch must contain at least one request"));
    }
    if config.settings.max_concurrent_tasks == 0 {
        return Err(anyhow!("max_concurrent_tasks must be positive"));
    }

    let mut ids = HashSet::new();
    for request in &config.requests {
        if !ids.insert(request.id.as_str()) {
            return Err(anyhow!("Duplicate request ID: {}", request.id));
        }
    }
    for request in &config.requests {
        for dep in &request.depends_on {
            if !ids.contains(dep.as_str()) {
                return Err(anyhow!("Request {} depends on unknown request {}", request.id, dep));
            }
        }
    }
    Ok(())
}

/// Submit requests in dependency waves with bounded concurrency.
pub async fn execute_batch(orchestrator: &Orchestrator, config: BatchConfig) -> Result<BatchResult> {
    let start_time = Instant::now();
    let total_requests = config.requests.len();
    let semaphore = Arc::new(Semaphore::new(config.settings.max_concurrent_tasks));

    let mut results: Vec<RequestResult> = Vec::new();
    let mut succeeded: HashSet<String> = HashSet::new();
    let mut unsuccessful: HashSet<String> = HashSet::new();
    let mut remaining: HashMap<String, RequestConfig> = config
        .requests
        .into_iter()
        .map(|r| (r.id.clone(), r))
        .collect();
    let mut abort: Option<String> = None;

    while !remaining.is_empty() {
        let blocked: Vec<String> = remaining
            .values()
            .filter(|r| abort.is_some() || r.depends_on.iter().any(|d| unsuccessful.contains(d)))
            .map(|r| r.id.clone())
            .collect();
        for id in blocked {
            remaining.remove(&id);
            unsuccessful.insert(id.clone());
            results.push(skipped(id));
        }

        let mut ready: Vec<RequestConfig> = remaining
            .values()
            .filter(|r| r.depends_on.iter().all(|d| succeeded.contains(d)))
            .cloned()
            .collect();
        if ready.is_empty() {
            if remaining.is_empty() {
                break;
            }
            return Err(anyhow!("Circular dependency among requests"));
        }
        ready.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));

        let mut handles = Vec::new();
        for request in ready {
            remaining.remove(&request.id);
            let permit = semaphore.clone().acquire_owned().await?;
            let orchestrator = orchestrator.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                execute_single_request(&orchestrator, request).await
            }));
        }

        for handle in handles {
            let result = handle.await?;
            if result.status == RequestStatus::Success {
                succeeded.insert(result.request_id.clone());
            } else {
                unsuccessful.insert(result.request_id.clone());
                if config.settings.fail_fast && abort.is_none() {
                    error!("Failing fast after request {}", result.request_id);
                    abort = Some(format!("Failed fast on request: {}", result.request_id));
                }
            }
            results.push(result);
        }
    }

    let count = |status: RequestStatus| results.iter().filter(|r| r.status == status).count();
    let successful = count(RequestStatus::Success);
    let skipped_count = count(RequestStatus::Skipped);
    let failed = total_requests - successful - skipped_count;

    let status = if failed == 0 && skipped_count == 0 {
        BatchStatus::Success
    } else if successful > 0 && abort.is_none() {
        BatchStatus::PartialSuccess
    } else {
        BatchStatus::Failed
    };

    Ok(BatchResult {
        job_name: config.job.name,
        status,
        total_requests,
        successful,
        failed,
        skipped: skipped_count,
        total_duration_ms: start_time.elapsed().as_millis() as u64,
        results,
        error: abort,
    })
}

fn skipped(request_id: String) -> RequestResult {
    RequestResult {
        request_id,
        status: RequestStatus::Skipped,
        agent_kind: None,
        task_type: None,
        output: None,
        error: Some("dependency did not succeed".to_string()),
        duration_ms: 0,
        retries_used: 0,
    }
}

/// Submit one request, resubmitting after retryable failures.
async fn execute_single_request(orchestrator: &Orchestrator, request: RequestConfig) -> RequestResult {
    let start_time = Instant::now();
    let mut retries_used = 0;

    loop {
        info!("Submitting request {} (attempt {})", request.id, retries_used + 1);

        let mut context = SubmitContext::default()
            .with_priority(request.priority)
            .with_deadline(
                chrono::Utc::now()
                    + chrono::Duration::seconds(request.settings.timeout_seconds as i64),
            );
        context.metadata = request.metadata.clone();

        let outcome = match orchestrator.submit(request.text.clone(), context) {
            Ok(task_id) => orchestrator
                .wait(task_id)
                .await
                .map(|status| (Some(task_id), status)),
            Err(e) => Ok((None, TaskStatus::failed(&e))),
        };

        let (task_id, status) = match outcome {
            Ok(pair) => pair,
            Err(e) => (None, TaskStatus::failed(&e)),
        };
        let decision = task_id.and_then(|id| orchestrator.routing_decision(id));

        let mut result = RequestResult {
            request_id: request.id.clone(),
            status: RequestStatus::Failed,
            agent_kind: decision.as_ref().map(|d| d.agent_kind.clone()),
            task_type: decision.as_ref().map(|d| d.task_type.to_string()),
            output: None,
            error: None,
            duration_ms: 0,
            retries_used,
        };

        match status {
            TaskStatus::Completed { result: output } => {
                info!("Request {} completed", request.id);
                result.status = RequestStatus::Success;
                result.output = Some(output);
            }
            TaskStatus::Failed { kind, reason } => {
                let retryable = matches!(kind, ErrorKind::Admission | ErrorKind::BudgetExceeded);
                if retryable && retries_used < request.settings.retries {
                    retries_used += 1;
                    warn!("Retrying request {} after {}: {}", request.id, kind, reason);
                    continue;
                }
                warn!("Request {} failed ({}): {}", request.id, kind, reason);
                result.status = if kind == ErrorKind::Cancellation {
                    RequestStatus::Timeout
                } else {
                    RequestStatus::Failed
                };
                result.error = Some(reason);
            }
            other => {
                let e = OrchestratorError::Internal(format!("non-terminal status {:?}", other));
                result.error = Some(e.to_string());
            }
        }

        result.duration_ms = start_time.elapsed().as_millis() as u64;
        return result;
    }
}

fn print_batch_summary(result: &BatchResult) {
    println!("\n=== Batch Execution Summary ===");
    println!("Job: {}", result.job_name);
    println!("Status: {:?}", result.status);
    println!("Total Requests: {}", result.total_requests);
    println!("Successful: {}", result.successful);
    println!("Failed: {}", result.failed);
    println!("Skipped: {}", result.skipped);
    println!("Duration: {}ms", result.total_duration_ms);

    for r in &result.results {
        match r.status {
            RequestStatus::Success => println!(
                "  + {} -> {} [{}]",
                r.request_id,
                r.agent_kind.as_deref().unwrap_or("?"),
                r.task_type.as_deref().unwrap_or("?")
            ),
            _ => println!(
                "  - {} ({:?}): {}",
                r.request_id,
                r.status,
                r.error.as_deref().unwrap_or("unknown error")
            ),
        }
    }
    println!("===============================\n");
}

fn save_batch_results(result: &BatchResult, output_file: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(result).context("Failed to serialize batch results")?;
    std::fs::write(output_file, json)
        .with_context(|| format!("Failed to write results to: {:?}", output_file))?;
    info!("Batch results saved to: {:?}", output_file);
    Ok(())
}

fn default_request_timeout() -> u64 {
    30
}

fn default_max_concurrent() -> usize {
    4
}
