//! Two-phase fact memory: extraction appends to a sequence-numbered log, consolidation
//! later walks the log from a persisted cursor and resolves conflicting facts.

pub mod consolidate;
pub mod extract;
pub mod store;

pub use consolidate::{ConsolidationReport, Consolidator};
pub use extract::extract_facts;
pub use store::{FactStore, InMemoryFactStore, SledFactStore};

use backoff::{backoff::Backoff, ExponentialBackoff};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{OrchestratorError, Result};
use crate::settings::MemoryConfig;
use crate::task::TaskId;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Importance {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Importance {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Some(Importance::Low),
            "normal" => Some(Importance::Normal),
            "high" => Some(Importance::High),
            "critical" => Some(Importance::Critical),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FactState {
    Extracted,
    Active,
    Superseded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FactContent {
    Triple {
        subject: String,
        predicate: String,
        value: String,
    },
    Note {
        text: String,
    },
}

impl FactContent {
    pub fn subject(&self) -> Option<&str> {
        match self {
            FactContent::Triple { subject, .. } => Some(subject),
            FactContent::Note { .. } => None,
        }
    }

    /// Normalized (subject, predicate) pair that conflicting facts share.
    pub fn conflict_key(&self) -> Option<(String, String)> {
        match self {
            FactContent::Triple {
                subject, predicate, ..
            } => Some((normalize_key(subject), normalize_key(predicate))),
            FactContent::Note { .. } => None,
        }
    }

    pub fn value(&self) -> Option<&str> {
        match self {
            FactContent::Triple { value, .. } => Some(value),
            FactContent::Note { .. } => None,
        }
    }

    fn canonical(&self) -> String {
        match self {
            FactContent::Triple {
                subject,
                predicate,
                value,
            } => format!("triple\u{1f}{}\u{1f}{}\u{1f}{}", subject, predicate, value),
            FactContent::Note { text } => format!("note\u{1f}{}", text),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryFact {
    pub id: String,
    pub content: FactContent,
    pub source_task: TaskId,
    pub extracted_at: DateTime<Utc>,
    pub importance: Importance,
    pub tags: Vec<String>,
    /// Log position, assigned by the store on append.
    pub seq: u64,
    pub state: FactState,
    pub superseded_by: Option<String>,
}

impl MemoryFact {
    pub fn new(
        source_task: TaskId,
        position: usize,
        content: FactContent,
        extracted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: fact_id(&source_task, position, &content),
            content,
            source_task,
            extracted_at,
            importance: Importance::Normal,
            tags: Vec::new(),
            seq: 0,
            state: FactState::Extracted,
            superseded_by: None,
        }
    }

    pub fn with_importance(mut self, importance: Importance) -> Self {
        self.importance = importance;
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn is_superseded(&self) -> bool {
        self.state == FactState::Superseded
    }
}

/// Content-derived id, so redelivering the same task output yields the same facts.
fn fact_id(source_task: &TaskId, position: usize, content: &FactContent) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(source_task.as_bytes());
    hasher.update(&(position as u64).to_le_bytes());
    hasher.update(content.canonical().as_bytes());
    hasher.finalize().to_hex()[..24].to_string()
}

pub(crate) fn normalize_key(s: &str) -> String {
    s.trim().to_lowercase()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FactQuery {
    Subject(String),
    Tag(String),
}

/// Completed task output waiting to be turned into facts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionJob {
    pub task_id: TaskId,
    pub output: String,
    pub completed_at: DateTime<Utc>,
}

/// Jobs fetched from the store per extraction pass.
const JOB_BATCH: usize = 64;
/// Tries at storing one job's facts before the pass gives up on it.
const APPEND_ATTEMPTS: usize = 5;

fn append_backoff() -> ExponentialBackoff {
    let mut b = ExponentialBackoff {
        initial_interval: Duration::from_millis(50),
        max_interval: Duration::from_secs(2),
        max_elapsed_time: None,
        randomization_factor: 0.1,
        ..Default::default()
    };
    b.reset();
    b
}

/// Front door of the memory subsystem. Owns the extraction worker and the consolidator.
///
/// Extraction jobs live in the fact store until every fact they produce is appended,
/// so output accepted by [`MemoryPipeline::record_completion`] survives a crash and is
/// replayed when the workers next start.
pub struct MemoryPipeline {
    store: Arc<dyn FactStore>,
    consolidator: Arc<Consolidator>,
    started: AtomicBool,
    queued: Arc<Notify>,
    extracted: Arc<Notify>,
    wake: Arc<Notify>,
    /// Last extraction failure that outlasted its retries; cleared by a clean pass.
    stalled: Arc<Mutex<Option<String>>>,
    interval: Duration,
}

impl MemoryPipeline {
    pub fn new(store: Arc<dyn FactStore>, config: &MemoryConfig) -> Self {
        Self {
            consolidator: Arc::new(Consolidator::new(
                store.clone(),
                config.consolidation_batch_size,
            )),
            store,
            started: AtomicBool::new(false),
            queued: Arc::new(Notify::new()),
            extracted: Arc::new(Notify::new()),
            wake: Arc::new(Notify::new()),
            stalled: Arc::new(Mutex::new(None)),
            interval: Duration::from_secs(config.consolidation_interval_secs.max(1)),
        }
    }

    /// Open the store named by `config`.
    pub fn open_store(config: &MemoryConfig) -> Result<Arc<dyn FactStore>> {
        match (config.provider.as_str(), &config.path) {
            ("sled", Some(path)) => Ok(Arc::new(SledFactStore::open(path)?)),
            ("sled", None) => Err(OrchestratorError::Config(
                "sled memory provider requires a path".to_string(),
            )),
            _ => Ok(Arc::new(InMemoryFactStore::new())),
        }
    }

    pub fn store(&self) -> &Arc<dyn FactStore> {
        &self.store
    }

    pub fn consolidator(&self) -> &Arc<Consolidator> {
        &self.consolidator
    }

    /// Store a completed task's output for extraction. Returns once the job is queued.
    pub async fn record_completion(&self, task_id: TaskId, output: impl Into<String>) -> Result<()> {
        let job = ExtractionJob {
            task_id,
            output: output.into(),
            completed_at: Utc::now(),
        };
        let key = self.store.enqueue_job(&job).await?;
        debug!("Queued extraction job {} for task {}", key, task_id);
        self.queued.notify_one();
        Ok(())
    }

    /// Start the extraction and consolidation workers. Only the first call spawns.
    pub fn spawn_workers(&self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("Memory workers already running");
            return Vec::new();
        }

        let store = self.store.clone();
        let queued = self.queued.clone();
        let extracted = self.extracted.clone();
        let wake = self.wake.clone();
        let stalled = self.stalled.clone();
        let interval = self.interval;
        let token = shutdown.clone();

        let extraction = tokio::spawn(async move {
            match store.job_count().await {
                Ok(0) => {}
                Ok(n) => info!("Replaying {} queued extraction job(s)", n),
                Err(e) => error!("Cannot read extraction queue: {}", e),
            }

            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                match Self::drain(&store, &token).await {
                    Ok(done) => {
                        if done > 0 {
                            wake.notify_one();
                        }
                        *stalled.lock() = None;
                    }
                    Err(e) => {
                        error!("Extraction stalled: {}", e);
                        *stalled.lock() = Some(e.to_string());
                    }
                }
                extracted.notify_waiters();

                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = queued.notified() => {}
                    _ = ticker.tick() => {}
                }
            }

            // finish what was already queued before stopping
            if let Err(e) = Self::drain(&store, &token).await {
                warn!("Extraction jobs left queued at shutdown: {}", e);
            }
            extracted.notify_waiters();
            debug!("Extraction worker stopped");
        });

        let consolidation = self
            .consolidator
            .clone()
            .spawn(self.interval, self.wake.clone(), shutdown);

        info!("Memory workers started");
        vec![extraction, consolidation]
    }

    /// Process queued jobs oldest first until none are left. Stops at the first job
    /// that cannot be stored; it stays queued for the next pass.
    async fn drain(store: &Arc<dyn FactStore>, cancel: &CancellationToken) -> Result<usize> {
        let mut done = 0;
        loop {
            let jobs = store.pending_jobs(JOB_BATCH).await?;
            if jobs.is_empty() {
                return Ok(done);
            }
            for (key, job) in jobs {
                Self::process_with_retry(store, &job, cancel).await?;
                store.complete_job(key).await?;
                done += 1;
            }
        }
    }

    async fn process_with_retry(
        store: &Arc<dyn FactStore>,
        job: &ExtractionJob,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let mut backoff = append_backoff();
        let mut attempt = 1;
        loop {
            let err = match Self::process(store, job).await {
                Ok(appended) => return Ok(appended),
                Err(e) => e,
            };
            if attempt >= APPEND_ATTEMPTS {
                return Err(err);
            }
            let delay = backoff.next_backoff().unwrap_or(Duration::from_secs(2));
            warn!(
                "Storing facts from task {} failed (attempt {}/{}), retrying in {:?}: {}",
                job.task_id, attempt, APPEND_ATTEMPTS, delay, err
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(err),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    /// Append every fact in `job`. Facts stored by an earlier attempt are skipped by id.
    async fn process(store: &Arc<dyn FactStore>, job: &ExtractionJob) -> Result<usize> {
        let facts = extract_facts(job.task_id, &job.output, job.completed_at);
        let mut appended = 0;
        for fact in facts {
            if store.append(fact).await?.is_some() {
                appended += 1;
            }
        }
        if appended > 0 {
            debug!("Extracted {} new fact(s) from task {}", appended, job.task_id);
        }
        Ok(appended)
    }

    /// Wait until queued extractions are appended, then consolidate everything pending.
    /// Fails if extraction is stalled on a storage error.
    pub async fn flush(&self) -> Result<ConsolidationReport> {
        loop {
            let notified = self.extracted.notified();
            if let Some(reason) = self.stalled.lock().clone() {
                return Err(OrchestratorError::Storage(format!(
                    "fact extraction is stalled: {}",
                    reason
                )));
            }
            if self.store.job_count().await? == 0 {
                break;
            }
            notified.await;
        }
        let report = self.consolidator.run_until_idle().await?;
        self.store.flush().await?;
        Ok(report)
    }

    /// Facts matching `query`, ordered by extraction time then log sequence.
    #[instrument(skip(self))]
    pub async fn query(&self, query: &FactQuery, include_superseded: bool) -> Result<Vec<MemoryFact>> {
        let mut facts = match query {
            FactQuery::Subject(subject) => self.store.by_subject(subject).await?,
            FactQuery::Tag(tag) => self.store.by_tag(tag).await?,
        };
        if !include_superseded {
            facts.retain(|f| !f.is_superseded());
        }
        facts.sort_by(|a, b| a.extracted_at.cmp(&b.extracted_at).then(a.seq.cmp(&b.seq)));
        Ok(facts)
    }
}
