/*!
Fact log back-ends:

* **InMemoryFactStore** – process-local log (dev/testing, or when loss on restart is fine).
* **SledFactStore** – embedded durable log; survives restarts together with the
  consolidation cursor.

Facts are never deleted. `update` only rewrites the mutable fields of an existing fact
(state, superseded-by) in place.

Both back-ends also hold the extraction job queue, so completed task output waiting
to be turned into facts is kept for as long as the facts themselves are.
*/
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::Transactional;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::{debug, info, instrument};

use super::{normalize_key, ExtractionJob, MemoryFact};
use crate::error::{OrchestratorError, Result};

#[async_trait]
pub trait FactStore: Send + Sync {
    /// Append a fact, assigning its sequence number. Returns `None` when a fact with
    /// the same id is already stored.
    async fn append(&self, fact: MemoryFact) -> Result<Option<u64>>;

    /// Persist new state/supersession of a stored fact.
    async fn update(&self, fact: &MemoryFact) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<MemoryFact>>;

    /// Up to `limit` facts with sequence greater than `after`, in sequence order.
    async fn since(&self, after: u64, limit: usize) -> Result<Vec<MemoryFact>>;

    async fn by_subject(&self, subject: &str) -> Result<Vec<MemoryFact>>;

    async fn by_tag(&self, tag: &str) -> Result<Vec<MemoryFact>>;

    /// Last sequence number consolidation has fully processed.
    async fn load_cursor(&self) -> Result<u64>;

    async fn save_cursor(&self, seq: u64) -> Result<()>;

    async fn len(&self) -> Result<usize>;

    /// Queue output for extraction. The job is stored before this returns; the
    /// returned key orders it after every earlier job.
    async fn enqueue_job(&self, job: &ExtractionJob) -> Result<u64>;

    /// Drop a job once all of its facts are appended.
    async fn complete_job(&self, key: u64) -> Result<()>;

    /// Up to `limit` queued jobs, oldest first.
    async fn pending_jobs(&self, limit: usize) -> Result<Vec<(u64, ExtractionJob)>>;

    async fn job_count(&self) -> Result<usize>;

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct Log {
    facts: BTreeMap<u64, MemoryFact>,
    ids: HashMap<String, u64>,
    next_seq: u64,
    cursor: u64,
    jobs: BTreeMap<u64, ExtractionJob>,
    next_job: u64,
}

#[derive(Default)]
pub struct InMemoryFactStore {
    log: RwLock<Log>,
}

impl InMemoryFactStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FactStore for InMemoryFactStore {
    async fn append(&self, mut fact: MemoryFact) -> Result<Option<u64>> {
        let mut log = self.log.write();
        if log.ids.contains_key(&fact.id) {
            return Ok(None);
        }
        log.next_seq += 1;
        let seq = log.next_seq;
        fact.seq = seq;
        log.ids.insert(fact.id.clone(), seq);
        log.facts.insert(seq, fact);
        Ok(Some(seq))
    }

    async fn update(&self, fact: &MemoryFact) -> Result<()> {
        let mut log = self.log.write();
        let seq = *log
            .ids
            .get(&fact.id)
            .ok_or_else(|| OrchestratorError::Storage(format!("unknown fact '{}'", fact.id)))?;
        if let Some(stored) = log.facts.get_mut(&seq) {
            stored.state = fact.state;
            stored.superseded_by = fact.superseded_by.clone();
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<MemoryFact>> {
        let log = self.log.read();
        Ok(log.ids.get(id).and_then(|seq| log.facts.get(seq)).cloned())
    }

    async fn since(&self, after: u64, limit: usize) -> Result<Vec<MemoryFact>> {
        let log = self.log.read();
        Ok(log
            .facts
            .range(after.saturating_add(1)..)
            .take(limit)
            .map(|(_, f)| f.clone())
            .collect())
    }

    async fn by_subject(&self, subject: &str) -> Result<Vec<MemoryFact>> {
        let wanted = normalize_key(subject);
        let log = self.log.read();
        Ok(log
            .facts
            .values()
            .filter(|f| f.content.subject().map(normalize_key).as_deref() == Some(wanted.as_str()))
            .cloned()
            .collect())
    }

    async fn by_tag(&self, tag: &str) -> Result<Vec<MemoryFact>> {
        let wanted = normalize_key(tag);
        let log = self.log.read();
        Ok(log
            .facts
            .values()
            .filter(|f| f.tags.iter().any(|t| normalize_key(t) == wanted))
            .cloned()
            .collect())
    }

    async fn load_cursor(&self) -> Result<u64> {
        Ok(self.log.read().cursor)
    }

    async fn save_cursor(&self, seq: u64) -> Result<()> {
        self.log.write().cursor = seq;
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.log.read().facts.len())
    }

    async fn enqueue_job(&self, job: &ExtractionJob) -> Result<u64> {
        let mut log = self.log.write();
        log.next_job += 1;
        let key = log.next_job;
        log.jobs.insert(key, job.clone());
        Ok(key)
    }

    async fn complete_job(&self, key: u64) -> Result<()> {
        self.log.write().jobs.remove(&key);
        Ok(())
    }

    async fn pending_jobs(&self, limit: usize) -> Result<Vec<(u64, ExtractionJob)>> {
        let log = self.log.read();
        Ok(log
            .jobs
            .iter()
            .take(limit)
            .map(|(k, j)| (*k, j.clone()))
            .collect())
    }

    async fn job_count(&self) -> Result<usize> {
        Ok(self.log.read().jobs.len())
    }
}

const CURSOR_KEY: &[u8] = b"consolidation_cursor";

/// Sled-backed log. Trees: `facts` (seq → fact), `ids` (id → seq), `subjects` and
/// `tags` (normalized key, 0x00, seq → empty), `jobs` (key → extraction job) and `meta`.
///
/// Appends are serialized, so a fact with a lower sequence number is always visible
/// before one with a higher number and the consolidation cursor never passes a fact
/// that has yet to commit.
pub struct SledFactStore {
    db: sled::Db,
    facts: sled::Tree,
    ids: sled::Tree,
    subjects: sled::Tree,
    tags: sled::Tree,
    jobs: sled::Tree,
    meta: sled::Tree,
    append_lock: Mutex<()>,
}

fn index_key(key: &str, seq: u64) -> Vec<u8> {
    let mut k = normalize_key(key).into_bytes();
    k.push(0);
    k.extend_from_slice(&seq.to_be_bytes());
    k
}

fn index_prefix(key: &str) -> Vec<u8> {
    let mut k = normalize_key(key).into_bytes();
    k.push(0);
    k
}

fn decode_seq(bytes: &[u8]) -> Result<u64> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| OrchestratorError::Storage("corrupt sequence number".to_string()))?;
    Ok(u64::from_be_bytes(raw))
}

impl SledFactStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path.as_ref())?;
        let store = Self {
            facts: db.open_tree("facts")?,
            ids: db.open_tree("ids")?,
            subjects: db.open_tree("subjects")?,
            tags: db.open_tree("tags")?,
            jobs: db.open_tree("jobs")?,
            meta: db.open_tree("meta")?,
            append_lock: Mutex::new(()),
            db,
        };
        info!(
            "Opened fact store at {} ({} facts, {} queued extraction jobs)",
            path.as_ref().display(),
            store.facts.len(),
            store.jobs.len()
        );
        Ok(store)
    }

    fn decode(bytes: &[u8]) -> Result<MemoryFact> {
        Ok(bincode::deserialize(bytes)?)
    }

    fn by_index(&self, tree: &sled::Tree, key: &str) -> Result<Vec<MemoryFact>> {
        let mut out = Vec::new();
        for entry in tree.scan_prefix(index_prefix(key)) {
            let (k, _) = entry?;
            let seq_bytes = &k[k.len().saturating_sub(8)..];
            if let Some(bytes) = self.facts.get(seq_bytes)? {
                out.push(Self::decode(&bytes)?);
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl FactStore for SledFactStore {
    #[instrument(skip(self, fact), fields(fact_id = %fact.id))]
    async fn append(&self, fact: MemoryFact) -> Result<Option<u64>> {
        if self.ids.contains_key(fact.id.as_bytes())? {
            return Ok(None);
        }

        let _serial = self.append_lock.lock();
        let outcome: std::result::Result<Option<u64>, TransactionError<String>> =
            (&self.facts, &self.ids, &self.subjects, &self.tags).transaction(
                |(facts, ids, subjects, tags)| {
                    if ids.get(fact.id.as_bytes())?.is_some() {
                        return Ok(None);
                    }
                    // generate_id starts at 0; sequence numbers start at 1
                    let seq = facts.generate_id()? + 1;
                    let seq_key = seq.to_be_bytes();
                    let stored = MemoryFact { seq, ..fact.clone() };
                    let encoded = bincode::serialize(&stored)
                        .map_err(|e| ConflictableTransactionError::Abort(e.to_string()))?;

                    ids.insert(fact.id.as_bytes(), &seq_key[..])?;
                    facts.insert(&seq_key[..], encoded)?;
                    if let Some(subject) = fact.content.subject() {
                        subjects.insert(index_key(subject, seq), &b""[..])?;
                    }
                    for tag in &fact.tags {
                        tags.insert(index_key(tag, seq), &b""[..])?;
                    }
                    Ok(Some(seq))
                },
            );

        match outcome {
            Ok(Some(seq)) => {
                debug!("Appended fact at seq {}", seq);
                Ok(Some(seq))
            }
            Ok(None) => Ok(None),
            Err(TransactionError::Storage(e)) => Err(e.into()),
            Err(TransactionError::Abort(reason)) => Err(OrchestratorError::Storage(format!(
                "fact append aborted: {}",
                reason
            ))),
        }
    }

    async fn update(&self, fact: &MemoryFact) -> Result<()> {
        let seq_bytes = self
            .ids
            .get(fact.id.as_bytes())?
            .ok_or_else(|| OrchestratorError::Storage(format!("unknown fact '{}'", fact.id)))?;
        let Some(bytes) = self.facts.get(&seq_bytes)? else {
            return Err(OrchestratorError::Storage(format!(
                "fact '{}' missing from log",
                fact.id
            )));
        };
        let mut stored = Self::decode(&bytes)?;
        stored.state = fact.state;
        stored.superseded_by = fact.superseded_by.clone();
        self.facts.insert(seq_bytes, bincode::serialize(&stored)?)?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<MemoryFact>> {
        let Some(seq_bytes) = self.ids.get(id.as_bytes())? else {
            return Ok(None);
        };
        match self.facts.get(seq_bytes)? {
            Some(bytes) => Ok(Some(Self::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn since(&self, after: u64, limit: usize) -> Result<Vec<MemoryFact>> {
        let start = after.saturating_add(1).to_be_bytes();
        let mut out = Vec::new();
        for entry in self.facts.range(start..).take(limit) {
            let (_, bytes) = entry?;
            out.push(Self::decode(&bytes)?);
        }
        Ok(out)
    }

    async fn by_subject(&self, subject: &str) -> Result<Vec<MemoryFact>> {
        self.by_index(&self.subjects, subject)
    }

    async fn by_tag(&self, tag: &str) -> Result<Vec<MemoryFact>> {
        self.by_index(&self.tags, tag)
    }

    async fn load_cursor(&self) -> Result<u64> {
        match self.meta.get(CURSOR_KEY)? {
            Some(bytes) => decode_seq(&bytes),
            None => Ok(0),
        }
    }

    async fn save_cursor(&self, seq: u64) -> Result<()> {
        self.meta.insert(CURSOR_KEY, seq.to_be_bytes().to_vec())?;
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.facts.len())
    }

    async fn enqueue_job(&self, job: &ExtractionJob) -> Result<u64> {
        let key = self.db.generate_id()?;
        self.jobs.insert(&key.to_be_bytes()[..], bincode::serialize(job)?)?;
        self.jobs.flush_async().await?;
        Ok(key)
    }

    async fn complete_job(&self, key: u64) -> Result<()> {
        self.jobs.remove(key.to_be_bytes())?;
        Ok(())
    }

    async fn pending_jobs(&self, limit: usize) -> Result<Vec<(u64, ExtractionJob)>> {
        let mut out = Vec::new();
        for entry in self.jobs.iter().take(limit) {
            let (k, bytes) = entry?;
            out.push((decode_seq(&k)?, bincode::deserialize(&bytes)?));
        }
        Ok(out)
    }

    async fn job_count(&self) -> Result<usize> {
        Ok(self.jobs.len())
    }

    async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }
}
