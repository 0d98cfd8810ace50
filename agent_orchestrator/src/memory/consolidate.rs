//! Consolidation worker: activates extracted facts and supersedes conflicting ones.

use serde::Serialize;
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use super::{normalize_key, FactState, FactStore, MemoryFact};
use crate::error::Result;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsolidationReport {
    pub scanned: usize,
    pub activated: usize,
    pub superseded: usize,
    pub cursor: u64,
}

impl ConsolidationReport {
    fn absorb(&mut self, other: ConsolidationReport) {
        self.scanned += other.scanned;
        self.activated += other.activated;
        self.superseded += other.superseded;
        self.cursor = other.cursor;
    }
}

/// Conflict winner: most recent, then most important, then greatest id.
fn newer(a: &MemoryFact, b: &MemoryFact) -> Ordering {
    a.extracted_at
        .cmp(&b.extracted_at)
        .then(a.importance.cmp(&b.importance))
        .then_with(|| a.id.cmp(&b.id))
}

fn same_value(a: &MemoryFact, b: &MemoryFact) -> bool {
    match (a.content.value(), b.content.value()) {
        (Some(x), Some(y)) => normalize_key(x) == normalize_key(y),
        _ => false,
    }
}

pub struct Consolidator {
    store: Arc<dyn FactStore>,
    batch_size: usize,
    // single writer: timer, wake-ups and manual runs never interleave
    running: Mutex<()>,
}

impl Consolidator {
    pub fn new(store: Arc<dyn FactStore>, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
            running: Mutex::new(()),
        }
    }

    /// Process one batch after the persisted cursor.
    pub async fn run_once(&self) -> Result<ConsolidationReport> {
        let _running = self.running.lock().await;
        let cursor = self.store.load_cursor().await?;
        self.run_batch(cursor).await
    }

    /// Process batches until the cursor reaches the end of the log.
    pub async fn run_until_idle(&self) -> Result<ConsolidationReport> {
        let _running = self.running.lock().await;
        let mut cursor = self.store.load_cursor().await?;
        self.drain_from(&mut cursor).await
    }

    /// Replay the whole log from the start, e.g. after a crash or to verify results.
    #[instrument(skip(self))]
    pub async fn reconsolidate_all(&self) -> Result<ConsolidationReport> {
        let _running = self.running.lock().await;
        self.store.save_cursor(0).await?;
        let mut cursor = 0;
        let report = self.drain_from(&mut cursor).await?;
        info!(
            "Reconsolidated {} facts ({} superseded)",
            report.scanned, report.superseded
        );
        Ok(report)
    }

    async fn drain_from(&self, cursor: &mut u64) -> Result<ConsolidationReport> {
        let mut total = ConsolidationReport {
            cursor: *cursor,
            ..Default::default()
        };
        loop {
            let report = self.run_batch(*cursor).await?;
            if report.scanned == 0 {
                return Ok(total);
            }
            *cursor = report.cursor;
            total.absorb(report);
        }
    }

    async fn run_batch(&self, cursor: u64) -> Result<ConsolidationReport> {
        let batch = self.store.since(cursor, self.batch_size).await?;
        let mut report = ConsolidationReport {
            cursor,
            ..Default::default()
        };

        for fact in batch {
            let seq = fact.seq;
            self.consolidate(&fact.id, &mut report).await?;
            report.scanned += 1;
            // advance only past fully processed facts
            self.store.save_cursor(seq).await?;
            report.cursor = seq;
        }

        if report.scanned > 0 {
            debug!(
                "Consolidated {} fact(s): {} activated, {} superseded, cursor {}",
                report.scanned, report.activated, report.superseded, report.cursor
            );
        }
        Ok(report)
    }

    async fn consolidate(&self, id: &str, report: &mut ConsolidationReport) -> Result<()> {
        // re-read: an earlier fact in this batch may already have superseded it
        let Some(fact) = self.store.get(id).await? else {
            return Ok(());
        };
        if fact.state == FactState::Superseded {
            return Ok(());
        }

        let Some((subject, predicate)) = fact.content.conflict_key() else {
            return self.activate(fact, report).await;
        };

        let group: Vec<MemoryFact> = self
            .store
            .by_subject(&subject)
            .await?
            .into_iter()
            .filter(|f| !f.is_superseded())
            .filter(|f| f.content.conflict_key().map(|(_, p)| p) == Some(predicate.clone()))
            .collect();

        let Some(winner) = group.iter().max_by(|a, b| newer(a, b)).cloned() else {
            return self.activate(fact, report).await;
        };

        for member in group {
            if member.id == winner.id || same_value(&member, &winner) {
                self.activate(member, report).await?;
            } else {
                debug!(
                    "Fact {} ({}/{}) superseded by {}",
                    member.id, subject, predicate, winner.id
                );
                let mut loser = member;
                loser.state = FactState::Superseded;
                loser.superseded_by = Some(winner.id.clone());
                self.store.update(&loser).await?;
                report.superseded += 1;
            }
        }
        Ok(())
    }

    async fn activate(&self, mut fact: MemoryFact, report: &mut ConsolidationReport) -> Result<()> {
        if fact.state == FactState::Extracted {
            fact.state = FactState::Active;
            self.store.update(&fact).await?;
            report.activated += 1;
        }
        Ok(())
    }

    /// Run on every tick and whenever `wake` fires, until `shutdown`.
    pub fn spawn(
        self: Arc<Self>,
        interval: Duration,
        wake: Arc<Notify>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                    _ = wake.notified() => {}
                }
                if let Err(e) = self.run_until_idle().await {
                    error!("Consolidation pass failed: {}", e);
                }
            }
            debug!("Consolidation worker stopped");
        })
    }
}
