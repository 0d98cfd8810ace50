//! Bounded per-kind agent pools with FIFO admission, lazy scale-up and idle eviction.

pub mod instance;

pub use instance::{InstanceSnapshot, InstanceState, PooledInstance};

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::agent::{Agent, AgentFactory};
use crate::error::OrchestratorError;
use crate::registry::{AgentKind, CapabilityRegistry};
use crate::settings::PoolConfig;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AcquireError {
    /// Non-waiting acquisition found no free capacity.
    #[error("pool for '{0}' is exhausted")]
    Blocked(String),
    #[error("{0}")]
    Rejected(String),
    #[error("unknown agent kind '{0}'")]
    UnknownKind(String),
}

impl From<AcquireError> for OrchestratorError {
    fn from(err: AcquireError) -> Self {
        match err {
            AcquireError::UnknownKind(kind) => {
                OrchestratorError::no_capable_agent(format!("agent kind '{}' is not registered", kind))
            }
            other => OrchestratorError::admission(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Success,
    Failure,
    /// Retire the instance regardless of its failure count.
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub kind: String,
    pub max_instances: usize,
    pub live: usize,
    pub idle: usize,
    pub busy: usize,
    pub constructing: usize,
    pub waiting: usize,
    pub created: u64,
    pub retired: u64,
    pub rejected: u64,
    pub draining: bool,
}

enum Grant {
    Instance(Arc<PooledInstance>),
    /// Permission to construct one new instance; capacity is already counted.
    Slot,
    Draining,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<Grant>,
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<Arc<PooledInstance>>,
    live: HashMap<Uuid, Arc<PooledInstance>>,
    constructing: usize,
    waiters: VecDeque<Waiter>,
    next_waiter: u64,
    draining: bool,
    created: u64,
    retired: u64,
    rejected: u64,
}

impl PoolState {
    fn occupied(&self) -> usize {
        self.live.len() + self.constructing
    }
}

enum Admission {
    Now(Grant),
    Queued(u64, oneshot::Receiver<Grant>),
}

struct KindPool {
    kind: Arc<AgentKind>,
    max_failures: u32,
    state: Mutex<PoolState>,
    drained: Notify,
}

impl KindPool {
    fn new(kind: Arc<AgentKind>, max_failures: u32) -> Self {
        Self {
            kind,
            max_failures,
            state: Mutex::new(PoolState::default()),
            drained: Notify::new(),
        }
    }

    fn admit(&self, st: &mut PoolState, can_wait: bool) -> Result<Admission, AcquireError> {
        if st.draining {
            st.rejected += 1;
            return Err(AcquireError::Rejected(format!("pool '{}' is draining", self.kind.name)));
        }

        // FIFO: nobody overtakes a queued waiter
        if st.waiters.is_empty() {
            while let Some(inst) = st.idle.pop_front() {
                if inst.transition(InstanceState::Idle, InstanceState::Busy) {
                    return Ok(Admission::Now(Grant::Instance(inst)));
                }
                // lost the race to the idle sweep, which cleans up `live` itself
            }
            if st.occupied() < self.kind.max_instances {
                st.constructing += 1;
                return Ok(Admission::Now(Grant::Slot));
            }
        }

        if !can_wait {
            return Err(AcquireError::Blocked(self.kind.name.clone()));
        }

        let (tx, rx) = oneshot::channel();
        let id = st.next_waiter;
        st.next_waiter += 1;
        st.waiters.push_back(Waiter { id, tx });
        Ok(Admission::Queued(id, rx))
    }

    /// Give a freed instance to the oldest waiter still listening, or park it idle.
    fn hand_off_instance(&self, st: &mut PoolState, inst: Arc<PooledInstance>) {
        inst.touch();
        while let Some(waiter) = st.waiters.pop_front() {
            if waiter.tx.send(Grant::Instance(inst.clone())).is_ok() {
                return;
            }
        }
        inst.set_state(InstanceState::Idle);
        st.idle.push_back(inst);
    }

    /// Give freed capacity to the oldest waiter still listening.
    fn hand_off_slot(&self, st: &mut PoolState) {
        if st.draining {
            return;
        }
        while st.occupied() < self.kind.max_instances {
            let Some(waiter) = st.waiters.pop_front() else {
                return;
            };
            st.constructing += 1;
            if waiter.tx.send(Grant::Slot).is_ok() {
                return;
            }
            st.constructing -= 1;
        }
    }

    fn retire(&self, st: &mut PoolState, inst: &PooledInstance) {
        inst.set_state(InstanceState::Retired);
        st.idle.retain(|i| i.id != inst.id);
        if st.live.remove(&inst.id).is_some() {
            st.retired += 1;
        }
    }

    fn notify_if_drained(&self, st: &PoolState) {
        if st.draining && st.occupied() == 0 {
            self.drained.notify_waiters();
        }
    }

    fn release(&self, inst: Arc<PooledInstance>, outcome: ReleaseOutcome) {
        let failures = inst.record_outcome(outcome == ReleaseOutcome::Success);
        let unhealthy = outcome == ReleaseOutcome::Unhealthy
            || (self.max_failures > 0 && failures >= self.max_failures);

        let mut st = self.state.lock();
        if unhealthy || st.draining {
            if unhealthy {
                info!(
                    "Retiring {} instance {} after {} consecutive failure(s)",
                    self.kind.name, inst.id, failures
                );
            }
            self.retire(&mut st, &inst);
            self.hand_off_slot(&mut st);
            self.notify_if_drained(&st);
        } else {
            self.hand_off_instance(&mut st, inst);
        }
    }

    /// Put back a grant that was delivered to an acquirer that stopped waiting.
    fn return_grant(&self, st: &mut PoolState, grant: Grant) {
        match grant {
            Grant::Instance(inst) => {
                if st.draining {
                    self.retire(st, &inst);
                    self.notify_if_drained(st);
                } else {
                    self.hand_off_instance(st, inst);
                }
            }
            Grant::Slot => {
                st.constructing -= 1;
                self.hand_off_slot(st);
                self.notify_if_drained(st);
            }
            Grant::Draining => {}
        }
    }

    fn stats(&self) -> PoolStats {
        let st = self.state.lock();
        PoolStats {
            kind: self.kind.name.clone(),
            max_instances: self.kind.max_instances,
            live: st.live.len(),
            idle: st.idle.len(),
            busy: st.live.len().saturating_sub(st.idle.len()),
            constructing: st.constructing,
            waiting: st.waiters.len(),
            created: st.created,
            retired: st.retired,
            rejected: st.rejected,
            draining: st.draining,
        }
    }
}

/// Removes a queued waiter, or returns its grant, if the acquirer stops waiting early.
struct WaitGuard<'a> {
    pool: &'a KindPool,
    id: u64,
    rx: oneshot::Receiver<Grant>,
    settled: bool,
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut st = self.pool.state.lock();
        if let Some(pos) = st.waiters.iter().position(|w| w.id == self.id) {
            st.waiters.remove(pos);
            return;
        }
        if let Ok(grant) = self.rx.try_recv() {
            self.pool.return_grant(&mut st, grant);
        }
    }
}

/// Rolls back a construction slot unless disarmed.
struct SlotGuard<'a> {
    pool: &'a KindPool,
    armed: bool,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut st = self.pool.state.lock();
            st.constructing -= 1;
            self.pool.hand_off_slot(&mut st);
            self.pool.notify_if_drained(&st);
        }
    }
}

/// Exclusive use of one Busy instance. Dropping without [`AgentLease::release`]
/// releases with [`ReleaseOutcome::Failure`].
pub struct AgentLease {
    pool: Arc<KindPool>,
    instance: Option<Arc<PooledInstance>>,
    agent: Arc<dyn Agent>,
    instance_id: Uuid,
}

impl AgentLease {
    fn new(pool: Arc<KindPool>, instance: Arc<PooledInstance>) -> Self {
        Self {
            agent: instance.agent.clone(),
            instance_id: instance.id,
            instance: Some(instance),
            pool,
        }
    }

    pub fn agent(&self) -> &Arc<dyn Agent> {
        &self.agent
    }

    pub fn kind(&self) -> &str {
        &self.pool.kind.name
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn release(mut self, outcome: ReleaseOutcome) {
        if let Some(inst) = self.instance.take() {
            self.pool.release(inst, outcome);
        }
    }
}

impl Drop for AgentLease {
    fn drop(&mut self) {
        if let Some(inst) = self.instance.take() {
            debug!("Lease on {} instance {} dropped unreleased", self.pool.kind.name, inst.id);
            self.pool.release(inst, ReleaseOutcome::Failure);
        }
    }
}

impl fmt::Debug for AgentLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentLease")
            .field("kind", &self.pool.kind.name)
            .field("instance_id", &self.instance_id)
            .finish()
    }
}

pub struct AgentPoolManager {
    registry: Arc<CapabilityRegistry>,
    factory: Arc<dyn AgentFactory>,
    pools: HashMap<String, Arc<KindPool>>,
    acquire_timeout: Duration,
    idle_ttl: Duration,
    sweep_interval: Duration,
}

impl AgentPoolManager {
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        factory: Arc<dyn AgentFactory>,
        config: &PoolConfig,
    ) -> Self {
        let pools = registry
            .kinds()
            .iter()
            .map(|k| {
                (
                    k.name.clone(),
                    Arc::new(KindPool::new(k.clone(), config.max_consecutive_failures)),
                )
            })
            .collect();

        Self {
            registry,
            factory,
            pools,
            acquire_timeout: Duration::from_millis(config.acquire_timeout_ms),
            idle_ttl: Duration::from_secs(config.idle_ttl_secs),
            sweep_interval: Duration::from_secs(config.sweep_interval_secs),
        }
    }

    pub fn acquire_timeout(&self) -> Duration {
        self.acquire_timeout
    }

    fn pool(&self, kind: &str) -> Result<&Arc<KindPool>, AcquireError> {
        self.pools
            .get(kind)
            .ok_or_else(|| AcquireError::UnknownKind(kind.to_string()))
    }

    /// Acquire with the configured timeout.
    pub async fn acquire(&self, kind: &str) -> Result<AgentLease, AcquireError> {
        self.acquire_inner(kind, Some(self.acquire_timeout)).await
    }

    pub async fn acquire_with_timeout(
        &self,
        kind: &str,
        timeout: Duration,
    ) -> Result<AgentLease, AcquireError> {
        self.acquire_inner(kind, Some(timeout)).await
    }

    /// Acquire only if an instance or spare capacity is available right now.
    pub async fn try_acquire(&self, kind: &str) -> Result<AgentLease, AcquireError> {
        self.acquire_inner(kind, None).await
    }

    async fn acquire_inner(
        &self,
        kind: &str,
        wait: Option<Duration>,
    ) -> Result<AgentLease, AcquireError> {
        let pool = self.pool(kind)?.clone();

        let admission = {
            let mut st = pool.state.lock();
            pool.admit(&mut st, wait.is_some())?
        };

        let grant = match admission {
            Admission::Now(grant) => grant,
            Admission::Queued(id, rx) => {
                let timeout = wait.unwrap_or_default();
                Self::wait_for_grant(&pool, id, rx, timeout).await?
            }
        };

        let instance = match grant {
            Grant::Instance(inst) => inst,
            Grant::Slot => self.construct(&pool).await?,
            Grant::Draining => {
                return Err(AcquireError::Rejected(format!(
                    "pool '{}' is draining",
                    pool.kind.name
                )))
            }
        };

        debug!("Leased {} instance {}", pool.kind.name, instance.id);
        Ok(AgentLease::new(pool, instance))
    }

    async fn wait_for_grant(
        pool: &KindPool,
        id: u64,
        rx: oneshot::Receiver<Grant>,
        timeout: Duration,
    ) -> Result<Grant, AcquireError> {
        let mut guard = WaitGuard {
            pool,
            id,
            rx,
            settled: false,
        };

        let timed_out = || {
            AcquireError::Rejected(format!(
                "timed out after {:?} waiting for a '{}' instance",
                timeout, pool.kind.name
            ))
        };

        match tokio::time::timeout(timeout, &mut guard.rx).await {
            Ok(Ok(grant)) => {
                guard.settled = true;
                Ok(grant)
            }
            Ok(Err(_)) => {
                guard.settled = true;
                Err(AcquireError::Rejected(format!("pool '{}' closed", pool.kind.name)))
            }
            Err(_) => {
                let mut st = pool.state.lock();
                if let Some(pos) = st.waiters.iter().position(|w| w.id == id) {
                    st.waiters.remove(pos);
                    st.rejected += 1;
                    guard.settled = true;
                    return Err(timed_out());
                }
                drop(st);
                // a grant raced the timeout; take it rather than bounce it
                guard.settled = true;
                guard.rx.try_recv().map_err(|_| timed_out())
            }
        }
    }

    async fn construct(&self, pool: &KindPool) -> Result<Arc<PooledInstance>, AcquireError> {
        let mut slot = SlotGuard { pool, armed: true };

        match self.factory.create(&pool.kind).await {
            Ok(agent) => {
                let inst = Arc::new(PooledInstance::new_busy(&pool.kind.name, agent));
                let mut st = pool.state.lock();
                slot.armed = false;
                st.constructing -= 1;
                st.live.insert(inst.id, inst.clone());
                st.created += 1;
                info!(
                    "Created {} instance {} ({}/{})",
                    pool.kind.name,
                    inst.id,
                    st.live.len(),
                    pool.kind.max_instances
                );
                Ok(inst)
            }
            Err(e) => {
                drop(slot);
                pool.state.lock().rejected += 1;
                warn!("Failed to construct {} instance: {}", pool.kind.name, e);
                Err(AcquireError::Rejected(format!(
                    "failed to construct '{}' instance: {}",
                    pool.kind.name, e
                )))
            }
        }
    }

    /// Stop admitting, reject queued waiters, retire idle instances and wait for busy
    /// ones to come back.
    #[instrument(skip(self))]
    pub async fn drain(&self, kind: &str) -> Result<(), AcquireError> {
        let pool = self.pool(kind)?.clone();

        {
            let mut st = pool.state.lock();
            if !st.draining {
                info!("Draining pool '{}'", kind);
                st.draining = true;
            }
            for waiter in st.waiters.drain(..) {
                let _ = waiter.tx.send(Grant::Draining);
            }
            let idle: Vec<_> = st.idle.drain(..).collect();
            for inst in idle {
                // a concurrent sweep may have claimed it already; either way it leaves `live`
                inst.transition(InstanceState::Idle, InstanceState::Retired);
                pool.retire(&mut st, &inst);
            }
            for inst in st.live.values() {
                inst.transition(InstanceState::Busy, InstanceState::Draining);
            }
        }

        loop {
            let notified = pool.drained.notified();
            let remaining = pool.state.lock().occupied();
            if remaining == 0 {
                break;
            }
            notified.await;
        }

        debug!("Pool '{}' drained", kind);
        Ok(())
    }

    pub async fn drain_all(&self) {
        let kinds: Vec<String> = self.registry.kinds().iter().map(|k| k.name.clone()).collect();
        let drains = kinds.iter().map(|k| self.drain(k));
        for result in futures::future::join_all(drains).await {
            if let Err(e) = result {
                warn!("Drain failed: {}", e);
            }
        }
    }

    /// Retire instances idle longer than the TTL. Returns how many were retired.
    pub fn sweep_idle(&self) -> usize {
        let mut retired = 0;
        for pool in self.pools.values() {
            let idle: Vec<Arc<PooledInstance>> = pool.state.lock().idle.iter().cloned().collect();
            for inst in idle {
                if inst.idle_for() < self.idle_ttl {
                    continue;
                }
                if !inst.transition(InstanceState::Idle, InstanceState::Retired) {
                    continue;
                }
                let mut st = pool.state.lock();
                pool.retire(&mut st, &inst);
                pool.hand_off_slot(&mut st);
                pool.notify_if_drained(&st);
                retired += 1;
                debug!("Evicted idle {} instance {}", pool.kind.name, inst.id);
            }
        }
        if retired > 0 {
            info!("Idle sweep retired {} instance(s)", retired);
        }
        retired
    }

    pub fn spawn_sweeper(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.sweep_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        manager.sweep_idle();
                    }
                }
            }
            debug!("Idle sweeper stopped");
        })
    }

    pub fn stats(&self, kind: &str) -> Option<PoolStats> {
        self.pools.get(kind).map(|p| p.stats())
    }

    /// Stats for every kind, in registry order.
    pub fn all_stats(&self) -> Vec<PoolStats> {
        self.registry
            .kinds()
            .iter()
            .filter_map(|k| self.stats(&k.name))
            .collect()
    }

    pub fn instances(&self, kind: &str) -> Vec<InstanceSnapshot> {
        let Some(pool) = self.pools.get(kind) else {
            return Vec::new();
        };
        let live: Vec<Arc<PooledInstance>> = pool.state.lock().live.values().cloned().collect();
        let mut snapshots: Vec<InstanceSnapshot> = live.iter().map(|i| i.snapshot()).collect();
        snapshots.sort_by_key(|s| s.created_at);
        snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::DefaultAgentFactory;
    use crate::error::Result as OrchResult;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manager_with(kinds: Vec<AgentKind>, factory: Arc<dyn AgentFactory>) -> AgentPoolManager {
        let registry = Arc::new(CapabilityRegistry::new(kinds).unwrap());
        let config = PoolConfig {
            acquire_timeout_ms: 200,
            idle_ttl_secs: 300,
            sweep_interval_secs: 30,
            max_consecutive_failures: 2,
        };
        AgentPoolManager::new(registry, factory, &config)
    }

    fn manager(max: usize) -> AgentPoolManager {
        manager_with(
            vec![AgentKind::new("Worker", &["general"], max)],
            Arc::new(DefaultAgentFactory::new()),
        )
    }

    async fn wait_for_waiters(pool: &AgentPoolManager, n: usize) {
        while pool.stats("Worker").unwrap().waiting < n {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_lazy_scale_up_and_reuse() {
        let pool = manager(2);
        assert_eq!(pool.stats("Worker").unwrap().live, 0);

        let lease = pool.acquire("Worker").await.unwrap();
        let first = lease.instance_id();
        lease.release(ReleaseOutcome::Success);

        let again = pool.acquire("Worker").await.unwrap();
        assert_eq!(again.instance_id(), first);
        let stats = pool.stats("Worker").unwrap();
        assert_eq!(stats.created, 1);
        assert_eq!(stats.busy, 1);
    }

    #[tokio::test]
    async fn test_try_acquire_blocks_at_capacity() {
        let pool = manager(1);
        let _held = pool.try_acquire("Worker").await.unwrap();
        let err = pool.try_acquire("Worker").await.unwrap_err();
        assert_eq!(err, AcquireError::Blocked("Worker".to_string()));
        assert!(matches!(
            OrchestratorError::from(err),
            OrchestratorError::Admission { .. }
        ));
    }

    #[tokio::test]
    async fn test_unknown_kind() {
        let pool = manager(1);
        let err = pool.acquire("Nope").await.unwrap_err();
        assert_eq!(err, AcquireError::UnknownKind("Nope".to_string()));
    }

    #[tokio::test]
    async fn test_timeout_rejects_and_dequeues() {
        let pool = manager(1);
        let _held = pool.acquire("Worker").await.unwrap();
        let err = pool
            .acquire_with_timeout("Worker", Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, AcquireError::Rejected(ref r) if r.contains("timed out")));
        let stats = pool.stats("Worker").unwrap();
        assert_eq!(stats.waiting, 0);
        assert_eq!(stats.rejected, 1);
    }

    #[tokio::test]
    async fn test_waiters_served_in_fifo_order() {
        let pool = Arc::new(manager(1));
        let held = pool.acquire("Worker").await.unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let mut handles = Vec::new();
        for label in ["first", "second", "third"] {
            let pool_ref = pool.clone();
            let tx = tx.clone();
            let waiting_before = pool.stats("Worker").unwrap().waiting;
            handles.push(tokio::spawn(async move {
                let lease = pool_ref
                    .acquire_with_timeout("Worker", Duration::from_secs(5))
                    .await
                    .unwrap();
                tx.send(label).unwrap();
                lease.release(ReleaseOutcome::Success);
            }));
            wait_for_waiters(&pool, waiting_before + 1).await;
        }

        held.release(ReleaseOutcome::Success);
        for h in handles {
            h.await.unwrap();
        }
        let order: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(order, vec!["first", "second", "third"]);
        assert_eq!(pool.stats("Worker").unwrap().created, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hand_off_to_waiter_refreshes_last_used() {
        let pool = Arc::new(manager(1));
        let held = pool.acquire("Worker").await.unwrap();

        let pool_ref = pool.clone();
        let waiter = tokio::spawn(async move {
            pool_ref
                .acquire_with_timeout("Worker", Duration::from_secs(600))
                .await
                .unwrap()
        });
        wait_for_waiters(&pool, 1).await;

        tokio::time::advance(Duration::from_secs(400)).await;
        held.release(ReleaseOutcome::Success);
        let lease = waiter.await.unwrap();

        let snapshot = &pool.instances("Worker")[0];
        assert_eq!(snapshot.state, InstanceState::Busy);
        assert!(snapshot.idle_for_ms < 1_000, "idle for {}ms", snapshot.idle_for_ms);
        lease.release(ReleaseOutcome::Success);
        assert_eq!(pool.sweep_idle(), 0);
    }

    #[tokio::test]
    async fn test_unhealthy_instance_is_retired_and_replaced() {
        let pool = manager(1);
        let lease = pool.acquire("Worker").await.unwrap();
        let first = lease.instance_id();
        lease.release(ReleaseOutcome::Unhealthy);

        let stats = pool.stats("Worker").unwrap();
        assert_eq!(stats.live, 0);
        assert_eq!(stats.retired, 1);

        let next = pool.acquire("Worker").await.unwrap();
        assert_ne!(next.instance_id(), first);
    }

    #[tokio::test]
    async fn test_consecutive_failures_retire() {
        let pool = manager(1);
        let lease = pool.acquire("Worker").await.unwrap();
        let id = lease.instance_id();
        lease.release(ReleaseOutcome::Failure);

        let lease = pool.acquire("Worker").await.unwrap();
        assert_eq!(lease.instance_id(), id);
        lease.release(ReleaseOutcome::Failure);

        assert_eq!(pool.stats("Worker").unwrap().retired, 1);
    }

    #[tokio::test]
    async fn test_dropped_lease_is_released() {
        let pool = manager(1);
        {
            let _lease = pool.acquire("Worker").await.unwrap();
        }
        let stats = pool.stats("Worker").unwrap();
        assert_eq!(stats.busy, 0);
        assert_eq!(stats.idle, 1);
        assert!(pool.try_acquire("Worker").await.is_ok());
    }

    #[tokio::test]
    async fn test_released_instance_goes_straight_to_waiter() {
        let pool = Arc::new(manager(1));
        let held = pool.acquire("Worker").await.unwrap();
        let id = held.instance_id();

        let pool_ref = pool.clone();
        let waiter = tokio::spawn(async move {
            pool_ref
                .acquire_with_timeout("Worker", Duration::from_secs(5))
                .await
                .map(|l| l.instance_id())
        });
        wait_for_waiters(&pool, 1).await;

        held.release(ReleaseOutcome::Success);
        assert_eq!(waiter.await.unwrap().unwrap(), id);
    }

    struct GatedFactory {
        calls: AtomicUsize,
        gate: Notify,
        inner: DefaultAgentFactory,
    }

    #[async_trait]
    impl AgentFactory for GatedFactory {
        async fn create(&self, kind: &AgentKind) -> OrchResult<Arc<dyn Agent>> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                self.gate.notified().await;
                return Err(OrchestratorError::Internal("model not loaded".into()));
            }
            self.inner.create(kind).await
        }
    }

    #[tokio::test]
    async fn test_construction_failure_hands_capacity_to_next_waiter() {
        let factory = Arc::new(GatedFactory {
            calls: AtomicUsize::new(0),
            gate: Notify::new(),
            inner: DefaultAgentFactory::new(),
        });
        let pool = Arc::new(manager_with(
            vec![AgentKind::new("Worker", &["general"], 1)],
            factory.clone(),
        ));

        let p1 = pool.clone();
        let first = tokio::spawn(async move { p1.acquire_with_timeout("Worker", Duration::from_secs(5)).await.map(|_| ()) });
        while pool.stats("Worker").unwrap().constructing == 0 {
            tokio::task::yield_now().await;
        }

        let p2 = pool.clone();
        let second = tokio::spawn(async move {
            p2.acquire_with_timeout("Worker", Duration::from_secs(5))
                .await
                .map(|l| l.instance_id())
        });
        wait_for_waiters(&pool, 1).await;

        factory.gate.notify_one();
        assert!(matches!(first.await.unwrap(), Err(AcquireError::Rejected(_))));
        assert!(second.await.unwrap().is_ok());

        let stats = pool.stats("Worker").unwrap();
        assert_eq!(stats.created, 1);
        assert_eq!(stats.constructing, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_sweep_retires_expired_instances() {
        let pool = manager(2);
        let a = pool.acquire("Worker").await.unwrap();
        let b = pool.acquire("Worker").await.unwrap();
        a.release(ReleaseOutcome::Success);

        tokio::time::advance(Duration::from_secs(200)).await;
        b.release(ReleaseOutcome::Success);
        tokio::time::advance(Duration::from_secs(150)).await;

        assert_eq!(pool.sweep_idle(), 1);
        let stats = pool.stats("Worker").unwrap();
        assert_eq!(stats.live, 1);
        assert_eq!(stats.retired, 1);
        assert_eq!(pool.instances("Worker")[0].state, InstanceState::Idle);
    }

    #[tokio::test]
    async fn test_drain_rejects_new_work_and_waits_for_busy() {
        let pool = Arc::new(manager(2));
        let busy = pool.acquire("Worker").await.unwrap();
        let idle = pool.acquire("Worker").await.unwrap();
        idle.release(ReleaseOutcome::Success);

        let p = pool.clone();
        let drain = tokio::spawn(async move { p.drain("Worker").await });
        while !pool.stats("Worker").unwrap().draining {
            tokio::task::yield_now().await;
        }

        assert!(matches!(
            pool.try_acquire("Worker").await,
            Err(AcquireError::Rejected(_))
        ));
        assert_eq!(pool.instances("Worker")[0].state, InstanceState::Draining);
        assert!(!drain.is_finished());

        busy.release(ReleaseOutcome::Success);
        drain.await.unwrap().unwrap();

        let stats = pool.stats("Worker").unwrap();
        assert_eq!(stats.live, 0);
        assert_eq!(stats.retired, 2);
        // idempotent
        pool.drain("Worker").await.unwrap();
    }
}
