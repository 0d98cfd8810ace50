//! Pooled agent instances and their atomic lifecycle state.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use uuid::Uuid;

use crate::agent::{Agent, AgentHealth};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum InstanceState {
    Idle = 0,
    Busy = 1,
    Draining = 2,
    Retired = 3,
}

impl InstanceState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => InstanceState::Idle,
            1 => InstanceState::Busy,
            2 => InstanceState::Draining,
            _ => InstanceState::Retired,
        }
    }
}

pub struct PooledInstance {
    pub id: Uuid,
    pub kind: String,
    pub agent: Arc<dyn Agent>,
    state: AtomicU8,
    created_at: DateTime<Utc>,
    last_used: Mutex<Instant>,
    task_count: AtomicU64,
    consecutive_failures: AtomicU32,
}

impl PooledInstance {
    /// New instances start Busy: they are created for the acquirer that asked.
    pub(crate) fn new_busy(kind: &str, agent: Arc<dyn Agent>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: kind.to_string(),
            agent,
            state: AtomicU8::new(InstanceState::Busy as u8),
            created_at: Utc::now(),
            last_used: Mutex::new(Instant::now()),
            task_count: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    pub fn state(&self) -> InstanceState {
        InstanceState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Atomic state change; fails if another party moved the instance first.
    pub(crate) fn transition(&self, from: InstanceState, to: InstanceState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn set_state(&self, to: InstanceState) {
        self.state.store(to as u8, Ordering::Release);
    }

    pub(crate) fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> std::time::Duration {
        self.last_used.lock().elapsed()
    }

    /// Count a finished task; returns the consecutive failure count afterwards.
    pub(crate) fn record_outcome(&self, success: bool) -> u32 {
        self.task_count.fetch_add(1, Ordering::Relaxed);
        if success {
            self.consecutive_failures.store(0, Ordering::Relaxed);
            0
        } else {
            self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1
        }
    }

    pub fn task_count(&self) -> u64 {
        self.task_count.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> InstanceSnapshot {
        InstanceSnapshot {
            id: self.id,
            kind: self.kind.clone(),
            agent: self.agent.name().to_string(),
            state: self.state(),
            created_at: self.created_at,
            idle_for_ms: self.idle_for().as_millis() as u64,
            task_count: self.task_count(),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            health: self.agent.health(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceSnapshot {
    pub id: Uuid,
    pub kind: String,
    pub agent: String,
    pub state: InstanceState,
    pub created_at: DateTime<Utc>,
    pub idle_for_ms: u64,
    pub task_count: u64,
    pub consecutive_failures: u32,
    pub health: AgentHealth,
}
