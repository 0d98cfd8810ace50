//! Process-wide spend budget per time window.

use parking_lot::Mutex;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{OrchestratorError, Result};

#[derive(Debug)]
struct Window {
    started: Instant,
    spent: f64,
    generation: u64,
}

/// Spend counter reset on window rollover. All reads and writes are a single
/// critical section so concurrent reservations never lose updates.
#[derive(Debug)]
pub struct Budget {
    limit: f64,
    window: Duration,
    state: Mutex<Window>,
}

/// Cost held against the budget until the call settles.
#[derive(Debug)]
#[must_use = "a reservation must be settled or refunded"]
pub struct Reservation {
    amount: f64,
    generation: u64,
}

impl Reservation {
    pub fn amount(&self) -> f64 {
        self.amount
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BudgetSnapshot {
    pub limit: f64,
    pub spent: f64,
    pub remaining: f64,
    pub window_secs: u64,
    pub generation: u64,
}

impl Budget {
    pub fn new(limit: f64, window: Duration) -> Self {
        Self {
            limit: limit.max(0.0),
            window,
            state: Mutex::new(Window {
                started: Instant::now(),
                spent: 0.0,
                generation: 0,
            }),
        }
    }

    fn roll(&self, w: &mut Window) {
        let elapsed = w.started.elapsed();
        if elapsed >= self.window {
            let windows = (elapsed.as_nanos() / self.window.as_nanos().max(1)) as u32;
            w.started += self.window * windows;
            w.spent = 0.0;
            w.generation += 1;
            debug!("Budget window rolled over (generation {})", w.generation);
        }
    }

    /// Reserve `amount` or fail without touching the counter.
    pub fn reserve(&self, amount: f64) -> Result<Reservation> {
        let amount = amount.max(0.0);
        let mut w = self.state.lock();
        self.roll(&mut w);

        let remaining = self.limit - w.spent;
        if amount > remaining + f64::EPSILON {
            return Err(OrchestratorError::budget(format!(
                "reservation of {:.4} exceeds remaining window budget {:.4}",
                amount, remaining
            )));
        }
        w.spent = (w.spent + amount).min(self.limit);
        Ok(Reservation {
            amount,
            generation: w.generation,
        })
    }

    /// Reconcile a reservation against the actual cost of the call.
    pub fn settle(&self, reservation: Reservation, actual: f64) {
        let actual = actual.max(0.0);
        let mut w = self.state.lock();
        self.roll(&mut w);
        if w.generation != reservation.generation {
            // the window the reservation was charged to is gone
            return;
        }

        let delta = actual - reservation.amount;
        if delta <= 0.0 {
            w.spent = (w.spent + delta).max(0.0);
        } else {
            let remaining = self.limit - w.spent;
            if delta > remaining {
                warn!(
                    "Call overran its reservation by {:.4}; charging only the {:.4} remaining",
                    delta, remaining
                );
            }
            w.spent = (w.spent + delta.min(remaining)).min(self.limit);
        }
    }

    /// Return the whole reservation, e.g. after a failed call.
    pub fn refund(&self, reservation: Reservation) {
        self.settle(reservation, 0.0);
    }

    pub fn remaining(&self) -> f64 {
        let mut w = self.state.lock();
        self.roll(&mut w);
        (self.limit - w.spent).max(0.0)
    }

    pub fn snapshot(&self) -> BudgetSnapshot {
        let mut w = self.state.lock();
        self.roll(&mut w);
        BudgetSnapshot {
            limit: self.limit,
            spent: w.spent,
            remaining: (self.limit - w.spent).max(0.0),
            window_secs: self.window.as_secs(),
            generation: w.generation,
        }
    }
}
