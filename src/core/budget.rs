//! Run-scoped LLM budget enforcement.
//!
//! Prevents runaway spend through two limits:
//! - Tokens per run (prompt + completion)
//! - Requests per minute (sliding 60s window)
//!
//! The tracker is the only mutable state shared between concurrent LLM
//! calls; counters are atomics so reservations never race.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::Mutex;

use crate::config::LlmConfig;

const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Budget limits for one run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetLimits {
    /// Maximum prompt + completion tokens (0 = unlimited)
    pub tokens_per_run: u64,

    /// Maximum requests started in any 60s window (0 = unlimited)
    pub requests_per_minute: u32,
}

impl From<&LlmConfig> for BudgetLimits {
    fn from(config: &LlmConfig) -> Self {
        Self {
            tokens_per_run: config.budgets.tokens_per_run,
            requests_per_minute: config.rate_limits.rpm,
        }
    }
}

/// Tokens held for an in-flight request
#[derive(Debug)]
#[must_use = "settle the reservation with the actual usage"]
pub struct Reservation {
    estimate: u64,
}

/// Tracks usage during a run
#[derive(Debug)]
pub struct BudgetTracker {
    limits: BudgetLimits,

    /// Settled usage plus outstanding reservations
    tokens_committed: AtomicU64,

    requests: AtomicU64,

    window: Mutex<VecDeque<Instant>>,
}

impl BudgetTracker {
    pub fn new(limits: BudgetLimits) -> Self {
        Self {
            limits,
            tokens_committed: AtomicU64::new(0),
            requests: AtomicU64::new(0),
            window: Mutex::new(VecDeque::new()),
        }
    }

    pub fn limits(&self) -> BudgetLimits {
        self.limits
    }

    /// Reserve an estimated token count before dispatching a request
    pub fn reserve(&self, estimate: u64) -> Result<Reservation, BudgetViolation> {
        let limit = self.limits.tokens_per_run;
        self.tokens_committed
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                let next = used.saturating_add(estimate);
                (limit == 0 || next <= limit).then_some(next)
            })
            .map(|_| Reservation { estimate })
            .map_err(|used| BudgetViolation::TokensExhausted {
                used,
                requested: estimate,
                limit,
            })
    }

    /// Replace a reservation with what the request actually used
    pub fn settle(&self, reservation: Reservation, actual: u64) {
        if actual >= reservation.estimate {
            self.tokens_committed
                .fetch_add(actual - reservation.estimate, Ordering::SeqCst);
        } else {
            self.tokens_committed
                .fetch_sub(reservation.estimate - actual, Ordering::SeqCst);
        }
        self.requests.fetch_add(1, Ordering::SeqCst);
    }

    /// Wait until a request slot is free in the rate window
    pub async fn acquire_request_slot(&self) {
        let rpm = self.limits.requests_per_minute as usize;
        if rpm == 0 {
            return;
        }

        loop {
            let wait = {
                let mut window = self.window.lock().await;
                let now = Instant::now();
                while window
                    .front()
                    .is_some_and(|t| now.duration_since(*t) >= RATE_WINDOW)
                {
                    window.pop_front();
                }
                if window.len() < rpm {
                    window.push_back(now);
                    return;
                }
                match window.front() {
                    Some(oldest) => RATE_WINDOW.saturating_sub(now.duration_since(*oldest)),
                    None => Duration::ZERO,
                }
            };
            tokio::time::sleep(wait).await;
        }
    }

    /// Tokens settled or reserved so far
    pub fn tokens_used(&self) -> u64 {
        self.tokens_committed.load(Ordering::SeqCst)
    }

    /// Completed requests
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::SeqCst)
    }
}

/// Budget violation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BudgetViolation {
    #[error("Token budget exhausted: {used} used + {requested} requested > {limit}")]
    TokensExhausted { used: u64, requested: u64, limit: u64 },
}
