//! Sliding-window REST admission control.
//!
//! Bounds outbound calls to `limit` per trailing `window`. Callers that
//! would exceed the budget are delayed, never rejected. Waiters are
//! admitted strictly in arrival order: the window is guarded by a fair
//! (FIFO) async mutex and the head waiter sleeps while holding it.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::debug;

/// Added to computed waits so the oldest stamp has left the window
/// when the waiter re-checks.
const EPSILON: Duration = Duration::from_millis(1);

/// Sliding-window rate limiter.
pub struct RateLimiter {
    name: &'static str,
    limit: usize,
    window: Duration,
    /// Admission timestamps inside the trailing window, oldest first.
    admitted: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    /// `limit` admissions per `window`. A zero limit is treated as one.
    pub fn new(name: &'static str, limit: usize, window: Duration) -> Self {
        let limit = limit.max(1);
        Self {
            name,
            limit,
            window,
            admitted: Mutex::new(VecDeque::with_capacity(limit)),
        }
    }

    pub const fn limit(&self) -> usize {
        self.limit
    }

    pub const fn window(&self) -> Duration {
        self.window
    }

    /// Wait until a call may proceed, then record it.
    ///
    /// Returns how long the caller was held back.
    pub async fn acquire(&self) -> Duration {
        let started = Instant::now();
        let mut admitted = self.admitted.lock().await;

        loop {
            let now = Instant::now();
            while admitted
                .front()
                .is_some_and(|&oldest| now.duration_since(oldest) >= self.window)
            {
                admitted.pop_front();
            }

            if admitted.len() < self.limit {
                admitted.push_back(now);
                return now.duration_since(started);
            }

            // Full window: wait for the oldest stamp to fall out.
            let Some(&oldest) = admitted.front() else {
                continue;
            };
            let wait = self.window.saturating_sub(now.duration_since(oldest)) + EPSILON;
            debug!(
                limiter = self.name,
                wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                "Rate budget exhausted, delaying call"
            );
            sleep(wait).await;
        }
    }

    /// Admissions recorded in the current window.
    pub async fn in_window(&self) -> usize {
        let now = Instant::now();
        let admitted = self.admitted.lock().await;
        admitted
            .iter()
            .filter(|&&t| now.duration_since(t) < self.window)
            .count()
    }
}
