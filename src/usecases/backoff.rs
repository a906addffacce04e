//! Reconnect backoff.
//!
//! `delay(n) = min(base * 2^n, max)`, minus a random jitter of up to
//! `jitter_ratio * delay`. Successive delays are clamped so they never
//! decrease within one outage, and never exceed `max`.

use std::time::Duration;

use rand::Rng;

use crate::config::StreamConfig;

/// Reconnect and liveness policy shared by every feed.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    pub jitter_ratio: f64,
    pub heartbeat_timeout: Duration,
    pub heartbeat_check: Duration,
}

impl ReconnectPolicy {
    /// Un-jittered delay before reconnect attempt number `attempt + 1`.
    pub fn capped_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&StreamConfig::default())
    }
}

impl From<&StreamConfig> for ReconnectPolicy {
    fn from(c: &StreamConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(c.base_delay_ms),
            max_delay: Duration::from_millis(c.max_delay_ms),
            max_attempts: c.max_attempts,
            jitter_ratio: c.jitter_ratio,
            heartbeat_timeout: Duration::from_millis(c.heartbeat_timeout_ms),
            heartbeat_check: Duration::from_millis(c.heartbeat_check_ms),
        }
    }
}

/// Per-connection backoff state.
#[derive(Debug)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempts: u32,
    last_delay: Duration,
}

impl Backoff {
    pub const fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
            last_delay: Duration::ZERO,
        }
    }

    /// Reconnects scheduled since the last successful open.
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Whether another reconnect may be scheduled.
    pub const fn can_retry(&self) -> bool {
        self.attempts < self.policy.max_attempts
    }

    /// Successful open: start the next outage from scratch.
    pub const fn reset(&mut self) {
        self.attempts = 0;
        self.last_delay = Duration::ZERO;
    }

    /// Delay before the next reconnect; counts the attempt.
    pub fn next_delay(&mut self) -> Duration {
        let jitter_sample = if self.policy.jitter_ratio > 0.0 {
            rand::thread_rng().gen_range(0.0..=1.0)
        } else {
            0.0
        };
        self.next_delay_with(jitter_sample)
    }

    /// Deterministic variant of `next_delay`; `jitter_sample` is in [0, 1].
    pub fn next_delay_with(&mut self, jitter_sample: f64) -> Duration {
        let capped = self.policy.capped_delay(self.attempts);
        let shave = capped.mul_f64(self.policy.jitter_ratio.clamp(0.0, 1.0) * jitter_sample.clamp(0.0, 1.0));
        let delay = capped
            .saturating_sub(shave)
            .max(self.last_delay)
            .min(self.policy.max_delay);

        self.attempts = self.attempts.saturating_add(1);
        self.last_delay = delay;
        delay
    }
}
