//! Fallback Switch - Primary/Secondary Provider Selection
//!
//! Tracks primary provider health and decides which provider serves
//! new REST calls and stream (re)connects:
//! - `threshold` consecutive primary failures flip the mode to fallback
//! - while in fallback, one primary probe is allowed per cooldown
//! - a single primary success restores primary mode
//!
//! Mode changes are published on a watch channel so open stream
//! connections migrate without their subscribers noticing.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::adapters::metrics::MetricsRegistry;
use crate::config::FallbackConfig;

/// Which provider new calls are routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderMode {
    Primary,
    Fallback,
}

/// A concrete provider slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderRole {
    Primary,
    Fallback,
}

impl ProviderRole {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Fallback => "fallback",
        }
    }
}

impl ProviderMode {
    /// Provider slot that serves streams in this mode.
    pub const fn stream_role(self) -> ProviderRole {
        match self {
            Self::Primary => ProviderRole::Primary,
            Self::Fallback => ProviderRole::Fallback,
        }
    }
}

/// Routing decision for one REST call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Normal operation.
    Primary,
    /// In fallback, but the cooldown has elapsed: try the primary once.
    Probe,
    /// In fallback.
    Fallback,
}

/// Failover thresholds.
#[derive(Debug, Clone)]
pub struct FallbackPolicy {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl From<&FallbackConfig> for FallbackPolicy {
    fn from(c: &FallbackConfig) -> Self {
        Self {
            failure_threshold: c.failure_threshold.max(1),
            cooldown: Duration::from_millis(c.cooldown_ms),
        }
    }
}

impl Default for FallbackPolicy {
    fn default() -> Self {
        Self::from(&FallbackConfig::default())
    }
}

/// Point-in-time view of provider health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthSnapshot {
    pub mode: ProviderMode,
    pub consecutive_failures: u32,
    pub fallback_failures: u32,
}

#[derive(Debug)]
struct ProviderHealth {
    consecutive_failures: u32,
    fallback_failures: u32,
    mode: ProviderMode,
    /// Last switch-to-fallback or probe; gates the next probe.
    last_attempt_at: Option<Instant>,
}

/// Policy wrapper around provider selection.
pub struct FallbackSwitch {
    policy: FallbackPolicy,
    health: Mutex<ProviderHealth>,
    mode_tx: watch::Sender<ProviderMode>,
    metrics: Arc<MetricsRegistry>,
}

impl FallbackSwitch {
    pub fn new(policy: FallbackPolicy, metrics: Arc<MetricsRegistry>) -> Self {
        let (mode_tx, _) = watch::channel(ProviderMode::Primary);
        metrics.provider_mode.set(0);
        Self {
            policy,
            health: Mutex::new(ProviderHealth {
                consecutive_failures: 0,
                fallback_failures: 0,
                mode: ProviderMode::Primary,
                last_attempt_at: None,
            }),
            mode_tx,
            metrics,
        }
    }

    pub const fn policy(&self) -> &FallbackPolicy {
        &self.policy
    }

    pub fn mode(&self) -> ProviderMode {
        self.lock().mode
    }

    /// Receiver notified on every mode change.
    pub fn subscribe_mode(&self) -> watch::Receiver<ProviderMode> {
        self.mode_tx.subscribe()
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let health = self.lock();
        HealthSnapshot {
            mode: health.mode,
            consecutive_failures: health.consecutive_failures,
            fallback_failures: health.fallback_failures,
        }
    }

    /// Both providers failing: the fallback is in use and has itself
    /// failed `threshold` times in a row.
    pub fn is_outage(&self) -> bool {
        let health = self.lock();
        health.mode == ProviderMode::Fallback
            && health.fallback_failures >= self.policy.failure_threshold
    }

    /// Route a REST call. At most one `Probe` is handed out per cooldown.
    pub fn route(&self) -> Route {
        let mut health = self.lock();
        match health.mode {
            ProviderMode::Primary => Route::Primary,
            ProviderMode::Fallback => {
                if Self::probe_due(&self.policy, &health) {
                    health.last_attempt_at = Some(Instant::now());
                    Route::Probe
                } else {
                    Route::Fallback
                }
            }
        }
    }

    /// Claim the next primary probe if one is due (recovery loop).
    pub fn try_begin_probe(&self) -> bool {
        self.route() == Route::Probe
    }

    /// Record a successful call or stream open on `role`.
    pub fn record_success(&self, role: ProviderRole) {
        let mut health = self.lock();
        match role {
            ProviderRole::Primary => {
                health.consecutive_failures = 0;
                if health.mode == ProviderMode::Fallback {
                    health.mode = ProviderMode::Primary;
                    health.fallback_failures = 0;
                    health.last_attempt_at = None;
                    drop(health);
                    info!("Primary provider recovered, reverting from fallback");
                    self.publish(ProviderMode::Primary);
                }
            }
            ProviderRole::Fallback => health.fallback_failures = 0,
        }
    }

    /// Record a failure attributable to `role`.
    pub fn record_failure(&self, role: ProviderRole) {
        let mut health = self.lock();
        match role {
            ProviderRole::Primary => {
                health.consecutive_failures = health.consecutive_failures.saturating_add(1);
                if health.mode == ProviderMode::Primary
                    && health.consecutive_failures >= self.policy.failure_threshold
                {
                    let failures = health.consecutive_failures;
                    Self::enter_fallback(&mut health);
                    drop(health);
                    warn!(failures, "Primary provider failing, switching to fallback");
                    self.publish(ProviderMode::Fallback);
                }
            }
            ProviderRole::Fallback => {
                health.fallback_failures = health.fallback_failures.saturating_add(1);
            }
        }
    }

    /// Terminal primary failure (reconnects exhausted): switch now.
    pub fn trip(&self, reason: &str) {
        let mut health = self.lock();
        health.consecutive_failures = health
            .consecutive_failures
            .max(self.policy.failure_threshold);
        if health.mode == ProviderMode::Primary {
            Self::enter_fallback(&mut health);
            drop(health);
            warn!(reason, "Primary provider tripped, switching to fallback");
            self.publish(ProviderMode::Fallback);
        }
    }

    fn enter_fallback(health: &mut ProviderHealth) {
        health.mode = ProviderMode::Fallback;
        health.fallback_failures = 0;
        health.last_attempt_at = Some(Instant::now());
    }

    fn probe_due(policy: &FallbackPolicy, health: &ProviderHealth) -> bool {
        health
            .last_attempt_at
            .is_none_or(|at| at.elapsed() >= policy.cooldown)
    }

    fn publish(&self, mode: ProviderMode) {
        self.metrics.provider_mode.set(match mode {
            ProviderMode::Primary => 0,
            ProviderMode::Fallback => 1,
        });
        self.mode_tx.send_replace(mode);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ProviderHealth> {
        self.health.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
