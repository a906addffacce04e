//! Stream Connection - One Upstream Socket per Feed
//!
//! Owns the upstream stream for a single `FeedKey` and fans every
//! normalized event out to its listeners. Runs as one tokio task:
//!
//! `Connecting -> Open -> (Closing -> Closed)`, with `Open -> Connecting`
//! on abnormal close or stall. Reconnects follow `Backoff`; when the
//! budget runs out on the primary the fallback switch is tripped and the
//! connection migrates, on the fallback the feed parks in `Failed` until
//! the provider mode changes.
//!
//! Explicit close is final: a closing connection never reconnects.

use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use super::backoff::{Backoff, ReconnectPolicy};
use super::fallback_switch::{FallbackSwitch, ProviderMode, ProviderRole};
use crate::adapters::metrics::MetricsRegistry;
use crate::domain::{now_ms, FeedKey, MarketEvent};
use crate::error::ProviderError;
use crate::ports::{MarketProvider, StreamSession, StreamSource};

/// Subscriber callback. Invoked synchronously on the connection task.
pub type Callback = Arc<dyn Fn(&MarketEvent) + Send + Sync>;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Listener whose callback is running on this thread, if any.
    static DISPATCHING: Cell<Option<u64>> = const { Cell::new(None) };
}

/// A registered subscriber.
///
/// `in_flight` is held for the duration of each delivery, so
/// `deactivate` can wait out a delivery that already started.
pub(crate) struct Listener {
    id: u64,
    callback: Callback,
    live: AtomicBool,
    in_flight: Mutex<()>,
}

impl Listener {
    pub(crate) fn new(callback: Callback) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed),
            callback,
            live: AtomicBool::new(true),
            in_flight: Mutex::new(()),
        })
    }

    pub(crate) const fn id(&self) -> u64 {
        self.id
    }

    fn deliver(&self, event: &MarketEvent) {
        let _gate = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.live.load(Ordering::Acquire) {
            return;
        }

        let outer = DISPATCHING.with(|d| d.replace(Some(self.id)));
        let outcome = catch_unwind(AssertUnwindSafe(|| (self.callback)(event)));
        DISPATCHING.with(|d| d.set(outer));

        if outcome.is_err() {
            error!(listener = self.id, symbol = event.symbol(), "Subscriber callback panicked");
        }
    }

    /// Stop deliveries. Once this returns the callback will not start again.
    ///
    /// Outside any callback this also waits for an in-flight delivery to
    /// finish, so nothing runs after it returns. From inside a callback it
    /// never blocks, so a listener may unsubscribe itself (or another one)
    /// while being dispatched. That also holds when the caller is a
    /// callback of a different feed and the target is mid-delivery on
    /// another thread: the target's current invocation may still be
    /// running when this returns, and it is the last one.
    pub(crate) fn deactivate(&self) {
        self.live.store(false, Ordering::Release);
        if DISPATCHING.with(Cell::get).is_none() {
            drop(self.in_flight.lock().unwrap_or_else(PoisonError::into_inner));
        }
    }
}

/// Lifecycle of one upstream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Open,
    Closing,
    Closed,
    /// Reconnects exhausted on the fallback; waiting for a mode change.
    Failed,
}

/// Point-in-time view of a feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeedInfo {
    pub key: FeedKey,
    pub status: ConnectionStatus,
    pub subscribers: usize,
    pub reconnect_attempts: u32,
    /// Wall-clock time of the last upstream frame (Unix ms).
    pub last_message_at_ms: Option<u64>,
}

/// Everything a connection task needs besides its own state.
pub struct StreamContext {
    pub source: Arc<dyn StreamSource>,
    pub primary: Arc<dyn MarketProvider>,
    pub fallback: Arc<dyn MarketProvider>,
    pub switch: Arc<FallbackSwitch>,
    pub policy: ReconnectPolicy,
    pub metrics: Arc<MetricsRegistry>,
}

impl StreamContext {
    fn provider(&self, role: ProviderRole) -> &Arc<dyn MarketProvider> {
        match role {
            ProviderRole::Primary => &self.primary,
            ProviderRole::Fallback => &self.fallback,
        }
    }
}

struct ConnectionShared {
    key: FeedKey,
    listeners: Mutex<Vec<Arc<Listener>>>,
    status: watch::Sender<ConnectionStatus>,
    last_message_at_ms: AtomicU64,
    reconnect_attempts: AtomicU32,
}

impl ConnectionShared {
    fn listeners(&self) -> MutexGuard<'_, Vec<Arc<Listener>>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `Closing` and `Closed` are sticky; only `Closed` may follow them.
    fn set_status(&self, next: ConnectionStatus) {
        self.status.send_if_modified(|current| {
            let terminal = matches!(*current, ConnectionStatus::Closing | ConnectionStatus::Closed);
            if *current == next || (terminal && next != ConnectionStatus::Closed) {
                return false;
            }
            *current = next;
            true
        });
    }

    fn dispatch(&self, event: &MarketEvent) {
        let snapshot: Vec<Arc<Listener>> = self.listeners().clone();
        for listener in &snapshot {
            listener.deliver(event);
        }
    }
}

/// Why a session ended.
enum SessionEnd {
    /// Explicit close requested.
    Closed,
    /// Provider mode changed; reconnect on the other provider.
    Migrate,
    /// Abnormal close, error or stall.
    Dropped(String),
    /// The provider has no stream for this feed.
    Unsupported(String),
}

/// Handle to the task serving one feed.
pub struct StreamConnection {
    shared: Arc<ConnectionShared>,
    close_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StreamConnection {
    /// Spawn the connection task. Must be called inside a tokio runtime.
    pub fn open(key: FeedKey, ctx: Arc<StreamContext>) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Connecting);
        let (close_tx, close_rx) = watch::channel(false);
        let shared = Arc::new(ConnectionShared {
            key,
            listeners: Mutex::new(Vec::new()),
            status,
            last_message_at_ms: AtomicU64::new(0),
            reconnect_attempts: AtomicU32::new(0),
        });

        let task = tokio::spawn(run(Arc::clone(&shared), ctx, close_rx));

        Self {
            shared,
            close_tx,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn key(&self) -> &FeedKey {
        &self.shared.key
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.shared.status.borrow()
    }

    /// Receiver notified on every status transition.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.listeners().len()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.reconnect_attempts.load(Ordering::Relaxed)
    }

    pub fn info(&self) -> FeedInfo {
        let last = self.shared.last_message_at_ms.load(Ordering::Relaxed);
        FeedInfo {
            key: self.shared.key.clone(),
            status: self.status(),
            subscribers: self.subscriber_count(),
            reconnect_attempts: self.reconnect_attempts(),
            last_message_at_ms: (last > 0).then_some(last),
        }
    }

    pub(crate) fn attach(&self, listener: Arc<Listener>) {
        self.shared.listeners().push(listener);
    }

    /// Remove a listener. Returns it with how many remain.
    pub(crate) fn detach(&self, id: u64) -> (Option<Arc<Listener>>, usize) {
        let mut listeners = self.shared.listeners();
        let removed = listeners
            .iter()
            .position(|l| l.id() == id)
            .map(|idx| listeners.swap_remove(idx));
        (removed, listeners.len())
    }

    /// Request an explicit close. Idempotent.
    pub fn close(&self) {
        self.shared.set_status(ConnectionStatus::Closing);
        self.close_tx.send_replace(true);
    }

    /// Wait for the connection task to exit.
    pub async fn join(&self) {
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(feed = %self.shared.key, error = %e, "Stream connection task failed");
            }
        }
    }
}

impl Drop for StreamConnection {
    fn drop(&mut self) {
        self.close_tx.send_replace(true);
    }
}

/// Resolves once an explicit close has been requested.
async fn close_requested(close_rx: &mut watch::Receiver<bool>) {
    let _ = close_rx.wait_for(|closed| *closed).await;
}

/// Resolves with the new mode, or `None` if the switch is gone.
async fn mode_changed(mode_rx: &mut watch::Receiver<ProviderMode>) -> Option<ProviderMode> {
    mode_rx.changed().await.ok()?;
    let mode = *mode_rx.borrow_and_update();
    Some(mode)
}

#[instrument(name = "stream", skip_all, fields(feed = %shared.key))]
async fn run(
    shared: Arc<ConnectionShared>,
    ctx: Arc<StreamContext>,
    mut close_rx: watch::Receiver<bool>,
) {
    let mut backoff = Backoff::new(ctx.policy.clone());
    let mut mode_rx = ctx.switch.subscribe_mode();

    loop {
        if *close_rx.borrow() {
            break;
        }
        let role = mode_rx.borrow_and_update().stream_role();
        shared.set_status(ConnectionStatus::Connecting);

        match session(&shared, &ctx, role, &mut backoff, &mut close_rx, &mut mode_rx).await {
            SessionEnd::Closed => break,
            SessionEnd::Migrate => {
                info!(from = role.label(), "Provider mode changed, migrating stream");
                backoff.reset();
                shared.reconnect_attempts.store(0, Ordering::Relaxed);
            }
            SessionEnd::Unsupported(reason) => {
                warn!(provider = ctx.provider(role).name(), %reason, "Feed not available on provider");
                shared.set_status(ConnectionStatus::Failed);
                if !park(&mut close_rx, &mut mode_rx).await {
                    break;
                }
                backoff.reset();
            }
            SessionEnd::Dropped(reason) => {
                let provider = ctx.provider(role).name();
                ctx.switch.record_failure(role);

                if !backoff.can_retry() {
                    match role {
                        ProviderRole::Primary => {
                            ctx.switch.trip(&reason);
                            backoff.reset();
                            shared.reconnect_attempts.store(0, Ordering::Relaxed);
                        }
                        ProviderRole::Fallback => {
                            error!(provider, %reason, "Reconnects exhausted on fallback provider");
                            shared.set_status(ConnectionStatus::Failed);
                            if !park(&mut close_rx, &mut mode_rx).await {
                                break;
                            }
                            backoff.reset();
                            shared.reconnect_attempts.store(0, Ordering::Relaxed);
                        }
                    }
                    continue;
                }

                let delay = backoff.next_delay();
                shared
                    .reconnect_attempts
                    .store(backoff.attempts(), Ordering::Relaxed);
                ctx.metrics.reconnects_total.with_label_values(&[provider]).inc();
                shared.set_status(ConnectionStatus::Connecting);
                warn!(
                    provider,
                    %reason,
                    attempt = backoff.attempts(),
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Stream dropped, scheduling reconnect"
                );

                tokio::select! {
                    biased;
                    () = close_requested(&mut close_rx) => break,
                    mode = mode_changed(&mut mode_rx) => {
                        if mode.is_none() {
                            break;
                        }
                        backoff.reset();
                    }
                    () = sleep(delay) => {}
                }
            }
        }
    }

    shared.set_status(ConnectionStatus::Closed);
    debug!("Stream connection closed");
}

/// Wait in `Failed` until the mode changes (`true`) or close (`false`).
async fn park(
    close_rx: &mut watch::Receiver<bool>,
    mode_rx: &mut watch::Receiver<ProviderMode>,
) -> bool {
    tokio::select! {
        biased;
        () = close_requested(close_rx) => false,
        mode = mode_changed(mode_rx) => mode.is_some(),
    }
}

/// One connect attempt and, if it opens, the read loop.
async fn session(
    shared: &ConnectionShared,
    ctx: &StreamContext,
    role: ProviderRole,
    backoff: &mut Backoff,
    close_rx: &mut watch::Receiver<bool>,
    mode_rx: &mut watch::Receiver<ProviderMode>,
) -> SessionEnd {
    let provider = ctx.provider(role);
    let endpoint = match provider.stream_endpoint(&shared.key) {
        Ok(endpoint) => endpoint,
        Err(ProviderError::Unsupported(what)) => return SessionEnd::Unsupported(what),
        Err(e) => return SessionEnd::Dropped(e.to_string()),
    };

    debug!(provider = provider.name(), url = %endpoint.url, "Connecting upstream stream");
    let mut stream = tokio::select! {
        biased;
        () = close_requested(close_rx) => return SessionEnd::Closed,
        connected = ctx.source.connect(&endpoint) => match connected {
            Ok(stream) => stream,
            Err(e) => return SessionEnd::Dropped(format!("{e:#}")),
        },
    };

    shared.set_status(ConnectionStatus::Open);
    backoff.reset();
    shared.reconnect_attempts.store(0, Ordering::Relaxed);
    shared.last_message_at_ms.store(now_ms(), Ordering::Relaxed);
    ctx.switch.record_success(role);
    info!(provider = provider.name(), "Upstream stream open");

    let gauge = ctx.metrics.connections_open.with_label_values(&[provider.name()]);
    gauge.inc();
    provider.stream_opened(&shared.key);
    let end = pump(shared, ctx, role, stream.as_mut(), close_rx, mode_rx).await;
    provider.stream_closed(&shared.key);
    gauge.dec();

    stream.close().await;
    end
}

/// Read frames until the session ends.
async fn pump(
    shared: &ConnectionShared,
    ctx: &StreamContext,
    role: ProviderRole,
    stream: &mut dyn StreamSession,
    close_rx: &mut watch::Receiver<bool>,
    mode_rx: &mut watch::Receiver<ProviderMode>,
) -> SessionEnd {
    let provider = ctx.provider(role);
    let channel = shared.key.channel.label();
    let mut last_frame = Instant::now();
    let mut liveness = interval(ctx.policy.heartbeat_check);
    liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);
    liveness.reset();

    loop {
        tokio::select! {
            biased;
            () = close_requested(close_rx) => return SessionEnd::Closed,
            mode = mode_changed(mode_rx) => match mode {
                None => return SessionEnd::Closed,
                Some(mode) if mode.stream_role() != role => return SessionEnd::Migrate,
                Some(_) => {}
            },
            _ = liveness.tick() => {
                let silent = last_frame.elapsed();
                if silent >= ctx.policy.heartbeat_timeout {
                    warn!(
                        provider = provider.name(),
                        silent_ms = u64::try_from(silent.as_millis()).unwrap_or(u64::MAX),
                        "Stream stalled"
                    );
                    return SessionEnd::Dropped("no upstream data within heartbeat timeout".into());
                }
            }
            frame = stream.next_text() => match frame {
                Some(Ok(text)) => {
                    last_frame = Instant::now();
                    shared.last_message_at_ms.store(now_ms(), Ordering::Relaxed);
                    match provider.normalize(&shared.key, &text) {
                        Ok(events) => {
                            for event in &events {
                                shared.dispatch(event);
                            }
                            if !events.is_empty() {
                                ctx.metrics
                                    .messages_total
                                    .with_label_values(&[provider.name(), channel])
                                    .inc_by(events.len() as u64);
                            }
                        }
                        Err(ProviderError::Unsupported(what)) => return SessionEnd::Unsupported(what),
                        Err(e) => {
                            ctx.metrics
                                .malformed_total
                                .with_label_values(&[provider.name()])
                                .inc();
                            warn!(provider = provider.name(), error = %e, "Dropping malformed frame");
                        }
                    }
                }
                Some(Err(e)) => return SessionEnd::Dropped(format!("{e:#}")),
                None => return SessionEnd::Dropped("upstream closed the stream".into()),
            },
        }
    }
}
