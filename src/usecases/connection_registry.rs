//! Connection Registry - One Upstream Connection per Feed
//!
//! Maps each `FeedKey` to its `StreamConnection`. A connection is
//! opened when the first listener subscribes and closed when the last
//! one leaves. Every map mutation happens under a single mutex, so
//! concurrent subscribe/unsubscribe on the same feed can never leave a
//! feed with listeners but no connection, or a connection with none.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::{debug, info};

use super::stream_connection::{
    Callback, ConnectionStatus, FeedInfo, Listener, StreamConnection, StreamContext,
};
use crate::domain::FeedKey;
use crate::error::DataError;

#[derive(Default)]
struct RegistryState {
    connections: HashMap<FeedKey, StreamConnection>,
    shut_down: bool,
}

/// Process-wide feed registry. Construct one per service instance.
pub struct ConnectionRegistry {
    ctx: Arc<StreamContext>,
    state: Mutex<RegistryState>,
}

impl ConnectionRegistry {
    pub fn new(ctx: Arc<StreamContext>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            state: Mutex::new(RegistryState::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `callback` on `key`, opening the upstream stream if this
    /// is the feed's first listener.
    ///
    /// Must be called inside a tokio runtime.
    pub fn subscribe(
        self: &Arc<Self>,
        key: FeedKey,
        callback: Callback,
    ) -> Result<Subscription, DataError> {
        let listener = Listener::new(callback);
        let id = listener.id();

        let mut state = self.lock();
        if state.shut_down {
            return Err(DataError::ShutDown);
        }
        let connection = state.connections.entry(key.clone()).or_insert_with(|| {
            info!(feed = %key, "Opening feed");
            StreamConnection::open(key.clone(), Arc::clone(&self.ctx))
        });
        connection.attach(listener);
        let subscribers = connection.subscriber_count();
        let feeds = state.connections.len();
        drop(state);

        self.ctx.metrics.active_feeds.set(i64::try_from(feeds).unwrap_or(i64::MAX));
        debug!(feed = %key, listener = id, subscribers, "Listener subscribed");

        Ok(Subscription {
            registry: Arc::downgrade(self),
            key,
            listener_id: id,
            active: true,
        })
    }

    fn unsubscribe(&self, key: &FeedKey, listener_id: u64) {
        let mut state = self.lock();
        let Some(connection) = state.connections.get(key) else {
            return;
        };
        let (listener, remaining) = connection.detach(listener_id);
        let closed = if remaining == 0 {
            state.connections.remove(key)
        } else {
            None
        };
        let feeds = state.connections.len();
        drop(state);

        if let Some(connection) = closed {
            info!(feed = %key, "Last listener left, closing feed");
            connection.close();
            self.ctx.metrics.active_feeds.set(i64::try_from(feeds).unwrap_or(i64::MAX));
        }
        // Outside the map lock: may wait for an in-flight delivery.
        if let Some(listener) = listener {
            listener.deactivate();
            debug!(feed = %key, listener = listener_id, remaining, "Listener unsubscribed");
        }
    }

    /// Status of the connection serving `key`, if the feed is active.
    pub fn status(&self, key: &FeedKey) -> Option<ConnectionStatus> {
        self.lock().connections.get(key).map(StreamConnection::status)
    }

    /// Snapshot of every active feed.
    pub fn active_feeds(&self) -> Vec<FeedInfo> {
        let mut feeds: Vec<FeedInfo> = self
            .lock()
            .connections
            .values()
            .map(StreamConnection::info)
            .collect();
        feeds.sort_by(|a, b| a.key.to_string().cmp(&b.key.to_string()));
        feeds
    }

    pub fn len(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every connection and wait for their tasks to exit.
    /// Later subscribes fail with `DataError::ShutDown`.
    pub async fn shutdown(&self) {
        let drained: Vec<StreamConnection> = {
            let mut state = self.lock();
            state.shut_down = true;
            state.connections.drain().map(|(_, c)| c).collect()
        };
        info!(feeds = drained.len(), "Closing all feeds");

        for connection in &drained {
            connection.close();
        }
        for connection in &drained {
            connection.join().await;
        }
        self.ctx.metrics.active_feeds.set(0);
    }
}

/// Handle returned by `subscribe`. Unsubscribes on drop.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    registry: Weak<ConnectionRegistry>,
    key: FeedKey,
    listener_id: u64,
    active: bool,
}

impl Subscription {
    pub const fn key(&self) -> &FeedKey {
        &self.key
    }

    /// Stop deliveries to this listener. Idempotent; once it returns the
    /// callback is never invoked again. Safe to call from inside the
    /// callback itself.
    pub fn unsubscribe(&mut self) {
        if !std::mem::take(&mut self.active) {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.unsubscribe(&self.key, self.listener_id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("listener_id", &self.listener_id)
            .field("active", &self.active)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::adapters::metrics::MetricsRegistry;
    use crate::domain::MarketEvent;
    use crate::ports::StreamSource;
    use crate::usecases::backoff::ReconnectPolicy;
    use crate::usecases::fallback_switch::{FallbackPolicy, FallbackSwitch};
    use crate::usecases::test_support::{echo_price, EchoProvider, ScriptedSource};

    fn registry() -> (Arc<ConnectionRegistry>, Arc<ScriptedSource>) {
        let source = Arc::new(ScriptedSource::new());
        let metrics = Arc::new(MetricsRegistry::new().unwrap());
        let ctx = Arc::new(StreamContext {
            source: Arc::clone(&source) as Arc<dyn StreamSource>,
            primary: Arc::new(EchoProvider::new("primary")),
            fallback: Arc::new(EchoProvider::new("fallback")),
            switch: Arc::new(FallbackSwitch::new(FallbackPolicy::default(), Arc::clone(&metrics))),
            policy: ReconnectPolicy::default(),
            metrics,
        });
        (ConnectionRegistry::new(ctx), source)
    }

    fn counter() -> (Callback, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        (Arc::new(move |_: &MarketEvent| {
            h.fetch_add(1, Ordering::SeqCst);
        }), hits)
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribers_share_one_connection() {
        let (registry, source) = registry();
        let (a, hits_a) = counter();
        let (b, hits_b) = counter();

        let _sa = registry.subscribe(FeedKey::ticker("BTCUSDT"), a).unwrap();
        let _sb = registry.subscribe(FeedKey::ticker("btcusdt"), b).unwrap();
        assert_eq!(registry.len(), 1);

        let session = source.wait_for_session(0).await;
        session.send(&echo_price(1.0));
        session.flush().await;

        assert_eq!(source.connects(), 1);
        assert_eq!(hits_a.load(Ordering::SeqCst), 1);
        assert_eq!(hits_b.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_unsubscribe_closes_and_resubscribe_reopens() {
        let (registry, source) = registry();
        let key = FeedKey::ticker("ETHUSDT");
        let (a, _) = counter();
        let (b, _) = counter();

        let mut sa = registry.subscribe(key.clone(), a).unwrap();
        let mut sb = registry.subscribe(key.clone(), b).unwrap();
        let first = source.wait_for_session(0).await;

        sa.unsubscribe();
        assert_eq!(registry.status(&key), Some(ConnectionStatus::Open));

        sb.unsubscribe();
        assert!(registry.is_empty());
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(first.is_closed());

        let (c, _) = counter();
        let _sc = registry.subscribe(key.clone(), c).unwrap();
        let second = source.wait_for_session(1).await;
        assert!(!second.is_closed());
        assert_eq!(source.connects(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_is_idempotent_and_runs_on_drop() {
        let (registry, _source) = registry();
        let key = FeedKey::trades("SOLUSDT");
        let (a, _) = counter();
        let (b, _) = counter();

        let mut sa = registry.subscribe(key.clone(), a).unwrap();
        let sb = registry.subscribe(key.clone(), b).unwrap();
        sa.unsubscribe();
        sa.unsubscribe();
        assert_eq!(registry.active_feeds()[0].subscribers, 1);

        drop(sb);
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rapid_switching_never_leaks_connections() {
        let (registry, _source) = registry();
        let mut current = None;
        for symbol in ["BTCUSDT", "ETHUSDT", "BTCUSDT", "SOLUSDT", "BTCUSDT"] {
            let (cb, _) = counter();
            current = Some(registry.subscribe(FeedKey::ticker(symbol), cb).unwrap());
        }
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.active_feeds()[0].key, FeedKey::ticker("BTCUSDT"));

        drop(current);
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_everything_and_rejects_new_subscribers() {
        let (registry, source) = registry();
        let (a, _) = counter();
        let (b, _) = counter();
        let _sa = registry.subscribe(FeedKey::ticker("BTCUSDT"), a).unwrap();
        let _sb = registry.subscribe(FeedKey::order_book("BTCUSDT"), b).unwrap();
        let s0 = source.wait_for_session(0).await;
        let s1 = source.wait_for_session(1).await;

        registry.shutdown().await;
        assert!(registry.is_empty());
        assert!(s0.is_closed() && s1.is_closed());

        let (c, _) = counter();
        assert!(matches!(
            registry.subscribe(FeedKey::ticker("BTCUSDT"), c),
            Err(DataError::ShutDown)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_subscribe_unsubscribe_same_feed() {
        let (registry, source) = registry();
        let key = FeedKey::ticker("BTCUSDT");

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let key = key.clone();
                tokio::spawn(async move {
                    for _ in 0..10 {
                        let (cb, _) = counter();
                        let sub = registry.subscribe(key.clone(), cb).unwrap();
                        tokio::task::yield_now().await;
                        drop(sub);
                    }
                })
            })
            .collect();
        for t in tasks {
            t.await.unwrap();
        }

        assert!(registry.is_empty());
        // Every opened session must have been closed again.
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(source.sessions().iter().all(|s| s.is_closed()));
    }
}
