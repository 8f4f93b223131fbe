//! The sync service: one facade tying the transport layer to the store.
//!
//! Built explicitly and passed by reference to consumers -- there is no
//! global instance, so tests construct isolated services freely.
//!
//! Reads are cache-aside: a fresh cached value is returned directly; a
//! stale one is returned immediately (UI continuity) while a background
//! refresh runs; a miss awaits the network. The stream bridge writes push
//! updates into the same store keys, so polling and push converge on one
//! source of truth with last-writer-wins per key.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use nodepulse_api::protocol::{StreamFrame, SubscribeRequest};
use nodepulse_api::ws::{ConnEvent, ConnectionHandle, ConnectionState};
use nodepulse_api::{ChainStatus, MarketTicker, PeerSummary, RpcClient, Throughput};

use crate::boundary::ErrorBoundary;
use crate::config::SyncConfig;
use crate::error::CoreError;
use crate::store::Store;

// ── Store keys ───────────────────────────────────────────────────────

/// The flat key space shared with the render layer.
pub mod keys {
    pub const CHAIN_STATUS: &str = "chain.status";
    pub const CHAIN_THROUGHPUT: &str = "chain.throughput";
    pub const NET_PEERS: &str = "net.peers";
    pub const MARKET_TICKER: &str = "market.ticker";
    /// `true` while the push stream has given up reconnecting.
    pub const SYNC_DEGRADED: &str = "sync.degraded";
}

/// Push topic -> store key. Subscriptions are sent for every entry.
const TOPICS: &[(&str, &str)] = &[
    ("height", keys::CHAIN_STATUS),
    ("throughput", keys::CHAIN_THROUGHPUT),
    ("peers", keys::NET_PEERS),
    ("market", keys::MARKET_TICKER),
];

// ── SyncService ──────────────────────────────────────────────────────

/// Facade over RPC client, stream connection, store, and boundary.
/// Cheaply cloneable; clones share state.
#[derive(Clone)]
pub struct SyncService {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    config: SyncConfig,
    rpc: RpcClient,
    store: Store,
    boundary: ErrorBoundary,
    cancel: CancellationToken,
    stream: Mutex<Option<ConnectionHandle>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    next_sub_id: AtomicU64,
    degraded_tx: watch::Sender<bool>,
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl SyncService {
    /// Assemble a service from its collaborators. Does not start the
    /// stream bridge -- call [`start`](Self::start) for that.
    pub fn new(
        config: SyncConfig,
        rpc: RpcClient,
        store: Store,
        boundary: ErrorBoundary,
    ) -> Self {
        // Subscriber panics in the store route into the boundary.
        let panic_boundary = boundary.clone();
        store.set_panic_handler(Arc::new(move |key, detail| {
            panic_boundary.report_application(&format!("store subscriber for {key}"), detail);
        }));

        let (degraded_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(ServiceInner {
                config,
                rpc,
                store,
                boundary,
                cancel: CancellationToken::new(),
                stream: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
                next_sub_id: AtomicU64::new(1),
                degraded_tx,
            }),
        }
    }

    /// Start the push path: connect the stream and spawn the bridge task.
    /// A service without a configured stream endpoint stays cache-aside
    /// only, and this is a no-op.
    pub fn start(&self) {
        let Some(url) = self.inner.config.stream_url.clone() else {
            debug!("no stream endpoint configured, running cache-aside only");
            return;
        };

        let handle = ConnectionHandle::connect(
            url,
            self.inner.config.stream.clone(),
            self.inner.cancel.child_token(),
        );
        let events = handle.events();
        *lock_unpoisoned(&self.inner.stream) = Some(handle);

        let service = self.clone();
        let cancel = self.inner.cancel.child_token();
        let task = tokio::spawn(async move { service.bridge_loop(events, cancel).await });
        lock_unpoisoned(&self.inner.tasks).push(task);
        info!("sync service started");
    }

    /// Stop everything: stream, bridge, and in-flight refreshes.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        if let Some(handle) = lock_unpoisoned(&self.inner.stream).take() {
            handle.disconnect();
        }
        let tasks: Vec<_> = lock_unpoisoned(&self.inner.tasks).drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        debug!("sync service stopped");
    }

    // ── Typed cache-aside accessors ──────────────────────────────────

    pub async fn chain_status(&self) -> Result<ChainStatus, CoreError> {
        let rpc = self.inner.rpc.clone();
        self.fetch_cached(keys::CHAIN_STATUS, self.inner.config.ttl.chain_status, move || {
            let rpc = rpc.clone();
            async move { rpc.chain_status().await }
        })
        .await
    }

    pub async fn chain_throughput(&self) -> Result<Throughput, CoreError> {
        let rpc = self.inner.rpc.clone();
        self.fetch_cached(
            keys::CHAIN_THROUGHPUT,
            self.inner.config.ttl.chain_throughput,
            move || {
                let rpc = rpc.clone();
                async move { rpc.chain_throughput().await }
            },
        )
        .await
    }

    pub async fn net_peers(&self) -> Result<PeerSummary, CoreError> {
        let rpc = self.inner.rpc.clone();
        self.fetch_cached(keys::NET_PEERS, self.inner.config.ttl.net_peers, move || {
            let rpc = rpc.clone();
            async move { rpc.net_peers().await }
        })
        .await
    }

    pub async fn market_ticker(&self) -> Result<MarketTicker, CoreError> {
        let rpc = self.inner.rpc.clone();
        let pair = self.inner.config.market_pair.clone();
        self.fetch_cached(
            keys::MARKET_TICKER,
            self.inner.config.ttl.market_ticker,
            move || {
                let rpc = rpc.clone();
                let pair = pair.clone();
                async move { rpc.market_ticker(&pair).await }
            },
        )
        .await
    }

    // ── Observation surface ──────────────────────────────────────────

    /// The shared store (reads and subscriptions for the render layer).
    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    pub fn boundary(&self) -> &ErrorBoundary {
        &self.inner.boundary
    }

    pub fn rpc(&self) -> &RpcClient {
        &self.inner.rpc
    }

    /// Degraded-connectivity indicator (true after the stream gives up).
    pub fn degraded(&self) -> watch::Receiver<bool> {
        self.inner.degraded_tx.subscribe()
    }

    /// Stream view of the degraded indicator, for render layers that
    /// consume `Stream`s.
    pub fn degraded_stream(&self) -> WatchStream<bool> {
        WatchStream::new(self.inner.degraded_tx.subscribe())
    }

    /// Connection state of the push stream, if started.
    pub fn connection_state(&self) -> Option<watch::Receiver<ConnectionState>> {
        lock_unpoisoned(&self.inner.stream)
            .as_ref()
            .map(ConnectionHandle::state)
    }

    // ── Push path ────────────────────────────────────────────────────

    /// Write one push update into its store key. Normally fed by the
    /// stream bridge; public so the mapping is testable in isolation.
    pub fn apply_update(&self, topic: &str, data: Value) {
        match TOPICS.iter().find(|&&(t, _)| t == topic) {
            Some(&(_, key)) => {
                debug!(topic, key, "applying push update");
                self.inner
                    .store
                    .set_with_ttl(key, data, Some(self.inner.config.ttl.pushed));
            }
            None => debug!(topic, "ignoring push update for unknown topic"),
        }
    }

    async fn bridge_loop(
        self,
        mut events: broadcast::Receiver<ConnEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(ConnEvent::Connected) => {
                    self.send_subscriptions();
                    self.inner.degraded_tx.send_replace(false);
                    self.inner.boundary.clear_degraded();
                    self.inner.store.set(keys::SYNC_DEGRADED, Value::Bool(false));
                }
                Ok(ConnEvent::Message(frame)) => {
                    if let StreamFrame::Update { topic, data } = frame.as_ref() {
                        self.apply_update(topic, data.clone());
                    }
                }
                Ok(ConnEvent::Error { error }) => {
                    self.inner
                        .boundary
                        .handle(&CoreError::Api(error), "metrics stream");
                }
                Ok(ConnEvent::MaxRetriesReached) => {
                    self.inner.degraded_tx.send_replace(true);
                    self.inner.store.set(keys::SYNC_DEGRADED, Value::Bool(true));
                    self.inner
                        .boundary
                        .notify_degraded("stream reconnection gave up");
                }
                // Transient gaps: TTLs make the affected keys refetchable.
                Ok(ConnEvent::Disconnected { .. } | ConnEvent::Reconnecting { .. }) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "stream bridge lagged behind events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!("stream bridge exiting");
    }

    /// Send one subscription envelope per topic. Sends while disconnected
    /// queue in the connection manager and flush on open.
    fn send_subscriptions(&self) {
        let guard = lock_unpoisoned(&self.inner.stream);
        let Some(handle) = guard.as_ref() else {
            return;
        };
        for &(topic, _) in TOPICS {
            let id = self.inner.next_sub_id.fetch_add(1, Ordering::Relaxed);
            let request =
                SubscribeRequest::new(self.inner.config.subscribe_method.clone(), topic, id);
            match request.to_text() {
                Ok(text) => handle.send(text),
                Err(e) => self
                    .inner
                    .boundary
                    .handle(&CoreError::Api(e), "stream subscribe"),
            }
        }
    }

    // ── Cache-aside core ─────────────────────────────────────────────

    /// Fresh hit -> cached value. Stale hit -> cached value now, refresh
    /// in the background. Miss -> await the network. All failures route
    /// through the boundary in addition to surfacing to the caller.
    async fn fetch_cached<T, F, Fut>(
        &self,
        key: &'static str,
        ttl: Duration,
        fetch: F,
    ) -> Result<T, CoreError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, nodepulse_api::Error>> + Send,
    {
        if let Some(read) = self.inner.store.get(key) {
            match decode::<T>(key, &read.value) {
                Ok(value) => {
                    if read.stale {
                        debug!(key, "serving stale value, refreshing in background");
                        self.spawn_refresh(key, ttl, fetch);
                    }
                    return Ok(value);
                }
                Err(error) => {
                    // Cached shape no longer decodes; evict and refetch.
                    self.inner.boundary.handle(&error, key);
                    self.inner.store.remove(key);
                }
            }
        }

        match fetch().await {
            Ok(value) => {
                self.store_value(key, &value, ttl);
                Ok(value)
            }
            Err(e) => {
                let error = CoreError::from(e);
                self.inner.boundary.handle(&error, key);
                Err(error)
            }
        }
    }

    fn spawn_refresh<T, F, Fut>(&self, key: &'static str, ttl: Duration, fetch: F)
    where
        T: Serialize + Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, nodepulse_api::Error>> + Send,
    {
        // Concurrent refreshes of the same key collapse in the RPC
        // client's dedup layer; no extra guard needed here.
        let service = self.clone();
        let cancel = self.inner.cancel.child_token();
        tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                result = fetch() => result,
            };
            match result {
                Ok(value) => service.store_value(key, &value, ttl),
                Err(e) => service
                    .inner
                    .boundary
                    .handle(&CoreError::from(e), key),
            }
        });
    }

    fn store_value<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        match serde_json::to_value(value) {
            Ok(raw) => self.inner.store.set_with_ttl(key, raw, Some(ttl)),
            Err(e) => warn!(key, error = %e, "could not serialize value for caching"),
        }
    }
}

fn decode<T: DeserializeOwned>(key: &str, value: &Value) -> Result<T, CoreError> {
    serde_json::from_value(value.clone()).map_err(|e| CoreError::Decode {
        key: key.to_owned(),
        detail: e.to_string(),
    })
}

// ── Tests ────────────────────────────────────────────────────────────
