//! Keyed reactive cache with TTL staleness and computed values.
//!
//! Keys are flat, dot-delimited strings (`"chain.status"`) shared between
//! the data layer (which writes) and the render layer (which reads and
//! subscribes). Each key holds at most one [`CacheEntry`]; writes are
//! last-writer-wins.
//!
//! TTLs mark entries *stale*, they never delete them: a stale read still
//! returns the last value (flagged, so the caller can refresh) and
//! eviction only happens through [`Store::remove`] / [`Store::clear`].
//! There is no sweeper timer -- the key space is small and bounded.

mod computed;

pub use computed::ComputedDef;

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry as MapEntry;
use serde_json::Value;

// ── Configuration ────────────────────────────────────────────────────

/// Operational knobs for the store.
#[derive(Debug, Clone, Default)]
pub struct StoreConfig {
    /// TTL applied by [`Store::set`] when the caller does not pick one.
    /// `None` means entries written that way never go stale.
    pub default_ttl: Option<Duration>,
}

// ── Entries ──────────────────────────────────────────────────────────

/// One cached value with its freshness bookkeeping.
#[derive(Debug, Clone)]
struct CacheEntry {
    value: Arc<Value>,
    stored_at: Instant,
    ttl: Option<Duration>,
    /// Globally monotonic change stamp; computed values memoize on it.
    version: u64,
}

/// What a read returns: the value plus its staleness flag.
#[derive(Debug, Clone)]
pub struct CacheRead {
    pub value: Arc<Value>,
    /// `true` once the entry's age exceeds its TTL. The value is still
    /// the last known one -- the caller decides whether to refresh.
    pub stale: bool,
    pub version: u64,
}

// ── Subscriptions ────────────────────────────────────────────────────

type Callback = Arc<dyn Fn(&str, &Value) + Send + Sync>;
type PanicHandler = Arc<dyn Fn(&str, String) + Send + Sync>;

struct Listener {
    id: u64,
    callback: Callback,
}

/// Handle returned by [`Store::subscribe`].
///
/// [`unsubscribe`](Self::unsubscribe) is idempotent and safe to call from
/// inside a notification callback: notification iterates over a snapshot
/// of the listener list, never the live registry.
pub struct SubscriptionHandle {
    store: Weak<StoreInner>,
    key: String,
    id: u64,
}

impl SubscriptionHandle {
    pub fn unsubscribe(&self) {
        let Some(inner) = self.store.upgrade() else {
            return;
        };
        let mut subs = lock_unpoisoned(&inner.subscribers);
        if let Some(listeners) = subs.get_mut(&self.key) {
            listeners.retain(|l| l.id != self.id);
            if listeners.is_empty() {
                subs.remove(&self.key);
            }
        }
    }
}

// ── Store ────────────────────────────────────────────────────────────

/// The reactive store. Cheaply cloneable; clones share state.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    entries: DashMap<String, CacheEntry>,
    subscribers: Mutex<HashMap<String, Vec<Listener>>>,
    computed: DashMap<String, ComputedDef>,
    next_listener_id: AtomicU64,
    /// Source of version stamps; global so a removed-then-rewritten key
    /// never reuses a stamp.
    version_counter: AtomicU64,
    config: StoreConfig,
    /// Invoked when a subscriber panics; installed by the sync service to
    /// route the failure into the error boundary.
    panic_handler: Mutex<Option<PanicHandler>>,
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Store {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                entries: DashMap::new(),
                subscribers: Mutex::new(HashMap::new()),
                computed: DashMap::new(),
                next_listener_id: AtomicU64::new(1),
                version_counter: AtomicU64::new(1),
                config,
                panic_handler: Mutex::new(None),
            }),
        }
    }

    /// Route subscriber panics somewhere useful (the error boundary).
    pub fn set_panic_handler(&self, handler: PanicHandler) {
        *lock_unpoisoned(&self.inner.panic_handler) = Some(handler);
    }

    // ── Writes ───────────────────────────────────────────────────────

    /// Store a value under `key` with the default TTL.
    pub fn set(&self, key: &str, value: Value) {
        self.set_with_ttl(key, value, self.inner.config.default_ttl);
    }

    /// Store a value under `key`.
    ///
    /// Subscribers are notified synchronously, in registration order,
    /// before this returns -- unless the new value is deeply equal to the
    /// current one. A deep-equal write still refreshes the entry's
    /// freshness clock (a refetch that returned identical data makes the
    /// entry fresh again without causing a redundant render).
    pub fn set_with_ttl(&self, key: &str, value: Value, ttl: Option<Duration>) {
        let value = Arc::new(value);
        let changed = {
            match self.inner.entries.entry(key.to_owned()) {
                MapEntry::Occupied(mut occupied) => {
                    let entry = occupied.get_mut();
                    if *entry.value == *value {
                        entry.stored_at = Instant::now();
                        entry.ttl = ttl;
                        false
                    } else {
                        *entry = CacheEntry {
                            value: Arc::clone(&value),
                            stored_at: Instant::now(),
                            ttl,
                            version: self.next_version(),
                        };
                        true
                    }
                }
                MapEntry::Vacant(vacant) => {
                    vacant.insert(CacheEntry {
                        value: Arc::clone(&value),
                        stored_at: Instant::now(),
                        ttl,
                        version: self.next_version(),
                    });
                    true
                }
            }
        };
        if changed {
            self.notify(key, &value);
        }
    }

    // ── Reads ────────────────────────────────────────────────────────

    /// Read `key`, reporting staleness. Stale entries are still returned.
    pub fn get(&self, key: &str) -> Option<CacheRead> {
        let entry = self.inner.entries.get(key)?;
        let stale = entry
            .ttl
            .is_some_and(|ttl| entry.stored_at.elapsed() > ttl);
        Some(CacheRead {
            value: Arc::clone(&entry.value),
            stale,
            version: entry.version,
        })
    }

    /// Read `key`, falling back to `default` for missing entries.
    pub fn value_or(&self, key: &str, default: Value) -> Arc<Value> {
        self.get(key)
            .map_or_else(|| Arc::new(default), |read| read.value)
    }

    /// Whether `key` exists and has outlived its TTL.
    pub fn is_stale(&self, key: &str) -> bool {
        self.get(key).is_some_and(|read| read.stale)
    }

    // ── Subscriptions ────────────────────────────────────────────────

    /// Register a callback invoked on every real change to `key`.
    ///
    /// Multiple subscriptions per key are legal; invocation order is
    /// registration order. A panicking callback is isolated: remaining
    /// callbacks still run and the failure goes to the panic handler.
    pub fn subscribe(
        &self,
        key: &str,
        callback: impl Fn(&str, &Value) + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        let mut subs = lock_unpoisoned(&self.inner.subscribers);
        subs.entry(key.to_owned()).or_default().push(Listener {
            id,
            callback: Arc::new(callback),
        });
        SubscriptionHandle {
            store: Arc::downgrade(&self.inner),
            key: key.to_owned(),
            id,
        }
    }

    fn notify(&self, key: &str, value: &Value) {
        // Snapshot under the lock, invoke outside it: callbacks may read
        // the store, write other keys, or unsubscribe themselves.
        let snapshot: Vec<Callback> = {
            let subs = lock_unpoisoned(&self.inner.subscribers);
            subs.get(key)
                .map(|listeners| listeners.iter().map(|l| Arc::clone(&l.callback)).collect())
                .unwrap_or_default()
        };

        for callback in snapshot {
            let result = catch_unwind(AssertUnwindSafe(|| callback(key, value)));
            if let Err(payload) = result {
                let detail = panic_message(payload.as_ref());
                tracing::error!(key, detail, "store subscriber panicked");
                let handler = lock_unpoisoned(&self.inner.panic_handler).clone();
                if let Some(handler) = handler {
                    handler(key, detail.to_owned());
                }
            }
        }
    }

    // ── Computed values ──────────────────────────────────────────────

    /// Register (or replace) a computed value derived from `deps`, and
    /// evaluate it once.
    ///
    /// The function must be pure over its dependency values. Reads
    /// through [`read_computed`](Self::read_computed) recompute only when
    /// some dependency's version changed since the cached result.
    pub fn computed(
        &self,
        key: &str,
        deps: &[&str],
        func: impl Fn(&[Option<Arc<Value>>]) -> Value + Send + Sync + 'static,
    ) -> Arc<Value> {
        let def = ComputedDef::new(deps, func);
        let value = def.evaluate(self);
        self.inner.computed.insert(key.to_owned(), def);
        value
    }

    /// Read a computed value, recomputing only if a dependency changed.
    /// Returns `None` for keys never registered via
    /// [`computed`](Self::computed).
    pub fn read_computed(&self, key: &str) -> Option<Arc<Value>> {
        // Clone the def's cheap handles out of the map so evaluation
        // never holds a shard lock.
        let def = self.inner.computed.get(key)?.clone();
        Some(def.evaluate(self))
    }

    // ── Eviction ─────────────────────────────────────────────────────

    /// Remove one entry. Subscribers are not notified -- removal is an
    /// eviction, not a value change.
    pub fn remove(&self, key: &str) {
        self.inner.entries.remove(key);
    }

    /// Drop every entry. Computed definitions stay registered; their
    /// memos invalidate naturally because dependency versions change.
    pub fn clear(&self) {
        self.inner.entries.clear();
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    fn next_version(&self) -> u64 {
        self.inner.version_counter.fetch_add(1, Ordering::Relaxed)
    }
}

/// Best-effort extraction of a panic payload message.
fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

// ── Tests ────────────────────────────────────────────────────────────
