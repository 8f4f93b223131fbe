//! Process-wide error boundary.
//!
//! Every failure from the transport layer, the store, and caller-supplied
//! logic funnels through [`ErrorBoundary::handle`]. The boundary
//! classifies it, records it in a bounded ring buffer, deduplicates by
//! `(kind, message)`, throttles user-visible notification, and optionally
//! forwards the record to a remote log sink (best-effort, never
//! recursive).
//!
//! This is the only place that produces user-facing error copy --
//! components above surface raw `CoreError`s and nothing else.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use nodepulse_api::{Error as ApiError, ErrorReport, ErrorReporter};

use crate::error::CoreError;

const NOTICE_CHANNEL_CAPACITY: usize = 256;

// ── Classification ───────────────────────────────────────────────────

/// User-facing failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    /// Socket-level failure (dial, drop, dead heartbeat).
    Connection,
    /// Malformed or unexpected frame/envelope.
    Protocol,
    /// No response within budget.
    Timeout,
    /// Well-formed error response from the remote node.
    Rpc,
    /// Caller-supplied/business-logic failure.
    Application,
    Unknown,
}

/// Map an error to its category.
pub fn classify(error: &CoreError) -> ErrorKind {
    match error {
        CoreError::Api(api) => match api {
            ApiError::Connect(_) | ApiError::ConnectionClosed(_) | ApiError::QueueOverflow => {
                ErrorKind::Connection
            }
            ApiError::Http(_) | ApiError::HttpStatus { .. } => ErrorKind::Connection,
            ApiError::Timeout { .. } => ErrorKind::Timeout,
            ApiError::Protocol(_) | ApiError::Serialization(_) => ErrorKind::Protocol,
            ApiError::Rpc { .. } => ErrorKind::Rpc,
            ApiError::InvalidUrl(_) | ApiError::ClientClosed => ErrorKind::Unknown,
        },
        CoreError::Decode { .. } => ErrorKind::Protocol,
        CoreError::Application(_) => ErrorKind::Application,
    }
}

/// Human-readable headline for a category. Raw protocol detail never
/// reaches the user through this path.
fn headline_for(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::Connection => "Connection trouble -- retrying",
        ErrorKind::Protocol => "Received unexpected data from the node",
        ErrorKind::Timeout => "The node is slow to respond",
        ErrorKind::Rpc => "The node rejected a request",
        ErrorKind::Application => "Dashboard internal error",
        ErrorKind::Unknown => "Something went wrong",
    }
}

// ── Records & notices ────────────────────────────────────────────────

/// One entry in the bounded error log.
#[derive(Debug, Clone)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
    pub context: String,
    pub timestamp: DateTime<Utc>,
    /// How many times this `(kind, message)` pair has occurred within the
    /// current dedupe window.
    pub occurrences: u64,
}

impl ErrorRecord {
    /// The key repeats fold on: kind plus message.
    pub fn dedupe_key(&self) -> String {
        format!("{}:{}", self.kind, self.message)
    }
}

/// A user-visible notification, already throttled and deduplicated.
#[derive(Debug, Clone)]
pub struct UserNotice {
    pub kind: ErrorKind,
    pub headline: &'static str,
    pub detail: String,
    pub occurrences: u64,
    /// Sticky notices stay up until explicitly cleared (degraded
    /// connectivity) instead of toasting repeatedly.
    pub sticky: bool,
}

/// Aggregate counters returned by [`ErrorBoundary::stats`].
#[derive(Debug, Clone)]
pub struct BoundaryStats {
    pub total: u64,
    pub by_kind: HashMap<ErrorKind, u64>,
    pub unique: usize,
    pub suppressed: u64,
    pub notified: u64,
    pub buffered: usize,
}

// ── Configuration ────────────────────────────────────────────────────

/// Operational knobs for the boundary.
#[derive(Debug, Clone)]
pub struct BoundaryConfig {
    /// Ring buffer bound; oldest records are evicted first. Default: 256.
    pub max_records: usize,

    /// Re-notify every Kth repeat of a deduplicated error. `0` disables
    /// re-notification (first occurrence only). Default: 25.
    pub renotify_every: u64,

    /// Idle time after which a deduplicated error's counter resets and
    /// its next occurrence notifies again. Default: 30s.
    pub dedupe_window: Duration,
}

impl Default for BoundaryConfig {
    fn default() -> Self {
        Self {
            max_records: 256,
            renotify_every: 25,
            dedupe_window: Duration::from_secs(30),
        }
    }
}

// ── ErrorBoundary ────────────────────────────────────────────────────

struct SeenEntry {
    count: u64,
    last_seen: Instant,
}

struct SuppressRule {
    kind: Option<ErrorKind>,
    pattern: String,
}

/// The boundary. Cheaply cloneable; clones share all state.
#[derive(Clone)]
pub struct ErrorBoundary {
    inner: Arc<BoundaryInner>,
}

struct BoundaryInner {
    config: BoundaryConfig,
    records: Mutex<VecDeque<ErrorRecord>>,
    seen: Mutex<HashMap<String, SeenEntry>>,
    rules: Mutex<Vec<SuppressRule>>,
    by_kind: Mutex<HashMap<ErrorKind, u64>>,
    total: AtomicU64,
    suppressed: AtomicU64,
    notified: AtomicU64,
    degraded: AtomicBool,
    notice_tx: broadcast::Sender<UserNotice>,
    reporter: Option<ErrorReporter>,
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl ErrorBoundary {
    /// Build a boundary. `reporter` optionally forwards every record to a
    /// remote log endpoint, best-effort.
    pub fn new(config: BoundaryConfig, reporter: Option<ErrorReporter>) -> Self {
        let (notice_tx, _) = broadcast::channel(NOTICE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(BoundaryInner {
                config,
                records: Mutex::new(VecDeque::new()),
                seen: Mutex::new(HashMap::new()),
                rules: Mutex::new(Vec::new()),
                by_kind: Mutex::new(HashMap::new()),
                total: AtomicU64::new(0),
                suppressed: AtomicU64::new(0),
                notified: AtomicU64::new(0),
                degraded: AtomicBool::new(false),
                notice_tx,
                reporter,
            }),
        }
    }

    /// Subscribe to user-visible notices.
    pub fn notices(&self) -> broadcast::Receiver<UserNotice> {
        self.inner.notice_tx.subscribe()
    }

    /// Route one error through the boundary.
    pub fn handle(&self, error: &CoreError, context: &str) {
        self.ingest(classify(error), error.to_string(), context);
    }

    /// Route a caller-supplied failure that never became a `CoreError`
    /// (store subscriber panics use this).
    pub fn report_application(&self, context: &str, detail: String) {
        self.ingest(ErrorKind::Application, detail, context);
    }

    /// Run a fallible future, routing any `Err` through [`handle`].
    ///
    /// This is the async form of a `wrap()` helper: callers that have no
    /// better place for an error get `None` back and the boundary does
    /// the surfacing.
    pub async fn run<T>(
        &self,
        context: &str,
        fut: impl Future<Output = Result<T, CoreError>>,
    ) -> Option<T> {
        match fut.await {
            Ok(value) => Some(value),
            Err(error) => {
                self.handle(&error, context);
                None
            }
        }
    }

    /// Record-but-never-notify errors matching `pattern` (substring of
    /// the message). `kind: None` matches every kind.
    pub fn suppress(&self, kind: Option<ErrorKind>, pattern: &str) {
        lock_unpoisoned(&self.inner.rules).push(SuppressRule {
            kind,
            pattern: pattern.to_owned(),
        });
    }

    /// Raise the sticky degraded-connectivity notice. Idempotent: only
    /// the first call after a [`clear_degraded`](Self::clear_degraded)
    /// produces a notice.
    pub fn notify_degraded(&self, detail: &str) {
        if self.inner.degraded.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.notified.fetch_add(1, Ordering::Relaxed);
        let _ = self.inner.notice_tx.send(UserNotice {
            kind: ErrorKind::Connection,
            headline: "Live data unavailable -- showing last known values",
            detail: detail.to_owned(),
            occurrences: 1,
            sticky: true,
        });
    }

    /// Clear the degraded indicator (connectivity restored).
    pub fn clear_degraded(&self) {
        self.inner.degraded.store(false, Ordering::SeqCst);
    }

    /// Whether the degraded indicator is currently raised.
    pub fn is_degraded(&self) -> bool {
        self.inner.degraded.load(Ordering::SeqCst)
    }

    /// Aggregate counters.
    pub fn stats(&self) -> BoundaryStats {
        BoundaryStats {
            total: self.inner.total.load(Ordering::Relaxed),
            by_kind: lock_unpoisoned(&self.inner.by_kind).clone(),
            unique: lock_unpoisoned(&self.inner.seen).len(),
            suppressed: self.inner.suppressed.load(Ordering::Relaxed),
            notified: self.inner.notified.load(Ordering::Relaxed),
            buffered: lock_unpoisoned(&self.inner.records).len(),
        }
    }

    /// Snapshot of the record buffer, oldest first.
    pub fn recent(&self) -> Vec<ErrorRecord> {
        lock_unpoisoned(&self.inner.records).iter().cloned().collect()
    }

    // ── Internals ────────────────────────────────────────────────────

    fn ingest(&self, kind: ErrorKind, message: String, context: &str) {
        self.inner.total.fetch_add(1, Ordering::Relaxed);
        *lock_unpoisoned(&self.inner.by_kind).entry(kind).or_insert(0) += 1;

        let dedupe_key = format!("{kind}:{message}");
        let occurrences = {
            let mut seen = lock_unpoisoned(&self.inner.seen);
            let entry = seen.entry(dedupe_key).or_insert(SeenEntry {
                count: 0,
                last_seen: Instant::now(),
            });
            if entry.last_seen.elapsed() > self.inner.config.dedupe_window {
                entry.count = 0;
            }
            entry.count += 1;
            entry.last_seen = Instant::now();
            entry.count
        };

        self.buffer_record(kind, &message, context, occurrences);
        self.forward(kind, &message, context);

        if self.is_suppressed(kind, &message) {
            self.inner.suppressed.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(%kind, message = %message, "error suppressed by rule");
            return;
        }

        // First occurrence always notifies; repeats only every Kth.
        let renotify = self.inner.config.renotify_every;
        let due = occurrences == 1 || (renotify > 0 && occurrences % renotify == 0);
        if !due {
            return;
        }

        self.inner.notified.fetch_add(1, Ordering::Relaxed);
        let _ = self.inner.notice_tx.send(UserNotice {
            kind,
            headline: headline_for(kind),
            detail: message,
            occurrences,
            sticky: false,
        });
    }

    /// Append to the ring buffer; repeats update the existing record
    /// instead of growing the buffer.
    fn buffer_record(&self, kind: ErrorKind, message: &str, context: &str, occurrences: u64) {
        let mut records = lock_unpoisoned(&self.inner.records);
        if occurrences > 1 {
            if let Some(existing) = records
                .iter_mut()
                .find(|r| r.kind == kind && r.message == message)
            {
                existing.occurrences = occurrences;
                existing.timestamp = Utc::now();
                return;
            }
        }
        if records.len() >= self.inner.config.max_records {
            records.pop_front();
        }
        records.push_back(ErrorRecord {
            kind,
            message: message.to_owned(),
            context: context.to_owned(),
            timestamp: Utc::now(),
            occurrences,
        });
    }

    fn is_suppressed(&self, kind: ErrorKind, message: &str) -> bool {
        lock_unpoisoned(&self.inner.rules).iter().any(|rule| {
            rule.kind.is_none_or(|k| k == kind) && message.contains(&rule.pattern)
        })
    }

    /// Forward to the remote sink, best-effort. Failures inside the sink
    /// are logged there and never come back through the boundary.
    fn forward(&self, kind: ErrorKind, message: &str, context: &str) {
        let Some(reporter) = self.inner.reporter.clone() else {
            return;
        };
        let report = ErrorReport {
            kind: kind.to_string(),
            message: message.to_owned(),
            context: context.to_owned(),
            timestamp: Utc::now(),
        };
        // `handle()` must stay callable from sync contexts; skip
        // forwarding when no runtime is around (tests, teardown).
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move { reporter.submit(report).await });
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────
