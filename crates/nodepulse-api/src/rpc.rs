//! JSON-RPC 2.0 client with deduplication, batching, retry, and timeout.
//!
//! Every call computes a signature from `(method, params)`. Concurrent
//! calls with the same signature share one in-flight exchange: later
//! callers attach a resolver to the existing [`PendingCall`] and receive
//! the same eventual outcome. New calls are handed to a dispatcher task
//! that coalesces everything queued within a small window into one batch
//! request.
//!
//! Timeouts and transient transport failures are retried per call with
//! exponential backoff up to a ceiling; error responses from the remote
//! are terminal and never retried.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use url::Url;

use crate::error::Error;
use crate::protocol::{RpcRequest, parse_rpc_body};
use crate::transport::TransportConfig;

// ── CallConfig ───────────────────────────────────────────────────────

/// Operational knobs for the RPC client.
#[derive(Debug, Clone)]
pub struct CallConfig {
    /// Budget for one attempt (request sent to response body parsed).
    /// Default: 10s.
    pub call_timeout: Duration,

    /// Retries after the first attempt for timeouts and transient
    /// transport failures. Default: 2.
    pub retry_limit: u32,

    /// Base retry backoff; doubles per attempt. Default: 250ms.
    pub retry_backoff: Duration,

    /// Whether calls queued in the same dispatch window are coalesced
    /// into a single batch request. Default: true.
    pub batching: bool,

    /// How long the dispatcher waits for more calls to coalesce before
    /// sending. Default: 2ms.
    pub batch_window: Duration,

    /// Upper bound on entries per batch request. Default: 16.
    pub max_batch: usize,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(10),
            retry_limit: 2,
            retry_backoff: Duration::from_millis(250),
            batching: true,
            batch_window: Duration::from_millis(2),
            max_batch: 16,
        }
    }
}

// ── Pending calls ────────────────────────────────────────────────────

type CallOutcome = Result<Value, Error>;

/// One in-flight request. All concurrent callers with the same signature
/// share this record through its resolver list.
struct PendingCall {
    id: u64,
    created_at: Instant,
    resolvers: Vec<oneshot::Sender<CallOutcome>>,
}

/// A unit of work for the dispatcher: one call attempt.
struct Dispatch {
    signature: String,
    id: u64,
    method: String,
    params: Value,
    attempt: u32,
}

/// The dedup key: method plus the params rendered to canonical JSON text.
fn call_signature(method: &str, params: &Value) -> String {
    format!("{method}:{params}")
}

// ── RpcClient ────────────────────────────────────────────────────────

/// Typed JSON-RPC client for the node's request/response endpoint.
///
/// Cheaply cloneable; all clones share the in-flight table and the
/// dispatcher task. The dispatcher shuts down when the last clone drops.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<RpcInner>,
}

struct RpcInner {
    http: reqwest::Client,
    endpoint: Url,
    config: CallConfig,
    next_id: AtomicU64,
    /// signature -> in-flight call. Guarded by a std mutex; never held
    /// across an await.
    pending: Mutex<HashMap<String, PendingCall>>,
    dispatch_tx: mpsc::UnboundedSender<Dispatch>,
}

impl RpcClient {
    /// Build a client for `endpoint` and spawn its dispatcher task.
    pub fn new(
        endpoint: Url,
        transport: &TransportConfig,
        config: CallConfig,
    ) -> Result<Self, Error> {
        let http = transport.build_client()?;
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(RpcInner {
            http,
            endpoint,
            config,
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            dispatch_tx,
        });

        tokio::spawn(dispatch_loop(Arc::downgrade(&inner), dispatch_rx));

        Ok(Self { inner })
    }

    /// Issue a single call.
    ///
    /// If an identical `(method, params)` call is already in flight, this
    /// attaches to it instead of issuing new network work, and resolves
    /// with the same outcome.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, Error> {
        let signature = call_signature(method, &params);
        let (tx, rx) = oneshot::channel();

        let dispatch = {
            let mut pending = match self.inner.pending.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some(call) = pending.get_mut(&signature) {
                tracing::debug!(method, id = call.id, "joining in-flight call");
                call.resolvers.push(tx);
                None
            } else {
                let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                pending.insert(
                    signature.clone(),
                    PendingCall {
                        id,
                        created_at: Instant::now(),
                        resolvers: vec![tx],
                    },
                );
                Some(Dispatch {
                    signature,
                    id,
                    method: method.to_owned(),
                    params,
                    attempt: 0,
                })
            }
        };

        if let Some(dispatch) = dispatch {
            self.inner
                .dispatch_tx
                .send(dispatch)
                .map_err(|_| Error::ClientClosed)?;
        }

        rx.await.map_err(|_| Error::ClientClosed)?
    }

    /// Issue several calls, preserving positional correspondence.
    ///
    /// Entries fail independently: a rejected entry resolves as `Err` in
    /// its slot while its siblings resolve normally. With batching
    /// enabled the entries coalesce into one wire request.
    pub async fn call_batch(&self, calls: &[(String, Value)]) -> Vec<Result<Value, Error>> {
        futures_util::future::join_all(
            calls
                .iter()
                .map(|(method, params)| self.call(method, params.clone())),
        )
        .await
    }

    /// Number of distinct in-flight calls (visible for tests/diagnostics).
    pub fn in_flight(&self) -> usize {
        match self.inner.pending.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

// ── Dispatcher ───────────────────────────────────────────────────────

/// Receives dispatches, coalesces a batch, and runs each exchange as its
/// own task so a slow batch never stalls later calls.
async fn dispatch_loop(inner: Weak<RpcInner>, mut rx: mpsc::UnboundedReceiver<Dispatch>) {
    while let Some(first) = rx.recv().await {
        let Some(inner) = inner.upgrade() else { break };

        let mut batch = vec![first];
        if inner.config.batching {
            if !inner.config.batch_window.is_zero() {
                tokio::time::sleep(inner.config.batch_window).await;
            }
            while batch.len() < inner.config.max_batch {
                match rx.try_recv() {
                    Ok(dispatch) => batch.push(dispatch),
                    Err(_) => break,
                }
            }
        }

        tokio::spawn(execute_batch(inner, batch));
    }
    tracing::debug!("rpc dispatcher exiting");
}

/// One wire exchange for a batch (or single) request.
async fn execute_batch(inner: Arc<RpcInner>, batch: Vec<Dispatch>) {
    let body: Value = if batch.len() == 1 {
        let entry = &batch[0];
        request_value(entry)
    } else {
        Value::Array(batch.iter().map(request_value).collect())
    };

    tracing::debug!(
        entries = batch.len(),
        ids = ?batch.iter().map(|d| d.id).collect::<Vec<_>>(),
        "dispatching rpc exchange"
    );

    let exchange = async {
        let response = inner
            .http
            .post(inner.endpoint.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::HttpStatus {
                status: status.as_u16(),
                message: status
                    .canonical_reason()
                    .unwrap_or("unexpected status")
                    .to_owned(),
            });
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| Error::Protocol(format!("malformed RPC response body: {e}")))
    };

    let outcome = match tokio::time::timeout(inner.config.call_timeout, exchange).await {
        Err(_) => Err(Error::Timeout {
            timeout_ms: u64::try_from(inner.config.call_timeout.as_millis()).unwrap_or(u64::MAX),
        }),
        Ok(result) => result,
    };

    match outcome {
        Err(error) => {
            // Whole-exchange failure: every entry follows the retry policy
            // independently.
            for entry in batch {
                retry_or_resolve(&inner, entry, error.clone());
            }
        }
        Ok(raw_body) => {
            let responses = match parse_rpc_body(raw_body) {
                Ok(parsed) => parsed,
                Err(error) => {
                    for entry in batch {
                        resolve(&inner, &entry.signature, Err(error.clone()));
                    }
                    return;
                }
            };

            // Responses may arrive in any order; match strictly by id.
            let mut by_id: HashMap<u64, crate::protocol::RpcResponse> = responses
                .into_iter()
                .filter_map(|r| r.id.map(|id| (id, r)))
                .collect();

            for entry in batch {
                match by_id.remove(&entry.id) {
                    Some(response) => match response.error {
                        // Definitive remote decision: surface immediately,
                        // never retry.
                        Some(err) => resolve(&inner, &entry.signature, Err(err.into())),
                        None => resolve(
                            &inner,
                            &entry.signature,
                            Ok(response.result.unwrap_or(Value::Null)),
                        ),
                    },
                    // Missing id: the entry was lost somewhere.
                    None => retry_or_resolve(
                        &inner,
                        entry,
                        Error::Timeout {
                            timeout_ms: u64::try_from(inner.config.call_timeout.as_millis())
                                .unwrap_or(u64::MAX),
                        },
                    ),
                }
            }

            for (id, _) in by_id {
                tracing::warn!(id, "response for unknown request id, discarding");
            }
        }
    }
}

fn request_value(entry: &Dispatch) -> Value {
    serde_json::to_value(RpcRequest::new(
        entry.method.clone(),
        entry.params.clone(),
        entry.id,
    ))
    .unwrap_or(Value::Null)
}

/// Apply the bounded retry policy to one failed entry.
fn retry_or_resolve(inner: &Arc<RpcInner>, mut entry: Dispatch, error: Error) {
    if error.is_transient() && entry.attempt < inner.config.retry_limit {
        let delay = inner.config.retry_backoff * 2u32.saturating_pow(entry.attempt);
        entry.attempt += 1;
        tracing::debug!(
            method = %entry.method,
            id = entry.id,
            attempt = entry.attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %error,
            "retrying call"
        );
        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if inner.dispatch_tx.send(entry).is_err() {
                tracing::debug!("dispatcher gone, dropping retry");
            }
        });
    } else {
        tracing::debug!(
            method = %entry.method,
            id = entry.id,
            attempts = entry.attempt + 1,
            error = %error,
            "call failed terminally"
        );
        resolve(inner, &entry.signature, Err(error));
    }
}

/// Remove the pending record and hand the outcome to every resolver.
fn resolve(inner: &Arc<RpcInner>, signature: &str, outcome: CallOutcome) {
    let call = {
        let mut pending = match inner.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        pending.remove(signature)
    };
    let Some(call) = call else {
        tracing::warn!(signature, "resolved a call with no pending record");
        return;
    };
    tracing::debug!(
        signature,
        id = call.id,
        callers = call.resolvers.len(),
        elapsed_ms = u64::try_from(call.created_at.elapsed().as_millis()).unwrap_or(u64::MAX),
        ok = outcome.is_ok(),
        "call resolved"
    );
    for resolver in call.resolvers {
        let _ = resolver.send(outcome.clone());
    }
}

// ── Tests ────────────────────────────────────────────────────────────
