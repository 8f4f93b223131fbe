// Behavior tests for `RpcClient` using wiremock: deduplication, batching,
// partial failure, retry, and timeout handling.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use tokio_test::assert_ok;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use nodepulse_api::{CallConfig, Error, RpcClient, TransportConfig};

// ── Helpers ─────────────────────────────────────────────────────────

/// Responds to single or batched JSON-RPC requests, echoing request ids.
/// The handler maps `(method, params)` to a result or an `(code, message)`
/// error per entry.
struct RpcResponder<F> {
    handler: F,
    delay: Option<Duration>,
}

impl<F> Respond for RpcResponder<F>
where
    F: Fn(&str, &Value) -> Result<Value, (i64, String)> + Send + Sync,
{
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: Value = serde_json::from_slice(&request.body).unwrap();
        let respond_one = |entry: &Value| -> Value {
            let id = entry["id"].clone();
            let rpc_method = entry["method"].as_str().unwrap_or_default();
            match (self.handler)(rpc_method, &entry["params"]) {
                Ok(result) => json!({"jsonrpc":"2.0","result":result,"id":id}),
                Err((code, message)) => {
                    json!({"jsonrpc":"2.0","error":{"code":code,"message":message},"id":id})
                }
            }
        };
        let response_body = match &body {
            Value::Array(entries) => Value::Array(entries.iter().map(respond_one).collect()),
            entry => respond_one(entry),
        };
        let mut template = ResponseTemplate::new(200).set_body_json(response_body);
        if let Some(delay) = self.delay {
            template = template.set_delay(delay);
        }
        template
    }
}

fn fast_config() -> CallConfig {
    CallConfig {
        call_timeout: Duration::from_millis(200),
        retry_limit: 2,
        retry_backoff: Duration::from_millis(10),
        batching: true,
        batch_window: Duration::from_millis(20),
        max_batch: 16,
    }
}

async fn client_for(server: &MockServer, config: CallConfig) -> RpcClient {
    let endpoint = Url::parse(&server.uri()).unwrap();
    RpcClient::new(endpoint, &TransportConfig::default(), config).unwrap()
}

// ── Deduplication ───────────────────────────────────────────────────

#[tokio::test]
async fn concurrent_identical_calls_share_one_exchange() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(RpcResponder {
            handler: |_m: &str, _p: &Value| Ok(json!({"height": 100})),
            delay: Some(Duration::from_millis(100)),
        })
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server, fast_config()).await;

    let (a, b, c) = tokio::join!(
        client.call("chain.getStatus", json!([])),
        client.call("chain.getStatus", json!([])),
        client.call("chain.getStatus", json!([])),
    );

    assert_eq!(a.unwrap()["height"], 100);
    assert_eq!(b.unwrap()["height"], 100);
    assert_eq!(c.unwrap()["height"], 100);
    assert_eq!(client.in_flight(), 0);
}

#[tokio::test]
async fn distinct_params_are_not_deduplicated() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(RpcResponder {
            handler: |_m: &str, params: &Value| Ok(json!({"echo": params.clone()})),
            delay: None,
        })
        .mount(&server)
        .await;

    let client = client_for(&server, fast_config()).await;

    let (a, b) = tokio::join!(
        client.call("market.getTicker", json!(["PULSE-USD"])),
        client.call("market.getTicker", json!(["PULSE-EUR"])),
    );

    assert_eq!(a.unwrap()["echo"], json!(["PULSE-USD"]));
    assert_eq!(b.unwrap()["echo"], json!(["PULSE-EUR"]));
}

// ── Batching ────────────────────────────────────────────────────────

#[tokio::test]
async fn batch_coalesces_into_one_request_and_fails_per_entry() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(RpcResponder {
            handler: |m: &str, _p: &Value| {
                if m == "net.getPeers" {
                    Err((-32050, "peer table unavailable".to_owned()))
                } else {
                    Ok(json!({"ok": m}))
                }
            },
            delay: None,
        })
        // One wire request: the three entries coalesce into a single batch.
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server, fast_config()).await;

    let calls = vec![
        ("chain.getStatus".to_owned(), json!([])),
        ("net.getPeers".to_owned(), json!([])),
        ("market.getTicker".to_owned(), json!(["PULSE-USD"])),
    ];
    let results = client.call_batch(&calls).await;

    assert_eq!(results.len(), 3);
    assert_eq!(results[0].as_ref().unwrap()["ok"], "chain.getStatus");
    match &results[1] {
        Err(Error::Rpc { code, message, .. }) => {
            assert_eq!(*code, -32050);
            assert_eq!(message, "peer table unavailable");
        }
        other => panic!("expected Rpc error for entry 1, got {other:?}"),
    }
    assert_eq!(results[2].as_ref().unwrap()["ok"], "market.getTicker");
}

// ── Retry & timeout ─────────────────────────────────────────────────

#[tokio::test]
async fn transient_http_failure_is_retried() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(RpcResponder {
            handler: |_m: &str, _p: &Value| Ok(json!({"height": 7})),
            delay: None,
        })
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server, fast_config()).await;
    let value = tokio_test::assert_ok!(client.call("chain.getStatus", json!([])).await);
    assert_eq!(value["height"], 7);
}

#[tokio::test]
async fn timeout_retries_then_surfaces_terminal_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"jsonrpc":"2.0","result":{},"id":1}))
                .set_delay(Duration::from_secs(5)),
        )
        .expect(2)
        .mount(&server)
        .await;

    let config = CallConfig {
        call_timeout: Duration::from_millis(50),
        retry_limit: 1,
        ..fast_config()
    };
    let client = client_for(&server, config).await;

    let result = client.call("chain.getStatus", json!([])).await;
    match result {
        Err(Error::Timeout { timeout_ms }) => assert_eq!(timeout_ms, 50),
        other => panic!("expected Timeout, got {other:?}"),
    }
    assert_eq!(client.in_flight(), 0);
}

#[tokio::test]
async fn rpc_error_response_is_never_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(RpcResponder {
            handler: |_m: &str, _p: &Value| Err((-32601, "method not found".to_owned())),
            delay: None,
        })
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server, fast_config()).await;
    let result = client.call("chain.getBogus", json!([])).await;
    match result {
        Err(Error::Rpc { code, .. }) => assert_eq!(code, -32601),
        other => panic!("expected Rpc error, got {other:?}"),
    }
}

#[tokio::test]
async fn client_error_status_is_terminal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server, fast_config()).await;
    let result = client.call("chain.getStatus", json!([])).await;
    match result {
        Err(Error::HttpStatus { status, .. }) => assert_eq!(status, 404),
        other => panic!("expected HttpStatus, got {other:?}"),
    }
}

// ── Response-matching edge cases ────────────────────────────────────

/// Echoes the request id but also appends a response for an id the client
/// never issued; the stray entry must be discarded without breaking the
/// real call.
struct StrayIdResponder;

impl Respond for StrayIdResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: Value = serde_json::from_slice(&request.body).unwrap();
        let id = body["id"].clone();
        ResponseTemplate::new(200).set_body_json(json!([
            {"jsonrpc":"2.0","result":{"height":55},"id":id},
            {"jsonrpc":"2.0","result":{"height":999},"id":987_654},
        ]))
    }
}

#[tokio::test]
async fn unknown_response_id_is_discarded() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(StrayIdResponder)
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server, fast_config()).await;
    let result = client.call("chain.getStatus", json!([])).await;
    assert_eq!(result.unwrap()["height"], 55);
}

/// First request: loses the entry (empty batch response). Second request:
/// answers properly. The client must treat the missing id as lost and
/// retry.
struct LoseFirstResponder {
    requests: Arc<AtomicUsize>,
}

impl Respond for LoseFirstResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let n = self.requests.fetch_add(1, Ordering::SeqCst);
        if n == 0 {
            return ResponseTemplate::new(200).set_body_json(json!([]));
        }
        let body: Value = serde_json::from_slice(&request.body).unwrap();
        let id = body["id"].clone();
        ResponseTemplate::new(200)
            .set_body_json(json!({"jsonrpc":"2.0","result":{"height":31},"id":id}))
    }
}

#[tokio::test]
async fn missing_response_id_is_treated_as_lost_and_retried() {
    let server = MockServer::start().await;
    let requests = Arc::new(AtomicUsize::new(0));
    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(LoseFirstResponder {
            requests: Arc::clone(&requests),
        })
        .expect(2)
        .mount(&server)
        .await;

    let client = client_for(&server, fast_config()).await;
    let result = client.call("chain.getStatus", json!([])).await;
    assert_eq!(result.unwrap()["height"], 31);
    assert_eq!(requests.load(Ordering::SeqCst), 2);
}
