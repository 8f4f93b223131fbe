// Behavior tests for the connection manager against a real local
// WebSocket server: queue flushing, push frames, heartbeats, reconnect
// backoff, and give-up handling.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use url::Url;

use nodepulse_api::protocol::StreamFrame;
use nodepulse_api::ws::{
    ConnEvent, ConnectionHandle, ConnectionState, ReconnectPolicy, StreamConfig,
};

// ── Helpers ─────────────────────────────────────────────────────────

/// Opt-in log output for debugging: `RUST_LOG=debug cargo test`.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn fast_config() -> StreamConfig {
    StreamConfig {
        reconnect: ReconnectPolicy {
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(80),
            multiplier: 2.0,
            max_retries: Some(2),
        },
        // Long heartbeat so it stays out of the way unless a test wants it.
        heartbeat_interval: Duration::from_secs(30),
        heartbeat_grace: Duration::from_secs(10),
        outbound_queue_limit: 8,
        malformed_frame_limit: 8,
    }
}

async fn bound_listener() -> (TcpListener, Url) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let url = Url::parse(&format!("ws://{addr}/stream")).unwrap();
    (listener, url)
}

async fn accept_ws(listener: &TcpListener) -> WebSocketStream<TcpStream> {
    let (socket, _) = listener.accept().await.unwrap();
    tokio_tungstenite::accept_async(socket).await.unwrap()
}

async fn next_event(rx: &mut tokio::sync::broadcast::Receiver<ConnEvent>) -> ConnEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Read text frames until `predicate` matches, skipping everything else
/// (heartbeat pings, etc.).
async fn next_text_matching(
    server: &mut WebSocketStream<TcpStream>,
    predicate: impl Fn(&str) -> bool,
) -> String {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let frame = tokio::time::timeout_at(deadline, server.next())
            .await
            .expect("timed out waiting for frame")
            .expect("server stream ended")
            .expect("server stream error");
        if let Message::Text(text) = frame {
            if predicate(text.as_str()) {
                return text.as_str().to_owned();
            }
        }
    }
}

// ── Queue flush ordering ────────────────────────────────────────────

#[tokio::test]
async fn messages_sent_while_disconnected_flush_in_order() {
    init_tracing();
    let (listener, url) = bound_listener().await;
    let cancel = CancellationToken::new();
    let handle = ConnectionHandle::connect(url, fast_config(), cancel.clone());
    let mut events = handle.events();

    // The listener is not accepting yet, so the handshake pends and these
    // all land in the offline queue.
    handle.send(r#"{"seq":"A"}"#);
    handle.send(r#"{"seq":"B"}"#);
    handle.send(r#"{"seq":"C"}"#);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut server = accept_ws(&listener).await;

    loop {
        if matches!(next_event(&mut events).await, ConnEvent::Connected) {
            break;
        }
    }

    let first = next_text_matching(&mut server, |t| t.contains("seq")).await;
    let second = next_text_matching(&mut server, |t| t.contains("seq")).await;
    let third = next_text_matching(&mut server, |t| t.contains("seq")).await;
    assert!(first.contains('A'), "expected A first, got {first}");
    assert!(second.contains('B'), "expected B second, got {second}");
    assert!(third.contains('C'), "expected C third, got {third}");

    let metrics = handle.metrics();
    assert_eq!(metrics.frames_sent, 3);
    assert_eq!(metrics.state, ConnectionState::Open);

    handle.disconnect();
}

// ── Push frames ─────────────────────────────────────────────────────

#[tokio::test]
async fn push_updates_surface_as_message_events() {
    let (listener, url) = bound_listener().await;
    let cancel = CancellationToken::new();
    let handle = ConnectionHandle::connect(url, fast_config(), cancel.clone());
    let mut events = handle.events();

    let mut server = accept_ws(&listener).await;
    server
        .send(Message::text(
            r#"{"type":"height_update","data":{"height":184002}}"#,
        ))
        .await
        .unwrap();
    // An unknown frame kind must be ignored, not dropped silently into
    // the message stream and not treated as an error.
    server
        .send(Message::text(r#"{"type":"server_notice","text":"hi"}"#))
        .await
        .unwrap();
    server
        .send(Message::text(
            r#"{"type":"market_update","data":{"pair":"PULSE-USD","price":3.21}}"#,
        ))
        .await
        .unwrap();

    let mut updates = Vec::new();
    while updates.len() < 2 {
        if let ConnEvent::Message(frame) = next_event(&mut events).await {
            updates.push(frame);
        }
    }

    match updates[0].as_ref() {
        StreamFrame::Update { topic, data } => {
            assert_eq!(topic, "height");
            assert_eq!(data["height"], 184_002);
        }
        other => panic!("expected height update, got {other:?}"),
    }
    match updates[1].as_ref() {
        StreamFrame::Update { topic, data } => {
            assert_eq!(topic, "market");
            assert_eq!(data["price"], 3.21);
        }
        other => panic!("expected market update, got {other:?}"),
    }

    handle.disconnect();
}

// ── Heartbeat ───────────────────────────────────────────────────────

#[tokio::test]
async fn server_ping_is_answered_with_matching_pong() {
    let (listener, url) = bound_listener().await;
    let cancel = CancellationToken::new();
    let handle = ConnectionHandle::connect(url, fast_config(), cancel.clone());

    let mut server = accept_ws(&listener).await;
    server
        .send(Message::text(r#"{"type":"ping","timestamp":123456}"#))
        .await
        .unwrap();

    let pong = next_text_matching(&mut server, |t| t.contains("pong")).await;
    let frame = StreamFrame::parse(&pong).unwrap();
    assert_eq!(frame, StreamFrame::Pong { timestamp: 123_456 });

    handle.disconnect();
}

#[tokio::test]
async fn missing_pong_forces_reconnection() {
    init_tracing();
    let (listener, url) = bound_listener().await;
    let config = StreamConfig {
        heartbeat_interval: Duration::from_millis(50),
        heartbeat_grace: Duration::from_millis(40),
        ..fast_config()
    };
    let cancel = CancellationToken::new();
    let handle = ConnectionHandle::connect(url, config, cancel.clone());
    let mut events = handle.events();

    // Accept the connection but never answer pings.
    let mut server = accept_ws(&listener).await;
    tokio::spawn(async move { while server.next().await.is_some() {} });

    loop {
        match next_event(&mut events).await {
            ConnEvent::Disconnected { reason } => {
                assert!(
                    reason.contains("heartbeat"),
                    "expected heartbeat reason, got {reason}"
                );
                break;
            }
            ConnEvent::Connected | ConnEvent::Error { .. } => {}
            other => panic!("unexpected event before disconnect: {other:?}"),
        }
    }

    match next_event(&mut events).await {
        ConnEvent::Reconnecting { attempt, .. } => assert_eq!(attempt, 1),
        other => panic!("expected Reconnecting after heartbeat death, got {other:?}"),
    }

    assert!(handle.metrics().heartbeats_missed >= 1);
    handle.disconnect();
}

#[tokio::test]
async fn answered_pings_keep_the_connection_open() {
    let (listener, url) = bound_listener().await;
    let config = StreamConfig {
        heartbeat_interval: Duration::from_millis(40),
        heartbeat_grace: Duration::from_millis(60),
        ..fast_config()
    };
    let cancel = CancellationToken::new();
    let handle = ConnectionHandle::connect(url, config, cancel.clone());
    let mut events = handle.events();

    let mut server = accept_ws(&listener).await;
    // Echo server: answer every ping with a matching pong.
    tokio::spawn(async move {
        while let Some(Ok(Message::Text(text))) = server.next().await {
            if let Ok(StreamFrame::Ping { timestamp }) = StreamFrame::parse(text.as_str()) {
                if server
                    .send(Message::text(StreamFrame::pong(timestamp)))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    });

    assert!(matches!(next_event(&mut events).await, ConnEvent::Connected));

    // Outlive several heartbeat cycles without a disconnect.
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(handle.current_state(), ConnectionState::Open);
    assert_eq!(handle.metrics().heartbeats_missed, 0);

    handle.disconnect();
}

// ── Reconnect & give-up ─────────────────────────────────────────────

#[tokio::test]
async fn dial_failures_back_off_then_reach_max_retries() {
    init_tracing();
    // Bind and drop to get a port with nothing listening.
    let (listener, url) = bound_listener().await;
    drop(listener);

    let cancel = CancellationToken::new();
    let handle = ConnectionHandle::connect(url, fast_config(), cancel.clone());
    let mut events = handle.events();

    let mut delays = Vec::new();
    loop {
        match next_event(&mut events).await {
            ConnEvent::Reconnecting { attempt, delay } => {
                assert_eq!(delays.len() + 1, attempt as usize);
                delays.push(delay);
            }
            ConnEvent::MaxRetriesReached => break,
            ConnEvent::Error { .. } => {}
            other => panic!("unexpected event: {other:?}"),
        }
    }

    assert_eq!(delays.len(), 2);
    assert!(delays[1] >= delays[0], "backoff regressed: {delays:?}");

    // Auto-reconnect has stopped; the manager idles until re-armed.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handle.current_state(), ConnectionState::Idle);
    assert_eq!(handle.metrics().reconnects, 2);

    // Manual re-arm dials again.
    handle.reconnect();
    loop {
        match next_event(&mut events).await {
            ConnEvent::Error { .. } | ConnEvent::Reconnecting { .. } => break,
            other => panic!("unexpected event after reconnect: {other:?}"),
        }
    }

    handle.disconnect();
}

#[tokio::test]
async fn disconnect_is_idempotent_and_terminal() {
    let (listener, url) = bound_listener().await;
    let cancel = CancellationToken::new();
    let handle = ConnectionHandle::connect(url, fast_config(), cancel.clone());
    let mut state = handle.state();

    let _server = accept_ws(&listener).await;

    handle.disconnect();
    handle.disconnect();

    tokio::time::timeout(Duration::from_secs(5), async {
        while *state.borrow_and_update() != ConnectionState::Closed {
            state.changed().await.unwrap();
        }
    })
    .await
    .expect("never reached Closed");

    assert_eq!(handle.current_state(), ConnectionState::Closed);
}
