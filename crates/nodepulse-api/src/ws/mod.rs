//! WebSocket connection manager with heartbeat and auto-reconnect.
//!
//! Owns the single persistent connection to the node's metrics stream and
//! nothing else -- it has no knowledge of message semantics beyond the
//! heartbeat frames it answers itself. Parsed [`StreamFrame`]s fan out
//! through a [`tokio::sync::broadcast`] channel; connection state is
//! observable through a `watch` channel.
//!
//! Lifecycle decisions live in the pure [`StateMachine`] (see [`state`]);
//! the driver task here only performs IO and timers.
//!
//! # Example
//!
//! ```rust,ignore
//! use nodepulse_api::ws::{ConnectionHandle, StreamConfig};
//! use tokio_util::sync::CancellationToken;
//! use url::Url;
//!
//! let cancel = CancellationToken::new();
//! let url = Url::parse("wss://node.example/stream")?;
//!
//! let handle = ConnectionHandle::connect(url, StreamConfig::default(), cancel.clone());
//! let mut events = handle.events();
//!
//! handle.send(r#"{"method":"metrics.subscribe","params":["height"],"id":1}"#);
//!
//! while let Ok(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//!
//! handle.disconnect();
//! ```

mod state;

pub use state::{ConnectionState, Effect, ReconnectPolicy, StateEvent, StateMachine};

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::tungstenite::{self, ClientRequestBuilder, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::Error;
use crate::protocol::StreamFrame;

// ── Channel capacities ───────────────────────────────────────────────

const EVENT_CHANNEL_CAPACITY: usize = 1024;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ── StreamConfig ─────────────────────────────────────────────────────

/// Operational knobs for the connection manager.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Reconnection backoff policy.
    pub reconnect: ReconnectPolicy,

    /// Interval between heartbeat pings while open. Default: 15s.
    pub heartbeat_interval: Duration,

    /// How long an unanswered ping may stand before the connection is
    /// declared dead. Default: 10s.
    pub heartbeat_grace: Duration,

    /// Bound on the offline send queue. Overflow drops the oldest entry
    /// (reported through the event channel). Default: 64.
    pub outbound_queue_limit: usize,

    /// Consecutive malformed frames tolerated before the connection is
    /// forced closed. Default: 8.
    pub malformed_frame_limit: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            heartbeat_interval: Duration::from_secs(15),
            heartbeat_grace: Duration::from_secs(10),
            outbound_queue_limit: 64,
            malformed_frame_limit: 8,
        }
    }
}

// ── Events ───────────────────────────────────────────────────────────

/// Connection lifecycle and message events, broadcast to all subscribers.
#[derive(Debug, Clone)]
pub enum ConnEvent {
    /// The socket opened (initial connect or a successful reconnect).
    Connected,
    /// The socket closed, cleanly or otherwise.
    Disconnected { reason: String },
    /// An inbound push frame (heartbeats are handled internally and never
    /// surface here).
    Message(Arc<StreamFrame>),
    /// A non-fatal failure: dial error, dropped queue entry, malformed
    /// frame. The connection survives or reconnects on its own.
    Error { error: Error },
    /// A reconnect attempt has been scheduled.
    Reconnecting { attempt: u32, delay: Duration },
    /// Auto-reconnect gave up. `reconnect()` re-arms it.
    MaxRetriesReached,
}

// ── Metrics ──────────────────────────────────────────────────────────

/// Internal counters, shared with handles via `Arc`.
#[derive(Debug, Default)]
struct ConnMetrics {
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    reconnects: AtomicU64,
    messages_dropped: AtomicU64,
    heartbeats_missed: AtomicU64,
}

/// Point-in-time counters snapshot returned by
/// [`ConnectionHandle::metrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub reconnects: u64,
    pub messages_dropped: u64,
    pub heartbeats_missed: u64,
    pub state: ConnectionState,
}

// ── ConnectionHandle ─────────────────────────────────────────────────

/// Commands from handles to the driver task.
#[derive(Debug)]
enum Command {
    Send(String),
    Reconnect,
}

/// Handle to a running connection manager.
///
/// Cheaply cloneable. Dropping every handle shuts the driver down; so does
/// [`disconnect`](Self::disconnect).
#[derive(Clone)]
pub struct ConnectionHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
    event_tx: broadcast::Sender<ConnEvent>,
    state_rx: watch::Receiver<ConnectionState>,
    metrics: Arc<ConnMetrics>,
    cancel: CancellationToken,
}

impl ConnectionHandle {
    /// Spawn the connection driver and begin connecting.
    ///
    /// Returns immediately; the first dial happens asynchronously.
    /// Subscribe to [`events`](Self::events) to observe the outcome.
    pub fn connect(url: Url, config: StreamConfig, cancel: CancellationToken) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let metrics = Arc::new(ConnMetrics::default());

        let driver = Driver {
            url,
            machine: StateMachine::new(config.reconnect.clone()),
            pending_backoff: config.reconnect.initial_delay,
            config,
            queue: VecDeque::new(),
            last_close_reason: None,
            cmd_rx,
            event_tx: event_tx.clone(),
            state_tx,
            metrics: Arc::clone(&metrics),
            cancel: cancel.clone(),
        };
        tokio::spawn(driver.run());

        Self {
            cmd_tx,
            event_tx,
            state_rx,
            metrics,
            cancel,
        }
    }

    /// Queue a text payload for delivery.
    ///
    /// Never fails synchronously: while the connection is not open the
    /// payload enters a bounded FIFO queue and is flushed, in order, right
    /// after the next successful open. Overflow drops the oldest entry and
    /// reports it through the event channel.
    pub fn send(&self, payload: impl Into<String>) {
        let _ = self.cmd_tx.send(Command::Send(payload.into()));
    }

    /// Get a new receiver for the event stream.
    pub fn events(&self) -> broadcast::Receiver<ConnEvent> {
        self.event_tx.subscribe()
    }

    /// Observe connection state changes.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// The state as of this instant.
    pub fn current_state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Counters snapshot.
    pub fn metrics(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            frames_sent: self.metrics.frames_sent.load(Ordering::Relaxed),
            frames_received: self.metrics.frames_received.load(Ordering::Relaxed),
            reconnects: self.metrics.reconnects.load(Ordering::Relaxed),
            messages_dropped: self.metrics.messages_dropped.load(Ordering::Relaxed),
            heartbeats_missed: self.metrics.heartbeats_missed.load(Ordering::Relaxed),
            state: *self.state_rx.borrow(),
        }
    }

    /// Manually re-arm connection attempts (after `MaxRetriesReached`, or
    /// to skip the remainder of a backoff delay).
    pub fn reconnect(&self) {
        let _ = self.cmd_tx.send(Command::Reconnect);
    }

    /// Force the connection closed and stop all reconnection.
    ///
    /// Idempotent. This is the manager's single cancellation point: it
    /// also cancels any pending heartbeat and reconnect timers.
    pub fn disconnect(&self) {
        self.cancel.cancel();
    }
}

// ── Driver ───────────────────────────────────────────────────────────

/// Owns the socket and interprets state-machine effects.
struct Driver {
    url: Url,
    config: StreamConfig,
    machine: StateMachine,
    /// Delay armed by the most recent `StartBackoff` effect.
    pending_backoff: Duration,
    /// Offline send queue, flushed in order on open.
    queue: VecDeque<String>,
    /// Human-readable reason for the next `Disconnected` event.
    last_close_reason: Option<String>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    event_tx: broadcast::Sender<ConnEvent>,
    state_tx: watch::Sender<ConnectionState>,
    metrics: Arc<ConnMetrics>,
    cancel: CancellationToken,
}

/// What a phase observed, decoupled from `&mut self` so select arms don't
/// fight the borrow checker.
enum Step<T> {
    Cancelled,
    Command(Option<Command>),
    Ready(T),
}

impl Driver {
    async fn run(mut self) {
        self.apply_event(StateEvent::ConnectRequested);

        let mut live_socket: Option<WsStream> = None;
        loop {
            match self.machine.state() {
                ConnectionState::Connecting => live_socket = self.dial_phase().await,
                ConnectionState::Open => match live_socket.take() {
                    Some(stream) => self.open_phase(stream).await,
                    // No live socket to run; treat as an immediate close.
                    None => self.apply_event(StateEvent::SocketClosed),
                },
                ConnectionState::Reconnecting => self.backoff_phase().await,
                ConnectionState::Idle => self.idle_phase().await,
                ConnectionState::Closed => break,
            }
        }
        tracing::debug!("connection driver exiting");
    }

    // ── Phases ───────────────────────────────────────────────────────

    /// One dial attempt. Commands keep being serviced while it is in
    /// flight. Returns the socket on success.
    async fn dial_phase(&mut self) -> Option<WsStream> {
        tracing::debug!(url = %self.url, "dialing stream endpoint");
        let connect = connect_ws(self.url.clone());
        tokio::pin!(connect);

        loop {
            let cancel = self.cancel.clone();
            let step = tokio::select! {
                biased;
                () = cancel.cancelled() => Step::Cancelled,
                cmd = self.cmd_rx.recv() => Step::Command(cmd),
                result = &mut connect => Step::Ready(result),
            };
            match step {
                Step::Cancelled => {
                    self.apply_event(StateEvent::DisconnectRequested);
                    return None;
                }
                Step::Command(cmd) => {
                    if self.offline_command(cmd) {
                        return None;
                    }
                }
                Step::Ready(Ok(stream)) => {
                    tracing::info!("stream connected");
                    self.apply_event(StateEvent::SocketOpened);
                    return Some(stream);
                }
                Step::Ready(Err(e)) => {
                    tracing::warn!(error = %e, attempt = self.machine.attempt(), "dial failed");
                    self.last_close_reason = Some(e.to_string());
                    let _ = self.event_tx.send(ConnEvent::Error { error: e });
                    self.apply_event(StateEvent::SocketClosed);
                    return None;
                }
            }
        }
    }

    /// Run the open connection: flush the queue, then pump frames,
    /// commands, and the heartbeat until something ends the session.
    #[allow(clippy::too_many_lines)]
    async fn open_phase(&mut self, stream: WsStream) {
        let (mut sink, mut read) = stream.split();

        // FlushQueue effect: drain the offline queue in enqueue order.
        while let Some(text) = self.queue.pop_front() {
            if let Err(e) = sink.send(Message::text(text)).await {
                self.close_with_reason(format!("send failed during queue flush: {e}"));
                return;
            }
            self.metrics.frames_sent.fetch_add(1, Ordering::Relaxed);
        }

        // StartHeartbeat effect: first ping one interval from now.
        let mut heartbeat = tokio::time::interval_at(
            tokio::time::Instant::now() + self.config.heartbeat_interval,
            self.config.heartbeat_interval,
        );
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        // Grace deadline armed when a ping goes unanswered.
        let grace = tokio::time::sleep(Duration::ZERO);
        tokio::pin!(grace);
        let mut awaiting_pong = false;

        let mut malformed_run: u32 = 0;

        enum OpenStep {
            Cancelled,
            Command(Option<Command>),
            HeartbeatDue,
            GraceExpired,
            Frame(Option<Result<Message, tungstenite::Error>>),
        }

        loop {
            let cancel = self.cancel.clone();
            let step = tokio::select! {
                biased;
                () = cancel.cancelled() => OpenStep::Cancelled,
                cmd = self.cmd_rx.recv() => OpenStep::Command(cmd),
                () = &mut grace, if awaiting_pong => OpenStep::GraceExpired,
                _ = heartbeat.tick() => OpenStep::HeartbeatDue,
                frame = read.next() => OpenStep::Frame(frame),
            };

            match step {
                OpenStep::Cancelled | OpenStep::Command(None) => {
                    let _ = sink.send(Message::Close(None)).await;
                    self.apply_event(StateEvent::DisconnectRequested);
                    return;
                }
                OpenStep::Command(Some(Command::Reconnect)) => {
                    // Already connected; nothing to re-arm.
                }
                OpenStep::Command(Some(Command::Send(text))) => {
                    if let Err(e) = sink.send(Message::text(text)).await {
                        self.close_with_reason(format!("send failed: {e}"));
                        return;
                    }
                    self.metrics.frames_sent.fetch_add(1, Ordering::Relaxed);
                }
                OpenStep::HeartbeatDue => {
                    let ping = StreamFrame::ping(epoch_millis());
                    if let Err(e) = sink.send(Message::text(ping)).await {
                        self.close_with_reason(format!("heartbeat send failed: {e}"));
                        return;
                    }
                    self.metrics.frames_sent.fetch_add(1, Ordering::Relaxed);
                    if !awaiting_pong {
                        awaiting_pong = true;
                        grace
                            .as_mut()
                            .reset(tokio::time::Instant::now() + self.config.heartbeat_grace);
                    }
                }
                OpenStep::GraceExpired => {
                    self.metrics.heartbeats_missed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("no pong within grace window, declaring connection dead");
                    self.last_close_reason = Some("heartbeat timed out".to_owned());
                    // CloseSocket effect: dropping sink+read closes the
                    // socket; the close event then drives the retry path.
                    self.apply_event(StateEvent::HeartbeatMissed);
                    let _ = sink.send(Message::Close(None)).await;
                    self.apply_event(StateEvent::SocketClosed);
                    return;
                }
                OpenStep::Frame(Some(Ok(Message::Text(text)))) => {
                    match StreamFrame::parse(text.as_str()) {
                        Ok(frame) => {
                            malformed_run = 0;
                            self.metrics.frames_received.fetch_add(1, Ordering::Relaxed);
                            match frame {
                                StreamFrame::Ping { timestamp } => {
                                    let pong = StreamFrame::pong(timestamp);
                                    if let Err(e) = sink.send(Message::text(pong)).await {
                                        self.close_with_reason(format!(
                                            "pong send failed: {e}"
                                        ));
                                        return;
                                    }
                                }
                                StreamFrame::Pong { .. } => awaiting_pong = false,
                                StreamFrame::Update { .. } => {
                                    let _ = self
                                        .event_tx
                                        .send(ConnEvent::Message(Arc::new(frame)));
                                }
                                StreamFrame::Unknown { ref kind, .. } => {
                                    tracing::debug!(kind = %kind, "ignoring frame of unknown kind");
                                }
                            }
                        }
                        Err(e) => {
                            malformed_run += 1;
                            tracing::debug!(
                                error = %e,
                                run = malformed_run,
                                "dropping malformed frame"
                            );
                            let _ = self.event_tx.send(ConnEvent::Error { error: e });
                            if malformed_run >= self.config.malformed_frame_limit {
                                self.close_with_reason(
                                    "persistently malformed frames".to_owned(),
                                );
                                return;
                            }
                        }
                    }
                }
                OpenStep::Frame(Some(Ok(Message::Close(frame)))) => {
                    let reason = frame.map_or_else(
                        || "close frame received".to_owned(),
                        |cf| format!("close frame received: {} {}", cf.code, cf.reason),
                    );
                    self.close_with_reason(reason);
                    return;
                }
                OpenStep::Frame(Some(Ok(_))) => {
                    // Binary, protocol-level ping/pong (answered by
                    // tungstenite), raw frames -- ignore.
                }
                OpenStep::Frame(Some(Err(e))) => {
                    self.close_with_reason(format!("stream error: {e}"));
                    return;
                }
                OpenStep::Frame(None) => {
                    self.close_with_reason("stream ended".to_owned());
                    return;
                }
            }
        }
    }

    /// Wait out the current backoff delay, still servicing commands.
    async fn backoff_phase(&mut self) {
        tracing::info!(
            delay_ms = u64::try_from(self.pending_backoff.as_millis()).unwrap_or(u64::MAX),
            attempt = self.machine.attempt(),
            "waiting before reconnect"
        );
        let sleep = tokio::time::sleep(self.pending_backoff);
        tokio::pin!(sleep);

        loop {
            let cancel = self.cancel.clone();
            let step = tokio::select! {
                biased;
                () = cancel.cancelled() => Step::Cancelled,
                cmd = self.cmd_rx.recv() => Step::Command(cmd),
                () = &mut sleep => Step::Ready(()),
            };
            match step {
                Step::Cancelled => {
                    self.apply_event(StateEvent::DisconnectRequested);
                    return;
                }
                Step::Command(cmd) => {
                    if self.offline_command(cmd) || self.machine.state() != ConnectionState::Reconnecting {
                        return;
                    }
                }
                Step::Ready(()) => {
                    self.apply_event(StateEvent::BackoffElapsed);
                    return;
                }
            }
        }
    }

    /// Park after giving up; only a command or cancellation moves us.
    async fn idle_phase(&mut self) {
        loop {
            let cancel = self.cancel.clone();
            let cmd = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                cmd = self.cmd_rx.recv() => Some(cmd),
            };
            match cmd {
                None => {
                    self.apply_event(StateEvent::DisconnectRequested);
                    return;
                }
                Some(cmd) => {
                    if self.offline_command(cmd) || self.machine.state() != ConnectionState::Idle {
                        return;
                    }
                }
            }
        }
    }

    // ── Helpers ──────────────────────────────────────────────────────

    /// Handle a command while no socket is open. Returns `true` when the
    /// driver should leave the current phase because of a disconnect.
    fn offline_command(&mut self, cmd: Option<Command>) -> bool {
        match cmd {
            Some(Command::Send(text)) => {
                self.enqueue(text);
                false
            }
            Some(Command::Reconnect) => {
                self.apply_event(StateEvent::ConnectRequested);
                false
            }
            // Every handle dropped: shut down.
            None => {
                self.apply_event(StateEvent::DisconnectRequested);
                true
            }
        }
    }

    /// Bounded FIFO enqueue, drop-oldest on overflow.
    fn enqueue(&mut self, text: String) {
        if self.queue.len() >= self.config.outbound_queue_limit {
            self.queue.pop_front();
            self.metrics.messages_dropped.fetch_add(1, Ordering::Relaxed);
            let _ = self.event_tx.send(ConnEvent::Error {
                error: Error::QueueOverflow,
            });
        }
        self.queue.push_back(text);
    }

    fn close_with_reason(&mut self, reason: String) {
        tracing::info!(reason = %reason, "stream closed");
        self.last_close_reason = Some(reason);
        self.apply_event(StateEvent::SocketClosed);
    }

    fn apply_event(&mut self, event: StateEvent) {
        let effects = self.machine.handle(event);
        self.state_tx.send_replace(self.machine.state());
        for effect in effects {
            match effect {
                // Realized by the phase the new state selects.
                Effect::Dial | Effect::CloseSocket | Effect::FlushQueue | Effect::StartHeartbeat => {}
                Effect::StartBackoff(delay) => self.pending_backoff = delay,
                Effect::EmitConnected => {
                    let _ = self.event_tx.send(ConnEvent::Connected);
                }
                Effect::EmitDisconnected => {
                    let reason = self
                        .last_close_reason
                        .take()
                        .unwrap_or_else(|| "disconnected".to_owned());
                    let _ = self.event_tx.send(ConnEvent::Disconnected { reason });
                }
                Effect::EmitReconnecting { attempt, delay } => {
                    self.metrics.reconnects.fetch_add(1, Ordering::Relaxed);
                    let _ = self.event_tx.send(ConnEvent::Reconnecting { attempt, delay });
                }
                Effect::EmitMaxRetriesReached => {
                    tracing::error!("reconnection limit reached, giving up");
                    let _ = self.event_tx.send(ConnEvent::MaxRetriesReached);
                }
            }
        }
    }
}

// ── Socket establishment ─────────────────────────────────────────────

async fn connect_ws(url: Url) -> Result<WsStream, Error> {
    let uri: tungstenite::http::Uri = url
        .as_str()
        .parse()
        .map_err(|e: tungstenite::http::uri::InvalidUri| Error::Connect(e.to_string()))?;
    let request = ClientRequestBuilder::new(uri);
    let (stream, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| Error::Connect(e.to_string()))?;
    Ok(stream)
}

/// Current wall-clock time in epoch milliseconds, for heartbeat frames.
fn epoch_millis() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}

// ── Tests ────────────────────────────────────────────────────────────
