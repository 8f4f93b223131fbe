//! Pure connection state machine.
//!
//! All lifecycle decisions -- when to dial, when to back off, when to give
//! up -- live in [`StateMachine::handle`], a pure `(state, event) ->
//! (state, effects)` function. The async driver in the parent module only
//! performs IO and timers, so reconnection logic is unit-testable without
//! either.

use std::time::Duration;

/// Connection lifecycle state, observable through a `watch` channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionState {
    /// No connection and no pending attempt. Initial state, and the state
    /// after reconnection gives up (`reconnect()` re-arms from here).
    Idle,
    /// A dial is in flight.
    Connecting,
    /// Connected; heartbeat running, sends go straight to the socket.
    Open,
    /// Waiting out a backoff delay before the next dial.
    Reconnecting,
    /// Explicitly disconnected. Terminal for this manager instance.
    Closed,
}

/// Exponential backoff policy for reconnection.
///
/// Delays are deterministic: `initial * multiplier^(attempt-1)`, capped at
/// `max_delay`. Successive delays are non-decreasing, and the sequence
/// restarts after a successful connection.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnection attempt. Default: 1s.
    pub initial_delay: Duration,

    /// Upper bound on the backoff delay. Default: 30s.
    pub max_delay: Duration,

    /// Growth factor between consecutive delays. Default: 2.0.
    pub multiplier: f64,

    /// Maximum consecutive failed attempts before giving up.
    /// `None` means retry forever.
    pub max_retries: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_retries: Some(10),
        }
    }
}

impl ReconnectPolicy {
    /// Backoff delay for the given attempt number (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1).min(63)).unwrap_or(63);
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64()).max(0.0);
        Duration::from_secs_f64(capped)
    }
}

/// An input to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateEvent {
    /// `connect()`/`reconnect()` was requested (resets the attempt count).
    ConnectRequested,
    /// The dial succeeded and the socket is open.
    SocketOpened,
    /// The socket closed or the dial failed.
    SocketClosed,
    /// No pong arrived within the grace window.
    HeartbeatMissed,
    /// The current backoff delay elapsed.
    BackoffElapsed,
    /// `disconnect()` was requested.
    DisconnectRequested,
}

/// A side effect the driver must perform after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Begin a socket connection attempt.
    Dial,
    /// Close the live socket.
    CloseSocket,
    /// Flush the offline queue to the socket, in enqueue order.
    FlushQueue,
    /// Start the heartbeat timer.
    StartHeartbeat,
    /// Arm the reconnect timer with this delay.
    StartBackoff(Duration),
    /// Emit `ConnEvent::Connected`.
    EmitConnected,
    /// Emit `ConnEvent::Disconnected`.
    EmitDisconnected,
    /// Emit `ConnEvent::Reconnecting`.
    EmitReconnecting { attempt: u32, delay: Duration },
    /// Emit `ConnEvent::MaxRetriesReached`.
    EmitMaxRetriesReached,
}

/// The connection state machine: current state plus the consecutive-failure
/// counter that drives backoff.
#[derive(Debug)]
pub struct StateMachine {
    state: ConnectionState,
    attempt: u32,
    policy: ReconnectPolicy,
}

impl StateMachine {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            state: ConnectionState::Idle,
            attempt: 0,
            policy,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Consecutive failed attempts since the last successful open.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Apply one event, returning the effects the driver must perform.
    pub fn handle(&mut self, event: StateEvent) -> Vec<Effect> {
        use ConnectionState as S;
        use StateEvent as E;

        match (self.state, event) {
            // Manual connect works from Idle, from an in-progress backoff,
            // and after an explicit close. It always resets the counter.
            (S::Idle | S::Reconnecting | S::Closed, E::ConnectRequested) => {
                self.attempt = 0;
                self.state = S::Connecting;
                vec![Effect::Dial]
            }
            (S::Connecting | S::Open, E::ConnectRequested) => Vec::new(),

            (S::Connecting, E::SocketOpened) => {
                self.attempt = 0;
                self.state = S::Open;
                vec![
                    Effect::EmitConnected,
                    Effect::FlushQueue,
                    Effect::StartHeartbeat,
                ]
            }
            (S::Connecting, E::SocketClosed) => self.retry(),

            (S::Open, E::SocketClosed) => {
                let mut effects = vec![Effect::EmitDisconnected];
                effects.extend(self.retry());
                effects
            }
            // The socket is silently dead. Closing it produces a
            // SocketClosed event, which then drives the retry path.
            (S::Open, E::HeartbeatMissed) => vec![Effect::CloseSocket],

            (S::Reconnecting, E::BackoffElapsed) => {
                self.state = S::Connecting;
                vec![Effect::Dial]
            }

            (_, E::DisconnectRequested) => {
                let was_open = self.state == S::Open;
                self.state = S::Closed;
                if was_open {
                    vec![Effect::CloseSocket, Effect::EmitDisconnected]
                } else {
                    Vec::new()
                }
            }

            // Everything else (late timer fires, duplicate close events) is
            // a no-op by design of the driver's phase structure.
            _ => Vec::new(),
        }
    }

    /// Shared failure path: bump the counter, then either schedule a
    /// backoff or give up.
    fn retry(&mut self) -> Vec<Effect> {
        self.attempt += 1;
        if let Some(max) = self.policy.max_retries {
            if self.attempt > max {
                self.attempt = 0;
                self.state = ConnectionState::Idle;
                return vec![Effect::EmitMaxRetriesReached];
            }
        }
        let delay = self.policy.delay_for(self.attempt);
        self.state = ConnectionState::Reconnecting;
        vec![
            Effect::EmitReconnecting {
                attempt: self.attempt,
                delay,
            },
            Effect::StartBackoff(delay),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_retries: Option<u32>) -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(800),
            multiplier: 2.0,
            max_retries,
        }
    }

    #[test]
    fn connect_dials_from_idle() {
        let mut sm = StateMachine::new(policy(None));
        let effects = sm.handle(StateEvent::ConnectRequested);
        assert_eq!(sm.state(), ConnectionState::Connecting);
        assert_eq!(effects, vec![Effect::Dial]);
    }

    #[test]
    fn open_flushes_queue_and_starts_heartbeat() {
        let mut sm = StateMachine::new(policy(None));
        sm.handle(StateEvent::ConnectRequested);
        let effects = sm.handle(StateEvent::SocketOpened);
        assert_eq!(sm.state(), ConnectionState::Open);
        assert_eq!(
            effects,
            vec![
                Effect::EmitConnected,
                Effect::FlushQueue,
                Effect::StartHeartbeat,
            ]
        );
    }

    #[test]
    fn close_while_open_schedules_first_backoff() {
        let mut sm = StateMachine::new(policy(None));
        sm.handle(StateEvent::ConnectRequested);
        sm.handle(StateEvent::SocketOpened);
        let effects = sm.handle(StateEvent::SocketClosed);
        assert_eq!(sm.state(), ConnectionState::Reconnecting);
        assert_eq!(effects[0], Effect::EmitDisconnected);
        assert!(
            effects.contains(&Effect::StartBackoff(Duration::from_millis(100))),
            "first retry should use the initial delay, got {effects:?}"
        );
    }

    #[test]
    fn backoff_is_monotonic_and_capped() {
        let p = policy(None);
        let mut last = Duration::ZERO;
        for attempt in 1..=12 {
            let delay = p.delay_for(attempt);
            assert!(
                delay >= last,
                "delay for attempt {attempt} ({delay:?}) regressed below {last:?}"
            );
            assert!(delay <= p.max_delay);
            last = delay;
        }
        assert_eq!(p.delay_for(12), p.max_delay);
    }

    #[test]
    fn attempt_counter_resets_after_successful_open() {
        let mut sm = StateMachine::new(policy(None));
        sm.handle(StateEvent::ConnectRequested);
        sm.handle(StateEvent::SocketClosed);
        sm.handle(StateEvent::BackoffElapsed);
        sm.handle(StateEvent::SocketClosed);
        assert_eq!(sm.attempt(), 2);

        sm.handle(StateEvent::BackoffElapsed);
        sm.handle(StateEvent::SocketOpened);
        assert_eq!(sm.attempt(), 0);

        // Next failure starts over at the initial delay.
        let effects = sm.handle(StateEvent::SocketClosed);
        assert!(effects.contains(&Effect::StartBackoff(Duration::from_millis(100))));
    }

    #[test]
    fn gives_up_after_max_retries_then_manual_reconnect_rearms() {
        let mut sm = StateMachine::new(policy(Some(2)));
        sm.handle(StateEvent::ConnectRequested);

        sm.handle(StateEvent::SocketClosed);
        sm.handle(StateEvent::BackoffElapsed);
        sm.handle(StateEvent::SocketClosed);
        sm.handle(StateEvent::BackoffElapsed);
        let effects = sm.handle(StateEvent::SocketClosed);

        assert_eq!(sm.state(), ConnectionState::Idle);
        assert_eq!(effects, vec![Effect::EmitMaxRetriesReached]);

        let effects = sm.handle(StateEvent::ConnectRequested);
        assert_eq!(sm.state(), ConnectionState::Connecting);
        assert_eq!(effects, vec![Effect::Dial]);
    }

    #[test]
    fn heartbeat_miss_closes_the_socket() {
        let mut sm = StateMachine::new(policy(None));
        sm.handle(StateEvent::ConnectRequested);
        sm.handle(StateEvent::SocketOpened);
        let effects = sm.handle(StateEvent::HeartbeatMissed);
        assert_eq!(effects, vec![Effect::CloseSocket]);
        assert_eq!(sm.state(), ConnectionState::Open);
    }

    #[test]
    fn disconnect_is_terminal_and_idempotent() {
        let mut sm = StateMachine::new(policy(None));
        sm.handle(StateEvent::ConnectRequested);
        sm.handle(StateEvent::SocketOpened);

        let effects = sm.handle(StateEvent::DisconnectRequested);
        assert_eq!(sm.state(), ConnectionState::Closed);
        assert!(effects.contains(&Effect::CloseSocket));
        assert!(effects.contains(&Effect::EmitDisconnected));

        assert!(sm.handle(StateEvent::DisconnectRequested).is_empty());
        assert!(sm.handle(StateEvent::BackoffElapsed).is_empty());
    }

    #[test]
    fn manual_reconnect_during_backoff_dials_immediately() {
        let mut sm = StateMachine::new(policy(None));
        sm.handle(StateEvent::ConnectRequested);
        sm.handle(StateEvent::SocketClosed);
        assert_eq!(sm.state(), ConnectionState::Reconnecting);

        let effects = sm.handle(StateEvent::ConnectRequested);
        assert_eq!(sm.state(), ConnectionState::Connecting);
        assert_eq!(effects, vec![Effect::Dial]);
        assert_eq!(sm.attempt(), 0);
    }
}
