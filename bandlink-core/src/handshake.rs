//! Liveness handshake and heartbeat expiry. Host-driven: the host feeds messages and the
//! current time, and sleeps until `next_deadline`.

use std::time::{Duration, Instant};

use tracing::debug;

use crate::protocol::HandshakeMessage;

/// Default window for a connect attempt to complete.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(3000);

/// Default inactivity window after which a session is considered gone.
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_millis(3000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeConfig {
    pub attempt_timeout: Duration,
    pub heartbeat_timeout: Duration,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            attempt_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
        }
    }
}

/// Identifies one connect attempt so the host can complete its waiters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttemptId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    /// This side sent a hello and waits for the peer's answer.
    Connecting(AttemptId),
    Connected,
}

/// What a sender must do before its payload may go out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Open,
    /// An attempt is already outstanding; wait for it.
    Wait(AttemptId),
    /// A new attempt started; send `hello` and wait for it.
    Start {
        attempt: AttemptId,
        hello: HandshakeMessage,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Our own attempt completed; release its waiters.
    AttemptResolved(AttemptId),
    /// Nothing came back within the attempt window.
    AttemptTimedOut(AttemptId),
    /// Heartbeat expired while the attempt was outstanding.
    AttemptAbandoned(AttemptId),
    /// The peer completed a handshake we did not start.
    PeerConnected,
    /// Heartbeat expired on a connected session.
    Stale,
}

/// Reaction to one handshake message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HandshakeReaction {
    pub reply: Option<HandshakeMessage>,
    pub event: Option<SessionEvent>,
}

/// Session liveness state machine for one peer.
#[derive(Debug)]
pub struct Handshake {
    config: HandshakeConfig,
    state: SessionState,
    attempt_deadline: Option<Instant>,
    heartbeat_deadline: Option<Instant>,
    next_attempt: u64,
}

impl Handshake {
    pub fn new(config: HandshakeConfig) -> Self {
        Self {
            config,
            state: SessionState::Disconnected,
            attempt_deadline: None,
            heartbeat_deadline: None,
            next_attempt: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    /// Called before every gated send.
    pub fn begin_send(&mut self, now: Instant) -> Gate {
        match self.state {
            SessionState::Connected => Gate::Open,
            SessionState::Connecting(attempt) => Gate::Wait(attempt),
            SessionState::Disconnected => {
                let attempt = AttemptId(self.next_attempt);
                self.next_attempt = self.next_attempt.wrapping_add(1);
                self.state = SessionState::Connecting(attempt);
                self.attempt_deadline = Some(now + self.config.attempt_timeout);
                debug!(?attempt, "starting handshake");
                Gate::Start {
                    attempt,
                    hello: HandshakeMessage::hello(),
                }
            }
        }
    }

    /// Any envelope from the peer, whatever its tag, proves liveness.
    pub fn on_envelope(&mut self, now: Instant) {
        self.heartbeat_deadline = Some(now + self.config.heartbeat_timeout);
    }

    pub fn on_message(&mut self, msg: HandshakeMessage) -> HandshakeReaction {
        let mut event = None;
        if msg.count > 0 {
            match self.state {
                SessionState::Connecting(attempt) => {
                    self.state = SessionState::Connected;
                    self.attempt_deadline = None;
                    event = Some(SessionEvent::AttemptResolved(attempt));
                }
                SessionState::Disconnected => {
                    self.state = SessionState::Connected;
                    event = Some(SessionEvent::PeerConnected);
                }
                SessionState::Connected => {}
            }
        }
        HandshakeReaction {
            reply: msg.reply(),
            event,
        }
    }

    /// Give up on an attempt whose hello could not be sent.
    pub fn abort(&mut self, attempt: AttemptId) -> bool {
        if self.state == SessionState::Connecting(attempt) {
            self.state = SessionState::Disconnected;
            self.attempt_deadline = None;
            true
        } else {
            false
        }
    }

    /// Fire expired timers.
    pub fn poll_timeouts(&mut self, now: Instant) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        if let (Some(deadline), SessionState::Connecting(attempt)) =
            (self.attempt_deadline, self.state)
        {
            if now >= deadline {
                debug!(?attempt, "handshake timed out");
                self.state = SessionState::Disconnected;
                self.attempt_deadline = None;
                events.push(SessionEvent::AttemptTimedOut(attempt));
            }
        }
        if let Some(deadline) = self.heartbeat_deadline {
            if now >= deadline {
                self.heartbeat_deadline = None;
                match self.state {
                    SessionState::Connecting(attempt) => {
                        self.attempt_deadline = None;
                        events.push(SessionEvent::AttemptAbandoned(attempt));
                    }
                    SessionState::Connected => events.push(SessionEvent::Stale),
                    SessionState::Disconnected => {}
                }
                self.state = SessionState::Disconnected;
            }
        }
        events
    }

    /// Earliest instant at which `poll_timeouts` has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.attempt_deadline, self.heartbeat_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

impl Default for Handshake {
    fn default() -> Self {
        Self::new(HandshakeConfig::default())
    }
}
