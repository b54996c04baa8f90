//! Gated handshake session: payload sends wait until the peer is confirmed live.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use bandlink_core::{
    payload_from, AttemptId, Gate, Handshake, HandshakeConfig, HandshakeMessage, RouterError,
    SessionEvent, SessionState, HANDSHAKE_TAG,
};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time;
use tracing::{debug, info, warn};

use crate::channel::EnvelopeChannel;

type Waiter = oneshot::Sender<Result<(), SessionError>>;
type ConnectedCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("handshake timed out")]
    Timeout,
    #[error("session went stale before the handshake completed")]
    Stale,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("session closed")]
    Closed,
}

struct Inner {
    handshake: Handshake,
    waiters: HashMap<AttemptId, Vec<Waiter>>,
}

impl Inner {
    fn wait(&mut self, attempt: AttemptId) -> oneshot::Receiver<Result<(), SessionError>> {
        let (tx, rx) = oneshot::channel();
        self.waiters.entry(attempt).or_default().push(tx);
        rx
    }

    fn complete(&mut self, attempt: AttemptId, result: Result<(), SessionError>) {
        for waiter in self.waiters.remove(&attempt).unwrap_or_default() {
            let _ = waiter.send(result.clone());
        }
    }
}

/// Liveness session with one peer. Owns the handshake state and its timers.
pub struct Session {
    channel: Arc<EnvelopeChannel>,
    inner: Mutex<Inner>,
    timer: Arc<Notify>,
    on_connected: Mutex<Option<ConnectedCallback>>,
}

impl Session {
    /// Register the handshake handler on `channel` and start consuming `inbound`, the raw
    /// envelope stream for the channel's peer.
    pub fn start(
        channel: Arc<EnvelopeChannel>,
        config: HandshakeConfig,
        inbound: mpsc::UnboundedReceiver<String>,
    ) -> Result<Arc<Self>, RouterError> {
        let session = Arc::new(Self {
            channel,
            inner: Mutex::new(Inner {
                handshake: Handshake::new(config),
                waiters: HashMap::new(),
            }),
            timer: Arc::new(Notify::new()),
            on_connected: Mutex::new(None),
        });

        let weak = Arc::downgrade(&session);
        session
            .channel
            .register_handler(HANDSHAKE_TAG, move |fields| {
                let Some(session) = weak.upgrade() else {
                    return Ok(());
                };
                let msg: HandshakeMessage = payload_from(fields)?;
                session.on_handshake(msg);
                Ok(())
            })?;

        tokio::spawn(pump(Arc::downgrade(&session), inbound));
        tokio::spawn(run_timers(Arc::downgrade(&session), session.timer.clone()));
        Ok(session)
    }

    pub fn channel(&self) -> &Arc<EnvelopeChannel> {
        &self.channel
    }

    pub fn state(&self) -> SessionState {
        self.inner().handshake.state()
    }

    pub fn is_connected(&self) -> bool {
        self.inner().handshake.is_connected()
    }

    /// Called when the peer completes a handshake this side did not start.
    pub fn on_connected<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self
            .on_connected
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = Some(Arc::new(callback));
    }

    /// Send once the session is live, handshaking first if needed.
    pub async fn send<T: Serialize>(&self, tag: &str, payload: &T) -> Result<(), SessionError> {
        self.ready().await?;
        self.channel
            .send(tag, payload)
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))
    }

    /// Wait until the session is connected.
    pub async fn ready(&self) -> Result<(), SessionError> {
        let (rx, start) = {
            let mut inner = self.inner();
            match inner.handshake.begin_send(now()) {
                Gate::Open => return Ok(()),
                Gate::Wait(attempt) => (inner.wait(attempt), None),
                Gate::Start { attempt, hello } => (inner.wait(attempt), Some((attempt, hello))),
            }
        };
        if let Some((attempt, hello)) = start {
            self.timer.notify_one();
            if let Err(e) = self.channel.send(HANDSHAKE_TAG, &hello).await {
                warn!(peer = %self.channel.peer_id(), error = %e, "failed to send handshake");
                let mut inner = self.inner();
                if inner.handshake.abort(attempt) {
                    inner.complete(attempt, Err(SessionError::Transport(e.to_string())));
                }
            }
        }
        rx.await.unwrap_or(Err(SessionError::Closed))
    }

    fn on_raw(&self, raw: &str) {
        self.inner().handshake.on_envelope(now());
        self.timer.notify_one();
        self.channel.dispatch(raw);
    }

    fn on_handshake(&self, msg: HandshakeMessage) {
        let reaction = {
            let mut inner = self.inner();
            let reaction = inner.handshake.on_message(msg);
            if let Some(SessionEvent::AttemptResolved(attempt)) = reaction.event {
                debug!(peer = %self.channel.peer_id(), "handshake confirmed");
                inner.complete(attempt, Ok(()));
            }
            reaction
        };

        if reaction.event == Some(SessionEvent::PeerConnected) {
            info!(peer = %self.channel.peer_id(), "peer connected");
            let callback = self
                .on_connected
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .clone();
            if let Some(callback) = callback {
                callback();
            }
        }

        if let Some(reply) = reaction.reply {
            let channel = self.channel.clone();
            tokio::spawn(async move {
                if let Err(e) = channel.send(HANDSHAKE_TAG, &reply).await {
                    warn!(peer = %channel.peer_id(), error = %e, "failed to answer handshake");
                }
            });
        }
    }

    fn fire_timeouts(&self) {
        let mut inner = self.inner();
        for event in inner.handshake.poll_timeouts(now()) {
            match event {
                SessionEvent::AttemptTimedOut(attempt) => {
                    info!(peer = %self.channel.peer_id(), "handshake timed out");
                    inner.complete(attempt, Err(SessionError::Timeout));
                }
                SessionEvent::AttemptAbandoned(attempt) => {
                    info!(peer = %self.channel.peer_id(), "session stale during handshake");
                    inner.complete(attempt, Err(SessionError::Stale));
                }
                SessionEvent::Stale => {
                    info!(peer = %self.channel.peer_id(), "session stale, disconnected");
                }
                SessionEvent::AttemptResolved(_) | SessionEvent::PeerConnected => {}
            }
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Wake the timer task so it sees the session is gone.
        self.timer.notify_one();
    }
}

fn now() -> std::time::Instant {
    time::Instant::now().into_std()
}

async fn pump(session: Weak<Session>, mut inbound: mpsc::UnboundedReceiver<String>) {
    while let Some(raw) = inbound.recv().await {
        let Some(session) = session.upgrade() else {
            break;
        };
        session.on_raw(&raw);
    }
}

async fn run_timers(session: Weak<Session>, timer: Arc<Notify>) {
    loop {
        let deadline = match session.upgrade() {
            Some(s) => s.inner().handshake.next_deadline(),
            None => return,
        };
        match deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = time::sleep_until(time::Instant::from_std(deadline)) => {}
                    _ = timer.notified() => continue,
                }
            }
            None => {
                timer.notified().await;
                continue;
            }
        }
        match session.upgrade() {
            Some(s) => s.fire_timeouts(),
            None => return,
        }
    }
}
