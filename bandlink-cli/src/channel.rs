//! Envelope channel: tags outgoing payloads for one peer and routes incoming envelopes by tag.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bandlink_core::{Envelope, EnvelopeError, RouterError, TagRouter};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

/// Handler for the payload fields of one tag.
pub type Handler = Arc<dyn Fn(Map<String, Value>) -> anyhow::Result<()> + Send + Sync>;

/// Raw platform send primitive: at-most-once delivery of one JSON envelope to a named peer.
#[async_trait]
pub trait RawChannel: Send + Sync {
    async fn send(&self, peer_id: &str, envelope: String) -> Result<(), ChannelError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("unknown peer {0:?}")]
    UnknownPeer(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("envelope error: {0}")]
    Envelope(#[from] EnvelopeError),
    #[error("channel closed")]
    Closed,
}

pub struct EnvelopeChannel {
    peer_id: String,
    raw: Arc<dyn RawChannel>,
    router: Mutex<TagRouter<Handler>>,
}

impl EnvelopeChannel {
    pub fn new(peer_id: impl Into<String>, raw: Arc<dyn RawChannel>) -> Self {
        Self {
            peer_id: peer_id.into(),
            raw,
            router: Mutex::new(TagRouter::new()),
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Install the only handler for `tag`. Fails if one is already registered.
    pub fn register_handler<F>(&self, tag: &str, handler: F) -> Result<(), RouterError>
    where
        F: Fn(Map<String, Value>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.router().register(tag, Arc::new(handler))
    }

    /// Install a handler for `tag`, replacing any existing one. Returns true if one was replaced.
    pub fn replace_handler<F>(&self, tag: &str, handler: F) -> bool
    where
        F: Fn(Map<String, Value>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.router().replace(tag, Arc::new(handler)).is_some()
    }

    pub fn remove_handler(&self, tag: &str) -> bool {
        self.router().remove(tag).is_some()
    }

    /// Tag `payload` and hand it to the raw primitive. Success means dispatched, not delivered.
    pub async fn send<T: Serialize>(&self, tag: &str, payload: &T) -> Result<(), ChannelError> {
        let raw = Envelope::new(tag, payload)?.encode()?;
        self.raw.send(&self.peer_id, raw).await
    }

    /// Route one raw inbound envelope. Unknown tags and unparseable input are dropped.
    pub fn dispatch(&self, raw: &str) {
        let envelope = match Envelope::decode(raw) {
            Ok(e) => e,
            Err(e) => {
                debug!(peer = %self.peer_id, error = %e, "dropping unparseable envelope");
                return;
            }
        };
        // Clone out so the handler runs without the router lock held.
        let handler = self.router().get(&envelope.tag).cloned();
        match handler {
            Some(handler) => {
                if let Err(e) = handler(envelope.fields) {
                    warn!(peer = %self.peer_id, tag = %envelope.tag, error = %e, "handler failed");
                }
            }
            None => debug!(peer = %self.peer_id, tag = %envelope.tag, "no handler for tag"),
        }
    }

    fn router(&self) -> MutexGuard<'_, TagRouter<Handler>> {
        self.router.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    /// Records every envelope; fails when `fail` is set.
    pub(crate) struct RecordingChannel {
        pub tx: mpsc::UnboundedSender<(String, String)>,
        pub fail: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl RawChannel for RecordingChannel {
        async fn send(&self, peer_id: &str, envelope: String) -> Result<(), ChannelError> {
            if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(ChannelError::Closed);
            }
            self.tx
                .send((peer_id.to_string(), envelope))
                .map_err(|_| ChannelError::Closed)
        }
    }

    pub(crate) fn recording() -> (Arc<RecordingChannel>, mpsc::UnboundedReceiver<(String, String)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(RecordingChannel {
                tx,
                fail: std::sync::atomic::AtomicBool::new(false),
            }),
            rx,
        )
    }

    #[tokio::test]
    async fn send_merges_tag_and_targets_peer() {
        let (raw, mut rx) = recording();
        let channel = EnvelopeChannel::new("com.example.peer", raw);
        channel.send("file", &json!({"stat": "cancel"})).await.unwrap();
        let (peer, env) = rx.recv().await.unwrap();
        assert_eq!(peer, "com.example.peer");
        let v: Value = serde_json::from_str(&env).unwrap();
        assert_eq!(v, json!({"tag": "file", "stat": "cancel"}));
    }

    #[tokio::test]
    async fn send_failure_is_returned() {
        let (raw, _rx) = recording();
        raw.fail.store(true, std::sync::atomic::Ordering::SeqCst);
        let channel = EnvelopeChannel::new("p", raw);
        assert!(matches!(
            channel.send("file", &json!({})).await,
            Err(ChannelError::Closed)
        ));
    }

    #[test]
    fn dispatch_routes_by_tag() {
        let (raw, _rx) = recording();
        let channel = EnvelopeChannel::new("p", raw);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        channel
            .register_handler("file", move |fields| {
                sink.lock().unwrap().push(fields);
                Ok(())
            })
            .unwrap();
        channel.dispatch(r#"{"tag":"file","type":"next","count":1}"#);
        channel.dispatch(r#"{"tag":"other","x":1}"#);
        channel.dispatch("garbage");
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].get("count"), Some(&json!(1)));
    }

    #[test]
    fn failing_handler_does_not_stop_later_dispatch() {
        let (raw, _rx) = recording();
        let channel = EnvelopeChannel::new("p", raw);
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = calls.clone();
        channel
            .register_handler("file", move |_| {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                anyhow::bail!("boom")
            })
            .unwrap();
        channel.dispatch(r#"{"tag":"file"}"#);
        channel.dispatch(r#"{"tag":"file"}"#);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[test]
    fn double_registration_is_explicit() {
        let (raw, _rx) = recording();
        let channel = EnvelopeChannel::new("p", raw);
        channel.register_handler("file", |_| Ok(())).unwrap();
        assert!(channel.register_handler("file", |_| Ok(())).is_err());
        assert!(channel.replace_handler("file", |_| Ok(())));
        assert!(channel.remove_handler("file"));
        assert!(!channel.remove_handler("file"));
    }
}
