//! In-process raw channel. Envelopes addressed to a peer id go straight into that peer's
//! inbound queue; useful for tests and for embedding both ends in one process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::channel::{ChannelError, RawChannel};

#[derive(Default)]
pub struct MemoryChannel {
    routes: Mutex<HashMap<String, mpsc::UnboundedSender<String>>>,
    offline: AtomicBool,
}

impl MemoryChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Deliver envelopes addressed to `peer_id` into `inbox`.
    pub fn route(&self, peer_id: &str, inbox: mpsc::UnboundedSender<String>) {
        self.routes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(peer_id.to_string(), inbox);
    }

    /// While offline every send fails, as if the platform refused the message.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Two channels wired to each other. Returns each side's raw channel and the inbound
    /// stream of envelopes the other side sent it.
    pub fn pair(
        a: &str,
        b: &str,
    ) -> (
        (Arc<Self>, mpsc::UnboundedReceiver<String>),
        (Arc<Self>, mpsc::UnboundedReceiver<String>),
    ) {
        let (to_a, a_inbound) = mpsc::unbounded_channel();
        let (to_b, b_inbound) = mpsc::unbounded_channel();
        let a_raw = Self::new();
        a_raw.route(b, to_b);
        let b_raw = Self::new();
        b_raw.route(a, to_a);
        ((a_raw, a_inbound), (b_raw, b_inbound))
    }
}

#[async_trait]
impl RawChannel for MemoryChannel {
    async fn send(&self, peer_id: &str, envelope: String) -> Result<(), ChannelError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        let routes = self.routes.lock().unwrap_or_else(|p| p.into_inner());
        let inbox = routes
            .get(peer_id)
            .ok_or_else(|| ChannelError::UnknownPeer(peer_id.to_string()))?;
        inbox.send(envelope).map_err(|_| ChannelError::Closed)
    }
}
