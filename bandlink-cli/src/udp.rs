//! UDP raw channel: one JSON envelope per datagram, peers addressed by id.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::channel::{ChannelError, RawChannel};

/// Largest UDP payload over IPv4. Larger envelopes are refused, not fragmented. A data
/// chunk carries a fixed number of chars, so a text window dense in 4-byte chars or in
/// control chars (escaped to `\uXXXX` in JSON) can exceed this with the default chunk size;
/// lower `chunk_bytes` for such files.
pub const MAX_DATAGRAM: usize = 65_507;

#[derive(Default)]
struct Peers {
    addrs: HashMap<String, SocketAddr>,
    subscribers: HashMap<SocketAddr, mpsc::UnboundedSender<String>>,
}

pub struct UdpChannel {
    socket: Arc<UdpSocket>,
    peers: Arc<Mutex<Peers>>,
}

impl UdpChannel {
    /// Bind `local` and start receiving.
    pub async fn bind(local: SocketAddr) -> io::Result<Arc<Self>> {
        let socket = Arc::new(UdpSocket::bind(local).await?);
        let peers = Arc::new(Mutex::new(Peers::default()));
        tokio::spawn(recv_loop(socket.clone(), peers.clone()));
        Ok(Arc::new(Self { socket, peers }))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn add_peer(&self, peer_id: &str, addr: SocketAddr) {
        lock(&self.peers).addrs.insert(peer_id.to_string(), addr);
    }

    /// Inbound envelopes from `peer_id`, one `String` per datagram.
    pub fn subscribe(&self, peer_id: &str) -> Result<mpsc::UnboundedReceiver<String>, ChannelError> {
        let mut peers = lock(&self.peers);
        let addr = *peers
            .addrs
            .get(peer_id)
            .ok_or_else(|| ChannelError::UnknownPeer(peer_id.to_string()))?;
        let (tx, rx) = mpsc::unbounded_channel();
        peers.subscribers.insert(addr, tx);
        Ok(rx)
    }
}

#[async_trait]
impl RawChannel for UdpChannel {
    async fn send(&self, peer_id: &str, envelope: String) -> Result<(), ChannelError> {
        let addr = lock(&self.peers)
            .addrs
            .get(peer_id)
            .copied()
            .ok_or_else(|| ChannelError::UnknownPeer(peer_id.to_string()))?;
        if envelope.len() > MAX_DATAGRAM {
            return Err(ChannelError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("envelope of {} bytes exceeds one datagram", envelope.len()),
            )));
        }
        self.socket.send_to(envelope.as_bytes(), addr).await?;
        Ok(())
    }
}

fn lock(peers: &Mutex<Peers>) -> MutexGuard<'_, Peers> {
    peers.lock().unwrap_or_else(|p| p.into_inner())
}

async fn recv_loop(socket: Arc<UdpSocket>, peers: Arc<Mutex<Peers>>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused
                ) =>
            {
                debug!(error = %e, "ignoring icmp error on udp socket");
                continue;
            }
            Err(e) => {
                warn!(error = %e, "udp receive failed, stopping");
                return;
            }
        };
        let Ok(text) = std::str::from_utf8(&buf[..len]) else {
            debug!(%from, "dropping non-utf8 datagram");
            continue;
        };
        let mut peers = lock(&peers);
        match peers.subscribers.get(&from) {
            Some(tx) => {
                if tx.send(text.to_string()).is_err() {
                    peers.subscribers.remove(&from);
                }
            }
            None => debug!(%from, "datagram from unknown address"),
        }
    }
}
