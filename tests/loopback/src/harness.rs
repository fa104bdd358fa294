use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use peerlink_protocol::{
    FileMessage, Inbound, MemoryNetwork, MemoryTransport, StatsReport, Subscription, Transport,
    TransportError, WireMessage,
};
use peerlink_session::{Session, SessionConfig, TransferEvent};
use peerlink_transfer::OutgoingFile;

/// `alice` and `bob`, connected, with their inboxes pumped into their
/// sessions.
pub struct Pair {
    pub net: MemoryNetwork,
    pub alice: Arc<Session>,
    pub bob: Arc<Session>,
}

impl Pair {
    pub fn new() -> Self {
        Self::with_alice_transport(SessionConfig::default(), |t, _| Arc::new(t) as Arc<dyn Transport>)
    }

    /// Builds the pair with alice's transport wrapped by `wrap`.
    pub fn with_alice_transport(
        config: SessionConfig,
        wrap: impl FnOnce(MemoryTransport, MemoryNetwork) -> Arc<dyn Transport>,
    ) -> Self {
        let net = MemoryNetwork::new();
        let (alice_t, alice_rx) = net.endpoint("alice");
        let (bob_t, bob_rx) = net.endpoint("bob");
        let alice = Arc::new(Session::new(wrap(alice_t, net.clone()), config.clone()));
        let bob = Arc::new(Session::new(Arc::new(bob_t), config));
        pump(Arc::clone(&alice), alice_rx);
        pump(Arc::clone(&bob), bob_rx);
        net.connect("alice", "bob");
        Self { net, alice, bob }
    }

    /// Chunk indices alice delivered, in send order.
    pub fn sent_chunks(&self) -> Vec<u32> {
        self.net
            .sent_by("alice")
            .into_iter()
            .filter_map(|(_, message)| match message {
                WireMessage::File(FileMessage::Chunk(chunk)) => Some(chunk.index),
                _ => None,
            })
            .collect()
    }
}

impl Default for Pair {
    fn default() -> Self {
        Self::new()
    }
}

fn pump(session: Arc<Session>, mut rx: mpsc::UnboundedReceiver<Inbound>) {
    tokio::spawn(async move {
        while let Some(inbound) = rx.recv().await {
            match inbound {
                Inbound::Frame { from, bytes } => session.handle_incoming(&from, &bytes),
                Inbound::Link { peer, state } => session.handle_link_state(&peer, state),
            }
        }
    });
}

/// Lets spawned tasks run.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

pub fn sample_file(name: &str, len: usize) -> OutgoingFile {
    let data = (0..len).map(|i| (i * 7 % 256) as u8).collect();
    OutgoingFile::new(name, "application/octet-stream", data)
}

/// Collects events until the first terminal one, which comes last.
pub async fn until_terminal(events: &mut Subscription<TransferEvent>) -> Vec<TransferEvent> {
    let mut seen = Vec::new();
    while let Some(event) = events.recv().await {
        let terminal = event.is_terminal();
        seen.push(event);
        if terminal {
            break;
        }
    }
    seen
}

/// Waits for an outgoing progress event at or past chunk `at_least`.
pub async fn until_progress(events: &mut Subscription<TransferEvent>, at_least: u32) {
    while let Some(event) = events.recv().await {
        if let TransferEvent::Progress { current, .. } = event
            && current >= at_least
        {
            return;
        }
    }
}

/// Delivers `allowed` chunk sends, then drops the link on the next one.
/// Passes everything through afterwards.
pub struct CutAfter {
    inner: MemoryTransport,
    net: MemoryNetwork,
    allowed: AtomicU32,
    armed: AtomicBool,
}

impl CutAfter {
    pub fn new(inner: MemoryTransport, net: MemoryNetwork, allowed: u32) -> Self {
        Self {
            inner,
            net,
            allowed: AtomicU32::new(allowed),
            armed: AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl Transport for CutAfter {
    async fn send(&self, peer_id: &str, message: &WireMessage) -> Result<(), TransportError> {
        if let WireMessage::File(FileMessage::Chunk(_)) = message
            && self.armed.load(Ordering::SeqCst)
            && self
                .allowed
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_err()
        {
            self.armed.store(false, Ordering::SeqCst);
            self.net.disconnect(self.inner.name(), peer_id);
            return Err(TransportError::NotOpen(peer_id.to_string()));
        }
        self.inner.send(peer_id, message).await
    }

    async fn stats(&self, peer_id: &str) -> Result<StatsReport, TransportError> {
        self.inner.stats(peer_id).await
    }

    async fn reconnect(&self, peer_id: &str) -> Result<(), TransportError> {
        self.inner.reconnect(peer_id).await
    }
}

/// Flips one bit in the ciphertext of chunk `index`.
pub struct Tamper {
    inner: MemoryTransport,
    index: u32,
}

impl Tamper {
    pub fn new(inner: MemoryTransport, index: u32) -> Self {
        Self { inner, index }
    }
}

#[async_trait]
impl Transport for Tamper {
    async fn send(&self, peer_id: &str, message: &WireMessage) -> Result<(), TransportError> {
        match message {
            WireMessage::File(FileMessage::Chunk(chunk)) if chunk.index == self.index => {
                let mut chunk = chunk.clone();
                if let Some(byte) = chunk.data.first_mut() {
                    *byte ^= 0x01;
                }
                self.inner.send(peer_id, &FileMessage::Chunk(chunk).into()).await
            }
            _ => self.inner.send(peer_id, message).await,
        }
    }

    async fn stats(&self, peer_id: &str) -> Result<StatsReport, TransportError> {
        self.inner.stats(peer_id).await
    }

    async fn reconnect(&self, peer_id: &str) -> Result<(), TransportError> {
        self.inner.reconnect(peer_id).await
    }
}
