//! In-process transport.
//!
//! A [`MemoryNetwork`] links named endpoints. Frames sent by one endpoint are
//! serialized to JSON and delivered, in order, to the receiving endpoint's
//! inbox alongside link-state notifications. Links can be taken down and
//! brought back, send failures injected and statistics scripted, which is
//! everything the transfer, quality and recovery paths need to be exercised
//! without a real peer connection.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::link::LinkState;
use crate::stats::StatsReport;
use crate::transport::{Transport, TransportError};
use crate::wire::WireMessage;

/// Something delivered to an endpoint's inbox.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A raw frame received from `from`.
    Frame { from: String, bytes: Vec<u8> },
    /// The link to `peer` changed state.
    Link { peer: String, state: LinkState },
}

#[derive(Debug, Clone, Copy)]
struct LinkSlot {
    up: bool,
    reconnect_allowed: bool,
}

#[derive(Default)]
struct NetworkInner {
    inboxes: HashMap<String, mpsc::UnboundedSender<Inbound>>,
    links: HashMap<(String, String), LinkSlot>,
    stats: HashMap<(String, String), StatsReport>,
    send_failures: HashMap<String, u32>,
    sent: Vec<(String, String, WireMessage)>,
}

impl NetworkInner {
    fn notify(&self, endpoint: &str, peer: &str, state: LinkState) {
        if let Some(inbox) = self.inboxes.get(endpoint) {
            let _ = inbox.send(Inbound::Link {
                peer: peer.to_string(),
                state,
            });
        }
    }

    fn set_link(&mut self, a: &str, b: &str, up: bool) {
        let slot = self.links.entry(link_key(a, b)).or_insert(LinkSlot {
            up,
            reconnect_allowed: true,
        });
        slot.up = up;
        let state = if up {
            LinkState::Connected
        } else {
            LinkState::Disconnected
        };
        self.notify(a, b, state);
        self.notify(b, a, state);
    }
}

fn link_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

/// A set of in-process endpoints and the links between them.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, NetworkInner> {
        // A panic while holding this lock only happens inside tests; keep going.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers an endpoint and returns its transport and inbox.
    ///
    /// Registering the same name again replaces the previous inbox.
    pub fn endpoint(
        &self,
        name: impl Into<String>,
    ) -> (MemoryTransport, mpsc::UnboundedReceiver<Inbound>) {
        let name = name.into();
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().inboxes.insert(name.clone(), tx);
        (
            MemoryTransport {
                name,
                network: self.clone(),
            },
            rx,
        )
    }

    /// Brings the link between `a` and `b` up and notifies both sides.
    pub fn connect(&self, a: &str, b: &str) {
        debug!(a, b, "memory link up");
        self.lock().set_link(a, b, true);
    }

    /// Takes the link between `a` and `b` down and notifies both sides.
    pub fn disconnect(&self, a: &str, b: &str) {
        debug!(a, b, "memory link down");
        self.lock().set_link(a, b, false);
    }

    /// Controls whether [`Transport::reconnect`] can restore the link.
    pub fn set_reconnect_allowed(&self, a: &str, b: &str, allowed: bool) {
        let mut inner = self.lock();
        let slot = inner.links.entry(link_key(a, b)).or_insert(LinkSlot {
            up: false,
            reconnect_allowed: allowed,
        });
        slot.reconnect_allowed = allowed;
    }

    /// Whether the link between `a` and `b` is up.
    pub fn is_up(&self, a: &str, b: &str) -> bool {
        self.lock()
            .links
            .get(&link_key(a, b))
            .is_some_and(|slot| slot.up)
    }

    /// Scripts the report returned by `local`'s `stats(peer)`.
    pub fn set_stats(&self, local: &str, peer: &str, report: StatsReport) {
        self.lock()
            .stats
            .insert((local.to_string(), peer.to_string()), report);
    }

    /// Makes the next `count` sends from `local` fail.
    pub fn fail_next_sends(&self, local: &str, count: u32) {
        self.lock().send_failures.insert(local.to_string(), count);
    }

    /// Every message successfully sent by `local`, in order, with its target.
    pub fn sent_by(&self, local: &str) -> Vec<(String, WireMessage)> {
        self.lock()
            .sent
            .iter()
            .filter(|(from, _, _)| from == local)
            .map(|(_, to, msg)| (to.clone(), msg.clone()))
            .collect()
    }
}

/// One endpoint of a [`MemoryNetwork`].
#[derive(Clone)]
pub struct MemoryTransport {
    name: String,
    network: MemoryNetwork,
}

impl MemoryTransport {
    /// Name this endpoint was registered under.
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, peer_id: &str, message: &WireMessage) -> Result<(), TransportError> {
        let mut inner = self.network.lock();
        let up = inner
            .links
            .get(&link_key(&self.name, peer_id))
            .is_some_and(|slot| slot.up);
        if !up {
            return Err(TransportError::NotOpen(peer_id.to_string()));
        }

        if let Some(remaining) = inner.send_failures.get_mut(&self.name)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(TransportError::SendFailed("injected failure".into()));
        }

        let bytes = message.encode()?;
        let inbox = inner
            .inboxes
            .get(peer_id)
            .ok_or_else(|| TransportError::NotOpen(peer_id.to_string()))?;
        inbox
            .send(Inbound::Frame {
                from: self.name.clone(),
                bytes,
            })
            .map_err(|_| TransportError::NotOpen(peer_id.to_string()))?;
        trace!(from = %self.name, to = peer_id, "frame delivered");
        inner
            .sent
            .push((self.name.clone(), peer_id.to_string(), message.clone()));
        Ok(())
    }

    async fn stats(&self, peer_id: &str) -> Result<StatsReport, TransportError> {
        let inner = self.network.lock();
        let up = inner
            .links
            .get(&link_key(&self.name, peer_id))
            .is_some_and(|slot| slot.up);
        if !up {
            return Err(TransportError::Stats(format!("no link to {peer_id}")));
        }
        Ok(inner
            .stats
            .get(&(self.name.clone(), peer_id.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn reconnect(&self, peer_id: &str) -> Result<(), TransportError> {
        let mut inner = self.network.lock();
        let allowed = inner
            .links
            .get(&link_key(&self.name, peer_id))
            .is_none_or(|slot| slot.reconnect_allowed);
        if !allowed {
            return Err(TransportError::Reconnect(format!("{peer_id} unreachable")));
        }
        debug!(from = %self.name, to = peer_id, "memory reconnect");
        inner.set_link(&self.name, peer_id, true);
        Ok(())
    }
}
