//! Per-component event subscriptions.
//!
//! Each component owns a `broadcast` channel for its own event enum. A
//! [`Subscription`] narrows one receiver to a single peer or transfer so
//! consumers never see cross-talk from unrelated peers.

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::warn;

/// An event that belongs to a peer and optionally to a transfer.
pub trait Scoped {
    fn peer_id(&self) -> &str;

    fn transfer_id(&self) -> Option<&str> {
        None
    }
}

/// Filtered view over a component's event channel.
pub struct Subscription<E> {
    rx: broadcast::Receiver<E>,
    peer: Option<String>,
    transfer: Option<String>,
}

impl<E: Clone + Scoped> Subscription<E> {
    /// Wraps a receiver without any filter.
    pub fn new(rx: broadcast::Receiver<E>) -> Self {
        Self {
            rx,
            peer: None,
            transfer: None,
        }
    }

    /// Only yield events for `peer_id`.
    pub fn for_peer(mut self, peer_id: impl Into<String>) -> Self {
        self.peer = Some(peer_id.into());
        self
    }

    /// Only yield events for `transfer_id`.
    pub fn for_transfer(mut self, transfer_id: impl Into<String>) -> Self {
        self.transfer = Some(transfer_id.into());
        self
    }

    fn matches(&self, event: &E) -> bool {
        if let Some(peer) = &self.peer
            && event.peer_id() != peer
        {
            return false;
        }
        if let Some(transfer) = &self.transfer
            && event.transfer_id() != Some(transfer.as_str())
        {
            return false;
        }
        true
    }

    /// Waits for the next matching event. Returns `None` once the component
    /// has been dropped.
    pub async fn recv(&mut self) -> Option<E> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.matches(&event) => return Some(event),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event subscriber lagged, events dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Returns the next matching event that is already queued, if any.
    pub fn try_recv(&mut self) -> Option<E> {
        loop {
            match self.rx.try_recv() {
                Ok(event) if self.matches(&event) => return Some(event),
                Ok(_) => {}
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "event subscriber lagged, events dropped");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    /// Drains every matching event that is already queued.
    pub fn drain(&mut self) -> Vec<E> {
        let mut events = Vec::new();
        while let Some(event) = self.try_recv() {
            events.push(event);
        }
        events
    }
}
