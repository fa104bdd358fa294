//! Outbound boundary to the peer transport.

use async_trait::async_trait;

use crate::stats::StatsReport;
use crate::wire::WireMessage;

/// Errors reported by a [`Transport`].
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("channel to peer {0} is not open")]
    NotOpen(String),

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("stats unavailable: {0}")]
    Stats(String),

    #[error("reconnect failed: {0}")]
    Reconnect(String),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// One ordered, reliable, message-framed channel per peer.
///
/// Implementations wrap the real data channel. Sending to a peer whose
/// channel is not open must fail instead of buffering.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends one message to `peer_id`.
    async fn send(&self, peer_id: &str, message: &WireMessage) -> Result<(), TransportError>;

    /// Pulls the current statistics report for the link to `peer_id`.
    async fn stats(&self, peer_id: &str) -> Result<StatsReport, TransportError>;

    /// Re-establishes the link to `peer_id` (redoes signaling internally).
    ///
    /// Success only means the attempt was issued; the link counts as back
    /// once a `Connected` link state is reported.
    async fn reconnect(&self, peer_id: &str) -> Result<(), TransportError>;
}
