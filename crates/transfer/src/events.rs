use std::sync::Arc;
use std::time::Duration;

use peerlink_protocol::Scoped;

/// Which side of a transfer this engine is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// Why a transfer ended with an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferErrorKind {
    /// A chunk could not be sent after every retry.
    SendFailed,
    /// Decryption, a chunk index or the final checksum did not check out.
    Integrity,
    /// The link never came back.
    ConnectionLost,
}

/// A fully received and verified file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    /// Sanitized file name.
    pub name: String,
    pub content_type: String,
    pub checksum: String,
    pub data: Vec<u8>,
}

/// Events published by the transfer engine.
///
/// Every transfer ends with exactly one of `Complete`, `Error` or `Cancel`.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    Start {
        peer_id: String,
        transfer_id: String,
        direction: Direction,
        name: String,
        size: u64,
        total_chunks: u32,
    },
    Progress {
        peer_id: String,
        transfer_id: String,
        direction: Direction,
        current: u32,
        total: u32,
        fraction: f64,
        bytes: u64,
        /// Bytes per second.
        speed: f64,
        eta: Option<Duration>,
    },
    Pause {
        peer_id: String,
        transfer_id: String,
    },
    Resume {
        peer_id: String,
        transfer_id: String,
    },
    Complete {
        peer_id: String,
        transfer_id: String,
        direction: Direction,
        /// Set on the receiving side.
        file: Option<Arc<ReceivedFile>>,
    },
    Error {
        peer_id: String,
        transfer_id: String,
        direction: Direction,
        kind: TransferErrorKind,
        message: String,
    },
    Retry {
        peer_id: String,
        transfer_id: String,
        chunk: u32,
        /// 1-based.
        attempt: u32,
        next_attempt_in: Duration,
    },
    Cancel {
        peer_id: String,
        transfer_id: String,
    },
    /// Sending continues from `checkpoint` after the link came back.
    Resumed {
        peer_id: String,
        transfer_id: String,
        checkpoint: u32,
        remaining: usize,
    },
}

impl TransferEvent {
    /// Whether this event ends its transfer.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferEvent::Complete { .. } | TransferEvent::Error { .. } | TransferEvent::Cancel { .. }
        )
    }

    fn ids(&self) -> (&str, &str) {
        match self {
            TransferEvent::Start { peer_id, transfer_id, .. }
            | TransferEvent::Progress { peer_id, transfer_id, .. }
            | TransferEvent::Pause { peer_id, transfer_id }
            | TransferEvent::Resume { peer_id, transfer_id }
            | TransferEvent::Complete { peer_id, transfer_id, .. }
            | TransferEvent::Error { peer_id, transfer_id, .. }
            | TransferEvent::Retry { peer_id, transfer_id, .. }
            | TransferEvent::Cancel { peer_id, transfer_id }
            | TransferEvent::Resumed { peer_id, transfer_id, .. } => (peer_id, transfer_id),
        }
    }
}

impl Scoped for TransferEvent {
    fn peer_id(&self) -> &str {
        self.ids().0
    }

    fn transfer_id(&self) -> Option<&str> {
        Some(self.ids().1)
    }
}
