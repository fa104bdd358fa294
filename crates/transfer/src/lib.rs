//! Encrypted, chunked, resumable file transfer between peers.
//!
//! The sender splits a file into fixed-size chunks, seals each one under a
//! per-transfer key and drains them in order over the peer transport, pacing
//! against the peer's quality tier and retrying failed sends with exponential
//! backoff. Periodic checkpoints let a transfer continue after the link drops
//! and comes back. The receiver decrypts, reassembles and verifies the
//! whole-file checksum.

mod chunked;
mod config;
mod engine;
mod events;
mod progress;
mod receiver;
mod sender;
mod validation;

pub use chunked::{ChunkReader, OutgoingFile, calculate_file_checksum, checksum_bytes, total_chunks};
pub use config::{RetryConfig, TransferConfig};
pub use engine::TransferEngine;
pub use events::{Direction, ReceivedFile, TransferErrorKind, TransferEvent};
pub use progress::SpeedCalculator;
pub use sender::{Checkpoint, TransferInfo};
pub use validation::{
    DANGEROUS_EXTENSIONS, ValidationRules, format_size, sanitize_file_name, validate_file,
};

use peerlink_crypto::CryptoError;
use peerlink_protocol::TransportError;

/// Plaintext chunk size: 16 KiB.
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Chunks sent between two checkpoints.
pub const CHECKPOINT_INTERVAL: u32 = 10;

/// Errors returned by transfer operations.
///
/// Failures that happen after `send_file` returned are reported as
/// [`TransferEvent::Error`] instead.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("encryption error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
