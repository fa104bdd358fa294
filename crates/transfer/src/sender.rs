//! Per-transfer state on the sending side.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use peerlink_crypto::{ChunkKey, ChunkNonce, CryptoError, encrypt_chunk};
use peerlink_protocol::{ChunkPayload, FileMessage, WireMessage};

use crate::chunked::{ChunkReader, OutgoingFile, total_chunks};
use crate::events::{Direction, TransferEvent};
use crate::progress::SpeedCalculator;

/// Resume point of an outgoing transfer.
///
/// Every chunk below `last_chunk_index` has been delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub last_chunk_index: u32,
    pub bytes_transferred: u64,
    pub timestamp: DateTime<Utc>,
}

impl Checkpoint {
    fn at(last_chunk_index: u32, bytes_transferred: u64) -> Self {
        Self {
            last_chunk_index,
            bytes_transferred,
            timestamp: Utc::now(),
        }
    }
}

/// Point-in-time view of a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferInfo {
    pub id: String,
    pub peer_id: String,
    pub name: String,
    pub direction: Direction,
    pub size: u64,
    pub current_chunk: u32,
    pub total_chunks: u32,
    pub bytes_transferred: u64,
    pub paused: bool,
}

/// One encrypted chunk waiting to be sent.
pub(crate) struct QueuedChunk {
    pub(crate) index: u32,
    ciphertext: Vec<u8>,
    nonce: ChunkNonce,
    plain_len: usize,
}

struct DrainHandle {
    generation: u64,
    token: CancellationToken,
}

pub(crate) struct OutgoingTransfer {
    pub(crate) id: String,
    pub(crate) peer_id: String,
    pub(crate) name: String,
    pub(crate) size: u64,
    pub(crate) total_chunks: u32,
    pub(crate) current_chunk: u32,
    pub(crate) bytes_transferred: u64,
    pub(crate) paused: bool,
    pub(crate) retry_attempt: u32,
    pub(crate) checkpoint: Checkpoint,
    started_at: Instant,
    queue: VecDeque<QueuedChunk>,
    /// Chunks delivered since the last checkpoint, oldest first.
    sent: Vec<QueuedChunk>,
    checkpoint_interval: u32,
    cancel: CancellationToken,
    drain: Option<DrainHandle>,
    generation: u64,
    speed: SpeedCalculator,
}

impl OutgoingTransfer {
    /// Encrypts the whole body chunk by chunk and queues the result.
    pub(crate) fn prepare(
        id: String,
        peer_id: String,
        file: &OutgoingFile,
        key: &ChunkKey,
        chunk_size: usize,
        checkpoint_interval: u32,
        cancel: CancellationToken,
    ) -> Result<Self, CryptoError> {
        let capacity = total_chunks(file.size(), chunk_size).unwrap_or(0) as usize;
        let mut queue = VecDeque::with_capacity(capacity);
        for (index, plaintext) in ChunkReader::new(&file.data, chunk_size) {
            let sealed = encrypt_chunk(plaintext, key)?;
            queue.push_back(QueuedChunk {
                index,
                ciphertext: sealed.ciphertext,
                nonce: sealed.nonce,
                plain_len: plaintext.len(),
            });
        }

        let mut speed = SpeedCalculator::default();
        speed.add_sample(0);

        Ok(Self {
            id,
            peer_id,
            name: file.name.clone(),
            size: file.size(),
            total_chunks: queue.len() as u32,
            current_chunk: 0,
            bytes_transferred: 0,
            paused: false,
            retry_attempt: 0,
            checkpoint: Checkpoint::at(0, 0),
            started_at: Instant::now(),
            queue,
            sent: Vec::new(),
            checkpoint_interval: checkpoint_interval.max(1),
            cancel,
            drain: None,
            generation: 0,
            speed,
        })
    }

    /// Next chunk to send, as a wire message.
    pub(crate) fn next_message(&self) -> Option<(u32, WireMessage)> {
        self.queue.front().map(|chunk| {
            let message = FileMessage::Chunk(ChunkPayload {
                id: self.id.clone(),
                index: chunk.index,
                data: chunk.ciphertext.clone(),
                iv: chunk.nonce.as_bytes().to_vec(),
            });
            (chunk.index, message.into())
        })
    }

    /// Marks the front chunk as delivered. Returns `true` when this wrote
    /// a checkpoint.
    pub(crate) fn record_sent(&mut self) -> bool {
        let Some(chunk) = self.queue.pop_front() else {
            return false;
        };
        self.current_chunk += 1;
        self.bytes_transferred += chunk.plain_len as u64;
        self.retry_attempt = 0;
        self.speed.add_sample(chunk.plain_len as u64);
        self.sent.push(chunk);

        if self.current_chunk % self.checkpoint_interval == 0 {
            self.checkpoint = Checkpoint::at(self.current_chunk, self.bytes_transferred);
            self.sent.clear();
            true
        } else {
            false
        }
    }

    /// Rewinds to the last checkpoint and requeues every chunk sent after
    /// it. Returns the number of chunks left to send.
    pub(crate) fn rewind_to_checkpoint(&mut self) -> usize {
        self.current_chunk = self.checkpoint.last_chunk_index;
        self.bytes_transferred = self.checkpoint.bytes_transferred;
        self.retry_attempt = 0;
        for chunk in self.sent.drain(..).rev() {
            self.queue.push_front(chunk);
        }
        self.queue.len()
    }

    /// Observed throughput since the transfer started, in bytes per second.
    pub(crate) fn throughput(&self) -> f64 {
        let elapsed = self.started_at.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.bytes_transferred as f64 / elapsed
        } else if self.bytes_transferred > 0 {
            f64::INFINITY
        } else {
            0.0
        }
    }

    /// Hands out a fresh drain token, invalidating any previous drain.
    pub(crate) fn start_drain(&mut self) -> (u64, CancellationToken) {
        self.stop_drain();
        self.generation += 1;
        let token = self.cancel.child_token();
        self.drain = Some(DrainHandle {
            generation: self.generation,
            token: token.clone(),
        });
        (self.generation, token)
    }

    /// Cancels the running drain, if any, and every wait it scheduled.
    pub(crate) fn stop_drain(&mut self) {
        if let Some(handle) = self.drain.take() {
            handle.token.cancel();
        }
    }

    /// Called by a drain that exits on its own.
    pub(crate) fn release_drain(&mut self, generation: u64) {
        if self.is_current(generation) {
            self.drain = None;
        }
    }

    pub(crate) fn has_drain(&self) -> bool {
        self.drain.is_some()
    }

    /// Whether `generation` is the drain allowed to touch this transfer.
    pub(crate) fn is_current(&self, generation: u64) -> bool {
        self.drain.as_ref().is_some_and(|d| d.generation == generation)
    }

    /// Cancels the transfer token and with it every child wait.
    pub(crate) fn cancel(&mut self) {
        self.drain = None;
        self.cancel.cancel();
    }

    pub(crate) fn progress_event(&self) -> TransferEvent {
        let remaining = self.size.saturating_sub(self.bytes_transferred);
        TransferEvent::Progress {
            peer_id: self.peer_id.clone(),
            transfer_id: self.id.clone(),
            direction: Direction::Outgoing,
            current: self.current_chunk,
            total: self.total_chunks,
            fraction: fraction(self.current_chunk, self.total_chunks),
            bytes: self.bytes_transferred,
            speed: self.speed.bytes_per_second(),
            eta: self.speed.eta(remaining),
        }
    }

    pub(crate) fn info(&self) -> TransferInfo {
        TransferInfo {
            id: self.id.clone(),
            peer_id: self.peer_id.clone(),
            name: self.name.clone(),
            direction: Direction::Outgoing,
            size: self.size,
            current_chunk: self.current_chunk,
            total_chunks: self.total_chunks,
            bytes_transferred: self.bytes_transferred,
            paused: self.paused,
        }
    }
}

pub(crate) fn fraction(current: u32, total: u32) -> f64 {
    if total == 0 {
        1.0
    } else {
        f64::from(current) / f64::from(total)
    }
}
