//! Per-transfer state on the receiving side.

use peerlink_crypto::{ChunkKey, ChunkNonce, decrypt_chunk};
use peerlink_protocol::{ChunkPayload, StartPayload};

use crate::chunked::{checksum_bytes, total_chunks};
use crate::events::{Direction, ReceivedFile, TransferEvent};
use crate::progress::SpeedCalculator;
use crate::sender::{TransferInfo, fraction};
use crate::validation::sanitize_file_name;

enum IncomingState {
    Receiving {
        key: ChunkKey,
        chunks: Vec<Option<Vec<u8>>>,
        received: u32,
        bytes: u64,
    },
    Failed,
}

/// Result of feeding one chunk.
pub(crate) enum ChunkOutcome {
    Stored,
    /// The transfer already failed; the chunk was dropped.
    Ignored,
    /// The chunk broke the transfer, which is now failed.
    Rejected(String),
}

/// Result of a `Complete` message.
pub(crate) enum FinishOutcome {
    Verified(ReceivedFile),
    Rejected(String),
    /// The transfer had already failed.
    AlreadyFailed,
}

pub(crate) struct IncomingTransfer {
    pub(crate) id: String,
    pub(crate) peer_id: String,
    pub(crate) name: String,
    content_type: String,
    size: u64,
    checksum: String,
    pub(crate) total_chunks: u32,
    state: IncomingState,
    speed: SpeedCalculator,
}

impl IncomingTransfer {
    /// Opens a transfer announced by `start`, split into `total` chunks.
    ///
    /// The caller has already bounded `start.size`; the buffer is allocated
    /// here.
    pub(crate) fn receiving(peer_id: &str, start: &StartPayload, key: ChunkKey, total: u32) -> Self {
        let mut speed = SpeedCalculator::default();
        speed.add_sample(0);
        Self {
            state: IncomingState::Receiving {
                key,
                chunks: vec![None; total as usize],
                received: 0,
                bytes: 0,
            },
            speed,
            total_chunks: total,
            ..Self::failed(peer_id, start, 0)
        }
    }

    /// Records a transfer that is dead on arrival.
    pub(crate) fn failed(peer_id: &str, start: &StartPayload, chunk_size: usize) -> Self {
        Self {
            id: start.id.clone(),
            peer_id: peer_id.to_string(),
            name: sanitize_file_name(&start.name),
            content_type: start.content_type.clone(),
            size: start.size,
            checksum: start.checksum.clone(),
            total_chunks: total_chunks(start.size, chunk_size).unwrap_or(0),
            state: IncomingState::Failed,
            speed: SpeedCalculator::default(),
        }
    }

    #[cfg(test)]
    pub(crate) fn is_failed(&self) -> bool {
        matches!(self.state, IncomingState::Failed)
    }

    /// Decrypts and stores one chunk. Any failure releases the buffer.
    pub(crate) fn accept_chunk(&mut self, chunk: &ChunkPayload) -> ChunkOutcome {
        let IncomingState::Receiving {
            key,
            chunks,
            received,
            bytes,
        } = &mut self.state
        else {
            return ChunkOutcome::Ignored;
        };

        let total = chunks.len();
        let result = match chunks.get_mut(chunk.index as usize) {
            Some(slot) => open_chunk(key, chunk).map(|plaintext| (slot, plaintext)),
            None => Err(format!(
                "chunk index {} out of range ({total} chunks)",
                chunk.index
            )),
        };

        match result {
            Ok((slot, plaintext)) => {
                let len = plaintext.len() as u64;
                match slot.replace(plaintext) {
                    Some(previous) => *bytes = *bytes - previous.len() as u64 + len,
                    None => {
                        *received += 1;
                        *bytes += len;
                    }
                }
                self.speed.add_sample(len);
                ChunkOutcome::Stored
            }
            Err(message) => {
                self.state = IncomingState::Failed;
                ChunkOutcome::Rejected(message)
            }
        }
    }

    /// Reassembles the file and verifies its checksum.
    pub(crate) fn finish(self) -> FinishOutcome {
        let IncomingState::Receiving { chunks, .. } = self.state else {
            return FinishOutcome::AlreadyFailed;
        };

        let mut data = Vec::with_capacity(self.size as usize);
        for (index, chunk) in chunks.into_iter().enumerate() {
            match chunk {
                Some(bytes) => data.extend_from_slice(&bytes),
                None => return FinishOutcome::Rejected(format!("chunk {index} missing")),
            }
        }

        let actual = checksum_bytes(&data);
        if !actual.eq_ignore_ascii_case(&self.checksum) {
            return FinishOutcome::Rejected(format!(
                "checksum mismatch: expected {}, got {actual}",
                self.checksum
            ));
        }

        FinishOutcome::Verified(ReceivedFile {
            name: self.name,
            content_type: self.content_type,
            checksum: actual,
            data,
        })
    }

    fn counters(&self) -> (u32, u64) {
        match &self.state {
            IncomingState::Receiving { received, bytes, .. } => (*received, *bytes),
            IncomingState::Failed => (0, 0),
        }
    }

    pub(crate) fn progress_event(&self) -> TransferEvent {
        let (received, bytes) = self.counters();
        TransferEvent::Progress {
            peer_id: self.peer_id.clone(),
            transfer_id: self.id.clone(),
            direction: Direction::Incoming,
            current: received,
            total: self.total_chunks,
            fraction: fraction(received, self.total_chunks),
            bytes,
            speed: self.speed.bytes_per_second(),
            eta: self.speed.eta(self.size.saturating_sub(bytes)),
        }
    }

    pub(crate) fn info(&self) -> TransferInfo {
        let (received, bytes) = self.counters();
        TransferInfo {
            id: self.id.clone(),
            peer_id: self.peer_id.clone(),
            name: self.name.clone(),
            direction: Direction::Incoming,
            size: self.size,
            current_chunk: received,
            total_chunks: self.total_chunks,
            bytes_transferred: bytes,
            paused: false,
        }
    }
}

fn open_chunk(key: &ChunkKey, chunk: &ChunkPayload) -> Result<Vec<u8>, String> {
    let nonce = ChunkNonce::from_slice(&chunk.iv).map_err(|e| e.to_string())?;
    decrypt_chunk(&chunk.data, key, &nonce).map_err(|e| format!("chunk {}: {e}", chunk.index))
}
