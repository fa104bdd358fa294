//! The transfer engine: sends and receives files over a [`Transport`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use peerlink_crypto::{export_key, generate_key, import_key};
use peerlink_protocol::{
    ChunkPayload, CompletePayload, FileMessage, StartPayload, Subscription, Transport,
    TransportError, WireMessage,
};
use peerlink_quality::QualityTier;
use peerlink_recovery::{RecoveryController, ResumeHandler};

use crate::TransferError;
use crate::chunked::{OutgoingFile, total_chunks};
use crate::config::TransferConfig;
use crate::events::{Direction, TransferErrorKind, TransferEvent};
use crate::receiver::{ChunkOutcome, FinishOutcome, IncomingTransfer};
use crate::sender::{Checkpoint, OutgoingTransfer, TransferInfo};
use crate::validation::{ValidationRules, format_size, validate_file};

const EVENT_CAPACITY: usize = 1024;

#[derive(Default)]
struct EngineState {
    outgoing: HashMap<String, OutgoingTransfer>,
    incoming: HashMap<String, IncomingTransfer>,
    tiers: HashMap<String, QualityTier>,
}

/// Counts a spawned drain task until it exits.
struct TaskGuard(Arc<AtomicUsize>);

impl TaskGuard {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// What a drain does next.
enum Step {
    Send {
        peer_id: String,
        index: u32,
        message: WireMessage,
        last: bool,
    },
    Pace,
}

/// Sends and receives encrypted, chunked files.
///
/// Outgoing transfers are drained by one task each, strictly in chunk order.
/// Every wait a drain schedules (pacing, retry backoff) hangs off the
/// transfer's cancellation token.
pub struct TransferEngine {
    transport: Arc<dyn Transport>,
    recovery: RecoveryController,
    config: TransferConfig,
    rules: ValidationRules,
    state: Mutex<EngineState>,
    events_tx: broadcast::Sender<TransferEvent>,
    shutdown: CancellationToken,
    live_tasks: Arc<AtomicUsize>,
    this: Weak<TransferEngine>,
}

impl TransferEngine {
    pub fn new(
        transport: Arc<dyn Transport>,
        recovery: RecoveryController,
        config: TransferConfig,
        rules: ValidationRules,
    ) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new_cyclic(|this| Self {
            transport,
            recovery,
            config,
            rules,
            state: Mutex::new(EngineState::default()),
            events_tx,
            shutdown: CancellationToken::new(),
            live_tasks: Arc::new(AtomicUsize::new(0)),
            this: this.clone(),
        })
    }

    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: TransferEvent) {
        let _ = self.events_tx.send(event);
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Subscribes to every transfer event.
    pub fn subscribe(&self) -> Subscription<TransferEvent> {
        Subscription::new(self.events_tx.subscribe())
    }

    /// Starts sending `file` to `peer_id`.
    ///
    /// Returns once the start message went out and draining is scheduled.
    /// Nothing is kept when validation, encryption or the start message
    /// fails.
    pub async fn send_file(
        &self,
        peer_id: &str,
        file: OutgoingFile,
        checksum: &str,
    ) -> Result<String, TransferError> {
        validate_file(&file, &self.rules)?;

        let id = Uuid::new_v4().to_string();
        let key = generate_key();
        let transfer = OutgoingTransfer::prepare(
            id.clone(),
            peer_id.to_string(),
            &file,
            &key,
            self.config.chunk_size,
            self.config.checkpoint_interval,
            self.shutdown.child_token(),
        )?;

        let start = FileMessage::Start(StartPayload {
            id: id.clone(),
            name: file.name.clone(),
            size: file.size(),
            content_type: file.content_type.clone(),
            checksum: checksum.to_string(),
            key: export_key(&key),
        });
        self.transport.send(peer_id, &start.into()).await?;

        info!(
            peer = %peer_id,
            transfer = %id,
            name = %file.name,
            size = file.size(),
            chunks = transfer.total_chunks,
            "outgoing transfer started"
        );

        self.recovery.register_transfer(peer_id, &id);
        self.emit(TransferEvent::Start {
            peer_id: peer_id.to_string(),
            transfer_id: id.clone(),
            direction: Direction::Outgoing,
            name: file.name,
            size: transfer.size,
            total_chunks: transfer.total_chunks,
        });

        {
            let mut state = self.state();
            let transfer = state.outgoing.entry(id.clone()).or_insert(transfer);
            self.spawn_drain(transfer);
        }
        Ok(id)
    }

    /// Halts sending before the next chunk. Returns `false` for unknown ids.
    pub fn pause_transfer(&self, transfer_id: &str) -> bool {
        let peer_id = {
            let mut state = self.state();
            let Some(transfer) = state.outgoing.get_mut(transfer_id) else {
                return false;
            };
            if transfer.paused {
                return true;
            }
            transfer.paused = true;
            transfer.peer_id.clone()
        };

        info!(peer = %peer_id, transfer = %transfer_id, "transfer paused");
        self.emit(TransferEvent::Pause {
            peer_id,
            transfer_id: transfer_id.to_string(),
        });
        true
    }

    /// Continues a paused transfer from its current chunk. Returns `false`
    /// for unknown ids.
    pub fn resume_transfer(&self, transfer_id: &str) -> bool {
        let peer_id = {
            let mut state = self.state();
            let Some(transfer) = state.outgoing.get_mut(transfer_id) else {
                return false;
            };
            if !transfer.paused {
                return true;
            }
            transfer.paused = false;
            // A drain that has not yet seen the pause simply keeps going.
            if !transfer.has_drain() {
                self.spawn_drain(transfer);
            }
            transfer.peer_id.clone()
        };

        info!(peer = %peer_id, transfer = %transfer_id, "transfer resumed");
        self.emit(TransferEvent::Resume {
            peer_id,
            transfer_id: transfer_id.to_string(),
        });
        true
    }

    /// Cancels a transfer in either direction and drops all of its state.
    ///
    /// Idempotent: returns `false` when the id is not known (any more).
    pub fn cancel_transfer(&self, transfer_id: &str) -> bool {
        let (peer_id, outgoing) = {
            let mut state = self.state();
            if let Some(mut transfer) = state.outgoing.remove(transfer_id) {
                transfer.cancel();
                (transfer.peer_id, true)
            } else if let Some(transfer) = state.incoming.remove(transfer_id) {
                (transfer.peer_id, false)
            } else {
                return false;
            }
        };

        if outgoing {
            self.recovery.unregister_transfer(&peer_id, transfer_id);
        }
        info!(peer = %peer_id, transfer = %transfer_id, outgoing, "transfer cancelled");
        self.emit(TransferEvent::Cancel {
            peer_id,
            transfer_id: transfer_id.to_string(),
        });
        true
    }

    /// Updates the pacing multiplier used for transfers to `peer_id`.
    pub fn set_peer_tier(&self, peer_id: &str, tier: QualityTier) {
        debug!(peer = %peer_id, %tier, "pacing tier updated");
        self.state().tiers.insert(peer_id.to_string(), tier);
    }

    /// Tier last reported for `peer_id`, if any.
    pub fn peer_tier(&self, peer_id: &str) -> Option<QualityTier> {
        self.state().tiers.get(peer_id).copied()
    }

    /// Handles a file message received from `peer_id`.
    pub fn handle_message(&self, peer_id: &str, message: FileMessage) {
        match message {
            FileMessage::Start(start) => self.on_start(peer_id, start),
            FileMessage::Chunk(chunk) => self.on_chunk(peer_id, chunk),
            FileMessage::Complete(complete) => self.on_complete(peer_id, complete),
        }
    }

    /// Snapshot of a transfer in either direction.
    pub fn transfer(&self, transfer_id: &str) -> Option<TransferInfo> {
        let state = self.state();
        state
            .outgoing
            .get(transfer_id)
            .map(OutgoingTransfer::info)
            .or_else(|| state.incoming.get(transfer_id).map(IncomingTransfer::info))
    }

    /// Every transfer currently known to the engine.
    pub fn transfers(&self) -> Vec<TransferInfo> {
        let state = self.state();
        state
            .outgoing
            .values()
            .map(OutgoingTransfer::info)
            .chain(state.incoming.values().map(IncomingTransfer::info))
            .collect()
    }

    /// Last checkpoint of an outgoing transfer.
    pub fn checkpoint(&self, transfer_id: &str) -> Option<Checkpoint> {
        self.state()
            .outgoing
            .get(transfer_id)
            .map(|t| t.checkpoint.clone())
    }

    /// Drain tasks that have not exited yet. Zero once every transfer
    /// finished or was cancelled.
    pub fn live_timer_count(&self) -> usize {
        self.live_tasks.load(Ordering::SeqCst)
    }

    /// Cancels every transfer without emitting events.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        let mut state = self.state();
        for transfer in state.outgoing.values_mut() {
            transfer.cancel();
        }
        state.outgoing.clear();
        state.incoming.clear();
        debug!("transfer engine shut down");
    }

    // ---------------------------------------------------------------------
    // Sending
    // ---------------------------------------------------------------------

    fn spawn_drain(&self, transfer: &mut OutgoingTransfer) {
        let Some(engine) = self.this.upgrade() else {
            return;
        };
        let (generation, token) = transfer.start_drain();
        let guard = TaskGuard::new(&self.live_tasks);
        let id = transfer.id.clone();
        trace!(transfer = %id, generation, "drain scheduled");
        tokio::spawn(async move {
            let _guard = guard;
            engine.drain(id, generation, token).await;
        });
    }

    async fn drain(&self, id: String, generation: u64, token: CancellationToken) {
        loop {
            let step = {
                let mut state = self.state();
                let EngineState {
                    outgoing, tiers, ..
                } = &mut *state;
                let Some(transfer) = outgoing.get_mut(&id) else {
                    return;
                };
                if token.is_cancelled() || !transfer.is_current(generation) {
                    return;
                }
                if transfer.paused {
                    transfer.release_drain(generation);
                    debug!(transfer = %id, chunk = transfer.current_chunk, "drain halted on pause");
                    return;
                }

                match transfer.next_message() {
                    None => Step::Send {
                        peer_id: transfer.peer_id.clone(),
                        index: transfer.total_chunks,
                        message: FileMessage::Complete(CompletePayload { id: id.clone() }).into(),
                        last: true,
                    },
                    Some((index, message)) => {
                        let multiplier = tiers
                            .get(&transfer.peer_id)
                            .map_or(1.0, |tier| tier.pacing_multiplier());
                        let ceiling = self.config.rate_limit as f64 * multiplier;
                        if transfer.throughput() > ceiling {
                            Step::Pace
                        } else {
                            Step::Send {
                                peer_id: transfer.peer_id.clone(),
                                index,
                                message,
                                last: false,
                            }
                        }
                    }
                }
            };

            match step {
                Step::Pace => {
                    trace!(transfer = %id, "rate limit exceeded, pacing");
                    if !wait(&token, self.config.pacing_delay()).await {
                        return;
                    }
                }
                Step::Send {
                    peer_id,
                    index,
                    message,
                    last,
                } => {
                    let result = tokio::select! {
                        _ = token.cancelled() => return,
                        result = self.transport.send(&peer_id, &message) => result,
                    };
                    match result {
                        Ok(()) if last => {
                            self.complete_outgoing(&id, generation);
                            return;
                        }
                        Ok(()) => {
                            if !self.chunk_sent(&id, generation) {
                                return;
                            }
                        }
                        Err(e) => {
                            if !self.retry_or_fail(&id, generation, index, e, &token).await {
                                return;
                            }
                        }
                    }
                }
            }
        }
    }

    fn chunk_sent(&self, id: &str, generation: u64) -> bool {
        let event = {
            let mut state = self.state();
            let Some(transfer) = state.outgoing.get_mut(id) else {
                return false;
            };
            if !transfer.is_current(generation) {
                return false;
            }
            if transfer.record_sent() {
                debug!(
                    transfer = %id,
                    checkpoint = transfer.checkpoint.last_chunk_index,
                    bytes = transfer.checkpoint.bytes_transferred,
                    "checkpoint written"
                );
            }
            trace!(transfer = %id, chunk = transfer.current_chunk, "chunk sent");
            transfer.progress_event()
        };
        self.emit(event);
        true
    }

    /// Schedules a resend of chunk `index` or, once the retry budget is
    /// spent, fails the transfer. Returns whether the drain should go on.
    async fn retry_or_fail(
        &self,
        id: &str,
        generation: u64,
        index: u32,
        error: TransportError,
        token: &CancellationToken,
    ) -> bool {
        let max_retries = self.config.retry.max_retries;
        let retry = {
            let mut state = self.state();
            let Some(transfer) = state.outgoing.get_mut(id) else {
                return false;
            };
            if !transfer.is_current(generation) {
                return false;
            }
            let attempt = transfer.retry_attempt;
            if attempt < max_retries {
                transfer.retry_attempt += 1;
                Ok((attempt, transfer.peer_id.clone()))
            } else {
                let mut failed = state.outgoing.remove(id);
                if let Some(transfer) = failed.as_mut() {
                    transfer.cancel();
                }
                Err(failed.map(|t| t.peer_id))
            }
        };

        match retry {
            Ok((attempt, peer_id)) => {
                let delay = self.config.retry.delay_for_attempt(attempt);
                warn!(
                    peer = %peer_id,
                    transfer = %id,
                    chunk = index,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "chunk send failed, retrying"
                );
                self.emit(TransferEvent::Retry {
                    peer_id,
                    transfer_id: id.to_string(),
                    chunk: index,
                    attempt: attempt + 1,
                    next_attempt_in: delay,
                });
                wait(token, delay).await
            }
            Err(Some(peer_id)) => {
                self.recovery.unregister_transfer(&peer_id, id);
                warn!(peer = %peer_id, transfer = %id, chunk = index, error = %error, "transfer failed");
                self.emit(TransferEvent::Error {
                    peer_id,
                    transfer_id: id.to_string(),
                    direction: Direction::Outgoing,
                    kind: TransferErrorKind::SendFailed,
                    message: format!("chunk {index} not sent after {max_retries} retries: {error}"),
                });
                false
            }
            Err(None) => false,
        }
    }

    fn complete_outgoing(&self, id: &str, generation: u64) {
        let transfer = {
            let mut state = self.state();
            match state.outgoing.get(id) {
                Some(transfer) if transfer.is_current(generation) => state.outgoing.remove(id),
                _ => None,
            }
        };
        let Some(mut transfer) = transfer else {
            return;
        };
        transfer.cancel();

        self.recovery.unregister_transfer(&transfer.peer_id, id);
        info!(
            peer = %transfer.peer_id,
            transfer = %id,
            bytes = transfer.bytes_transferred,
            "outgoing transfer complete"
        );
        self.emit(TransferEvent::Complete {
            peer_id: transfer.peer_id,
            transfer_id: id.to_string(),
            direction: Direction::Outgoing,
            file: None,
        });
    }

    // ---------------------------------------------------------------------
    // Receiving
    // ---------------------------------------------------------------------

    fn on_start(&self, peer_id: &str, start: StartPayload) {
        let chunk_size = self.config.chunk_size;
        let event = {
            let mut state = self.state();
            if state.incoming.contains_key(&start.id) {
                warn!(peer = %peer_id, transfer = %start.id, "duplicate start message ignored");
                return;
            }
            let opened = self.incoming_chunk_count(&start).and_then(|total| {
                import_key(&start.key)
                    .map(|key| (key, total))
                    .map_err(|e| e.to_string())
            });
            match opened {
                Ok((key, total)) => {
                    let transfer = IncomingTransfer::receiving(peer_id, &start, key, total);
                    info!(
                        peer = %peer_id,
                        transfer = %start.id,
                        name = %transfer.name,
                        size = start.size,
                        "incoming transfer started"
                    );
                    let event = TransferEvent::Start {
                        peer_id: peer_id.to_string(),
                        transfer_id: start.id.clone(),
                        direction: Direction::Incoming,
                        name: transfer.name.clone(),
                        size: start.size,
                        total_chunks: transfer.total_chunks,
                    };
                    state.incoming.insert(start.id.clone(), transfer);
                    event
                }
                Err(message) => {
                    warn!(
                        peer = %peer_id,
                        transfer = %start.id,
                        error = %message,
                        "rejecting incoming transfer"
                    );
                    state.incoming.insert(
                        start.id.clone(),
                        IncomingTransfer::failed(peer_id, &start, chunk_size),
                    );
                    TransferEvent::Error {
                        peer_id: peer_id.to_string(),
                        transfer_id: start.id.clone(),
                        direction: Direction::Incoming,
                        kind: TransferErrorKind::Integrity,
                        message,
                    }
                }
            }
        };
        self.emit(event);
    }

    /// Bounds the announced size before any buffer is allocated for it.
    fn incoming_chunk_count(&self, start: &StartPayload) -> Result<u32, String> {
        if start.size > self.rules.max_size {
            return Err(format!(
                "announced size {} exceeds maximum of {}",
                format_size(start.size),
                format_size(self.rules.max_size)
            ));
        }
        total_chunks(start.size, self.config.chunk_size)
            .ok_or_else(|| format!("announced size {} has too many chunks", start.size))
    }

    fn on_chunk(&self, peer_id: &str, chunk: ChunkPayload) {
        let event = {
            let mut state = self.state();
            let Some(transfer) = state.incoming.get_mut(&chunk.id) else {
                trace!(peer = %peer_id, transfer = %chunk.id, "chunk for unknown transfer ignored");
                return;
            };
            if transfer.peer_id != peer_id {
                warn!(peer = %peer_id, transfer = %chunk.id, "chunk from unexpected peer ignored");
                return;
            }
            match transfer.accept_chunk(&chunk) {
                ChunkOutcome::Stored => {
                    trace!(transfer = %chunk.id, chunk = chunk.index, "chunk stored");
                    transfer.progress_event()
                }
                ChunkOutcome::Ignored => return,
                ChunkOutcome::Rejected(message) => {
                    warn!(peer = %peer_id, transfer = %chunk.id, %message, "incoming transfer failed");
                    TransferEvent::Error {
                        peer_id: peer_id.to_string(),
                        transfer_id: chunk.id.clone(),
                        direction: Direction::Incoming,
                        kind: TransferErrorKind::Integrity,
                        message,
                    }
                }
            }
        };
        self.emit(event);
    }

    fn on_complete(&self, peer_id: &str, complete: CompletePayload) {
        let transfer = {
            let mut state = self.state();
            match state.incoming.get(&complete.id) {
                Some(transfer) if transfer.peer_id == peer_id => state.incoming.remove(&complete.id),
                Some(_) => {
                    warn!(peer = %peer_id, transfer = %complete.id, "complete from unexpected peer ignored");
                    None
                }
                None => {
                    trace!(peer = %peer_id, transfer = %complete.id, "complete for unknown transfer ignored");
                    None
                }
            }
        };
        let Some(transfer) = transfer else {
            return;
        };

        let transfer_id = transfer.id.clone();
        match transfer.finish() {
            FinishOutcome::Verified(file) => {
                info!(
                    peer = %peer_id,
                    transfer = %transfer_id,
                    name = %file.name,
                    bytes = file.data.len(),
                    "incoming transfer complete"
                );
                self.emit(TransferEvent::Complete {
                    peer_id: peer_id.to_string(),
                    transfer_id,
                    direction: Direction::Incoming,
                    file: Some(Arc::new(file)),
                });
            }
            FinishOutcome::Rejected(message) => {
                warn!(peer = %peer_id, transfer = %transfer_id, %message, "incoming transfer failed verification");
                self.emit(TransferEvent::Error {
                    peer_id: peer_id.to_string(),
                    transfer_id,
                    direction: Direction::Incoming,
                    kind: TransferErrorKind::Integrity,
                    message,
                });
            }
            FinishOutcome::AlreadyFailed => {
                debug!(peer = %peer_id, transfer = %transfer_id, "failed transfer removed");
            }
        }
    }
}

impl ResumeHandler for TransferEngine {
    fn connection_lost(&self, peer_id: &str, transfer_ids: &[String]) {
        let mut state = self.state();
        for id in transfer_ids {
            if let Some(transfer) = state.outgoing.get_mut(id) {
                transfer.paused = true;
                transfer.retry_attempt = 0;
                transfer.stop_drain();
                info!(peer = %peer_id, transfer = %id, chunk = transfer.current_chunk, "transfer suspended");
            }
        }
    }

    fn resume_after_recovery(&self, peer_id: &str, transfer_id: &str) {
        let (checkpoint, remaining) = {
            let mut state = self.state();
            let Some(transfer) = state.outgoing.get_mut(transfer_id) else {
                return;
            };
            transfer.stop_drain();
            let remaining = transfer.rewind_to_checkpoint();
            (transfer.checkpoint.last_chunk_index, remaining)
        };

        self.recovery.register_transfer(peer_id, transfer_id);
        info!(peer = %peer_id, transfer = %transfer_id, checkpoint, remaining, "resuming transfer from checkpoint");
        self.emit(TransferEvent::Resumed {
            peer_id: peer_id.to_string(),
            transfer_id: transfer_id.to_string(),
            checkpoint,
            remaining,
        });

        let mut state = self.state();
        if let Some(transfer) = state.outgoing.get_mut(transfer_id) {
            transfer.paused = false;
            self.spawn_drain(transfer);
        }
    }

    fn recovery_failed(&self, peer_id: &str, transfer_ids: &[String]) {
        let failed: Vec<(String, Direction)> = {
            let mut state = self.state();
            let mut failed: Vec<(String, Direction)> = transfer_ids
                .iter()
                .filter_map(|id| {
                    let mut transfer = state.outgoing.remove(id)?;
                    transfer.cancel();
                    Some((transfer.id, Direction::Outgoing))
                })
                .collect();

            let incoming: Vec<String> = state
                .incoming
                .values()
                .filter(|t| t.peer_id == peer_id)
                .map(|t| t.id.clone())
                .collect();
            for id in incoming {
                state.incoming.remove(&id);
                failed.push((id, Direction::Incoming));
            }
            failed
        };

        for (id, direction) in failed {
            warn!(peer = %peer_id, transfer = %id, ?direction, "transfer failed, connection lost");
            self.emit(TransferEvent::Error {
                peer_id: peer_id.to_string(),
                transfer_id: id,
                direction,
                kind: TransferErrorKind::ConnectionLost,
                message: "connection could not be recovered".to_string(),
            });
        }
    }
}

/// Sleeps for `delay` unless `token` fires first. Returns `false` when
/// cancelled.
async fn wait(token: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use async_trait::async_trait;
    use peerlink_protocol::{Inbound, MemoryNetwork, MemoryTransport, StatsReport};
    use peerlink_recovery::RecoveryConfig;
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    use super::*;
    use crate::CHUNK_SIZE;

    fn engine(transport: Arc<dyn Transport>) -> Arc<TransferEngine> {
        let recovery = RecoveryController::new(Arc::clone(&transport), RecoveryConfig::default());
        TransferEngine::new(
            transport,
            recovery,
            TransferConfig::default(),
            ValidationRules::default(),
        )
    }

    fn pump(engine: Arc<TransferEngine>, mut rx: mpsc::UnboundedReceiver<Inbound>) {
        tokio::spawn(async move {
            while let Some(inbound) = rx.recv().await {
                if let Inbound::Frame { from, bytes } = inbound
                    && let Ok(Some(WireMessage::File(message))) = WireMessage::decode(&bytes)
                {
                    engine.handle_message(&from, message);
                }
            }
        });
    }

    struct Pair {
        net: MemoryNetwork,
        alice: Arc<TransferEngine>,
        bob: Arc<TransferEngine>,
    }

    fn pair_with(alice_transport: impl FnOnce(MemoryTransport) -> Arc<dyn Transport>) -> Pair {
        let net = MemoryNetwork::new();
        let (alice_t, _) = net.endpoint("alice");
        let (bob_t, bob_rx) = net.endpoint("bob");
        net.connect("alice", "bob");
        let alice = engine(alice_transport(alice_t));
        let bob = engine(Arc::new(bob_t));
        pump(Arc::clone(&bob), bob_rx);
        Pair { net, alice, bob }
    }

    fn pair() -> Pair {
        pair_with(|t| Arc::new(t) as Arc<dyn Transport>)
    }

    fn body(len: usize) -> OutgoingFile {
        let data = (0..len).map(|i| (i % 251) as u8).collect();
        OutgoingFile::new("data.bin", "application/octet-stream", data)
    }

    fn sent_chunk_indices(net: &MemoryNetwork, from: &str) -> Vec<u32> {
        net.sent_by(from)
            .into_iter()
            .filter_map(|(_, message)| match message {
                WireMessage::File(FileMessage::Chunk(chunk)) => Some(chunk.index),
                _ => None,
            })
            .collect()
    }

    /// Collects events until the first terminal one, which is returned last.
    async fn until_terminal(events: &mut Subscription<TransferEvent>) -> Vec<TransferEvent> {
        let mut seen = Vec::new();
        loop {
            let event = events.recv().await.expect("engine dropped");
            let terminal = event.is_terminal();
            seen.push(event);
            if terminal {
                return seen;
            }
        }
    }

    async fn until_progress(events: &mut Subscription<TransferEvent>, at_least: u32) {
        loop {
            if let Some(TransferEvent::Progress { current, .. }) = events.recv().await
                && current >= at_least
            {
                return;
            }
        }
    }

    /// Passes at most `budget` chunk sends through, refusing the rest.
    struct Gate {
        inner: MemoryTransport,
        budget: AtomicU32,
    }

    #[async_trait]
    impl Transport for Gate {
        async fn send(&self, peer_id: &str, message: &WireMessage) -> Result<(), TransportError> {
            if let WireMessage::File(FileMessage::Chunk(_)) = message
                && self
                    .budget
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |b| b.checked_sub(1))
                    .is_err()
            {
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

    #[tokio::test(start_paused = true)]
    async fn file_arrives_intact() {
        let p = pair();
        let mut sent = p.alice.subscribe();
        let mut received = p.bob.subscribe();
        let file = body(3 * CHUNK_SIZE + 17);
        let checksum = file.checksum();

        let id = p.alice.send_file("bob", file.clone(), &checksum).await.unwrap();

        let incoming = until_terminal(&mut received).await;
        assert!(matches!(
            incoming.first(),
            Some(TransferEvent::Start { direction: Direction::Incoming, total_chunks: 4, .. })
        ));
        match incoming.last() {
            Some(TransferEvent::Complete { transfer_id, file: Some(received), .. }) => {
                assert_eq!(transfer_id, &id);
                assert_eq!(received.data, file.data);
                assert_eq!(received.name, "data.bin");
                assert_eq!(received.checksum, checksum);
            }
            other => panic!("expected complete, got {other:?}"),
        }

        let outgoing = until_terminal(&mut sent).await;
        assert!(matches!(
            outgoing.last(),
            Some(TransferEvent::Complete { direction: Direction::Outgoing, file: None, .. })
        ));
        let progress = outgoing
            .iter()
            .filter(|e| matches!(e, TransferEvent::Progress { .. }))
            .count();
        assert_eq!(progress, 4);

        tokio::task::yield_now().await;
        assert!(p.alice.transfers().is_empty());
        assert!(p.bob.transfers().is_empty());
        assert_eq!(p.alice.live_timer_count(), 0);
        assert_eq!(sent_chunk_indices(&p.net, "alice"), vec![0, 1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_file_completes() {
        let p = pair();
        let mut received = p.bob.subscribe();
        let file = body(0);
        p.alice.send_file("bob", file.clone(), &file.checksum()).await.unwrap();

        match until_terminal(&mut received).await.last() {
            Some(TransferEvent::Complete { file: Some(f), .. }) => assert!(f.data.is_empty()),
            other => panic!("expected complete, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn start_failure_leaves_no_state() {
        let p = pair();
        p.net.disconnect("alice", "bob");
        let err = p.alice.send_file("bob", body(10), "x").await.unwrap_err();
        assert!(matches!(err, TransferError::Transport(TransportError::NotOpen(_))));
        assert!(p.alice.transfers().is_empty());
        assert_eq!(p.alice.live_timer_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dangerous_file_is_refused_before_sending() {
        let p = pair();
        let file = OutgoingFile::new("setup.exe", "", vec![1, 2, 3]);
        let err = p.alice.send_file("bob", file, "x").await.unwrap_err();
        assert!(matches!(err, TransferError::Validation(_)));
        assert!(p.net.sent_by("alice").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn retries_back_off_then_fail() {
        let p = pair();
        let mut events = p.alice.subscribe();
        let id = p.alice.send_file("bob", body(CHUNK_SIZE), "x").await.unwrap();
        p.net.fail_next_sends("alice", 4);
        let started = Instant::now();

        let seen = until_terminal(&mut events).await;
        let elapsed = started.elapsed();

        let retries: Vec<(u32, u32, u64)> = seen
            .iter()
            .filter_map(|e| match e {
                TransferEvent::Retry { chunk, attempt, next_attempt_in, .. } => {
                    Some((*chunk, *attempt, next_attempt_in.as_millis() as u64))
                }
                _ => None,
            })
            .collect();
        assert_eq!(retries, vec![(0, 1, 1_000), (0, 2, 2_000), (0, 3, 4_000)]);
        assert!(elapsed >= Duration::from_millis(7_000) && elapsed < Duration::from_millis(7_100));

        match seen.last() {
            Some(TransferEvent::Error { kind, transfer_id, .. }) => {
                assert_eq!(*kind, TransferErrorKind::SendFailed);
                assert_eq!(transfer_id, &id);
            }
            other => panic!("expected error, got {other:?}"),
        }

        tokio::task::yield_now().await;
        assert!(p.alice.transfer(&id).is_none());
        assert_eq!(p.alice.live_timer_count(), 0);
        assert!(sent_chunk_indices(&p.net, "alice").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_backoff_stops_everything() {
        let p = pair();
        let mut events = p.alice.subscribe();
        let id = p.alice.send_file("bob", body(2 * CHUNK_SIZE), "x").await.unwrap();
        p.net.fail_next_sends("alice", 10);

        loop {
            if let Some(TransferEvent::Retry { attempt: 2, .. }) = events.recv().await {
                break;
            }
        }
        assert!(p.alice.cancel_transfer(&id));
        assert!(!p.alice.cancel_transfer(&id));

        tokio::time::sleep(Duration::from_secs(30)).await;
        let after = events.drain();
        assert_eq!(after.len(), 1);
        assert!(matches!(after[0], TransferEvent::Cancel { .. }));
        assert_eq!(p.alice.live_timer_count(), 0);
        assert!(p.alice.transfer(&id).is_none());
        assert!(p.alice.checkpoint(&id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn pause_and_resume_never_duplicate_chunks() {
        let p = pair();
        let mut events = p.alice.subscribe();
        let mut received = p.bob.subscribe();
        let file = body(30 * CHUNK_SIZE);
        let id = p.alice.send_file("bob", file.clone(), &file.checksum()).await.unwrap();

        until_progress(&mut events, 5).await;
        assert!(p.alice.pause_transfer(&id));
        tokio::time::sleep(Duration::from_secs(1)).await;
        let frozen = sent_chunk_indices(&p.net, "alice").len();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(sent_chunk_indices(&p.net, "alice").len(), frozen);
        assert!(p.alice.transfer(&id).unwrap().paused);
        assert_eq!(p.alice.live_timer_count(), 0);

        assert!(p.alice.resume_transfer(&id));
        until_progress(&mut events, 15).await;
        // Resume before the drain notices the pause.
        assert!(p.alice.pause_transfer(&id));
        assert!(p.alice.resume_transfer(&id));

        let seen = until_terminal(&mut events).await;
        assert!(matches!(seen.last(), Some(TransferEvent::Complete { .. })));
        assert_eq!(sent_chunk_indices(&p.net, "alice"), (0..30).collect::<Vec<u32>>());

        let incoming = until_terminal(&mut received).await;
        assert!(matches!(incoming.last(), Some(TransferEvent::Complete { file: Some(_), .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_ids_are_ignored() {
        let p = pair();
        assert!(!p.alice.pause_transfer("nope"));
        assert!(!p.alice.resume_transfer("nope"));
        assert!(!p.alice.cancel_transfer("nope"));
        assert!(p.alice.checkpoint("nope").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_mid_transfer_leaves_nothing_behind() {
        let p = pair();
        let mut events = p.alice.subscribe();
        let id = p.alice.send_file("bob", body(30 * CHUNK_SIZE), "x").await.unwrap();

        until_progress(&mut events, 3).await;
        assert!(p.alice.cancel_transfer(&id));
        tokio::task::yield_now().await;

        assert_eq!(p.alice.live_timer_count(), 0);
        assert!(p.alice.transfer(&id).is_none());
        assert!(p.alice.checkpoint(&id).is_none());

        let frozen = sent_chunk_indices(&p.net, "alice").len();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(sent_chunk_indices(&p.net, "alice").len(), frozen);
    }

    #[tokio::test(start_paused = true)]
    async fn resumes_from_last_checkpoint_after_link_loss() {
        let gate = Arc::new(std::sync::OnceLock::<Arc<Gate>>::new());
        let slot = Arc::clone(&gate);
        let p = pair_with(move |inner| {
            let g = Arc::new(Gate {
                inner,
                budget: AtomicU32::new(24),
            });
            let _ = slot.set(Arc::clone(&g));
            g as Arc<dyn Transport>
        });
        let gate = gate.get().cloned().unwrap();
        let mut events = p.alice.subscribe();
        let mut received = p.bob.subscribe();
        let file = body(30 * CHUNK_SIZE);
        let id = p.alice.send_file("bob", file.clone(), &file.checksum()).await.unwrap();

        loop {
            if let Some(TransferEvent::Retry { chunk, .. }) = events.recv().await {
                assert_eq!(chunk, 24);
                break;
            }
        }
        p.alice.connection_lost("bob", &[id.clone()]);
        assert!(p.alice.transfer(&id).unwrap().paused);
        assert_eq!(p.alice.checkpoint(&id).unwrap().last_chunk_index, 20);

        // The pending retry wait was cancelled with the drain.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(events.drain().is_empty());
        assert_eq!(p.alice.live_timer_count(), 0);

        gate.budget.store(100, Ordering::SeqCst);
        p.alice.resume_after_recovery("bob", &id);

        let seen = until_terminal(&mut events).await;
        assert!(matches!(
            seen.first(),
            Some(TransferEvent::Resumed { checkpoint: 20, remaining: 10, .. })
        ));
        assert!(matches!(seen.last(), Some(TransferEvent::Complete { .. })));

        let expected: Vec<u32> = (0..24).chain(20..30).collect();
        assert_eq!(sent_chunk_indices(&p.net, "alice"), expected);

        let incoming = until_terminal(&mut received).await;
        match incoming.last() {
            Some(TransferEvent::Complete { file: Some(f), .. }) => assert_eq!(f.data, file.data),
            other => panic!("expected complete, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_recovery_fails_transfer() {
        let p = pair();
        let mut events = p.alice.subscribe();
        let id = p.alice.send_file("bob", body(30 * CHUNK_SIZE), "x").await.unwrap();
        until_progress(&mut events, 2).await;

        p.alice.connection_lost("bob", &[id.clone()]);
        p.alice.recovery_failed("bob", &[id.clone()]);

        match until_terminal(&mut events).await.last() {
            Some(TransferEvent::Error { kind, .. }) => {
                assert_eq!(*kind, TransferErrorKind::ConnectionLost)
            }
            other => panic!("expected error, got {other:?}"),
        }
        tokio::task::yield_now().await;
        assert!(p.alice.transfer(&id).is_none());
        assert_eq!(p.alice.live_timer_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unusable_key_fails_incoming_transfer_once() {
        let p = pair();
        let mut events = p.bob.subscribe();
        let start = StartPayload {
            id: "t1".into(),
            name: "a.txt".into(),
            size: 4,
            content_type: String::new(),
            checksum: String::new(),
            key: "bm90IGEga2V5".into(),
        };
        p.bob.handle_message("alice", FileMessage::Start(start));
        p.bob.handle_message(
            "alice",
            FileMessage::Chunk(ChunkPayload {
                id: "t1".into(),
                index: 0,
                data: vec![0; 20],
                iv: vec![0; 12],
            }),
        );
        assert_eq!(p.bob.transfers().len(), 1);
        p.bob.handle_message("alice", FileMessage::Complete(CompletePayload { id: "t1".into() }));
        assert!(p.bob.transfers().is_empty());

        let all = events.drain();
        assert_eq!(all.len(), 1);
        assert!(matches!(
            all[0],
            TransferEvent::Error { kind: TransferErrorKind::Integrity, direction: Direction::Incoming, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_start_is_refused_before_buffering() {
        let p = pair();
        let mut events = p.bob.subscribe();
        let limit = ValidationRules::default().max_size;
        for (id, size) in [("huge", 1u64 << 46), ("over", limit + 1)] {
            p.bob.handle_message(
                "alice",
                FileMessage::Start(StartPayload {
                    id: id.into(),
                    name: "a.bin".into(),
                    size,
                    content_type: String::new(),
                    checksum: String::new(),
                    key: export_key(&generate_key()),
                }),
            );
        }

        let all = events.drain();
        assert_eq!(all.len(), 2, "{all:?}");
        for event in &all {
            match event {
                TransferEvent::Error { kind, direction, message, .. } => {
                    assert_eq!(*kind, TransferErrorKind::Integrity);
                    assert_eq!(*direction, Direction::Incoming);
                    assert!(message.contains("exceeds maximum"), "{message}");
                }
                other => panic!("expected error, got {other:?}"),
            }
        }
        let huge = p.bob.transfer("huge").unwrap();
        assert_eq!(huge.total_chunks, 0);
        assert_eq!(huge.bytes_transferred, 0);

        p.bob.handle_message("alice", FileMessage::Complete(CompletePayload { id: "huge".into() }));
        assert!(p.bob.transfer("huge").is_none());
        assert!(events.drain().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn lost_sender_fails_incoming_transfer_once() {
        let p = pair();
        let mut received = p.bob.subscribe();
        let file = body(60 * CHUNK_SIZE);
        p.alice.send_file("bob", file.clone(), &file.checksum()).await.unwrap();
        until_progress(&mut received, 3).await;

        p.bob.recovery_failed("alice", &[]);
        assert!(p.bob.transfers().is_empty());

        // Leftover chunks from alice land on an unknown id.
        tokio::time::sleep(Duration::from_secs(5)).await;
        let terminal: Vec<_> = received.drain().into_iter().filter(|e| e.is_terminal()).collect();
        assert_eq!(terminal.len(), 1, "{terminal:?}");
        assert!(matches!(
            terminal[0],
            TransferEvent::Error {
                kind: TransferErrorKind::ConnectionLost,
                direction: Direction::Incoming,
                ..
            }
        ));
        assert!(p.bob.transfers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_drops_incoming_buffer() {
        let p = pair();
        let mut received = p.bob.subscribe();
        let file = body(30 * CHUNK_SIZE);
        p.alice.send_file("bob", file.clone(), &file.checksum()).await.unwrap();
        until_progress(&mut received, 2).await;

        let incoming = p.bob.transfers();
        assert_eq!(incoming.len(), 1);
        assert_eq!(incoming[0].direction, Direction::Incoming);
        assert!(p.bob.cancel_transfer(&incoming[0].id));
        assert!(p.bob.transfers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn poor_tier_slows_pacing() {
        async fn send_time(tier: QualityTier) -> Duration {
            let p = pair();
            p.alice.set_peer_tier("bob", tier);
            let mut events = p.alice.subscribe();
            let started = Instant::now();
            p.alice.send_file("bob", body(20 * CHUNK_SIZE), "x").await.unwrap();
            until_terminal(&mut events).await;
            started.elapsed()
        }

        let fast = send_time(QualityTier::Excellent).await;
        let slow = send_time(QualityTier::Critical).await;
        assert!(fast < Duration::from_millis(500), "{fast:?}");
        assert!(slow > Duration::from_millis(1_100), "{slow:?}");
    }
}
