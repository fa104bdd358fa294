use std::sync::{Arc, Weak};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use peerlink_protocol::{LinkState, Subscription, Transport, WireMessage};
use peerlink_quality::{QualityEvent, QualityMonitor};
use peerlink_recovery::{RecoveryController, RecoveryEvent, ResumeHandler};
use peerlink_transfer::{OutgoingFile, TransferEngine, TransferError, TransferEvent, TransferInfo};

use crate::config::SessionConfig;

/// Every component a peer connection needs, built around one transport.
///
/// Inbound frames and link-state changes are pushed in by the owner of the
/// real channel through [`Session::handle_incoming`] and
/// [`Session::handle_link_state`].
pub struct Session {
    engine: Arc<TransferEngine>,
    quality: QualityMonitor,
    recovery: RecoveryController,
    config: SessionConfig,
    shutdown: CancellationToken,
}

impl Session {
    /// Builds and wires the components. Must be called inside a Tokio runtime.
    pub fn new(transport: Arc<dyn Transport>, config: SessionConfig) -> Self {
        let recovery = RecoveryController::new(Arc::clone(&transport), config.recovery.clone());
        let quality = QualityMonitor::new(Arc::clone(&transport), config.quality.clone());
        let engine = TransferEngine::new(
            transport,
            recovery.clone(),
            config.transfer.clone(),
            config.validation.clone(),
        );

        let handler: Weak<dyn ResumeHandler> = Arc::downgrade(&engine) as Weak<dyn ResumeHandler>;
        recovery.set_resume_handler(handler);

        let shutdown = CancellationToken::new();
        spawn_tier_pump(
            Arc::downgrade(&engine),
            quality.subscribe(),
            shutdown.child_token(),
        );

        debug!("session created");
        Self {
            engine,
            quality,
            recovery,
            config,
            shutdown,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<TransferEngine> {
        &self.engine
    }

    pub fn quality(&self) -> &QualityMonitor {
        &self.quality
    }

    pub fn recovery(&self) -> &RecoveryController {
        &self.recovery
    }

    /// Starts sending `file` to `peer_id`; returns the transfer id.
    pub async fn send_file(
        &self,
        peer_id: &str,
        file: OutgoingFile,
        checksum: &str,
    ) -> Result<String, TransferError> {
        self.engine.send_file(peer_id, file, checksum).await
    }

    pub fn pause_transfer(&self, transfer_id: &str) -> bool {
        self.engine.pause_transfer(transfer_id)
    }

    pub fn resume_transfer(&self, transfer_id: &str) -> bool {
        self.engine.resume_transfer(transfer_id)
    }

    pub fn cancel_transfer(&self, transfer_id: &str) -> bool {
        self.engine.cancel_transfer(transfer_id)
    }

    pub fn transfers(&self) -> Vec<TransferInfo> {
        self.engine.transfers()
    }

    /// Feeds one inbound frame from `peer_id`.
    ///
    /// Frames of other message types and malformed frames are dropped.
    pub fn handle_incoming(&self, peer_id: &str, frame: &[u8]) {
        match WireMessage::decode(frame) {
            Ok(Some(WireMessage::File(message))) => {
                trace!(
                    peer = %peer_id,
                    transfer = %message.transfer_id(),
                    action = message.action(),
                    "file message received"
                );
                self.engine.handle_message(peer_id, message);
            }
            Ok(None) => trace!(peer = %peer_id, "ignoring non-file frame"),
            Err(e) => warn!(peer = %peer_id, error = %e, "dropping malformed frame"),
        }
    }

    /// Reacts to a link-state change reported by the transport.
    pub fn handle_link_state(&self, peer_id: &str, state: LinkState) {
        debug!(peer = %peer_id, ?state, "link state changed");
        self.recovery.handle_link_state(peer_id, state);
        match state {
            LinkState::Connected => self.quality.start_monitoring(peer_id),
            LinkState::Disconnected | LinkState::Failed => self.quality.stop_monitoring(peer_id),
            LinkState::Checking => {}
        }
    }

    pub fn subscribe_transfers(&self) -> Subscription<TransferEvent> {
        self.engine.subscribe()
    }

    pub fn subscribe_quality(&self) -> Subscription<QualityEvent> {
        self.quality.subscribe()
    }

    pub fn subscribe_recovery(&self) -> Subscription<RecoveryEvent> {
        self.recovery.subscribe()
    }

    /// Cancels every task and timer the session owns.
    pub fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        self.quality.stop_all();
        self.recovery.shutdown();
        self.engine.shutdown();
        info!("session shut down");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Forwards tier changes into the engine's pacing.
fn spawn_tier_pump(
    engine: Weak<TransferEngine>,
    mut updates: Subscription<QualityEvent>,
    token: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = token.cancelled() => break,
                event = updates.recv() => event,
            };
            match event {
                Some(QualityEvent::Update { peer_id, tier, .. }) => {
                    let Some(engine) = engine.upgrade() else {
                        break;
                    };
                    engine.set_peer_tier(&peer_id, tier);
                }
                Some(QualityEvent::Warning { .. }) => {}
                None => break,
            }
        }
        trace!("tier pump stopped");
    });
}
