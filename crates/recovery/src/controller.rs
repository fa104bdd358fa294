use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use peerlink_protocol::{LinkState, Scoped, Subscription, Transport};

use crate::config::RecoveryConfig;

const EVENT_CAPACITY: usize = 256;

/// Callbacks into the component that owns the registered transfers.
///
/// Called without any controller lock held.
pub trait ResumeHandler: Send + Sync {
    /// The link to `peer_id` was lost; suspend the listed transfers.
    fn connection_lost(&self, peer_id: &str, transfer_ids: &[String]);

    /// The link is back; continue `transfer_id` from its last checkpoint.
    fn resume_after_recovery(&self, peer_id: &str, transfer_id: &str);

    /// Every reconnect attempt failed; the listed transfers cannot continue.
    fn recovery_failed(&self, peer_id: &str, transfer_ids: &[String]);
}

/// Recovery phase of one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryPhase {
    Stable,
    Recovering,
    Failed,
}

/// Events published by the [`RecoveryController`].
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryEvent {
    Started {
        peer_id: String,
    },
    Attempt {
        peer_id: String,
        attempt: u32,
        max_attempts: u32,
        next_retry_in: Duration,
    },
    Success {
        peer_id: String,
        resumed: Vec<String>,
    },
    Failed {
        peer_id: String,
    },
    Cancelled {
        peer_id: String,
    },
}

impl Scoped for RecoveryEvent {
    fn peer_id(&self) -> &str {
        match self {
            RecoveryEvent::Started { peer_id }
            | RecoveryEvent::Attempt { peer_id, .. }
            | RecoveryEvent::Success { peer_id, .. }
            | RecoveryEvent::Failed { peer_id }
            | RecoveryEvent::Cancelled { peer_id } => peer_id,
        }
    }
}

struct PeerRecovery {
    phase: RecoveryPhase,
    attempts: u32,
    last_attempt: Option<Instant>,
    transfers: BTreeSet<String>,
    retry: Option<CancellationToken>,
}

impl Default for PeerRecovery {
    fn default() -> Self {
        Self {
            phase: RecoveryPhase::Stable,
            attempts: 0,
            last_attempt: None,
            transfers: BTreeSet::new(),
            retry: None,
        }
    }
}

impl PeerRecovery {
    /// Ends the current episode and returns the registered transfer ids.
    fn finish(&mut self, phase: RecoveryPhase) -> Vec<String> {
        if let Some(token) = self.retry.take() {
            token.cancel();
        }
        self.phase = phase;
        self.attempts = 0;
        self.last_attempt = None;
        std::mem::take(&mut self.transfers).into_iter().collect()
    }
}

struct ControllerInner {
    transport: Arc<dyn Transport>,
    config: RecoveryConfig,
    peers: Mutex<HashMap<String, PeerRecovery>>,
    handler: Mutex<Option<Weak<dyn ResumeHandler>>>,
    events_tx: broadcast::Sender<RecoveryEvent>,
    shutdown: CancellationToken,
}

/// Drives reconnect attempts per peer and resumes transfers afterwards.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct RecoveryController {
    inner: Arc<ControllerInner>,
}

impl RecoveryController {
    pub fn new(transport: Arc<dyn Transport>, config: RecoveryConfig) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(ControllerInner {
                transport,
                config,
                peers: Mutex::new(HashMap::new()),
                handler: Mutex::new(None),
                events_tx,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    fn peers(&self) -> MutexGuard<'_, HashMap<String, PeerRecovery>> {
        self.inner.peers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn handler(&self) -> Option<Arc<dyn ResumeHandler>> {
        self.inner
            .handler
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .and_then(Weak::upgrade)
    }

    fn emit(&self, event: RecoveryEvent) {
        let _ = self.inner.events_tx.send(event);
    }

    /// Installs the hook that suspends, resumes and fails transfers.
    pub fn set_resume_handler(&self, handler: Weak<dyn ResumeHandler>) {
        *self.inner.handler.lock().unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.inner.config
    }

    /// Subscribes to every recovery event.
    pub fn subscribe(&self) -> Subscription<RecoveryEvent> {
        Subscription::new(self.inner.events_tx.subscribe())
    }

    /// Marks `transfer_id` for resume if the link to `peer_id` drops.
    pub fn register_transfer(&self, peer_id: &str, transfer_id: &str) {
        self.peers()
            .entry(peer_id.to_string())
            .or_default()
            .transfers
            .insert(transfer_id.to_string());
    }

    pub fn unregister_transfer(&self, peer_id: &str, transfer_id: &str) {
        if let Some(peer) = self.peers().get_mut(peer_id) {
            peer.transfers.remove(transfer_id);
        }
    }

    /// Transfers currently registered for `peer_id`.
    pub fn registered_transfers(&self, peer_id: &str) -> Vec<String> {
        self.peers()
            .get(peer_id)
            .map(|p| p.transfers.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn phase(&self, peer_id: &str) -> RecoveryPhase {
        self.peers()
            .get(peer_id)
            .map_or(RecoveryPhase::Stable, |p| p.phase)
    }

    pub fn is_recovering(&self, peer_id: &str) -> bool {
        self.phase(peer_id) == RecoveryPhase::Recovering
    }

    /// Reconnect attempts made in the current episode.
    pub fn attempts(&self, peer_id: &str) -> u32 {
        self.peers().get(peer_id).map_or(0, |p| p.attempts)
    }

    /// When the latest reconnect attempt of the current episode was made.
    pub fn last_attempt(&self, peer_id: &str) -> Option<Instant> {
        self.peers().get(peer_id).and_then(|p| p.last_attempt)
    }

    /// Number of retry loops still running.
    pub fn active_loops(&self) -> usize {
        self.peers()
            .values()
            .filter(|p| p.retry.as_ref().is_some_and(|t| !t.is_cancelled()))
            .count()
    }

    /// Feeds a link-state change for `peer_id`.
    pub fn handle_link_state(&self, peer_id: &str, state: LinkState) {
        match state {
            LinkState::Disconnected | LinkState::Failed => self.begin_recovery(peer_id, state),
            LinkState::Connected => self.complete_recovery(peer_id),
            LinkState::Checking => trace!(peer = %peer_id, "link checking"),
        }
    }

    fn begin_recovery(&self, peer_id: &str, state: LinkState) {
        let (token, ids) = {
            let mut peers = self.peers();
            let peer = peers.entry(peer_id.to_string()).or_default();
            if peer.phase == RecoveryPhase::Recovering {
                debug!(peer = %peer_id, ?state, "already recovering, ignoring link loss");
                return;
            }
            let token = self.inner.shutdown.child_token();
            peer.phase = RecoveryPhase::Recovering;
            peer.attempts = 0;
            peer.last_attempt = None;
            peer.retry = Some(token.clone());
            (token, peer.transfers.iter().cloned().collect::<Vec<_>>())
        };

        info!(peer = %peer_id, ?state, transfers = ids.len(), "connection lost, starting recovery");
        self.emit(RecoveryEvent::Started {
            peer_id: peer_id.to_string(),
        });
        if let Some(handler) = self.handler() {
            handler.connection_lost(peer_id, &ids);
        }

        tokio::spawn(retry_loop(self.clone(), peer_id.to_string(), token));
    }

    fn complete_recovery(&self, peer_id: &str) {
        let resumed = {
            let mut peers = self.peers();
            match peers.get_mut(peer_id) {
                Some(peer) if peer.phase == RecoveryPhase::Recovering => {
                    peer.finish(RecoveryPhase::Stable)
                }
                _ => {
                    trace!(peer = %peer_id, "link connected");
                    return;
                }
            }
        };

        info!(peer = %peer_id, resumed = resumed.len(), "connection recovered");
        self.emit(RecoveryEvent::Success {
            peer_id: peer_id.to_string(),
            resumed: resumed.clone(),
        });
        if let Some(handler) = self.handler() {
            for id in &resumed {
                handler.resume_after_recovery(peer_id, id);
            }
        }
    }

    /// Ends an episode whose retry budget is exhausted. Ignored when the
    /// episode already ended some other way.
    fn fail_recovery(&self, peer_id: &str, token: &CancellationToken) {
        let failed = {
            let mut peers = self.peers();
            match peers.get_mut(peer_id) {
                Some(peer) if !token.is_cancelled() && peer.phase == RecoveryPhase::Recovering => {
                    peer.finish(RecoveryPhase::Failed)
                }
                _ => return,
            }
        };

        warn!(peer = %peer_id, transfers = failed.len(), "recovery failed, giving up");
        self.emit(RecoveryEvent::Failed {
            peer_id: peer_id.to_string(),
        });
        if let Some(handler) = self.handler() {
            handler.recovery_failed(peer_id, &failed);
        }
    }

    /// Stops the retry loop for `peer_id`. Registered transfers stay
    /// registered and suspended.
    pub fn cancel_recovery(&self, peer_id: &str) {
        {
            let mut peers = self.peers();
            let Some(peer) = peers.get_mut(peer_id) else {
                return;
            };
            if peer.phase != RecoveryPhase::Recovering {
                return;
            }
            if let Some(token) = peer.retry.take() {
                token.cancel();
            }
            peer.phase = RecoveryPhase::Stable;
            peer.attempts = 0;
            peer.last_attempt = None;
        }

        info!(peer = %peer_id, "recovery cancelled");
        self.emit(RecoveryEvent::Cancelled {
            peer_id: peer_id.to_string(),
        });
    }

    /// Cancels every retry loop and forgets all peers.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.peers().clear();
        debug!("recovery controller shut down");
    }

    fn record_attempt(&self, peer_id: &str, attempt: u32, token: &CancellationToken) -> bool {
        let mut peers = self.peers();
        match peers.get_mut(peer_id) {
            Some(peer) if !token.is_cancelled() => {
                peer.attempts = attempt;
                peer.last_attempt = Some(Instant::now());
                true
            }
            _ => false,
        }
    }
}

async fn retry_loop(controller: RecoveryController, peer_id: String, token: CancellationToken) {
    let max_attempts = controller.inner.config.max_attempts;

    for attempt in 1..=max_attempts {
        if !controller.record_attempt(&peer_id, attempt, &token) {
            return;
        }
        let delay = controller.inner.config.delay_for_attempt(attempt);
        info!(
            peer = %peer_id,
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            "reconnect attempt"
        );
        controller.emit(RecoveryEvent::Attempt {
            peer_id: peer_id.clone(),
            attempt,
            max_attempts,
            next_retry_in: delay,
        });

        tokio::select! {
            _ = token.cancelled() => return,
            result = controller.inner.transport.reconnect(&peer_id) => {
                if let Err(e) = result {
                    warn!(peer = %peer_id, attempt, error = %e, "reconnect attempt failed");
                }
            }
        }

        tokio::select! {
            _ = token.cancelled() => {
                debug!(peer = %peer_id, "recovery loop cancelled");
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }

    controller.fail_recovery(&peer_id, &token);
}
