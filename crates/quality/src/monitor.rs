//! Periodic per-peer sampling and tier-change notification.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use peerlink_protocol::{Scoped, Subscription, Transport};

use crate::buffer::StatsHistory;
use crate::snapshot::ConnectionStats;
use crate::tier::{QualityTier, classify};

const EVENT_CAPACITY: usize = 256;

/// Sampling settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QualityConfig {
    /// Time between two samples of the same peer.
    pub interval_ms: u64,
    /// Number of samples kept per peer.
    pub history_len: usize,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            interval_ms: 2_000,
            history_len: 30,
        }
    }
}

impl QualityConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

/// Events published by the [`QualityMonitor`].
#[derive(Debug, Clone)]
pub enum QualityEvent {
    /// The peer's tier changed. `previous` is `None` on the first sample.
    Update {
        peer_id: String,
        tier: QualityTier,
        previous: Option<QualityTier>,
        stats: ConnectionStats,
    },
    /// The peer entered a degraded tier.
    Warning {
        peer_id: String,
        tier: QualityTier,
        message: String,
    },
}

impl Scoped for QualityEvent {
    fn peer_id(&self) -> &str {
        match self {
            QualityEvent::Update { peer_id, .. } | QualityEvent::Warning { peer_id, .. } => peer_id,
        }
    }
}

struct PeerQuality {
    history: StatsHistory,
    tier: Option<QualityTier>,
}

struct MonitorInner {
    transport: Arc<dyn Transport>,
    config: QualityConfig,
    peers: Mutex<HashMap<String, PeerQuality>>,
    tasks: Mutex<HashMap<String, CancellationToken>>,
    events_tx: broadcast::Sender<QualityEvent>,
}

/// Samples link statistics and classifies each monitored peer.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct QualityMonitor {
    inner: Arc<MonitorInner>,
}

impl QualityMonitor {
    pub fn new(transport: Arc<dyn Transport>, config: QualityConfig) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(MonitorInner {
                transport,
                config,
                peers: Mutex::new(HashMap::new()),
                tasks: Mutex::new(HashMap::new()),
                events_tx,
            }),
        }
    }

    fn peers(&self) -> MutexGuard<'_, HashMap<String, PeerQuality>> {
        self.inner.peers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn config(&self) -> &QualityConfig {
        &self.inner.config
    }

    /// Subscribes to every quality event.
    pub fn subscribe(&self) -> Subscription<QualityEvent> {
        Subscription::new(self.inner.events_tx.subscribe())
    }

    /// Starts sampling `peer_id` every interval. A peer that is already
    /// monitored keeps its existing task.
    pub fn start_monitoring(&self, peer_id: &str) {
        let token = {
            let mut tasks = self.tasks();
            if tasks.contains_key(peer_id) {
                trace!(peer = %peer_id, "already monitoring");
                return;
            }
            let token = CancellationToken::new();
            tasks.insert(peer_id.to_string(), token.clone());
            token
        };

        info!(peer = %peer_id, interval_ms = self.inner.config.interval_ms, "quality monitoring started");

        let monitor = self.clone();
        let peer = peer_id.to_string();
        tokio::spawn(async move {
            let period = monitor.inner.config.interval();
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = monitor.sample_now(&peer) => {}
                }
            }
            debug!(peer = %peer, "quality sampling loop stopped");
        });
    }

    /// Stops sampling `peer_id` and forgets its history and tier.
    pub fn stop_monitoring(&self, peer_id: &str) {
        if let Some(token) = self.tasks().remove(peer_id) {
            token.cancel();
            info!(peer = %peer_id, "quality monitoring stopped");
        }
        self.peers().remove(peer_id);
    }

    /// Stops every sampling task.
    pub fn stop_all(&self) {
        let tokens: Vec<CancellationToken> = self.tasks().drain().map(|(_, t)| t).collect();
        for token in tokens {
            token.cancel();
        }
        self.peers().clear();
    }

    /// Whether a sampling task is running for `peer_id`.
    pub fn is_monitoring(&self, peer_id: &str) -> bool {
        self.tasks().contains_key(peer_id)
    }

    /// Takes one sample right away.
    ///
    /// Returns the resulting tier, or `None` when stats could not be read.
    pub async fn sample_now(&self, peer_id: &str) -> Option<QualityTier> {
        let report = match self.inner.transport.stats(peer_id).await {
            Ok(report) => report,
            Err(e) => {
                warn!(peer = %peer_id, error = %e, "failed to read connection stats");
                return None;
            }
        };

        let mut events = Vec::new();
        let tier = {
            let mut peers = self.peers();
            let entry = peers
                .entry(peer_id.to_string())
                .or_insert_with(|| PeerQuality {
                    history: StatsHistory::new(self.inner.config.history_len),
                    tier: None,
                });

            let stats = ConnectionStats::from_report(&report, entry.history.last(), Instant::now());
            let tier = classify(stats.rtt_ms, stats.packet_loss_percent);
            trace!(
                peer = %peer_id,
                rtt_ms = stats.rtt_ms,
                loss = stats.packet_loss_percent,
                %tier,
                "quality sample"
            );
            entry.history.push(stats.clone());

            let previous = entry.tier;
            if previous != Some(tier) {
                entry.tier = Some(tier);
                events.push(QualityEvent::Update {
                    peer_id: peer_id.to_string(),
                    tier,
                    previous,
                    stats,
                });
                if tier.is_degraded() {
                    events.push(QualityEvent::Warning {
                        peer_id: peer_id.to_string(),
                        tier,
                        message: tier.message().to_string(),
                    });
                }
            }
            tier
        };

        for event in events {
            if let QualityEvent::Update { previous, tier, .. } = &event {
                info!(peer = %peer_id, ?previous, %tier, "quality tier changed");
            }
            let _ = self.inner.events_tx.send(event);
        }
        Some(tier)
    }

    /// Last classified tier for `peer_id`.
    pub fn current_tier(&self, peer_id: &str) -> Option<QualityTier> {
        self.peers().get(peer_id).and_then(|p| p.tier)
    }

    /// Retained samples for `peer_id`, oldest first.
    pub fn history(&self, peer_id: &str) -> Vec<ConnectionStats> {
        self.peers()
            .get(peer_id)
            .map(|p| p.history.to_vec())
            .unwrap_or_default()
    }

    /// Mean round-trip time over the retained samples, in milliseconds.
    pub fn average_rtt(&self, peer_id: &str) -> Option<f64> {
        self.peers()
            .get(peer_id)
            .and_then(|p| p.history.average_rtt_ms())
    }
}
