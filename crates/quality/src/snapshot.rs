use chrono::{DateTime, Utc};
use tokio::time::Instant;

use peerlink_protocol::{MediaKind, PairState, StatsEntry, StatsReport};

/// One timestamped connection sample, in display units.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStats {
    /// Wall-clock time of the sample.
    pub timestamp: DateTime<Utc>,
    /// Monotonic time of the sample, used for rate calculations.
    pub taken_at: Instant,
    /// Round-trip time of the active candidate pair, in milliseconds.
    pub rtt_ms: f64,
    /// Worst inbound jitter, in milliseconds.
    pub jitter_ms: f64,
    pub packets_lost: u64,
    pub packets_received: u64,
    /// `packets_lost / packets_received` as a percentage.
    pub packet_loss_percent: f64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub frames_dropped: u64,
    /// Receive rate since the previous sample, in bits per second.
    pub bandwidth_bps: f64,
    pub available_outgoing_bitrate: Option<f64>,
    pub available_incoming_bitrate: Option<f64>,
}

impl ConnectionStats {
    /// Folds a raw transport report into a sample.
    ///
    /// Counters from several inbound/outbound streams are summed. Bandwidth
    /// is derived from `previous`; the first sample reports zero.
    pub fn from_report(
        report: &StatsReport,
        previous: Option<&ConnectionStats>,
        taken_at: Instant,
    ) -> Self {
        let mut stats = ConnectionStats {
            timestamp: Utc::now(),
            taken_at,
            rtt_ms: 0.0,
            jitter_ms: 0.0,
            packets_lost: 0,
            packets_received: 0,
            packet_loss_percent: 0.0,
            bytes_sent: 0,
            bytes_received: 0,
            frames_sent: 0,
            frames_received: 0,
            frames_dropped: 0,
            bandwidth_bps: 0.0,
            available_outgoing_bitrate: None,
            available_incoming_bitrate: None,
        };

        for entry in &report.entries {
            match entry {
                StatsEntry::CandidatePair {
                    state: PairState::Succeeded,
                    current_round_trip_time,
                } => {
                    stats.rtt_ms = current_round_trip_time * 1000.0;
                }
                StatsEntry::CandidatePair { .. } => {}
                StatsEntry::InboundRtp {
                    kind,
                    jitter,
                    packets_lost,
                    packets_received,
                    bytes_received,
                    frames_received,
                    frames_dropped,
                } => {
                    stats.jitter_ms = stats.jitter_ms.max(jitter * 1000.0);
                    stats.packets_lost += packets_lost;
                    stats.packets_received += packets_received;
                    stats.bytes_received += bytes_received;
                    if *kind == MediaKind::Video {
                        stats.frames_received += frames_received;
                        stats.frames_dropped += frames_dropped;
                    }
                }
                StatsEntry::OutboundRtp {
                    kind,
                    bytes_sent,
                    frames_sent,
                } => {
                    stats.bytes_sent += bytes_sent;
                    if *kind == MediaKind::Video {
                        stats.frames_sent += frames_sent;
                    }
                }
                StatsEntry::Transport {
                    available_outgoing_bitrate,
                    available_incoming_bitrate,
                } => {
                    stats.available_outgoing_bitrate = *available_outgoing_bitrate;
                    stats.available_incoming_bitrate = *available_incoming_bitrate;
                }
            }
        }

        if stats.packets_received > 0 {
            stats.packet_loss_percent =
                stats.packets_lost as f64 / stats.packets_received as f64 * 100.0;
        }

        if let Some(prev) = previous {
            let elapsed = taken_at.duration_since(prev.taken_at).as_secs_f64();
            if elapsed > 0.0 {
                let delta = stats.bytes_received.saturating_sub(prev.bytes_received);
                stats.bandwidth_bps = delta as f64 * 8.0 / elapsed;
            }
        }

        stats
    }
}
