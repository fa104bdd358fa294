//! Raw statistics report as produced by the peer transport.
//!
//! Values keep the transport's native units (seconds for timings, absolute
//! counters). Conversion into per-sample metrics happens in the quality
//! monitor.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Media kind of an RTP stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

/// ICE candidate pair state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PairState {
    Frozen,
    Waiting,
    InProgress,
    Failed,
    Succeeded,
}

/// One entry of a statistics report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StatsEntry {
    #[serde(rename_all = "camelCase")]
    CandidatePair {
        state: PairState,
        /// Seconds.
        current_round_trip_time: f64,
    },
    #[serde(rename_all = "camelCase")]
    InboundRtp {
        kind: MediaKind,
        /// Seconds.
        jitter: f64,
        packets_lost: u64,
        packets_received: u64,
        bytes_received: u64,
        #[serde(default)]
        frames_received: u64,
        #[serde(default)]
        frames_dropped: u64,
    },
    #[serde(rename_all = "camelCase")]
    OutboundRtp {
        kind: MediaKind,
        bytes_sent: u64,
        #[serde(default)]
        frames_sent: u64,
    },
    #[serde(rename_all = "camelCase")]
    Transport {
        available_outgoing_bitrate: Option<f64>,
        available_incoming_bitrate: Option<f64>,
    },
}

/// A full statistics report for one peer connection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsReport {
    pub entries: Vec<StatsEntry>,
}

impl StatsReport {
    /// Builds a minimal report with a succeeded candidate pair and one
    /// inbound stream. Used by in-memory transports and tests.
    pub fn link_summary(rtt: Duration, packets_lost: u64, packets_received: u64) -> Self {
        Self {
            entries: vec![
                StatsEntry::CandidatePair {
                    state: PairState::Succeeded,
                    current_round_trip_time: rtt.as_secs_f64(),
                },
                StatsEntry::InboundRtp {
                    kind: MediaKind::Video,
                    jitter: 0.0,
                    packets_lost,
                    packets_received,
                    bytes_received: 0,
                    frames_received: 0,
                    frames_dropped: 0,
                },
            ],
        }
    }
}
