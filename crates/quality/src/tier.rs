use serde::{Deserialize, Serialize};

/// Discrete link-health classification, ordered by severity.
///
/// `Excellent < Good < Poor < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    Excellent,
    Good,
    Poor,
    Critical,
}

/// Video resolution cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

/// Media limits applied for a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierConfig {
    /// Bits per second.
    pub max_bitrate: u32,
    pub max_frame_rate: u32,
    pub max_resolution: Resolution,
}

const EXCELLENT: TierConfig = TierConfig {
    max_bitrate: 2_500_000,
    max_frame_rate: 30,
    max_resolution: Resolution { width: 1280, height: 720 },
};

const GOOD: TierConfig = TierConfig {
    max_bitrate: 1_000_000,
    max_frame_rate: 25,
    max_resolution: Resolution { width: 854, height: 480 },
};

const POOR: TierConfig = TierConfig {
    max_bitrate: 500_000,
    max_frame_rate: 20,
    max_resolution: Resolution { width: 640, height: 360 },
};

const CRITICAL: TierConfig = TierConfig {
    max_bitrate: 250_000,
    max_frame_rate: 15,
    max_resolution: Resolution { width: 426, height: 240 },
};

impl QualityTier {
    pub const ALL: [QualityTier; 4] = [
        QualityTier::Excellent,
        QualityTier::Good,
        QualityTier::Poor,
        QualityTier::Critical,
    ];

    /// Media limits for this tier.
    pub fn config(self) -> TierConfig {
        match self {
            QualityTier::Excellent => EXCELLENT,
            QualityTier::Good => GOOD,
            QualityTier::Poor => POOR,
            QualityTier::Critical => CRITICAL,
        }
    }

    /// Fraction of the transfer throughput ceiling allowed on this tier.
    pub fn pacing_multiplier(self) -> f64 {
        match self {
            QualityTier::Excellent => 1.0,
            QualityTier::Good => 0.75,
            QualityTier::Poor => 0.5,
            QualityTier::Critical => 0.25,
        }
    }

    /// Whether this tier warrants a user-facing warning.
    pub fn is_degraded(self) -> bool {
        matches!(self, QualityTier::Poor | QualityTier::Critical)
    }

    /// Human-readable description of the tier.
    pub fn message(self) -> &'static str {
        match self {
            QualityTier::Excellent => "Your connection is excellent",
            QualityTier::Good => "Your connection is stable",
            QualityTier::Poor => "Your connection quality has degraded",
            QualityTier::Critical => "Your connection is unstable",
        }
    }
}

impl std::fmt::Display for QualityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            QualityTier::Excellent => "excellent",
            QualityTier::Good => "good",
            QualityTier::Poor => "poor",
            QualityTier::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// Classifies a link from round-trip time (ms) and packet loss (percent).
///
/// Every threshold is exclusive: 100 ms is already `Good`.
pub fn classify(rtt_ms: f64, loss_percent: f64) -> QualityTier {
    if rtt_ms < 100.0 && loss_percent < 1.0 {
        QualityTier::Excellent
    } else if rtt_ms < 200.0 && loss_percent < 5.0 {
        QualityTier::Good
    } else if rtt_ms < 500.0 && loss_percent < 10.0 {
        QualityTier::Poor
    } else {
        QualityTier::Critical
    }
}
