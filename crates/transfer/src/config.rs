use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff for resending a chunk whose send failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryConfig {
    /// Retries per chunk before the transfer fails.
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            backoff_factor: 2.0,
        }
    }
}

impl RetryConfig {
    /// Wait before retry `attempt` (0-based): `base * factor^attempt`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let ms = self.base_delay_ms as f64 * self.backoff_factor.powi(attempt.min(63) as i32);
        Duration::from_millis(ms.round() as u64)
    }
}

/// Sender-side transfer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TransferConfig {
    pub chunk_size: usize,
    /// Sent chunks between two checkpoints.
    pub checkpoint_interval: u32,
    /// Throughput ceiling in bytes per second before the tier multiplier.
    pub rate_limit: u64,
    /// Wait applied when the ceiling is exceeded.
    pub pacing_delay_ms: u64,
    pub retry: RetryConfig,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: crate::CHUNK_SIZE,
            checkpoint_interval: crate::CHECKPOINT_INTERVAL,
            rate_limit: 1024 * 1024,
            pacing_delay_ms: 50,
            retry: RetryConfig::default(),
        }
    }
}

impl TransferConfig {
    pub fn pacing_delay(&self) -> Duration {
        Duration::from_millis(self.pacing_delay_ms)
    }
}
