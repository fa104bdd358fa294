use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Reconnect budget and backoff for one recovery episode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RecoveryConfig {
    /// Reconnect attempts before the episode fails.
    pub max_attempts: u32,
    /// Wait after the first attempt.
    pub initial_delay_ms: u64,
    /// Multiplier for each subsequent attempt.
    pub backoff_factor: f64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 2_000,
            backoff_factor: 1.5,
        }
    }
}

impl RecoveryConfig {
    /// Confirmation wait after attempt `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let ms = self.initial_delay_ms as f64 * self.backoff_factor.powi(exp);
        Duration::from_millis(ms.round() as u64)
    }
}
