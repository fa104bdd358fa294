//! Session configuration.
//!
//! Stored as a single JSON file. Every field is optional and durations are in
//! milliseconds:
//!
//! ```json
//! {
//!   "transfer": { "rateLimit": 524288, "retry": { "maxRetries": 5 } },
//!   "quality": { "intervalMs": 1000 },
//!   "recovery": { "maxAttempts": 3 },
//!   "validation": { "maxSize": 10485760 }
//! }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use peerlink_quality::QualityConfig;
use peerlink_recovery::RecoveryConfig;
use peerlink_transfer::{TransferConfig, ValidationRules};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("config file is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Settings for every component of a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub transfer: TransferConfig,
    pub quality: QualityConfig,
    pub recovery: RecoveryConfig,
    pub validation: ValidationRules,
}

impl SessionConfig {
    /// Reads the configuration at `path`. A missing file yields defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        let config = serde_json::from_str(&content)?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Writes the configuration to `path`, creating parent directories.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }
}
