use serde::{Deserialize, Serialize};

/// Coarse link state reported by the peer transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    /// Link is up.
    Connected,
    /// Link dropped; the transport may still recover on its own.
    Disconnected,
    /// Link failed and will not recover without intervention.
    Failed,
    /// Connectivity checks in progress.
    Checking,
}

impl LinkState {
    /// Whether this state means the link is lost.
    pub fn is_lost(self) -> bool {
        matches!(self, LinkState::Disconnected | LinkState::Failed)
    }
}
