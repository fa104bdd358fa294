//! A PeerLink session: one transfer engine, one quality monitor and one
//! recovery controller sharing a transport.

pub mod config;
mod session;

pub use config::{ConfigError, SessionConfig};
pub use session::Session;

pub use peerlink_protocol::{LinkState, Transport};
pub use peerlink_quality::{QualityEvent, QualityTier};
pub use peerlink_recovery::RecoveryEvent;
pub use peerlink_transfer::{OutgoingFile, TransferError, TransferEvent};
