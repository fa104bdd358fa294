//! Connection quality monitoring.
//!
//! Samples the transport's statistics per peer, keeps a short history and
//! classifies link health into [`QualityTier`]s. Tier changes are published
//! as [`QualityEvent`]s; the transfer engine turns them into pacing and media
//! adaptation turns them into encoder limits.

pub mod buffer;
pub mod monitor;
pub mod snapshot;
pub mod tier;

pub use buffer::StatsHistory;
pub use monitor::{QualityConfig, QualityEvent, QualityMonitor};
pub use snapshot::ConnectionStats;
pub use tier::{QualityTier, Resolution, TierConfig, classify};
