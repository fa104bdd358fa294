//! Connection recovery.
//!
//! Watches link-state changes per peer. A lost link starts a recovery
//! episode: registered transfers are suspended through the [`ResumeHandler`],
//! reconnects are attempted with a bounded backoff, and the transfers are
//! resumed or failed depending on the outcome.

pub mod config;
pub mod controller;

pub use config::RecoveryConfig;
pub use controller::{RecoveryController, RecoveryEvent, RecoveryPhase, ResumeHandler};
