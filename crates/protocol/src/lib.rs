//! Wire protocol and transport boundary shared by every PeerLink component.
//!
//! The peer transport itself (signaling, ICE, data channels) lives outside
//! this workspace. Components only see the [`Transport`] trait for outbound
//! traffic; inbound frames and link-state changes are pushed into the session
//! by whoever owns the real channel.

pub mod events;
pub mod link;
pub mod memory;
pub mod stats;
pub mod transport;
pub mod wire;

pub use events::{Scoped, Subscription};
pub use link::LinkState;
pub use memory::{Inbound, MemoryNetwork, MemoryTransport};
pub use stats::{MediaKind, PairState, StatsEntry, StatsReport};
pub use transport::{Transport, TransportError};
pub use wire::{ChunkPayload, CompletePayload, FileMessage, StartPayload, WireMessage};
