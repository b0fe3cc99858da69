//! Transport-facing capabilities for SLUICE.
//!
//! The fetcher only depends on the request-transmit and peer-disconnect
//! traits defined in this crate; wire encoding lives elsewhere.

pub mod adapter;
pub mod channel;

pub use adapter::{
    DisconnectReason, InMemoryDisconnector, InMemoryTransport, PeerDisconnector,
    RequestTransport, TransmitError, TransmitHealthSnapshot,
};
pub use channel::{ChannelDisconnector, ChannelTransport, OutboundRequest};
