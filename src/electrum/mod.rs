//! Electrum protocol layer
//!
//! Line-delimited JSON-RPC over one persistent stream per server: the multiplexing transport,
//! the typed protocol client on top of it, and the wire types both share.

/// Typed wrappers for the Electrum method set
mod client;
/// Key normalization for wire JSON
pub mod naming;
/// Request multiplexing and subscription routing
mod transport;
/// Protocol types and errors
mod types;

pub use client::{CLIENT_NAME, ElectrumClient, PROTOCOL_VERSION};
pub use transport::{NotificationReceiver, Transport};
pub use types::*;
