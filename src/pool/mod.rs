//! Server pool
//!
//! Connection management above the Electrum protocol layer: candidate server lists, racing
//! connection passes with peer discovery, the capped set of healthy servers with one current
//! server and failover, the recently-connected cache, and the single trusted-server variant.
//! Both variants sit behind [`ElectrumProvider`].

/// Recently-connected server persistence
pub mod cache;
/// Transport factories
pub mod connector;
/// Pool of servers with quorum and failover
mod manager;
/// Provider abstraction consumed by the sync engine
mod provider;
/// Embedded and on-disk server lists
pub mod server_list;
/// Single trusted server with keepalive
mod trusted;
/// Server records, events and errors
mod types;

pub use cache::{FileServerCache, ServerCache};
pub use connector::{ServerConnector, TlsServerConnector};
pub use manager::ServerPool;
pub use provider::ElectrumProvider;
pub use trusted::TrustedServer;
pub use types::*;
