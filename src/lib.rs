//! Electrum SPV wallet sync core.
//!
//! - [`electrum`]: line-delimited JSON-RPC transport and typed protocol client.
//! - [`pool`]: server pool with quorum connect and failover, and a single trusted-server variant.
//! - [`wallet`]: gap-limit scanning, watch mode and broadcast over either provider.

pub mod config;
pub mod electrum;
pub mod pool;
pub mod utils;
pub mod wallet;

#[cfg(test)]
mod testing;
