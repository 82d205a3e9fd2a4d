//! Runtime configuration.
//!
//! Every section has a `Default` so an absent or partial config file still yields a usable
//! setup; unknown keys are rejected so typos surface at startup.

use bitcoin::Network;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration, loaded from an optional JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
	pub network: Network,
	/// Directory for the server cache and wallet checkpoints.
	pub data_dir: PathBuf,
	/// Server list overriding the embedded defaults for `network`.
	pub server_list: Option<PathBuf>,
	/// Use this single server instead of a pool, e.g. `"electrum.example.org:50002"`.
	pub trusted_server: Option<String>,
	pub tls: TlsConfig,
	pub pool: PoolConfig,
	pub trusted: TrustedServerConfig,
	pub sync: SyncConfig,
	/// Account-level extended public keys, one per account index.
	pub accounts: Vec<String>,
}

impl Default for AppConfig {
	fn default() -> Self {
		Self {
			network: Network::Bitcoin,
			data_dir: PathBuf::from("./data"),
			server_list: None,
			trusted_server: None,
			tls: TlsConfig::default(),
			pool: PoolConfig::default(),
			trusted: TrustedServerConfig::default(),
			sync: SyncConfig::default(),
			accounts: Vec::new(),
		}
	}
}

impl AppConfig {
	/// Read and parse a JSON config file. Malformed JSON is an error, not a fallback.
	pub async fn load(path: &Path) -> Result<Self, ConfigError> {
		let raw = tokio::fs::read_to_string(path)
			.await
			.map_err(|source| ConfigError::Read {
				path: path.to_path_buf(),
				source,
			})?;
		Self::from_json(&raw)
	}

	pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
		serde_json::from_str(raw).map_err(ConfigError::Parse)
	}
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
	#[error("Failed to read config {path}: {source}")]
	Read {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("Invalid config: {0}")]
	Parse(#[from] serde_json::Error),
}

/// Certificate validation toggle for server connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TlsConfig {
	/// Electrum servers commonly present self-signed certificates.
	pub accept_invalid_certs: bool,
}

impl Default for TlsConfig {
	fn default() -> Self {
		Self {
			accept_invalid_certs: true,
		}
	}
}

/// Sizing and timing of the server pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolConfig {
	/// Hard cap on simultaneously connected servers.
	pub max_connected: usize,
	/// Connected servers required before `connect` reports ready.
	pub quorum: usize,
	/// Bound on TCP connect, TLS handshake and `server.version` together.
	pub connect_timeout_secs: u64,
	/// Per-request response timeout; `None` waits indefinitely.
	pub request_timeout_secs: Option<u64>,
	/// Connection passes before `connect` gives up with a quorum error.
	pub max_connect_passes: u32,
	/// Follow `server.peers.subscribe` to find additional servers.
	pub discovery: bool,
}

impl Default for PoolConfig {
	fn default() -> Self {
		Self {
			max_connected: 20,
			quorum: if cfg!(debug_assertions) { 1 } else { 4 },
			connect_timeout_secs: 10,
			request_timeout_secs: Some(30),
			max_connect_passes: 5,
			discovery: true,
		}
	}
}

impl PoolConfig {
	pub fn connect_timeout(&self) -> Duration {
		Duration::from_secs(self.connect_timeout_secs)
	}

	pub fn request_timeout(&self) -> Option<Duration> {
		self.request_timeout_secs.map(Duration::from_secs)
	}
}

/// Keepalive behaviour of the single trusted server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrustedServerConfig {
	pub ping_interval_secs: u64,
	pub reconnect_delay_secs: u64,
}

impl Default for TrustedServerConfig {
	fn default() -> Self {
		Self {
			ping_interval_secs: 450,
			reconnect_delay_secs: 1,
		}
	}
}

impl TrustedServerConfig {
	pub fn ping_interval(&self) -> Duration {
		Duration::from_secs(self.ping_interval_secs)
	}

	pub fn reconnect_delay(&self) -> Duration {
		Duration::from_secs(self.reconnect_delay_secs)
	}
}

/// Configuration for wallet sync and watch
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
	/// Consecutive unused addresses that end a scan.
	pub gap_limit: u32,
	/// Fetch previous transactions to compute sent amounts and fees
	pub resolve_fees: bool,
	/// Wait before re-subscribing an address whose notification stream ended.
	pub resubscribe_delay_secs: u64,
	pub max_resubscribe_delay_secs: u64,
	pub retry_initial_ms: u64,
	pub retry_max_interval_secs: u64,
	/// Elapsed-time budget for retrying one failed step.
	pub retry_max_elapsed_secs: u64,
}

impl Default for SyncConfig {
	fn default() -> Self {
		Self {
			gap_limit: 20,
			resolve_fees: true,
			resubscribe_delay_secs: 30,
			max_resubscribe_delay_secs: 300,
			retry_initial_ms: 250,
			retry_max_interval_secs: 10,
			retry_max_elapsed_secs: 120,
		}
	}
}

impl SyncConfig {
	pub fn resubscribe_delay(&self) -> Duration {
		Duration::from_secs(self.resubscribe_delay_secs)
	}

	pub fn max_resubscribe_delay(&self) -> Duration {
		Duration::from_secs(self.max_resubscribe_delay_secs)
	}
}
