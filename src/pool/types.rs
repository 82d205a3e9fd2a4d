use crate::electrum::{ElectrumClient, ElectrumError, PeerEntry, ServerVersion};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Address and capabilities of one Electrum server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
	pub domain: String,
	pub ssl_port: Option<u16>,
	pub tcp_port: Option<u16>,
	#[serde(default)]
	pub protocol_version: Option<String>,
	#[serde(default)]
	pub last_connected: Option<DateTime<Utc>>,
}

impl ServerInfo {
	pub fn new(domain: impl Into<String>, ssl_port: u16) -> Self {
		Self {
			domain: domain.into(),
			ssl_port: Some(ssl_port),
			tcp_port: None,
			protocol_version: None,
			last_connected: None,
		}
	}

	/// Identity within the pool: domain plus the port we connect on.
	pub fn id(&self) -> String {
		format!(
			"{}:{}",
			self.domain,
			self.ssl_port.or(self.tcp_port).unwrap_or_default()
		)
	}

	/// Parse `host:port` (port defaults to 50002).
	pub fn parse(address: &str) -> Option<Self> {
		let (domain, port) = match address.rsplit_once(':') {
			Some((domain, port)) => (domain, port.parse().ok()?),
			None => (address, PeerEntry::DEFAULT_SSL_PORT),
		};
		(!domain.is_empty()).then(|| Self::new(domain, port))
	}

	/// Candidate from a `server.peers.subscribe` entry. Peers without an SSL port and onion
	/// hosts are not reachable by this client.
	pub fn from_peer(peer: &PeerEntry) -> Option<Self> {
		let domain = if peer.host.is_empty() {
			&peer.ip
		} else {
			&peer.host
		};
		if domain.is_empty() || domain.ends_with(".onion") {
			return None;
		}
		Some(Self {
			domain: domain.clone(),
			ssl_port: Some(peer.ssl_port()?),
			tcp_port: peer.tcp_port(),
			protocol_version: peer.protocol_version(),
			last_connected: None,
		})
	}
}

/// A connected, handshaken server.
#[derive(Debug)]
pub struct Server {
	pub info: ServerInfo,
	pub version: ServerVersion,
	client: ElectrumClient,
	cancel: CancellationToken,
}

impl Server {
	/// `parent` is the owning pool's shutdown token; the server's own token is a child of it.
	pub fn new(
		mut info: ServerInfo,
		version: ServerVersion,
		client: ElectrumClient,
		parent: &CancellationToken,
	) -> Self {
		info.protocol_version = Some(version.protocol_version.clone());
		info.last_connected = Some(Utc::now());
		Self {
			info,
			version,
			client,
			cancel: parent.child_token(),
		}
	}

	pub fn id(&self) -> String {
		self.info.id()
	}

	pub fn client(&self) -> ElectrumClient {
		self.client.clone()
	}

	/// Fires when the server is evicted on purpose or its owner shuts down.
	pub fn cancel_token(&self) -> &CancellationToken {
		&self.cancel
	}

	/// Cancel the server's token and close its transport.
	pub fn shutdown(&self) {
		self.cancel.cancel();
		self.client.transport().close();
	}
}

/// Current-server transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
	/// No current server → a current server.
	Connected(ServerInfo),
	/// Current server → none.
	Disconnected,
	/// One current server replaced by another.
	CurrentServerChanged {
		previous: ServerInfo,
		current: ServerInfo,
	},
}

/// Error types for server pool operations
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
	#[error("No failover alternative ({connected} server(s) connected)")]
	Exhausted { connected: usize },

	#[error("Not connected to any server")]
	NotConnected,

	#[error("Quorum unmet: {connected}/{quorum} servers connected after {passes} passes")]
	QuorumUnmet {
		connected: usize,
		quorum: usize,
		passes: u32,
	},

	#[error("Server list error: {0}")]
	ServerList(String),

	#[error("Server cache error: {0}")]
	Cache(String),

	#[error("Cancelled")]
	Cancelled,

	#[error("Electrum error: {0}")]
	Electrum(#[from] ElectrumError),
}
