//! Static per-network server lists.
//!
//! Format: a JSON object mapping domain to `{"s": "<ssl port>", "t": "<tcp port>", "version":
//! "<protocol>", "pruning": "-"}`. Ports may be strings or numbers.

use super::types::{PoolError, ServerInfo};
use bitcoin::Network;
use rand::seq::SliceRandom;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

const MAINNET_SERVERS: &str = include_str!("../../servers/mainnet.json");
const TESTNET_SERVERS: &str = include_str!("../../servers/testnet.json");

#[derive(Deserialize)]
#[serde(untagged)]
enum Port {
	Number(u16),
	Text(String),
}

impl Port {
	fn value(&self) -> Option<u16> {
		match self {
			Port::Number(port) => Some(*port),
			Port::Text(port) => port.parse().ok(),
		}
	}
}

#[derive(Deserialize)]
struct ServerProperties {
	#[serde(default)]
	s: Option<Port>,
	#[serde(default)]
	t: Option<Port>,
	#[serde(default)]
	version: Option<String>,
	#[allow(dead_code)]
	#[serde(default)]
	pruning: Option<String>,
}

/// Parse a server list; servers without an SSL port are dropped.
pub fn parse_server_list(json: &str) -> Result<Vec<ServerInfo>, PoolError> {
	let entries: BTreeMap<String, ServerProperties> =
		serde_json::from_str(json).map_err(|e| PoolError::ServerList(e.to_string()))?;

	Ok(entries
		.into_iter()
		.filter_map(|(domain, props)| {
			Some(ServerInfo {
				domain,
				ssl_port: Some(props.s.as_ref().and_then(Port::value)?),
				tcp_port: props.t.as_ref().and_then(Port::value),
				protocol_version: props.version,
				last_connected: None,
			})
		})
		.collect())
}

/// The embedded list for `network`.
pub fn default_server_list(network: Network) -> Result<Vec<ServerInfo>, PoolError> {
	match network {
		Network::Bitcoin => parse_server_list(MAINNET_SERVERS),
		Network::Testnet => parse_server_list(TESTNET_SERVERS),
		other => Err(PoolError::ServerList(format!(
			"No embedded server list for {other}; configure one"
		))),
	}
}

/// Load a list from disk.
pub async fn load_server_list(path: &Path) -> Result<Vec<ServerInfo>, PoolError> {
	let raw = tokio::fs::read_to_string(path)
		.await
		.map_err(|e| PoolError::ServerList(format!("{}: {e}", path.display())))?;
	parse_server_list(&raw)
}

/// Shuffled copy, so concurrent clients do not all hit the head of the list.
pub fn shuffled(servers: &[ServerInfo]) -> Vec<ServerInfo> {
	let mut servers = servers.to_vec();
	servers.shuffle(&mut rand::rng());
	servers
}
