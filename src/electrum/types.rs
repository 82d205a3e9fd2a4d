//! Types for the Electrum JSON-RPC protocol: wire envelopes, typed results and errors.

use bitcoin::Script;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Subscription key used for header notifications.
pub const HEADERS_SUBSCRIPTION_KEY: &str = "headers";

/// Outbound JSON-RPC request.
#[derive(Debug, Clone, Serialize)]
pub struct Request {
	pub jsonrpc: &'static str,
	/// Monotonic per transport.
	pub id: u64,
	pub method: String,
	pub params: Vec<Value>,
}

impl Request {
	pub fn new(id: u64, method: impl Into<String>, params: Vec<Value>) -> Self {
		Self {
			jsonrpc: "2.0",
			id,
			method: method.into(),
			params,
		}
	}
}

/// Computes the Electrum script hash: SHA-256 of the scriptPubKey, byte-reversed, hex encoded.
pub fn script_hash(script_pubkey: &Script) -> String {
	let mut digest: [u8; 32] = Sha256::digest(script_pubkey.as_bytes()).into();
	digest.reverse();
	hex::encode(digest)
}

/// Result of `server.version`: `[software, protocol]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(String, String)")]
pub struct ServerVersion {
	/// Server software banner, e.g. `ElectrumX 1.16.0`.
	pub server_software: String,
	/// Negotiated protocol version.
	pub protocol_version: String,
}

impl From<(String, String)> for ServerVersion {
	fn from((server_software, protocol_version): (String, String)) -> Self {
		Self {
			server_software,
			protocol_version,
		}
	}
}

/// One entry of `server.peers.subscribe`: `[ip, hostname, [features...]]`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "(String, String, Vec<String>)")]
pub struct PeerEntry {
	pub ip: String,
	pub host: String,
	/// Feature strings such as `v1.4`, `s50002`, `t50001`, `p10000`.
	pub features: Vec<String>,
}

impl From<(String, String, Vec<String>)> for PeerEntry {
	fn from((ip, host, features): (String, String, Vec<String>)) -> Self {
		Self { ip, host, features }
	}
}

impl PeerEntry {
	/// Default SSL port when a peer advertises a bare `s`.
	pub const DEFAULT_SSL_PORT: u16 = 50002;
	/// Default TCP port when a peer advertises a bare `t`.
	pub const DEFAULT_TCP_PORT: u16 = 50001;

	fn port_feature(&self, prefix: char, default: u16) -> Option<u16> {
		self.features
			.iter()
			.find(|f| f.starts_with(prefix))
			.and_then(|f| match &f[1..] {
				"" => Some(default),
				port => port.parse().ok(),
			})
	}

	pub fn ssl_port(&self) -> Option<u16> {
		self.port_feature('s', Self::DEFAULT_SSL_PORT)
	}

	pub fn tcp_port(&self) -> Option<u16> {
		self.port_feature('t', Self::DEFAULT_TCP_PORT)
	}

	/// Highest protocol version advertised, without the leading `v`.
	pub fn protocol_version(&self) -> Option<String> {
		self.features
			.iter()
			.find(|f| f.starts_with('v'))
			.map(|f| f[1..].to_string())
	}
}

/// Header notification / `blockchain.headers.subscribe` result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderNotification {
	pub height: u64,
	/// Raw 80-byte header, hex encoded.
	pub hex: String,
}

/// Result of `blockchain.block.headers`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeaders {
	pub count: u32,
	/// Concatenated raw headers, hex encoded.
	pub hex: String,
	pub max: u32,
}

/// Result of `blockchain.scripthash.get_balance`, in satoshis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
	pub confirmed: i64,
	pub unconfirmed: i64,
}

/// One entry of `blockchain.scripthash.get_history`.
///
/// Height is `0` for mempool transactions with confirmed inputs and `-1` for mempool
/// transactions with unconfirmed inputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryItem {
	pub tx_hash: String,
	pub height: i64,
	/// Only present for mempool entries.
	#[serde(default)]
	pub fee: Option<u64>,
}

/// One entry of `blockchain.scripthash.listunspent`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnspentItem {
	pub tx_hash: String,
	pub tx_pos: u32,
	pub height: i64,
	pub value: u64,
}

/// Result of `blockchain.transaction.get_merkle`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
	pub block_height: u64,
	pub merkle: Vec<String>,
	pub pos: u32,
}

/// Result of `blockchain.transaction.id_from_pos` with `merkle = true`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxIdWithMerkle {
	pub tx_hash: String,
	pub merkle: Vec<String>,
}

/// Result of `blockchain.transaction.get` with `verbose = true` (bitcoind's decoded form).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerboseTransaction {
	pub txid: String,
	pub hex: String,
	#[serde(default)]
	pub size: Option<u64>,
	#[serde(default)]
	pub vsize: Option<u64>,
	#[serde(default)]
	pub confirmations: Option<u64>,
	#[serde(default)]
	pub blockhash: Option<String>,
	#[serde(default)]
	pub blocktime: Option<u64>,
}

/// One `[fee_rate, vsize]` bucket of `mempool.get_fee_histogram`.
pub type FeeHistogramEntry = (f64, u64);

/// Error types for Electrum transport and protocol operations
#[derive(Debug, thiserror::Error)]
pub enum ElectrumError {
	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),

	#[error("TLS error: {0}")]
	Tls(#[from] native_tls::Error),

	#[error("Connection error: {0}")]
	Connection(String),

	#[error("Request {method} timed out after {seconds}s")]
	Timeout { method: String, seconds: u64 },

	#[error("Transport closed")]
	Closed,

	#[error("Server error {code}: {message}")]
	Protocol { message: String, code: i64 },

	#[error("Malformed response for {target}: {source}; raw: {raw}")]
	MalformedResponse {
		raw: String,
		target: &'static str,
		#[source]
		source: serde_json::Error,
	},

	#[error("Null result for {method}")]
	NullResult { method: String },
}

impl ElectrumError {
	/// Socket, TLS, timeout and teardown failures; everything a different server might not have.
	pub fn is_transport(&self) -> bool {
		matches!(
			self,
			ElectrumError::Io(_)
				| ElectrumError::Tls(_)
				| ElectrumError::Connection(_)
				| ElectrumError::Timeout { .. }
				| ElectrumError::Closed
		)
	}

	/// Builds the protocol error for an `error` member, which servers send either as an object
	/// `{message, code}` or as a bare string.
	pub fn from_error_value(error: &Value) -> Self {
		match error {
			Value::Object(obj) => ElectrumError::Protocol {
				message: obj
					.get("message")
					.and_then(Value::as_str)
					.unwrap_or("unknown server error")
					.to_string(),
				code: obj.get("code").and_then(Value::as_i64).unwrap_or(0),
			},
			Value::String(message) => ElectrumError::Protocol {
				message: message.clone(),
				code: 0,
			},
			other => ElectrumError::Protocol {
				message: other.to_string(),
				code: 0,
			},
		}
	}
}
