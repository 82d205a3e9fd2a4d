//!
//! Typed Electrum protocol client.
//!
//! Thin wrappers over [`Transport::call`] for the Electrum 1.4 method set. Each wrapper decodes the
//! `result` member into its typed form; a `null` result where a value is required surfaces as
//! [`ElectrumError::NullResult`], a shape mismatch as [`ElectrumError::MalformedResponse`].

use super::transport::{NotificationReceiver, Transport};
use super::types::*;
use crate::utils::btc_per_kb_to_sat_per_vb;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::debug;

/// Client name announced in `server.version`.
pub const CLIENT_NAME: &str = concat!("electrum-spv-sync/", env!("CARGO_PKG_VERSION"));
/// Protocol version negotiated with servers.
pub const PROTOCOL_VERSION: &str = "1.4";

/// Electrum protocol client bound to one transport.
#[derive(Clone, Debug)]
pub struct ElectrumClient {
	transport: Transport,
}

impl ElectrumClient {
	pub fn new(transport: Transport) -> Self {
		Self { transport }
	}

	pub fn transport(&self) -> &Transport {
		&self.transport
	}

	/// Identity of the server behind this client.
	pub fn server_id(&self) -> &str {
		self.transport.label()
	}

	async fn request<T: DeserializeOwned>(
		&self,
		method: &str,
		params: Vec<Value>,
	) -> Result<T, ElectrumError> {
		let value = self.transport.call(method, params).await?;
		decode_result(method, value)
	}

	// server.*

	/// Negotiate the protocol version; the server closes the connection if it cannot comply.
	pub async fn server_version(
		&self,
		client_name: &str,
		protocol_version: &str,
	) -> Result<ServerVersion, ElectrumError> {
		let version: ServerVersion = self
			.request("server.version", vec![json!(client_name), json!(protocol_version)])
			.await?;
		debug!(
			server = %self.server_id(),
			"Negotiated protocol {} with {}",
			version.protocol_version,
			version.server_software
		);
		Ok(version)
	}

	pub async fn server_banner(&self) -> Result<String, ElectrumError> {
		self.request("server.banner", vec![]).await
	}

	pub async fn server_donation_address(&self) -> Result<String, ElectrumError> {
		self.request("server.donation_address", vec![]).await
	}

	/// Keepalive. The result is `null` by definition, so only errors are meaningful.
	pub async fn server_ping(&self) -> Result<(), ElectrumError> {
		self.transport.call("server.ping", vec![]).await.map(|_| ())
	}

	pub async fn server_peers_subscribe(&self) -> Result<Vec<PeerEntry>, ElectrumError> {
		self.request("server.peers.subscribe", vec![]).await
	}

	// blockchain.headers / blockchain.block

	/// Subscribe to new chain tips.
	///
	/// # Returns
	/// The current tip and a receiver yielding one header object per new tip.
	pub async fn headers_subscribe(
		&self,
	) -> Result<(HeaderNotification, NotificationReceiver), ElectrumError> {
		const METHOD: &str = "blockchain.headers.subscribe";
		let (initial, notifications) = self.transport.subscribe(METHOD, vec![]).await?;
		Ok((decode_result(METHOD, initial)?, notifications))
	}

	pub async fn block_header(&self, height: u64) -> Result<String, ElectrumError> {
		self.request("blockchain.block.header", vec![json!(height)])
			.await
	}

	pub async fn block_headers(
		&self,
		start_height: u64,
		count: u32,
	) -> Result<BlockHeaders, ElectrumError> {
		self.request(
			"blockchain.block.headers",
			vec![json!(start_height), json!(count)],
		)
		.await
	}

	// blockchain.scripthash.*

	/// Subscribe to status changes of a script hash.
	///
	/// # Returns
	/// The current status (`None` when the script hash has no history) and a receiver yielding
	/// the new status on every change.
	pub async fn scripthash_subscribe(
		&self,
		script_hash: &str,
	) -> Result<(Option<String>, NotificationReceiver), ElectrumError> {
		const METHOD: &str = "blockchain.scripthash.subscribe";
		let (initial, notifications) = self
			.transport
			.subscribe(METHOD, vec![json!(script_hash)])
			.await?;
		let status = match initial {
			Value::Null => None,
			other => Some(decode_result::<String>(METHOD, other)?),
		};
		Ok((status, notifications))
	}

	pub async fn scripthash_get_balance(&self, script_hash: &str) -> Result<Balance, ElectrumError> {
		self.request("blockchain.scripthash.get_balance", vec![json!(script_hash)])
			.await
	}

	pub async fn scripthash_get_history(
		&self,
		script_hash: &str,
	) -> Result<Vec<HistoryItem>, ElectrumError> {
		self.request("blockchain.scripthash.get_history", vec![json!(script_hash)])
			.await
	}

	pub async fn scripthash_get_mempool(
		&self,
		script_hash: &str,
	) -> Result<Vec<HistoryItem>, ElectrumError> {
		self.request("blockchain.scripthash.get_mempool", vec![json!(script_hash)])
			.await
	}

	pub async fn scripthash_listunspent(
		&self,
		script_hash: &str,
	) -> Result<Vec<UnspentItem>, ElectrumError> {
		self.request("blockchain.scripthash.listunspent", vec![json!(script_hash)])
			.await
	}

	// blockchain.transaction.*

	/// Broadcast a raw transaction.
	///
	/// # Returns
	/// Whatever the server answered: the txid on acceptance, otherwise a rejection message.
	/// Callers compare it against the transaction's own id.
	pub async fn transaction_broadcast(&self, raw_tx: &str) -> Result<String, ElectrumError> {
		let value = self
			.transport
			.call("blockchain.transaction.broadcast", vec![json!(raw_tx)])
			.await?;
		Ok(match value {
			Value::String(reply) => reply,
			other => other.to_string(),
		})
	}

	/// Raw transaction hex.
	pub async fn transaction_get(&self, txid: &str) -> Result<String, ElectrumError> {
		self.request("blockchain.transaction.get", vec![json!(txid), json!(false)])
			.await
	}

	pub async fn transaction_get_verbose(
		&self,
		txid: &str,
	) -> Result<VerboseTransaction, ElectrumError> {
		self.request("blockchain.transaction.get", vec![json!(txid), json!(true)])
			.await
	}

	pub async fn transaction_get_merkle(
		&self,
		txid: &str,
		height: u64,
	) -> Result<MerkleProof, ElectrumError> {
		self.request(
			"blockchain.transaction.get_merkle",
			vec![json!(txid), json!(height)],
		)
		.await
	}

	pub async fn transaction_id_from_pos(
		&self,
		height: u64,
		tx_pos: u32,
	) -> Result<String, ElectrumError> {
		self.request(
			"blockchain.transaction.id_from_pos",
			vec![json!(height), json!(tx_pos), json!(false)],
		)
		.await
	}

	pub async fn transaction_id_from_pos_with_merkle(
		&self,
		height: u64,
		tx_pos: u32,
	) -> Result<TxIdWithMerkle, ElectrumError> {
		self.request(
			"blockchain.transaction.id_from_pos",
			vec![json!(height), json!(tx_pos), json!(true)],
		)
		.await
	}

	// fees

	/// Estimated fee rate in BTC/kB to confirm within `blocks`; `None` when the server has no
	/// estimate (it answers `-1`).
	pub async fn estimate_fee(&self, blocks: u32) -> Result<Option<f64>, ElectrumError> {
		let rate: f64 = self
			.request("blockchain.estimatefee", vec![json!(blocks)])
			.await?;
		Ok((rate >= 0.0).then_some(rate))
	}

	/// [`Self::estimate_fee`] converted to sat/vB.
	pub async fn estimate_fee_rate(&self, blocks: u32) -> Result<Option<f64>, ElectrumError> {
		Ok(self
			.estimate_fee(blocks)
			.await?
			.map(btc_per_kb_to_sat_per_vb))
	}

	/// Minimum relay fee in BTC/kB.
	pub async fn relay_fee(&self) -> Result<f64, ElectrumError> {
		self.request("blockchain.relayfee", vec![]).await
	}

	pub async fn mempool_fee_histogram(&self) -> Result<Vec<FeeHistogramEntry>, ElectrumError> {
		self.request("mempool.get_fee_histogram", vec![]).await
	}
}

/// Decode a call result into `T`.
pub(crate) fn decode_result<T: DeserializeOwned>(
	method: &str,
	value: Value,
) -> Result<T, ElectrumError> {
	if value.is_null() {
		return Err(ElectrumError::NullResult {
			method: method.to_string(),
		});
	}
	T::deserialize(&value).map_err(|source| ElectrumError::MalformedResponse {
		raw: value.to_string(),
		target: std::any::type_name::<T>(),
		source,
	})
}
