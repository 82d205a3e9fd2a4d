//! Test doubles: an in-process Electrum server speaking the real line protocol over duplex
//! streams, a connector resolving domains to such servers, and wallet fixtures.

use crate::config::PoolConfig;
use crate::electrum::{ElectrumError, HistoryItem, Transport, UnspentItem};
use crate::pool::{FileServerCache, ServerConnector, ServerInfo, ServerPool};
use crate::wallet::{AccountState, WalletCheckpoint, WalletSyncError, XpubAddressDeriver};

use bitcoin::bip32::{Xpriv, Xpub};
use bitcoin::consensus::encode::{deserialize, serialize_hex};
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::Secp256k1;
use bitcoin::transaction::Version;
use bitcoin::{
	Amount, Network, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness,
	absolute::LockTime,
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct Session {
	outbound: mpsc::UnboundedSender<String>,
	tasks: Vec<JoinHandle<()>>,
}

#[derive(Default)]
struct MockState {
	tip_height: u64,
	histories: HashMap<String, Vec<HistoryItem>>,
	unspent: HashMap<String, Vec<UnspentItem>>,
	transactions: HashMap<String, String>,
	peers: Vec<Value>,
	results: HashMap<String, Value>,
	failures: HashMap<String, (i64, String)>,
	silent: HashSet<String>,
	calls: Vec<(String, Vec<Value>)>,
	sessions: Vec<Session>,
}

/// Scriptable Electrum server. Clones share state, so a test keeps a handle while sessions run.
#[derive(Clone, Default)]
pub struct MockElectrum {
	state: Arc<Mutex<MockState>>,
}

impl MockElectrum {
	pub fn new() -> Self {
		let mock = Self::default();
		mock.state.lock().tip_height = 800_000;
		mock
	}

	/// Open a session; returns the client end of the stream.
	pub fn connect(&self) -> DuplexStream {
		let (client, server) = tokio::io::duplex(1 << 20);
		let (read_half, mut write_half) = tokio::io::split(server);
		let (outbound, mut queue) = mpsc::unbounded_channel::<String>();

		let writer = tokio::spawn(async move {
			while let Some(line) = queue.recv().await {
				if write_half.write_all(line.as_bytes()).await.is_err()
					|| write_half.write_all(b"\n").await.is_err()
				{
					break;
				}
			}
		});

		let mock = self.clone();
		let replies = outbound.clone();
		let reader = tokio::spawn(async move {
			let mut lines = BufReader::new(read_half).lines();
			while let Ok(Some(line)) = lines.next_line().await {
				let Ok(request) = serde_json::from_str::<Value>(&line) else {
					continue;
				};
				let id = request["id"].clone();
				let method = request["method"].as_str().unwrap_or_default().to_string();
				let params = request["params"].as_array().cloned().unwrap_or_default();
				let reply = match mock.handle(&method, &params) {
					None => continue,
					Some(Ok(result)) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
					Some(Err((code, message))) => json!({
						"jsonrpc": "2.0",
						"id": id,
						"error": {"code": code, "message": message}
					}),
				};
				if replies.send(reply.to_string()).is_err() {
					break;
				}
			}
		});

		self.state.lock().sessions.push(Session {
			outbound,
			tasks: vec![reader, writer],
		});
		client
	}

	pub fn transport(&self) -> Transport {
		Transport::spawn(self.connect(), "mock:50002", Some(Duration::from_secs(5)))
	}

	/// Kill every open session; clients observe EOF.
	pub fn disconnect_all(&self) {
		let sessions = std::mem::take(&mut self.state.lock().sessions);
		for session in sessions {
			for task in session.tasks {
				task.abort();
			}
		}
	}

	/// Push a notification to every open session.
	pub fn notify(&self, method: &str, params: Vec<Value>) {
		let line = json!({"jsonrpc": "2.0", "method": method, "params": params}).to_string();
		for session in &self.state.lock().sessions {
			let _ = session.outbound.send(line.clone());
		}
	}

	pub fn set_history(&self, script_hash: &str, history: Vec<HistoryItem>) {
		self.state
			.lock()
			.histories
			.insert(script_hash.to_string(), history);
	}

	pub fn set_unspent(&self, script_hash: &str, unspent: Vec<UnspentItem>) {
		self.state
			.lock()
			.unspent
			.insert(script_hash.to_string(), unspent);
	}

	/// Serve `tx` from `blockchain.transaction.get`; returns its txid.
	pub fn add_transaction(&self, tx: &Transaction) -> String {
		let txid = tx.compute_txid().to_string();
		self.state
			.lock()
			.transactions
			.insert(txid.clone(), serialize_hex(tx));
		txid
	}

	pub fn set_peers(&self, peers: Vec<Value>) {
		self.state.lock().peers = peers;
	}

	/// Answer `method` with a fixed result.
	pub fn set_result(&self, method: &str, result: Value) {
		self.state.lock().results.insert(method.to_string(), result);
	}

	/// Answer `method` with an error.
	pub fn fail_method(&self, method: &str, code: i64, message: &str) {
		self.state
			.lock()
			.failures
			.insert(method.to_string(), (code, message.to_string()));
	}

	pub fn clear_failure(&self, method: &str) {
		self.state.lock().failures.remove(method);
	}

	/// Never answer `method`.
	pub fn silence(&self, method: &str) {
		self.state.lock().silent.insert(method.to_string());
	}

	pub fn calls(&self) -> Vec<(String, Vec<Value>)> {
		self.state.lock().calls.clone()
	}

	pub fn call_count(&self, method: &str) -> usize {
		self.state
			.lock()
			.calls
			.iter()
			.filter(|(m, _)| m == method)
			.count()
	}

	/// First-parameter strings of every call to `method`.
	pub fn call_params(&self, method: &str) -> Vec<String> {
		self.state
			.lock()
			.calls
			.iter()
			.filter(|(m, _)| m == method)
			.filter_map(|(_, params)| params.first().and_then(Value::as_str).map(str::to_string))
			.collect()
	}

	fn handle(&self, method: &str, params: &[Value]) -> Option<Result<Value, (i64, String)>> {
		let mut state = self.state.lock();
		state.calls.push((method.to_string(), params.to_vec()));

		if state.silent.contains(method) {
			return None;
		}
		if let Some((code, message)) = state.failures.get(method) {
			return Some(Err((*code, message.clone())));
		}
		if let Some(result) = state.results.get(method) {
			return Some(Ok(result.clone()));
		}

		let first = params
			.first()
			.and_then(Value::as_str)
			.unwrap_or_default()
			.to_string();

		Some(match method {
			"server.version" => Ok(json!(["MockElectrum 1.0", "1.4"])),
			"server.banner" => Ok(json!("Welcome to MockElectrum")),
			"server.donation_address" => Ok(json!("")),
			"server.ping" => Ok(Value::Null),
			"server.peers.subscribe" => Ok(Value::Array(state.peers.clone())),
			"blockchain.headers.subscribe" => {
				Ok(json!({"height": state.tip_height, "hex": "00".repeat(80)}))
			}
			"blockchain.block.header" => Ok(json!("00".repeat(80))),
			"blockchain.block.headers" => {
				let count = params.get(1).and_then(Value::as_u64).unwrap_or_default();
				Ok(json!({"count": count, "hex": "00".repeat(80 * count as usize), "max": 2016}))
			}
			"blockchain.scripthash.subscribe" => Ok(status(state.histories.get(&first))),
			"blockchain.scripthash.get_history" => Ok(json!(
				state.histories.get(&first).cloned().unwrap_or_default()
			)),
			"blockchain.scripthash.get_mempool" => Ok(json!(
				state
					.histories
					.get(&first)
					.map(|h| h.iter().filter(|i| i.height <= 0).cloned().collect::<Vec<_>>())
					.unwrap_or_default()
			)),
			"blockchain.scripthash.get_balance" => {
				let unspent = state.unspent.get(&first).cloned().unwrap_or_default();
				let (confirmed, unconfirmed): (Vec<_>, Vec<_>) =
					unspent.iter().partition(|u| u.height > 0);
				Ok(json!({
					"confirmed": confirmed.iter().map(|u| u.value).sum::<u64>(),
					"unconfirmed": unconfirmed.iter().map(|u| u.value).sum::<u64>(),
				}))
			}
			"blockchain.scripthash.listunspent" => Ok(json!(
				state.unspent.get(&first).cloned().unwrap_or_default()
			)),
			"blockchain.transaction.get" => match state.transactions.get(&first) {
				Some(hex) if params.get(1).and_then(Value::as_bool) == Some(true) => {
					Ok(json!({"txid": first, "hex": hex}))
				}
				Some(hex) => Ok(json!(hex)),
				None => Err((
					2,
					"daemon error: No such mempool or blockchain transaction".to_string(),
				)),
			},
			"blockchain.transaction.get_merkle" => Ok(json!({
				"block_height": params.get(1).cloned().unwrap_or(Value::Null),
				"merkle": [],
				"pos": 0
			})),
			"blockchain.transaction.id_from_pos" => Ok(json!("00".repeat(32))),
			"blockchain.transaction.broadcast" => match hex::decode(&first)
				.map_err(|e| e.to_string())
				.and_then(|raw| deserialize::<Transaction>(&raw).map_err(|e| e.to_string()))
			{
				Ok(tx) => Ok(json!(tx.compute_txid().to_string())),
				Err(e) => Err((1, format!("TX decode failed: {e}"))),
			},
			"blockchain.estimatefee" => Ok(json!(0.0002)),
			"blockchain.relayfee" => Ok(json!(0.00001)),
			"mempool.get_fee_histogram" => Ok(json!([[12.5, 50000], [5.0, 150000]])),
			_ => Err((-32601, format!("unknown method {method}"))),
		})
	}
}

/// Electrum address status: sha256 over `txid:height:` of the history, or null when empty.
fn status(history: Option<&Vec<HistoryItem>>) -> Value {
	match history {
		Some(items) if !items.is_empty() => {
			let concatenated: String = items
				.iter()
				.map(|i| format!("{}:{}:", i.tx_hash, i.height))
				.collect();
			json!(hex::encode(Sha256::digest(concatenated.as_bytes())))
		}
		_ => Value::Null,
	}
}

/// Connector resolving domains to registered mock servers; anything else is unreachable.
#[derive(Default)]
pub struct MockConnector {
	servers: Mutex<HashMap<String, MockElectrum>>,
	attempted: Mutex<Vec<String>>,
}

impl MockConnector {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn add_server(&self, domain: &str, server: MockElectrum) {
		self.servers.lock().insert(domain.to_string(), server);
	}

	/// Domains in the order connections were attempted.
	pub fn attempted(&self) -> Vec<String> {
		self.attempted.lock().clone()
	}
}

#[async_trait::async_trait]
impl ServerConnector for MockConnector {
	async fn connect(&self, server: &ServerInfo) -> Result<Transport, ElectrumError> {
		self.attempted.lock().push(server.domain.clone());
		let mock = self.servers.lock().get(&server.domain).cloned();
		match mock {
			Some(mock) => Ok(Transport::spawn(
				mock.connect(),
				server.id(),
				Some(Duration::from_secs(5)),
			)),
			None => Err(ElectrumError::Connection(format!(
				"{} unreachable",
				server.domain
			))),
		}
	}
}

/// Pool connected to every given mock server, with a cache in `dir`.
pub async fn connected_pool(servers: &[(&str, &MockElectrum)], dir: &tempfile::TempDir) -> ServerPool {
	let connector = Arc::new(MockConnector::new());
	for (name, mock) in servers {
		connector.add_server(name, (*mock).clone());
	}
	let pool = ServerPool::new(
		PoolConfig {
			quorum: servers.len(),
			discovery: false,
			..PoolConfig::default()
		},
		servers
			.iter()
			.map(|(name, _)| ServerInfo::new(*name, 50002))
			.collect(),
		connector,
		Arc::new(FileServerCache::new(dir.path(), Network::Regtest)),
	);
	pool.connect(&CancellationToken::new()).await.expect("mock pool connects");
	pool
}

/// Checkpoint sink remembering every saved snapshot.
#[derive(Default)]
pub struct RecordingCheckpoint {
	saved: Mutex<Vec<AccountState>>,
}

impl RecordingCheckpoint {
	pub fn saved(&self) -> Vec<AccountState> {
		self.saved.lock().clone()
	}
}

#[async_trait::async_trait]
impl WalletCheckpoint for RecordingCheckpoint {
	async fn save(&self, account: &AccountState) -> Result<(), WalletSyncError> {
		self.saved.lock().push(account.clone());
		Ok(())
	}
}

/// Deterministic regtest account key.
pub fn test_xpub(seed: u8) -> Xpub {
	let secp = Secp256k1::new();
	let master = Xpriv::new_master(Network::Regtest, &[seed; 32]).expect("valid seed");
	Xpub::from_priv(&secp, &master)
}

pub fn test_deriver(accounts: usize) -> XpubAddressDeriver {
	let keys: Vec<String> = (0..accounts)
		.map(|i| test_xpub(i as u8 + 1).to_string())
		.collect();
	XpubAddressDeriver::new(Network::Regtest, &keys).expect("valid xpubs")
}

/// Transaction spending `prev` into `outputs`.
pub fn tx_spending(prev: &[OutPoint], outputs: &[(ScriptBuf, u64)]) -> Transaction {
	Transaction {
		version: Version::TWO,
		lock_time: LockTime::ZERO,
		input: prev
			.iter()
			.map(|previous_output| TxIn {
				previous_output: *previous_output,
				script_sig: ScriptBuf::new(),
				sequence: Sequence::MAX,
				witness: Witness::new(),
			})
			.collect(),
		output: outputs
			.iter()
			.map(|(script_pubkey, value)| TxOut {
				value: Amount::from_sat(*value),
				script_pubkey: script_pubkey.clone(),
			})
			.collect(),
	}
}

/// Transaction funding `outputs` from an outpoint nobody serves.
pub fn sample_funding_tx(outputs: &[(ScriptBuf, u64)]) -> Transaction {
	tx_spending(
		&[OutPoint {
			txid: Txid::all_zeros(),
			vout: 0,
		}],
		outputs,
	)
}

pub fn history(txid: &str, height: i64) -> HistoryItem {
	HistoryItem {
		tx_hash: txid.to_string(),
		height,
		fee: None,
	}
}
