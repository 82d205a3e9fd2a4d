use crate::electrum::{ElectrumError, script_hash};
use crate::pool::PoolError;

use bitcoin::{Address, ScriptBuf};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// BIP44 chain of an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Chain {
	/// Receive addresses.
	External,
	/// Change addresses.
	Internal,
}

impl Chain {
	pub const ALL: [Chain; 2] = [Chain::External, Chain::Internal];

	/// Second-to-last derivation path element.
	pub fn child_index(self) -> u32 {
		match self {
			Chain::External => 0,
			Chain::Internal => 1,
		}
	}
}

impl std::fmt::Display for Chain {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(match self {
			Chain::External => "external",
			Chain::Internal => "internal",
		})
	}
}

/// A derived address the wallet tracks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WatchedAddress {
	pub address: Address,
	pub script_pubkey: ScriptBuf,
	/// Electrum script hash of `script_pubkey`.
	pub script_hash: String,
	pub chain: Chain,
	pub index: u32,
}

impl WatchedAddress {
	pub fn new(address: Address, chain: Chain, index: u32) -> Self {
		let script_pubkey = address.script_pubkey();
		Self {
			script_hash: script_hash(&script_pubkey),
			address,
			script_pubkey,
			chain,
			index,
		}
	}
}

/// Scanned frontier per chain: one past the highest used index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncCursor {
	pub external: u32,
	pub internal: u32,
}

impl SyncCursor {
	pub fn get(&self, chain: Chain) -> u32 {
		match chain {
			Chain::External => self.external,
			Chain::Internal => self.internal,
		}
	}

	/// Move the frontier forward; never backwards.
	pub fn advance(&mut self, chain: Chain, frontier: u32) {
		let slot = match chain {
			Chain::External => &mut self.external,
			Chain::Internal => &mut self.internal,
		};
		*slot = (*slot).max(frontier);
	}
}

/// Output of a wallet transaction paying one of our addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OwnedOutput {
	pub vout: u32,
	pub value: u64,
	pub chain: Chain,
	pub index: u32,
}

/// A transaction touching the wallet.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WalletTransaction {
	pub txid: String,
	/// Electrum height: `> 0` confirmed, `0` mempool, `-1` mempool with unconfirmed parents.
	pub height: i64,
	pub raw_hex: String,
	pub outputs: Vec<OwnedOutput>,
	/// Sum of `outputs`.
	pub received: u64,
	/// Value of our inputs; `None` until every input's previous output was resolved.
	pub sent: Option<u64>,
	pub fee: Option<u64>,
	pub first_seen: DateTime<Utc>,
	/// Number of watched addresses when `outputs` were last classified.
	#[serde(skip)]
	pub classified_with: usize,
}

impl WalletTransaction {
	pub fn is_confirmed(&self) -> bool {
		self.height > 0
	}

	/// Received minus sent, when both are known.
	pub fn net(&self) -> Option<i64> {
		self.sent.map(|sent| self.received as i64 - sent as i64)
	}
}

/// Result of a broadcast. RPC success alone is not acceptance: the server's reply has to match
/// the transaction id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastOutcome {
	pub accepted: bool,
	pub txid: String,
	/// Server reply or error text.
	pub message: String,
}

/// Error types for wallet sync
#[allow(clippy::enum_variant_names)]
#[derive(Debug, thiserror::Error)]
pub enum WalletSyncError {
	#[error("Scan step {step} failed: {source}")]
	Scan {
		step: String,
		#[source]
		source: ElectrumError,
	},

	#[error("Pool error: {0}")]
	Pool(#[from] PoolError),

	#[error("Electrum error: {0}")]
	Electrum(#[from] ElectrumError),

	#[error("Derivation error: {0}")]
	Derivation(String),

	#[error("Transaction parse error: {0}")]
	ParseError(String),

	#[error("Checkpoint error: {0}")]
	Checkpoint(String),

	#[error("IO error: {0}")]
	IoError(#[from] std::io::Error),

	#[error("Cancelled")]
	Cancelled,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn cursor_only_moves_forward() {
		let mut cursor = SyncCursor::default();
		cursor.advance(Chain::External, 5);
		cursor.advance(Chain::External, 3);
		cursor.advance(Chain::Internal, 1);
		assert_eq!(cursor, SyncCursor { external: 5, internal: 1 });
		assert_eq!(cursor.get(Chain::Internal), 1);
	}
}
