//! Per-account wallet state: watched addresses, cursor and the transaction set.

use super::types::{Chain, OwnedOutput, SyncCursor, WalletTransaction, WatchedAddress};

use bitcoin::{Script, ScriptBuf};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

/// How a history entry changed the transaction set.
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciled {
	Inserted(WalletTransaction),
	Updated {
		txid: String,
		previous_height: i64,
		height: i64,
	},
	Unchanged,
}

/// State of one account. Lives behind its own async mutex; one writer at a time.
#[derive(Debug, Clone, Serialize)]
pub struct AccountState {
	pub index: u32,
	pub cursor: SyncCursor,
	watched: Vec<WatchedAddress>,
	/// Keyed by txid; a transaction seen from several addresses is stored once.
	transactions: BTreeMap<String, WalletTransaction>,
	#[serde(skip)]
	by_position: HashMap<(Chain, u32), usize>,
	#[serde(skip)]
	by_script: HashMap<ScriptBuf, usize>,
}

impl AccountState {
	pub fn new(index: u32) -> Self {
		Self {
			index,
			cursor: SyncCursor::default(),
			watched: Vec::new(),
			transactions: BTreeMap::new(),
			by_position: HashMap::new(),
			by_script: HashMap::new(),
		}
	}

	/// Track an address; already-tracked positions are left as they are.
	pub fn watch(&mut self, address: WatchedAddress) -> &WatchedAddress {
		let slot = match self.by_position.get(&(address.chain, address.index)) {
			Some(slot) => *slot,
			None => {
				let slot = self.watched.len();
				self.by_position.insert((address.chain, address.index), slot);
				self.by_script.insert(address.script_pubkey.clone(), slot);
				self.watched.push(address);
				slot
			}
		};
		&self.watched[slot]
	}

	pub fn watched(&self, chain: Chain, index: u32) -> Option<&WatchedAddress> {
		self.by_position
			.get(&(chain, index))
			.map(|slot| &self.watched[*slot])
	}

	pub fn watched_addresses(&self) -> impl Iterator<Item = &WatchedAddress> {
		self.watched.iter()
	}

	pub fn watched_count(&self) -> usize {
		self.watched.len()
	}

	pub fn owner_of(&self, script_pubkey: &Script) -> Option<&WatchedAddress> {
		self.by_script
			.get(script_pubkey)
			.map(|slot| &self.watched[*slot])
	}

	pub fn transaction(&self, txid: &str) -> Option<&WalletTransaction> {
		self.transactions.get(txid)
	}

	pub fn transactions(&self) -> impl Iterator<Item = &WalletTransaction> {
		self.transactions.values()
	}

	pub fn transaction_count(&self) -> usize {
		self.transactions.len()
	}

	pub fn known_height(&self, txid: &str) -> Option<i64> {
		self.transactions.get(txid).map(|tx| tx.height)
	}

	/// Apply a height seen in a history entry for a known transaction.
	pub fn update_height(&mut self, txid: &str, height: i64) -> Reconciled {
		match self.transactions.get_mut(txid) {
			Some(tx) if tx.height != height => {
				let previous_height = tx.height;
				tx.height = height;
				Reconciled::Updated {
					txid: txid.to_string(),
					previous_height,
					height,
				}
			}
			_ => Reconciled::Unchanged,
		}
	}

	/// Insert a new transaction; an already-known txid only has its height reconciled.
	pub fn insert_transaction(&mut self, tx: WalletTransaction) -> Reconciled {
		if self.transactions.contains_key(&tx.txid) {
			return self.update_height(&tx.txid, tx.height);
		}
		self.transactions.insert(tx.txid.clone(), tx.clone());
		Reconciled::Inserted(tx)
	}

	/// Replace the owned outputs and our input value of a known transaction, classified against
	/// the current watched set. The height is left alone. Returns whether the record changed.
	pub fn reclassify(&mut self, txid: &str, outputs: Vec<OwnedOutput>, sent: Option<u64>) -> bool {
		let classified_with = self.watched.len();
		let Some(tx) = self.transactions.get_mut(txid) else {
			return false;
		};
		tx.classified_with = classified_with;
		if tx.outputs == outputs && tx.sent == sent {
			return false;
		}
		tx.received = outputs.iter().map(|o| o.value).sum();
		tx.outputs = outputs;
		tx.sent = sent;
		true
	}

	/// Sum of received outputs across confirmed transactions.
	pub fn confirmed_received(&self) -> u64 {
		self.transactions
			.values()
			.filter(|tx| tx.is_confirmed())
			.map(|tx| tx.received)
			.sum()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::testing::test_deriver;
	use crate::wallet::AddressDeriver;
	use chrono::Utc;

	fn wallet_tx(txid: &str, height: i64) -> WalletTransaction {
		WalletTransaction {
			txid: txid.to_string(),
			height,
			raw_hex: String::new(),
			outputs: Vec::new(),
			received: 1_000,
			sent: None,
			fee: None,
			first_seen: Utc::now(),
			classified_with: 0,
		}
	}

	#[test]
	fn height_change_updates_instead_of_duplicating() {
		let mut account = AccountState::new(0);
		assert!(matches!(
			account.insert_transaction(wallet_tx("aa", -1)),
			Reconciled::Inserted(_)
		));
		assert_eq!(
			account.insert_transaction(wallet_tx("aa", 680_000)),
			Reconciled::Updated {
				txid: "aa".to_string(),
				previous_height: -1,
				height: 680_000
			}
		);
		assert_eq!(account.update_height("aa", 680_000), Reconciled::Unchanged);
		assert_eq!(account.transaction_count(), 1);
		assert_eq!(account.known_height("aa"), Some(680_000));
		assert_eq!(account.confirmed_received(), 1_000);
	}

	#[test]
	fn watch_is_idempotent_and_indexed_by_script() {
		let deriver = test_deriver(1);
		let mut account = AccountState::new(0);
		let address = WatchedAddress::new(
			deriver.derive_receive_address(0, 4).unwrap(),
			Chain::External,
			4,
		);
		account.watch(address.clone());
		account.watch(address.clone());

		assert_eq!(account.watched_addresses().count(), 1);
		assert_eq!(account.watched(Chain::External, 4), Some(&address));
		assert!(account.watched(Chain::Internal, 4).is_none());
		assert_eq!(account.watched_count(), 1);
		assert_eq!(
			account.owner_of(&address.script_pubkey).map(|w| w.index),
			Some(4)
		);
	}

	#[test]
	fn reclassify_replaces_outputs_but_not_height() {
		let mut account = AccountState::new(0);
		account.insert_transaction(wallet_tx("aa", 680_000));
		let outputs = vec![
			OwnedOutput {
				vout: 0,
				value: 1_000,
				chain: Chain::External,
				index: 5,
			},
			OwnedOutput {
				vout: 1,
				value: 2_000,
				chain: Chain::External,
				index: 25,
			},
		];

		assert!(account.reclassify("aa", outputs.clone(), None));
		assert!(!account.reclassify("aa", outputs, None));
		assert!(!account.reclassify("bb", Vec::new(), None));

		let tx = account.transaction("aa").unwrap();
		assert_eq!(tx.received, 3_000);
		assert_eq!(tx.outputs.len(), 2);
		assert_eq!(tx.height, 680_000);
	}
}
