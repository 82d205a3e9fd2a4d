use super::retry::ElectrumFetcher;
use crate::wallet::WalletSyncError;
use crate::wallet::account::{AccountState, Reconciled};
use crate::wallet::types::{OwnedOutput, WalletTransaction};

use bitcoin::consensus::encode::deserialize;
use bitcoin::{Transaction, Txid};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error};

/// Turns history entries into wallet transactions.
///
/// Clones share one cache of previous transactions, so a previous transaction is fetched at most
/// once per sync or watch session.
#[derive(Clone)]
pub struct TransactionProcessor {
	resolve_fees: bool,
	previous: Arc<Mutex<HashMap<Txid, Transaction>>>,
}

impl TransactionProcessor {
	pub fn new(resolve_fees: bool) -> Self {
		Self {
			resolve_fees,
			previous: Arc::new(Mutex::new(HashMap::new())),
		}
	}

	/// Parse raw transaction hex into a bitcoin Transaction
	pub fn parse_transaction(&self, raw_hex: &str) -> Result<Transaction, WalletSyncError> {
		let tx_bytes = hex::decode(raw_hex.trim()).map_err(|e| {
			error!("[PARSE_TRANSACTION] Failed to decode hex: {}", e);
			WalletSyncError::ParseError(format!("Failed to decode hex: {}", e))
		})?;

		deserialize(&tx_bytes).map_err(|e| {
			error!(
				"[PARSE_TRANSACTION] Failed to deserialize transaction: {}",
				e
			);
			WalletSyncError::ParseError(format!("Failed to deserialize transaction: {}", e))
		})
	}

	pub fn cached_previous(&self) -> usize {
		self.previous.lock().len()
	}

	/// Reconcile one history entry against the account.
	///
	/// A known txid has its height compared, and is classified again from its stored raw
	/// transaction if addresses were derived since it was last classified. An unknown one is
	/// fetched, checked against its id, classified against the watched addresses and inserted.
	pub async fn apply(
		&self,
		account: &mut AccountState,
		txid: &str,
		height: i64,
		fetcher: &ElectrumFetcher,
	) -> Result<Reconciled, WalletSyncError> {
		if let Some(known) = account.transaction(txid) {
			if known.classified_with < account.watched_count() {
				self.reclassify(account, txid, fetcher).await?;
			}
			return Ok(account.update_height(txid, height));
		}

		let raw_hex = fetcher.raw_transaction(txid).await?;
		let tx = self.parse_transaction(&raw_hex)?;
		let computed = tx.compute_txid();
		if computed.to_string() != txid {
			return Err(WalletSyncError::ParseError(format!(
				"Server returned transaction {} for {}",
				computed, txid
			)));
		}

		let outputs = owned_outputs(account, &tx);
		let received = outputs.iter().map(|o| o.value).sum();

		let (sent, fee) = if self.resolve_fees {
			self.resolve_inputs(account, &tx, fetcher).await
		} else {
			(None, None)
		};

		debug!(
			txid,
			height,
			owned_outputs = outputs.len(),
			received,
			?fee,
			"Classified transaction"
		);

		Ok(account.insert_transaction(WalletTransaction {
			txid: txid.to_string(),
			height,
			raw_hex: raw_hex.trim().to_string(),
			outputs,
			received,
			sent,
			fee,
			first_seen: Utc::now(),
			classified_with: account.watched_count(),
		}))
	}

	/// Classify a known transaction again. Our input value is only recomputed when it was
	/// resolved before; a failed resolution keeps the earlier value.
	async fn reclassify(
		&self,
		account: &mut AccountState,
		txid: &str,
		fetcher: &ElectrumFetcher,
	) -> Result<(), WalletSyncError> {
		let Some(known) = account.transaction(txid) else {
			return Ok(());
		};
		let previous_sent = known.sent;
		let tx = self.parse_transaction(&known.raw_hex)?;

		let outputs = owned_outputs(account, &tx);
		let sent = match previous_sent {
			Some(_) if self.resolve_fees => self
				.resolve_inputs(account, &tx, fetcher)
				.await
				.0
				.or(previous_sent),
			_ => previous_sent,
		};
		if account.reclassify(txid, outputs, sent) {
			debug!(txid, "Reclassified transaction against newly derived addresses");
		}
		Ok(())
	}

	/// Value of our inputs and the fee, when every previous output could be resolved.
	///
	/// Best effort: each previous transaction gets a single fetch attempt, and a miss leaves both
	/// values unknown rather than failing the scan.
	async fn resolve_inputs(
		&self,
		account: &AccountState,
		tx: &Transaction,
		fetcher: &ElectrumFetcher,
	) -> (Option<u64>, Option<u64>) {
		if tx.is_coinbase() {
			return (Some(0), None);
		}

		let mut sent = 0u64;
		let mut input_total = 0u64;
		for input in &tx.input {
			let outpoint = input.previous_output;
			let Some(previous) = self.previous_transaction(account, &outpoint.txid, fetcher).await
			else {
				return (None, None);
			};
			let Some(spent) = previous.output.get(outpoint.vout as usize) else {
				debug!(%outpoint, "Previous transaction has no such output");
				return (None, None);
			};
			let value = spent.value.to_sat();
			input_total += value;
			if account.owner_of(&spent.script_pubkey).is_some() {
				sent += value;
			}
		}

		let output_total: u64 = tx.output.iter().map(|o| o.value.to_sat()).sum();
		(Some(sent), input_total.checked_sub(output_total))
	}

	async fn previous_transaction(
		&self,
		account: &AccountState,
		txid: &Txid,
		fetcher: &ElectrumFetcher,
	) -> Option<Transaction> {
		if let Some(tx) = self.previous.lock().get(txid) {
			return Some(tx.clone());
		}

		let key = txid.to_string();
		let tx = match account.transaction(&key) {
			Some(known) => self.parse_transaction(&known.raw_hex).ok()?,
			None => match fetcher.raw_transaction_once(&key).await {
				Ok(raw_hex) => self.parse_transaction(&raw_hex).ok()?,
				Err(e) => {
					debug!(txid = %key, "Could not resolve previous transaction: {}", e);
					return None;
				}
			},
		};
		self.previous.lock().insert(*txid, tx.clone());
		Some(tx)
	}
}

fn owned_outputs(account: &AccountState, tx: &Transaction) -> Vec<OwnedOutput> {
	tx.output
		.iter()
		.enumerate()
		.filter_map(|(vout, out)| {
			account.owner_of(&out.script_pubkey).map(|owner| OwnedOutput {
				vout: vout as u32,
				value: out.value.to_sat(),
				chain: owner.chain,
				index: owner.index,
			})
		})
		.collect()
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::SyncConfig;
	use crate::testing::{
		MockElectrum, connected_pool, sample_funding_tx, test_deriver, tx_spending,
	};
	use crate::wallet::sync::retry::RetryPolicy;
	use crate::wallet::types::{Chain, WatchedAddress};
	use crate::wallet::AddressDeriver;
	use bitcoin::{OutPoint, ScriptBuf};
	use tokio_util::sync::CancellationToken;

	fn foreign_script(tag: u8) -> ScriptBuf {
		ScriptBuf::from_bytes(vec![0x6a, 0x01, tag])
	}

	fn account_watching(count: u32) -> AccountState {
		let deriver = test_deriver(1);
		let mut account = AccountState::new(0);
		for chain in Chain::ALL {
			for index in 0..count {
				account.watch(WatchedAddress::new(
					deriver.derive_address(0, chain, index).unwrap(),
					chain,
					index,
				));
			}
		}
		account
	}

	fn fetcher(pool: crate::pool::ServerPool) -> ElectrumFetcher {
		ElectrumFetcher::new(
			Arc::new(pool),
			RetryPolicy::from_config(&SyncConfig::default()),
			CancellationToken::new(),
		)
	}

	#[tokio::test]
	async fn classifies_outputs_and_updates_heights() {
		let dir = tempfile::tempdir().unwrap();
		let mock = MockElectrum::new();
		let mut account = account_watching(2);
		let receive = account.watched(Chain::External, 1).unwrap().script_pubkey.clone();
		let change = account.watched(Chain::Internal, 0).unwrap().script_pubkey.clone();
		let funding = sample_funding_tx(&[
			(receive, 50_000),
			(foreign_script(1), 0),
			(change, 7_000),
		]);
		let txid = mock.add_transaction(&funding);
		let fetcher = fetcher(connected_pool(&[("a", &mock)], &dir).await);
		let processor = TransactionProcessor::new(true);

		let Reconciled::Inserted(tx) = processor.apply(&mut account, &txid, -1, &fetcher).await.unwrap()
		else {
			panic!("expected insert");
		};
		assert_eq!(tx.received, 57_000);
		assert_eq!(tx.outputs.len(), 2);
		assert_eq!((tx.outputs[0].chain, tx.outputs[0].index), (Chain::External, 1));
		assert_eq!((tx.outputs[1].vout, tx.outputs[1].chain), (2, Chain::Internal));
		// The funding outpoint is served by nobody.
		assert_eq!((tx.sent, tx.fee), (None, None));

		assert_eq!(
			processor.apply(&mut account, &txid, 680_000, &fetcher).await.unwrap(),
			Reconciled::Updated {
				txid: txid.clone(),
				previous_height: -1,
				height: 680_000
			}
		);
		assert_eq!(
			processor.apply(&mut account, &txid, 680_000, &fetcher).await.unwrap(),
			Reconciled::Unchanged
		);
		assert_eq!(account.transaction_count(), 1);
		assert_eq!(mock.call_count("blockchain.transaction.get"), 2);
	}

	#[tokio::test]
	async fn known_transaction_picks_up_outputs_of_later_addresses() {
		let dir = tempfile::tempdir().unwrap();
		let mock = MockElectrum::new();
		let deriver = test_deriver(1);
		let mut account = account_watching(1);
		let first = account.watched(Chain::External, 0).unwrap().script_pubkey.clone();
		let later = WatchedAddress::new(deriver.derive_receive_address(0, 3).unwrap(), Chain::External, 3);
		let funding = sample_funding_tx(&[(first, 1_000), (later.script_pubkey.clone(), 2_000)]);
		let txid = mock.add_transaction(&funding);
		let fetcher = fetcher(connected_pool(&[("a", &mock)], &dir).await);
		let processor = TransactionProcessor::new(false);

		processor.apply(&mut account, &txid, 680_000, &fetcher).await.unwrap();
		assert_eq!(account.transaction(&txid).map(|tx| tx.received), Some(1_000));

		account.watch(later);
		assert_eq!(
			processor.apply(&mut account, &txid, 680_000, &fetcher).await.unwrap(),
			Reconciled::Unchanged
		);
		let tx = account.transaction(&txid).unwrap();
		assert_eq!(tx.received, 3_000);
		assert_eq!(
			tx.outputs.iter().map(|o| o.index).collect::<Vec<_>>(),
			vec![0, 3]
		);
		// Classified again from the stored raw transaction.
		assert_eq!(mock.call_count("blockchain.transaction.get"), 1);
	}

	#[tokio::test]
	async fn resolves_fee_from_cached_previous_transactions() {
		let dir = tempfile::tempdir().unwrap();
		let mock = MockElectrum::new();
		let mut account = account_watching(1);
		let ours = account.watched(Chain::External, 0).unwrap().script_pubkey.clone();
		let change = account.watched(Chain::Internal, 0).unwrap().script_pubkey.clone();
		let foreign = foreign_script(9);

		let parent = sample_funding_tx(&[(ours, 100_000), (foreign.clone(), 20_000)]);
		mock.add_transaction(&parent);
		let parent_id = parent.compute_txid();
		let spend = tx_spending(
			&[
				OutPoint { txid: parent_id, vout: 0 },
				OutPoint { txid: parent_id, vout: 1 },
			],
			&[(foreign, 90_000), (change, 29_000)],
		);
		let spend_txid = mock.add_transaction(&spend);
		let fetcher = fetcher(connected_pool(&[("a", &mock)], &dir).await);
		let processor = TransactionProcessor::new(true);

		let Reconciled::Inserted(tx) = processor
			.apply(&mut account, &spend_txid, 0, &fetcher)
			.await
			.unwrap()
		else {
			panic!("expected insert");
		};
		assert_eq!(tx.sent, Some(100_000));
		assert_eq!(tx.fee, Some(1_000));
		assert_eq!(tx.received, 29_000);
		assert_eq!(tx.net(), Some(-71_000));
		assert_eq!(processor.cached_previous(), 1);
		// Spend fetched once, parent fetched once for both inputs.
		assert_eq!(mock.call_params("blockchain.transaction.get").len(), 2);
	}

	#[tokio::test]
	async fn rejects_mismatched_transaction() {
		let dir = tempfile::tempdir().unwrap();
		let mock = MockElectrum::new();
		let mut account = account_watching(1);
		let funding = sample_funding_tx(&[(foreign_script(3), 1)]);
		let real = mock.add_transaction(&funding);
		mock.set_result(
			"blockchain.transaction.get",
			serde_json::json!(bitcoin::consensus::encode::serialize_hex(&funding)),
		);
		let fetcher = fetcher(connected_pool(&[("a", &mock)], &dir).await);
		let other = "11".repeat(32);
		assert_ne!(real, other);

		let result = TransactionProcessor::new(false)
			.apply(&mut account, &other, 1, &fetcher)
			.await;
		assert!(matches!(result, Err(WalletSyncError::ParseError(_))));
		assert_eq!(account.transaction_count(), 0);
	}

	#[test]
	fn parse_rejects_garbage() {
		let processor = TransactionProcessor::new(true);
		assert!(matches!(
			processor.parse_transaction("zz"),
			Err(WalletSyncError::ParseError(_))
		));
		assert!(matches!(
			processor.parse_transaction("0100"),
			Err(WalletSyncError::ParseError(_))
		));
	}
}
