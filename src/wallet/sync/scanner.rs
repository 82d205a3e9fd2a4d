use crate::electrum::HistoryItem;
use crate::wallet::WalletSyncError;
use crate::wallet::account::{AccountState, Reconciled};
use crate::wallet::deriver::AddressDeriver;
use crate::wallet::sync::events::{EventDispatcher, SyncEvent};
use crate::wallet::sync::progress_tracker::{SyncProgressTracker, SyncStats};
use crate::wallet::sync::retry::ElectrumFetcher;
use crate::wallet::sync::transaction_processor::TransactionProcessor;
use crate::wallet::types::{Chain, WatchedAddress};

use futures::future::try_join_all;
use tracing::{debug, info};

/// Gap-limit address discovery for one account.
///
/// Windows of `gap_limit` addresses past the frontier are derived on both chains and their
/// histories fetched concurrently; the scan stops once a full window past the frontier is empty
/// on both chains.
pub struct GapLimitScanner<'a> {
	gap_limit: u32,
	deriver: &'a dyn AddressDeriver,
	fetcher: &'a ElectrumFetcher,
	processor: &'a TransactionProcessor,
	dispatcher: &'a EventDispatcher,
}

impl<'a> GapLimitScanner<'a> {
	pub fn new(
		gap_limit: u32,
		deriver: &'a dyn AddressDeriver,
		fetcher: &'a ElectrumFetcher,
		processor: &'a TransactionProcessor,
		dispatcher: &'a EventDispatcher,
	) -> Self {
		Self {
			gap_limit,
			deriver,
			fetcher,
			processor,
			dispatcher,
		}
	}

	/// Scan the account, reconciling every history entry found on the way.
	pub async fn scan(&self, account: &mut AccountState) -> Result<SyncStats, WalletSyncError> {
		let mut tracker = SyncProgressTracker::new(account.index, account.cursor);
		info!(
			account = account.index,
			"Scanning from cursor {}/{} with gap limit {}",
			account.cursor.external,
			account.cursor.internal,
			self.gap_limit
		);

		self.refresh_known(account, &mut tracker).await?;

		let mut next = Chain::ALL.map(|chain| account.cursor.get(chain));
		loop {
			if self.fetcher.cancel_token().is_cancelled() {
				return Err(WalletSyncError::Cancelled);
			}

			let mut window = Vec::new();
			for chain in Chain::ALL {
				let slot = chain.child_index() as usize;
				let end = account.cursor.get(chain).saturating_add(self.gap_limit);
				for index in next[slot]..end {
					window.push(self.watch(account, chain, index)?);
				}
				next[slot] = next[slot].max(end);
			}
			if window.is_empty() {
				break;
			}

			tracker.record_window();
			debug!(
				account = account.index,
				addresses = window.len(),
				"Fetching gap window histories"
			);
			self.fetch_and_reconcile(account, window, &mut tracker)
				.await?;
			tracker.log_progress(false);
		}

		tracker.log_progress(true);
		Ok(tracker.stats(account.cursor))
	}

	/// One history query per address already derived below the frontier.
	async fn refresh_known(
		&self,
		account: &mut AccountState,
		tracker: &mut SyncProgressTracker,
	) -> Result<(), WalletSyncError> {
		let cursor = account.cursor;
		let known: Vec<WatchedAddress> = account
			.watched_addresses()
			.filter(|w| w.index < cursor.get(w.chain))
			.cloned()
			.collect();
		if known.is_empty() {
			return Ok(());
		}

		debug!(
			account = account.index,
			addresses = known.len(),
			"Refreshing known addresses"
		);
		self.fetch_and_reconcile(account, known, tracker).await
	}

	fn watch(
		&self,
		account: &mut AccountState,
		chain: Chain,
		index: u32,
	) -> Result<WatchedAddress, WalletSyncError> {
		if let Some(known) = account.watched(chain, index) {
			return Ok(known.clone());
		}
		let address = self.deriver.derive_address(account.index, chain, index)?;
		Ok(account
			.watch(WatchedAddress::new(address, chain, index))
			.clone())
	}

	async fn fetch_and_reconcile(
		&self,
		account: &mut AccountState,
		addresses: Vec<WatchedAddress>,
		tracker: &mut SyncProgressTracker,
	) -> Result<(), WalletSyncError> {
		let histories: Vec<Vec<HistoryItem>> = try_join_all(
			addresses
				.iter()
				.map(|address| self.fetcher.history(&address.script_hash)),
		)
		.await?;

		for (address, history) in addresses.iter().zip(&histories) {
			tracker.record_query(address.chain);
			if !history.is_empty() {
				tracker.record_used(address.chain, address.index);
				account
					.cursor
					.advance(address.chain, address.index.saturating_add(1));
			}
		}

		for (address, history) in addresses.iter().zip(histories) {
			for item in history {
				let outcome = self
					.processor
					.apply(account, &item.tx_hash, item.height, self.fetcher)
					.await?;
				match &outcome {
					Reconciled::Inserted(_) => tracker.record_new_transaction(),
					Reconciled::Updated { .. } => tracker.record_updated_transaction(),
					Reconciled::Unchanged => continue,
				}
				debug!(
					address = %address.address,
					txid = %item.tx_hash,
					"Reconciled history entry"
				);
				if let Some(event) = SyncEvent::from_reconciled(account.index, outcome) {
					self.dispatcher.dispatch(&event).await;
				}
			}
		}
		Ok(())
	}
}
