//! Watch-mode subscriptions: one task per watched address plus one for chain tips.
//!
//! A watcher re-subscribes whenever its notification stream ends (the server was evicted or the
//! connection dropped). The wait before re-subscribing starts at the configured delay and doubles
//! on each failed subscribe, up to the configured maximum.

use crate::electrum::HeaderNotification;
use crate::pool::ElectrumProvider;
use crate::wallet::WalletSyncError;
use crate::wallet::account::AccountState;
use crate::wallet::sync::events::{EventDispatcher, SyncEvent};
use crate::wallet::sync::retry::ElectrumFetcher;
use crate::wallet::sync::transaction_processor::TransactionProcessor;
use crate::wallet::types::WatchedAddress;

use backoff::ExponentialBackoff;
use backoff::ExponentialBackoffBuilder;
use backoff::backoff::Backoff;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Delay bounds for re-subscribing after a stream ended or a subscribe failed.
#[derive(Debug, Clone, Copy)]
pub struct ResubscribePolicy {
	pub delay: Duration,
	pub max_delay: Duration,
}

impl ResubscribePolicy {
	fn backoff(&self) -> ExponentialBackoff {
		ExponentialBackoffBuilder::new()
			.with_initial_interval(self.delay)
			.with_multiplier(2.0)
			.with_randomization_factor(0.0)
			.with_max_interval(self.max_delay.max(self.delay))
			.with_max_elapsed_time(None)
			.build()
	}
}

/// Follows one address: every status change re-fetches its unspent outputs and reconciles them.
pub struct AddressWatcher {
	address: WatchedAddress,
	account: Arc<Mutex<AccountState>>,
	account_index: u32,
	provider: Arc<dyn ElectrumProvider>,
	fetcher: ElectrumFetcher,
	processor: TransactionProcessor,
	dispatcher: Arc<EventDispatcher>,
	policy: ResubscribePolicy,
}

impl AddressWatcher {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		address: WatchedAddress,
		account: Arc<Mutex<AccountState>>,
		account_index: u32,
		provider: Arc<dyn ElectrumProvider>,
		fetcher: ElectrumFetcher,
		processor: TransactionProcessor,
		dispatcher: Arc<EventDispatcher>,
		policy: ResubscribePolicy,
	) -> Self {
		Self {
			address,
			account,
			account_index,
			provider,
			fetcher,
			processor,
			dispatcher,
			policy,
		}
	}

	/// Runs until the fetcher's cancel token fires.
	pub async fn run(self) {
		let cancel = self.fetcher.cancel_token().clone();
		let mut backoff = self.policy.backoff();

		while !cancel.is_cancelled() {
			let subscribed = tokio::select! {
				_ = cancel.cancelled() => return,
				subscribed = self.provider.subscribe_script_hash(&self.address.script_hash) => subscribed,
			};

			let delay = match subscribed {
				Ok((status, mut notifications)) => {
					debug!(
						address = %self.address.address,
						?status,
						"Subscribed to address"
					);
					backoff.reset();
					loop {
						let notification = tokio::select! {
							_ = cancel.cancelled() => return,
							notification = notifications.recv() => notification,
						};
						let Some(status) = notification else {
							break;
						};
						match self.on_status(status_string(&status)).await {
							Ok(()) => {}
							Err(WalletSyncError::Cancelled) => return,
							Err(e) => warn!(
								address = %self.address.address,
								"Failed to process address notification: {}",
								e
							),
						}
					}
					let delay = backoff.next_backoff().unwrap_or(self.policy.max_delay);
					info!(
						address = %self.address.address,
						"Notification stream ended; re-subscribing in {:?}",
						delay
					);
					delay
				}
				Err(e) => {
					let delay = backoff.next_backoff().unwrap_or(self.policy.max_delay);
					warn!(
						address = %self.address.address,
						"Subscribe failed: {}; retrying in {:?}",
						e,
						delay
					);
					delay
				}
			};

			tokio::select! {
				_ = tokio::time::sleep(delay) => {}
				_ = cancel.cancelled() => return,
			}
		}
	}

	async fn on_status(&self, status: Option<String>) -> Result<(), WalletSyncError> {
		self.dispatcher
			.dispatch(&SyncEvent::WatchAddressNotified {
				account: self.account_index,
				address: self.address.clone(),
				status,
			})
			.await;

		let unspent = self.fetcher.unspent(&self.address.script_hash).await?;
		let mut seen = HashSet::new();
		let mut events = Vec::new();
		{
			let mut account = self.account.lock().await;
			for item in unspent {
				if !seen.insert(item.tx_hash.clone()) {
					continue;
				}
				let outcome = self
					.processor
					.apply(&mut account, &item.tx_hash, item.height, &self.fetcher)
					.await?;
				events.extend(SyncEvent::from_reconciled(self.account_index, outcome));
			}
		}

		for event in &events {
			self.dispatcher.dispatch(event).await;
		}
		Ok(())
	}
}

/// Fires `NewHeaderNotified` for the current tip and every new one.
pub struct HeaderWatcher {
	provider: Arc<dyn ElectrumProvider>,
	dispatcher: Arc<EventDispatcher>,
	policy: ResubscribePolicy,
}

impl HeaderWatcher {
	pub fn new(
		provider: Arc<dyn ElectrumProvider>,
		dispatcher: Arc<EventDispatcher>,
		policy: ResubscribePolicy,
	) -> Self {
		Self {
			provider,
			dispatcher,
			policy,
		}
	}

	pub async fn run(self, cancel: CancellationToken) {
		let mut backoff = self.policy.backoff();

		while !cancel.is_cancelled() {
			let subscribed = tokio::select! {
				_ = cancel.cancelled() => return,
				subscribed = self.provider.subscribe_headers() => subscribed,
			};

			let delay = match subscribed {
				Ok((tip, mut notifications)) => {
					backoff.reset();
					self.announce(tip).await;
					loop {
						let notification = tokio::select! {
							_ = cancel.cancelled() => return,
							notification = notifications.recv() => notification,
						};
						let Some(value) = notification else {
							break;
						};
						match serde_json::from_value::<HeaderNotification>(value) {
							Ok(header) => self.announce(header).await,
							Err(e) => warn!("Ignoring malformed header notification: {}", e),
						}
					}
					backoff.next_backoff().unwrap_or(self.policy.max_delay)
				}
				Err(e) => {
					let delay = backoff.next_backoff().unwrap_or(self.policy.max_delay);
					warn!("Header subscribe failed: {}; retrying in {:?}", e, delay);
					delay
				}
			};

			tokio::select! {
				_ = tokio::time::sleep(delay) => {}
				_ = cancel.cancelled() => return,
			}
		}
	}

	async fn announce(&self, header: HeaderNotification) {
		self.dispatcher
			.dispatch(&SyncEvent::NewHeaderNotified { header })
			.await;
	}
}

fn status_string(value: &Value) -> Option<String> {
	value.as_str().map(str::to_string)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn resubscribe_delay_doubles_up_to_the_cap() {
		let policy = ResubscribePolicy {
			delay: Duration::from_secs(30),
			max_delay: Duration::from_secs(100),
		};
		let mut backoff = policy.backoff();
		let delays: Vec<_> = (0..4).filter_map(|_| backoff.next_backoff()).collect();
		assert_eq!(
			delays,
			[30, 60, 100, 100].map(Duration::from_secs).to_vec()
		);
		backoff.reset();
		assert_eq!(backoff.next_backoff(), Some(Duration::from_secs(30)));
	}

	#[test]
	fn null_status_means_no_history() {
		assert_eq!(status_string(&Value::Null), None);
		assert_eq!(
			status_string(&Value::String("ab".into())),
			Some("ab".to_string())
		);
	}
}
