//! Fetch steps with failover and bounded retry.
//!
//! Every network step of a scan or watch goes through [`ElectrumFetcher::run`]: on failure the
//! provider is told which connection failed, and the same step is retried after an exponential
//! backoff until the elapsed-time budget runs out.

use crate::config::SyncConfig;
use crate::electrum::{ElectrumClient, ElectrumError, HistoryItem, UnspentItem};
use crate::pool::{ElectrumProvider, PoolError};
use crate::wallet::types::WalletSyncError;

use backoff::ExponentialBackoff;
use backoff::ExponentialBackoffBuilder;
use backoff::backoff::Backoff;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Backoff bounds for one retried step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
	pub initial: Duration,
	pub max_interval: Duration,
	/// Total time a step may spend retrying before it fails.
	pub max_elapsed: Duration,
}

impl RetryPolicy {
	pub fn from_config(config: &SyncConfig) -> Self {
		Self {
			initial: Duration::from_millis(config.retry_initial_ms),
			max_interval: Duration::from_secs(config.retry_max_interval_secs),
			max_elapsed: Duration::from_secs(config.retry_max_elapsed_secs),
		}
	}

	fn backoff(&self) -> ExponentialBackoff {
		ExponentialBackoffBuilder::new()
			.with_initial_interval(self.initial)
			.with_max_interval(self.max_interval)
			.with_max_elapsed_time(Some(self.max_elapsed))
			.build()
	}
}

/// Runs Electrum calls against whatever server the provider currently offers.
#[derive(Clone)]
pub struct ElectrumFetcher {
	provider: Arc<dyn ElectrumProvider>,
	policy: RetryPolicy,
	cancel: CancellationToken,
}

impl ElectrumFetcher {
	pub fn new(provider: Arc<dyn ElectrumProvider>, policy: RetryPolicy, cancel: CancellationToken) -> Self {
		Self {
			provider,
			policy,
			cancel,
		}
	}

	pub fn cancel_token(&self) -> &CancellationToken {
		&self.cancel
	}

	/// Run `op` until it succeeds, failing over between attempts.
	///
	/// Fails with [`WalletSyncError::Scan`] naming `step` once the backoff budget is spent, and
	/// with [`WalletSyncError::Cancelled`] as soon as the token fires.
	pub async fn run<T, F, Fut>(&self, step: &str, op: F) -> Result<T, WalletSyncError>
	where
		F: Fn(ElectrumClient) -> Fut,
		Fut: Future<Output = Result<T, ElectrumError>>,
	{
		let mut backoff = self.policy.backoff();
		let mut attempt = 0u32;

		loop {
			if self.cancel.is_cancelled() {
				return Err(WalletSyncError::Cancelled);
			}
			attempt += 1;

			let error = match self.provider.client() {
				Ok(client) => match op(client.clone()).await {
					Ok(value) => return Ok(value),
					Err(error) => {
						warn!(
							step,
							attempt,
							server = client.server_id(),
							"Electrum step failed: {}",
							error
						);
						match self.provider.report_failure(&client).await {
							Ok(()) | Err(PoolError::Exhausted { .. }) => {}
							Err(e) => debug!(step, "Failover did not complete: {}", e),
						}
						error
					}
				},
				Err(e) => {
					warn!(step, attempt, "No server available: {}", e);
					if let Err(e) = self.provider.connect(&self.cancel).await {
						debug!(step, "Reconnect did not complete: {}", e);
					}
					ElectrumError::Connection(e.to_string())
				}
			};

			let Some(delay) = backoff.next_backoff() else {
				return Err(WalletSyncError::Scan {
					step: step.to_string(),
					source: error,
				});
			};
			tokio::select! {
				_ = tokio::time::sleep(delay) => {}
				_ = self.cancel.cancelled() => return Err(WalletSyncError::Cancelled),
			}
		}
	}

	pub async fn history(&self, script_hash: &str) -> Result<Vec<HistoryItem>, WalletSyncError> {
		self.run("get_history", |client| async move {
			client.scripthash_get_history(script_hash).await
		})
		.await
	}

	pub async fn unspent(&self, script_hash: &str) -> Result<Vec<UnspentItem>, WalletSyncError> {
		self.run("listunspent", |client| async move {
			client.scripthash_listunspent(script_hash).await
		})
		.await
	}

	pub async fn raw_transaction(&self, txid: &str) -> Result<String, WalletSyncError> {
		self.run("transaction_get", |client| async move {
			client.transaction_get(txid).await
		})
		.await
	}

	/// Single attempt, no failover. Used where a miss is acceptable.
	pub async fn raw_transaction_once(&self, txid: &str) -> Result<String, WalletSyncError> {
		Ok(self.provider.client()?.transaction_get(txid).await?)
	}
}
