//! Wallet sync orchestrator and integration point for all sync services.
//!
//! This module defines the `WalletSyncOrchestrator`, which coordinates all components involved in
//! keeping a watch-only wallet in step with Electrum servers:
//! - Running a gap-limit scan per account, all accounts concurrently
//! - Passing each finished account snapshot to the checkpoint sink
//! - Spawning one watcher task per derived address plus one for chain tips in watch mode
//! - Broadcasting transactions and checking the server's answer against the txid
//!
//! Each account lives behind its own `tokio::sync::Mutex`, so a scan and the watchers of the
//! same account never write to it at the same time. Events flow through one shared
//! `EventDispatcher`.

use crate::config::SyncConfig;
use crate::pool::ElectrumProvider;
use crate::utils::format_btc_amount;
use crate::wallet::account::AccountState;
use crate::wallet::checkpoint::WalletCheckpoint;
use crate::wallet::deriver::AddressDeriver;
use crate::wallet::sync::{
    events::{EventDispatcher, SyncEvent},
    progress_tracker::SyncStats,
    retry::{ElectrumFetcher, RetryPolicy},
    scanner::GapLimitScanner,
    transaction_processor::TransactionProcessor,
    watcher::{AddressWatcher, HeaderWatcher, ResubscribePolicy},
};
use crate::wallet::types::{BroadcastOutcome, WalletSyncError};

use bitcoin::Transaction;
use bitcoin::consensus::encode::serialize_hex;
use futures::future::try_join_all;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Main wallet sync orchestrator that coordinates all sync components.
///
/// The provider may be a server pool or a single trusted server; the orchestrator only sees the
/// `ElectrumProvider` seam.
pub struct WalletSyncOrchestrator {
    provider: Arc<dyn ElectrumProvider>,
    deriver: Arc<dyn AddressDeriver>,
    checkpoint: Arc<dyn WalletCheckpoint>,
    dispatcher: Arc<EventDispatcher>,
    accounts: Vec<Arc<Mutex<AccountState>>>,
    config: SyncConfig,
}

impl WalletSyncOrchestrator {
    /// Create a new orchestrator.
    ///
    /// # Arguments
    /// * `provider` - Source of Electrum clients, with failover.
    /// * `deriver` - HD derivation for receive and change addresses.
    /// * `checkpoint` - Sink for account snapshots after each scan.
    /// * `dispatcher` - Event handlers to notify.
    /// * `accounts` - Initial account states, typically fresh or restored.
    /// * `config` - Gap limit, fee resolution and retry settings.
    pub fn new(
        provider: Arc<dyn ElectrumProvider>,
        deriver: Arc<dyn AddressDeriver>,
        checkpoint: Arc<dyn WalletCheckpoint>,
        dispatcher: EventDispatcher,
        accounts: Vec<AccountState>,
        config: SyncConfig,
    ) -> Self {
        Self {
            provider,
            deriver,
            checkpoint,
            dispatcher: Arc::new(dispatcher),
            accounts: accounts
                .into_iter()
                .map(|account| Arc::new(Mutex::new(account)))
                .collect(),
            config,
        }
    }

    /// Shared handle to one account's state.
    pub fn account(&self, index: u32) -> Option<Arc<Mutex<AccountState>>> {
        self.accounts.get(index as usize).cloned()
    }

    /// Copies of every account's current state.
    pub async fn snapshot(&self) -> Vec<AccountState> {
        let mut snapshots = Vec::with_capacity(self.accounts.len());
        for account in &self.accounts {
            snapshots.push(account.lock().await.clone());
        }
        snapshots
    }

    /// Scan every account once, concurrently.
    ///
    /// Returns one `SyncStats` per account, in account order.
    pub async fn sync_wallet(&self, cancel: &CancellationToken) -> Result<Vec<SyncStats>, WalletSyncError> {
        info!("Starting wallet synchronization of {} accounts", self.accounts.len());
        self.ensure_connected(cancel).await?;

        let fetcher = self.fetcher(cancel);
        let processor = TransactionProcessor::new(self.config.resolve_fees);
        let scanner = GapLimitScanner::new(
            self.config.gap_limit,
            self.deriver.as_ref(),
            &fetcher,
            &processor,
            &self.dispatcher,
        );

        let stats = try_join_all(self.accounts.iter().map(|account| {
            let scanner = &scanner;
            async move {
                let mut account = account.lock().await;
                self.dispatcher
                    .dispatch(&SyncEvent::SyncStarted {
                        account: account.index,
                    })
                    .await;

                let stats = scanner.scan(&mut account).await?;
                self.checkpoint.save(&account).await?;

                self.dispatcher
                    .dispatch(&SyncEvent::SyncFinished {
                        account: account.index,
                        stats: stats.clone(),
                    })
                    .await;
                Ok::<_, WalletSyncError>(stats)
            }
        }))
        .await?;

        info!(
            "Wallet synchronization completed, {} previous transactions fetched for fees",
            processor.cached_previous()
        );
        Ok(stats)
    }

    /// Follow every derived address and the chain tip until `cancel` fires.
    pub async fn watch_wallet(&self, cancel: &CancellationToken) -> Result<(), WalletSyncError> {
        self.ensure_connected(cancel).await?;

        let fetcher = self.fetcher(cancel);
        let processor = TransactionProcessor::new(self.config.resolve_fees);
        let policy = ResubscribePolicy {
            delay: self.config.resubscribe_delay(),
            max_delay: self.config.max_resubscribe_delay(),
        };

        let mut tasks = JoinSet::new();
        tasks.spawn(
            HeaderWatcher::new(self.provider.clone(), self.dispatcher.clone(), policy)
                .run(cancel.clone()),
        );

        let mut watched = 0;
        for account in &self.accounts {
            let (index, addresses) = {
                let state = account.lock().await;
                (
                    state.index,
                    state.watched_addresses().cloned().collect::<Vec<_>>(),
                )
            };
            for address in addresses {
                watched += 1;
                tasks.spawn(
                    AddressWatcher::new(
                        address,
                        account.clone(),
                        index,
                        self.provider.clone(),
                        fetcher.clone(),
                        processor.clone(),
                        self.dispatcher.clone(),
                        policy,
                    )
                    .run(),
                );
            }
        }

        self.dispatcher
            .dispatch(&SyncEvent::WatchStarted { addresses: watched })
            .await;

        cancel.cancelled().await;
        info!("Stopping {} watch tasks", tasks.len());
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!("Watch task ended abnormally: {}", e);
            }
        }
        Ok(())
    }

    /// Broadcast a signed transaction.
    ///
    /// Accepted only when the server answers with this transaction's id; any other answer, or a
    /// failed call, is reported as a rejection carrying the server's text.
    pub async fn broadcast(&self, tx: &Transaction) -> BroadcastOutcome {
        let txid = tx.compute_txid().to_string();
        let reply = match self.provider.client() {
            Ok(client) => client
                .transaction_broadcast(&serialize_hex(tx))
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        match reply {
            Ok(message) if message.trim() == txid => {
                info!(txid = %txid, "Transaction broadcast accepted");
                BroadcastOutcome {
                    accepted: true,
                    txid,
                    message,
                }
            }
            Ok(message) | Err(message) => {
                warn!(txid = %txid, "Transaction broadcast rejected: {}", message);
                BroadcastOutcome {
                    accepted: false,
                    txid,
                    message,
                }
            }
        }
    }

    /// Confirmed amount received per account, in satoshis.
    pub async fn confirmed_received(&self) -> Vec<u64> {
        let mut totals = Vec::with_capacity(self.accounts.len());
        for account in &self.accounts {
            let account = account.lock().await;
            let total = account.confirmed_received();
            info!(
                account = account.index,
                "Account has {} transactions, {} BTC received in confirmed transactions",
                account.transaction_count(),
                format_btc_amount(total)
            );
            totals.push(total);
        }
        totals
    }

    fn fetcher(&self, cancel: &CancellationToken) -> ElectrumFetcher {
        ElectrumFetcher::new(
            self.provider.clone(),
            RetryPolicy::from_config(&self.config),
            cancel.clone(),
        )
    }

    async fn ensure_connected(&self, cancel: &CancellationToken) -> Result<(), WalletSyncError> {
        if !self.provider.is_connected() {
            self.provider.connect(cancel).await?;
        }
        Ok(())
    }
}
