//! Event system for wallet synchronization.
//!
//! This module defines the sync event types, the observer trait, and the dispatcher used by the
//! scanner, the watchers and the orchestrator. Components emit events; registered handlers log
//! them, forward them to a channel, or apply side effects of their own. Handlers take `&self`, so
//! one dispatcher can be shared by every concurrently running account sync and watcher task.

use crate::electrum::HeaderNotification;
use crate::wallet::WalletSyncError;
use crate::wallet::account::Reconciled;
use crate::wallet::sync::progress_tracker::SyncStats;
use crate::wallet::types::{WalletTransaction, WatchedAddress};
use crate::utils::format_btc_amount;

use tokio::sync::mpsc;
use tracing::{debug, info};

/// Events that occur during wallet synchronization
#[derive(Debug, Clone)]
#[allow(clippy::large_enum_variant)]
pub enum SyncEvent {
    /// A transaction was seen for the first time
    NewTransaction {
        account: u32,
        transaction: WalletTransaction,
    },
    /// A known transaction changed height
    UpdateTransaction {
        account: u32,
        txid: String,
        previous_height: i64,
        height: i64,
    },
    /// An account scan began
    SyncStarted { account: u32 },
    /// An account scan finished
    SyncFinished { account: u32, stats: SyncStats },
    /// Watch mode is up
    WatchStarted { addresses: usize },
    /// A watched address changed status
    WatchAddressNotified {
        account: u32,
        address: WatchedAddress,
        status: Option<String>,
    },
    /// New chain tip
    NewHeaderNotified { header: HeaderNotification },
}

impl SyncEvent {
    /// The event announcing a reconciliation outcome, if it changed anything.
    pub fn from_reconciled(account: u32, outcome: Reconciled) -> Option<Self> {
        match outcome {
            Reconciled::Inserted(transaction) => Some(SyncEvent::NewTransaction {
                account,
                transaction,
            }),
            Reconciled::Updated {
                txid,
                previous_height,
                height,
            } => Some(SyncEvent::UpdateTransaction {
                account,
                txid,
                previous_height,
                height,
            }),
            Reconciled::Unchanged => None,
        }
    }
}

/// Trait for handling sync events.
///
/// Implementors receive all sync events and can perform side effects or state updates.
#[async_trait::async_trait]
pub trait SyncEventHandler: Send + Sync {
    /// Handle a sync event.
    async fn handle(&self, event: &SyncEvent) -> Result<(), WalletSyncError>;

    /// Get the name of this handler for logging and diagnostics.
    fn name(&self) -> &'static str;
}

/// Event dispatcher that manages multiple event handlers.
///
/// Handlers are called in registration order for each event.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: Vec<Box<dyn SyncEventHandler>>,
}

impl EventDispatcher {
    /// Create a new, empty event dispatcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new event handler.
    pub fn register_handler(&mut self, handler: Box<dyn SyncEventHandler>) {
        self.handlers.push(handler);
    }

    /// Dispatch an event to all registered handlers.
    ///
    /// Errors from handlers are logged, but do not stop other handlers from running.
    pub async fn dispatch(&self, event: &SyncEvent) {
        for handler in &self.handlers {
            if let Err(e) = handler.handle(event).await {
                tracing::error!("Handler {} failed to process event: {}", handler.name(), e);
            }
        }
    }
}

/// Logs every event.
pub struct LoggingEventHandler;

#[async_trait::async_trait]
impl SyncEventHandler for LoggingEventHandler {
    async fn handle(&self, event: &SyncEvent) -> Result<(), WalletSyncError> {
        match event {
            SyncEvent::NewTransaction {
                account,
                transaction,
            } => info!(
                account,
                txid = %transaction.txid,
                height = transaction.height,
                "New transaction: received {} BTC{}",
                format_btc_amount(transaction.received),
                transaction
                    .fee
                    .map(|fee| format!(", fee {} sat", fee))
                    .unwrap_or_default()
            ),
            SyncEvent::UpdateTransaction {
                account,
                txid,
                previous_height,
                height,
            } => info!(
                account,
                txid = %txid,
                "Transaction height {} -> {}",
                previous_height,
                height
            ),
            SyncEvent::SyncStarted { account } => info!(account, "Account sync started"),
            SyncEvent::SyncFinished { account, stats } => {
                info!(account, "Account sync finished: {}", stats.summary())
            }
            SyncEvent::WatchStarted { addresses } => {
                info!("Watching {} addresses for changes", addresses)
            }
            SyncEvent::WatchAddressNotified {
                account,
                address,
                status,
            } => debug!(
                account,
                address = %address.address,
                ?status,
                "Address status changed"
            ),
            SyncEvent::NewHeaderNotified { header } => {
                info!(height = header.height, "New block header")
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "LoggingEventHandler"
    }
}

/// Forwards every event into a channel.
pub struct ChannelEventHandler {
    sender: mpsc::UnboundedSender<SyncEvent>,
}

impl ChannelEventHandler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SyncEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait::async_trait]
impl SyncEventHandler for ChannelEventHandler {
    async fn handle(&self, event: &SyncEvent) -> Result<(), WalletSyncError> {
        self.sender.send(event.clone()).map_err(|_| {
            WalletSyncError::IoError(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "event receiver dropped",
            ))
        })
    }

    fn name(&self) -> &'static str {
        "ChannelEventHandler"
    }
}
