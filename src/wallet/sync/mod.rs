//! Wallet Synchronization Module
//!
//! This module provides the logic for keeping a watch-only HD wallet in step with Electrum
//! servers. It is composed of several submodules, each responsible for a specific aspect of the
//! sync process:
//!
//! - `orchestrator`: The entry point. Runs scans for every account, watch mode and broadcast.
//! - `events`: Event types and the observer trait used to report what a sync found.
//! - `scanner`: Gap-limit address discovery for one account.
//! - `transaction_processor`: Parses raw transactions, classifies outputs and resolves fees.
//! - `retry`: Runs network steps with failover and bounded exponential backoff.
//! - `watcher`: Per-address and chain-tip subscriptions that survive server changes.
//! - `progress_tracker`: Counts windows, queries and transactions for the sync summary.

/// Event system for decoupled communication during sync
pub mod events;
/// Main coordinator for the wallet sync process
pub mod orchestrator;
/// Tracks synchronization progress and statistics
pub mod progress_tracker;
/// Failover-aware retries of single network steps
pub mod retry;
/// Gap-limit scan
pub mod scanner;
/// Transaction parsing and classification service
pub mod transaction_processor;
/// Watch-mode subscriptions
pub mod watcher;

pub use events::{
	ChannelEventHandler, EventDispatcher, LoggingEventHandler, SyncEvent, SyncEventHandler,
};
pub use orchestrator::*;
pub use progress_tracker::SyncStats;
pub use retry::RetryPolicy;
