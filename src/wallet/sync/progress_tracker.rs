//! Progress tracking for wallet synchronization.
//!
//! This module provides the `SyncProgressTracker`, which follows one account scan: how many
//! gap-limit windows were derived, how many addresses were queried on each chain, which indices
//! turned out to be used, and how many transactions were inserted or updated. Its `SyncStats`
//! snapshot is carried by the `SyncFinished` event.

use crate::wallet::types::{Chain, SyncCursor};
use std::time::{Duration, Instant};
use tracing::info;

/// Log a progress line every this many queried addresses.
const LOG_EVERY_ADDRESSES: usize = 200;

/// Service for tracking synchronization progress of one account
#[derive(Debug, Clone)]
pub struct SyncProgressTracker {
    account: u32,
    /// Cursor when the scan started
    start_cursor: SyncCursor,
    windows: usize,
    /// Addresses queried per chain, indexed by `Chain::child_index`
    queried: [usize; 2],
    /// Highest used index seen per chain
    highest_used: [Option<u32>; 2],
    new_transactions: usize,
    updated_transactions: usize,
    started: Instant,
    last_logged_queries: usize,
}

impl SyncProgressTracker {
    /// Create a new progress tracker for an account starting at `start_cursor`.
    pub fn new(account: u32, start_cursor: SyncCursor) -> Self {
        Self {
            account,
            start_cursor,
            windows: 0,
            queried: [0; 2],
            highest_used: [None; 2],
            new_transactions: 0,
            updated_transactions: 0,
            started: Instant::now(),
            last_logged_queries: 0,
        }
    }

    pub fn record_window(&mut self) {
        self.windows += 1;
    }

    pub fn record_query(&mut self, chain: Chain) {
        self.queried[chain.child_index() as usize] += 1;
    }

    pub fn record_used(&mut self, chain: Chain, index: u32) {
        let slot = &mut self.highest_used[chain.child_index() as usize];
        *slot = Some(slot.map_or(index, |highest| highest.max(index)));
    }

    pub fn record_new_transaction(&mut self) {
        self.new_transactions += 1;
    }

    pub fn record_updated_transaction(&mut self) {
        self.updated_transactions += 1;
    }

    pub fn queried(&self, chain: Chain) -> usize {
        self.queried[chain.child_index() as usize]
    }

    pub fn windows(&self) -> usize {
        self.windows
    }

    /// Log progress at regular intervals or when forced
    pub fn log_progress(&mut self, force: bool) {
        let total = self.queried.iter().sum::<usize>();
        if force || total.saturating_sub(self.last_logged_queries) >= LOG_EVERY_ADDRESSES {
            info!(
                account = self.account,
                "Sync progress: {} windows, {} addresses queried, {} new / {} updated transactions",
                self.windows,
                total,
                self.new_transactions,
                self.updated_transactions
            );
            self.last_logged_queries = total;
        }
    }

    /// Get sync statistics, with the cursor the scan ended at
    pub fn stats(&self, end_cursor: SyncCursor) -> SyncStats {
        SyncStats {
            account: self.account,
            start_cursor: self.start_cursor,
            end_cursor,
            windows: self.windows,
            queried_external: self.queried[0],
            queried_internal: self.queried[1],
            highest_used_external: self.highest_used[0],
            highest_used_internal: self.highest_used[1],
            new_transactions: self.new_transactions,
            updated_transactions: self.updated_transactions,
            elapsed: self.started.elapsed(),
        }
    }
}

/// Statistics about one account scan
#[derive(Debug, Clone, PartialEq)]
pub struct SyncStats {
    pub account: u32,
    pub start_cursor: SyncCursor,
    pub end_cursor: SyncCursor,
    pub windows: usize,
    pub queried_external: usize,
    pub queried_internal: usize,
    pub highest_used_external: Option<u32>,
    pub highest_used_internal: Option<u32>,
    pub new_transactions: usize,
    pub updated_transactions: usize,
    pub elapsed: Duration,
}

impl SyncStats {
    /// Get a human-readable summary of the sync statistics
    pub fn summary(&self) -> String {
        format!(
            "Account {} cursor {}/{} -> {}/{}: {} windows, {} receive + {} change addresses, {} new and {} updated transactions in {:.1}s",
            self.account,
            self.start_cursor.external,
            self.start_cursor.internal,
            self.end_cursor.external,
            self.end_cursor.internal,
            self.windows,
            self.queried_external,
            self.queried_internal,
            self.new_transactions,
            self.updated_transactions,
            self.elapsed.as_secs_f64()
        )
    }
}
