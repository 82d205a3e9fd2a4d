use super::account::AccountState;
use super::types::WalletSyncError;

use std::path::{Path, PathBuf};
use tracing::info;

/// Sink for account snapshots taken after each scan.
#[async_trait::async_trait]
pub trait WalletCheckpoint: Send + Sync {
	async fn save(&self, account: &AccountState) -> Result<(), WalletSyncError>;
}

/// Writes `account_<index>.json` plus a small metadata file into a data directory.
pub struct FileWalletCheckpoint {
	data_dir: PathBuf,
}

impl FileWalletCheckpoint {
	pub fn new(data_dir: PathBuf) -> Self {
		Self { data_dir }
	}

	fn snapshot_filename(&self, account: u32) -> PathBuf {
		self.data_dir.join(format!("account_{account}.json"))
	}

	fn metadata_filename(&self, account: u32) -> PathBuf {
		self.data_dir.join(format!("account_{account}.meta.json"))
	}
}

/// Write to a sibling temp file, then rename it over `path`.
async fn write_atomically(path: &Path, contents: String, what: &str) -> Result<(), WalletSyncError> {
	let tmp = path.with_extension("json.tmp");
	tokio::fs::write(&tmp, contents)
		.await
		.map_err(|e| WalletSyncError::Checkpoint(format!("Failed to write {what}: {e}")))?;
	tokio::fs::rename(&tmp, path)
		.await
		.map_err(|e| WalletSyncError::Checkpoint(format!("Failed to move {what} into place: {e}")))
}

#[async_trait::async_trait]
impl WalletCheckpoint for FileWalletCheckpoint {
	/// The snapshot lands first; the metadata only ever describes a snapshot already on disk.
	async fn save(&self, account: &AccountState) -> Result<(), WalletSyncError> {
		tokio::fs::create_dir_all(&self.data_dir).await?;

		let snapshot = serde_json::to_string_pretty(account).map_err(|e| {
			WalletSyncError::Checkpoint(format!("Failed to serialize account snapshot: {e}"))
		})?;
		let filename = self.snapshot_filename(account.index);
		write_atomically(&filename, snapshot, "account snapshot").await?;

		let metadata = serde_json::json!({
			"external": account.cursor.external,
			"internal": account.cursor.internal,
			"transactions": account.transaction_count(),
			"timestamp": chrono::Utc::now().to_rfc3339(),
		});
		let metadata = serde_json::to_string_pretty(&metadata).map_err(|e| {
			WalletSyncError::Checkpoint(format!("Failed to serialize checkpoint metadata: {e}"))
		})?;
		write_atomically(
			&self.metadata_filename(account.index),
			metadata,
			"checkpoint metadata",
		)
		.await?;

		info!(
			"Saved account {} checkpoint to {:?} (cursor {}/{})",
			account.index, filename, account.cursor.external, account.cursor.internal
		);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::wallet::{Chain, WatchedAddress};
	use crate::testing::test_deriver;
	use crate::wallet::AddressDeriver;

	#[tokio::test]
	async fn writes_snapshot_and_metadata() {
		let dir = tempfile::tempdir().unwrap();
		let checkpoint = FileWalletCheckpoint::new(dir.path().join("wallet"));

		let mut account = AccountState::new(3);
		account.cursor.advance(Chain::External, 2);
		let deriver = test_deriver(1);
		account.watch(WatchedAddress::new(
			deriver.derive_receive_address(0, 0).unwrap(),
			Chain::External,
			0,
		));
		checkpoint.save(&account).await.unwrap();

		let snapshot: serde_json::Value = serde_json::from_str(
			&tokio::fs::read_to_string(dir.path().join("wallet/account_3.json"))
				.await
				.unwrap(),
		)
		.unwrap();
		assert_eq!(snapshot["index"], 3);
		assert_eq!(snapshot["cursor"]["external"], 2);
		assert_eq!(snapshot["watched"][0]["chain"], "external");

		let metadata: serde_json::Value = serde_json::from_str(
			&tokio::fs::read_to_string(dir.path().join("wallet/account_3.meta.json"))
				.await
				.unwrap(),
		)
		.unwrap();
		assert_eq!(metadata["transactions"], 0);

		let mut names = Vec::new();
		let mut entries = tokio::fs::read_dir(dir.path().join("wallet")).await.unwrap();
		while let Some(entry) = entries.next_entry().await.unwrap() {
			names.push(entry.file_name().to_string_lossy().into_owned());
		}
		names.sort();
		assert_eq!(names, ["account_3.json", "account_3.meta.json"]);
	}

	#[tokio::test]
	async fn failed_snapshot_leaves_no_metadata() {
		let dir = tempfile::tempdir().unwrap();
		let wallet = dir.path().join("wallet");
		// A directory squatting on the snapshot path makes the rename fail.
		tokio::fs::create_dir_all(wallet.join("account_0.json")).await.unwrap();
		let checkpoint = FileWalletCheckpoint::new(wallet.clone());

		assert!(matches!(
			checkpoint.save(&AccountState::new(0)).await,
			Err(WalletSyncError::Checkpoint(_))
		));
		assert!(!wallet.join("account_0.meta.json").exists());
	}
}
