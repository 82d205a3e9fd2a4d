//! Recently-connected server cache, used to warm-start the next connect.

use super::types::{PoolError, ServerInfo};
use bitcoin::Network;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Store for the set of servers the pool is currently connected to.
#[async_trait::async_trait]
pub trait ServerCache: Send + Sync {
	/// Previously saved servers; empty when nothing was saved yet.
	async fn load(&self) -> Result<Vec<ServerInfo>, PoolError>;
	/// Replace the saved set.
	async fn save(&self, servers: &[ServerInfo]) -> Result<(), PoolError>;
	async fn clear(&self) -> Result<(), PoolError>;
}

/// JSON array at `<data_dir>/servers_<network>.json`.
pub struct FileServerCache {
	path: PathBuf,
}

impl FileServerCache {
	pub fn new(data_dir: &Path, network: Network) -> Self {
		Self {
			path: data_dir.join(format!("servers_{network}.json")),
		}
	}

	pub fn path(&self) -> &Path {
		&self.path
	}
}

#[async_trait::async_trait]
impl ServerCache for FileServerCache {
	async fn load(&self) -> Result<Vec<ServerInfo>, PoolError> {
		match tokio::fs::read_to_string(&self.path).await {
			Ok(json) => {
				let servers: Vec<ServerInfo> = serde_json::from_str(&json).map_err(|e| {
					PoolError::Cache(format!("Failed to parse {}: {e}", self.path.display()))
				})?;
				debug!("Loaded {} cached servers from {:?}", servers.len(), self.path);
				Ok(servers)
			}
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
			Err(e) => Err(PoolError::Cache(format!(
				"Failed to read {}: {e}",
				self.path.display()
			))),
		}
	}

	async fn save(&self, servers: &[ServerInfo]) -> Result<(), PoolError> {
		if let Some(parent) = self.path.parent() {
			tokio::fs::create_dir_all(parent)
				.await
				.map_err(|e| PoolError::Cache(format!("Failed to create {}: {e}", parent.display())))?;
		}
		let json = serde_json::to_string_pretty(servers)
			.map_err(|e| PoolError::Cache(format!("Failed to serialize servers: {e}")))?;
		tokio::fs::write(&self.path, json).await.map_err(|e| {
			PoolError::Cache(format!("Failed to write {}: {e}", self.path.display()))
		})?;
		debug!("Saved {} servers to {:?}", servers.len(), self.path);
		Ok(())
	}

	async fn clear(&self) -> Result<(), PoolError> {
		match tokio::fs::remove_file(&self.path).await {
			Ok(()) => {
				info!("Cleared server cache at {:?}", self.path);
				Ok(())
			}
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(PoolError::Cache(format!(
				"Failed to remove {}: {e}",
				self.path.display()
			))),
		}
	}
}
