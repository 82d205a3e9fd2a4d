use super::types::{PoolError, PoolEvent};
use crate::electrum::{ElectrumClient, HeaderNotification, NotificationReceiver};

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Source of Electrum connectivity for the sync engine: a server pool or a single trusted server.
#[async_trait::async_trait]
pub trait ElectrumProvider: Send + Sync {
	/// Bring the provider to a ready state.
	async fn connect(&self, cancel: &CancellationToken) -> Result<(), PoolError>;

	/// Client for the current server.
	fn client(&self) -> Result<ElectrumClient, PoolError>;

	/// Replace the current server.
	async fn failover(&self) -> Result<(), PoolError>;

	/// Fail over away from `client`'s connection, unless the current server already changed
	/// since that client was handed out.
	async fn report_failure(&self, client: &ElectrumClient) -> Result<(), PoolError> {
		match self.client() {
			Ok(current) if !current.transport().same_connection(client.transport()) => Ok(()),
			_ => self.failover().await,
		}
	}

	fn is_connected(&self) -> bool;

	/// Subscribe to a script hash on the current server.
	async fn subscribe_script_hash(
		&self,
		script_hash: &str,
	) -> Result<(Option<String>, NotificationReceiver), PoolError> {
		Ok(self.client()?.scripthash_subscribe(script_hash).await?)
	}

	/// Subscribe to chain tips on the current server.
	async fn subscribe_headers(
		&self,
	) -> Result<(HeaderNotification, NotificationReceiver), PoolError> {
		Ok(self.client()?.headers_subscribe().await?)
	}

	fn subscribe_events(&self) -> broadcast::Receiver<PoolEvent>;
}
