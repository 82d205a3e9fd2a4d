//!
//! Single trusted server: no pool, no discovery.
//!
//! A keepalive task pings the server and reconnects after a teardown or failed ping. Subscribers
//! get channels owned by this type, fed by forwarding tasks that are re-created on every
//! reconnect, so their streams stay open while the connection underneath is replaced.

use super::connector::ServerConnector;
use super::provider::ElectrumProvider;
use super::types::{PoolError, PoolEvent, Server, ServerInfo};
use crate::config::TrustedServerConfig;
use crate::electrum::{
	CLIENT_NAME, ElectrumClient, ElectrumError, HeaderNotification, NotificationReceiver,
	PROTOCOL_VERSION,
};

use parking_lot::Mutex;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 16;

/// A subscription made through the trusted server, replayed after reconnects.
struct ForwardedSubscription {
	method: &'static str,
	params: Vec<Value>,
	sender: mpsc::UnboundedSender<Value>,
}

struct TrustedInner {
	info: ServerInfo,
	config: TrustedServerConfig,
	connector: Arc<dyn ServerConnector>,
	current: Mutex<Option<Arc<Server>>>,
	subscriptions: Mutex<Vec<ForwardedSubscription>>,
	/// One (re)connect at a time.
	reconnecting: tokio::sync::Mutex<()>,
	keepalive: Mutex<Option<JoinHandle<()>>>,
	events: broadcast::Sender<PoolEvent>,
	shutdown: CancellationToken,
}

/// Provider backed by one configured server.
#[derive(Clone)]
pub struct TrustedServer {
	inner: Arc<TrustedInner>,
}

impl TrustedServer {
	pub fn new(
		info: ServerInfo,
		config: TrustedServerConfig,
		connector: Arc<dyn ServerConnector>,
	) -> Self {
		let (events, _) = broadcast::channel(EVENT_CAPACITY);
		Self {
			inner: Arc::new(TrustedInner {
				info,
				config,
				connector,
				current: Mutex::new(None),
				subscriptions: Mutex::new(Vec::new()),
				reconnecting: tokio::sync::Mutex::new(()),
				keepalive: Mutex::new(None),
				events,
				shutdown: CancellationToken::new(),
			}),
		}
	}

	pub fn server(&self) -> &ServerInfo {
		&self.inner.info
	}

	/// Stop the keepalive and close the connection.
	pub async fn disconnect(&self) {
		self.inner.shutdown.cancel();
		if let Some(task) = self.inner.keepalive.lock().take() {
			task.abort();
		}
		self.drop_connection(None);
	}

	/// Connect, handshake, replay subscriptions and announce the new connection.
	async fn establish(&self) -> Result<(), PoolError> {
		let _guard = self.inner.reconnecting.lock().await;
		if self.inner.shutdown.is_cancelled() {
			return Err(PoolError::Cancelled);
		}

		let transport = self.inner.connector.connect(&self.inner.info).await?;
		let client = ElectrumClient::new(transport);
		let version = client
			.server_version(CLIENT_NAME, PROTOCOL_VERSION)
			.await?;
		let server = Arc::new(Server::new(
			self.inner.info.clone(),
			version,
			client.clone(),
			&self.inner.shutdown,
		));

		let previous = self.inner.current.lock().replace(server.clone());
		if let Some(previous) = previous {
			previous.shutdown();
		}

		self.replay_subscriptions(&client).await;
		info!(server = %server.id(), "Connected to trusted server");
		let _ = self.inner.events.send(PoolEvent::Connected(server.info.clone()));
		Ok(())
	}

	/// Clear the current connection, announcing `Disconnected` if there was one. With `expected`
	/// set, only that connection is dropped; a newer one is left alone.
	fn drop_connection(&self, expected: Option<&Arc<Server>>) {
		let previous = {
			let mut current = self.inner.current.lock();
			match (current.as_ref(), expected) {
				(Some(live), Some(expected)) if !Arc::ptr_eq(live, expected) => None,
				_ => current.take(),
			}
		};
		if let Some(previous) = previous {
			previous.shutdown();
			warn!(server = %previous.id(), "Trusted server disconnected");
			let _ = self.inner.events.send(PoolEvent::Disconnected);
		}
	}

	async fn replay_subscriptions(&self, client: &ElectrumClient) {
		let live: Vec<(&'static str, Vec<Value>, mpsc::UnboundedSender<Value>)> = {
			let mut subscriptions = self.inner.subscriptions.lock();
			subscriptions.retain(|s| !s.sender.is_closed());
			subscriptions
				.iter()
				.map(|s| (s.method, s.params.clone(), s.sender.clone()))
				.collect()
		};

		for (method, params, sender) in live {
			match client.transport().subscribe(method, params).await {
				Ok((initial, source)) => {
					// The status may have moved while we were away.
					let _ = sender.send(initial);
					spawn_forwarder(source, sender);
				}
				Err(e) => warn!(method, "Failed to re-establish subscription: {e}"),
			}
		}
	}

	async fn forward_subscribe(
		&self,
		method: &'static str,
		params: Vec<Value>,
	) -> Result<(Value, NotificationReceiver), PoolError> {
		let client = ElectrumProvider::client(self)?;
		let (initial, source) = client.transport().subscribe(method, params.clone()).await?;

		let (sender, receiver) = mpsc::unbounded_channel();
		spawn_forwarder(source, sender.clone());
		self.inner
			.subscriptions
			.lock()
			.push(ForwardedSubscription {
				method,
				params,
				sender,
			});
		Ok((initial, receiver))
	}

	fn ensure_keepalive(&self) {
		let mut keepalive = self.inner.keepalive.lock();
		if keepalive.as_ref().is_some_and(|task| !task.is_finished()) {
			return;
		}
		*keepalive = Some(tokio::spawn(self.clone().keepalive()));
	}

	async fn keepalive(self) {
		let shutdown = self.inner.shutdown.clone();
		loop {
			let server = self.inner.current.lock().clone();
			let healthy = match &server {
				Some(server) => {
					let client = server.client();
					tokio::select! {
						_ = tokio::time::sleep(self.inner.config.ping_interval()) => {
							match client.server_ping().await {
								Ok(()) => true,
								Err(e) => {
									warn!(server = %server.id(), "Keepalive ping failed: {e}");
									false
								}
							}
						}
						_ = client.transport().closed() => false,
						_ = shutdown.cancelled() => return,
					}
				}
				None => false,
			};

			if healthy {
				debug!(server = %self.inner.info.id(), "Keepalive ok");
				continue;
			}

			let replaced = match (&server, self.inner.current.lock().as_ref()) {
				(Some(observed), Some(live)) => !Arc::ptr_eq(observed, live),
				_ => false,
			};
			if replaced {
				continue;
			}

			self.drop_connection(server.as_ref());
			tokio::select! {
				_ = tokio::time::sleep(self.inner.config.reconnect_delay()) => {}
				_ = shutdown.cancelled() => return,
			}
			if let Err(e) = self.establish().await {
				warn!(server = %self.inner.info.id(), "Reconnect failed: {e}");
			}
		}
	}
}

fn spawn_forwarder(mut source: NotificationReceiver, sink: mpsc::UnboundedSender<Value>) {
	tokio::spawn(async move {
		while let Some(value) = source.recv().await {
			if sink.send(value).is_err() {
				break;
			}
		}
	});
}

#[async_trait::async_trait]
impl ElectrumProvider for TrustedServer {
	async fn connect(&self, cancel: &CancellationToken) -> Result<(), PoolError> {
		if cancel.is_cancelled() {
			return Err(PoolError::Cancelled);
		}
		let outcome = self.establish().await;
		self.ensure_keepalive();
		outcome
	}

	fn client(&self) -> Result<ElectrumClient, PoolError> {
		self.inner
			.current
			.lock()
			.as_ref()
			.map(|s| s.client())
			.ok_or(PoolError::NotConnected)
	}

	/// There is nothing to fail over to: reconnect to the same server right away.
	async fn failover(&self) -> Result<(), PoolError> {
		info!(server = %self.inner.info.id(), "Forcing reconnect to trusted server");
		self.drop_connection(None);
		let outcome = self.establish().await;
		self.ensure_keepalive();
		outcome
	}

	fn is_connected(&self) -> bool {
		self.inner.current.lock().is_some()
	}

	async fn subscribe_script_hash(
		&self,
		script_hash: &str,
	) -> Result<(Option<String>, NotificationReceiver), PoolError> {
		let (initial, receiver) = self
			.forward_subscribe("blockchain.scripthash.subscribe", vec![json!(script_hash)])
			.await?;
		let status = match initial {
			Value::Null => None,
			Value::String(status) => Some(status),
			other => {
				return Err(PoolError::Electrum(ElectrumError::Protocol {
					message: format!("Unexpected subscription status {other}"),
					code: 0,
				}));
			}
		};
		Ok((status, receiver))
	}

	async fn subscribe_headers(
		&self,
	) -> Result<(HeaderNotification, NotificationReceiver), PoolError> {
		let (initial, receiver) = self
			.forward_subscribe("blockchain.headers.subscribe", vec![])
			.await?;
		let header = serde_json::from_value(initial.clone()).map_err(|source| {
			PoolError::Electrum(ElectrumError::MalformedResponse {
				raw: initial.to_string(),
				target: std::any::type_name::<HeaderNotification>(),
				source,
			})
		})?;
		Ok((header, receiver))
	}

	fn subscribe_events(&self) -> broadcast::Receiver<PoolEvent> {
		self.inner.events.subscribe()
	}
}
