//!
//! Server pool: racing connection passes, a capped healthy set and one current server.
//!
//! All list state lives in a single `parking_lot::Mutex` that is only held for synchronous
//! bookkeeping, never across an await. Whether the pool is connected is derived from the current
//! server slot; there is no separate flag.

use super::cache::ServerCache;
use super::connector::ServerConnector;
use super::provider::ElectrumProvider;
use super::server_list::shuffled;
use super::types::{PoolError, PoolEvent, Server, ServerInfo};
use crate::config::PoolConfig;
use crate::electrum::{CLIENT_NAME, ElectrumClient, ElectrumError, PROTOCOL_VERSION};

use backoff::ExponentialBackoffBuilder;
use backoff::backoff::Backoff;
use parking_lot::Mutex;
use rand::seq::IndexedRandom;
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 64;

#[derive(Default)]
struct PoolState {
	connected: Vec<Arc<Server>>,
	current: Option<Arc<Server>>,
	/// Identities attempted during the running pass.
	attempted: HashSet<String>,
}

struct PoolInner {
	config: PoolConfig,
	candidates: Vec<ServerInfo>,
	connector: Arc<dyn ServerConnector>,
	cache: Arc<dyn ServerCache>,
	state: Mutex<PoolState>,
	/// Serializes snapshot-and-write so the cache never regresses to an older set.
	persist_lock: tokio::sync::Mutex<()>,
	events: broadcast::Sender<PoolEvent>,
	/// Parent of every server token; cancelled when the pool is dropped.
	shutdown: CancellationToken,
}

impl Drop for PoolInner {
	fn drop(&mut self) {
		self.shutdown.cancel();
	}
}

/// Pool of connected Electrum servers.
#[derive(Clone)]
pub struct ServerPool {
	inner: Arc<PoolInner>,
}

impl ServerPool {
	/// Create a pool over a static candidate list.
	///
	/// # Arguments
	/// * `config` - Pool sizing and timeouts.
	/// * `candidates` - Static server list for the network.
	/// * `connector` - Opens transports to candidates.
	/// * `cache` - Recently-connected store used for warm starts.
	pub fn new(
		config: PoolConfig,
		candidates: Vec<ServerInfo>,
		connector: Arc<dyn ServerConnector>,
		cache: Arc<dyn ServerCache>,
	) -> Self {
		let (events, _) = broadcast::channel(EVENT_CAPACITY);
		Self {
			inner: Arc::new(PoolInner {
				config,
				candidates,
				connector,
				cache,
				state: Mutex::new(PoolState::default()),
				persist_lock: tokio::sync::Mutex::new(()),
				events,
				shutdown: CancellationToken::new(),
			}),
		}
	}

	pub fn current_server(&self) -> Option<ServerInfo> {
		self.inner
			.state
			.lock()
			.current
			.as_ref()
			.map(|s| s.info.clone())
	}

	pub fn connected_servers(&self) -> Vec<ServerInfo> {
		self.inner
			.state
			.lock()
			.connected
			.iter()
			.map(|s| s.info.clone())
			.collect()
	}

	pub fn connected_count(&self) -> usize {
		self.inner.state.lock().connected.len()
	}

	/// Run connection passes until the quorum is met.
	///
	/// Each pass races every candidate (cached servers first, then the shuffled static list) and
	/// follows peer discovery. Unmet quorum repeats the pass after an exponential backoff, up to
	/// `max_connect_passes`; connections made along the way are kept either way.
	pub async fn connect(&self, cancel: &CancellationToken) -> Result<(), PoolError> {
		let quorum = self.inner.config.quorum;
		let max_passes = self.inner.config.max_connect_passes.max(1);
		let mut backoff = ExponentialBackoffBuilder::new()
			.with_initial_interval(Duration::from_secs(1))
			.with_max_interval(Duration::from_secs(30))
			.with_max_elapsed_time(None)
			.build();

		for pass in 1..=max_passes {
			if cancel.is_cancelled() {
				return Err(PoolError::Cancelled);
			}

			let candidates = self.pass_candidates().await;
			info!(
				pass,
				candidates = candidates.len(),
				connected = self.connected_count(),
				"Starting connection pass"
			);
			self.run_pass(candidates, cancel).await;

			let connected = self.connected_count();
			if connected >= quorum {
				info!(connected, quorum, "Server pool ready");
				return Ok(());
			}
			if cancel.is_cancelled() {
				return Err(PoolError::Cancelled);
			}

			if pass < max_passes {
				let delay = backoff
					.next_backoff()
					.unwrap_or_else(|| Duration::from_secs(30));
				warn!(
					connected,
					quorum,
					"Quorum unmet after pass {pass}, retrying in {:?}",
					delay
				);
				tokio::select! {
					_ = tokio::time::sleep(delay) => {}
					_ = cancel.cancelled() => return Err(PoolError::Cancelled),
				}
			}
		}

		Err(PoolError::QuorumUnmet {
			connected: self.connected_count(),
			quorum,
			passes: max_passes,
		})
	}

	/// Replace the current server with a random other connected server and evict the old one.
	///
	/// With no alternative connected this changes nothing and returns [`PoolError::Exhausted`].
	pub async fn failover(&self) -> Result<(), PoolError> {
		let (evicted, event) = {
			let mut state = self.inner.state.lock();
			let current_id = state.current.as_ref().map(|s| s.id());
			let alternatives: Vec<Arc<Server>> = state
				.connected
				.iter()
				.filter(|s| Some(s.id()) != current_id)
				.cloned()
				.collect();

			let Some(next) = alternatives.choose(&mut rand::rng()).cloned() else {
				let connected = state.connected.len();
				warn!(connected, "Failover requested but no alternative server is connected");
				return Err(PoolError::Exhausted { connected });
			};

			let previous = state.current.replace(next.clone());
			if let Some(previous) = &previous {
				state.connected.retain(|s| s.id() != previous.id());
			}
			let event = match &previous {
				Some(previous) => PoolEvent::CurrentServerChanged {
					previous: previous.info.clone(),
					current: next.info.clone(),
				},
				None => PoolEvent::Connected(next.info.clone()),
			};
			(previous, event)
		};

		if let Some(previous) = evicted {
			info!(from = %previous.id(), "Failed over away from server");
			previous.shutdown();
		}
		self.emit(event);
		self.persist().await;
		Ok(())
	}

	/// Close every connection.
	pub async fn disconnect(&self) {
		let (servers, had_current) = {
			let mut state = self.inner.state.lock();
			let had_current = state.current.take().is_some();
			(std::mem::take(&mut state.connected), had_current)
		};
		for server in &servers {
			server.shutdown();
		}
		info!(closed = servers.len(), "Disconnected server pool");
		if had_current {
			self.emit(PoolEvent::Disconnected);
		}
	}

	/// Forget the recently-connected set.
	pub async fn clear_cache(&self) -> Result<(), PoolError> {
		self.inner.cache.clear().await
	}

	pub fn subscribe_events(&self) -> broadcast::Receiver<PoolEvent> {
		self.inner.events.subscribe()
	}

	/// Drop a server from the pool; the current slot moves to a random survivor if needed.
	pub async fn evict(&self, id: &str, reason: &str) {
		let (removed, event) = {
			let mut state = self.inner.state.lock();
			let Some(position) = state.connected.iter().position(|s| s.id() == id) else {
				return;
			};
			let removed = state.connected.remove(position);

			let was_current = state.current.as_ref().is_some_and(|c| c.id() == id);
			let event = if was_current {
				match state.connected.choose(&mut rand::rng()).cloned() {
					Some(next) => {
						state.current = Some(next.clone());
						Some(PoolEvent::CurrentServerChanged {
							previous: removed.info.clone(),
							current: next.info.clone(),
						})
					}
					None => {
						state.current = None;
						Some(PoolEvent::Disconnected)
					}
				}
			} else {
				None
			};
			(removed, event)
		};

		warn!(server = id, reason, "Evicted server");
		removed.shutdown();
		if let Some(event) = event {
			self.emit(event);
		}
		self.persist().await;
	}

	async fn pass_candidates(&self) -> Vec<ServerInfo> {
		let cached = match self.inner.cache.load().await {
			Ok(cached) => cached,
			Err(e) => {
				warn!("Ignoring server cache: {e}");
				Vec::new()
			}
		};

		let mut seen: HashSet<String> = self
			.inner
			.state
			.lock()
			.connected
			.iter()
			.map(|s| s.id())
			.collect();

		cached
			.into_iter()
			.chain(shuffled(&self.inner.candidates))
			.filter(|server| seen.insert(server.id()))
			.collect()
	}

	async fn run_pass(&self, candidates: Vec<ServerInfo>, cancel: &CancellationToken) {
		{
			let mut state = self.inner.state.lock();
			state.attempted = candidates.iter().map(ServerInfo::id).collect();
		}

		let mut attempts = JoinSet::new();
		for candidate in candidates {
			if self.at_capacity() {
				break;
			}
			attempts.spawn(self.clone().attempt(candidate, cancel.clone()));
		}

		while let Some(joined) = attempts.join_next().await {
			let discovered = match joined {
				Ok(discovered) => discovered,
				Err(e) => {
					warn!("Connection attempt task failed: {e}");
					continue;
				}
			};

			for peer in discovered {
				if self.at_capacity() || cancel.is_cancelled() {
					break;
				}
				let fresh = {
					let mut state = self.inner.state.lock();
					let id = peer.id();
					!state.connected.iter().any(|s| s.id() == id) && state.attempted.insert(id)
				};
				if fresh {
					debug!(server = %peer.id(), "Attempting discovered peer");
					attempts.spawn(self.clone().attempt(peer, cancel.clone()));
				}
			}
		}
	}

	fn at_capacity(&self) -> bool {
		self.connected_count() >= self.inner.config.max_connected
	}

	/// Connect and handshake one candidate. Returns the peers it advertised.
	async fn attempt(self, info: ServerInfo, cancel: CancellationToken) -> Vec<ServerInfo> {
		let id = info.id();
		let handshake = async {
			let transport = self.inner.connector.connect(&info).await?;
			let client = ElectrumClient::new(transport);
			let version = client.server_version(CLIENT_NAME, PROTOCOL_VERSION).await?;
			Ok::<_, ElectrumError>((client, version))
		};

		let limit = self.inner.config.connect_timeout();
		let outcome = tokio::select! {
			outcome = tokio::time::timeout(limit, handshake) => outcome.unwrap_or_else(|_| {
				Err(ElectrumError::Timeout {
					method: "server.version".to_string(),
					seconds: limit.as_secs(),
				})
			}),
			_ = cancel.cancelled() => return Vec::new(),
		};

		let (client, version) = match outcome {
			Ok(connected) => connected,
			Err(e) => {
				debug!(server = %id, "Connection attempt failed: {e}");
				return Vec::new();
			}
		};

		let server = Arc::new(Server::new(info, version, client.clone(), &self.inner.shutdown));
		if !self.register(server.clone()) {
			server.shutdown();
			return Vec::new();
		}
		self.persist().await;
		self.spawn_monitor(server);

		if !self.inner.config.discovery {
			return Vec::new();
		}
		match client.server_peers_subscribe().await {
			Ok(peers) => peers.iter().filter_map(ServerInfo::from_peer).collect(),
			Err(e) => {
				debug!(server = %id, "Peer discovery failed: {e}");
				Vec::new()
			}
		}
	}

	/// Add a handshaken server unless the pool is full or already holds it.
	fn register(&self, server: Arc<Server>) -> bool {
		let event = {
			let mut state = self.inner.state.lock();
			if state.connected.len() >= self.inner.config.max_connected {
				debug!(server = %server.id(), "Pool full, discarding connection");
				return false;
			}
			if state.connected.iter().any(|s| s.id() == server.id()) {
				return false;
			}
			state.connected.push(server.clone());
			info!(
				server = %server.id(),
				software = %server.version.server_software,
				connected = state.connected.len(),
				"Server connected"
			);

			if state.current.is_none() {
				state.current = Some(server.clone());
				Some(PoolEvent::Connected(server.info.clone()))
			} else {
				None
			}
		};

		if let Some(event) = event {
			self.emit(event);
		}
		true
	}

	/// Evict `server` once its transport tears down. Ends quietly when the server is shut down
	/// on purpose or the pool is gone.
	fn spawn_monitor(&self, server: Arc<Server>) {
		let pool: Weak<PoolInner> = Arc::downgrade(&self.inner);
		tokio::spawn(async move {
			let client = server.client();
			tokio::select! {
				_ = client.transport().closed() => {}
				_ = server.cancel_token().cancelled() => return,
			}
			if let Some(inner) = pool.upgrade() {
				ServerPool { inner }
					.evict(&server.id(), "transport closed")
					.await;
			}
		});
	}

	async fn persist(&self) {
		let _guard = self.inner.persist_lock.lock().await;
		let snapshot = self.connected_servers();
		if let Err(e) = self.inner.cache.save(&snapshot).await {
			warn!("Failed to persist connected servers: {e}");
		}
	}

	fn emit(&self, event: PoolEvent) {
		debug!(?event, "Pool event");
		// No receivers is fine.
		let _ = self.inner.events.send(event);
	}
}

#[async_trait::async_trait]
impl ElectrumProvider for ServerPool {
	async fn connect(&self, cancel: &CancellationToken) -> Result<(), PoolError> {
		ServerPool::connect(self, cancel).await
	}

	fn client(&self) -> Result<ElectrumClient, PoolError> {
		self.inner
			.state
			.lock()
			.current
			.as_ref()
			.map(|s| s.client())
			.ok_or(PoolError::NotConnected)
	}

	async fn failover(&self) -> Result<(), PoolError> {
		ServerPool::failover(self).await
	}

	fn is_connected(&self) -> bool {
		self.inner.state.lock().current.is_some()
	}

	fn subscribe_events(&self) -> broadcast::Receiver<PoolEvent> {
		ServerPool::subscribe_events(self)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::pool::cache::FileServerCache;
	use crate::testing::{MockConnector, MockElectrum};
	use bitcoin::Network;
	use serde_json::json;

	fn config(quorum: usize, max_connected: usize) -> PoolConfig {
		PoolConfig {
			max_connected,
			quorum,
			connect_timeout_secs: 2,
			request_timeout_secs: Some(2),
			max_connect_passes: 2,
			discovery: false,
		}
	}

	fn candidates(names: &[&str]) -> Vec<ServerInfo> {
		names.iter().map(|n| ServerInfo::new(*n, 50002)).collect()
	}

	fn pool_with(
		config: PoolConfig,
		names: &[&str],
		connector: &Arc<MockConnector>,
		dir: &tempfile::TempDir,
	) -> ServerPool {
		ServerPool::new(
			config,
			candidates(names),
			connector.clone(),
			Arc::new(FileServerCache::new(dir.path(), Network::Regtest)),
		)
	}

	#[tokio::test]
	async fn connect_reaches_quorum_with_unreachable_candidates() {
		let dir = tempfile::tempdir().unwrap();
		let connector = Arc::new(MockConnector::new());
		for name in ["a", "b", "c", "d", "e"] {
			connector.add_server(name, MockElectrum::new());
		}
		let pool = pool_with(config(4, 20), &["a", "b", "c", "d", "e", "dead"], &connector, &dir);

		assert!(!ElectrumProvider::is_connected(&pool));
		pool.connect(&CancellationToken::new()).await.unwrap();

		assert!(pool.connected_count() >= 4);
		assert!(ElectrumProvider::is_connected(&pool));
		assert!(pool.current_server().is_some());

		let cached = FileServerCache::new(dir.path(), Network::Regtest)
			.load()
			.await
			.unwrap();
		assert_eq!(cached.len(), pool.connected_count());
		assert!(cached.iter().all(|s| s.last_connected.is_some()));
	}

	#[tokio::test]
	async fn quorum_unmet_keeps_partial_connections() {
		let dir = tempfile::tempdir().unwrap();
		let connector = Arc::new(MockConnector::new());
		connector.add_server("a", MockElectrum::new());
		let mut cfg = config(3, 20);
		cfg.max_connect_passes = 1;
		let pool = pool_with(cfg, &["a", "dead-1", "dead-2"], &connector, &dir);

		match pool.connect(&CancellationToken::new()).await {
			Err(PoolError::QuorumUnmet {
				connected, quorum, ..
			}) => {
				assert_eq!(connected, 1);
				assert_eq!(quorum, 3);
			}
			other => panic!("unexpected {other:?}"),
		}
		assert_eq!(pool.connected_count(), 1);
	}

	#[tokio::test]
	async fn pool_respects_cap() {
		let dir = tempfile::tempdir().unwrap();
		let connector = Arc::new(MockConnector::new());
		let names = ["a", "b", "c", "d", "e", "f"];
		for name in names {
			connector.add_server(name, MockElectrum::new());
		}
		let pool = pool_with(config(1, 2), &names, &connector, &dir);
		pool.connect(&CancellationToken::new()).await.unwrap();
		assert_eq!(pool.connected_count(), 2);
	}

	#[tokio::test]
	async fn discovery_follows_advertised_peers() {
		let dir = tempfile::tempdir().unwrap();
		let connector = Arc::new(MockConnector::new());
		let seed = MockElectrum::new();
		seed.set_peers(vec![
			json!(["10.0.0.2", "peer-b", ["v1.4", "s50002"]]),
			json!(["10.0.0.3", "peer-c", ["v1.4", "s50002"]]),
			json!(["10.0.0.4", "hidden.onion", ["v1.4", "s50002"]]),
			json!(["10.0.0.5", "tcp-only", ["v1.4", "t50001"]]),
		]);
		connector.add_server("seed", seed);
		connector.add_server("peer-b", MockElectrum::new());
		connector.add_server("peer-c", MockElectrum::new());

		let mut cfg = config(3, 20);
		cfg.discovery = true;
		let pool = pool_with(cfg, &["seed"], &connector, &dir);
		pool.connect(&CancellationToken::new()).await.unwrap();

		let mut ids: Vec<String> = pool.connected_servers().iter().map(|s| s.id()).collect();
		ids.sort();
		assert_eq!(ids, vec!["peer-b:50002", "peer-c:50002", "seed:50002"]);
		assert!(!connector.attempted().iter().any(|d| d == "hidden.onion" || d == "tcp-only"));
	}

	#[tokio::test]
	async fn failover_with_single_server_is_a_noop() {
		let dir = tempfile::tempdir().unwrap();
		let connector = Arc::new(MockConnector::new());
		connector.add_server("only", MockElectrum::new());
		let pool = pool_with(config(1, 20), &["only"], &connector, &dir);
		pool.connect(&CancellationToken::new()).await.unwrap();

		let before = pool.current_server();
		assert!(matches!(
			pool.failover().await,
			Err(PoolError::Exhausted { connected: 1 })
		));
		assert_eq!(pool.current_server(), before);
		assert_eq!(pool.connected_count(), 1);
	}

	#[tokio::test]
	async fn failover_switches_and_evicts() {
		let dir = tempfile::tempdir().unwrap();
		let connector = Arc::new(MockConnector::new());
		connector.add_server("a", MockElectrum::new());
		connector.add_server("b", MockElectrum::new());
		let pool = pool_with(config(2, 20), &["a", "b"], &connector, &dir);
		let mut events = pool.subscribe_events();
		pool.connect(&CancellationToken::new()).await.unwrap();

		let first = pool.current_server().unwrap();
		assert_eq!(events.recv().await.unwrap(), PoolEvent::Connected(first.clone()));

		pool.failover().await.unwrap();
		let second = pool.current_server().unwrap();
		assert_ne!(first.id(), second.id());
		assert_eq!(pool.connected_count(), 1);
		match events.recv().await.unwrap() {
			PoolEvent::CurrentServerChanged { previous, current } => {
				assert_eq!(previous.id(), first.id());
				assert_eq!(current.id(), second.id());
			}
			other => panic!("unexpected {other:?}"),
		}
	}

	#[tokio::test]
	async fn teardown_of_current_server_moves_current() {
		let dir = tempfile::tempdir().unwrap();
		let connector = Arc::new(MockConnector::new());
		let a = MockElectrum::new();
		let b = MockElectrum::new();
		connector.add_server("a", a.clone());
		connector.add_server("b", b.clone());
		let pool = pool_with(config(2, 20), &["a", "b"], &connector, &dir);
		let mut events = pool.subscribe_events();
		pool.connect(&CancellationToken::new()).await.unwrap();
		let _ = events.recv().await.unwrap();

		let current = pool.current_server().unwrap();
		let (dying, survivor) = if current.domain == "a" { (a, "b") } else { (b, "a") };
		dying.disconnect_all();

		let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
			.await
			.unwrap()
			.unwrap();
		assert!(matches!(event, PoolEvent::CurrentServerChanged { .. }));
		assert_eq!(pool.current_server().unwrap().domain, survivor);

		pool.disconnect().await;
		assert_eq!(events.recv().await.unwrap(), PoolEvent::Disconnected);
		assert!(!ElectrumProvider::is_connected(&pool));
		assert!(matches!(
			ElectrumProvider::client(&pool),
			Err(PoolError::NotConnected)
		));
	}

	#[tokio::test]
	async fn cached_servers_are_tried_first() {
		let dir = tempfile::tempdir().unwrap();
		let cache = FileServerCache::new(dir.path(), Network::Regtest);
		cache
			.save(&[ServerInfo::new("cached", 50002)])
			.await
			.unwrap();

		let connector = Arc::new(MockConnector::new());
		connector.add_server("cached", MockElectrum::new());
		connector.add_server("static", MockElectrum::new());
		let pool = pool_with(config(1, 1), &["static"], &connector, &dir);
		pool.connect(&CancellationToken::new()).await.unwrap();

		assert_eq!(connector.attempted().first().map(String::as_str), Some("cached"));

		pool.clear_cache().await.unwrap();
		assert!(cache.load().await.unwrap().is_empty());
	}

	#[tokio::test]
	async fn cancelled_connect_returns_cancelled() {
		let dir = tempfile::tempdir().unwrap();
		let connector = Arc::new(MockConnector::new());
		let pool = pool_with(config(1, 20), &["dead"], &connector, &dir);
		let cancel = CancellationToken::new();
		cancel.cancel();
		assert!(matches!(
			pool.connect(&cancel).await,
			Err(PoolError::Cancelled)
		));
	}
}
