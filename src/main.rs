use electrum_spv_sync::config::AppConfig;
use electrum_spv_sync::pool::{
	ElectrumProvider, FileServerCache, PoolError, PoolEvent, ServerInfo, ServerPool,
	TlsServerConnector, TrustedServer,
	server_list::{default_server_list, load_server_list},
};
use electrum_spv_sync::wallet::{
	AccountState, EventDispatcher, FileWalletCheckpoint, LoggingEventHandler, WalletSyncError,
	WalletSyncOrchestrator, XpubAddressDeriver,
};

use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() {
	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::from_default_env()
				.add_directive(
					"electrum_spv_sync=debug"
						.parse()
						.unwrap_or_else(|_| tracing::Level::DEBUG.into()),
				)
				.add_directive(tracing::Level::INFO.into()),
		)
		.with_target(false)
		.with_thread_ids(false)
		.with_thread_names(false)
		.with_file(false)
		.with_line_number(false)
		.with_timer(tracing_subscriber::fmt::time::time())
		.init();

	if let Err(e) = run().await {
		error!("Fatal: {}", e);
		std::process::exit(1);
	}
}

async fn run() -> Result<(), BoxError> {
	let config = match std::env::args().nth(1).map(PathBuf::from) {
		Some(path) => {
			info!("Loading configuration from {}", path.display());
			AppConfig::load(&path).await?
		}
		None => {
			warn!("No configuration file given, using defaults");
			AppConfig::default()
		}
	};
	if config.accounts.is_empty() {
		return Err("No account xpubs configured".into());
	}

	let connector = Arc::new(TlsServerConnector::new(
		config.tls.clone(),
		config.pool.connect_timeout(),
		config.pool.request_timeout(),
	));
	let provider: Arc<dyn ElectrumProvider> = match &config.trusted_server {
		Some(address) => {
			let server = ServerInfo::parse(address)
				.ok_or_else(|| format!("Invalid trusted server address {address}"))?;
			info!("Using trusted server {}", server.id());
			Arc::new(TrustedServer::new(server, config.trusted.clone(), connector))
		}
		None => {
			let candidates = match &config.server_list {
				Some(path) => load_server_list(path).await?,
				None => default_server_list(config.network)?,
			};
			info!(
				"Using server pool over {} candidates on {}",
				candidates.len(),
				config.network
			);
			Arc::new(ServerPool::new(
				config.pool.clone(),
				candidates,
				connector,
				Arc::new(FileServerCache::new(&config.data_dir, config.network)),
			))
		}
	};

	let cancel = CancellationToken::new();
	{
		let cancel = cancel.clone();
		tokio::spawn(async move {
			if tokio::signal::ctrl_c().await.is_ok() {
				info!("Interrupt received, shutting down");
				cancel.cancel();
			}
		});
	}
	spawn_pool_event_logger(provider.as_ref());

	match provider.connect(&cancel).await {
		Ok(()) => {}
		Err(PoolError::QuorumUnmet {
			connected, quorum, ..
		}) if provider.is_connected() => {
			warn!(
				"Continuing with {} of {} wanted servers connected",
				connected, quorum
			);
		}
		Err(PoolError::Cancelled) => return Ok(()),
		Err(e) => return Err(e.into()),
	}

	let client = provider.client()?;
	match client.server_banner().await {
		Ok(banner) => info!("Server {} banner: {}", client.server_id(), banner.trim()),
		Err(e) => warn!("Could not fetch server banner: {}", e),
	}
	match client.estimate_fee_rate(2).await {
		Ok(Some(rate)) => info!("Estimated next-blocks fee rate: {:.1} sat/vB", rate),
		Ok(None) => info!("Server has no fee estimate"),
		Err(e) => warn!("Could not fetch fee estimate: {}", e),
	}

	let deriver = XpubAddressDeriver::new(config.network, &config.accounts)?;
	let accounts = (0..deriver.account_count() as u32)
		.map(AccountState::new)
		.collect();

	let mut dispatcher = EventDispatcher::new();
	dispatcher.register_handler(Box::new(LoggingEventHandler));

	let orchestrator = WalletSyncOrchestrator::new(
		provider.clone(),
		Arc::new(deriver),
		Arc::new(FileWalletCheckpoint::new(config.data_dir.clone())),
		dispatcher,
		accounts,
		config.sync.clone(),
	);

	match orchestrator.sync_wallet(&cancel).await {
		Ok(stats) => {
			for stats in &stats {
				info!("{}", stats.summary());
			}
		}
		Err(WalletSyncError::Cancelled) => return Ok(()),
		Err(e) => return Err(e.into()),
	}
	orchestrator.confirmed_received().await;

	info!("Initial sync done, watching for changes (Ctrl-C to stop)");
	orchestrator.watch_wallet(&cancel).await?;
	info!("Watch stopped");
	Ok(())
}

fn spawn_pool_event_logger(provider: &dyn ElectrumProvider) {
	let mut events = provider.subscribe_events();
	tokio::spawn(async move {
		loop {
			match events.recv().await {
				Ok(PoolEvent::Connected(server)) => info!("Current server: {}", server.id()),
				Ok(PoolEvent::CurrentServerChanged { previous, current }) => info!(
					"Current server changed from {} to {}",
					previous.id(),
					current.id()
				),
				Ok(PoolEvent::Disconnected) => warn!("No server connected"),
				Err(RecvError::Lagged(skipped)) => warn!("Missed {} pool events", skipped),
				Err(RecvError::Closed) => break,
			}
		}
	});
}
