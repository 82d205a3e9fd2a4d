use super::types::ServerInfo;
use crate::config::TlsConfig;
use crate::electrum::{ElectrumError, Transport};

use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// Opens transports to servers. The pool and the trusted server only ever talk to this seam,
/// so tests can substitute in-memory servers.
#[async_trait::async_trait]
pub trait ServerConnector: Send + Sync {
	/// Establish a transport to `server`. The protocol handshake is the caller's job.
	async fn connect(&self, server: &ServerInfo) -> Result<Transport, ElectrumError>;
}

/// TCP + TLS connector.
pub struct TlsServerConnector {
	tls: TlsConfig,
	connect_timeout: Duration,
	request_timeout: Option<Duration>,
}

impl TlsServerConnector {
	pub fn new(tls: TlsConfig, connect_timeout: Duration, request_timeout: Option<Duration>) -> Self {
		Self {
			tls,
			connect_timeout,
			request_timeout,
		}
	}

	fn timeout_error(&self, stage: &str) -> ElectrumError {
		ElectrumError::Timeout {
			method: stage.to_string(),
			seconds: self.connect_timeout.as_secs(),
		}
	}
}

#[async_trait::async_trait]
impl ServerConnector for TlsServerConnector {
	async fn connect(&self, server: &ServerInfo) -> Result<Transport, ElectrumError> {
		let port = server.ssl_port.ok_or_else(|| {
			ElectrumError::Connection(format!("{} has no SSL port", server.domain))
		})?;

		let connector = native_tls::TlsConnector::builder()
			.danger_accept_invalid_certs(self.tls.accept_invalid_certs)
			.danger_accept_invalid_hostnames(self.tls.accept_invalid_certs)
			.build()?;
		let connector = tokio_native_tls::TlsConnector::from(connector);

		let tcp = tokio::time::timeout(
			self.connect_timeout,
			TcpStream::connect((server.domain.as_str(), port)),
		)
		.await
		.map_err(|_| self.timeout_error("tcp connect"))??;
		tcp.set_nodelay(true)?;

		let stream = tokio::time::timeout(self.connect_timeout, connector.connect(&server.domain, tcp))
			.await
			.map_err(|_| self.timeout_error("tls handshake"))??;

		debug!(server = %server.id(), "TLS session established");
		Ok(Transport::spawn(stream, server.id(), self.request_timeout))
	}
}
