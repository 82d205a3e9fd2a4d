//!
//! Multiplexed JSON-RPC transport over one persistent stream.
//!
//! A [`Transport`] owns one byte stream to one Electrum server (TLS in production, an in-memory
//! duplex in tests). Requests are framed as one JSON object per line and written by a single
//! writer task in submission order; a single reader task decodes incoming lines and completes the
//! caller waiting on the matching id, or forwards unsolicited notifications to the subscription
//! registered for their key. Responses may complete out of order; correlation is by id only.

use super::naming::snake_case_keys;
use super::types::{ElectrumError, HEADERS_SUBSCRIPTION_KEY, Request};

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Receiving end of a subscription. Yields the notified value for the subscription key (the
/// status string for script hashes, the header object for headers) and closes when the transport
/// tears down.
pub type NotificationReceiver = mpsc::UnboundedReceiver<Value>;

/// A call waiting for its response.
struct PendingRequest {
	method: String,
	/// Serialized line, kept for diagnostics.
	body: String,
	responder: oneshot::Sender<Result<Value, ElectrumError>>,
}

struct Subscription {
	last_value: Option<Value>,
	sender: mpsc::UnboundedSender<Value>,
}

struct OutboundFrame {
	line: String,
	written: oneshot::Sender<std::io::Result<()>>,
}

struct Shared {
	label: String,
	next_id: AtomicU64,
	pending: Mutex<HashMap<u64, PendingRequest>>,
	subscriptions: Mutex<HashMap<String, Subscription>>,
	outbound: mpsc::UnboundedSender<OutboundFrame>,
	closed: CancellationToken,
	request_timeout: Option<Duration>,
}

/// Aborts the reader and writer tasks once the last transport handle is gone.
struct TaskGuard {
	tasks: Vec<JoinHandle<()>>,
}

impl Drop for TaskGuard {
	fn drop(&mut self) {
		for task in &self.tasks {
			task.abort();
		}
	}
}

/// Cloneable handle to one multiplexed server connection.
#[derive(Clone)]
pub struct Transport {
	shared: Arc<Shared>,
	tasks: Arc<TaskGuard>,
}

impl std::fmt::Debug for Transport {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Transport")
			.field("label", &self.shared.label)
			.field("closed", &self.is_closed())
			.finish()
	}
}

impl Transport {
	/// Start the reader and writer tasks over `stream`.
	///
	/// # Arguments
	/// * `stream` - Connected byte stream, already past any TLS handshake.
	/// * `label` - Server identity used in logs and for failover bookkeeping.
	/// * `request_timeout` - Upper bound on each call's wait for its response; `None` waits
	///   until the response arrives or the transport tears down.
	pub fn spawn<S>(stream: S, label: impl Into<String>, request_timeout: Option<Duration>) -> Self
	where
		S: AsyncRead + AsyncWrite + Send + 'static,
	{
		let (reader, writer) = tokio::io::split(stream);
		let (outbound, queue) = mpsc::unbounded_channel();

		let shared = Arc::new(Shared {
			label: label.into(),
			next_id: AtomicU64::new(0),
			pending: Mutex::new(HashMap::new()),
			subscriptions: Mutex::new(HashMap::new()),
			outbound,
			closed: CancellationToken::new(),
			request_timeout,
		});

		let reader_task = tokio::spawn(read_loop(shared.clone(), BufReader::new(reader)));
		let writer_task = tokio::spawn(write_loop(shared.clone(), writer, queue));

		Self {
			shared,
			tasks: Arc::new(TaskGuard {
				tasks: vec![reader_task, writer_task],
			}),
		}
	}

	/// Server identity this transport was opened with.
	pub fn label(&self) -> &str {
		&self.shared.label
	}

	/// Whether both handles point at the same underlying connection.
	pub fn same_connection(&self, other: &Transport) -> bool {
		Arc::ptr_eq(&self.shared, &other.shared)
	}

	pub fn is_closed(&self) -> bool {
		self.shared.closed.is_cancelled()
	}

	/// Resolves once the transport has torn down.
	pub async fn closed(&self) {
		self.shared.closed.cancelled().await
	}

	/// Number of calls currently waiting for a response.
	pub fn pending_requests(&self) -> usize {
		self.shared.pending.lock().len()
	}

	/// Last value delivered for a subscription key, if any.
	pub fn last_notification(&self, key: &str) -> Option<Value> {
		self.shared
			.subscriptions
			.lock()
			.get(key)
			.and_then(|s| s.last_value.clone())
	}

	/// Tear the connection down: pending calls fail, subscription channels close, tasks stop.
	pub fn close(&self) {
		self.shared.teardown("closed locally");
		for task in &self.tasks.tasks {
			task.abort();
		}
	}

	/// Send a request and wait for the response correlated by id.
	///
	/// # Returns
	/// The `result` member of the response (possibly `null`), or the server's error as
	/// [`ElectrumError::Protocol`].
	pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, ElectrumError> {
		if self.is_closed() {
			return Err(ElectrumError::Closed);
		}

		let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
		let request = Request::new(id, method, params);
		let body = serde_json::to_value(&request)
			.map(snake_case_keys)
			.and_then(|value| serde_json::to_string(&value))
			.map_err(|e| ElectrumError::Connection(format!("Failed to encode {method}: {e}")))?;

		let (responder, response) = oneshot::channel();
		{
			let mut pending = self.shared.pending.lock();
			if pending.contains_key(&id) {
				return Err(ElectrumError::Connection(format!(
					"Request id {id} already in flight"
				)));
			}
			pending.insert(
				id,
				PendingRequest {
					method: method.to_string(),
					body: body.clone(),
					responder,
				},
			);
		}

		// Teardown sets the flag before draining, so a request registered after the drain is
		// caught here.
		if self.is_closed() {
			self.shared.pending.lock().remove(&id);
			return Err(ElectrumError::Closed);
		}

		trace!(server = %self.shared.label, id, method, "-> {}", body);

		let (written, write_result) = oneshot::channel();
		if self
			.shared
			.outbound
			.send(OutboundFrame {
				line: body,
				written,
			})
			.is_err()
		{
			self.shared.pending.lock().remove(&id);
			return Err(ElectrumError::Closed);
		}

		match write_result.await {
			Ok(Ok(())) => {}
			Ok(Err(e)) => {
				self.shared.pending.lock().remove(&id);
				return Err(ElectrumError::Io(e));
			}
			Err(_) => {
				self.shared.pending.lock().remove(&id);
				return Err(ElectrumError::Closed);
			}
		}

		let outcome = match self.shared.request_timeout {
			Some(limit) => match tokio::time::timeout(limit, response).await {
				Ok(outcome) => outcome,
				Err(_) => {
					if let Some(expired) = self.shared.pending.lock().remove(&id) {
						debug!(
							server = %self.shared.label,
							id,
							"Request timed out: {}",
							expired.body
						);
					}
					return Err(ElectrumError::Timeout {
						method: method.to_string(),
						seconds: limit.as_secs(),
					});
				}
			},
			None => response.await,
		};

		outcome.unwrap_or(Err(ElectrumError::Closed))
	}

	/// Register a subscription and issue its subscribe request.
	///
	/// The channel is registered before the request is written so a notification racing the
	/// response is not lost. Subscribing again to the same key replaces the earlier channel,
	/// whose receiver then closes.
	///
	/// # Returns
	/// The subscribe call's initial result and the notification receiver.
	pub async fn subscribe(
		&self,
		method: &str,
		params: Vec<Value>,
	) -> Result<(Value, NotificationReceiver), ElectrumError> {
		let key = subscription_key(method, &params);
		let (sender, receiver) = mpsc::unbounded_channel();
		self.shared.subscriptions.lock().insert(
			key.clone(),
			Subscription {
				last_value: None,
				sender,
			},
		);

		match self.call(method, params).await {
			Ok(initial) => {
				if let Some(subscription) = self.shared.subscriptions.lock().get_mut(&key) {
					subscription.last_value.get_or_insert_with(|| initial.clone());
				}
				Ok((initial, receiver))
			}
			Err(e) => {
				self.shared.subscriptions.lock().remove(&key);
				Err(e)
			}
		}
	}
}

/// Key a subscribe request (or its notifications) is routed by.
fn subscription_key(method: &str, params: &[Value]) -> String {
	match method {
		"blockchain.headers.subscribe" => HEADERS_SUBSCRIPTION_KEY.to_string(),
		"blockchain.scripthash.subscribe" => params
			.first()
			.and_then(Value::as_str)
			.unwrap_or_default()
			.to_string(),
		other => other.to_string(),
	}
}

/// Splits notification params into the subscription key and the value delivered to subscribers.
fn notification_parts(method: &str, params: &[Value]) -> (String, Value) {
	match method {
		"blockchain.headers.subscribe" => (
			HEADERS_SUBSCRIPTION_KEY.to_string(),
			params.first().cloned().unwrap_or(Value::Null),
		),
		"blockchain.scripthash.subscribe" => (
			subscription_key(method, params),
			params.get(1).cloned().unwrap_or(Value::Null),
		),
		other => (other.to_string(), Value::Array(params.to_vec())),
	}
}

impl Shared {
	fn dispatch_frame(&self, frame: &[u8]) {
		let message: Value = match serde_json::from_slice(frame) {
			Ok(message) => snake_case_keys(message),
			Err(e) => {
				warn!(
					server = %self.label,
					"Skipping undecodable frame ({e}): {}",
					String::from_utf8_lossy(frame)
				);
				return;
			}
		};

		match message {
			Value::Array(batch) => batch.into_iter().for_each(|m| self.dispatch_message(m)),
			single => self.dispatch_message(single),
		}
	}

	fn dispatch_message(&self, message: Value) {
		if let Some(id) = message.get("id").and_then(Value::as_u64) {
			let pending = self.pending.lock().remove(&id);
			if let Some(pending) = pending {
				let outcome = match message.get("error") {
					Some(error) if !error.is_null() => Err(ElectrumError::from_error_value(error)),
					_ => Ok(message.get("result").cloned().unwrap_or(Value::Null)),
				};
				trace!(server = %self.label, id, method = %pending.method, "<- response");
				if pending.responder.send(outcome).is_err() {
					debug!(server = %self.label, id, "Caller for {} went away", pending.method);
				}
				return;
			}
		}

		if let Some(method) = message.get("method").and_then(Value::as_str) {
			let params = message
				.get("params")
				.and_then(Value::as_array)
				.map(Vec::as_slice)
				.unwrap_or_default();
			self.notify(method, params);
			return;
		}

		let id = message.get("id").cloned().unwrap_or(Value::Null);
		warn!(server = %self.label, "Dropping response for unknown id {id}");
	}

	fn notify(&self, method: &str, params: &[Value]) {
		let (key, value) = notification_parts(method, params);
		let mut subscriptions = self.subscriptions.lock();
		match subscriptions.get_mut(&key) {
			Some(subscription) => {
				subscription.last_value = Some(value.clone());
				if subscription.sender.send(value).is_err() {
					debug!(server = %self.label, key, "Subscriber dropped, removing subscription");
					subscriptions.remove(&key);
				}
			}
			None => debug!(server = %self.label, method, key, "Unsolicited notification"),
		}
	}

	fn teardown(&self, reason: &str) {
		if self.closed.is_cancelled() {
			return;
		}
		self.closed.cancel();

		let drained: Vec<(u64, PendingRequest)> = self.pending.lock().drain().collect();
		let failed = drained.len();
		for (id, pending) in drained {
			let _ = pending.responder.send(Err(ElectrumError::Connection(format!(
				"{reason} while request {id} ({}) was in flight",
				pending.method
			))));
		}
		self.subscriptions.lock().clear();

		warn!(server = %self.label, failed, "Transport closed: {reason}");
	}
}

async fn read_loop<R>(shared: Arc<Shared>, mut reader: BufReader<R>)
where
	R: AsyncRead + Unpin,
{
	let mut frame = Vec::with_capacity(4096);
	loop {
		frame.clear();
		match reader.read_until(b'\n', &mut frame).await {
			Ok(0) => {
				shared.teardown("connection closed by server");
				return;
			}
			Ok(_) => {
				let line = frame.trim_ascii();
				if !line.is_empty() {
					shared.dispatch_frame(line);
				}
			}
			Err(e) => {
				shared.teardown(&format!("read failed: {e}"));
				return;
			}
		}
	}
}

async fn write_loop<W>(
	shared: Arc<Shared>,
	mut writer: W,
	mut queue: mpsc::UnboundedReceiver<OutboundFrame>,
) where
	W: AsyncWrite + Unpin,
{
	while let Some(frame) = queue.recv().await {
		let result = write_line(&mut writer, &frame.line).await;
		let failure = result.as_ref().err().map(ToString::to_string);
		let _ = frame.written.send(result);
		if let Some(error) = failure {
			shared.teardown(&format!("write failed: {error}"));
			return;
		}
	}
}

async fn write_line<W>(writer: &mut W, line: &str) -> std::io::Result<()>
where
	W: AsyncWrite + Unpin,
{
	writer.write_all(line.as_bytes()).await?;
	writer.write_all(b"\n").await?;
	writer.flush().await
}
