//! Streaming subscription client with heartbeat, auto-reconnect and
//! resubscribe.
//!
//! ```text
//!              connect()                 read/heartbeat failure
//! Disconnected ─────────► Connecting ─► Connected ─────────────► Disconnected
//!      ▲                                                          │
//!      └──────────────── reconnect after backoff ◄────────────────┘
//!
//! close() from any state ─► Closed (terminal)
//! ```
//!
//! Each established connection gets a generation number. The read loop and
//! the heartbeat loop carry the generation they were started with, so a
//! failure reported by a loop of an older connection is ignored.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::time::{self, Instant, MissedTickBehavior};

use chainpipe_core::policy::RetryPolicy;

use crate::endpoint::{Endpoint, WireProtocol};
use crate::error::StreamError;
use crate::handler::NotificationHandler;
use crate::subscriptions::{Registered, SubscriptionId, SubscriptionRegistry};
use crate::transport::{Connector, Frame, FrameSink, FrameStream, TungsteniteConnector};

/// Configuration for the stream client.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Bound on establishing the transport.
    pub connect_timeout: Duration,
    /// Bound on writing one frame.
    pub send_timeout: Duration,
    /// Interval between protocol pings.
    pub heartbeat_interval: Duration,
    /// First reconnect delay.
    pub reconnect_initial: Duration,
    /// Cap on the reconnect delay.
    pub reconnect_max: Duration,
    /// Reconnect automatically after a disconnect.
    pub reconnect: bool,
    /// Maximum handler invocations in flight.
    pub handler_concurrency: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            send_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            reconnect_initial: Duration::from_secs(5),
            reconnect_max: Duration::from_secs(60),
            reconnect: true,
            handler_concurrency: 64,
        }
    }
}

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

impl std::fmt::Display for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

type OnConnect = Box<dyn FnOnce() + Send>;

struct Inner {
    endpoint: Endpoint,
    config: StreamConfig,
    connector: Arc<dyn Connector>,
    state: Mutex<ClientState>,
    reconnect_enabled: AtomicBool,
    generation: AtomicU64,
    /// Serializes connect, disconnect handling and close.
    connect_lock: tokio::sync::Mutex<()>,
    writer: tokio::sync::Mutex<Option<FrameSink>>,
    subscriptions: SubscriptionRegistry,
    on_connect: Mutex<Option<OnConnect>>,
    last_heartbeat_at: Mutex<Option<Instant>>,
    next_request_id: AtomicU64,
    dispatch_permits: Arc<Semaphore>,
    closed_tx: watch::Sender<bool>,
    /// Loops report the generation that failed; the supervisor reconnects.
    disconnect_tx: mpsc::UnboundedSender<u64>,
    disconnect_rx: Mutex<Option<mpsc::UnboundedReceiver<u64>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Resolves once the client is closed.
async fn wait_closed(closed_rx: &mut watch::Receiver<bool>) {
    let _ = closed_rx.wait_for(|closed| *closed).await;
}

/// Persistent push-notification client.
///
/// Cheap to clone; all clones share one connection.
#[derive(Clone)]
pub struct StreamClient {
    inner: Arc<Inner>,
}

impl StreamClient {
    pub fn new(endpoint: Endpoint, connector: Arc<dyn Connector>, config: StreamConfig) -> Self {
        let (closed_tx, _) = watch::channel(false);
        let (disconnect_tx, disconnect_rx) = mpsc::unbounded_channel();
        let permits = config.handler_concurrency.max(1);
        Self {
            inner: Arc::new(Inner {
                reconnect_enabled: AtomicBool::new(config.reconnect),
                endpoint,
                config,
                connector,
                state: Mutex::new(ClientState::Disconnected),
                generation: AtomicU64::new(0),
                connect_lock: tokio::sync::Mutex::new(()),
                writer: tokio::sync::Mutex::new(None),
                subscriptions: SubscriptionRegistry::new(),
                on_connect: Mutex::new(None),
                last_heartbeat_at: Mutex::new(None),
                next_request_id: AtomicU64::new(1),
                dispatch_permits: Arc::new(Semaphore::new(permits)),
                closed_tx,
                disconnect_tx,
                disconnect_rx: Mutex::new(Some(disconnect_rx)),
            }),
        }
    }

    /// Client using the real WebSocket transport.
    pub fn with_tungstenite(endpoint: Endpoint, config: StreamConfig) -> Self {
        Self::new(endpoint, Arc::new(TungsteniteConnector), config)
    }

    /// Register a callback fired once, after the first successful connect.
    pub fn on_connect(&self, callback: impl FnOnce() + Send + 'static) {
        *lock(&self.inner.on_connect) = Some(Box::new(callback));
    }

    pub fn state(&self) -> ClientState {
        *lock(&self.inner.state)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ClientState::Connected
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    /// Time of the last successful ping or received pong.
    pub fn last_heartbeat_at(&self) -> Option<Instant> {
        *lock(&self.inner.last_heartbeat_at)
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.len()
    }

    /// Establish the connection once.
    ///
    /// No-op when already connected; fails with [`StreamError::Closed`]
    /// after [`close`](Self::close).
    pub async fn connect(&self) -> Result<(), StreamError> {
        let disconnects = lock(&self.inner.disconnect_rx).take();
        if let Some(disconnects) = disconnects {
            tokio::spawn(Arc::clone(&self.inner).supervise(disconnects));
        }
        Inner::establish(&self.inner).await
    }

    /// Keep trying to connect with the reconnect backoff until it succeeds
    /// or the client is closed.
    pub async fn connect_with_retry(&self) -> Result<(), StreamError> {
        let policy = self.inner.backoff_policy();
        let mut failures = 0u32;
        loop {
            match self.connect().await {
                Ok(()) => return Ok(()),
                Err(StreamError::Closed) => return Err(StreamError::Closed),
                Err(e) => {
                    failures += 1;
                    let delay = policy.backoff(failures);
                    tracing::warn!(
                        url = %self.inner.endpoint.redacted_url(),
                        error = %e,
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        "connect failed, retrying"
                    );
                    if !self.inner.sleep_unless_closed(delay).await {
                        return Err(StreamError::Closed);
                    }
                }
            }
        }
    }

    /// Subscribe to `method` and route its notifications to `handler`.
    ///
    /// The subscription is recorded and re-issued after every reconnect. If
    /// the client is not connected yet it is sent on the next connect.
    pub async fn subscribe(
        &self,
        method: &str,
        params: Value,
        handler: Arc<dyn NotificationHandler>,
    ) -> Result<SubscriptionId, StreamError> {
        // Held across register and send so a concurrent connect either
        // resubscribes this entry or sees it already sent, never both.
        let _guard = self.inner.connect_lock.lock().await;
        if self.state() == ClientState::Closed {
            return Err(StreamError::Closed);
        }
        let route = self.inner.endpoint.protocol.notification_method(method);
        let id = self.inner.subscriptions.register(method, params, route, handler);

        if self.is_connected() {
            if let Some(registered) = self.inner.subscriptions.get(id) {
                if let Err(e) = self.inner.send_subscribe(&registered).await {
                    tracing::warn!(method, error = %e, "subscribe send failed, will retry on reconnect");
                }
            }
        }
        Ok(id)
    }

    /// Cancel a subscription and stop re-issuing it.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), StreamError> {
        let registered = self
            .inner
            .subscriptions
            .remove(id)
            .ok_or(StreamError::UnknownSubscription(id.0))?;

        if !self.is_connected() {
            return Ok(());
        }
        let request_id = self.inner.next_request_id.fetch_add(1, Ordering::Relaxed);
        let message = self.inner.endpoint.protocol.unsubscribe_message(
            request_id,
            &registered.method,
            &registered.params,
            registered.server_id,
        );
        match message {
            Some(msg) => self.inner.send_json(&msg).await,
            None => {
                tracing::debug!(id = %id, "subscription never acknowledged, nothing to cancel");
                Ok(())
            }
        }
    }

    /// Close the client for good: no reconnects, transport released,
    /// later connects fail.
    pub async fn close(&self) {
        self.inner.reconnect_enabled.store(false, Ordering::SeqCst);
        self.inner.set_state(ClientState::Closed);
        self.inner.closed_tx.send_replace(true);

        let _guard = self.inner.connect_lock.lock().await;
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(mut sink) = self.inner.writer.lock().await.take() {
            let _ = time::timeout(self.inner.config.send_timeout, sink.send(Frame::Close)).await;
            let _ = time::timeout(self.inner.config.send_timeout, sink.close()).await;
        }
        tracing::info!(url = %self.inner.endpoint.redacted_url(), "stream client closed");
    }
}

impl Inner {
    fn set_state(&self, next: ClientState) -> bool {
        let mut state = lock(&self.state);
        if *state == ClientState::Closed {
            return false;
        }
        *state = next;
        true
    }

    fn current_state(&self) -> ClientState {
        *lock(&self.state)
    }

    fn is_closed(&self) -> bool {
        self.current_state() == ClientState::Closed
    }

    fn backoff_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(self.config.reconnect_initial, self.config.reconnect_max)
    }

    fn touch_heartbeat(&self) {
        *lock(&self.last_heartbeat_at) = Some(Instant::now());
    }

    /// Sleep for `delay`; returns `false` if the client closed meanwhile.
    async fn sleep_unless_closed(&self, delay: Duration) -> bool {
        let mut closed_rx = self.closed_tx.subscribe();
        tokio::select! {
            _ = wait_closed(&mut closed_rx) => false,
            _ = time::sleep(delay) => !self.is_closed(),
        }
    }

    async fn establish(self: &Arc<Self>) -> Result<(), StreamError> {
        let _guard = self.connect_lock.lock().await;
        match self.current_state() {
            ClientState::Closed => return Err(StreamError::Closed),
            ClientState::Connected => return Ok(()),
            _ => {}
        }
        self.set_state(ClientState::Connecting);
        let url = self.endpoint.redacted_url();
        tracing::info!(url = %url, "connecting stream");

        let timeout = self.config.connect_timeout;
        let connected = time::timeout(timeout, self.connector.connect(&self.endpoint)).await;
        let (sink, stream) = match connected {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                self.set_state(ClientState::Disconnected);
                return Err(e);
            }
            Err(_) => {
                self.set_state(ClientState::Disconnected);
                return Err(StreamError::Timeout {
                    ms: timeout.as_millis() as u64,
                });
            }
        };

        *self.writer.lock().await = Some(sink);
        if !self.set_state(ClientState::Connected) {
            let _ = self.writer.lock().await.take();
            return Err(StreamError::Closed);
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.subscriptions.reset_server_ids();
        self.touch_heartbeat();

        tokio::spawn(Arc::clone(self).read_loop(stream, generation));
        tokio::spawn(Arc::clone(self).heartbeat_loop(generation));

        for registered in self.subscriptions.active_subscriptions() {
            if let Err(e) = self.send_subscribe(&registered).await {
                tracing::warn!(method = %registered.method, error = %e, "resubscribe failed");
            }
        }

        tracing::info!(url = %url, generation, "stream connected");
        let callback = lock(&self.on_connect).take();
        if let Some(callback) = callback {
            callback();
        }
        Ok(())
    }

    async fn send_frame(&self, frame: Frame) -> Result<(), StreamError> {
        let mut writer = self.writer.lock().await;
        let sink = writer.as_mut().ok_or(StreamError::NotConnected)?;
        let timeout = self.config.send_timeout;
        time::timeout(timeout, sink.send(frame))
            .await
            .map_err(|_| StreamError::Timeout {
                ms: timeout.as_millis() as u64,
            })?
    }

    async fn send_json(&self, message: &Value) -> Result<(), StreamError> {
        self.send_frame(Frame::Text(message.to_string())).await
    }

    async fn send_subscribe(&self, registered: &Registered) -> Result<(), StreamError> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        if self.endpoint.protocol == WireProtocol::JsonRpc {
            self.subscriptions.mark_pending(request_id, registered.id);
        }
        let message =
            self.endpoint
                .protocol
                .subscribe_message(request_id, &registered.method, &registered.params);
        tracing::debug!(method = %registered.method, request_id, "sending subscribe");
        self.send_json(&message).await
    }

    async fn read_loop(self: Arc<Self>, mut stream: FrameStream, generation: u64) {
        let mut closed_rx = self.closed_tx.subscribe();
        loop {
            let next = tokio::select! {
                _ = wait_closed(&mut closed_rx) => return,
                frame = stream.next() => frame,
            };
            if self.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            match next {
                None => {
                    tracing::warn!("stream ended by peer");
                    break;
                }
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "stream receive error");
                    break;
                }
                Some(Ok(Frame::Close)) => {
                    tracing::info!("peer sent close frame");
                    break;
                }
                Some(Ok(Frame::Ping(payload))) => {
                    if let Err(e) = self.send_frame(Frame::Pong(payload)).await {
                        tracing::warn!(error = %e, "pong failed");
                        break;
                    }
                }
                Some(Ok(Frame::Pong(_))) => self.touch_heartbeat(),
                Some(Ok(Frame::Text(text))) => self.handle_text(&text).await,
                Some(Ok(Frame::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => self.handle_text(&text).await,
                    Err(_) => tracing::warn!("skipping non-utf8 binary frame"),
                },
            }
        }
        self.report_disconnect(generation);
    }

    async fn heartbeat_loop(self: Arc<Self>, generation: u64) {
        let period = self.config.heartbeat_interval;
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut closed_rx = self.closed_tx.subscribe();
        loop {
            tokio::select! {
                _ = wait_closed(&mut closed_rx) => return,
                _ = ticker.tick() => {}
            }
            if self.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            match self.send_frame(Frame::Ping(Vec::new())).await {
                Ok(()) => self.touch_heartbeat(),
                Err(e) => {
                    tracing::warn!(error = %e, "heartbeat failed");
                    self.report_disconnect(generation);
                    return;
                }
            }
        }
    }

    async fn handle_text(&self, text: &str) {
        let value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, bytes = text.len(), "skipping malformed frame");
                return;
            }
        };

        match self.endpoint.protocol {
            WireProtocol::JsonRpc => self.route_jsonrpc(value).await,
            WireProtocol::Plain => self.route_plain(value).await,
        }
    }

    async fn route_jsonrpc(&self, value: Value) {
        if let Some(method) = value.get("method").and_then(Value::as_str) {
            let Some(params) = value.get("params") else {
                tracing::warn!(method, "notification without params");
                return;
            };
            let server_id = params.get("subscription").and_then(Value::as_u64);
            let handlers = self.subscriptions.handlers_for(method, server_id);
            if handlers.is_empty() {
                tracing::debug!(method, ?server_id, "notification with no handler");
                return;
            }
            let payload = params.get("result").cloned().unwrap_or(Value::Null);
            self.dispatch(handlers, payload).await;
            return;
        }

        let Some(request_id) = value.get("id").and_then(Value::as_u64) else {
            tracing::debug!("ignoring frame without method or id");
            return;
        };
        if let Some(err) = value.get("error") {
            let id = self.subscriptions.reject(request_id);
            tracing::warn!(request_id, subscription = ?id, error = %err, "request rejected");
            return;
        }
        if let Some(server_id) = value.get("result").and_then(Value::as_u64) {
            if let Some(id) = self.subscriptions.confirm(request_id, server_id) {
                tracing::info!(subscription = %id, server_id, "subscription confirmed");
            }
        }
    }

    async fn route_plain(&self, value: Value) {
        // `{"message": "..."}` frames acknowledge subscribe requests.
        if let Some(obj) = value.as_object() {
            if obj.len() == 1 && (obj.contains_key("message") || obj.contains_key("errors")) {
                tracing::info!(ack = %value, "stream acknowledgement");
                return;
            }
        }
        let handlers = self.subscriptions.all_handlers();
        self.dispatch(handlers, value).await;
    }

    /// Spawn one task per handler; waits for a permit when saturated.
    async fn dispatch(&self, handlers: Vec<Arc<dyn NotificationHandler>>, payload: Value) {
        for handler in handlers {
            let permit = match Arc::clone(&self.dispatch_permits).acquire_owned().await {
                Ok(p) => p,
                Err(_) => return,
            };
            let payload = payload.clone();
            tokio::spawn(async move {
                handler.handle(payload).await;
                drop(permit);
            });
        }
    }

    fn report_disconnect(&self, generation: u64) {
        let _ = self.disconnect_tx.send(generation);
    }

    /// Owns disconnect handling and reconnection for the client's lifetime.
    async fn supervise(self: Arc<Self>, mut disconnects: mpsc::UnboundedReceiver<u64>) {
        let mut closed_rx = self.closed_tx.subscribe();
        loop {
            let generation = tokio::select! {
                _ = wait_closed(&mut closed_rx) => return,
                generation = disconnects.recv() => match generation {
                    Some(g) => g,
                    None => return,
                },
            };
            if self.handle_disconnect(generation).await {
                self.reconnect().await;
            }
        }
    }

    /// Tear down the connection of `generation`. Returns `true` when a
    /// reconnect should follow; stale or repeated reports return `false`.
    async fn handle_disconnect(&self, generation: u64) -> bool {
        let _guard = self.connect_lock.lock().await;
        if self.generation.load(Ordering::SeqCst) != generation {
            return false;
        }
        self.generation.fetch_add(1, Ordering::SeqCst);
        if self.is_closed() {
            return false;
        }
        self.set_state(ClientState::Disconnected);
        if let Some(mut sink) = self.writer.lock().await.take() {
            let _ = time::timeout(self.config.send_timeout, sink.close()).await;
        }
        self.subscriptions.reset_server_ids();

        if !self.reconnect_enabled.load(Ordering::SeqCst) {
            tracing::info!(url = %self.endpoint.redacted_url(), "stream disconnected, reconnect disabled");
            return false;
        }
        true
    }

    async fn reconnect(self: &Arc<Self>) {
        let policy = self.backoff_policy();
        let url = self.endpoint.redacted_url();
        let mut failures = 0u32;
        loop {
            failures += 1;
            let delay = policy.backoff(failures);
            tracing::warn!(url = %url, attempt = failures, delay_ms = delay.as_millis() as u64, "stream disconnected, reconnecting");
            if !self.sleep_unless_closed(delay).await || !self.reconnect_enabled.load(Ordering::SeqCst) {
                return;
            }
            match self.establish().await {
                Ok(()) => {
                    tracing::info!(url = %url, attempt = failures, "stream reconnected");
                    return;
                }
                Err(StreamError::Closed) => return,
                Err(e) => tracing::warn!(url = %url, error = %e, "reconnect failed"),
            }
        }
    }
}
