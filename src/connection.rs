//! Gateway connection manager.
//!
//! Owns the connection state machine, the challenge-response handshake,
//! request/response correlation, reconnect backoff and event fan-out.
//!
//! # Architecture
//!
//! ```text
//!   ConnectionManager (cheap clone, Arc<Shared>)
//!         │
//!         │ connect()        ┌──────────────────────────┐
//!         │ ───────────────► │ connection task          │
//!         │                  │  open → reader loop      │──► handle_message()
//!         │                  │  spawns writer task      │       │
//!         │                  └──────────────────────────┘       ├─ connect.challenge → sign + "connect" req
//!         │ request() ──► outbound mpsc ──► writer task          ├─ res → hello-ok effect, then pending table
//!         │     ▲                                                └─ event → seq dedup → on_event handlers
//!         │     └── oneshot ◄── pending table ◄── deadline task (Weak)
//! ```
//!
//! # State machine
//!
//! `Disconnected → Connecting → Authenticating → Connected`, with any state
//! able to drop to `Disconnected`. Every `connect()` and `disconnect()` bumps a
//! connection generation; callbacks carrying an older generation are ignored,
//! so a close delivered after `disconnect()` can never schedule a reconnect.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;

use crate::device::{DeviceIdentity, HandshakeClaims};
use crate::error::GatewayError;
use crate::observers::{Observers, Subscription};
use crate::protocol::{
    self, ClientInfo, ConnectAuth, ConnectParams, ErrorShape, EventFrame, Frame, GatewayEvent,
    HelloOk, ResponseFrame, SessionDefaults, CHALLENGE_EVENT, CONNECT_METHOD, PROTOCOL_VERSION,
};
use crate::transport::{Connector, SocketMessage, SocketReader, SocketWriter};

/// Reconnect delays in seconds, indexed by attempt (clamped to the last).
const BACKOFF_SECS: [u64; 5] = [1, 2, 4, 8, 16];

/// Default request deadline.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default role requested in the handshake.
pub const DEFAULT_ROLE: &str = "operator";

/// Close code sent when the handshake is rejected or times out.
const HANDSHAKE_FAILED_CLOSE_CODE: u16 = 4008;

/// Delay before reconnect attempt `attempt` (0-based).
#[must_use]
pub fn backoff_delay(attempt: u32) -> Duration {
    let index = (attempt as usize).min(BACKOFF_SECS.len() - 1);
    Duration::from_secs(BACKOFF_SECS[index])
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// No transport.
    #[default]
    Disconnected,
    /// Transport is being opened.
    Connecting,
    /// Transport is open; waiting for the challenge and `hello-ok`.
    Authenticating,
    /// Handshake completed; requests are accepted.
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// Connection parameters.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Gateway WebSocket URL.
    pub url: String,
    /// Client descriptor sent in the handshake.
    pub client: ClientInfo,
    /// Requested role.
    pub role: String,
    /// Requested scopes.
    pub scopes: Vec<String>,
    /// Shared-secret credentials.
    pub auth: ConnectAuth,
    /// Lowest protocol version accepted.
    pub min_protocol: u32,
    /// Highest protocol version accepted.
    pub max_protocol: u32,
    /// Deadline for every request, including the handshake.
    pub request_timeout: Duration,
}

impl ManagerConfig {
    /// Configuration with defaults for everything but the URL and client.
    #[must_use]
    pub fn new(url: impl Into<String>, client: ClientInfo) -> Self {
        Self {
            url: url.into(),
            client,
            role: DEFAULT_ROLE.to_string(),
            scopes: Vec::new(),
            auth: ConnectAuth::default(),
            min_protocol: PROTOCOL_VERSION,
            max_protocol: PROTOCOL_VERSION,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// RPC surface used by consumers that only need `request()`.
#[async_trait]
pub trait GatewayRpc: Send + Sync {
    /// Send a request and wait for its response.
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, GatewayError>;
}

// ── Internal state ───────────────────────────────────────────────────────────

/// Message for the writer task.
#[derive(Debug)]
enum Outbound {
    Text(String),
    Pong(Vec<u8>),
    Close { code: u16, reason: String },
}

/// Handles to one open transport.
#[derive(Debug)]
struct Link {
    outbound: mpsc::UnboundedSender<Outbound>,
    shutdown: Arc<Notify>,
}

impl Link {
    fn close(self, code: u16, reason: &str) {
        let _ = self.outbound.send(Outbound::Close {
            code,
            reason: reason.to_string(),
        });
        self.shutdown.notify_one();
    }
}

/// Who is waiting on a pending request.
#[derive(Debug)]
enum Waiter {
    Caller(oneshot::Sender<Result<Value, GatewayError>>),
    Handshake {
        generation: u64,
        used_device_token: bool,
    },
}

#[derive(Debug)]
struct PendingRequest {
    method: String,
    timeout: Duration,
    waiter: Waiter,
    timer: Option<JoinHandle<()>>,
}

impl PendingRequest {
    /// Resolve a caller with `ConnectionClosed`.
    fn reject_closed(self) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        if let Waiter::Caller(tx) = self.waiter {
            let _ = tx.send(Err(GatewayError::ConnectionClosed));
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    state: ConnectionState,
    generation: u64,
    intentional_close: bool,
    link: Option<Link>,
    pending: HashMap<String, PendingRequest>,
    reconnect_attempts: u32,
    reconnect_task: Option<JoinHandle<()>>,
    hello: Option<HelloOk>,
    session_defaults: Option<SessionDefaults>,
    last_event_seq: Option<u64>,
    /// Changes not yet delivered to state handlers, oldest first.
    queued_states: VecDeque<ConnectionState>,
    dispatching_states: bool,
}

impl Inner {
    /// Set the state, returning it when it changed. Changes are queued for
    /// [`Shared::dispatch_states`].
    fn set_state(&mut self, state: ConnectionState) -> Option<ConnectionState> {
        (self.state != state).then(|| {
            self.state = state;
            self.queued_states.push_back(state);
            state
        })
    }

    fn drain_pending(&mut self) -> Vec<PendingRequest> {
        self.pending.drain().map(|(_, entry)| entry).collect()
    }
}

struct Shared {
    config: ManagerConfig,
    connector: Arc<dyn Connector>,
    identity: Option<Arc<DeviceIdentity>>,
    inner: Mutex<Inner>,
    events: Observers<GatewayEvent>,
    state_changes: Observers<ConnectionState>,
    state_tx: watch::Sender<ConnectionState>,
}

/// Client connection to an agent gateway.
///
/// Cloning is cheap and yields another handle to the same connection.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("url", &self.shared.config.url)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Create a manager. Nothing happens until [`Self::connect`].
    ///
    /// Without an `identity` the handshake carries no device assertion and
    /// device tokens are neither used nor stored.
    #[must_use]
    pub fn new(
        config: ManagerConfig,
        connector: Arc<dyn Connector>,
        identity: Option<Arc<DeviceIdentity>>,
    ) -> Self {
        let (state_tx, _state_rx) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                config,
                connector,
                identity,
                inner: Mutex::new(Inner::default()),
                events: Observers::new(),
                state_changes: Observers::new(),
                state_tx,
            }),
        }
    }

    /// Start connecting. No-op unless currently `Disconnected`.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn connect(&self) {
        self.shared.connect();
    }

    /// Close the connection and stop reconnecting.
    ///
    /// Pending requests fail with [`GatewayError::ConnectionClosed`].
    pub fn disconnect(&self) {
        self.shared.disconnect();
    }

    /// Send a request and wait for its response.
    ///
    /// Fails immediately with [`GatewayError::NotConnected`] unless the
    /// handshake has completed.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, GatewayError> {
        self.shared.request(method, params).await
    }

    /// Send a request and deserialize the response payload.
    pub async fn request_as<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<T, GatewayError> {
        let payload = self.request(method, params).await?;
        serde_json::from_value(payload)
            .map_err(|e| GatewayError::Protocol(format!("unexpected '{method}' response: {e}")))
    }

    /// Register an event handler. Handlers run on the reader task, in
    /// registration order, and must not block.
    pub fn on_event(&self, handler: impl Fn(&GatewayEvent) + Send + Sync + 'static) -> Subscription {
        self.shared.events.subscribe(handler)
    }

    /// Register a state-change handler. Every change is delivered once and
    /// in order; changes a handler causes reach handlers after it returns.
    pub fn on_state_change(
        &self,
        handler: impl Fn(&ConnectionState) + Send + Sync + 'static,
    ) -> Subscription {
        self.shared.state_changes.subscribe(handler)
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    /// Wait until the connection reaches `state`, up to `timeout`.
    ///
    /// Returns `false` on timeout.
    pub async fn wait_for_state(&self, state: ConnectionState, timeout: Duration) -> bool {
        let mut rx = self.shared.state_tx.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|s| *s == state))
            .await
            .is_ok_and(|r| r.is_ok())
    }

    /// Last `hello-ok` payload of the current or previous connection.
    #[must_use]
    pub fn hello(&self) -> Option<HelloOk> {
        self.shared.lock().hello.clone()
    }

    /// Session defaults advertised by the gateway.
    #[must_use]
    pub fn session_defaults(&self) -> Option<SessionDefaults> {
        self.shared.lock().session_defaults.clone()
    }

    /// Number of reconnect attempts since the last successful handshake.
    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.lock().reconnect_attempts
    }

    /// Number of requests awaiting a response.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.shared.lock().pending.len()
    }

    /// Connection configuration.
    #[must_use]
    pub fn config(&self) -> &ManagerConfig {
        &self.shared.config
    }
}

#[async_trait]
impl GatewayRpc for ConnectionManager {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, GatewayError> {
        Self::request(self, method, params).await
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Change state under the lock. Waiters see the new state right away;
    /// handlers get it from the next [`Self::dispatch_states`].
    fn transition(&self, inner: &mut Inner, state: ConnectionState) {
        if let Some(state) = inner.set_state(state) {
            log::debug!("[Gateway] State -> {}", state);
            self.state_tx.send_replace(state);
        }
    }

    /// Deliver queued state changes to handlers in the order they happened.
    /// One caller drains at a time; a handler that changes the state again,
    /// or a task racing with it, only queues, so no handler ever sees an
    /// older state after a newer one.
    fn dispatch_states(&self) {
        {
            let mut inner = self.lock();
            if inner.dispatching_states {
                return;
            }
            inner.dispatching_states = true;
        }
        loop {
            let next = {
                let mut inner = self.lock();
                let next = inner.queued_states.pop_front();
                if next.is_none() {
                    inner.dispatching_states = false;
                }
                next
            };
            let Some(state) = next else {
                return;
            };
            self.state_changes.notify(&state);
        }
    }

    fn connect(self: &Arc<Self>) {
        let generation = {
            let mut inner = self.lock();
            if inner.state != ConnectionState::Disconnected {
                log::debug!("[Gateway] connect() ignored in state {}", inner.state);
                return;
            }
            if let Some(task) = inner.reconnect_task.take() {
                task.abort();
            }
            inner.intentional_close = false;
            inner.generation += 1;
            inner.last_event_seq = None;
            self.transition(&mut inner, ConnectionState::Connecting);
            inner.generation
        };
        self.dispatch_states();

        let shared = Arc::clone(self);
        tokio::spawn(async move { shared.run_connection(generation).await });
    }

    fn disconnect(&self) {
        let rejected = {
            let mut inner = self.lock();
            inner.intentional_close = true;
            inner.generation += 1;
            if let Some(task) = inner.reconnect_task.take() {
                task.abort();
            }
            if let Some(link) = inner.link.take() {
                link.close(1000, "client disconnect");
            }
            self.transition(&mut inner, ConnectionState::Disconnected);
            inner.drain_pending()
        };

        if !rejected.is_empty() {
            log::info!("[Gateway] Disconnect rejected {} pending request(s)", rejected.len());
        }
        for entry in rejected {
            entry.reject_closed();
        }
        self.dispatch_states();
    }

    async fn run_connection(self: Arc<Self>, generation: u64) {
        let url = self.config.url.clone();
        log::info!("[Gateway] Connecting to {}", url);

        let (writer, reader) = match self.connector.open(&url).await {
            Ok(pair) => pair,
            Err(e) => {
                log::warn!("[Gateway] Connection failed: {:#}", e);
                self.handle_close(generation);
                return;
            }
        };

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let shutdown = Arc::new(Notify::new());

        {
            let mut inner = self.lock();
            if inner.generation != generation {
                log::debug!("[Gateway] Discarding transport of superseded connection");
                drop(inner);
                tokio::spawn(run_writer(writer, outbound_rx));
                let _ = outbound_tx.send(Outbound::Close {
                    code: 1000,
                    reason: "superseded".to_string(),
                });
                return;
            }
            inner.link = Some(Link {
                outbound: outbound_tx,
                shutdown: Arc::clone(&shutdown),
            });
            self.transition(&mut inner, ConnectionState::Authenticating);
        }
        log::info!("[Gateway] Transport open, awaiting challenge");
        self.dispatch_states();

        tokio::spawn(run_writer(writer, outbound_rx));
        self.run_reader(generation, reader, &shutdown).await;
        self.handle_close(generation);
    }

    async fn run_reader(
        self: &Arc<Self>,
        generation: u64,
        mut reader: Box<dyn SocketReader>,
        shutdown: &Notify,
    ) {
        loop {
            tokio::select! {
                biased;

                () = shutdown.notified() => {
                    log::debug!("[Gateway] Reader stopped");
                    return;
                }

                msg = reader.recv() => {
                    match msg {
                        Some(Ok(SocketMessage::Text(text))) => self.handle_message(generation, &text),
                        Some(Ok(SocketMessage::Ping(data))) => {
                            self.send_outbound(generation, Outbound::Pong(data));
                        }
                        Some(Ok(SocketMessage::Binary(_))) => {
                            log::trace!("[Gateway] Ignoring binary frame");
                        }
                        Some(Ok(SocketMessage::Close { code, reason })) => {
                            log::info!("[Gateway] Connection closed by server ({} {})", code, reason);
                            return;
                        }
                        Some(Err(e)) => {
                            log::warn!("[Gateway] Transport error: {:#}", e);
                            return;
                        }
                        None => {
                            log::info!("[Gateway] Transport stream ended");
                            return;
                        }
                    }
                }
            }
        }
    }

    fn send_outbound(&self, generation: u64, message: Outbound) {
        let inner = self.lock();
        if inner.generation != generation {
            return;
        }
        if let Some(link) = &inner.link {
            let _ = link.outbound.send(message);
        }
    }

    fn handle_close(self: &Arc<Self>, generation: u64) {
        let rejected = {
            let mut inner = self.lock();
            if inner.generation != generation {
                log::debug!("[Gateway] Ignoring close of superseded connection");
                return;
            }
            inner.link = None;
            self.transition(&mut inner, ConnectionState::Disconnected);
            inner.drain_pending()
        };

        for entry in rejected {
            entry.reject_closed();
        }
        self.dispatch_states();
        self.schedule_reconnect(generation);
    }

    fn schedule_reconnect(self: &Arc<Self>, generation: u64) {
        let mut inner = self.lock();
        if inner.intentional_close || inner.generation != generation || inner.reconnect_task.is_some()
        {
            return;
        }

        let delay = backoff_delay(inner.reconnect_attempts);
        inner.reconnect_attempts += 1;
        log::info!(
            "[Gateway] Reconnecting in {}s (attempt {})",
            delay.as_secs(),
            inner.reconnect_attempts
        );

        let weak = Arc::downgrade(self);
        inner.reconnect_task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(shared) = weak.upgrade() else {
                return;
            };
            {
                let mut inner = shared.lock();
                if inner.generation != generation || inner.intentional_close {
                    return;
                }
                inner.reconnect_task = None;
            }
            shared.connect();
        }));
    }

    // ── Inbound ──────────────────────────────────────────────────────────────

    fn handle_message(self: &Arc<Self>, generation: u64, text: &str) {
        let Some(frame) = protocol::decode(text) else {
            log::debug!("[Gateway] Dropping undecodable frame ({} bytes)", text.len());
            return;
        };

        match frame {
            Frame::Event(event) if event.event == CHALLENGE_EVENT => {
                self.answer_challenge(generation, event.payload.as_ref());
            }
            Frame::Event(event) => self.dispatch_event(generation, event),
            Frame::Res(response) => self.handle_response(generation, response),
            Frame::Req(request) => {
                log::debug!("[Gateway] Ignoring server request '{}'", request.method);
            }
        }
    }

    fn dispatch_event(&self, generation: u64, frame: EventFrame) {
        {
            let mut inner = self.lock();
            if inner.generation != generation {
                return;
            }
            if let Some(seq) = frame.seq {
                if let Some(last) = inner.last_event_seq {
                    if seq <= last {
                        log::debug!("[Gateway] Dropping duplicate event '{}' seq={}", frame.event, seq);
                        return;
                    }
                    if seq > last + 1 {
                        log::warn!(
                            "[Gateway] Event gap: expected seq {}, received {}",
                            last + 1,
                            seq
                        );
                    }
                }
                inner.last_event_seq = Some(seq);
            }
        }

        let event = GatewayEvent::from_frame(frame);
        self.events.notify(&event);
    }

    fn answer_challenge(self: &Arc<Self>, generation: u64, payload: Option<&Value>) {
        let Some(nonce) = payload
            .and_then(|p| p.get("nonce"))
            .and_then(Value::as_str)
            .filter(|n| !n.is_empty())
        else {
            log::warn!("[Gateway] Challenge without nonce, ignoring");
            return;
        };

        let config = &self.config;
        let (token, used_device_token) = match (&config.auth.token, &self.identity) {
            (Some(token), _) => (Some(token.clone()), false),
            (None, Some(identity)) => match identity.device_token(&config.role) {
                Some(token) => (Some(token), true),
                None => (None, false),
            },
            (None, None) => (None, false),
        };

        let claims = HandshakeClaims {
            client_id: config.client.id.clone(),
            client_mode: config.client.mode.clone(),
            role: config.role.clone(),
            scopes: config.scopes.clone(),
            token: token.clone(),
        };

        let device = self.identity.as_ref().and_then(|identity| {
            identity
                .sign_challenge(nonce, &claims)
                .map_err(|e| log::warn!("[Gateway] Connecting without device assertion: {}", e))
                .ok()
        });

        let params = ConnectParams {
            min_protocol: config.min_protocol,
            max_protocol: config.max_protocol,
            client: config.client.clone(),
            role: Some(config.role.clone()),
            scopes: Some(config.scopes.clone()),
            device,
            auth: ConnectAuth {
                token,
                password: config.auth.password.clone(),
            },
        };

        let params = match serde_json::to_value(&params) {
            Ok(params) => params,
            Err(e) => {
                log::error!("[Gateway] Failed to encode connect params: {}", e);
                return;
            }
        };

        log::debug!("[Gateway] Answering challenge");
        let waiter = Waiter::Handshake {
            generation,
            used_device_token,
        };
        if let Err(e) = self.send_request(CONNECT_METHOD, Some(params), waiter, Some(generation)) {
            log::error!("[Gateway] Failed to send connect request: {}", e);
        }
    }

    fn handle_response(self: &Arc<Self>, generation: u64, response: ResponseFrame) {
        if response.ok {
            if let Some(payload) = response.payload.as_ref().filter(|p| HelloOk::matches(p)) {
                self.apply_hello(generation, payload);
            }
        }

        let Some(mut entry) = self.lock().pending.remove(&response.id) else {
            log::trace!("[Gateway] Unmatched response id={}", response.id);
            return;
        };
        if let Some(timer) = entry.timer.take() {
            timer.abort();
        }

        let result = if response.ok {
            Ok(response.payload.unwrap_or(Value::Null))
        } else {
            Err(GatewayError::Remote(
                response
                    .error
                    .unwrap_or_else(|| ErrorShape::new("UNKNOWN", "request failed")),
            ))
        };

        match entry.waiter {
            Waiter::Caller(tx) => {
                let _ = tx.send(result);
            }
            Waiter::Handshake {
                generation,
                used_device_token,
            } => {
                if let Err(e) = result {
                    log::warn!("[Gateway] Handshake rejected: {}", e);
                    if used_device_token {
                        self.forget_device_token();
                    }
                    self.fail_handshake(generation);
                }
            }
        }
    }

    fn apply_hello(&self, generation: u64, payload: &Value) {
        let hello = HelloOk::parse(payload);
        {
            let mut inner = self.lock();
            if inner.generation != generation || inner.link.is_none() {
                return;
            }
            inner.hello = Some(hello.clone());
            inner.session_defaults = hello.session_defaults();
            inner.reconnect_attempts = 0;
            self.transition(&mut inner, ConnectionState::Connected);
        }

        log::info!(
            "[Gateway] Connected (protocol {}, server {})",
            hello.protocol,
            hello.server.version
        );

        if let (Some(auth), Some(identity)) = (&hello.auth, &self.identity) {
            if let Err(e) = identity.store_device_token(&auth.role, &auth.device_token, &auth.scopes) {
                log::warn!("[Gateway] Failed to store device token: {}", e);
            }
        }

        self.dispatch_states();
    }

    fn forget_device_token(&self) {
        if let Some(identity) = &self.identity {
            if let Err(e) = identity.clear_device_token(&self.config.role) {
                log::warn!("[Gateway] Failed to clear device token: {}", e);
            }
        }
    }

    /// Close the transport after a failed handshake; the reader exits and the
    /// regular close path schedules a reconnect.
    fn fail_handshake(&self, generation: u64) {
        let mut inner = self.lock();
        if inner.generation != generation {
            return;
        }
        if let Some(link) = inner.link.take() {
            link.close(HANDSHAKE_FAILED_CLOSE_CODE, "connect failed");
        }
    }

    // ── Outbound ─────────────────────────────────────────────────────────────

    async fn request(self: &Arc<Self>, method: &str, params: Option<Value>) -> Result<Value, GatewayError> {
        let (tx, rx) = oneshot::channel();
        self.send_request(method, params, Waiter::Caller(tx), None)?;
        rx.await.unwrap_or(Err(GatewayError::ConnectionClosed))
    }

    /// Register a pending entry and send the request frame.
    ///
    /// Caller requests (no `generation`) require the `Connected` state; the
    /// handshake request only requires the originating connection to be current.
    fn send_request(
        self: &Arc<Self>,
        method: &str,
        params: Option<Value>,
        waiter: Waiter,
        generation: Option<u64>,
    ) -> Result<(), GatewayError> {
        let id = uuid::Uuid::new_v4().to_string();
        let text = protocol::encode(&Frame::request(id.as_str(), method, params))?;
        let timeout = self.config.request_timeout;

        let mut inner = self.lock();
        match generation {
            Some(generation) if inner.generation != generation => return Ok(()),
            Some(_) => {}
            None if inner.state != ConnectionState::Connected => {
                return Err(GatewayError::NotConnected);
            }
            None => {}
        }

        let weak = Arc::downgrade(self);
        let timer_id = id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(shared) = weak.upgrade() {
                shared.expire(&timer_id);
            }
        });

        inner.pending.insert(
            id,
            PendingRequest {
                method: method.to_string(),
                timeout,
                waiter,
                timer: Some(timer),
            },
        );

        match &inner.link {
            Some(link) => {
                if link.outbound.send(Outbound::Text(text)).is_err() {
                    log::debug!("[Gateway] Writer gone, '{}' will time out", method);
                }
            }
            None => log::debug!("[Gateway] No transport, '{}' will time out", method),
        }
        Ok(())
    }

    fn expire(&self, id: &str) {
        let Some(entry) = self.lock().pending.remove(id) else {
            return;
        };

        log::warn!(
            "[Gateway] Request '{}' timed out after {}ms",
            entry.method,
            entry.timeout.as_millis()
        );
        match entry.waiter {
            Waiter::Caller(tx) => {
                let _ = tx.send(Err(GatewayError::RequestTimeout {
                    method: entry.method,
                    timeout: entry.timeout,
                }));
            }
            Waiter::Handshake { generation, .. } => self.fail_handshake(generation),
        }
    }
}

async fn run_writer(mut writer: Box<dyn SocketWriter>, mut rx: mpsc::UnboundedReceiver<Outbound>) {
    while let Some(message) = rx.recv().await {
        let result = match message {
            Outbound::Text(text) => writer.send_text(&text).await,
            Outbound::Pong(data) => writer.send_pong(data).await,
            Outbound::Close { code, reason } => {
                if let Err(e) = writer.close(code, &reason).await {
                    log::debug!("[Gateway] Close failed: {:#}", e);
                }
                return;
            }
        };
        if let Err(e) = result {
            log::warn!("[Gateway] Send failed: {:#}", e);
            break;
        }
    }
    let _ = writer.close(1000, "").await;
}
