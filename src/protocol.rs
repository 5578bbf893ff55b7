//! Gateway wire protocol.
//!
//! All traffic is UTF-8 JSON text frames over one WebSocket. Three frame
//! shapes exist, discriminated by `type`:
//!
//! ```text
//! {"type":"req",   "id":"…", "method":"chat.send", "params":{…}}
//! {"type":"res",   "id":"…", "ok":true, "payload":{…}}
//! {"type":"res",   "id":"…", "ok":false, "error":{"code":"…","message":"…"}}
//! {"type":"event", "event":"agent", "payload":{…}, "seq":42}
//! ```
//!
//! [`decode`] never fails loudly: anything that is not one of the shapes above
//! decodes to `None` and the caller drops it.
//!
//! Inbound events are parsed once into [`EventKind`] so consumers match on a
//! sum type instead of probing JSON; names this crate does not know about are
//! preserved verbatim in [`EventKind::Other`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GatewayError;

/// Protocol version this client speaks.
pub const PROTOCOL_VERSION: u32 = 3;

/// Handshake RPC method.
pub const CONNECT_METHOD: &str = "connect";

/// Server-pushed event carrying the handshake nonce.
pub const CHALLENGE_EVENT: &str = "connect.challenge";

/// `payload.type` of a successful handshake response.
pub const HELLO_OK: &str = "hello-ok";

/// Agent turn stream event.
pub const AGENT_EVENT: &str = "agent";

/// Heartbeat event.
pub const TICK_EVENT: &str = "tick";

/// Gateway shutdown notice.
pub const SHUTDOWN_EVENT: &str = "shutdown";

/// Presence update event.
pub const PRESENCE_EVENT: &str = "presence";

// ── Error shape ──────────────────────────────────────────────────────────────

/// Error carried inside a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorShape {
    /// Machine-readable error code (e.g. `UNAUTHORIZED`).
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional structured details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    /// Whether the server considers the call retryable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
    /// Suggested retry delay.
    #[serde(rename = "retryAfterMs", default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl ErrorShape {
    /// Create an error shape with only a code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
            retryable: None,
            retry_after_ms: None,
        }
    }
}

// ── Frames ───────────────────────────────────────────────────────────────────

/// RPC request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    /// Caller-generated correlation id.
    pub id: String,
    /// Method name.
    pub method: String,
    /// Method parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// RPC response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    /// Id of the request being answered.
    pub id: String,
    /// Success flag.
    pub ok: bool,
    /// Result payload when `ok`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Error when not `ok`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

/// Server-push event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFrame {
    /// Event name.
    pub event: String,
    /// Event payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Per-connection event sequence number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    /// Versions of server-side state snapshots.
    #[serde(rename = "stateVersion", default, skip_serializing_if = "Option::is_none")]
    pub state_version: Option<StateVersion>,
}

/// Versions of server-side state the event reflects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StateVersion {
    /// Presence snapshot version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence: Option<u64>,
    /// Health snapshot version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<u64>,
}

/// One unit of the wire protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Request.
    #[serde(rename = "req")]
    Req(RequestFrame),
    /// Response.
    #[serde(rename = "res")]
    Res(ResponseFrame),
    /// Event.
    #[serde(rename = "event")]
    Event(EventFrame),
}

impl Frame {
    /// Build a request frame.
    pub fn request(id: impl Into<String>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Req(RequestFrame {
            id: id.into(),
            method: method.into(),
            params,
        })
    }

    /// Build a successful response frame.
    pub fn ok(id: impl Into<String>, payload: Value) -> Self {
        Self::Res(ResponseFrame {
            id: id.into(),
            ok: true,
            payload: Some(payload),
            error: None,
        })
    }

    /// Build a failed response frame.
    pub fn err(id: impl Into<String>, error: ErrorShape) -> Self {
        Self::Res(ResponseFrame {
            id: id.into(),
            ok: false,
            payload: None,
            error: Some(error),
        })
    }

    /// Build an event frame.
    pub fn event(event: impl Into<String>, payload: Value, seq: Option<u64>) -> Self {
        Self::Event(EventFrame {
            event: event.into(),
            payload: Some(payload),
            seq,
            state_version: None,
        })
    }

    fn is_well_formed(&self) -> bool {
        match self {
            Self::Req(req) => !req.id.is_empty() && !req.method.is_empty(),
            Self::Res(res) => !res.id.is_empty(),
            Self::Event(ev) => !ev.event.is_empty(),
        }
    }
}

/// Decode a text frame. Returns `None` for anything malformed.
#[must_use]
pub fn decode(text: &str) -> Option<Frame> {
    let frame: Frame = serde_json::from_str(text).ok()?;
    frame.is_well_formed().then_some(frame)
}

/// Encode a frame for the wire.
pub fn encode(frame: &Frame) -> Result<String, GatewayError> {
    serde_json::to_string(frame).map_err(|e| GatewayError::Protocol(e.to_string()))
}

// ── Handshake ────────────────────────────────────────────────────────────────

/// Client descriptor sent in the handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientInfo {
    /// Client identifier (e.g. `gatelink-cli`).
    pub id: String,
    /// Client version.
    pub version: String,
    /// Host platform (e.g. `linux`).
    pub platform: String,
    /// Client mode (e.g. `cli`, `webchat`).
    pub mode: String,
    /// Optional display name.
    #[serde(rename = "displayName", default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Per-process instance id.
    #[serde(rename = "instanceId", default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
}

/// Shared-secret credentials for the handshake.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectAuth {
    /// Bearer or device token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Gateway password.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Signed answer to a `connect.challenge`, sent as `params.device`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChallengeResponse {
    /// Device id (hex SHA-256 of the public key).
    pub id: String,
    /// Base64url (unpadded) Ed25519 public key.
    #[serde(rename = "publicKey")]
    pub public_key: String,
    /// Base64url (unpadded) Ed25519 signature.
    pub signature: String,
    /// Signing time in milliseconds since the epoch.
    #[serde(rename = "signedAt")]
    pub signed_at: i64,
    /// Nonce from the challenge.
    pub nonce: String,
}

/// Params of the `connect` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectParams {
    /// Lowest protocol version accepted.
    #[serde(rename = "minProtocol")]
    pub min_protocol: u32,
    /// Highest protocol version accepted.
    #[serde(rename = "maxProtocol")]
    pub max_protocol: u32,
    /// Client descriptor.
    pub client: ClientInfo,
    /// Requested role.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Requested scopes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scopes: Option<Vec<String>>,
    /// Device assertion; omitted when signing failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<ChallengeResponse>,
    /// Shared-secret credentials.
    pub auth: ConnectAuth,
}

/// Gateway identity advertised in `hello-ok`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    /// Server version.
    #[serde(default)]
    pub version: String,
    /// Build commit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    /// Host name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// Connection id assigned by the server.
    #[serde(rename = "connId", default)]
    pub conn_id: String,
}

/// Advertised method and event names.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Features {
    /// RPC methods.
    #[serde(default)]
    pub methods: Vec<String>,
    /// Event names.
    #[serde(default)]
    pub events: Vec<String>,
}

/// Connection policy limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// Maximum frame size in bytes.
    #[serde(rename = "maxPayload")]
    pub max_payload: usize,
    /// Maximum buffered bytes before the server drops the client.
    #[serde(rename = "maxBufferedBytes")]
    pub max_buffered_bytes: usize,
    /// Heartbeat tick interval.
    #[serde(rename = "tickIntervalMs")]
    pub tick_interval_ms: u64,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            max_payload: 512 * 1024,
            max_buffered_bytes: 1536 * 1024,
            tick_interval_ms: 30_000,
        }
    }
}

/// Device token issued by the gateway after a device-authenticated handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloAuth {
    /// Token to present in later handshakes.
    #[serde(rename = "deviceToken")]
    pub device_token: String,
    /// Role the token is bound to.
    pub role: String,
    /// Granted scopes.
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// Session defaults extracted from `hello-ok.snapshot.sessionDefaults`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDefaults {
    /// Default agent id.
    #[serde(rename = "defaultAgentId", default, skip_serializing_if = "Option::is_none")]
    pub default_agent_id: Option<String>,
    /// Main key of the default agent.
    #[serde(rename = "mainKey", default, skip_serializing_if = "Option::is_none")]
    pub main_key: Option<String>,
    /// Fully qualified main session key.
    #[serde(rename = "mainSessionKey", default, skip_serializing_if = "Option::is_none")]
    pub main_session_key: Option<String>,
    /// Session scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl SessionDefaults {
    /// Extract session defaults from a `hello-ok` snapshot, if present.
    #[must_use]
    pub fn from_snapshot(snapshot: &Value) -> Option<Self> {
        snapshot
            .get("sessionDefaults")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

/// Successful handshake payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HelloOk {
    /// Negotiated protocol version.
    #[serde(default)]
    pub protocol: u32,
    /// Server identity.
    #[serde(default)]
    pub server: ServerInfo,
    /// Advertised features.
    #[serde(default)]
    pub features: Features,
    /// Opaque state snapshot.
    #[serde(default)]
    pub snapshot: Value,
    /// Policy limits.
    #[serde(default)]
    pub policy: Policy,
    /// Issued device token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<HelloAuth>,
}

impl HelloOk {
    /// Whether a response payload is a `hello-ok`.
    #[must_use]
    pub fn matches(payload: &Value) -> bool {
        payload.get("type").and_then(Value::as_str) == Some(HELLO_OK)
    }

    /// Parse a `hello-ok` payload, tolerating missing optional blocks.
    #[must_use]
    pub fn parse(payload: &Value) -> Self {
        serde_json::from_value(payload.clone()).unwrap_or_else(|e| {
            log::warn!("[Gateway] hello-ok payload did not parse cleanly: {}", e);
            Self {
                snapshot: payload.get("snapshot").cloned().unwrap_or(Value::Null),
                ..Self::default()
            }
        })
    }

    /// Session defaults advertised in the snapshot.
    #[must_use]
    pub fn session_defaults(&self) -> Option<SessionDefaults> {
        SessionDefaults::from_snapshot(&self.snapshot)
    }
}

// ── Events ───────────────────────────────────────────────────────────────────

/// Payload of the `agent` event: one step of a streamed agent turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStreamEvent {
    /// Run this event belongs to.
    #[serde(rename = "runId")]
    pub run_id: String,
    /// Per-run sequence number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    /// Stream name (`assistant`, `tool`, `lifecycle`, …).
    pub stream: String,
    /// Emission timestamp in milliseconds.
    #[serde(default)]
    pub ts: i64,
    /// Stream-specific data.
    #[serde(default)]
    pub data: Value,
    /// Session the run belongs to.
    #[serde(rename = "sessionKey", default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
}

/// Heartbeat payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TickEvent {
    /// Server time in milliseconds.
    #[serde(default)]
    pub ts: i64,
}

/// Shutdown notice payload.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ShutdownEvent {
    /// Why the gateway is going away.
    #[serde(default)]
    pub reason: String,
    /// Expected restart delay, if the gateway plans to come back.
    #[serde(rename = "restartExpectedMs", default, skip_serializing_if = "Option::is_none")]
    pub restart_expected_ms: Option<u64>,
}

/// Known event kinds, with a passthrough for everything else.
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    /// Agent turn stream step.
    Agent(AgentStreamEvent),
    /// Heartbeat.
    Tick(TickEvent),
    /// Gateway shutdown notice.
    Shutdown(ShutdownEvent),
    /// Presence update (opaque).
    Presence(Value),
    /// Any other event, forwarded unchanged.
    Other {
        /// Event name.
        name: String,
        /// Raw payload.
        payload: Option<Value>,
    },
}

/// An event as delivered to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayEvent {
    /// Per-connection sequence number.
    pub seq: Option<u64>,
    /// State versions carried by the frame.
    pub state_version: Option<StateVersion>,
    /// Parsed event.
    pub kind: EventKind,
}

impl GatewayEvent {
    /// Parse an event frame into its typed form. Known names whose payload does
    /// not match the expected shape fall back to [`EventKind::Other`].
    #[must_use]
    pub fn from_frame(frame: EventFrame) -> Self {
        let EventFrame {
            event,
            payload,
            seq,
            state_version,
        } = frame;

        let typed = match event.as_str() {
            AGENT_EVENT => parse_payload(payload.as_ref()).map(EventKind::Agent),
            TICK_EVENT => Some(EventKind::Tick(parse_payload(payload.as_ref()).unwrap_or_default())),
            SHUTDOWN_EVENT => parse_payload(payload.as_ref()).map(EventKind::Shutdown),
            PRESENCE_EVENT => Some(EventKind::Presence(payload.clone().unwrap_or(Value::Null))),
            _ => None,
        };

        let kind = typed.unwrap_or(EventKind::Other {
            name: event,
            payload,
        });

        Self {
            seq,
            state_version,
            kind,
        }
    }

    /// Wire name of the event.
    #[must_use]
    pub fn name(&self) -> &str {
        match &self.kind {
            EventKind::Agent(_) => AGENT_EVENT,
            EventKind::Tick(_) => TICK_EVENT,
            EventKind::Shutdown(_) => SHUTDOWN_EVENT,
            EventKind::Presence(_) => PRESENCE_EVENT,
            EventKind::Other { name, .. } => name,
        }
    }
}

fn parse_payload<T: serde::de::DeserializeOwned>(payload: Option<&Value>) -> Option<T> {
    payload.and_then(|p| serde_json::from_value(p.clone()).ok())
}
