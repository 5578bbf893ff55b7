//! Gatelink - client protocol engine for agent gateways.
//!
//! This crate connects a control surface (CLI, TUI, desktop shell) to an agent
//! gateway over one persistent WebSocket and keeps everything above it thin.
//!
//! # Architecture
//!
//! ```text
//!   ChatSession ──────────────┐
//!     │  TurnAssembler        │ agent events        ┌───────────────────┐
//!     │  OutboundQueue  ──────┼── request() ───────►│ ConnectionManager │──► Connector (WebSocket)
//!     │                       │◄── on_event() ──────│                   │
//!     └───────────────────────┘                     └─────────┬─────────┘
//!                                                             │ sign_challenge()
//!                                                     DeviceIdentity ──► Store
//! ```
//!
//! # Modules
//!
//! - [`protocol`] - Wire frames, handshake payloads and typed events
//! - [`transport`] - Socket seam and the `tokio-tungstenite` connector
//! - [`device`] - Ed25519 device identity and device tokens
//! - [`connection`] - Connection state machine, RPC and event fan-out
//! - [`assembler`] - Streamed agent turns folded into messages
//! - [`queue`] - Per-session outbound FIFO
//! - [`session`] - Glue for one conversation
//! - [`store`] - Durable key/value storage
//! - [`config`] - Configuration loading/saving

pub mod assembler;
pub mod config;
pub mod connection;
pub mod device;
pub mod error;
pub mod observers;
pub mod protocol;
pub mod queue;
pub mod session;
pub mod store;
pub mod transport;

// Re-export commonly used types
pub use assembler::{MessageSnapshot, ToolCallRecord, ToolStatus, TurnAssembler, TurnCompletion, TurnOutcome};
pub use config::GatewayConfig;
pub use connection::{ConnectionManager, ConnectionState, GatewayRpc, ManagerConfig};
pub use device::{Device, DeviceIdentity, HandshakeClaims};
pub use error::GatewayError;
pub use observers::Subscription;
pub use protocol::{EventKind, GatewayEvent, HelloOk};
pub use queue::{EnqueueOutcome, OutboundQueue, QueuedMessage};
pub use session::{ChatSession, Transcript};
pub use store::{FileStore, KeyringStore, MemoryStore, Store, StoreError};
pub use transport::{Connector, WsConnector};
