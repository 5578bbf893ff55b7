//! Error taxonomy for the gateway client.
//!
//! Every public operation of the library returns [`GatewayError`]. Transport
//! failures never surface here directly: they are recovered by the reconnect
//! loop and only show up as [`GatewayError::ConnectionClosed`] on requests that
//! were in flight when the socket dropped.

use std::time::Duration;

use crate::protocol::ErrorShape;
use crate::store::StoreError;

/// Errors returned by the gateway client.
#[derive(Debug)]
pub enum GatewayError {
    /// A request was attempted while the connection was not `Connected`.
    NotConnected,
    /// No response arrived before the request deadline.
    RequestTimeout {
        /// RPC method of the timed-out request.
        method: String,
        /// Deadline that elapsed.
        timeout: Duration,
    },
    /// The transport dropped or `disconnect()` was called while the request
    /// was outstanding.
    ConnectionClosed,
    /// A frame could not be encoded or decoded.
    Protocol(String),
    /// The gateway answered `ok: false`.
    Remote(ErrorShape),
    /// The device signing identity could not be loaded, created or used.
    DeviceIdentityUnavailable(String),
    /// Durable local state could not be read or written.
    Storage(StoreError),
}

impl GatewayError {
    /// Returns the remote error shape when the gateway rejected the request.
    #[must_use]
    pub fn remote(&self) -> Option<&ErrorShape> {
        match self {
            Self::Remote(shape) => Some(shape),
            _ => None,
        }
    }

    /// Whether retrying the same call later can reasonably succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NotConnected | Self::RequestTimeout { .. } | Self::ConnectionClosed => true,
            Self::Remote(shape) => shape.retryable.unwrap_or(false),
            Self::Protocol(_) | Self::DeviceIdentityUnavailable(_) | Self::Storage(_) => false,
        }
    }
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotConnected => write!(f, "Gateway not connected"),
            Self::RequestTimeout { method, timeout } => {
                write!(f, "Request '{method}' timed out after {}ms", timeout.as_millis())
            }
            Self::ConnectionClosed => write!(f, "Gateway connection closed"),
            Self::Protocol(msg) => write!(f, "Protocol error: {msg}"),
            Self::Remote(shape) => write!(f, "{}: {}", shape.code, shape.message),
            Self::DeviceIdentityUnavailable(msg) => {
                write!(f, "Device identity unavailable: {msg}")
            }
            Self::Storage(err) => write!(f, "Storage error: {err}"),
        }
    }
}

impl std::error::Error for GatewayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Storage(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StoreError> for GatewayError {
    fn from(err: StoreError) -> Self {
        Self::Storage(err)
    }
}
