//! Message-oriented socket transport.
//!
//! The connection manager talks to the gateway through three small traits so
//! the socket is replaceable: [`Connector`] opens a connection and returns a
//! ([`SocketWriter`], [`SocketReader`]) pair ready for independent use in a
//! writer task and a reader loop.
//!
//! [`WsConnector`] is the production implementation, a thin wrapper around
//! `tokio-tungstenite`. TLS (`wss://`) is negotiated by rustls with webpki
//! roots; this crate adds no transport security of its own.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite;

/// Concrete WebSocket stream type (avoids repeating the generic everywhere).
type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Received socket message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketMessage {
    /// UTF-8 text frame.
    Text(String),
    /// Binary frame (unused by the gateway protocol).
    Binary(Vec<u8>),
    /// Ping frame with payload; answered with a pong by the connection.
    Ping(Vec<u8>),
    /// Close frame with status code and reason.
    Close {
        /// WebSocket close code (1000 = normal, 1005 = no code).
        code: u16,
        /// Human-readable close reason.
        reason: String,
    },
}

/// Write half of an open socket.
#[async_trait]
pub trait SocketWriter: Send {
    /// Send a UTF-8 text frame.
    async fn send_text(&mut self, text: &str) -> Result<()>;

    /// Answer a ping.
    async fn send_pong(&mut self, _data: Vec<u8>) -> Result<()> {
        Ok(())
    }

    /// Close the socket with a status code and reason.
    async fn close(&mut self, code: u16, reason: &str) -> Result<()>;
}

/// Read half of an open socket.
#[async_trait]
pub trait SocketReader: Send {
    /// Receive the next message, returning `None` when the stream ends.
    async fn recv(&mut self) -> Option<Result<SocketMessage>>;
}

/// Opens socket connections.
#[async_trait]
pub trait Connector: Send + Sync + std::fmt::Debug {
    /// Open a connection to `url`.
    async fn open(&self, url: &str) -> Result<(Box<dyn SocketWriter>, Box<dyn SocketReader>)>;
}

// ── tokio-tungstenite implementation ─────────────────────────────────────────

/// Write half of a WebSocket connection.
pub struct WsWriter {
    sink: futures_util::stream::SplitSink<WsStream, tungstenite::Message>,
}

#[async_trait]
impl SocketWriter for WsWriter {
    async fn send_text(&mut self, text: &str) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Text(text.to_string()))
            .await
            .context("WebSocket send_text failed")
    }

    async fn send_pong(&mut self, data: Vec<u8>) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Pong(data))
            .await
            .context("WebSocket send_pong failed")
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<()> {
        use tungstenite::protocol::frame::{coding::CloseCode, CloseFrame};

        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        };
        // The peer may already be gone; flushing the close frame is best effort.
        let _ = self.sink.send(tungstenite::Message::Close(Some(frame))).await;
        self.sink.close().await.context("WebSocket close failed")
    }
}

/// Read half of a WebSocket connection.
pub struct WsReader {
    stream: futures_util::stream::SplitStream<WsStream>,
}

#[async_trait]
impl SocketReader for WsReader {
    async fn recv(&mut self) -> Option<Result<SocketMessage>> {
        loop {
            match self.stream.next().await {
                Some(Ok(tungstenite::Message::Text(text))) => {
                    return Some(Ok(SocketMessage::Text(text.to_string())));
                }
                Some(Ok(tungstenite::Message::Binary(data))) => {
                    return Some(Ok(SocketMessage::Binary(data.to_vec())));
                }
                Some(Ok(tungstenite::Message::Ping(data))) => {
                    return Some(Ok(SocketMessage::Ping(data.to_vec())));
                }
                Some(Ok(tungstenite::Message::Close(close_frame))) => {
                    let (code, reason) = close_frame
                        .map(|cf| (cf.code.into(), cf.reason.to_string()))
                        .unwrap_or((1005, String::new()));
                    return Some(Ok(SocketMessage::Close { code, reason }));
                }
                Some(Ok(tungstenite::Message::Pong(_) | tungstenite::Message::Frame(_))) => {
                    continue;
                }
                Some(Err(e)) => {
                    return Some(Err(anyhow::anyhow!("WebSocket read error: {e}")));
                }
                None => return None,
            }
        }
    }
}

/// Opens WebSocket connections with optional extra headers.
#[derive(Debug, Clone, Default)]
pub struct WsConnector {
    headers: Vec<(String, String)>,
}

impl WsConnector {
    /// Create a connector without extra headers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a header sent with every handshake (e.g. `Origin`).
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, url: &str) -> Result<(Box<dyn SocketWriter>, Box<dyn SocketReader>)> {
        use tungstenite::client::IntoClientRequest;

        let mut request = url
            .into_client_request()
            .with_context(|| format!("invalid WebSocket URL: {url}"))?;

        for (name, value) in &self.headers {
            let header_name = tungstenite::http::HeaderName::from_bytes(name.as_bytes())
                .with_context(|| format!("invalid header name: {name}"))?;
            let header_value = tungstenite::http::HeaderValue::from_str(value)
                .with_context(|| format!("invalid header value for {name}"))?;
            request.headers_mut().insert(header_name, header_value);
        }

        let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .context("WebSocket connect failed")?;

        let (sink, stream) = ws_stream.split();

        Ok((Box::new(WsWriter { sink }), Box::new(WsReader { stream })))
    }
}

/// Convert an HTTP(S) URL to WS(S) scheme.
///
/// Passes `ws://` and `wss://` through unchanged.
#[must_use]
pub fn http_to_ws_scheme(url: &str) -> String {
    if url.starts_with("wss://") || url.starts_with("ws://") {
        url.to_string()
    } else if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_string()
    }
}
