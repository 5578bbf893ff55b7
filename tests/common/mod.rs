//! In-memory gateway used by the integration tests.
//!
//! [`MockConnector`] hands the client a channel-backed socket and gives the
//! test the other end as a [`ServerConn`], so a test can script the gateway
//! side of the protocol frame by frame.

#![allow(dead_code, reason = "shared by several test binaries")]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use gatelink::protocol::{self, ClientInfo, Frame, RequestFrame};
use gatelink::transport::{Connector, SocketMessage, SocketReader, SocketWriter};
use gatelink::{ConnectionManager, DeviceIdentity, ManagerConfig};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Upper bound for any single wait in a test.
pub const WAIT: Duration = Duration::from_secs(120);

/// What the client wrote to the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    Text(String),
    Close { code: u16, reason: String },
}

#[derive(Debug)]
pub struct MockConnector {
    fail: AtomicBool,
    opens: Mutex<Vec<Instant>>,
    accepted: mpsc::UnboundedSender<ServerConn>,
}

impl MockConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerConn>) {
        let (accepted, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            fail: AtomicBool::new(false),
            opens: Mutex::new(Vec::new()),
            accepted,
        });
        (connector, rx)
    }

    /// Make every following open fail (or succeed again).
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Times at which the client tried to open a socket.
    pub fn opens(&self) -> Vec<Instant> {
        self.opens.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, _url: &str) -> anyhow::Result<(Box<dyn SocketWriter>, Box<dyn SocketReader>)> {
        self.opens.lock().unwrap().push(Instant::now());
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("connection refused");
        }

        let (to_client, client_rx) = mpsc::unbounded_channel();
        let (client_tx, from_client) = mpsc::unbounded_channel();
        self.accepted
            .send(ServerConn {
                to_client,
                from_client,
            })
            .map_err(|_| anyhow::anyhow!("test dropped the accept queue"))?;

        Ok((
            Box::new(MockWriter { tx: client_tx }),
            Box::new(MockReader { rx: client_rx }),
        ))
    }
}

struct MockWriter {
    tx: mpsc::UnboundedSender<Sent>,
}

#[async_trait]
impl SocketWriter for MockWriter {
    async fn send_text(&mut self, text: &str) -> anyhow::Result<()> {
        self.tx
            .send(Sent::Text(text.to_string()))
            .map_err(|_| anyhow::anyhow!("server gone"))
    }

    async fn close(&mut self, code: u16, reason: &str) -> anyhow::Result<()> {
        let _ = self.tx.send(Sent::Close {
            code,
            reason: reason.to_string(),
        });
        Ok(())
    }
}

struct MockReader {
    rx: mpsc::UnboundedReceiver<SocketMessage>,
}

#[async_trait]
impl SocketReader for MockReader {
    async fn recv(&mut self) -> Option<anyhow::Result<SocketMessage>> {
        self.rx.recv().await.map(Ok)
    }
}

/// Gateway side of one accepted connection. Dropping it ends the client's
/// read stream.
#[derive(Debug)]
pub struct ServerConn {
    to_client: mpsc::UnboundedSender<SocketMessage>,
    from_client: mpsc::UnboundedReceiver<Sent>,
}

impl ServerConn {
    /// Next frame written by the client. Panics on close.
    pub async fn next_frame(&mut self) -> Frame {
        match tokio::time::timeout(WAIT, self.from_client.recv()).await {
            Ok(Some(Sent::Text(text))) => protocol::decode(&text).expect("client sent a valid frame"),
            Ok(Some(Sent::Close { code, reason })) => panic!("client closed ({code} {reason})"),
            Ok(None) => panic!("client writer gone"),
            Err(_) => panic!("no frame from client"),
        }
    }

    /// Next request written by the client.
    pub async fn next_request(&mut self) -> RequestFrame {
        match self.next_frame().await {
            Frame::Req(req) => req,
            other => panic!("expected a request, got {other:?}"),
        }
    }

    /// Wait for the client to close; returns the close code, or `None` when
    /// the writer went away without one.
    pub async fn closed(&mut self) -> Option<u16> {
        loop {
            match tokio::time::timeout(WAIT, self.from_client.recv()).await {
                Ok(Some(Sent::Text(_))) => {}
                Ok(Some(Sent::Close { code, .. })) => return Some(code),
                Ok(None) => return None,
                Err(_) => panic!("client never closed"),
            }
        }
    }

    pub fn send(&self, frame: &Frame) {
        let text = protocol::encode(frame).unwrap();
        let _ = self.to_client.send(SocketMessage::Text(text));
    }

    pub fn send_raw(&self, message: SocketMessage) {
        let _ = self.to_client.send(message);
    }

    pub fn reply(&self, req: &RequestFrame, payload: Value) {
        self.send(&Frame::ok(req.id.as_str(), payload));
    }

    pub fn event(&self, name: &str, payload: Value, seq: Option<u64>) {
        self.send(&Frame::event(name, payload, seq));
    }

    pub fn challenge(&self, nonce: &str) {
        self.event(
            protocol::CHALLENGE_EVENT,
            json!({ "nonce": nonce, "ts": 1_700_000_000_000_i64 }),
            None,
        );
    }

    /// Challenge, read the connect request and answer with `payload`.
    pub async fn handshake_with(&mut self, payload: Value) -> RequestFrame {
        self.challenge("nonce-1");
        let req = self.next_request().await;
        assert_eq!(req.method, "connect");
        self.reply(&req, payload);
        req
    }

    /// Complete the handshake with a plain `hello-ok`.
    pub async fn handshake(&mut self) -> RequestFrame {
        self.handshake_with(hello_ok()).await
    }
}

pub fn hello_ok() -> Value {
    json!({
        "type": "hello-ok",
        "protocol": 3,
        "server": { "version": "test", "connId": "conn-1" },
        "features": { "methods": ["chat.send", "chat.history", "chat.abort"], "events": ["agent", "tick"] },
        "snapshot": { "sessionDefaults": { "defaultAgentId": "main", "mainSessionKey": "agent:main:main" } },
        "policy": { "maxPayload": 524_288, "maxBufferedBytes": 1_572_864, "tickIntervalMs": 30_000 }
    })
}

pub fn client_info() -> ClientInfo {
    ClientInfo {
        id: "gatelink-test".into(),
        version: "0.0.0".into(),
        platform: "test".into(),
        mode: "cli".into(),
        display_name: None,
        instance_id: None,
    }
}

pub fn config() -> ManagerConfig {
    let mut config = ManagerConfig::new("ws://gateway.test", client_info());
    config.scopes = vec!["operator.read".into(), "operator.write".into()];
    config
}

pub fn manager(
    connector: &Arc<MockConnector>,
    identity: Option<Arc<DeviceIdentity>>,
) -> ConnectionManager {
    ConnectionManager::new(config(), Arc::clone(connector) as Arc<dyn Connector>, identity)
}

/// Next connection the client opens.
pub async fn accept(accepted: &mut mpsc::UnboundedReceiver<ServerConn>) -> ServerConn {
    tokio::time::timeout(WAIT, accepted.recv())
        .await
        .expect("client never connected")
        .expect("connector dropped")
}

/// Connected manager plus the gateway end of its connection.
pub async fn connected(
    connector: &Arc<MockConnector>,
    accepted: &mut mpsc::UnboundedReceiver<ServerConn>,
    identity: Option<Arc<DeviceIdentity>>,
) -> (ConnectionManager, ServerConn) {
    let manager = manager(connector, identity);
    manager.connect();
    let mut conn = accept(accepted).await;
    conn.handshake().await;
    assert!(
        manager
            .wait_for_state(gatelink::ConnectionState::Connected, WAIT)
            .await
    );
    (manager, conn)
}

/// Round-trip one request so every frame sent before it has been processed.
pub async fn flush(manager: &ConnectionManager, conn: &mut ServerConn) {
    let pending = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.request("sync", None).await })
    };
    let req = conn.next_request().await;
    assert_eq!(req.method, "sync");
    conn.reply(&req, json!({}));
    pending.await.unwrap().unwrap();
}
