//! One conversation bound to a connection.
//!
//! [`ChatSession`] wires a [`TurnAssembler`] and an [`OutboundQueue`] for one
//! session key onto a shared [`ConnectionManager`]: agent events feed the
//! assembler, assembler completions advance the queue, and a reconnect
//! resumes any messages left in the queue. A turn still running when the
//! connection drops is failed locally, since its end event will never come.

use std::sync::{Arc, Mutex, PoisonError};

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::assembler::{MessageSnapshot, TurnAssembler};
use crate::connection::{ConnectionManager, ConnectionState, GatewayRpc};
use crate::error::GatewayError;
use crate::observers::Subscription;
use crate::protocol::EventKind;
use crate::queue::{EnqueueOutcome, OutboundQueue, QueuedMessage};
use crate::store::Store;

/// RPC returning the stored transcript of a session.
pub const CHAT_HISTORY_METHOD: &str = "chat.history";

/// History, queued messages and the live turn of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct Transcript {
    /// Messages returned by `chat.history`, oldest first.
    pub history: Vec<Value>,
    /// Message currently streaming, if any.
    pub streaming: Option<MessageSnapshot>,
    /// Messages not yet sent, in send order.
    pub queued: Vec<QueuedMessage>,
}

#[derive(Debug, Deserialize)]
struct HistoryPayload {
    #[serde(default)]
    messages: Vec<Value>,
}

/// Chat state for one session key.
pub struct ChatSession {
    session_key: String,
    manager: ConnectionManager,
    assembler: Arc<Mutex<TurnAssembler>>,
    queue: Arc<OutboundQueue>,
    subscriptions: Vec<Subscription>,
    completion_task: JoinHandle<()>,
}

impl std::fmt::Debug for ChatSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatSession")
            .field("session_key", &self.session_key)
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

impl ChatSession {
    /// Attach to `session_key`.
    ///
    /// Returns the session and a receiver of assistant message snapshots.
    /// A persisted queue is restored and drained once the connection is up.
    /// Must be called inside a Tokio runtime.
    pub fn attach(
        manager: &ConnectionManager,
        store: Arc<dyn Store>,
        session_key: impl Into<String>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<MessageSnapshot>), GatewayError> {
        let session_key = session_key.into();
        let rpc: Arc<dyn GatewayRpc> = Arc::new(manager.clone());
        let queue = Arc::new(OutboundQueue::attach(session_key.as_str(), rpc, store)?);

        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = mpsc::unbounded_channel();
        let assembler = Arc::new(Mutex::new(
            TurnAssembler::new(session_key.as_str()).with_completion_signal(completion_tx),
        ));

        let completion_task = tokio::spawn(Arc::clone(&queue).run_completions(completion_rx));

        let events = {
            let assembler = Arc::clone(&assembler);
            let snapshot_tx = snapshot_tx.clone();
            manager.on_event(move |event| {
                let EventKind::Agent(agent) = &event.kind else {
                    return;
                };
                let (superseded, snapshot) = {
                    let mut assembler = assembler.lock().unwrap_or_else(PoisonError::into_inner);
                    let snapshot = assembler.apply(agent);
                    (assembler.take_superseded(), snapshot)
                };
                for snapshot in superseded.into_iter().chain(snapshot) {
                    let _ = snapshot_tx.send(snapshot);
                }
            })
        };

        let reconnects = {
            let queue = Arc::clone(&queue);
            let assembler = Arc::clone(&assembler);
            manager.on_state_change(move |state| match state {
                ConnectionState::Connected => spawn_resume(Arc::clone(&queue)),
                ConnectionState::Disconnected => interrupt_turn(&queue, &assembler, &snapshot_tx),
                _ => {}
            })
        };

        if manager.state() == ConnectionState::Connected {
            spawn_resume(Arc::clone(&queue));
        }

        log::info!("[Session] Attached to {}", session_key);

        Ok((
            Self {
                session_key,
                manager: manager.clone(),
                assembler,
                queue,
                subscriptions: vec![events, reconnects],
                completion_task,
            },
            snapshot_rx,
        ))
    }

    /// Session key.
    #[must_use]
    pub fn session_key(&self) -> &str {
        &self.session_key
    }

    /// Send a message, or queue it behind the running turn.
    pub async fn send(&self, text: impl Into<String>) -> Result<EnqueueOutcome, GatewayError> {
        self.queue.enqueue(text).await
    }

    /// Drop a queued message before it is sent.
    pub fn cancel(&self, message_id: &str) -> Result<bool, GatewayError> {
        self.queue.cancel(message_id)
    }

    /// Ask the gateway to stop the running turn.
    pub async fn abort(&self) -> Result<bool, GatewayError> {
        self.queue.abort().await
    }

    /// Messages waiting to be sent.
    #[must_use]
    pub fn queued(&self) -> Vec<QueuedMessage> {
        self.queue.pending()
    }

    /// Snapshot of the turn currently streaming.
    #[must_use]
    pub fn streaming(&self) -> Option<MessageSnapshot> {
        self.assembler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .current()
    }

    /// Fetch stored history through `chat.history`.
    pub async fn history(&self, limit: Option<u32>) -> Result<Vec<Value>, GatewayError> {
        let mut params = json!({ "sessionKey": self.session_key });
        if let Some(limit) = limit {
            params["limit"] = json!(limit);
        }
        let payload: HistoryPayload = self
            .manager
            .request_as(CHAT_HISTORY_METHOD, Some(params))
            .await?;
        Ok(payload.messages)
    }

    /// History followed by the live turn and the queued messages.
    pub async fn transcript(&self, limit: Option<u32>) -> Result<Transcript, GatewayError> {
        let history = self.history(limit).await?;
        Ok(Transcript {
            history,
            streaming: self.streaming(),
            queued: self.queued(),
        })
    }

    /// Stop observing the connection. Queued messages stay persisted.
    pub fn detach(mut self) {
        for subscription in &mut self.subscriptions {
            subscription.unsubscribe();
        }
        self.completion_task.abort();
        log::info!("[Session] Detached from {}", self.session_key);
    }
}

/// Fail the accepted in-flight turn after the connection dropped. Its
/// completion releases the queue, which sends the next message once the
/// connection is back. A turn whose `chat.send` is still pending is left to
/// that request's failure, which puts the message back in the queue.
fn interrupt_turn(
    queue: &OutboundQueue,
    assembler: &Mutex<TurnAssembler>,
    snapshot_tx: &mpsc::UnboundedSender<MessageSnapshot>,
) {
    let Some(run_id) = queue.in_flight().and_then(|turn| turn.run_id) else {
        return;
    };
    let snapshot = assembler
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .interrupt(&run_id, "connection lost");
    if let Some(snapshot) = snapshot {
        let _ = snapshot_tx.send(snapshot);
    }
}

fn spawn_resume(queue: Arc<OutboundQueue>) {
    tokio::spawn(async move {
        match queue.resume().await {
            Ok(Some(dispatched)) => log::info!(
                "[Session] Resumed queue for {} with message {}",
                queue.session_key(),
                dispatched.message.id
            ),
            Ok(None) => {}
            Err(e) => log::warn!("[Session] Failed to resume queue for {}: {}", queue.session_key(), e),
        }
    });
}
