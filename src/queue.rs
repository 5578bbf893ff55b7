//! Per-session outbound message queue.
//!
//! At most one chat turn is in flight per session. Messages submitted while a
//! turn is running wait in a FIFO that is persisted on every mutation, so a
//! restart or session re-attach picks up where it left off. The queue only
//! advances on a [`TurnCompletion`] for the in-flight run (raised by the
//! [`TurnAssembler`](crate::assembler::TurnAssembler)); aborting a run does not
//! advance it.
//!
//! Each message's id doubles as its `idempotencyKey`, so a message replayed
//! after a crash is recognizable server-side.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::assembler::TurnCompletion;
use crate::connection::GatewayRpc;
use crate::error::GatewayError;
use crate::store::{Store, StoreError};

/// RPC that starts a chat turn.
pub const CHAT_SEND_METHOD: &str = "chat.send";

/// RPC that aborts a running chat turn.
pub const CHAT_ABORT_METHOD: &str = "chat.abort";

/// Completions remembered while a `chat.send` response is still outstanding.
const EARLY_COMPLETIONS_CAPACITY: usize = 16;

/// Message waiting to be sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedMessage {
    /// Message id, also used as the idempotency key.
    pub id: String,
    /// Message text.
    pub text: String,
    /// Enqueue time in milliseconds since the epoch.
    #[serde(rename = "enqueuedAt")]
    pub enqueued_at: i64,
}

impl QueuedMessage {
    fn new(text: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            text: text.into(),
            enqueued_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Result of [`OutboundQueue::enqueue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Sent right away.
    Dispatched {
        /// Id of the message.
        message_id: String,
        /// Run id reported by the gateway.
        run_id: Option<String>,
    },
    /// Waiting behind the in-flight turn.
    Queued {
        /// Id of the message.
        message_id: String,
        /// 1-based position in the queue.
        position: usize,
    },
}

/// The turn currently running for this session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlightTurn {
    /// Message that started the turn.
    pub message_id: String,
    /// Run id, once the `chat.send` response arrived. Falls back to the
    /// message id when the response carried none.
    pub run_id: Option<String>,
}

impl InFlightTurn {
    fn matches(&self, run_id: &str) -> bool {
        self.message_id == run_id || self.run_id.as_deref() == Some(run_id)
    }
}

/// A message handed to the gateway by [`OutboundQueue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatched {
    /// The message that was sent.
    pub message: QueuedMessage,
    /// Run id reported by the gateway.
    pub run_id: Option<String>,
}

#[derive(Debug, Default)]
struct QueueState {
    entries: VecDeque<QueuedMessage>,
    in_flight: Option<InFlightTurn>,
    early_completions: VecDeque<String>,
}

/// FIFO of outbound chat messages for one session.
pub struct OutboundQueue {
    session_key: String,
    rpc: Arc<dyn GatewayRpc>,
    store: Arc<dyn Store>,
    state: Mutex<QueueState>,
}

impl std::fmt::Debug for OutboundQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundQueue")
            .field("session_key", &self.session_key)
            .field("state", &*self.lock())
            .finish_non_exhaustive()
    }
}

fn storage_key(session_key: &str) -> String {
    format!("queue/{session_key}")
}

impl OutboundQueue {
    /// Bind a queue to `session_key`, restoring any persisted entries.
    ///
    /// Restored entries are not sent until [`Self::resume`] is called.
    pub fn attach(
        session_key: impl Into<String>,
        rpc: Arc<dyn GatewayRpc>,
        store: Arc<dyn Store>,
    ) -> Result<Self, GatewayError> {
        let session_key = session_key.into();
        let entries = match store.load(&storage_key(&session_key))? {
            Some(content) => serde_json::from_str::<VecDeque<QueuedMessage>>(&content).map_err(|e| {
                StoreError::Corrupted(format!("queue for session {session_key}: {e}"))
            })?,
            None => VecDeque::new(),
        };

        if !entries.is_empty() {
            log::info!(
                "[Queue] Restored {} queued message(s) for session {}",
                entries.len(),
                session_key
            );
        }

        Ok(Self {
            session_key,
            rpc,
            store,
            state: Mutex::new(QueueState {
                entries,
                ..QueueState::default()
            }),
        })
    }

    /// Session this queue belongs to.
    #[must_use]
    pub fn session_key(&self) -> &str {
        &self.session_key
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, entries: &VecDeque<QueuedMessage>) -> Result<(), GatewayError> {
        let key = storage_key(&self.session_key);
        if entries.is_empty() {
            self.store.remove(&key)?;
        } else {
            let content = serde_json::to_string(entries)
                .map_err(|e| GatewayError::Protocol(format!("failed to serialize queue: {e}")))?;
            self.store.save(&key, &content)?;
        }
        Ok(())
    }

    fn persist_or_warn(&self, entries: &VecDeque<QueuedMessage>) {
        if let Err(e) = self.persist(entries) {
            log::warn!("[Queue] Failed to persist queue for {}: {}", self.session_key, e);
        }
    }

    /// Submit a message. Sent immediately when nothing is in flight and the
    /// queue is empty, otherwise queued behind the running turn.
    pub async fn enqueue(&self, text: impl Into<String>) -> Result<EnqueueOutcome, GatewayError> {
        let message = QueuedMessage::new(text);
        let message_id = message.id.clone();
        {
            let mut state = self.lock();
            state.entries.push_back(message);
            if let Err(e) = self.persist(&state.entries) {
                state.entries.pop_back();
                return Err(e);
            }
        }

        match self.advance().await {
            Ok(Some(dispatched)) if dispatched.message.id == message_id => {
                return Ok(EnqueueOutcome::Dispatched {
                    message_id,
                    run_id: dispatched.run_id,
                });
            }
            Ok(_) => {}
            Err(e) => {
                // Our own send failed: withdraw it so an error means "not accepted".
                if self.withdraw_front(&message_id) {
                    return Err(e);
                }
                log::warn!("[Queue] Dispatch of an earlier message failed: {}", e);
            }
        }

        let position = self
            .lock()
            .entries
            .iter()
            .position(|m| m.id == message_id)
            .map_or(0, |i| i + 1);
        log::debug!("[Queue] Queued message {} at position {}", message_id, position);
        Ok(EnqueueOutcome::Queued {
            message_id,
            position,
        })
    }

    /// Handle the end of a turn. Completions for runs other than the in-flight
    /// one are ignored. Returns the next dispatched message, if any.
    pub async fn on_turn_complete(
        &self,
        completion: TurnCompletion,
    ) -> Result<Option<Dispatched>, GatewayError> {
        {
            let mut state = self.lock();
            match &state.in_flight {
                Some(turn) if turn.matches(&completion.run_id) => {
                    log::debug!(
                        "[Queue] Turn {} finished ({:?})",
                        completion.run_id,
                        completion.outcome
                    );
                    state.in_flight = None;
                }
                Some(turn) if turn.run_id.is_none() => {
                    // chat.send has not answered yet; the run id may be this one.
                    if state.early_completions.len() >= EARLY_COMPLETIONS_CAPACITY {
                        state.early_completions.pop_front();
                    }
                    state.early_completions.push_back(completion.run_id);
                    return Ok(None);
                }
                _ => {
                    log::trace!("[Queue] Ignoring completion for run {}", completion.run_id);
                    return Ok(None);
                }
            }
        }
        self.advance().await
    }

    /// Dispatch the front entry if nothing is in flight.
    pub async fn resume(&self) -> Result<Option<Dispatched>, GatewayError> {
        self.advance().await
    }

    /// Remove a message that has not been sent yet. Returns `false` when the
    /// id is unknown or the message was already dispatched.
    pub fn cancel(&self, message_id: &str) -> Result<bool, GatewayError> {
        let mut state = self.lock();
        let Some(index) = state.entries.iter().position(|m| m.id == message_id) else {
            return Ok(false);
        };
        let Some(removed) = state.entries.remove(index) else {
            return Ok(false);
        };
        if let Err(e) = self.persist(&state.entries) {
            state.entries.insert(index, removed);
            return Err(e);
        }
        log::info!("[Queue] Cancelled queued message {}", message_id);
        Ok(true)
    }

    /// Ask the gateway to stop the in-flight turn. Best effort: the queue
    /// still advances only when the turn's completion arrives.
    ///
    /// Returns `false` when nothing is in flight.
    pub async fn abort(&self) -> Result<bool, GatewayError> {
        let Some(turn) = self.lock().in_flight.clone() else {
            return Ok(false);
        };
        let run_id = turn.run_id.unwrap_or(turn.message_id);
        let params = json!({
            "sessionKey": self.session_key,
            "runId": run_id,
        });

        match self.rpc.request(CHAT_ABORT_METHOD, Some(params)).await {
            Ok(_) => {
                log::info!("[Queue] Requested abort of run {}", run_id);
                Ok(true)
            }
            Err(e) => {
                log::warn!("[Queue] Abort of run {} failed: {}", run_id, e);
                Err(e)
            }
        }
    }

    /// Messages waiting to be sent, in order.
    #[must_use]
    pub fn pending(&self) -> Vec<QueuedMessage> {
        self.lock().entries.iter().cloned().collect()
    }

    /// The turn currently running, if any.
    #[must_use]
    pub fn in_flight(&self) -> Option<InFlightTurn> {
        self.lock().in_flight.clone()
    }

    /// Feed completions from `rx` into [`Self::on_turn_complete`] until the
    /// channel closes.
    pub async fn run_completions(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<TurnCompletion>) {
        while let Some(completion) = rx.recv().await {
            if let Err(e) = self.on_turn_complete(completion).await {
                log::warn!("[Queue] Failed to advance queue for {}: {}", self.session_key, e);
            }
        }
        log::debug!("[Queue] Completion channel closed for {}", self.session_key);
    }

    /// Send queued messages until one stays in flight. Returns the first
    /// message dispatched.
    async fn advance(&self) -> Result<Option<Dispatched>, GatewayError> {
        let mut first = None;
        loop {
            let Some(message) = self.begin_next() else {
                return Ok(first);
            };

            match self.send(&message).await {
                Ok(run_id) => {
                    let finished = self.record_run_id(&message.id, run_id.as_deref());
                    first.get_or_insert(Dispatched { message, run_id });
                    if !finished {
                        return Ok(first);
                    }
                }
                Err(e) => {
                    self.restore(message);
                    return match first {
                        Some(dispatched) => {
                            log::warn!("[Queue] Dispatch failed, message kept at front: {}", e);
                            Ok(Some(dispatched))
                        }
                        None => Err(e),
                    };
                }
            }
        }
    }

    /// Pop the front entry and mark it in flight.
    fn begin_next(&self) -> Option<QueuedMessage> {
        let mut state = self.lock();
        if state.in_flight.is_some() {
            return None;
        }
        let message = state.entries.pop_front()?;
        state.in_flight = Some(InFlightTurn {
            message_id: message.id.clone(),
            run_id: None,
        });
        self.persist_or_warn(&state.entries);
        Some(message)
    }

    async fn send(&self, message: &QueuedMessage) -> Result<Option<String>, GatewayError> {
        let params = json!({
            "sessionKey": self.session_key,
            "message": message.text,
            "deliver": false,
            "idempotencyKey": message.id,
        });
        log::debug!("[Queue] Dispatching message {}", message.id);
        let payload = self.rpc.request(CHAT_SEND_METHOD, Some(params)).await?;
        Ok(payload
            .get("runId")
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    /// Store the run id of the in-flight turn. Returns `true` when its
    /// completion already arrived, in which case nothing is in flight anymore.
    fn record_run_id(&self, message_id: &str, run_id: Option<&str>) -> bool {
        let mut state = self.lock();
        let QueueState {
            in_flight,
            early_completions,
            ..
        } = &mut *state;

        let Some(turn) = in_flight.as_mut().filter(|t| t.message_id == message_id) else {
            return false;
        };
        // Without a reported run id the gateway runs the turn under the idempotency key.
        turn.run_id = Some(run_id.unwrap_or(message_id).to_string());

        let completed = early_completions.iter().position(|r| turn.matches(r));
        early_completions.clear();
        match completed {
            Some(_) => {
                log::debug!("[Queue] Turn for {} finished before chat.send returned", message_id);
                *in_flight = None;
                true
            }
            None => false,
        }
    }

    /// Put a message whose dispatch failed back at the front.
    /// Drop `message_id` if it sits at the front after a failed dispatch.
    fn withdraw_front(&self, message_id: &str) -> bool {
        let mut state = self.lock();
        if !state.entries.front().is_some_and(|m| m.id == message_id) {
            return false;
        }
        state.entries.pop_front();
        self.persist_or_warn(&state.entries);
        log::debug!("[Queue] Withdrew message {} after failed dispatch", message_id);
        true
    }

    fn restore(&self, message: QueuedMessage) {
        let mut state = self.lock();
        if state
            .in_flight
            .as_ref()
            .is_some_and(|t| t.message_id == message.id)
        {
            state.in_flight = None;
        }
        state.entries.push_front(message);
        self.persist_or_warn(&state.entries);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::TurnOutcome;
    use crate::protocol::ErrorShape;
    use crate::store::MemoryStore;
    use async_trait::async_trait;

    #[derive(Default)]
    struct MockRpc {
        calls: Mutex<Vec<(String, Value)>>,
        failures: Mutex<u32>,
    }

    impl MockRpc {
        fn fail_next(&self, n: u32) {
            *self.failures.lock().unwrap() = n;
        }

        fn sent_messages(&self) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(m, _)| m == CHAT_SEND_METHOD)
                .map(|(_, p)| p["message"].as_str().unwrap().to_string())
                .collect()
        }

        fn last_call(&self) -> (String, Value) {
            self.calls.lock().unwrap().last().cloned().unwrap()
        }
    }

    #[async_trait]
    impl GatewayRpc for MockRpc {
        async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, GatewayError> {
            {
                let mut failures = self.failures.lock().unwrap();
                if *failures > 0 {
                    *failures -= 1;
                    return Err(GatewayError::Remote(ErrorShape::new("UNAVAILABLE", "try later")));
                }
            }
            let mut calls = self.calls.lock().unwrap();
            calls.push((method.to_string(), params.unwrap_or(Value::Null)));
            Ok(json!({ "runId": format!("run-{}", calls.len()), "status": "started" }))
        }
    }

    fn queue_with(rpc: &Arc<MockRpc>, store: &Arc<MemoryStore>) -> OutboundQueue {
        let rpc: Arc<dyn GatewayRpc> = Arc::clone(rpc) as Arc<dyn GatewayRpc>;
        let store: Arc<dyn Store> = Arc::clone(store) as Arc<dyn Store>;
        OutboundQueue::attach("main", rpc, store).unwrap()
    }

    fn done(run_id: &str) -> TurnCompletion {
        TurnCompletion {
            run_id: run_id.to_string(),
            outcome: TurnOutcome::Done,
        }
    }

    fn persisted(store: &MemoryStore) -> Vec<QueuedMessage> {
        store
            .load("queue/main")
            .unwrap()
            .map(|c| serde_json::from_str(&c).unwrap())
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn test_enqueue_when_idle_dispatches_immediately() {
        let rpc = Arc::new(MockRpc::default());
        let store = Arc::new(MemoryStore::new());
        let queue = queue_with(&rpc, &store);

        let outcome = queue.enqueue("hello").await.unwrap();
        let EnqueueOutcome::Dispatched { message_id, run_id } = outcome else {
            panic!("expected dispatch, got {outcome:?}");
        };
        assert_eq!(run_id.as_deref(), Some("run-1"));

        let (method, params) = rpc.last_call();
        assert_eq!(method, CHAT_SEND_METHOD);
        assert_eq!(params["sessionKey"], "main");
        assert_eq!(params["message"], "hello");
        assert_eq!(params["deliver"], false);
        assert_eq!(params["idempotencyKey"], message_id.as_str());
        assert!(persisted(&store).is_empty());
    }

    #[tokio::test]
    async fn test_messages_dispatch_in_order_one_at_a_time() {
        let rpc = Arc::new(MockRpc::default());
        let store = Arc::new(MemoryStore::new());
        let queue = queue_with(&rpc, &store);

        queue.enqueue("A").await.unwrap();
        let b = queue.enqueue("B").await.unwrap();
        let c = queue.enqueue("C").await.unwrap();
        assert!(matches!(b, EnqueueOutcome::Queued { position: 1, .. }));
        assert!(matches!(c, EnqueueOutcome::Queued { position: 2, .. }));
        assert_eq!(rpc.sent_messages(), vec!["A"]);
        assert_eq!(persisted(&store).len(), 2);

        let next = queue.on_turn_complete(done("run-1")).await.unwrap().unwrap();
        assert_eq!(next.message.text, "B");
        assert_eq!(rpc.sent_messages(), vec!["A", "B"]);

        queue.on_turn_complete(done("run-2")).await.unwrap();
        assert_eq!(rpc.sent_messages(), vec!["A", "B", "C"]);
        assert!(queue.pending().is_empty());
        assert!(persisted(&store).is_empty());
    }

    #[tokio::test]
    async fn test_completion_for_other_run_does_not_advance() {
        let rpc = Arc::new(MockRpc::default());
        let store = Arc::new(MemoryStore::new());
        let queue = queue_with(&rpc, &store);

        queue.enqueue("A").await.unwrap();
        queue.enqueue("B").await.unwrap();
        assert!(queue.on_turn_complete(done("someone-else")).await.unwrap().is_none());
        assert_eq!(rpc.sent_messages(), vec!["A"]);
        assert_eq!(queue.pending().len(), 1);
    }

    #[tokio::test]
    async fn test_completion_matches_idempotency_key() {
        let rpc = Arc::new(MockRpc::default());
        let store = Arc::new(MemoryStore::new());
        let queue = queue_with(&rpc, &store);

        let EnqueueOutcome::Dispatched { message_id, .. } = queue.enqueue("A").await.unwrap() else {
            panic!("expected dispatch");
        };
        queue.enqueue("B").await.unwrap();
        queue.on_turn_complete(done(&message_id)).await.unwrap();
        assert_eq!(rpc.sent_messages(), vec!["A", "B"]);
    }

    #[tokio::test]
    async fn test_cancel_removes_from_memory_and_store() {
        let rpc = Arc::new(MockRpc::default());
        let store = Arc::new(MemoryStore::new());
        let queue = queue_with(&rpc, &store);

        queue.enqueue("A").await.unwrap();
        let EnqueueOutcome::Queued { message_id, .. } = queue.enqueue("B").await.unwrap() else {
            panic!("expected queued");
        };
        queue.enqueue("C").await.unwrap();

        assert!(queue.cancel(&message_id).unwrap());
        assert!(!queue.cancel(&message_id).unwrap());
        let texts: Vec<String> = persisted(&store).into_iter().map(|m| m.text).collect();
        assert_eq!(texts, vec!["C"]);

        queue.on_turn_complete(done("run-1")).await.unwrap();
        assert_eq!(rpc.sent_messages(), vec!["A", "C"]);
    }

    #[tokio::test]
    async fn test_cancel_after_dispatch_has_no_effect() {
        let rpc = Arc::new(MockRpc::default());
        let store = Arc::new(MemoryStore::new());
        let queue = queue_with(&rpc, &store);

        let EnqueueOutcome::Dispatched { message_id, .. } = queue.enqueue("A").await.unwrap() else {
            panic!("expected dispatch");
        };
        assert!(!queue.cancel(&message_id).unwrap());
        assert_eq!(queue.in_flight().unwrap().message_id, message_id);
    }

    #[tokio::test]
    async fn test_dispatch_failure_keeps_message_at_front() {
        let rpc = Arc::new(MockRpc::default());
        let store = Arc::new(MemoryStore::new());
        let queue = queue_with(&rpc, &store);

        queue.enqueue("A").await.unwrap();
        queue.enqueue("B").await.unwrap();
        queue.enqueue("C").await.unwrap();

        rpc.fail_next(1);
        let err = queue.on_turn_complete(done("run-1")).await.unwrap_err();
        assert!(err.remote().is_some());
        assert!(queue.in_flight().is_none());
        let texts: Vec<String> = persisted(&store).into_iter().map(|m| m.text).collect();
        assert_eq!(texts, vec!["B", "C"]);

        let resumed = queue.resume().await.unwrap().unwrap();
        assert_eq!(resumed.message.text, "B");
        assert_eq!(rpc.sent_messages(), vec!["A", "B"]);
    }

    #[tokio::test]
    async fn test_immediate_dispatch_failure_returns_error_and_drops_message() {
        let rpc = Arc::new(MockRpc::default());
        let store = Arc::new(MemoryStore::new());
        let queue = queue_with(&rpc, &store);

        rpc.fail_next(1);
        assert!(queue.enqueue("A").await.is_err());
        assert!(queue.pending().is_empty());
        assert_eq!(queue.in_flight(), None);
        assert!(persisted(&store).is_empty());

        // A rejected message is never sent later behind the caller's back.
        assert_eq!(queue.resume().await.unwrap(), None);
        queue.enqueue("B").await.unwrap();
        assert_eq!(rpc.sent_messages(), vec!["B"]);
    }

    #[tokio::test]
    async fn test_abort_requests_cancellation_without_advancing() {
        let rpc = Arc::new(MockRpc::default());
        let store = Arc::new(MemoryStore::new());
        let queue = queue_with(&rpc, &store);

        assert!(!queue.abort().await.unwrap());

        queue.enqueue("A").await.unwrap();
        queue.enqueue("B").await.unwrap();
        assert!(queue.abort().await.unwrap());

        let (method, params) = rpc.last_call();
        assert_eq!(method, CHAT_ABORT_METHOD);
        assert_eq!(params["runId"], "run-1");
        assert_eq!(params["sessionKey"], "main");
        assert_eq!(rpc.sent_messages(), vec!["A"]);
        assert_eq!(queue.pending().len(), 1);
    }

    #[tokio::test]
    async fn test_reattach_restores_persisted_queue() {
        let rpc = Arc::new(MockRpc::default());
        let store = Arc::new(MemoryStore::new());
        {
            let queue = queue_with(&rpc, &store);
            queue.enqueue("A").await.unwrap();
            queue.enqueue("B").await.unwrap();
            queue.enqueue("C").await.unwrap();
        }

        let queue = queue_with(&rpc, &store);
        let texts: Vec<String> = queue.pending().into_iter().map(|m| m.text).collect();
        assert_eq!(texts, vec!["B", "C"]);
        assert!(queue.in_flight().is_none());

        let resumed = queue.resume().await.unwrap().unwrap();
        assert_eq!(resumed.message.text, "B");
        assert!(queue.resume().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupted_queue_is_reported() {
        let rpc: Arc<dyn GatewayRpc> = Arc::new(MockRpc::default());
        let store = Arc::new(MemoryStore::new());
        store.save("queue/main", "not json").unwrap();

        let err = OutboundQueue::attach("main", rpc, store).unwrap_err();
        assert!(matches!(err, GatewayError::Storage(StoreError::Corrupted(_))));
    }

    #[tokio::test]
    async fn test_run_completions_drives_queue() {
        let rpc = Arc::new(MockRpc::default());
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(queue_with(&rpc, &store));
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(Arc::clone(&queue).run_completions(rx));

        queue.enqueue("A").await.unwrap();
        queue.enqueue("B").await.unwrap();
        tx.send(done("run-1")).unwrap();
        drop(tx);
        task.await.unwrap();

        assert_eq!(rpc.sent_messages(), vec!["A", "B"]);
    }
}
