//! Streamed agent turn reconstruction.
//!
//! A [`TurnAssembler`] folds the `agent` events of one session into a single
//! evolving assistant message. Each applied event yields a [`MessageSnapshot`]
//! for rendering; finalizing a turn (end, done or error) also raises a
//! [`TurnCompletion`] on the optional completion channel, which is what lets
//! the outbound queue advance without polling.
//!
//! Field-name variants on the wire (`callId` / `toolCallId`, `delta` / `text`,
//! the `tool` stream with a `phase` versus dedicated `tool-start` / `tool-end`
//! streams) are resolved once in [`TurnInput::from_event`]; nothing past that
//! point sees them.

use std::collections::{HashMap, VecDeque};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::protocol::AgentStreamEvent;

/// Number of finished runs remembered to ignore their trailing events.
const FINALIZED_RUNS_CAPACITY: usize = 64;

/// Number of runs whose last applied `seq` is tracked.
const SEQ_TRACKING_CAPACITY: usize = 64;

/// Status of a tool call within a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    /// Started, no result yet.
    Running,
    /// Finished successfully.
    Done,
    /// Finished with an error.
    Error,
}

/// One tool invocation inside a turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCallRecord {
    /// Tool call id.
    #[serde(rename = "callId")]
    pub call_id: String,
    /// Tool name.
    pub name: String,
    /// Arguments, if the gateway sent them.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
    /// Current status.
    pub status: ToolStatus,
    /// Result (partial while running).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

/// Renderable state of the assistant message being assembled.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageSnapshot {
    /// Local message id, stable for the lifetime of the turn.
    pub id: String,
    /// Run the message belongs to.
    #[serde(rename = "runId")]
    pub run_id: String,
    /// Always `assistant`.
    pub role: &'static str,
    /// Accumulated text.
    pub content: String,
    /// Tool calls in the order they started.
    #[serde(rename = "toolCalls")]
    pub tool_calls: Vec<ToolCallRecord>,
    /// `true` until the turn finalizes.
    pub streaming: bool,
    /// Set when the turn ended with an error.
    pub failed: bool,
}

/// How a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    /// Lifecycle end, done, end or finish.
    Done,
    /// Error stream or lifecycle error.
    Failed,
}

/// Raised whenever a turn finalizes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnCompletion {
    /// Run that finished.
    pub run_id: String,
    /// How it finished.
    pub outcome: TurnOutcome,
}

/// Normalized agent stream step.
#[derive(Debug, Clone, PartialEq)]
enum TurnInput {
    AssistantChunk(String),
    ToolStart {
        call_id: String,
        name: String,
        args: Option<Value>,
    },
    ToolUpdate {
        call_id: String,
        partial: Value,
    },
    ToolEnd {
        call_id: String,
        result: Option<Value>,
        is_error: bool,
    },
    Finish {
        final_text: Option<String>,
    },
    Error {
        message: String,
    },
}

impl TurnInput {
    /// Map a raw stream event to an assembler input. `None` for streams and
    /// phases that do not affect the message (lifecycle start, unknown names,
    /// tool events without a call id, empty chunks).
    fn from_event(event: &AgentStreamEvent) -> Option<Self> {
        let data = &event.data;
        match event.stream.as_str() {
            "assistant" => str_field(data, "delta")
                .or_else(|| str_field(data, "text"))
                .filter(|chunk| !chunk.is_empty())
                .map(Self::AssistantChunk),
            "tool" => match str_field(data, "phase").as_deref() {
                Some("start") => Self::tool_start(data),
                Some("update") => Self::tool_update(data),
                Some("result" | "end") => Self::tool_end(data),
                _ => None,
            },
            "tool-start" => Self::tool_start(data),
            "tool-update" => Self::tool_update(data),
            "tool-end" => Self::tool_end(data),
            "lifecycle" => match str_field(data, "phase").as_deref() {
                Some("end") => Some(Self::Finish {
                    final_text: str_field(data, "text"),
                }),
                Some("error") => Some(Self::Error {
                    message: error_message(data),
                }),
                _ => None,
            },
            "done" | "end" | "finish" => Some(Self::Finish {
                final_text: str_field(data, "text"),
            }),
            "error" => Some(Self::Error {
                message: error_message(data),
            }),
            _ => None,
        }
    }

    fn tool_start(data: &Value) -> Option<Self> {
        Some(Self::ToolStart {
            call_id: call_id(data)?,
            name: str_field(data, "name").unwrap_or_else(|| "tool".to_string()),
            args: data.get("args").cloned(),
        })
    }

    fn tool_update(data: &Value) -> Option<Self> {
        Some(Self::ToolUpdate {
            call_id: call_id(data)?,
            partial: data.get("partialResult").cloned().unwrap_or(Value::Null),
        })
    }

    fn tool_end(data: &Value) -> Option<Self> {
        Some(Self::ToolEnd {
            call_id: call_id(data)?,
            result: data.get("result").cloned(),
            is_error: data.get("isError").and_then(Value::as_bool).unwrap_or(false),
        })
    }
}

fn str_field(data: &Value, key: &str) -> Option<String> {
    data.get(key).and_then(Value::as_str).map(str::to_string)
}

fn call_id(data: &Value) -> Option<String> {
    str_field(data, "callId")
        .or_else(|| str_field(data, "toolCallId"))
        .filter(|id| !id.is_empty())
}

fn error_message(data: &Value) -> String {
    match data.get("error") {
        Some(Value::String(message)) => message.clone(),
        Some(Value::Object(error)) => error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string(),
        _ => str_field(data, "message").unwrap_or_else(|| "unknown error".to_string()),
    }
}

/// Live message under construction.
#[derive(Debug)]
struct TurnBuffer {
    id: String,
    run_id: String,
    content: String,
    tool_calls: Vec<ToolCallRecord>,
}

impl TurnBuffer {
    fn new(run_id: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            content: String::new(),
            tool_calls: Vec::new(),
        }
    }

    fn snapshot(&self, streaming: bool, failed: bool) -> MessageSnapshot {
        MessageSnapshot {
            id: self.id.clone(),
            run_id: self.run_id.clone(),
            role: "assistant",
            content: self.content.clone(),
            tool_calls: self.tool_calls.clone(),
            streaming,
            failed,
        }
    }

    fn append_error(&mut self, message: &str) {
        if !self.content.is_empty() {
            self.content.push_str("\n\n");
        }
        self.content.push_str("Error: ");
        self.content.push_str(message);
    }

    fn tool_mut(&mut self, call_id: &str) -> Option<&mut ToolCallRecord> {
        self.tool_calls.iter_mut().find(|t| t.call_id == call_id)
    }
}

/// Per-session reducer from agent stream events to message snapshots.
#[derive(Debug)]
pub struct TurnAssembler {
    session_key: String,
    buffer: Option<TurnBuffer>,
    last_seq: HashMap<String, u64>,
    seq_order: VecDeque<String>,
    finalized: VecDeque<String>,
    superseded: Option<MessageSnapshot>,
    completions: Option<mpsc::UnboundedSender<TurnCompletion>>,
}

impl TurnAssembler {
    /// Create an assembler bound to `session_key`.
    pub fn new(session_key: impl Into<String>) -> Self {
        Self {
            session_key: session_key.into(),
            buffer: None,
            last_seq: HashMap::new(),
            seq_order: VecDeque::new(),
            finalized: VecDeque::new(),
            superseded: None,
            completions: None,
        }
    }

    /// Raise a [`TurnCompletion`] on `tx` whenever a turn finalizes.
    #[must_use]
    pub fn with_completion_signal(mut self, tx: mpsc::UnboundedSender<TurnCompletion>) -> Self {
        self.completions = Some(tx);
        self
    }

    /// Session this assembler is bound to.
    #[must_use]
    pub fn session_key(&self) -> &str {
        &self.session_key
    }

    /// Snapshot of the live message, if a turn is in progress.
    #[must_use]
    pub fn current(&self) -> Option<MessageSnapshot> {
        self.buffer.as_ref().map(|b| b.snapshot(true, false))
    }

    /// Rebind to another session. The live buffer is dropped without being
    /// flushed and all dedup state is forgotten.
    pub fn switch_session(&mut self, session_key: impl Into<String>) {
        self.session_key = session_key.into();
        self.buffer = None;
        self.superseded = None;
        self.last_seq.clear();
        self.seq_order.clear();
        self.finalized.clear();
    }

    /// Apply one stream event. Returns the updated snapshot when the event
    /// changed the message.
    pub fn apply(&mut self, event: &AgentStreamEvent) -> Option<MessageSnapshot> {
        if !self.admit(event) {
            return None;
        }

        let run_id = event.run_id.as_str();
        match TurnInput::from_event(event)? {
            TurnInput::AssistantChunk(chunk) => {
                let buffer = self.open(run_id);
                buffer.content.push_str(&chunk);
                Some(buffer.snapshot(true, false))
            }
            TurnInput::ToolStart {
                call_id,
                name,
                args,
            } => {
                let buffer = self.open(run_id);
                if let Some(record) = buffer.tool_mut(&call_id) {
                    record.name = name;
                    record.args = args.or(record.args.take());
                    record.status = ToolStatus::Running;
                } else {
                    buffer.tool_calls.push(ToolCallRecord {
                        call_id,
                        name,
                        args,
                        status: ToolStatus::Running,
                        result: None,
                    });
                }
                Some(buffer.snapshot(true, false))
            }
            TurnInput::ToolUpdate { call_id, partial } => {
                let buffer = self.live(run_id)?;
                let record = buffer.tool_mut(&call_id)?;
                record.result = Some(partial);
                Some(buffer.snapshot(true, false))
            }
            TurnInput::ToolEnd {
                call_id,
                result,
                is_error,
            } => {
                let buffer = self.live(run_id)?;
                let record = buffer.tool_mut(&call_id)?;
                record.status = if is_error {
                    ToolStatus::Error
                } else {
                    ToolStatus::Done
                };
                record.result = result;
                Some(buffer.snapshot(true, false))
            }
            TurnInput::Finish { final_text } => {
                let mut buffer = match self.take_live(run_id) {
                    Some(buffer) => buffer,
                    None if final_text.is_some() => TurnBuffer::new(run_id),
                    None => {
                        self.finish(run_id, TurnOutcome::Done);
                        return None;
                    }
                };
                if let Some(text) = final_text {
                    buffer.content = text;
                }
                self.finish(run_id, TurnOutcome::Done);
                Some(buffer.snapshot(false, false))
            }
            TurnInput::Error { message } => {
                let mut buffer = self
                    .take_live(run_id)
                    .unwrap_or_else(|| TurnBuffer::new(run_id));
                buffer.append_error(&message);
                log::warn!("[Assembler] Run {} failed: {}", run_id, message);
                self.finish(run_id, TurnOutcome::Failed);
                Some(buffer.snapshot(false, true))
            }
        }
    }

    /// Final snapshot of a turn that another run displaced during the last
    /// [`Self::apply`]. Such turns never see their own `end` event.
    pub fn take_superseded(&mut self) -> Option<MessageSnapshot> {
        self.superseded.take()
    }

    /// Finalize `run_id` as failed without a terminal event from the
    /// gateway, e.g. when the connection dropped mid-turn. Raises the
    /// completion signal and returns the closing snapshot if the run had a
    /// live message. Runs that already finalized are left alone.
    pub fn interrupt(&mut self, run_id: &str, reason: &str) -> Option<MessageSnapshot> {
        if self.finalized.iter().any(|r| r == run_id) {
            return None;
        }
        log::warn!("[Assembler] Run {} interrupted: {}", run_id, reason);
        let snapshot = self.take_live(run_id).map(|mut buffer| {
            buffer.append_error(reason);
            buffer.snapshot(false, true)
        });
        self.finish(run_id, TurnOutcome::Failed);
        snapshot
    }

    /// Session, finalized-run and `seq` admission checks.
    fn admit(&mut self, event: &AgentStreamEvent) -> bool {
        if event
            .session_key
            .as_deref()
            .is_some_and(|key| key != self.session_key)
        {
            return false;
        }
        if self.finalized.contains(&event.run_id) {
            log::trace!("[Assembler] Ignoring event for finished run {}", event.run_id);
            return false;
        }

        if let Some(seq) = event.seq {
            match self.last_seq.get_mut(&event.run_id) {
                Some(last) if seq <= *last => {
                    log::debug!(
                        "[Assembler] Dropping replayed seq {} for run {}",
                        seq,
                        event.run_id
                    );
                    return false;
                }
                Some(last) => *last = seq,
                None => {
                    if self.seq_order.len() >= SEQ_TRACKING_CAPACITY {
                        if let Some(oldest) = self.seq_order.pop_front() {
                            self.last_seq.remove(&oldest);
                        }
                    }
                    self.seq_order.push_back(event.run_id.clone());
                    self.last_seq.insert(event.run_id.clone(), seq);
                }
            }
        }
        true
    }

    /// Live buffer for `run_id`, opening one if needed. A buffer left over
    /// from another run is closed out first so only one turn is ever live.
    fn open(&mut self, run_id: &str) -> &mut TurnBuffer {
        if self.buffer.as_ref().is_some_and(|b| b.run_id != run_id) {
            if let Some(stale) = self.buffer.take() {
                log::debug!(
                    "[Assembler] Run {} superseded by {} before finishing",
                    stale.run_id,
                    run_id
                );
                self.finish(&stale.run_id, TurnOutcome::Done);
                self.superseded = Some(stale.snapshot(false, false));
            }
        }
        self.buffer.get_or_insert_with(|| TurnBuffer::new(run_id))
    }

    fn live(&mut self, run_id: &str) -> Option<&mut TurnBuffer> {
        self.buffer.as_mut().filter(|b| b.run_id == run_id)
    }

    fn take_live(&mut self, run_id: &str) -> Option<TurnBuffer> {
        if self.buffer.as_ref().is_some_and(|b| b.run_id == run_id) {
            self.buffer.take()
        } else {
            None
        }
    }

    fn finish(&mut self, run_id: &str, outcome: TurnOutcome) {
        if self.finalized.len() >= FINALIZED_RUNS_CAPACITY {
            self.finalized.pop_front();
        }
        self.finalized.push_back(run_id.to_string());

        if let Some(tx) = &self.completions {
            let completion = TurnCompletion {
                run_id: run_id.to_string(),
                outcome,
            };
            if tx.send(completion).is_err() {
                log::debug!("[Assembler] Completion receiver dropped");
            }
        }
    }
}
