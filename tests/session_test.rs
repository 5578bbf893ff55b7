//! Chat sessions end to end: queue, assembler and connection together.

mod common;

use std::sync::Arc;

use common::{accept, connected, flush, manager, MockConnector, ServerConn, WAIT};
use gatelink::protocol::RequestFrame;
use gatelink::{ChatSession, EnqueueOutcome, MemoryStore, MessageSnapshot, Store};
use serde_json::{json, Value};
use tokio::sync::mpsc;

fn agent(conn: &ServerConn, run_id: &str, seq: u64, stream: &str, data: Value) {
    conn.event(
        "agent",
        json!({
            "runId": run_id,
            "seq": seq,
            "stream": stream,
            "ts": 1_700_000_000_000_i64,
            "data": data,
            "sessionKey": "main",
        }),
        None,
    );
}

async fn next_snapshot(rx: &mut mpsc::UnboundedReceiver<MessageSnapshot>) -> MessageSnapshot {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("no snapshot")
        .expect("snapshot channel closed")
}

async fn expect_chat_send(conn: &mut ServerConn, text: &str) -> RequestFrame {
    let req = conn.next_request().await;
    assert_eq!(req.method, "chat.send");
    let params = req.params.clone().unwrap();
    assert_eq!(params["sessionKey"], "main");
    assert_eq!(params["message"], text);
    req
}

#[tokio::test(start_paused = true)]
async fn test_turn_streams_and_completion_sends_next_message() {
    let (connector, mut accepted) = MockConnector::new();
    let (manager, mut conn) = connected(&connector, &mut accepted, None).await;
    let store = Arc::new(MemoryStore::new());
    let (session, mut snapshots) =
        ChatSession::attach(&manager, Arc::clone(&store) as Arc<dyn Store>, "main").unwrap();
    let session = Arc::new(session);

    let first = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.send("hello").await })
    };
    let req = expect_chat_send(&mut conn, "hello").await;
    conn.reply(&req, json!({"runId": "run-1", "status": "started"}));
    let EnqueueOutcome::Dispatched { message_id, run_id } = first.await.unwrap().unwrap() else {
        panic!("first message should be dispatched");
    };
    assert_eq!(req.params.as_ref().unwrap()["idempotencyKey"], message_id.as_str());
    assert_eq!(run_id.as_deref(), Some("run-1"));

    let second = session.send("and then?").await.unwrap();
    assert!(matches!(second, EnqueueOutcome::Queued { position: 1, .. }));
    assert_eq!(session.queued().len(), 1);
    assert!(store.load("queue/main").unwrap().unwrap().contains("and then?"));

    agent(&conn, "run-1", 1, "assistant", json!({"delta": "Hel"}));
    agent(&conn, "run-1", 2, "assistant", json!({"delta": "lo"}));
    agent(&conn, "run-1", 2, "assistant", json!({"delta": "lo"}));

    let snapshot = next_snapshot(&mut snapshots).await;
    assert_eq!(snapshot.content, "Hel");
    assert!(snapshot.streaming);
    let snapshot = next_snapshot(&mut snapshots).await;
    assert_eq!(snapshot.content, "Hello");
    assert_eq!(session.streaming().map(|s| s.content), Some("Hello".to_string()));

    agent(&conn, "run-1", 3, "lifecycle", json!({"phase": "end"}));
    let snapshot = next_snapshot(&mut snapshots).await;
    assert_eq!(snapshot.content, "Hello");
    assert!(!snapshot.streaming);
    assert!(!snapshot.failed);

    // The completion releases the queued message.
    let req = expect_chat_send(&mut conn, "and then?").await;
    assert!(session.queued().is_empty());
    assert_eq!(store.load("queue/main").unwrap(), None);
    conn.reply(&req, json!({"runId": "run-2"}));
    flush(&manager, &mut conn).await;
    assert!(snapshots.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_events_for_other_sessions_are_ignored() {
    let (connector, mut accepted) = MockConnector::new();
    let (manager, mut conn) = connected(&connector, &mut accepted, None).await;
    let (_session, mut snapshots) =
        ChatSession::attach(&manager, Arc::new(MemoryStore::new()), "main").unwrap();

    conn.event(
        "agent",
        json!({"runId": "r9", "stream": "assistant", "data": {"delta": "x"}, "sessionKey": "other"}),
        None,
    );
    conn.event("tick", json!({"ts": 5}), None);
    flush(&manager, &mut conn).await;
    assert!(snapshots.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_persisted_queue_is_sent_after_connect() {
    let (connector, mut accepted) = MockConnector::new();
    let store = Arc::new(MemoryStore::new());
    store
        .save(
            "queue/main",
            r#"[{"id":"m-1","text":"left over","enqueuedAt":1},{"id":"m-2","text":"also","enqueuedAt":2}]"#,
        )
        .unwrap();

    let manager = manager(&connector, None);
    let (session, _snapshots) =
        ChatSession::attach(&manager, Arc::clone(&store) as Arc<dyn Store>, "main").unwrap();
    assert_eq!(session.queued().len(), 2);

    manager.connect();
    let mut conn = accept(&mut accepted).await;
    conn.handshake().await;

    let req = expect_chat_send(&mut conn, "left over").await;
    assert_eq!(req.params.as_ref().unwrap()["idempotencyKey"], "m-1");
    conn.reply(&req, json!({"runId": "run-1"}));
    flush(&manager, &mut conn).await;

    let queued: Vec<String> = session.queued().into_iter().map(|m| m.id).collect();
    assert_eq!(queued, vec!["m-2".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_transcript_cancel_and_abort() {
    let (connector, mut accepted) = MockConnector::new();
    let (manager, mut conn) = connected(&connector, &mut accepted, None).await;
    let (session, mut snapshots) =
        ChatSession::attach(&manager, Arc::new(MemoryStore::new()), "main").unwrap();
    let session = Arc::new(session);

    assert!(!session.abort().await.unwrap());

    let first = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.send("one").await })
    };
    let req = expect_chat_send(&mut conn, "one").await;
    conn.reply(&req, json!({"runId": "run-1"}));
    first.await.unwrap().unwrap();

    let EnqueueOutcome::Queued { message_id: queued_id, .. } = session.send("two").await.unwrap()
    else {
        panic!("second message should queue");
    };
    agent(&conn, "run-1", 1, "assistant", json!({"text": "partial"}));
    next_snapshot(&mut snapshots).await;

    let transcript = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.transcript(Some(10)).await })
    };
    let req = conn.next_request().await;
    assert_eq!(req.method, "chat.history");
    assert_eq!(req.params, Some(json!({"sessionKey": "main", "limit": 10})));
    conn.reply(&req, json!({"sessionKey": "main", "messages": [{"role": "user", "content": "earlier"}]}));

    let transcript = transcript.await.unwrap().unwrap();
    assert_eq!(transcript.history, vec![json!({"role": "user", "content": "earlier"})]);
    assert_eq!(transcript.streaming.map(|s| s.content), Some("partial".to_string()));
    assert_eq!(transcript.queued.len(), 1);
    assert_eq!(transcript.queued[0].text, "two");

    assert!(session.cancel(&queued_id).unwrap());
    assert!(!session.cancel(&queued_id).unwrap());
    assert!(session.queued().is_empty());

    let abort = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.abort().await })
    };
    let req = conn.next_request().await;
    assert_eq!(req.method, "chat.abort");
    assert_eq!(req.params, Some(json!({"sessionKey": "main", "runId": "run-1"})));
    conn.reply(&req, json!({"ok": true, "aborted": true}));
    assert!(abort.await.unwrap().unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_dropped_connection_fails_turn_and_sends_next_message() {
    let (connector, mut accepted) = MockConnector::new();
    let (manager, mut conn) = connected(&connector, &mut accepted, None).await;
    let (session, mut snapshots) =
        ChatSession::attach(&manager, Arc::new(MemoryStore::new()), "main").unwrap();
    let session = Arc::new(session);

    let first = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.send("one").await })
    };
    let req = expect_chat_send(&mut conn, "one").await;
    conn.reply(&req, json!({"runId": "run-1"}));
    first.await.unwrap().unwrap();
    assert!(matches!(
        session.send("two").await.unwrap(),
        EnqueueOutcome::Queued { position: 1, .. }
    ));

    agent(&conn, "run-1", 1, "assistant", json!({"delta": "partial"}));
    assert_eq!(next_snapshot(&mut snapshots).await.content, "partial");

    // The end event for run-1 is lost with the connection.
    drop(conn);
    let snapshot = next_snapshot(&mut snapshots).await;
    assert_eq!(snapshot.run_id, "run-1");
    assert_eq!(snapshot.content, "partial\n\nError: connection lost");
    assert!(!snapshot.streaming);
    assert!(snapshot.failed);
    assert_eq!(session.streaming(), None);

    let mut conn = accept(&mut accepted).await;
    conn.handshake().await;
    let req = expect_chat_send(&mut conn, "two").await;
    conn.reply(&req, json!({"runId": "run-2"}));
    flush(&manager, &mut conn).await;
    assert!(session.queued().is_empty());
    assert!(snapshots.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_superseded_turn_gets_a_final_snapshot() {
    let (connector, mut accepted) = MockConnector::new();
    let (manager, conn) = connected(&connector, &mut accepted, None).await;
    let (_session, mut snapshots) =
        ChatSession::attach(&manager, Arc::new(MemoryStore::new()), "main").unwrap();

    agent(&conn, "run-1", 1, "assistant", json!({"delta": "first"}));
    assert!(next_snapshot(&mut snapshots).await.streaming);

    agent(&conn, "run-2", 1, "assistant", json!({"delta": "second"}));
    let closed = next_snapshot(&mut snapshots).await;
    assert_eq!(closed.run_id, "run-1");
    assert_eq!(closed.content, "first");
    assert!(!closed.streaming);
    let live = next_snapshot(&mut snapshots).await;
    assert_eq!(live.run_id, "run-2");
    assert!(live.streaming);
}

#[tokio::test(start_paused = true)]
async fn test_detach_stops_delivery() {
    let (connector, mut accepted) = MockConnector::new();
    let (manager, mut conn) = connected(&connector, &mut accepted, None).await;
    let (session, mut snapshots) =
        ChatSession::attach(&manager, Arc::new(MemoryStore::new()), "main").unwrap();

    session.detach();
    agent(&conn, "run-1", 1, "assistant", json!({"delta": "late"}));
    flush(&manager, &mut conn).await;

    assert_eq!(snapshots.recv().await, None);
}
