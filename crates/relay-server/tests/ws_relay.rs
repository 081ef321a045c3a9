//! End-to-end tests over a real socket: handshake, fan-out, rate
//! limiting, votes, and the HTTP surface.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use relay_core::{RejectKind, RelayLimits, ServerEvent};
use relay_server::{start, ServerConfig, ServerHandle, StoreVerifier};
use relay_store::{Database, UserRepo};

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_relay(limits: RelayLimits) -> ServerHandle {
    let config = ServerConfig {
        port: 0,
        limits,
        ..Default::default()
    };
    start(config, Database::in_memory().unwrap(), None)
        .await
        .expect("relay should start")
}

fn fast_limits() -> RelayLimits {
    RelayLimits {
        cooldown: Duration::ZERO,
        ..Default::default()
    }
}

async fn connect(port: u16) -> WsClient {
    let (ws, _) = connect_async(format!("ws://127.0.0.1:{port}/ws"))
        .await
        .expect("websocket connect");
    ws
}

async fn send_frame(ws: &mut WsClient, frame: &str) {
    ws.send(Message::Text(frame.into()))
        .await
        .expect("send frame");
}

/// Next text frame as a parsed event, skipping pings.
async fn recv_event(ws: &mut WsClient) -> ServerEvent {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("websocket error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).expect("frame should parse");
        }
    }
}

/// Connect and complete the hello handshake, consuming the snapshot.
async fn join(port: u16, identity: &str) -> WsClient {
    let mut ws = connect(port).await;
    send_frame(&mut ws, &format!(r#"{{"type":"hello","identity":"{identity}"}}"#)).await;
    match recv_event(&mut ws).await {
        ServerEvent::HistorySnapshot { .. } => ws,
        other => panic!("expected snapshot on admission, got {other:?}"),
    }
}

#[tokio::test]
async fn submission_fans_out_to_all_clients() {
    let relay = start_relay(fast_limits()).await;
    let mut alice = join(relay.port, "alice").await;
    let mut bob = join(relay.port, "bob").await;

    send_frame(&mut alice, r#"{"type":"submit-message","text":"hello room"}"#).await;

    for ws in [&mut alice, &mut bob] {
        match recv_event(ws).await {
            ServerEvent::MessageBroadcast { message } => {
                assert_eq!(message.author, "alice");
                assert_eq!(message.text, "hello room");
                assert!(message.id > 0);
            }
            other => panic!("expected broadcast, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn late_joiner_sees_history_in_snapshot() {
    let relay = start_relay(fast_limits()).await;
    let mut alice = join(relay.port, "alice").await;

    send_frame(&mut alice, r#"{"type":"submit-message","text":"before carol"}"#).await;
    recv_event(&mut alice).await;

    let mut carol = connect(relay.port).await;
    send_frame(&mut carol, r#"{"type":"hello","identity":"carol"}"#).await;
    match recv_event(&mut carol).await {
        ServerEvent::HistorySnapshot { messages } => {
            assert_eq!(messages.len(), 1);
            assert_eq!(messages[0].text, "before carol");
        }
        other => panic!("expected snapshot, got {other:?}"),
    }
}

#[tokio::test]
async fn empty_submission_rejected_to_sender_only() {
    let relay = start_relay(fast_limits()).await;
    let mut alice = join(relay.port, "alice").await;
    let mut bob = join(relay.port, "bob").await;

    send_frame(&mut alice, r#"{"type":"submit-message","text":"  "}"#).await;
    match recv_event(&mut alice).await {
        ServerEvent::SubmissionError { kind, .. } => assert_eq!(kind, RejectKind::EmptyMessage),
        other => panic!("expected rejection, got {other:?}"),
    }

    // Bob sees the next real message, not the rejection.
    send_frame(&mut alice, r#"{"type":"submit-message","text":"real one"}"#).await;
    match recv_event(&mut bob).await {
        ServerEvent::MessageBroadcast { message } => assert_eq!(message.text, "real one"),
        other => panic!("expected broadcast, got {other:?}"),
    }
}

#[tokio::test]
async fn cooldown_rejection_carries_retry_hint() {
    let limits = RelayLimits {
        cooldown: Duration::from_secs(30),
        ..Default::default()
    };
    let relay = start_relay(limits).await;
    let mut alice = join(relay.port, "alice").await;

    send_frame(&mut alice, r#"{"type":"submit-message","text":"first"}"#).await;
    recv_event(&mut alice).await;

    send_frame(&mut alice, r#"{"type":"submit-message","text":"second"}"#).await;
    match recv_event(&mut alice).await {
        ServerEvent::SubmissionError {
            kind, retry_in_ms, ..
        } => {
            assert_eq!(kind, RejectKind::CooldownActive);
            assert!(retry_in_ms.is_some_and(|ms| ms > 0 && ms <= 30_000));
        }
        other => panic!("expected cooldown rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn votes_fan_out_with_fresh_counts() {
    let relay = start_relay(fast_limits()).await;
    let mut alice = join(relay.port, "alice").await;
    let mut bob = join(relay.port, "bob").await;

    send_frame(&mut alice, r#"{"type":"submit-message","text":"vote on me"}"#).await;
    let message_id = match recv_event(&mut alice).await {
        ServerEvent::MessageBroadcast { message } => message.id,
        other => panic!("expected broadcast, got {other:?}"),
    };
    recv_event(&mut bob).await;

    send_frame(
        &mut bob,
        &format!(r#"{{"type":"vote","message_id":{message_id},"kind":"approve"}}"#),
    )
    .await;

    for ws in [&mut alice, &mut bob] {
        match recv_event(ws).await {
            ServerEvent::VoteCountsUpdated {
                message_id: id,
                approve_count,
                disapprove_count,
            } => {
                assert_eq!(id, message_id);
                assert_eq!((approve_count, disapprove_count), (1, 0));
            }
            other => panic!("expected vote update, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn anonymous_hello_is_admitted() {
    let relay = start_relay(fast_limits()).await;
    let mut ws = connect(relay.port).await;

    send_frame(&mut ws, r#"{"type":"hello"}"#).await;
    match recv_event(&mut ws).await {
        ServerEvent::HistorySnapshot { .. } => {}
        other => panic!("expected snapshot, got {other:?}"),
    }

    send_frame(&mut ws, r#"{"type":"submit-message","text":"from anon"}"#).await;
    match recv_event(&mut ws).await {
        ServerEvent::MessageBroadcast { message } => {
            assert!(message.author.starts_with("anon-"));
        }
        other => panic!("expected broadcast, got {other:?}"),
    }
}

#[tokio::test]
async fn non_hello_first_frame_is_refused() {
    let relay = start_relay(fast_limits()).await;
    let mut ws = connect(relay.port).await;

    send_frame(&mut ws, r#"{"type":"submit-message","text":"too eager"}"#).await;
    match recv_event(&mut ws).await {
        ServerEvent::SubmissionError { kind, .. } => assert_eq!(kind, RejectKind::InvalidFrame),
        other => panic!("expected refusal, got {other:?}"),
    }
}

#[tokio::test]
async fn verified_relay_enforces_credentials() {
    let db = Database::in_memory().unwrap();
    let users = UserRepo::new(db.clone());
    users.create("alice", "hunter2").unwrap();

    let config = ServerConfig {
        port: 0,
        limits: fast_limits(),
        ..Default::default()
    };
    let relay = start(config, db.clone(), Some(Arc::new(StoreVerifier::new(users))))
        .await
        .expect("relay should start");

    // Missing credentials.
    let mut ws = connect(relay.port).await;
    send_frame(&mut ws, r#"{"type":"hello"}"#).await;
    match recv_event(&mut ws).await {
        ServerEvent::SubmissionError { kind, .. } => assert_eq!(kind, RejectKind::AuthRequired),
        other => panic!("expected auth-required, got {other:?}"),
    }

    // Wrong secret.
    let mut ws = connect(relay.port).await;
    send_frame(
        &mut ws,
        r#"{"type":"hello","identity":"alice","secret":"wrong"}"#,
    )
    .await;
    match recv_event(&mut ws).await {
        ServerEvent::SubmissionError { kind, .. } => assert_eq!(kind, RejectKind::AuthInvalid),
        other => panic!("expected auth-invalid, got {other:?}"),
    }

    // Valid credentials are admitted.
    let mut ws = connect(relay.port).await;
    send_frame(
        &mut ws,
        r#"{"type":"hello","identity":"alice","secret":"hunter2"}"#,
    )
    .await;
    match recv_event(&mut ws).await {
        ServerEvent::HistorySnapshot { .. } => {}
        other => panic!("expected snapshot, got {other:?}"),
    }
}

#[tokio::test]
async fn http_history_reflects_socket_submissions() {
    let relay = start_relay(fast_limits()).await;
    let mut alice = join(relay.port, "alice").await;

    send_frame(&mut alice, r#"{"type":"submit-message","text":"on the record"}"#).await;
    recv_event(&mut alice).await;

    let url = format!("http://127.0.0.1:{}/history", relay.port);
    let body: serde_json::Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
    assert_eq!(body.as_array().map(|a| a.len()), Some(1));
    assert_eq!(body[0]["text"], "on the record");

    let health_url = format!("http://127.0.0.1:{}/health", relay.port);
    let health: serde_json::Value = reqwest::get(&health_url)
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["total_messages"], 1);
    assert_eq!(health["messages_accepted"], 1);
}

#[tokio::test]
async fn request_history_returns_snapshot_on_demand() {
    let relay = start_relay(fast_limits()).await;
    let mut alice = join(relay.port, "alice").await;

    send_frame(&mut alice, r#"{"type":"submit-message","text":"first"}"#).await;
    recv_event(&mut alice).await;

    send_frame(&mut alice, r#"{"type":"request-history"}"#).await;
    match recv_event(&mut alice).await {
        ServerEvent::HistorySnapshot { messages } => {
            assert_eq!(messages.len(), 1);
            assert_eq!(messages[0].text, "first");
        }
        other => panic!("expected snapshot, got {other:?}"),
    }
}
