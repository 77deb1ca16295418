//! End-to-end tests against a real server using a WebSocket client.

use std::net::SocketAddr;
use std::time::Duration;

use chrono::Utc;
use futures::{SinkExt, StreamExt};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use toloko_server::auth::Claims;
use toloko_server::{build_router, AppState, ServerConfig, SessionLimits};
use toloko_shared::UserId;
use toloko_store::Database;

const SECRET: &str = "integration-secret";
const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

struct TestServer {
    addr: SocketAddr,
    state: AppState,
    _dir: TempDir,
}

/// Boot a server on an ephemeral port.
async fn boot(session: SessionLimits) -> TestServer {
    let dir = TempDir::new().unwrap();
    let config = ServerConfig {
        http_addr: ([127, 0, 0, 1], 0).into(),
        upload_dir: dir.path().join("uploads"),
        jwt_secret: SECRET.to_string(),
        session,
        ..ServerConfig::default()
    };
    let (state, _registry_task) =
        AppState::with_database(config, Database::open_in_memory().unwrap())
            .await
            .unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = build_router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        addr,
        state,
        _dir: dir,
    }
}

fn token(user: i64) -> String {
    let now = Utc::now().timestamp();
    let claims = Claims {
        user_id: UserId(user),
        email: None,
        exp: now + 3600,
        iat: now,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap()
}

async fn connect(server: &TestServer, user: i64) -> WsStream {
    let url = format!("ws://{}/ws?token={}", server.addr, token(user));
    let (ws, _) = connect_async(url).await.unwrap();
    ws
}

async fn send(ws: &mut WsStream, frame: Value) {
    ws.send(Message::Text(frame.to_string().into())).await.unwrap();
}

/// Next JSON event, skipping transport-level frames.
async fn recv(ws: &mut WsStream) -> Value {
    loop {
        let msg = timeout(TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("read error");
        match msg {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame {other:?}"),
        }
    }
}

/// Next event of the given type; anything else is skipped.
async fn recv_type(ws: &mut WsStream, kind: &str) -> Value {
    loop {
        let event = recv(ws).await;
        if event["type"] == kind {
            return event;
        }
    }
}

/// Assert that no application event arrives within `window`.
async fn assert_quiet(ws: &mut WsStream, window: Duration) {
    let deadline = tokio::time::Instant::now() + window;
    loop {
        match tokio::time::timeout_at(deadline, ws.next()).await {
            Err(_) => return,
            Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => continue,
            Ok(other) => panic!("expected silence, got {other:?}"),
        }
    }
}

/// Whether the server closed the socket within the timeout.
async fn closed_by_server(ws: &mut WsStream) -> bool {
    loop {
        match timeout(TIMEOUT, ws.next()).await {
            Err(_) => return false,
            Ok(None) | Ok(Some(Err(_))) | Ok(Some(Ok(Message::Close(_)))) => return true,
            Ok(Some(Ok(_))) => continue,
        }
    }
}

async fn wait_for_live(server: &TestServer, expected: usize) {
    let result = timeout(TIMEOUT, async {
        while server.state.registry.live_sessions().await != expected {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "live session count never reached {expected}");
}

/// Connect user 2, then user 1, and wait until both are registered.
async fn connect_pair(server: &TestServer) -> (WsStream, WsStream) {
    let mut two = connect(server, 2).await;
    wait_for_live(server, 1).await;
    let one = connect(server, 1).await;

    let presence = recv_type(&mut two, "presence.update").await;
    assert_eq!(presence["payload"]["user_id"], 1);
    assert_eq!(presence["payload"]["is_online"], true);

    (one, two)
}

#[tokio::test]
async fn test_hello_reaches_recipient_and_acknowledges_sender() {
    let server = boot(SessionLimits::default()).await;
    let (mut one, mut two) = connect_pair(&server).await;

    send(
        &mut one,
        json!({
            "type": "message.send",
            "payload": { "text": "Hello", "to_user_id": 2 },
            "temp_id": "abc"
        }),
    )
    .await;

    let deliver = recv_type(&mut one, "message.deliver").await;
    assert_eq!(deliver["payload"]["temp_id"], "abc");
    let message_id = deliver["payload"]["message_id"].as_i64().unwrap();

    let receive = recv_type(&mut two, "message.receive").await;
    assert_eq!(receive["payload"]["id"], message_id);
    assert_eq!(receive["payload"]["text"], "Hello");
    assert_eq!(receive["payload"]["status"], "sent");
    assert_eq!(receive["payload"]["from_user_id"], 1);
    let conversation_id = receive["payload"]["conversation_id"].as_i64().unwrap();

    // Recipient reads it; the sender hears about it once.
    let read = json!({ "type": "message.read", "payload": { "message_id": message_id } });
    send(&mut two, read.clone()).await;
    send(&mut two, read).await;
    let notice = recv_type(&mut one, "message.read").await;
    assert_eq!(notice["payload"]["message_id"], message_id);

    // Typing goes to the other participant only.
    send(
        &mut two,
        json!({ "type": "typing.start", "payload": { "conversation_id": conversation_id } }),
    )
    .await;
    let typing = recv_type(&mut one, "typing.start").await;
    assert_eq!(typing["payload"]["user_id"], 2);
    assert_eq!(typing["payload"]["conversation_id"], conversation_id);

    assert_quiet(&mut one, Duration::from_millis(300)).await;
    assert_quiet(&mut two, Duration::from_millis(100)).await;
}

#[tokio::test]
async fn test_blocked_send_is_silently_dropped() {
    let server = boot(SessionLimits::default()).await;
    server
        .state
        .db
        .run(|db| Ok(db.insert_block(UserId(1), UserId(2), Utc::now())?))
        .await
        .unwrap();

    let (mut one, mut two) = connect_pair(&server).await;

    send(
        &mut two,
        json!({ "type": "message.send", "payload": { "text": "hi", "to_user_id": 1 } }),
    )
    .await;

    assert_quiet(&mut one, Duration::from_millis(400)).await;

    let rows: i64 = server
        .state
        .db
        .run(|db| {
            Ok(db
                .conn()
                .query_row("SELECT COUNT(*) FROM messages", [], |r| r.get(0))
                .map_err(toloko_store::StoreError::from)?)
        })
        .await
        .unwrap();
    assert_eq!(rows, 0);

    // The sender's session carries on.
    send(&mut two, json!({ "type": "ping", "payload": {} })).await;
    let pong = recv_type(&mut two, "pong").await;
    assert!(pong["payload"]["timestamp"].as_i64().unwrap() > 0);
}

#[tokio::test]
async fn test_idle_session_is_torn_down() {
    let server = boot(SessionLimits {
        idle_timeout: Duration::from_millis(800),
        ping_interval: Duration::from_secs(30),
        ..SessionLimits::default()
    })
    .await;

    let mut observer = connect(&server, 9).await;
    wait_for_live(&server, 1).await;
    let mut idle = connect(&server, 1).await;

    let online = recv_type(&mut observer, "presence.update").await;
    assert_eq!(online["payload"]["user_id"], 1);
    assert_eq!(online["payload"]["is_online"], true);

    // The observer keeps itself alive while the other client says nothing.
    let keepalive = tokio::spawn(async move {
        let mut events = Vec::new();
        for _ in 0..6 {
            send(&mut observer, json!({ "type": "ping" })).await;
            loop {
                let event = recv(&mut observer).await;
                if event["type"] == "pong" {
                    break;
                }
                events.push(event);
            }
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        events
    });

    assert!(closed_by_server(&mut idle).await);

    let events = keepalive.await.unwrap();
    let offline = events
        .iter()
        .find(|e| e["type"] == "presence.update" && e["payload"]["is_online"] == false)
        .expect("no offline presence update");
    assert_eq!(offline["payload"]["user_id"], 1);

    let presence = server.state.presence.get(UserId(1)).await.unwrap();
    assert!(!presence.is_online);
    assert!(presence.last_seen.is_some());
    wait_for_live(&server, 1).await;
}

#[tokio::test]
async fn test_handshake_requires_valid_token() {
    let server = boot(SessionLimits::default()).await;

    let bad = format!("ws://{}/ws?token=garbage", server.addr);
    match connect_async(bad).await {
        Err(WsError::Http(response)) => assert_eq!(response.status().as_u16(), 401),
        other => panic!("expected 401, got {other:?}"),
    }

    let missing = format!("ws://{}/ws", server.addr);
    match connect_async(missing).await {
        Err(WsError::Http(response)) => assert_eq!(response.status().as_u16(), 401),
        other => panic!("expected 401, got {other:?}"),
    }

    assert_eq!(server.state.registry.live_sessions().await, 0);
}

#[tokio::test]
async fn test_unknown_type_is_ignored_but_garbage_closes() {
    let server = boot(SessionLimits::default()).await;
    let mut ws = connect(&server, 5).await;
    wait_for_live(&server, 1).await;

    send(&mut ws, json!({ "type": "call.start", "payload": {} })).await;
    send(&mut ws, json!({ "type": "message.read", "payload": { "message_id": "x" } })).await;
    send(&mut ws, json!({ "type": "ping" })).await;
    let pong = recv(&mut ws).await;
    assert_eq!(pong["type"], "pong");

    ws.send(Message::Text("not json".into())).await.unwrap();
    assert!(closed_by_server(&mut ws).await);
    wait_for_live(&server, 0).await;
}

#[tokio::test]
async fn test_oversized_frame_closes_session() {
    let server = boot(SessionLimits::default()).await;
    let mut ws = connect(&server, 5).await;
    wait_for_live(&server, 1).await;

    let text = "x".repeat(2048);
    let _ = ws
        .send(Message::Text(
            json!({ "type": "message.send", "payload": { "text": text, "to_user_id": 6 } })
                .to_string()
                .into(),
        ))
        .await;

    assert!(closed_by_server(&mut ws).await);
    wait_for_live(&server, 0).await;
}

#[tokio::test]
async fn test_messages_arrive_in_send_order() {
    let server = boot(SessionLimits::default()).await;
    let (mut one, mut two) = connect_pair(&server).await;

    let texts: Vec<String> = (0..10).map(|i| format!("m{i}")).collect();
    for text in &texts {
        send(
            &mut one,
            json!({ "type": "message.send", "payload": { "text": text, "to_user_id": 2 } }),
        )
        .await;
    }

    let mut received = Vec::new();
    let mut ids = Vec::new();
    let mut conversation = None;
    for _ in 0..texts.len() {
        let event = recv_type(&mut two, "message.receive").await;
        received.push(event["payload"]["text"].as_str().unwrap().to_string());
        ids.push(event["payload"]["id"].as_i64().unwrap());
        conversation = event["payload"]["conversation_id"].as_i64();
    }
    assert_eq!(received, texts);
    assert!(ids.windows(2).all(|w| w[0] < w[1]), "ids not increasing: {ids:?}");

    let conversation = toloko_shared::ConversationId(conversation.unwrap());
    let history = server
        .state
        .db
        .run(move |db| Ok(db.list_messages(conversation, None, 20)?))
        .await
        .unwrap();
    let newest_first: Vec<String> = history.iter().map(|m| m.text.clone()).collect();
    let mut expected = texts.clone();
    expected.reverse();
    assert_eq!(newest_first, expected);
}
