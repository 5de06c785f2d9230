#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{EncodingKey, Header};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::time;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use pulse_api::auth::tokens::Claims;
use pulse_api::config::Config;
use pulse_api::db::kv::MemoryStore;
use pulse_api::db::memory::MemoryEntityStore;
use pulse_api::notify::queue::{MemoryQueue, QueueTransport};
use pulse_api::AppState;

pub const TEST_SECRET: &str = "test-secret-do-not-use-in-production";

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// State over in-memory backends, plus handles for seeding and inspection.
pub struct TestContext {
    pub state: AppState,
    pub entities: Arc<MemoryEntityStore>,
    pub queue: Arc<MemoryQueue>,
}

pub fn test_context(config: Config) -> TestContext {
    let entities = Arc::new(MemoryEntityStore::new());
    let queue = Arc::new(MemoryQueue::new());
    let state = AppState::build(
        config,
        entities.clone(),
        Arc::new(MemoryStore::new()),
        queue.clone(),
    )
    .expect("build state");
    TestContext {
        state,
        entities,
        queue,
    }
}

/// State whose notifications go through `queue` instead of a memory queue.
pub fn test_state_with_queue(
    config: Config,
    queue: Arc<dyn QueueTransport>,
) -> (AppState, Arc<MemoryEntityStore>) {
    let entities = Arc::new(MemoryEntityStore::new());
    let state = AppState::build(config, entities.clone(), Arc::new(MemoryStore::new()), queue)
        .expect("build state");
    (state, entities)
}

pub fn app(state: AppState) -> axum::Router {
    pulse_api::routes::router().with_state(state)
}

/// Mint an HS256 token for `user_id`, valid for five minutes.
pub fn mint_token(user_id: &str) -> String {
    mint_token_expiring(user_id, 300)
}

pub fn mint_expired_token(user_id: &str) -> String {
    mint_token_expiring(user_id, -300)
}

fn mint_token_expiring(user_id: &str, ttl_secs: i64) -> String {
    let now = chrono::Utc::now();
    let claims = Claims {
        sub: user_id.to_string(),
        email: format!("{user_id}@example.com"),
        handle: user_id.to_string(),
        exp: (now + chrono::Duration::seconds(ttl_secs)).timestamp(),
        iat: Some(now.timestamp()),
    };
    jsonwebtoken::encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(TEST_SECRET.as_bytes()),
    )
    .expect("mint test token")
}

/// Start a real TCP server for WebSocket testing. The server runs in the
/// background for the rest of the test.
pub async fn start_server(state: AppState) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let app = app(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    addr
}

pub async fn connect(addr: SocketAddr, token: Option<&str>) -> Ws {
    let url = match token {
        Some(token) => format!("ws://{addr}/gateway?token={token}"),
        None => format!("ws://{addr}/gateway"),
    };
    let (ws, _) = tokio_tungstenite::connect_async(&url)
        .await
        .expect("ws connect");
    ws
}

/// Connect with a token for `user_id` and wait for `ready`.
pub async fn connect_as(addr: SocketAddr, user_id: &str) -> Ws {
    let mut ws = connect(addr, Some(&mint_token(user_id))).await;
    let ready = next_event(&mut ws, "ready").await;
    assert_eq!(ready["data"]["userId"], user_id);
    ws
}

pub async fn send(ws: &mut Ws, event: &str, data: Value, reference: Option<&str>) {
    let mut frame = serde_json::json!({ "event": event, "data": data });
    if let Some(reference) = reference {
        frame["ref"] = Value::String(reference.to_string());
    }
    ws.send(Message::Text(frame.to_string().into()))
        .await
        .expect("ws send");
}

/// Next text frame, parsed. `None` once the server closes.
pub async fn next_frame(ws: &mut Ws) -> Option<Value> {
    loop {
        let msg = time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timeout waiting for frame")?;
        match msg {
            Ok(Message::Text(text)) => {
                return Some(serde_json::from_str(text.as_str()).expect("parse frame"))
            }
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
}

/// Skip frames until one named `event` arrives.
pub async fn next_event(ws: &mut Ws, event: &str) -> Value {
    loop {
        let frame = next_frame(ws)
            .await
            .unwrap_or_else(|| panic!("connection closed before `{event}`"));
        if frame["event"] == event {
            return frame;
        }
    }
}

/// Drain frames for `wait` and fail if any is named `event`.
pub async fn assert_no_event(ws: &mut Ws, event: &str, wait: Duration) {
    let deadline = time::Instant::now() + wait;
    loop {
        match time::timeout_at(deadline, ws.next()).await {
            Err(_elapsed) => return,
            Ok(None) => return,
            Ok(Some(Ok(Message::Text(text)))) => {
                let frame: Value = serde_json::from_str(text.as_str()).expect("parse frame");
                assert_ne!(frame["event"], event, "unexpected frame: {frame}");
            }
            Ok(Some(_)) => {}
        }
    }
}

/// Read until the server's close frame.
pub async fn next_close(ws: &mut Ws) -> Option<CloseFrame> {
    loop {
        let msg = time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timeout waiting for close")?;
        match msg {
            Ok(Message::Close(frame)) => return frame,
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually<F>(mut check: F)
where
    F: FnMut() -> bool,
{
    let deadline = time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(time::Instant::now() < deadline, "condition not met in time");
        time::sleep(Duration::from_millis(10)).await;
    }
}
