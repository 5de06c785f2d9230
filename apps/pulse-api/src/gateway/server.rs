//! WebSocket upgrade handler and per-connection event loop.

use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};

use super::events::{ClientEvent, ClientFrame, IdentifyPayload, ServerEvent};
use super::fanout::CLOSE_SESSION_TIMEOUT;
use super::handler::{identify_with, HandlerContext, Reply};
use super::session::{Outbound, OUTBOUND_CAPACITY};
use crate::auth::tokens::{bearer_token, AuthError};
use crate::config::AuthMode;
use crate::AppState;

/// Clients are expected to heartbeat this often.
pub const HEARTBEAT_INTERVAL_MS: u64 = 30_000;

/// Time allowed for an `identify` frame when no credential came with the upgrade.
const IDENTIFY_TIMEOUT_SECS: u64 = 10;

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

#[derive(Debug, Deserialize)]
pub struct GatewayQuery {
    token: Option<String>,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/gateway", get(ws_upgrade))
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<GatewayQuery>,
) -> impl IntoResponse {
    let token = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token)
        .map(str::to_string)
        .or(query.token);
    ws.on_upgrade(move |socket| handle_connection(socket, state, token))
}

async fn handle_connection(socket: WebSocket, state: AppState, token: Option<String>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut outbound) = mpsc::channel(OUTBOUND_CAPACITY);
    let connection_id = state.gateway.connect(tx);
    tracing::debug!(%connection_id, "gateway connection opened");

    let admitted = match token {
        Some(token) => identify_with(&state, &connection_id, &token).await,
        None => match state.config.auth_mode {
            AuthMode::Optional => {
                state.gateway.observe(&connection_id);
                true
            }
            AuthMode::Required => await_identify(&state, &connection_id, &mut ws_rx).await,
        },
    };

    if admitted {
        run_connection(&state, &connection_id, &mut ws_tx, &mut ws_rx, &mut outbound).await;
    } else {
        flush(&mut outbound, &mut ws_tx).await;
    }

    state.gateway.disconnect(&connection_id).await;
}

/// Required-auth handshake without a credential on the upgrade: the first
/// frame must be `identify`.
async fn await_identify(state: &AppState, connection_id: &str, ws_rx: &mut WsStream) -> bool {
    let first = time::timeout(Duration::from_secs(IDENTIFY_TIMEOUT_SECS), async {
        while let Some(msg) = ws_rx.next().await {
            match msg {
                Ok(Message::Text(text)) => return Some(text.as_str().to_string()),
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => continue,
            }
        }
        None
    })
    .await;

    let text = match first {
        Ok(Some(text)) => text,
        Ok(None) => return false,
        Err(_timeout) => {
            state.gateway.send(
                connection_id,
                &ServerEvent::Unauthorized {
                    message: "Handshake timeout".to_string(),
                },
            );
            state
                .gateway
                .close(connection_id, CLOSE_SESSION_TIMEOUT, "Handshake timeout");
            return false;
        }
    };

    let payload = serde_json::from_str::<ClientFrame>(&text)
        .ok()
        .filter(|frame| frame.event == ClientEvent::IDENTIFY)
        .and_then(|frame| serde_json::from_value::<IdentifyPayload>(frame.data).ok());
    match payload {
        Some(payload) => identify_with(state, connection_id, &payload.token).await,
        None => {
            state
                .gateway
                .reject(connection_id, &AuthError::Missing.to_string());
            false
        }
    }
}

/// Main loop: read client frames, drain the outbound queue, enforce heartbeat.
async fn run_connection(
    state: &AppState,
    connection_id: &str,
    ws_tx: &mut WsSink,
    ws_rx: &mut WsStream,
    outbound: &mut mpsc::Receiver<Outbound>,
) {
    // Client must send something within 1.5x the heartbeat interval.
    let deadline = Duration::from_millis(HEARTBEAT_INTERVAL_MS * 3 / 2);
    let idle = time::sleep(deadline);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        idle.as_mut().reset(Instant::now() + deadline);
                        state.gateway.touch(connection_id).await;
                        handle_frame(state, connection_id, text.as_str()).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(?e, %connection_id, "ws read error");
                        break;
                    }
                    Some(Ok(_)) => continue,
                }
            }

            item = outbound.recv() => {
                match item {
                    Some(item) => {
                        if !write(ws_tx, item).await {
                            break;
                        }
                    }
                    None => break,
                }
            }

            () = &mut idle => {
                tracing::debug!(%connection_id, "heartbeat timeout, closing connection");
                let _ = send_close(ws_tx, CLOSE_SESSION_TIMEOUT, "Heartbeat timeout").await;
                break;
            }
        }
    }
}

async fn handle_frame(state: &AppState, connection_id: &str, text: &str) {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(_) => {
            state.gateway.send(
                connection_id,
                &ServerEvent::Error {
                    reference: None,
                    event: "unknown".to_string(),
                    code: "BAD_REQUEST",
                    message: "Invalid JSON frame".to_string(),
                },
            );
            return;
        }
    };

    let ClientFrame {
        event,
        data,
        reference,
    } = frame;
    let ctx = HandlerContext {
        state: state.clone(),
        connection_id: connection_id.to_string(),
    };

    let reply = match state.handlers.dispatch(ctx, &event, data).await {
        Ok(Reply::Ack(data)) => ServerEvent::Ack {
            reference,
            event,
            data,
        },
        Ok(Reply::Event(reply)) => reply,
        Ok(Reply::Silent) => return,
        Err(err) => {
            tracing::debug!(%connection_id, %event, code = err.code(), error = %err, "gateway event rejected");
            ServerEvent::Error {
                reference,
                event,
                code: err.code(),
                message: err.to_string(),
            }
        }
    };
    state.gateway.send(connection_id, &reply);
}

/// Write whatever is already queued, stopping at a close.
async fn flush(outbound: &mut mpsc::Receiver<Outbound>, ws_tx: &mut WsSink) {
    while let Ok(item) = outbound.try_recv() {
        if !write(ws_tx, item).await {
            break;
        }
    }
}

/// Returns false once the socket should stop.
async fn write(ws_tx: &mut WsSink, item: Outbound) -> bool {
    match item {
        Outbound::Frame(text) => ws_tx.send(Message::Text(text.to_string().into())).await.is_ok(),
        Outbound::Close { code, reason } => {
            let _ = send_close(ws_tx, code, &reason).await;
            false
        }
    }
}

/// Send a WebSocket close frame with a code and reason.
async fn send_close(ws_tx: &mut WsSink, code: u16, reason: &str) -> Result<(), axum::Error> {
    let close_msg = Message::Close(Some(CloseFrame {
        code,
        reason: reason.to_string().into(),
    }));
    ws_tx.send(close_msg).await
}
