//! Explicit routing table from client event name to typed handler, plus the
//! handlers themselves.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use pulse_common::RoomId;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use super::events::{
    ChannelPayload, ClientEvent, ConversationPayload, HeartbeatPayload, IdentifyPayload,
    MarkReadPayload, NewMessageEvent, ProjectPayload, SendMessagePayload, ServerEvent,
};
use crate::db::entity::MessageDraft;
use crate::error::GatewayError;
use crate::AppState;

/// Longest accepted message body, in characters, after trimming.
pub const MAX_MESSAGE_CHARS: usize = 4000;

/// What a handler wants sent back to the calling connection.
#[derive(Debug)]
pub enum Reply {
    /// `ack {ref, event, data?}`.
    Ack(Option<Value>),
    /// A dedicated event instead of an ack.
    Event(ServerEvent),
    /// Nothing; the handler already queued whatever the client needs.
    Silent,
}

/// The connection a frame arrived on.
#[derive(Clone)]
pub struct HandlerContext {
    pub state: AppState,
    pub connection_id: String,
}

type HandlerFuture = Pin<Box<dyn Future<Output = Result<Reply, GatewayError>> + Send>>;
type BoxedHandler = Box<dyn Fn(HandlerContext, Value) -> HandlerFuture + Send + Sync>;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TableError {
    #[error("duplicate handler for `{0}`")]
    Duplicate(String),
    #[error("no handler registered for `{0}`")]
    Missing(String),
    #[error("handler registered for unknown event `{0}`")]
    Unexpected(String),
}

#[derive(Default)]
pub struct HandlerTable {
    handlers: HashMap<&'static str, BoxedHandler>,
    duplicates: Vec<&'static str>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `event`. Its payload is decoded from the frame's
    /// `data` before the handler runs; a decode failure is a `BAD_REQUEST`.
    pub fn on<P, F, Fut>(mut self, event: &'static str, handler: F) -> Self
    where
        P: DeserializeOwned + Send + 'static,
        F: Fn(HandlerContext, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Reply, GatewayError>> + Send + 'static,
    {
        let boxed: BoxedHandler = Box::new(move |ctx: HandlerContext, data: Value| {
            let data = if data.is_null() { json!({}) } else { data };
            let fut: HandlerFuture = match serde_json::from_value::<P>(data) {
                Ok(payload) => Box::pin(handler(ctx, payload)),
                Err(e) => {
                    let err = GatewayError::BadRequest(format!("Invalid {event} payload: {e}"));
                    Box::pin(std::future::ready(Err::<Reply, _>(err)))
                }
            };
            fut
        });
        if self.handlers.insert(event, boxed).is_some() {
            self.duplicates.push(event);
        }
        self
    }

    /// Registered event names, sorted.
    pub fn events(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.handlers.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// The table must register each of `expected` exactly once and nothing else.
    pub fn validate(&self, expected: &[&str]) -> Result<(), TableError> {
        if let Some(event) = self.duplicates.first() {
            return Err(TableError::Duplicate(event.to_string()));
        }
        if let Some(event) = expected.iter().find(|e| !self.handlers.contains_key(**e)) {
            return Err(TableError::Missing(event.to_string()));
        }
        if let Some(event) = self.events().into_iter().find(|e| !expected.contains(e)) {
            return Err(TableError::Unexpected(event.to_string()));
        }
        Ok(())
    }

    pub async fn dispatch(
        &self,
        ctx: HandlerContext,
        event: &str,
        data: Value,
    ) -> Result<Reply, GatewayError> {
        let Some(handler) = self.handlers.get(event) else {
            return Err(GatewayError::BadRequest(format!("Unknown event: {event}")));
        };
        handler(ctx, data).await
    }
}

/// The gateway's routing table, validated against every client event.
pub fn routes() -> Result<HandlerTable, TableError> {
    let table = HandlerTable::new()
        .on(ClientEvent::IDENTIFY, identify)
        .on(ClientEvent::HEARTBEAT, heartbeat)
        .on(ClientEvent::JOIN_CONVERSATION, join_conversation)
        .on(ClientEvent::LEAVE_CONVERSATION, leave_conversation)
        .on(ClientEvent::JOIN_CHANNEL, join_channel)
        .on(ClientEvent::LEAVE_CHANNEL, leave_channel)
        .on(ClientEvent::JOIN_PROJECT, join_project)
        .on(ClientEvent::LEAVE_PROJECT, leave_project)
        .on(ClientEvent::SEND_MESSAGE, send_message)
        .on(ClientEvent::MARK_READ, mark_read)
        .on(ClientEvent::TYPING, typing)
        .on(ClientEvent::STOP_TYPING, stop_typing);
    table.validate(ClientEvent::ALL)?;
    Ok(table)
}

/// Verify `token` and authenticate the connection, or queue an
/// `unauthorized` rejection and close. Returns whether the connection was
/// admitted.
pub async fn identify_with(state: &AppState, connection_id: &str, token: &str) -> bool {
    match state.verifier.verify(token) {
        Ok(identity) => match state.gateway.authenticate(connection_id, identity).await {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(%connection_id, error = %e, "authenticate rejected");
                false
            }
        },
        Err(e) => {
            tracing::debug!(%connection_id, error = %e, "credential rejected");
            state.gateway.reject(connection_id, &e.to_string());
            false
        }
    }
}

async fn identify(ctx: HandlerContext, payload: IdentifyPayload) -> Result<Reply, GatewayError> {
    if ctx.state.gateway.require_identity(&ctx.connection_id).is_ok() {
        return Err(GatewayError::BadRequest("Already identified".to_string()));
    }
    identify_with(&ctx.state, &ctx.connection_id, &payload.token).await;
    Ok(Reply::Silent)
}

async fn heartbeat(_ctx: HandlerContext, _payload: HeartbeatPayload) -> Result<Reply, GatewayError> {
    Ok(Reply::Event(ServerEvent::HeartbeatAck {}))
}

// ---------------------------------------------------------------------------
// Rooms
// ---------------------------------------------------------------------------

async fn join(ctx: &HandlerContext, room: RoomId) -> Result<Reply, GatewayError> {
    ctx.state.gateway.join_room(&ctx.connection_id, &room).await?;
    Ok(Reply::Ack(Some(json!({ "room": room }))))
}

fn leave(ctx: &HandlerContext, room: RoomId) -> Result<Reply, GatewayError> {
    ctx.state.gateway.require_identity(&ctx.connection_id)?;
    ctx.state.gateway.leave_room(&ctx.connection_id, &room);
    Ok(Reply::Ack(Some(json!({ "room": room }))))
}

async fn join_conversation(ctx: HandlerContext, p: ConversationPayload) -> Result<Reply, GatewayError> {
    join(&ctx, RoomId::conversation(p.conversation_id)).await
}

async fn leave_conversation(ctx: HandlerContext, p: ConversationPayload) -> Result<Reply, GatewayError> {
    leave(&ctx, RoomId::conversation(p.conversation_id))
}

async fn join_channel(ctx: HandlerContext, p: ChannelPayload) -> Result<Reply, GatewayError> {
    join(&ctx, RoomId::channel(p.channel_id)).await
}

async fn leave_channel(ctx: HandlerContext, p: ChannelPayload) -> Result<Reply, GatewayError> {
    leave(&ctx, RoomId::channel(p.channel_id))
}

async fn join_project(ctx: HandlerContext, p: ProjectPayload) -> Result<Reply, GatewayError> {
    join(&ctx, RoomId::project(p.project_id)).await
}

async fn leave_project(ctx: HandlerContext, p: ProjectPayload) -> Result<Reply, GatewayError> {
    leave(&ctx, RoomId::project(p.project_id))
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

async fn require_member(state: &AppState, room: &RoomId, user_id: &str) -> Result<(), GatewayError> {
    if state.entities.find_membership(room, user_id).await? {
        Ok(())
    } else {
        Err(GatewayError::Forbidden(format!("Not a member of {room}")))
    }
}

/// Trimmed message body. Empty content is allowed only with an attachment.
fn validate_content(
    content: Option<&str>,
    attachment_url: Option<&str>,
) -> Result<Option<String>, GatewayError> {
    let body = content.map(str::trim).filter(|c| !c.is_empty());
    match body {
        None if attachment_url.is_none() => Err(GatewayError::BadRequest(
            "Message content is required".to_string(),
        )),
        Some(c) if c.chars().count() > MAX_MESSAGE_CHARS => Err(GatewayError::BadRequest(
            format!("Message content exceeds {MAX_MESSAGE_CHARS} characters"),
        )),
        other => Ok(other.map(str::to_string)),
    }
}

async fn send_message(ctx: HandlerContext, p: SendMessagePayload) -> Result<Reply, GatewayError> {
    let state = &ctx.state;
    let identity = state.gateway.require_identity(&ctx.connection_id)?;
    let room = RoomId::conversation(&p.conversation_id);
    require_member(state, &room, &identity.sub).await?;

    let attachment_url = p
        .attachment_url
        .map(|url| url.trim().to_string())
        .filter(|url| !url.is_empty());
    let content = validate_content(p.content.as_deref(), attachment_url.as_deref())?;

    // Broadcast only the persisted record.
    let message = state
        .entities
        .create_message(MessageDraft {
            conversation_id: p.conversation_id.clone(),
            sender_id: identity.sub.clone(),
            content,
            attachment_url,
        })
        .await?;

    let sender = match state.entities.get_user(&identity.sub).await {
        Ok(profile) => profile,
        Err(e) => {
            tracing::warn!(error = %e, user_id = %identity.sub, "sender profile lookup failed");
            None
        }
    };

    state.gateway.emit_to_room(
        &room,
        &ServerEvent::NewMessage(NewMessageEvent {
            id: message.id.clone(),
            conversation_id: message.conversation_id.clone(),
            sender_id: message.sender_id.clone(),
            content: message.content.clone(),
            attachment_url: message.attachment_url.clone(),
            sender,
            created_at: message.created_at,
        }),
    );

    let _ = state.typing.stop(&room, &identity.sub).await;
    match state.entities.list_participants(&message.conversation_id).await {
        Ok(participants) => {
            let others: Vec<String> = participants
                .into_iter()
                .filter(|user_id| *user_id != identity.sub)
                .collect();
            let _ = state.unread.increment(&others, &message.conversation_id).await;
            for recipient_id in &others {
                let connected = !state.gateway.registry().user_connections(recipient_id).is_empty()
                    || state.gateway.presence().is_online(recipient_id).await;
                if !connected {
                    let _ = state
                        .producer
                        .message_missed(&identity, recipient_id, &message)
                        .await;
                }
            }
        }
        Err(e) => tracing::warn!(error = %e, "participant lookup failed, unread counts not bumped"),
    }

    tracing::debug!(
        connection_id = %ctx.connection_id,
        message_id = %message.id,
        room = %room,
        "message sent"
    );

    let data = serde_json::to_value(&message)
        .map_err(|e| GatewayError::Internal(format!("encode message: {e}")))?;
    Ok(Reply::Ack(Some(data)))
}

async fn mark_read(ctx: HandlerContext, p: MarkReadPayload) -> Result<Reply, GatewayError> {
    let state = &ctx.state;
    let identity = state.gateway.require_identity(&ctx.connection_id)?;
    let room = RoomId::conversation(&p.conversation_id);
    require_member(state, &room, &identity.sub).await?;

    let message = state
        .entities
        .get_message(&p.message_id)
        .await?
        .filter(|m| m.conversation_id == p.conversation_id)
        .ok_or_else(|| GatewayError::NotFound("Message not found".to_string()))?;

    state
        .entities
        .update_last_read(&identity.sub, &p.conversation_id, &message.id)
        .await?;
    let _ = state.unread.clear(&identity.sub, &p.conversation_id).await;

    state.gateway.emit_to_room_except(
        &room,
        &ServerEvent::MessageRead {
            user_id: identity.sub,
            message_id: message.id,
            conversation_id: p.conversation_id,
        },
        Some(&ctx.connection_id),
    );
    Ok(Reply::Ack(None))
}

// ---------------------------------------------------------------------------
// Typing
// ---------------------------------------------------------------------------

fn require_joined(ctx: &HandlerContext, room: &RoomId) -> Result<String, GatewayError> {
    let identity = ctx.state.gateway.require_identity(&ctx.connection_id)?;
    if !ctx.state.gateway.registry().is_member(&ctx.connection_id, room) {
        return Err(GatewayError::Forbidden(format!("Join {room} first")));
    }
    Ok(identity.sub)
}

async fn typing(ctx: HandlerContext, p: ConversationPayload) -> Result<Reply, GatewayError> {
    let room = RoomId::conversation(&p.conversation_id);
    let user_id = require_joined(&ctx, &room)?;
    let _ = ctx.state.typing.start(&room, &user_id).await;
    ctx.state.gateway.emit_to_room_except(
        &room,
        &ServerEvent::UserTyping {
            user_id,
            conversation_id: p.conversation_id,
        },
        Some(&ctx.connection_id),
    );
    Ok(Reply::Ack(None))
}

async fn stop_typing(ctx: HandlerContext, p: ConversationPayload) -> Result<Reply, GatewayError> {
    let room = RoomId::conversation(&p.conversation_id);
    let user_id = require_joined(&ctx, &room)?;
    let _ = ctx.state.typing.stop(&room, &user_id).await;
    ctx.state.gateway.emit_to_room_except(
        &room,
        &ServerEvent::UserStoppedTyping {
            user_id,
            conversation_id: p.conversation_id,
        },
        Some(&ctx.connection_id),
    );
    Ok(Reply::Ack(None))
}
