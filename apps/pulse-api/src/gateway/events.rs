//! Wire format for gateway frames.
//!
//! Every frame is a JSON text message `{"event": <name>, "data": {...}}`.
//! Client frames may carry a `ref` that is echoed back in the reply.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::notification::Notification;
use crate::models::user::UserProfile;

// ---------------------------------------------------------------------------
// Client → Server
// ---------------------------------------------------------------------------

/// A frame received from the client. `data` stays untyped until the routing
/// table picks the handler that knows its shape.
#[derive(Debug, Deserialize)]
pub struct ClientFrame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, rename = "ref")]
    pub reference: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct IdentifyPayload {
    pub token: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct HeartbeatPayload {}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationPayload {
    pub conversation_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelPayload {
    pub channel_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectPayload {
    pub project_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessagePayload {
    pub conversation_id: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub attachment_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkReadPayload {
    pub conversation_id: String,
    pub message_id: String,
}

/// Client event names. The routing table must cover exactly these.
pub struct ClientEvent;

impl ClientEvent {
    pub const IDENTIFY: &'static str = "identify";
    pub const HEARTBEAT: &'static str = "heartbeat";
    pub const JOIN_CONVERSATION: &'static str = "joinConversation";
    pub const LEAVE_CONVERSATION: &'static str = "leaveConversation";
    pub const JOIN_CHANNEL: &'static str = "joinChannel";
    pub const LEAVE_CHANNEL: &'static str = "leaveChannel";
    pub const JOIN_PROJECT: &'static str = "joinProject";
    pub const LEAVE_PROJECT: &'static str = "leaveProject";
    pub const SEND_MESSAGE: &'static str = "sendMessage";
    pub const MARK_READ: &'static str = "markRead";
    pub const TYPING: &'static str = "typing";
    pub const STOP_TYPING: &'static str = "stopTyping";

    pub const ALL: &'static [&'static str] = &[
        Self::IDENTIFY,
        Self::HEARTBEAT,
        Self::JOIN_CONVERSATION,
        Self::LEAVE_CONVERSATION,
        Self::JOIN_CHANNEL,
        Self::LEAVE_CHANNEL,
        Self::JOIN_PROJECT,
        Self::LEAVE_PROJECT,
        Self::SEND_MESSAGE,
        Self::MARK_READ,
        Self::TYPING,
        Self::STOP_TYPING,
    ];
}

// ---------------------------------------------------------------------------
// Server → Client
// ---------------------------------------------------------------------------

/// `newMessage` payload: the persisted record plus the sender's profile.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessageEvent {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub content: Option<String>,
    pub attachment_url: Option<String>,
    pub sender: Option<UserProfile>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Every event the server pushes, one variant per event name.
#[derive(Debug, Clone, Serialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    Ready {
        connection_id: String,
        user_id: String,
    },
    Ack {
        #[serde(rename = "ref")]
        reference: Option<String>,
        event: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
    Error {
        #[serde(rename = "ref")]
        reference: Option<String>,
        event: String,
        code: &'static str,
        message: String,
    },
    Unauthorized {
        message: String,
    },
    HeartbeatAck {},
    UserOnline {
        user_id: String,
    },
    UserOffline {
        user_id: String,
    },
    NewMessage(NewMessageEvent),
    MessageRead {
        user_id: String,
        message_id: String,
        conversation_id: String,
    },
    UserTyping {
        user_id: String,
        conversation_id: String,
    },
    UserStoppedTyping {
        user_id: String,
        conversation_id: String,
    },
    Notification(Notification),
    #[serde(rename = "task:assigned")]
    TaskAssigned {
        task_id: String,
        project_id: String,
        assignee_id: String,
        actor_id: String,
        task_title: String,
    },
    #[serde(rename = "member:added")]
    MemberAdded {
        project_id: String,
        member_id: String,
        role: String,
        actor_id: String,
    },
    #[serde(rename = "project:invited")]
    ProjectInvited {
        project_id: String,
        invitee_id: String,
        actor_id: String,
    },
    #[serde(rename = "post:commented")]
    PostCommented {
        post_id: String,
        comment_id: String,
        actor_id: String,
    },
    #[serde(rename = "post:liked")]
    PostLiked {
        post_id: String,
        actor_id: String,
    },
    #[serde(rename = "user:followed")]
    UserFollowed {
        user_id: String,
        actor_id: String,
    },
}

impl ServerEvent {
    /// Wire name, for logs.
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Ready { .. } => "ready",
            ServerEvent::Ack { .. } => "ack",
            ServerEvent::Error { .. } => "error",
            ServerEvent::Unauthorized { .. } => "unauthorized",
            ServerEvent::HeartbeatAck {} => "heartbeatAck",
            ServerEvent::UserOnline { .. } => "userOnline",
            ServerEvent::UserOffline { .. } => "userOffline",
            ServerEvent::NewMessage(_) => "newMessage",
            ServerEvent::MessageRead { .. } => "messageRead",
            ServerEvent::UserTyping { .. } => "userTyping",
            ServerEvent::UserStoppedTyping { .. } => "userStoppedTyping",
            ServerEvent::Notification(_) => "notification",
            ServerEvent::TaskAssigned { .. } => "task:assigned",
            ServerEvent::MemberAdded { .. } => "member:added",
            ServerEvent::ProjectInvited { .. } => "project:invited",
            ServerEvent::PostCommented { .. } => "post:commented",
            ServerEvent::PostLiked { .. } => "post:liked",
            ServerEvent::UserFollowed { .. } => "user:followed",
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
