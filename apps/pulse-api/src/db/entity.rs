//! Narrow contract onto the durable entity store.
//!
//! The realtime core never touches SQL directly; it only needs these async
//! calls returning plain records.

use async_trait::async_trait;
use pulse_common::RoomId;

use crate::models::message::Message;
use crate::models::notification::{NewNotification, Notification};
use crate::models::post::Comment;
use crate::models::project::{ProjectMember, Task};
use crate::models::user::UserProfile;

#[derive(Debug, thiserror::Error)]
pub enum EntityError {
    /// The referenced entity does not exist. Carries the entity name.
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("entity store unavailable: {0}")]
    Unavailable(String),
}

impl From<diesel::result::Error> for EntityError {
    fn from(err: diesel::result::Error) -> Self {
        EntityError::Unavailable(err.to_string())
    }
}

impl From<diesel_async::pooled_connection::deadpool::PoolError> for EntityError {
    fn from(err: diesel_async::pooled_connection::deadpool::PoolError) -> Self {
        EntityError::Unavailable(err.to_string())
    }
}

/// Input for persisting a chat message.
#[derive(Debug, Clone)]
pub struct MessageDraft {
    pub conversation_id: String,
    pub sender_id: String,
    pub content: Option<String>,
    pub attachment_url: Option<String>,
}

/// A persisted comment together with the author of the post it belongs to.
#[derive(Debug, Clone)]
pub struct CreatedComment {
    pub comment: Comment,
    pub post_author_id: String,
}

#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Whether `user_id` may join `room`. Personal rooms are answered by the
    /// gateway itself and never reach the store.
    async fn find_membership(&self, room: &RoomId, user_id: &str) -> Result<bool, EntityError>;

    async fn get_user(&self, user_id: &str) -> Result<Option<UserProfile>, EntityError>;

    /// Persist a message and return it with its generated id and timestamp.
    async fn create_message(&self, draft: MessageDraft) -> Result<Message, EntityError>;

    async fn get_message(&self, message_id: &str) -> Result<Option<Message>, EntityError>;

    /// Upsert the caller's last-read pointer for a conversation.
    async fn update_last_read(
        &self,
        user_id: &str,
        conversation_id: &str,
        message_id: &str,
    ) -> Result<(), EntityError>;

    async fn list_participants(&self, conversation_id: &str) -> Result<Vec<String>, EntityError>;

    async fn create_notification(
        &self,
        notification: NewNotification,
    ) -> Result<Notification, EntityError>;

    /// Most recent first.
    async fn list_notifications(
        &self,
        recipient_id: &str,
        limit: i64,
    ) -> Result<Vec<Notification>, EntityError>;

    /// Returns `None` when the notification does not exist or belongs to
    /// someone else.
    async fn mark_notification_seen(
        &self,
        recipient_id: &str,
        notification_id: &str,
    ) -> Result<Option<Notification>, EntityError>;

    async fn create_comment(
        &self,
        post_id: &str,
        author_id: &str,
        content: &str,
    ) -> Result<CreatedComment, EntityError>;

    /// Record a like and return the post author's id.
    async fn like_post(&self, post_id: &str, user_id: &str) -> Result<String, EntityError>;

    async fn follow_user(&self, follower_id: &str, followee_id: &str) -> Result<(), EntityError>;

    async fn assign_task(
        &self,
        project_id: &str,
        task_id: &str,
        assignee_id: &str,
    ) -> Result<Task, EntityError>;

    async fn add_project_member(
        &self,
        project_id: &str,
        user_id: &str,
        role: &str,
    ) -> Result<ProjectMember, EntityError>;
}
