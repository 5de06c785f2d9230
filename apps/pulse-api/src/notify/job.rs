//! Notification job payloads.

use std::fmt;

use chrono::Utc;
use pulse_common::id::{prefix, prefixed_ulid};
use serde::{Deserialize, Serialize};

use crate::models::notification::NewNotification;

/// Queue all notification jobs go through.
pub const NOTIFICATION_QUEUE: &str = "notifications";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationType {
    TaskAssigned,
    ProjectInvite,
    MemberAdded,
    Comment,
    Like,
    Follow,
    Message,
}

impl NotificationType {
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationType::TaskAssigned => "TASK_ASSIGNED",
            NotificationType::ProjectInvite => "PROJECT_INVITE",
            NotificationType::MemberAdded => "MEMBER_ADDED",
            NotificationType::Comment => "COMMENT",
            NotificationType::Like => "LIKE",
            NotificationType::Follow => "FOLLOW",
            NotificationType::Message => "MESSAGE",
        }
    }
}

impl fmt::Display for NotificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Entity ids the notification points at.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationJob {
    #[serde(rename = "type")]
    pub kind: NotificationType,
    pub actor_id: String,
    pub recipient_id: String,
    pub message: String,
    #[serde(default)]
    pub metadata: NotificationMetadata,
}

impl NotificationJob {
    pub fn new(
        kind: NotificationType,
        actor_id: impl Into<String>,
        recipient_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            actor_id: actor_id.into(),
            recipient_id: recipient_id.into(),
            message: message.into(),
            metadata: NotificationMetadata::default(),
        }
    }

    pub fn with_post(mut self, post_id: impl Into<String>) -> Self {
        self.metadata.post_id = Some(post_id.into());
        self
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.metadata.task_id = Some(task_id.into());
        self
    }

    pub fn with_channel(mut self, channel_id: impl Into<String>) -> Self {
        self.metadata.channel_id = Some(channel_id.into());
        self
    }

    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.metadata.project_id = Some(project_id.into());
        self
    }

    pub fn is_self_notification(&self) -> bool {
        self.actor_id == self.recipient_id
    }

    /// The row to persist for this job, unseen and stamped now.
    pub fn into_record(self) -> NewNotification {
        NewNotification {
            id: prefixed_ulid(prefix::NOTIFICATION),
            type_: self.kind.as_str().to_string(),
            actor_id: self.actor_id,
            recipient_id: self.recipient_id,
            message: self.message,
            post_id: self.metadata.post_id,
            task_id: self.metadata.task_id,
            channel_id: self.metadata.channel_id,
            project_id: self.metadata.project_id,
            seen: false,
            created_at: Utc::now(),
        }
    }
}
