use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;

use crate::db::schema::notifications;

/// Durable notification row. Only `seen` ever changes after insert.
#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize)]
#[diesel(table_name = notifications)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub actor_id: String,
    pub recipient_id: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    pub seen: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = notifications)]
pub struct NewNotification {
    pub id: String,
    pub type_: String,
    pub actor_id: String,
    pub recipient_id: String,
    pub message: String,
    pub post_id: Option<String>,
    pub task_id: Option<String>,
    pub channel_id: Option<String>,
    pub project_id: Option<String>,
    pub seen: bool,
    pub created_at: DateTime<Utc>,
}

impl From<NewNotification> for Notification {
    fn from(n: NewNotification) -> Self {
        Self {
            id: n.id,
            type_: n.type_,
            actor_id: n.actor_id,
            recipient_id: n.recipient_id,
            message: n.message,
            post_id: n.post_id,
            task_id: n.task_id,
            channel_id: n.channel_id,
            project_id: n.project_id,
            seen: n.seen,
            created_at: n.created_at,
        }
    }
}
