//! Postgres-backed entity store.

use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use diesel::result::OptionalExtension;
use pulse_common::id::{prefix, prefixed_ulid};
use pulse_common::{RoomId, RoomKind};

use super::entity::{CreatedComment, EntityError, EntityStore, MessageDraft};
use super::pool::DbPool;
use super::schema::{
    channel_members, comments, conversation_participants, conversations, follows, messages,
    notifications, post_likes, posts, project_members, projects, read_states, tasks, users,
};
use crate::models::message::{Message, NewMessage};
use crate::models::notification::{NewNotification, Notification};
use crate::models::post::{Comment, NewComment, NewFollow, NewPostLike};
use crate::models::project::{NewProjectMember, ProjectMember, Task};
use crate::models::read_state::NewReadState;
use crate::models::user::{User, UserProfile};

#[derive(Clone)]
pub struct PgEntityStore {
    pool: DbPool,
}

impl PgEntityStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EntityStore for PgEntityStore {
    async fn find_membership(&self, room: &RoomId, user_id: &str) -> Result<bool, EntityError> {
        if room.kind() == RoomKind::User {
            return Ok(room.id() == user_id);
        }

        let mut conn = self.pool.get().await?;
        let count: i64 = match room.kind() {
            RoomKind::Conversation => {
                diesel_async::RunQueryDsl::get_result(
                    conversation_participants::table
                        .filter(conversation_participants::conversation_id.eq(room.id()))
                        .filter(conversation_participants::user_id.eq(user_id))
                        .count(),
                    &mut conn,
                )
                .await?
            }
            RoomKind::Channel => {
                diesel_async::RunQueryDsl::get_result(
                    channel_members::table
                        .filter(channel_members::channel_id.eq(room.id()))
                        .filter(channel_members::user_id.eq(user_id))
                        .count(),
                    &mut conn,
                )
                .await?
            }
            RoomKind::Project => {
                diesel_async::RunQueryDsl::get_result(
                    project_members::table
                        .filter(project_members::project_id.eq(room.id()))
                        .filter(project_members::user_id.eq(user_id))
                        .count(),
                    &mut conn,
                )
                .await?
            }
            RoomKind::User => 0,
        };

        Ok(count > 0)
    }

    async fn get_user(&self, user_id: &str) -> Result<Option<UserProfile>, EntityError> {
        let mut conn = self.pool.get().await?;
        let user: Option<User> = diesel_async::RunQueryDsl::get_result(
            users::table.find(user_id).select(User::as_select()),
            &mut conn,
        )
        .await
        .optional()?;
        Ok(user.map(UserProfile::from))
    }

    async fn create_message(&self, draft: MessageDraft) -> Result<Message, EntityError> {
        let mut conn = self.pool.get().await?;

        let exists: i64 = diesel_async::RunQueryDsl::get_result(
            conversations::table
                .filter(conversations::id.eq(&draft.conversation_id))
                .count(),
            &mut conn,
        )
        .await?;
        if exists == 0 {
            return Err(EntityError::NotFound("Conversation"));
        }

        let id = prefixed_ulid(prefix::MESSAGE);
        let message = diesel_async::RunQueryDsl::get_result(
            diesel::insert_into(messages::table)
                .values(NewMessage {
                    id: &id,
                    conversation_id: &draft.conversation_id,
                    sender_id: &draft.sender_id,
                    content: draft.content.as_deref(),
                    attachment_url: draft.attachment_url.as_deref(),
                    created_at: Utc::now(),
                })
                .returning(Message::as_returning()),
            &mut conn,
        )
        .await?;

        Ok(message)
    }

    async fn get_message(&self, message_id: &str) -> Result<Option<Message>, EntityError> {
        let mut conn = self.pool.get().await?;
        Ok(diesel_async::RunQueryDsl::get_result(
            messages::table.find(message_id).select(Message::as_select()),
            &mut conn,
        )
        .await
        .optional()?)
    }

    async fn update_last_read(
        &self,
        user_id: &str,
        conversation_id: &str,
        message_id: &str,
    ) -> Result<(), EntityError> {
        let mut conn = self.pool.get().await?;
        let now = Utc::now();
        diesel_async::RunQueryDsl::execute(
            diesel::insert_into(read_states::table)
                .values(NewReadState {
                    user_id,
                    conversation_id,
                    last_read_message_id: message_id,
                    updated_at: now,
                })
                .on_conflict((read_states::user_id, read_states::conversation_id))
                .do_update()
                .set((
                    read_states::last_read_message_id.eq(message_id),
                    read_states::updated_at.eq(now),
                )),
            &mut conn,
        )
        .await?;
        Ok(())
    }

    async fn list_participants(&self, conversation_id: &str) -> Result<Vec<String>, EntityError> {
        let mut conn = self.pool.get().await?;
        let participants: Vec<String> = diesel_async::RunQueryDsl::load(
            conversation_participants::table
                .filter(conversation_participants::conversation_id.eq(conversation_id))
                .select(conversation_participants::user_id),
            &mut conn,
        )
        .await?;

        if participants.is_empty() {
            let exists: i64 = diesel_async::RunQueryDsl::get_result(
                conversations::table
                    .filter(conversations::id.eq(conversation_id))
                    .count(),
                &mut conn,
            )
            .await?;
            if exists == 0 {
                return Err(EntityError::NotFound("Conversation"));
            }
        }

        Ok(participants)
    }

    async fn create_notification(
        &self,
        notification: NewNotification,
    ) -> Result<Notification, EntityError> {
        let mut conn = self.pool.get().await?;
        Ok(diesel_async::RunQueryDsl::get_result(
            diesel::insert_into(notifications::table)
                .values(&notification)
                .returning(Notification::as_returning()),
            &mut conn,
        )
        .await?)
    }

    async fn list_notifications(
        &self,
        recipient_id: &str,
        limit: i64,
    ) -> Result<Vec<Notification>, EntityError> {
        let mut conn = self.pool.get().await?;
        Ok(diesel_async::RunQueryDsl::load(
            notifications::table
                .filter(notifications::recipient_id.eq(recipient_id))
                .order((notifications::created_at.desc(), notifications::id.desc()))
                .limit(limit)
                .select(Notification::as_select()),
            &mut conn,
        )
        .await?)
    }

    async fn mark_notification_seen(
        &self,
        recipient_id: &str,
        notification_id: &str,
    ) -> Result<Option<Notification>, EntityError> {
        let mut conn = self.pool.get().await?;
        Ok(diesel_async::RunQueryDsl::get_result(
            diesel::update(
                notifications::table
                    .filter(notifications::id.eq(notification_id))
                    .filter(notifications::recipient_id.eq(recipient_id)),
            )
            .set(notifications::seen.eq(true))
            .returning(Notification::as_returning()),
            &mut conn,
        )
        .await
        .optional()?)
    }

    async fn create_comment(
        &self,
        post_id: &str,
        author_id: &str,
        content: &str,
    ) -> Result<CreatedComment, EntityError> {
        let mut conn = self.pool.get().await?;

        let post_author_id: String = diesel_async::RunQueryDsl::get_result(
            posts::table.find(post_id).select(posts::author_id),
            &mut conn,
        )
        .await
        .optional()?
        .ok_or(EntityError::NotFound("Post"))?;

        let id = prefixed_ulid(prefix::COMMENT);
        let comment: Comment = diesel_async::RunQueryDsl::get_result(
            diesel::insert_into(comments::table)
                .values(NewComment {
                    id: &id,
                    post_id,
                    author_id,
                    content,
                    created_at: Utc::now(),
                })
                .returning(Comment::as_returning()),
            &mut conn,
        )
        .await?;

        Ok(CreatedComment {
            comment,
            post_author_id,
        })
    }

    async fn like_post(&self, post_id: &str, user_id: &str) -> Result<String, EntityError> {
        let mut conn = self.pool.get().await?;

        let author_id: String = diesel_async::RunQueryDsl::get_result(
            posts::table.find(post_id).select(posts::author_id),
            &mut conn,
        )
        .await
        .optional()?
        .ok_or(EntityError::NotFound("Post"))?;

        let inserted = diesel_async::RunQueryDsl::execute(
            diesel::insert_into(post_likes::table)
                .values(NewPostLike {
                    post_id,
                    user_id,
                    created_at: Utc::now(),
                })
                .on_conflict_do_nothing(),
            &mut conn,
        )
        .await?;
        if inserted == 0 {
            return Err(EntityError::Conflict("Post already liked".to_string()));
        }

        Ok(author_id)
    }

    async fn follow_user(&self, follower_id: &str, followee_id: &str) -> Result<(), EntityError> {
        let mut conn = self.pool.get().await?;

        let exists: i64 = diesel_async::RunQueryDsl::get_result(
            users::table.filter(users::id.eq(followee_id)).count(),
            &mut conn,
        )
        .await?;
        if exists == 0 {
            return Err(EntityError::NotFound("User"));
        }

        let inserted = diesel_async::RunQueryDsl::execute(
            diesel::insert_into(follows::table)
                .values(NewFollow {
                    follower_id,
                    followee_id,
                    created_at: Utc::now(),
                })
                .on_conflict_do_nothing(),
            &mut conn,
        )
        .await?;
        if inserted == 0 {
            return Err(EntityError::Conflict("Already following".to_string()));
        }

        Ok(())
    }

    async fn assign_task(
        &self,
        project_id: &str,
        task_id: &str,
        assignee_id: &str,
    ) -> Result<Task, EntityError> {
        let mut conn = self.pool.get().await?;

        let project_exists: i64 = diesel_async::RunQueryDsl::get_result(
            projects::table.filter(projects::id.eq(project_id)).count(),
            &mut conn,
        )
        .await?;
        if project_exists == 0 {
            return Err(EntityError::NotFound("Project"));
        }

        let assignee_is_member: i64 = diesel_async::RunQueryDsl::get_result(
            project_members::table
                .filter(project_members::project_id.eq(project_id))
                .filter(project_members::user_id.eq(assignee_id))
                .count(),
            &mut conn,
        )
        .await?;
        if assignee_is_member == 0 {
            return Err(EntityError::Conflict(
                "Assignee is not a project member".to_string(),
            ));
        }

        let task: Option<Task> = diesel_async::RunQueryDsl::get_result(
            diesel::update(
                tasks::table
                    .filter(tasks::id.eq(task_id))
                    .filter(tasks::project_id.eq(project_id)),
            )
            .set((
                tasks::assignee_id.eq(Some(assignee_id)),
                tasks::updated_at.eq(Utc::now()),
            ))
            .returning(Task::as_returning()),
            &mut conn,
        )
        .await
        .optional()?;

        task.ok_or(EntityError::NotFound("Task"))
    }

    async fn add_project_member(
        &self,
        project_id: &str,
        user_id: &str,
        role: &str,
    ) -> Result<ProjectMember, EntityError> {
        let mut conn = self.pool.get().await?;

        let project_exists: i64 = diesel_async::RunQueryDsl::get_result(
            projects::table.filter(projects::id.eq(project_id)).count(),
            &mut conn,
        )
        .await?;
        if project_exists == 0 {
            return Err(EntityError::NotFound("Project"));
        }

        let user_exists: i64 = diesel_async::RunQueryDsl::get_result(
            users::table.filter(users::id.eq(user_id)).count(),
            &mut conn,
        )
        .await?;
        if user_exists == 0 {
            return Err(EntityError::NotFound("User"));
        }

        let member: Option<ProjectMember> = diesel_async::RunQueryDsl::get_result(
            diesel::insert_into(project_members::table)
                .values(NewProjectMember {
                    project_id,
                    user_id,
                    role,
                    created_at: Utc::now(),
                })
                .on_conflict_do_nothing()
                .returning(ProjectMember::as_returning()),
            &mut conn,
        )
        .await
        .optional()?;

        member.ok_or_else(|| EntityError::Conflict("Already a project member".to_string()))
    }
}
