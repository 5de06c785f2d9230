//! In-memory entity store for local runs and tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use pulse_common::id::{prefix, prefixed_ulid};
use pulse_common::{RoomId, RoomKind};

use super::entity::{CreatedComment, EntityError, EntityStore, MessageDraft};
use crate::models::message::Message;
use crate::models::notification::{NewNotification, Notification};
use crate::models::post::{Comment, Post};
use crate::models::project::{ProjectMember, Task};
use crate::models::user::UserProfile;

#[derive(Default)]
struct State {
    users: HashMap<String, UserProfile>,
    conversations: HashMap<String, Vec<String>>,
    channel_members: HashMap<String, HashSet<String>>,
    messages: HashMap<String, Message>,
    read_states: HashMap<(String, String), String>,
    posts: HashMap<String, Post>,
    comments: Vec<Comment>,
    likes: HashSet<(String, String)>,
    follows: HashSet<(String, String)>,
    projects: HashMap<String, Vec<ProjectMember>>,
    tasks: HashMap<String, Task>,
    notifications: Vec<Notification>,
}

pub struct MemoryEntityStore {
    state: Mutex<State>,
    failing_notification_writes: AtomicUsize,
}

impl MemoryEntityStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            failing_notification_writes: AtomicUsize::new(0),
        }
    }

    pub fn add_user(&self, id: &str, handle: &str) {
        self.state.lock().users.insert(
            id.to_string(),
            UserProfile {
                id: id.to_string(),
                handle: handle.to_string(),
                display_name: handle.to_string(),
                avatar_url: None,
            },
        );
    }

    pub fn add_conversation(&self, id: &str, participants: &[&str]) {
        self.state.lock().conversations.insert(
            id.to_string(),
            participants.iter().map(|p| p.to_string()).collect(),
        );
    }

    pub fn add_channel_member(&self, channel_id: &str, user_id: &str) {
        self.state
            .lock()
            .channel_members
            .entry(channel_id.to_string())
            .or_default()
            .insert(user_id.to_string());
    }

    pub fn add_post(&self, id: &str, author_id: &str) {
        self.state.lock().posts.insert(
            id.to_string(),
            Post {
                id: id.to_string(),
                author_id: author_id.to_string(),
                content: String::new(),
                created_at: Utc::now(),
            },
        );
    }

    pub fn add_project(&self, id: &str, members: &[(&str, &str)]) {
        let now = Utc::now();
        self.state.lock().projects.insert(
            id.to_string(),
            members
                .iter()
                .map(|(user_id, role)| ProjectMember {
                    project_id: id.to_string(),
                    user_id: user_id.to_string(),
                    role: role.to_string(),
                    created_at: now,
                })
                .collect(),
        );
    }

    pub fn add_task(&self, id: &str, project_id: &str, title: &str) {
        self.state.lock().tasks.insert(
            id.to_string(),
            Task {
                id: id.to_string(),
                project_id: project_id.to_string(),
                title: title.to_string(),
                assignee_id: None,
                updated_at: Utc::now(),
            },
        );
    }

    /// Make the next `n` notification inserts fail as if the database were down.
    pub fn fail_notification_writes(&self, n: usize) {
        self.failing_notification_writes.store(n, Ordering::SeqCst);
    }

    pub fn notifications_for(&self, recipient_id: &str) -> Vec<Notification> {
        self.state
            .lock()
            .notifications
            .iter()
            .filter(|n| n.recipient_id == recipient_id)
            .cloned()
            .collect()
    }

    pub fn comments_on(&self, post_id: &str) -> Vec<Comment> {
        self.state
            .lock()
            .comments
            .iter()
            .filter(|c| c.post_id == post_id)
            .cloned()
            .collect()
    }

    pub fn last_read(&self, user_id: &str, conversation_id: &str) -> Option<String> {
        self.state
            .lock()
            .read_states
            .get(&(user_id.to_string(), conversation_id.to_string()))
            .cloned()
    }

    fn take_notification_failure(&self) -> bool {
        self.failing_notification_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for MemoryEntityStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EntityStore for MemoryEntityStore {
    async fn find_membership(&self, room: &RoomId, user_id: &str) -> Result<bool, EntityError> {
        let state = self.state.lock();
        let member = match room.kind() {
            RoomKind::Conversation => state
                .conversations
                .get(room.id())
                .is_some_and(|p| p.iter().any(|u| u == user_id)),
            RoomKind::Channel => state
                .channel_members
                .get(room.id())
                .is_some_and(|m| m.contains(user_id)),
            RoomKind::Project => state
                .projects
                .get(room.id())
                .is_some_and(|m| m.iter().any(|pm| pm.user_id == user_id)),
            RoomKind::User => room.id() == user_id,
        };
        Ok(member)
    }

    async fn get_user(&self, user_id: &str) -> Result<Option<UserProfile>, EntityError> {
        Ok(self.state.lock().users.get(user_id).cloned())
    }

    async fn create_message(&self, draft: MessageDraft) -> Result<Message, EntityError> {
        let mut state = self.state.lock();
        if !state.conversations.contains_key(&draft.conversation_id) {
            return Err(EntityError::NotFound("Conversation"));
        }
        let message = Message {
            id: prefixed_ulid(prefix::MESSAGE),
            conversation_id: draft.conversation_id,
            sender_id: draft.sender_id,
            content: draft.content,
            attachment_url: draft.attachment_url,
            created_at: Utc::now(),
        };
        state.messages.insert(message.id.clone(), message.clone());
        Ok(message)
    }

    async fn get_message(&self, message_id: &str) -> Result<Option<Message>, EntityError> {
        Ok(self.state.lock().messages.get(message_id).cloned())
    }

    async fn update_last_read(
        &self,
        user_id: &str,
        conversation_id: &str,
        message_id: &str,
    ) -> Result<(), EntityError> {
        self.state.lock().read_states.insert(
            (user_id.to_string(), conversation_id.to_string()),
            message_id.to_string(),
        );
        Ok(())
    }

    async fn list_participants(&self, conversation_id: &str) -> Result<Vec<String>, EntityError> {
        self.state
            .lock()
            .conversations
            .get(conversation_id)
            .cloned()
            .ok_or(EntityError::NotFound("Conversation"))
    }

    async fn create_notification(
        &self,
        notification: NewNotification,
    ) -> Result<Notification, EntityError> {
        if self.take_notification_failure() {
            return Err(EntityError::Unavailable("injected failure".to_string()));
        }
        let record = Notification::from(notification);
        self.state.lock().notifications.push(record.clone());
        Ok(record)
    }

    async fn list_notifications(
        &self,
        recipient_id: &str,
        limit: i64,
    ) -> Result<Vec<Notification>, EntityError> {
        let state = self.state.lock();
        let mut found: Vec<Notification> = state
            .notifications
            .iter()
            .filter(|n| n.recipient_id == recipient_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        found.truncate(limit.max(0) as usize);
        Ok(found)
    }

    async fn mark_notification_seen(
        &self,
        recipient_id: &str,
        notification_id: &str,
    ) -> Result<Option<Notification>, EntityError> {
        let mut state = self.state.lock();
        Ok(state
            .notifications
            .iter_mut()
            .find(|n| n.id == notification_id && n.recipient_id == recipient_id)
            .map(|n| {
                n.seen = true;
                n.clone()
            }))
    }

    async fn create_comment(
        &self,
        post_id: &str,
        author_id: &str,
        content: &str,
    ) -> Result<CreatedComment, EntityError> {
        let mut state = self.state.lock();
        let post_author_id = state
            .posts
            .get(post_id)
            .map(|p| p.author_id.clone())
            .ok_or(EntityError::NotFound("Post"))?;
        let comment = Comment {
            id: prefixed_ulid(prefix::COMMENT),
            post_id: post_id.to_string(),
            author_id: author_id.to_string(),
            content: content.to_string(),
            created_at: Utc::now(),
        };
        state.comments.push(comment.clone());
        Ok(CreatedComment {
            comment,
            post_author_id,
        })
    }

    async fn like_post(&self, post_id: &str, user_id: &str) -> Result<String, EntityError> {
        let mut state = self.state.lock();
        let author_id = state
            .posts
            .get(post_id)
            .map(|p| p.author_id.clone())
            .ok_or(EntityError::NotFound("Post"))?;
        if !state.likes.insert((post_id.to_string(), user_id.to_string())) {
            return Err(EntityError::Conflict("Post already liked".to_string()));
        }
        Ok(author_id)
    }

    async fn follow_user(&self, follower_id: &str, followee_id: &str) -> Result<(), EntityError> {
        let mut state = self.state.lock();
        if !state.users.contains_key(followee_id) {
            return Err(EntityError::NotFound("User"));
        }
        if !state
            .follows
            .insert((follower_id.to_string(), followee_id.to_string()))
        {
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
        let mut state = self.state.lock();
        let assignee_is_member = state
            .projects
            .get(project_id)
            .ok_or(EntityError::NotFound("Project"))?
            .iter()
            .any(|m| m.user_id == assignee_id);
        if !assignee_is_member {
            return Err(EntityError::Conflict(
                "Assignee is not a project member".to_string(),
            ));
        }
        let task = state
            .tasks
            .get_mut(task_id)
            .filter(|t| t.project_id == project_id)
            .ok_or(EntityError::NotFound("Task"))?;
        task.assignee_id = Some(assignee_id.to_string());
        task.updated_at = Utc::now();
        Ok(task.clone())
    }

    async fn add_project_member(
        &self,
        project_id: &str,
        user_id: &str,
        role: &str,
    ) -> Result<ProjectMember, EntityError> {
        let mut state = self.state.lock();
        if !state.users.contains_key(user_id) {
            return Err(EntityError::NotFound("User"));
        }
        let members = state
            .projects
            .get_mut(project_id)
            .ok_or(EntityError::NotFound("Project"))?;
        if members.iter().any(|m| m.user_id == user_id) {
            return Err(EntityError::Conflict("Already a project member".to_string()));
        }
        let member = ProjectMember {
            project_id: project_id.to_string(),
            user_id: user_id.to_string(),
            role: role.to_string(),
            created_at: Utc::now(),
        };
        members.push(member.clone());
        Ok(member)
    }
}
