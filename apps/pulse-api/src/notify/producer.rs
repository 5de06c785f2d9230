//! Domain event producers. Each call pairs an optional direct push with a
//! durable notification job; neither can fail the caller's own write.

use std::sync::Arc;

use pulse_common::RoomId;

use super::job::{NotificationJob, NotificationType, NOTIFICATION_QUEUE};
use super::queue::{JobOptions, QueueTransport};
use crate::auth::tokens::Identity;
use crate::gateway::events::ServerEvent;
use crate::gateway::Gateway;
use crate::models::message::Message;
use crate::models::post::Comment;
use crate::models::project::{ProjectMember, Task};
use crate::outcome::BestEffort;

#[derive(Clone)]
pub struct NotificationProducer {
    queue: Arc<dyn QueueTransport>,
    gateway: Arc<Gateway>,
    options: JobOptions,
}

impl NotificationProducer {
    pub fn new(queue: Arc<dyn QueueTransport>, gateway: Arc<Gateway>, options: JobOptions) -> Self {
        Self {
            queue,
            gateway,
            options,
        }
    }

    /// Queue `job`. An unreachable queue is logged and reported as `Degraded`.
    pub async fn enqueue(&self, job: &NotificationJob) -> BestEffort<String> {
        let payload = match serde_json::to_value(job) {
            Ok(payload) => payload,
            Err(e) => return BestEffort::from_result(Err(e), "notification.encode"),
        };
        let queued = self
            .queue
            .enqueue(NOTIFICATION_QUEUE, payload, self.options)
            .await;
        let outcome = BestEffort::from_result(queued, "notification.enqueue");
        if let BestEffort::Ok(job_id) = &outcome {
            tracing::debug!(
                %job_id,
                kind = %job.kind,
                recipient_id = %job.recipient_id,
                "notification queued"
            );
        }
        outcome
    }

    /// Push `direct` to the recipient's personal room, then queue `job`.
    /// Self-notifications are dropped and yield `Ok(None)`.
    pub async fn notify(
        &self,
        job: NotificationJob,
        direct: Option<ServerEvent>,
    ) -> BestEffort<Option<String>> {
        if job.is_self_notification() {
            return BestEffort::Ok(None);
        }
        if let Some(event) = direct {
            self.gateway.emit_to_user(&job.recipient_id, &event);
        }
        self.enqueue(&job).await.map(Some)
    }

    pub async fn comment_posted(
        &self,
        actor: &Identity,
        post_author_id: &str,
        comment: &Comment,
    ) -> BestEffort<Option<String>> {
        let job = NotificationJob::new(
            NotificationType::Comment,
            &actor.sub,
            post_author_id,
            format!("{} commented on your post", actor.handle),
        )
        .with_post(&comment.post_id);
        let event = ServerEvent::PostCommented {
            post_id: comment.post_id.clone(),
            comment_id: comment.id.clone(),
            actor_id: actor.sub.clone(),
        };
        self.notify(job, Some(event)).await
    }

    pub async fn post_liked(
        &self,
        actor: &Identity,
        post_author_id: &str,
        post_id: &str,
    ) -> BestEffort<Option<String>> {
        let job = NotificationJob::new(
            NotificationType::Like,
            &actor.sub,
            post_author_id,
            format!("{} liked your post", actor.handle),
        )
        .with_post(post_id);
        let event = ServerEvent::PostLiked {
            post_id: post_id.to_string(),
            actor_id: actor.sub.clone(),
        };
        self.notify(job, Some(event)).await
    }

    pub async fn user_followed(&self, actor: &Identity, followee_id: &str) -> BestEffort<Option<String>> {
        let job = NotificationJob::new(
            NotificationType::Follow,
            &actor.sub,
            followee_id,
            format!("{} started following you", actor.handle),
        );
        let event = ServerEvent::UserFollowed {
            user_id: followee_id.to_string(),
            actor_id: actor.sub.clone(),
        };
        self.notify(job, Some(event)).await
    }

    /// A message for a participant with no live connection anywhere. No
    /// direct push: they have nowhere to receive it.
    pub async fn message_missed(
        &self,
        sender: &Identity,
        recipient_id: &str,
        message: &Message,
    ) -> BestEffort<Option<String>> {
        let job = NotificationJob::new(
            NotificationType::Message,
            &sender.sub,
            recipient_id,
            format!("{} sent you a message", sender.handle),
        )
        .with_channel(&message.conversation_id);
        self.notify(job, None).await
    }

    pub async fn project_invite(
        &self,
        actor: &Identity,
        project_id: &str,
        invitee_id: &str,
    ) -> BestEffort<Option<String>> {
        let job = NotificationJob::new(
            NotificationType::ProjectInvite,
            &actor.sub,
            invitee_id,
            format!("{} invited you to a project", actor.handle),
        )
        .with_project(project_id);
        let event = ServerEvent::ProjectInvited {
            project_id: project_id.to_string(),
            invitee_id: invitee_id.to_string(),
            actor_id: actor.sub.clone(),
        };
        self.notify(job, Some(event)).await
    }

    /// `task:assigned` goes to the project board and the assignee; the
    /// assignee also gets a durable notification.
    pub async fn task_assigned(&self, actor: &Identity, task: &Task) -> BestEffort<Option<String>> {
        let Some(assignee_id) = task.assignee_id.clone() else {
            return BestEffort::Ok(None);
        };
        let event = ServerEvent::TaskAssigned {
            task_id: task.id.clone(),
            project_id: task.project_id.clone(),
            assignee_id: assignee_id.clone(),
            actor_id: actor.sub.clone(),
            task_title: task.title.clone(),
        };
        self.gateway
            .emit_to_room(&RoomId::project(&task.project_id), &event);

        let job = NotificationJob::new(
            NotificationType::TaskAssigned,
            &actor.sub,
            assignee_id,
            format!("{} assigned you to \"{}\"", actor.handle, task.title),
        )
        .with_task(&task.id)
        .with_project(&task.project_id);
        self.notify(job, Some(event)).await
    }

    /// `member:added` goes to the project board and the new member, who has
    /// not joined the board yet.
    pub async fn member_added(
        &self,
        actor: &Identity,
        member: &ProjectMember,
    ) -> BestEffort<Option<String>> {
        let event = ServerEvent::MemberAdded {
            project_id: member.project_id.clone(),
            member_id: member.user_id.clone(),
            role: member.role.clone(),
            actor_id: actor.sub.clone(),
        };
        self.gateway
            .emit_to_room(&RoomId::project(&member.project_id), &event);

        let job = NotificationJob::new(
            NotificationType::MemberAdded,
            &actor.sub,
            &member.user_id,
            format!("{} added you to a project as {}", actor.handle, member.role),
        )
        .with_project(&member.project_id);
        self.notify(job, Some(event)).await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;
    use tokio::sync::mpsc;

    use super::*;
    use crate::db::kv::MemoryStore;
    use crate::db::memory::MemoryEntityStore;
    use crate::gateway::presence::PresenceTracker;
    use crate::gateway::session::{Outbound, OUTBOUND_CAPACITY};
    use crate::notify::queue::MemoryQueue;

    fn producer(queue: Arc<MemoryQueue>) -> (NotificationProducer, Arc<Gateway>) {
        let presence = PresenceTracker::new(Arc::new(MemoryStore::new()));
        let gateway = Arc::new(Gateway::new(Arc::new(MemoryEntityStore::new()), presence, true));
        let producer = NotificationProducer::new(queue, gateway.clone(), JobOptions::default());
        (producer, gateway)
    }

    fn actor(sub: &str) -> Identity {
        Identity {
            sub: sub.to_string(),
            email: format!("{sub}@example.com"),
            handle: sub.to_string(),
        }
    }

    async fn online(gateway: &Gateway, user_id: &str) -> mpsc::Receiver<Outbound> {
        let (tx, mut rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let connection_id = gateway.connect(tx);
        gateway.authenticate(&connection_id, actor(user_id)).await.unwrap();
        while rx.try_recv().is_ok() {}
        rx
    }

    fn pushed(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(Outbound::Frame(text)) = rx.try_recv() {
            frames.push(serde_json::from_str(&text).unwrap());
        }
        frames
    }

    #[tokio::test]
    async fn self_notifications_are_dropped() {
        let queue = Arc::new(MemoryQueue::new());
        let (producer, _gateway) = producer(queue.clone());

        assert_eq!(producer.post_liked(&actor("a"), "a", "p1").await, BestEffort::Ok(None));
        assert_eq!(queue.pending(NOTIFICATION_QUEUE).await, 0);

        let queued = producer.post_liked(&actor("a"), "b", "p1").await;
        assert!(matches!(queued, BestEffort::Ok(Some(_))));
        assert_eq!(queue.pending(NOTIFICATION_QUEUE).await, 1);
    }

    #[tokio::test]
    async fn queued_events_are_also_pushed_to_the_recipient() {
        let queue = Arc::new(MemoryQueue::new());
        let (producer, gateway) = producer(queue.clone());
        let mut rx_b = online(&gateway, "b").await;
        let mut rx_a = online(&gateway, "a").await;
        let _ = pushed(&mut rx_b);

        let _ = producer.post_liked(&actor("a"), "b", "p1").await;
        let _ = producer.user_followed(&actor("a"), "b").await;
        let _ = producer.project_invite(&actor("a"), "p9", "b").await;
        let member = ProjectMember {
            project_id: "p9".to_string(),
            user_id: "b".to_string(),
            role: "viewer".to_string(),
            created_at: chrono::Utc::now(),
        };
        let _ = producer.member_added(&actor("a"), &member).await;

        let frames = pushed(&mut rx_b);
        let names: Vec<&str> = frames.iter().filter_map(|f| f["event"].as_str()).collect();
        assert_eq!(
            names,
            vec!["post:liked", "user:followed", "project:invited", "member:added"]
        );
        assert_eq!(frames[0]["data"]["postId"], "p1");
        assert_eq!(frames[3]["data"]["memberId"], "b");
        assert_eq!(frames[3]["data"]["role"], "viewer");
        assert!(pushed(&mut rx_a).is_empty());
        assert_eq!(queue.pending(NOTIFICATION_QUEUE).await, 4);
    }

    #[tokio::test]
    async fn missed_message_is_queued_without_a_push() {
        let queue = Arc::new(MemoryQueue::new());
        let (producer, _gateway) = producer(queue.clone());
        let message = Message {
            id: "msg_1".to_string(),
            conversation_id: "42".to_string(),
            sender_id: "a".to_string(),
            content: Some("hi".to_string()),
            attachment_url: None,
            created_at: chrono::Utc::now(),
        };

        let queued = producer.message_missed(&actor("a"), "b", &message).await;
        assert!(matches!(queued, BestEffort::Ok(Some(_))));
        let delivery = queue.reserve(NOTIFICATION_QUEUE).await.unwrap().unwrap();
        assert_eq!(delivery.job.payload["type"], "MESSAGE");
        assert_eq!(delivery.job.payload["recipientId"], "b");
        assert_eq!(delivery.job.payload["metadata"]["channelId"], "42");
    }
}
