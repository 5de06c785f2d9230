//! Drains the notification queue: persist the record, then push it to the
//! recipient's personal room.

use std::sync::Arc;

use async_trait::async_trait;

use super::job::{NotificationJob, NOTIFICATION_QUEUE};
use super::queue::{process, Consumers, Delivery, JobFailure, JobHandler, QueueTransport};
use crate::db::entity::{EntityError, EntityStore};
use crate::gateway::events::ServerEvent;
use crate::gateway::Gateway;
use crate::models::notification::Notification;

pub struct NotificationWorker {
    entities: Arc<dyn EntityStore>,
    gateway: Arc<Gateway>,
}

impl NotificationWorker {
    pub fn new(entities: Arc<dyn EntityStore>, gateway: Arc<Gateway>) -> Self {
        Self { entities, gateway }
    }

    /// Persist one job as an unseen notification and push it live. A
    /// recipient with no open connection simply gets no push.
    ///
    /// Jobs are not deduplicated; a redelivered job yields a second record.
    pub async fn deliver(&self, job: NotificationJob) -> Result<Notification, EntityError> {
        let record = self.entities.create_notification(job.into_record()).await?;
        let pushed = self
            .gateway
            .emit_to_user(&record.recipient_id, &ServerEvent::Notification(record.clone()));
        tracing::info!(
            notification_id = %record.id,
            recipient_id = %record.recipient_id,
            kind = %record.type_,
            pushed,
            "notification delivered"
        );
        Ok(record)
    }

    /// Start `concurrency` consumers of the notification queue.
    pub fn spawn(self: Arc<Self>, queue: Arc<dyn QueueTransport>, concurrency: usize) -> Consumers {
        process(queue, NOTIFICATION_QUEUE, concurrency, self)
    }
}

#[async_trait]
impl JobHandler for NotificationWorker {
    async fn handle(&self, delivery: &Delivery) -> Result<(), JobFailure> {
        let job: NotificationJob = serde_json::from_value(delivery.job.payload.clone())
            .map_err(|e| JobFailure::Permanent(format!("undecodable notification job: {e}")))?;
        self.deliver(job)
            .await
            .map(|_| ())
            .map_err(|e| JobFailure::Retry(e.to_string()))
    }
}
