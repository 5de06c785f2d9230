pub mod job;
pub mod producer;
pub mod queue;
pub mod redis_queue;
pub mod worker;

pub use job::{NotificationJob, NotificationType};
pub use producer::NotificationProducer;
pub use worker::NotificationWorker;
