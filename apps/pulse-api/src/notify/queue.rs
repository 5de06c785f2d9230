//! At-least-once job queue: the transport seam, an in-process transport and
//! the competing-consumer loop.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pulse_common::id::{prefixed_ulid, JobIdKind, PrefixedId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinSet;
use tokio::time::Instant;

/// Longest wait between retries, however many attempts have failed.
const MAX_BACKOFF: Duration = Duration::from_secs(5 * 60);

/// How long an idle consumer sleeps before polling again.
const IDLE_POLL: Duration = Duration::from_millis(500);

/// Unacked deliveries are handed out again after this long.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue unavailable: {0}")]
    Unavailable(String),
    #[error("invalid job payload: {0}")]
    Payload(String),
    #[error("delivery {0} is no longer leased")]
    UnknownDelivery(String),
}

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        QueueError::Unavailable(err.to_string())
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Payload(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobOptions {
    /// Total deliveries before the job is dead-lettered.
    pub attempts: u32,
    /// Delay before the first retry; doubles with each further failure.
    pub backoff: Duration,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_secs(1),
        }
    }
}

/// A queued job as stored by every transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub name: String,
    pub payload: Value,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub backoff_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Job {
    pub fn new(name: &str, payload: Value, options: JobOptions) -> Self {
        Self {
            id: JobIdKind::generate(),
            name: name.to_string(),
            payload,
            attempts_made: 0,
            max_attempts: options.attempts.max(1),
            backoff_ms: options.backoff.as_millis() as u64,
            last_error: None,
        }
    }

    /// 1 on the first delivery.
    pub fn attempt(&self) -> u32 {
        self.attempts_made + 1
    }

    /// Record a failed attempt. Returns the retry delay, or `None` once the
    /// job is out of attempts.
    pub fn record_failure(&mut self, error: &str) -> Option<Duration> {
        self.attempts_made += 1;
        self.last_error = Some(error.to_string());
        if self.attempts_made >= self.max_attempts {
            return None;
        }
        let factor = 2u64.saturating_pow(self.attempts_made - 1);
        let delay = Duration::from_millis(self.backoff_ms.saturating_mul(factor));
        Some(delay.min(MAX_BACKOFF))
    }
}

/// A job claimed by one consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub job: Job,
    pub(crate) lease: String,
    /// The job exactly as the transport stored it.
    pub(crate) raw: String,
}

impl Delivery {
    pub fn id(&self) -> &str {
        &self.job.id
    }

    pub fn attempt(&self) -> u32 {
        self.job.attempt()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    /// The job runs again as `attempt` after `delay`.
    Retry { attempt: u32, delay: Duration },
    DeadLettered,
}

#[async_trait]
pub trait QueueTransport: Send + Sync {
    async fn enqueue(&self, name: &str, payload: Value, options: JobOptions)
        -> Result<String, QueueError>;

    /// Claim the next ready job, if any, without waiting.
    async fn reserve(&self, name: &str) -> Result<Option<Delivery>, QueueError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Return a failed delivery for retry under its backoff policy.
    async fn nack(&self, delivery: &Delivery, error: &str) -> Result<NackOutcome, QueueError>;

    /// Fail a delivery permanently, skipping any remaining attempts.
    async fn dead_letter(&self, delivery: &Delivery, error: &str) -> Result<(), QueueError>;

    /// Jobs that ran out of attempts, oldest first.
    async fn dead_letters(&self, name: &str) -> Result<Vec<Job>, QueueError>;

    /// Park an idle consumer until work may be ready or `max` passes.
    async fn wait_for_work(&self, _name: &str, max: Duration) {
        tokio::time::sleep(max).await;
    }
}

// ---------------------------------------------------------------------------
// In-process transport
// ---------------------------------------------------------------------------

struct Leased {
    job: Job,
    lease: String,
    expires_at: Instant,
}

#[derive(Default)]
struct Lane {
    waiting: VecDeque<Job>,
    delayed: Vec<(Instant, Job)>,
    active: HashMap<String, Leased>,
    dead: Vec<Job>,
}

impl Lane {
    /// Move due retries and lapsed leases back to `waiting`.
    fn promote(&mut self, now: Instant) {
        let (due, later): (Vec<_>, Vec<_>) = std::mem::take(&mut self.delayed)
            .into_iter()
            .partition(|(at, _)| *at <= now);
        self.delayed = later;
        self.waiting.extend(due.into_iter().map(|(_, job)| job));

        let stalled: Vec<String> = self
            .active
            .iter()
            .filter(|(_, leased)| leased.expires_at <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in stalled {
            if let Some(leased) = self.active.remove(&id) {
                tracing::warn!(job_id = %id, "lease lapsed, redelivering");
                self.waiting.push_front(leased.job);
            }
        }
    }

    fn release(&mut self, delivery: &Delivery) -> Result<Job, QueueError> {
        match self.active.get(delivery.id()) {
            Some(leased) if leased.lease == delivery.lease => {}
            _ => return Err(QueueError::UnknownDelivery(delivery.id().to_string())),
        }
        self.active
            .remove(delivery.id())
            .map(|leased| leased.job)
            .ok_or_else(|| QueueError::UnknownDelivery(delivery.id().to_string()))
    }
}

/// Queue held in process memory. Jobs do not survive a restart.
pub struct MemoryQueue {
    lanes: Mutex<HashMap<String, Lane>>,
    ready: Notify,
    lease: Duration,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::with_lease(DEFAULT_LEASE)
    }

    pub fn with_lease(lease: Duration) -> Self {
        Self {
            lanes: Mutex::new(HashMap::new()),
            ready: Notify::new(),
            lease,
        }
    }

    /// Jobs waiting, delayed or in flight on `name`.
    pub async fn pending(&self, name: &str) -> usize {
        let lanes = self.lanes.lock().await;
        lanes
            .get(name)
            .map(|lane| lane.waiting.len() + lane.delayed.len() + lane.active.len())
            .unwrap_or(0)
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueTransport for MemoryQueue {
    async fn enqueue(
        &self,
        name: &str,
        payload: Value,
        options: JobOptions,
    ) -> Result<String, QueueError> {
        let job = Job::new(name, payload, options);
        let id = job.id.clone();
        self.lanes
            .lock()
            .await
            .entry(name.to_string())
            .or_default()
            .waiting
            .push_back(job);
        self.ready.notify_one();
        Ok(id)
    }

    async fn reserve(&self, name: &str) -> Result<Option<Delivery>, QueueError> {
        let mut lanes = self.lanes.lock().await;
        let Some(lane) = lanes.get_mut(name) else {
            return Ok(None);
        };
        let now = Instant::now();
        lane.promote(now);
        let Some(job) = lane.waiting.pop_front() else {
            return Ok(None);
        };

        let lease = prefixed_ulid("lease");
        let raw = serde_json::to_string(&job)?;
        lane.active.insert(
            job.id.clone(),
            Leased {
                job: job.clone(),
                lease: lease.clone(),
                expires_at: now + self.lease,
            },
        );
        Ok(Some(Delivery { job, lease, raw }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut lanes = self.lanes.lock().await;
        let lane = lanes
            .get_mut(&delivery.job.name)
            .ok_or_else(|| QueueError::UnknownDelivery(delivery.id().to_string()))?;
        lane.release(delivery).map(|_| ())
    }

    async fn nack(&self, delivery: &Delivery, error: &str) -> Result<NackOutcome, QueueError> {
        let mut lanes = self.lanes.lock().await;
        let lane = lanes
            .get_mut(&delivery.job.name)
            .ok_or_else(|| QueueError::UnknownDelivery(delivery.id().to_string()))?;
        let mut job = lane.release(delivery)?;
        match job.record_failure(error) {
            Some(delay) => {
                let attempt = job.attempt();
                lane.delayed.push((Instant::now() + delay, job));
                Ok(NackOutcome::Retry { attempt, delay })
            }
            None => {
                lane.dead.push(job);
                Ok(NackOutcome::DeadLettered)
            }
        }
    }

    async fn dead_letter(&self, delivery: &Delivery, error: &str) -> Result<(), QueueError> {
        let mut lanes = self.lanes.lock().await;
        let lane = lanes
            .get_mut(&delivery.job.name)
            .ok_or_else(|| QueueError::UnknownDelivery(delivery.id().to_string()))?;
        let mut job = lane.release(delivery)?;
        job.attempts_made += 1;
        job.last_error = Some(error.to_string());
        lane.dead.push(job);
        Ok(())
    }

    async fn dead_letters(&self, name: &str) -> Result<Vec<Job>, QueueError> {
        let lanes = self.lanes.lock().await;
        Ok(lanes.get(name).map(|lane| lane.dead.clone()).unwrap_or_default())
    }

    async fn wait_for_work(&self, _name: &str, max: Duration) {
        let _ = tokio::time::timeout(max, self.ready.notified()).await;
    }
}

// ---------------------------------------------------------------------------
// Consumers
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum JobFailure {
    /// Worth another attempt.
    #[error("{0}")]
    Retry(String),
    /// Will never succeed; dead-letter now.
    #[error("{0}")]
    Permanent(String),
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, delivery: &Delivery) -> Result<(), JobFailure>;
}

/// Running consumer tasks for one queue.
pub struct Consumers {
    shutdown: watch::Sender<bool>,
    tasks: JoinSet<()>,
}

impl Consumers {
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Stop taking new jobs and wait for in-flight ones to settle.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        while self.tasks.join_next().await.is_some() {}
    }
}

/// Spawn `concurrency` competing consumers of `name`. Jobs are claimed
/// through the transport's lease, so consumers never coordinate directly.
pub fn process(
    queue: Arc<dyn QueueTransport>,
    name: &str,
    concurrency: usize,
    handler: Arc<dyn JobHandler>,
) -> Consumers {
    let (shutdown, signal) = watch::channel(false);
    let mut tasks = JoinSet::new();
    for worker in 0..concurrency {
        tasks.spawn(consume(
            queue.clone(),
            name.to_string(),
            handler.clone(),
            signal.clone(),
            worker,
        ));
    }
    tracing::info!(queue = %name, concurrency, "queue consumers started");
    Consumers { shutdown, tasks }
}

async fn consume(
    queue: Arc<dyn QueueTransport>,
    name: String,
    handler: Arc<dyn JobHandler>,
    mut shutdown: watch::Receiver<bool>,
    worker: usize,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        match queue.reserve(&name).await {
            Ok(Some(delivery)) => settle(queue.as_ref(), handler.as_ref(), delivery).await,
            Ok(None) => {
                tokio::select! {
                    () = queue.wait_for_work(&name, IDLE_POLL) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, queue = %name, worker, "reserve failed");
                tokio::select! {
                    () = tokio::time::sleep(IDLE_POLL) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }
    tracing::debug!(queue = %name, worker, "queue consumer stopped");
}

async fn settle(queue: &dyn QueueTransport, handler: &dyn JobHandler, delivery: Delivery) {
    let job_id = delivery.id().to_string();
    let attempt = delivery.attempt();

    let settled = match handler.handle(&delivery).await {
        Ok(()) => queue.ack(&delivery).await,
        Err(JobFailure::Permanent(reason)) => {
            tracing::error!(%job_id, attempt, %reason, "job failed permanently, dead-lettering");
            queue.dead_letter(&delivery, &reason).await
        }
        Err(JobFailure::Retry(reason)) => match queue.nack(&delivery, &reason).await {
            Ok(NackOutcome::Retry { attempt: next, delay }) => {
                tracing::warn!(%job_id, attempt, next, ?delay, %reason, "job failed, retrying");
                Ok(())
            }
            Ok(NackOutcome::DeadLettered) => {
                tracing::error!(%job_id, attempt, %reason, "job out of attempts, dead-lettered");
                Ok(())
            }
            Err(e) => Err(e),
        },
    };

    if let Err(e) = settled {
        tracing::warn!(%job_id, attempt, error = %e, "could not settle job");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;

    const Q: &str = "test";

    fn fast() -> JobOptions {
        JobOptions {
            attempts: 3,
            backoff: Duration::from_millis(100),
        }
    }

    #[test]
    fn backoff_doubles_until_attempts_run_out() {
        let mut job = Job::new(Q, json!({}), fast());
        assert_eq!(job.attempt(), 1);
        assert_eq!(job.record_failure("e1"), Some(Duration::from_millis(100)));
        assert_eq!(job.record_failure("e2"), Some(Duration::from_millis(200)));
        assert_eq!(job.record_failure("e3"), None);
        assert_eq!(job.last_error.as_deref(), Some("e3"));
    }

    #[tokio::test]
    async fn fifo_and_ack() {
        let queue = MemoryQueue::new();
        queue.enqueue(Q, json!(1), fast()).await.unwrap();
        queue.enqueue(Q, json!(2), fast()).await.unwrap();

        let first = queue.reserve(Q).await.unwrap().unwrap();
        let second = queue.reserve(Q).await.unwrap().unwrap();
        assert_eq!(first.job.payload, json!(1));
        assert_eq!(second.job.payload, json!(2));
        assert!(queue.reserve(Q).await.unwrap().is_none());

        queue.ack(&first).await.unwrap();
        queue.ack(&second).await.unwrap();
        assert_eq!(queue.pending(Q).await, 0);
        assert!(matches!(
            queue.ack(&first).await,
            Err(QueueError::UnknownDelivery(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn nack_delays_then_dead_letters() {
        let queue = MemoryQueue::new();
        queue.enqueue(Q, json!("x"), fast()).await.unwrap();

        let d = queue.reserve(Q).await.unwrap().unwrap();
        assert_eq!(
            queue.nack(&d, "boom").await.unwrap(),
            NackOutcome::Retry {
                attempt: 2,
                delay: Duration::from_millis(100)
            }
        );
        assert!(queue.reserve(Q).await.unwrap().is_none());

        tokio::time::advance(Duration::from_millis(100)).await;
        let d = queue.reserve(Q).await.unwrap().unwrap();
        assert_eq!(d.attempt(), 2);
        assert!(matches!(
            queue.nack(&d, "boom").await.unwrap(),
            NackOutcome::Retry { attempt: 3, .. }
        ));

        tokio::time::advance(Duration::from_millis(200)).await;
        let d = queue.reserve(Q).await.unwrap().unwrap();
        assert_eq!(queue.nack(&d, "boom").await.unwrap(), NackOutcome::DeadLettered);

        let dead = queue.dead_letters(Q).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts_made, 3);
        assert_eq!(queue.pending(Q).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn lapsed_lease_is_redelivered() {
        let queue = MemoryQueue::with_lease(Duration::from_secs(5));
        queue.enqueue(Q, json!("x"), fast()).await.unwrap();
        let stale = queue.reserve(Q).await.unwrap().unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        let again = queue.reserve(Q).await.unwrap().unwrap();
        assert_eq!(again.id(), stale.id());

        assert!(queue.ack(&stale).await.is_err());
        queue.ack(&again).await.unwrap();
    }

    struct Flaky {
        calls: AtomicUsize,
        fail_first: usize,
    }

    #[async_trait]
    impl JobHandler for Flaky {
        async fn handle(&self, delivery: &Delivery) -> Result<(), JobFailure> {
            if delivery.job.payload == json!("poison") {
                return Err(JobFailure::Permanent("poison".into()));
            }
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(JobFailure::Retry(format!("failure {n}")))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn consumers_retry_and_dead_letter() {
        let queue = Arc::new(MemoryQueue::new());
        let handler = Arc::new(Flaky {
            calls: AtomicUsize::new(0),
            fail_first: 2,
        });
        queue.enqueue(Q, json!("ok"), fast()).await.unwrap();
        queue.enqueue(Q, json!("poison"), fast()).await.unwrap();

        let consumers = process(queue.clone(), Q, 2, handler.clone());
        assert_eq!(consumers.len(), 2);
        tokio::time::sleep(Duration::from_secs(2)).await;
        consumers.shutdown().await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert_eq!(queue.pending(Q).await, 0);
        let dead = queue.dead_letters(Q).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].payload, json!("poison"));
    }
}
