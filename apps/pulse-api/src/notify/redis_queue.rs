//! Redis transport for the notification queue, shared by every replica.
//!
//! Per queue `name`:
//! - `queue:<name>:waiting` list, consumed from the right
//! - `queue:<name>:active` list of claimed jobs
//! - `queue:<name>:lease:<id>` key whose expiry marks a stalled claim
//! - `queue:<name>:delayed` sorted set scored by ready-at (unix ms)
//! - `queue:<name>:dead` list of jobs past their attempts

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use pulse_common::id::prefixed_ulid;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use serde_json::Value;

use super::queue::{Delivery, Job, JobOptions, NackOutcome, QueueError, QueueTransport, DEFAULT_LEASE};

/// Delayed jobs promoted per `reserve` call.
const PROMOTE_BATCH: isize = 100;

/// Move the oldest waiting job to `active` and lease it in one step, so a
/// claimed job is never visible without its lease.
/// KEYS: waiting, active. ARGV: lease key prefix, lease token, lease ms.
const CLAIM: &str = r#"
local raw = redis.call('RPOPLPUSH', KEYS[1], KEYS[2])
if not raw then
  return false
end
local ok, job = pcall(cjson.decode, raw)
if ok and type(job) == 'table' and type(job.id) == 'string' then
  redis.call('SET', ARGV[1] .. job.id, ARGV[2], 'PX', ARGV[3])
end
return raw
"#;

/// Requeue one active job if its lease is gone.
/// KEYS: active, waiting, lease. ARGV: raw job.
const RECOVER: &str = r#"
if redis.call('EXISTS', KEYS[3]) == 1 then
  return 0
end
if redis.call('LREM', KEYS[1], 1, ARGV[1]) == 0 then
  return 0
end
redis.call('RPUSH', KEYS[2], ARGV[1])
return 1
"#;

/// Drop an active job unless another consumer holds its lease.
/// KEYS: active, lease. ARGV: raw job, lease token.
const RELEASE: &str = r#"
local owner = redis.call('GET', KEYS[2])
if owner and owner ~= ARGV[2] then
  return 0
end
if owner then
  redis.call('DEL', KEYS[2])
end
return redis.call('LREM', KEYS[1], 1, ARGV[1])
"#;

fn key(name: &str, part: &str) -> String {
    format!("queue:{name}:{part}")
}

fn lease_key(name: &str, job_id: &str) -> String {
    format!("queue:{name}:lease:{job_id}")
}

#[derive(Clone)]
pub struct RedisQueue {
    conn: ConnectionManager,
    lease: Duration,
    claim_script: Script,
    recover_script: Script,
    release_script: Script,
}

impl RedisQueue {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            lease: DEFAULT_LEASE,
            claim_script: Script::new(CLAIM),
            recover_script: Script::new(RECOVER),
            release_script: Script::new(RELEASE),
        }
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Move delayed jobs whose time has come onto the waiting list.
    /// `ZREM` decides which consumer gets to move each one.
    async fn promote_due(&self, name: &str) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        let now = Utc::now().timestamp_millis();
        let due: Vec<String> = conn
            .zrangebyscore_limit(key(name, "delayed"), "-inf", now, 0, PROMOTE_BATCH)
            .await?;
        let mut moved = 0;
        for raw in due {
            let removed: i64 = conn.zrem(key(name, "delayed"), &raw).await?;
            if removed == 1 {
                conn.lpush::<_, _, ()>(key(name, "waiting"), &raw).await?;
                moved += 1;
            }
        }
        Ok(moved)
    }

    /// Return active jobs whose lease lapsed to the head of the waiting list.
    pub async fn recover_stalled(&self, name: &str) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        let active: Vec<String> = conn.lrange(key(name, "active"), 0, -1).await?;
        let mut recovered = 0;
        for raw in active {
            let job: Job = match serde_json::from_str(&raw) {
                Ok(job) => job,
                Err(e) => {
                    tracing::error!(error = %e, queue = %name, "corrupt active job, dead-lettering");
                    self.bury_raw(name, &raw).await?;
                    continue;
                }
            };
            let requeued: i64 = self
                .recover_script
                .key(key(name, "active"))
                .key(key(name, "waiting"))
                .key(lease_key(name, &job.id))
                .arg(&raw)
                .invoke_async(&mut conn)
                .await?;
            if requeued == 1 {
                tracing::warn!(job_id = %job.id, queue = %name, "lease lapsed, redelivering");
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    async fn bury_raw(&self, name: &str, raw: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        conn.lrem::<_, _, ()>(key(name, "active"), 1, raw).await?;
        conn.lpush::<_, _, ()>(key(name, "dead"), raw).await?;
        Ok(())
    }

    async fn claim(&self, name: &str, lease: &str) -> Result<Option<String>, QueueError> {
        let mut conn = self.conn.clone();
        Ok(self
            .claim_script
            .key(key(name, "waiting"))
            .key(key(name, "active"))
            .arg(lease_key(name, ""))
            .arg(lease)
            .arg(self.lease.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?)
    }

    /// Take the delivery off the active list. Fails if a lapsed lease already
    /// handed it to someone else.
    async fn release(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let name = &delivery.job.name;
        let removed: i64 = self
            .release_script
            .key(key(name, "active"))
            .key(lease_key(name, delivery.id()))
            .arg(&delivery.raw)
            .arg(&delivery.lease)
            .invoke_async(&mut conn)
            .await?;
        if removed == 0 {
            return Err(QueueError::UnknownDelivery(delivery.id().to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl QueueTransport for RedisQueue {
    async fn enqueue(
        &self,
        name: &str,
        payload: Value,
        options: JobOptions,
    ) -> Result<String, QueueError> {
        let job = Job::new(name, payload, options);
        let raw = serde_json::to_string(&job)?;
        let mut conn = self.conn.clone();
        conn.lpush::<_, _, ()>(key(name, "waiting"), raw).await?;
        Ok(job.id)
    }

    async fn reserve(&self, name: &str) -> Result<Option<Delivery>, QueueError> {
        self.promote_due(name).await?;

        let lease = prefixed_ulid("lease");
        let mut claimed = self.claim(name, &lease).await?;
        if claimed.is_none() && self.recover_stalled(name).await? > 0 {
            claimed = self.claim(name, &lease).await?;
        }
        let Some(raw) = claimed else {
            return Ok(None);
        };

        let job: Job = match serde_json::from_str(&raw) {
            Ok(job) => job,
            Err(e) => {
                tracing::error!(error = %e, queue = %name, "undecodable job, dead-lettering");
                self.bury_raw(name, &raw).await?;
                return Ok(None);
            }
        };

        Ok(Some(Delivery { job, lease, raw }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.release(delivery).await
    }

    async fn nack(&self, delivery: &Delivery, error: &str) -> Result<NackOutcome, QueueError> {
        self.release(delivery).await?;
        let mut job = delivery.job.clone();
        let name = job.name.clone();
        let mut conn = self.conn.clone();
        match job.record_failure(error) {
            Some(delay) => {
                let attempt = job.attempt();
                let ready_at = Utc::now().timestamp_millis() + delay.as_millis() as i64;
                conn.zadd::<_, _, _, ()>(key(&name, "delayed"), serde_json::to_string(&job)?, ready_at)
                    .await?;
                Ok(NackOutcome::Retry { attempt, delay })
            }
            None => {
                conn.lpush::<_, _, ()>(key(&name, "dead"), serde_json::to_string(&job)?)
                    .await?;
                Ok(NackOutcome::DeadLettered)
            }
        }
    }

    async fn dead_letter(&self, delivery: &Delivery, error: &str) -> Result<(), QueueError> {
        self.release(delivery).await?;
        let mut job = delivery.job.clone();
        job.attempts_made += 1;
        job.last_error = Some(error.to_string());
        let mut conn = self.conn.clone();
        conn.lpush::<_, _, ()>(key(&job.name, "dead"), serde_json::to_string(&job)?)
            .await?;
        Ok(())
    }

    async fn dead_letters(&self, name: &str) -> Result<Vec<Job>, QueueError> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn.lrange(key(name, "dead"), 0, -1).await?;
        // LPUSH keeps newest first.
        Ok(raw
            .iter()
            .rev()
            .filter_map(|r| serde_json::from_str(r).ok())
            .collect())
    }
}
