use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, MissedTickBehavior};

/// How often a long-running process sweeps a [`MemoryStore`].
pub const PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Failure talking to the ephemeral store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("key `{0}` holds a different kind of value")]
    WrongType(String),
    #[error("stored value is not an integer")]
    NotAnInteger,
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// Key-value store with per-key expiry, sets and hashes.
///
/// Backs presence, typing indicators and unread counters. Backed by Redis in
/// production and an in-memory map in tests. Every method is a single store
/// round trip, so concurrent callers in different processes never need a
/// read-modify-write.
#[async_trait]
pub trait EphemeralStore: Send + Sync {
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), StoreError>;
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn del(&self, key: &str) -> Result<(), StoreError>;
    /// Delete the key only while it still holds `expected`. Returns whether
    /// it was deleted.
    async fn del_if_eq(&self, key: &str, expected: &str) -> Result<bool, StoreError>;
    /// Overwrite the key with `value` and a fresh TTL only while it still
    /// holds `expected`. Returns whether it was written.
    async fn set_ex_if_eq(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl_secs: u64,
    ) -> Result<bool, StoreError>;
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;
    /// Reset the key's TTL. Returns false if the key does not exist.
    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<bool, StoreError>;

    async fn sadd(&self, key: &str, member: &str) -> Result<(), StoreError>;
    async fn srem(&self, key: &str, member: &str) -> Result<(), StoreError>;
    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError>;
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError>;
    async fn hdel(&self, key: &str, field: &str) -> Result<(), StoreError>;
    async fn hkeys(&self, key: &str) -> Result<Vec<String>, StoreError>;
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;
    async fn hincr(&self, key: &str, field: &str, delta: i64) -> Result<i64, StoreError>;

    /// Liveness check.
    async fn ping(&self) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// In-memory implementation (for local runs / tests)
// ---------------------------------------------------------------------------

enum Value {
    Str(String),
    Set(HashSet<String>),
    Hash(HashMap<String, String>),
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// In-memory store. Expiry follows the tokio clock, so paused-time tests
/// can step past a TTL with `tokio::time::advance`.
pub struct MemoryStore {
    data: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            data: Mutex::new(HashMap::new()),
        }
    }

    /// Drop every expired key. Returns the number of keys removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut data = self.data.lock();
        let before = data.len();
        data.retain(|_, entry| entry.is_live(now));
        before - data.len()
    }

    /// Sweep expired keys every `every` until the returned [`Purger`] is
    /// stopped. Keys nobody reads again are otherwise never reclaimed.
    pub fn spawn_purger(self: Arc<Self>, every: Duration) -> Purger {
        let (shutdown, mut signal) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticks = tokio::time::interval(every);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticks.tick().await;
            loop {
                tokio::select! {
                    _ = ticks.tick() => {
                        let purged = self.purge_expired();
                        if purged > 0 {
                            tracing::debug!(purged, "purged expired keys");
                        }
                    }
                    changed = signal.changed() => {
                        if changed.is_err() || *signal.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("memory store purger stopped");
        });
        Purger { shutdown, task }
    }

    fn with_live<R>(&self, key: &str, f: impl FnOnce(Option<&mut Entry>) -> R) -> R {
        let now = Instant::now();
        let mut data = self.data.lock();
        if data.get(key).is_some_and(|e| !e.is_live(now)) {
            data.remove(key);
        }
        f(data.get_mut(key))
    }

    fn with_set<R>(
        &self,
        key: &str,
        f: impl FnOnce(&mut HashSet<String>) -> R,
    ) -> Result<R, StoreError> {
        let now = Instant::now();
        let mut data = self.data.lock();
        if data.get(key).is_some_and(|e| !e.is_live(now)) {
            data.remove(key);
        }
        let entry = data.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Set(HashSet::new()),
            expires_at: None,
        });
        let result = match &mut entry.value {
            Value::Set(set) => f(set),
            _ => return Err(StoreError::WrongType(key.to_string())),
        };
        if matches!(&entry.value, Value::Set(s) if s.is_empty()) {
            data.remove(key);
        }
        Ok(result)
    }

    fn with_hash<R>(
        &self,
        key: &str,
        f: impl FnOnce(&mut HashMap<String, String>) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let now = Instant::now();
        let mut data = self.data.lock();
        if data.get(key).is_some_and(|e| !e.is_live(now)) {
            data.remove(key);
        }
        let entry = data.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Hash(HashMap::new()),
            expires_at: None,
        });
        let result = match &mut entry.value {
            Value::Hash(hash) => f(hash),
            _ => return Err(StoreError::WrongType(key.to_string())),
        };
        if matches!(&entry.value, Value::Hash(h) if h.is_empty()) {
            data.remove(key);
        }
        result
    }
}

/// Handle to a running [`MemoryStore::spawn_purger`] task.
pub struct Purger {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Purger {
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "memory store purger panicked");
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EphemeralStore for MemoryStore {
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), StoreError> {
        self.data.lock().insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: Some(Instant::now() + Duration::from_secs(ttl_secs)),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.with_live(key, |entry| match entry {
            None => Ok(None),
            Some(e) => match &e.value {
                Value::Str(s) => Ok(Some(s.clone())),
                _ => Err(StoreError::WrongType(key.to_string())),
            },
        })
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.data.lock().remove(key);
        Ok(())
    }

    async fn del_if_eq(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut data = self.data.lock();
        let matches = data
            .get(key)
            .is_some_and(|e| e.is_live(now) && matches!(&e.value, Value::Str(s) if s == expected));
        if matches {
            data.remove(key);
        }
        Ok(matches)
    }

    async fn set_ex_if_eq(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl_secs: u64,
    ) -> Result<bool, StoreError> {
        Ok(self.with_live(key, |entry| match entry {
            Some(e) if matches!(&e.value, Value::Str(s) if s == expected) => {
                e.value = Value::Str(value.to_string());
                e.expires_at = Some(Instant::now() + Duration::from_secs(ttl_secs));
                true
            }
            _ => false,
        }))
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.with_live(key, |entry| entry.is_some()))
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<bool, StoreError> {
        Ok(self.with_live(key, |entry| match entry {
            Some(e) => {
                e.expires_at = Some(Instant::now() + Duration::from_secs(ttl_secs));
                true
            }
            None => false,
        }))
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.with_set(key, |set| {
            set.insert(member.to_string());
        })
    }

    async fn srem(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.with_set(key, |set| {
            set.remove(member);
        })
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.with_set(key, |set| {
            let mut members: Vec<String> = set.iter().cloned().collect();
            members.sort();
            members
        })
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        self.with_hash(key, |hash| {
            hash.insert(field.to_string(), value.to_string());
            Ok(())
        })
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        self.with_hash(key, |hash| Ok(hash.get(field).cloned()))
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<(), StoreError> {
        self.with_hash(key, |hash| {
            hash.remove(field);
            Ok(())
        })
    }

    async fn hkeys(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.with_hash(key, |hash| {
            let mut fields: Vec<String> = hash.keys().cloned().collect();
            fields.sort();
            Ok(fields)
        })
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        self.with_hash(key, |hash| Ok(hash.clone()))
    }

    async fn hincr(&self, key: &str, field: &str, delta: i64) -> Result<i64, StoreError> {
        self.with_hash(key, |hash| {
            let current = match hash.get(field) {
                Some(v) => v.parse::<i64>().map_err(|_| StoreError::NotAnInteger)?,
                None => 0,
            };
            let next = current + delta;
            hash.insert(field.to_string(), next.to_string());
            Ok(next)
        })
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
