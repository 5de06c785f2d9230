//! Presence and typing state held in the shared ephemeral store.
//!
//! Both are self-expiring: a process that dies without cleaning up leaves
//! entries that vanish once their TTL lapses.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use pulse_common::RoomId;
use serde::{Deserialize, Serialize};

use crate::db::kv::EphemeralStore;
use crate::outcome::BestEffort;

/// Presence entries live this long without a refresh.
pub const PRESENCE_TTL_SECS: u64 = 5 * 60;

/// Typing indicators live this long without a refresh.
pub const TYPING_TTL_SECS: u64 = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub user_id: String,
    pub connection_id: String,
    pub connected_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

fn presence_key(user_id: &str) -> String {
    format!("presence:{user_id}")
}

/// At most one record per user; the last connection to write it wins.
#[derive(Clone)]
pub struct PresenceTracker {
    store: Arc<dyn EphemeralStore>,
}

impl PresenceTracker {
    pub fn new(store: Arc<dyn EphemeralStore>) -> Self {
        Self { store }
    }

    pub async fn set_online(&self, user_id: &str, connection_id: &str) -> BestEffort<()> {
        let now = Utc::now();
        let record = PresenceRecord {
            user_id: user_id.to_string(),
            connection_id: connection_id.to_string(),
            connected_at: now,
            last_seen_at: now,
        };
        self.write(&record).await
    }

    /// Bump `lastSeenAt` and the TTL while `connection_id` owns the record,
    /// or re-create the record if none exists. Returns whether a record was
    /// written.
    pub async fn refresh(&self, user_id: &str, connection_id: &str) -> BestEffort<bool> {
        let (raw, mut record) = match self.current(user_id).await {
            BestEffort::Ok(Some(current)) => current,
            BestEffort::Ok(None) => {
                return self.set_online(user_id, connection_id).await.map(|_| true)
            }
            BestEffort::Degraded => return BestEffort::Degraded,
        };
        if record.connection_id != connection_id {
            return BestEffort::Ok(false);
        }
        record.last_seen_at = Utc::now();
        self.replace(&raw, &record).await
    }

    /// Remove the record if `connection_id` owns it. Returns false only when
    /// another connection holds the record, so the user is still online.
    pub async fn set_offline(&self, user_id: &str, connection_id: &str) -> BestEffort<bool> {
        let (raw, record) = match self.current(user_id).await {
            BestEffort::Ok(Some(current)) => current,
            BestEffort::Ok(None) => return BestEffort::Ok(true),
            BestEffort::Degraded => return BestEffort::Degraded,
        };
        if record.connection_id != connection_id {
            return BestEffort::Ok(false);
        }
        BestEffort::from_result(
            self.store.del_if_eq(&presence_key(user_id), &raw).await,
            "presence.del",
        )
    }

    /// Hand the record from a closing connection to one of the user's
    /// surviving connections, or write one for the survivor if none exists.
    /// Returns whether the survivor now owns the record.
    pub async fn reassign(&self, user_id: &str, from: &str, to: &str) -> BestEffort<bool> {
        let (raw, mut record) = match self.current(user_id).await {
            BestEffort::Ok(Some(current)) => current,
            BestEffort::Ok(None) => return self.set_online(user_id, to).await.map(|_| true),
            BestEffort::Degraded => return BestEffort::Degraded,
        };
        if record.connection_id != from {
            return BestEffort::Ok(record.connection_id == to);
        }
        record.connection_id = to.to_string();
        record.last_seen_at = Utc::now();
        self.replace(&raw, &record).await
    }

    /// Whether a presence entry exists. An unreachable store reads as offline.
    pub async fn is_online(&self, user_id: &str) -> bool {
        BestEffort::from_result(self.store.exists(&presence_key(user_id)).await, "presence.exists")
            .unwrap_or(false)
    }

    pub async fn get(&self, user_id: &str) -> Option<PresenceRecord> {
        self.current(user_id)
            .await
            .unwrap_or_default()
            .map(|(_, record)| record)
    }

    /// The stored text alongside its decoded record. A corrupt record reads
    /// as absent.
    async fn current(&self, user_id: &str) -> BestEffort<Option<(String, PresenceRecord)>> {
        let stored =
            BestEffort::from_result(self.store.get(&presence_key(user_id)).await, "presence.get");
        stored.map(|raw| {
            let raw = raw?;
            match serde_json::from_str(&raw) {
                Ok(record) => Some((raw, record)),
                Err(e) => {
                    tracing::warn!(error = %e, %user_id, "corrupt presence record");
                    None
                }
            }
        })
    }

    /// Overwrite the record only while the store still holds `expected`.
    async fn replace(&self, expected: &str, record: &PresenceRecord) -> BestEffort<bool> {
        let value = match serde_json::to_string(record) {
            Ok(v) => v,
            Err(e) => return BestEffort::from_result(Err(e), "presence.encode"),
        };
        BestEffort::from_result(
            self.store
                .set_ex_if_eq(
                    &presence_key(&record.user_id),
                    expected,
                    &value,
                    PRESENCE_TTL_SECS,
                )
                .await,
            "presence.set",
        )
    }

    async fn write(&self, record: &PresenceRecord) -> BestEffort<()> {
        let value = match serde_json::to_string(record) {
            Ok(v) => v,
            Err(e) => return BestEffort::from_result(Err(e), "presence.encode"),
        };
        BestEffort::from_result(
            self.store
                .set_ex(&presence_key(&record.user_id), &value, PRESENCE_TTL_SECS)
                .await,
            "presence.set",
        )
    }
}

fn typing_key(room: &RoomId) -> String {
    format!("typing:{room}")
}

type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

/// Per-room typing indicators: a hash of `userId -> started-at (unix ms)`.
///
/// The hash key carries the TTL, and members older than the TTL are filtered
/// on read, so one user's indicator lapses even while others keep typing.
#[derive(Clone)]
pub struct TypingTracker {
    store: Arc<dyn EphemeralStore>,
    now_ms: Clock,
}

impl TypingTracker {
    pub fn new(store: Arc<dyn EphemeralStore>) -> Self {
        Self::with_clock(store, Arc::new(|| Utc::now().timestamp_millis()))
    }

    pub fn with_clock(store: Arc<dyn EphemeralStore>, now_ms: Clock) -> Self {
        Self { store, now_ms }
    }

    pub async fn start(&self, room: &RoomId, user_id: &str) -> BestEffort<()> {
        let key = typing_key(room);
        let now = (self.now_ms)().to_string();
        if let BestEffort::Degraded =
            BestEffort::from_result(self.store.hset(&key, user_id, &now).await, "typing.hset")
        {
            return BestEffort::Degraded;
        }
        BestEffort::from_result(self.store.expire(&key, TYPING_TTL_SECS).await, "typing.expire")
            .map(|_| ())
    }

    pub async fn stop(&self, room: &RoomId, user_id: &str) -> BestEffort<()> {
        BestEffort::from_result(
            self.store.hdel(&typing_key(room), user_id).await,
            "typing.hdel",
        )
    }

    /// Users currently typing in `room`, sorted. Degrades to nobody.
    pub async fn typing_users(&self, room: &RoomId) -> Vec<String> {
        let entries =
            BestEffort::from_result(self.store.hgetall(&typing_key(room)).await, "typing.hgetall")
                .unwrap_or_default();
        let cutoff = (self.now_ms)() - (TYPING_TTL_SECS as i64) * 1000;
        let mut users: Vec<String> = entries
            .into_iter()
            .filter(|(_, started)| started.parse::<i64>().is_ok_and(|ms| ms > cutoff))
            .map(|(user, _)| user)
            .collect();
        users.sort();
        users
    }
}
