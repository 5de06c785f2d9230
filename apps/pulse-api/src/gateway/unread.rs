//! Cached unread counts per user and conversation.

use std::collections::HashMap;
use std::sync::Arc;

use crate::db::kv::EphemeralStore;
use crate::outcome::BestEffort;

const UNREAD_TTL_SECS: u64 = 7 * 24 * 3600;

fn unread_key(user_id: &str) -> String {
    format!("unread:{user_id}")
}

#[derive(Clone)]
pub struct UnreadCounter {
    store: Arc<dyn EphemeralStore>,
}

impl UnreadCounter {
    pub fn new(store: Arc<dyn EphemeralStore>) -> Self {
        Self { store }
    }

    /// Count one new message in `conversation_id` for each of `user_ids`.
    pub async fn increment(&self, user_ids: &[String], conversation_id: &str) -> BestEffort<()> {
        for user_id in user_ids {
            let key = unread_key(user_id);
            let bumped = self.store.hincr(&key, conversation_id, 1).await;
            if BestEffort::from_result(bumped, "unread.hincr").is_degraded() {
                return BestEffort::Degraded;
            }
            let _ = BestEffort::from_result(
                self.store.expire(&key, UNREAD_TTL_SECS).await,
                "unread.expire",
            );
        }
        BestEffort::Ok(())
    }

    pub async fn clear(&self, user_id: &str, conversation_id: &str) -> BestEffort<()> {
        BestEffort::from_result(
            self.store.hdel(&unread_key(user_id), conversation_id).await,
            "unread.hdel",
        )
    }

    pub async fn counts(&self, user_id: &str) -> HashMap<String, i64> {
        BestEffort::from_result(self.store.hgetall(&unread_key(user_id)).await, "unread.hgetall")
            .unwrap_or_default()
            .into_iter()
            .filter_map(|(conversation, count)| count.parse().ok().map(|n| (conversation, n)))
            .collect()
    }
}
