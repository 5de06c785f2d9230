use std::collections::HashMap;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};

use super::kv::{EphemeralStore, StoreError};

const DEL_IF_EQ: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

const SET_EX_IF_EQ: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  redis.call('SET', KEYS[1], ARGV[2], 'EX', ARGV[3])
  return 1
end
return 0
"#;

/// Redis-backed ephemeral store shared by every replica of every service.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    del_if_eq: Script,
    set_ex_if_eq: Script,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        tracing::info!("redis connection manager created");
        Ok(Self {
            conn,
            del_if_eq: Script::new(DEL_IF_EQ),
            set_ex_if_eq: Script::new(SET_EX_IF_EQ),
        })
    }

    pub fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

#[async_trait]
impl EphemeralStore for RedisStore {
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl_secs).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn del_if_eq(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .del_if_eq
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    async fn set_ex_if_eq(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl_secs: u64,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let written: i64 = self
            .set_ex_if_eq
            .key(key)
            .arg(expected)
            .arg(value)
            .arg(ttl_secs)
            .invoke_async(&mut conn)
            .await?;
        Ok(written == 1)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.exists(key).await?)
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.expire(key, ttl_secs as i64).await?)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.sadd::<_, _, ()>(key, member).await?;
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.srem::<_, _, ()>(key, member).await?;
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.smembers(key).await?)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.hset::<_, _, _, ()>(key, field, value).await?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.hget(key, field).await?)
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.hdel::<_, _, ()>(key, field).await?;
        Ok(())
    }

    async fn hkeys(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.hkeys(key).await?)
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.hgetall(key).await?)
    }

    async fn hincr(&self, key: &str, field: &str, delta: i64) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.hincr(key, field, delta).await?)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(StoreError::Unavailable(format!("unexpected ping reply: {pong}")))
        }
    }
}

/// Runs against the server named by `REDIS_URL`:
/// `REDIS_URL=redis://127.0.0.1 cargo test -- --ignored`.
#[cfg(test)]
mod tests {
    use pulse_common::id::{ConnectionIdKind, PrefixedId};

    use super::*;

    async fn store() -> RedisStore {
        let url = std::env::var("REDIS_URL").expect("REDIS_URL must be set");
        RedisStore::connect(&url).await.expect("connect to redis")
    }

    fn scratch_key(name: &str) -> String {
        format!("test:{name}:{}", ConnectionIdKind::generate())
    }

    #[tokio::test]
    #[ignore = "requires a running redis"]
    async fn strings_expire_and_delete() {
        let store = store().await;
        let key = scratch_key("str");
        store.set_ex(&key, "v", 60).await.unwrap();
        assert_eq!(store.get(&key).await.unwrap().as_deref(), Some("v"));
        assert!(store.exists(&key).await.unwrap());
        assert!(store.expire(&key, 120).await.unwrap());

        store.del(&key).await.unwrap();
        assert!(!store.exists(&key).await.unwrap());
        assert!(!store.expire(&key, 120).await.unwrap());
    }

    #[tokio::test]
    #[ignore = "requires a running redis"]
    async fn conditional_writes_compare_the_current_value() {
        let store = store().await;
        let key = scratch_key("cas");
        store.set_ex(&key, "v1", 60).await.unwrap();

        assert!(!store.del_if_eq(&key, "other").await.unwrap());
        assert!(!store.set_ex_if_eq(&key, "other", "v2", 60).await.unwrap());
        assert!(store.set_ex_if_eq(&key, "v1", "v2", 60).await.unwrap());
        assert_eq!(store.get(&key).await.unwrap().as_deref(), Some("v2"));

        assert!(!store.del_if_eq(&key, "v1").await.unwrap());
        assert!(store.del_if_eq(&key, "v2").await.unwrap());
        assert!(!store.exists(&key).await.unwrap());
    }

    #[tokio::test]
    #[ignore = "requires a running redis"]
    async fn sets_and_hashes() {
        let store = store().await;
        let set = scratch_key("set");
        store.sadd(&set, "b").await.unwrap();
        store.sadd(&set, "a").await.unwrap();
        let mut members = store.smembers(&set).await.unwrap();
        members.sort();
        assert_eq!(members, vec!["a", "b"]);
        store.srem(&set, "a").await.unwrap();
        store.srem(&set, "b").await.unwrap();
        assert!(!store.exists(&set).await.unwrap());

        let hash = scratch_key("hash");
        store.hset(&hash, "f", "1").await.unwrap();
        assert_eq!(store.hincr(&hash, "f", 4).await.unwrap(), 5);
        assert_eq!(store.hget(&hash, "f").await.unwrap().as_deref(), Some("5"));
        assert_eq!(store.hkeys(&hash).await.unwrap(), vec!["f"]);
        store.hdel(&hash, "f").await.unwrap();
        assert!(store.hgetall(&hash).await.unwrap().is_empty());

        store.ping().await.unwrap();
    }
}
