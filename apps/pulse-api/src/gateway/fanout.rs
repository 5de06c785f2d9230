//! The gateway's public surface: connection lifecycle, room membership and
//! event fanout. Application code only reaches connections through here.

use std::sync::Arc;

use dashmap::DashMap;
use pulse_common::id::{ConnectionIdKind, PrefixedId};
use pulse_common::{RoomId, RoomKind};
use tokio::sync::{mpsc, Mutex};

use super::events::ServerEvent;
use super::presence::PresenceTracker;
use super::registry::ConnectionRegistry;
use super::session::{ConnectionState, Outbound};
use crate::auth::tokens::Identity;
use crate::db::entity::EntityStore;
use crate::error::GatewayError;

/// Close codes (4000-range for application-level).
pub const CLOSE_AUTH_FAILED: u16 = 4004;
pub const CLOSE_SESSION_TIMEOUT: u16 = 4009;

pub struct Gateway {
    registry: ConnectionRegistry,
    entities: Arc<dyn EntityStore>,
    presence: PresenceTracker,
    join_personal_room: bool,
    /// Held per user while their connection set and presence record change.
    settling: DashMap<String, Arc<Mutex<()>>>,
}

impl Gateway {
    pub fn new(
        entities: Arc<dyn EntityStore>,
        presence: PresenceTracker,
        join_personal_room: bool,
    ) -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            entities,
            presence,
            join_personal_room,
            settling: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    /// Add a fresh, unauthenticated connection and return its id.
    pub fn connect(&self, outbound: mpsc::Sender<Outbound>) -> String {
        let connection_id = ConnectionIdKind::generate();
        self.registry.register(connection_id.clone(), outbound);
        connection_id
    }

    /// Attach `identity` to the connection: send `ready`, join the personal
    /// room where this service delivers notifications, write presence and
    /// announce the user.
    pub async fn authenticate(
        &self,
        connection_id: &str,
        identity: Identity,
    ) -> Result<(), GatewayError> {
        let user_id = identity.sub.clone();
        let settlement = self.settlement(&user_id);
        let settled = settlement.lock().await;
        if !self.registry.authenticate(connection_id, identity) {
            drop(settled);
            self.release(&user_id, settlement);
            return Err(GatewayError::BadRequest("Already identified".to_string()));
        }

        self.send(
            connection_id,
            &ServerEvent::Ready {
                connection_id: connection_id.to_string(),
                user_id: user_id.clone(),
            },
        );

        if self.join_personal_room {
            self.registry.join(connection_id, &RoomId::user(&user_id));
        }

        let _ = self.presence.set_online(&user_id, connection_id).await;
        self.emit_all(&ServerEvent::UserOnline {
            user_id: user_id.clone(),
        });

        tracing::info!(%connection_id, %user_id, "gateway connection authenticated");
        drop(settled);
        Ok(())
    }

    /// Remain open without identity.
    pub fn observe(&self, connection_id: &str) {
        self.registry.mark_observer(connection_id);
    }

    /// Queue an `unauthorized` event followed by a close frame.
    pub fn reject(&self, connection_id: &str, message: &str) {
        self.send(
            connection_id,
            &ServerEvent::Unauthorized {
                message: message.to_string(),
            },
        );
        self.close(connection_id, CLOSE_AUTH_FAILED, message);
    }

    pub fn close(&self, connection_id: &str, code: u16, reason: &str) {
        self.registry.send(
            connection_id,
            Outbound::Close {
                code,
                reason: reason.to_string(),
            },
        );
    }

    /// Record activity from the connection's user.
    pub async fn touch(&self, connection_id: &str) {
        if let Some(identity) = self.registry.identity(connection_id) {
            let _ = self.presence.refresh(&identity.sub, connection_id).await;
        }
    }

    pub async fn join_room(&self, connection_id: &str, room: &RoomId) -> Result<bool, GatewayError> {
        let identity = self.require_identity(connection_id)?;

        let allowed = match room.kind() {
            RoomKind::User => room.id() == identity.sub,
            _ => self.entities.find_membership(room, &identity.sub).await?,
        };
        if !allowed {
            return Err(GatewayError::Forbidden(format!("Not a member of {room}")));
        }

        let joined = self.registry.join(connection_id, room);
        tracing::debug!(%connection_id, %room, joined, "room join");
        Ok(joined)
    }

    pub fn leave_room(&self, connection_id: &str, room: &RoomId) -> bool {
        self.registry.leave(connection_id, room)
    }

    pub fn require_identity(&self, connection_id: &str) -> Result<Identity, GatewayError> {
        match self.registry.state(connection_id) {
            Some(ConnectionState::Authenticated) => {}
            _ => return Err(GatewayError::Unauthorized("Not authenticated".to_string())),
        }
        self.registry
            .identity(connection_id)
            .ok_or_else(|| GatewayError::Unauthorized("Not authenticated".to_string()))
    }

    /// Send to one connection.
    pub fn send(&self, connection_id: &str, event: &ServerEvent) -> bool {
        match encode(event) {
            Some(frame) => self.registry.send(connection_id, Outbound::Frame(frame)),
            None => false,
        }
    }

    /// Push `event` to every connection currently in `room`.
    pub fn emit_to_room(&self, room: &RoomId, event: &ServerEvent) -> usize {
        self.emit_to_room_except(room, event, None)
    }

    pub fn emit_to_room_except(
        &self,
        room: &RoomId,
        event: &ServerEvent,
        except: Option<&str>,
    ) -> usize {
        let Some(frame) = encode(event) else {
            return 0;
        };
        let delivered = self.registry.send_room(room, frame, except);
        tracing::debug!(%room, event = event.name(), delivered, "room fanout");
        delivered
    }

    pub fn emit_to_user(&self, user_id: &str, event: &ServerEvent) -> usize {
        self.emit_to_room(&RoomId::user(user_id), event)
    }

    /// Push to every authenticated connection.
    pub fn emit_all(&self, event: &ServerEvent) -> usize {
        let Some(frame) = encode(event) else {
            return 0;
        };
        self.registry
            .authenticated()
            .iter()
            .filter(|id| self.registry.send(id, Outbound::Frame(frame.clone())))
            .count()
    }

    /// Remove the connection everywhere and settle presence. Returns true
    /// when this was the user's last live connection.
    pub async fn disconnect(&self, connection_id: &str) -> bool {
        let Some(identity) = self.registry.identity(connection_id) else {
            self.registry.remove(connection_id);
            return false;
        };
        let user_id = identity.sub;

        let settlement = self.settlement(&user_id);
        let settled = settlement.lock().await;
        let Some(departed) = self.registry.remove(connection_id) else {
            drop(settled);
            self.release(&user_id, settlement);
            return false;
        };

        if let Some(successor) = departed.remaining.first() {
            let _ = self
                .presence
                .reassign(&user_id, connection_id, successor)
                .await;
            tracing::info!(%connection_id, %user_id, "gateway connection closed, user still online");
            return false;
        }

        let removed = self.presence.set_offline(&user_id, connection_id).await;
        // Another replica may own the record; only announce when none does.
        if removed.is_degraded() || removed.unwrap_or(false) {
            self.emit_all(&ServerEvent::UserOffline {
                user_id: user_id.clone(),
            });
        }
        tracing::info!(%connection_id, %user_id, "gateway connection closed, user offline");

        drop(settled);
        self.release(&user_id, settlement);
        true
    }

    fn settlement(&self, user_id: &str) -> Arc<Mutex<()>> {
        self.settling
            .entry(user_id.to_string())
            .or_default()
            .clone()
    }

    /// Forget the user's lock once nobody else holds or awaits it.
    fn release(&self, user_id: &str, settlement: Arc<Mutex<()>>) {
        drop(settlement);
        self.settling
            .remove_if(user_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

fn encode(event: &ServerEvent) -> Option<Arc<str>> {
    match event.encode() {
        Ok(text) => Some(Arc::from(text)),
        Err(e) => {
            tracing::error!(error = %e, event = event.name(), "failed to encode event");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use serde_json::Value;

    use super::*;
    use crate::db::kv::{EphemeralStore, MemoryStore, StoreError};
    use crate::db::memory::MemoryEntityStore;
    use crate::gateway::session::OUTBOUND_CAPACITY;

    /// Memory store that yields to the scheduler before every call, like a
    /// network round trip, and can be switched off.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        down: AtomicBool,
    }

    impl FlakyStore {
        async fn round_trip(&self) -> Result<(), StoreError> {
            tokio::task::yield_now().await;
            if self.down.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("down".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl EphemeralStore for FlakyStore {
        async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), StoreError> {
            self.round_trip().await?;
            self.inner.set_ex(key, value, ttl_secs).await
        }
        async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
            self.round_trip().await?;
            self.inner.get(key).await
        }
        async fn del(&self, key: &str) -> Result<(), StoreError> {
            self.round_trip().await?;
            self.inner.del(key).await
        }
        async fn del_if_eq(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
            self.round_trip().await?;
            self.inner.del_if_eq(key, expected).await
        }
        async fn set_ex_if_eq(
            &self,
            key: &str,
            expected: &str,
            value: &str,
            ttl_secs: u64,
        ) -> Result<bool, StoreError> {
            self.round_trip().await?;
            self.inner.set_ex_if_eq(key, expected, value, ttl_secs).await
        }
        async fn exists(&self, key: &str) -> Result<bool, StoreError> {
            self.round_trip().await?;
            self.inner.exists(key).await
        }
        async fn expire(&self, key: &str, ttl_secs: u64) -> Result<bool, StoreError> {
            self.round_trip().await?;
            self.inner.expire(key, ttl_secs).await
        }
        async fn sadd(&self, key: &str, member: &str) -> Result<(), StoreError> {
            self.round_trip().await?;
            self.inner.sadd(key, member).await
        }
        async fn srem(&self, key: &str, member: &str) -> Result<(), StoreError> {
            self.round_trip().await?;
            self.inner.srem(key, member).await
        }
        async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
            self.round_trip().await?;
            self.inner.smembers(key).await
        }
        async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
            self.round_trip().await?;
            self.inner.hset(key, field, value).await
        }
        async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
            self.round_trip().await?;
            self.inner.hget(key, field).await
        }
        async fn hdel(&self, key: &str, field: &str) -> Result<(), StoreError> {
            self.round_trip().await?;
            self.inner.hdel(key, field).await
        }
        async fn hkeys(&self, key: &str) -> Result<Vec<String>, StoreError> {
            self.round_trip().await?;
            self.inner.hkeys(key).await
        }
        async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
            self.round_trip().await?;
            self.inner.hgetall(key).await
        }
        async fn hincr(&self, key: &str, field: &str, delta: i64) -> Result<i64, StoreError> {
            self.round_trip().await?;
            self.inner.hincr(key, field, delta).await
        }
        async fn ping(&self) -> Result<(), StoreError> {
            self.round_trip().await
        }
    }

    fn identity(sub: &str) -> Identity {
        Identity {
            sub: sub.to_string(),
            email: format!("{sub}@example.com"),
            handle: sub.to_string(),
        }
    }

    fn gateway() -> Gateway {
        gateway_over(Arc::new(MemoryStore::new()))
    }

    fn gateway_over(store: Arc<dyn EphemeralStore>) -> Gateway {
        let entities = MemoryEntityStore::new();
        entities.add_conversation("42", &["a", "b"]);
        Gateway::new(Arc::new(entities), PresenceTracker::new(store), true)
    }

    fn open(gateway: &Gateway) -> (String, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        (gateway.connect(tx), rx)
    }

    fn events(rx: &mut mpsc::Receiver<Outbound>) -> Vec<String> {
        let mut names = Vec::new();
        while let Ok(item) = rx.try_recv() {
            if let Outbound::Frame(text) = item {
                let value: Value = serde_json::from_str(&text).unwrap();
                names.push(value["event"].as_str().unwrap_or_default().to_string());
            }
        }
        names
    }

    #[tokio::test]
    async fn authenticate_sends_ready_and_announces() {
        let gateway = gateway();
        let (a, mut rx_a) = open(&gateway);
        gateway.authenticate(&a, identity("a")).await.unwrap();
        assert_eq!(events(&mut rx_a), vec!["ready", "userOnline"]);
        assert!(gateway.presence().is_online("a").await);
        assert!(gateway.registry().is_member(&a, &RoomId::user("a")));

        let err = gateway.authenticate(&a, identity("a")).await.unwrap_err();
        assert_eq!(err.code(), "BAD_REQUEST");
    }

    #[tokio::test]
    async fn join_requires_identity_and_membership() {
        let gateway = gateway();
        let (a, _rx) = open(&gateway);
        let room = RoomId::conversation("42");
        let err = gateway.join_room(&a, &room).await.unwrap_err();
        assert_eq!(err.code(), "UNAUTHORIZED");

        gateway.authenticate(&a, identity("a")).await.unwrap();
        assert!(gateway.join_room(&a, &room).await.unwrap());

        let err = gateway
            .join_room(&a, &RoomId::conversation("99"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "FORBIDDEN");
        let err = gateway.join_room(&a, &RoomId::user("b")).await.unwrap_err();
        assert_eq!(err.code(), "FORBIDDEN");
    }

    #[tokio::test]
    async fn offline_only_after_last_connection() {
        let gateway = gateway();
        let (first, _rx1) = open(&gateway);
        let (second, _rx2) = open(&gateway);
        let (watcher, mut rx_w) = open(&gateway);
        gateway.authenticate(&watcher, identity("b")).await.unwrap();
        gateway.authenticate(&first, identity("a")).await.unwrap();
        gateway.authenticate(&second, identity("a")).await.unwrap();
        let _ = events(&mut rx_w);

        // `second` wrote presence last, so it owns the record.
        assert!(!gateway.disconnect(&second).await);
        let record = gateway.presence().get("a").await.unwrap();
        assert_eq!(record.connection_id, first);
        assert!(events(&mut rx_w).is_empty());

        assert!(gateway.disconnect(&first).await);
        assert!(!gateway.presence().is_online("a").await);
        assert_eq!(events(&mut rx_w), vec!["userOffline"]);
    }

    #[tokio::test]
    async fn simultaneous_last_disconnects_announce_offline_once() {
        for second_closes_first in [true, false] {
            let gateway = gateway_over(Arc::new(FlakyStore::default()));
            let (watcher, mut rx_w) = open(&gateway);
            let (first, _rx1) = open(&gateway);
            let (second, _rx2) = open(&gateway);
            gateway.authenticate(&watcher, identity("b")).await.unwrap();
            gateway.authenticate(&first, identity("a")).await.unwrap();
            gateway.authenticate(&second, identity("a")).await.unwrap();
            let _ = events(&mut rx_w);

            let (went_offline, other) = if second_closes_first {
                tokio::join!(gateway.disconnect(&second), gateway.disconnect(&first))
            } else {
                tokio::join!(gateway.disconnect(&first), gateway.disconnect(&second))
            };
            assert!(!went_offline);
            assert!(other);
            assert!(gateway.registry().user_connections("a").is_empty());
            assert!(!gateway.presence().is_online("a").await);
            assert_eq!(events(&mut rx_w), vec!["userOffline"]);
            assert!(!gateway.settling.contains_key("a"));
        }
    }

    #[tokio::test]
    async fn reconnect_during_disconnect_keeps_presence() {
        let gateway = gateway_over(Arc::new(FlakyStore::default()));
        let (old, _rx_old) = open(&gateway);
        let (fresh, _rx_fresh) = open(&gateway);
        gateway.authenticate(&old, identity("a")).await.unwrap();

        let (closed, joined) = tokio::join!(
            gateway.disconnect(&old),
            gateway.authenticate(&fresh, identity("a"))
        );
        joined.unwrap();
        assert!(closed);
        assert!(gateway.presence().is_online("a").await);
        let record = gateway.presence().get("a").await.unwrap();
        assert_eq!(record.connection_id, fresh);
    }

    #[tokio::test]
    async fn activity_restores_presence_after_a_store_outage() {
        let store = Arc::new(FlakyStore::default());
        let gateway = gateway_over(store.clone());
        let (a, mut rx_a) = open(&gateway);

        store.down.store(true, Ordering::SeqCst);
        gateway.authenticate(&a, identity("a")).await.unwrap();
        assert_eq!(events(&mut rx_a), vec!["ready", "userOnline"]);
        store.down.store(false, Ordering::SeqCst);
        assert!(!gateway.presence().is_online("a").await);

        gateway.touch(&a).await;
        assert!(gateway.presence().is_online("a").await);

        assert!(gateway.disconnect(&a).await);
        assert!(!gateway.presence().is_online("a").await);
    }

    #[tokio::test]
    async fn observers_do_not_receive_broadcasts() {
        let gateway = gateway();
        let (observer, mut rx_o) = open(&gateway);
        gateway.observe(&observer);
        let (a, _rx) = open(&gateway);
        gateway.authenticate(&a, identity("a")).await.unwrap();
        assert!(events(&mut rx_o).is_empty());
    }
}
