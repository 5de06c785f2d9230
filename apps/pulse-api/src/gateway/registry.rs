//! Connection arena plus room and user indexes.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use pulse_common::RoomId;
use tokio::sync::mpsc::{self, error::TrySendError};

use super::session::{Connection, ConnectionState, Outbound};
use crate::auth::tokens::Identity;

/// What is left behind when a connection is removed.
#[derive(Debug)]
pub struct Departed {
    pub identity: Option<Identity>,
    pub rooms: HashSet<RoomId>,
    /// The user's other live connections, sorted.
    pub remaining: Vec<String>,
}

/// Shared registry of all live connections.
///
/// Uses `DashMap` for shard-level concurrency and `parking_lot::Mutex` per
/// connection. Lock order is connection entry first, then an index shard;
/// index sets are cloned out before any connection is touched.
pub struct ConnectionRegistry {
    connections: DashMap<String, Mutex<Connection>>,
    rooms: DashMap<RoomId, HashSet<String>>,
    users: DashMap<String, HashSet<String>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            rooms: DashMap::new(),
            users: DashMap::new(),
        }
    }

    pub fn register(&self, connection_id: String, outbound: mpsc::Sender<Outbound>) {
        let conn = Connection::new(connection_id.clone(), outbound);
        self.connections.insert(connection_id, Mutex::new(conn));
    }

    /// Attach an identity. Returns false if the connection is gone or
    /// already authenticated.
    pub fn authenticate(&self, connection_id: &str, identity: Identity) -> bool {
        let Some(entry) = self.connections.get(connection_id) else {
            return false;
        };
        let mut conn = entry.lock();
        if conn.is_authenticated() || conn.state == ConnectionState::Closed {
            return false;
        }
        let user_id = identity.sub.clone();
        conn.identity = Some(identity);
        conn.state = ConnectionState::Authenticated;
        self.users
            .entry(user_id)
            .or_default()
            .insert(connection_id.to_string());
        true
    }

    pub fn mark_observer(&self, connection_id: &str) {
        if let Some(entry) = self.connections.get(connection_id) {
            let mut conn = entry.lock();
            if conn.state == ConnectionState::Authenticating {
                conn.state = ConnectionState::Observer;
            }
        }
    }

    pub fn identity(&self, connection_id: &str) -> Option<Identity> {
        let entry = self.connections.get(connection_id)?;
        let conn = entry.lock();
        conn.identity.clone()
    }

    pub fn state(&self, connection_id: &str) -> Option<ConnectionState> {
        let entry = self.connections.get(connection_id)?;
        let state = entry.lock().state;
        Some(state)
    }

    /// Add the connection to `room`. Returns true if it was not already a member.
    pub fn join(&self, connection_id: &str, room: &RoomId) -> bool {
        let Some(entry) = self.connections.get(connection_id) else {
            return false;
        };
        let mut conn = entry.lock();
        if conn.state == ConnectionState::Closed || !conn.rooms.insert(room.clone()) {
            return false;
        }
        self.rooms
            .entry(room.clone())
            .or_default()
            .insert(connection_id.to_string());
        true
    }

    /// Remove the connection from `room`. Returns true if it was a member.
    pub fn leave(&self, connection_id: &str, room: &RoomId) -> bool {
        let Some(entry) = self.connections.get(connection_id) else {
            return false;
        };
        let mut conn = entry.lock();
        if !conn.rooms.remove(room) {
            return false;
        }
        self.unindex_room(room, connection_id);
        true
    }

    pub fn is_member(&self, connection_id: &str, room: &RoomId) -> bool {
        self.connections
            .get(connection_id)
            .is_some_and(|entry| entry.lock().rooms.contains(room))
    }

    pub fn room_members(&self, room: &RoomId) -> Vec<String> {
        let mut ids: Vec<String> = self
            .rooms
            .get(room)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub fn user_connections(&self, user_id: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .users
            .get(user_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Ids of every authenticated connection.
    pub fn authenticated(&self) -> Vec<String> {
        self.users
            .iter()
            .flat_map(|entry| entry.value().iter().cloned().collect::<Vec<_>>())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Queue `item` for one connection without waiting. A full queue drops it.
    pub fn send(&self, connection_id: &str, item: Outbound) -> bool {
        let Some(entry) = self.connections.get(connection_id) else {
            return false;
        };
        let outbound = entry.lock().outbound.clone();
        drop(entry);
        match outbound.try_send(item) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(%connection_id, "outbound queue full, dropping event");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Queue a frame for every member of `room` except `except`.
    /// Returns how many connections accepted it.
    pub fn send_room(&self, room: &RoomId, frame: Arc<str>, except: Option<&str>) -> usize {
        self.room_members(room)
            .iter()
            .filter(|id| Some(id.as_str()) != except)
            .filter(|id| self.send(id, Outbound::Frame(frame.clone())))
            .count()
    }

    /// Drop the connection from the arena and every index.
    pub fn remove(&self, connection_id: &str) -> Option<Departed> {
        let (_, entry) = self.connections.remove(connection_id)?;
        let mut conn = entry.into_inner();
        conn.state = ConnectionState::Closed;

        for room in &conn.rooms {
            self.unindex_room(room, connection_id);
        }

        let mut remaining = Vec::new();
        if let Some(user_id) = conn.user_id() {
            let mut emptied = false;
            if let Some(mut set) = self.users.get_mut(user_id) {
                set.remove(connection_id);
                remaining = set.iter().cloned().collect();
                emptied = set.is_empty();
            }
            if emptied {
                self.users.remove_if(user_id, |_, set| set.is_empty());
            }
            remaining.sort();
        }

        Some(Departed {
            identity: conn.identity.take(),
            rooms: std::mem::take(&mut conn.rooms),
            remaining,
        })
    }

    fn unindex_room(&self, room: &RoomId, connection_id: &str) {
        let mut emptied = false;
        if let Some(mut set) = self.rooms.get_mut(room) {
            set.remove(connection_id);
            emptied = set.is_empty();
        }
        if emptied {
            self.rooms.remove_if(room, |_, set| set.is_empty());
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
