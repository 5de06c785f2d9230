//! Per-connection gateway state.

use std::collections::HashSet;
use std::sync::Arc;

use pulse_common::RoomId;
use tokio::sync::mpsc;

use crate::auth::tokens::Identity;

/// Outbound queue depth per connection. A full queue drops events for that
/// connection only.
pub const OUTBOUND_CAPACITY: usize = 256;

/// Items drained by a connection's socket loop.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// An encoded JSON text frame, shared across all recipients of a fanout.
    Frame(Arc<str>),
    /// Send a close frame and stop.
    Close { code: u16, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting for a credential.
    Authenticating,
    /// Open without identity (optional-auth deployments only).
    Observer,
    Authenticated,
    Closed,
}

/// A live connection in the gateway arena.
pub struct Connection {
    pub id: String,
    pub state: ConnectionState,
    pub identity: Option<Identity>,
    pub rooms: HashSet<RoomId>,
    pub outbound: mpsc::Sender<Outbound>,
}

impl Connection {
    pub fn new(id: String, outbound: mpsc::Sender<Outbound>) -> Self {
        Self {
            id,
            state: ConnectionState::Authenticating,
            identity: None,
            rooms: HashSet::new(),
            outbound,
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        self.identity.as_ref().map(|i| i.sub.as_str())
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == ConnectionState::Authenticated
    }
}
