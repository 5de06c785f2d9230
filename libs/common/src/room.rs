//! Logical broadcast groups.
//!
//! A room is identified on the wire and in every store by `<kind>:<id>`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoomKind {
    Conversation,
    Channel,
    Project,
    User,
}

impl RoomKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RoomKind::Conversation => "conversation",
            RoomKind::Channel => "channel",
            RoomKind::Project => "project",
            RoomKind::User => "user",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomId {
    kind: RoomKind,
    id: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RoomParseError {
    #[error("room key must look like <kind>:<id>")]
    Malformed,
    #[error("unknown room kind `{0}`")]
    UnknownKind(String),
}

impl RoomId {
    pub fn new(kind: RoomKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    pub fn conversation(id: impl Into<String>) -> Self {
        Self::new(RoomKind::Conversation, id)
    }

    pub fn channel(id: impl Into<String>) -> Self {
        Self::new(RoomKind::Channel, id)
    }

    pub fn project(id: impl Into<String>) -> Self {
        Self::new(RoomKind::Project, id)
    }

    /// The personal room every authenticated user may join.
    pub fn user(id: impl Into<String>) -> Self {
        Self::new(RoomKind::User, id)
    }

    pub fn kind(&self) -> RoomKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}

impl FromStr for RoomId {
    type Err = RoomParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s.split_once(':').ok_or(RoomParseError::Malformed)?;
        if id.is_empty() {
            return Err(RoomParseError::Malformed);
        }
        let kind = match kind {
            "conversation" => RoomKind::Conversation,
            "channel" => RoomKind::Channel,
            "project" => RoomKind::Project,
            "user" => RoomKind::User,
            other => return Err(RoomParseError::UnknownKind(other.to_string())),
        };
        Ok(Self::new(kind, id))
    }
}

impl Serialize for RoomId {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RoomId {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
