//! Event types flowing through the routing core.
//!
//! Payloads are JSON values the router never interprets beyond structural
//! validation; their meaning belongs to the operation layer and the clients.

use crate::registry::{ConnectionId, Identity};
use crate::rooms::RoomId;
use serde_json::Value;

/// Well-known event kinds. The set is open: any kind registered in the
/// event table is routable.
pub mod kinds {
    /// Join a room.
    pub const ROOM_JOIN: &str = "room.join";
    /// Leave a room.
    pub const ROOM_LEAVE: &str = "room.leave";
    /// Post a chat message (goes through the operation layer).
    pub const CHAT_MESSAGE: &str = "chat.message";
    /// Typing indicator (pure relay, no operation layer).
    pub const TYPING: &str = "typing";
    /// Server-to-origin acknowledgments and error reports.
    pub const SYSTEM: &str = "system";
}

/// An event received from a client connection.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    /// Event kind, looked up in the event table.
    pub kind: String,
    /// Payload, opaque to the router.
    pub payload: Value,
}

impl InboundEvent {
    /// Create a new inbound event.
    #[must_use]
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }
}

/// Target specification for an outbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// A single connection.
    Connection(ConnectionId),
    /// Every connection owned by an identity (multi-device).
    Identity(Identity),
    /// Every member connection of a room.
    Room(RoomId),
    /// Every registered connection.
    All,
}

/// An event to deliver to zero or more connections.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundEvent {
    /// Event kind as seen by receiving clients.
    pub kind: String,
    /// Payload, opaque to the router.
    pub payload: Value,
    /// Who receives this event.
    pub target: Target,
}

impl OutboundEvent {
    /// Event addressed to a single connection.
    #[must_use]
    pub fn to_connection(kind: impl Into<String>, payload: Value, conn: ConnectionId) -> Self {
        Self {
            kind: kind.into(),
            payload,
            target: Target::Connection(conn),
        }
    }

    /// Event addressed to all connections of an identity.
    #[must_use]
    pub fn to_identity(kind: impl Into<String>, payload: Value, identity: Identity) -> Self {
        Self {
            kind: kind.into(),
            payload,
            target: Target::Identity(identity),
        }
    }

    /// Event addressed to a room's members.
    #[must_use]
    pub fn to_room(kind: impl Into<String>, payload: Value, room: impl Into<RoomId>) -> Self {
        Self {
            kind: kind.into(),
            payload,
            target: Target::Room(room.into()),
        }
    }

    /// Event addressed to every registered connection.
    #[must_use]
    pub fn broadcast(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            target: Target::All,
        }
    }

    /// The room this event is scoped to, if the target is a room.
    #[must_use]
    pub fn room(&self) -> Option<&str> {
        match &self.target {
            Target::Room(room) => Some(room.as_str()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_outbound_builders() {
        let to_room = OutboundEvent::to_room(kinds::CHAT_MESSAGE, json!({"text": "hi"}), "lobby");
        assert_eq!(to_room.target, Target::Room("lobby".to_string()));
        assert_eq!(to_room.room(), Some("lobby"));

        let all = OutboundEvent::broadcast(kinds::SYSTEM, json!({"notice": "maintenance"}));
        assert_eq!(all.target, Target::All);
        assert_eq!(all.room(), None);
    }

    #[test]
    fn test_inbound_event() {
        let event = InboundEvent::new(kinds::ROOM_JOIN, json!({"room": "lobby"}));
        assert_eq!(event.kind, kinds::ROOM_JOIN);
        assert_eq!(event.payload["room"], "lobby");
    }
}
