//! Frame types for the Palaver wire protocol.
//!
//! A frame is the unit of exchange between a chat client and the server.
//! Inbound client events and outbound deliveries both travel as [`Frame::Event`];
//! everything else is handshake, acknowledgment, or keepalive traffic.

use serde::{Deserialize, Serialize};

/// Frame type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum FrameType {
    Connect = 0x01,
    Connected = 0x02,
    Event = 0x03,
    Ack = 0x04,
    Error = 0x05,
    Ping = 0x06,
    Pong = 0x07,
}

impl From<FrameType> for u8 {
    fn from(ft: FrameType) -> u8 {
        ft as u8
    }
}

impl TryFrom<u8> for FrameType {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x01 => Ok(FrameType::Connect),
            0x02 => Ok(FrameType::Connected),
            0x03 => Ok(FrameType::Event),
            0x04 => Ok(FrameType::Ack),
            0x05 => Ok(FrameType::Error),
            0x06 => Ok(FrameType::Ping),
            0x07 => Ok(FrameType::Pong),
            _ => Err("Invalid frame type"),
        }
    }
}

/// Error codes carried by [`Frame::Error`].
pub mod codes {
    /// Payload failed structural validation.
    pub const VALIDATION: u16 = 4000;
    /// Event kind is not registered.
    pub const UNKNOWN_KIND: u16 = 4001;
    /// Frame could not be decoded or arrived out of sequence.
    pub const PROTOCOL: u16 = 4002;
    /// Client requested an incompatible protocol version.
    pub const UNSUPPORTED_VERSION: u16 = 4003;
    /// Handshake token was missing or rejected.
    pub const UNAUTHENTICATED: u16 = 4010;
    /// Origin identity lacks permission for the operation or room.
    pub const PERMISSION_DENIED: u16 = 4030;
    /// Referenced connection or room does not exist.
    pub const NOT_FOUND: u16 = 4040;
    /// A configured limit (rooms, memberships, connections) was exceeded.
    pub const LIMIT: u16 = 4290;
    /// The operation layer reported a failure.
    pub const OPERATION_FAILED: u16 = 4500;
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Initial handshake. Must be the first frame a client sends.
    #[serde(rename = "connect")]
    Connect {
        /// Protocol major version the client speaks.
        version: u8,
        /// Authentication token, verified by the auth boundary.
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },

    /// Handshake accepted.
    #[serde(rename = "connected")]
    Connected {
        /// Connection identifier assigned by the registry.
        connection_id: String,
        /// Negotiated protocol version.
        version: u8,
        /// Recommended heartbeat interval in milliseconds.
        heartbeat: u32,
    },

    /// A chat event, in either direction.
    #[serde(rename = "event")]
    Event {
        /// Request ID for acknowledgment (client-assigned, echoed in Ack/Error).
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        /// Event kind, e.g. `chat.message` or `room.join`.
        kind: String,
        /// Room scope, when the event targets or came from a room.
        #[serde(skip_serializing_if = "Option::is_none")]
        room: Option<String>,
        /// Event payload, opaque to the router.
        payload: serde_json::Value,
    },

    /// Acknowledgment of a client request.
    #[serde(rename = "ack")]
    Ack {
        /// ID of the acknowledged request.
        id: u64,
    },

    /// Error response.
    #[serde(rename = "error")]
    Error {
        /// ID of the failed request (0 if not applicable).
        id: u64,
        /// Error code, see [`codes`].
        code: u16,
        /// Human-readable error message.
        message: String,
    },

    /// Keepalive ping.
    #[serde(rename = "ping")]
    Ping {
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Keepalive pong.
    #[serde(rename = "pong")]
    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl Frame {
    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Connect { .. } => FrameType::Connect,
            Frame::Connected { .. } => FrameType::Connected,
            Frame::Event { .. } => FrameType::Event,
            Frame::Ack { .. } => FrameType::Ack,
            Frame::Error { .. } => FrameType::Error,
            Frame::Ping { .. } => FrameType::Ping,
            Frame::Pong { .. } => FrameType::Pong,
        }
    }

    /// Create a Connect frame.
    #[must_use]
    pub fn connect(version: u8, token: Option<String>) -> Self {
        Frame::Connect { version, token }
    }

    /// Create a Connected frame.
    #[must_use]
    pub fn connected(connection_id: impl Into<String>, version: u8, heartbeat: u32) -> Self {
        Frame::Connected {
            connection_id: connection_id.into(),
            version,
            heartbeat,
        }
    }

    /// Create an Event frame with no room scope.
    #[must_use]
    pub fn event(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Frame::Event {
            id: None,
            kind: kind.into(),
            room: None,
            payload,
        }
    }

    /// Create a room-scoped Event frame.
    #[must_use]
    pub fn room_event(
        kind: impl Into<String>,
        room: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Frame::Event {
            id: None,
            kind: kind.into(),
            room: Some(room.into()),
            payload,
        }
    }

    /// Create an Ack frame.
    #[must_use]
    pub fn ack(id: u64) -> Self {
        Frame::Ack { id }
    }

    /// Create an Error frame.
    #[must_use]
    pub fn error(id: u64, code: u16, message: impl Into<String>) -> Self {
        Frame::Error {
            id,
            code,
            message: message.into(),
        }
    }

    /// Create a Ping frame.
    #[must_use]
    pub fn ping(timestamp: Option<u64>) -> Self {
        Frame::Ping { timestamp }
    }

    /// Create a Pong frame echoing a ping timestamp.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        Frame::Pong { timestamp }
    }
}
