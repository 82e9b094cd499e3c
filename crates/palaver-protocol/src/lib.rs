//! # palaver-protocol
//!
//! Wire protocol for the Palaver chat routing core.
//!
//! Defines the frames exchanged between chat clients and the server,
//! a length-prefixed MessagePack codec, and protocol versioning.
//!
//! ## Frame Types
//!
//! - `Connect` / `Connected` - Handshake
//! - `Event` - Chat events, inbound and outbound
//! - `Ack` / `Error` - Acknowledgments and errors
//! - `Ping` / `Pong` - Keepalive
//!
//! ## Example
//!
//! ```rust
//! use palaver_protocol::{codec, Frame};
//!
//! let frame = Frame::event("chat.message", serde_json::json!({"text": "hi"}));
//!
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod frames;
pub mod version;

pub use codec::{decode, encode, ProtocolError};
pub use frames::{codes, Frame, FrameType};
pub use version::{Version, PROTOCOL_VERSION};
