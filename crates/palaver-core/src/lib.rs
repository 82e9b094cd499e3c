//! # palaver-core
//!
//! Event routing and broadcast engine for the Palaver chat server.
//!
//! The core takes a connection-scoped inbound event, runs it through a
//! validation/authorization pipeline, optionally invokes the external
//! operation layer, and fans the resulting events out to the right set of
//! connections with per-connection ordering.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐    ┌───────────────┐    ┌────────────┐
//! │ Connection │───▶│ EventPipeline │───▶│ Dispatcher │
//! └────────────┘    └───────┬───────┘    └─────┬──────┘
//!                           │                  │
//!                    ┌──────▼─────────┐  ┌─────▼─────────┐
//!                    │ OperationLayer │  │ Registry /    │
//!                    │ (external)     │  │ RoomDirectory │
//!                    └────────────────┘  └───────────────┘
//! ```
//!
//! Everything is assembled into a [`Hub`], created at server start and
//! injected into the transport layer.

pub mod dispatch;
pub mod event;
pub mod hub;
pub mod ops;
pub mod pipeline;
pub mod queue;
pub mod registry;
pub mod rooms;

pub use dispatch::Dispatcher;
pub use event::{kinds, InboundEvent, OutboundEvent, Target};
pub use hub::{Hub, HubConfig, HubStats};
pub use ops::{NullOperationLayer, OperationError, OperationLayer, OperationOutcome};
pub use pipeline::{AccessPolicy, AllowAll, EventPipeline, EventTable, Rejection, Route};
pub use queue::{OutboundQueue, OverflowPolicy, Push, QueueConfig};
pub use registry::{ConnectionId, ConnectionRegistry, Identity, RegistryConfig, RegistryError};
pub use rooms::{DirectoryConfig, RoomDirectory, RoomId};
