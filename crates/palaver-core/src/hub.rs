//! The assembled routing core.
//!
//! A [`Hub`] owns the connection registry, room directory, dispatcher, and
//! event pipeline, and exposes the surfaces the outside world uses: the
//! transport adapter (connect / handle_inbound / outbound / disconnect) and
//! non-connection collaborators (emit). It is created at server start and
//! injected wherever needed; there is no ambient global state.

use crate::dispatch::Dispatcher;
use crate::event::{InboundEvent, OutboundEvent};
use crate::ops::OperationLayer;
use crate::pipeline::{AccessPolicy, AllowAll, EventPipeline, EventTable, Rejection};
use crate::queue::OutboundQueue;
use crate::registry::{ConnectionId, ConnectionRegistry, Identity, RegistryConfig, RegistryError};
use crate::rooms::{DirectoryConfig, RoomDirectory};
use std::sync::Arc;
use tracing::info;

/// Hub configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct HubConfig {
    /// Connection registry limits and queue settings.
    pub registry: RegistryConfig,
    /// Room directory limits.
    pub directory: DirectoryConfig,
}

/// Point-in-time counters.
#[derive(Debug, Clone, Copy)]
pub struct HubStats {
    /// Live connections.
    pub connections: usize,
    /// Existing rooms.
    pub rooms: usize,
    /// Total room memberships.
    pub memberships: usize,
}

/// The routing core: registry + rooms + pipeline + dispatcher.
pub struct Hub {
    registry: Arc<ConnectionRegistry>,
    rooms: Arc<RoomDirectory>,
    dispatcher: Arc<Dispatcher>,
    pipeline: EventPipeline,
}

impl Hub {
    /// Assemble a hub.
    #[must_use]
    pub fn new(
        config: HubConfig,
        table: EventTable,
        policy: Arc<dyn AccessPolicy>,
        ops: Arc<dyn OperationLayer>,
    ) -> Self {
        info!(?config, "Creating hub");
        let registry = Arc::new(ConnectionRegistry::new(config.registry));
        let rooms = Arc::new(RoomDirectory::new(Arc::clone(&registry), config.directory));
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&registry), Arc::clone(&rooms)));
        let pipeline = EventPipeline::new(
            Arc::clone(&registry),
            Arc::clone(&rooms),
            Arc::clone(&dispatcher),
            table,
            policy,
            ops,
        );
        Self {
            registry,
            rooms,
            dispatcher,
            pipeline,
        }
    }

    /// Hub with the default chat event table and a permit-all policy.
    #[must_use]
    pub fn with_defaults(config: HubConfig, ops: Arc<dyn OperationLayer>) -> Self {
        Self::new(config, EventTable::chat_defaults(), Arc::new(AllowAll), ops)
    }

    /// Register a connection for a verified identity.
    ///
    /// # Errors
    ///
    /// Returns a [`RegistryError`] if the identity is unverified or the
    /// connection limit is reached.
    pub fn connect(&self, identity: Identity) -> Result<ConnectionId, RegistryError> {
        self.registry.register(identity)
    }

    /// Tear down a connection: close its queue, unregister it, and remove
    /// it from every room. Idempotent; once this returns, no later
    /// `members_of` observes the connection and no dispatch reaches it.
    pub fn disconnect(&self, conn: &ConnectionId) -> bool {
        let removed = self.registry.unregister(conn);
        self.rooms.leave_all(conn);
        removed
    }

    /// Transport-facing inbound entry point.
    ///
    /// # Errors
    ///
    /// Returns the rejection (already reported to the origin's queue).
    pub async fn handle_inbound(
        &self,
        origin: &ConnectionId,
        event: InboundEvent,
    ) -> Result<(), Rejection> {
        self.pipeline.handle(origin, event).await
    }

    /// Notification entry point for server-originated events.
    pub fn emit(&self, event: OutboundEvent) -> usize {
        self.dispatcher.emit(event)
    }

    /// The outbound queue of a connection, for its drain task.
    #[must_use]
    pub fn outbound(&self, conn: &ConnectionId) -> Option<Arc<OutboundQueue>> {
        self.registry.lookup(conn).map(|c| Arc::clone(c.queue()))
    }

    /// The connection registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// The room directory (operation layers use this to pin rooms).
    #[must_use]
    pub fn rooms(&self) -> &Arc<RoomDirectory> {
        &self.rooms
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        HubStats {
            connections: self.registry.len(),
            rooms: self.rooms.room_count(),
            memberships: self.rooms.membership_count(),
        }
    }
}
