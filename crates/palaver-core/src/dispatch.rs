//! Outbound event dispatcher.
//!
//! Resolves an event's target specification into a concrete set of
//! connections and enqueues the event on each one's outbound queue. Target
//! resolution is a snapshot read: connections joining after resolution miss
//! the event, connections gone by delivery time are skipped silently.

use crate::event::{OutboundEvent, Target};
use crate::queue::Push;
use crate::registry::{ConnectionId, ConnectionRegistry};
use crate::rooms::RoomDirectory;
use std::sync::Arc;
use tracing::{debug, trace};

/// Resolves targets and fans events out to connection queues.
pub struct Dispatcher {
    registry: Arc<ConnectionRegistry>,
    rooms: Arc<RoomDirectory>,
}

impl Dispatcher {
    /// Create a dispatcher over the given registry and directory.
    #[must_use]
    pub fn new(registry: Arc<ConnectionRegistry>, rooms: Arc<RoomDirectory>) -> Self {
        Self { registry, rooms }
    }

    fn resolve(&self, target: &Target) -> Vec<ConnectionId> {
        match target {
            Target::Connection(id) => vec![id.clone()],
            Target::Identity(identity) => self.registry.connections_of(identity),
            Target::Room(room) => self.rooms.members_of(room),
            Target::All => self.registry.connection_ids(),
        }
    }

    /// Dispatch an event to every connection in its resolved target set.
    ///
    /// Returns the number of connections the event was enqueued for.
    /// Never blocks: full queues shed per their overflow policy, closed or
    /// unknown connections are skipped.
    pub fn dispatch(&self, event: OutboundEvent) -> usize {
        let targets = self.resolve(&event.target);
        let kind = event.kind.clone();
        let event = Arc::new(event);

        let mut enqueued = 0;
        for id in targets {
            let Some(connection) = self.registry.lookup(&id) else {
                trace!(connection = %id, kind = %kind, "Skipping departed connection");
                continue;
            };
            match connection.queue().push(Arc::clone(&event)) {
                Push::Enqueued => enqueued += 1,
                Push::DroppedOldest => {
                    enqueued += 1;
                    debug!(connection = %id, kind = %kind, "Queue full, dropped oldest");
                }
                Push::DroppedNewest => {
                    debug!(connection = %id, kind = %kind, "Queue full, dropped event");
                }
                Push::Closed => {
                    trace!(connection = %id, kind = %kind, "Skipping closed queue");
                }
            }
        }

        trace!(kind = %kind, recipients = enqueued, "Dispatched");
        enqueued
    }

    /// Entry point for server-originated events not tied to any inbound
    /// client event (scheduled system messages, storage hooks).
    pub fn emit(&self, event: OutboundEvent) -> usize {
        self.dispatch(event)
    }
}
