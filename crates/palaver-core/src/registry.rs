//! Connection registry.
//!
//! Tracks every live connection, the verified identity behind it, and its
//! outbound queue. The registry is the source of truth for connection
//! liveness: the room directory and dispatcher consult it before acting.

use crate::queue::{OutboundQueue, QueueConfig};
use dashmap::{DashMap, DashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::debug;

/// Unique identifier for a live connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

/// Monotonic suffix so two connections in the same nanosecond still differ.
static CONN_SEQ: AtomicU64 = AtomicU64::new(0);

impl ConnectionId {
    /// Wrap an existing identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh identifier.
    #[must_use]
    pub fn generate() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let seq = CONN_SEQ.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{nanos:x}_{seq}"))
    }

    /// The identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A verified user reference, produced by the authentication boundary
/// before the core ever sees the connection. One identity may own several
/// simultaneous connections (multi-device).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity(String);

impl Identity {
    /// Wrap a verified user reference.
    #[must_use]
    pub fn new(user: impl Into<String>) -> Self {
        Self(user.into())
    }

    /// The user reference as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// A blank reference means the auth boundary never ran.
    #[must_use]
    pub fn is_verified(&self) -> bool {
        !self.0.is_empty()
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Registry errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// Registration attempted before handshake verification.
    #[error("Identity is not verified")]
    IdentityUnverified,

    /// Connection limit reached.
    #[error("Connection limit reached ({0})")]
    AtCapacity(usize),
}

/// Registry configuration.
#[derive(Debug, Clone, Copy)]
pub struct RegistryConfig {
    /// Maximum simultaneous connections.
    pub max_connections: usize,
    /// Outbound queue configuration applied to every connection.
    pub queue: QueueConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_connections: 100_000,
            queue: QueueConfig::default(),
        }
    }
}

/// A live connection: identity fixed at handshake, plus its outbound queue.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    identity: Identity,
    queue: Arc<OutboundQueue>,
}

impl Connection {
    /// The connection identifier.
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// The identity bound at handshake. Immutable for the connection's life.
    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// The connection's outbound queue.
    #[must_use]
    pub fn queue(&self) -> &Arc<OutboundQueue> {
        &self.queue
    }
}

/// Registry of live connections, indexed by connection and by identity.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    by_identity: DashMap<Identity, DashSet<ConnectionId>>,
    config: RegistryConfig,
}

impl ConnectionRegistry {
    /// Create a registry with the given configuration.
    #[must_use]
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            connections: DashMap::new(),
            by_identity: DashMap::new(),
            config,
        }
    }

    /// Register a connection for a verified identity.
    ///
    /// # Errors
    ///
    /// Returns `IdentityUnverified` for a blank identity and `AtCapacity`
    /// once the connection limit is reached.
    pub fn register(&self, identity: Identity) -> Result<ConnectionId, RegistryError> {
        if !identity.is_verified() {
            return Err(RegistryError::IdentityUnverified);
        }
        if self.connections.len() >= self.config.max_connections {
            return Err(RegistryError::AtCapacity(self.config.max_connections));
        }

        let id = ConnectionId::generate();
        let connection = Arc::new(Connection {
            id: id.clone(),
            identity: identity.clone(),
            queue: Arc::new(OutboundQueue::new(self.config.queue)),
        });

        self.connections.insert(id.clone(), connection);
        self.by_identity
            .entry(identity.clone())
            .or_default()
            .insert(id.clone());

        debug!(connection = %id, identity = %identity, "Connection registered");
        Ok(id)
    }

    /// Unregister a connection, closing its outbound queue. Idempotent.
    ///
    /// Queue close happens-after any already-accepted delivery; pushes
    /// submitted afterwards are dropped silently. Room cleanup is the hub's
    /// responsibility so both steps appear as one transition to callers.
    pub fn unregister(&self, id: &ConnectionId) -> bool {
        let Some((_, connection)) = self.connections.remove(id) else {
            return false;
        };
        connection.queue.close();

        if let Some(owned) = self.by_identity.get(connection.identity()) {
            owned.remove(id);
            let empty = owned.is_empty();
            drop(owned);
            if empty {
                self.by_identity
                    .remove_if(connection.identity(), |_, set| set.is_empty());
            }
        }

        debug!(connection = %id, "Connection unregistered");
        true
    }

    /// Look up a connection.
    #[must_use]
    pub fn lookup(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(id).map(|c| Arc::clone(&c))
    }

    /// Whether a connection is live.
    #[must_use]
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.contains_key(id)
    }

    /// All live connections of an identity. Possibly empty.
    #[must_use]
    pub fn connections_of(&self, identity: &Identity) -> Vec<ConnectionId> {
        self.by_identity
            .get(identity)
            .map(|set| set.iter().map(|id| id.clone()).collect())
            .unwrap_or_default()
    }

    /// Snapshot of every live connection id.
    #[must_use]
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.connections.iter().map(|c| c.key().clone()).collect()
    }

    /// Number of live connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let registry = ConnectionRegistry::default();

        let id = registry.register(Identity::new("user:alice")).unwrap();
        let connection = registry.lookup(&id).unwrap();

        assert_eq!(connection.id(), &id);
        assert_eq!(connection.identity().as_str(), "user:alice");
        assert!(registry.contains(&id));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unverified_identity_rejected() {
        let registry = ConnectionRegistry::default();
        assert_eq!(
            registry.register(Identity::new("")),
            Err(RegistryError::IdentityUnverified)
        );
    }

    #[test]
    fn test_capacity_limit() {
        let registry = ConnectionRegistry::new(RegistryConfig {
            max_connections: 1,
            queue: QueueConfig::default(),
        });

        registry.register(Identity::new("user:alice")).unwrap();
        assert_eq!(
            registry.register(Identity::new("user:bob")),
            Err(RegistryError::AtCapacity(1))
        );
    }

    #[test]
    fn test_multi_device_identity() {
        let registry = ConnectionRegistry::default();
        let alice = Identity::new("user:alice");

        let phone = registry.register(alice.clone()).unwrap();
        let laptop = registry.register(alice.clone()).unwrap();
        registry.register(Identity::new("user:bob")).unwrap();

        let mut owned = registry.connections_of(&alice);
        owned.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        let mut expected = vec![phone, laptop];
        expected.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        assert_eq!(owned, expected);
    }

    #[test]
    fn test_unregister_closes_queue() {
        let registry = ConnectionRegistry::default();
        let alice = Identity::new("user:alice");

        let id = registry.register(alice.clone()).unwrap();
        let connection = registry.lookup(&id).unwrap();

        assert!(registry.unregister(&id));
        assert!(connection.queue().is_closed());
        assert!(!registry.contains(&id));
        assert!(registry.connections_of(&alice).is_empty());

        // Idempotent.
        assert!(!registry.unregister(&id));
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let a = ConnectionId::generate();
        let b = ConnectionId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("conn_"));
    }
}
