//! Room directory.
//!
//! Maps room identifiers to member connection sets. Rooms are ephemeral:
//! created on first join (or explicitly), deleted when the last member
//! leaves, unless the operation layer marks them persistent. The connection
//! registry is the source of truth for liveness; joins are re-checked
//! against it under the room lock so a disconnecting connection can never
//! linger in a membership set.

use crate::registry::{ConnectionId, ConnectionRegistry};
use dashmap::{DashMap, DashSet};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// A room identifier.
pub type RoomId = String;

/// Maximum room identifier length.
pub const MAX_ROOM_ID_LENGTH: usize = 128;

/// Validate a room identifier.
///
/// # Errors
///
/// Returns a message describing why the identifier is invalid.
pub fn validate_room_id(room: &str) -> Result<(), &'static str> {
    if room.is_empty() {
        return Err("Room id cannot be empty");
    }
    if room.len() > MAX_ROOM_ID_LENGTH {
        return Err("Room id too long");
    }
    if room.starts_with('$') {
        return Err("Room ids starting with '$' are reserved");
    }
    if !room.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("Room id contains invalid characters");
    }
    Ok(())
}

/// Room directory errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DirectoryError {
    /// Malformed room identifier.
    #[error("Invalid room id: {0}")]
    InvalidRoom(&'static str),

    /// The connection is not registered (already disconnected).
    #[error("Connection not found: {0}")]
    ConnectionNotFound(ConnectionId),

    /// Room limit reached.
    #[error("Room limit reached")]
    RoomLimitReached,

    /// Per-connection membership limit reached.
    #[error("Membership limit reached")]
    MembershipLimitReached,
}

/// Room directory configuration.
#[derive(Debug, Clone, Copy)]
pub struct DirectoryConfig {
    /// Maximum number of rooms.
    pub max_rooms: usize,
    /// Maximum rooms a single connection may join.
    pub max_rooms_per_connection: usize,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            max_rooms: 10_000,
            max_rooms_per_connection: 100,
        }
    }
}

#[derive(Debug, Default)]
struct RoomEntry {
    members: HashSet<ConnectionId>,
    persistent: bool,
}

/// Directory of rooms and their member connections.
pub struct RoomDirectory {
    rooms: DashMap<RoomId, RoomEntry>,
    /// Reverse index: connection -> rooms it belongs to.
    memberships: DashMap<ConnectionId, DashSet<RoomId>>,
    registry: Arc<ConnectionRegistry>,
    config: DirectoryConfig,
}

impl RoomDirectory {
    /// Create a directory backed by the given registry.
    #[must_use]
    pub fn new(registry: Arc<ConnectionRegistry>, config: DirectoryConfig) -> Self {
        Self {
            rooms: DashMap::new(),
            memberships: DashMap::new(),
            registry,
            config,
        }
    }

    /// Add a connection to a room, creating the room on first join.
    ///
    /// Idempotent: joining a room twice returns `Ok(false)` and leaves the
    /// membership set unchanged.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionNotFound` if the registry no longer knows the
    /// connection, `InvalidRoom` for a malformed identifier, or a limit
    /// error.
    pub fn join(&self, room: &str, conn: &ConnectionId) -> Result<bool, DirectoryError> {
        validate_room_id(room).map_err(DirectoryError::InvalidRoom)?;

        if !self.registry.contains(conn) {
            return Err(DirectoryError::ConnectionNotFound(conn.clone()));
        }

        {
            let joined = self.memberships.entry(conn.clone()).or_default();
            if joined.contains(room) {
                return Ok(false);
            }
            if joined.len() >= self.config.max_rooms_per_connection {
                return Err(DirectoryError::MembershipLimitReached);
            }
            joined.insert(room.to_string());
        }

        // Approximate under concurrent first-joins; never checked while
        // holding a shard guard.
        if !self.rooms.contains_key(room) && self.rooms.len() >= self.config.max_rooms {
            return self.abort_join(room, conn, DirectoryError::RoomLimitReached);
        }

        let live = {
            let mut entry = self.rooms.entry(room.to_string()).or_default();
            entry.members.insert(conn.clone());

            // Disconnect may have raced past the liveness check above.
            // Re-checking under the room lock means either we see the
            // disconnect and undo, or leave_all sees our membership and
            // removes it; never a lingering entry.
            if self.registry.contains(conn) {
                true
            } else {
                entry.members.remove(conn);
                false
            }
        };

        if live {
            debug!(room = %room, connection = %conn, "Joined room");
            Ok(true)
        } else {
            self.abort_join(room, conn, DirectoryError::ConnectionNotFound(conn.clone()))
        }
    }

    fn abort_join(
        &self,
        room: &str,
        conn: &ConnectionId,
        err: DirectoryError,
    ) -> Result<bool, DirectoryError> {
        if let Some(joined) = self.memberships.get(conn) {
            joined.remove(room);
        }
        self.drop_room_if_dead(room);
        Err(err)
    }

    /// Remove a connection from a room. Idempotent.
    ///
    /// Returns `true` if the connection was a member. An empty
    /// non-persistent room is deleted.
    pub fn leave(&self, room: &str, conn: &ConnectionId) -> bool {
        if let Some(joined) = self.memberships.get(conn) {
            joined.remove(room);
        }

        let removed = self
            .rooms
            .get_mut(room)
            .map(|mut entry| entry.members.remove(conn))
            .unwrap_or(false);

        if removed {
            debug!(room = %room, connection = %conn, "Left room");
            self.drop_room_if_dead(room);
        }
        removed
    }

    /// Remove a connection from every room it belongs to.
    pub fn leave_all(&self, conn: &ConnectionId) {
        let Some((_, joined)) = self.memberships.remove(conn) else {
            return;
        };
        for room in joined {
            if let Some(mut entry) = self.rooms.get_mut(&room) {
                entry.members.remove(conn);
            }
            self.drop_room_if_dead(&room);
        }
        debug!(connection = %conn, "Left all rooms");
    }

    fn drop_room_if_dead(&self, room: &str) {
        let deleted = self
            .rooms
            .remove_if(room, |_, entry| {
                entry.members.is_empty() && !entry.persistent
            })
            .is_some();
        if deleted {
            debug!(room = %room, "Deleted empty room");
        }
    }

    /// Snapshot of a room's members. Empty if the room does not exist.
    #[must_use]
    pub fn members_of(&self, room: &str) -> Vec<ConnectionId> {
        self.rooms
            .get(room)
            .map(|entry| entry.members.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether a connection is a member of a room.
    #[must_use]
    pub fn is_member(&self, room: &str, conn: &ConnectionId) -> bool {
        self.rooms
            .get(room)
            .map(|entry| entry.members.contains(conn))
            .unwrap_or(false)
    }

    /// Explicitly create a room with no members.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRoom` or `RoomLimitReached`.
    pub fn create(&self, room: &str) -> Result<(), DirectoryError> {
        validate_room_id(room).map_err(DirectoryError::InvalidRoom)?;
        let existed = self.rooms.contains_key(room);
        if !existed && self.rooms.len() >= self.config.max_rooms {
            return Err(DirectoryError::RoomLimitReached);
        }
        self.rooms.entry(room.to_string()).or_default();
        if !existed {
            debug!(room = %room, "Created room");
        }
        Ok(())
    }

    /// Mark a room persistent (exempt from empty-deletion) or ephemeral.
    ///
    /// Creates the room if it does not exist yet, so the operation layer
    /// can pin a room before anyone joins.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRoom` or `RoomLimitReached`.
    pub fn set_persistent(&self, room: &str, persistent: bool) -> Result<(), DirectoryError> {
        self.create(room)?;
        if let Some(mut entry) = self.rooms.get_mut(room) {
            entry.persistent = persistent;
        }
        if !persistent {
            self.drop_room_if_dead(room);
        }
        Ok(())
    }

    /// Whether a room currently exists.
    #[must_use]
    pub fn contains_room(&self, room: &str) -> bool {
        self.rooms.contains_key(room)
    }

    /// Snapshot of the rooms a connection belongs to.
    #[must_use]
    pub fn rooms_of(&self, conn: &ConnectionId) -> Vec<RoomId> {
        self.memberships
            .get(conn)
            .map(|set| set.iter().map(|room| room.clone()).collect())
            .unwrap_or_default()
    }

    /// Number of rooms.
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Total membership count across all connections.
    #[must_use]
    pub fn membership_count(&self) -> usize {
        self.memberships.iter().map(|set| set.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Identity, RegistryConfig};

    fn setup() -> (Arc<ConnectionRegistry>, RoomDirectory, ConnectionId) {
        let registry = Arc::new(ConnectionRegistry::new(RegistryConfig::default()));
        let rooms = RoomDirectory::new(Arc::clone(&registry), DirectoryConfig::default());
        let conn = registry.register(Identity::new("user:alice")).unwrap();
        (registry, rooms, conn)
    }

    #[test]
    fn test_join_is_idempotent() {
        let (_registry, rooms, conn) = setup();

        assert_eq!(rooms.join("lobby", &conn), Ok(true));
        assert_eq!(rooms.join("lobby", &conn), Ok(false));

        assert_eq!(rooms.members_of("lobby"), vec![conn.clone()]);
        assert_eq!(rooms.rooms_of(&conn), vec!["lobby".to_string()]);
    }

    #[test]
    fn test_join_unknown_connection() {
        let (_registry, rooms, _conn) = setup();
        let ghost = ConnectionId::from("conn_ghost");

        assert_eq!(
            rooms.join("lobby", &ghost),
            Err(DirectoryError::ConnectionNotFound(ghost))
        );
        assert!(!rooms.contains_room("lobby"));
    }

    #[test]
    fn test_join_after_disconnect() {
        let (registry, rooms, conn) = setup();

        registry.unregister(&conn);
        assert!(matches!(
            rooms.join("lobby", &conn),
            Err(DirectoryError::ConnectionNotFound(_))
        ));
        assert!(rooms.members_of("lobby").is_empty());
        assert!(rooms.rooms_of(&conn).is_empty());
    }

    #[test]
    fn test_leave_deletes_empty_room() {
        let (_registry, rooms, conn) = setup();

        rooms.join("lobby", &conn).unwrap();
        assert!(rooms.leave("lobby", &conn));
        // Idempotent.
        assert!(!rooms.leave("lobby", &conn));

        assert!(!rooms.contains_room("lobby"));
        assert!(rooms.members_of("lobby").is_empty());

        // A later join recreates the room fresh.
        assert_eq!(rooms.join("lobby", &conn), Ok(true));
        assert_eq!(rooms.members_of("lobby").len(), 1);
    }

    #[test]
    fn test_persistent_room_survives_emptiness() {
        let (_registry, rooms, conn) = setup();

        rooms.set_persistent("announcements", true).unwrap();
        rooms.join("announcements", &conn).unwrap();
        rooms.leave("announcements", &conn);

        assert!(rooms.contains_room("announcements"));
        assert!(rooms.members_of("announcements").is_empty());

        // Clearing the flag on an empty room deletes it.
        rooms.set_persistent("announcements", false).unwrap();
        assert!(!rooms.contains_room("announcements"));
    }

    #[test]
    fn test_leave_all() {
        let (registry, rooms, conn) = setup();
        let other = registry.register(Identity::new("user:bob")).unwrap();

        rooms.join("lobby", &conn).unwrap();
        rooms.join("dev", &conn).unwrap();
        rooms.join("lobby", &other).unwrap();

        rooms.leave_all(&conn);

        assert!(rooms.rooms_of(&conn).is_empty());
        assert_eq!(rooms.members_of("lobby"), vec![other]);
        // "dev" had no other members.
        assert!(!rooms.contains_room("dev"));
    }

    #[test]
    fn test_invalid_room_ids() {
        let (_registry, rooms, conn) = setup();

        assert!(matches!(
            rooms.join("", &conn),
            Err(DirectoryError::InvalidRoom(_))
        ));
        assert!(matches!(
            rooms.join("$system", &conn),
            Err(DirectoryError::InvalidRoom(_))
        ));
        let long = "r".repeat(MAX_ROOM_ID_LENGTH + 1);
        assert!(matches!(
            rooms.join(&long, &conn),
            Err(DirectoryError::InvalidRoom(_))
        ));
    }

    #[test]
    fn test_membership_limit() {
        let registry = Arc::new(ConnectionRegistry::new(RegistryConfig::default()));
        let rooms = RoomDirectory::new(
            Arc::clone(&registry),
            DirectoryConfig {
                max_rooms: 10_000,
                max_rooms_per_connection: 2,
            },
        );
        let conn = registry.register(Identity::new("user:alice")).unwrap();

        rooms.join("one", &conn).unwrap();
        rooms.join("two", &conn).unwrap();
        assert_eq!(
            rooms.join("three", &conn),
            Err(DirectoryError::MembershipLimitReached)
        );
        assert!(!rooms.contains_room("three"));
    }
}
