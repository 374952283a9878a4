#![forbid(unsafe_code)]

// Room Registry - in-memory rooms, members, and the user/connection/room
// bindings the orchestrator consults on every event.
//
// All operations are single-step and synchronous. The registry lock is never
// held across an await point; handlers read what they need, release, perform
// media/storage calls, then reacquire to publish results.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::RwLock as StdRwLock;
use std::time::SystemTime;

/// Visual theme applied to a room, chosen by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoomTheme {
    #[default]
    None,
    Christmas,
    LunarNewYear,
}

/// A live room. The host is the single privileged member; everyone else is a
/// viewer.
#[derive(Debug, Clone)]
pub struct Room {
    pub id: String,
    pub host_id: String,
    /// Ordered, duplicate-free. Always contains `host_id` while the room lives.
    pub members: Vec<String>,
    pub created_at: SystemTime,
    pub theme: RoomTheme,
}

/// Presence record for a logged-in user.
#[derive(Debug, Clone)]
pub struct PresenceRecord {
    pub user_id: String,
    pub name: String,
    pub room_id: Option<String>,
    pub connection_id: String,
}

#[derive(Default)]
struct RegistryState {
    rooms: HashMap<String, Room>,
    /// userId -> current live connectionId
    user_sockets: HashMap<String, String>,
    /// userId -> current roomId
    user_rooms: HashMap<String, String>,
    /// userId -> presence record
    logged_in: HashMap<String, PresenceRecord>,
}

/// Derives the stable room id for a host identity. The same host always
/// recreates the same room, which keeps chat history addressable across host
/// reloads.
pub fn derive_room_id(host_id: &str) -> String {
    let digest = Sha256::digest(format!("room-{host_id}").as_bytes());
    let mut hex = String::with_capacity(12);
    for byte in digest.iter().take(6) {
        use std::fmt::Write;
        let _ = write!(hex, "{byte:02x}");
    }
    format!("room-{hex}")
}

/// In-memory registry behind a single std RwLock.
#[derive(Default)]
pub struct Registry {
    inner: StdRwLock<RegistryState>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the room owned by `host_id`, or returns the existing one with
    /// the host re-added to its member list if missing. Idempotent.
    pub fn create_room(&self, host_id: &str) -> Room {
        let room_id = derive_room_id(host_id);
        let mut state = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let room = state.rooms.entry(room_id.clone()).or_insert_with(|| Room {
            id: room_id,
            host_id: host_id.to_string(),
            members: Vec::new(),
            created_at: SystemTime::now(),
            theme: RoomTheme::None,
        });
        if !room.members.iter().any(|m| m == host_id) {
            room.members.insert(0, host_id.to_string());
        }
        room.clone()
    }

    pub fn find_room_by_id(&self, room_id: &str) -> Option<Room> {
        let state = self.inner.read().unwrap_or_else(|e| e.into_inner());
        state.rooms.get(room_id).cloned()
    }

    pub fn delete_room(&self, room_id: &str) -> Option<Room> {
        let mut state = self.inner.write().unwrap_or_else(|e| e.into_inner());
        state.rooms.remove(room_id)
    }

    /// Adds a member, preserving order and uniqueness. Returns the updated
    /// member list, or `None` if the room does not exist.
    pub fn add_member_to_room(&self, room_id: &str, user_id: &str) -> Option<Vec<String>> {
        let mut state = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let room = state.rooms.get_mut(room_id)?;
        if !room.members.iter().any(|m| m == user_id) {
            room.members.push(user_id.to_string());
        }
        Some(room.members.clone())
    }

    /// Removes a member. Returns the updated member list, or `None` if the
    /// room does not exist.
    pub fn remove_member_from_room(&self, room_id: &str, user_id: &str) -> Option<Vec<String>> {
        let mut state = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let room = state.rooms.get_mut(room_id)?;
        room.members.retain(|m| m != user_id);
        Some(room.members.clone())
    }

    pub fn set_room_theme(&self, room_id: &str, theme: RoomTheme) -> bool {
        let mut state = self.inner.write().unwrap_or_else(|e| e.into_inner());
        match state.rooms.get_mut(room_id) {
            Some(room) => {
                room.theme = theme;
                true
            }
            None => false,
        }
    }

    pub fn set_user_socket(&self, user_id: &str, connection_id: &str) {
        let mut state = self.inner.write().unwrap_or_else(|e| e.into_inner());
        state
            .user_sockets
            .insert(user_id.to_string(), connection_id.to_string());
        if let Some(record) = state.logged_in.get_mut(user_id) {
            record.connection_id = connection_id.to_string();
        }
    }

    pub fn get_user_socket(&self, user_id: &str) -> Option<String> {
        let state = self.inner.read().unwrap_or_else(|e| e.into_inner());
        state.user_sockets.get(user_id).cloned()
    }

    pub fn delete_user_socket(&self, user_id: &str) {
        let mut state = self.inner.write().unwrap_or_else(|e| e.into_inner());
        state.user_sockets.remove(user_id);
    }

    /// Reverse lookup, recomputed by scan. After a rebind the old connection
    /// resolves to nothing, which is what makes the forced-close of a stale
    /// connection safe against the generic disconnect path.
    pub fn find_user_id_by_socket_id(&self, connection_id: &str) -> Option<String> {
        let state = self.inner.read().unwrap_or_else(|e| e.into_inner());
        state
            .user_sockets
            .iter()
            .find(|(_, conn)| conn.as_str() == connection_id)
            .map(|(user, _)| user.clone())
    }

    pub fn set_user_room(&self, user_id: &str, room_id: &str) {
        let mut state = self.inner.write().unwrap_or_else(|e| e.into_inner());
        state
            .user_rooms
            .insert(user_id.to_string(), room_id.to_string());
    }

    pub fn get_user_room(&self, user_id: &str) -> Option<String> {
        let state = self.inner.read().unwrap_or_else(|e| e.into_inner());
        state.user_rooms.get(user_id).cloned()
    }

    pub fn delete_user_room(&self, user_id: &str) {
        let mut state = self.inner.write().unwrap_or_else(|e| e.into_inner());
        state.user_rooms.remove(user_id);
    }

    /// Upserts the presence record for a user. Called on every join/create.
    pub fn upsert_presence(&self, record: PresenceRecord) {
        let mut state = self.inner.write().unwrap_or_else(|e| e.into_inner());
        state.logged_in.insert(record.user_id.clone(), record);
    }

    pub fn get_presence(&self, user_id: &str) -> Option<PresenceRecord> {
        let state = self.inner.read().unwrap_or_else(|e| e.into_inner());
        state.logged_in.get(user_id).cloned()
    }

    /// Removes the presence record after a fully-processed disconnect.
    pub fn remove_presence(&self, user_id: &str) -> Option<PresenceRecord> {
        let mut state = self.inner.write().unwrap_or_else(|e| e.into_inner());
        state.logged_in.remove(user_id)
    }

    /// All presence records currently bound to a room.
    pub fn presence_in_room(&self, room_id: &str) -> Vec<PresenceRecord> {
        let state = self.inner.read().unwrap_or_else(|e| e.into_inner());
        state
            .logged_in
            .values()
            .filter(|p| p.room_id.as_deref() == Some(room_id))
            .cloned()
            .collect()
    }

    /// Snapshot of every live room, for teardown and health reporting.
    pub fn all_rooms(&self) -> Vec<Room> {
        let state = self.inner.read().unwrap_or_else(|e| e.into_inner());
        state.rooms.values().cloned().collect()
    }

    pub fn room_count(&self) -> usize {
        let state = self.inner.read().unwrap_or_else(|e| e.into_inner());
        state.rooms.len()
    }

    pub fn total_member_count(&self) -> usize {
        let state = self.inner.read().unwrap_or_else(|e| e.into_inner());
        state.rooms.values().map(|r| r.members.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_id_is_deterministic_and_prefixed() {
        let a = derive_room_id("host-a");
        let b = derive_room_id("host-a");
        let c = derive_room_id("host-b");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("room-"));
        // "room-" plus 12 hex chars
        assert_eq!(a.len(), 5 + 12);
        assert!(a[5..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn create_room_is_idempotent_and_readds_host() {
        let registry = Registry::new();
        let first = registry.create_room("host");
        let second = registry.create_room("host");
        assert_eq!(first.id, second.id);
        assert_eq!(second.members, vec!["host".to_string()]);

        registry.remove_member_from_room(&first.id, "host");
        let third = registry.create_room("host");
        assert_eq!(third.members, vec!["host".to_string()]);
    }

    #[test]
    fn all_rooms_enumerates_live_rooms() {
        let registry = Registry::new();
        registry.create_room("host-a");
        registry.create_room("host-b");
        let mut hosts: Vec<String> = registry.all_rooms().into_iter().map(|r| r.host_id).collect();
        hosts.sort();
        assert_eq!(hosts, vec!["host-a", "host-b"]);

        registry.delete_room(&derive_room_id("host-a"));
        assert_eq!(registry.all_rooms().len(), 1);
    }

    #[test]
    fn members_stay_unique_and_ordered() {
        let registry = Registry::new();
        let room = registry.create_room("host");
        registry.add_member_to_room(&room.id, "viewer-1");
        registry.add_member_to_room(&room.id, "viewer-2");
        registry.add_member_to_room(&room.id, "viewer-1");
        let room = registry.find_room_by_id(&room.id).unwrap();
        assert_eq!(room.members, vec!["host", "viewer-1", "viewer-2"]);
        assert!(room.members.contains(&room.host_id));
    }

    #[test]
    fn socket_rebind_hides_stale_reverse_lookup() {
        let registry = Registry::new();
        registry.set_user_socket("user", "conn-1");
        assert_eq!(
            registry.find_user_id_by_socket_id("conn-1").as_deref(),
            Some("user")
        );
        registry.set_user_socket("user", "conn-2");
        assert_eq!(registry.find_user_id_by_socket_id("conn-1"), None);
        assert_eq!(
            registry.find_user_id_by_socket_id("conn-2").as_deref(),
            Some("user")
        );
    }

    #[test]
    fn presence_tracks_room_binding() {
        let registry = Registry::new();
        registry.upsert_presence(PresenceRecord {
            user_id: "u1".into(),
            name: "Alice".into(),
            room_id: Some("room-x".into()),
            connection_id: "c1".into(),
        });
        registry.upsert_presence(PresenceRecord {
            user_id: "u2".into(),
            name: "Bob".into(),
            room_id: Some("room-y".into()),
            connection_id: "c2".into(),
        });
        let in_x = registry.presence_in_room("room-x");
        assert_eq!(in_x.len(), 1);
        assert_eq!(in_x[0].name, "Alice");
        registry.remove_presence("u1");
        assert!(registry.presence_in_room("room-x").is_empty());
    }
}
