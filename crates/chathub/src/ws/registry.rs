//! Registry of live rooms.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use log::{debug, info};

use super::error::HubError;
use super::room::Room;
use super::types::RoomId;

/// Concurrency-safe map of room id to room.
///
/// Rooms are created lazily and evicted only by [`RoomRegistry::reap`].
pub struct RoomRegistry {
    rooms: DashMap<RoomId, Arc<Room>>,
    /// Tracked separately; `DashMap::len` would deadlock under an entry guard.
    count: AtomicUsize,
    max_rooms: Option<usize>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::with_limit(None)
    }

    pub fn with_limit(max_rooms: Option<usize>) -> Self {
        Self {
            rooms: DashMap::new(),
            count: AtomicUsize::new(0),
            max_rooms,
        }
    }

    /// Return the room, creating it if unseen.
    ///
    /// Concurrent callers for the same unseen id all receive the same instance.
    pub fn get_or_create(&self, room_id: &RoomId) -> Result<Arc<Room>, HubError> {
        if let Some(room) = self.rooms.get(room_id) {
            return Ok(room.clone());
        }

        match self.rooms.entry(room_id.clone()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                self.reserve_slot()?;
                let room = Arc::new(Room::new(room_id.clone()));
                entry.insert(room.clone());
                info!("Created room {}", room_id);
                Ok(room)
            }
        }
    }

    /// Reserve a slot for one more room. Different ids live in different
    /// shards, so the limit is enforced on the counter itself.
    fn reserve_slot(&self) -> Result<(), HubError> {
        let Some(max) = self.max_rooms else {
            self.count.fetch_add(1, Ordering::AcqRel);
            return Ok(());
        };
        self.count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .map(|_| ())
            .map_err(|_| HubError::RoomCapacity(max))
    }

    /// Return an existing room.
    pub fn get(&self, room_id: &RoomId) -> Result<Arc<Room>, HubError> {
        self.rooms
            .get(room_id)
            .map(|room| room.clone())
            .ok_or_else(|| HubError::RoomNotFound(room_id.clone()))
    }

    pub fn contains(&self, room_id: &RoomId) -> bool {
        self.rooms.contains_key(room_id)
    }

    /// Remove a room regardless of membership. The caller retires it.
    pub(crate) fn remove(&self, room_id: &RoomId) -> Option<Arc<Room>> {
        let removed = self.rooms.remove(room_id).map(|(_, room)| room);
        if removed.is_some() {
            self.count.fetch_sub(1, Ordering::AcqRel);
        }
        removed
    }

    /// Remove and retire every room with zero members.
    ///
    /// A room is retired under its own membership lock, so a concurrent admit
    /// either lands before (and the room is kept) or fails with `RoomClosed`.
    pub fn reap(&self) -> Vec<RoomId> {
        let candidates: Vec<RoomId> = self
            .rooms
            .iter()
            .filter(|entry| entry.value().is_empty())
            .map(|entry| entry.key().clone())
            .collect();

        let mut reaped = Vec::new();
        for room_id in candidates {
            if self
                .rooms
                .remove_if(&room_id, |_, room| room.retire_if_empty())
                .is_some()
            {
                self.count.fetch_sub(1, Ordering::AcqRel);
                debug!("Reaped empty room {}", room_id);
                reaped.push(room_id);
            }
        }

        if !reaped.is_empty() {
            info!("Reaped {} empty room(s)", reaped.len());
        }
        reaped
    }

    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of live rooms, sorted by id.
    pub fn rooms(&self) -> Vec<Arc<Room>> {
        let mut rooms: Vec<_> = self.rooms.iter().map(|entry| entry.value().clone()).collect();
        rooms.sort_by(|a, b| a.id().cmp(b.id()));
        rooms
    }

    pub fn room_ids(&self) -> Vec<RoomId> {
        self.rooms().iter().map(|room| room.id().clone()).collect()
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::connection::Connection;
    use crate::ws::types::UserIdentity;
    use std::time::Duration;

    fn conn(id: u64, room: &str) -> Arc<Connection> {
        Arc::new(Connection::new(
            id,
            UserIdentity::new(format!("u{id}"), format!("User {id}")),
            RoomId::new(room),
            8,
            Duration::from_secs(10),
        ))
    }

    #[test]
    fn test_get_unknown_room() {
        let registry = RoomRegistry::new();
        assert_eq!(
            registry.get(&RoomId::new("unknown-42")).unwrap_err(),
            HubError::RoomNotFound(RoomId::new("unknown-42"))
        );
    }

    #[test]
    fn test_get_or_create_returns_same_instance() {
        let registry = RoomRegistry::new();
        let a = registry.get_or_create(&RoomId::new("r1")).unwrap();
        let b = registry.get_or_create(&RoomId::new("r1")).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_get_or_create_single_instance() {
        let registry = Arc::new(RoomRegistry::new());
        let barrier = Arc::new(tokio::sync::Barrier::new(32));

        let mut handles = Vec::new();
        for _ in 0..32 {
            let registry = registry.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                registry.get_or_create(&RoomId::new("fresh")).unwrap()
            }));
        }

        let mut rooms = Vec::new();
        for handle in handles {
            rooms.push(handle.await.unwrap());
        }

        let first = &rooms[0];
        assert!(rooms.iter().all(|room| Arc::ptr_eq(room, first)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_reap_removes_only_empty_rooms() {
        let registry = RoomRegistry::new();
        let busy = registry.get_or_create(&RoomId::new("busy")).unwrap();
        let idle = registry.get_or_create(&RoomId::new("idle")).unwrap();
        busy.admit(conn(1, "busy")).unwrap();

        let reaped = registry.reap();

        assert_eq!(reaped, vec![RoomId::new("idle")]);
        assert!(registry.contains(&RoomId::new("busy")));
        assert!(!registry.contains(&RoomId::new("idle")));
        assert!(!idle.is_accepting());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_reaped_room_is_recreated_fresh() {
        let registry = RoomRegistry::new();
        let old = registry.get_or_create(&RoomId::new("r1")).unwrap();
        registry.reap();

        let new = registry.get_or_create(&RoomId::new("r1")).unwrap();
        assert!(!Arc::ptr_eq(&old, &new));
        assert!(new.is_accepting());
    }

    #[test]
    fn test_room_limit() {
        let registry = RoomRegistry::with_limit(Some(2));
        registry.get_or_create(&RoomId::new("a")).unwrap();
        registry.get_or_create(&RoomId::new("b")).unwrap();

        assert_eq!(
            registry.get_or_create(&RoomId::new("c")).unwrap_err(),
            HubError::RoomCapacity(2)
        );
        // Existing rooms still resolve at the limit.
        assert!(registry.get_or_create(&RoomId::new("a")).is_ok());

        registry.reap();
        assert!(registry.get_or_create(&RoomId::new("c")).is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_room_limit_holds_under_concurrent_creates() {
        let registry = Arc::new(RoomRegistry::with_limit(Some(8)));
        let barrier = Arc::new(tokio::sync::Barrier::new(64));

        let mut handles = Vec::new();
        for i in 0..64 {
            let registry = registry.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                registry.get_or_create(&RoomId::new(format!("room-{i}")))
            }));
        }

        let mut created = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => created += 1,
                Err(e) => assert_eq!(e, HubError::RoomCapacity(8)),
            }
        }

        assert_eq!(created, 8);
        assert_eq!(registry.len(), 8);
        assert_eq!(registry.rooms().len(), 8);
    }

    #[test]
    fn test_remove_room() {
        let registry = RoomRegistry::new();
        registry.get_or_create(&RoomId::new("r1")).unwrap();
        assert!(registry.remove(&RoomId::new("r1")).is_some());
        assert!(registry.remove(&RoomId::new("r1")).is_none());
        assert!(registry.is_empty());
    }
}
