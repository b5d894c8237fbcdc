//! Per-user presence.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use super::types::{ConnectionId, RoomId, UserId, UserIdentity};

/// Where a user currently is.
///
/// A user with no room is offline. Records are overwritten, never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PresenceRecord {
    pub user_id: UserId,
    pub display_name: String,
    pub room_id: Option<RoomId>,
    pub connection_id: Option<ConnectionId>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl PresenceRecord {
    /// The record of a user the hub has never seen.
    pub fn never_seen(user_id: UserId) -> Self {
        Self {
            user_id,
            display_name: String::new(),
            room_id: None,
            connection_id: None,
            last_seen: None,
        }
    }

    pub fn is_online(&self) -> bool {
        self.room_id.is_some()
    }
}

/// Concurrency-safe map of user id to presence record.
///
/// Only the hub mutates it. Every operation completes before returning, so a
/// caller always reads its own writes.
#[derive(Default)]
pub struct PresenceStore {
    records: DashMap<UserId, PresenceRecord>,
}

impl PresenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a user online in a room. Returns the record it replaced.
    pub fn set_online(
        &self,
        identity: &UserIdentity,
        room_id: &RoomId,
        connection_id: ConnectionId,
    ) -> Option<PresenceRecord> {
        let record = PresenceRecord {
            user_id: identity.user_id.clone(),
            display_name: identity.display_name.clone(),
            room_id: Some(room_id.clone()),
            connection_id: Some(connection_id),
            last_seen: Some(Utc::now()),
        };
        self.records.insert(identity.user_id.clone(), record)
    }

    /// Mark a user offline unconditionally. No-op for unknown users.
    pub fn set_offline(&self, user_id: &UserId) {
        if let Some(mut record) = self.records.get_mut(user_id) {
            record.room_id = None;
            record.connection_id = None;
            record.last_seen = Some(Utc::now());
        }
    }

    /// Mark a user offline only if the record still belongs to `connection_id`.
    ///
    /// Returns false when a newer connection of the same user owns the record.
    pub fn release(&self, user_id: &UserId, connection_id: ConnectionId) -> bool {
        match self.records.get_mut(user_id) {
            Some(mut record) if record.connection_id == Some(connection_id) => {
                record.room_id = None;
                record.connection_id = None;
                record.last_seen = Some(Utc::now());
                true
            }
            _ => false,
        }
    }

    /// Undo a `set_online` by `connection_id`, putting `previous` back.
    ///
    /// Does nothing if another connection has written the record since.
    pub fn restore(
        &self,
        user_id: &UserId,
        connection_id: ConnectionId,
        previous: Option<PresenceRecord>,
    ) {
        let owned = self
            .records
            .get(user_id)
            .is_some_and(|record| record.connection_id == Some(connection_id));
        if !owned {
            return;
        }
        match previous {
            Some(previous) => {
                self.records.insert(user_id.clone(), previous);
            }
            None => {
                self.records
                    .remove_if(user_id, |_, record| record.connection_id == Some(connection_id));
            }
        }
    }

    /// The user's record, or a "never seen" record.
    pub fn get(&self, user_id: &UserId) -> PresenceRecord {
        self.records
            .get(user_id)
            .map(|record| record.clone())
            .unwrap_or_else(|| PresenceRecord::never_seen(user_id.clone()))
    }

    /// Users whose current room is `room_id`, sorted.
    pub fn list_by_room(&self, room_id: &RoomId) -> Vec<UserId> {
        let mut users: Vec<UserId> = self
            .records
            .iter()
            .filter(|record| record.room_id.as_ref() == Some(room_id))
            .map(|record| record.user_id.clone())
            .collect();
        users.sort();
        users
    }

    /// Full records of the users in `room_id`, sorted by user id.
    pub fn records_in_room(&self, room_id: &RoomId) -> Vec<PresenceRecord> {
        let mut records: Vec<PresenceRecord> = self
            .records
            .iter()
            .filter(|record| record.room_id.as_ref() == Some(room_id))
            .map(|record| record.clone())
            .collect();
        records.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        records
    }

    pub fn online_count(&self) -> usize {
        self.records.iter().filter(|record| record.is_online()).count()
    }
}
