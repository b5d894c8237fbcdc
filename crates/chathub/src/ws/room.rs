//! A room: a named set of connections and the fan-out to them.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use log::debug;

use super::connection::{Connection, SendOutcome};
use super::error::HubError;
use super::types::{ConnectionId, RoomId, ServerEvent, UserId};

/// Per-recipient results of one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Recipients whose queue accepted the event without dropping anything.
    pub delivered: usize,
    /// Recipients whose queue had to discard its oldest event.
    pub dropped_oldest: usize,
    /// Recipients found closed; they were removed from the room.
    pub closed: usize,
}

impl BroadcastReport {
    pub fn attempted(&self) -> usize {
        self.delivered + self.dropped_oldest + self.closed
    }
}

struct Members {
    connections: HashMap<ConnectionId, Arc<Connection>>,
    /// Owner of every admitted connection until it is removed. Broadcast
    /// pruning and retirement leave this alone so each session is counted
    /// out exactly once.
    owners: HashMap<ConnectionId, UserId>,
    sessions: HashMap<UserId, usize>,
    accepting: bool,
}

/// A broadcast domain of zero or more open connections.
pub struct Room {
    id: RoomId,
    members: RwLock<Members>,
    created_at: DateTime<Utc>,
}

impl Room {
    pub fn new(id: RoomId) -> Self {
        Self {
            id,
            members: RwLock::new(Members {
                connections: HashMap::new(),
                owners: HashMap::new(),
                sessions: HashMap::new(),
                accepting: true,
            }),
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &RoomId {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn read(&self) -> RwLockReadGuard<'_, Members> {
        self.members.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Members> {
        self.members.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a connection under its id.
    ///
    /// Returns `true` when this is the user's first connection in the room.
    /// Fails once the room has been retired, or if the connection is already closed.
    pub fn admit(&self, conn: Arc<Connection>) -> Result<bool, HubError> {
        let mut members = self.write();
        if !members.accepting {
            return Err(HubError::RoomClosed(self.id.clone()));
        }
        if conn.is_closed() {
            return Err(HubError::ConnectionClosed(conn.id()));
        }

        let user_id = conn.user_id().clone();
        let id = conn.id();
        members.connections.insert(id, conn);
        if members.owners.insert(id, user_id.clone()).is_some() {
            return Ok(false);
        }
        let sessions = members.sessions.entry(user_id).or_insert(0);
        *sessions += 1;
        Ok(*sessions == 1)
    }

    /// Remove a connection. No-op if absent.
    pub fn remove(&self, connection_id: ConnectionId) -> Option<Arc<Connection>> {
        self.depart(connection_id).0
    }

    /// Remove a connection and report whether its user has no other
    /// connection left in the room. Only the call that removes the user's
    /// last admitted connection gets `true`.
    pub fn depart(&self, connection_id: ConnectionId) -> (Option<Arc<Connection>>, bool) {
        let mut members = self.write();
        let removed = members.connections.remove(&connection_id);

        let Some(user_id) = members.owners.remove(&connection_id) else {
            return (removed, false);
        };
        let remaining = match members.sessions.get_mut(&user_id) {
            Some(sessions) => {
                *sessions = sessions.saturating_sub(1);
                *sessions
            }
            None => return (removed, false),
        };
        if remaining == 0 {
            members.sessions.remove(&user_id);
        }
        (removed, remaining == 0)
    }

    /// Number of admitted connections `user_id` holds in the room.
    pub fn sessions_of(&self, user_id: &UserId) -> usize {
        self.read().sessions.get(user_id).copied().unwrap_or(0)
    }

    /// Fan an event out to every member except `exclude`.
    ///
    /// Best-effort: a closed or slow recipient never prevents delivery to the
    /// others, and the call never waits on any peer. Membership is
    /// snapshotted, so concurrent admits and removes are safe.
    pub fn broadcast(&self, event: ServerEvent, exclude: Option<ConnectionId>) -> BroadcastReport {
        let event = Arc::new(event);
        let recipients: Vec<Arc<Connection>> = self
            .read()
            .connections
            .values()
            .filter(|conn| Some(conn.id()) != exclude)
            .cloned()
            .collect();

        let mut report = BroadcastReport::default();
        let mut stale = Vec::new();

        for conn in recipients {
            match conn.send(event.clone()) {
                Ok(SendOutcome::Queued) => report.delivered += 1,
                Ok(SendOutcome::DroppedOldest) => report.dropped_oldest += 1,
                Err(e) => {
                    debug!("Skipping recipient in room {}: {}", self.id, e);
                    report.closed += 1;
                    stale.push(conn.id());
                }
            }
        }

        if !stale.is_empty() {
            let mut members = self.write();
            for id in stale {
                members.connections.remove(&id);
            }
        }

        report
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.read().connections.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn contains(&self, connection_id: ConnectionId) -> bool {
        self.read().connections.contains_key(&connection_id)
    }

    pub fn len(&self) -> usize {
        self.read().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().connections.is_empty()
    }

    pub fn is_accepting(&self) -> bool {
        self.read().accepting
    }

    /// Stop accepting members if the room is empty. Returns true if retired.
    pub(crate) fn retire_if_empty(&self) -> bool {
        let mut members = self.write();
        if members.connections.is_empty() {
            members.accepting = false;
            true
        } else {
            false
        }
    }

    /// Stop accepting members and hand back everyone still inside.
    pub(crate) fn retire(&self) -> Vec<Arc<Connection>> {
        let mut members = self.write();
        members.accepting = false;
        members.connections.drain().map(|(_, conn)| conn).collect()
    }
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("id", &self.id)
            .field("members", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::types::{MessageEnvelope, UserIdentity};
    use std::collections::BTreeSet;
    use std::time::Duration;

    fn conn(id: ConnectionId, capacity: usize) -> Arc<Connection> {
        user_conn(id, &format!("u{id}"), capacity)
    }

    fn user_conn(id: ConnectionId, user: &str, capacity: usize) -> Arc<Connection> {
        Arc::new(Connection::new(
            id,
            UserIdentity::new(user, format!("{user} name")),
            RoomId::new("r1"),
            capacity,
            Duration::from_secs(10),
        ))
    }

    fn message(sender: &Connection, text: &str) -> ServerEvent {
        ServerEvent::Message(MessageEnvelope::new(
            sender.identity(),
            sender.room_id().clone(),
            text,
        ))
    }

    fn texts(conn: &Connection) -> Vec<String> {
        conn.queued()
            .iter()
            .filter_map(|event| match event.as_ref() {
                ServerEvent::Message(envelope) => Some(envelope.text.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_membership_matches_admit_remove_sequence() {
        let room = Room::new(RoomId::new("r1"));
        let mut expected = BTreeSet::new();

        // (admit?, id) steps, including duplicate removes and re-admits.
        let steps = [
            (true, 1),
            (true, 2),
            (true, 3),
            (false, 2),
            (false, 2),
            (true, 4),
            (false, 9),
            (true, 2),
            (false, 1),
            (true, 5),
            (false, 4),
        ];
        for (admit, id) in steps {
            if admit {
                room.admit(conn(id, 4)).unwrap();
                expected.insert(id);
            } else {
                room.remove(id);
                expected.remove(&id);
            }
        }

        let actual: BTreeSet<_> = room.connection_ids().into_iter().collect();
        assert_eq!(actual, expected);
        assert_eq!(room.len(), expected.len());
    }

    #[test]
    fn test_broadcast_excludes_sender() {
        let room = Room::new(RoomId::new("r1"));
        let a = conn(1, 8);
        let b = conn(2, 8);
        room.admit(a.clone()).unwrap();
        room.admit(b.clone()).unwrap();

        let report = room.broadcast(message(&a, "hi"), Some(a.id()));

        assert_eq!(report.delivered, 1);
        assert_eq!(texts(&b), vec!["hi".to_string()]);
        assert!(texts(&a).is_empty());
    }

    #[test]
    fn test_broadcast_preserves_sender_order() {
        let room = Room::new(RoomId::new("r1"));
        let sender = conn(1, 64);
        let recipients: Vec<_> = (2..6).map(|id| conn(id, 64)).collect();
        room.admit(sender.clone()).unwrap();
        for r in &recipients {
            room.admit(r.clone()).unwrap();
        }

        let sent: Vec<String> = (0..20).map(|n| format!("m{n}")).collect();
        for text in &sent {
            room.broadcast(message(&sender, text), Some(sender.id()));
        }

        for r in &recipients {
            assert_eq!(texts(r), sent);
        }
    }

    #[test]
    fn test_unresponsive_recipient_does_not_block_others() {
        let room = Room::new(RoomId::new("r1"));
        let sender = conn(1, 4);
        let stuck = conn(2, 4);
        let healthy = conn(3, 1024);
        for c in [&sender, &stuck, &healthy] {
            room.admit(c.clone()).unwrap();
        }

        let n = 500;
        for i in 0..n {
            room.broadcast(message(&sender, &format!("m{i}")), Some(sender.id()));
        }

        assert_eq!(texts(&healthy).len(), n);
        assert_eq!(stuck.queue_len(), 4);
        assert_eq!(stuck.dropped_count(), (n - 4) as u64);
        assert_eq!(
            texts(&stuck),
            vec!["m496", "m497", "m498", "m499"]
        );
    }

    #[test]
    fn test_broadcast_skips_and_prunes_closed_members() {
        let room = Room::new(RoomId::new("r1"));
        let a = conn(1, 8);
        let b = conn(2, 8);
        let c = conn(3, 8);
        for x in [&a, &b, &c] {
            room.admit(x.clone()).unwrap();
        }
        b.close();

        let report = room.broadcast(message(&a, "hello"), Some(a.id()));

        assert_eq!(report.delivered, 1);
        assert_eq!(report.closed, 1);
        assert_eq!(report.attempted(), 2);
        assert!(!room.contains(b.id()));
        assert_eq!(texts(&c), vec!["hello".to_string()]);
    }

    #[test]
    fn test_admit_rejects_closed_connection() {
        let room = Room::new(RoomId::new("r1"));
        let a = conn(1, 8);
        a.close();
        assert_eq!(room.admit(a), Err(HubError::ConnectionClosed(1)));
        assert!(room.is_empty());
    }

    #[test]
    fn test_retired_room_rejects_admit() {
        let room = Room::new(RoomId::new("r1"));
        assert!(room.retire_if_empty());
        assert!(!room.is_accepting());
        assert_eq!(
            room.admit(conn(1, 8)),
            Err(HubError::RoomClosed(RoomId::new("r1")))
        );
    }

    #[test]
    fn test_retire_if_empty_keeps_occupied_room() {
        let room = Room::new(RoomId::new("r1"));
        room.admit(conn(1, 8)).unwrap();
        assert!(!room.retire_if_empty());
        assert!(room.is_accepting());
    }

    #[test]
    fn test_first_and_last_session_of_user() {
        let room = Room::new(RoomId::new("r1"));
        let a1 = user_conn(1, "a", 8);
        let a2 = user_conn(2, "a", 8);

        assert_eq!(room.admit(a1.clone()), Ok(true));
        assert_eq!(room.admit(a2.clone()), Ok(false));
        assert_eq!(room.sessions_of(a1.user_id()), 2);

        assert!(!room.depart(a1.id()).1);
        // Repeated removal must not count the user out twice.
        assert!(!room.depart(a1.id()).1);
        assert!(room.depart(a2.id()).1);
        assert_eq!(room.sessions_of(a2.user_id()), 0);
    }

    #[test]
    fn test_pruned_member_is_still_counted_out_once() {
        let room = Room::new(RoomId::new("r1"));
        let sender = user_conn(1, "b", 8);
        let a = user_conn(2, "a", 8);
        room.admit(sender.clone()).unwrap();
        room.admit(a.clone()).unwrap();

        a.close();
        room.broadcast(message(&sender, "x"), Some(sender.id()));
        assert!(!room.contains(a.id()));

        let (removed, last) = room.depart(a.id());
        assert!(removed.is_none());
        assert!(last);
    }

    #[test]
    fn test_concurrent_sessions_of_one_user_have_one_first_and_one_last() {
        let room = Arc::new(Room::new(RoomId::new("r1")));

        let admits: Vec<_> = (0..16)
            .map(|id| {
                let room = room.clone();
                std::thread::spawn(move || room.admit(user_conn(id, "a", 4)).unwrap())
            })
            .collect();
        let firsts = admits
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|first| *first)
            .count();
        assert_eq!(firsts, 1);

        let departs: Vec<_> = (0..16)
            .map(|id| {
                let room = room.clone();
                std::thread::spawn(move || room.depart(id).1)
            })
            .collect();
        let lasts = departs
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|last| *last)
            .count();
        assert_eq!(lasts, 1);
        assert!(room.is_empty());
    }

    #[test]
    fn test_remove_absent_is_noop() {
        let room = Room::new(RoomId::new("r1"));
        assert!(room.remove(42).is_none());
        assert!(room.is_empty());
    }

    #[test]
    fn test_concurrent_admit_remove_during_broadcast() {
        let room = Arc::new(Room::new(RoomId::new("r1")));
        let sender = conn(0, 8);
        room.admit(sender.clone()).unwrap();

        let churn = {
            let room = room.clone();
            std::thread::spawn(move || {
                for id in 1..500 {
                    room.admit(conn(id, 2)).unwrap();
                    if id % 2 == 0 {
                        room.remove(id - 1);
                    }
                }
            })
        };

        for i in 0..500 {
            room.broadcast(message(&sender, &format!("m{i}")), Some(sender.id()));
        }
        churn.join().unwrap();

        assert!(room.contains(sender.id()));
    }
}
