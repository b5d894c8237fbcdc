//! Room connection hub.
//!
//! The hub binds upgraded connections to rooms, keeps presence in step with
//! membership and fans every inbound message out to the rest of the room.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, info, warn};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::config::HubConfig;
use super::connection::{Connection, InboundFrames, run_writer};
use super::error::HubError;
use super::presence::{PresenceRecord, PresenceStore};
use super::registry::RoomRegistry;
use super::room::Room;
use super::transport::{BoxFrameReader, BoxFrameWriter};
use super::types::{
    ClientCommand, ConnectionId, ConnectionState, HubEvent, HubStats, LeaveReason, Member,
    MessageEnvelope, RoomId, ServerEvent, SessionSummary, UserId, UserIdentity,
};

/// Attempts to land in a live room when the resolved one was reaped meanwhile.
const MAX_ADMIT_ATTEMPTS: usize = 3;

/// Lookups the hub delegates to the room/user directory.
#[async_trait]
pub trait DirectoryLookup: Send + Sync {
    /// Whether a room is registered, even if nobody has joined it yet.
    async fn room_exists(&self, room_id: &RoomId) -> anyhow::Result<bool>;

    /// Current display name of a user, if the directory knows them.
    async fn display_name(&self, user_id: &UserId) -> anyhow::Result<Option<String>>;
}

/// The room connection hub.
pub struct ChatHub {
    config: HubConfig,
    registry: Arc<RoomRegistry>,
    presence: Arc<PresenceStore>,
    directory: Option<Arc<dyn DirectoryLookup>>,
    /// Every joined connection, across all rooms.
    connections: DashMap<ConnectionId, Arc<Connection>>,
    next_connection_id: AtomicU64,
    event_tx: broadcast::Sender<HubEvent>,
}

impl ChatHub {
    /// Create a hub with a fresh registry and presence store.
    pub fn new(config: HubConfig) -> Self {
        let registry = Arc::new(RoomRegistry::with_limit(config.max_rooms));
        Self::with_state(config, registry, Arc::new(PresenceStore::new()))
    }

    /// Create a hub over an existing registry and presence store.
    pub fn with_state(
        config: HubConfig,
        registry: Arc<RoomRegistry>,
        presence: Arc<PresenceStore>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(config.event_buffer.max(1));
        Self {
            config,
            registry,
            presence,
            directory: None,
            connections: DashMap::new(),
            next_connection_id: AtomicU64::new(1),
            event_tx,
        }
    }

    /// Attach the directory used for room lookups and display names.
    pub fn with_directory(mut self, directory: Arc<dyn DirectoryLookup>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    pub fn presence(&self) -> &Arc<PresenceStore> {
        &self.presence
    }

    /// A joined connection by id.
    pub fn connection(&self, connection_id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections
            .get(&connection_id)
            .map(|conn| conn.clone())
    }

    /// Subscribe to membership and message events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<HubEvent> {
        self.event_tx.subscribe()
    }

    // ========================================================================
    // Rooms
    // ========================================================================

    /// Resolve the room a join targets, creating it when allowed.
    ///
    /// Live rooms always resolve. Otherwise the room is created on the spot
    /// if auto-create is on, or if the directory knows it.
    pub async fn resolve_room(&self, room_id: &RoomId) -> Result<Arc<Room>, HubError> {
        if let Ok(room) = self.registry.get(room_id) {
            return Ok(room);
        }
        if self.config.auto_create_rooms || self.directory_has_room(room_id).await? {
            return self.registry.get_or_create(room_id);
        }
        Err(HubError::RoomNotFound(room_id.clone()))
    }

    /// Whether a room is live or registered in the directory.
    pub async fn room_exists(&self, room_id: &RoomId) -> Result<bool, HubError> {
        if self.registry.contains(room_id) {
            return Ok(true);
        }
        self.directory_has_room(room_id).await
    }

    async fn directory_has_room(&self, room_id: &RoomId) -> Result<bool, HubError> {
        match &self.directory {
            Some(directory) => directory
                .room_exists(room_id)
                .await
                .map_err(|e| HubError::Directory(e.to_string())),
            None => Ok(false),
        }
    }

    /// Users present in a room, with their current display names.
    pub async fn list_members(&self, room_id: &RoomId) -> Result<Vec<Member>, HubError> {
        if !self.room_exists(room_id).await? {
            return Err(HubError::RoomNotFound(room_id.clone()));
        }

        let records = self.presence.records_in_room(room_id);
        let mut members = Vec::with_capacity(records.len());
        for record in records {
            let display_name = self.display_name_for(&record).await;
            members.push(Member {
                user_id: record.user_id,
                display_name,
            });
        }
        Ok(members)
    }

    async fn display_name_for(&self, record: &PresenceRecord) -> String {
        let Some(directory) = &self.directory else {
            return record.display_name.clone();
        };
        match directory.display_name(&record.user_id).await {
            Ok(Some(name)) => name,
            Ok(None) => record.display_name.clone(),
            Err(e) => {
                warn!("Display name lookup for {} failed: {}", record.user_id, e);
                record.display_name.clone()
            }
        }
    }

    /// Evict every member of a room and drop the room.
    ///
    /// Returns how many connections were closed.
    pub fn close_room(&self, room_id: &RoomId) -> Result<usize, HubError> {
        let room = self
            .registry
            .remove(room_id)
            .ok_or_else(|| HubError::RoomNotFound(room_id.clone()))?;

        let members = room.retire();
        for conn in &members {
            conn.close_with(LeaveReason::RoomClosed);
        }
        info!("Closed room {} ({} member(s) evicted)", room_id, members.len());
        Ok(members.len())
    }

    /// Remove all empty rooms.
    pub fn reap_empty_rooms(&self) -> Vec<RoomId> {
        self.registry.reap()
    }

    /// Run the reaper on the configured interval until `shutdown` fires.
    ///
    /// Returns `None` when periodic reaping is disabled.
    pub fn spawn_reaper(self: &Arc<Self>, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        let period = self.config.reap_interval()?;
        let hub = Arc::clone(self);

        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Room reaper stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        hub.reap_empty_rooms();
                    }
                }
            }
        }))
    }

    // ========================================================================
    // Connections
    // ========================================================================

    /// Run a connection from admission to close.
    ///
    /// Binds the connection to `room_id`, marks the user online and pumps
    /// inbound frames into room broadcasts until the peer goes away, the
    /// client leaves, the idle timeout fires or the connection is closed
    /// administratively. Returns once the connection has fully left.
    ///
    /// On rejection the client gets an `error` frame and the transport is
    /// released; nothing else is touched.
    pub async fn join(
        &self,
        identity: UserIdentity,
        room_id: RoomId,
        reader: BoxFrameReader,
        mut writer: BoxFrameWriter,
    ) -> Result<SessionSummary, HubError> {
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let conn = Arc::new(Connection::new(
            connection_id,
            identity,
            room_id.clone(),
            self.config.outbound_capacity,
            self.config.slow_consumer_window(),
        ));

        // Queued before admission so it is always the first frame written.
        conn.send(Arc::new(ServerEvent::Connected {
            connection_id,
            room_id: room_id.clone(),
        }))?;

        let (room, first_session) = match self.admit(&conn).await {
            Ok(admitted) => admitted,
            Err(e) => {
                warn!(
                    "Rejected join of user {} to room {}: {}",
                    conn.user_id(),
                    room_id,
                    e
                );
                conn.close_with(LeaveReason::RoomClosed);
                conn.set_state(ConnectionState::Closed);
                reject(&mut writer, &e).await;
                return Err(e);
            }
        };

        self.connections.insert(connection_id, conn.clone());
        conn.set_state(ConnectionState::Joined);
        conn.touch();
        info!(
            "User {} joined room {} (connection {})",
            conn.user_id(),
            room_id,
            connection_id
        );

        if self.config.announce_membership && first_session {
            room.broadcast(
                ServerEvent::MemberJoined {
                    user_id: conn.user_id().clone(),
                    display_name: conn.identity().display_name.clone(),
                },
                Some(connection_id),
            );
        }
        let _ = self.event_tx.send(HubEvent::MemberJoined {
            room_id: room_id.clone(),
            identity: conn.identity().clone(),
            connection_id,
        });

        let writer_task = tokio::spawn(run_writer(
            conn.clone(),
            writer,
            self.config.ping_interval(),
        ));

        let (reason, messages_received) = self.read_pump(&conn, &room, reader).await;
        self.leave(&conn, &room, reason);

        if let Err(e) = writer_task.await {
            warn!("Writer task for connection {} failed: {}", connection_id, e);
        }

        Ok(SessionSummary {
            connection_id,
            room_id,
            reason,
            messages_received,
        })
    }

    /// Resolve the room, mark the user online and admit the connection.
    /// Presence is rolled back if admission fails. The flag is set when this
    /// is the user's first connection in the room.
    async fn admit(&self, conn: &Arc<Connection>) -> Result<(Arc<Room>, bool), HubError> {
        let mut attempt = 1;
        loop {
            let room = self.resolve_room(conn.room_id()).await?;
            let previous = self
                .presence
                .set_online(conn.identity(), conn.room_id(), conn.id());

            match room.admit(conn.clone()) {
                Ok(first_session) => return Ok((room, first_session)),
                Err(e) => {
                    self.presence.restore(conn.user_id(), conn.id(), previous);
                    let retry =
                        matches!(e, HubError::RoomClosed(_)) && attempt < MAX_ADMIT_ATTEMPTS;
                    if !retry {
                        return Err(e);
                    }
                    debug!(
                        "Room {} was retired during join of connection {}; retrying",
                        conn.room_id(),
                        conn.id()
                    );
                    attempt += 1;
                }
            }
        }
    }

    /// Read frames until the connection ends. Returns why it ended and how
    /// many messages were received.
    async fn read_pump(
        &self,
        conn: &Arc<Connection>,
        room: &Room,
        reader: BoxFrameReader,
    ) -> (LeaveReason, u64) {
        let mut inbound = InboundFrames::new(conn.clone(), reader);
        let idle_timeout = self.config.idle_timeout();
        let mut received = 0u64;

        loop {
            let frame = match idle_timeout {
                Some(limit) => match tokio::time::timeout(limit, inbound.next()).await {
                    Ok(frame) => frame,
                    Err(_) => {
                        info!(
                            "Connection {} idle for {:?}, closing",
                            conn.id(),
                            limit
                        );
                        return (LeaveReason::IdleTimeout, received);
                    }
                },
                None => inbound.next().await,
            };

            let Some(frame) = frame else {
                let reason = inbound.end_reason().unwrap_or(LeaveReason::PeerClosed);
                return (reason, received);
            };
            conn.touch();

            match ClientCommand::parse(&frame) {
                Some(ClientCommand::Message { text }) => {
                    received += 1;
                    let envelope = MessageEnvelope::new(conn.identity(), room.id().clone(), text);
                    let _ = self.event_tx.send(HubEvent::Message(envelope.clone()));
                    let report = room.broadcast(ServerEvent::Message(envelope), Some(conn.id()));
                    if report.closed > 0 {
                        debug!(
                            "Broadcast in room {} skipped {} closed member(s)",
                            room.id(),
                            report.closed
                        );
                    }
                }
                Some(ClientCommand::Leave) => return (LeaveReason::ClientLeft, received),
                Some(ClientCommand::Ping) => {
                    let _ = conn.send(Arc::new(ServerEvent::Pong));
                }
                None => {
                    debug!("Malformed command on connection {}", conn.id());
                    let _ = conn.send(Arc::new(ServerEvent::Error {
                        message: "malformed command".to_string(),
                    }));
                }
            }
        }
    }

    /// Undo everything `join` registered. Each step is best-effort and the
    /// connection always ends up closed.
    fn leave(&self, conn: &Arc<Connection>, room: &Room, reason: LeaveReason) {
        conn.set_state(ConnectionState::Leaving);

        let (_, last_session) = room.depart(conn.id());
        self.connections.remove(&conn.id());

        if self.presence.release(conn.user_id(), conn.id()) {
            self.repoint_presence(conn.user_id());
        }

        conn.close_with(reason);
        conn.set_state(ConnectionState::Closed);

        if self.config.announce_membership && last_session {
            room.broadcast(
                ServerEvent::MemberLeft {
                    user_id: conn.user_id().clone(),
                    display_name: conn.identity().display_name.clone(),
                },
                None,
            );
        }
        let _ = self.event_tx.send(HubEvent::MemberLeft {
            room_id: room.id().clone(),
            identity: conn.identity().clone(),
            connection_id: conn.id(),
            reason,
        });

        info!(
            "User {} left room {} (connection {}, {})",
            conn.user_id(),
            room.id(),
            conn.id(),
            reason
        );
    }

    /// Hand the user's presence to another of their open connections.
    ///
    /// A connection leaves `connections` before it releases presence, so a
    /// candidate that disappears after being written is released here and
    /// the next one is tried.
    fn repoint_presence(&self, user_id: &UserId) {
        loop {
            let Some(other) = self
                .connections
                .iter()
                .find(|entry| entry.user_id() == user_id && !entry.is_closed())
                .map(|entry| entry.value().clone())
            else {
                return;
            };

            self.presence
                .set_online(other.identity(), other.room_id(), other.id());
            if self.connections.contains_key(&other.id()) {
                return;
            }
            if !self.presence.release(user_id, other.id()) {
                return;
            }
        }
    }

    /// Force one connection to leave. Returns false if it is not joined.
    pub fn disconnect_connection(&self, connection_id: ConnectionId) -> bool {
        match self.connection(connection_id) {
            Some(conn) => {
                info!("Disconnecting connection {}", connection_id);
                conn.close_with(LeaveReason::ForcedDisconnect)
            }
            None => false,
        }
    }

    /// Force every connection of a user to leave. Returns how many were closed.
    pub fn disconnect_user(&self, user_id: &UserId) -> usize {
        let targets = self.connections_of(user_id);
        let closed = targets
            .iter()
            .filter(|conn| conn.close_with(LeaveReason::ForcedDisconnect))
            .count();
        if closed > 0 {
            info!("Disconnected user {} ({} connection(s))", user_id, closed);
        }
        closed
    }

    /// Open connections of a user, across rooms.
    pub fn connections_of(&self, user_id: &UserId) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .filter(|entry| entry.user_id() == user_id)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Close every connection. Their `join` calls return shortly after.
    pub fn shutdown(&self) {
        let conns: Vec<_> = self
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for conn in &conns {
            conn.close_with(LeaveReason::Shutdown);
        }
        if !conns.is_empty() {
            info!("Closed {} connection(s) for shutdown", conns.len());
        }
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            rooms: self.registry.len(),
            connections: self.connections.len(),
            online_users: self.presence.online_count(),
        }
    }
}

async fn reject(writer: &mut BoxFrameWriter, error: &HubError) {
    let event = ServerEvent::Error {
        message: error.to_string(),
    };
    if let Ok(json) = serde_json::to_string(&event) {
        let _ = writer.write_frame(json).await;
    }
    let _ = writer.close().await;
}
