//! Hub errors.

use thiserror::Error;

use super::types::{ConnectionId, RoomId};

/// Errors surfaced by the room hub.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HubError {
    /// The room is unknown and rooms are not created on demand.
    #[error("room not found: {0}")]
    RoomNotFound(RoomId),

    /// The connection was already closed.
    #[error("connection {0} is closed")]
    ConnectionClosed(ConnectionId),

    /// The room was retired by the reaper or closed by an administrator.
    #[error("room {0} is no longer accepting members")]
    RoomClosed(RoomId),

    /// Creating another room would exceed the configured limit.
    #[error("room limit reached ({0} rooms)")]
    RoomCapacity(usize),

    /// The directory collaborator could not answer a lookup.
    #[error("directory lookup failed: {0}")]
    Directory(String),
}
