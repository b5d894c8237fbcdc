//! Identifiers, wire frames and hub events.
//!
//! These types define the protocol between chat clients and the hub over
//! WebSocket, plus the internal events the hub publishes to observers.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier of a single socket within one hub instance.
pub type ConnectionId = u64;

/// Opaque room identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for RoomId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Opaque user identifier, taken from the `sub` claim of a verified token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for UserId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Verified identity of the user behind a connection.
///
/// Immutable for the lifetime of the connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub user_id: UserId,
    pub display_name: String,
}

impl UserIdentity {
    pub fn new(user_id: impl Into<UserId>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
        }
    }
}

/// A chat message as fanned out to room members.
///
/// Built by the hub when a frame is read from a connection and dropped once
/// the broadcast attempt completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub sender_id: UserId,
    pub sender_name: String,
    pub room_id: RoomId,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl MessageEnvelope {
    pub fn new(sender: &UserIdentity, room_id: RoomId, text: impl Into<String>) -> Self {
        Self {
            sender_id: sender.user_id.clone(),
            sender_name: sender.display_name.clone(),
            room_id,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}

// ============================================================================
// Events (Server -> Client)
// ============================================================================

/// Frames sent from the hub to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Sent once, right after the connection was admitted to its room.
    Connected {
        connection_id: ConnectionId,
        room_id: RoomId,
    },

    /// A message from another member of the room.
    Message(MessageEnvelope),

    /// Another user joined the room.
    MemberJoined {
        user_id: UserId,
        display_name: String,
    },

    /// Another user left the room.
    MemberLeft {
        user_id: UserId,
        display_name: String,
    },

    /// Keepalive written by the hub.
    Ping,

    /// Reply to a client `ping` command.
    Pong,

    /// Error message.
    Error { message: String },
}

// ============================================================================
// Commands (Client -> Server)
// ============================================================================

/// Frames sent from a client to the hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    /// Post a message to the room.
    Message { text: String },
    /// Leave the room and close the connection.
    Leave,
    /// Application-level ping; answered with `pong`.
    Ping,
}

impl ClientCommand {
    /// Interpret one inbound text frame.
    ///
    /// Frames that look like JSON objects must be a valid command; anything
    /// else is taken verbatim as message text. Returns `None` for malformed
    /// command objects.
    pub fn parse(frame: &str) -> Option<Self> {
        if frame.trim_start().starts_with('{') {
            serde_json::from_str(frame).ok()
        } else {
            Some(Self::Message {
                text: frame.to_string(),
            })
        }
    }
}

// ============================================================================
// Hub lifecycle
// ============================================================================

/// Lifecycle of a single connection inside the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Joined = 1,
    Leaving = 2,
    Closed = 3,
}

impl ConnectionState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Joined,
            2 => Self::Leaving,
            _ => Self::Closed,
        }
    }
}

/// Why a connection left its room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaveReason {
    /// The peer closed the socket.
    PeerClosed,
    /// Reading from or writing to the socket failed.
    TransportError,
    /// The client sent a `leave` command.
    ClientLeft,
    /// No inbound frame within the idle timeout.
    IdleTimeout,
    /// An administrator disconnected the user.
    ForcedDisconnect,
    /// The room was closed while the connection was a member.
    RoomClosed,
    /// The server is shutting down.
    Shutdown,
}

impl fmt::Display for LeaveReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::PeerClosed => "peer closed",
            Self::TransportError => "transport error",
            Self::ClientLeft => "client left",
            Self::IdleTimeout => "idle timeout",
            Self::ForcedDisconnect => "forced disconnect",
            Self::RoomClosed => "room closed",
            Self::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// Events published by the hub to in-process observers (e.g. a message log).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubEvent {
    MemberJoined {
        room_id: RoomId,
        identity: UserIdentity,
        connection_id: ConnectionId,
    },
    MemberLeft {
        room_id: RoomId,
        identity: UserIdentity,
        connection_id: ConnectionId,
        reason: LeaveReason,
    },
    Message(MessageEnvelope),
}

/// A user currently present in a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Member {
    pub user_id: UserId,
    pub display_name: String,
}

/// Outcome of a finished `join` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub connection_id: ConnectionId,
    pub room_id: RoomId,
    pub reason: LeaveReason,
    pub messages_received: u64,
}

/// Point-in-time counters for the whole hub.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    pub rooms: usize,
    pub connections: usize,
    pub online_users: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_json_message_command() {
        let cmd = ClientCommand::parse(r#"{"type":"message","text":"hello"}"#);
        assert_eq!(
            cmd,
            Some(ClientCommand::Message {
                text: "hello".to_string()
            })
        );
    }

    #[test]
    fn test_parse_plain_text_is_message() {
        let cmd = ClientCommand::parse("just some words");
        assert_eq!(
            cmd,
            Some(ClientCommand::Message {
                text: "just some words".to_string()
            })
        );
    }

    #[test]
    fn test_parse_leave_and_ping() {
        assert_eq!(
            ClientCommand::parse(r#"{"type":"leave"}"#),
            Some(ClientCommand::Leave)
        );
        assert_eq!(
            ClientCommand::parse(r#" {"type":"ping"}"#),
            Some(ClientCommand::Ping)
        );
    }

    #[test]
    fn test_parse_malformed_command() {
        assert_eq!(ClientCommand::parse(r#"{"type":"teleport"}"#), None);
        assert_eq!(ClientCommand::parse("{not json"), None);
    }

    #[test]
    fn test_server_event_tagging() {
        let identity = UserIdentity::new("7", "alice@example.com");
        let envelope = MessageEnvelope::new(&identity, RoomId::new("r1"), "hi");
        let json = serde_json::to_value(ServerEvent::Message(envelope)).unwrap();

        assert_eq!(json["type"], "message");
        assert_eq!(json["sender_id"], "7");
        assert_eq!(json["room_id"], "r1");
        assert_eq!(json["text"], "hi");

        let ping = serde_json::to_value(ServerEvent::Ping).unwrap();
        assert_eq!(ping["type"], "ping");
    }

    #[test]
    fn test_connection_state_from_u8() {
        assert_eq!(ConnectionState::from_u8(0), ConnectionState::Connecting);
        assert_eq!(ConnectionState::from_u8(1), ConnectionState::Joined);
        assert_eq!(ConnectionState::from_u8(2), ConnectionState::Leaving);
        assert_eq!(ConnectionState::from_u8(3), ConnectionState::Closed);
    }
}
