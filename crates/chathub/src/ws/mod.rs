//! Room connection hub.
//!
//! Clients join a room over a WebSocket; every message they send is fanned
//! out to the other members of that room, and presence tracks which room each
//! user is in.

mod config;
mod connection;
mod error;
mod handler;
mod hub;
mod presence;
mod registry;
mod room;
pub mod transport;
mod types;

pub use config::HubConfig;
pub use connection::{Connection, InboundFrames, SendOutcome, run_writer};
pub use error::HubError;
pub use handler::{join_room, split_socket};
pub use hub::{ChatHub, DirectoryLookup};
pub use presence::{PresenceRecord, PresenceStore};
pub use registry::RoomRegistry;
pub use room::{BroadcastReport, Room};
pub use types::{
    ClientCommand, ConnectionId, ConnectionState, HubEvent, HubStats, LeaveReason, Member,
    MessageEnvelope, RoomId, ServerEvent, SessionSummary, UserId, UserIdentity,
};
