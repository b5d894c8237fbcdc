//! Room-based real-time chat backend.
//!
//! Users sign up and sign in over HTTP, then join rooms over a WebSocket.
//! The [`ws`] hub fans each message out to the other members of the room
//! and tracks which room every user is in.

pub mod api;
pub mod auth;
pub mod db;
pub mod directory;
pub mod ws;
