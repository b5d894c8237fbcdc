//! User and room directory.
//!
//! Persists users and registered rooms in SQLite and answers the hub's
//! room and display-name lookups.

mod models;
mod rooms;
mod service;
mod users;

pub use models::{
    CreateRoomRequest, Room, SignInRequest, SignUpRequest, User, UserListQuery, UserLookup,
    UserResponse,
};
pub use rooms::RoomRepository;
pub use service::DirectoryService;
pub use users::UserRepository;
