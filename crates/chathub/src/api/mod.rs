//! HTTP API module.
//!
//! Sign-up/sign-in, the room directory and the WebSocket entry point into
//! the hub, plus super-user controls.

mod error;
mod handlers;
mod routes;
mod state;

#[allow(unused_imports)]
pub use error::{ApiError, ApiResult, ErrorResponse};
pub use handlers::{ClientResponse, DisconnectResponse, HealthResponse, ReapResponse, RoomSummary};
pub use routes::create_router;
pub use state::AppState;
