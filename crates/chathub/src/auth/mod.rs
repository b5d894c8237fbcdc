//! Authentication module.
//!
//! Issues and validates HS256 JWTs and provides the request middleware and
//! extractors that gate the HTTP and WebSocket routes.

mod claims;
mod config;
mod error;
mod middleware;

pub use claims::{Claims, Role};
pub use config::{AuthConfig, ConfigValidationError};
pub use error::AuthError;
pub use middleware::{AuthState, CurrentUser, RequireSuper, auth_middleware, verify_password};
