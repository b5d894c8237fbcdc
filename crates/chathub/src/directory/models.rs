//! Directory data models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::auth::Role;

/// User entity from database.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: i64,
    pub login: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    #[sqlx(try_from = "String")]
    pub role: Role,
    pub created_at: String,
}

/// Room entity from database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Room {
    pub id: String,
    pub name: String,
    pub created_by: Option<String>,
    pub created_at: String,
}

/// Request body for `/signup`.
#[derive(Debug, Clone, Deserialize)]
pub struct SignUpRequest {
    pub login: String,
    pub password: String,
    #[serde(default)]
    pub role: Option<Role>,
}

/// Request body for `/signin`.
#[derive(Debug, Clone, Deserialize)]
pub struct SignInRequest {
    pub login: String,
    pub password: String,
}

/// User as returned by the API. Carries a token only after sign-in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserResponse {
    pub id: i64,
    pub login: String,
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl From<User> for UserResponse {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            login: user.login,
            role: user.role,
            token: None,
        }
    }
}

/// Request body for `/auth/ws/createRoom`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRoomRequest {
    pub id: String,
    pub name: String,
}

/// How to find a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserLookup {
    Id(i64),
    Login(String),
}

/// Query parameters for `/admin/users`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserListQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}
