//! API request handlers.

use std::collections::BTreeMap;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use log::info;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::auth::{CurrentUser, RequireSuper};
use crate::directory::{
    CreateRoomRequest, SignInRequest, SignUpRequest, UserListQuery, UserLookup, UserResponse,
};
use crate::ws::{HubStats, RoomId, UserId};

use super::error::{ApiError, ApiResult};
use super::state::AppState;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ============================================================================
// Sign-up / sign-in
// ============================================================================

/// Register a new user.
#[instrument(skip(state, request), fields(login = %request.login))]
pub async fn signup(
    State(state): State<AppState>,
    Json(request): Json<SignUpRequest>,
) -> ApiResult<(StatusCode, Json<UserResponse>)> {
    let user = state.directory.sign_up(request).await?;
    Ok((StatusCode::CREATED, Json(user.into())))
}

/// Exchange credentials for a token.
#[instrument(skip(state, request), fields(login = %request.login))]
pub async fn signin(
    State(state): State<AppState>,
    Json(request): Json<SignInRequest>,
) -> ApiResult<Json<UserResponse>> {
    let response = state.directory.sign_in(request).await?;
    Ok(Json(response))
}

/// Query for `/auth/user`.
#[derive(Debug, Default, Deserialize)]
pub struct UserQuery {
    pub id: Option<String>,
    pub login: Option<String>,
}

impl UserQuery {
    fn lookup(&self) -> ApiResult<UserLookup> {
        if let Some(id) = self.id.as_deref().filter(|id| !id.is_empty()) {
            let id = id
                .parse::<i64>()
                .map_err(|_| ApiError::bad_request(format!("Invalid user id: {}", id)))?;
            return Ok(UserLookup::Id(id));
        }
        match self.login.as_deref().filter(|login| !login.is_empty()) {
            Some(login) => Ok(UserLookup::Login(login.to_string())),
            None => Err(ApiError::bad_request("Either id or login is required")),
        }
    }
}

/// Look up a user by id or login.
#[instrument(skip(state, _user))]
pub async fn get_user(
    State(state): State<AppState>,
    _user: CurrentUser,
    Query(query): Query<UserQuery>,
) -> ApiResult<Json<UserResponse>> {
    let lookup = query.lookup()?;
    state
        .directory
        .find_user(&lookup)
        .await?
        .map(|u| Json(u.into()))
        .ok_or_else(|| ApiError::not_found("User not found"))
}

// ============================================================================
// Rooms
// ============================================================================

/// Room as listed by `/auth/ws/getRooms`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoomSummary {
    pub id: String,
    pub name: String,
    /// Users currently present.
    pub members: usize,
}

/// Room member as listed by `/auth/ws/getClients`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientResponse {
    pub id: String,
    pub username: String,
}

/// Register a room and open it in the hub.
#[instrument(skip(state, user, request), fields(room_id = %request.id))]
pub async fn create_room(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(request): Json<CreateRoomRequest>,
) -> ApiResult<(StatusCode, Json<CreateRoomRequest>)> {
    let room = state.directory.create_room(&request, user.id()).await?;
    state
        .hub
        .registry()
        .get_or_create(&RoomId::new(room.id.clone()))?;

    info!("User {} created room {}", user.id(), room.id);
    Ok((
        StatusCode::CREATED,
        Json(CreateRoomRequest {
            id: room.id,
            name: room.name,
        }),
    ))
}

/// Registered rooms plus rooms that only exist in the hub.
#[instrument(skip(state, _user))]
pub async fn get_rooms(
    State(state): State<AppState>,
    _user: CurrentUser,
) -> ApiResult<Json<Vec<RoomSummary>>> {
    let presence = state.hub.presence();
    let members_of = |id: &str| presence.list_by_room(&RoomId::new(id)).len();

    let mut rooms: BTreeMap<String, RoomSummary> = state
        .directory
        .list_rooms()
        .await?
        .into_iter()
        .map(|room| {
            let summary = RoomSummary {
                members: members_of(&room.id),
                id: room.id.clone(),
                name: room.name,
            };
            (room.id, summary)
        })
        .collect();

    for room_id in state.hub.registry().room_ids() {
        rooms
            .entry(room_id.to_string())
            .or_insert_with(|| RoomSummary {
                id: room_id.to_string(),
                name: room_id.to_string(),
                members: members_of(room_id.as_str()),
            });
    }

    Ok(Json(rooms.into_values().collect()))
}

/// Users currently in a room.
#[instrument(skip(state, _user))]
pub async fn get_clients(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(room_id): Path<String>,
) -> ApiResult<Json<Vec<ClientResponse>>> {
    let members = state.hub.list_members(&RoomId::new(room_id)).await?;
    let clients = members
        .into_iter()
        .map(|m| ClientResponse {
            id: m.user_id.to_string(),
            username: m.display_name,
        })
        .collect();
    Ok(Json(clients))
}

// ============================================================================
// Admin
// ============================================================================

/// List users (super only).
#[instrument(skip(state, _user))]
pub async fn list_users(
    State(state): State<AppState>,
    RequireSuper(_user): RequireSuper,
    Query(query): Query<UserListQuery>,
) -> ApiResult<Json<Vec<UserResponse>>> {
    let users = state.directory.list_users(&query).await?;
    let users: Vec<UserResponse> = users.into_iter().map(Into::into).collect();
    info!("Listed {} user(s)", users.len());
    Ok(Json(users))
}

/// Hub counters (super only).
pub async fn hub_stats(
    State(state): State<AppState>,
    RequireSuper(_user): RequireSuper,
) -> Json<HubStats> {
    Json(state.hub.stats())
}

/// Response for `/admin/hub/reap`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ReapResponse {
    pub removed: Vec<RoomId>,
}

/// Drop every empty room now (super only).
pub async fn reap_rooms(
    State(state): State<AppState>,
    RequireSuper(user): RequireSuper,
) -> Json<ReapResponse> {
    let removed = state.hub.reap_empty_rooms();
    info!("User {} reaped {} room(s)", user.id(), removed.len());
    Json(ReapResponse { removed })
}

/// Response for administrative disconnects.
#[derive(Debug, Serialize, Deserialize)]
pub struct DisconnectResponse {
    pub closed: usize,
}

/// Close every connection of a user (super only).
pub async fn disconnect_user(
    State(state): State<AppState>,
    RequireSuper(user): RequireSuper,
    Path(user_id): Path<String>,
) -> Json<DisconnectResponse> {
    let closed = state.hub.disconnect_user(&UserId::new(user_id.clone()));
    info!(
        "User {} disconnected {} ({} connection(s))",
        user.id(),
        user_id,
        closed
    );
    Json(DisconnectResponse { closed })
}

/// Evict all members of a room and drop it (super only).
pub async fn close_room(
    State(state): State<AppState>,
    RequireSuper(_user): RequireSuper,
    Path(room_id): Path<String>,
) -> ApiResult<Json<DisconnectResponse>> {
    let closed = state.hub.close_room(&RoomId::new(room_id))?;
    Ok(Json(DisconnectResponse { closed }))
}
