//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use serde_json::Value;
use tokio::task::JoinHandle;
use tower::ServiceExt;

use chathub::api::{AppState, create_router};
use chathub::auth::{AuthConfig, AuthState, Role};
use chathub::db::Database;
use chathub::directory::{DirectoryService, SignInRequest, SignUpRequest};
use chathub::ws::transport::memory::{self, MemoryPeer};
use chathub::ws::transport::{BoxFrameReader, BoxFrameWriter};
use chathub::ws::{
    ChatHub, ConnectionId, HubConfig, HubError, RoomId, ServerEvent, SessionSummary, UserIdentity,
};

pub const TEST_SECRET: &str = "integration-test-secret-at-least-32-characters";
pub const TEST_PASSWORD: &str = "secret123";

/// How long a test waits for any single frame or task.
pub const STEP_TIMEOUT: Duration = Duration::from_secs(5);

pub fn test_auth_state() -> AuthState {
    AuthState::new(AuthConfig {
        jwt_secret: Some(TEST_SECRET.to_string()),
        bcrypt_cost: 4,
        ..Default::default()
    })
}

/// Hub config without background timers, so tests only see the frames
/// they cause.
pub fn quiet_hub_config() -> HubConfig {
    HubConfig {
        idle_timeout_secs: 0,
        ping_interval_secs: 0,
        reap_interval_secs: 0,
        announce_membership: false,
        ..Default::default()
    }
}

pub fn test_hub(config: HubConfig) -> Arc<ChatHub> {
    Arc::new(ChatHub::new(config))
}

pub async fn test_state(config: HubConfig) -> AppState {
    let db = Database::in_memory().await.unwrap();
    let auth = test_auth_state();
    let directory = DirectoryService::new(&db, auth.clone());
    AppState::new(config, directory, auth)
}

pub async fn test_app(config: HubConfig) -> (Router, AppState) {
    let state = test_state(config).await;
    (create_router(state.clone()), state)
}

/// Sign a user up and in. Returns the user id and a bearer token.
pub async fn register(state: &AppState, login: &str, role: Role) -> (i64, String) {
    state
        .directory
        .sign_up(SignUpRequest {
            login: login.to_string(),
            password: TEST_PASSWORD.to_string(),
            role: Some(role),
        })
        .await
        .unwrap();
    let response = state
        .directory
        .sign_in(SignInRequest {
            login: login.to_string(),
            password: TEST_PASSWORD.to_string(),
        })
        .await
        .unwrap();
    (response.id, response.token.unwrap())
}

/// Send one request through the router. Non-JSON bodies come back as `Null`.
pub async fn send(
    app: &Router,
    method: &str,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    let request = match body {
        Some(json) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json)
}

/// A client joined to a hub over the in-memory transport.
pub struct TestClient {
    pub peer: MemoryPeer,
    pub connection_id: ConnectionId,
    pub session: JoinHandle<Result<SessionSummary, HubError>>,
}

impl TestClient {
    /// Next non-ping event, failing the test if none arrives in time.
    pub async fn recv(&mut self) -> ServerEvent {
        tokio::time::timeout(STEP_TIMEOUT, self.peer.recv_non_ping())
            .await
            .expect("timed out waiting for an event")
            .expect("transport closed while waiting for an event")
    }

    /// Wait for the hub to finish the session. The peer stays open meanwhile.
    pub async fn finished(&mut self) -> SessionSummary {
        tokio::time::timeout(STEP_TIMEOUT, &mut self.session)
            .await
            .expect("timed out waiting for the session to end")
            .unwrap()
            .unwrap()
    }
}

/// Join `user` to `room` and wait until the hub confirms admission.
pub async fn connect(hub: &Arc<ChatHub>, user: &str, room: &str) -> TestClient {
    connect_with(hub, user, room, memory::pair()).await
}

pub async fn connect_with(
    hub: &Arc<ChatHub>,
    user: &str,
    room: &str,
    (mut peer, reader, writer): (MemoryPeer, BoxFrameReader, BoxFrameWriter),
) -> TestClient {
    let identity = UserIdentity::new(user, format!("{user} name"));
    let room_id = RoomId::new(room);
    let hub = hub.clone();
    let session = tokio::spawn(async move { hub.join(identity, room_id, reader, writer).await });

    let first = tokio::time::timeout(STEP_TIMEOUT, peer.recv_non_ping())
        .await
        .expect("timed out waiting for connected")
        .expect("transport closed before connected");
    let ServerEvent::Connected { connection_id, .. } = first else {
        panic!("expected connected, got {first:?}");
    };

    TestClient {
        peer,
        connection_id,
        session,
    }
}
