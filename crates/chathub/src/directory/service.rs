//! Directory service: sign-up, sign-in and the room directory.

use std::sync::LazyLock;

use anyhow::{Result, bail};
use async_trait::async_trait;
use regex::Regex;
use tracing::{info, instrument, warn};

use super::models::{
    CreateRoomRequest, Room, SignInRequest, SignUpRequest, User, UserListQuery, UserLookup,
    UserResponse,
};
use super::rooms::RoomRepository;
use super::users::UserRepository;
use crate::auth::{AuthState, Role, verify_password};
use crate::db::Database;
use crate::ws::{DirectoryLookup, RoomId, UserId};

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("email pattern compiles")
});

const MIN_PASSWORD_LEN: usize = 6;
const MAX_PASSWORD_LEN: usize = 32;
const DEFAULT_PAGE_SIZE: i64 = 10;
const MAX_PAGE_SIZE: i64 = 100;
const MAX_ROOM_ID_LEN: usize = 64;

/// Users and rooms known to the system.
#[derive(Clone)]
pub struct DirectoryService {
    users: UserRepository,
    rooms: RoomRepository,
    auth: AuthState,
}

impl DirectoryService {
    pub fn new(db: &Database, auth: AuthState) -> Self {
        Self {
            users: UserRepository::new(db.pool().clone()),
            rooms: RoomRepository::new(db.pool().clone()),
            auth,
        }
    }

    /// Register a new user.
    ///
    /// The super role can only be requested while no super user exists.
    #[instrument(skip(self, request), fields(login = %request.login))]
    pub async fn sign_up(&self, request: SignUpRequest) -> Result<User> {
        let login = request.login.trim();
        if !is_valid_email(login) {
            bail!("Invalid login: must be an email address.");
        }
        validate_password(&request.password)?;

        if !self.users.is_login_available(login).await? {
            bail!("Login '{}' is already registered.", login);
        }

        let role = request.role.unwrap_or_default();
        if role == Role::Super && self.has_super_user().await? {
            bail!("Signing up with the super role is forbidden once a super user exists.");
        }

        let password_hash = self.auth.hash_password(&request.password)?;
        let user = self.users.create(login, &password_hash, role).await?;
        info!(user_id = user.id, login = %user.login, role = %user.role, "Created new user");

        Ok(user)
    }

    async fn has_super_user(&self) -> Result<bool> {
        Ok(self.users.count_by_role(Role::Super).await? > 0)
    }

    /// Check credentials and issue a token.
    #[instrument(skip(self, request), fields(login = %request.login))]
    pub async fn sign_in(&self, request: SignInRequest) -> Result<UserResponse> {
        let user = match self.users.get_by_login(request.login.trim()).await? {
            Some(user) if verify_password(&request.password, &user.password_hash) => user,
            _ => {
                warn!("Failed sign-in attempt");
                bail!("Authentication failed: wrong login or password.");
            }
        };

        let token = self
            .auth
            .generate_token(&user.id.to_string(), &user.login, None, user.role)?;
        info!(user_id = user.id, "User signed in");

        let mut response = UserResponse::from(user);
        response.token = Some(token);
        Ok(response)
    }

    /// Find a user by id or login.
    #[instrument(skip(self))]
    pub async fn find_user(&self, lookup: &UserLookup) -> Result<Option<User>> {
        match lookup {
            UserLookup::Id(id) => self.users.get(*id).await,
            UserLookup::Login(login) => self.users.get_by_login(login).await,
        }
    }

    /// One page of users.
    #[instrument(skip(self))]
    pub async fn list_users(&self, query: &UserListQuery) -> Result<Vec<User>> {
        let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE);
        let offset = query.offset.unwrap_or(0);
        if !(1..=MAX_PAGE_SIZE).contains(&limit) {
            bail!("Invalid limit: must be between 1 and {}.", MAX_PAGE_SIZE);
        }
        if offset < 0 {
            bail!("Invalid offset: must be zero or greater.");
        }
        self.users.list(limit, offset).await
    }

    /// Register a room.
    #[instrument(skip(self, request), fields(room_id = %request.id))]
    pub async fn create_room(&self, request: &CreateRoomRequest, created_by: &str) -> Result<Room> {
        let id = request.id.trim();
        let name = request.name.trim();
        if id.is_empty() || id.len() > MAX_ROOM_ID_LEN || id.contains('/') {
            bail!(
                "Invalid room id: must be 1-{} characters without '/'.",
                MAX_ROOM_ID_LEN
            );
        }
        if name.is_empty() {
            bail!("Invalid room name: must not be empty.");
        }
        if self.rooms.exists(id).await? {
            bail!("Room '{}' already exists.", id);
        }

        let room = self.rooms.create(id, name, Some(created_by)).await?;
        info!(room_id = %room.id, created_by = %created_by, "Created room");
        Ok(room)
    }

    pub async fn get_room(&self, id: &str) -> Result<Option<Room>> {
        self.rooms.get(id).await
    }

    pub async fn list_rooms(&self) -> Result<Vec<Room>> {
        self.rooms.list().await
    }
}

#[async_trait]
impl DirectoryLookup for DirectoryService {
    async fn room_exists(&self, room_id: &RoomId) -> Result<bool> {
        self.rooms.exists(room_id.as_str()).await
    }

    async fn display_name(&self, user_id: &UserId) -> Result<Option<String>> {
        let Ok(id) = user_id.as_str().parse::<i64>() else {
            return Ok(None);
        };
        Ok(self.users.get(id).await?.map(|user| user.login))
    }
}

/// Logins are email addresses.
fn is_valid_email(login: &str) -> bool {
    EMAIL_RE.is_match(login)
}

fn validate_password(password: &str) -> Result<()> {
    let len = password.chars().count();
    if !(MIN_PASSWORD_LEN..=MAX_PASSWORD_LEN).contains(&len) {
        bail!(
            "Password must be between {} and {} characters.",
            MIN_PASSWORD_LEN,
            MAX_PASSWORD_LEN
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthConfig;

    async fn service() -> DirectoryService {
        let db = Database::in_memory().await.unwrap();
        let auth = AuthState::new(AuthConfig {
            jwt_secret: Some("test-secret-for-unit-tests-minimum-32-chars-long".to_string()),
            bcrypt_cost: 4,
            ..Default::default()
        });
        DirectoryService::new(&db, auth)
    }

    fn sign_up(login: &str, password: &str, role: Option<Role>) -> SignUpRequest {
        SignUpRequest {
            login: login.to_string(),
            password: password.to_string(),
            role,
        }
    }

    #[test]
    fn test_is_valid_email() {
        assert!(is_valid_email("cmd@cmd.ru"));
        assert!(is_valid_email("user.name@sub.domain.com"));
        assert!(!is_valid_email("userexample.com"));
        assert!(!is_valid_email("user@"));
        assert!(!is_valid_email("@example.com"));
        assert!(!is_valid_email("a b@example.com"));
    }

    #[test]
    fn test_validate_password() {
        assert!(validate_password("123456").is_ok());
        assert!(validate_password(&"x".repeat(32)).is_ok());
        assert!(validate_password("12345").is_err());
        assert!(validate_password(&"x".repeat(33)).is_err());
    }

    #[tokio::test]
    async fn test_sign_up_and_sign_in() {
        let service = service().await;
        let user = service
            .sign_up(sign_up("cmd@cmd.ru", "123456", None))
            .await
            .unwrap();
        assert_eq!(user.role, Role::Regular);
        assert_ne!(user.password_hash, "123456");

        let response = service
            .sign_in(SignInRequest {
                login: "cmd@cmd.ru".to_string(),
                password: "123456".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(response.id, user.id);
        assert!(response.token.is_some());

        let err = service
            .sign_in(SignInRequest {
                login: "cmd@cmd.ru".to_string(),
                password: "wrong-password".to_string(),
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Authentication failed"));
    }

    #[tokio::test]
    async fn test_sign_up_rejects_duplicates_and_bad_input() {
        let service = service().await;
        service
            .sign_up(sign_up("cmd@cmd.ru", "123456", None))
            .await
            .unwrap();

        let dup = service
            .sign_up(sign_up("cmd@cmd.ru", "123456", None))
            .await
            .unwrap_err();
        assert!(dup.to_string().contains("already registered"));

        assert!(service.sign_up(sign_up("cmd", "123456", None)).await.is_err());
        assert!(service.sign_up(sign_up("x@y.io", "123", None)).await.is_err());
    }

    #[tokio::test]
    async fn test_only_first_super_signup_allowed() {
        let service = service().await;
        let admin = service
            .sign_up(sign_up("root@example.com", "123456", Some(Role::Super)))
            .await
            .unwrap();
        assert_eq!(admin.role, Role::Super);

        let err = service
            .sign_up(sign_up("eve@example.com", "123456", Some(Role::Super)))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("forbidden"));
    }

    #[tokio::test]
    async fn test_find_user() {
        let service = service().await;
        let user = service
            .sign_up(sign_up("cmd@cmd.ru", "123456", None))
            .await
            .unwrap();

        let by_id = service.find_user(&UserLookup::Id(user.id)).await.unwrap();
        assert_eq!(by_id.map(|u| u.login), Some("cmd@cmd.ru".to_string()));

        let by_login = service
            .find_user(&UserLookup::Login("cmd@cmd.ru".to_string()))
            .await
            .unwrap();
        assert!(by_login.is_some());

        assert!(service.find_user(&UserLookup::Id(999)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_users_validates_paging() {
        let service = service().await;
        assert!(
            service
                .list_users(&UserListQuery {
                    limit: Some(0),
                    offset: None
                })
                .await
                .is_err()
        );
        assert!(
            service
                .list_users(&UserListQuery::default())
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_rooms_and_lookup() {
        let service = service().await;
        let user = service
            .sign_up(sign_up("cmd@cmd.ru", "123456", None))
            .await
            .unwrap();

        let request = CreateRoomRequest {
            id: "1".to_string(),
            name: "Room1".to_string(),
        };
        let room = service.create_room(&request, "1").await.unwrap();
        assert_eq!(room.name, "Room1");

        let err = service.create_room(&request, "1").await.unwrap_err();
        assert!(err.to_string().contains("already exists"));

        assert!(service.room_exists(&RoomId::new("1")).await.unwrap());
        assert!(!service.room_exists(&RoomId::new("2")).await.unwrap());

        let name = service
            .display_name(&UserId::new(user.id.to_string()))
            .await
            .unwrap();
        assert_eq!(name.as_deref(), Some("cmd@cmd.ru"));
        assert_eq!(
            service.display_name(&UserId::new("not-a-number")).await.unwrap(),
            None
        );
    }
}
