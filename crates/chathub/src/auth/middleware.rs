//! Authentication middleware.

use axum::{
    extract::{FromRequestParts, State},
    http::{header::AUTHORIZATION, request::Parts},
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use log::warn;
use std::sync::Arc;

use super::{AuthConfig, AuthError, Claims, Role};
use crate::ws::UserIdentity;

/// Extract a Bearer token from an Authorization header value.
fn bearer_token_from_header(header_value: &str) -> Result<&str, AuthError> {
    let mut parts = header_value.split_whitespace();
    let scheme = parts.next().ok_or(AuthError::InvalidAuthHeader)?;

    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthError::InvalidAuthHeader);
    }

    let token = parts.next().ok_or(AuthError::InvalidAuthHeader)?;
    if token.is_empty() {
        return Err(AuthError::InvalidAuthHeader);
    }

    if parts.next().is_some() {
        return Err(AuthError::InvalidAuthHeader);
    }

    Ok(token)
}

fn token_from_cookie_header<'a>(cookie_header: &'a str, cookie_name: &str) -> Option<&'a str> {
    cookie_header.split(';').map(str::trim).find_map(|pair| {
        let (name, value) = pair.split_once('=')?;
        if name.trim() == cookie_name {
            Some(value.trim())
        } else {
            None
        }
    })
}

fn token_from_query(query: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        if key == "token" {
            urlencoding::decode(value).ok().map(|s| s.into_owned())
        } else {
            None
        }
    })
}

/// Authentication state shared across handlers.
#[derive(Clone)]
pub struct AuthState {
    config: Arc<AuthConfig>,
    keys: Option<(EncodingKey, DecodingKey)>,
}

impl AuthState {
    /// Create new auth state from config.
    /// Resolves `env:VAR_NAME` syntax in jwt_secret at construction time.
    pub fn new(mut config: AuthConfig) -> Self {
        match config.resolve_jwt_secret() {
            Ok(Some(resolved)) => config.jwt_secret = Some(resolved),
            Ok(None) => {}
            Err(e) => {
                warn!("Could not resolve JWT secret: {}", e);
                config.jwt_secret = None;
            }
        }

        let keys = config.jwt_secret.as_ref().map(|secret| {
            (
                EncodingKey::from_secret(secret.as_bytes()),
                DecodingKey::from_secret(secret.as_bytes()),
            )
        });

        Self {
            config: Arc::new(config),
            keys,
        }
    }

    /// Get allowed CORS origins from config.
    pub fn allowed_origins(&self) -> &[String] {
        &self.config.allowed_origins
    }

    fn keys(&self) -> Result<&(EncodingKey, DecodingKey), AuthError> {
        self.keys
            .as_ref()
            .ok_or_else(|| AuthError::Internal("no JWT secret configured".to_string()))
    }

    /// Validate a JWT token.
    pub fn validate_token(&self, token: &str) -> Result<Claims, AuthError> {
        let (_, decoding_key) = self.keys()?;

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;
        validation.required_spec_claims.clear();

        let token_data = decode::<Claims>(token, decoding_key, &validation).map_err(|e| {
            warn!("JWT validation failed: {:?}", e);
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => AuthError::InvalidToken(e.to_string()),
            }
        })?;

        Ok(token_data.claims)
    }

    /// Issue a token for a user.
    pub fn generate_token(
        &self,
        user_id: &str,
        login: &str,
        name: Option<&str>,
        role: Role,
    ) -> Result<String, AuthError> {
        let (encoding_key, _) = self.keys()?;

        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: user_id.to_string(),
            login: login.to_string(),
            name: name.map(str::to_string),
            role,
            exp: now + self.config.token_ttl_secs as i64,
            iat: Some(now),
        };

        encode(&Header::default(), &claims, encoding_key)
            .map_err(|e| AuthError::Internal(e.to_string()))
    }

    /// Hash a password with the configured bcrypt cost.
    pub fn hash_password(&self, password: &str) -> Result<String, AuthError> {
        bcrypt::hash(password, self.config.bcrypt_cost)
            .map_err(|e| AuthError::Internal(e.to_string()))
    }
}

/// Verify a password against a bcrypt hash.
pub fn verify_password(password: &str, password_hash: &str) -> bool {
    bcrypt::verify(password, password_hash).unwrap_or(false)
}

/// Authenticated user extracted from request.
#[derive(Debug, Clone)]
pub struct CurrentUser {
    /// User claims.
    pub claims: Claims,
}

impl CurrentUser {
    /// Get the user ID.
    pub fn id(&self) -> &str {
        &self.claims.sub
    }

    /// Get the user's login.
    pub fn login(&self) -> &str {
        &self.claims.login
    }

    /// Get the user's role.
    pub fn role(&self) -> Role {
        self.claims.role
    }

    /// Check if user has the super role.
    pub fn is_super(&self) -> bool {
        self.claims.is_super()
    }

    /// Get display name.
    pub fn display_name(&self) -> &str {
        self.claims.display_name()
    }

    /// The identity the hub binds to a connection.
    pub fn identity(&self) -> UserIdentity {
        UserIdentity::new(self.id(), self.display_name())
    }
}

impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<CurrentUser>()
            .cloned()
            .ok_or(AuthError::MissingAuthHeader)
    }
}

/// Authentication middleware.
///
/// Validates JWT tokens and injects `CurrentUser` into request extensions.
/// Supports multiple auth methods in priority order:
/// 1. Authorization: Bearer <token> header
/// 2. auth_token cookie
/// 3. token query parameter (browsers can't set headers on WebSocket upgrades)
pub async fn auth_middleware(
    State(auth): State<AuthState>,
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, AuthError> {
    let auth_header = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    let cookie_token = req
        .headers()
        .get(axum::http::header::COOKIE)
        .and_then(|h| h.to_str().ok())
        .and_then(|cookie_header| token_from_cookie_header(cookie_header, "auth_token"));

    let query_token = req.uri().query().and_then(token_from_query);

    let claims = if let Some(header) = auth_header {
        let token = bearer_token_from_header(header)?;
        auth.validate_token(token)?
    } else if let Some(token) = cookie_token {
        auth.validate_token(token)?
    } else if let Some(ref token) = query_token {
        auth.validate_token(token)?
    } else {
        return Err(AuthError::MissingAuthHeader);
    };

    let user = CurrentUser { claims };
    req.extensions_mut().insert(user);

    Ok(next.run(req).await)
}

/// Require the super role.
///
/// Use as an extractor in handlers that require administrative access.
#[derive(Debug, Clone)]
pub struct RequireSuper(pub CurrentUser);

impl<S> FromRequestParts<S> for RequireSuper
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user = parts
            .extensions
            .get::<CurrentUser>()
            .cloned()
            .ok_or(AuthError::MissingAuthHeader)?;

        if !user.is_super() {
            return Err(AuthError::InsufficientPermissions(
                "super role required".to_string(),
            ));
        }

        Ok(RequireSuper(user))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_state() -> AuthState {
        AuthState::new(AuthConfig {
            jwt_secret: Some("test-secret-for-unit-tests-minimum-32-chars-long".to_string()),
            bcrypt_cost: 4,
            ..Default::default()
        })
    }

    #[test]
    fn test_bearer_token_from_header_valid() {
        assert_eq!(
            bearer_token_from_header("Bearer abc.def.ghi").unwrap(),
            "abc.def.ghi"
        );
        assert_eq!(
            bearer_token_from_header("bearer   token123").unwrap(),
            "token123"
        );
        assert_eq!(
            bearer_token_from_header("   Bearer\tmixed-case ").unwrap(),
            "mixed-case"
        );
    }

    #[test]
    fn test_bearer_token_from_header_invalid() {
        let cases = [
            "",
            "Bearer",
            "Bearer ",
            "Token something",
            "Bearer token extra",
            "bear token",
        ];

        for case in cases {
            assert!(
                bearer_token_from_header(case).is_err(),
                "{case} should fail"
            );
        }
    }

    #[test]
    fn test_token_from_cookie_header() {
        assert_eq!(
            token_from_cookie_header("theme=dark; auth_token=abc.def ; x=1", "auth_token"),
            Some("abc.def")
        );
        assert_eq!(token_from_cookie_header("theme=dark", "auth_token"), None);
    }

    #[test]
    fn test_token_from_query() {
        assert_eq!(
            token_from_query("room=1&token=a%2Eb%2Ec"),
            Some("a.b.c".to_string())
        );
        assert_eq!(token_from_query("room=1"), None);
    }

    #[test]
    fn test_generate_and_validate_token() {
        let state = test_state();
        let token = state
            .generate_token("7", "alice@example.com", Some("Alice"), Role::Super)
            .unwrap();

        let claims = state.validate_token(&token).unwrap();
        assert_eq!(claims.sub, "7");
        assert_eq!(claims.login, "alice@example.com");
        assert!(claims.is_super());
        assert!(claims.exp > Utc::now().timestamp());
    }

    #[test]
    fn test_token_from_other_secret_rejected() {
        let other = AuthState::new(AuthConfig {
            jwt_secret: Some("another-secret-for-unit-tests-minimum-32-chars".to_string()),
            ..Default::default()
        });
        let token = other
            .generate_token("7", "alice@example.com", None, Role::Regular)
            .unwrap();

        assert!(matches!(
            test_state().validate_token(&token),
            Err(AuthError::InvalidToken(_))
        ));
    }

    #[test]
    fn test_expired_token_rejected() {
        let state = test_state();
        let claims = Claims {
            sub: "7".to_string(),
            login: "alice@example.com".to_string(),
            name: None,
            role: Role::Regular,
            exp: Utc::now().timestamp() - 3600,
            iat: None,
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"test-secret-for-unit-tests-minimum-32-chars-long"),
        )
        .unwrap();

        assert!(matches!(
            state.validate_token(&token),
            Err(AuthError::TokenExpired)
        ));
    }

    #[test]
    fn test_no_secret_configured() {
        let state = AuthState::new(AuthConfig::default());
        assert!(matches!(
            state.validate_token("anything"),
            Err(AuthError::Internal(_))
        ));
    }

    #[test]
    fn test_password_hashing() {
        let state = test_state();
        let hash = state.hash_password("hunter22").unwrap();
        assert!(hash.starts_with("$2"));
        assert!(verify_password("hunter22", &hash));
        assert!(!verify_password("hunter23", &hash));
        assert!(!verify_password("hunter22", "not-a-hash"));
    }

    #[test]
    fn test_current_user_identity() {
        let user = CurrentUser {
            claims: Claims {
                sub: "7".to_string(),
                login: "alice@example.com".to_string(),
                name: None,
                role: Role::Regular,
                exp: Utc::now().timestamp() + 3600,
                iat: None,
            },
        };
        assert_eq!(user.id(), "7");
        assert!(!user.is_super());

        let identity = user.identity();
        assert_eq!(identity.user_id.as_str(), "7");
        assert_eq!(identity.display_name, "alice@example.com");
    }
}
