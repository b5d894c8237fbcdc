//! Authentication configuration.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Placeholder secret that must never reach a running server.
const INSECURE_JWT_SECRET: &str = "change-me-in-production";

/// Minimum JWT secret length accepted by [`AuthConfig::validate`].
const MIN_SECRET_LENGTH: usize = 32;

/// Range of bcrypt costs the bcrypt crate accepts.
const BCRYPT_COST_RANGE: std::ops::RangeInclusive<u32> = 4..=31;

/// Authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// JWT secret for HS256. Supports `env:VAR_NAME`.
    /// REQUIRED to serve.
    pub jwt_secret: Option<String>,

    /// Lifetime of issued tokens in seconds.
    pub token_ttl_secs: u64,

    /// bcrypt cost used when hashing new passwords.
    pub bcrypt_cost: u32,

    /// Allowed CORS origins. If empty, CORS is disabled.
    pub allowed_origins: Vec<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            // No default JWT secret - must be explicitly configured
            jwt_secret: None,
            token_ttl_secs: 24 * 3600,
            bcrypt_cost: bcrypt::DEFAULT_COST,
            allowed_origins: vec![
                "http://localhost:3000".to_string(),
                "http://localhost:8080".to_string(),
            ],
        }
    }
}

impl AuthConfig {
    /// Resolve the JWT secret, expanding `env:VAR_NAME` syntax.
    /// Returns the resolved secret or None if not configured.
    pub fn resolve_jwt_secret(&self) -> Result<Option<String>, ConfigValidationError> {
        match &self.jwt_secret {
            None => Ok(None),
            Some(value) => {
                if let Some(var_name) = value.strip_prefix("env:") {
                    match std::env::var(var_name) {
                        Ok(secret) if !secret.is_empty() => Ok(Some(secret)),
                        Ok(_) => Err(ConfigValidationError::EnvVarEmpty(var_name.to_string())),
                        Err(_) => Err(ConfigValidationError::EnvVarNotFound(var_name.to_string())),
                    }
                } else {
                    Ok(Some(value.clone()))
                }
            }
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        let secret = self
            .resolve_jwt_secret()?
            .ok_or(ConfigValidationError::MissingJwtSecret)?;

        if secret == INSECURE_JWT_SECRET {
            return Err(ConfigValidationError::InsecureJwtSecret);
        }
        if secret.len() < MIN_SECRET_LENGTH {
            return Err(ConfigValidationError::JwtSecretTooShort);
        }
        if !BCRYPT_COST_RANGE.contains(&self.bcrypt_cost) {
            return Err(ConfigValidationError::InvalidBcryptCost(self.bcrypt_cost));
        }
        if self.token_ttl_secs == 0 {
            return Err(ConfigValidationError::InvalidTokenTtl);
        }

        Ok(())
    }

    /// Generate a random JWT secret.
    pub fn generate_jwt_secret() -> String {
        use rand::Rng;

        const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
        const SECRET_LENGTH: usize = 64;

        let mut rng = rand::rng();
        (0..SECRET_LENGTH)
            .map(|_| {
                let idx = rng.random_range(0..CHARSET.len());
                CHARSET[idx] as char
            })
            .collect()
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigValidationError {
    #[error(
        "JWT secret is required. Set CHATHUB__AUTH__JWT_SECRET or auth.jwt_secret in config (run `chathub init` to generate one)."
    )]
    MissingJwtSecret,

    #[error("JWT secret cannot be the placeholder value. Please configure a secure secret.")]
    InsecureJwtSecret,

    #[error("JWT secret must be at least 32 characters long.")]
    JwtSecretTooShort,

    #[error("bcrypt cost {0} is out of range (4-31).")]
    InvalidBcryptCost(u32),

    #[error("token_ttl_secs must be greater than zero.")]
    InvalidTokenTtl,

    #[error("Environment variable '{0}' not found (referenced via env:{0} in config).")]
    EnvVarNotFound(String),

    #[error("Environment variable '{0}' is empty (referenced via env:{0} in config).")]
    EnvVarEmpty(String),
}
