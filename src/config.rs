use base64::{engine::general_purpose, Engine as _};
use std::collections::HashMap;
use std::env;
use thiserror::Error;

const MIN_SIGNING_KEY_BYTES: usize = 32;

/// Service configuration, loaded once at startup.
///
/// Crypto parameters are validated eagerly: the process must not start with
/// an unusable signing key or inconsistent TTLs.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    /// HMAC signing key for access tokens (raw bytes, >= 32).
    pub signing_key: Vec<u8>,
    /// Key id stamped into JWT headers, used to pick the verification key.
    pub signing_key_id: String,
    pub access_token_ttl_secs: i64,
    pub refresh_token_ttl_secs: i64,
    pub issuer: String,
    pub audience: String,
    /// How long a retired signing key keeps validating in-flight tokens.
    pub key_rotation_grace_secs: i64,
    pub cors_origin: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid signing key: {0}")]
    InvalidSigningKey(String),

    #[error("Base64 decode error: {0}")]
    Base64Error(#[from] base64::DecodeError),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a HashMap (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let database_url = vars
            .get("DATABASE_URL")
            .ok_or_else(|| ConfigError::MissingEnvVar("DATABASE_URL".to_string()))?
            .clone();

        let bind_address = vars
            .get("BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| "0.0.0.0:8080".to_string());

        let signing_key_base64 = vars
            .get("AUTH_SIGNING_KEY")
            .ok_or_else(|| ConfigError::MissingEnvVar("AUTH_SIGNING_KEY".to_string()))?;

        let signing_key = general_purpose::STANDARD
            .decode(signing_key_base64)
            .map_err(ConfigError::Base64Error)?;

        if signing_key.len() < MIN_SIGNING_KEY_BYTES {
            return Err(ConfigError::InvalidSigningKey(format!(
                "Expected at least {} bytes, got {}",
                MIN_SIGNING_KEY_BYTES,
                signing_key.len()
            )));
        }

        let signing_key_id = vars
            .get("AUTH_SIGNING_KEY_ID")
            .cloned()
            .unwrap_or_else(|| "auth-01".to_string());

        let access_token_ttl_secs = parse_i64(vars, "ACCESS_TOKEN_TTL_SECS", 900)?;
        let refresh_token_ttl_secs = parse_i64(vars, "REFRESH_TOKEN_TTL_SECS", 7 * 24 * 3600)?;
        let key_rotation_grace_secs = parse_i64(vars, "KEY_ROTATION_GRACE_SECS", 300)?;

        if access_token_ttl_secs <= 0 {
            return Err(ConfigError::InvalidValue(
                "ACCESS_TOKEN_TTL_SECS".to_string(),
                "must be positive".to_string(),
            ));
        }

        // An access token must never outlive the refresh token that minted it.
        if refresh_token_ttl_secs <= access_token_ttl_secs {
            return Err(ConfigError::InvalidValue(
                "REFRESH_TOKEN_TTL_SECS".to_string(),
                "must exceed ACCESS_TOKEN_TTL_SECS".to_string(),
            ));
        }

        if key_rotation_grace_secs < 0 {
            return Err(ConfigError::InvalidValue(
                "KEY_ROTATION_GRACE_SECS".to_string(),
                "must not be negative".to_string(),
            ));
        }

        let issuer = vars
            .get("TOKEN_ISSUER")
            .cloned()
            .unwrap_or_else(|| "auth-service".to_string());

        let audience = vars
            .get("TOKEN_AUDIENCE")
            .cloned()
            .unwrap_or_else(|| "api".to_string());

        let cors_origin = vars.get("CORS_ORIGIN").cloned();

        Ok(Config {
            database_url,
            bind_address,
            signing_key,
            signing_key_id,
            access_token_ttl_secs,
            refresh_token_ttl_secs,
            issuer,
            audience,
            key_rotation_grace_secs,
            cors_origin,
        })
    }
}

fn parse_i64(vars: &HashMap<String, String>, name: &str, default: i64) -> Result<i64, ConfigError> {
    match vars.get(name) {
        None => Ok(default),
        Some(raw) => raw
            .parse::<i64>()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
    }
}
