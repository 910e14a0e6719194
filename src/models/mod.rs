//! Data models for the auth service.
//!
//! `User` is owned by the credential store, `RefreshToken` by the token
//! service. Both carry a version counter for optimistic concurrency.

use crate::store::Entity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

pub const DEFAULT_ROLE: &str = "user";

/// User identity record (maps to users table).
///
/// Never hard-deleted: deactivation flips `is_active` so issued tokens keep
/// a valid referent.
#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub user_id: Uuid,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    /// Algorithm tag for the stored hash (e.g. "bcrypt").
    pub hash_algorithm: String,
    pub roles: Vec<String>,
    pub is_active: bool,
    pub failed_logins: i32,
    pub locked_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub version: i64,
}

impl User {
    pub fn new(username: String, email: String, password_hash: String, hash_algorithm: String) -> Self {
        User {
            user_id: Uuid::new_v4(),
            username,
            email,
            password_hash,
            hash_algorithm,
            roles: vec![DEFAULT_ROLE.to_string()],
            is_active: true,
            failed_logins: 0,
            locked_until: None,
            created_at: Utc::now(),
            version: 0,
        }
    }

    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.locked_until.is_some_and(|until| until > now)
    }
}

/// Conjunctive filter over users; unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct UserFilter {
    /// Case-insensitive match against username or email.
    pub username_or_email: Option<String>,
}

impl Entity for User {
    type Id = Uuid;
    type Filter = UserFilter;

    fn id(&self) -> Uuid {
        self.user_id
    }

    fn matches(&self, filter: &UserFilter) -> bool {
        match &filter.username_or_email {
            None => true,
            Some(needle) => {
                let needle = needle.to_lowercase();
                self.username.to_lowercase() == needle || self.email.to_lowercase() == needle
            }
        }
    }

    fn conflicts_with(&self, other: &Self) -> bool {
        // Username/email uniqueness is case-insensitive.
        self.username.to_lowercase() == other.username.to_lowercase()
            || self.email.to_lowercase() == other.email.to_lowercase()
    }

    fn version(&self) -> i64 {
        self.version
    }

    fn set_version(&mut self, version: i64) {
        self.version = version;
    }
}

/// Lifecycle state of a refresh token, derived from its fields.
///
/// `Active` is the only state a token may be presented from. `Rotated` and
/// `Revoked` are terminal for the id; `Rotated` links forward to its
/// successor via `replaced_by`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    Active,
    Rotated,
    Revoked,
}

/// Renewable session credential (maps to refresh_tokens table).
///
/// Rows are never deleted inside the retention window; reuse detection
/// depends on finding rotated/revoked ancestors.
#[derive(Debug, Clone, FromRow)]
pub struct RefreshToken {
    /// Random, unguessable id (32 bytes of entropy, base64url).
    pub token_id: String,
    pub user_id: Uuid,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
    /// Id of the token that superseded this one. Immutable once set.
    pub replaced_by: Option<String>,
    pub version: i64,
}

impl RefreshToken {
    pub fn state(&self) -> TokenState {
        if self.revoked {
            TokenState::Revoked
        } else if self.replaced_by.is_some() {
            TokenState::Rotated
        } else {
            TokenState::Active
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Conjunctive filter over refresh tokens; unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct RefreshTokenFilter {
    pub user_id: Option<Uuid>,
    /// Match the token whose `replaced_by` equals this id (chain parent).
    pub replaced_by: Option<String>,
    pub unrevoked_only: bool,
}

impl Entity for RefreshToken {
    type Id = String;
    type Filter = RefreshTokenFilter;

    fn id(&self) -> String {
        self.token_id.clone()
    }

    fn matches(&self, filter: &RefreshTokenFilter) -> bool {
        if let Some(user_id) = filter.user_id {
            if self.user_id != user_id {
                return false;
            }
        }
        if let Some(replaced_by) = &filter.replaced_by {
            if self.replaced_by.as_deref() != Some(replaced_by.as_str()) {
                return false;
            }
        }
        if filter.unrevoked_only && self.revoked {
            return false;
        }
        true
    }

    fn conflicts_with(&self, _other: &Self) -> bool {
        // Token ids are the only uniqueness constraint, enforced by key.
        false
    }

    fn version(&self) -> i64 {
        self.version
    }

    fn set_version(&mut self, version: i64) {
        self.version = version;
    }
}

/// Signed access-token claim set. Transient: proven by signature and expiry
/// alone, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessClaims {
    pub sub: Uuid,
    pub iss: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
    pub roles: Vec<String>,
    /// Token-type marker; always "access" for tokens this service mints.
    pub typ: String,
}

/// Access/refresh pair returned by login, register and refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: u64,
    pub refresh_token: String,
    pub refresh_expires_at: DateTime<Utc>,
}
