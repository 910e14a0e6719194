//! Credential store: user identity records and password verification.
//!
//! Password hashing is an injected capability so the algorithm can change
//! without touching this module. Verification failures are always surfaced
//! as the generic `Authentication` error so callers cannot distinguish
//! "no such user" from "wrong password" or "account locked".

use crate::errors::AuthError;
use crate::models::{User, UserFilter};
use crate::store::Repository;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::sync::{Arc, RwLock};
use uuid::Uuid;

const MIN_PASSWORD_LENGTH: usize = 8;
const MAX_FAILED_LOGINS: i32 = 5;
const LOCKOUT_MINUTES: i64 = 15;
const DEFAULT_BCRYPT_COST: u32 = 12;

/// Verified against when the user does not exist, so lookup misses cost the
/// same as hash mismatches (enumeration/timing defense).
const DUMMY_HASH: &str = "$2b$12$LQv3c1yqBWVHxkd0LHAkCOYz6TtxMQJqhN8/LewY5GyYqExt7YD3a";

/// Pluggable password-hashing capability (adaptive, salted).
pub trait PasswordHasher: Send + Sync {
    /// Algorithm tag recorded next to the hash (e.g. "bcrypt").
    fn algorithm(&self) -> &'static str;

    fn hash(&self, raw: &str) -> Result<String, AuthError>;

    /// Malformed stored hashes count as a mismatch, not an error.
    fn verify(&self, raw: &str, hash: &str) -> bool;
}

pub struct BcryptHasher {
    cost: u32,
}

impl BcryptHasher {
    pub fn new() -> Self {
        BcryptHasher {
            cost: DEFAULT_BCRYPT_COST,
        }
    }

    /// Lower cost for tests; production stays at the default.
    pub fn with_cost(cost: u32) -> Self {
        BcryptHasher { cost }
    }
}

impl Default for BcryptHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl PasswordHasher for BcryptHasher {
    fn algorithm(&self) -> &'static str {
        "bcrypt"
    }

    fn hash(&self, raw: &str) -> Result<String, AuthError> {
        bcrypt::hash(raw, self.cost)
            .map_err(|e| AuthError::StoreUnavailable(format!("password hashing failed: {}", e)))
    }

    fn verify(&self, raw: &str, hash: &str) -> bool {
        bcrypt::verify(raw, hash).unwrap_or(false)
    }
}

/// Revocation hook the token service registers so a password change kills
/// every outstanding session for the user.
#[async_trait]
pub trait SessionRevoker: Send + Sync {
    async fn revoke_all_sessions(&self, user_id: Uuid) -> Result<(), AuthError>;
}

pub struct CredentialStore<R> {
    users: R,
    hasher: Arc<dyn PasswordHasher>,
    revoker: RwLock<Option<Arc<dyn SessionRevoker>>>,
}

impl<R: Repository<User>> CredentialStore<R> {
    pub fn new(users: R, hasher: Arc<dyn PasswordHasher>) -> Self {
        CredentialStore {
            users,
            hasher,
            revoker: RwLock::new(None),
        }
    }

    pub fn set_session_revoker(&self, revoker: Arc<dyn SessionRevoker>) {
        let mut slot = self.revoker.write().unwrap_or_else(|e| e.into_inner());
        *slot = Some(revoker);
    }

    fn session_revoker(&self) -> Option<Arc<dyn SessionRevoker>> {
        self.revoker
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Register a new user with the default role.
    ///
    /// Uniqueness of username and email is case-insensitive; the store's
    /// constraint is the backstop for races between check and insert.
    pub async fn register(
        &self,
        username: &str,
        email: &str,
        raw_password: &str,
    ) -> Result<User, AuthError> {
        let username = username.trim();
        if username.is_empty() {
            return Err(AuthError::Validation("Username cannot be empty".to_string()));
        }
        if !is_valid_email(email) {
            return Err(AuthError::Validation("Invalid email format".to_string()));
        }
        validate_password_policy(raw_password)?;

        for taken in [username, email] {
            let existing = self
                .users
                .find(&UserFilter {
                    username_or_email: Some(taken.to_string()),
                })
                .await?;
            if !existing.is_empty() {
                return Err(AuthError::Conflict(
                    "username or email already registered".to_string(),
                ));
            }
        }

        let password_hash = self.hasher.hash(raw_password)?;
        let user = User::new(
            username.to_string(),
            email.to_string(),
            password_hash,
            self.hasher.algorithm().to_string(),
        );

        let user = self.users.add(user).await?;
        tracing::info!(user_id = %user.user_id, "user registered");
        Ok(user)
    }

    /// Verify credentials for login.
    ///
    /// The hash check runs even when the user is unknown (against a dummy
    /// hash) so response timing does not reveal account existence.
    pub async fn verify(
        &self,
        username_or_email: &str,
        raw_password: &str,
    ) -> Result<User, AuthError> {
        let now = Utc::now();

        let user = self
            .users
            .find(&UserFilter {
                username_or_email: Some(username_or_email.to_string()),
            })
            .await?
            .into_iter()
            .next();

        let hash_to_verify = user
            .as_ref()
            .map(|u| u.password_hash.as_str())
            .unwrap_or(DUMMY_HASH);
        let password_ok = self.hasher.verify(raw_password, hash_to_verify);

        let user = match user {
            Some(user) => user,
            None => return Err(AuthError::Authentication),
        };

        if !user.is_active || user.is_locked(now) {
            tracing::warn!(user_id = %user.user_id, "login attempt against inactive or locked account");
            return Err(AuthError::Authentication);
        }

        if !password_ok {
            self.record_failed_login(user).await;
            return Err(AuthError::Authentication);
        }

        self.clear_failed_logins(user.clone()).await;
        Ok(user)
    }

    /// Change a user's password after re-verifying the old one, then revoke
    /// every outstanding refresh token for the user.
    pub async fn change_password(
        &self,
        user_id: Uuid,
        old_password: &str,
        new_password: &str,
    ) -> Result<(), AuthError> {
        let user = self
            .users
            .get(&user_id)
            .await?
            .ok_or_else(|| AuthError::NotFound("user does not exist".to_string()))?;

        if !self.hasher.verify(old_password, &user.password_hash) {
            return Err(AuthError::Authentication);
        }
        validate_password_policy(new_password)?;

        let mut updated = user;
        updated.password_hash = self.hasher.hash(new_password)?;
        updated.hash_algorithm = self.hasher.algorithm().to_string();
        self.users.update(updated).await?;

        if let Some(revoker) = self.session_revoker() {
            revoker.revoke_all_sessions(user_id).await?;
        } else {
            tracing::warn!(user_id = %user_id, "no session revoker registered; outstanding sessions survive password change");
        }

        tracing::info!(user_id = %user_id, "password changed, sessions revoked");
        Ok(())
    }

    /// Soft-deactivate a user. Records are never hard-deleted so issued
    /// refresh tokens keep a valid referent.
    pub async fn deactivate(&self, user_id: Uuid) -> Result<(), AuthError> {
        let user = self
            .users
            .get(&user_id)
            .await?
            .ok_or_else(|| AuthError::NotFound("user does not exist".to_string()))?;

        let mut updated = user;
        updated.is_active = false;
        self.users.update(updated).await?;

        if let Some(revoker) = self.session_revoker() {
            revoker.revoke_all_sessions(user_id).await?;
        }
        Ok(())
    }

    async fn record_failed_login(&self, mut user: User) {
        user.failed_logins += 1;
        if user.failed_logins >= MAX_FAILED_LOGINS {
            user.locked_until = Some(Utc::now() + Duration::minutes(LOCKOUT_MINUTES));
            user.failed_logins = 0;
            tracing::warn!(user_id = %user.user_id, "account locked after repeated failed logins");
        }
        // Best-effort: losing this write to a concurrent update only delays
        // the lockout by one attempt.
        if let Err(e) = self.users.update(user).await {
            tracing::warn!("failed to persist failed-login counter: {}", e);
        }
    }

    async fn clear_failed_logins(&self, mut user: User) {
        if user.failed_logins == 0 && user.locked_until.is_none() {
            return;
        }
        user.failed_logins = 0;
        user.locked_until = None;
        if let Err(e) = self.users.update(user).await {
            tracing::warn!("failed to reset failed-login counter: {}", e);
        }
    }
}

fn validate_password_policy(raw_password: &str) -> Result<(), AuthError> {
    if raw_password.len() < MIN_PASSWORD_LENGTH {
        return Err(AuthError::Validation(format!(
            "Password must be at least {} characters",
            MIN_PASSWORD_LENGTH
        )));
    }
    Ok(())
}

/// Basic email check: something@something.something, no empty parts.
fn is_valid_email(email: &str) -> bool {
    let parts: Vec<&str> = email.split('@').collect();
    let (local, domain) = match parts.as_slice() {
        [local, domain] => (*local, *domain),
        _ => return false,
    };

    if local.is_empty() {
        return false;
    }

    let domain_parts: Vec<&str> = domain.split('.').collect();
    if domain_parts.len() < 2 {
        return false;
    }
    domain_parts.iter().all(|p| !p.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UserFilter;
    use crate::store::memory::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn store() -> CredentialStore<MemoryStore<User>> {
        CredentialStore::new(MemoryStore::new(), Arc::new(BcryptHasher::with_cost(4)))
    }

    struct RecordingRevoker {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SessionRevoker for Arc<RecordingRevoker> {
        async fn revoke_all_sessions(&self, _user_id: Uuid) -> Result<(), AuthError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_is_valid_email() {
        assert!(is_valid_email("test@example.com"));
        assert!(is_valid_email("user.name@sub.domain.org"));

        assert!(!is_valid_email(""));
        assert!(!is_valid_email("test"));
        assert!(!is_valid_email("test@"));
        assert!(!is_valid_email("@example.com"));
        assert!(!is_valid_email("test@example"));
        assert!(!is_valid_email("test@.com"));
        assert!(!is_valid_email("test@@example.com"));
    }

    #[tokio::test]
    async fn test_register_happy_path() {
        let creds = store();
        let user = creds
            .register("alice", "alice@x.com", "Secret123!")
            .await
            .unwrap();

        assert_eq!(user.username, "alice");
        assert_eq!(user.roles, vec!["user".to_string()]);
        assert_eq!(user.hash_algorithm, "bcrypt");
        assert!(user.is_active);
        // The stored value is a hash, never the raw password.
        assert_ne!(user.password_hash, "Secret123!");
    }

    #[tokio::test]
    async fn test_register_duplicate_is_conflict_without_partial_write() {
        let creds = store();
        creds
            .register("alice", "alice@x.com", "Secret123!")
            .await
            .unwrap();

        for (username, email) in [
            ("alice", "other@x.com"),
            ("ALICE", "other@x.com"),
            ("bob", "alice@x.com"),
            ("bob", "ALICE@X.COM"),
        ] {
            let result = creds.register(username, email, "Secret123!").await;
            assert!(
                matches!(result, Err(AuthError::Conflict(_))),
                "{}/{} should conflict",
                username,
                email
            );
        }

        let all = creds.users.find(&UserFilter::default()).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn test_register_validation_failures() {
        let creds = store();

        let bad_email = creds.register("alice", "not-an-email", "Secret123!").await;
        assert!(matches!(bad_email, Err(AuthError::Validation(_))));

        let short_password = creds.register("alice", "alice@x.com", "short").await;
        assert!(matches!(short_password, Err(AuthError::Validation(_))));

        let empty_username = creds.register("   ", "alice@x.com", "Secret123!").await;
        assert!(matches!(empty_username, Err(AuthError::Validation(_))));
    }

    #[tokio::test]
    async fn test_verify_succeeds_with_username_or_email() {
        let creds = store();
        creds
            .register("alice", "alice@x.com", "Secret123!")
            .await
            .unwrap();

        let by_name = creds.verify("alice", "Secret123!").await.unwrap();
        let by_email = creds.verify("ALICE@x.com", "Secret123!").await.unwrap();
        assert_eq!(by_name.user_id, by_email.user_id);
    }

    #[tokio::test]
    async fn test_verify_failures_are_indistinguishable() {
        let creds = store();
        creds
            .register("alice", "alice@x.com", "Secret123!")
            .await
            .unwrap();

        let wrong_password = creds.verify("alice", "WrongPass1!").await;
        let no_such_user = creds.verify("mallory", "Secret123!").await;

        assert!(matches!(wrong_password, Err(AuthError::Authentication)));
        assert!(matches!(no_such_user, Err(AuthError::Authentication)));
    }

    #[tokio::test]
    async fn test_lockout_after_repeated_failures() {
        let creds = store();
        creds
            .register("alice", "alice@x.com", "Secret123!")
            .await
            .unwrap();

        for _ in 0..MAX_FAILED_LOGINS {
            let _ = creds.verify("alice", "WrongPass1!").await;
        }

        // Locked now, even with the correct password.
        let result = creds.verify("alice", "Secret123!").await;
        assert!(matches!(result, Err(AuthError::Authentication)));
    }

    #[tokio::test]
    async fn test_successful_login_resets_failure_counter() {
        let creds = store();
        creds
            .register("alice", "alice@x.com", "Secret123!")
            .await
            .unwrap();

        for _ in 0..MAX_FAILED_LOGINS - 1 {
            let _ = creds.verify("alice", "WrongPass1!").await;
        }
        creds.verify("alice", "Secret123!").await.unwrap();

        // Counter reset: the next run of failures starts from zero.
        for _ in 0..MAX_FAILED_LOGINS - 1 {
            let _ = creds.verify("alice", "WrongPass1!").await;
        }
        assert!(creds.verify("alice", "Secret123!").await.is_ok());
    }

    #[tokio::test]
    async fn test_change_password_reverifies_and_revokes_sessions() {
        let creds = store();
        let user = creds
            .register("alice", "alice@x.com", "Secret123!")
            .await
            .unwrap();

        let revoker = Arc::new(RecordingRevoker {
            calls: AtomicUsize::new(0),
        });
        creds.set_session_revoker(Arc::new(Arc::clone(&revoker)));

        let wrong_old = creds
            .change_password(user.user_id, "WrongPass1!", "NewSecret1!")
            .await;
        assert!(matches!(wrong_old, Err(AuthError::Authentication)));
        assert_eq!(revoker.calls.load(Ordering::SeqCst), 0);

        creds
            .change_password(user.user_id, "Secret123!", "NewSecret1!")
            .await
            .unwrap();
        assert_eq!(revoker.calls.load(Ordering::SeqCst), 1);

        assert!(creds.verify("alice", "Secret123!").await.is_err());
        assert!(creds.verify("alice", "NewSecret1!").await.is_ok());
    }

    #[tokio::test]
    async fn test_change_password_unknown_user_is_not_found() {
        let creds = store();
        let result = creds
            .change_password(Uuid::new_v4(), "Secret123!", "NewSecret1!")
            .await;
        assert!(matches!(result, Err(AuthError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_deactivated_account_fails_verify_generically() {
        let creds = store();
        let user = creds
            .register("alice", "alice@x.com", "Secret123!")
            .await
            .unwrap();

        creds.deactivate(user.user_id).await.unwrap();

        let result = creds.verify("alice", "Secret123!").await;
        assert!(matches!(result, Err(AuthError::Authentication)));
    }
}
