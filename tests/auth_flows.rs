//! End-to-end auth flows over the in-memory backend.
//!
//! Exercises the full register/login/refresh/logout surface through the
//! orchestrator, including rotation-reuse detection and session revocation
//! on password change.

use auth_service::errors::AuthError;
use auth_service::models::{RefreshToken, User};
use auth_service::services::auth_service::{AuthService, RegistrationRequest};
use auth_service::services::credential_store::{BcryptHasher, CredentialStore};
use auth_service::services::token_service::{TokenConfig, TokenService};
use auth_service::store::memory::MemoryStore;
use chrono::Duration;
use std::sync::Arc;

type MemoryAuthService = AuthService<MemoryStore<User>, MemoryStore<RefreshToken>>;

fn wire() -> Arc<MemoryAuthService> {
    let users = MemoryStore::<User>::new();
    let credentials = Arc::new(CredentialStore::new(
        users.clone(),
        Arc::new(BcryptHasher::with_cost(4)),
    ));
    let tokens = Arc::new(TokenService::new(
        MemoryStore::<RefreshToken>::new(),
        users,
        &[42u8; 32],
        "test-key-01",
        TokenConfig {
            access_ttl: Duration::seconds(900),
            refresh_ttl: Duration::days(7),
            issuer: "auth-service".to_string(),
            audience: "api".to_string(),
            rotation_grace: Duration::seconds(300),
        },
    ));
    Arc::new(AuthService::new(credentials, tokens))
}

async fn register_alice(auth: &MemoryAuthService) -> auth_service::services::auth_service::RegistrationResponse {
    auth.register(RegistrationRequest {
        username: "alice".to_string(),
        email: "alice@x.com".to_string(),
        password: "Secret123!".to_string(),
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn test_register_returns_valid_pair() {
    let auth = wire();
    let response = register_alice(&auth).await;

    assert_eq!(response.username, "alice");
    assert_eq!(response.tokens.token_type, "Bearer");
    assert_eq!(response.tokens.expires_in, 900);

    let claims = auth
        .validate_access_token(&response.tokens.access_token)
        .unwrap();
    assert_eq!(claims.sub, response.user_id);
    assert_eq!(claims.typ, "access");
}

#[tokio::test]
async fn test_login_after_register() {
    let auth = wire();
    register_alice(&auth).await;

    // Both identifiers work, case-insensitively.
    assert!(auth.login("alice", "Secret123!").await.is_ok());
    assert!(auth.login("ALICE@X.COM", "Secret123!").await.is_ok());

    let result = auth.login("alice", "wrong-password").await;
    assert!(matches!(result, Err(AuthError::Authentication)));
}

#[tokio::test]
async fn test_refresh_rotates_and_old_token_is_reuse() {
    let auth = wire();
    let response = register_alice(&auth).await;
    let original = response.tokens.refresh_token.clone();

    let rotated = auth.refresh(&original).await.unwrap();
    assert_ne!(rotated.refresh_token, original);

    // Presenting the rotated-out token again is reuse and must fail.
    let reuse = auth.refresh(&original).await;
    assert!(matches!(reuse, Err(AuthError::TokenReuse)));

    // Reuse detection killed the whole chain, successor included.
    let successor = auth.refresh(&rotated.refresh_token).await;
    assert!(matches!(successor, Err(AuthError::TokenReuse)));
}

#[tokio::test]
async fn test_access_token_survives_chain_revocation() {
    let auth = wire();
    let response = register_alice(&auth).await;
    let original = response.tokens.refresh_token.clone();

    auth.refresh(&original).await.unwrap();
    let reuse = auth.refresh(&original).await;
    assert!(matches!(reuse, Err(AuthError::TokenReuse)));

    // Access tokens are stateless: already-issued ones validate until expiry
    // even after their refresh chain is gone.
    assert!(auth
        .validate_access_token(&response.tokens.access_token)
        .is_ok());
}

#[tokio::test]
async fn test_change_password_revokes_all_sessions() {
    let auth = wire();
    let response = register_alice(&auth).await;
    let second = auth.login("alice", "Secret123!").await.unwrap();

    auth.change_password(response.user_id, "Secret123!", "NewSecret1!")
        .await
        .unwrap();

    // Both sessions' refresh tokens are dead.
    assert!(matches!(
        auth.refresh(&response.tokens.refresh_token).await,
        Err(AuthError::TokenReuse)
    ));
    assert!(matches!(
        auth.refresh(&second.refresh_token).await,
        Err(AuthError::TokenReuse)
    ));

    // Old password no longer authenticates, new one does.
    assert!(matches!(
        auth.login("alice", "Secret123!").await,
        Err(AuthError::Authentication)
    ));
    assert!(auth.login("alice", "NewSecret1!").await.is_ok());
}

#[tokio::test]
async fn test_duplicate_register_conflicts_without_partial_write() {
    let auth = wire();
    register_alice(&auth).await;

    let result = auth
        .register(RegistrationRequest {
            username: "Alice".to_string(),
            email: "other@x.com".to_string(),
            password: "Another123!".to_string(),
        })
        .await;
    assert!(matches!(result, Err(AuthError::Conflict(_))));

    // The failed registration left nothing behind: the duplicate's password
    // never became valid for the existing account.
    let login = auth.login("alice", "Another123!").await;
    assert!(matches!(login, Err(AuthError::Authentication)));
    assert!(auth.login("alice", "Secret123!").await.is_ok());
}

#[tokio::test]
async fn test_logout_is_idempotent_and_kills_refresh() {
    let auth = wire();
    let response = register_alice(&auth).await;

    auth.logout(&response.tokens.refresh_token).await.unwrap();
    auth.logout(&response.tokens.refresh_token).await.unwrap();

    let result = auth.refresh(&response.tokens.refresh_token).await;
    assert!(matches!(result, Err(AuthError::TokenReuse)));
}

#[tokio::test]
async fn test_concurrent_refresh_has_one_winner() {
    let auth = wire();
    let response = register_alice(&auth).await;
    let token = response.tokens.refresh_token;

    let a = {
        let auth = Arc::clone(&auth);
        let token = token.clone();
        tokio::spawn(async move { auth.refresh(&token).await })
    };
    let b = {
        let auth = Arc::clone(&auth);
        let token = token.clone();
        tokio::spawn(async move { auth.refresh(&token).await })
    };

    let results = [a.await.unwrap(), b.await.unwrap()];
    let winners = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1, "exactly one concurrent refresh may succeed");
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(AuthError::TokenReuse))));
}
