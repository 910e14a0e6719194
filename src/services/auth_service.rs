//! Auth orchestrator: composes the credential store and token service into
//! the login/register/refresh/logout command surface the HTTP layer calls.
//!
//! Pure composition, no independent state. Downstream failures propagate
//! unchanged; this layer adds no error kinds of its own.

use crate::errors::AuthError;
use crate::models::{RefreshToken, TokenPair, User};
use crate::services::credential_store::{CredentialStore, SessionRevoker};
use crate::services::token_service::TokenService;
use crate::store::{Repository, Transactional};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
pub struct RegistrationRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistrationResponse {
    pub user_id: Uuid,
    pub username: String,
    pub email: String,
    #[serde(flatten)]
    pub tokens: TokenPair,
}

pub struct AuthService<R, S> {
    credentials: Arc<CredentialStore<R>>,
    tokens: Arc<TokenService<S, R>>,
}

impl<R, S> AuthService<R, S>
where
    R: Repository<User> + 'static,
    S: Transactional<RefreshToken> + 'static,
{
    /// Wire the orchestrator. Also registers the token service as the
    /// credential store's session revoker, closing the password-change →
    /// revoke-all loop.
    pub fn new(credentials: Arc<CredentialStore<R>>, tokens: Arc<TokenService<S, R>>) -> Self {
        credentials.set_session_revoker(Arc::clone(&tokens) as Arc<dyn SessionRevoker>);
        AuthService {
            credentials,
            tokens,
        }
    }

    /// Verify credentials, then mint a token pair.
    pub async fn login(
        &self,
        username_or_email: &str,
        password: &str,
    ) -> Result<TokenPair, AuthError> {
        let user = self.credentials.verify(username_or_email, password).await?;
        self.tokens.issue_token_pair(&user).await
    }

    /// Create the account and log it straight in.
    pub async fn register(
        &self,
        request: RegistrationRequest,
    ) -> Result<RegistrationResponse, AuthError> {
        let user = self
            .credentials
            .register(&request.username, &request.email, &request.password)
            .await?;
        let tokens = self.tokens.issue_token_pair(&user).await?;

        Ok(RegistrationResponse {
            user_id: user.user_id,
            username: user.username,
            email: user.email,
            tokens,
        })
    }

    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, AuthError> {
        self.tokens.refresh(refresh_token).await
    }

    pub async fn logout(&self, refresh_token: &str) -> Result<(), AuthError> {
        self.tokens.revoke(refresh_token).await
    }

    pub async fn change_password(
        &self,
        user_id: Uuid,
        old_password: &str,
        new_password: &str,
    ) -> Result<(), AuthError> {
        self.credentials
            .change_password(user_id, old_password, new_password)
            .await
    }

    /// Stateless access-token validation, exposed for the HTTP layer's
    /// bearer-token extraction.
    pub fn validate_access_token(
        &self,
        token: &str,
    ) -> Result<crate::models::AccessClaims, AuthError> {
        self.tokens.validate_access_token(token)
    }
}
