//! Thin HTTP glue over the auth orchestrator. All real logic lives in the
//! services layer; handlers only parse requests and map errors via
//! `AuthError::into_response`.

use crate::errors::AuthError;
use crate::models::TokenPair;
use crate::services::auth_service::{AuthService, RegistrationRequest, RegistrationResponse};
use crate::store::postgres::{PgRefreshTokenStore, PgUserStore};
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Deserialize;
use std::sync::Arc;

/// Orchestrator over the production (Postgres) stores.
pub type PgAuthService = AuthService<PgUserStore, PgRefreshTokenStore>;

#[derive(Clone)]
pub struct AppState {
    pub auth: Arc<PgAuthService>,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username_or_email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Deserialize)]
pub struct ChangePasswordRequest {
    pub old_password: String,
    pub new_password: String,
}

/// POST /api/v1/auth/register
pub async fn handle_register(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<RegistrationRequest>,
) -> Result<(StatusCode, Json<RegistrationResponse>), AuthError> {
    let response = state.auth.register(payload).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

/// POST /api/v1/auth/login
pub async fn handle_login(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<TokenPair>, AuthError> {
    let pair = state
        .auth
        .login(&payload.username_or_email, &payload.password)
        .await?;
    Ok(Json(pair))
}

/// POST /api/v1/auth/refresh
pub async fn handle_refresh(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<RefreshRequest>,
) -> Result<Json<TokenPair>, AuthError> {
    let pair = state.auth.refresh(&payload.refresh_token).await?;
    Ok(Json(pair))
}

/// POST /api/v1/auth/logout
pub async fn handle_logout(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<RefreshRequest>,
) -> Result<StatusCode, AuthError> {
    state.auth.logout(&payload.refresh_token).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/auth/password
///
/// Requires a valid bearer access token; the subject claim names the
/// account whose password changes.
pub async fn handle_change_password(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<ChangePasswordRequest>,
) -> Result<StatusCode, AuthError> {
    let token = extract_bearer_token(&headers)?;
    let claims = state.auth.validate_access_token(token)?;

    state
        .auth
        .change_password(claims.sub, &payload.old_password, &payload.new_password)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

fn extract_bearer_token(headers: &HeaderMap) -> Result<&str, AuthError> {
    headers
        .get("authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .ok_or_else(|| AuthError::TokenInvalid("missing bearer token".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_extract_bearer_token() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer abc.def.ghi"));
        assert_eq!(extract_bearer_token(&headers).ok(), Some("abc.def.ghi"));
    }

    #[test]
    fn test_extract_bearer_token_missing_or_malformed() {
        let empty = HeaderMap::new();
        assert!(extract_bearer_token(&empty).is_err());

        let mut basic = HeaderMap::new();
        basic.insert("authorization", HeaderValue::from_static("Basic dXNlcg=="));
        assert!(extract_bearer_token(&basic).is_err());
    }
}
