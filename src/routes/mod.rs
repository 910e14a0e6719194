//! Route wiring for the HTTP surface.

use crate::config::Config;
use crate::handlers::auth_handler::{
    handle_change_password, handle_login, handle_logout, handle_refresh, handle_register, AppState,
};
use axum::{http::HeaderValue, routing::post, Router};
use std::sync::Arc;
use std::time::Duration;
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub fn build_routes(state: Arc<AppState>, config: &Config) -> Router {
    let mut router = Router::new()
        .route("/api/v1/auth/register", post(handle_register))
        .route("/api/v1/auth/login", post(handle_login))
        .route("/api/v1/auth/refresh", post(handle_refresh))
        .route("/api/v1/auth/logout", post(handle_logout))
        .route("/api/v1/auth/password", post(handle_change_password))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .with_state(state);

    if let Some(origin) = config
        .cors_origin
        .as_deref()
        .and_then(|o| o.parse::<HeaderValue>().ok())
    {
        router = router.layer(
            CorsLayer::new()
                .allow_origin(origin)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        );
    }

    router
}
