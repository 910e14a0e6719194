use auth_service::config::Config;
use auth_service::handlers::auth_handler::AppState;
use auth_service::routes;
use auth_service::services::auth_service::AuthService;
use auth_service::services::credential_store::{BcryptHasher, CredentialStore};
use auth_service::services::token_service::{TokenConfig, TokenService};
use auth_service::store::postgres::{PgRefreshTokenStore, PgUserStore};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "auth_service=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting auth service");

    // Fail fast: the process must not come up with invalid crypto config.
    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!("Configuration loaded");

    let db_pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await
        .map_err(|e| {
            error!("Failed to connect to database: {}", e);
            e
        })?;

    info!("Database connection established");

    // Apply pending migrations before accepting traffic.
    sqlx::migrate!("./migrations").run(&db_pool).await.map_err(|e| {
        error!("Failed to run migrations: {}", e);
        e
    })?;

    // Explicit composition root: stores, then services, then orchestrator.
    let users = PgUserStore::new(db_pool.clone());
    let tokens = PgRefreshTokenStore::new(db_pool);

    let credentials = Arc::new(CredentialStore::new(
        users.clone(),
        Arc::new(BcryptHasher::new()),
    ));
    let token_service = Arc::new(TokenService::new(
        tokens,
        users,
        &config.signing_key,
        &config.signing_key_id,
        TokenConfig::from_config(&config),
    ));
    let auth = Arc::new(AuthService::new(credentials, token_service));

    let state = Arc::new(AppState { auth });
    let app = routes::build_routes(state, &config);

    let addr: SocketAddr = config.bind_address.parse().map_err(|e| {
        error!("Invalid bind address: {}", e);
        e
    })?;

    info!("Auth service listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
