#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Lexhub Webhook API Server
//!
//! Receives signed PayPost callbacks and reconciles payment and
//! subscription state into Postgres.

mod config;
mod error;
mod routes;
mod state;

use std::net::SocketAddr;

use lexhub_shared::create_pool;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::{config::Config, routes::create_router, state::AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,lexhub_api=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Lexhub Webhook API v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = Config::from_env()?;
    tracing::info!("Configuration loaded");

    // Create database pool
    tracing::info!("Connecting to database...");
    let pool = create_pool(&config.database_url).await?;
    tracing::info!("Database pool created");

    // Run migrations (only the webhook_events audit table is ours)
    tracing::info!("Running database migrations...");
    lexhub_shared::run_migrations(&pool).await?;
    tracing::info!("Database migrations applied");

    // Create application state
    let state = AppState::new(pool, config.clone());

    // The webhook endpoint is server-to-server, authenticated by HMAC
    // signature rather than origin, so CORS is fully permissive.
    let app = create_router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    // Parse bind address
    let addr: SocketAddr = config.bind_address.parse()?;
    tracing::info!("Starting server on {}", addr);

    // Start the server
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
