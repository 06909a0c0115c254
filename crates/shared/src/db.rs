//! Database pool construction

use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

/// Create the shared Postgres connection pool.
///
/// Connections are acquired lazily on first use, so startup does not
/// block on the database being reachable.
pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(10))
        .connect_lazy(database_url)?;

    tracing::info!(max_connections = 10, "Database pool configured");

    Ok(pool)
}

/// Apply this service's own migrations (the webhook_events audit
/// table). The application tables the webhook reconciles into belong
/// to the main schema and are never migrated from here.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
