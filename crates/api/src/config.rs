//! Server configuration from environment variables

use anyhow::Context;

#[derive(Debug, Clone)]
pub struct Config {
    /// Admin-privileged Postgres connection string.
    pub database_url: String,
    /// Address to bind the HTTP listener to.
    pub bind_address: String,
    /// Shared secret PayPost signs webhook bodies with.
    pub webhook_secret: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url =
            std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;

        let bind_address =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

        let webhook_secret = std::env::var("PAYPOST_WEBHOOK_SECRET").unwrap_or_default();
        if webhook_secret.is_empty() {
            tracing::warn!(
                "PAYPOST_WEBHOOK_SECRET not set - signed deliveries will be rejected"
            );
        }

        Ok(Self {
            database_url,
            bind_address,
            webhook_secret,
        })
    }
}
