//! Application state

use sqlx::PgPool;
use std::sync::Arc;

use lexhub_billing::WebhookHandler;

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub webhooks: Arc<WebhookHandler>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> Self {
        let webhooks = Arc::new(WebhookHandler::new(pool.clone()));
        Self {
            pool,
            config,
            webhooks,
        }
    }
}
