//! Route registration

pub mod webhooks;

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};

use lexhub_billing::{InvariantCheckSummary, InvariantChecker};

use crate::{error::ApiResult, state::AppState};

pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Single webhook route; also mounted at the root because the
        // provider dashboard was originally pointed at "/".
        .route("/", post(webhooks::handle_paypost_webhook))
        .route(
            "/webhooks/paypost",
            post(webhooks::handle_paypost_webhook),
        )
        .route("/health", get(health))
        .route("/ops/invariants", get(run_invariants))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Run the read-only consistency checks. Operators hit this after a
/// webhook replay to confirm the store converged.
async fn run_invariants(
    State(state): State<AppState>,
) -> ApiResult<Json<InvariantCheckSummary>> {
    let summary = InvariantChecker::new(state.pool.clone())
        .run_all_checks()
        .await?;

    if !summary.healthy {
        tracing::warn!(
            violations = summary.violations.len(),
            "Billing invariant check found violations"
        );
    }

    Ok(Json(summary))
}
