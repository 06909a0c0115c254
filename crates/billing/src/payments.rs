//! Payment transaction store
//!
//! `payment_transactions` rows are created by the checkout flow; the
//! webhook only moves them between statuses. Rows are never deleted,
//! and a success/failure event for an id we have no row for is a
//! zero-row update, not an error.

use sqlx::PgConnection;

use crate::error::BillingResult;
use lexhub_shared::PaymentStatus;

pub struct PaymentStore;

impl PaymentStore {
    /// Mark the transaction matched by the provider's id as completed,
    /// refreshing the metadata snapshot. Returns the number of rows
    /// touched (0 or 1; `provider_transaction_id` is unique).
    pub async fn mark_completed(
        conn: &mut PgConnection,
        provider_transaction_id: &str,
        metadata: &serde_json::Value,
    ) -> BillingResult<u64> {
        Self::set_status(
            conn,
            provider_transaction_id,
            PaymentStatus::Completed,
            metadata,
        )
        .await
    }

    /// Mark the matched transaction as failed. Failure never revokes an
    /// entitlement granted by an earlier success, so callers do not
    /// touch the profile on this path.
    pub async fn mark_failed(
        conn: &mut PgConnection,
        provider_transaction_id: &str,
        metadata: &serde_json::Value,
    ) -> BillingResult<u64> {
        Self::set_status(
            conn,
            provider_transaction_id,
            PaymentStatus::Failed,
            metadata,
        )
        .await
    }

    async fn set_status(
        conn: &mut PgConnection,
        provider_transaction_id: &str,
        status: PaymentStatus,
        metadata: &serde_json::Value,
    ) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE payment_transactions
            SET status = $2, metadata = $3, updated_at = NOW()
            WHERE provider_transaction_id = $1
            "#,
        )
        .bind(provider_transaction_id)
        .bind(status.as_str())
        .bind(metadata)
        .execute(conn)
        .await?;

        Ok(result.rows_affected())
    }
}
