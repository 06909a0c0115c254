//! Subscription store and entitlement projection
//!
//! `user_subscriptions` is keyed externally by the provider's
//! subscription id; both `created` and `updated` events land here as
//! upserts so redelivery and out-of-order delivery cannot trip the
//! uniqueness constraint. `profiles.subscription_tier/status` is a
//! derived projection, only ever written as a side effect of these
//! events and never treated as a source of truth.

use sqlx::PgConnection;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::events::SubscriptionData;
use lexhub_shared::{SubscriptionStatus, FREE_TIER};

/// Provider name stored alongside each subscription row.
pub const PROVIDER: &str = "paypost";

pub struct SubscriptionStore;

impl SubscriptionStore {
    /// Insert or update the subscription row for a provider
    /// subscription id. Tier and period fields absent from the event
    /// keep their stored values on conflict; `cancel_at_period_end` is
    /// always written from the event, falling back to false when the
    /// event omits it, on insert and conflict alike.
    pub async fn upsert(
        conn: &mut PgConnection,
        user_id: &str,
        data: &SubscriptionData,
        raw_payload: &serde_json::Value,
    ) -> BillingResult<()> {
        let status = data
            .status
            .as_deref()
            .map(SubscriptionStatus::parse)
            .unwrap_or(SubscriptionStatus::Active);

        sqlx::query(
            r#"
            INSERT INTO user_subscriptions (
                id, user_id, provider, provider_subscription_id, tier, status,
                current_period_start, current_period_end, cancel_at_period_end,
                metadata, created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, COALESCE($9, FALSE), $10, NOW(), NOW()
            )
            ON CONFLICT (provider_subscription_id) DO UPDATE SET
                status = EXCLUDED.status,
                tier = COALESCE(EXCLUDED.tier, user_subscriptions.tier),
                current_period_start = COALESCE(EXCLUDED.current_period_start,
                                                user_subscriptions.current_period_start),
                current_period_end = COALESCE(EXCLUDED.current_period_end,
                                              user_subscriptions.current_period_end),
                cancel_at_period_end = COALESCE($9, FALSE),
                metadata = EXCLUDED.metadata,
                updated_at = NOW()
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(PROVIDER)
        .bind(&data.id)
        .bind(data.metadata.tier.as_deref())
        .bind(status.as_str())
        .bind(data.period_start()?)
        .bind(data.period_end()?)
        .bind(data.cancel_at_period_end)
        .bind(raw_payload)
        .execute(conn)
        .await?;

        Ok(())
    }

    /// Update-only fallback for `updated` events with no `user_id` in
    /// metadata: without a user we cannot create the row, so an event
    /// arriving ahead of its `created` counterpart affects zero rows.
    /// Returns the number of rows touched so the caller can log that.
    pub async fn update_existing(
        conn: &mut PgConnection,
        data: &SubscriptionData,
        raw_payload: &serde_json::Value,
    ) -> BillingResult<u64> {
        let status = data
            .status
            .as_deref()
            .map(SubscriptionStatus::parse)
            .unwrap_or(SubscriptionStatus::Active);

        let result = sqlx::query(
            r#"
            UPDATE user_subscriptions
            SET status = $2,
                current_period_start = COALESCE($3, current_period_start),
                current_period_end = COALESCE($4, current_period_end),
                cancel_at_period_end = COALESCE($5, FALSE),
                metadata = $6,
                updated_at = NOW()
            WHERE provider_subscription_id = $1
            "#,
        )
        .bind(&data.id)
        .bind(status.as_str())
        .bind(data.period_start()?)
        .bind(data.period_end()?)
        .bind(data.cancel_at_period_end)
        .bind(raw_payload)
        .execute(conn)
        .await?;

        Ok(result.rows_affected())
    }

    /// Mark the matched subscription canceled and hand back its
    /// `user_id`. Cancellation events may omit `user_id` in metadata,
    /// so the downgrade path correlates through the row itself.
    pub async fn mark_canceled(
        conn: &mut PgConnection,
        provider_subscription_id: &str,
    ) -> BillingResult<Option<String>> {
        let user_id: Option<(String,)> = sqlx::query_as(
            r#"
            UPDATE user_subscriptions
            SET status = $2, updated_at = NOW()
            WHERE provider_subscription_id = $1
            RETURNING user_id
            "#,
        )
        .bind(provider_subscription_id)
        .bind(SubscriptionStatus::Canceled.as_str())
        .fetch_optional(conn)
        .await?;

        Ok(user_id.map(|(id,)| id))
    }

    /// Write the entitlement projection. A `None` tier leaves the
    /// stored tier alone (payment events without a tier in metadata
    /// still flip the status to active).
    pub async fn set_profile_entitlement(
        conn: &mut PgConnection,
        user_id: &str,
        tier: Option<&str>,
        status: SubscriptionStatus,
    ) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE profiles
            SET subscription_tier = COALESCE($2, subscription_tier),
                subscription_status = $3,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .bind(tier)
        .bind(status.as_str())
        .execute(conn)
        .await?;

        Ok(result.rows_affected())
    }

    /// Downgrade a profile after cancellation: tier back to free,
    /// status canceled, whatever tier was active before.
    pub async fn downgrade_profile(
        conn: &mut PgConnection,
        user_id: &str,
    ) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE profiles
            SET subscription_tier = $2, subscription_status = $3, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .bind(FREE_TIER)
        .bind(SubscriptionStatus::Canceled.as_str())
        .execute(conn)
        .await?;

        Ok(result.rows_affected())
    }
}
