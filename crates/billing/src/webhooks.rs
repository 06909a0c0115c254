//! PayPost webhook processing
//!
//! One verified event per call: classify, claim, apply. The claim on
//! `webhook_events` is an atomic INSERT...ON CONFLICT...RETURNING so
//! only one concurrent delivery of a given provider event id can hold
//! processing rights; events stuck in `processing` past the timeout and
//! events whose last attempt ended in `error` can be re-claimed, so a
//! provider redelivery after a 500 gets a fresh attempt. Each handler
//! branch runs inside a single database
//! transaction behind a per-correlation-key advisory lock, so two
//! deliveries for the same transaction or subscription id serialize
//! instead of interleaving.

use sqlx::{PgConnection, PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::events::{EventKind, WebhookEvent};
use crate::payments::PaymentStore;
use crate::subscriptions::SubscriptionStore;
use lexhub_shared::SubscriptionStatus;

/// How long a claim may sit in `processing` before another delivery is
/// allowed to take it over.
const PROCESSING_TIMEOUT_MINUTES: i32 = 30;

/// Webhook handler for PayPost events
pub struct WebhookHandler {
    pool: PgPool,
}

impl WebhookHandler {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Handle a verified event.
    ///
    /// Unrecognized types are acknowledged without touching the
    /// database at all. Recognized types are claimed first; a duplicate
    /// delivery (already processed, or in flight on another instance)
    /// is acknowledged as a no-op. Errors from a handler branch
    /// propagate so the caller answers 500 and the provider redelivers.
    pub async fn handle_event(&self, event: WebhookEvent) -> BillingResult<()> {
        let kind = event.kind();

        if let EventKind::Unrecognized(ref event_type) = kind {
            tracing::info!(
                event_type = %event_type,
                event_id = %event.id,
                "Received unhandled PayPost event type - no handler configured"
            );
            return Ok(());
        }

        if !self.claim_event(&event, &kind).await? {
            return Ok(());
        }

        tracing::info!(
            event_type = %kind.as_str(),
            event_id = %event.id,
            "Processing PayPost webhook event (claimed exclusive processing rights)"
        );

        let result = self.process_event(&event, &kind).await;

        let (processing_result, error_message) = match &result {
            Ok(()) => ("success", None),
            Err(e) => ("error", Some(e.to_string())),
        };
        self.record_result(&event.id, processing_result, error_message.as_deref())
            .await;

        result
    }

    /// Atomically claim the event for processing. Returns false when
    /// another delivery already holds or finished it.
    ///
    /// Two kinds of existing rows can be re-claimed: rows stuck in
    /// `processing` past the timeout (a handler died mid-flight), and
    /// rows in `error` (the previous attempt failed, we answered 500,
    /// and this delivery is the provider's retry). Errored rows are
    /// taken over immediately; the retry is the whole recovery path.
    async fn claim_event(&self, event: &WebhookEvent, kind: &EventKind) -> BillingResult<bool> {
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO webhook_events
                (provider_event_id, event_type, event_timestamp, processing_result, processing_started_at)
            VALUES ($1, $2, NOW(), 'processing', NOW())
            ON CONFLICT (provider_event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW(),
                error_message = NULL
            WHERE webhook_events.processing_result = 'error'
               OR (webhook_events.processing_result = 'processing'
                   AND webhook_events.processing_started_at < NOW() - make_interval(mins => $3))
            RETURNING id
            "#,
        )
        .bind(&event.id)
        .bind(kind.as_str())
        .bind(PROCESSING_TIMEOUT_MINUTES)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(
                event_id = %event.id,
                error = %e,
                "Failed to claim webhook event for processing"
            );
            BillingError::Database(e.to_string())
        })?;

        if claimed.is_some() {
            return Ok(true);
        }

        let existing_status: Option<(String,)> = sqlx::query_as(
            "SELECT processing_result FROM webhook_events WHERE provider_event_id = $1",
        )
        .bind(&event.id)
        .fetch_optional(&self.pool)
        .await
        .ok()
        .flatten();

        let reason = match existing_status {
            Some((status,)) if status == "success" => "already processed successfully",
            Some((status,)) if status == "processing" => {
                "currently being processed by another instance"
            }
            Some(_) => "exists with another status",
            None => "unknown (race condition?)",
        };

        tracing::info!(
            event_id = %event.id,
            event_type = %kind.as_str(),
            reason = %reason,
            "Duplicate webhook event - atomic idempotency check"
        );

        Ok(false)
    }

    /// Record the processing outcome on the claim row. This is the
    /// idempotency/audit record, so a failed update is retried once and
    /// then escalated in the log rather than failing the webhook.
    async fn record_result(&self, event_id: &str, result: &str, error_message: Option<&str>) {
        for attempt in 0..2u8 {
            match sqlx::query(
                r#"
                UPDATE webhook_events
                SET processing_result = $1, error_message = $2
                WHERE provider_event_id = $3
                "#,
            )
            .bind(result)
            .bind(error_message)
            .bind(event_id)
            .execute(&self.pool)
            .await
            {
                Ok(_) => return,
                Err(e) if attempt == 0 => {
                    tracing::warn!(
                        event_id = %event_id,
                        error = %e,
                        "First attempt to update webhook event record failed, retrying..."
                    );
                }
                Err(e) => {
                    tracing::error!(
                        event_id = %event_id,
                        processing_result = %result,
                        error_message = ?error_message,
                        error = %e,
                        "CRITICAL: Failed to update webhook audit record after retry. \
                         Event may appear stuck in 'processing' state. \
                         Manual intervention may be required."
                    );
                }
            }
        }
    }

    /// Run the handler branch for a claimed event inside one
    /// transaction. A crash or error between the entity write and the
    /// profile write rolls both back.
    async fn process_event(&self, event: &WebhookEvent, kind: &EventKind) -> BillingResult<()> {
        let mut tx = self.pool.begin().await?;

        match kind {
            EventKind::PaymentSucceeded => self.handle_payment_succeeded(&mut tx, event).await?,
            EventKind::PaymentFailed => self.handle_payment_failed(&mut tx, event).await?,
            EventKind::SubscriptionCreated => {
                self.handle_subscription_created(&mut tx, event).await?
            }
            EventKind::SubscriptionUpdated => {
                self.handle_subscription_updated(&mut tx, event).await?
            }
            EventKind::SubscriptionCanceled => {
                self.handle_subscription_canceled(&mut tx, event).await?
            }
            EventKind::Unrecognized(_) => {}
        }

        tx.commit().await?;
        Ok(())
    }

    async fn handle_payment_succeeded(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &WebhookEvent,
    ) -> BillingResult<()> {
        let data = event.payment_data()?;

        let Some(user_id) = data.metadata.user_id.as_deref() else {
            // A payment not tied to a known user cannot be reconciled.
            tracing::warn!(
                event_id = %event.id,
                transaction_id = %data.id,
                "payment.succeeded without user_id in metadata - skipping"
            );
            return Ok(());
        };

        lock_correlation_key(&mut *tx, &data.id).await?;

        let updated = PaymentStore::mark_completed(&mut *tx, &data.id, &event.data).await?;
        if updated == 0 {
            // The checkout flow owns row creation; nothing to complete.
            tracing::warn!(
                event_id = %event.id,
                transaction_id = %data.id,
                "payment.succeeded for unknown transaction id - no row updated"
            );
        }

        if data.metadata.tier.is_some() {
            SubscriptionStore::set_profile_entitlement(
                &mut *tx,
                user_id,
                data.metadata.tier.as_deref(),
                SubscriptionStatus::Active,
            )
            .await?;
        }

        tracing::info!(
            user_id = %user_id,
            transaction_id = %data.id,
            tier = ?data.metadata.tier,
            "Payment succeeded"
        );

        Ok(())
    }

    async fn handle_payment_failed(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &WebhookEvent,
    ) -> BillingResult<()> {
        let data = event.payment_data()?;

        lock_correlation_key(&mut *tx, &data.id).await?;

        // Failure does not revoke an entitlement granted by an earlier
        // success; only the transaction row changes.
        PaymentStore::mark_failed(&mut *tx, &data.id, &event.data).await?;

        tracing::warn!(
            event_id = %event.id,
            transaction_id = %data.id,
            "Payment failed"
        );

        Ok(())
    }

    async fn handle_subscription_created(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &WebhookEvent,
    ) -> BillingResult<()> {
        let data = event.subscription_data()?;

        let Some(user_id) = data.metadata.user_id.as_deref() else {
            tracing::warn!(
                event_id = %event.id,
                subscription_id = %data.id,
                "subscription.created without user_id in metadata - skipping"
            );
            return Ok(());
        };

        lock_correlation_key(&mut *tx, &data.id).await?;

        SubscriptionStore::upsert(&mut *tx, user_id, &data, &event.data).await?;
        SubscriptionStore::set_profile_entitlement(
            &mut *tx,
            user_id,
            data.metadata.tier.as_deref(),
            SubscriptionStatus::Active,
        )
        .await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %data.id,
            tier = ?data.metadata.tier,
            "Subscription created"
        );

        Ok(())
    }

    async fn handle_subscription_updated(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &WebhookEvent,
    ) -> BillingResult<()> {
        let data = event.subscription_data()?;

        lock_correlation_key(&mut *tx, &data.id).await?;

        // With a user id we can upsert, so an `updated` arriving ahead
        // of its `created` still lands. Without one we can only update
        // an existing row.
        if let Some(user_id) = data.metadata.user_id.as_deref() {
            SubscriptionStore::upsert(&mut *tx, user_id, &data, &event.data).await?;
        } else {
            let updated = SubscriptionStore::update_existing(&mut *tx, &data, &event.data).await?;
            if updated == 0 {
                tracing::warn!(
                    event_id = %event.id,
                    subscription_id = %data.id,
                    "subscription.updated for unknown subscription id and no user_id - dropped"
                );
            }
        }

        tracing::info!(
            subscription_id = %data.id,
            status = ?data.status,
            cancel_at_period_end = ?data.cancel_at_period_end,
            "Subscription updated"
        );

        Ok(())
    }

    async fn handle_subscription_canceled(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &WebhookEvent,
    ) -> BillingResult<()> {
        let data = event.subscription_data()?;

        lock_correlation_key(&mut *tx, &data.id).await?;

        // Cancellation events may omit user_id in metadata, so the
        // downgrade correlates through the subscription row itself.
        match SubscriptionStore::mark_canceled(&mut *tx, &data.id).await? {
            Some(user_id) => {
                SubscriptionStore::downgrade_profile(&mut *tx, &user_id).await?;
                tracing::info!(
                    user_id = %user_id,
                    subscription_id = %data.id,
                    "Subscription canceled, profile downgraded to free tier"
                );
            }
            None => {
                tracing::warn!(
                    event_id = %event.id,
                    subscription_id = %data.id,
                    "subscription.canceled for unknown subscription id - skipping"
                );
            }
        }

        Ok(())
    }
}

/// Serialize concurrent deliveries for the same provider object. The
/// lock is transaction-scoped and released automatically on
/// commit/rollback.
async fn lock_correlation_key(conn: &mut PgConnection, key: &str) -> BillingResult<()> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
        .bind(key)
        .execute(conn)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;

    #[test]
    fn test_handled_event_types() {
        let handled = [
            "payment.succeeded",
            "payment.failed",
            "subscription.created",
            "subscription.updated",
            "subscription.canceled",
        ];
        for event_type in handled {
            assert!(
                !matches!(
                    EventKind::from_type(event_type),
                    EventKind::Unrecognized(_)
                ),
                "{event_type} should be handled"
            );
            assert_eq!(EventKind::from_type(event_type).as_str(), event_type);
        }
    }

    #[test]
    fn test_unrecognized_types_are_catch_all() {
        for event_type in ["invoice.paid", "customer.created", ""] {
            assert!(matches!(
                EventKind::from_type(event_type),
                EventKind::Unrecognized(_)
            ));
        }
    }

    #[tokio::test]
    async fn test_unrecognized_event_never_touches_database() {
        // connect_lazy never opens a connection; any query through this
        // pool would fail, so an Ok here proves the no-write path.
        let pool = PgPool::connect_lazy("postgres://localhost/unused").unwrap();
        let handler = WebhookHandler::new(pool);

        let event = WebhookEvent::from_slice(
            br#"{"type":"invoice.finalized","id":"evt_x","data":{}}"#,
        )
        .unwrap();

        handler.handle_event(event).await.unwrap();
    }
}

#[cfg(test)]
mod db_tests {
    use super::*;

    /// Tables owned by the signup and checkout flows. The migrations
    /// only create `webhook_events`, so tests that exercise full branch
    /// behavior set these up themselves.
    async fn create_app_tables(pool: &PgPool) -> sqlx::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE profiles (
                id TEXT PRIMARY KEY,
                subscription_tier TEXT NOT NULL DEFAULT 'free',
                subscription_status TEXT NOT NULL DEFAULT 'inactive',
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE payment_transactions (
                id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                provider_transaction_id TEXT NOT NULL UNIQUE,
                status TEXT NOT NULL DEFAULT 'pending',
                metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(pool)
        .await?;

        create_subscriptions_table(pool).await
    }

    async fn create_subscriptions_table(pool: &PgPool) -> sqlx::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE user_subscriptions (
                id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                user_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                provider_subscription_id TEXT NOT NULL UNIQUE,
                tier TEXT,
                status TEXT NOT NULL,
                current_period_start TIMESTAMPTZ,
                current_period_end TIMESTAMPTZ,
                cancel_at_period_end BOOLEAN NOT NULL DEFAULT FALSE,
                metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(pool)
        .await
        .map(|_| ())
    }

    async fn webhook_event_result(pool: &PgPool, event_id: &str) -> String {
        let (result,): (String,) = sqlx::query_as(
            "SELECT processing_result FROM webhook_events WHERE provider_event_id = $1",
        )
        .bind(event_id)
        .fetch_one(pool)
        .await
        .unwrap();
        result
    }

    #[sqlx::test(migrations = "../shared/migrations")]
    async fn test_replayed_payment_succeeded_applies_once(pool: PgPool) {
        create_app_tables(&pool).await.unwrap();
        sqlx::query("INSERT INTO profiles (id) VALUES ('u1')")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO payment_transactions (provider_transaction_id) VALUES ('pay_1')")
            .execute(&pool)
            .await
            .unwrap();

        let handler = WebhookHandler::new(pool.clone());
        let event = WebhookEvent::from_slice(
            br#"{"type":"payment.succeeded","id":"evt_1","data":{"id":"pay_1","metadata":{"user_id":"u1","tier":"pro"}}}"#,
        )
        .unwrap();

        handler.handle_event(event.clone()).await.unwrap();
        // Identical redelivery after success is acknowledged as a no-op.
        handler.handle_event(event).await.unwrap();

        let (status, count): (String, i64) = sqlx::query_as(
            r#"
            SELECT status, (SELECT COUNT(*) FROM payment_transactions)
            FROM payment_transactions WHERE provider_transaction_id = 'pay_1'
            "#,
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(status, "completed");
        assert_eq!(count, 1);

        let (tier, sub_status): (String, String) = sqlx::query_as(
            "SELECT subscription_tier, subscription_status FROM profiles WHERE id = 'u1'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(tier, "pro");
        assert_eq!(sub_status, "active");

        assert_eq!(webhook_event_result(&pool, "evt_1").await, "success");
    }

    #[sqlx::test(migrations = "../shared/migrations")]
    async fn test_canceled_subscription_downgrades_profile(pool: PgPool) {
        create_app_tables(&pool).await.unwrap();
        sqlx::query("INSERT INTO profiles (id) VALUES ('u2')")
            .execute(&pool)
            .await
            .unwrap();

        let handler = WebhookHandler::new(pool.clone());
        let created = WebhookEvent::from_slice(
            br#"{"type":"subscription.created","id":"evt_c1","data":{"id":"sub_1","status":"active","metadata":{"user_id":"u2","tier":"firm"}}}"#,
        )
        .unwrap();
        handler.handle_event(created).await.unwrap();

        let canceled = WebhookEvent::from_slice(
            br#"{"type":"subscription.canceled","id":"evt_c2","data":{"id":"sub_1","status":"canceled","metadata":{}}}"#,
        )
        .unwrap();
        handler.handle_event(canceled).await.unwrap();

        let (sub_status,): (String,) = sqlx::query_as(
            "SELECT status FROM user_subscriptions WHERE provider_subscription_id = 'sub_1'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(sub_status, "canceled");

        let (tier, profile_status): (String, String) = sqlx::query_as(
            "SELECT subscription_tier, subscription_status FROM profiles WHERE id = 'u2'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(tier, "free");
        assert_eq!(profile_status, "canceled");
    }

    #[sqlx::test(migrations = "../shared/migrations")]
    async fn test_errored_event_reprocessed_on_redelivery(pool: PgPool) {
        // Only profiles exists, so the first attempt fails partway with
        // a database error and the claim row records 'error'.
        sqlx::query(
            r#"
            CREATE TABLE profiles (
                id TEXT PRIMARY KEY,
                subscription_tier TEXT NOT NULL DEFAULT 'free',
                subscription_status TEXT NOT NULL DEFAULT 'inactive',
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query("INSERT INTO profiles (id) VALUES ('u3')")
            .execute(&pool)
            .await
            .unwrap();

        let handler = WebhookHandler::new(pool.clone());
        let event = WebhookEvent::from_slice(
            br#"{"type":"subscription.created","id":"evt_r1","data":{"id":"sub_9","status":"active","metadata":{"user_id":"u3","tier":"pro"}}}"#,
        )
        .unwrap();

        handler.handle_event(event.clone()).await.unwrap_err();
        assert_eq!(webhook_event_result(&pool, "evt_r1").await, "error");

        // The outage clears and the provider redelivers the same event;
        // the errored claim must be taken over, not treated as a dupe.
        create_subscriptions_table(&pool).await.unwrap();
        handler.handle_event(event).await.unwrap();

        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM user_subscriptions WHERE provider_subscription_id = 'sub_9'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(count, 1);
        assert_eq!(webhook_event_result(&pool, "evt_r1").await, "success");

        let (tier,): (String,) =
            sqlx::query_as("SELECT subscription_tier FROM profiles WHERE id = 'u3'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(tier, "pro");
    }
}
