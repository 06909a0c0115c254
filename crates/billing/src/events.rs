//! PayPost event envelope types
//!
//! The provider posts `{ "type": ..., "id": ..., "data": { ... } }` with
//! a data shape that depends on the event type. Handled types form a
//! closed set; everything else lands in [`EventKind::Unrecognized`] and
//! is acknowledged without processing. Payloads are narrowed into typed
//! structs before any handler touches a field.

use serde::Deserialize;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};

/// Raw event envelope as delivered by PayPost.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub id: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl WebhookEvent {
    /// Parse the verified raw body. Any JSON failure here fails the
    /// whole request; no partial processing happens on malformed input.
    pub fn from_slice(payload: &[u8]) -> BillingResult<Self> {
        let event: WebhookEvent = serde_json::from_slice(payload)?;
        if event.id.is_empty() {
            return Err(BillingError::MalformedPayload(
                "event id is empty".to_string(),
            ));
        }
        Ok(event)
    }

    pub fn kind(&self) -> EventKind {
        EventKind::from_type(&self.event_type)
    }

    /// Narrow `data` into a payment payload.
    pub fn payment_data(&self) -> BillingResult<PaymentData> {
        serde_json::from_value(self.data.clone()).map_err(|e| BillingError::UnexpectedPayload {
            event_type: self.event_type.clone(),
            reason: e.to_string(),
        })
    }

    /// Narrow `data` into a subscription payload.
    pub fn subscription_data(&self) -> BillingResult<SubscriptionData> {
        serde_json::from_value(self.data.clone()).map_err(|e| BillingError::UnexpectedPayload {
            event_type: self.event_type.clone(),
            reason: e.to_string(),
        })
    }
}

/// The event types this service handles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    PaymentSucceeded,
    PaymentFailed,
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionCanceled,
    /// Anything else; acknowledged with 200 and never processed, so the
    /// provider does not retry-storm us over types we ignore on purpose.
    Unrecognized(String),
}

impl EventKind {
    pub fn from_type(event_type: &str) -> Self {
        match event_type {
            "payment.succeeded" => EventKind::PaymentSucceeded,
            "payment.failed" => EventKind::PaymentFailed,
            "subscription.created" => EventKind::SubscriptionCreated,
            "subscription.updated" => EventKind::SubscriptionUpdated,
            "subscription.canceled" => EventKind::SubscriptionCanceled,
            other => EventKind::Unrecognized(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            EventKind::PaymentSucceeded => "payment.succeeded",
            EventKind::PaymentFailed => "payment.failed",
            EventKind::SubscriptionCreated => "subscription.created",
            EventKind::SubscriptionUpdated => "subscription.updated",
            EventKind::SubscriptionCanceled => "subscription.canceled",
            EventKind::Unrecognized(s) => s.as_str(),
        }
    }
}

/// Correlation metadata attached by our checkout flow when it created
/// the provider object. Cancellation events may omit it entirely.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventMetadata {
    pub user_id: Option<String>,
    pub tier: Option<String>,
}

/// `data` for `payment.succeeded` / `payment.failed`.
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentData {
    /// Provider transaction id ("pay_...").
    pub id: String,
    #[serde(default)]
    pub metadata: EventMetadata,
}

/// `data` for the three subscription event types.
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionData {
    /// Provider subscription id ("sub_...").
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
    /// Unix seconds.
    #[serde(default)]
    pub current_period_start: Option<i64>,
    /// Unix seconds.
    #[serde(default)]
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub cancel_at_period_end: Option<bool>,
    #[serde(default)]
    pub metadata: EventMetadata,
}

impl SubscriptionData {
    pub fn period_start(&self) -> BillingResult<Option<OffsetDateTime>> {
        convert_unix(self.current_period_start, "current_period_start")
    }

    pub fn period_end(&self) -> BillingResult<Option<OffsetDateTime>> {
        convert_unix(self.current_period_end, "current_period_end")
    }
}

fn convert_unix(ts: Option<i64>, field: &str) -> BillingResult<Option<OffsetDateTime>> {
    match ts {
        None => Ok(None),
        Some(ts) => OffsetDateTime::from_unix_timestamp(ts)
            .map(Some)
            .map_err(|_| {
                BillingError::MalformedPayload(format!("{field} out of range: {ts}"))
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classifies_handled_types() {
        assert_eq!(
            EventKind::from_type("payment.succeeded"),
            EventKind::PaymentSucceeded
        );
        assert_eq!(
            EventKind::from_type("subscription.canceled"),
            EventKind::SubscriptionCanceled
        );
        assert_eq!(
            EventKind::from_type("charge.disputed"),
            EventKind::Unrecognized("charge.disputed".to_string())
        );
    }

    #[test]
    fn test_parses_example_payment_event() {
        // The canonical example: payment success carrying user + tier.
        let body = br#"{"type":"payment.succeeded","id":"evt_1",
            "data":{"id":"pay_1","metadata":{"user_id":"u1","tier":"pro"}}}"#;
        let event = WebhookEvent::from_slice(body).unwrap();
        assert_eq!(event.kind(), EventKind::PaymentSucceeded);
        assert_eq!(event.id, "evt_1");

        let data = event.payment_data().unwrap();
        assert_eq!(data.id, "pay_1");
        assert_eq!(data.metadata.user_id.as_deref(), Some("u1"));
        assert_eq!(data.metadata.tier.as_deref(), Some("pro"));
    }

    #[test]
    fn test_metadata_fields_are_optional() {
        let body = br#"{"type":"subscription.canceled","id":"evt_2",
            "data":{"id":"sub_9"}}"#;
        let event = WebhookEvent::from_slice(body).unwrap();
        let data = event.subscription_data().unwrap();
        assert_eq!(data.id, "sub_9");
        assert!(data.metadata.user_id.is_none());
        assert!(data.cancel_at_period_end.is_none());
    }

    #[test]
    fn test_subscription_period_conversion() {
        let body = br#"{"type":"subscription.updated","id":"evt_3",
            "data":{"id":"sub_1","status":"active",
                    "current_period_start":1735689600,
                    "current_period_end":1738368000,
                    "cancel_at_period_end":true,
                    "metadata":{"user_id":"u1"}}}"#;
        let event = WebhookEvent::from_slice(body).unwrap();
        let data = event.subscription_data().unwrap();
        let start = data.period_start().unwrap().unwrap();
        let end = data.period_end().unwrap().unwrap();
        assert!(end > start);
        assert_eq!(data.cancel_at_period_end, Some(true));
    }

    #[test]
    fn test_out_of_range_period_is_malformed() {
        let data = SubscriptionData {
            id: "sub_1".to_string(),
            status: None,
            current_period_start: Some(i64::MAX),
            current_period_end: None,
            cancel_at_period_end: None,
            metadata: EventMetadata::default(),
        };
        assert!(matches!(
            data.period_start(),
            Err(BillingError::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_malformed_json_is_rejected() {
        assert!(WebhookEvent::from_slice(b"{not json").is_err());
        assert!(WebhookEvent::from_slice(b"[]").is_err());
    }

    #[test]
    fn test_empty_event_id_is_rejected() {
        let body = br#"{"type":"payment.succeeded","id":"","data":{}}"#;
        assert!(matches!(
            WebhookEvent::from_slice(body),
            Err(BillingError::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_wrong_payload_shape_for_type() {
        // A payment handler narrowing a payload with no transaction id.
        let body = br#"{"type":"payment.succeeded","id":"evt_4","data":{"amount":100}}"#;
        let event = WebhookEvent::from_slice(body).unwrap();
        assert!(matches!(
            event.payment_data(),
            Err(BillingError::UnexpectedPayload { .. })
        ));
    }
}
