//! Billing error types

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    /// Signature header was present but did not match the payload.
    #[error("Invalid signature")]
    SignatureInvalid,

    /// Request body was not a valid event envelope.
    #[error("Malformed webhook payload: {0}")]
    MalformedPayload(String),

    /// Handled event type carried a payload of the wrong shape.
    #[error("Unexpected payload for event type {event_type}: {reason}")]
    UnexpectedPayload {
        event_type: String,
        reason: String,
    },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(e: serde_json::Error) -> Self {
        BillingError::MalformedPayload(e.to_string())
    }
}
