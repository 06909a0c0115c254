#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Lexhub Billing Module
//!
//! Handles PayPost webhook-driven reconciliation of payment and
//! subscription state.
//!
//! ## Features
//!
//! - **Signature Verification**: HMAC-SHA256 over the raw request body
//! - **Event Dispatch**: Closed set of handled PayPost event types with
//!   a catch-all for types we intentionally ignore
//! - **Idempotent Processing**: Atomic per-event claims plus upserts
//!   keyed on the provider's external ids, safe under at-least-once
//!   delivery
//! - **Entitlement Projection**: Keeps `profiles.subscription_tier` /
//!   `subscription_status` in step with the latest subscription event
//! - **Invariants**: Runnable read-only consistency checks

pub mod error;
pub mod events;
pub mod invariants;
pub mod payments;
pub mod signature;
pub mod subscriptions;
pub mod webhooks;

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{EventKind, EventMetadata, PaymentData, SubscriptionData, WebhookEvent};

// Signature
pub use signature::verify_signature;

// Stores
pub use payments::PaymentStore;
pub use subscriptions::SubscriptionStore;

// Webhooks
pub use webhooks::WebhookHandler;

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};
