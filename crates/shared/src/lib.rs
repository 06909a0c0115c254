#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Shared infrastructure for the lexhub billing service.
//!
//! Holds the pieces both the billing library and the API server need:
//! Postgres pool construction and the status enums bound into SQL.

pub mod db;
pub mod types;

pub use db::{create_pool, run_migrations};
pub use types::{PaymentStatus, SubscriptionStatus};

/// Tier a user's profile falls back to when their subscription ends.
pub const FREE_TIER: &str = "free";
