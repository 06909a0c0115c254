//! API error type and response mapping
//!
//! The webhook contract is narrow: 401 tells the provider the delivery
//! was not authentic, anything else that goes wrong is a 500 so the
//! provider redelivers.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use lexhub_billing::BillingError;
use thiserror::Error;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Invalid signature")]
    InvalidSignature,

    #[error("{0}")]
    Internal(String),
}

impl From<BillingError> for ApiError {
    fn from(e: BillingError) -> Self {
        match e {
            BillingError::SignatureInvalid => ApiError::InvalidSignature,
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            ApiError::InvalidSignature => StatusCode::UNAUTHORIZED,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}
