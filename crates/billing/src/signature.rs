//! Webhook signature verification
//!
//! PayPost signs each delivery with HMAC-SHA256 over the raw request
//! body and sends the hex digest as `sha256=<hex>` in either
//! `x-paypost-signature` or `x-gp-signature` (the gateway's legacy
//! header name).

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::{BillingError, BillingResult};

type HmacSha256 = Hmac<Sha256>;

/// Header names the provider may use for the signature, in the order
/// we check them.
pub const SIGNATURE_HEADERS: [&str; 2] = ["x-paypost-signature", "x-gp-signature"];

const SIGNATURE_PREFIX: &str = "sha256=";

/// Verify a signature header value against the raw (unparsed) body.
///
/// The comparison is constant-time over the hex digests. Callers decide
/// what to do when no header was sent at all; this function only judges
/// a header that is present.
pub fn verify_signature(payload: &[u8], header_value: &str, secret: &str) -> BillingResult<()> {
    let received = header_value
        .strip_prefix(SIGNATURE_PREFIX)
        .unwrap_or(header_value);

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::Internal("invalid webhook secret key".to_string()))?;
    mac.update(payload);
    let expected = hex::encode(mac.finalize().into_bytes());

    if expected.as_bytes().ct_eq(received.as_bytes()).into() {
        Ok(())
    } else {
        tracing::warn!(
            payload_len = payload.len(),
            "Webhook signature mismatch"
        );
        Err(BillingError::SignatureInvalid)
    }
}

/// Compute the signature header value for a body, as the provider would.
/// Used by tests and by operators replaying captured deliveries.
pub fn sign_payload(payload: &[u8], secret: &str) -> BillingResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::Internal("invalid webhook secret key".to_string()))?;
    mac.update(payload);
    Ok(format!(
        "{SIGNATURE_PREFIX}{}",
        hex::encode(mac.finalize().into_bytes())
    ))
}
