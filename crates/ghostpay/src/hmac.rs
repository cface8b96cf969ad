//! Webhook payload signatures.
//!
//! Receivers recompute `HMAC-SHA256(secret, body)` over the raw request body
//! and compare it with the `X-GhostPay-Signature` header (`sha256=<hex>`).

use alloy::hex;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{GhostpayError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the payload signature.
pub const SIGNATURE_HEADER: &str = "X-GhostPay-Signature";

const SIGNATURE_PREFIX: &str = "sha256=";

fn mac_for(secret: &[u8]) -> Result<HmacSha256> {
    HmacSha256::new_from_slice(secret)
        .map_err(|e| GhostpayError::Configuration(format!("invalid webhook secret: {e}")))
}

/// Signature header value for `body`.
pub fn sign_payload(secret: &[u8], body: &[u8]) -> Result<String> {
    let mut mac = mac_for(secret)?;
    mac.update(body);
    Ok(format!(
        "{SIGNATURE_PREFIX}{}",
        hex::encode(mac.finalize().into_bytes())
    ))
}

/// Check a signature header value against `body` in constant time.
pub fn verify_payload(secret: &[u8], body: &[u8], signature: &str) -> bool {
    let Ok(mut mac) = mac_for(secret) else {
        return false;
    };
    mac.update(body);

    let digest = signature.strip_prefix(SIGNATURE_PREFIX).unwrap_or(signature);
    // Malformed hex is compared as zeros so it takes the same path as a wrong MAC.
    let expected = hex::decode(digest).unwrap_or_else(|_| vec![0u8; 32]);
    mac.verify_slice(&expected).is_ok()
}
