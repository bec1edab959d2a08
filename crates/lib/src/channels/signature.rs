//! Webhook signature check: HMAC-SHA256 of the raw body keyed by the app secret.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying `sha256=<hex digest>`.
pub const SIGNATURE_HEADER: &str = "X-Hub-Signature-256";

/// True when `signature_header` is `sha256=<hex>` and matches the body's HMAC.
/// The digest comparison is constant-time.
pub fn verify_signature(body: &[u8], signature_header: &str, app_secret: &str) -> bool {
    let Some(hex_digest) = signature_header.trim().strip_prefix("sha256=") else {
        log::debug!("signature header without sha256= prefix");
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        log::debug!("signature header is not valid hex");
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(app_secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}
