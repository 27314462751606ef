//! HMAC-SHA256 signatures over `message_id || timestamp || body`.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_PREFIX: &str = "sha256=";

fn digest(secret: &[u8], message_id: &str, timestamp: &str, body: &[u8]) -> Option<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(secret).ok()?;
    mac.update(message_id.as_bytes());
    mac.update(timestamp.as_bytes());
    mac.update(body);
    Some(mac.finalize().into_bytes().to_vec())
}

/// Compute the `sha256=<hex>` header value for a message.
pub fn sign(secret: &[u8], message_id: &str, timestamp: &str, body: &[u8]) -> String {
    let hex_digest = digest(secret, message_id, timestamp, body)
        .map(hex::encode)
        .unwrap_or_default();
    format!("{}{}", SIGNATURE_PREFIX, hex_digest)
}

/// Check a `sha256=<hex>` signature.
///
/// Never errors: malformed input (missing prefix, bad hex, wrong length)
/// is simply `false`, and callers must reject the request. The digest
/// comparison is constant-time; only the public digest length can leak.
pub fn verify(secret: &[u8], message_id: &str, timestamp: &str, body: &[u8], signature: &str) -> bool {
    let Some(hex_part) = signature.strip_prefix(SIGNATURE_PREFIX) else {
        return false;
    };
    let Ok(provided) = hex::decode(hex_part) else {
        return false;
    };
    let Some(expected) = digest(secret, message_id, timestamp, body) else {
        return false;
    };

    expected.ct_eq(provided.as_slice()).into()
}
