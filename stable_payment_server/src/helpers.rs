use actix_web::HttpRequest;
use sha2::{Digest, Sha256};
use stable_payment_engine::helpers::{verify, SIGNATURE_HEADER, SIGNATURE_TIMESTAMP_HEADER};

use crate::errors::ServerError;

/// SHA-256 hex digest, used for API-key hashes and idempotency fingerprints.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Verify the provider webhook signature (same scheme as outbound callbacks:
/// HMAC-SHA256 over `timestamp.body`, `v1=<hex>` in the signature header).
pub fn verify_webhook_signature(
    req: &HttpRequest,
    body: &[u8],
    secret: &str,
    now: i64,
) -> Result<(), ServerError> {
    let signature = header_str(req, SIGNATURE_HEADER)?;
    let timestamp = header_str(req, SIGNATURE_TIMESTAMP_HEADER)?
        .parse::<i64>()
        .map_err(|_| ServerError::InvalidWebhookSignature)?;
    verify(secret, timestamp, body, signature, now).map_err(|_| ServerError::InvalidWebhookSignature)
}

fn header_str<'a>(req: &'a HttpRequest, name: &str) -> Result<&'a str, ServerError> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .ok_or(ServerError::InvalidWebhookSignature)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sha256_hex_is_stable() {
        // Known SHA-256 of the empty string.
        assert_eq!(sha256_hex(b""), "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855");
        assert_eq!(sha256_hex(b"abc"), "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad");
    }
}
