//! # Merchant callback signing
//!
//! Every callback POSTed to a merchant is signed so the merchant can verify
//! both origin and integrity before acting on it. The same scheme
//! authenticates provider webhooks on the inbound side.
//!
//! The canonical form is the timestamp and the raw body bytes joined by a
//! single dot:
//!
//! ```text
//!     {unix_seconds}.{raw_body_bytes}
//! ```
//!
//! The HMAC-SHA256 of the canonical form, hex encoded, travels in the
//! `X-Signature` header as `v1=<hex>`; the timestamp travels in
//! `X-Signature-Timestamp`. Verifiers must reject messages whose timestamp
//! deviates from their clock by more than five minutes, which bounds the
//! replay window to the skew allowance.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

pub const SIGNATURE_HEADER: &str = "X-Signature";
pub const SIGNATURE_TIMESTAMP_HEADER: &str = "X-Signature-Timestamp";
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// Maximum tolerated clock skew between signer and verifier, in seconds.
pub const MAX_TIMESTAMP_SKEW_SECS: i64 = 300;

const SIGNATURE_VERSION_PREFIX: &str = "v1=";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("The signature header is malformed")]
    MalformedHeader,
    #[error("The signature does not match the payload")]
    Mismatch,
    #[error("The signature timestamp is outside the allowed skew window")]
    TimestampSkew,
}

/// Sign `body` for the given unix timestamp, producing the `X-Signature`
/// header value, `v1=<hex>`.
pub fn sign(secret: &str, timestamp: i64, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    format!("{SIGNATURE_VERSION_PREFIX}{}", hex::encode(mac.finalize().into_bytes()))
}

/// Verify an `X-Signature` header value against `body` and `timestamp`,
/// rejecting stale or future-dated messages relative to `now`.
pub fn verify(secret: &str, timestamp: i64, body: &[u8], header_value: &str, now: i64) -> Result<(), SignatureError> {
    let hex_sig = header_value.strip_prefix(SIGNATURE_VERSION_PREFIX).ok_or(SignatureError::MalformedHeader)?;
    let provided = hex::decode(hex_sig).map_err(|_| SignatureError::MalformedHeader)?;
    if (now - timestamp).abs() > MAX_TIMESTAMP_SKEW_SECS {
        return Err(SignatureError::TimestampSkew);
    }
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    mac.verify_slice(&provided).map_err(|_| SignatureError::Mismatch)
}

#[cfg(test)]
mod test {
    use super::*;

    const SECRET: &str = "whsec_test123secret456";

    #[test]
    fn sign_and_verify_round_trip() {
        let body = br#"{"invoiceId":"inv-1","status":"CONFIRMED"}"#;
        let ts = 1_706_400_000;
        let header = sign(SECRET, ts, body);
        assert!(header.starts_with("v1="));
        assert_eq!(header.len(), 3 + 64);
        verify(SECRET, ts, body, &header, ts + 10).expect("signature should verify");
    }

    #[test]
    fn mutated_body_fails_verification() {
        let ts = 1_706_400_000;
        let header = sign(SECRET, ts, b"{\"a\":1}");
        assert_eq!(verify(SECRET, ts, b"{\"a\":2}", &header, ts), Err(SignatureError::Mismatch));
    }

    #[test]
    fn mutated_timestamp_fails_verification() {
        let body = b"{\"a\":1}";
        let ts = 1_706_400_000;
        let header = sign(SECRET, ts, body);
        assert_eq!(verify(SECRET, ts + 1, body, &header, ts), Err(SignatureError::Mismatch));
    }

    #[test]
    fn wrong_secret_fails_verification() {
        let body = b"{\"a\":1}";
        let ts = 1_706_400_000;
        let header = sign(SECRET, ts, body);
        assert_eq!(verify("other_secret", ts, body, &header, ts), Err(SignatureError::Mismatch));
    }

    #[test]
    fn stale_timestamps_are_rejected() {
        let body = b"{\"a\":1}";
        let ts = 1_706_400_000;
        let header = sign(SECRET, ts, body);
        assert_eq!(
            verify(SECRET, ts, body, &header, ts + MAX_TIMESTAMP_SKEW_SECS + 1),
            Err(SignatureError::TimestampSkew)
        );
        // Future-dated messages are equally suspect.
        assert_eq!(
            verify(SECRET, ts, body, &header, ts - MAX_TIMESTAMP_SKEW_SECS - 1),
            Err(SignatureError::TimestampSkew)
        );
    }

    #[test]
    fn malformed_headers_are_rejected() {
        assert_eq!(verify(SECRET, 0, b"x", "deadbeef", 0), Err(SignatureError::MalformedHeader));
        assert_eq!(verify(SECRET, 0, b"x", "v1=nothex!", 0), Err(SignatureError::MalformedHeader));
    }
}
