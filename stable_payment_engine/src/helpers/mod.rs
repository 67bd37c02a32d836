pub mod backoff;
pub mod callback_signature;

pub use backoff::BackoffPolicy;
pub use callback_signature::{
    sign,
    verify,
    SignatureError,
    IDEMPOTENCY_KEY_HEADER,
    MAX_TIMESTAMP_SKEW_SECS,
    SIGNATURE_HEADER,
    SIGNATURE_TIMESTAMP_HEADER,
};
