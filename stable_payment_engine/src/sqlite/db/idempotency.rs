use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;

use crate::{
    db_types::{IdempotencyRecord, IdempotencyScope},
    traits::PaymentGatewayError,
};

pub async fn fetch(
    scope: IdempotencyScope,
    key: &str,
    conn: &mut SqliteConnection,
) -> Result<Option<IdempotencyRecord>, sqlx::Error> {
    sqlx::query_as("SELECT * FROM idempotency_keys WHERE scope = $1 AND key = $2")
        .bind(scope)
        .bind(key)
        .fetch_optional(conn)
        .await
}

/// First writer wins; a concurrent duplicate insert is reported as `false`
/// so the caller can replay the stored response instead.
pub async fn store(record: IdempotencyRecord, conn: &mut SqliteConnection) -> Result<bool, PaymentGatewayError> {
    let result = sqlx::query(
        r#"
            INSERT OR IGNORE INTO idempotency_keys (scope, key, fingerprint, response_status, response_body, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(record.scope)
    .bind(&record.key)
    .bind(&record.fingerprint)
    .bind(record.response_status)
    .bind(&record.response_body)
    .bind(record.expires_at)
    .execute(conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn purge_expired(now: DateTime<Utc>, conn: &mut SqliteConnection) -> Result<u64, PaymentGatewayError> {
    let result = sqlx::query("DELETE FROM idempotency_keys WHERE unixepoch(expires_at) <= unixepoch($1)")
        .bind(now)
        .execute(conn)
        .await?;
    Ok(result.rows_affected())
}
