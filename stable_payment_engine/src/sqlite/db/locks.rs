use chrono::{DateTime, Duration, Utc};
use sqlx::SqliteConnection;

use crate::traits::PaymentGatewayError;

/// Acquire or renew the named cooperative lease. The upsert only steals the
/// row when the previous lease has lapsed, so exactly one holder is active
/// at a time and a crashed holder is replaced after the TTL.
pub async fn acquire(
    name: &str,
    holder: &str,
    ttl: Duration,
    now: DateTime<Utc>,
    conn: &mut SqliteConnection,
) -> Result<bool, PaymentGatewayError> {
    let expires = now + ttl;
    let result = sqlx::query(
        r#"
            INSERT INTO locks (name, holder, lease_expires_at) VALUES ($1, $2, $3)
            ON CONFLICT (name) DO UPDATE SET holder = excluded.holder, lease_expires_at = excluded.lease_expires_at
            WHERE locks.holder = excluded.holder OR unixepoch(locks.lease_expires_at) <= unixepoch($4)
        "#,
    )
    .bind(name)
    .bind(holder)
    .bind(expires)
    .bind(now)
    .execute(conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn release(name: &str, holder: &str, conn: &mut SqliteConnection) -> Result<(), PaymentGatewayError> {
    sqlx::query("DELETE FROM locks WHERE name = $1 AND holder = $2").bind(name).bind(holder).execute(conn).await?;
    Ok(())
}
