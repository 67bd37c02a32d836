use chrono::{DateTime, Duration, Utc};
use log::{debug, trace};
use sqlx::SqliteConnection;
use uuid::Uuid;

use crate::{
    db_types::{NewOutboxRecord, OutboxRecord, OutboxStatus},
    traits::PaymentGatewayError,
};

/// Insert an outbox row. Callers embed this in the same transaction as the
/// state change the row describes; that co-commit is the whole point of the
/// outbox.
pub(crate) async fn insert(record: NewOutboxRecord, conn: &mut SqliteConnection) -> Result<OutboxRecord, PaymentGatewayError> {
    let row: OutboxRecord = sqlx::query_as(
        r#"
            INSERT INTO outbox (delivery_id, invoice_id, kind, payload, next_attempt_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *;
        "#,
    )
    .bind(&record.delivery_id)
    .bind(record.invoice_id)
    .bind(record.kind)
    .bind(record.payload.to_string())
    .bind(record.next_attempt_at)
    .fetch_one(conn)
    .await?;
    debug!("🗃️ Outbox row {} ({}) queued for invoice #{}", row.id, row.kind, row.invoice_id);
    Ok(row)
}

/// Claim up to `limit` due rows. A row is due when it is Pending and its
/// `next_attempt_at` has passed. Two extra conditions shape the claim set:
///
/// * only the lowest-id eligible row per invoice is taken, and
/// * an invoice with a row currently in flight is skipped entirely,
///
/// which together give a single claimant per invoice and ascending-id
/// dispatch order, i.e. monotonic status progression at the merchant.
pub async fn claim_due(
    now: DateTime<Utc>,
    limit: u32,
    visibility_timeout: Duration,
    conn: &mut SqliteConnection,
) -> Result<Vec<OutboxRecord>, PaymentGatewayError> {
    let claim_token = Uuid::new_v4().to_string();
    let deadline = now + visibility_timeout;
    let rows: Vec<OutboxRecord> = sqlx::query_as(
        r#"
            UPDATE outbox
            SET status = 'InFlight', claim_token = $1, claim_deadline = $2, updated_at = CURRENT_TIMESTAMP
            WHERE id IN (
                SELECT o.id FROM outbox o
                WHERE o.status = 'Pending' AND unixepoch(o.next_attempt_at) <= unixepoch($3)
                  AND NOT EXISTS (
                      SELECT 1 FROM outbox f
                      WHERE f.invoice_id = o.invoice_id AND f.status = 'InFlight'
                        AND unixepoch(f.claim_deadline) > unixepoch($3)
                  )
                  AND NOT EXISTS (
                      SELECT 1 FROM outbox p
                      WHERE p.invoice_id = o.invoice_id AND p.status = 'Pending' AND p.id < o.id
                  )
                ORDER BY o.next_attempt_at ASC
                LIMIT $4
            )
            RETURNING *;
        "#,
    )
    .bind(&claim_token)
    .bind(deadline)
    .bind(now)
    .bind(limit as i64)
    .fetch_all(conn)
    .await?;
    if !rows.is_empty() {
        trace!("🗃️ Claimed {} outbox rows with token {claim_token}", rows.len());
    }
    Ok(rows)
}

/// Return lapsed InFlight rows to Pending so another worker can pick them up.
pub async fn release_expired_claims(now: DateTime<Utc>, conn: &mut SqliteConnection) -> Result<u64, PaymentGatewayError> {
    let result = sqlx::query(
        r#"
            UPDATE outbox
            SET status = 'Pending', claim_token = NULL, claim_deadline = NULL, updated_at = CURRENT_TIMESTAMP
            WHERE status = 'InFlight' AND unixepoch(claim_deadline) <= unixepoch($1)
        "#,
    )
    .bind(now)
    .execute(conn)
    .await?;
    Ok(result.rows_affected())
}

async fn transition_claimed(
    id: i64,
    claim_token: &str,
    set_clause: &str,
    binds: Vec<String>,
    conn: &mut SqliteConnection,
) -> Result<(), PaymentGatewayError> {
    let sql = format!(
        "UPDATE outbox SET {set_clause}, updated_at = CURRENT_TIMESTAMP WHERE id = $1 AND claim_token = $2 AND \
         status = 'InFlight'"
    );
    let mut query = sqlx::query(&sql).bind(id).bind(claim_token);
    for value in &binds {
        query = query.bind(value);
    }
    let result = query.execute(conn).await?;
    if result.rows_affected() == 0 {
        return Err(PaymentGatewayError::ClaimMismatch);
    }
    Ok(())
}

pub async fn complete(id: i64, claim_token: &str, conn: &mut SqliteConnection) -> Result<(), PaymentGatewayError> {
    transition_claimed(id, claim_token, "status = 'Done', claim_token = NULL, claim_deadline = NULL", vec![], conn)
        .await
}

pub async fn retry(
    id: i64,
    claim_token: &str,
    next_attempt_at: DateTime<Utc>,
    error: &str,
    conn: &mut SqliteConnection,
) -> Result<(), PaymentGatewayError> {
    transition_claimed(
        id,
        claim_token,
        "status = 'Pending', attempts = attempts + 1, next_attempt_at = $3, last_error = $4, claim_token = NULL, \
         claim_deadline = NULL",
        vec![next_attempt_at.to_rfc3339(), error.to_string()],
        conn,
    )
    .await
}

pub async fn bury(id: i64, claim_token: &str, error: &str, conn: &mut SqliteConnection) -> Result<(), PaymentGatewayError> {
    transition_claimed(
        id,
        claim_token,
        "status = 'Dead', attempts = attempts + 1, last_error = $3, claim_token = NULL, claim_deadline = NULL",
        vec![error.to_string()],
        conn,
    )
    .await
}

/// Reschedule without counting an attempt. Confirmation polls use this to
/// come back after the poll interval.
pub async fn reschedule(
    id: i64,
    claim_token: &str,
    next_attempt_at: DateTime<Utc>,
    conn: &mut SqliteConnection,
) -> Result<(), PaymentGatewayError> {
    transition_claimed(
        id,
        claim_token,
        "status = 'Pending', next_attempt_at = $3, claim_token = NULL, claim_deadline = NULL",
        vec![next_attempt_at.to_rfc3339()],
        conn,
    )
    .await
}

pub async fn fetch(id: i64, conn: &mut SqliteConnection) -> Result<Option<OutboxRecord>, sqlx::Error> {
    sqlx::query_as("SELECT * FROM outbox WHERE id = $1").bind(id).fetch_optional(conn).await
}

pub async fn fetch_for_invoice(
    invoice_id: i64,
    conn: &mut SqliteConnection,
) -> Result<Vec<OutboxRecord>, sqlx::Error> {
    sqlx::query_as("SELECT * FROM outbox WHERE invoice_id = $1 ORDER BY id ASC")
        .bind(invoice_id)
        .fetch_all(conn)
        .await
}

pub async fn fetch_by_status(
    status: OutboxStatus,
    conn: &mut SqliteConnection,
) -> Result<Vec<OutboxRecord>, sqlx::Error> {
    sqlx::query_as("SELECT * FROM outbox WHERE status = $1 ORDER BY id ASC").bind(status).fetch_all(conn).await
}
