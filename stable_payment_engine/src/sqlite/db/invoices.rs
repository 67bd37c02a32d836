use chrono::{DateTime, Utc};
use log::debug;
use sqlx::SqliteConnection;

use crate::{
    db_types::{Invoice, InvoiceId, InvoiceStatus, NewInvoice, PaymentOption},
    traits::PaymentGatewayError,
};

/// Inserts a new invoice and its allowed payment options using the given
/// connection. This is not atomic on its own. Embed the call inside a
/// transaction and pass `&mut *tx` as the connection argument.
pub async fn insert_invoice(invoice: NewInvoice, conn: &mut SqliteConnection) -> Result<Invoice, PaymentGatewayError> {
    let merchant_order_id = invoice.merchant_order_id.clone();
    let row: Invoice = sqlx::query_as(
        r#"
            INSERT INTO invoices (
                invoice_id,
                merchant_id,
                merchant_order_id,
                fiat_amount,
                currency,
                callback_url,
                expires_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *;
        "#,
    )
    .bind(InvoiceId::random())
    .bind(invoice.merchant_id)
    .bind(&invoice.merchant_order_id)
    .bind(invoice.fiat_amount)
    .bind(&invoice.currency)
    .bind(&invoice.callback_url)
    .bind(invoice.expires_at)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| match e {
        sqlx::Error::Database(err) if err.is_unique_violation() => {
            PaymentGatewayError::InvoiceAlreadyExists(merchant_order_id)
        },
        _ => PaymentGatewayError::from(e),
    })?;
    for option in &invoice.allowed_options {
        sqlx::query("INSERT INTO invoice_options (invoice_id, token, chain) VALUES ($1, $2, $3)")
            .bind(row.id)
            .bind(&option.token)
            .bind(&option.chain)
            .execute(&mut *conn)
            .await?;
    }
    debug!("📝️ Invoice [{}] inserted with id {}", row.invoice_id, row.id);
    Ok(row)
}

pub async fn fetch_invoice_by_invoice_id(
    invoice_id: &InvoiceId,
    conn: &mut SqliteConnection,
) -> Result<Option<Invoice>, sqlx::Error> {
    sqlx::query_as("SELECT * FROM invoices WHERE invoice_id = $1")
        .bind(invoice_id.as_str())
        .fetch_optional(conn)
        .await
}

pub async fn fetch_invoice(id: i64, conn: &mut SqliteConnection) -> Result<Option<Invoice>, sqlx::Error> {
    sqlx::query_as("SELECT * FROM invoices WHERE id = $1").bind(id).fetch_optional(conn).await
}

pub async fn fetch_options(invoice_id: i64, conn: &mut SqliteConnection) -> Result<Vec<PaymentOption>, sqlx::Error> {
    sqlx::query_as("SELECT token, chain FROM invoice_options WHERE invoice_id = $1")
        .bind(invoice_id)
        .fetch_all(conn)
        .await
}

pub async fn is_option_allowed(
    invoice_id: i64,
    option: &PaymentOption,
    conn: &mut SqliteConnection,
) -> Result<bool, sqlx::Error> {
    let row: Option<(i64,)> =
        sqlx::query_as("SELECT id FROM invoice_options WHERE invoice_id = $1 AND token = $2 AND chain = $3")
            .bind(invoice_id)
            .bind(&option.token)
            .bind(&option.chain)
            .fetch_optional(conn)
            .await?;
    Ok(row.is_some())
}

pub(crate) async fn update_invoice_status(
    id: i64,
    status: InvoiceStatus,
    conn: &mut SqliteConnection,
) -> Result<Invoice, PaymentGatewayError> {
    let result: Option<Invoice> =
        sqlx::query_as("UPDATE invoices SET status = $1, updated_at = CURRENT_TIMESTAMP WHERE id = $2 RETURNING *")
            .bind(status)
            .bind(id)
            .fetch_optional(conn)
            .await?;
    result.ok_or(PaymentGatewayError::InvoiceIdNotFound(id))
}

/// Internal ids of invoices past their expiry instant that the sweeper still
/// has to visit, oldest expiry first.
pub(crate) async fn fetch_due_for_expiry(
    now: DateTime<Utc>,
    batch_size: u32,
    conn: &mut SqliteConnection,
) -> Result<Vec<i64>, sqlx::Error> {
    let rows: Vec<(i64,)> = sqlx::query_as(
        r#"
            SELECT id FROM invoices
            WHERE status IN ('Pending', 'Underpaid') AND unixepoch(expires_at) <= unixepoch($1)
            ORDER BY expires_at ASC
            LIMIT $2
        "#,
    )
    .bind(now)
    .bind(batch_size as i64)
    .fetch_all(conn)
    .await?;
    Ok(rows.into_iter().map(|r| r.0).collect())
}
