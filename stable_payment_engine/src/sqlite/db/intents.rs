use log::debug;
use spg_common::AtomicAmount;
use sqlx::SqliteConnection;

use crate::{
    db_types::{Address, Chain, IntentId, IntentStatus, NewPaymentIntent, PaymentIntent, Token},
    traits::PaymentGatewayError,
};

/// Inserts a new payment intent. The partial unique indexes guarantee at most
/// one live intent per deposit address and per (invoice, token, chain).
pub async fn insert_intent(
    intent: NewPaymentIntent,
    conn: &mut SqliteConnection,
) -> Result<PaymentIntent, PaymentGatewayError> {
    let address = intent.deposit_address.clone();
    let row: PaymentIntent = sqlx::query_as(
        r#"
            INSERT INTO payment_intents (intent_id, invoice_id, token, chain, deposit_address, target_amount)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *;
        "#,
    )
    .bind(IntentId::random())
    .bind(intent.invoice_id)
    .bind(&intent.token)
    .bind(&intent.chain)
    .bind(&intent.deposit_address)
    .bind(intent.target_amount)
    .fetch_one(conn)
    .await
    .map_err(|e| match e {
        sqlx::Error::Database(err) if err.is_unique_violation() => {
            PaymentGatewayError::DepositAddressBusy(address.to_string())
        },
        _ => PaymentGatewayError::from(e),
    })?;
    debug!("📝️ Intent [{}] inserted with id {} for address {}", row.intent_id, row.id, row.deposit_address);
    Ok(row)
}

pub async fn fetch_intent_by_intent_id(
    intent_id: &IntentId,
    conn: &mut SqliteConnection,
) -> Result<Option<PaymentIntent>, sqlx::Error> {
    sqlx::query_as("SELECT * FROM payment_intents WHERE intent_id = $1")
        .bind(intent_id.as_str())
        .fetch_optional(conn)
        .await
}

pub async fn fetch_intents_for_invoice(
    invoice_id: i64,
    conn: &mut SqliteConnection,
) -> Result<Vec<PaymentIntent>, sqlx::Error> {
    sqlx::query_as("SELECT * FROM payment_intents WHERE invoice_id = $1 ORDER BY created_at ASC")
        .bind(invoice_id)
        .fetch_all(conn)
        .await
}

/// The live intent for the given (invoice, token, chain) option, if any.
pub async fn fetch_live_intent_for_option(
    invoice_id: i64,
    token: &Token,
    chain: &Chain,
    conn: &mut SqliteConnection,
) -> Result<Option<PaymentIntent>, sqlx::Error> {
    sqlx::query_as(
        r#"
            SELECT * FROM payment_intents
            WHERE invoice_id = $1 AND token = $2 AND chain = $3
              AND status IN ('AwaitingFunds', 'PartiallyFunded', 'Funded', 'Overfunded')
            LIMIT 1
        "#,
    )
    .bind(invoice_id)
    .bind(token)
    .bind(chain)
    .fetch_optional(conn)
    .await
}

/// The intent owning a deposit address for matching purposes. Two intents may
/// share an address only if one is in a terminal failure state; the live one
/// wins, otherwise the most recently created.
pub async fn fetch_intent_for_address(
    chain: &Chain,
    token: &Token,
    address: &Address,
    conn: &mut SqliteConnection,
) -> Result<Option<PaymentIntent>, sqlx::Error> {
    sqlx::query_as(
        r#"
            SELECT * FROM payment_intents
            WHERE chain = $1 AND token = $2 AND deposit_address = $3
            ORDER BY
                CASE WHEN status IN ('AwaitingFunds', 'PartiallyFunded', 'Funded', 'Overfunded') THEN 0 ELSE 1 END,
                created_at DESC,
                id DESC
            LIMIT 1
        "#,
    )
    .bind(chain)
    .bind(token)
    .bind(address)
    .fetch_optional(conn)
    .await
}

pub(crate) async fn update_intent_credit(
    id: i64,
    credited: AtomicAmount,
    status: IntentStatus,
    conn: &mut SqliteConnection,
) -> Result<PaymentIntent, PaymentGatewayError> {
    let result: Option<PaymentIntent> = sqlx::query_as(
        "UPDATE payment_intents SET credited_amount = $1, status = $2, updated_at = CURRENT_TIMESTAMP WHERE id = $3 \
         RETURNING *",
    )
    .bind(credited)
    .bind(status)
    .bind(id)
    .fetch_optional(conn)
    .await?;
    result.ok_or(PaymentGatewayError::IntentNotFound)
}

pub(crate) async fn update_intent_status(
    id: i64,
    status: IntentStatus,
    conn: &mut SqliteConnection,
) -> Result<PaymentIntent, PaymentGatewayError> {
    let result: Option<PaymentIntent> = sqlx::query_as(
        "UPDATE payment_intents SET status = $1, updated_at = CURRENT_TIMESTAMP WHERE id = $2 RETURNING *",
    )
    .bind(status)
    .bind(id)
    .fetch_optional(conn)
    .await?;
    result.ok_or(PaymentGatewayError::IntentNotFound)
}

/// Move every live intent of an invoice to the given terminal status
/// (Expired or Cancelled, with its invoice).
pub(crate) async fn close_live_intents_for_invoice(
    invoice_id: i64,
    status: IntentStatus,
    conn: &mut SqliteConnection,
) -> Result<Vec<PaymentIntent>, sqlx::Error> {
    sqlx::query_as(
        r#"
            UPDATE payment_intents SET status = $1, updated_at = CURRENT_TIMESTAMP
            WHERE invoice_id = $2 AND status IN ('AwaitingFunds', 'PartiallyFunded', 'Funded', 'Overfunded')
            RETURNING *
        "#,
    )
    .bind(status)
    .bind(invoice_id)
    .fetch_all(conn)
    .await
}

/// The intent whose credited funds cover (or covered) the invoice target.
pub(crate) async fn fetch_funding_intent(
    invoice_id: i64,
    conn: &mut SqliteConnection,
) -> Result<Option<PaymentIntent>, sqlx::Error> {
    sqlx::query_as(
        r#"
            SELECT * FROM payment_intents
            WHERE invoice_id = $1 AND status IN ('Funded', 'Overfunded', 'Confirmed')
            ORDER BY updated_at DESC, id DESC
            LIMIT 1
        "#,
    )
    .bind(invoice_id)
    .fetch_optional(conn)
    .await
}
