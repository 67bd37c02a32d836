use log::debug;
use spg_common::AtomicAmount;
use sqlx::SqliteConnection;

use crate::{
    db_types::{Address, Chain, IntentFund, Token, Transfer, TransferEvent},
    traits::PaymentGatewayError,
};

pub enum InsertTransferResult {
    Inserted(Transfer),
    /// The `(chain, tx_hash, log_index)` triple was already recorded.
    Duplicate(Transfer),
}

/// Append the transfer, or touch `last_seen` when the unique constraint on
/// `(chain, tx_hash, log_index)` reports the event as already known.
pub async fn idempotent_insert(
    event: &TransferEvent,
    conn: &mut SqliteConnection,
) -> Result<InsertTransferResult, PaymentGatewayError> {
    let inserted = sqlx::query_as::<_, Transfer>(
        r#"
            INSERT INTO transfers (chain, tx_hash, log_index, token, to_address, amount, block_number, provider_event_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING *;
        "#,
    )
    .bind(&event.chain)
    .bind(&event.tx_hash)
    .bind(event.log_index)
    .bind(&event.token)
    .bind(&event.to)
    .bind(event.amount)
    .bind(event.block_number)
    .bind(&event.provider_event_id)
    .fetch_one(&mut *conn)
    .await;
    match inserted {
        Ok(transfer) => {
            debug!("🗃️ Transfer {}#{} recorded with id {}", transfer.tx_hash, transfer.log_index, transfer.id);
            Ok(InsertTransferResult::Inserted(transfer))
        },
        Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
            let transfer = sqlx::query_as(
                r#"
                    UPDATE transfers SET last_seen = CURRENT_TIMESTAMP
                    WHERE chain = $1 AND tx_hash = $2 AND log_index = $3
                    RETURNING *;
                "#,
            )
            .bind(&event.chain)
            .bind(&event.tx_hash)
            .bind(event.log_index)
            .fetch_one(&mut *conn)
            .await?;
            Ok(InsertTransferResult::Duplicate(transfer))
        },
        Err(e) => Err(e.into()),
    }
}

//--------------------------------------    Intent funds     ---------------------------------------------------------

/// Link a transfer to the intent it funds. The UNIQUE constraint on
/// `transfer_id` is the double-credit guard: a violation means the transfer
/// is already credited somewhere and the surrounding transaction must abort.
pub(crate) async fn link_fund(
    intent_id: i64,
    transfer_id: i64,
    credited: AtomicAmount,
    conn: &mut SqliteConnection,
) -> Result<(), PaymentGatewayError> {
    sqlx::query("INSERT INTO intent_funds (intent_id, transfer_id, credited) VALUES ($1, $2, $3)")
        .bind(intent_id)
        .bind(transfer_id)
        .bind(credited)
        .execute(conn)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(err) if err.is_unique_violation() => PaymentGatewayError::InvariantViolation(
                format!("transfer {transfer_id} is already credited to an intent"),
            ),
            _ => PaymentGatewayError::from(e),
        })?;
    Ok(())
}

pub(crate) async fn funds_for_intent(
    intent_id: i64,
    conn: &mut SqliteConnection,
) -> Result<Vec<IntentFund>, PaymentGatewayError> {
    let funds = sqlx::query_as("SELECT * FROM intent_funds WHERE intent_id = $1 ORDER BY id ASC")
        .bind(intent_id)
        .fetch_all(conn)
        .await?;
    Ok(funds)
}

/// Block numbers and tx hashes of the transfers funding an intent, in
/// crediting order.
pub(crate) async fn funding_rows_for_intent(
    intent_id: i64,
    conn: &mut SqliteConnection,
) -> Result<Vec<(i64, String)>, sqlx::Error> {
    sqlx::query_as(
        r#"
            SELECT transfers.block_number, transfers.tx_hash
            FROM intent_funds JOIN transfers ON intent_funds.transfer_id = transfers.id
            WHERE intent_funds.intent_id = $1
            ORDER BY intent_funds.id ASC
        "#,
    )
    .bind(intent_id)
    .fetch_all(conn)
    .await
}

//--------------------------------------  Unmatched buffer   ---------------------------------------------------------

/// Buffer a transfer for which no live intent owns the destination address.
/// It is re-evaluated when an intent is created with that address.
pub(crate) async fn buffer_unmatched(transfer: &Transfer, conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT OR IGNORE INTO unmatched_transfers (transfer_id, chain, token, to_address) VALUES ($1, $2, $3, $4)",
    )
    .bind(transfer.id)
    .bind(&transfer.chain)
    .bind(&transfer.token)
    .bind(&transfer.to_address)
    .execute(conn)
    .await?;
    Ok(())
}

/// Remove and return the buffered transfers addressed to the given
/// destination, oldest first.
pub(crate) async fn take_unmatched_for(
    chain: &Chain,
    token: &Token,
    address: &Address,
    conn: &mut SqliteConnection,
) -> Result<Vec<Transfer>, sqlx::Error> {
    let transfers: Vec<Transfer> = sqlx::query_as(
        r#"
            SELECT transfers.* FROM transfers
            JOIN unmatched_transfers ON unmatched_transfers.transfer_id = transfers.id
            WHERE unmatched_transfers.chain = $1 AND unmatched_transfers.token = $2
              AND unmatched_transfers.to_address = $3
            ORDER BY transfers.id ASC
        "#,
    )
    .bind(chain)
    .bind(token)
    .bind(address)
    .fetch_all(&mut *conn)
    .await?;
    sqlx::query("DELETE FROM unmatched_transfers WHERE chain = $1 AND token = $2 AND to_address = $3")
        .bind(chain)
        .bind(token)
        .bind(address)
        .execute(&mut *conn)
        .await?;
    Ok(transfers)
}

//--------------------------------------      Quarantine     ---------------------------------------------------------

/// Park an event that violated a monetary invariant. Runs on its own
/// connection because the transaction it poisoned has been rolled back.
pub(crate) async fn quarantine_event(
    payload: &str,
    error: &str,
    conn: &mut SqliteConnection,
) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT INTO poison_events (payload, error) VALUES ($1, $2)")
        .bind(payload)
        .bind(error)
        .execute(conn)
        .await?;
    Ok(())
}
