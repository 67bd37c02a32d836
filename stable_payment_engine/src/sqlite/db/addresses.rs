use sqlx::SqliteConnection;

use crate::db_types::{Address, Chain};

/// A pool address on `chain` that no live intent currently holds. Addresses
/// released by expired or cancelled invoices become allocatable again.
pub async fn fetch_free_address(chain: &Chain, conn: &mut SqliteConnection) -> Result<Option<Address>, sqlx::Error> {
    let row: Option<(Address,)> = sqlx::query_as(
        r#"
            SELECT address FROM deposit_addresses
            WHERE chain = $1 AND address NOT IN (
                SELECT deposit_address FROM payment_intents
                WHERE chain = $1 AND status IN ('AwaitingFunds', 'PartiallyFunded', 'Funded', 'Overfunded')
            )
            ORDER BY id ASC
            LIMIT 1
        "#,
    )
    .bind(chain)
    .fetch_optional(conn)
    .await?;
    Ok(row.map(|r| r.0))
}

pub async fn seed(chain: &Chain, addresses: &[Address], conn: &mut SqliteConnection) -> Result<u64, sqlx::Error> {
    let mut inserted = 0;
    for address in addresses {
        let result = sqlx::query("INSERT OR IGNORE INTO deposit_addresses (chain, address) VALUES ($1, $2)")
            .bind(chain)
            .bind(address)
            .execute(&mut *conn)
            .await?;
        inserted += result.rows_affected();
    }
    Ok(inserted)
}
