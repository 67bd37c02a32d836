use sqlx::SqliteConnection;
use uuid::Uuid;

use crate::{
    db_types::{Merchant, NewMerchant},
    traits::PaymentGatewayError,
};

pub async fn insert_merchant(
    merchant: NewMerchant,
    conn: &mut SqliteConnection,
) -> Result<Merchant, PaymentGatewayError> {
    let merchant = sqlx::query_as(
        r#"
            INSERT INTO merchants (merchant_id, api_key_hash, callback_secret, suppress_info_callbacks)
            VALUES ($1, $2, $3, $4)
            RETURNING *;
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(merchant.api_key_hash)
    .bind(merchant.callback_secret)
    .bind(merchant.suppress_info_callbacks)
    .fetch_one(conn)
    .await?;
    Ok(merchant)
}

pub async fn fetch_merchant(id: i64, conn: &mut SqliteConnection) -> Result<Option<Merchant>, sqlx::Error> {
    sqlx::query_as("SELECT * FROM merchants WHERE id = $1").bind(id).fetch_optional(conn).await
}

/// Only active merchants can authenticate.
pub async fn fetch_merchant_by_api_key_hash(
    api_key_hash: &str,
    conn: &mut SqliteConnection,
) -> Result<Option<Merchant>, sqlx::Error> {
    sqlx::query_as("SELECT * FROM merchants WHERE api_key_hash = $1 AND active = 1")
        .bind(api_key_hash)
        .fetch_optional(conn)
        .await
}
