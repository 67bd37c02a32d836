//! # SQLite Database methods
//!
//! This module contains "low-level" SQLite database interactions.
//!
//! All these interactions are maintained by simple functions (rather than
//! stateful structs) that accept a `&mut SqliteConnection` argument. Callers
//! can obtain a connection from a pool, or create an atomic transaction as
//! the need arises and call through to the functions without any other
//! changes. The transactional guarantees of the payment flow (state change +
//! outbox rows in one commit) are assembled in
//! [`crate::SqliteDatabase`] from these building blocks.
use std::{env, str::FromStr, time::Duration};

use log::info;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Error as SqlxError,
    SqlitePool,
};

pub mod addresses;
pub mod idempotency;
pub mod intents;
pub mod invoices;
pub mod locks;
pub mod merchants;
pub mod outbox;
pub mod transfers;

const SQLITE_DB_URL: &str = "sqlite://data/spg_store.db";

pub fn db_url() -> String {
    let result = env::var("SPG_DATABASE_URL").unwrap_or_else(|_| {
        info!("SPG_DATABASE_URL is not set. Using the default.");
        SQLITE_DB_URL.to_string()
    });
    info!("Using database URL: {result}");
    result
}

/// State mutations should fail fast rather than queue behind a stuck writer;
/// the sweeper and other batch readers tolerate more.
const BUSY_TIMEOUT: Duration = Duration::from_secs(2);

pub async fn new_pool(url: &str, max_connections: u32) -> Result<SqlitePool, SqlxError> {
    let options = SqliteConnectOptions::from_str(url)?.busy_timeout(BUSY_TIMEOUT);
    let pool = SqlitePoolOptions::new().max_connections(max_connections).connect_with(options).await?;
    Ok(pool)
}
