//! # Stablecoin Payment Engine
//!
//! The payment engine is the core of a gateway that lets merchants accept
//! stablecoin payments with the ergonomics of a card processor: an invoice is
//! priced in fiat, a buyer picks a (token, chain) option and pays on-chain,
//! and the merchant receives a signed callback once the payment is confirmed.
//! This library is provider-agnostic and contains no HTTP surface.
//!
//! The library is divided into three main sections:
//! 1. The pure state machine ([`state_machine`]): the credit, confirmation,
//!    expiry and cancellation rules as I/O-free functions.
//! 2. Database management and control. SQLite is the supported backend. You
//!    should never need to access the database directly; use the public API.
//!    The exception is the data types used in the database, defined in the
//!    [`db_types`] module.
//! 3. Flow management ([`spe_api`]): the public API driving invoice and
//!    intent lifecycles, transfer ingress and the transactional outbox.
//!
//! Every state change commits together with the outbox rows describing its
//! side effects, so a crash can never separate the two; the dispatcher in the
//! server crate drains the outbox with at-least-once semantics.
pub mod db_types;
pub mod helpers;
pub mod state_machine;

pub mod spe_api;
mod sqlite;
pub mod traits;

pub use spe_api::InvoiceFlowApi;
pub use sqlite::SqliteDatabase;
pub use traits::{PaymentGatewayDatabase, PaymentGatewayError};
