//! # Payment engine public API
//!
//! The `spe_api` module exposes the programmatic API for the payment engine.
//!
//! * [`invoice_flow_api`] is the primary API for handling the invoice and
//!   payment-intent lifecycle in response to merchant requests and provider
//!   transfer events.
//!
//! The pattern for using the API is to create an instance by supplying a
//! database backend that implements the backend traits it requires:
//!
//! ```rust,ignore
//! use stable_payment_engine::{InvoiceFlowApi, SqliteDatabase};
//! let db = SqliteDatabase::new_with_url("sqlite://data/spg_store.db", 25).await?;
//! let api = InvoiceFlowApi::new(db);
//! let invoice = api.fetch_invoice(&invoice_id).await?;
//! ```
pub mod invoice_flow_api;

pub use invoice_flow_api::InvoiceFlowApi;
