use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use crate::{
    db_types::{
        IdempotencyRecord,
        IdempotencyScope,
        IntentId,
        Invoice,
        InvoiceId,
        InvoiceStatus,
        Merchant,
        NewInvoice,
        NewMerchant,
        NewPaymentIntent,
        OutboxRecord,
        PaymentIntent,
        PaymentOption,
        TransferEvent,
    },
    traits::{CancellationResult, ConfirmationContext, ConfirmationResult, ExpirySweepResult, IngressOutcome, IntentCreated},
};

/// This trait defines the highest level of behaviour for backends supporting the payment engine.
///
/// This behaviour includes:
/// * Invoice and payment-intent lifecycle management.
/// * Idempotent ingress of on-chain transfer events and matching them to intents.
/// * The transactional outbox: every state change commits together with the
///   side-effect rows that describe it, and workers drain those rows through
///   the claim protocol exposed here.
/// * The supporting bookkeeping: idempotency records, worker leases, and the
///   quarantine table for events that violate invariants.
#[allow(async_fn_in_trait)]
pub trait PaymentGatewayDatabase: Clone {
    /// The URL of the database
    fn url(&self) -> &str;

    //----------------------------------------- Merchants -----------------------------------------

    async fn create_merchant(&self, merchant: NewMerchant) -> Result<Merchant, PaymentGatewayError>;

    async fn fetch_merchant(&self, id: i64) -> Result<Option<Merchant>, PaymentGatewayError>;

    /// Fetch the active merchant owning the given API key hash, if any.
    async fn fetch_merchant_by_api_key_hash(&self, api_key_hash: &str)
        -> Result<Option<Merchant>, PaymentGatewayError>;

    //----------------------------------------- Invoices ------------------------------------------

    /// Creates the invoice together with its allowed payment options in one
    /// transaction. A duplicate `merchant_order_id` for the same merchant is a
    /// [`PaymentGatewayError::InvoiceAlreadyExists`] conflict.
    async fn create_invoice(&self, invoice: NewInvoice) -> Result<Invoice, PaymentGatewayError>;

    async fn fetch_invoice(&self, invoice_id: &InvoiceId) -> Result<Option<Invoice>, PaymentGatewayError>;

    /// Fetch by internal id; used by workers holding outbox rows.
    async fn fetch_invoice_by_id(&self, id: i64) -> Result<Option<Invoice>, PaymentGatewayError>;

    async fn fetch_invoice_options(&self, invoice: &Invoice) -> Result<Vec<PaymentOption>, PaymentGatewayError>;

    async fn fetch_intents_for_invoice(&self, invoice: &Invoice) -> Result<Vec<PaymentIntent>, PaymentGatewayError>;

    /// Administrative cancellation. Pending and Underpaid invoices move to
    /// Cancelled and a status callback is queued; terminal invoices are a
    /// no-op; Paid invoices cannot be cancelled.
    async fn cancel_invoice(&self, invoice_id: &InvoiceId) -> Result<CancellationResult, PaymentGatewayError>;

    /// Transition invoices past their expiry instant from Pending/Underpaid to
    /// Expired, in batches ordered by expiry ascending, each invoice in its
    /// own transaction. Idempotent per invoice.
    async fn expire_due_invoices(
        &self,
        now: DateTime<Utc>,
        batch_size: u32,
    ) -> Result<ExpirySweepResult, PaymentGatewayError>;

    //------------------------------------------ Intents ------------------------------------------

    /// Creates a payment intent and, in the same transaction, replays any
    /// buffered unmatched transfers addressed to its deposit address.
    ///
    /// At most one non-terminal intent may exist per (invoice, token, chain);
    /// a second request for the same option returns the existing intent.
    async fn create_intent(&self, intent: NewPaymentIntent) -> Result<IntentCreated, PaymentGatewayError>;

    async fn fetch_intent(&self, intent_id: &IntentId) -> Result<Option<PaymentIntent>, PaymentGatewayError>;

    /// The live (non-terminal) intent for an invoice's (token, chain) option,
    /// if one exists.
    async fn fetch_live_intent(
        &self,
        invoice_id: i64,
        option: &PaymentOption,
    ) -> Result<Option<PaymentIntent>, PaymentGatewayError>;

    //------------------------------------------ Ingress ------------------------------------------

    /// Ingest a normalized transfer event. In a single atomic transaction:
    /// * insert into `transfers`; a duplicate `(chain, tx_hash, log_index)` is
    ///   a success no-op,
    /// * match the destination to a live intent, buffering unmatched transfers,
    /// * apply the credit rule and write the invoice/intent updates plus the
    ///   outbox rows they imply.
    ///
    /// A double-credit attempt aborts the transaction, quarantines the event
    /// into `poison_events` and surfaces
    /// [`PaymentGatewayError::InvariantViolation`].
    async fn process_transfer_event(&self, event: TransferEvent) -> Result<IngressOutcome, PaymentGatewayError>;

    //--------------------------------------- Confirmations ---------------------------------------

    /// Everything the confirmation poller needs to evaluate an invoice:
    /// the funding intent and the blocks/hashes of its funding transfers.
    async fn fetch_confirmation_context(
        &self,
        invoice_id: i64,
    ) -> Result<Option<ConfirmationContext>, PaymentGatewayError>;

    /// Advance a Paid invoice to Confirmed iff every funding transfer has at
    /// least `threshold` confirmations at `current_block`; writes the
    /// `InvoiceStatusChanged(CONFIRMED)` outbox row in the same transaction.
    /// On a post-confirmation reorg, emits a `ChargebackSuspected` row instead
    /// of regressing.
    async fn try_confirm_invoice(
        &self,
        invoice_id: i64,
        current_block: i64,
        threshold: i64,
    ) -> Result<ConfirmationResult, PaymentGatewayError>;

    //------------------------------------------ Outbox -------------------------------------------

    /// Claim up to `limit` due outbox rows: Pending, `next_attempt_at <= now`,
    /// and no sibling row for the same invoice currently in flight. Claimed
    /// rows become InFlight with a fresh claim token and a deadline of
    /// `now + visibility_timeout`; rows whose deadline lapses become
    /// reclaimable. Per invoice, the lowest-id eligible row is claimed first,
    /// giving monotonic status progression at the merchant.
    async fn claim_due_outbox(
        &self,
        now: DateTime<Utc>,
        limit: u32,
        visibility_timeout: Duration,
    ) -> Result<Vec<OutboxRecord>, PaymentGatewayError>;

    /// Return lapsed InFlight rows (crashed workers) to Pending. Returns the
    /// number of rows released.
    async fn release_expired_claims(&self, now: DateTime<Utc>) -> Result<u64, PaymentGatewayError>;

    /// Mark a claimed row Done. Fails with [`PaymentGatewayError::ClaimMismatch`]
    /// if the claim token does not match (the claim lapsed and was re-claimed).
    async fn complete_outbox(&self, id: i64, claim_token: &str) -> Result<(), PaymentGatewayError>;

    /// Record a transient failure on a claimed row: increments the attempt
    /// count, stores the error and returns the row to Pending with the given
    /// next attempt time.
    async fn retry_outbox(
        &self,
        id: i64,
        claim_token: &str,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), PaymentGatewayError>;

    /// Mark a claimed row Dead after a permanent failure or an exhausted
    /// attempt budget. The invoice state is not reverted.
    async fn bury_outbox(&self, id: i64, claim_token: &str, error: &str) -> Result<(), PaymentGatewayError>;

    /// Put a claimed row back to Pending with a new attempt time *without*
    /// counting an attempt. Used by self-rescheduling confirmation polls.
    async fn reschedule_outbox(
        &self,
        id: i64,
        claim_token: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), PaymentGatewayError>;

    async fn fetch_outbox_record(&self, id: i64) -> Result<Option<OutboxRecord>, PaymentGatewayError>;

    /// All outbox rows for an invoice in ascending id order, whatever their
    /// status. Used by operators (and tests) to audit effect delivery.
    async fn fetch_outbox_for_invoice(&self, invoice_id: i64) -> Result<Vec<OutboxRecord>, PaymentGatewayError>;

    //---------------------------------------- Idempotency ----------------------------------------

    async fn fetch_idempotency_record(
        &self,
        scope: IdempotencyScope,
        key: &str,
    ) -> Result<Option<IdempotencyRecord>, PaymentGatewayError>;

    /// Store a response for replay. Returns `false` when another writer got
    /// there first (the stored record wins).
    async fn store_idempotency_record(&self, record: IdempotencyRecord) -> Result<bool, PaymentGatewayError>;

    async fn purge_expired_idempotency(&self, now: DateTime<Utc>) -> Result<u64, PaymentGatewayError>;

    //------------------------------------------ Leases -------------------------------------------

    /// Try to acquire (or renew) the named cooperative lease for `holder`.
    /// Returns `true` while this holder owns the lease.
    async fn acquire_lease(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, PaymentGatewayError>;

    async fn release_lease(&self, name: &str, holder: &str) -> Result<(), PaymentGatewayError>;

    /// Closes the database connection.
    async fn close(&mut self) -> Result<(), PaymentGatewayError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Error)]
pub enum PaymentGatewayError {
    #[error("We have an internal database engine error (configuration/uptime etc.): {0}")]
    DatabaseError(String),
    #[error("Invalid request: {0}")]
    Validation(String),
    #[error("An invoice for merchant order '{0}' already exists")]
    InvoiceAlreadyExists(String),
    #[error("The requested invoice {0} does not exist")]
    InvoiceNotFound(InvoiceId),
    #[error("The requested invoice (internal id {0}) does not exist")]
    InvoiceIdNotFound(i64),
    #[error("The requested intent does not exist")]
    IntentNotFound,
    #[error("The requested merchant does not exist")]
    MerchantNotFound,
    #[error("Invoice is {0} and can no longer accept payment intents")]
    InvoiceNotPayable(InvoiceStatus),
    #[error("Invoice is {0} and cannot be cancelled")]
    InvoiceNotCancellable(InvoiceStatus),
    #[error("({token}, {chain}) is not an allowed payment option for this invoice")]
    OptionNotAllowed { token: String, chain: String },
    #[error("No free deposit address is available on chain {0}")]
    NoDepositAddressAvailable(String),
    #[error("Deposit address {0} is already held by a live intent")]
    DepositAddressBusy(String),
    #[error("The outbox claim is stale or held by another worker")]
    ClaimMismatch,
    #[error("Monetary invariant violated, event quarantined: {0}")]
    InvariantViolation(String),
}

impl PaymentGatewayError {
    /// Transient infrastructure failures are retried with backoff and never
    /// surface state regression to the merchant.
    pub fn is_transient(&self) -> bool {
        matches!(self, PaymentGatewayError::DatabaseError(_))
    }
}

impl From<sqlx::Error> for PaymentGatewayError {
    fn from(e: sqlx::Error) -> Self {
        PaymentGatewayError::DatabaseError(e.to_string())
    }
}
