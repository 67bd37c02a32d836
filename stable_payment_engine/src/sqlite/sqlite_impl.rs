//! `SqliteDatabase` is a concrete implementation of a payment engine backend.
//!
//! Unsurprisingly, it uses SQLite as the backend and implements all the traits
//! defined in the [`crate::traits`] module. Each public operation opens the
//! smallest transaction that covers a state change plus the outbox rows that
//! describe it; SQLite's single-writer transactions provide the per-intent
//! serialization that a row-locking engine would get from `SELECT … FOR
//! UPDATE`.
use std::fmt::Debug;

use chrono::{DateTime, Duration, Utc};
use log::*;
use spg_common::AtomicAmount;
use sqlx::{Sqlite, SqlitePool, Transaction};

use super::db::{addresses, db_url, idempotency, intents, invoices, locks, merchants, new_pool, outbox, transfers};
use crate::{
    db_types::{
        Address,
        CallbackPayload,
        Chain,
        IdempotencyRecord,
        IdempotencyScope,
        IntentId,
        IntentStatus,
        Invoice,
        InvoiceId,
        InvoiceStatus,
        Merchant,
        NewInvoice,
        NewMerchant,
        NewOutboxRecord,
        NewPaymentIntent,
        OutboxKind,
        OutboxRecord,
        PaymentIntent,
        PaymentOption,
        Transfer,
        TransferEvent,
    },
    sqlite::db::transfers::InsertTransferResult,
    state_machine::{
        self,
        apply_credit,
        cancel_transition,
        confirmation_outcome,
        CancelOutcome,
        ConfirmationOutcome,
        CreditOutcome,
        ExpiryOutcome,
    },
    traits::{
        AddressAllocator,
        AllocatorError,
        CancellationResult,
        ConfirmationContext,
        ConfirmationResult,
        ExpirySweepResult,
        IngressOutcome,
        IntentCreated,
        PaymentGatewayDatabase,
        PaymentGatewayError,
    },
};

#[derive(Clone)]
pub struct SqliteDatabase {
    url: String,
    pool: SqlitePool,
}

impl Debug for SqliteDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "SqliteDatabase ({:?})", self.pool)
    }
}

impl SqliteDatabase {
    /// Creates a new database API object using the database URL set in the `SPG_DATABASE_URL` envar.
    pub async fn new(max_connections: u32) -> Result<Self, sqlx::Error> {
        let url = db_url();
        Self::new_with_url(&url, max_connections).await
    }

    pub async fn new_with_url(url: &str, max_connections: u32) -> Result<Self, sqlx::Error> {
        let pool = new_pool(url, max_connections).await?;
        Ok(Self { url: url.to_string(), pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Apply the embedded schema migrations. Safe to call on every start.
    pub async fn run_migrations(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }

    /// Applies the credit rule for one transfer inside the caller's
    /// transaction, writing the intent/invoice updates and the outbox rows
    /// they imply. Returns the refreshed rows.
    async fn credit_transfer(
        invoice: Invoice,
        intent: PaymentIntent,
        transfer: &Transfer,
        tx: &mut Transaction<'_, Sqlite>,
    ) -> Result<IngressOutcome, PaymentGatewayError> {
        let now = Utc::now();
        match apply_credit(invoice.status, intent.target_amount, intent.credited_amount, transfer.amount) {
            CreditOutcome::Ignored => Ok(IngressOutcome::ZeroAmount { transfer_id: transfer.id }),
            CreditOutcome::LateFunds => {
                let payload = callback_payload(
                    &invoice,
                    invoice.status.callback_code(),
                    intent.credited_amount,
                    Some(&intent),
                    vec![transfer.tx_hash.clone()],
                    now,
                );
                outbox::insert(NewOutboxRecord::new(invoice.id, OutboxKind::LateFunds, payload, now), &mut *tx)
                    .await?;
                debug!(
                    "🗃️ Late transfer {} for terminal invoice [{}] recorded; no state change",
                    transfer.tx_hash, invoice.invoice_id
                );
                Ok(IngressOutcome::LateFunds { invoice })
            },
            CreditOutcome::Credited(credit) => {
                transfers::link_fund(intent.id, transfer.id, transfer.amount, &mut *tx).await?;
                let intent =
                    intents::update_intent_credit(intent.id, credit.new_credited, credit.intent_status, &mut *tx)
                        .await?;
                // Invariant: the intent's running total always equals the sum
                // of its immutable fund links. A mismatch aborts the whole
                // transaction and quarantines the event.
                let ledger_sum: AtomicAmount = transfers::funds_for_intent(intent.id, &mut *tx)
                    .await?
                    .into_iter()
                    .map(|f| f.credited)
                    .sum();
                if ledger_sum != intent.credited_amount {
                    return Err(PaymentGatewayError::InvariantViolation(format!(
                        "fund ledger sums to {ledger_sum} but intent [{}] records {}",
                        intent.intent_id, intent.credited_amount
                    )));
                }
                let tx_hashes: Vec<String> = transfers::funding_rows_for_intent(intent.id, &mut *tx)
                    .await?
                    .into_iter()
                    .map(|(_, hash)| hash)
                    .collect();
                let invoice = if credit.invoice_status == invoice.status {
                    invoice
                } else {
                    invoices::update_invoice_status(invoice.id, credit.invoice_status, &mut *tx).await?
                };
                if credit.newly_paid {
                    let payload = callback_payload(
                        &invoice,
                        InvoiceStatus::Paid.callback_code(),
                        credit.new_credited,
                        Some(&intent),
                        tx_hashes.clone(),
                        now,
                    );
                    outbox::insert(
                        NewOutboxRecord::new(invoice.id, OutboxKind::InvoiceStatusChanged, payload.clone(), now),
                        &mut *tx,
                    )
                    .await?;
                    outbox::insert(
                        NewOutboxRecord::new(invoice.id, OutboxKind::PaidAwaitingConfirmation, payload, now),
                        &mut *tx,
                    )
                    .await?;
                }
                if let Some(surplus) = credit.surplus {
                    let mut payload = callback_payload(
                        &invoice,
                        "OVERPAID",
                        credit.new_credited,
                        Some(&intent),
                        tx_hashes,
                        now,
                    );
                    payload["surplusAtomic"] = serde_json::Value::String(surplus.to_string());
                    outbox::insert(NewOutboxRecord::new(invoice.id, OutboxKind::Overpayment, payload, now), &mut *tx)
                        .await?;
                }
                debug!(
                    "🗃️ Transfer {} credited {} to intent [{}]; invoice [{}] is now {}",
                    transfer.tx_hash, transfer.amount, intent.intent_id, invoice.invoice_id, invoice.status
                );
                Ok(IngressOutcome::Credited {
                    invoice,
                    intent,
                    newly_paid: credit.newly_paid,
                    surplus: credit.surplus,
                })
            },
        }
    }

    async fn process_transfer_event_in_tx(
        &self,
        event: &TransferEvent,
        tx: &mut Transaction<'_, Sqlite>,
    ) -> Result<IngressOutcome, PaymentGatewayError> {
        let transfer = match transfers::idempotent_insert(event, &mut *tx).await? {
            InsertTransferResult::Duplicate(transfer) => {
                trace!("🗃️ Transfer {}#{} already recorded; no side effects", transfer.tx_hash, transfer.log_index);
                return Ok(IngressOutcome::Duplicate);
            },
            InsertTransferResult::Inserted(transfer) => transfer,
        };
        if transfer.amount.is_zero() {
            debug!("🗃️ Zero-amount transfer {} recorded but not credited", transfer.tx_hash);
            return Ok(IngressOutcome::ZeroAmount { transfer_id: transfer.id });
        }
        let intent =
            intents::fetch_intent_for_address(&event.chain, &event.token, &event.to, &mut *tx).await?;
        let Some(intent) = intent else {
            transfers::buffer_unmatched(&transfer, &mut *tx).await?;
            debug!("🗃️ No intent for address {}; transfer {} buffered", event.to, transfer.tx_hash);
            return Ok(IngressOutcome::Unmatched { transfer_id: transfer.id });
        };
        let invoice = invoices::fetch_invoice(intent.invoice_id, &mut *tx)
            .await?
            .ok_or(PaymentGatewayError::InvoiceIdNotFound(intent.invoice_id))?;
        Self::credit_transfer(invoice, intent, &transfer, tx).await
    }
}

impl PaymentGatewayDatabase for SqliteDatabase {
    fn url(&self) -> &str {
        self.url.as_str()
    }

    async fn create_merchant(&self, merchant: NewMerchant) -> Result<Merchant, PaymentGatewayError> {
        let mut conn = self.pool.acquire().await?;
        merchants::insert_merchant(merchant, &mut conn).await
    }

    async fn fetch_merchant(&self, id: i64) -> Result<Option<Merchant>, PaymentGatewayError> {
        let mut conn = self.pool.acquire().await?;
        Ok(merchants::fetch_merchant(id, &mut conn).await?)
    }

    async fn fetch_merchant_by_api_key_hash(
        &self,
        api_key_hash: &str,
    ) -> Result<Option<Merchant>, PaymentGatewayError> {
        let mut conn = self.pool.acquire().await?;
        Ok(merchants::fetch_merchant_by_api_key_hash(api_key_hash, &mut conn).await?)
    }

    async fn create_invoice(&self, invoice: NewInvoice) -> Result<Invoice, PaymentGatewayError> {
        let mut tx = self.pool.begin().await?;
        let invoice = invoices::insert_invoice(invoice, &mut tx).await?;
        tx.commit().await?;
        Ok(invoice)
    }

    async fn fetch_invoice(&self, invoice_id: &InvoiceId) -> Result<Option<Invoice>, PaymentGatewayError> {
        let mut conn = self.pool.acquire().await?;
        Ok(invoices::fetch_invoice_by_invoice_id(invoice_id, &mut conn).await?)
    }

    async fn fetch_invoice_by_id(&self, id: i64) -> Result<Option<Invoice>, PaymentGatewayError> {
        let mut conn = self.pool.acquire().await?;
        Ok(invoices::fetch_invoice(id, &mut conn).await?)
    }

    async fn fetch_invoice_options(&self, invoice: &Invoice) -> Result<Vec<PaymentOption>, PaymentGatewayError> {
        let mut conn = self.pool.acquire().await?;
        Ok(invoices::fetch_options(invoice.id, &mut conn).await?)
    }

    async fn fetch_intents_for_invoice(&self, invoice: &Invoice) -> Result<Vec<PaymentIntent>, PaymentGatewayError> {
        let mut conn = self.pool.acquire().await?;
        Ok(intents::fetch_intents_for_invoice(invoice.id, &mut conn).await?)
    }

    /// Cancels a Pending or Underpaid invoice, closing its live intents and
    /// queueing the `CANCELLED` status callback in the same transaction.
    async fn cancel_invoice(&self, invoice_id: &InvoiceId) -> Result<CancellationResult, PaymentGatewayError> {
        let mut tx = self.pool.begin().await?;
        let invoice = invoices::fetch_invoice_by_invoice_id(invoice_id, &mut tx)
            .await?
            .ok_or_else(|| PaymentGatewayError::InvoiceNotFound(invoice_id.clone()))?;
        match cancel_transition(invoice.status) {
            CancelOutcome::NoOp => {
                debug!("🗃️ Cancel on terminal invoice [{invoice_id}] is a no-op");
                Ok(CancellationResult::AlreadyTerminal(invoice))
            },
            CancelOutcome::Forbidden => Err(PaymentGatewayError::InvoiceNotCancellable(invoice.status)),
            CancelOutcome::Cancel => {
                let now = Utc::now();
                let updated = invoices::update_invoice_status(invoice.id, InvoiceStatus::Cancelled, &mut tx).await?;
                intents::close_live_intents_for_invoice(invoice.id, IntentStatus::Cancelled, &mut tx).await?;
                let payload = callback_payload(
                    &updated,
                    InvoiceStatus::Cancelled.callback_code(),
                    AtomicAmount::ZERO,
                    None,
                    vec![],
                    now,
                );
                outbox::insert(
                    NewOutboxRecord::new(updated.id, OutboxKind::InvoiceStatusChanged, payload, now),
                    &mut tx,
                )
                .await?;
                tx.commit().await?;
                info!("🗃️ Invoice [{invoice_id}] cancelled");
                Ok(CancellationResult::Cancelled(updated))
            },
        }
    }

    /// Each due invoice is transitioned in its own transaction, so a crash
    /// mid-sweep leaves every already-expired invoice consistent and the rest
    /// due on the next run.
    async fn expire_due_invoices(
        &self,
        now: DateTime<Utc>,
        batch_size: u32,
    ) -> Result<ExpirySweepResult, PaymentGatewayError> {
        let due = {
            let mut conn = self.pool.acquire().await?;
            invoices::fetch_due_for_expiry(now, batch_size, &mut conn).await?
        };
        let mut result = ExpirySweepResult::default();
        for id in due {
            let mut tx = self.pool.begin().await?;
            let Some(invoice) = invoices::fetch_invoice(id, &mut tx).await? else {
                continue;
            };
            let live_credited: AtomicAmount = intents::fetch_intents_for_invoice(id, &mut tx)
                .await?
                .into_iter()
                .filter(|i| !i.status.is_terminal())
                .map(|i| i.credited_amount)
                .sum();
            match state_machine::expiry_transition(invoice.status, live_credited) {
                ExpiryOutcome::Skip => continue,
                ExpiryOutcome::Expire { with_partial } => {
                    let updated = invoices::update_invoice_status(id, InvoiceStatus::Expired, &mut tx).await?;
                    intents::close_live_intents_for_invoice(id, IntentStatus::Expired, &mut tx).await?;
                    let payload = callback_payload(
                        &updated,
                        InvoiceStatus::Expired.callback_code(),
                        live_credited,
                        None,
                        vec![],
                        now,
                    );
                    outbox::insert(
                        NewOutboxRecord::new(id, OutboxKind::InvoiceStatusChanged, payload.clone(), now),
                        &mut tx,
                    )
                    .await?;
                    if with_partial {
                        outbox::insert(
                            NewOutboxRecord::new(id, OutboxKind::ExpiredWithPartial, payload, now),
                            &mut tx,
                        )
                        .await?;
                        result.with_partial += 1;
                    }
                    tx.commit().await?;
                    debug!("🗃️ Invoice [{}] expired", updated.invoice_id);
                    result.expired.push(updated);
                },
            }
        }
        Ok(result)
    }

    /// Creates the intent and, in the same transaction, replays buffered
    /// unmatched transfers addressed to the allocated deposit address.
    async fn create_intent(&self, intent: NewPaymentIntent) -> Result<IntentCreated, PaymentGatewayError> {
        let mut tx = self.pool.begin().await?;
        let invoice = invoices::fetch_invoice(intent.invoice_id, &mut tx)
            .await?
            .ok_or(PaymentGatewayError::InvoiceIdNotFound(intent.invoice_id))?;
        match invoice.status {
            InvoiceStatus::Pending | InvoiceStatus::Underpaid => {},
            status => return Err(PaymentGatewayError::InvoiceNotPayable(status)),
        }
        let option = PaymentOption { token: intent.token.clone(), chain: intent.chain.clone() };
        if !invoices::is_option_allowed(invoice.id, &option, &mut tx).await? {
            return Err(PaymentGatewayError::OptionNotAllowed {
                token: option.token.to_string(),
                chain: option.chain.to_string(),
            });
        }
        if let Some(existing) =
            intents::fetch_live_intent_for_option(invoice.id, &intent.token, &intent.chain, &mut tx).await?
        {
            trace!("🗃️ Returning existing live intent [{}] for invoice [{}]", existing.intent_id, invoice.invoice_id);
            return Ok(IntentCreated { intent: existing, replayed_transfers: 0, existing: true });
        }
        let row = intents::insert_intent(intent.clone(), &mut tx).await?;
        // Address reuse across expired invoices: transfers that arrived before
        // this intent existed are credited now, in arrival order.
        let buffered =
            transfers::take_unmatched_for(&intent.chain, &intent.token, &intent.deposit_address, &mut tx).await?;
        let mut replayed = 0u32;
        let mut invoice = invoice;
        let mut row = row;
        for transfer in &buffered {
            match Self::credit_transfer(invoice.clone(), row.clone(), transfer, &mut tx).await? {
                IngressOutcome::Credited { invoice: inv, intent: i, .. } => {
                    invoice = inv;
                    row = i;
                    replayed += 1;
                },
                _ => continue,
            }
        }
        tx.commit().await?;
        if replayed > 0 {
            info!("🗃️ Replayed {replayed} buffered transfers against new intent [{}]", row.intent_id);
        }
        Ok(IntentCreated { intent: row, replayed_transfers: replayed, existing: false })
    }

    async fn fetch_intent(&self, intent_id: &IntentId) -> Result<Option<PaymentIntent>, PaymentGatewayError> {
        let mut conn = self.pool.acquire().await?;
        Ok(intents::fetch_intent_by_intent_id(intent_id, &mut conn).await?)
    }

    async fn fetch_live_intent(
        &self,
        invoice_id: i64,
        option: &PaymentOption,
    ) -> Result<Option<PaymentIntent>, PaymentGatewayError> {
        let mut conn = self.pool.acquire().await?;
        Ok(intents::fetch_live_intent_for_option(invoice_id, &option.token, &option.chain, &mut conn).await?)
    }

    /// Takes a normalized transfer event and, in a single atomic transaction,
    /// records the transfer, matches it to an intent and applies the credit
    /// rule, writing every implied outbox row in the same commit. A
    /// double-credit attempt aborts the transaction and quarantines the event.
    async fn process_transfer_event(&self, event: TransferEvent) -> Result<IngressOutcome, PaymentGatewayError> {
        let mut tx = self.pool.begin().await?;
        match self.process_transfer_event_in_tx(&event, &mut tx).await {
            Ok(outcome) => {
                tx.commit().await?;
                Ok(outcome)
            },
            Err(e @ PaymentGatewayError::InvariantViolation(_)) => {
                drop(tx);
                error!("🗃️ Invariant violation while ingesting {}#{}: {e}", event.tx_hash, event.log_index);
                let payload = serde_json::to_string(&event).unwrap_or_else(|_| event.tx_hash.clone());
                let mut conn = self.pool.acquire().await?;
                transfers::quarantine_event(&payload, &e.to_string(), &mut conn).await?;
                Err(e)
            },
            Err(e) => Err(e),
        }
    }

    async fn fetch_confirmation_context(
        &self,
        invoice_id: i64,
    ) -> Result<Option<ConfirmationContext>, PaymentGatewayError> {
        let mut conn = self.pool.acquire().await?;
        let Some(invoice) = invoices::fetch_invoice(invoice_id, &mut conn).await? else {
            return Ok(None);
        };
        let Some(intent) = intents::fetch_funding_intent(invoice_id, &mut conn).await? else {
            return Ok(None);
        };
        let funding = transfers::funding_rows_for_intent(intent.id, &mut conn).await?;
        let (funding_blocks, tx_hashes) = funding.into_iter().unzip();
        Ok(Some(ConfirmationContext { invoice, intent, funding_blocks, tx_hashes }))
    }

    async fn try_confirm_invoice(
        &self,
        invoice_id: i64,
        current_block: i64,
        threshold: i64,
    ) -> Result<ConfirmationResult, PaymentGatewayError> {
        let mut tx = self.pool.begin().await?;
        let Some(invoice) = invoices::fetch_invoice(invoice_id, &mut tx).await? else {
            return Ok(ConfirmationResult::NotApplicable);
        };
        let Some(intent) = intents::fetch_funding_intent(invoice_id, &mut tx).await? else {
            return Ok(ConfirmationResult::NotApplicable);
        };
        let funding = transfers::funding_rows_for_intent(intent.id, &mut tx).await?;
        let (blocks, tx_hashes): (Vec<i64>, Vec<String>) = funding.into_iter().unzip();
        let now = Utc::now();
        match confirmation_outcome(invoice.status, &blocks, current_block, threshold) {
            ConfirmationOutcome::Confirm => {
                let updated = invoices::update_invoice_status(invoice.id, InvoiceStatus::Confirmed, &mut tx).await?;
                let intent = intents::update_intent_status(intent.id, IntentStatus::Confirmed, &mut tx).await?;
                let payload = callback_payload(
                    &updated,
                    InvoiceStatus::Confirmed.callback_code(),
                    intent.credited_amount,
                    Some(&intent),
                    tx_hashes,
                    now,
                );
                outbox::insert(
                    NewOutboxRecord::new(updated.id, OutboxKind::InvoiceStatusChanged, payload, now),
                    &mut tx,
                )
                .await?;
                tx.commit().await?;
                info!("🗃️ Invoice [{}] confirmed at block {current_block}", updated.invoice_id);
                Ok(ConfirmationResult::Confirmed { invoice: updated })
            },
            ConfirmationOutcome::Wait { min_confirmations } => {
                trace!(
                    "🗃️ Invoice [{}] still waiting: {min_confirmations}/{threshold} confirmations",
                    invoice.invoice_id
                );
                Ok(ConfirmationResult::NotReady { min_confirmations })
            },
            ConfirmationOutcome::ChargebackSuspected { min_confirmations } => {
                let payload = callback_payload(
                    &invoice,
                    invoice.status.callback_code(),
                    intent.credited_amount,
                    Some(&intent),
                    tx_hashes,
                    now,
                );
                outbox::insert(
                    NewOutboxRecord::new(invoice.id, OutboxKind::ChargebackSuspected, payload, now),
                    &mut tx,
                )
                .await?;
                tx.commit().await?;
                warn!(
                    "🗃️ Invoice [{}] regressed to {min_confirmations}/{threshold} confirmations after the merchant \
                     was notified",
                    invoice.invoice_id
                );
                Ok(ConfirmationResult::ChargebackSuspected)
            },
            ConfirmationOutcome::NotApplicable => Ok(ConfirmationResult::NotApplicable),
        }
    }

    async fn claim_due_outbox(
        &self,
        now: DateTime<Utc>,
        limit: u32,
        visibility_timeout: Duration,
    ) -> Result<Vec<OutboxRecord>, PaymentGatewayError> {
        let mut conn = self.pool.acquire().await?;
        outbox::claim_due(now, limit, visibility_timeout, &mut conn).await
    }

    async fn release_expired_claims(&self, now: DateTime<Utc>) -> Result<u64, PaymentGatewayError> {
        let mut conn = self.pool.acquire().await?;
        outbox::release_expired_claims(now, &mut conn).await
    }

    async fn complete_outbox(&self, id: i64, claim_token: &str) -> Result<(), PaymentGatewayError> {
        let mut conn = self.pool.acquire().await?;
        outbox::complete(id, claim_token, &mut conn).await
    }

    async fn retry_outbox(
        &self,
        id: i64,
        claim_token: &str,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), PaymentGatewayError> {
        let mut conn = self.pool.acquire().await?;
        outbox::retry(id, claim_token, next_attempt_at, error, &mut conn).await
    }

    async fn bury_outbox(&self, id: i64, claim_token: &str, error: &str) -> Result<(), PaymentGatewayError> {
        let mut conn = self.pool.acquire().await?;
        outbox::bury(id, claim_token, error, &mut conn).await
    }

    async fn reschedule_outbox(
        &self,
        id: i64,
        claim_token: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), PaymentGatewayError> {
        let mut conn = self.pool.acquire().await?;
        outbox::reschedule(id, claim_token, next_attempt_at, &mut conn).await
    }

    async fn fetch_outbox_record(&self, id: i64) -> Result<Option<OutboxRecord>, PaymentGatewayError> {
        let mut conn = self.pool.acquire().await?;
        Ok(outbox::fetch(id, &mut conn).await?)
    }

    async fn fetch_outbox_for_invoice(&self, invoice_id: i64) -> Result<Vec<OutboxRecord>, PaymentGatewayError> {
        let mut conn = self.pool.acquire().await?;
        Ok(outbox::fetch_for_invoice(invoice_id, &mut conn).await?)
    }

    async fn fetch_idempotency_record(
        &self,
        scope: IdempotencyScope,
        key: &str,
    ) -> Result<Option<IdempotencyRecord>, PaymentGatewayError> {
        let mut conn = self.pool.acquire().await?;
        Ok(idempotency::fetch(scope, key, &mut conn).await?)
    }

    async fn store_idempotency_record(&self, record: IdempotencyRecord) -> Result<bool, PaymentGatewayError> {
        let mut conn = self.pool.acquire().await?;
        idempotency::store(record, &mut conn).await
    }

    async fn purge_expired_idempotency(&self, now: DateTime<Utc>) -> Result<u64, PaymentGatewayError> {
        let mut conn = self.pool.acquire().await?;
        idempotency::purge_expired(now, &mut conn).await
    }

    async fn acquire_lease(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, PaymentGatewayError> {
        let mut conn = self.pool.acquire().await?;
        locks::acquire(name, holder, ttl, now, &mut conn).await
    }

    async fn release_lease(&self, name: &str, holder: &str) -> Result<(), PaymentGatewayError> {
        let mut conn = self.pool.acquire().await?;
        locks::release(name, holder, &mut conn).await
    }

    async fn close(&mut self) -> Result<(), PaymentGatewayError> {
        self.pool.close().await;
        Ok(())
    }
}

impl AddressAllocator for SqliteDatabase {
    async fn allocate_address(&self, chain: &Chain) -> Result<Address, AllocatorError> {
        let mut conn =
            self.pool.acquire().await.map_err(|e| AllocatorError::DatabaseError(e.to_string()))?;
        addresses::fetch_free_address(chain, &mut conn)
            .await
            .map_err(|e| AllocatorError::DatabaseError(e.to_string()))?
            .ok_or_else(|| AllocatorError::Exhausted(chain.to_string()))
    }

    async fn seed_addresses(&self, chain: &Chain, list: &[Address]) -> Result<u64, AllocatorError> {
        let mut conn =
            self.pool.acquire().await.map_err(|e| AllocatorError::DatabaseError(e.to_string()))?;
        addresses::seed(chain, list, &mut conn).await.map_err(|e| AllocatorError::DatabaseError(e.to_string()))
    }
}

/// Build the merchant-facing callback body for an invoice event. The
/// dispatcher injects `deliveryId` from the outbox row at send time so every
/// retry carries the same id.
fn callback_payload(
    invoice: &Invoice,
    status: &str,
    paid: AtomicAmount,
    intent: Option<&PaymentIntent>,
    tx_hashes: Vec<String>,
    occurred_at: DateTime<Utc>,
) -> serde_json::Value {
    let payload = CallbackPayload {
        delivery_id: None,
        invoice_id: invoice.invoice_id.clone(),
        merchant_order_id: invoice.merchant_order_id.clone(),
        status: status.to_string(),
        paid_amount_atomic: paid,
        token: intent.map(|i| i.token.clone()),
        chain: intent.map(|i| i.chain.clone()),
        tx_hashes,
        occurred_at,
    };
    serde_json::to_value(payload).expect("callback payload serialization cannot fail")
}
