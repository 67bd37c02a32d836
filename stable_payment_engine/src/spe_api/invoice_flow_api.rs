use std::fmt::Debug;

use chrono::{DateTime, Utc};
use log::*;
use spg_common::USD_CURRENCY_CODE;

use crate::{
    db_types::{Invoice, InvoiceId, NewInvoice, NewPaymentIntent, PaymentIntent, PaymentOption, TransferEvent},
    traits::{
        AddressAllocator,
        AllocatorError,
        CancellationResult,
        ConfirmationResult,
        ExpirySweepResult,
        IngressOutcome,
        IntentCreated,
        PaymentGatewayDatabase,
        PaymentGatewayError,
        TokenPricer,
    },
};

/// How many times intent creation re-draws an address when another intent
/// grabs the allocated one concurrently.
const ADDRESS_ALLOCATION_ATTEMPTS: u32 = 3;

/// `InvoiceFlowApi` is the primary API for the invoice lifecycle: creation,
/// intent selection, transfer ingress, cancellation and expiry. It layers
/// input validation and logging over a [`PaymentGatewayDatabase`] backend;
/// the transactional guarantees live in the backend itself.
pub struct InvoiceFlowApi<B> {
    db: B,
}

impl<B> Debug for InvoiceFlowApi<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "InvoiceFlowApi")
    }
}

impl<B> InvoiceFlowApi<B> {
    pub fn new(db: B) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &B {
        &self.db
    }

    pub fn db_mut(&mut self) -> &mut B {
        &mut self.db
    }
}

impl<B> InvoiceFlowApi<B>
where B: PaymentGatewayDatabase
{
    /// Create a new invoice for a merchant.
    ///
    /// Validation failures never touch state. A duplicate merchant order id
    /// surfaces as [`PaymentGatewayError::InvoiceAlreadyExists`]; idempotent
    /// retries of the whole request are handled above this layer with
    /// idempotency keys.
    pub async fn create_invoice(&self, invoice: NewInvoice) -> Result<Invoice, PaymentGatewayError> {
        validate_new_invoice(&invoice)?;
        let created = self.db.create_invoice(invoice).await?;
        info!(
            "🔄️📦️ Invoice [{}] created for merchant #{} ({} due by {})",
            created.invoice_id, created.merchant_id, created.fiat_amount, created.expires_at
        );
        Ok(created)
    }

    pub async fn fetch_invoice(&self, invoice_id: &InvoiceId) -> Result<Option<Invoice>, PaymentGatewayError> {
        self.db.fetch_invoice(invoice_id).await
    }

    pub async fn invoice_options(&self, invoice: &Invoice) -> Result<Vec<PaymentOption>, PaymentGatewayError> {
        self.db.fetch_invoice_options(invoice).await
    }

    pub async fn invoice_intents(&self, invoice: &Invoice) -> Result<Vec<PaymentIntent>, PaymentGatewayError> {
        self.db.fetch_intents_for_invoice(invoice).await
    }

    /// Ingest a normalized transfer event from the provider.
    ///
    /// Returns success iff the event is durably recorded; replaying a
    /// `(chain, txHash, logIndex)` triple is a success no-op.
    pub async fn process_transfer_event(&self, event: TransferEvent) -> Result<IngressOutcome, PaymentGatewayError> {
        validate_transfer_event(&event)?;
        let outcome = self.db.process_transfer_event(event).await?;
        match &outcome {
            IngressOutcome::Credited { invoice, intent, newly_paid, .. } => {
                debug!(
                    "🔄️💰️ Credit applied to intent [{}]; invoice [{}] is {}{}",
                    intent.intent_id,
                    invoice.invoice_id,
                    invoice.status,
                    if *newly_paid { " (newly paid)" } else { "" }
                );
            },
            IngressOutcome::LateFunds { invoice } => {
                info!("🔄️💰️ Late funds recorded against terminal invoice [{}]", invoice.invoice_id);
            },
            IngressOutcome::Duplicate => trace!("🔄️💰️ Duplicate transfer event ignored"),
            IngressOutcome::Unmatched { transfer_id } => {
                info!("🔄️💰️ Transfer #{transfer_id} has no matching intent and was buffered");
            },
            IngressOutcome::ZeroAmount { transfer_id } => {
                debug!("🔄️💰️ Zero-amount transfer #{transfer_id} recorded, not credited");
            },
        }
        Ok(outcome)
    }

    /// Administrative cancel. No-op on terminal invoices; forbidden on paid ones.
    pub async fn cancel_invoice(&self, invoice_id: &InvoiceId) -> Result<CancellationResult, PaymentGatewayError> {
        let result = self.db.cancel_invoice(invoice_id).await?;
        if let CancellationResult::Cancelled(invoice) = &result {
            info!("🔄️❌️ Invoice [{}] cancelled", invoice.invoice_id);
        }
        Ok(result)
    }

    /// One sweep of the expiry worker. Idempotent per invoice.
    pub async fn expire_due_invoices(
        &self,
        now: DateTime<Utc>,
        batch_size: u32,
    ) -> Result<ExpirySweepResult, PaymentGatewayError> {
        let result = self.db.expire_due_invoices(now, batch_size).await?;
        if result.total_count() > 0 {
            info!(
                "🔄️🕰️ {} invoices expired ({} with partial payment)",
                result.total_count(),
                result.with_partial
            );
        }
        Ok(result)
    }

    /// Evaluate the confirmation rule for an invoice at the given chain tip.
    pub async fn try_confirm_invoice(
        &self,
        invoice_id: i64,
        current_block: i64,
        threshold: i64,
    ) -> Result<ConfirmationResult, PaymentGatewayError> {
        self.db.try_confirm_invoice(invoice_id, current_block, threshold).await
    }
}

impl<B> InvoiceFlowApi<B>
where B: PaymentGatewayDatabase + AddressAllocator
{
    /// Create (or return) the payment intent for the buyer's chosen (token,
    /// chain) option: quote the atomic target, draw a deposit address from
    /// the allocator and insert the intent, replaying any buffered transfers
    /// for the address in the same transaction.
    pub async fn create_intent<P: TokenPricer>(
        &self,
        invoice_id: &InvoiceId,
        option: PaymentOption,
        pricer: &P,
    ) -> Result<(Invoice, IntentCreated), PaymentGatewayError> {
        let invoice = self
            .db
            .fetch_invoice(invoice_id)
            .await?
            .ok_or_else(|| PaymentGatewayError::InvoiceNotFound(invoice_id.clone()))?;
        // A repeat request for the same option returns the live intent without
        // touching the allocator (whose pool the intent's own address is in).
        if let Some(existing) = self.db.fetch_live_intent(invoice.id, &option).await? {
            return Ok((invoice, IntentCreated { intent: existing, replayed_transfers: 0, existing: true }));
        }
        let target = pricer
            .quote(invoice.fiat_amount, &invoice.currency, &option.token, &option.chain)
            .map_err(|e| PaymentGatewayError::Validation(e.to_string()))?;
        let mut attempt = 0;
        loop {
            let address = self.db.allocate_address(&option.chain).await.map_err(|e| match e {
                AllocatorError::Exhausted(chain) => PaymentGatewayError::NoDepositAddressAvailable(chain),
                AllocatorError::DatabaseError(e) => PaymentGatewayError::DatabaseError(e),
            })?;
            let new_intent = NewPaymentIntent {
                invoice_id: invoice.id,
                token: option.token.clone(),
                chain: option.chain.clone(),
                deposit_address: address,
                target_amount: target,
            };
            match self.db.create_intent(new_intent).await {
                Err(PaymentGatewayError::DepositAddressBusy(addr))
                    if attempt + 1 < ADDRESS_ALLOCATION_ATTEMPTS =>
                {
                    // Another intent raced us to the address; draw again.
                    debug!("🔄️📦️ Address {addr} was taken concurrently, redrawing");
                    attempt += 1;
                },
                Err(e) => return Err(e),
                Ok(created) => {
                    if !created.existing {
                        info!(
                            "🔄️📦️ Intent [{}] created for invoice [{}]: {} {} to {}",
                            created.intent.intent_id,
                            invoice.invoice_id,
                            created.intent.target_amount,
                            created.intent.token,
                            created.intent.deposit_address
                        );
                    }
                    return Ok((invoice, created));
                },
            }
        }
    }
}

fn validate_new_invoice(invoice: &NewInvoice) -> Result<(), PaymentGatewayError> {
    if invoice.fiat_amount.value() <= 0 {
        return Err(PaymentGatewayError::Validation("fiatAmount must be positive".into()));
    }
    if invoice.currency != USD_CURRENCY_CODE {
        return Err(PaymentGatewayError::Validation(format!("Unsupported currency: {}", invoice.currency)));
    }
    if invoice.merchant_order_id.trim().is_empty() {
        return Err(PaymentGatewayError::Validation("merchantOrderId must not be empty".into()));
    }
    if invoice.allowed_options.is_empty() {
        return Err(PaymentGatewayError::Validation("allowedOptions must not be empty".into()));
    }
    if !invoice.callback_url.starts_with("http://") && !invoice.callback_url.starts_with("https://") {
        return Err(PaymentGatewayError::Validation("callbackUrl must be an http(s) URL".into()));
    }
    Ok(())
}

fn validate_transfer_event(event: &TransferEvent) -> Result<(), PaymentGatewayError> {
    if event.tx_hash.trim().is_empty() {
        return Err(PaymentGatewayError::Validation("txHash must not be empty".into()));
    }
    if event.log_index < 0 {
        return Err(PaymentGatewayError::Validation("logIndex must not be negative".into()));
    }
    if event.block_number < 0 {
        return Err(PaymentGatewayError::Validation("blockNumber must not be negative".into()));
    }
    if event.amount.value() < 0 {
        return Err(PaymentGatewayError::Validation("amount must not be negative".into()));
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use chrono::Utc;
    use spg_common::{AtomicAmount, FiatCents};

    use super::*;
    use crate::db_types::{Address, Chain, Token};

    fn valid_invoice() -> NewInvoice {
        NewInvoice {
            merchant_id: 1,
            merchant_order_id: "order-1001".into(),
            fiat_amount: FiatCents::from(1000),
            currency: "USD".into(),
            callback_url: "https://merchant.example/callback".into(),
            allowed_options: vec![PaymentOption { token: Token::from("USDT"), chain: Chain::from("arbitrum") }],
            expires_at: Utc::now(),
        }
    }

    #[test]
    fn invoice_validation_rejects_bad_input() {
        assert!(validate_new_invoice(&valid_invoice()).is_ok());

        let mut invoice = valid_invoice();
        invoice.fiat_amount = FiatCents::from(0);
        assert!(validate_new_invoice(&invoice).is_err());

        let mut invoice = valid_invoice();
        invoice.currency = "EUR".into();
        assert!(validate_new_invoice(&invoice).is_err());

        let mut invoice = valid_invoice();
        invoice.allowed_options.clear();
        assert!(validate_new_invoice(&invoice).is_err());

        let mut invoice = valid_invoice();
        invoice.callback_url = "ftp://merchant.example".into();
        assert!(validate_new_invoice(&invoice).is_err());
    }

    #[test]
    fn transfer_event_validation_rejects_bad_input() {
        let event = TransferEvent {
            chain: Chain::from("arbitrum"),
            tx_hash: "0x1".into(),
            log_index: 0,
            token: Token::from("USDT"),
            to: Address::from("0xA"),
            amount: AtomicAmount::from(1i64),
            block_number: 100,
            provider_event_id: None,
        };
        assert!(validate_transfer_event(&event).is_ok());

        let mut bad = event.clone();
        bad.tx_hash = " ".into();
        assert!(validate_transfer_event(&bad).is_err());

        let mut bad = event.clone();
        bad.log_index = -1;
        assert!(validate_transfer_event(&bad).is_err());

        let mut bad = event;
        bad.amount = AtomicAmount::from(-5i64);
        assert!(validate_transfer_event(&bad).is_err());
    }
}
