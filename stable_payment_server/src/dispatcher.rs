//! The outbox dispatcher.
//!
//! Drains the outbox with at-least-once semantics: claims due rows through
//! the visibility-timeout protocol, delivers signed callbacks to merchants,
//! drives confirmation polling against the chain provider, and applies
//! exponential backoff with jitter on transient failures. Permanent merchant
//! failures (4xx other than 408/425/429) mark the row Dead; the invoice
//! state is never reverted.

use chrono::{Duration, Utc};
use log::*;
use serde_json::Value;
use stable_payment_engine::{
    db_types::{IdempotencyRecord, IdempotencyScope, Invoice, Merchant, OutboxKind, OutboxRecord},
    helpers::{callback_signature, BackoffPolicy, IDEMPOTENCY_KEY_HEADER},
    traits::{ChainProvider, ConfirmationResult},
    PaymentGatewayDatabase,
    PaymentGatewayError,
    SqliteDatabase,
};
use tokio::task::JoinHandle;

use crate::config::ServerConfig;

/// What a delivery attempt told us about the merchant endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Delivered,
    Transient,
    Permanent,
}

/// 2xx is success; 4xx is permanent except the retryable trio 408/425/429;
/// everything else (5xx, transport) is transient.
fn classify_status(status: u16) -> Disposition {
    match status {
        200..=299 => Disposition::Delivered,
        408 | 425 | 429 => Disposition::Transient,
        400..=499 => Disposition::Permanent,
        _ => Disposition::Transient,
    }
}

pub struct OutboxDispatcher<C: ChainProvider> {
    db: SqliteDatabase,
    provider: C,
    config: ServerConfig,
    client: reqwest::Client,
    policy: BackoffPolicy,
}

impl<C: ChainProvider + 'static> OutboxDispatcher<C> {
    pub fn new(db: SqliteDatabase, provider: C, config: ServerConfig) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(config.callback.connect_timeout)
            .timeout(config.callback.timeout)
            .user_agent("spg-callback/1.0")
            .build()
            .expect("Failed to create HTTP client");
        let policy = BackoffPolicy::new(
            config.callback.backoff_base,
            config.callback.backoff_cap,
            config.callback.max_attempts,
        );
        Self { db, provider, config, client, policy }
    }

    /// Starts the dispatch loop. Do not await the returned JoinHandle, as it
    /// runs indefinitely.
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(self.config.dispatcher.interval);
            info!("📨️ Outbox dispatcher started");
            loop {
                timer.tick().await;
                if let Err(e) = self.run_once().await {
                    error!("📨️ Dispatch cycle failed: {e}");
                }
            }
        })
    }

    /// One dispatch cycle: recover lapsed claims, then claim and work a batch.
    pub async fn run_once(&self) -> Result<usize, PaymentGatewayError> {
        let now = Utc::now();
        let released = self.db.release_expired_claims(now).await?;
        if released > 0 {
            warn!("📨️ Released {released} outbox claims from crashed or stalled workers");
        }
        let batch = self
            .db
            .claim_due_outbox(
                now,
                self.config.dispatcher.batch_size,
                Duration::seconds(self.config.dispatcher.visibility_timeout_secs),
            )
            .await?;
        let claimed = batch.len();
        for record in batch {
            if let Err(e) = self.handle_record(&record).await {
                // ClaimMismatch means another worker took over after our
                // visibility timeout lapsed; everything else is logged and
                // retried by the claim machinery.
                if matches!(e, PaymentGatewayError::ClaimMismatch) {
                    debug!("📨️ Lost the claim on outbox row {}", record.id);
                } else {
                    error!("📨️ Error handling outbox row {}: {e}", record.id);
                }
            }
        }
        Ok(claimed)
    }

    async fn handle_record(&self, record: &OutboxRecord) -> Result<(), PaymentGatewayError> {
        match record.kind {
            OutboxKind::PaidAwaitingConfirmation => self.check_confirmations(record).await,
            _ => self.deliver_callback(record).await,
        }
    }

    /// Deliver one signed callback. The `delivery_id` rides along as the
    /// `Idempotency-Key` header on every attempt so the merchant can dedupe.
    async fn deliver_callback(&self, record: &OutboxRecord) -> Result<(), PaymentGatewayError> {
        let claim_token = record.claim_token.as_deref().ok_or(PaymentGatewayError::ClaimMismatch)?;
        let Some((invoice, merchant)) = self.invoice_and_merchant(record).await? else {
            return self.db.bury_outbox(record.id, claim_token, "invoice or merchant no longer exists").await;
        };
        if record.kind.is_informational() && merchant.suppress_info_callbacks {
            trace!("📨️ Informational callback {} suppressed for merchant #{}", record.id, merchant.id);
            return self.db.complete_outbox(record.id, claim_token).await;
        }
        // At most one successful delivery is recorded per delivery id; a
        // re-claimed row whose 2xx was already recorded completes quietly.
        if self
            .db
            .fetch_idempotency_record(IdempotencyScope::CallbackDelivery, &record.delivery_id)
            .await?
            .is_some()
        {
            return self.db.complete_outbox(record.id, claim_token).await;
        }

        let body = match self.render_payload(record) {
            Ok(body) => body,
            Err(e) => return self.db.bury_outbox(record.id, claim_token, &e).await,
        };
        let timestamp = Utc::now().timestamp();
        let signature = callback_signature::sign(&merchant.callback_secret, timestamp, body.as_bytes());

        let response = self
            .client
            .post(&invoice.callback_url)
            .header("Content-Type", "application/json")
            .header(callback_signature::SIGNATURE_HEADER, signature)
            .header(callback_signature::SIGNATURE_TIMESTAMP_HEADER, timestamp.to_string())
            .header(IDEMPOTENCY_KEY_HEADER, &record.delivery_id)
            .body(body.clone())
            .send()
            .await;

        let (disposition, detail) = match &response {
            Ok(r) => (classify_status(r.status().as_u16()), format!("HTTP {}", r.status().as_u16())),
            Err(e) => (Disposition::Transient, format!("transport error: {e}")),
        };
        match disposition {
            Disposition::Delivered => {
                self.db
                    .store_idempotency_record(IdempotencyRecord {
                        scope: IdempotencyScope::CallbackDelivery,
                        key: record.delivery_id.clone(),
                        fingerprint: crate::helpers::sha256_hex(body.as_bytes()),
                        response_status: 200,
                        response_body: String::new(),
                        expires_at: Utc::now() + Duration::days(7),
                        created_at: Utc::now(),
                    })
                    .await?;
                info!(
                    "📨️ Delivered {} callback {} for invoice #{} ({detail})",
                    record.kind, record.delivery_id, record.invoice_id
                );
                self.db.complete_outbox(record.id, claim_token).await
            },
            Disposition::Permanent => {
                warn!(
                    "📨️ Merchant rejected {} callback {} permanently ({detail}); burying",
                    record.kind, record.delivery_id
                );
                self.db.bury_outbox(record.id, claim_token, &detail).await
            },
            Disposition::Transient => self.retry_or_bury(record, claim_token, &detail).await,
        }
    }

    /// Drive one confirmation poll for a paid invoice: read the chain tip and
    /// let the engine decide. The task reschedules itself until the invoice
    /// confirms (at which point the CONFIRMED callback row was co-committed
    /// by the engine) or stops being confirmable.
    async fn check_confirmations(&self, record: &OutboxRecord) -> Result<(), PaymentGatewayError> {
        let claim_token = record.claim_token.as_deref().ok_or(PaymentGatewayError::ClaimMismatch)?;
        let Some(context) = self.db.fetch_confirmation_context(record.invoice_id).await? else {
            return self.db.complete_outbox(record.id, claim_token).await;
        };
        let chain = context.intent.chain.clone();
        let Some(threshold) = self.config.confirmations_for(&chain) else {
            let detail = format!("no confirmation threshold configured for chain {chain}");
            error!("📨️ {detail}");
            return self.retry_or_bury(record, claim_token, &detail).await;
        };
        let current_block = match self.provider.block_height(&chain).await {
            Ok(height) => height,
            Err(e) => {
                let detail = format!("provider error: {e}");
                return self.retry_or_bury(record, claim_token, &detail).await;
            },
        };
        match self.db.try_confirm_invoice(record.invoice_id, current_block, threshold).await? {
            ConfirmationResult::Confirmed { invoice } => {
                info!("📨️ Invoice [{}] confirmed; poll task complete", invoice.invoice_id);
                self.db.complete_outbox(record.id, claim_token).await
            },
            ConfirmationResult::NotReady { min_confirmations } => {
                trace!(
                    "📨️ Invoice #{} at {min_confirmations}/{threshold} confirmations; polling again",
                    record.invoice_id
                );
                let next = Utc::now() + Duration::seconds(self.config.dispatcher.confirmation_poll_secs);
                self.db.reschedule_outbox(record.id, claim_token, next).await
            },
            ConfirmationResult::ChargebackSuspected | ConfirmationResult::NotApplicable => {
                self.db.complete_outbox(record.id, claim_token).await
            },
        }
    }

    async fn retry_or_bury(
        &self,
        record: &OutboxRecord,
        claim_token: &str,
        detail: &str,
    ) -> Result<(), PaymentGatewayError> {
        let attempts = record.attempts as u32;
        if self.policy.is_exhausted(attempts + 1) {
            warn!("📨️ Outbox row {} exhausted its {} attempts ({detail}); burying", record.id, attempts + 1);
            self.db.bury_outbox(record.id, claim_token, detail).await
        } else {
            let next = self.policy.next_attempt_at(Utc::now(), attempts);
            debug!("📨️ Outbox row {} failed transiently ({detail}); retrying at {next}", record.id);
            self.db.retry_outbox(record.id, claim_token, next, detail).await
        }
    }

    async fn invoice_and_merchant(
        &self,
        record: &OutboxRecord,
    ) -> Result<Option<(Invoice, Merchant)>, PaymentGatewayError> {
        let Some(invoice) = self.db.fetch_invoice_by_id(record.invoice_id).await? else {
            return Ok(None);
        };
        let Some(merchant) = self.db.fetch_merchant(invoice.merchant_id).await? else {
            return Ok(None);
        };
        Ok(Some((invoice, merchant)))
    }

    /// The stored payload plus the row's stable `deliveryId`.
    fn render_payload(&self, record: &OutboxRecord) -> Result<String, String> {
        let mut payload: Value =
            serde_json::from_str(&record.payload).map_err(|e| format!("unreadable payload: {e}"))?;
        payload["deliveryId"] = Value::String(record.delivery_id.clone());
        Ok(payload.to_string())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn http_status_classification_follows_the_retry_contract() {
        assert_eq!(classify_status(200), Disposition::Delivered);
        assert_eq!(classify_status(204), Disposition::Delivered);
        // Permanent client errors kill the row.
        assert_eq!(classify_status(400), Disposition::Permanent);
        assert_eq!(classify_status(404), Disposition::Permanent);
        assert_eq!(classify_status(410), Disposition::Permanent);
        // The retryable 4xx trio and all 5xx are transient.
        assert_eq!(classify_status(408), Disposition::Transient);
        assert_eq!(classify_status(425), Disposition::Transient);
        assert_eq!(classify_status(429), Disposition::Transient);
        assert_eq!(classify_status(500), Disposition::Transient);
        assert_eq!(classify_status(503), Disposition::Transient);
    }
}
