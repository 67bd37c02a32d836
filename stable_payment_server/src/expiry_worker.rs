use chrono::{Duration, Utc};
use log::*;
use stable_payment_engine::{InvoiceFlowApi, PaymentGatewayDatabase, SqliteDatabase};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::SweeperConfig;

const SWEEPER_LEASE: &str = "invoice-expiry-sweeper";

/// Starts the expiry sweeper. Do not await the returned JoinHandle, as it
/// will run indefinitely.
///
/// The sweeper is safe to run on every instance of the server: a cooperative
/// lease in the `locks` table ensures only one is active at a time, and a
/// crashed holder is replaced once its lease lapses.
pub fn start_expiry_worker(db: SqliteDatabase, config: SweeperConfig) -> JoinHandle<()> {
    tokio::spawn(async move {
        let holder = Uuid::new_v4().to_string();
        let api = InvoiceFlowApi::new(db.clone());
        let mut timer = tokio::time::interval(config.interval);
        info!("🕰️ Invoice expiry worker started (holder {holder})");
        loop {
            timer.tick().await;
            let now = Utc::now();
            match db.acquire_lease(SWEEPER_LEASE, &holder, Duration::seconds(config.lease_secs), now).await {
                Ok(true) => {},
                Ok(false) => {
                    trace!("🕰️ Another instance holds the sweeper lease; skipping this cycle");
                    continue;
                },
                Err(e) => {
                    error!("🕰️ Could not acquire the sweeper lease: {e}");
                    continue;
                },
            }
            match api.expire_due_invoices(now, config.batch_size).await {
                Ok(result) if result.total_count() > 0 => {
                    info!(
                        "🕰️ {} invoices expired ({} with partial payment)",
                        result.total_count(),
                        result.with_partial
                    );
                    for invoice in &result.expired {
                        debug!("🕰️ Expired invoice [{}] (order {})", invoice.invoice_id, invoice.merchant_order_id);
                    }
                },
                Ok(_) => trace!("🕰️ No invoices due for expiry"),
                Err(e) => error!("🕰️ Error running invoice expiry sweep: {e}"),
            }
            // Idempotency-cache housekeeping rides on the same lease.
            match db.purge_expired_idempotency(now).await {
                Ok(0) => {},
                Ok(purged) => debug!("🕰️ Purged {purged} expired idempotency records"),
                Err(e) => error!("🕰️ Error purging idempotency records: {e}"),
            }
        }
    })
}
