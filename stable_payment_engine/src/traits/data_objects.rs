use spg_common::AtomicAmount;

use crate::db_types::{Invoice, PaymentIntent};

/// The result of ingesting one normalized transfer event.
#[derive(Debug, Clone)]
pub enum IngressOutcome {
    /// The `(chain, tx_hash, log_index)` triple was already recorded. Success, no side effects.
    Duplicate,
    /// Recorded, but zero-amount transfers are never credited.
    ZeroAmount { transfer_id: i64 },
    /// Recorded and buffered; no live intent owns the destination address.
    Unmatched { transfer_id: i64 },
    /// The owning invoice is terminal; the transfer was recorded and a
    /// `LateFunds` outbox row queued.
    LateFunds { invoice: Invoice },
    /// The transfer was credited to an intent.
    Credited {
        invoice: Invoice,
        intent: PaymentIntent,
        /// The invoice crossed into Paid with this credit.
        newly_paid: bool,
        /// Amount above the target, if the intent is now overfunded.
        surplus: Option<AtomicAmount>,
    },
}

/// The result of creating a payment intent.
#[derive(Debug, Clone)]
pub struct IntentCreated {
    pub intent: PaymentIntent,
    /// Number of previously unmatched transfers replayed against the new intent.
    pub replayed_transfers: u32,
    /// True if an existing live intent for the option was returned instead of
    /// a new one being created.
    pub existing: bool,
}

/// The result of a confirmation evaluation.
#[derive(Debug, Clone)]
pub enum ConfirmationResult {
    /// Every funding transfer cleared the threshold; the invoice is now Confirmed.
    Confirmed { invoice: Invoice },
    /// Still short; the poller should come back later.
    NotReady { min_confirmations: i64 },
    /// The invoice was already Confirmed and a funding transfer regressed
    /// below the threshold; a `ChargebackSuspected` row was queued.
    ChargebackSuspected,
    /// Nothing to confirm (wrong status, or no funded intent).
    NotApplicable,
}

/// Everything the confirmation poller needs for one invoice.
#[derive(Debug, Clone)]
pub struct ConfirmationContext {
    pub invoice: Invoice,
    pub intent: PaymentIntent,
    /// Block numbers of the funding transfers.
    pub funding_blocks: Vec<i64>,
    pub tx_hashes: Vec<String>,
}

/// The result of an administrative cancellation.
#[derive(Debug, Clone)]
pub enum CancellationResult {
    Cancelled(Invoice),
    /// Cancel on a terminal invoice is a no-op.
    AlreadyTerminal(Invoice),
}

/// The result of one expiry sweep.
#[derive(Debug, Clone, Default)]
pub struct ExpirySweepResult {
    pub expired: Vec<Invoice>,
    /// How many of those carried a partial payment at expiry.
    pub with_partial: usize,
}

impl ExpirySweepResult {
    pub fn total_count(&self) -> usize {
        self.expired.len()
    }
}
