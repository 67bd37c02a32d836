//! The invoice/intent state machine.
//!
//! Everything in this module is pure arithmetic on already-fetched values: no
//! I/O, no clocks, no database handles. The SQLite layer fetches the rows,
//! asks these functions what should happen, and persists the answer together
//! with the outbox rows in one transaction. That keeps the tricky monetary
//! logic fully unit-testable and the transactional code boring.

use spg_common::AtomicAmount;

use crate::db_types::{IntentStatus, InvoiceStatus};

//--------------------------------------     Credit rule     ---------------------------------------------------------

/// The decision produced by [`apply_credit`] for a single incoming transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreditOutcome {
    /// Zero-amount transfers are recorded but never credited.
    Ignored,
    /// The invoice is already terminal. Record the transfer, emit `LATE_FUNDS`,
    /// change no state.
    LateFunds,
    /// The transfer was credited to the intent.
    Credited(Credit),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credit {
    /// Credited sum after this transfer.
    pub new_credited: AtomicAmount,
    pub intent_status: IntentStatus,
    pub invoice_status: InvoiceStatus,
    /// The invoice just crossed into Paid with this credit.
    pub newly_paid: bool,
    /// Amount above the target, if any. Surfaces as an `OVERPAYMENT` record
    /// but does not alter payability.
    pub surplus: Option<AtomicAmount>,
}

/// Apply the credit rule for a transfer of `amount` against an intent with
/// `target` and prior credited sum `credited`, on an invoice currently in
/// `invoice_status`.
pub fn apply_credit(
    invoice_status: InvoiceStatus,
    target: AtomicAmount,
    credited: AtomicAmount,
    amount: AtomicAmount,
) -> CreditOutcome {
    if amount.is_zero() {
        return CreditOutcome::Ignored;
    }
    if invoice_status.is_terminal() {
        return CreditOutcome::LateFunds;
    }
    let was_paid = invoice_status == InvoiceStatus::Paid;
    let new_credited = credited + amount;
    let (intent_status, new_invoice_status, surplus) = if new_credited < target {
        (IntentStatus::PartiallyFunded, InvoiceStatus::Underpaid, None)
    } else if new_credited == target {
        (IntentStatus::Funded, InvoiceStatus::Paid, None)
    } else {
        (IntentStatus::Overfunded, InvoiceStatus::Paid, Some(new_credited - target))
    };
    // An invoice that is already Paid never regresses to Underpaid on the
    // strength of a further partial credit to a second intent.
    let invoice_status = match (invoice_status, new_invoice_status) {
        (InvoiceStatus::Paid, InvoiceStatus::Underpaid) => InvoiceStatus::Paid,
        (_, next) => next,
    };
    let newly_paid = !was_paid && invoice_status == InvoiceStatus::Paid;
    CreditOutcome::Credited(Credit { new_credited, intent_status, invoice_status, newly_paid, surplus })
}

//--------------------------------------  Confirmation rule  ---------------------------------------------------------

/// Effective confirmations for a transfer mined in `block_number` when the
/// chain tip is `current_block`. Inclusive of the containing block; a reorg
/// that drops the tip below the containing block yields zero.
pub fn confirmations(current_block: i64, block_number: i64) -> i64 {
    (current_block - block_number + 1).max(0)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmationOutcome {
    /// Every funding transfer has cleared the threshold; advance to Confirmed.
    Confirm,
    /// At least one funding transfer is still short. Keep polling.
    Wait { min_confirmations: i64 },
    /// The invoice was already Confirmed and a funding transfer has dropped
    /// below the threshold (reorg). Emit `CHARGEBACK_SUSPECTED`; do not regress.
    ChargebackSuspected { min_confirmations: i64 },
    /// The invoice is not in a confirmable state; nothing to do.
    NotApplicable,
}

/// Evaluate the confirmation rule for an invoice whose funding transfers were
/// mined in `funding_blocks`.
pub fn confirmation_outcome(
    invoice_status: InvoiceStatus,
    funding_blocks: &[i64],
    current_block: i64,
    threshold: i64,
) -> ConfirmationOutcome {
    if funding_blocks.is_empty() {
        return ConfirmationOutcome::NotApplicable;
    }
    let min_confirmations =
        funding_blocks.iter().map(|b| confirmations(current_block, *b)).min().unwrap_or(0);
    match invoice_status {
        InvoiceStatus::Paid => {
            if min_confirmations >= threshold {
                ConfirmationOutcome::Confirm
            } else {
                ConfirmationOutcome::Wait { min_confirmations }
            }
        },
        InvoiceStatus::Confirmed => {
            if min_confirmations < threshold {
                ConfirmationOutcome::ChargebackSuspected { min_confirmations }
            } else {
                ConfirmationOutcome::NotApplicable
            }
        },
        _ => ConfirmationOutcome::NotApplicable,
    }
}

//--------------------------------------     Expiry rule     ---------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpiryOutcome {
    /// Move the invoice to Expired.
    Expire {
        /// A partial payment was present at expiry; emit `EXPIRED_WITH_PARTIAL`
        /// alongside the status callback.
        with_partial: bool,
    },
    /// Paid, terminal or confirming invoices are left alone by the sweeper.
    Skip,
}

/// The expiry transition for an invoice past its expiry instant.
pub fn expiry_transition(invoice_status: InvoiceStatus, credited: AtomicAmount) -> ExpiryOutcome {
    match invoice_status {
        InvoiceStatus::Pending => ExpiryOutcome::Expire { with_partial: false },
        InvoiceStatus::Underpaid => ExpiryOutcome::Expire { with_partial: !credited.is_zero() },
        _ => ExpiryOutcome::Skip,
    }
}

//--------------------------------------   Cancellation      ---------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Move the invoice to Cancelled and notify the merchant.
    Cancel,
    /// Already terminal; cancelling again is a no-op.
    NoOp,
    /// Paid or confirming invoices cannot be cancelled.
    Forbidden,
}

pub fn cancel_transition(invoice_status: InvoiceStatus) -> CancelOutcome {
    match invoice_status {
        InvoiceStatus::Pending | InvoiceStatus::Underpaid => CancelOutcome::Cancel,
        InvoiceStatus::Expired | InvoiceStatus::Cancelled | InvoiceStatus::Confirmed => CancelOutcome::NoOp,
        InvoiceStatus::Paid => CancelOutcome::Forbidden,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn amt(v: i64) -> AtomicAmount {
        AtomicAmount::from(v)
    }

    #[test]
    fn partial_credit_moves_invoice_to_underpaid() {
        let outcome = apply_credit(InvoiceStatus::Pending, amt(10_000_000), amt(0), amt(6_000_000));
        let CreditOutcome::Credited(credit) = outcome else {
            panic!("expected a credit");
        };
        assert_eq!(credit.new_credited, amt(6_000_000));
        assert_eq!(credit.intent_status, IntentStatus::PartiallyFunded);
        assert_eq!(credit.invoice_status, InvoiceStatus::Underpaid);
        assert!(!credit.newly_paid);
        assert!(credit.surplus.is_none());
    }

    #[test]
    fn exact_credit_moves_invoice_to_paid() {
        let outcome = apply_credit(InvoiceStatus::Underpaid, amt(10_000_000), amt(6_000_000), amt(4_000_000));
        let CreditOutcome::Credited(credit) = outcome else {
            panic!("expected a credit");
        };
        assert_eq!(credit.new_credited, amt(10_000_000));
        assert_eq!(credit.intent_status, IntentStatus::Funded);
        assert_eq!(credit.invoice_status, InvoiceStatus::Paid);
        assert!(credit.newly_paid);
        assert!(credit.surplus.is_none());
    }

    #[test]
    fn overpayment_is_surfaced_but_invoice_is_simply_paid() {
        let outcome = apply_credit(InvoiceStatus::Pending, amt(10_000_000), amt(0), amt(15_000_000));
        let CreditOutcome::Credited(credit) = outcome else {
            panic!("expected a credit");
        };
        assert_eq!(credit.intent_status, IntentStatus::Overfunded);
        assert_eq!(credit.invoice_status, InvoiceStatus::Paid);
        assert_eq!(credit.surplus, Some(amt(5_000_000)));
    }

    #[test]
    fn zero_amount_transfers_are_never_credited() {
        assert_eq!(apply_credit(InvoiceStatus::Pending, amt(10), amt(0), amt(0)), CreditOutcome::Ignored);
    }

    #[test]
    fn credits_to_terminal_invoices_become_late_funds() {
        for status in [InvoiceStatus::Expired, InvoiceStatus::Cancelled, InvoiceStatus::Confirmed] {
            assert_eq!(apply_credit(status, amt(10), amt(0), amt(10)), CreditOutcome::LateFunds);
        }
    }

    #[test]
    fn credit_order_does_not_matter() {
        // Sum of distinct transfers decides the final state, whatever the order.
        let transfers = [amt(2), amt(5), amt(3)];
        let target = amt(10);
        let orderings: [[usize; 3]; 6] =
            [[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]];
        for order in orderings {
            let mut credited = amt(0);
            let mut invoice_status = InvoiceStatus::Pending;
            for i in order {
                match apply_credit(invoice_status, target, credited, transfers[i]) {
                    CreditOutcome::Credited(c) => {
                        credited = c.new_credited;
                        invoice_status = c.invoice_status;
                    },
                    other => panic!("unexpected outcome {other:?}"),
                }
            }
            assert_eq!(credited, target);
            assert_eq!(invoice_status, InvoiceStatus::Paid);
        }
    }

    #[test]
    fn confirmations_are_inclusive_of_the_containing_block() {
        assert_eq!(confirmations(100, 100), 1);
        assert_eq!(confirmations(102, 100), 3);
        // Reorg: tip dropped below the containing block.
        assert_eq!(confirmations(99, 100), 0);
    }

    #[test]
    fn invoice_confirms_only_when_every_transfer_clears_the_threshold() {
        // Transfers at blocks 100 and 102, threshold 6.
        let blocks = [100, 102];
        assert_eq!(
            confirmation_outcome(InvoiceStatus::Paid, &blocks, 105, 6),
            ConfirmationOutcome::Wait { min_confirmations: 4 }
        );
        // Block 107: the later transfer has exactly 6 confirmations.
        assert_eq!(confirmation_outcome(InvoiceStatus::Paid, &blocks, 107, 6), ConfirmationOutcome::Confirm);
    }

    #[test]
    fn reorg_before_confirmation_just_waits() {
        let blocks = [100];
        assert_eq!(
            confirmation_outcome(InvoiceStatus::Paid, &blocks, 99, 6),
            ConfirmationOutcome::Wait { min_confirmations: 0 }
        );
    }

    #[test]
    fn reorg_after_confirmation_raises_chargeback_suspicion() {
        let blocks = [100];
        assert_eq!(
            confirmation_outcome(InvoiceStatus::Confirmed, &blocks, 101, 6),
            ConfirmationOutcome::ChargebackSuspected { min_confirmations: 2 }
        );
        assert_eq!(
            confirmation_outcome(InvoiceStatus::Confirmed, &blocks, 110, 6),
            ConfirmationOutcome::NotApplicable
        );
    }

    #[test]
    fn expiry_only_touches_pending_and_underpaid() {
        assert_eq!(expiry_transition(InvoiceStatus::Pending, amt(0)), ExpiryOutcome::Expire { with_partial: false });
        assert_eq!(
            expiry_transition(InvoiceStatus::Underpaid, amt(5)),
            ExpiryOutcome::Expire { with_partial: true }
        );
        for status in
            [InvoiceStatus::Paid, InvoiceStatus::Confirmed, InvoiceStatus::Expired, InvoiceStatus::Cancelled]
        {
            assert_eq!(expiry_transition(status, amt(5)), ExpiryOutcome::Skip);
        }
    }

    #[test]
    fn cancel_is_a_noop_on_terminal_states_and_forbidden_on_paid() {
        assert_eq!(cancel_transition(InvoiceStatus::Pending), CancelOutcome::Cancel);
        assert_eq!(cancel_transition(InvoiceStatus::Underpaid), CancelOutcome::Cancel);
        assert_eq!(cancel_transition(InvoiceStatus::Paid), CancelOutcome::Forbidden);
        assert_eq!(cancel_transition(InvoiceStatus::Expired), CancelOutcome::NoOp);
        assert_eq!(cancel_transition(InvoiceStatus::Cancelled), CancelOutcome::NoOp);
        assert_eq!(cancel_transition(InvoiceStatus::Confirmed), CancelOutcome::NoOp);
    }
}
