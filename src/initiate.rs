//! Payment initiation — turns an approved milestone into a settlement
//! handle the caller completes against the external Settlement Executor.
//!
//! Initiation is idempotent: the claim on the milestone is a conditional
//! update on `payment_status`, and a request arriving while an attempt is
//! already in flight gets the existing handle back instead of a second
//! payment row.

use serde::Serialize;
use sqlx::SqlitePool;
use tracing::info;

use crate::config::Config;
use crate::db;
use crate::errors::{Result, SettleError};
use crate::invoice;
use crate::models::{PaymentRecord, PaymentStatus};

/// Opaque target the caller hands to the Settlement Executor.  The
/// `payment_reference` comes back on the confirmation callback.
#[derive(Debug, Clone, Serialize)]
pub struct SettlementHandle {
    pub payment_id: i64,
    pub payment_reference: String,
    pub milestone_id: i64,
    pub invoice_id: i64,
    pub amount: i64,
    pub currency: String,
    pub rail: String,
}

/// Initiate one settlement attempt for a milestone.
pub async fn initiate(
    pool: &SqlitePool,
    config: &Config,
    milestone_id: i64,
    payer_id: &str,
) -> Result<SettlementHandle> {
    let milestone = db::get_milestone(pool, milestone_id)
        .await?
        .ok_or(SettleError::MilestoneNotFound(milestone_id))?;

    if milestone.payment_status == PaymentStatus::Paid.as_str() {
        return Err(SettleError::AlreadyPaid(milestone_id));
    }

    let contract = db::get_contract(pool, milestone.contract_id)
        .await?
        .ok_or(SettleError::ContractNotFound(milestone.contract_id))?;

    if contract.client_id != payer_id {
        return Err(SettleError::Unauthorized(format!(
            "payer {payer_id} is not the client on contract {}",
            contract.id
        )));
    }

    // No invoice, no payment.
    let invoice = invoice::ensure_invoice(pool, config, milestone_id, payer_id).await?;

    // Claim the milestone for this attempt.  Losing the claim to an
    // attempt that is already in flight is the idempotent-reuse path.
    if !db::claim_for_payment(pool, milestone_id).await? {
        let current = db::get_milestone(pool, milestone_id)
            .await?
            .ok_or(SettleError::MilestoneNotFound(milestone_id))?;
        match PaymentStatus::parse(&current.payment_status) {
            Some(PaymentStatus::Paid) => return Err(SettleError::AlreadyPaid(milestone_id)),
            Some(PaymentStatus::PaymentPending) => {}
            // Raced with a failure rollback; the claim is free again.
            _ => {
                if !db::claim_for_payment(pool, milestone_id).await? {
                    return Err(SettleError::InvalidRequest(format!(
                        "milestone {milestone_id} is not payable right now"
                    )));
                }
            }
        }
    }

    db::mark_invoice_sent(pool, invoice.id).await?;

    // After a partial settlement only the remainder is collected.
    let remaining = invoice.amount - milestone.paid_amount.unwrap_or(0);
    if remaining <= 0 {
        return Err(SettleError::AlreadyPaid(milestone_id));
    }

    let payer_ref = new_payer_ref(invoice.id);
    let payment =
        db::get_or_create_pending_payment(pool, invoice.id, remaining, &payer_ref).await?;

    let payment = match payment {
        Some(p) => p,
        // The in-flight attempt was confirmed between our claim check and
        // the payment lookup.
        None => {
            let current = db::get_milestone(pool, milestone_id)
                .await?
                .ok_or(SettleError::MilestoneNotFound(milestone_id))?;
            if current.payment_status == PaymentStatus::Paid.as_str() {
                return Err(SettleError::AlreadyPaid(milestone_id));
            }
            return Err(SettleError::InvalidRequest(format!(
                "milestone {milestone_id} was settled concurrently"
            )));
        }
    };

    info!(
        "Initiated payment {} (ref {}) for milestone {milestone_id}, amount {}",
        payment.id, payment.payer_ref, payment.amount
    );

    Ok(handle_for(&payment, milestone_id, &contract.currency, &contract.rail))
}

fn handle_for(
    payment: &PaymentRecord,
    milestone_id: i64,
    currency: &str,
    rail: &str,
) -> SettlementHandle {
    SettlementHandle {
        payment_id: payment.id,
        payment_reference: payment.payer_ref.clone(),
        milestone_id,
        invoice_id: payment.invoice_id,
        amount: payment.amount,
        currency: currency.to_string(),
        rail: rail.to_string(),
    }
}

fn new_payer_ref(invoice_id: i64) -> String {
    format!("pay-{invoice_id}-{:x}", chrono::Utc::now().timestamp_micros())
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::{seed_contract, test_pool};
    use crate::models::{InvoiceStatus, PaymentState};

    #[tokio::test]
    async fn single_initiation_walks_the_state_machine() {
        let pool = test_pool().await;
        let cfg = Config::for_tests();
        let (_, ms) = seed_contract(&pool, &[500]).await;

        let handle = initiate(&pool, &cfg, ms[0].id, "client-1").await.unwrap();
        assert_eq!(handle.amount, 500);
        assert_eq!(handle.currency, "USDC");

        let m = db::get_milestone(&pool, ms[0].id).await.unwrap().unwrap();
        assert_eq!(m.payment_status, PaymentStatus::PaymentPending.as_str());

        let inv = db::get_invoice(&pool, handle.invoice_id).await.unwrap().unwrap();
        assert_eq!(inv.status, InvoiceStatus::Sent.as_str());

        let pay = db::get_payment_by_ref(&pool, &handle.payment_reference)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pay.status, PaymentState::Pending.as_str());
        assert_eq!(pay.tx_hash, None);
    }

    #[tokio::test]
    async fn duplicate_initiation_reuses_the_handle() {
        let pool = test_pool().await;
        let cfg = Config::for_tests();
        let (_, ms) = seed_contract(&pool, &[750]).await;

        let first = initiate(&pool, &cfg, ms[0].id, "client-1").await.unwrap();
        let second = initiate(&pool, &cfg, ms[0].id, "client-1").await.unwrap();

        assert_eq!(first.payment_id, second.payment_id);
        assert_eq!(first.payment_reference, second.payment_reference);

        let payments = db::payments_for_invoice(&pool, first.invoice_id).await.unwrap();
        assert_eq!(payments.len(), 1);
    }

    #[tokio::test]
    async fn paid_milestone_is_rejected() {
        let pool = test_pool().await;
        let cfg = Config::for_tests();
        let (_, ms) = seed_contract(&pool, &[900]).await;

        sqlx::query("UPDATE milestones SET payment_status = 'paid' WHERE id = ?1")
            .bind(ms[0].id)
            .execute(&pool)
            .await
            .unwrap();

        let err = initiate(&pool, &cfg, ms[0].id, "client-1").await.unwrap_err();
        assert!(matches!(err, SettleError::AlreadyPaid(_)));
    }

    #[tokio::test]
    async fn foreign_payer_is_rejected_before_any_write() {
        let pool = test_pool().await;
        let cfg = Config::for_tests();
        let (_, ms) = seed_contract(&pool, &[100]).await;

        let err = initiate(&pool, &cfg, ms[0].id, "mallory").await.unwrap_err();
        assert!(matches!(err, SettleError::Unauthorized(_)));

        assert!(db::get_live_invoice(&pool, ms[0].id).await.unwrap().is_none());
        let m = db::get_milestone(&pool, ms[0].id).await.unwrap().unwrap();
        assert_eq!(m.payment_status, PaymentStatus::Unpaid.as_str());
    }
}
