//! Settlement confirmation — reconciles the Settlement Executor's verdict
//! into Payment, Invoice and Milestone in one SQLite transaction.
//!
//! Confirmations are delivered at least once, so the handler is idempotent:
//! a repeat for an already-settled payment is a no-op, and a transaction
//! hash that is already credited to a different payment is resolved as
//! already-satisfied rather than surfaced to the caller.

use serde::Serialize;
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::{info, warn};

use crate::db;
use crate::errors::{Result, SettleError};
use crate::models::{
    ContractRecord, InvoiceRecord, InvoiceStatus, MilestoneRecord, PaymentRecord, PaymentState,
    PaymentStatus, EVENT_PAYMENT_FAILED, EVENT_PAYMENT_SUCCEEDED,
};

/// The Executor's verdict for one settlement attempt.
#[derive(Debug, Clone)]
pub struct SettlementReport {
    /// On-rail transaction hash; required for success reports.
    pub tx_hash: Option<String>,
    /// Amount actually moved, in minor units.
    pub amount: i64,
    pub success: bool,
}

/// What the confirmation left behind.
#[derive(Debug, Clone, Serialize)]
pub struct ConfirmOutcome {
    pub milestone_id: i64,
    pub milestone_status: String,
    pub invoice_status: String,
    pub payment_status: String,
    /// True when the report had already been applied and nothing changed.
    pub duplicate: bool,
}

/// Apply a settlement report to the payment identified by `payer_ref`.
pub async fn confirm(
    pool: &SqlitePool,
    payer_ref: &str,
    report: SettlementReport,
) -> Result<ConfirmOutcome> {
    if report.success {
        let hash = report
            .tx_hash
            .as_deref()
            .ok_or_else(|| {
                SettleError::InvalidRequest("success report without tx_hash".to_string())
            })?;
        validate_tx_hash(hash)?;
        // A success that moved nothing (or a negative amount) is malformed;
        // accepting it would complete the payment without crediting the
        // invoice.
        if report.amount <= 0 {
            return Err(SettleError::InvalidRequest(format!(
                "non-positive settlement amount: {}",
                report.amount
            )));
        }
    }

    let mut tx = pool.begin().await?;

    let payment = fetch_payment(&mut tx, payer_ref)
        .await?
        .ok_or_else(|| SettleError::PaymentNotFound(payer_ref.to_string()))?;
    let invoice = fetch_invoice(&mut tx, payment.invoice_id).await?;
    let milestone = fetch_milestone(&mut tx, invoice.milestone_id).await?;

    // Terminal payments never change again; a repeat delivery is a no-op.
    if PaymentState::parse(&payment.status) != Some(PaymentState::Pending) {
        if payment.tx_hash.as_deref() != report.tx_hash.as_deref() {
            warn!(
                "Repeat confirmation for settled payment {} with different hash ({:?} vs {:?})",
                payment.id, report.tx_hash, payment.tx_hash
            );
        }
        return Ok(ConfirmOutcome {
            milestone_id: milestone.id,
            milestone_status: milestone.payment_status,
            invoice_status: invoice.status,
            payment_status: payment.status,
            duplicate: true,
        });
    }

    let outcome = if report.success {
        apply_success(&mut tx, &payment, &invoice, &milestone, &report).await?
    } else {
        apply_failure(&mut tx, &payment, &invoice, &milestone).await?
    };

    tx.commit().await?;
    Ok(outcome)
}

async fn apply_success(
    tx: &mut Transaction<'_, Sqlite>,
    payment: &PaymentRecord,
    invoice: &InvoiceRecord,
    milestone: &MilestoneRecord,
    report: &SettlementReport,
) -> Result<ConfirmOutcome> {
    let hash = report.tx_hash.as_deref().unwrap_or_default();

    // Double-crediting guard: the hash may only ever settle one payment.
    // The unique index enforces this structurally; checking first lets a
    // duplicate delivery resolve as a no-op instead of a constraint error.
    let claimed_by: Option<(i64,)> =
        sqlx::query_as("SELECT id FROM payments WHERE tx_hash = ?1 AND id <> ?2")
            .bind(hash)
            .bind(payment.id)
            .fetch_optional(&mut **tx)
            .await?;
    if let Some((other,)) = claimed_by {
        warn!(
            "Transaction hash {hash} already credited to payment {other}; ignoring report for payment {}",
            payment.id
        );
        return Ok(ConfirmOutcome {
            milestone_id: milestone.id,
            milestone_status: milestone.payment_status.clone(),
            invoice_status: invoice.status.clone(),
            payment_status: payment.status.clone(),
            duplicate: true,
        });
    }

    let ts = db::now();
    sqlx::query(
        r#"
        UPDATE payments SET status = 'completed', tx_hash = ?1, confirmed_at = ?2
        WHERE id = ?3 AND status = 'pending'
        "#,
    )
    .bind(hash)
    .bind(ts)
    .bind(payment.id)
    .execute(&mut **tx)
    .await?;

    // Partial settlements accumulate until the invoice amount reconciles.
    let total_paid = milestone.paid_amount.unwrap_or(0) + report.amount;
    let full = total_paid >= invoice.amount;

    let invoice_status = if full {
        InvoiceStatus::Paid
    } else {
        InvoiceStatus::Partial
    };
    sqlx::query(
        r#"
        UPDATE invoices SET status = ?1, tx_ref = ?2, paid_at = CASE WHEN ?3 THEN ?4 ELSE paid_at END
        WHERE id = ?5
        "#,
    )
    .bind(invoice_status.as_str())
    .bind(hash)
    .bind(full)
    .bind(ts)
    .bind(invoice.id)
    .execute(&mut **tx)
    .await?;

    // The milestone reaches `paid` only on full reconciliation, and only
    // from `payment_pending` — `paid` is monotone.
    let milestone_status = if full {
        sqlx::query(
            r#"
            UPDATE milestones
            SET payment_status = 'paid', paid_at = ?1, tx_ref = ?2, paid_amount = ?3
            WHERE id = ?4 AND payment_status = 'payment_pending'
            "#,
        )
        .bind(ts)
        .bind(hash)
        .bind(total_paid)
        .bind(milestone.id)
        .execute(&mut **tx)
        .await?;
        PaymentStatus::Paid.as_str()
    } else {
        sqlx::query("UPDATE milestones SET paid_amount = ?1 WHERE id = ?2")
            .bind(total_paid)
            .bind(milestone.id)
            .execute(&mut **tx)
            .await?;
        PaymentStatus::PaymentPending.as_str()
    };

    let contract = fetch_contract(tx, milestone.contract_id).await?;
    insert_event(
        tx,
        milestone,
        &contract,
        EVENT_PAYMENT_SUCCEEDED,
        report.amount,
        Some(hash),
        ts,
    )
    .await?;

    info!(
        "Settled payment {} for milestone {} ({}; amount {}, tx {hash})",
        payment.id,
        milestone.id,
        invoice_status.as_str(),
        report.amount
    );

    Ok(ConfirmOutcome {
        milestone_id: milestone.id,
        milestone_status: milestone_status.to_string(),
        invoice_status: invoice_status.as_str().to_string(),
        payment_status: PaymentState::Completed.as_str().to_string(),
        duplicate: false,
    })
}

async fn apply_failure(
    tx: &mut Transaction<'_, Sqlite>,
    payment: &PaymentRecord,
    invoice: &InvoiceRecord,
    milestone: &MilestoneRecord,
) -> Result<ConfirmOutcome> {
    let ts = db::now();
    sqlx::query(
        "UPDATE payments SET status = 'failed', confirmed_at = ?1 WHERE id = ?2 AND status = 'pending'",
    )
    .bind(ts)
    .bind(payment.id)
    .execute(&mut **tx)
    .await?;

    // Roll the milestone back to `unpaid`, releasing the in-flight claim
    // so the attempt can be re-initiated.  Retry metadata carries forward.
    sqlx::query(
        r#"
        UPDATE milestones SET payment_status = 'unpaid', retry_count = retry_count + 1
        WHERE id = ?1 AND payment_status = 'payment_pending'
        "#,
    )
    .bind(milestone.id)
    .execute(&mut **tx)
    .await?;

    let contract = fetch_contract(tx, milestone.contract_id).await?;
    insert_event(
        tx,
        milestone,
        &contract,
        EVENT_PAYMENT_FAILED,
        payment.amount,
        None,
        ts,
    )
    .await?;

    warn!(
        "Settlement failed for payment {} (milestone {}); claim released for retry",
        payment.id, milestone.id
    );

    Ok(ConfirmOutcome {
        milestone_id: milestone.id,
        milestone_status: PaymentStatus::Unpaid.as_str().to_string(),
        invoice_status: invoice.status.clone(),
        payment_status: PaymentState::Failed.as_str().to_string(),
        duplicate: false,
    })
}

async fn insert_event(
    tx: &mut Transaction<'_, Sqlite>,
    milestone: &MilestoneRecord,
    contract: &ContractRecord,
    event_type: &str,
    amount: i64,
    tx_ref: Option<&str>,
    ts: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO settlement_events
            (milestone_id, contract_id, event_type, amount, client_id, freelancer_id, tx_ref, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        "#,
    )
    .bind(milestone.id)
    .bind(contract.id)
    .bind(event_type)
    .bind(amount)
    .bind(&contract.client_id)
    .bind(&contract.freelancer_id)
    .bind(tx_ref)
    .bind(ts)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn fetch_payment(
    tx: &mut Transaction<'_, Sqlite>,
    payer_ref: &str,
) -> Result<Option<PaymentRecord>> {
    let row = sqlx::query_as::<_, PaymentRecord>("SELECT * FROM payments WHERE payer_ref = ?1")
        .bind(payer_ref)
        .fetch_optional(&mut **tx)
        .await?;
    Ok(row)
}

async fn fetch_invoice(tx: &mut Transaction<'_, Sqlite>, id: i64) -> Result<InvoiceRecord> {
    let row = sqlx::query_as::<_, InvoiceRecord>("SELECT * FROM invoices WHERE id = ?1")
        .bind(id)
        .fetch_one(&mut **tx)
        .await?;
    Ok(row)
}

async fn fetch_milestone(tx: &mut Transaction<'_, Sqlite>, id: i64) -> Result<MilestoneRecord> {
    let row = sqlx::query_as::<_, MilestoneRecord>("SELECT * FROM milestones WHERE id = ?1")
        .bind(id)
        .fetch_one(&mut **tx)
        .await?;
    Ok(row)
}

async fn fetch_contract(tx: &mut Transaction<'_, Sqlite>, id: i64) -> Result<ContractRecord> {
    let row = sqlx::query_as::<_, ContractRecord>("SELECT * FROM contracts WHERE id = ?1")
        .bind(id)
        .fetch_one(&mut **tx)
        .await?;
    Ok(row)
}

/// A transaction reference must be hex digits, optionally `0x`-prefixed.
fn validate_tx_hash(hash: &str) -> Result<()> {
    let bare = hash.strip_prefix("0x").unwrap_or(hash);
    if bare.is_empty() || !bare.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(SettleError::InvalidRequest(format!(
            "malformed transaction hash: {hash}"
        )));
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::test_support::{seed_contract, test_pool};
    use crate::initiate;
    use crate::models::InvoiceStatus;

    fn success(hash: &str, amount: i64) -> SettlementReport {
        SettlementReport {
            tx_hash: Some(hash.to_string()),
            amount,
            success: true,
        }
    }

    fn failure() -> SettlementReport {
        SettlementReport {
            tx_hash: None,
            amount: 0,
            success: false,
        }
    }

    #[tokio::test]
    async fn success_settles_all_three_records() {
        let pool = test_pool().await;
        let cfg = Config::for_tests();
        let (_, ms) = seed_contract(&pool, &[500]).await;

        let handle = initiate::initiate(&pool, &cfg, ms[0].id, "client-1").await.unwrap();
        let out = confirm(&pool, &handle.payment_reference, success("0xabc", 500))
            .await
            .unwrap();

        assert!(!out.duplicate);
        assert_eq!(out.milestone_status, "paid");
        assert_eq!(out.invoice_status, "paid");
        assert_eq!(out.payment_status, "completed");

        let m = db::get_milestone(&pool, ms[0].id).await.unwrap().unwrap();
        assert_eq!(m.payment_status, PaymentStatus::Paid.as_str());
        assert_eq!(m.tx_ref.as_deref(), Some("0xabc"));
        assert!(m.paid_at.is_some());

        let inv = db::get_invoice(&pool, handle.invoice_id).await.unwrap().unwrap();
        assert_eq!(inv.status, InvoiceStatus::Paid.as_str());
        assert!(inv.paid_at.is_some());

        let events = db::events_for_milestone(&pool, ms[0].id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EVENT_PAYMENT_SUCCEEDED);
    }

    #[tokio::test]
    async fn duplicate_confirmation_is_a_noop() {
        let pool = test_pool().await;
        let cfg = Config::for_tests();
        let (_, ms) = seed_contract(&pool, &[500]).await;

        let handle = initiate::initiate(&pool, &cfg, ms[0].id, "client-1").await.unwrap();
        let first = confirm(&pool, &handle.payment_reference, success("0xabc", 500))
            .await
            .unwrap();
        let second = confirm(&pool, &handle.payment_reference, success("0xabc", 500))
            .await
            .unwrap();

        assert!(!first.duplicate);
        assert!(second.duplicate);
        assert_eq!(second.milestone_status, "paid");

        // No second payment row, no second state-transition event.
        let payments = db::payments_for_invoice(&pool, handle.invoice_id).await.unwrap();
        assert_eq!(payments.len(), 1);
        let events = db::events_for_milestone(&pool, ms[0].id).await.unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn hash_already_credited_elsewhere_is_resolved_silently() {
        let pool = test_pool().await;
        let cfg = Config::for_tests();
        let (_, ms) = seed_contract(&pool, &[100, 200]).await;

        let h1 = initiate::initiate(&pool, &cfg, ms[0].id, "client-1").await.unwrap();
        let h2 = initiate::initiate(&pool, &cfg, ms[1].id, "client-1").await.unwrap();

        confirm(&pool, &h1.payment_reference, success("0xdead", 100))
            .await
            .unwrap();
        let out = confirm(&pool, &h2.payment_reference, success("0xdead", 200))
            .await
            .unwrap();

        assert!(out.duplicate);
        let m2 = db::get_milestone(&pool, ms[1].id).await.unwrap().unwrap();
        assert_eq!(m2.payment_status, PaymentStatus::PaymentPending.as_str());
    }

    #[tokio::test]
    async fn failure_releases_the_claim_for_retry() {
        let pool = test_pool().await;
        let cfg = Config::for_tests();
        let (_, ms) = seed_contract(&pool, &[400]).await;

        let handle = initiate::initiate(&pool, &cfg, ms[0].id, "client-1").await.unwrap();
        let out = confirm(&pool, &handle.payment_reference, failure()).await.unwrap();
        assert_eq!(out.milestone_status, "unpaid");
        assert_eq!(out.payment_status, "failed");

        let m = db::get_milestone(&pool, ms[0].id).await.unwrap().unwrap();
        assert_eq!(m.payment_status, PaymentStatus::Unpaid.as_str());
        assert_eq!(m.retry_count, 1);

        let events = db::events_for_milestone(&pool, ms[0].id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EVENT_PAYMENT_FAILED);

        // Re-initiation succeeds and produces a fresh payment row.
        let retry = initiate::initiate(&pool, &cfg, ms[0].id, "client-1").await.unwrap();
        assert_ne!(retry.payment_reference, handle.payment_reference);
        let m = db::get_milestone(&pool, ms[0].id).await.unwrap().unwrap();
        assert_eq!(m.payment_status, PaymentStatus::PaymentPending.as_str());

        confirm(&pool, &retry.payment_reference, success("0xbeef", 400))
            .await
            .unwrap();
        let m = db::get_milestone(&pool, ms[0].id).await.unwrap().unwrap();
        assert_eq!(m.payment_status, PaymentStatus::Paid.as_str());
    }

    #[tokio::test]
    async fn partial_settlement_leaves_milestone_pending() {
        let pool = test_pool().await;
        let cfg = Config::for_tests();
        let (_, ms) = seed_contract(&pool, &[1000]).await;

        let handle = initiate::initiate(&pool, &cfg, ms[0].id, "client-1").await.unwrap();
        let out = confirm(&pool, &handle.payment_reference, success("0x01", 400))
            .await
            .unwrap();

        assert_eq!(out.invoice_status, "partial");
        assert_eq!(out.milestone_status, "payment_pending");

        let m = db::get_milestone(&pool, ms[0].id).await.unwrap().unwrap();
        assert_eq!(m.paid_amount, Some(400));

        // The remainder is re-initiated and reconciles the invoice.
        let second = initiate::initiate(&pool, &cfg, ms[0].id, "client-1").await.unwrap();
        assert_eq!(second.amount, 600);
        let out = confirm(&pool, &second.payment_reference, success("0x02", 600))
            .await
            .unwrap();
        assert_eq!(out.invoice_status, "paid");
        assert_eq!(out.milestone_status, "paid");
    }

    #[tokio::test]
    async fn non_positive_success_amount_is_rejected() {
        let pool = test_pool().await;
        let cfg = Config::for_tests();
        let (_, ms) = seed_contract(&pool, &[500]).await;

        let handle = initiate::initiate(&pool, &cfg, ms[0].id, "client-1").await.unwrap();

        for amount in [0, -500] {
            let err = confirm(&pool, &handle.payment_reference, success("0xabc", amount))
                .await
                .unwrap_err();
            assert!(matches!(err, SettleError::InvalidRequest(_)));
        }

        // Nothing moved: the attempt is still in flight and creditable.
        let m = db::get_milestone(&pool, ms[0].id).await.unwrap().unwrap();
        assert_eq!(m.payment_status, PaymentStatus::PaymentPending.as_str());
        assert_eq!(m.paid_amount, None);
        let pay = db::get_payment_by_ref(&pool, &handle.payment_reference)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pay.status, PaymentState::Pending.as_str());

        let out = confirm(&pool, &handle.payment_reference, success("0xabc", 500))
            .await
            .unwrap();
        assert_eq!(out.milestone_status, "paid");
    }

    #[tokio::test]
    async fn success_without_hash_is_rejected() {
        let pool = test_pool().await;
        let report = SettlementReport {
            tx_hash: None,
            amount: 10,
            success: true,
        };
        let err = confirm(&pool, "pay-nope", report).await.unwrap_err();
        assert!(matches!(err, SettleError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn malformed_hash_is_rejected() {
        let pool = test_pool().await;
        let err = confirm(&pool, "pay-nope", success("not-hex!", 10))
            .await
            .unwrap_err();
        assert!(matches!(err, SettleError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn unknown_reference_is_not_found() {
        let pool = test_pool().await;
        let err = confirm(&pool, "pay-missing", success("0xff", 10))
            .await
            .unwrap_err();
        assert!(matches!(err, SettleError::PaymentNotFound(_)));
    }
}
