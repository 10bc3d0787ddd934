//! Invoice generation — exactly one live invoice per approved milestone.
//!
//! Idempotent by construction: an existing live invoice is returned
//! unchanged, and a lost creation race re-fetches the winning row instead
//! of erroring.  This is the one pipeline stage that must not silently
//! drop — no invoice means no payment is possible — so transient storage
//! failures retry with backoff and exhaustion is logged loudly.

use chrono::Duration as ChronoDuration;
use sqlx::SqlitePool;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::db;
use crate::errors::{Result, SettleError};
use crate::models::{ApprovalStatus, InvoiceRecord};
use crate::retry;

/// Guarantee a live invoice exists for the milestone and return it.
///
/// The payer must be the client on the milestone's contract, and the
/// milestone must be work-approved (`completed` or `approved`).
pub async fn ensure_invoice(
    pool: &SqlitePool,
    config: &Config,
    milestone_id: i64,
    payer_id: &str,
) -> Result<InvoiceRecord> {
    let milestone = db::get_milestone(pool, milestone_id)
        .await?
        .ok_or(SettleError::MilestoneNotFound(milestone_id))?;

    let contract = db::get_contract(pool, milestone.contract_id)
        .await?
        .ok_or(SettleError::ContractNotFound(milestone.contract_id))?;

    if contract.client_id != payer_id {
        return Err(SettleError::Unauthorized(format!(
            "payer {payer_id} is not the client on contract {}",
            contract.id
        )));
    }

    let approval = ApprovalStatus::parse(&milestone.approval_status);
    if !approval.map(|a| a.invoiceable()).unwrap_or(false) {
        return Err(SettleError::NotApproved(milestone_id));
    }

    // Fast path: the invoice already exists.
    if let Some(existing) = db::get_live_invoice(pool, milestone_id).await? {
        debug!("Invoice {} already live for milestone {milestone_id}", existing.id);
        return Ok(existing);
    }

    let due_at = db::now() + ChronoDuration::days(config.invoice_due_days).num_seconds();
    let policy = config.backoff();

    let result = retry::with_backoff(&policy, "invoice creation", || {
        create_once(pool, milestone_id, milestone.amount, due_at)
    })
    .await;

    match result {
        Ok(invoice) => Ok(invoice),
        Err(e) => {
            error!("Invoice generation exhausted retries for milestone {milestone_id}: {e}");
            Err(SettleError::InvoiceGeneration {
                milestone_id,
                reason: e.to_string(),
            })
        }
    }
}

/// One creation attempt.  A `None` from the insert means a concurrent
/// caller won the unique index; their row is the invoice.
async fn create_once(
    pool: &SqlitePool,
    milestone_id: i64,
    amount: i64,
    due_at: i64,
) -> Result<InvoiceRecord> {
    match db::create_invoice(pool, milestone_id, amount, due_at).await? {
        Some(invoice) => {
            db::mark_invoice_pending(pool, milestone_id).await?;
            info!("Created invoice {} for milestone {milestone_id}", invoice.id);
            Ok(invoice)
        }
        None => {
            let winner = db::get_live_invoice(pool, milestone_id)
                .await?
                .ok_or_else(|| {
                    // Lost the race but the winner is gone (voided between
                    // our insert and re-read); retryable.
                    SettleError::Database(sqlx::Error::RowNotFound)
                })?;
            debug!(
                "Concurrent invoice creation for milestone {milestone_id}, using invoice {}",
                winner.id
            );
            Ok(winner)
        }
    }
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────
