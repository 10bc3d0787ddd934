//! Bulk payment orchestration — fans one contract-wide request out into
//! per-milestone invoice/initiation work.
//!
//! Failures are isolated: one milestone's invoice-generation or initiation
//! failure never aborts its siblings, and the batch result enumerates each
//! milestone's outcome so the caller can retry only what failed.  There is
//! never a combined invoice; the 1:1 milestone/invoice accounting holds in
//! bulk exactly as it does for a single payment.

use std::sync::Arc;

use serde::Serialize;
use sqlx::SqlitePool;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::config::Config;
use crate::db;
use crate::errors::{Result, SettleError};
use crate::initiate::{self, SettlementHandle};
use crate::models::PaymentStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkOutcomeKind {
    Initiated,
    SkippedAlreadyPaid,
    Failed,
}

/// Per-milestone slice of a batch result.
#[derive(Debug, Clone, Serialize)]
pub struct MilestoneOutcome {
    pub milestone_id: i64,
    pub amount: i64,
    pub outcome: BulkOutcomeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handle: Option<SettlementHandle>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason_code: Option<String>,
}

/// Ephemeral batch result; the durable record is the per-milestone
/// invoice and payment rows.
#[derive(Debug, Clone, Serialize)]
pub struct BulkSettlementResult {
    pub contract_id: i64,
    /// Sum of amounts for milestones that reached `payment_pending`.
    pub total_amount: i64,
    pub succeeded_count: usize,
    pub failed_count: usize,
    pub skipped_count: usize,
    pub milestones: Vec<MilestoneOutcome>,
}

/// Initiate settlement for every unpaid milestone under a contract.
pub async fn initiate_bulk(
    pool: &SqlitePool,
    config: &Config,
    contract_id: i64,
    payer_id: &str,
) -> Result<BulkSettlementResult> {
    let contract = db::get_contract(pool, contract_id)
        .await?
        .ok_or(SettleError::ContractNotFound(contract_id))?;

    if contract.client_id != payer_id {
        return Err(SettleError::Unauthorized(format!(
            "payer {payer_id} is not the client on contract {contract_id}"
        )));
    }

    let milestones = db::milestones_for_contract(pool, contract_id).await?;
    if milestones.is_empty() {
        return Err(SettleError::InvalidRequest(format!(
            "contract {contract_id} has no milestones"
        )));
    }

    // Already-paid milestones are excluded from the batch, not retried.
    let mut outcomes: Vec<MilestoneOutcome> = Vec::with_capacity(milestones.len());
    let mut selected: Vec<(i64, i64)> = Vec::new();
    for m in &milestones {
        if m.payment_status == PaymentStatus::Paid.as_str() {
            outcomes.push(MilestoneOutcome {
                milestone_id: m.id,
                amount: m.amount,
                outcome: BulkOutcomeKind::SkippedAlreadyPaid,
                handle: None,
                reason: None,
                reason_code: None,
            });
        } else {
            selected.push((m.id, m.amount));
        }
    }

    // Per-milestone work runs concurrently, bounded so a wide contract
    // doesn't overwhelm the storage layer.
    let semaphore = Arc::new(Semaphore::new(config.bulk_concurrency.max(1)));
    let mut join_set = JoinSet::new();
    for (milestone_id, amount) in selected.iter().copied() {
        let pool = pool.clone();
        let config = config.clone();
        let payer = payer_id.to_string();
        let semaphore = Arc::clone(&semaphore);
        join_set.spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok();
            let result = initiate::initiate(&pool, &config, milestone_id, &payer).await;
            (milestone_id, amount, result)
        });
    }

    let mut done: Vec<MilestoneOutcome> = Vec::with_capacity(selected.len());
    while let Some(joined) = join_set.join_next().await {
        let (milestone_id, amount, result) = match joined {
            Ok(v) => v,
            Err(e) => {
                warn!("Bulk worker join error: {e}");
                continue;
            }
        };
        match result {
            Ok(handle) => done.push(MilestoneOutcome {
                milestone_id,
                amount,
                outcome: BulkOutcomeKind::Initiated,
                handle: Some(handle),
                reason: None,
                reason_code: None,
            }),
            Err(e) => {
                warn!("Bulk initiation failed for milestone {milestone_id}: {e}");
                done.push(MilestoneOutcome {
                    milestone_id,
                    amount,
                    outcome: BulkOutcomeKind::Failed,
                    handle: None,
                    reason: Some(e.to_string()),
                    reason_code: Some(e.reason_code().to_string()),
                });
            }
        }
    }

    // The result must enumerate every selected milestone; a worker lost
    // to a panic still gets a failed outcome rather than vanishing.
    for (milestone_id, amount) in selected.iter().copied() {
        if !done.iter().any(|o| o.milestone_id == milestone_id) {
            done.push(MilestoneOutcome {
                milestone_id,
                amount,
                outcome: BulkOutcomeKind::Failed,
                handle: None,
                reason: Some("settlement worker terminated unexpectedly".to_string()),
                reason_code: Some("worker_failed".to_string()),
            });
        }
    }

    // Join order is arbitrary; present outcomes in milestone order.
    outcomes.extend(done);
    outcomes.sort_by_key(|o| o.milestone_id);

    let succeeded_count = outcomes
        .iter()
        .filter(|o| o.outcome == BulkOutcomeKind::Initiated)
        .count();
    let failed_count = outcomes
        .iter()
        .filter(|o| o.outcome == BulkOutcomeKind::Failed)
        .count();
    let skipped_count = outcomes.len() - succeeded_count - failed_count;
    let total_amount = outcomes
        .iter()
        .filter(|o| o.outcome == BulkOutcomeKind::Initiated)
        .map(|o| o.handle.as_ref().map(|h| h.amount).unwrap_or(o.amount))
        .sum();

    info!(
        "Bulk initiation for contract {contract_id}: {succeeded_count} initiated, \
         {failed_count} failed, {skipped_count} skipped, total {total_amount}"
    );

    Ok(BulkSettlementResult {
        contract_id,
        total_amount,
        succeeded_count,
        failed_count,
        skipped_count,
        milestones: outcomes,
    })
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────
