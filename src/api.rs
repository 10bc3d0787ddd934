//! Axum REST API handlers.
//!
//! Handlers validate shape, then hand off to the settlement modules; all
//! invariants live there.  Errors convert to JSON responses through
//! [`SettleError`]'s `IntoResponse` impl.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::bulk::{self, BulkSettlementResult};
use crate::config::Config;
use crate::confirm::{self, ConfirmOutcome, SettlementReport};
use crate::db;
use crate::errors::{Result, SettleError};
use crate::initiate::{self, SettlementHandle};
use crate::invoice;
use crate::models::{
    ApprovalStatus, ContractRecord, InvoiceRecord, MilestoneRecord, PaymentRecord,
    SettlementEventRecord,
};

#[derive(Clone)]
pub struct ApiState {
    pub pool: SqlitePool,
    pub config: Config,
}

// ─────────────────────────────────────────────────────────
// Request / response shapes
// ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateContractRequest {
    pub client_id: String,
    pub freelancer_id: String,
    pub currency: String,
    pub rail: String,
}

#[derive(Deserialize)]
pub struct CreateMilestoneRequest {
    pub description: String,
    pub amount: i64,
}

#[derive(Deserialize)]
pub struct ApproveMilestoneRequest {
    /// `completed` or `approved`.
    pub status: String,
}

/// Single (`milestone_id`) or bulk (`contract_id`) initiation.
#[derive(Deserialize)]
pub struct InitiateRequest {
    pub milestone_id: Option<i64>,
    pub contract_id: Option<i64>,
    pub payer_id: String,
}

#[derive(Serialize)]
#[serde(untagged)]
pub enum InitiateResponse {
    Single(SettlementHandle),
    Bulk(BulkSettlementResult),
}

#[derive(Deserialize)]
pub struct GenerateInvoiceRequest {
    pub payer_id: String,
}

/// Confirmation callback body from the Settlement Executor (or the
/// payment-status poller fronting it).
#[derive(Deserialize)]
pub struct PaymentStatusRequest {
    /// Reference from the settlement handle; when omitted the milestone's
    /// in-flight payment is used.
    pub payment_reference: Option<String>,
    pub tx_hash: Option<String>,
    #[serde(default)]
    pub amount: i64,
    /// `success` or `failure`.
    pub status: String,
}

#[derive(Serialize)]
pub struct MilestoneDetailResponse {
    pub milestone: MilestoneRecord,
    pub invoice: Option<InvoiceRecord>,
    pub payments: Vec<PaymentRecord>,
    pub events: Vec<SettlementEventRecord>,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

// ─────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `POST /contracts`
pub async fn create_contract(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<CreateContractRequest>,
) -> Result<(StatusCode, Json<ContractRecord>)> {
    if req.client_id.is_empty() || req.freelancer_id.is_empty() {
        return Err(SettleError::InvalidRequest(
            "client_id and freelancer_id are required".to_string(),
        ));
    }
    let contract = db::insert_contract(
        &state.pool,
        &req.client_id,
        &req.freelancer_id,
        &req.currency,
        &req.rail,
    )
    .await?;
    Ok((StatusCode::CREATED, Json(contract)))
}

/// `POST /contracts/:id/milestones`
pub async fn create_milestone(
    State(state): State<Arc<ApiState>>,
    Path(contract_id): Path<i64>,
    Json(req): Json<CreateMilestoneRequest>,
) -> Result<(StatusCode, Json<MilestoneRecord>)> {
    if req.amount <= 0 {
        return Err(SettleError::InvalidRequest(
            "milestone amount must be positive".to_string(),
        ));
    }
    db::get_contract(&state.pool, contract_id)
        .await?
        .ok_or(SettleError::ContractNotFound(contract_id))?;

    let milestone =
        db::insert_milestone(&state.pool, contract_id, &req.description, req.amount).await?;
    Ok((StatusCode::CREATED, Json(milestone)))
}

/// `POST /milestones/:id/approve`
pub async fn approve_milestone(
    State(state): State<Arc<ApiState>>,
    Path(milestone_id): Path<i64>,
    Json(req): Json<ApproveMilestoneRequest>,
) -> Result<Json<MilestoneRecord>> {
    let status = ApprovalStatus::parse(&req.status)
        .filter(|s| *s != ApprovalStatus::Pending)
        .ok_or_else(|| {
            SettleError::InvalidRequest(format!("invalid approval status: {}", req.status))
        })?;

    db::get_milestone(&state.pool, milestone_id)
        .await?
        .ok_or(SettleError::MilestoneNotFound(milestone_id))?;

    db::set_approval_status(&state.pool, milestone_id, status).await?;
    let updated = db::get_milestone(&state.pool, milestone_id)
        .await?
        .ok_or(SettleError::MilestoneNotFound(milestone_id))?;
    Ok(Json(updated))
}

/// `GET /milestones/:id`
pub async fn get_milestone(
    State(state): State<Arc<ApiState>>,
    Path(milestone_id): Path<i64>,
) -> Result<Json<MilestoneDetailResponse>> {
    let milestone = db::get_milestone(&state.pool, milestone_id)
        .await?
        .ok_or(SettleError::MilestoneNotFound(milestone_id))?;

    let invoice = db::get_live_invoice(&state.pool, milestone_id).await?;
    let payments = match &invoice {
        Some(inv) => db::payments_for_invoice(&state.pool, inv.id).await?,
        None => Vec::new(),
    };
    let events = db::events_for_milestone(&state.pool, milestone_id).await?;

    Ok(Json(MilestoneDetailResponse {
        milestone,
        invoice,
        payments,
        events,
    }))
}

/// `POST /milestones/payment/initiate`
///
/// Exactly one of `milestone_id` (single) or `contract_id` (bulk) must be
/// present.
pub async fn initiate_payment(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<InitiateRequest>,
) -> Result<Json<InitiateResponse>> {
    match (req.milestone_id, req.contract_id) {
        (Some(milestone_id), None) => {
            let handle =
                initiate::initiate(&state.pool, &state.config, milestone_id, &req.payer_id)
                    .await?;
            Ok(Json(InitiateResponse::Single(handle)))
        }
        (None, Some(contract_id)) => {
            let result =
                bulk::initiate_bulk(&state.pool, &state.config, contract_id, &req.payer_id)
                    .await?;
            Ok(Json(InitiateResponse::Bulk(result)))
        }
        _ => Err(SettleError::InvalidRequest(
            "provide exactly one of milestone_id or contract_id".to_string(),
        )),
    }
}

/// `POST /milestones/:id/generate-invoice`
pub async fn generate_invoice(
    State(state): State<Arc<ApiState>>,
    Path(milestone_id): Path<i64>,
    Json(req): Json<GenerateInvoiceRequest>,
) -> Result<Json<InvoiceRecord>> {
    let invoice =
        invoice::ensure_invoice(&state.pool, &state.config, milestone_id, &req.payer_id).await?;
    Ok(Json(invoice))
}

/// `POST /milestones/:id/payment-status`
pub async fn payment_status(
    State(state): State<Arc<ApiState>>,
    Path(milestone_id): Path<i64>,
    Json(req): Json<PaymentStatusRequest>,
) -> Result<Json<ConfirmOutcome>> {
    let success = match req.status.as_str() {
        "success" => true,
        "failure" | "failed" => false,
        other => {
            return Err(SettleError::InvalidRequest(format!(
                "invalid settlement status: {other}"
            )))
        }
    };

    let payer_ref = match req.payment_reference {
        Some(r) => {
            // The reference must belong to the milestone in the path.
            let payment = db::get_payment_by_ref(&state.pool, &r)
                .await?
                .ok_or_else(|| SettleError::PaymentNotFound(r.clone()))?;
            let invoice = db::get_invoice(&state.pool, payment.invoice_id)
                .await?
                .ok_or_else(|| SettleError::PaymentNotFound(r.clone()))?;
            if invoice.milestone_id != milestone_id {
                return Err(SettleError::InvalidRequest(format!(
                    "payment reference {r} does not belong to milestone {milestone_id}"
                )));
            }
            r
        }
        None => {
            match db::find_pending_payment_for_milestone(&state.pool, milestone_id).await? {
                Some(pending) => pending.payer_ref,
                // No in-flight payment: this may be a repeat delivery for a
                // settlement that already landed.  Resolve it through the
                // recorded hash so it reaches the duplicate no-op path.
                None => {
                    let settled = match req.tx_hash.as_deref() {
                        Some(hash) => {
                            db::find_payment_for_milestone_by_hash(
                                &state.pool,
                                milestone_id,
                                hash,
                            )
                            .await?
                        }
                        None => None,
                    };
                    settled
                        .ok_or_else(|| {
                            SettleError::PaymentNotFound(format!("milestone {milestone_id}"))
                        })?
                        .payer_ref
                }
            }
        }
    };

    let outcome = confirm::confirm(
        &state.pool,
        &payer_ref,
        SettlementReport {
            tx_hash: req.tx_hash,
            amount: req.amount,
            success,
        },
    )
    .await?;

    Ok(Json(outcome))
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::{seed_contract, test_pool};
    use crate::models::PaymentStatus;

    fn success_callback(amount: i64) -> PaymentStatusRequest {
        PaymentStatusRequest {
            payment_reference: None,
            tx_hash: Some("0xabc".to_string()),
            amount,
            status: "success".to_string(),
        }
    }

    #[tokio::test]
    async fn redelivered_refless_callback_is_a_noop() {
        let pool = test_pool().await;
        let state = Arc::new(ApiState {
            pool: pool.clone(),
            config: Config::for_tests(),
        });
        let (_, ms) = seed_contract(&pool, &[500]).await;
        initiate::initiate(&pool, &state.config, ms[0].id, "client-1")
            .await
            .unwrap();

        let Json(first) =
            payment_status(State(state.clone()), Path(ms[0].id), Json(success_callback(500)))
                .await
                .unwrap();
        assert!(!first.duplicate);
        assert_eq!(first.milestone_status, PaymentStatus::Paid.as_str());

        // The executor redelivers the same callback after the payment has
        // settled and no pending row remains.
        let Json(second) =
            payment_status(State(state), Path(ms[0].id), Json(success_callback(500)))
                .await
                .unwrap();
        assert!(second.duplicate);
        assert_eq!(second.milestone_status, PaymentStatus::Paid.as_str());
    }
}
