//! Application-wide error types.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettleError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Contract {0} not found")]
    ContractNotFound(i64),

    #[error("Milestone {0} not found")]
    MilestoneNotFound(i64),

    #[error("No payment found for reference {0}")]
    PaymentNotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Milestone {0} is already paid")]
    AlreadyPaid(i64),

    #[error("Milestone {0} is not approved for payment")]
    NotApproved(i64),

    #[error("Invoice generation failed for milestone {milestone_id}: {reason}")]
    InvoiceGeneration { milestone_id: i64, reason: String },
}

impl SettleError {
    /// Whether retrying the failed operation can succeed without operator
    /// intervention.  Unique-constraint violations are conflicts (the row
    /// already exists) and must be resolved by re-reading, not retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            SettleError::Database(sqlx::Error::Database(db)) => !db.is_unique_violation(),
            SettleError::Database(_) | SettleError::Http(_) => true,
            _ => false,
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            SettleError::InvalidRequest(_) | SettleError::NotApproved(_) => StatusCode::BAD_REQUEST,
            SettleError::Unauthorized(_) => StatusCode::FORBIDDEN,
            SettleError::ContractNotFound(_)
            | SettleError::MilestoneNotFound(_)
            | SettleError::PaymentNotFound(_) => StatusCode::NOT_FOUND,
            SettleError::AlreadyPaid(_) => StatusCode::CONFLICT,
            SettleError::InvoiceGeneration { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short machine-readable reason code surfaced alongside the message.
    pub fn reason_code(&self) -> &'static str {
        match self {
            SettleError::Database(_) => "database_error",
            SettleError::Migrate(_) => "migration_error",
            SettleError::Http(_) => "upstream_http_error",
            SettleError::Json(_) => "json_error",
            SettleError::Config(_) => "config_error",
            SettleError::InvalidRequest(_) => "invalid_request",
            SettleError::ContractNotFound(_) => "contract_not_found",
            SettleError::MilestoneNotFound(_) => "milestone_not_found",
            SettleError::PaymentNotFound(_) => "payment_not_found",
            SettleError::Unauthorized(_) => "unauthorized",
            SettleError::AlreadyPaid(_) => "already_paid",
            SettleError::NotApproved(_) => "not_approved",
            SettleError::InvoiceGeneration { .. } => "invoice_generation_failed",
        }
    }
}

impl IntoResponse for SettleError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = serde_json::json!({
            "error": self.to_string(),
            "code": self.reason_code(),
        });
        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, SettleError>;
