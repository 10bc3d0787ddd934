//! Durable record types and their status vocabularies.
//!
//! Statuses are stored as short strings in SQLite; the enums here are the
//! single source of the legal values and the only place the string forms
//! are spelled out.

use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────
// Status enums
// ─────────────────────────────────────────────────────────

/// Work-approval state of a milestone.  Only `completed` and `approved`
/// milestones are invoiceable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Completed,
    Approved,
}

impl ApprovalStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "completed" => Some(Self::Completed),
            "approved" => Some(Self::Approved),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Approved => "approved",
        }
    }

    /// Whether an invoice may be generated in this state.
    pub fn invoiceable(&self) -> bool {
        matches!(self, Self::Completed | Self::Approved)
    }
}

/// Payment lifecycle of a milestone:
/// `unpaid → invoice_pending → payment_pending → {paid | failed}`.
/// `paid` is terminal; `failed` loops back through re-initiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Unpaid,
    InvoicePending,
    PaymentPending,
    Paid,
    Failed,
}

impl PaymentStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unpaid" => Some(Self::Unpaid),
            "invoice_pending" => Some(Self::InvoicePending),
            "payment_pending" => Some(Self::PaymentPending),
            "paid" => Some(Self::Paid),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unpaid => "unpaid",
            Self::InvoicePending => "invoice_pending",
            Self::PaymentPending => "payment_pending",
            Self::Paid => "paid",
            Self::Failed => "failed",
        }
    }
}

/// Invoice document state.  `partial` is sub-terminal: the milestone stays
/// `payment_pending` until the full amount reconciles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Sent,
    Paid,
    Partial,
    Overdue,
    Void,
}

impl InvoiceStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(Self::Draft),
            "sent" => Some(Self::Sent),
            "paid" => Some(Self::Paid),
            "partial" => Some(Self::Partial),
            "overdue" => Some(Self::Overdue),
            "void" => Some(Self::Void),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Sent => "sent",
            Self::Paid => "paid",
            Self::Partial => "partial",
            Self::Overdue => "overdue",
            Self::Void => "void",
        }
    }
}

/// One settlement attempt.  Terminal rows (`completed`/`failed`) are never
/// mutated again; a retry is a new row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentState {
    Pending,
    Completed,
    Failed,
}

impl PaymentState {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

// ─────────────────────────────────────────────────────────
// Records
// ─────────────────────────────────────────────────────────

/// A client/freelancer agreement grouping milestones.  Immutable after
/// creation.  Amounts everywhere are integer minor units of `currency`;
/// timestamps are unix seconds.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ContractRecord {
    pub id: i64,
    pub client_id: String,
    pub freelancer_id: String,
    pub currency: String,
    pub rail: String,
    pub created_at: i64,
}

/// A payable unit of work.  Never deleted; `paid` implies `tx_ref` and
/// `paid_at` are set.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MilestoneRecord {
    pub id: i64,
    pub contract_id: i64,
    pub description: String,
    pub amount: i64,
    pub approval_status: String,
    pub payment_status: String,
    pub paid_at: Option<i64>,
    pub tx_ref: Option<String>,
    pub paid_amount: Option<i64>,
    pub retry_count: i64,
    pub created_at: i64,
}

/// The 1:1 payment-request document for a milestone.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct InvoiceRecord {
    pub id: i64,
    pub milestone_id: i64,
    pub amount: i64,
    pub status: String,
    pub created_at: i64,
    pub due_at: i64,
    pub paid_at: Option<i64>,
    pub tx_ref: Option<String>,
}

/// One settlement attempt against an invoice.  `tx_hash` stays NULL until
/// the rail confirms; once set it is unique across all payments.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PaymentRecord {
    pub id: i64,
    pub invoice_id: i64,
    pub amount: i64,
    pub payer_ref: String,
    pub tx_hash: Option<String>,
    pub status: String,
    pub created_at: i64,
    pub confirmed_at: Option<i64>,
}

/// Outbox row destined for the Notification Dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SettlementEventRecord {
    pub id: i64,
    pub milestone_id: i64,
    pub contract_id: i64,
    pub event_type: String,
    pub amount: i64,
    pub client_id: String,
    pub freelancer_id: String,
    pub tx_ref: Option<String>,
    pub created_at: i64,
    pub delivered_at: Option<i64>,
}

/// Event kinds written to the outbox.
pub const EVENT_PAYMENT_SUCCEEDED: &str = "payment_succeeded";
pub const EVENT_PAYMENT_FAILED: &str = "payment_failed";

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
