//! Database layer — migrations, queries, and the conditional updates that
//! carry the per-milestone concurrency guarantees.
//!
//! Two guarantees are structural (see `migrations/0001_schema.sql`): the
//! partial unique index on live invoices, and the unique index on confirmed
//! transaction hashes.  The third — at most one in-flight payment per
//! milestone — is a compare-and-set on `milestones.payment_status`, so it
//! holds across service instances without a process-local lock.

use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use tracing::info;

use crate::errors::Result;
use crate::models::{
    ApprovalStatus, ContractRecord, InvoiceRecord, MilestoneRecord, PaymentRecord,
    SettlementEventRecord,
};

/// Establish a SQLite connection pool and run pending migrations.
pub async fn init_pool(database_url: &str) -> Result<SqlitePool> {
    // Make sure the file is created if it doesn't exist yet.
    let url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{database_url}")
    };

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database migrations applied successfully");
    Ok(pool)
}

/// Current unix time in seconds.
pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

// ─────────────────────────────────────────────────────────
// Contracts & milestones
// ─────────────────────────────────────────────────────────

pub async fn insert_contract(
    pool: &SqlitePool,
    client_id: &str,
    freelancer_id: &str,
    currency: &str,
    rail: &str,
) -> Result<ContractRecord> {
    let res = sqlx::query(
        r#"
        INSERT INTO contracts (client_id, freelancer_id, currency, rail, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        "#,
    )
    .bind(client_id)
    .bind(freelancer_id)
    .bind(currency)
    .bind(rail)
    .bind(now())
    .execute(pool)
    .await?;

    fetch_contract(pool, res.last_insert_rowid()).await
}

async fn fetch_contract(pool: &SqlitePool, id: i64) -> Result<ContractRecord> {
    let row = sqlx::query_as::<_, ContractRecord>("SELECT * FROM contracts WHERE id = ?1")
        .bind(id)
        .fetch_one(pool)
        .await?;
    Ok(row)
}

pub async fn get_contract(pool: &SqlitePool, id: i64) -> Result<Option<ContractRecord>> {
    let row = sqlx::query_as::<_, ContractRecord>("SELECT * FROM contracts WHERE id = ?1")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

pub async fn insert_milestone(
    pool: &SqlitePool,
    contract_id: i64,
    description: &str,
    amount: i64,
) -> Result<MilestoneRecord> {
    let res = sqlx::query(
        r#"
        INSERT INTO milestones (contract_id, description, amount, created_at)
        VALUES (?1, ?2, ?3, ?4)
        "#,
    )
    .bind(contract_id)
    .bind(description)
    .bind(amount)
    .bind(now())
    .execute(pool)
    .await?;

    let row =
        sqlx::query_as::<_, MilestoneRecord>("SELECT * FROM milestones WHERE id = ?1")
            .bind(res.last_insert_rowid())
            .fetch_one(pool)
            .await?;
    Ok(row)
}

pub async fn get_milestone(pool: &SqlitePool, id: i64) -> Result<Option<MilestoneRecord>> {
    let row = sqlx::query_as::<_, MilestoneRecord>("SELECT * FROM milestones WHERE id = ?1")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

/// All milestones under a contract, oldest first.
pub async fn milestones_for_contract(
    pool: &SqlitePool,
    contract_id: i64,
) -> Result<Vec<MilestoneRecord>> {
    let rows = sqlx::query_as::<_, MilestoneRecord>(
        "SELECT * FROM milestones WHERE contract_id = ?1 ORDER BY id ASC",
    )
    .bind(contract_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Record an approval event.  Forward-only: an `approved` milestone is
/// never demoted, so the update is conditional and reports whether it took.
pub async fn set_approval_status(
    pool: &SqlitePool,
    milestone_id: i64,
    status: ApprovalStatus,
) -> Result<bool> {
    let res = sqlx::query(
        r#"
        UPDATE milestones SET approval_status = ?1
        WHERE id = ?2 AND approval_status IN ('pending', 'completed')
        "#,
    )
    .bind(status.as_str())
    .bind(milestone_id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

// ─────────────────────────────────────────────────────────
// Invoices
// ─────────────────────────────────────────────────────────

/// The live (non-void) invoice for a milestone, if one exists.
pub async fn get_live_invoice(
    pool: &SqlitePool,
    milestone_id: i64,
) -> Result<Option<InvoiceRecord>> {
    let row = sqlx::query_as::<_, InvoiceRecord>(
        "SELECT * FROM invoices WHERE milestone_id = ?1 AND status <> 'void'",
    )
    .bind(milestone_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn get_invoice(pool: &SqlitePool, id: i64) -> Result<Option<InvoiceRecord>> {
    let row = sqlx::query_as::<_, InvoiceRecord>("SELECT * FROM invoices WHERE id = ?1")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

/// Insert a draft invoice under the one-live-invoice-per-milestone index.
///
/// Returns `Ok(None)` when a concurrent caller won the race; the caller
/// must re-fetch and use the winning row.
pub async fn create_invoice(
    pool: &SqlitePool,
    milestone_id: i64,
    amount: i64,
    due_at: i64,
) -> Result<Option<InvoiceRecord>> {
    let res = sqlx::query(
        r#"
        INSERT INTO invoices (milestone_id, amount, status, created_at, due_at)
        VALUES (?1, ?2, 'draft', ?3, ?4)
        "#,
    )
    .bind(milestone_id)
    .bind(amount)
    .bind(now())
    .bind(due_at)
    .execute(pool)
    .await;

    let res = match res {
        Ok(r) => r,
        Err(sqlx::Error::Database(db)) if db.is_unique_violation() => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let row = sqlx::query_as::<_, InvoiceRecord>("SELECT * FROM invoices WHERE id = ?1")
        .bind(res.last_insert_rowid())
        .fetch_one(pool)
        .await?;
    Ok(Some(row))
}

/// `unpaid → invoice_pending`, only when the milestone is still untouched.
pub async fn mark_invoice_pending(pool: &SqlitePool, milestone_id: i64) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE milestones SET payment_status = 'invoice_pending' WHERE id = ?1 AND payment_status = 'unpaid'",
    )
    .bind(milestone_id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// `draft → sent`, recorded when a settlement handle is issued.
pub async fn mark_invoice_sent(pool: &SqlitePool, invoice_id: i64) -> Result<()> {
    sqlx::query("UPDATE invoices SET status = 'sent' WHERE id = ?1 AND status = 'draft'")
        .bind(invoice_id)
        .execute(pool)
        .await?;
    Ok(())
}

// ─────────────────────────────────────────────────────────
// Payment-pending guard
// ─────────────────────────────────────────────────────────

/// Compare-and-set claiming a milestone for one in-flight payment attempt.
///
/// Succeeds from `unpaid`, `invoice_pending` and `failed` (a failed
/// confirmation releases the claim, so re-initiation loops back here).
/// Returns `false` when another attempt already holds the claim or the
/// milestone is paid.
pub async fn claim_for_payment(pool: &SqlitePool, milestone_id: i64) -> Result<bool> {
    let res = sqlx::query(
        r#"
        UPDATE milestones SET payment_status = 'payment_pending'
        WHERE id = ?1 AND payment_status IN ('unpaid', 'invoice_pending', 'failed')
        "#,
    )
    .bind(milestone_id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

// ─────────────────────────────────────────────────────────
// Payments
// ─────────────────────────────────────────────────────────

/// Create the `pending` payment row for an invoice, or return the one a
/// concurrent initiation already created.  The partial unique index on
/// `(invoice_id) WHERE status = 'pending'` makes the insert race-safe.
pub async fn get_or_create_pending_payment(
    pool: &SqlitePool,
    invoice_id: i64,
    amount: i64,
    payer_ref: &str,
) -> Result<Option<PaymentRecord>> {
    sqlx::query(
        r#"
        INSERT INTO payments (invoice_id, amount, payer_ref, status, created_at)
        VALUES (?1, ?2, ?3, 'pending', ?4)
        ON CONFLICT DO NOTHING
        "#,
    )
    .bind(invoice_id)
    .bind(amount)
    .bind(payer_ref)
    .bind(now())
    .execute(pool)
    .await?;

    find_pending_payment(pool, invoice_id).await
}

pub async fn find_pending_payment(
    pool: &SqlitePool,
    invoice_id: i64,
) -> Result<Option<PaymentRecord>> {
    let row = sqlx::query_as::<_, PaymentRecord>(
        "SELECT * FROM payments WHERE invoice_id = ?1 AND status = 'pending'",
    )
    .bind(invoice_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn get_payment_by_ref(
    pool: &SqlitePool,
    payer_ref: &str,
) -> Result<Option<PaymentRecord>> {
    let row = sqlx::query_as::<_, PaymentRecord>("SELECT * FROM payments WHERE payer_ref = ?1")
        .bind(payer_ref)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

/// The in-flight payment for a milestone, used when a confirmation callback
/// arrives without an explicit payment reference.
pub async fn find_pending_payment_for_milestone(
    pool: &SqlitePool,
    milestone_id: i64,
) -> Result<Option<PaymentRecord>> {
    let row = sqlx::query_as::<_, PaymentRecord>(
        r#"
        SELECT p.* FROM payments p
        JOIN invoices i ON i.id = p.invoice_id
        WHERE i.milestone_id = ?1 AND p.status = 'pending'
        "#,
    )
    .bind(milestone_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// A milestone's payment already credited with the given hash, used to
/// route repeat confirmations without a reference into the duplicate path.
pub async fn find_payment_for_milestone_by_hash(
    pool: &SqlitePool,
    milestone_id: i64,
    tx_hash: &str,
) -> Result<Option<PaymentRecord>> {
    let row = sqlx::query_as::<_, PaymentRecord>(
        r#"
        SELECT p.* FROM payments p
        JOIN invoices i ON i.id = p.invoice_id
        WHERE i.milestone_id = ?1 AND p.tx_hash = ?2
        "#,
    )
    .bind(milestone_id)
    .bind(tx_hash)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn payments_for_invoice(
    pool: &SqlitePool,
    invoice_id: i64,
) -> Result<Vec<PaymentRecord>> {
    let rows = sqlx::query_as::<_, PaymentRecord>(
        "SELECT * FROM payments WHERE invoice_id = ?1 ORDER BY id ASC",
    )
    .bind(invoice_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

// ─────────────────────────────────────────────────────────
// Settlement-event outbox
// ─────────────────────────────────────────────────────────

/// Undelivered outbox rows, oldest first.
pub async fn undelivered_events(
    pool: &SqlitePool,
    limit: i64,
) -> Result<Vec<SettlementEventRecord>> {
    let rows = sqlx::query_as::<_, SettlementEventRecord>(
        r#"
        SELECT * FROM settlement_events
        WHERE delivered_at IS NULL
        ORDER BY id ASC
        LIMIT ?1
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn mark_event_delivered(pool: &SqlitePool, event_id: i64) -> Result<()> {
    sqlx::query("UPDATE settlement_events SET delivered_at = ?1 WHERE id = ?2")
        .bind(now())
        .bind(event_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// All outbox rows for one milestone, used by status reads and tests.
pub async fn events_for_milestone(
    pool: &SqlitePool,
    milestone_id: i64,
) -> Result<Vec<SettlementEventRecord>> {
    let rows = sqlx::query_as::<_, SettlementEventRecord>(
        "SELECT * FROM settlement_events WHERE milestone_id = ?1 ORDER BY id ASC",
    )
    .bind(milestone_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

// ─────────────────────────────────────────────────────────
// Test support
// ─────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// In-memory pool with the schema applied.  One connection so every
    /// test sees a single coherent database.
    pub async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory pool");
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .expect("migrations");
        pool
    }

    /// A contract for `client-1`/`dev-1` with one approved milestone per
    /// entry in `amounts`.  Returns the contract and its milestones.
    pub async fn seed_contract(
        pool: &SqlitePool,
        amounts: &[i64],
    ) -> (ContractRecord, Vec<MilestoneRecord>) {
        let contract = insert_contract(pool, "client-1", "dev-1", "USDC", "stellar")
            .await
            .expect("contract");
        let mut milestones = Vec::new();
        for (i, amount) in amounts.iter().enumerate() {
            let m = insert_milestone(pool, contract.id, &format!("milestone {i}"), *amount)
                .await
                .expect("milestone");
            set_approval_status(pool, m.id, ApprovalStatus::Approved)
                .await
                .expect("approve");
            milestones.push(get_milestone(pool, m.id).await.unwrap().unwrap());
        }
        (contract, milestones)
    }
}
