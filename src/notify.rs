//! Settlement-event delivery to the Notification Dispatcher.
//!
//! Events are written to the `settlement_events` outbox in the same
//! transaction as the confirmation they describe, so the guarantee here is
//! at-least-once: a row is only marked delivered after the webhook accepts
//! it, and a crash between delivery and the mark replays the event on the
//! next poll.  Formatting and fan-out are the dispatcher's problem.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::db;
use crate::errors::Result;
use crate::models::SettlementEventRecord;

const DELIVERY_BATCH: i64 = 20;

pub struct NotifierState {
    pub pool: SqlitePool,
    pub config: Config,
    pub client: Client,
}

/// Wire shape posted to the dispatcher webhook.
#[derive(Debug, Serialize)]
pub struct SettlementEventPayload<'a> {
    pub event_id: i64,
    pub milestone_id: i64,
    pub contract_id: i64,
    pub outcome: &'a str,
    pub amount: i64,
    pub parties: Parties<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_ref: Option<&'a str>,
    pub occurred_at: String,
}

#[derive(Debug, Serialize)]
pub struct Parties<'a> {
    pub client_id: &'a str,
    pub freelancer_id: &'a str,
}

impl<'a> SettlementEventPayload<'a> {
    pub fn from_record(ev: &'a SettlementEventRecord) -> Self {
        let occurred_at = chrono::DateTime::from_timestamp(ev.created_at, 0)
            .unwrap_or_default()
            .to_rfc3339();
        SettlementEventPayload {
            event_id: ev.id,
            milestone_id: ev.milestone_id,
            contract_id: ev.contract_id,
            outcome: &ev.event_type,
            amount: ev.amount,
            parties: Parties {
                client_id: &ev.client_id,
                freelancer_id: &ev.freelancer_id,
            },
            tx_ref: ev.tx_ref.as_deref(),
            occurred_at,
        }
    }
}

/// Spawn the delivery loop as a background [`tokio`] task.
pub async fn run(state: Arc<NotifierState>) {
    info!(
        "Notification dispatcher starting — webhook: {}",
        state.config.notify_webhook_url.as_deref().unwrap_or("(log only)")
    );

    loop {
        match deliver_pending(&state).await {
            Ok(0) => {}
            Ok(n) => debug!("Delivered {n} settlement events"),
            Err(e) => error!("Event delivery sweep failed: {e}"),
        }
        tokio::time::sleep(Duration::from_secs(state.config.notify_poll_secs)).await;
    }
}

/// Deliver one batch of undelivered events.  A failing item is logged and
/// left in the outbox for the next sweep; it never stops its siblings.
pub async fn deliver_pending(state: &NotifierState) -> Result<usize> {
    let pending = db::undelivered_events(&state.pool, DELIVERY_BATCH).await?;
    let mut delivered = 0usize;

    for ev in &pending {
        match deliver_one(state, ev).await {
            Ok(()) => {
                db::mark_event_delivered(&state.pool, ev.id).await?;
                delivered += 1;
            }
            Err(e) => {
                warn!(
                    "Delivery of event {} (milestone {}) failed, will retry next sweep: {e}",
                    ev.id, ev.milestone_id
                );
            }
        }
    }

    Ok(delivered)
}

/// Push a single event to the webhook, with bounded backoff on transient
/// failures.  Without a configured webhook the event is only logged.
async fn deliver_one(state: &NotifierState, ev: &SettlementEventRecord) -> Result<()> {
    let Some(url) = state.config.notify_webhook_url.as_deref() else {
        info!(
            "Settlement event {}: milestone {} {} (amount {})",
            ev.id, ev.milestone_id, ev.event_type, ev.amount
        );
        return Ok(());
    };

    let policy = state.config.backoff();
    let payload = SettlementEventPayload::from_record(ev);

    crate::retry::with_backoff(&policy, "event delivery", || async {
        let resp = state.client.post(url).json(&payload).send().await?;
        resp.error_for_status()?;
        Ok(())
    })
    .await
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::{seed_contract, test_pool};
    use crate::{confirm, initiate};

    fn state_without_webhook(pool: SqlitePool) -> NotifierState {
        NotifierState {
            pool,
            config: Config::for_tests(),
            client: Client::new(),
        }
    }

    #[tokio::test]
    async fn confirmed_settlement_lands_in_the_outbox_and_drains() {
        let pool = test_pool().await;
        let cfg = Config::for_tests();
        let (_, ms) = seed_contract(&pool, &[500]).await;

        let handle = initiate::initiate(&pool, &cfg, ms[0].id, "client-1").await.unwrap();
        confirm::confirm(
            &pool,
            &handle.payment_reference,
            confirm::SettlementReport {
                tx_hash: Some("0xabc".to_string()),
                amount: 500,
                success: true,
            },
        )
        .await
        .unwrap();

        let state = state_without_webhook(pool.clone());
        let n = deliver_pending(&state).await.unwrap();
        assert_eq!(n, 1);

        // Second sweep finds nothing: at-least-once, not forever.
        let n = deliver_pending(&state).await.unwrap();
        assert_eq!(n, 0);

        let events = db::events_for_milestone(&pool, ms[0].id).await.unwrap();
        assert!(events[0].delivered_at.is_some());
    }

    #[tokio::test]
    async fn payload_carries_both_parties() {
        let pool = test_pool().await;
        let cfg = Config::for_tests();
        let (_, ms) = seed_contract(&pool, &[250]).await;

        let handle = initiate::initiate(&pool, &cfg, ms[0].id, "client-1").await.unwrap();
        confirm::confirm(
            &pool,
            &handle.payment_reference,
            confirm::SettlementReport {
                tx_hash: None,
                amount: 0,
                success: false,
            },
        )
        .await
        .unwrap();

        let events = db::events_for_milestone(&pool, ms[0].id).await.unwrap();
        let payload = SettlementEventPayload::from_record(&events[0]);
        assert_eq!(payload.outcome, "payment_failed");
        assert_eq!(payload.parties.client_id, "client-1");
        assert_eq!(payload.parties.freelancer_id, "dev-1");

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["parties"]["client_id"], "client-1");
        assert!(json.get("tx_ref").is_none());
    }
}
