//! Milestone payment settlement engine — entry point.
//!
//! Exposes an Axum REST API for invoice generation, single/bulk payment
//! initiation and settlement confirmation, backed by SQLite.  A background
//! task drains the settlement-event outbox to the Notification Dispatcher
//! webhook.

mod api;
mod bulk;
mod config;
mod confirm;
mod db;
mod errors;
mod initiate;
mod invoice;
mod models;
mod notify;
mod retry;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use reqwest::Client;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::Config;
use notify::NotifierState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging (RUST_LOG controls verbosity).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    // Load config from environment.
    let config = Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;

    // Set up the SQLite connection pool and run migrations.
    let pool = db::init_pool(&config.database_url).await?;

    // HTTP client for outbound webhook deliveries.
    let client = Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()?;

    // ─── Background event dispatcher ──────────────────────
    let notifier_state = Arc::new(NotifierState {
        pool: pool.clone(),
        config: config.clone(),
        client,
    });
    tokio::spawn(notify::run(notifier_state));

    // ─── REST API ─────────────────────────────────────────
    let api_state = Arc::new(api::ApiState {
        pool,
        config: config.clone(),
    });

    let app = Router::new()
        .route("/health", get(api::health))
        .route("/contracts", post(api::create_contract))
        .route("/contracts/:id/milestones", post(api::create_milestone))
        .route("/milestones/:id", get(api::get_milestone))
        .route("/milestones/:id/approve", post(api::approve_milestone))
        .route("/milestones/payment/initiate", post(api::initiate_payment))
        .route("/milestones/:id/generate-invoice", post(api::generate_invoice))
        .route("/milestones/:id/payment-status", post(api::payment_status))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(api_state);

    let addr = format!("0.0.0.0:{}", config.api_port);
    info!("API listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
