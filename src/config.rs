//! Application configuration loaded from environment variables.

use std::time::Duration;

use crate::errors::{Result, SettleError};

#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file
    pub database_url: String,
    /// Port for the REST API server
    pub api_port: u16,
    /// Webhook URL of the Notification Dispatcher; events are logged and
    /// marked delivered when unset
    pub notify_webhook_url: Option<String>,
    /// How often (in seconds) the dispatcher polls the event outbox
    pub notify_poll_secs: u64,
    /// Days until a freshly generated invoice is due
    pub invoice_due_days: i64,
    /// Bounded retry attempts for transient storage/delivery failures
    pub retry_max_attempts: u32,
    /// Base delay (ms) for exponential backoff
    pub retry_base_ms: u64,
    /// Backoff delay cap (ms)
    pub retry_cap_ms: u64,
    /// Concurrent per-milestone workers in a bulk initiation
    pub bulk_concurrency: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            database_url: env_var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:./settler.db".to_string()),
            api_port: env_var("API_PORT")
                .unwrap_or_else(|_| "3002".to_string())
                .parse()
                .map_err(|_| SettleError::Config("Invalid API_PORT".to_string()))?,
            notify_webhook_url: env_var("NOTIFY_WEBHOOK_URL").ok(),
            notify_poll_secs: env_var("NOTIFY_POLL_SECS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .map_err(|_| SettleError::Config("Invalid NOTIFY_POLL_SECS".to_string()))?,
            invoice_due_days: env_var("INVOICE_DUE_DAYS")
                .unwrap_or_else(|_| "14".to_string())
                .parse()
                .map_err(|_| SettleError::Config("Invalid INVOICE_DUE_DAYS".to_string()))?,
            retry_max_attempts: env_var("RETRY_MAX_ATTEMPTS")
                .unwrap_or_else(|_| "4".to_string())
                .parse()
                .map_err(|_| SettleError::Config("Invalid RETRY_MAX_ATTEMPTS".to_string()))?,
            retry_base_ms: env_var("RETRY_BASE_MS")
                .unwrap_or_else(|_| "100".to_string())
                .parse()
                .map_err(|_| SettleError::Config("Invalid RETRY_BASE_MS".to_string()))?,
            retry_cap_ms: env_var("RETRY_CAP_MS")
                .unwrap_or_else(|_| "5000".to_string())
                .parse()
                .map_err(|_| SettleError::Config("Invalid RETRY_CAP_MS".to_string()))?,
            bulk_concurrency: env_var("BULK_CONCURRENCY")
                .unwrap_or_else(|_| "4".to_string())
                .parse()
                .map_err(|_| SettleError::Config("Invalid BULK_CONCURRENCY".to_string()))?,
        })
    }

    /// Backoff policy shared by invoice generation and event delivery.
    pub fn backoff(&self) -> crate::retry::Backoff {
        crate::retry::Backoff {
            max_attempts: self.retry_max_attempts,
            base: Duration::from_millis(self.retry_base_ms),
            cap: Duration::from_millis(self.retry_cap_ms),
        }
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        Config {
            database_url: "sqlite::memory:".to_string(),
            api_port: 0,
            notify_webhook_url: None,
            notify_poll_secs: 1,
            invoice_due_days: 14,
            retry_max_attempts: 3,
            retry_base_ms: 1,
            retry_cap_ms: 5,
            bulk_concurrency: 4,
        }
    }
}

fn env_var(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| SettleError::Config(format!("Missing env var: {key}")))
}
