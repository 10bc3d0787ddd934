//! Bounded exponential backoff for transient failures.
//!
//! Validation and conflict errors are never retried here; only errors that
//! [`SettleError::is_transient`] reports as self-healing go around the loop.
//! Exhausting the attempt budget returns the last error to the caller, who
//! decides whether that degrades to a per-item failure or escalates.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::errors::{Result, SettleError};

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl Backoff {
    /// Delay before the given retry (attempt numbering starts at 1).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base.saturating_mul(factor).min(self.cap)
    }
}

/// Run `op` until it succeeds, fails fatally, or the attempt budget runs out.
pub async fn with_backoff<T, F, Fut>(policy: &Backoff, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1u32;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    "{what} failed (attempt {attempt}/{}, retrying in {delay:?}): {e}",
                    policy.max_attempts
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
