//! Bounded exponential backoff for transient external errors
//!
//! Used at adapter boundaries (chain RPC, remote storage, suggestion
//! endpoint). Only errors for which [`Error::is_transient`] holds are
//! retried; everything else, the kill switch in particular, returns at once.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub attempts: usize,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: usize, initial_delay: Duration) -> Self {
        Self {
            attempts,
            initial_delay_ms: initial_delay.as_millis() as u64,
            max_delay_ms: initial_delay.as_millis() as u64 * 8,
        }
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    pub async fn run<F, Fut, T>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.attempts.max(1);
        let mut delay = Duration::from_millis(self.initial_delay_ms);
        let max_delay = Duration::from_millis(self.max_delay_ms.max(self.initial_delay_ms));
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && attempt < attempts => {
                    tracing::warn!(
                        operation = what,
                        attempt,
                        attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient failure, retrying"
                    );
                    sleep(delay).await;
                    delay = delay.saturating_mul(2).min(max_delay);
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_transient() {
                        tracing::error!(operation = what, attempts, error = %e, "Retries exhausted");
                    }
                    return Err(e);
                }
            }
        }
    }
}

/// Map an RPC transport failure onto the transient class.
pub fn transient<E: std::fmt::Display>(e: E) -> Error {
    Error::Transient(e.to_string())
}
