//! Bounded retry with backoff
//!
//! Vendor status APIs are eventually consistent, so most calls that ask
//! "has it happened yet?" go through [`retry_until`]. The combinator never
//! loops forever: once the policy's attempt budget is spent it returns
//! [`Error::RetryExhausted`] naming the operation.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, trace};

/// Retry budget for one call site
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    /// 1.0 gives a fixed interval
    pub backoff_factor: f64,
}

impl RetryPolicy {
    pub const fn fixed(max_attempts: u32, delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay_ms: delay_ms,
            backoff_factor: 1.0,
        }
    }

    pub const fn exponential(max_attempts: u32, base_delay_ms: u64, backoff_factor: f64) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
            backoff_factor,
        }
    }

    /// Delay slept after failed attempt number `attempt` (1-based)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let factor = self.backoff_factor.max(1.0).powi(exp);
        let ms = (self.base_delay_ms as f64 * factor).min(u64::MAX as f64);
        Duration::from_millis(ms as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(5, 1000, 2.0)
    }
}

/// Outcome of one attempt
#[derive(Debug)]
pub enum Attempt<T> {
    Done(T),
    /// Not decidable yet; the reason ends up in the trace log
    Retry(String),
}

/// Run `attempt` until it reports [`Attempt::Done`].
///
/// Errors returned by `attempt` are treated as fatal and propagate as-is;
/// transient conditions must be expressed as [`Attempt::Retry`].
pub async fn retry_until<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut attempt: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Attempt<T>>>,
{
    let max_attempts = policy.max_attempts.max(1);

    for n in 1..=max_attempts {
        match attempt(n).await? {
            Attempt::Done(value) => return Ok(value),
            Attempt::Retry(reason) => {
                trace!("{} attempt {}/{}: {}", operation, n, max_attempts, reason);
                if n < max_attempts {
                    tokio::time::sleep(policy.delay_after(n)).await;
                }
            }
        }
    }

    debug!("{} gave up after {} attempts", operation, max_attempts);
    Err(Error::RetryExhausted {
        operation: operation.to_string(),
        attempts: max_attempts,
    })
}
