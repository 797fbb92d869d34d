// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Exponential backoff schedules.
//!
//! One [`RetryConfig`] type serves three callers:
//! - the offline queue, which persists `next_retry_at` computed from
//!   [`RetryConfig::delay_for_attempt`] instead of sleeping,
//! - the signaling driver, which sleeps between reconnect attempts,
//! - opening the SQLite store, wrapped in [`retry`].
//!
//! The queue and signaling schedules come from their config sections
//! (`QueueConfig::retry_config`, `SignalingConfig::retry_config`).
//!
//! # Example
//!
//! ```
//! use budget_sync::RetryConfig;
//! use std::time::Duration;
//!
//! let queue = RetryConfig::queue();
//! assert_eq!(queue.delay_for_attempt(0), Duration::from_secs(1));
//! assert_eq!(queue.delay_for_attempt(1), Duration::from_secs(2));
//! assert_eq!(queue.delay_for_attempt(10), Duration::from_secs(30)); // capped
//!
//! let startup = RetryConfig::startup();
//! assert_eq!(startup.max_retries, Some(5));
//! assert_eq!(startup.delay_for_attempt(10), Duration::from_secs(2));
//! ```

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Backoff parameters: `initial_delay * factor^attempt`, capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// `None` retries forever
    pub max_retries: Option<usize>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::queue()
    }
}

impl RetryConfig {
    /// Offline queue schedule: 1s, 2s, 4s ... capped at 30s, 3 retries.
    #[must_use]
    pub fn queue() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            factor: 2.0,
        }
    }

    /// Fail fast when opening local stores at startup.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_retries: Some(5),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Fast retry for tests (minimal delays)
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
        }
    }

    /// Delay before the retry that follows `attempt` previous failures (0-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let scaled = self.initial_delay.as_secs_f64() * self.factor.powi(exp);
        if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(scaled.max(0.0))
    }

    /// Whether `attempts` failures have used up the retry budget.
    #[must_use]
    pub fn exhausted(&self, attempts: usize) -> bool {
        self.max_retries.is_some_and(|max| attempts > max)
    }
}

/// Run `operation` until it succeeds or `max_retries` attempts have failed.
pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    config: &RetryConfig,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempts: usize = 0;

    loop {
        match operation().await {
            Ok(val) => {
                if attempts > 0 {
                    info!(operation = operation_name, attempts, "Operation succeeded after retries");
                }
                return Ok(val);
            }
            Err(err) => {
                attempts += 1;
                if config.max_retries.is_some_and(|max| attempts >= max) {
                    return Err(err);
                }

                let delay = config.delay_for_attempt((attempts - 1) as u32);
                warn!(
                    operation = operation_name,
                    attempt = attempts,
                    max = ?config.max_retries,
                    error = %err,
                    ?delay,
                    "Operation failed, retrying"
                );
                sleep(delay).await;
            }
        }
    }
}
