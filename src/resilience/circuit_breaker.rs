// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Circuit breaker around direct cloud calls, using the recloser crate.
//!
//! When the cloud endpoint keeps failing, direct sends stop hammering it and
//! mutations go straight to the offline queue instead; the queue's own
//! backoff takes over. Health probes use a separate circuit so a flapping
//! probe can't starve writes.
//!
//! States:
//! - Closed: calls pass through
//! - Open: calls are rejected without running
//! - HalfOpen: a few probe calls decide whether to close again

use recloser::{AsyncRecloser, Error as RecloserError, Recloser};
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Last observed circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed = 0,
    HalfOpen = 1,
    Open = 2,
}

impl CircuitState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::HalfOpen,
            2 => Self::Open,
            _ => Self::Closed,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::HalfOpen => write!(f, "half_open"),
            Self::Open => write!(f, "open"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// The circuit is open; the operation was not run.
    #[error("circuit breaker open, request rejected")]
    Rejected,

    #[error("operation failed: {0}")]
    Inner(#[source] E),
}

impl<E> From<RecloserError<E>> for CircuitError<E> {
    fn from(err: RecloserError<E>) -> Self {
        match err {
            RecloserError::Rejected => CircuitError::Rejected,
            RecloserError::Inner(e) => CircuitError::Inner(e),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Calls in the closed-state window
    pub window: usize,
    /// Failure ratio over the window that opens the circuit
    pub error_rate: f32,
    /// Probe calls allowed while half-open
    pub half_open_probes: usize,
    /// Time spent open before probing
    pub open_wait: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            window: 10,
            error_rate: 0.5,
            half_open_probes: 2,
            open_wait: Duration::from_secs(30),
        }
    }
}

impl CircuitConfig {
    /// Direct mutation sends: trip quickly, the queue absorbs the load.
    #[must_use]
    pub fn cloud_writes() -> Self {
        Self {
            window: 6,
            error_rate: 0.5,
            half_open_probes: 2,
            open_wait: Duration::from_secs(30),
        }
    }

    /// Health probes and pulls: tolerate more noise.
    #[must_use]
    pub fn cloud_reads() -> Self {
        Self {
            window: 20,
            error_rate: 0.75,
            half_open_probes: 1,
            open_wait: Duration::from_secs(15),
        }
    }

    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            window: 2,
            error_rate: 0.5,
            half_open_probes: 1,
            open_wait: Duration::from_secs(60),
        }
    }
}

/// A named circuit breaker with call counters.
pub struct CircuitBreaker {
    name: String,
    inner: AsyncRecloser,
    state: AtomicU8,
    calls_total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        let recloser = Recloser::custom()
            .error_rate(config.error_rate)
            .closed_len(config.window.max(1))
            .half_open_len(config.half_open_probes.max(1))
            .open_wait(config.open_wait)
            .build();

        Self {
            name: name.into(),
            inner: recloser.into(),
            state: AtomicU8::new(CircuitState::Closed as u8),
            calls_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// State inferred from the most recent call outcome.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Run `f` through the breaker. Every error counts as a failure.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_filtered(|_| true, f).await
    }

    /// Run `f` through the breaker. Errors for which `counts` returns false
    /// are passed back without moving the breaker towards open, so a
    /// rejected payload doesn't trip the circuit for everyone.
    pub async fn call_filtered<C, F, Fut, T, E>(&self, counts: C, f: F) -> Result<T, CircuitError<E>>
    where
        C: Fn(&E) -> bool,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.calls_total.fetch_add(1, Ordering::Relaxed);

        let guarded = async {
            match f().await {
                Ok(value) => Ok(Ok(value)),
                Err(err) if !counts(&err) => Ok(Err(err)),
                Err(err) => Err(err),
            }
        };

        match self.inner.call(guarded).await {
            Ok(Ok(value)) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                self.state.store(CircuitState::Closed as u8, Ordering::Release);
                crate::metrics::record_circuit_call(&self.name, "success");
                Ok(value)
            }
            Ok(Err(err)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                debug!(circuit = %self.name, "Circuit call failed (not counted)");
                crate::metrics::record_circuit_call(&self.name, "failure");
                Err(CircuitError::Inner(err))
            }
            Err(RecloserError::Rejected) => {
                self.rejections.fetch_add(1, Ordering::Relaxed);
                if self.state.swap(CircuitState::Open as u8, Ordering::AcqRel) != CircuitState::Open as u8 {
                    warn!(circuit = %self.name, "Circuit breaker open, rejecting calls");
                }
                crate::metrics::record_circuit_call(&self.name, "rejected");
                Err(CircuitError::Rejected)
            }
            Err(RecloserError::Inner(err)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                if self.state() == CircuitState::Open {
                    self.state.store(CircuitState::HalfOpen as u8, Ordering::Release);
                }
                debug!(circuit = %self.name, "Circuit call failed");
                crate::metrics::record_circuit_call(&self.name, "failure");
                Err(CircuitError::Inner(err))
            }
        }
    }

    #[must_use]
    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }
}

/// The two cloud circuits used by the coordinator.
pub struct CloudCircuits {
    pub writes: CircuitBreaker,
    pub reads: CircuitBreaker,
}

impl Default for CloudCircuits {
    fn default() -> Self {
        Self::new()
    }
}

impl CloudCircuits {
    #[must_use]
    pub fn new() -> Self {
        Self {
            writes: CircuitBreaker::new("cloud_writes", CircuitConfig::cloud_writes()),
            reads: CircuitBreaker::new("cloud_reads", CircuitConfig::cloud_reads()),
        }
    }
}
