// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry and circuit-breaking primitives shared by the queue, signaling
//! channel, storage startup, and direct cloud sends.

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError, CircuitState, CloudCircuits};
pub use retry::{retry, RetryConfig};
