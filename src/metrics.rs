// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for budget sync.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host application chooses the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `budget_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `operation`: encrypt, decrypt, derive_key, ...
//! - `outcome`: delivered, retrying, exhausted, success, error, rejected
//! - `status`: health status name

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

// ═══════════════════════════════════════════════════════════════════════════
// CRYPTO
// ═══════════════════════════════════════════════════════════════════════════

/// Record a crypto operation outcome
pub fn record_crypto(operation: &str, outcome: &str) {
    counter!(
        "budget_sync_crypto_operations_total",
        "operation" => operation.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record crypto latency (key derivation dominates)
pub fn record_crypto_latency(operation: &str, duration: Duration) {
    histogram!(
        "budget_sync_crypto_seconds",
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

// ═══════════════════════════════════════════════════════════════════════════
// OFFLINE QUEUE
// ═══════════════════════════════════════════════════════════════════════════

/// Record a request entering the queue
pub fn record_enqueued(priority: &str) {
    counter!(
        "budget_sync_queue_enqueued_total",
        "priority" => priority.to_string()
    )
    .increment(1);
}

/// Record the outcome of one delivery attempt
pub fn record_delivery(outcome: &str) {
    counter!(
        "budget_sync_queue_deliveries_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Set current queue depth per state
pub fn set_queue_depth(state: &str, count: usize) {
    gauge!(
        "budget_sync_queue_depth",
        "state" => state.to_string()
    )
    .set(count as f64);
}

/// Set connectivity (1 = online)
pub fn set_online(online: bool) {
    gauge!("budget_sync_online").set(if online { 1.0 } else { 0.0 });
}

// ═══════════════════════════════════════════════════════════════════════════
// SIGNALING
// ═══════════════════════════════════════════════════════════════════════════

/// Set signaling connection state (0 = disconnected, 1 = connecting, 2 = connected, 3 = error)
pub fn set_signal_state(state: u8) {
    gauge!("budget_sync_signal_state").set(state as f64);
}

/// Record a reconnect attempt
pub fn record_reconnect_attempt() {
    counter!("budget_sync_signal_reconnects_total").increment(1);
}

/// Record a signal sent or received
pub fn record_signal(direction: &str, kind: &str) {
    counter!(
        "budget_sync_signals_total",
        "direction" => direction.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// HEALTH & RECOVERY
// ═══════════════════════════════════════════════════════════════════════════

/// Record a health check result
pub fn record_health_check(kind: &str, status: &str) {
    counter!(
        "budget_sync_health_checks_total",
        "kind" => kind.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Set the number of quarantined entities
pub fn set_quarantined(count: usize) {
    gauge!("budget_sync_quarantined_entities").set(count as f64);
}

/// Record a corruption event
pub fn record_corruption(entities: usize) {
    counter!("budget_sync_corruption_detected_total").increment(1);
    histogram!("budget_sync_corrupted_entities").record(entities as f64);
}

/// Record a recovery run
pub fn record_recovery(direction: &str, outcome: &str) {
    counter!(
        "budget_sync_recoveries_total",
        "direction" => direction.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// HISTORY & CIRCUIT
// ═══════════════════════════════════════════════════════════════════════════

/// Record a ledger commit
pub fn record_commit(changes: usize) {
    counter!("budget_sync_commits_total").increment(1);
    counter!("budget_sync_changes_total").increment(changes as u64);
}

/// Record circuit breaker call
pub fn record_circuit_call(circuit: &str, outcome: &str) {
    counter!(
        "budget_sync_circuit_breaker_calls_total",
        "circuit" => circuit.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// COORDINATOR
// ═══════════════════════════════════════════════════════════════════════════

/// Record a submitted mutation (sent, queued, rejected)
pub fn record_submit(outcome: &str) {
    counter!(
        "budget_sync_mutations_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record the documents a pull applied, removed and failed to open
pub fn record_pull(applied: usize, removed: usize, failed: usize) {
    counter!("budget_sync_pulls_total").increment(1);
    counter!("budget_sync_pull_documents_total", "outcome" => "applied").increment(applied as u64);
    counter!("budget_sync_pull_documents_total", "outcome" => "removed").increment(removed as u64);
    counter!("budget_sync_pull_documents_total", "outcome" => "failed").increment(failed as u64);
}

/// Record a lifecycle phase duration (start, unlock, shutdown)
pub fn record_lifecycle_phase(phase: &str, duration: Duration) {
    histogram!(
        "budget_sync_lifecycle_seconds",
        "phase" => phase.to_string()
    )
    .record(duration.as_secs_f64());
}

// ═══════════════════════════════════════════════════════════════════════════
// TIMING
// ═══════════════════════════════════════════════════════════════════════════

/// Times an operation and records `budget_sync_operation_seconds` on drop.
pub struct LatencyTimer {
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    #[must_use]
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        histogram!(
            "budget_sync_operation_seconds",
            "operation" => self.operation
        )
        .record(self.start.elapsed().as_secs_f64());
    }
}
