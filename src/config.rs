// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for budget sync.
//!
//! # Example
//!
//! ```
//! use budget_sync::BudgetSyncConfig;
//!
//! // Minimal config (uses defaults)
//! let config = BudgetSyncConfig::default();
//! assert_eq!(config.queue.max_retries, 3);
//! assert_eq!(config.crypto.kdf_iterations, 100_000);
//!
//! // Partial config from JSON
//! let config: BudgetSyncConfig = serde_json::from_str(
//!     r#"{ "signaling": { "url": "wss://signal.example.com" } }"#,
//! ).unwrap();
//! assert_eq!(config.signaling.heartbeat_interval_ms, 30_000);
//! ```

use serde::Deserialize;
use std::time::Duration;
use tracing::warn;

use crate::resilience::retry::RetryConfig;

/// Environment variable holding the signaling server URL.
pub const ENV_SIGNALING_URL: &str = "BUDGET_SYNC_SIGNALING_URL";
/// Environment variable toggling signaling (`true`/`false`, `1`/`0`).
pub const ENV_SIGNALING_ENABLED: &str = "BUDGET_SYNC_SIGNALING_ENABLED";
/// Environment variable holding the cloud document endpoint base URL.
pub const ENV_CLOUD_URL: &str = "BUDGET_SYNC_CLOUD_URL";
/// Environment variable holding the SQLite path for the durable queue and ledger.
pub const ENV_QUEUE_PATH: &str = "BUDGET_SYNC_QUEUE_PATH";

/// Top-level configuration.
///
/// All fields have defaults; `from_env()` overlays deployment settings.
#[derive(Debug, Clone, Deserialize)]
pub struct BudgetSyncConfig {
    /// Base URL of the cloud document endpoint (e.g. "https://api.example.com")
    #[serde(default)]
    pub cloud_url: Option<String>,

    /// SQLite file for the durable queue, ledger and health baseline. `None` keeps them in memory.
    #[serde(default)]
    pub queue_path: Option<String>,

    /// Free-form device description hashed into the device fingerprint
    #[serde(default = "default_device_info")]
    pub device_info: String,

    /// Author recorded on commits when the caller supplies none
    #[serde(default = "default_author")]
    pub default_author: String,

    #[serde(default)]
    pub crypto: CryptoConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub signaling: SignalingConfig,

    #[serde(default)]
    pub health: HealthConfig,
}

fn default_device_info() -> String { "unknown-device".to_string() }
fn default_author() -> String { "Unknown User".to_string() }

impl Default for BudgetSyncConfig {
    fn default() -> Self {
        Self {
            cloud_url: None,
            queue_path: None,
            device_info: default_device_info(),
            default_author: default_author(),
            crypto: CryptoConfig::default(),
            queue: QueueConfig::default(),
            signaling: SignalingConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl BudgetSyncConfig {
    /// Defaults overlaid with `BUDGET_SYNC_*` environment variables.
    ///
    /// Read once; later changes to the environment are not observed.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    /// Overlay settings from an arbitrary key lookup.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_SIGNALING_URL).filter(|v| !v.trim().is_empty()) {
            self.signaling.url = Some(url.trim().to_string());
        }
        if let Some(flag) = lookup(ENV_SIGNALING_ENABLED) {
            match flag.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => self.signaling.enabled = true,
                "false" | "0" | "no" => self.signaling.enabled = false,
                other => warn!(value = %other, "Ignoring unrecognized {}", ENV_SIGNALING_ENABLED),
            }
        }
        if let Some(url) = lookup(ENV_CLOUD_URL).filter(|v| !v.trim().is_empty()) {
            self.cloud_url = Some(url.trim().to_string());
        }
        if let Some(path) = lookup(ENV_QUEUE_PATH).filter(|v| !v.trim().is_empty()) {
            self.queue_path = Some(path.trim().to_string());
        }
    }
}

/// Key derivation and envelope settings.
#[derive(Debug, Clone, Deserialize)]
pub struct CryptoConfig {
    /// PBKDF2-HMAC-SHA256 iteration count
    #[serde(default = "default_kdf_iterations")]
    pub kdf_iterations: u32,

    /// Plaintext size (bytes) above which `encrypt_optimized` compresses
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold: usize,
}

fn default_kdf_iterations() -> u32 { crate::crypto::PBKDF2_ITERATIONS }
fn default_compression_threshold() -> usize { 1024 }

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            kdf_iterations: default_kdf_iterations(),
            compression_threshold: default_compression_threshold(),
        }
    }
}

/// Offline queue settings.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Retries after the first attempt before an item is exhausted
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    /// Periodic drain tick
    #[serde(default = "default_drain_interval_ms")]
    pub drain_interval_ms: u64,
    /// Settle delay before draining after coming back online
    #[serde(default = "default_online_drain_delay_ms")]
    pub online_drain_delay_ms: u64,
    /// Per-request timeout for the HTTP executor
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_max_retries() -> u32 { 3 }
fn default_initial_delay_ms() -> u64 { 1_000 }
fn default_max_delay_ms() -> u64 { 30_000 }
fn default_backoff_factor() -> f64 { 2.0 }
fn default_drain_interval_ms() -> u64 { 30_000 }
fn default_online_drain_delay_ms() -> u64 { 1_000 }
fn default_request_timeout_ms() -> u64 { 30_000 }

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_factor: default_backoff_factor(),
            drain_interval_ms: default_drain_interval_ms(),
            online_drain_delay_ms: default_online_drain_delay_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl QueueConfig {
    /// Backoff schedule for queued requests.
    #[must_use]
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            factor: self.backoff_factor,
            max_retries: Some(self.max_retries as usize),
        }
    }
}

/// Realtime signaling settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SignalingConfig {
    #[serde(default = "default_signaling_enabled")]
    pub enabled: bool,
    /// WebSocket URL. Absent URL disables signaling.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Heartbeats without a pong before the connection is considered dead
    #[serde(default = "default_missed_heartbeats")]
    pub missed_heartbeats: u32,
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
    #[serde(default = "default_max_reconnect_delay_ms")]
    pub max_reconnect_delay_ms: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
}

fn default_signaling_enabled() -> bool { true }
fn default_heartbeat_interval_ms() -> u64 { 30_000 }
fn default_missed_heartbeats() -> u32 { 2 }
fn default_reconnect_interval_ms() -> u64 { 5_000 }
fn default_max_reconnect_delay_ms() -> u64 { 60_000 }
fn default_max_reconnect_attempts() -> u32 { 10 }

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            enabled: default_signaling_enabled(),
            url: None,
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            missed_heartbeats: default_missed_heartbeats(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
            max_reconnect_delay_ms: default_max_reconnect_delay_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
        }
    }
}

impl SignalingConfig {
    /// Reconnect schedule for the signaling driver.
    #[must_use]
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            initial_delay: Duration::from_millis(self.reconnect_interval_ms),
            max_delay: Duration::from_millis(self.max_reconnect_delay_ms),
            factor: 2.0,
            max_retries: Some(self.max_reconnect_attempts as usize),
        }
    }

    /// URL to connect to, or `None` when signaling is off.
    #[must_use]
    pub fn active_url(&self) -> Option<&str> {
        if !self.enabled {
            return None;
        }
        self.url.as_deref().filter(|u| !u.is_empty())
    }
}

/// Health monitor settings.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
    /// Fraction of corrupted entities at which status becomes CRITICAL_FAILURE
    #[serde(default = "default_critical_divergence_ratio")]
    pub critical_divergence_ratio: f64,
}

fn default_probe_interval_ms() -> u64 { 10_000 }
fn default_critical_divergence_ratio() -> f64 { 0.5 }

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval_ms: default_probe_interval_ms(),
            critical_divergence_ratio: default_critical_divergence_ratio(),
        }
    }
}
