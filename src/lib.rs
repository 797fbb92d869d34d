// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Budget Sync
//!
//! Encrypted, offline-first synchronization core for a shared household budget.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    BudgetSync (coordinator)                 │
//! │  • submit() / pull() / reset_cloud_data()                   │
//! │  • unlock(password, share code) derives the session key     │
//! └─────────────────────────────────────────────────────────────┘
//!          │                 │                  │
//!          ▼                 ▼                  ▼
//! ┌────────────────┐ ┌───────────────┐ ┌──────────────────────┐
//! │ Crypto envelope│ │ Offline queue │ │ Signaling channel    │
//! │ AES-256-GCM    │ │ priority FIFO │ │ WebSocket, heartbeat │
//! │ PBKDF2, zstd   │ │ backoff, DLQ  │ │ reconnect w/ backoff │
//! └────────────────┘ └───────────────┘ └──────────────────────┘
//!          │                 │
//!          ▼                 ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Cloud store (encrypted documents)  ◄── health monitor ──►  │
//! │  Local store (plaintext records)        hash comparison,    │
//! │                                         quarantine,         │
//! │                                         recovery            │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │          History ledger: commits, branches, tags            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use budget_sync::{BudgetSync, BudgetSyncConfig, Mutation, SyncBackends};
//! use budget_sync::storage::MemoryRecordStore;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), budget_sync::SyncError> {
//!     let config = BudgetSyncConfig::from_env();
//!     let backends = SyncBackends::from_config(&config, Arc::new(MemoryRecordStore::new())).await?;
//!     let sync = BudgetSync::new(config, backends);
//!
//!     sync.start().await?;
//!     sync.unlock("correct horse battery staple", "abandon ability able about").await?;
//!     sync.set_online(true);
//!
//!     let outcome = sync
//!         .submit(Mutation::put("transaction", "t-1", json!({"amount": -42, "payee": "Grocer"})))
//!         .await?;
//!     println!("{:?}", outcome.delivery);
//!
//!     sync.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - **Envelope encryption**: AES-256-GCM with a PBKDF2-derived key; zstd above a size threshold
//! - **Offline queue**: durable (SQLite) priority queue with exponential backoff and a dead-letter state
//! - **Realtime signaling**: "go pull" notices between devices, never budget data
//! - **Health monitor**: hash comparison, one corruption event per divergence, quarantine
//! - **Recovery**: explicit destructive resync in either direction
//! - **History ledger**: content-addressed commits, branches and tags
//! - **Circuit breakers**: direct cloud writes and reads trip open under repeated network failure
//!
//! ## Modules
//!
//! - [`coordinator`]: the [`BudgetSync`] facade
//! - [`crypto`]: key derivation, envelopes, hashes, ids
//! - [`queue`]: offline mutation queue
//! - [`signaling`]: realtime signaling channel
//! - [`health`]: health monitor and recovery
//! - [`history`]: versioned history ledger
//! - [`storage`]: local and cloud stores (memory, HTTP, SQLite)
//! - [`resilience`]: circuit breakers and retry

pub mod clock;
pub mod compression;
pub mod config;
pub mod coordinator;
pub mod crypto;
pub mod error;
pub mod events;
pub mod health;
pub mod history;
pub mod metrics;
pub mod queue;
pub mod resilience;
pub mod signaling;
pub mod storage;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::BudgetSyncConfig;
pub use coordinator::{
    BudgetSync, Delivery, EngineState, Mutation, MutationKind, PullReport, RecoveryHandle, SubmitOutcome,
    SyncBackends, SyncOverview,
};
pub use crypto::{CryptoError, EncryptedEnvelope, KeyMaterial};
pub use error::SyncError;
pub use events::{EventBus, SyncEvent};
pub use health::{
    CorruptionReport, HealthState, RecoveryDirection, RecoveryResult, SyncHealthStatus, ValidationSummary,
};
pub use history::{HistoryError, HistoryLedger};
pub use metrics::LatencyTimer;
pub use queue::{OfflineQueue, RequestPriority};
pub use resilience::{CircuitBreaker, CircuitConfig, CircuitError, RetryConfig};
pub use signaling::{SignalingChannel, SignalStatus};
pub use storage::StorageError;
