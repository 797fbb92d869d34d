// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync health monitoring and recovery.
//!
//! The [`HealthMonitor`] periodically compares content hashes of local
//! records against the hashes recorded next to the cloud envelopes. A
//! mismatch that no undelivered mutation explains is treated as corruption:
//! the entity is quarantined and one `syncCorruptionDetected` event is
//! published per distinct divergence. [`Recovery`] is the explicit way out.
//!
//! ```text
//!   local records ──hash──► SnapshotDigest ─┐
//!                                           ├─► classify ──► SyncHealthStatus
//!   cloud docs ──content_hash─► SnapshotDigest ┘        │
//!                                                    └─► CorruptionDetected (once)
//! ```

mod baseline;
mod digest;
mod monitor;
mod recovery;
mod status;

pub use baseline::{BaselineStore, MemoryBaselineStore};
pub use digest::{classify, Divergence, SnapshotDigest};
pub use monitor::{HealthMonitor, WriteGuard};
pub use recovery::Recovery;
pub(crate) use status::redact_budget_id;
pub use status::{
    CheckResult, CorruptionReport, HealthState, OverallStatus, RecoveryDirection, RecoveryResult,
    SyncHealthStatus, ValidationSummary,
};
