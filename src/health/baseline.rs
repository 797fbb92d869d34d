// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Persistence seam for the known-good baseline.
//!
//! The baseline holds, per budget, the content hash both sides last agreed
//! on for each entity. It must outlive the process: without it a restarted
//! device cannot tell a remote edit made while it was closed from local
//! drift. [`SqliteStore`](crate::storage::SqliteStore) is the durable
//! implementation.

use async_trait::async_trait;
use dashmap::DashMap;

use super::digest::SnapshotDigest;
use crate::storage::StorageError;

#[async_trait]
pub trait BaselineStore: Send + Sync {
    /// Stored baseline for `budget_id`; empty when none was saved.
    async fn load_baseline(&self, budget_id: &str) -> Result<SnapshotDigest, StorageError>;
    /// Replace the stored baseline for `budget_id` with `baseline`.
    async fn save_baseline(&self, budget_id: &str, baseline: &SnapshotDigest) -> Result<(), StorageError>;
}

#[derive(Default)]
pub struct MemoryBaselineStore {
    baselines: DashMap<String, SnapshotDigest>,
}

impl MemoryBaselineStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BaselineStore for MemoryBaselineStore {
    async fn load_baseline(&self, budget_id: &str) -> Result<SnapshotDigest, StorageError> {
        Ok(self
            .baselines
            .get(budget_id)
            .map(|b| b.value().clone())
            .unwrap_or_default())
    }

    async fn save_baseline(&self, budget_id: &str, baseline: &SnapshotDigest) -> Result<(), StorageError> {
        self.baselines.insert(budget_id.to_string(), baseline.clone());
        Ok(())
    }
}
