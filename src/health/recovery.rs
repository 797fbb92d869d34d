// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Explicit recovery: overwrite one side with the other.

use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use super::monitor::HealthMonitor;
use super::status::{RecoveryDirection, RecoveryResult};
use crate::clock::Clock;
use crate::crypto::{CryptoError, KeyMaterial};
use crate::error::SyncError;
use crate::events::{EventBus, SyncEvent};
use crate::queue::OfflineQueue;
use crate::storage::{CloudDocument, CloudStore, RecordStore};

pub struct Recovery {
    budget_id: String,
    device_id: String,
    local: Arc<dyn RecordStore>,
    cloud: Arc<dyn CloudStore>,
    queue: Arc<OfflineQueue>,
    monitor: Arc<HealthMonitor>,
    key: KeyMaterial,
    clock: Arc<dyn Clock>,
    events: EventBus,
    compression_threshold: usize,
    running: Mutex<()>,
}

impl Recovery {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        monitor: Arc<HealthMonitor>,
        device_id: impl Into<String>,
        local: Arc<dyn RecordStore>,
        cloud: Arc<dyn CloudStore>,
        queue: Arc<OfflineQueue>,
        key: KeyMaterial,
        clock: Arc<dyn Clock>,
        events: EventBus,
        compression_threshold: usize,
    ) -> Self {
        Self {
            budget_id: monitor.budget_id().to_string(),
            device_id: device_id.into(),
            local,
            cloud,
            queue,
            monitor,
            key,
            clock,
            events,
            compression_threshold,
            running: Mutex::new(()),
        }
    }

    /// Overwrite one side with the other. Never fails: the outcome, good or
    /// bad, is returned and published as `RecoveryCompleted`.
    ///
    /// Undelivered queue entries are discarded in both directions; the
    /// surviving snapshot already reflects or supersedes them.
    #[instrument(skip(self), fields(direction = %direction))]
    pub async fn reset_cloud_data(&self, direction: RecoveryDirection) -> RecoveryResult {
        let _serial = self.running.lock().await;
        let _quiet = self.monitor.suppress_corruption();
        let started = self.clock.now_millis();
        warn!("Sync recovery started");

        let outcome = match direction {
            RecoveryDirection::LocalToCloud => self.push_local().await,
            RecoveryDirection::CloudToLocal => self.restore_local().await,
        };

        let result = match outcome {
            Ok(documents) => {
                if let Err(e) = self.monitor.refresh_baseline().await {
                    warn!(error = %e, "Baseline refresh after recovery failed");
                }
                self.monitor.clear_quarantine();
                info!(
                    documents,
                    elapsed_ms = self.clock.now_millis() - started,
                    "Sync recovery complete"
                );
                RecoveryResult::succeeded(direction, documents)
            }
            Err(e) => {
                warn!(error = %e, "Sync recovery failed");
                RecoveryResult::failed(direction, e.to_string())
            }
        };

        crate::metrics::record_recovery(direction.as_str(), if result.success { "success" } else { "failure" });
        self.events.publish(SyncEvent::RecoveryCompleted(result.clone()));
        result
    }

    async fn push_local(&self) -> Result<usize, SyncError> {
        let records = self.local.list_all().await?;
        let key = self.key.clone();
        let threshold = self.compression_threshold;
        let device = self.device_id.clone();

        let documents = tokio::task::spawn_blocking(move || {
            records
                .iter()
                .map(|r| CloudDocument::seal(r, &key, threshold, Some(device.clone())))
                .collect::<Result<Vec<_>, CryptoError>>()
        })
        .await??;

        let removed = self.cloud.clear(&self.budget_id).await?;
        let written = self.cloud.upsert_batch(&self.budget_id, &documents).await?;
        let dropped = self.queue.clear_all().await?;
        info!(removed, written, dropped, "Cloud overwritten from local snapshot");
        Ok(written)
    }

    async fn restore_local(&self) -> Result<usize, SyncError> {
        let documents = self.cloud.list(&self.budget_id).await?;
        let key = self.key.clone();

        // Everything must open before local data is touched
        let records = tokio::task::spawn_blocking(move || {
            documents
                .iter()
                .map(|d| d.open_record(&key))
                .collect::<Result<Vec<_>, CryptoError>>()
        })
        .await??;

        let dropped = self.queue.clear_all().await?;
        self.local.clear().await?;
        for record in &records {
            self.local.put(record).await?;
        }
        info!(restored = records.len(), dropped, "Local records restored from cloud");
        Ok(records.len())
    }
}
