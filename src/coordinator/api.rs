// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Data path: submit, pull, health and recovery.
//!
//! ```text
//! submit(mutation)
//!   ├─ quarantined? ──────────────────────────► Err(Quarantined)
//!   ├─ seal (blocking thread) ─► mark in flight ─► apply locally
//!   ├─ online & nothing queued for the entity?
//!   │     ├─ yes ─► write circuit ─► executor
//!   │     │          ├─ ok ─────────────────► Sent, signal peers
//!   │     │          ├─ retryable / open ───► Queued
//!   │     │          └─ rejected ───────────► revert local, Err
//!   │     └─ no ──────────────────────────────► Queued
//!   └─ ledger commit (failure logged, never fatal)
//! ```

use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, trace, warn};
use uuid::Uuid;

use super::types::{Delivery, Mutation, MutationKind, PullReport, SubmitOutcome, SyncOverview};
use super::BudgetSync;
use crate::crypto::{self, CryptoError};
use crate::error::SyncError;
use crate::health::{Recovery, RecoveryDirection, RecoveryResult, SyncHealthStatus, ValidationSummary};
use crate::history::{ChangeInput, ChangeType, CommitRequest};
use crate::metrics::LatencyTimer;
use crate::queue::{DrainReport, HttpMethod, QueuedRequest, RequestError, RequestSpec};
use crate::resilience::CircuitError;
use crate::signaling::{SignalMetadata, SignalType};
use crate::storage::{document_path, split_document_key, CloudDocument, StorageError, StoredRecord};

/// Cloneable access to recovery for the unlocked session.
#[derive(Clone)]
pub struct RecoveryHandle(Arc<Recovery>);

impl RecoveryHandle {
    /// See [`BudgetSync::reset_cloud_data`].
    pub async fn reset_cloud_data(&self, direction: RecoveryDirection) -> RecoveryResult {
        self.0.reset_cloud_data(direction).await
    }
}

impl BudgetSync {
    // ═══════════════════════════════════════════════════════════════════════
    // WRITE PATH
    // ═══════════════════════════════════════════════════════════════════════

    /// Encrypt a local change and push it to the cloud, or queue it.
    ///
    /// Network failures never surface here: the mutation is queued and
    /// `Delivery::Queued` returned. A rejection by the cloud reverts the
    /// local write and is returned as an error.
    #[instrument(skip(self, mutation), fields(entity = %mutation.key()))]
    pub async fn submit(&self, mutation: Mutation) -> Result<SubmitOutcome, SyncError> {
        let _timer = LatencyTimer::new("submit");
        let session = self.current_session()?;

        if mutation.entity_type.is_empty() || mutation.entity_id.is_empty() {
            return Err(SyncError::Validation("entity type and id are required".into()));
        }
        let key = mutation.key();
        if session.monitor.is_quarantined(&mutation.entity_type, &mutation.entity_id) {
            crate::metrics::record_submit("rejected");
            return Err(SyncError::Quarantined(key));
        }

        let before = self.local.get(&mutation.entity_type, &mutation.entity_id).await?;
        let change_type = mutation.resolve_change_type(before.is_some())?;
        let now = self.clock.now_millis();
        let url = document_path(&session.budget_id, &key);

        // Sealed record and its content hash for puts
        let sealed = match &mutation.kind {
            MutationKind::Put(data) => {
                let record = StoredRecord::new(&mutation.entity_type, &mutation.entity_id, data.clone(), now);
                let sealing_key = session.key.clone();
                let threshold = self.config.crypto.compression_threshold;
                let device = self.device_id.clone();
                let (record, document) = tokio::task::spawn_blocking(move || {
                    CloudDocument::seal(&record, &sealing_key, threshold, Some(device)).map(|d| (record, d))
                })
                .await??;
                let body = serde_json::to_string(&document).map_err(StorageError::from)?;
                Some((record, document.content_hash, body))
            }
            MutationKind::Delete => None,
        };

        let request_id = Uuid::new_v4();
        let spec = match &sealed {
            Some((_, _, body)) => RequestSpec::new(HttpMethod::Put, url).body(body.clone()),
            None => RequestSpec::new(HttpMethod::Delete, url),
        }
        .entity(&mutation.entity_type, &mutation.entity_id)
        .priority(mutation.priority)
        .request_id(request_id);

        // Held until the outcome is recorded in the baseline
        let _writing = session.monitor.track_write(&key);
        match &sealed {
            Some((record, _, _)) => self.local.put(record).await?,
            None => {
                self.local.delete(&mutation.entity_type, &mutation.entity_id).await?;
            }
        }

        // Queued work for the entity must land first
        let blocked = self.queue.pending_entity_keys().await?.contains(&key);
        let delivery = if self.queue.is_online() && !blocked {
            let request = QueuedRequest::from_spec(spec.clone(), self.config.queue.max_retries, now, 0);
            let sent = self
                .circuits
                .writes
                .call_filtered(|e: &RequestError| e.is_retryable(), || self.executor.execute(&request))
                .await;
            match sent {
                Ok(_) => Delivery::Sent,
                Err(CircuitError::Rejected) => {
                    debug!("Write circuit open, queueing mutation");
                    self.queue.enqueue(spec).await?;
                    Delivery::Queued
                }
                Err(CircuitError::Inner(e)) if e.is_retryable() => {
                    warn!(error = %e, "Direct send failed, queueing mutation");
                    self.queue.enqueue(spec).await?;
                    Delivery::Queued
                }
                Err(CircuitError::Inner(e)) => {
                    error!(error = %e, "Mutation rejected by cloud");
                    self.revert_local(&mutation, before.as_ref()).await;
                    crate::metrics::record_submit("rejected");
                    return Err(e.into());
                }
            }
        } else {
            trace!(online = self.queue.is_online(), blocked, "Queueing mutation");
            self.queue.enqueue(spec).await?;
            Delivery::Queued
        };

        if delivery == Delivery::Sent {
            match &sealed {
                Some((_, hash, _)) => session.monitor.record_known_good(&key, hash),
                None => session.monitor.forget_known_good(&key),
            }
            session.monitor.persist_baseline().await;
            self.notify_peers();
        }
        crate::metrics::record_submit(match delivery {
            Delivery::Sent => "sent",
            Delivery::Queued => "queued",
        });

        let commit_hash = self
            .record_commit(&mutation, change_type, before.map(|r| r.data), now)
            .await;

        debug!(%request_id, ?delivery, "Mutation accepted");
        Ok(SubmitOutcome {
            request_id,
            entity_key: key,
            delivery,
            commit_hash,
        })
    }

    async fn revert_local(&self, mutation: &Mutation, before: Option<&StoredRecord>) {
        let reverted = match before {
            Some(record) => self.local.put(record).await,
            None => self
                .local
                .delete(&mutation.entity_type, &mutation.entity_id)
                .await
                .map(|_| ()),
        };
        if let Err(e) = reverted {
            error!(error = %e, "Failed to revert local record after rejection");
        }
    }

    async fn record_commit(
        &self,
        mutation: &Mutation,
        change_type: ChangeType,
        before: Option<Value>,
        timestamp: i64,
    ) -> Option<String> {
        let mut change = ChangeInput::new(mutation.entity_type.clone(), change_type.as_str())
            .entity_id(mutation.entity_id.clone());
        if let Some(before) = before {
            change = change.before(before);
        }
        if let Some(after) = mutation.data() {
            change = change.after(after.clone());
        }

        let message = mutation
            .message
            .clone()
            .unwrap_or_else(|| format!("{} {}", change_type.as_str(), mutation.key()));
        let mut request = CommitRequest::new(message)
            .device_fingerprint(self.device_id.clone())
            .timestamp(timestamp)
            .change(change);
        if let Some(author) = &mutation.author {
            request = request.author(author.clone());
        }

        match self.ledger.create_commit(request).await {
            Ok(record) => Some(record.commit.hash),
            Err(e) => {
                warn!(error = %e, "Ledger commit failed");
                None
            }
        }
    }

    /// Tell other devices on the budget to pull. Best effort.
    pub(super) fn notify_peers(&self) {
        if !self.signaling.is_connected() {
            trace!("Signaling not connected, change notice skipped");
            return;
        }
        let mut metadata = SignalMetadata::new().device_id(self.device_id.clone());
        if let Some(budget_id) = self.budget_id() {
            metadata = metadata.budget_id(budget_id);
        }
        if let Err(e) = self.signaling.send_signal(SignalType::DataChanged, Some(metadata)) {
            debug!(error = %e, "Change notice not sent");
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // READ PATH
    // ═══════════════════════════════════════════════════════════════════════

    /// Fetch the budget's cloud documents and apply what changed remotely.
    ///
    /// A cloud document is applied when the local record is absent or still
    /// matches the last agreed hash. Entities with queued or in-flight
    /// mutations, or in quarantine, are left alone. A local record that vanished from the cloud
    /// is removed only if it still matches the last agreed hash.
    #[instrument(skip(self))]
    pub async fn pull(&self) -> Result<PullReport, SyncError> {
        let _timer = LatencyTimer::new("pull");
        let session = self.current_session()?;
        let budget_id = session.budget_id.clone();

        let documents = match self.circuits.reads.call(|| self.cloud.list(&budget_id)).await {
            Ok(documents) => documents,
            Err(CircuitError::Rejected) => return Err(SyncError::Network("cloud read circuit is open".into())),
            Err(CircuitError::Inner(e)) => return Err(e.into()),
        };
        let mut pending = self.queue.pending_entity_keys().await?;
        pending.extend(session.monitor.writes_in_flight());
        let records = self.local.list_all().await?;
        let local = tokio::task::spawn_blocking(move || {
            records
                .into_iter()
                .map(|r| -> Result<(String, String), CryptoError> { Ok((r.key(), crypto::generate_hash(&r.data)?)) })
                .collect::<Result<HashMap<_, _>, _>>()
        })
        .await??;
        let known_good = session.monitor.known_good();

        let mut report = PullReport {
            fetched: documents.len(),
            ..PullReport::default()
        };
        let remote: HashSet<String> = documents.iter().map(CloudDocument::key).collect();

        let mut to_open = Vec::new();
        for document in documents {
            let key = document.key();
            if pending.contains(&key) {
                report.skipped_pending += 1;
                continue;
            }
            if session.monitor.is_quarantined(&document.entity_type, &document.entity_id) {
                report.skipped_quarantined += 1;
                continue;
            }
            match local.get(&key) {
                Some(hash) if *hash == document.content_hash => {
                    session.monitor.record_known_good(&key, &document.content_hash);
                    report.unchanged += 1;
                }
                Some(hash) if known_good.get(&key).is_some_and(|good| good != hash.as_str()) => {
                    report.conflicted += 1;
                }
                _ => to_open.push(document),
            }
        }

        let opening_key = session.key.clone();
        let opened = tokio::task::spawn_blocking(move || {
            to_open
                .into_iter()
                .map(|d| (d.key(), d.content_hash.clone(), d.open_record(&opening_key)))
                .collect::<Vec<_>>()
        })
        .await?;

        for (key, hash, record) in opened {
            match record {
                Ok(record) => {
                    let writing = session.monitor.track_write(&key);
                    if writing.is_contended() {
                        report.skipped_pending += 1;
                        continue;
                    }
                    self.local.put(&record).await?;
                    session.monitor.record_known_good(&key, &hash);
                    report.applied += 1;
                }
                Err(e) => {
                    warn!(entity = %key, error = %e, "Remote document failed verification");
                    report.failed += 1;
                }
            }
        }

        for (key, hash) in &local {
            if remote.contains(key) || pending.contains(key) || known_good.get(key) != Some(hash.as_str()) {
                continue;
            }
            let Some((entity_type, entity_id)) = split_document_key(key) else {
                continue;
            };
            if session.monitor.is_quarantined(entity_type, entity_id) {
                continue;
            }
            let writing = session.monitor.track_write(key);
            if writing.is_contended() {
                continue;
            }
            if self.local.delete(entity_type, entity_id).await? {
                session.monitor.forget_known_good(key);
                report.removed += 1;
            }
        }

        session.monitor.persist_baseline().await;
        crate::metrics::record_pull(report.applied, report.removed, report.failed);
        if report.applied + report.removed > 0 {
            info!(applied = report.applied, removed = report.removed, "Remote changes applied");
        }
        Ok(report)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // CONNECTIVITY
    // ═══════════════════════════════════════════════════════════════════════

    /// Feed the platform connectivity signal.
    pub fn set_online(&self, online: bool) {
        self.queue.set_online(online);
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        self.queue.is_online()
    }

    /// Drain the offline queue now.
    pub async fn force_drain(&self) -> Result<DrainReport, SyncError> {
        Ok(self.queue.force_drain().await?)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // HEALTH & RECOVERY
    // ═══════════════════════════════════════════════════════════════════════

    pub async fn check_health(&self) -> Result<SyncHealthStatus, SyncError> {
        let session = self.current_session()?;
        Ok(session.monitor.check_health().await)
    }

    /// Run the full validation battery.
    pub async fn validate(&self) -> Result<ValidationSummary, SyncError> {
        let session = self.current_session()?;
        Ok(session.monitor.validate().await)
    }

    /// Last published health status; `None` while locked.
    #[must_use]
    pub fn health_status(&self) -> Option<SyncHealthStatus> {
        self.session.read().as_ref().map(|s| s.monitor.status())
    }

    /// Document keys of quarantined entities.
    #[must_use]
    pub fn quarantined(&self) -> Vec<String> {
        self.session
            .read()
            .as_ref()
            .map(|s| s.monitor.quarantined())
            .unwrap_or_default()
    }

    /// The user wiped local data on purpose; the next check re-baselines.
    pub fn note_local_reset(&self) -> Result<(), SyncError> {
        self.current_session()?.monitor.note_local_reset();
        Ok(())
    }

    /// Destructive forced resync in `direction`.
    ///
    /// Returned as data rather than an error; a locked engine yields a
    /// failed result.
    pub async fn reset_cloud_data(&self, direction: RecoveryDirection) -> RecoveryResult {
        match self.current_session() {
            Ok(session) => session.recovery.reset_cloud_data(direction).await,
            Err(e) => RecoveryResult::failed(direction, e.to_string()),
        }
    }

    #[must_use]
    pub fn recovery_handle(&self) -> Option<RecoveryHandle> {
        self.session
            .read()
            .as_ref()
            .map(|s| RecoveryHandle(Arc::clone(&s.recovery)))
    }

    pub async fn overview(&self) -> Result<SyncOverview, SyncError> {
        let session = self.session.read().clone();
        Ok(SyncOverview {
            state: self.state(),
            unlocked: session.is_some(),
            queue: self.queue.status().await?,
            signaling: self.signaling.status(),
            health: session.as_ref().map(|s| s.monitor.status()),
            quarantined: session.map(|s| s.monitor.quarantined()).unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::config::BudgetSyncConfig;
    use crate::coordinator::SyncBackends;
    use crate::events::SyncEvent;
    use crate::health::HealthState;
    use crate::queue::{ExecutorResponse, RequestExecutor};
    use crate::storage::{CloudStore, MemoryCloudStore, MemoryRecordStore, RecordStore};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Notify;

    const PASSWORD: &str = "correct horse battery staple";
    const SHARE_CODE: &str = "abandon ability able about";

    fn config(device: &str) -> BudgetSyncConfig {
        let mut config = BudgetSyncConfig::default();
        config.crypto.kdf_iterations = 1_000;
        config.device_info = device.to_string();
        config
    }

    struct Device {
        sync: Arc<BudgetSync>,
        local: Arc<MemoryRecordStore>,
        budget_id: String,
    }

    async fn device(name: &str, cloud: &Arc<MemoryCloudStore>) -> Device {
        let local = Arc::new(MemoryRecordStore::new());
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(1_741_615_200_000));
        let backends = SyncBackends::new(local.clone(), cloud.clone(), cloud.clone()).clock(clock);
        let sync = BudgetSync::new(config(name), backends);
        let budget_id = sync.unlock(PASSWORD, SHARE_CODE).await.unwrap();
        Device { sync, local, budget_id }
    }

    struct RejectingExecutor;

    #[async_trait]
    impl RequestExecutor for RejectingExecutor {
        async fn execute(&self, _request: &QueuedRequest) -> Result<ExecutorResponse, RequestError> {
            Err(RequestError::Status {
                status: 422,
                message: "schema violation".into(),
            })
        }
    }

    /// Forwards to the cloud, but parks each call while `hold` is set.
    struct GatedExecutor {
        cloud: Arc<MemoryCloudStore>,
        hold: AtomicBool,
        entered: Notify,
        release: Notify,
    }

    impl GatedExecutor {
        fn new(cloud: Arc<MemoryCloudStore>) -> Self {
            Self {
                cloud,
                hold: AtomicBool::new(false),
                entered: Notify::new(),
                release: Notify::new(),
            }
        }
    }

    #[async_trait]
    impl RequestExecutor for GatedExecutor {
        async fn execute(&self, request: &QueuedRequest) -> Result<ExecutorResponse, RequestError> {
            if self.hold.load(Ordering::Acquire) {
                self.entered.notify_one();
                self.release.notified().await;
            }
            self.cloud.execute(request).await
        }
    }

    #[tokio::test]
    async fn test_submit_online_sends_directly() {
        let cloud = Arc::new(MemoryCloudStore::new());
        let d = device("laptop", &cloud).await;
        d.sync.set_online(true);

        let outcome = d
            .sync
            .submit(Mutation::put("bill", "rent", json!({"amount": 1450})).author("Sam"))
            .await
            .unwrap();

        assert_eq!(outcome.delivery, Delivery::Sent);
        assert_eq!(outcome.entity_key, "bill:rent");
        assert_eq!(cloud.document_count(&d.budget_id), 1);
        assert_eq!(
            d.local.get("bill", "rent").await.unwrap().unwrap().data,
            json!({"amount": 1450})
        );

        let document = cloud.fetch(&d.budget_id, "bill:rent").await.unwrap().unwrap();
        let key = d.sync.current_session().unwrap().key.clone();
        assert_eq!(document.open(&key).unwrap(), json!({"amount": 1450}));

        let hash = outcome.commit_hash.unwrap();
        let commit = d.sync.ledger().get_commit(&hash).await.unwrap().unwrap();
        assert_eq!(commit.author, "Sam");
        let changes = d.sync.ledger().changes_for_commit(&hash).await.unwrap();
        assert_eq!(changes[0].change_type, ChangeType::Create);
    }

    #[tokio::test]
    async fn test_submit_offline_queues_until_drain() {
        let cloud = Arc::new(MemoryCloudStore::new());
        let d = device("laptop", &cloud).await;

        let outcome = d
            .sync
            .submit(Mutation::put("transaction", "t1", json!({"amount": -12})))
            .await
            .unwrap();
        assert_eq!(outcome.delivery, Delivery::Queued);
        assert_eq!(cloud.document_count(&d.budget_id), 0);
        assert!(d.local.get("transaction", "t1").await.unwrap().is_some());
        assert!(outcome.commit_hash.is_some());

        d.sync.set_online(true);
        let report = d.sync.force_drain().await.unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(cloud.document_count(&d.budget_id), 1);
        assert_eq!(d.sync.check_health().await.unwrap().status, HealthState::Healthy);
    }

    #[tokio::test]
    async fn test_queued_entity_keeps_later_writes_queued() {
        let cloud = Arc::new(MemoryCloudStore::new());
        let d = device("laptop", &cloud).await;

        d.sync.submit(Mutation::put("bill", "rent", json!({"amount": 1}))).await.unwrap();
        d.sync.set_online(true);
        let second = d.sync.submit(Mutation::put("bill", "rent", json!({"amount": 2}))).await.unwrap();
        let other = d.sync.submit(Mutation::put("bill", "water", json!({"amount": 3}))).await.unwrap();

        assert_eq!(second.delivery, Delivery::Queued);
        assert_eq!(other.delivery, Delivery::Sent);
        assert_eq!(d.sync.queue().pending().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unreachable_cloud_queues_instead_of_failing() {
        let cloud = Arc::new(MemoryCloudStore::new());
        let d = device("laptop", &cloud).await;
        d.sync.set_online(true);
        cloud.set_available(false);

        let outcome = d.sync.submit(Mutation::put("bill", "rent", json!({"amount": 1}))).await.unwrap();
        assert_eq!(outcome.delivery, Delivery::Queued);

        let pending = d.sync.queue().pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].request_id, outcome.request_id);
    }

    #[tokio::test]
    async fn test_rejected_mutation_reverts_local_write() {
        let local = Arc::new(MemoryRecordStore::new());
        let cloud = Arc::new(MemoryCloudStore::new());
        let backends = SyncBackends::new(local.clone(), cloud.clone(), Arc::new(RejectingExecutor));
        let sync = BudgetSync::new(config("laptop"), backends);
        sync.unlock(PASSWORD, SHARE_CODE).await.unwrap();
        sync.set_online(true);

        let err = sync
            .submit(Mutation::put("bill", "rent", json!({"amount": 1})))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)), "{err:?}");
        assert!(local.get("bill", "rent").await.unwrap().is_none());
        assert!(sync.queue().pending().await.unwrap().is_empty());
        assert!(sync.ledger().recent_changes(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_locked_engine_refuses_data_operations() {
        let cloud = Arc::new(MemoryCloudStore::new());
        let sync = BudgetSync::new(
            config("laptop"),
            SyncBackends::new(Arc::new(MemoryRecordStore::new()), cloud.clone(), cloud),
        );

        assert!(matches!(
            sync.submit(Mutation::delete("bill", "rent")).await,
            Err(SyncError::Locked)
        ));
        assert!(matches!(sync.pull().await, Err(SyncError::Locked)));
        assert!(sync.recovery_handle().is_none());
        assert!(sync.health_status().is_none());

        let result = sync.reset_cloud_data(RecoveryDirection::LocalToCloud).await;
        assert!(!result.success);
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn test_empty_entity_id_is_invalid() {
        let cloud = Arc::new(MemoryCloudStore::new());
        let d = device("laptop", &cloud).await;
        let err = d.sync.submit(Mutation::put("bill", "", json!({}))).await.unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
    }

    #[tokio::test]
    async fn test_quarantined_entity_is_refused() {
        let cloud = Arc::new(MemoryCloudStore::new());
        let d = device("laptop", &cloud).await;
        d.sync.set_online(true);
        d.sync.submit(Mutation::put("bill", "rent", json!({"amount": 1}))).await.unwrap();

        // Local edit that bypassed the sync path
        d.local
            .put(&StoredRecord::new("bill", "rent", json!({"amount": 999}), 5))
            .await
            .unwrap();
        let status = d.sync.check_health().await.unwrap();
        assert_ne!(status.status, HealthState::Healthy);
        assert_eq!(d.sync.quarantined(), vec!["bill:rent".to_string()]);

        let err = d
            .sync
            .submit(Mutation::put("bill", "rent", json!({"amount": 2})))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Quarantined(key) if key == "bill:rent"));

        let handle = d.sync.recovery_handle().unwrap();
        assert!(handle.reset_cloud_data(RecoveryDirection::LocalToCloud).await.success);
        assert!(d.sync.quarantined().is_empty());
        assert!(d.sync.submit(Mutation::put("bill", "rent", json!({"amount": 2}))).await.is_ok());
    }

    #[tokio::test]
    async fn test_check_during_in_flight_submit_is_not_corruption() {
        let local = Arc::new(MemoryRecordStore::new());
        let cloud = Arc::new(MemoryCloudStore::new());
        let executor = Arc::new(GatedExecutor::new(cloud.clone()));
        let backends = SyncBackends::new(local.clone(), cloud.clone(), executor.clone());
        let sync = BudgetSync::new(config("laptop"), backends);
        sync.unlock(PASSWORD, SHARE_CODE).await.unwrap();
        sync.set_online(true);
        let mut events = sync.events().subscribe();

        sync.submit(Mutation::put("bill", "rent", json!({"amount": 1}))).await.unwrap();
        assert_eq!(sync.check_health().await.unwrap().status, HealthState::Healthy);

        executor.hold.store(true, Ordering::Release);
        let submitting = tokio::spawn({
            let sync = sync.clone();
            async move { sync.submit(Mutation::put("bill", "rent", json!({"amount": 2}))).await }
        });
        executor.entered.notified().await;

        // Local already holds the new value, the cloud the old one
        let status = sync.check_health().await.unwrap();
        assert_eq!(status.status, HealthState::Healthy);
        assert!(sync.quarantined().is_empty());

        let report = sync.pull().await.unwrap();
        assert_eq!(report.applied, 0);
        assert_eq!(report.skipped_pending, 1);
        assert_eq!(local.get("bill", "rent").await.unwrap().unwrap().data, json!({"amount": 2}));

        executor.hold.store(false, Ordering::Release);
        executor.release.notify_one();
        let outcome = submitting.await.unwrap().unwrap();
        assert_eq!(outcome.delivery, Delivery::Sent);

        assert_eq!(sync.check_health().await.unwrap().status, HealthState::Healthy);
        assert!(sync.submit(Mutation::put("bill", "rent", json!({"amount": 3}))).await.is_ok());

        let mut corruption = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, SyncEvent::CorruptionDetected(_)) {
                corruption += 1;
            }
        }
        assert_eq!(corruption, 0);
    }

    #[tokio::test]
    async fn test_pull_applies_remote_changes() {
        let cloud = Arc::new(MemoryCloudStore::new());
        let phone = device("phone", &cloud).await;
        let laptop = device("laptop", &cloud).await;
        assert_eq!(phone.budget_id, laptop.budget_id);
        phone.sync.set_online(true);

        phone.sync.submit(Mutation::put("bill", "rent", json!({"amount": 1450}))).await.unwrap();
        phone.sync.submit(Mutation::put("bill", "water", json!({"amount": 60}))).await.unwrap();

        let report = laptop.sync.pull().await.unwrap();
        assert_eq!(report.fetched, 2);
        assert_eq!(report.applied, 2);
        assert_eq!(
            laptop.local.get("bill", "rent").await.unwrap().unwrap().data,
            json!({"amount": 1450})
        );

        let again = laptop.sync.pull().await.unwrap();
        assert_eq!(again.applied, 0);
        assert_eq!(again.unchanged, 2);
        assert_eq!(laptop.sync.check_health().await.unwrap().status, HealthState::Healthy);
    }

    #[tokio::test]
    async fn test_pull_removes_remote_deletes() {
        let cloud = Arc::new(MemoryCloudStore::new());
        let phone = device("phone", &cloud).await;
        let laptop = device("laptop", &cloud).await;
        phone.sync.set_online(true);

        phone.sync.submit(Mutation::put("bill", "rent", json!({"amount": 1}))).await.unwrap();
        laptop.sync.pull().await.unwrap();
        phone.sync.submit(Mutation::delete("bill", "rent")).await.unwrap();

        let report = laptop.sync.pull().await.unwrap();
        assert_eq!(report.removed, 1);
        assert!(laptop.local.is_empty());
    }

    #[tokio::test]
    async fn test_pull_leaves_queued_entities_alone() {
        let cloud = Arc::new(MemoryCloudStore::new());
        let phone = device("phone", &cloud).await;
        let laptop = device("laptop", &cloud).await;
        phone.sync.set_online(true);

        laptop.sync.submit(Mutation::put("bill", "rent", json!({"amount": 2}))).await.unwrap();
        phone.sync.submit(Mutation::put("bill", "rent", json!({"amount": 1}))).await.unwrap();

        let report = laptop.sync.pull().await.unwrap();
        assert_eq!(report.skipped_pending, 1);
        assert_eq!(
            laptop.local.get("bill", "rent").await.unwrap().unwrap().data,
            json!({"amount": 2})
        );
    }

    #[tokio::test]
    async fn test_pull_counts_unverifiable_documents() {
        let cloud = Arc::new(MemoryCloudStore::new());
        let d = device("laptop", &cloud).await;
        let foreign = crypto::KeyMaterial::from_bytes([7; 32], &[1; 16]);
        let record = StoredRecord::new("bill", "rent", json!({"amount": 1}), 1);
        cloud.overwrite(&d.budget_id, CloudDocument::seal(&record, &foreign, 1024, None).unwrap());

        let report = d.sync.pull().await.unwrap();
        assert_eq!(report.failed, 1);
        assert!(d.local.is_empty());
    }

    #[tokio::test]
    async fn test_overview_reflects_session() {
        let cloud = Arc::new(MemoryCloudStore::new());
        let d = device("laptop", &cloud).await;
        d.sync.submit(Mutation::put("bill", "rent", json!({"amount": 1}))).await.unwrap();

        let overview = d.sync.overview().await.unwrap();
        assert!(overview.unlocked);
        assert_eq!(overview.queue.pending, 1);
        assert!(overview.health.is_some());
        assert!(overview.quarantined.is_empty());

        d.sync.lock().await;
        let overview = d.sync.overview().await.unwrap();
        assert!(!overview.unlocked);
        assert!(overview.health.is_none());
    }
}
