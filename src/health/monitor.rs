// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Periodic local/cloud consistency probe and the full validation battery.

use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use super::baseline::{BaselineStore, MemoryBaselineStore};
use super::digest::{classify, Divergence, SnapshotDigest};
use super::status::{
    CheckResult, CorruptionReport, HealthState, OverallStatus, SyncHealthStatus, ValidationSummary,
};
use crate::clock::Clock;
use crate::config::HealthConfig;
use crate::crypto::{self, CryptoError, KeyMaterial};
use crate::events::{EventBus, SyncEvent};
use crate::queue::{HttpMethod, OfflineQueue};
use crate::storage::{document_key, CloudDocument, CloudStore, RecordStore, StorageError, StoredRecord};

/// Watches one budget for divergence between local records and the cloud.
///
/// Entities that diverge without an undelivered mutation to explain it are
/// quarantined: the coordinator refuses to sync them until recovery runs or
/// a later check finds both sides in agreement again.
///
/// Writes the coordinator is applying hold a [`WriteGuard`]. A check skips
/// every entity written while it ran, so a half-applied write is never
/// mistaken for drift.
pub struct HealthMonitor {
    budget_id: String,
    local: Arc<dyn RecordStore>,
    cloud: Arc<dyn CloudStore>,
    queue: Arc<OfflineQueue>,
    key: KeyMaterial,
    clock: Arc<dyn Clock>,
    events: EventBus,
    config: HealthConfig,
    status: watch::Sender<SyncHealthStatus>,
    known_good: RwLock<SnapshotDigest>,
    baseline_store: Arc<dyn BaselineStore>,
    baseline_dirty: AtomicBool,
    writes: Mutex<WriteTracker>,
    persist_lock: tokio::sync::Mutex<()>,
    quarantine: RwLock<BTreeSet<String>>,
    last_reported: Mutex<Option<String>>,
    suppressions: AtomicUsize,
    local_reset: AtomicBool,
    checks_run: AtomicU64,
    check_lock: tokio::sync::Mutex<()>,
}

struct Snapshot {
    records: Vec<StoredRecord>,
    documents: Vec<CloudDocument>,
    local: SnapshotDigest,
    cloud: SnapshotDigest,
    pending: HashSet<String>,
}

impl HealthMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        budget_id: impl Into<String>,
        local: Arc<dyn RecordStore>,
        cloud: Arc<dyn CloudStore>,
        queue: Arc<OfflineQueue>,
        key: KeyMaterial,
        clock: Arc<dyn Clock>,
        events: EventBus,
        config: HealthConfig,
    ) -> Self {
        let (status, _) = watch::channel(SyncHealthStatus::default());
        Self {
            budget_id: budget_id.into(),
            local,
            cloud,
            queue,
            key,
            clock,
            events,
            config,
            status,
            known_good: RwLock::new(SnapshotDigest::new()),
            baseline_store: Arc::new(MemoryBaselineStore::new()),
            baseline_dirty: AtomicBool::new(false),
            writes: Mutex::new(WriteTracker::default()),
            persist_lock: tokio::sync::Mutex::new(()),
            quarantine: RwLock::new(BTreeSet::new()),
            last_reported: Mutex::new(None),
            suppressions: AtomicUsize::new(0),
            local_reset: AtomicBool::new(false),
            checks_run: AtomicU64::new(0),
            check_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Persist the known-good baseline in `store` instead of memory.
    #[must_use]
    pub fn with_baseline_store(mut self, store: Arc<dyn BaselineStore>) -> Self {
        self.baseline_store = store;
        self
    }

    #[must_use]
    pub fn budget_id(&self) -> &str {
        &self.budget_id
    }

    #[must_use]
    pub fn status(&self) -> SyncHealthStatus {
        self.status.borrow().clone()
    }

    pub fn status_receiver(&self) -> watch::Receiver<SyncHealthStatus> {
        self.status.subscribe()
    }

    #[must_use]
    pub fn checks_run(&self) -> u64 {
        self.checks_run.load(Ordering::Relaxed)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // QUARANTINE & BASELINE
    // ═══════════════════════════════════════════════════════════════════════

    /// Document keys of quarantined entities, sorted.
    #[must_use]
    pub fn quarantined(&self) -> Vec<String> {
        self.quarantine.read().iter().cloned().collect()
    }

    #[must_use]
    pub fn is_quarantined(&self, entity_type: &str, entity_id: &str) -> bool {
        self.quarantine.read().contains(&document_key(entity_type, entity_id))
    }

    pub fn clear_quarantine(&self) {
        let mut quarantine = self.quarantine.write();
        if !quarantine.is_empty() {
            info!(entities = quarantine.len(), "Quarantine cleared");
        }
        quarantine.clear();
        crate::metrics::set_quarantined(0);
    }

    /// Cloud hashes both sides last agreed on.
    #[must_use]
    pub fn known_good(&self) -> SnapshotDigest {
        self.known_good.read().clone()
    }

    /// Record a hash the cloud acknowledged for `key`.
    pub fn record_known_good(&self, key: &str, hash: &str) {
        let mut known = self.known_good.write();
        if known.get(key) != Some(hash) {
            known.insert(key, hash);
            self.baseline_dirty.store(true, Ordering::Release);
        }
    }

    pub fn forget_known_good(&self, key: &str) {
        if self.known_good.write().remove(key).is_some() {
            self.baseline_dirty.store(true, Ordering::Release);
        }
    }

    /// Load the baseline saved by a previous session. Call before the first
    /// check.
    pub async fn load_baseline(&self) -> Result<usize, StorageError> {
        let stored = self.baseline_store.load_baseline(&self.budget_id).await?;
        let count = stored.len();
        *self.known_good.write() = stored;
        self.baseline_dirty.store(false, Ordering::Release);
        debug!(entities = count, "Known-good baseline loaded");
        Ok(count)
    }

    /// Write the baseline through to its store if it changed. Failures are
    /// logged and retried on the next call.
    pub async fn persist_baseline(&self) {
        let _serial = self.persist_lock.lock().await;
        if !self.baseline_dirty.swap(false, Ordering::AcqRel) {
            return;
        }
        let snapshot = self.known_good();
        if let Err(e) = self.baseline_store.save_baseline(&self.budget_id, &snapshot).await {
            warn!(error = %e, "Failed to persist known-good baseline");
            self.baseline_dirty.store(true, Ordering::Release);
        }
    }

    /// The user wiped local data on purpose. The next check re-baselines
    /// instead of reporting the missing records as corruption.
    pub fn note_local_reset(&self) {
        info!("Local reset noted, next health check re-baselines");
        *self.known_good.write() = SnapshotDigest::new();
        self.baseline_dirty.store(true, Ordering::Release);
        self.clear_quarantine();
        self.local_reset.store(true, Ordering::Release);
    }

    /// Replace the known-good set with the current cloud hashes.
    pub async fn refresh_baseline(&self) -> Result<usize, StorageError> {
        let documents = self.cloud.list(&self.budget_id).await?;
        let cloud = cloud_digest(&documents);
        let count = cloud.len();
        *self.known_good.write() = cloud;
        self.baseline_dirty.store(true, Ordering::Release);
        *self.last_reported.lock() = None;
        self.persist_baseline().await;
        debug!(entities = count, "Known-good baseline refreshed");
        Ok(count)
    }

    /// Mark `key` as being written until the guard drops. Any check that
    /// overlaps the guard skips the entity.
    pub fn track_write(&self, key: &str) -> WriteGuard<'_> {
        self.writes.lock().begin(key);
        WriteGuard {
            writes: &self.writes,
            key: key.to_string(),
        }
    }

    /// Entities with a write in progress.
    #[must_use]
    pub fn writes_in_flight(&self) -> HashSet<String> {
        self.writes.lock().active.keys().cloned().collect()
    }

    /// Corruption events are not published while the guard lives.
    pub(crate) fn suppress_corruption(&self) -> SuppressionGuard<'_> {
        self.suppressions.fetch_add(1, Ordering::AcqRel);
        SuppressionGuard(&self.suppressions)
    }

    fn is_suppressed(&self) -> bool {
        self.suppressions.load(Ordering::Acquire) > 0
    }

    // ═══════════════════════════════════════════════════════════════════════
    // PROBE
    // ═══════════════════════════════════════════════════════════════════════

    /// Compare local and cloud hashes once and publish the result.
    #[instrument(skip(self), fields(budget = %super::status::redact_budget_id(&self.budget_id)))]
    pub async fn check_health(&self) -> SyncHealthStatus {
        let _serial = self.check_lock.lock().await;
        let previous = self.begin_check();
        let now = self.clock.now_millis();

        let status = match self.snapshot().await {
            Ok(mut snapshot) => {
                snapshot.pending.extend(self.writes.lock().touched());
                let divergence = classify(&snapshot.local, &snapshot.cloud, &self.known_good(), &snapshot.pending);
                let quarantined = self.absorb(&divergence, &snapshot.cloud, now);

                let state = if !divergence.corrupted.is_empty()
                    && divergence.corruption_ratio() >= self.config.critical_divergence_ratio
                {
                    HealthState::CriticalFailure
                } else if !divergence.is_clean() {
                    HealthState::IssuesDetected
                } else {
                    HealthState::Healthy
                };
                let failed = divergence.corrupted.len() + divergence.unsynced.len();

                SyncHealthStatus {
                    is_healthy: Some(state == HealthState::Healthy),
                    status: state,
                    last_checked: Some(now),
                    failed_tests: (failed > 0).then_some(failed),
                    error: None,
                    remote_ahead: divergence.remote_ahead.len(),
                    quarantined,
                }
            }
            Err(e) => {
                warn!(error = %e, "Health probe failed");
                SyncHealthStatus::failed(HealthState::Error, e, now)
            }
        };

        self.finish(&previous, status.clone(), "probe");
        self.persist_baseline().await;
        status
    }

    /// Run every check and derive an overall verdict.
    #[instrument(skip(self), fields(budget = %super::status::redact_budget_id(&self.budget_id)))]
    pub async fn validate(&self) -> ValidationSummary {
        let _serial = self.check_lock.lock().await;
        let previous = self.begin_check();
        let now = self.clock.now_millis();

        let (mut snapshot, mut checks) = match self.gather_for_validation().await {
            Ok(gathered) => gathered,
            Err(checks) => {
                error!("Validation battery could not run");
                let status =
                    SyncHealthStatus::failed(HealthState::CriticalFailure, "validation battery could not run", now);
                self.finish(&previous, status.clone(), "validation");
                return summarize(OverallStatus::CriticalFailure, checks, status);
            }
        };

        snapshot.pending.extend(self.writes.lock().touched());
        let divergence = classify(&snapshot.local, &snapshot.cloud, &self.known_good(), &snapshot.pending);
        let quarantined = self.absorb(&divergence, &snapshot.cloud, now);

        let mismatches: Vec<String> = divergence
            .corrupted
            .iter()
            .map(|k| format!("{k} (corrupted)"))
            .chain(divergence.unsynced.iter().map(|k| format!("{k} (unsynced)")))
            .collect();
        checks.push(CheckResult::from_failures("hash_agreement", &mismatches));
        checks.push(digest_check(&snapshot));
        checks.push(self.envelope_check(snapshot.documents.clone()).await);
        checks.push(self.queue_target_check(&snapshot).await);
        checks.push(self.dead_letter_check().await);

        let total_failed = checks.iter().filter(|c| !c.passed).count();
        let overall = if !divergence.corrupted.is_empty()
            && divergence.corruption_ratio() >= self.config.critical_divergence_ratio
        {
            OverallStatus::CriticalFailure
        } else if total_failed > 0 {
            OverallStatus::IssuesDetected
        } else {
            OverallStatus::AllSystemsGo
        };

        let state = overall.health_state();
        let status = SyncHealthStatus {
            is_healthy: Some(state == HealthState::Healthy),
            status: state,
            last_checked: Some(now),
            failed_tests: (total_failed > 0).then_some(total_failed),
            error: None,
            remote_ahead: divergence.remote_ahead.len(),
            quarantined,
        };
        self.finish(&previous, status.clone(), "validation");
        self.persist_baseline().await;

        info!(overall = ?overall, failed = total_failed, "Validation battery complete");
        summarize(overall, checks, status)
    }

    /// Periodic probe loop. Runs until `shutdown` flips to `true`.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_millis(self.config.probe_interval_ms.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(interval_ms = self.config.probe_interval_ms, "Health monitor started");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.check_health().await;
                }
            }
        }
        info!("Health monitor stopped");
    }

    // ═══════════════════════════════════════════════════════════════════════
    // INTERNALS
    // ═══════════════════════════════════════════════════════════════════════

    fn begin_check(&self) -> SyncHealthStatus {
        self.checks_run.fetch_add(1, Ordering::Relaxed);
        self.writes.lock().open_window();
        let previous = self.status();
        self.status.send_replace(SyncHealthStatus {
            status: HealthState::Checking,
            ..previous.clone()
        });
        previous
    }

    fn finish(&self, previous: &SyncHealthStatus, status: SyncHealthStatus, kind: &str) {
        crate::metrics::record_health_check(kind, status.status.as_str());
        let changed = previous.status != status.status || previous.error != status.error;
        self.status.send_replace(status.clone());
        if changed {
            debug!(from = %previous.status, to = %status.status, "Health status changed");
            self.events.publish(SyncEvent::HealthChanged(status));
        }
    }

    async fn snapshot(&self) -> Result<Snapshot, String> {
        let records = self.local.list_all().await.map_err(|e| format!("local store: {e}"))?;
        let documents = self
            .cloud
            .list(&self.budget_id)
            .await
            .map_err(|e| format!("cloud store: {e}"))?;
        let pending = self
            .queue
            .pending_entity_keys()
            .await
            .map_err(|e| format!("offline queue: {e}"))?;
        self.build_snapshot(records, documents, pending).await
    }

    async fn gather_for_validation(&self) -> Result<(Snapshot, Vec<CheckResult>), Vec<CheckResult>> {
        let mut checks = Vec::new();

        let records = self.local.list_all().await;
        checks.push(access_check("local_store_access", &records));
        let documents = self.cloud.list(&self.budget_id).await;
        checks.push(access_check("cloud_store_access", &documents));
        let pending = self.queue.pending_entity_keys().await;
        checks.push(access_check("queue_access", &pending));

        let (Ok(records), Ok(documents), Ok(pending)) = (records, documents, pending) else {
            return Err(checks);
        };
        match self.build_snapshot(records, documents, pending).await {
            Ok(snapshot) => Ok((snapshot, checks)),
            Err(e) => {
                checks.push(CheckResult::fail("local_hashing", e));
                Err(checks)
            }
        }
    }

    async fn build_snapshot(
        &self,
        records: Vec<StoredRecord>,
        documents: Vec<CloudDocument>,
        pending: HashSet<String>,
    ) -> Result<Snapshot, String> {
        let (records, local) = tokio::task::spawn_blocking(move || {
            let digest = records
                .iter()
                .map(|r| -> Result<(String, String), CryptoError> { Ok((r.key(), crypto::generate_hash(&r.data)?)) })
                .collect::<Result<SnapshotDigest, CryptoError>>();
            (records, digest)
        })
        .await
        .map_err(|e| format!("hashing task: {e}"))?;
        let local = local.map_err(|e| format!("local hashing: {e}"))?;
        let cloud = cloud_digest(&documents);

        Ok(Snapshot {
            records,
            documents,
            local,
            cloud,
            pending,
        })
    }

    /// Fold a divergence into the baseline and quarantine. Returns the
    /// quarantine size.
    fn absorb(&self, divergence: &Divergence, cloud: &SnapshotDigest, now: i64) -> usize {
        for key in &divergence.agreed {
            if let Some(hash) = cloud.get(key) {
                self.record_known_good(key, hash);
            }
        }

        let reset = self.local_reset.swap(false, Ordering::AcqRel);
        let suppressed = reset || self.is_suppressed();

        let quarantined = {
            let mut quarantine = self.quarantine.write();
            for key in &divergence.agreed {
                if quarantine.remove(key) {
                    info!(entity = %key, "Entity back in agreement, released from quarantine");
                }
            }
            if !suppressed {
                quarantine.extend(divergence.corrupted.iter().cloned());
            }
            quarantine.len()
        };
        crate::metrics::set_quarantined(quarantined);

        self.report_corruption(divergence, now, suppressed);
        quarantined
    }

    /// Publish at most one event per distinct divergence.
    fn report_corruption(&self, divergence: &Divergence, now: i64, suppressed: bool) {
        let mut last = self.last_reported.lock();
        let Some(fingerprint) = &divergence.fingerprint else {
            *last = None;
            return;
        };
        if suppressed {
            debug!(entities = divergence.corrupted.len(), "Divergence during reset, not reported");
            return;
        }
        if last.as_deref() == Some(fingerprint.as_str()) {
            return;
        }
        *last = Some(fingerprint.clone());

        let report = CorruptionReport::new(&self.budget_id, divergence.corrupted.clone(), now);
        error!(
            failure_count = report.failure_count,
            budget = %report.budget_id,
            "Sync corruption detected"
        );
        crate::metrics::record_corruption(report.failure_count);
        self.events.publish(SyncEvent::CorruptionDetected(report));
    }

    async fn envelope_check(&self, documents: Vec<CloudDocument>) -> CheckResult {
        let key = self.key.clone();
        let failures = tokio::task::spawn_blocking(move || {
            documents
                .iter()
                .filter(|doc| doc.open(&key).is_err())
                .map(CloudDocument::key)
                .collect::<Vec<_>>()
        })
        .await;

        match failures {
            Ok(failures) => CheckResult::from_failures("envelope_integrity", &failures),
            Err(e) => CheckResult::fail("envelope_integrity", format!("integrity task failed: {e}")),
        }
    }

    async fn queue_target_check(&self, snapshot: &Snapshot) -> CheckResult {
        let pending = match self.queue.pending().await {
            Ok(items) => items,
            Err(e) => return CheckResult::fail("queue_targets", e.to_string()),
        };
        let known: HashSet<String> = snapshot
            .records
            .iter()
            .map(StoredRecord::key)
            .chain(snapshot.documents.iter().map(CloudDocument::key))
            .collect();

        let failures: Vec<String> = pending
            .iter()
            .filter_map(|item| match item.entity_key() {
                None => Some(format!("{} has no target entity", item.request_id)),
                Some(key) if item.method != HttpMethod::Delete && !known.contains(&key) => {
                    Some(format!("{} targets unknown entity {key}", item.request_id))
                }
                Some(_) => None,
            })
            .collect();
        CheckResult::from_failures("queue_targets", &failures)
    }

    async fn dead_letter_check(&self) -> CheckResult {
        match self.queue.exhausted().await {
            Ok(items) if items.is_empty() => CheckResult::pass("dead_letters"),
            Ok(items) => CheckResult::fail(
                "dead_letters",
                format!("{} exhausted requests awaiting acknowledgement", items.len()),
            ),
            Err(e) => CheckResult::fail("dead_letters", e.to_string()),
        }
    }
}

/// Writes in progress, and every entity written since the current check
/// began.
#[derive(Default)]
struct WriteTracker {
    active: HashMap<String, usize>,
    window: HashSet<String>,
}

impl WriteTracker {
    fn begin(&mut self, key: &str) {
        *self.active.entry(key.to_string()).or_insert(0) += 1;
        self.window.insert(key.to_string());
    }

    fn end(&mut self, key: &str) {
        if let Some(count) = self.active.get_mut(key) {
            *count -= 1;
            if *count == 0 {
                self.active.remove(key);
            }
        }
    }

    fn open_window(&mut self) {
        self.window = self.active.keys().cloned().collect();
    }

    fn touched(&self) -> impl Iterator<Item = String> + '_ {
        self.window.iter().chain(self.active.keys()).cloned()
    }
}

/// Returned by [`HealthMonitor::track_write`].
pub struct WriteGuard<'a> {
    writes: &'a Mutex<WriteTracker>,
    key: String,
}

impl WriteGuard<'_> {
    /// Another write to the same entity is in progress.
    #[must_use]
    pub fn is_contended(&self) -> bool {
        self.writes.lock().active.get(&self.key).is_some_and(|n| *n > 1)
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.writes.lock().end(&self.key);
    }
}

pub(crate) struct SuppressionGuard<'a>(&'a AtomicUsize);

impl Drop for SuppressionGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

fn cloud_digest(documents: &[CloudDocument]) -> SnapshotDigest {
    documents.iter().map(|d| (d.key(), d.content_hash.clone())).collect()
}

fn access_check<T, E: std::fmt::Display>(name: &str, result: &Result<T, E>) -> CheckResult {
    match result {
        Ok(_) => CheckResult::pass(name),
        Err(e) => CheckResult::fail(name, e.to_string()),
    }
}

fn digest_check(snapshot: &Snapshot) -> CheckResult {
    let local = snapshot.local.without(&snapshot.pending).root_hash();
    let cloud = snapshot.cloud.without(&snapshot.pending).root_hash();
    if local == cloud {
        CheckResult::pass("snapshot_digest")
    } else {
        CheckResult::fail("snapshot_digest", format!("local {} != cloud {}", &local[..12], &cloud[..12]))
    }
}

fn summarize(overall_status: OverallStatus, checks: Vec<CheckResult>, status: SyncHealthStatus) -> ValidationSummary {
    let total_passed = checks.iter().filter(|c| c.passed).count();
    ValidationSummary {
        overall_status,
        total_passed,
        total_failed: checks.len() - total_passed,
        checks,
        status,
    }
}
