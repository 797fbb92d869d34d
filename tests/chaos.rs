// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Chaos testing for budget sync.
//!
//! Failure scenarios driven through the public API:
//! 1. **Failing wrappers**: local store and executor that fail on demand
//! 2. **Cloud outages**: the memory cloud switched unavailable mid-flight
//! 3. **Signaling drops**: a relay that severs every connection at once
//! 4. **Tampering**: garbage written straight into the cloud store
//!
//! # Running Chaos Tests
//! ```bash
//! cargo test --test chaos -- --nocapture
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;

use budget_sync::queue::{ExecutorResponse, QueuedRequest, RequestError, RequestExecutor};
use budget_sync::resilience::CircuitState;
use budget_sync::signaling::{Frame, SignalError, SignalSink, SignalSocket, SignalStream, SignalTransport};
use budget_sync::storage::{
    CloudDocument, CloudStore, MemoryCloudStore, MemoryRecordStore, RecordStore, StorageError, StoredRecord,
};
use budget_sync::{
    BudgetSync, BudgetSyncConfig, Delivery, HealthState, ManualClock, Mutation, SyncBackends, SyncError, SyncEvent,
};

const PASSWORD: &str = "correct horse battery staple";
const SHARE_CODE: &str = "abandon ability able about";

// =============================================================================
// Failing Wrappers - Precise Error Injection
// =============================================================================

/// Local store whose writes fail while `fail_writes` is set.
struct FailingRecordStore {
    inner: MemoryRecordStore,
    fail_writes: AtomicBool,
    write_attempts: AtomicU64,
}

impl FailingRecordStore {
    fn new() -> Self {
        Self {
            inner: MemoryRecordStore::new(),
            fail_writes: AtomicBool::new(false),
            write_attempts: AtomicU64::new(0),
        }
    }

    fn check(&self) -> Result<(), StorageError> {
        self.write_attempts.fetch_add(1, Ordering::Relaxed);
        if self.fail_writes.load(Ordering::Acquire) {
            return Err(StorageError::Backend("disk full".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for FailingRecordStore {
    async fn get(&self, entity_type: &str, entity_id: &str) -> Result<Option<StoredRecord>, StorageError> {
        self.inner.get(entity_type, entity_id).await
    }

    async fn put(&self, record: &StoredRecord) -> Result<(), StorageError> {
        self.check()?;
        self.inner.put(record).await
    }

    async fn delete(&self, entity_type: &str, entity_id: &str) -> Result<bool, StorageError> {
        self.check()?;
        self.inner.delete(entity_type, entity_id).await
    }

    async fn list_by_type(&self, entity_type: &str) -> Result<Vec<StoredRecord>, StorageError> {
        self.inner.list_by_type(entity_type).await
    }

    async fn list_all(&self) -> Result<Vec<StoredRecord>, StorageError> {
        self.inner.list_all().await
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.check()?;
        self.inner.clear().await
    }
}

/// Executor that answers 503 until healed, then forwards to the cloud.
struct FlakyExecutor {
    cloud: Arc<MemoryCloudStore>,
    healthy: AtomicBool,
    calls: AtomicU64,
}

impl FlakyExecutor {
    fn new(cloud: Arc<MemoryCloudStore>) -> Self {
        Self {
            cloud,
            healthy: AtomicBool::new(false),
            calls: AtomicU64::new(0),
        }
    }

    fn heal(&self) {
        self.healthy.store(true, Ordering::Release);
    }
}

#[async_trait]
impl RequestExecutor for FlakyExecutor {
    async fn execute(&self, request: &QueuedRequest) -> Result<ExecutorResponse, RequestError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if !self.healthy.load(Ordering::Acquire) {
            return Err(RequestError::Status {
                status: 503,
                message: "service unavailable".into(),
            });
        }
        self.cloud.execute(request).await
    }
}

// =============================================================================
// Severable Relay - every connection can be dropped at once
// =============================================================================

#[derive(Default)]
struct SeverableRelay {
    peers: Mutex<HashMap<usize, mpsc::UnboundedSender<Frame>>>,
    next_id: AtomicUsize,
    connects: AtomicUsize,
}

impl SeverableRelay {
    /// Drop every live connection as if the server went away.
    fn sever(&self) {
        let peers: Vec<_> = self.peers.lock().unwrap().drain().map(|(_, tx)| tx).collect();
        for peer in peers {
            let _ = peer.send(Frame::Dropped("relay restarted".into()));
        }
    }

    fn connects(&self) -> usize {
        self.connects.load(Ordering::Acquire)
    }
}

struct SeverableTransport(Arc<SeverableRelay>);

struct SeverableSink {
    relay: Arc<SeverableRelay>,
    id: usize,
}

struct SeverableStream(mpsc::UnboundedReceiver<Frame>);

#[async_trait]
impl SignalTransport for SeverableTransport {
    async fn connect(&self, _url: &str) -> Result<SignalSocket, SignalError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.0.next_id.fetch_add(1, Ordering::AcqRel);
        self.0.peers.lock().unwrap().insert(id, tx);
        self.0.connects.fetch_add(1, Ordering::AcqRel);
        Ok(SignalSocket {
            sink: Box::new(SeverableSink {
                relay: self.0.clone(),
                id,
            }),
            stream: Box::new(SeverableStream(rx)),
        })
    }
}

#[async_trait]
impl SignalSink for SeverableSink {
    async fn send(&mut self, text: String) -> Result<(), SignalError> {
        let peers = self.relay.peers.lock().unwrap();
        if !peers.contains_key(&self.id) {
            return Err(SignalError::Send("connection severed".into()));
        }
        for (id, peer) in peers.iter() {
            if *id != self.id {
                let _ = peer.send(Frame::Text(text.clone()));
            }
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.relay.peers.lock().unwrap().remove(&self.id);
    }
}

#[async_trait]
impl SignalStream for SeverableStream {
    async fn next_frame(&mut self) -> Frame {
        self.0.recv().await.unwrap_or(Frame::Closed)
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn config(device: &str) -> BudgetSyncConfig {
    let mut config = BudgetSyncConfig::default();
    config.device_info = device.to_string();
    config.crypto.kdf_iterations = 1_000;
    config.queue.drain_interval_ms = 20;
    config.queue.online_drain_delay_ms = 0;
    config
}

async fn wait_for<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// =============================================================================
// Cloud outages
// =============================================================================

#[tokio::test]
async fn test_cloud_outage_queues_then_recovers() {
    let cloud = Arc::new(MemoryCloudStore::new());
    let local = Arc::new(MemoryRecordStore::new());
    let sync = BudgetSync::new(config("phone"), SyncBackends::new(local.clone(), cloud.clone(), cloud.clone()));
    let budget_id = sync.unlock(PASSWORD, SHARE_CODE).await.unwrap();
    sync.set_online(true);

    cloud.set_available(false);
    let outcome = sync
        .submit(Mutation::put("bill", "rent", json!({"amount": 1450})))
        .await
        .unwrap();
    assert_eq!(outcome.delivery, Delivery::Queued);
    // The local write stands while the cloud is away
    assert!(local.get("bill", "rent").await.unwrap().is_some());
    assert!(matches!(sync.pull().await, Err(SyncError::Storage(_))));
    assert_eq!(sync.check_health().await.unwrap().status, HealthState::Error);

    cloud.set_available(true);
    let report = sync.force_drain().await.unwrap();
    assert_eq!(report.delivered, 1);
    assert_eq!(cloud.document_count(&budget_id), 1);
    assert!(sync.queue().pending().await.unwrap().is_empty());
    assert_eq!(sync.check_health().await.unwrap().status, HealthState::Healthy);
}

#[tokio::test]
async fn test_write_circuit_opens_under_sustained_outage() {
    let cloud = Arc::new(MemoryCloudStore::new());
    let local = Arc::new(MemoryRecordStore::new());
    let sync = BudgetSync::new(config("phone"), SyncBackends::new(local, cloud.clone(), cloud.clone()));
    sync.unlock(PASSWORD, SHARE_CODE).await.unwrap();
    sync.set_online(true);
    cloud.set_available(false);

    for i in 0..12 {
        let outcome = sync
            .submit(Mutation::put("transaction", format!("t{i}"), json!({"amount": -i})))
            .await
            .unwrap();
        assert_eq!(outcome.delivery, Delivery::Queued);
    }

    let writes = &sync.circuits().writes;
    assert_eq!(writes.state(), CircuitState::Open);
    assert!(writes.rejections() > 0);
    assert!(writes.failures() > 0);
    assert_eq!(writes.successes(), 0);
    assert_eq!(sync.queue().pending().await.unwrap().len(), 12);

    // The queue does not go through the breaker; it drains once the cloud is back
    cloud.set_available(true);
    let report = sync.force_drain().await.unwrap();
    assert_eq!(report.delivered, 12);
}

// =============================================================================
// Retry exhaustion
// =============================================================================

#[tokio::test]
async fn test_retries_exhaust_into_dead_letter() {
    let cloud = Arc::new(MemoryCloudStore::new());
    let executor = Arc::new(FlakyExecutor::new(cloud.clone()));
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let mut cfg = config("phone");
    cfg.queue.max_retries = 2;
    cfg.queue.initial_delay_ms = 1_000;
    cfg.queue.max_delay_ms = 4_000;
    let sync = BudgetSync::new(
        cfg,
        SyncBackends::new(Arc::new(MemoryRecordStore::new()), cloud.clone(), executor.clone()).clock(clock.clone()),
    );
    let budget_id = sync.unlock(PASSWORD, SHARE_CODE).await.unwrap();
    let mut events = sync.events().subscribe();

    let outcome = sync
        .submit(Mutation::put("envelope", "groceries", json!({"budgeted": 600})))
        .await
        .unwrap();
    assert_eq!(outcome.delivery, Delivery::Queued);
    sync.set_online(true);

    assert_eq!(sync.force_drain().await.unwrap().retrying, 1);
    // Not due yet
    assert_eq!(sync.force_drain().await.unwrap().deferred, 1);

    clock.advance_millis(4_000);
    assert_eq!(sync.force_drain().await.unwrap().retrying, 1);
    clock.advance_millis(4_000);
    assert_eq!(sync.force_drain().await.unwrap().exhausted, 1);
    assert_eq!(executor.calls.load(Ordering::Relaxed), 3);

    let exhausted = sync.queue().exhausted().await.unwrap();
    assert_eq!(exhausted.len(), 1);
    assert_eq!(exhausted[0].request_id, outcome.request_id);
    assert!(exhausted[0].last_error.as_deref().is_some_and(|e| e.contains("503")));

    let mut saw_exhausted = false;
    while let Ok(event) = events.try_recv() {
        if let SyncEvent::RequestExhausted { request_id, .. } = event {
            assert_eq!(request_id, outcome.request_id);
            saw_exhausted = true;
        }
    }
    assert!(saw_exhausted);

    // Dead letters stay put until someone re-queues them
    executor.heal();
    assert_eq!(sync.force_drain().await.unwrap().delivered, 0);
    assert!(sync.queue().retry_exhausted(&outcome.request_id).await.unwrap());
    assert_eq!(sync.force_drain().await.unwrap().delivered, 1);
    assert_eq!(cloud.document_count(&budget_id), 1);
}

// =============================================================================
// Local store failures
// =============================================================================

#[tokio::test]
async fn test_local_write_failure_queues_nothing() {
    let cloud = Arc::new(MemoryCloudStore::new());
    let local = Arc::new(FailingRecordStore::new());
    let sync = BudgetSync::new(config("phone"), SyncBackends::new(local.clone(), cloud.clone(), cloud.clone()));
    let budget_id = sync.unlock(PASSWORD, SHARE_CODE).await.unwrap();
    sync.set_online(true);

    local.fail_writes.store(true, Ordering::Release);
    let err = sync
        .submit(Mutation::put("bill", "power", json!({"amount": 90})))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Storage(StorageError::Backend(_))));
    assert_eq!(local.write_attempts.load(Ordering::Relaxed), 1);
    assert!(sync.queue().pending().await.unwrap().is_empty());
    assert_eq!(cloud.document_count(&budget_id), 0);
    assert!(sync.ledger().recent_changes(10).await.unwrap().is_empty());

    local.fail_writes.store(false, Ordering::Release);
    let outcome = sync
        .submit(Mutation::put("bill", "power", json!({"amount": 90})))
        .await
        .unwrap();
    assert_eq!(outcome.delivery, Delivery::Sent);
}

// =============================================================================
// Tampering
// =============================================================================

#[tokio::test]
async fn test_tampered_document_is_not_applied() {
    let cloud = Arc::new(MemoryCloudStore::new());
    let phone = BudgetSync::new(
        config("phone"),
        SyncBackends::new(Arc::new(MemoryRecordStore::new()), cloud.clone(), cloud.clone()),
    );
    let laptop_local = Arc::new(MemoryRecordStore::new());
    let laptop = BudgetSync::new(
        config("laptop"),
        SyncBackends::new(laptop_local.clone(), cloud.clone(), cloud.clone()),
    );
    let budget_id = phone.unlock(PASSWORD, SHARE_CODE).await.unwrap();
    laptop.unlock(PASSWORD, SHARE_CODE).await.unwrap();
    phone.set_online(true);

    for (id, amount) in [("rent", 1450), ("power", 90)] {
        phone
            .submit(Mutation::put("bill", id, json!({"amount": amount})))
            .await
            .unwrap();
    }

    let mut forged: CloudDocument = cloud.fetch(&budget_id, "bill:power").await.unwrap().unwrap();
    forged.envelope.ciphertext = b"not a real ciphertext".to_vec();
    cloud.overwrite(&budget_id, forged);

    let report = laptop.pull().await.unwrap();
    assert_eq!(report.fetched, 2);
    assert_eq!(report.applied, 1);
    assert_eq!(report.failed, 1);
    assert!(laptop_local.get("bill", "rent").await.unwrap().is_some());
    assert!(laptop_local.get("bill", "power").await.unwrap().is_none());
}

// =============================================================================
// Signaling drops
// =============================================================================

#[tokio::test]
async fn test_signaling_reconnects_after_relay_drop() {
    let cloud = Arc::new(MemoryCloudStore::new());
    let relay = Arc::new(SeverableRelay::default());

    let mut devices = Vec::new();
    for name in ["phone", "laptop"] {
        let mut cfg = config(name);
        cfg.signaling.enabled = true;
        cfg.signaling.url = Some("wss://relay.test/ws".into());
        cfg.signaling.heartbeat_interval_ms = 3_600_000;
        cfg.signaling.reconnect_interval_ms = 10;
        cfg.signaling.max_reconnect_delay_ms = 50;

        let local = Arc::new(MemoryRecordStore::new());
        let backends = SyncBackends::new(local.clone(), cloud.clone(), cloud.clone())
            .transport(Arc::new(SeverableTransport(relay.clone())));
        let sync = BudgetSync::new(cfg, backends);
        sync.start().await.unwrap();
        sync.unlock(PASSWORD, SHARE_CODE).await.unwrap();
        sync.set_online(true);
        devices.push((sync, local));
    }
    wait_for("both devices to connect", || {
        devices.iter().all(|(sync, _)| sync.signaling().is_connected())
    })
    .await;
    assert_eq!(relay.connects(), 2);

    relay.sever();
    wait_for("both devices to reconnect", || {
        relay.connects() >= 4 && devices.iter().all(|(sync, _)| sync.signaling().is_connected())
    })
    .await;

    let (phone, _) = &devices[0];
    let (_, laptop_local) = &devices[1];
    let outcome = phone
        .submit(Mutation::put("bill", "rent", json!({"amount": 1450})))
        .await
        .unwrap();
    assert_eq!(outcome.delivery, Delivery::Sent);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while laptop_local.get("bill", "rent").await.unwrap().is_none() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for laptop to pull");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    for (sync, _) in &devices {
        sync.shutdown().await;
    }
}
