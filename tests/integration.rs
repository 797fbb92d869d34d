// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Integration tests for budget sync.
//!
//! Every test runs against in-process backends: the memory cloud store,
//! SQLite files in a temp directory, and a relay transport that forwards
//! signals between devices.
//!
//! Run with: `cargo test --test integration`

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;

use budget_sync::history::ChangeType;
use budget_sync::signaling::{Frame, SignalSink, SignalSocket, SignalStream, SignalTransport};
use budget_sync::signaling::SignalError;
use budget_sync::storage::{CloudStore, MemoryCloudStore, MemoryRecordStore, RecordStore, SqliteStore, StoredRecord};
use budget_sync::{
    BudgetSync, BudgetSyncConfig, Delivery, EngineState, HealthState, Mutation, RecoveryDirection, SyncBackends,
    SyncEvent,
};

const PASSWORD: &str = "correct horse battery staple";
const SHARE_CODE: &str = "abandon ability able about";
const RELAY_URL: &str = "wss://relay.test/ws";

// =============================================================================
// Relay transport: every frame a device sends reaches every other device
// =============================================================================

#[derive(Default)]
struct Relay {
    peers: Mutex<Vec<mpsc::UnboundedSender<Frame>>>,
}

struct RelayTransport(Arc<Relay>);

struct RelaySink {
    relay: Arc<Relay>,
    id: usize,
}

struct RelayStream(mpsc::UnboundedReceiver<Frame>);

#[async_trait]
impl SignalTransport for RelayTransport {
    async fn connect(&self, _url: &str) -> Result<SignalSocket, SignalError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut peers = self.0.peers.lock().unwrap();
            peers.push(tx);
            peers.len() - 1
        };
        Ok(SignalSocket {
            sink: Box::new(RelaySink {
                relay: self.0.clone(),
                id,
            }),
            stream: Box::new(RelayStream(rx)),
        })
    }
}

#[async_trait]
impl SignalSink for RelaySink {
    async fn send(&mut self, text: String) -> Result<(), SignalError> {
        let peers = self.relay.peers.lock().unwrap();
        for (id, peer) in peers.iter().enumerate() {
            if id != self.id {
                let _ = peer.send(Frame::Text(text.clone()));
            }
        }
        Ok(())
    }

    async fn close(&mut self) {}
}

#[async_trait]
impl SignalStream for RelayStream {
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

fn signaling_config(device: &str) -> BudgetSyncConfig {
    let mut config = config(device);
    config.signaling.enabled = true;
    config.signaling.url = Some(RELAY_URL.into());
    config.signaling.heartbeat_interval_ms = 3_600_000;
    config
}

async fn wait_for<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition().await {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// =============================================================================
// Multi-device
// =============================================================================

#[tokio::test]
async fn test_change_notice_triggers_pull_on_other_device() {
    let cloud = Arc::new(MemoryCloudStore::new());
    let relay = Arc::new(Relay::default());

    let mut devices = Vec::new();
    for name in ["phone", "laptop"] {
        let local = Arc::new(MemoryRecordStore::new());
        let backends = SyncBackends::new(local.clone(), cloud.clone(), cloud.clone())
            .transport(Arc::new(RelayTransport(relay.clone())));
        let sync = BudgetSync::new(signaling_config(name), backends);
        sync.start().await.unwrap();
        sync.unlock(PASSWORD, SHARE_CODE).await.unwrap();
        sync.set_online(true);
        let mut status = sync.signaling().status_receiver();
        tokio::time::timeout(Duration::from_secs(5), status.wait_for(|s| s.is_connected))
            .await
            .unwrap()
            .unwrap();
        devices.push((sync, local));
    }
    let (phone, _) = &devices[0];
    let (laptop, laptop_local) = &devices[1];
    assert_ne!(phone.device_id(), laptop.device_id());

    let outcome = phone
        .submit(Mutation::put("bill", "rent", json!({"amount": 1450})))
        .await
        .unwrap();
    assert_eq!(outcome.delivery, Delivery::Sent);

    wait_for("laptop to pull the change", || async {
        laptop_local.get("bill", "rent").await.unwrap().is_some()
    })
    .await;
    assert_eq!(
        laptop_local.get("bill", "rent").await.unwrap().unwrap().data,
        json!({"amount": 1450})
    );

    for (sync, _) in &devices {
        sync.shutdown().await;
        assert_eq!(sync.state(), EngineState::Stopped);
    }
}

#[tokio::test]
async fn test_devices_converge_after_offline_edits() {
    let cloud = Arc::new(MemoryCloudStore::new());
    let phone_local = Arc::new(MemoryRecordStore::new());
    let laptop_local = Arc::new(MemoryRecordStore::new());
    let phone = BudgetSync::new(
        config("phone"),
        SyncBackends::new(phone_local.clone(), cloud.clone(), cloud.clone()),
    );
    let laptop = BudgetSync::new(
        config("laptop"),
        SyncBackends::new(laptop_local.clone(), cloud.clone(), cloud.clone()),
    );
    phone.unlock(PASSWORD, SHARE_CODE).await.unwrap();
    laptop.unlock(PASSWORD, SHARE_CODE).await.unwrap();

    for i in 0..5 {
        let outcome = phone
            .submit(Mutation::put("transaction", format!("t{i}"), json!({"amount": -(i * 10)})))
            .await
            .unwrap();
        assert_eq!(outcome.delivery, Delivery::Queued);
    }

    phone.set_online(true);
    let report = phone.force_drain().await.unwrap();
    assert_eq!(report.delivered, 5);

    let pulled = laptop.pull().await.unwrap();
    assert_eq!(pulled.applied, 5);
    assert_eq!(phone_local.list_all().await.unwrap(), laptop_local.list_all().await.unwrap());

    assert_eq!(phone.check_health().await.unwrap().status, HealthState::Healthy);
    assert_eq!(laptop.check_health().await.unwrap().status, HealthState::Healthy);
}

// =============================================================================
// Durability
// =============================================================================

#[tokio::test]
async fn test_queue_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.db");
    let cloud = Arc::new(MemoryCloudStore::new());

    let request_id = {
        let store = Arc::new(SqliteStore::open(&path).await.unwrap());
        let backends = SyncBackends::new(Arc::new(MemoryRecordStore::new()), cloud.clone(), cloud.clone())
            .queue_store(store.clone())
            .ledger_store(store.clone());
        let sync = BudgetSync::new(config("laptop"), backends);
        sync.start().await.unwrap();
        sync.unlock(PASSWORD, SHARE_CODE).await.unwrap();
        let outcome = sync
            .submit(Mutation::put("bill", "rent", json!({"amount": 1450})))
            .await
            .unwrap();
        sync.shutdown().await;
        store.close().await;
        outcome.request_id
    };

    let store = Arc::new(SqliteStore::open(&path).await.unwrap());
    let backends = SyncBackends::new(Arc::new(MemoryRecordStore::new()), cloud.clone(), cloud.clone())
        .queue_store(store.clone())
        .ledger_store(store);
    let sync = BudgetSync::new(config("laptop"), backends);
    sync.start().await.unwrap();
    let budget_id = sync.unlock(PASSWORD, SHARE_CODE).await.unwrap();

    let pending = sync.queue().pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].request_id, request_id);
    assert_eq!(sync.ledger().recent_changes(10).await.unwrap().len(), 1);

    let mut events = sync.events().subscribe();
    sync.set_online(true);
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(SyncEvent::RequestDelivered { request_id: delivered, .. }) = events.recv().await {
                if delivered == request_id {
                    break;
                }
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(cloud.document_count(&budget_id), 1);
    sync.shutdown().await;
}

/// Laptop wiring that keeps its local records and SQLite file across restarts.
fn restartable(local: &Arc<MemoryRecordStore>, store: &Arc<SqliteStore>, cloud: &Arc<MemoryCloudStore>) -> Arc<BudgetSync> {
    let backends = SyncBackends::new(local.clone(), cloud.clone(), cloud.clone())
        .queue_store(store.clone())
        .ledger_store(store.clone())
        .baseline_store(store.clone());
    BudgetSync::new(config("laptop"), backends)
}

fn corruption_count(events: &mut tokio::sync::broadcast::Receiver<SyncEvent>) -> usize {
    let mut count = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, SyncEvent::CorruptionDetected(_)) {
            count += 1;
        }
    }
    count
}

#[tokio::test]
async fn test_remote_edit_while_closed_is_pulled_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sync.db");
    let cloud = Arc::new(MemoryCloudStore::new());
    let laptop_local = Arc::new(MemoryRecordStore::new());

    {
        let store = Arc::new(SqliteStore::open(&path).await.unwrap());
        let laptop = restartable(&laptop_local, &store, &cloud);
        laptop.start().await.unwrap();
        laptop.unlock(PASSWORD, SHARE_CODE).await.unwrap();
        laptop.set_online(true);
        let outcome = laptop
            .submit(Mutation::put("bill", "rent", json!({"amount": 1})))
            .await
            .unwrap();
        assert_eq!(outcome.delivery, Delivery::Sent);
        laptop.shutdown().await;
        store.close().await;
    }

    // Another device edits while the laptop is closed
    let phone_local = Arc::new(MemoryRecordStore::new());
    let phone = BudgetSync::new(
        config("phone"),
        SyncBackends::new(phone_local.clone(), cloud.clone(), cloud.clone()),
    );
    phone.unlock(PASSWORD, SHARE_CODE).await.unwrap();
    phone.set_online(true);
    phone.pull().await.unwrap();
    phone
        .submit(Mutation::put("bill", "rent", json!({"amount": 2})))
        .await
        .unwrap();

    let store = Arc::new(SqliteStore::open(&path).await.unwrap());
    let laptop = restartable(&laptop_local, &store, &cloud);
    let mut events = laptop.events().subscribe();
    laptop.start().await.unwrap();
    laptop.unlock(PASSWORD, SHARE_CODE).await.unwrap();

    // The periodic health check runs as soon as the session opens
    let checked = laptop.clone();
    wait_for("first health check", || {
        let checked = checked.clone();
        async move {
            checked
                .health_status()
                .is_some_and(|s| s.last_checked.is_some() && s.status != HealthState::Checking)
        }
    })
    .await;

    let status = laptop.check_health().await.unwrap();
    assert_eq!(status.status, HealthState::Healthy);
    assert_eq!(status.remote_ahead, 1);
    assert!(laptop.quarantined().is_empty());

    let report = laptop.pull().await.unwrap();
    assert_eq!(report.applied, 1);
    assert_eq!(report.skipped_quarantined, 0);
    assert_eq!(
        laptop_local.get("bill", "rent").await.unwrap().unwrap().data,
        json!({"amount": 2})
    );
    assert_eq!(corruption_count(&mut events), 0);
    laptop.shutdown().await;
}

#[tokio::test]
async fn test_local_drift_while_closed_is_detected_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sync.db");
    let cloud = Arc::new(MemoryCloudStore::new());
    let local = Arc::new(MemoryRecordStore::new());

    {
        let store = Arc::new(SqliteStore::open(&path).await.unwrap());
        let laptop = restartable(&local, &store, &cloud);
        laptop.unlock(PASSWORD, SHARE_CODE).await.unwrap();
        laptop.set_online(true);
        laptop
            .submit(Mutation::put("bill", "rent", json!({"amount": 1})))
            .await
            .unwrap();
        laptop
            .submit(Mutation::put("bill", "water", json!({"amount": 60})))
            .await
            .unwrap();
        laptop.lock().await;
        store.close().await;
    }

    // Written outside the sync path
    local
        .put(&StoredRecord::new("bill", "rent", json!({"amount": 999}), 5))
        .await
        .unwrap();

    let store = Arc::new(SqliteStore::open(&path).await.unwrap());
    let laptop = restartable(&local, &store, &cloud);
    let mut events = laptop.events().subscribe();
    laptop.unlock(PASSWORD, SHARE_CODE).await.unwrap();

    let status = laptop.check_health().await.unwrap();
    assert_ne!(status.status, HealthState::Healthy);
    assert_eq!(laptop.quarantined(), vec!["bill:rent".to_string()]);
    assert_eq!(corruption_count(&mut events), 1);

    let report = laptop.pull().await.unwrap();
    assert_eq!(report.skipped_quarantined, 1);
    assert_eq!(report.unchanged, 1);
}

// =============================================================================
// History
// =============================================================================

#[tokio::test]
async fn test_submissions_build_history() {
    let cloud = Arc::new(MemoryCloudStore::new());
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    let clock = Arc::new(budget_sync::ManualClock::new(1_741_615_200_000));
    let backends = SyncBackends::new(Arc::new(MemoryRecordStore::new()), cloud.clone(), cloud)
        .ledger_store(store)
        .clock(clock.clone());
    let sync = BudgetSync::new(config("laptop"), backends);
    sync.unlock(PASSWORD, SHARE_CODE).await.unwrap();
    sync.set_online(true);

    let first = sync
        .submit(Mutation::put("bill", "rent", json!({"amount": 1400})).author("Sam").message("Add rent"))
        .await
        .unwrap()
        .commit_hash
        .unwrap();
    clock.advance_millis(60_000);
    let second = sync
        .submit(Mutation::put("bill", "rent", json!({"amount": 1450})).author("Sam"))
        .await
        .unwrap()
        .commit_hash
        .unwrap();
    clock.advance_millis(60_000);
    sync.submit(Mutation::delete("bill", "rent").author("Alex")).await.unwrap();

    let ledger = sync.ledger();
    let history = ledger.entity_history("bill", "rent", None).await.unwrap();
    let types: Vec<ChangeType> = history.iter().map(|e| e.change.change_type).collect();
    assert_eq!(types, vec![ChangeType::Delete, ChangeType::Update, ChangeType::Create]);
    assert_eq!(history[1].change.before_data, Some(json!({"amount": 1400})));
    assert_eq!(history[1].change.after_data, Some(json!({"amount": 1450})));

    let log = ledger.log(&second, 10).await.unwrap();
    assert_eq!(log.len(), 2);
    assert_eq!(log[1].hash, first);
    assert_eq!(log[0].device_fingerprint.as_deref(), Some(sync.device_id()));
    assert!(ledger.verify_commit(&first).await.unwrap());

    let branch = ledger.create_branch("what-if", &first, Some("Cheaper rent"), None).await.unwrap();
    assert_eq!(branch.source_commit_hash, first);
    assert_eq!(ledger.branches().await.unwrap().len(), 2);
}

// =============================================================================
// Health & recovery
// =============================================================================

#[tokio::test]
async fn test_corruption_reported_once_then_recovered() {
    let cloud = Arc::new(MemoryCloudStore::new());
    let local = Arc::new(MemoryRecordStore::new());
    let sync = BudgetSync::new(
        config("laptop"),
        SyncBackends::new(local.clone(), cloud.clone(), cloud.clone()),
    );
    let budget_id = sync.unlock(PASSWORD, SHARE_CODE).await.unwrap();
    sync.set_online(true);
    for id in ["rent", "water", "power"] {
        sync.submit(Mutation::put("bill", id, json!({"amount": 10}))).await.unwrap();
    }
    assert_eq!(sync.check_health().await.unwrap().status, HealthState::Healthy);

    let mut events = sync.events().subscribe();
    local
        .put(&StoredRecord::new("bill", "rent", json!({"amount": 99999}), 1))
        .await
        .unwrap();

    for _ in 0..3 {
        let status = sync.check_health().await.unwrap();
        assert!(matches!(
            status.status,
            HealthState::IssuesDetected | HealthState::Error | HealthState::CriticalFailure
        ));
    }
    let mut reports = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SyncEvent::CorruptionDetected(report) = event {
            reports.push(report);
        }
    }
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].entities, vec!["bill:rent".to_string()]);
    assert!(!reports[0].budget_id.contains(&budget_id));

    let result = sync.reset_cloud_data(RecoveryDirection::CloudToLocal).await;
    assert!(result.success, "{result:?}");
    assert_eq!(local.get("bill", "rent").await.unwrap().unwrap().data, json!({"amount": 10}));
    assert_eq!(sync.check_health().await.unwrap().status, HealthState::Healthy);
    assert_eq!(cloud.document_count(&budget_id), 3);

    let summary = sync.validate().await.unwrap();
    assert_eq!(summary.total_failed, 0, "{:?}", summary.checks);
}
