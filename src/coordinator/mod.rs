// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync coordinator.
//!
//! [`BudgetSync`] ties the components together behind one facade:
//! - encrypts mutations and sends them directly, or queues them when offline
//! - records every accepted mutation in the history ledger
//! - tells other devices to pull through the signaling channel
//! - runs the health monitor and exposes recovery
//!
//! # Lifecycle
//!
//! ```text
//! new() ─► Created ─start()─► Running ─shutdown()─► ShuttingDown ─► Stopped
//!                               │
//!              unlock(password, share code) / lock()   (session, any time)
//! ```
//!
//! Key material only exists between `unlock()` and `lock()`. Without a
//! session, `submit()` and `pull()` fail with [`SyncError::Locked`].
//!
//! # Example
//!
//! ```rust,no_run
//! use budget_sync::{BudgetSync, BudgetSyncConfig, Mutation, SyncBackends};
//! use budget_sync::storage::{MemoryCloudStore, MemoryRecordStore};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), budget_sync::SyncError> {
//! let cloud = Arc::new(MemoryCloudStore::new());
//! let backends = SyncBackends::new(Arc::new(MemoryRecordStore::new()), cloud.clone(), cloud);
//! let sync = BudgetSync::new(BudgetSyncConfig::default(), backends);
//!
//! sync.start().await?;
//! sync.unlock("correct horse battery staple", "abandon ability able about").await?;
//! sync.set_online(true);
//! sync.submit(Mutation::put("bill", "rent", json!({"amount": 1450}))).await?;
//! sync.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod api;
mod lifecycle;
mod session;
mod types;

pub use api::RecoveryHandle;
pub use types::{Delivery, EngineState, Mutation, MutationKind, PullReport, SubmitOutcome, SyncOverview};

use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::clock::{self, Clock};
use crate::config::BudgetSyncConfig;
use crate::crypto;
use crate::error::SyncError;
use crate::events::EventBus;
use crate::health::{BaselineStore, MemoryBaselineStore};
use crate::history::{HistoryLedger, LedgerStore, MemoryLedgerStore};
use crate::queue::{MemoryQueueStore, OfflineQueue, QueueStore, RequestExecutor};
use crate::resilience::CloudCircuits;
use crate::signaling::{SignalTransport, SignalingChannel, WsTransport};
use crate::storage::{CloudStore, HttpCloudClient, RecordStore, SqliteStore};

use session::Session;

/// The collaborators a [`BudgetSync`] runs against.
///
/// Required: the local record store, the cloud store, and the executor that
/// delivers queued requests (usually the same object as the cloud store).
/// Everything else defaults to in-memory stores, the WebSocket transport and
/// the system clock.
pub struct SyncBackends {
    pub local: Arc<dyn RecordStore>,
    pub cloud: Arc<dyn CloudStore>,
    pub executor: Arc<dyn RequestExecutor>,
    pub queue_store: Arc<dyn QueueStore>,
    pub ledger_store: Arc<dyn LedgerStore>,
    pub baseline_store: Arc<dyn BaselineStore>,
    pub transport: Arc<dyn SignalTransport>,
    pub clock: Arc<dyn Clock>,
}

impl SyncBackends {
    pub fn new(
        local: Arc<dyn RecordStore>,
        cloud: Arc<dyn CloudStore>,
        executor: Arc<dyn RequestExecutor>,
    ) -> Self {
        Self {
            local,
            cloud,
            executor,
            queue_store: Arc::new(MemoryQueueStore::new()),
            ledger_store: Arc::new(MemoryLedgerStore::new()),
            baseline_store: Arc::new(MemoryBaselineStore::new()),
            transport: Arc::new(WsTransport),
            clock: clock::system(),
        }
    }

    /// Production wiring: HTTP cloud client from `cloud_url`, SQLite queue,
    /// ledger and health baseline at `queue_path` (in-memory SQLite when unset).
    pub async fn from_config(config: &BudgetSyncConfig, local: Arc<dyn RecordStore>) -> Result<Self, SyncError> {
        let Some(cloud_url) = config.cloud_url.as_deref() else {
            return Err(SyncError::Validation("cloud_url is not configured".into()));
        };
        let client = Arc::new(HttpCloudClient::new(
            cloud_url,
            Duration::from_millis(config.queue.request_timeout_ms),
        )?);
        let sqlite = Arc::new(match config.queue_path.as_deref() {
            Some(path) => SqliteStore::open(path).await?,
            None => SqliteStore::in_memory().await?,
        });

        Ok(Self::new(local, client.clone(), client)
            .queue_store(sqlite.clone())
            .ledger_store(sqlite.clone())
            .baseline_store(sqlite))
    }

    #[must_use]
    pub fn queue_store(mut self, store: Arc<dyn QueueStore>) -> Self {
        self.queue_store = store;
        self
    }

    #[must_use]
    pub fn ledger_store(mut self, store: Arc<dyn LedgerStore>) -> Self {
        self.ledger_store = store;
        self
    }

    #[must_use]
    pub fn baseline_store(mut self, store: Arc<dyn BaselineStore>) -> Self {
        self.baseline_store = store;
        self
    }

    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn SignalTransport>) -> Self {
        self.transport = transport;
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

/// Facade over the encrypted sync subsystem for one device.
///
/// Always handed out as `Arc<BudgetSync>`: background tasks hold weak
/// references back to it.
pub struct BudgetSync {
    pub(super) config: BudgetSyncConfig,
    /// Fingerprint of `config.device_info`
    pub(super) device_id: String,
    pub(super) local: Arc<dyn RecordStore>,
    pub(super) cloud: Arc<dyn CloudStore>,
    pub(super) executor: Arc<dyn RequestExecutor>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) events: EventBus,
    pub(super) queue: Arc<OfflineQueue>,
    pub(super) ledger: Arc<HistoryLedger>,
    pub(super) baseline_store: Arc<dyn BaselineStore>,
    pub(super) signaling: SignalingChannel,
    pub(super) circuits: CloudCircuits,
    pub(super) session: RwLock<Option<Arc<Session>>>,
    /// Serializes unlock/lock
    pub(super) session_lock: tokio::sync::Mutex<()>,
    pub(super) state: watch::Sender<EngineState>,
    pub(super) shutdown: watch::Sender<bool>,
    pub(super) tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BudgetSync {
    /// Wire the components. Nothing runs until [`start()`](Self::start).
    pub fn new(config: BudgetSyncConfig, backends: SyncBackends) -> Arc<Self> {
        let events = EventBus::default();
        let queue = Arc::new(OfflineQueue::new(
            backends.queue_store,
            backends.executor.clone(),
            backends.clock.clone(),
            events.clone(),
            config.queue.clone(),
        ));
        let ledger = Arc::new(HistoryLedger::new(
            backends.ledger_store,
            backends.clock.clone(),
            config.default_author.clone(),
        ));
        let signaling = SignalingChannel::new(
            backends.transport,
            config.signaling.clone(),
            backends.clock.clone(),
            events.clone(),
        );
        let (state, _) = watch::channel(EngineState::Created);
        let (shutdown, _) = watch::channel(false);

        Arc::new(Self {
            device_id: crypto::generate_device_fingerprint(&config.device_info),
            config,
            local: backends.local,
            cloud: backends.cloud,
            executor: backends.executor,
            clock: backends.clock,
            events,
            queue,
            ledger,
            baseline_store: backends.baseline_store,
            signaling,
            circuits: CloudCircuits::new(),
            session: RwLock::new(None),
            session_lock: tokio::sync::Mutex::new(()),
            state,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        })
    }

    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state.subscribe()
    }

    #[must_use]
    pub fn config(&self) -> &BudgetSyncConfig {
        &self.config
    }

    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    #[must_use]
    pub fn queue(&self) -> &Arc<OfflineQueue> {
        &self.queue
    }

    #[must_use]
    pub fn ledger(&self) -> &Arc<HistoryLedger> {
        &self.ledger
    }

    #[must_use]
    pub fn signaling(&self) -> &SignalingChannel {
        &self.signaling
    }

    #[must_use]
    pub fn circuits(&self) -> &CloudCircuits {
        &self.circuits
    }

    #[must_use]
    pub fn is_unlocked(&self) -> bool {
        self.session.read().is_some()
    }

    /// Budget id of the unlocked session.
    #[must_use]
    pub fn budget_id(&self) -> Option<String> {
        self.session.read().as_ref().map(|s| s.budget_id.clone())
    }

    pub(super) fn current_session(&self) -> Result<Arc<Session>, SyncError> {
        self.session.read().clone().ok_or(SyncError::Locked)
    }
}
