// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-unlock session state: key material and the tasks that need it.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::crypto::KeyMaterial;
use crate::health::{HealthMonitor, Recovery};
use crate::signaling::SignalingHandle;

const STOP_GRACE: Duration = Duration::from_secs(5);

pub(super) struct Session {
    pub(super) budget_id: String,
    pub(super) key: KeyMaterial,
    pub(super) monitor: Arc<HealthMonitor>,
    pub(super) recovery: Arc<Recovery>,
    shutdown: watch::Sender<bool>,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    signal: Mutex<Option<SignalingHandle>>,
}

impl Session {
    pub(super) fn new(budget_id: String, key: KeyMaterial, monitor: Arc<HealthMonitor>, recovery: Arc<Recovery>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            budget_id,
            key,
            monitor,
            recovery,
            shutdown,
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            signal: Mutex::new(None),
        }
    }

    pub(super) fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// `true` for the first caller only; session tasks start once.
    pub(super) fn claim_start(&self) -> bool {
        !self.started.swap(true, Ordering::AcqRel)
    }

    pub(super) fn track(&self, task: JoinHandle<()>) {
        self.tasks.lock().push(task);
    }

    pub(super) fn hold_signal(&self, handle: SignalingHandle) {
        *self.signal.lock() = Some(handle);
    }

    /// Stop the session's tasks and release its signaling claim.
    pub(super) async fn stop(&self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.signal.lock().take() {
            handle.release();
        }

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if tokio::time::timeout(STOP_GRACE, task).await.is_err() {
                warn!("Session task did not stop in time");
            }
        }
        debug!("Session stopped");
    }
}
