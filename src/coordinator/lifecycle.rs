// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine lifecycle: start, shutdown, unlock and lock.
//!
//! Engine-wide tasks (queue drain, delivery listener, signal listener) live
//! from `start()` to `shutdown()`. Session tasks (health probe, signaling
//! connection) live from `unlock()` to `lock()` and only run while the
//! engine is `Running`.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, trace, warn};
use zeroize::Zeroizing;

use super::session::Session;
use super::{BudgetSync, EngineState};
use crate::crypto;
use crate::error::SyncError;
use crate::events::SyncEvent;
use crate::health::{HealthMonitor, Recovery};
use crate::signaling::SignalMessage;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

impl BudgetSync {
    /// Start the background tasks.
    ///
    /// Startup flow:
    /// 1. Recover queue state left by a previous process
    /// 2. Spawn the queue drain loop
    /// 3. Spawn the delivery listener (signals peers after queued deliveries)
    /// 4. Spawn the inbound signal listener (pulls on change notices)
    /// 5. Running; start session tasks if already unlocked
    ///
    /// Calling `start()` on an engine that is not `Created` is a no-op.
    #[instrument(skip(self))]
    pub async fn start(self: &Arc<Self>) -> Result<(), SyncError> {
        if self.state() != EngineState::Created {
            warn!(state = %self.state(), "start() ignored");
            return Ok(());
        }
        let started = Instant::now();
        info!(device = %self.device_id, "Starting budget sync...");

        let reset = self.queue.initialize().await?;
        let status = self.queue.status().await?;
        info!(
            pending = status.pending,
            exhausted = status.exhausted,
            reset,
            "Offline queue recovered"
        );

        let tasks = [
            tokio::spawn(Arc::clone(&self.queue).run(self.shutdown.subscribe())),
            self.spawn_delivery_listener(),
            self.spawn_signal_listener(),
        ];
        self.tasks.lock().extend(tasks);

        self.state.send_replace(EngineState::Running);
        let session = self.session.read().clone();
        if let Some(session) = session {
            self.start_session_tasks(&session);
        }

        crate::metrics::record_lifecycle_phase("start", started.elapsed());
        info!("Budget sync running");
        Ok(())
    }

    /// Graceful shutdown. Queued requests stay persisted for the next run.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        if matches!(self.state(), EngineState::ShuttingDown | EngineState::Stopped) {
            return;
        }
        let started = Instant::now();
        info!("Initiating budget sync shutdown...");
        self.state.send_replace(EngineState::ShuttingDown);
        let _ = self.shutdown.send(true);

        let session = self.session.read().clone();
        if let Some(session) = session {
            session.stop().await;
        }
        self.signaling.disconnect().await;

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
                warn!("Background task did not stop in time");
            }
        }

        self.state.send_replace(EngineState::Stopped);
        crate::metrics::record_lifecycle_phase("shutdown", started.elapsed());
        info!("Budget sync shutdown complete");
    }

    // ═══════════════════════════════════════════════════════════════════════
    // SESSION
    // ═══════════════════════════════════════════════════════════════════════

    /// Derive key material and budget id, then open a session.
    ///
    /// Replaces any existing session. Returns the budget id.
    #[instrument(skip_all)]
    pub async fn unlock(self: &Arc<Self>, password: &str, share_code: &str) -> Result<String, SyncError> {
        let _serial = self.session_lock.lock().await;
        let started = Instant::now();

        let password = Zeroizing::new(password.to_string());
        let share_code = Zeroizing::new(share_code.to_string());
        let iterations = self.config.crypto.kdf_iterations;
        let (key, budget_id) = tokio::task::spawn_blocking(move || {
            let salt = crypto::derive_salt(&password);
            let key = crypto::derive_key_with_iterations(&password, &salt, iterations)?;
            let budget_id = crypto::generate_budget_id(&password, &share_code)?;
            Ok::<_, crypto::CryptoError>((key, budget_id))
        })
        .await??;

        let previous = self.session.write().take();
        if let Some(previous) = previous {
            previous.stop().await;
        }

        let monitor = Arc::new(HealthMonitor::new(
            budget_id.clone(),
            self.local.clone(),
            self.cloud.clone(),
            self.queue.clone(),
            key.clone(),
            self.clock.clone(),
            self.events.clone(),
            self.config.health.clone(),
        )
        .with_baseline_store(self.baseline_store.clone()));
        // Must load before the first probe
        if let Err(e) = monitor.load_baseline().await {
            warn!(error = %e, "Known-good baseline unavailable, starting empty");
        }
        let recovery = Arc::new(Recovery::new(
            monitor.clone(),
            self.device_id.clone(),
            self.local.clone(),
            self.cloud.clone(),
            self.queue.clone(),
            key.clone(),
            self.clock.clone(),
            self.events.clone(),
            self.config.crypto.compression_threshold,
        ));
        let session = Arc::new(Session::new(budget_id.clone(), key, monitor, recovery));
        *self.session.write() = Some(session.clone());

        if self.state() == EngineState::Running {
            self.start_session_tasks(&session);
        }

        crate::metrics::record_lifecycle_phase("unlock", started.elapsed());
        info!(
            budget = %crate::health::redact_budget_id(&budget_id),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Session unlocked"
        );
        Ok(budget_id)
    }

    /// Drop key material and stop the session's tasks.
    #[instrument(skip(self))]
    pub async fn lock(&self) {
        let _serial = self.session_lock.lock().await;
        let session = self.session.write().take();
        let Some(session) = session else {
            return;
        };
        session.stop().await;
        self.signaling.disconnect().await;
        info!("Session locked");
    }

    fn start_session_tasks(&self, session: &Arc<Session>) {
        if !session.claim_start() {
            return;
        }
        session.track(tokio::spawn(
            Arc::clone(&session.monitor).run(session.shutdown_receiver()),
        ));
        if let Some(handle) = self.signaling.connect_configured(&session.budget_id) {
            session.hold_signal(handle);
        }
        debug!("Session tasks started");
    }

    // ═══════════════════════════════════════════════════════════════════════
    // LISTENERS
    // ═══════════════════════════════════════════════════════════════════════

    fn spawn_delivery_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let sync = Arc::downgrade(self);
        let mut events = self.events.subscribe();
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    event = events.recv() => match event {
                        Ok(SyncEvent::RequestDelivered { request_id, entity_type: Some(_), .. }) => {
                            let Some(sync) = sync.upgrade() else { break };
                            trace!(%request_id, "Queued mutation delivered");
                            sync.notify_peers();
                        }
                        Ok(SyncEvent::RequestExhausted { request_id, error }) => {
                            warn!(%request_id, error = error.as_deref().unwrap_or("unknown"), "Queued mutation exhausted");
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(n)) => warn!(skipped = n, "Delivery listener lagged"),
                        Err(RecvError::Closed) => break,
                    }
                }
            }
            debug!("Delivery listener stopped");
        })
    }

    fn spawn_signal_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let sync = Arc::downgrade(self);
        let mut signals = self.signaling.subscribe();
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    signal = signals.recv() => match signal {
                        Ok(signal) => {
                            if !on_signal(&sync, signal).await {
                                break;
                            }
                        }
                        Err(RecvError::Lagged(n)) => warn!(skipped = n, "Signal listener lagged"),
                        Err(RecvError::Closed) => break,
                    }
                }
            }
            debug!("Signal listener stopped");
        })
    }
}

/// Pull when another device on the same budget announces a change.
/// Returns `false` once the engine is gone.
async fn on_signal(sync: &Weak<BudgetSync>, signal: SignalMessage) -> bool {
    if !signal.signal_type.is_change_notice() {
        return true;
    }
    let Some(sync) = sync.upgrade() else {
        return false;
    };
    if signal.sender_device() == Some(sync.device_id()) {
        trace!("Ignoring own change notice");
        return true;
    }
    if let (Some(theirs), Some(ours)) = (signal.budget_id.as_deref(), sync.budget_id()) {
        if theirs != ours {
            debug!("Ignoring change notice for another budget");
            return true;
        }
    }

    match sync.pull().await {
        Ok(report) => debug!(applied = report.applied, removed = report.removed, "Pulled after change notice"),
        Err(SyncError::Locked) => debug!("Change notice while locked"),
        Err(e) => warn!(error = %e, "Pull after change notice failed"),
    }
    true
}
