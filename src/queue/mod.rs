// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Offline mutation queue.
//!
//! Requests that cannot be delivered immediately are persisted and replayed
//! when connectivity returns. The queue is a durability buffer in front of
//! the cloud endpoint, not a cache: a delivered request is deleted.
//!
//! # Drain order
//!
//! `high` before `normal` before `low`; FIFO by `enqueued_at` inside a tier.
//! Exactly one request is in flight at a time. While an earlier request for
//! an entity waits in backoff, later requests for the same entity wait too,
//! so updates to one entity are never applied out of order.
//!
//! # Triggers
//!
//! ```text
//! periodic tick (drain_interval_ms) ─┐
//! offline → online (+ settle delay) ─┼──► drain()
//! enqueue() while online ────────────┤
//! force_drain() ─────────────────────┘
//! ```
//!
//! Retry readiness is computed from the injected [`Clock`], so tests can
//! step through backoff without sleeping.

mod executor;
mod request;
mod store;

pub use executor::{ExecutorResponse, RequestError, RequestExecutor};
pub use request::{
    HttpMethod, QueuedRequest, RequestPriority, RequestSpec, RequestState, RequestSummary,
    IDEMPOTENCY_HEADER,
};
pub use store::{MemoryQueueStore, QueueStore};

use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::QueueConfig;
use crate::events::{EventBus, SyncEvent};
use crate::resilience::retry::RetryConfig;
use crate::storage::StorageError;

/// Outcome counts for one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainReport {
    pub delivered: usize,
    pub retrying: usize,
    pub exhausted: usize,
    /// Not attempted this pass (backoff, entity ordering, or went offline)
    pub deferred: usize,
    pub skipped_offline: bool,
    pub already_draining: bool,
}

/// Snapshot of queue state for status surfaces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub online: bool,
    pub draining: bool,
    pub pending: usize,
    pub in_flight: usize,
    pub retrying: usize,
    pub exhausted: usize,
    pub total_enqueued: u64,
    pub total_delivered: u64,
    pub total_exhausted: u64,
    pub items: Vec<RequestSummary>,
}

impl QueueStatus {
    /// Requests that will still be attempted.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.pending + self.in_flight + self.retrying
    }
}

enum Delivery {
    Delivered,
    Retrying,
    Exhausted,
}

/// Durable, priority-ordered queue of outbound requests.
pub struct OfflineQueue {
    store: Arc<dyn QueueStore>,
    executor: Arc<dyn RequestExecutor>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    config: QueueConfig,
    retry: RetryConfig,
    online: watch::Sender<bool>,
    draining: AtomicBool,
    sequence: AtomicU64,
    wake: Notify,
    total_enqueued: AtomicU64,
    total_delivered: AtomicU64,
    total_exhausted: AtomicU64,
}

impl OfflineQueue {
    /// Create a queue. Starts offline; call [`set_online`](Self::set_online)
    /// with the platform's connectivity signal.
    pub fn new(
        store: Arc<dyn QueueStore>,
        executor: Arc<dyn RequestExecutor>,
        clock: Arc<dyn Clock>,
        events: EventBus,
        config: QueueConfig,
    ) -> Self {
        let (online, _) = watch::channel(false);
        Self {
            store,
            executor,
            clock,
            events,
            retry: config.retry_config(),
            config,
            online,
            draining: AtomicBool::new(false),
            sequence: AtomicU64::new(0),
            wake: Notify::new(),
            total_enqueued: AtomicU64::new(0),
            total_delivered: AtomicU64::new(0),
            total_exhausted: AtomicU64::new(0),
        }
    }

    /// Recover state left by a previous process.
    ///
    /// Requests stuck `InFlight` (the process died mid-send) go back to
    /// `Pending`. Returns how many were reset.
    pub async fn initialize(&self) -> Result<usize, StorageError> {
        let items = self.store.list().await?;
        let next_sequence = items.iter().map(|r| r.sequence + 1).max().unwrap_or(0);
        self.sequence.fetch_max(next_sequence, Ordering::AcqRel);

        let mut reset = 0;
        for mut item in items.into_iter().filter(|r| r.state == RequestState::InFlight) {
            item.state = RequestState::Pending;
            self.store.update(&item).await?;
            reset += 1;
        }
        if reset > 0 {
            warn!(reset, "Reset requests left in flight by a previous run");
        }
        self.refresh_gauges().await;
        Ok(reset)
    }

    /// Persist a request and return its id.
    #[instrument(skip(self, spec), fields(method = %spec.method, priority = %spec.priority))]
    pub async fn enqueue(&self, spec: RequestSpec) -> Result<Uuid, StorageError> {
        let sequence = self.sequence.fetch_add(1, Ordering::AcqRel);
        let request = QueuedRequest::from_spec(spec, self.config.max_retries, self.clock.now_millis(), sequence);
        self.store.insert(&request).await?;

        self.total_enqueued.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_enqueued(request.priority.as_str());
        debug!(request_id = %request.request_id, "Request queued");

        if self.is_online() {
            self.wake.notify_one();
        }
        Ok(request.request_id)
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    /// Feed the platform connectivity signal. Transitions publish
    /// [`SyncEvent::ConnectivityChanged`]; going online schedules a drain.
    pub fn set_online(&self, online: bool) {
        let changed = self.online.send_if_modified(|current| {
            if *current == online {
                return false;
            }
            *current = online;
            true
        });
        if changed {
            info!(online, "Connectivity changed");
            crate::metrics::set_online(online);
            self.events.publish(SyncEvent::ConnectivityChanged { online });
        }
    }

    #[must_use]
    pub fn online_receiver(&self) -> watch::Receiver<bool> {
        self.online.subscribe()
    }

    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Drain now instead of waiting for the next trigger.
    pub async fn force_drain(&self) -> Result<DrainReport, StorageError> {
        self.drain().await
    }

    /// One pass over every eligible request, in drain order.
    pub async fn drain(&self) -> Result<DrainReport, StorageError> {
        let mut report = DrainReport::default();
        if !self.is_online() {
            report.skipped_offline = true;
            return Ok(report);
        }
        if self.draining.swap(true, Ordering::AcqRel) {
            report.already_draining = true;
            return Ok(report);
        }
        let _guard = DrainGuard(&self.draining);

        let mut items: Vec<QueuedRequest> = self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|r| !r.is_exhausted())
            .collect();
        items.sort_by(QueuedRequest::drain_order);

        if !items.is_empty() {
            debug!(candidates = items.len(), "Starting queue drain");
        }

        let now = self.clock.now_millis();
        let mut blocked: HashSet<String> = HashSet::new();

        for mut item in items {
            let entity = item.entity_key();
            let entity_blocked = entity.as_ref().is_some_and(|k| blocked.contains(k));

            if !self.is_online() || entity_blocked || !item.is_ready(now) {
                if let Some(key) = entity {
                    blocked.insert(key);
                }
                report.deferred += 1;
                continue;
            }

            match self.deliver(&mut item).await? {
                Delivery::Delivered => report.delivered += 1,
                Delivery::Retrying => {
                    if let Some(key) = entity {
                        blocked.insert(key);
                    }
                    report.retrying += 1;
                }
                Delivery::Exhausted => report.exhausted += 1,
            }
        }

        if report.delivered + report.retrying + report.exhausted > 0 {
            info!(
                delivered = report.delivered,
                retrying = report.retrying,
                exhausted = report.exhausted,
                deferred = report.deferred,
                "Queue drain complete"
            );
        }
        self.refresh_gauges().await;
        Ok(report)
    }

    async fn deliver(&self, item: &mut QueuedRequest) -> Result<Delivery, StorageError> {
        let started = self.clock.now_millis();
        item.state = RequestState::InFlight;
        item.last_attempt_at = Some(started);
        self.store.update(item).await?;

        let timeout = Duration::from_millis(self.config.request_timeout_ms);
        let result = tokio::time::timeout(timeout, self.executor.execute(item))
            .await
            .unwrap_or(Err(RequestError::Timeout));

        match result {
            Ok(response) => {
                self.store.remove(&item.request_id).await?;
                self.total_delivered.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_delivery("delivered");
                debug!(request_id = %item.request_id, status = response.status, "Request delivered");
                self.events.publish(SyncEvent::RequestDelivered {
                    request_id: item.request_id,
                    entity_type: item.entity_type.clone(),
                    entity_id: item.entity_id.clone(),
                });
                Ok(Delivery::Delivered)
            }
            Err(err) => {
                item.attempt += 1;
                item.last_error = Some(err.to_string());

                if !err.is_retryable() || item.attempt > item.max_retries {
                    item.state = RequestState::Exhausted;
                    item.next_retry_at = None;
                    self.store.update(item).await?;
                    self.total_exhausted.fetch_add(1, Ordering::Relaxed);
                    crate::metrics::record_delivery("exhausted");
                    warn!(
                        request_id = %item.request_id,
                        attempt = item.attempt,
                        retryable = err.is_retryable(),
                        error = %err,
                        "Request exhausted"
                    );
                    self.events.publish(SyncEvent::RequestExhausted {
                        request_id: item.request_id,
                        error: item.last_error.clone(),
                    });
                    return Ok(Delivery::Exhausted);
                }

                let delay = self.retry.delay_for_attempt(item.attempt - 1);
                let now = self.clock.now_millis();
                item.state = RequestState::Retrying;
                item.next_retry_at = Some(now.saturating_add(delay.as_millis() as i64));
                self.store.update(item).await?;
                crate::metrics::record_delivery("retrying");
                debug!(
                    request_id = %item.request_id,
                    attempt = item.attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Request scheduled for retry"
                );
                Ok(Delivery::Retrying)
            }
        }
    }

    pub async fn get(&self, request_id: &Uuid) -> Result<Option<QueuedRequest>, StorageError> {
        self.store.get(request_id).await
    }

    /// Requests still to be attempted, in drain order.
    pub async fn pending(&self) -> Result<Vec<QueuedRequest>, StorageError> {
        let mut items: Vec<_> = self.store.list().await?.into_iter().filter(|r| !r.is_exhausted()).collect();
        items.sort_by(QueuedRequest::drain_order);
        Ok(items)
    }

    /// Dead-lettered requests, oldest first.
    pub async fn exhausted(&self) -> Result<Vec<QueuedRequest>, StorageError> {
        let mut items: Vec<_> = self.store.list().await?.into_iter().filter(QueuedRequest::is_exhausted).collect();
        items.sort_by(QueuedRequest::drain_order);
        Ok(items)
    }

    /// Document keys of entities with undelivered mutations.
    pub async fn pending_entity_keys(&self) -> Result<HashSet<String>, StorageError> {
        Ok(self
            .store
            .list()
            .await?
            .iter()
            .filter(|r| !r.is_exhausted())
            .filter_map(QueuedRequest::entity_key)
            .collect())
    }

    /// Delete one exhausted request after the user has seen it.
    pub async fn acknowledge(&self, request_id: &Uuid) -> Result<bool, StorageError> {
        match self.store.get(request_id).await? {
            Some(item) if item.is_exhausted() => {
                let removed = self.store.remove(request_id).await?;
                self.refresh_gauges().await;
                Ok(removed)
            }
            _ => Ok(false),
        }
    }

    pub async fn clear_exhausted(&self) -> Result<usize, StorageError> {
        let mut removed = 0;
        for item in self.exhausted().await? {
            if self.store.remove(&item.request_id).await? {
                removed += 1;
            }
        }
        self.refresh_gauges().await;
        Ok(removed)
    }

    /// Give an exhausted request a fresh retry budget.
    pub async fn retry_exhausted(&self, request_id: &Uuid) -> Result<bool, StorageError> {
        let Some(mut item) = self.store.get(request_id).await? else {
            return Ok(false);
        };
        if !item.is_exhausted() {
            return Ok(false);
        }
        item.state = RequestState::Pending;
        item.attempt = 0;
        item.next_retry_at = None;
        item.last_error = None;
        self.store.update(&item).await?;
        info!(request_id = %request_id, "Exhausted request re-queued");
        if self.is_online() {
            self.wake.notify_one();
        }
        Ok(true)
    }

    pub async fn clear_all(&self) -> Result<u64, StorageError> {
        let removed = self.store.clear().await?;
        warn!(removed, "Offline queue cleared");
        self.refresh_gauges().await;
        Ok(removed)
    }

    pub async fn status(&self) -> Result<QueueStatus, StorageError> {
        let mut items = self.store.list().await?;
        items.sort_by(QueuedRequest::drain_order);

        let count = |state: RequestState| items.iter().filter(|r| r.state == state).count();
        Ok(QueueStatus {
            online: self.is_online(),
            draining: self.is_draining(),
            pending: count(RequestState::Pending),
            in_flight: count(RequestState::InFlight),
            retrying: count(RequestState::Retrying),
            exhausted: count(RequestState::Exhausted),
            total_enqueued: self.total_enqueued.load(Ordering::Relaxed),
            total_delivered: self.total_delivered.load(Ordering::Relaxed),
            total_exhausted: self.total_exhausted.load(Ordering::Relaxed),
            items: items.iter().map(QueuedRequest::summary).collect(),
        })
    }

    async fn refresh_gauges(&self) {
        if let Ok(items) = self.store.list().await {
            for state in [
                RequestState::Pending,
                RequestState::InFlight,
                RequestState::Retrying,
                RequestState::Exhausted,
            ] {
                let count = items.iter().filter(|r| r.state == state).count();
                crate::metrics::set_queue_depth(state.as_str(), count);
            }
        }
    }

    /// Background drain loop. Runs until `shutdown` flips to `true`.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_millis(self.config.drain_interval_ms.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut online_rx = self.online.subscribe();
        let settle = Duration::from_millis(self.config.online_drain_delay_ms);

        info!(interval_ms = self.config.drain_interval_ms, "Offline queue loop started");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                _ = ticker.tick() => {}
                _ = self.wake.notified() => {}
                changed = online_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if !*online_rx.borrow_and_update() {
                        continue;
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(settle) => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }

            if let Err(e) = self.drain().await {
                warn!(error = %e, "Queue drain failed");
            }
        }
        info!("Offline queue loop stopped");
    }
}

/// RAII guard to reset draining flag.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
