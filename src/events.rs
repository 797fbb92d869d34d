// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Typed event bus.
//!
//! Components publish [`SyncEvent`]s into a `tokio::sync::broadcast`
//! channel; any number of subscribers (UI adapters, the coordinator's own
//! listeners, tests) receive every event published after they subscribed.
//! Publishing with no subscribers is not an error.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

use crate::health::{CorruptionReport, RecoveryResult, SyncHealthStatus};
use crate::signaling::SignalStatus;

const DEFAULT_CAPACITY: usize = 256;

/// Everything observable that happens inside the sync core.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "detail", rename_all = "camelCase")]
pub enum SyncEvent {
    /// Catastrophic divergence between local and cloud data.
    CorruptionDetected(CorruptionReport),
    HealthChanged(SyncHealthStatus),
    ConnectivityChanged { online: bool },
    RequestDelivered {
        request_id: Uuid,
        entity_type: Option<String>,
        entity_id: Option<String>,
    },
    RequestExhausted {
        request_id: Uuid,
        error: Option<String>,
    },
    SignalStatusChanged(SignalStatus),
    RecoveryCompleted(RecoveryResult),
}

impl SyncEvent {
    /// Stable event name for host-side dispatch.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::CorruptionDetected(_) => "syncCorruptionDetected",
            Self::HealthChanged(_) => "syncHealthChanged",
            Self::ConnectivityChanged { .. } => "connectivityChanged",
            Self::RequestDelivered { .. } => "queueRequestDelivered",
            Self::RequestExhausted { .. } => "queueRequestExhausted",
            Self::SignalStatusChanged(_) => "signalStatusChanged",
            Self::RecoveryCompleted(_) => "syncRecoveryCompleted",
        }
    }
}

/// Cloneable publish handle.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SyncEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: SyncEvent) {
        let name = event.name();
        let receivers = self.tx.send(event).unwrap_or(0);
        trace!(event = name, receivers, "Published sync event");
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
