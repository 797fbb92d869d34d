// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the [`BudgetSync`](super::BudgetSync) facade.

use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::health::SyncHealthStatus;
use crate::history::{ChangeType, HistoryError};
use crate::queue::{QueueStatus, RequestPriority};
use crate::signaling::SignalStatus;
use crate::storage::document_key;

/// Engine lifecycle state.
///
/// ```text
/// Created → Running → ShuttingDown → Stopped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EngineState {
    /// Constructed, background tasks not started
    Created,
    /// Queue drain, health probe and signal listener running
    Running,
    /// Graceful shutdown in progress
    ShuttingDown,
    /// All background tasks stopped
    Stopped,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Running => write!(f, "Running"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MutationKind {
    /// Create or replace the record with this plaintext
    Put(Value),
    Delete,
}

/// One local change to push to the cloud.
///
/// # Example
///
/// ```
/// use budget_sync::{Mutation, RequestPriority};
/// use serde_json::json;
///
/// let mutation = Mutation::put("bill", "rent", json!({"amount": 1450}))
///     .priority(RequestPriority::High)
///     .message("Rent went up")
///     .author("Sam");
/// assert_eq!(mutation.key(), "bill:rent");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    pub entity_type: String,
    pub entity_id: String,
    pub kind: MutationKind,
    pub priority: RequestPriority,
    pub message: Option<String>,
    pub author: Option<String>,
    /// Ledger change type; inferred from the operation when absent
    pub change_type: Option<String>,
}

impl Mutation {
    #[must_use]
    pub fn put(entity_type: impl Into<String>, entity_id: impl Into<String>, data: Value) -> Self {
        Self::new(entity_type, entity_id, MutationKind::Put(data))
    }

    #[must_use]
    pub fn delete(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self::new(entity_type, entity_id, MutationKind::Delete)
    }

    fn new(entity_type: impl Into<String>, entity_id: impl Into<String>, kind: MutationKind) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            kind,
            priority: RequestPriority::Normal,
            message: None,
            author: None,
            change_type: None,
        }
    }

    #[must_use]
    pub fn priority(mut self, priority: RequestPriority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    #[must_use]
    pub fn author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    #[must_use]
    pub fn change_type(mut self, change_type: impl Into<String>) -> Self {
        self.change_type = Some(change_type.into());
        self
    }

    #[must_use]
    pub fn key(&self) -> String {
        document_key(&self.entity_type, &self.entity_id)
    }

    #[must_use]
    pub fn data(&self) -> Option<&Value> {
        match &self.kind {
            MutationKind::Put(data) => Some(data),
            MutationKind::Delete => None,
        }
    }

    pub(crate) fn resolve_change_type(&self, existed: bool) -> Result<ChangeType, HistoryError> {
        if let Some(raw) = &self.change_type {
            return ChangeType::parse(raw);
        }
        Ok(match (&self.kind, existed) {
            (MutationKind::Delete, _) => ChangeType::Delete,
            (MutationKind::Put(_), true) => ChangeType::Update,
            (MutationKind::Put(_), false) => ChangeType::Create,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Delivery {
    /// Delivered directly to the cloud
    Sent,
    /// Persisted in the offline queue for later delivery
    Queued,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitOutcome {
    pub request_id: Uuid,
    pub entity_key: String,
    pub delivery: Delivery,
    /// `None` when the ledger write failed; the mutation itself went through
    pub commit_hash: Option<String>,
}

/// Counts from one [`pull`](super::BudgetSync::pull).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PullReport {
    pub fetched: usize,
    pub applied: usize,
    pub removed: usize,
    pub unchanged: usize,
    pub skipped_pending: usize,
    pub skipped_quarantined: usize,
    /// Local record changed since the last agreed hash; left for the health monitor
    pub conflicted: usize,
    /// Documents that failed to decrypt or verify
    pub failed: usize,
}

/// Everything a status surface needs in one value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOverview {
    pub state: EngineState,
    pub unlocked: bool,
    pub queue: QueueStatus,
    pub signaling: SignalStatus,
    pub health: Option<SyncHealthStatus>,
    pub quarantined: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_engine_state_display() {
        assert_eq!(format!("{}", EngineState::Created), "Created");
        assert_eq!(format!("{}", EngineState::Stopped), "Stopped");
    }

    #[test]
    fn test_change_type_inference() {
        let put = Mutation::put("bill", "rent", json!({}));
        assert_eq!(put.resolve_change_type(false).unwrap(), ChangeType::Create);
        assert_eq!(put.resolve_change_type(true).unwrap(), ChangeType::Update);
        assert_eq!(
            Mutation::delete("bill", "rent").resolve_change_type(true).unwrap(),
            ChangeType::Delete
        );

        let explicit = Mutation::put("bill", "rent", json!({})).change_type("add");
        assert_eq!(explicit.resolve_change_type(true).unwrap(), ChangeType::Create);
        assert!(Mutation::delete("bill", "rent")
            .change_type("explode")
            .resolve_change_type(true)
            .is_err());
    }
}
