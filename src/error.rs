// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Crate-level error taxonomy.
//!
//! Each component has its own `thiserror` enum; [`SyncError`] is what the
//! [`BudgetSync`](crate::BudgetSync) facade returns. Corruption is not an
//! error here: it is published as an event. Recovery failures are returned
//! as a [`RecoveryResult`](crate::health::RecoveryResult).

use thiserror::Error;

use crate::crypto::CryptoError;
use crate::history::HistoryError;
use crate::queue::RequestError;
use crate::storage::StorageError;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    History(#[from] HistoryError),

    /// Transport failure that could not be converted into a queue entry.
    #[error("network error: {0}")]
    Network(String),

    /// The cloud endpoint or local input rejected the mutation.
    #[error("validation error: {0}")]
    Validation(String),

    /// No key material: `unlock()` has not been called.
    #[error("session is locked")]
    Locked,

    /// The entity failed an integrity check and is excluded from sync until recovery.
    #[error("entity '{0}' is quarantined")]
    Quarantined(String),

    #[error("background task failed: {0}")]
    Task(String),
}

impl From<RequestError> for SyncError {
    fn from(err: RequestError) -> Self {
        if err.is_retryable() {
            return SyncError::Network(err.to_string());
        }
        match err {
            RequestError::Invalid(message) => SyncError::Validation(message),
            other => SyncError::Validation(other.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for SyncError {
    fn from(err: tokio::task::JoinError) -> Self {
        SyncError::Task(err.to_string())
    }
}
