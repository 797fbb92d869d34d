// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Persistence seam for the offline queue.
//!
//! The durable implementation is [`SqliteStore`](crate::storage::SqliteStore);
//! [`MemoryQueueStore`] serves tests and sessions that opt out of persistence.

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use super::request::QueuedRequest;
use crate::storage::StorageError;

#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn insert(&self, request: &QueuedRequest) -> Result<(), StorageError>;
    /// Replace the stored copy. Errors with `NotFound` if absent.
    async fn update(&self, request: &QueuedRequest) -> Result<(), StorageError>;
    async fn remove(&self, request_id: &Uuid) -> Result<bool, StorageError>;
    async fn get(&self, request_id: &Uuid) -> Result<Option<QueuedRequest>, StorageError>;
    /// Every stored request, in no particular order.
    async fn list(&self) -> Result<Vec<QueuedRequest>, StorageError>;
    async fn clear(&self) -> Result<u64, StorageError>;
}

#[derive(Default)]
pub struct MemoryQueueStore {
    items: DashMap<Uuid, QueuedRequest>,
}

impl MemoryQueueStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn insert(&self, request: &QueuedRequest) -> Result<(), StorageError> {
        self.items.insert(request.request_id, request.clone());
        Ok(())
    }

    async fn update(&self, request: &QueuedRequest) -> Result<(), StorageError> {
        match self.items.get_mut(&request.request_id) {
            Some(mut entry) => {
                *entry = request.clone();
                Ok(())
            }
            None => Err(StorageError::NotFound),
        }
    }

    async fn remove(&self, request_id: &Uuid) -> Result<bool, StorageError> {
        Ok(self.items.remove(request_id).is_some())
    }

    async fn get(&self, request_id: &Uuid) -> Result<Option<QueuedRequest>, StorageError> {
        Ok(self.items.get(request_id).map(|r| r.value().clone()))
    }

    async fn list(&self) -> Result<Vec<QueuedRequest>, StorageError> {
        Ok(self.items.iter().map(|r| r.value().clone()).collect())
    }

    async fn clear(&self) -> Result<u64, StorageError> {
        let count = self.items.len() as u64;
        self.items.clear();
        Ok(count)
    }
}
