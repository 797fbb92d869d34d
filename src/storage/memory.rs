// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory stores.
//!
//! [`MemoryRecordStore`] stands in for the device's local record store.
//! [`MemoryCloudStore`] stands in for the cloud endpoint: it speaks both the
//! [`CloudStore`] API and the queue's [`RequestExecutor`] seam, so replayed
//! requests land in the same documents a direct write would. Its
//! availability toggle makes it the usual target for offline tests.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use super::traits::{
    parse_document_path, CloudDocument, CloudStore, RecordStore, StorageError, StoredRecord,
};
use crate::queue::{ExecutorResponse, HttpMethod, QueuedRequest, RequestError, RequestExecutor};

#[derive(Default)]
pub struct MemoryRecordStore {
    data: DashMap<String, StoredRecord>,
}

impl MemoryRecordStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn get(&self, entity_type: &str, entity_id: &str) -> Result<Option<StoredRecord>, StorageError> {
        let key = super::traits::document_key(entity_type, entity_id);
        Ok(self.data.get(&key).map(|r| r.value().clone()))
    }

    async fn put(&self, record: &StoredRecord) -> Result<(), StorageError> {
        self.data.insert(record.key(), record.clone());
        Ok(())
    }

    async fn delete(&self, entity_type: &str, entity_id: &str) -> Result<bool, StorageError> {
        let key = super::traits::document_key(entity_type, entity_id);
        Ok(self.data.remove(&key).is_some())
    }

    async fn list_by_type(&self, entity_type: &str) -> Result<Vec<StoredRecord>, StorageError> {
        let mut records: Vec<_> = self
            .data
            .iter()
            .filter(|r| r.entity_type == entity_type)
            .map(|r| r.value().clone())
            .collect();
        records.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        Ok(records)
    }

    async fn list_all(&self) -> Result<Vec<StoredRecord>, StorageError> {
        let mut records: Vec<_> = self.data.iter().map(|r| r.value().clone()).collect();
        records.sort_by_key(StoredRecord::key);
        Ok(records)
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.data.clear();
        Ok(())
    }
}

/// In-memory cloud endpoint keyed by `(budget_id, document key)`.
pub struct MemoryCloudStore {
    budgets: DashMap<String, DashMap<String, CloudDocument>>,
    available: AtomicBool,
    requests_served: AtomicU64,
}

impl Default for MemoryCloudStore {
    fn default() -> Self {
        Self {
            budgets: DashMap::new(),
            available: AtomicBool::new(true),
            requests_served: AtomicU64::new(0),
        }
    }
}

impl MemoryCloudStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// While unavailable every call fails as a network error.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    #[must_use]
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    /// Requests handled through the executor seam.
    #[must_use]
    pub fn requests_served(&self) -> u64 {
        self.requests_served.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn document_count(&self, budget_id: &str) -> usize {
        self.budgets.get(budget_id).map_or(0, |docs| docs.len())
    }

    /// Overwrite a stored document without any checks. Used to simulate
    /// tampering or a divergent writer.
    pub fn overwrite(&self, budget_id: &str, document: CloudDocument) {
        self.budgets
            .entry(budget_id.to_string())
            .or_default()
            .insert(document.key(), document);
    }

    fn check_available(&self) -> Result<(), StorageError> {
        if self.is_available() {
            Ok(())
        } else {
            Err(StorageError::Backend("cloud endpoint unreachable".into()))
        }
    }
}

#[async_trait]
impl CloudStore for MemoryCloudStore {
    async fn fetch(&self, budget_id: &str, key: &str) -> Result<Option<CloudDocument>, StorageError> {
        self.check_available()?;
        Ok(self
            .budgets
            .get(budget_id)
            .and_then(|docs| docs.get(key).map(|d| d.value().clone())))
    }

    async fn list(&self, budget_id: &str) -> Result<Vec<CloudDocument>, StorageError> {
        self.check_available()?;
        let mut docs: Vec<CloudDocument> = self
            .budgets
            .get(budget_id)
            .map(|docs| docs.iter().map(|d| d.value().clone()).collect())
            .unwrap_or_default();
        docs.sort_by_key(CloudDocument::key);
        Ok(docs)
    }

    async fn upsert(&self, budget_id: &str, document: &CloudDocument) -> Result<(), StorageError> {
        self.check_available()?;
        let docs = self.budgets.entry(budget_id.to_string()).or_default();
        // Last writer wins by timestamp; a replay of an older write is a no-op
        let stale = docs
            .get(&document.key())
            .is_some_and(|existing| existing.updated_at > document.updated_at);
        if !stale {
            docs.insert(document.key(), document.clone());
        }
        Ok(())
    }

    async fn remove(&self, budget_id: &str, key: &str) -> Result<bool, StorageError> {
        self.check_available()?;
        Ok(self
            .budgets
            .get(budget_id)
            .is_some_and(|docs| docs.remove(key).is_some()))
    }

    async fn clear(&self, budget_id: &str) -> Result<u64, StorageError> {
        self.check_available()?;
        Ok(self
            .budgets
            .remove(budget_id)
            .map_or(0, |(_, docs)| docs.len() as u64))
    }
}

fn to_request_error(err: StorageError) -> RequestError {
    match err {
        StorageError::Backend(msg) => RequestError::Network(msg),
        StorageError::NotFound => RequestError::Status {
            status: 404,
            message: "not found".into(),
        },
        other => RequestError::Invalid(other.to_string()),
    }
}

#[async_trait]
impl RequestExecutor for MemoryCloudStore {
    async fn execute(&self, request: &QueuedRequest) -> Result<ExecutorResponse, RequestError> {
        if !self.is_available() {
            return Err(RequestError::Network("cloud endpoint unreachable".into()));
        }
        let (budget_id, key) = parse_document_path(&request.url)
            .ok_or_else(|| RequestError::Invalid(format!("not a document url: {}", request.url)))?;

        let response = match request.method {
            HttpMethod::Put | HttpMethod::Post | HttpMethod::Patch => {
                let body = request
                    .body
                    .as_deref()
                    .ok_or_else(|| RequestError::Invalid("missing document body".into()))?;
                let document: CloudDocument =
                    serde_json::from_str(body).map_err(|e| RequestError::Invalid(e.to_string()))?;
                if document.key() != key {
                    return Err(RequestError::Status {
                        status: 400,
                        message: format!("document key {} does not match url", document.key()),
                    });
                }
                self.upsert(&budget_id, &document).await.map_err(to_request_error)?;
                ExecutorResponse { status: 200, body: None }
            }
            HttpMethod::Delete => {
                self.remove(&budget_id, &key).await.map_err(to_request_error)?;
                ExecutorResponse { status: 204, body: None }
            }
            HttpMethod::Get => match self.fetch(&budget_id, &key).await.map_err(to_request_error)? {
                Some(document) => ExecutorResponse {
                    status: 200,
                    body: Some(serde_json::to_string(&document).map_err(|e| RequestError::Invalid(e.to_string()))?),
                },
                None => {
                    return Err(RequestError::Status {
                        status: 404,
                        message: "not found".into(),
                    })
                }
            },
        };

        self.requests_served.fetch_add(1, Ordering::Relaxed);
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::EncryptedEnvelope;
    use crate::queue::RequestSpec;
    use crate::storage::document_path;
    use serde_json::json;

    fn doc(id: &str, updated_at: i64) -> CloudDocument {
        CloudDocument {
            entity_type: "bill".into(),
            entity_id: id.into(),
            envelope: EncryptedEnvelope {
                ciphertext: vec![1, 2, 3],
                iv: vec![0; 12],
                metadata: None,
            },
            content_hash: format!("hash-{updated_at}"),
            updated_at,
            device_id: None,
        }
    }

    fn queued(spec: RequestSpec) -> QueuedRequest {
        QueuedRequest::from_spec(spec, 3, 0, 0)
    }

    #[tokio::test]
    async fn test_record_store_crud() {
        let store = MemoryRecordStore::new();
        assert!(store.is_empty());

        store.put(&StoredRecord::new("bill", "rent", json!({"a": 1}), 1)).await.unwrap();
        store.put(&StoredRecord::new("bill", "water", json!({"a": 2}), 1)).await.unwrap();
        store.put(&StoredRecord::new("envelope", "food", json!({}), 1)).await.unwrap();

        assert_eq!(store.len(), 3);
        assert_eq!(store.get("bill", "rent").await.unwrap().unwrap().data, json!({"a": 1}));
        assert_eq!(store.list_by_type("bill").await.unwrap().len(), 2);

        assert!(store.delete("bill", "rent").await.unwrap());
        assert!(!store.delete("bill", "rent").await.unwrap());

        store.clear().await.unwrap();
        assert!(store.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cloud_store_last_writer_wins() {
        let cloud = MemoryCloudStore::new();
        cloud.upsert("b1", &doc("rent", 20)).await.unwrap();
        cloud.upsert("b1", &doc("rent", 10)).await.unwrap();

        let stored = cloud.fetch("b1", "bill:rent").await.unwrap().unwrap();
        assert_eq!(stored.updated_at, 20);
        assert_eq!(cloud.document_count("b1"), 1);
        assert_eq!(cloud.document_count("b2"), 0);
    }

    #[tokio::test]
    async fn test_cloud_store_unavailable() {
        let cloud = MemoryCloudStore::new();
        cloud.set_available(false);
        assert!(matches!(cloud.list("b1").await, Err(StorageError::Backend(_))));

        cloud.set_available(true);
        assert!(cloud.list("b1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_executor_put_and_delete() {
        let cloud = MemoryCloudStore::new();
        let url = document_path("b1", "bill:rent");

        let put = queued(
            RequestSpec::new(HttpMethod::Put, url.clone()).body(serde_json::to_string(&doc("rent", 5)).unwrap()),
        );
        assert_eq!(cloud.execute(&put).await.unwrap().status, 200);
        assert_eq!(cloud.document_count("b1"), 1);

        // Replay is harmless
        cloud.execute(&put).await.unwrap();
        assert_eq!(cloud.document_count("b1"), 1);

        let delete = queued(RequestSpec::new(HttpMethod::Delete, url));
        assert_eq!(cloud.execute(&delete).await.unwrap().status, 204);
        assert_eq!(cloud.document_count("b1"), 0);
        assert_eq!(cloud.requests_served(), 3);
    }

    #[tokio::test]
    async fn test_executor_errors() {
        let cloud = MemoryCloudStore::new();

        let bad_url = queued(RequestSpec::new(HttpMethod::Put, "/nowhere"));
        assert!(matches!(cloud.execute(&bad_url).await, Err(RequestError::Invalid(_))));

        let mismatched = queued(
            RequestSpec::new(HttpMethod::Put, document_path("b1", "bill:water"))
                .body(serde_json::to_string(&doc("rent", 5)).unwrap()),
        );
        let err = cloud.execute(&mismatched).await.unwrap_err();
        assert_eq!(err.status(), Some(400));
        assert!(!err.is_retryable());

        cloud.set_available(false);
        let get = queued(RequestSpec::new(HttpMethod::Get, document_path("b1", "bill:rent")));
        let err = cloud.execute(&get).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
