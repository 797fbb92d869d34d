// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Storage seams.
//!
//! - [`RecordStore`]: the device's local plaintext record store
//! - [`CloudStore`]: the remote document endpoint holding encrypted envelopes
//!
//! Both are external collaborators; this crate ships in-memory and HTTP
//! implementations and never owns a local schema for budget records.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::crypto::{self, CryptoError, EncryptedEnvelope, KeyMaterial};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Item not found")]
    NotFound,
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Data corruption detected for '{id}': expected hash {expected}, got {actual}")]
    Corruption {
        id: String,
        expected: String,
        actual: String,
    },
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// `"<entity_type>:<entity_id>"`, the key shared by local records and cloud documents.
#[must_use]
pub fn document_key(entity_type: &str, entity_id: &str) -> String {
    format!("{entity_type}:{entity_id}")
}

/// Inverse of [`document_key`].
#[must_use]
pub fn split_document_key(key: &str) -> Option<(&str, &str)> {
    key.split_once(':')
        .filter(|(ty, id)| !ty.is_empty() && !id.is_empty())
}

/// A plaintext budget record in the local store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredRecord {
    pub entity_type: String,
    pub entity_id: String,
    pub data: Value,
    pub updated_at: i64,
}

impl StoredRecord {
    #[must_use]
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>, data: Value, updated_at: i64) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            data,
            updated_at,
        }
    }

    #[must_use]
    pub fn key(&self) -> String {
        document_key(&self.entity_type, &self.entity_id)
    }
}

/// An encrypted budget document as stored in the cloud.
///
/// `content_hash` is [`generate_hash`](crate::crypto::generate_hash) of the
/// plaintext, letting health checks compare local and cloud state without
/// decrypting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudDocument {
    pub entity_type: String,
    pub entity_id: String,
    pub envelope: EncryptedEnvelope,
    pub content_hash: String,
    pub updated_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

impl CloudDocument {
    /// Encrypt a local record for upload.
    pub fn seal(
        record: &StoredRecord,
        key: &KeyMaterial,
        compression_threshold: usize,
        device_id: Option<String>,
    ) -> Result<Self, CryptoError> {
        Ok(Self {
            entity_type: record.entity_type.clone(),
            entity_id: record.entity_id.clone(),
            envelope: crypto::encrypt_optimized(&record.data, key, compression_threshold)?,
            content_hash: crypto::generate_hash(&record.data)?,
            updated_at: record.updated_at,
            device_id,
        })
    }

    /// Decrypt and check the plaintext against `content_hash`.
    pub fn open(&self, key: &KeyMaterial) -> Result<Value, CryptoError> {
        let data: Value = crypto::decrypt_optimized(&self.envelope, key)?;
        crypto::verify_hash(&data, &self.content_hash)?;
        Ok(data)
    }

    /// [`open`](Self::open) into a local record.
    pub fn open_record(&self, key: &KeyMaterial) -> Result<StoredRecord, CryptoError> {
        Ok(StoredRecord::new(
            self.entity_type.clone(),
            self.entity_id.clone(),
            self.open(key)?,
            self.updated_at,
        ))
    }

    #[must_use]
    pub fn key(&self) -> String {
        document_key(&self.entity_type, &self.entity_id)
    }
}

/// Local plaintext record store.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, entity_type: &str, entity_id: &str) -> Result<Option<StoredRecord>, StorageError>;
    async fn put(&self, record: &StoredRecord) -> Result<(), StorageError>;
    /// Returns whether a record was removed.
    async fn delete(&self, entity_type: &str, entity_id: &str) -> Result<bool, StorageError>;
    async fn list_by_type(&self, entity_type: &str) -> Result<Vec<StoredRecord>, StorageError>;
    async fn list_all(&self) -> Result<Vec<StoredRecord>, StorageError>;
    async fn clear(&self) -> Result<(), StorageError>;
}

/// Remote store of encrypted documents, partitioned by budget id.
#[async_trait]
pub trait CloudStore: Send + Sync {
    async fn fetch(&self, budget_id: &str, key: &str) -> Result<Option<CloudDocument>, StorageError>;
    async fn list(&self, budget_id: &str) -> Result<Vec<CloudDocument>, StorageError>;
    async fn upsert(&self, budget_id: &str, document: &CloudDocument) -> Result<(), StorageError>;
    /// Returns whether a document was removed.
    async fn remove(&self, budget_id: &str, key: &str) -> Result<bool, StorageError>;
    /// Delete every document for the budget. Returns the number removed.
    async fn clear(&self, budget_id: &str) -> Result<u64, StorageError>;

    /// Write several documents. Default implementation is sequential.
    async fn upsert_batch(&self, budget_id: &str, documents: &[CloudDocument]) -> Result<usize, StorageError> {
        for document in documents {
            self.upsert(budget_id, document).await?;
        }
        Ok(documents.len())
    }
}

/// `/budgets/<budget_id>/documents/<key>`
#[must_use]
pub fn document_path(budget_id: &str, key: &str) -> String {
    format!("/budgets/{budget_id}/documents/{key}")
}

/// Extract `(budget_id, key)` from a URL or path built with [`document_path`].
#[must_use]
pub fn parse_document_path(url: &str) -> Option<(String, String)> {
    let rest = &url[url.find("/budgets/")? + "/budgets/".len()..];
    let (budget_id, key) = rest.split_once("/documents/")?;
    let key = key.split(['?', '#']).next().unwrap_or(key);
    if budget_id.is_empty() || budget_id.contains('/') || key.is_empty() {
        return None;
    }
    Some((budget_id.to_string(), key.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_key_roundtrip() {
        let key = document_key("envelope", "groceries");
        assert_eq!(key, "envelope:groceries");
        assert_eq!(split_document_key(&key), Some(("envelope", "groceries")));
        assert_eq!(split_document_key("nocolon"), None);
        assert_eq!(split_document_key(":id"), None);
    }

    #[test]
    fn test_seal_and_open() {
        let key = KeyMaterial::from_bytes([3; 32], &[0; 16]);
        let record = StoredRecord::new("bill", "rent", serde_json::json!({"amount": 1450, "due": 1}), 7);
        let doc = CloudDocument::seal(&record, &key, 1024, Some("device-a".into())).unwrap();

        assert_eq!(doc.key(), "bill:rent");
        assert_eq!(doc.updated_at, 7);
        assert_eq!(doc.open_record(&key).unwrap(), record);

        let other = KeyMaterial::from_bytes([4; 32], &[0; 16]);
        assert!(doc.open(&other).unwrap_err().is_decryption());

        let mut forged = doc.clone();
        forged.content_hash = "0".repeat(64);
        assert!(matches!(forged.open(&key), Err(CryptoError::HashMismatch { .. })));
    }

    #[test]
    fn test_parse_document_path() {
        let url = format!("https://api.example.com{}", document_path("budget_ab12", "bill:rent"));
        assert_eq!(
            parse_document_path(&url),
            Some(("budget_ab12".to_string(), "bill:rent".to_string()))
        );
        assert_eq!(
            parse_document_path("/budgets/b1/documents/tx:1?force=true"),
            Some(("b1".to_string(), "tx:1".to_string()))
        );
        assert_eq!(parse_document_path("/budgets/b1/other/tx:1"), None);
        assert_eq!(parse_document_path("/budgets//documents/tx:1"), None);
    }
}
