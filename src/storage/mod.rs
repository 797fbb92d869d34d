// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Storage backends.
//!
//! | Backend | Implements | Use |
//! |---------|------------|-----|
//! | [`MemoryRecordStore`] | [`RecordStore`] | local records in tests and embedders without their own store |
//! | [`MemoryCloudStore`] | [`CloudStore`], [`RequestExecutor`](crate::queue::RequestExecutor) | offline and chaos tests |
//! | [`HttpCloudClient`] | [`CloudStore`], [`RequestExecutor`](crate::queue::RequestExecutor) | the real cloud endpoint |
//! | [`SqliteStore`] | [`QueueStore`](crate::queue::QueueStore), [`LedgerStore`](crate::history::LedgerStore), [`BaselineStore`](crate::health::BaselineStore) | durable queue, history and health baseline |

mod http;
mod memory;
mod sqlite;
mod traits;

pub use http::HttpCloudClient;
pub use memory::{MemoryCloudStore, MemoryRecordStore};
pub use sqlite::SqliteStore;
pub use traits::{
    document_key, document_path, parse_document_path, split_document_key, CloudDocument, CloudStore,
    RecordStore, StorageError, StoredRecord,
};
