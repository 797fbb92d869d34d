// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite persistence for the offline queue, the history ledger and the
//! health baseline.
//!
//! One pool, one file:
//!
//! ```sql
//! CREATE TABLE queued_requests (
//!   request_id  TEXT PRIMARY KEY,
//!   state       TEXT NOT NULL,     -- pending | in_flight | retrying | exhausted
//!   priority    TEXT NOT NULL,
//!   enqueued_at INTEGER NOT NULL,
//!   payload     TEXT NOT NULL      -- full QueuedRequest as JSON
//! );
//! CREATE TABLE ledger_commits  (hash PRIMARY KEY, timestamp, message, author, parent_hash, device_fingerprint);
//! CREATE TABLE ledger_changes  (commit_hash, idx, entity_type, entity_id, change_type, ...);
//! CREATE TABLE ledger_branches (name PRIMARY KEY, ..., is_active);
//! CREATE TABLE ledger_tags     (name PRIMARY KEY, ...);
//! CREATE TABLE known_good      (budget_id, entity_key, content_hash, PRIMARY KEY (budget_id, entity_key));
//! ```
//!
//! Queue rows keep their indexed columns next to the JSON payload so status
//! queries don't need to parse every request. Ledger rows are written once
//! and never rewritten, except branch heads and the active flag.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow, SqliteSynchronous};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use super::traits::StorageError;
use crate::health::{BaselineStore, SnapshotDigest};
use crate::history::{BudgetBranch, BudgetChange, BudgetCommit, BudgetTag, ChangeEntry, ChangeType, LedgerStore};
use crate::queue::{QueueStore, QueuedRequest};
use crate::resilience::retry::{retry, RetryConfig};

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StorageError::NotFound,
            other => StorageError::Backend(other.to_string()),
        }
    }
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS queued_requests (
        request_id TEXT PRIMARY KEY,
        state TEXT NOT NULL,
        priority TEXT NOT NULL,
        enqueued_at INTEGER NOT NULL,
        payload TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_queued_requests_state ON queued_requests (state)",
    r#"
    CREATE TABLE IF NOT EXISTS ledger_commits (
        hash TEXT PRIMARY KEY,
        timestamp INTEGER NOT NULL,
        message TEXT NOT NULL,
        author TEXT NOT NULL,
        parent_hash TEXT,
        device_fingerprint TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_ledger_commits_timestamp ON ledger_commits (timestamp)",
    r#"
    CREATE TABLE IF NOT EXISTS ledger_changes (
        commit_hash TEXT NOT NULL REFERENCES ledger_commits (hash),
        idx INTEGER NOT NULL,
        entity_type TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        change_type TEXT NOT NULL,
        description TEXT,
        before_data TEXT,
        after_data TEXT,
        PRIMARY KEY (commit_hash, idx)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_ledger_changes_entity ON ledger_changes (entity_type, entity_id)",
    r#"
    CREATE TABLE IF NOT EXISTS ledger_branches (
        name TEXT PRIMARY KEY,
        description TEXT,
        source_commit_hash TEXT NOT NULL,
        head_commit_hash TEXT NOT NULL,
        is_active INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        author TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS ledger_tags (
        name TEXT PRIMARY KEY,
        description TEXT,
        commit_hash TEXT NOT NULL,
        tag_type TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        author TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS known_good (
        budget_id TEXT NOT NULL,
        entity_key TEXT NOT NULL,
        content_hash TEXT NOT NULL,
        PRIMARY KEY (budget_id, entity_key)
    )
    "#,
];

/// SQLite-backed [`QueueStore`], [`LedgerStore`] and [`BaselineStore`].
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the database file at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = retry("sqlite_connect", &RetryConfig::startup(), || {
            let options = options.clone();
            async move {
                SqlitePoolOptions::new()
                    .max_connections(4)
                    .acquire_timeout(Duration::from_secs(10))
                    .connect_with(options)
                    .await
            }
        })
        .await?;

        let store = Self { pool };
        store.init_schema().await?;
        info!(path = %path.as_ref().display(), "SQLite store ready");
        Ok(store)
    }

    /// Private in-memory database. Single connection so every query sees the same data.
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    #[must_use]
    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn json_column(value: Option<&Value>) -> Result<Option<String>, StorageError> {
    value.map(serde_json::to_string).transpose().map_err(StorageError::from)
}

fn parse_json_column(raw: Option<String>) -> Result<Option<Value>, StorageError> {
    raw.map(|s| serde_json::from_str(&s)).transpose().map_err(StorageError::from)
}

fn commit_from_row(row: &SqliteRow) -> Result<BudgetCommit, StorageError> {
    Ok(BudgetCommit {
        hash: row.try_get("hash")?,
        timestamp: row.try_get("timestamp")?,
        message: row.try_get("message")?,
        author: row.try_get("author")?,
        parent_hash: row.try_get("parent_hash")?,
        device_fingerprint: row.try_get("device_fingerprint")?,
    })
}

fn change_from_row(row: &SqliteRow) -> Result<BudgetChange, StorageError> {
    let change_type: String = row.try_get("change_type")?;
    let index: i64 = row.try_get("idx")?;
    Ok(BudgetChange {
        commit_hash: row.try_get("commit_hash")?,
        index: u32::try_from(index).map_err(|e| StorageError::Serialization(e.to_string()))?,
        entity_type: row.try_get("entity_type")?,
        entity_id: row.try_get("entity_id")?,
        change_type: ChangeType::parse(&change_type)
            .map_err(|e| StorageError::Serialization(e.to_string()))?,
        description: row.try_get("description")?,
        before_data: parse_json_column(row.try_get("before_data")?)?,
        after_data: parse_json_column(row.try_get("after_data")?)?,
    })
}

fn branch_from_row(row: &SqliteRow) -> Result<BudgetBranch, StorageError> {
    let is_active: i64 = row.try_get("is_active")?;
    Ok(BudgetBranch {
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        source_commit_hash: row.try_get("source_commit_hash")?,
        head_commit_hash: row.try_get("head_commit_hash")?,
        is_active: is_active != 0,
        created_at: row.try_get("created_at")?,
        author: row.try_get("author")?,
    })
}

fn tag_from_row(row: &SqliteRow) -> Result<BudgetTag, StorageError> {
    Ok(BudgetTag {
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        commit_hash: row.try_get("commit_hash")?,
        tag_type: row.try_get("tag_type")?,
        created_at: row.try_get("created_at")?,
        author: row.try_get("author")?,
    })
}

// ═══════════════════════════════════════════════════════════════════════════
// Queue
// ═══════════════════════════════════════════════════════════════════════════

#[async_trait]
impl QueueStore for SqliteStore {
    async fn insert(&self, request: &QueuedRequest) -> Result<(), StorageError> {
        let payload = serde_json::to_string(request)?;
        sqlx::query(
            "INSERT INTO queued_requests (request_id, state, priority, enqueued_at, payload) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(request.request_id.to_string())
        .bind(request.state.as_str())
        .bind(request.priority.as_str())
        .bind(request.enqueued_at)
        .bind(payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update(&self, request: &QueuedRequest) -> Result<(), StorageError> {
        let payload = serde_json::to_string(request)?;
        let result = sqlx::query(
            "UPDATE queued_requests SET state = ?2, priority = ?3, enqueued_at = ?4, payload = ?5 WHERE request_id = ?1",
        )
        .bind(request.request_id.to_string())
        .bind(request.state.as_str())
        .bind(request.priority.as_str())
        .bind(request.enqueued_at)
        .bind(payload)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }

    async fn remove(&self, request_id: &Uuid) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM queued_requests WHERE request_id = ?1")
            .bind(request_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get(&self, request_id: &Uuid) -> Result<Option<QueuedRequest>, StorageError> {
        let row = sqlx::query("SELECT payload FROM queued_requests WHERE request_id = ?1")
            .bind(request_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| {
            let payload: String = r.try_get("payload")?;
            Ok(serde_json::from_str(&payload)?)
        })
        .transpose()
    }

    async fn list(&self) -> Result<Vec<QueuedRequest>, StorageError> {
        let rows = sqlx::query("SELECT payload FROM queued_requests ORDER BY enqueued_at")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| {
                let payload: String = r.try_get("payload")?;
                Ok(serde_json::from_str(&payload)?)
            })
            .collect()
    }

    async fn clear(&self) -> Result<u64, StorageError> {
        let result = sqlx::query("DELETE FROM queued_requests").execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Ledger
// ═══════════════════════════════════════════════════════════════════════════

#[async_trait]
impl LedgerStore for SqliteStore {
    async fn insert_commit(&self, commit: &BudgetCommit, changes: &[BudgetChange]) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO ledger_commits (hash, timestamp, message, author, parent_hash, device_fingerprint) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(&commit.hash)
        .bind(commit.timestamp)
        .bind(&commit.message)
        .bind(&commit.author)
        .bind(commit.parent_hash.as_deref())
        .bind(commit.device_fingerprint.as_deref())
        .execute(&mut *tx)
        .await?;

        for change in changes {
            sqlx::query(
                "INSERT INTO ledger_changes \
                 (commit_hash, idx, entity_type, entity_id, change_type, description, before_data, after_data) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )
            .bind(&change.commit_hash)
            .bind(i64::from(change.index))
            .bind(&change.entity_type)
            .bind(&change.entity_id)
            .bind(change.change_type.as_str())
            .bind(change.description.as_deref())
            .bind(json_column(change.before_data.as_ref())?)
            .bind(json_column(change.after_data.as_ref())?)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_commit(&self, hash: &str) -> Result<Option<BudgetCommit>, StorageError> {
        let row = sqlx::query("SELECT * FROM ledger_commits WHERE hash = ?1")
            .bind(hash)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(commit_from_row).transpose()
    }

    async fn list_commits(&self, since: Option<i64>) -> Result<Vec<BudgetCommit>, StorageError> {
        let rows = sqlx::query(
            "SELECT * FROM ledger_commits WHERE (?1 IS NULL OR timestamp >= ?1) ORDER BY timestamp DESC, hash DESC",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(commit_from_row).collect()
    }

    async fn changes_for_commit(&self, hash: &str) -> Result<Vec<BudgetChange>, StorageError> {
        let rows = sqlx::query("SELECT * FROM ledger_changes WHERE commit_hash = ?1 ORDER BY idx")
            .bind(hash)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(change_from_row).collect()
    }

    async fn change_entries(
        &self,
        since: Option<i64>,
        entity: Option<(&str, &str)>,
        limit: Option<usize>,
    ) -> Result<Vec<ChangeEntry>, StorageError> {
        let (entity_type, entity_id) = entity.unzip();
        // LIMIT -1 is unbounded in SQLite
        let limit = limit.map_or(-1, |l| i64::try_from(l).unwrap_or(i64::MAX));

        let rows = sqlx::query(
            "SELECT ch.*, c.timestamp AS commit_timestamp, c.author AS commit_author, c.message AS commit_message \
             FROM ledger_changes ch JOIN ledger_commits c ON ch.commit_hash = c.hash \
             WHERE (?1 IS NULL OR c.timestamp >= ?1) \
               AND (?2 IS NULL OR (ch.entity_type = ?2 AND ch.entity_id = ?3)) \
             ORDER BY c.timestamp DESC, c.hash DESC, ch.idx ASC \
             LIMIT ?4",
        )
        .bind(since)
        .bind(entity_type)
        .bind(entity_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(ChangeEntry {
                    change: change_from_row(row)?,
                    timestamp: row.try_get("commit_timestamp")?,
                    author: row.try_get("commit_author")?,
                    message: row.try_get("commit_message")?,
                })
            })
            .collect()
    }

    async fn insert_branch(&self, branch: &BudgetBranch) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO ledger_branches \
             (name, description, source_commit_hash, head_commit_hash, is_active, created_at, author) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(&branch.name)
        .bind(branch.description.as_deref())
        .bind(&branch.source_commit_hash)
        .bind(&branch.head_commit_hash)
        .bind(i64::from(branch.is_active))
        .bind(branch.created_at)
        .bind(&branch.author)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_branch(&self, name: &str) -> Result<Option<BudgetBranch>, StorageError> {
        let row = sqlx::query("SELECT * FROM ledger_branches WHERE name = ?1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(branch_from_row).transpose()
    }

    async fn list_branches(&self) -> Result<Vec<BudgetBranch>, StorageError> {
        let rows = sqlx::query("SELECT * FROM ledger_branches ORDER BY created_at, rowid")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(branch_from_row).collect()
    }

    async fn update_branch_head(&self, name: &str, head: &str) -> Result<(), StorageError> {
        let result = sqlx::query("UPDATE ledger_branches SET head_commit_hash = ?2 WHERE name = ?1")
            .bind(name)
            .bind(head)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }

    async fn set_active_branch(&self, name: &str) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;
        let exists = sqlx::query("SELECT 1 FROM ledger_branches WHERE name = ?1")
            .bind(name)
            .fetch_optional(&mut *tx)
            .await?
            .is_some();
        if !exists {
            return Err(StorageError::NotFound);
        }
        sqlx::query("UPDATE ledger_branches SET is_active = CASE WHEN name = ?1 THEN 1 ELSE 0 END")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn insert_tag(&self, tag: &BudgetTag) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO ledger_tags (name, description, commit_hash, tag_type, created_at, author) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(&tag.name)
        .bind(tag.description.as_deref())
        .bind(&tag.commit_hash)
        .bind(&tag.tag_type)
        .bind(tag.created_at)
        .bind(&tag.author)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_tag(&self, name: &str) -> Result<Option<BudgetTag>, StorageError> {
        let row = sqlx::query("SELECT * FROM ledger_tags WHERE name = ?1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(tag_from_row).transpose()
    }

    async fn list_tags(&self) -> Result<Vec<BudgetTag>, StorageError> {
        let rows = sqlx::query("SELECT * FROM ledger_tags ORDER BY created_at DESC, rowid DESC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(tag_from_row).collect()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Baseline
// ═══════════════════════════════════════════════════════════════════════════

#[async_trait]
impl BaselineStore for SqliteStore {
    async fn load_baseline(&self, budget_id: &str) -> Result<SnapshotDigest, StorageError> {
        let rows = sqlx::query("SELECT entity_key, content_hash FROM known_good WHERE budget_id = ?1")
            .bind(budget_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| -> Result<(String, String), StorageError> {
                Ok((row.try_get("entity_key")?, row.try_get("content_hash")?))
            })
            .collect()
    }

    async fn save_baseline(&self, budget_id: &str, baseline: &SnapshotDigest) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM known_good WHERE budget_id = ?1")
            .bind(budget_id)
            .execute(&mut *tx)
            .await?;
        for (key, hash) in baseline.iter() {
            sqlx::query("INSERT INTO known_good (budget_id, entity_key, content_hash) VALUES (?1, ?2, ?3)")
                .bind(budget_id)
                .bind(key)
                .bind(hash)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}
