// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Versioned history ledger.
//!
//! An append-only log of content-addressed commits, each carrying one or
//! more entity changes, plus named branches (movable heads) and tags
//! (fixed labels). Used for audit, diffing, and recovery.
//!
//! ```text
//!   main ──► c3 ──► c2 ──► c1        (parent_hash links)
//!                    ▲
//!   what-if ─────────┘               (branch created from c2)
//!   tag "before-move" ► c1
//! ```
//!
//! A commit hash is SHA-256 over the canonical JSON of its author,
//! timestamp, and normalized changes. Message, parent, and device do not
//! participate, so replaying the same mutation yields the same hash and
//! the ledger returns the existing commit instead of a duplicate.

mod store;
mod types;

pub use store::{LedgerStore, MemoryLedgerStore};
pub use types::{
    BudgetBranch, BudgetChange, BudgetCommit, BudgetTag, ChangeEntry, ChangeInput, ChangePatterns,
    ChangeType, CommitRecord, CommitRequest, DeviceConsistency, DEFAULT_ENTITY_ID, DEFAULT_TAG_TYPE,
};

use chrono::Timelike;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::clock::Clock;
use crate::crypto::{self, CryptoError};
use crate::storage::StorageError;

/// Name of the branch created with the first commit.
pub const DEFAULT_BRANCH: &str = "main";
/// Devices an author may commit from before consistency checks flag a new one.
pub const MAX_DEVICES_PER_AUTHOR: usize = 3;
const DEVICE_HISTORY_WINDOW: usize = 10;

#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("unknown commit: {0}")]
    UnknownCommit(String),

    #[error("unknown branch: {0}")]
    UnknownBranch(String),

    #[error("branch already exists: {0}")]
    BranchExists(String),

    #[error("tag already exists: {0}")]
    TagExists(String),

    #[error("invalid change type: {0}")]
    InvalidChangeType(String),

    #[error("invalid commit: {0}")]
    InvalidCommit(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// The ledger service.
pub struct HistoryLedger {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    default_author: String,
    /// Serializes head reads and head moves.
    write_lock: Mutex<()>,
}

impl HistoryLedger {
    pub fn new(store: Arc<dyn LedgerStore>, clock: Arc<dyn Clock>, default_author: impl Into<String>) -> Self {
        Self {
            store,
            clock,
            default_author: default_author.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Record a commit on the active branch.
    ///
    /// Change types are normalized (`add` → `create`, ...), a missing entity
    /// id becomes `"main"`, a missing author becomes the configured default.
    /// An identical commit (same hash) is returned as-is with `created: false`.
    #[instrument(skip(self, request), fields(changes = request.changes.len()))]
    pub async fn create_commit(&self, request: CommitRequest) -> Result<CommitRecord, HistoryError> {
        if request.changes.is_empty() {
            return Err(HistoryError::InvalidCommit("a commit needs at least one change".into()));
        }

        let author = request
            .author
            .filter(|a| !a.trim().is_empty())
            .unwrap_or_else(|| self.default_author.clone());
        let timestamp = request.timestamp.unwrap_or_else(|| self.clock.now_millis());

        let mut normalized = Vec::with_capacity(request.changes.len());
        for input in &request.changes {
            if input.entity_type.trim().is_empty() {
                return Err(HistoryError::InvalidCommit("entity type is required".into()));
            }
            normalized.push((input, ChangeType::parse(&input.change_type)?));
        }

        let hash = commit_hash(&author, timestamp, &normalized)?;

        let _guard = self.write_lock.lock().await;

        if let Some(existing) = self.store.get_commit(&hash).await? {
            debug!(hash = %hash, "Commit already recorded");
            let changes = self.store.changes_for_commit(&hash).await?;
            return Ok(CommitRecord {
                commit: existing,
                changes,
                created: false,
            });
        }

        let active = self.active_branch_locked().await?;
        let commit = BudgetCommit {
            hash: hash.clone(),
            timestamp,
            message: request.message,
            author: author.clone(),
            parent_hash: active.as_ref().map(|b| b.head_commit_hash.clone()),
            device_fingerprint: request.device_fingerprint,
        };

        let changes: Vec<BudgetChange> = normalized
            .into_iter()
            .enumerate()
            .map(|(index, (input, change_type))| BudgetChange {
                commit_hash: hash.clone(),
                index: index as u32,
                entity_type: input.entity_type.clone(),
                entity_id: entity_id_or_default(input.entity_id.as_deref()),
                change_type,
                description: input.description.clone(),
                before_data: input.before.clone(),
                after_data: input.after.clone(),
            })
            .collect();

        self.store.insert_commit(&commit, &changes).await?;

        match active {
            Some(branch) => self.store.update_branch_head(&branch.name, &hash).await?,
            None => {
                self.store
                    .insert_branch(&BudgetBranch {
                        name: DEFAULT_BRANCH.to_string(),
                        description: Some("Default branch".into()),
                        source_commit_hash: hash.clone(),
                        head_commit_hash: hash.clone(),
                        is_active: true,
                        created_at: timestamp,
                        author: author.clone(),
                    })
                    .await?
            }
        }

        crate::metrics::record_commit(changes.len());
        info!(hash = %short(&hash), changes = changes.len(), "Commit recorded");

        Ok(CommitRecord {
            commit,
            changes,
            created: true,
        })
    }

    /// One commit covering several changes, authored by the default author.
    pub async fn create_commit_batch(
        &self,
        message: impl Into<String>,
        changes: Vec<ChangeInput>,
    ) -> Result<CommitRecord, HistoryError> {
        self.create_commit(CommitRequest {
            message: message.into(),
            changes,
            ..Default::default()
        })
        .await
    }

    async fn active_branch_locked(&self) -> Result<Option<BudgetBranch>, HistoryError> {
        Ok(self.store.list_branches().await?.into_iter().find(|b| b.is_active))
    }

    /// Create a branch whose head and source are `from_commit`.
    ///
    /// Fails with `BranchExists` or `UnknownCommit` without writing anything.
    pub async fn create_branch(
        &self,
        name: &str,
        from_commit: &str,
        description: Option<&str>,
        author: Option<&str>,
    ) -> Result<BudgetBranch, HistoryError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(HistoryError::InvalidCommit("branch name is required".into()));
        }

        let _guard = self.write_lock.lock().await;
        if self.store.get_branch(name).await?.is_some() {
            return Err(HistoryError::BranchExists(name.to_string()));
        }
        if self.store.get_commit(from_commit).await?.is_none() {
            return Err(HistoryError::UnknownCommit(from_commit.to_string()));
        }

        let branch = BudgetBranch {
            name: name.to_string(),
            description: description.map(str::to_string),
            source_commit_hash: from_commit.to_string(),
            head_commit_hash: from_commit.to_string(),
            is_active: false,
            created_at: self.clock.now_millis(),
            author: self.author_or_default(author),
        };
        self.store.insert_branch(&branch).await?;
        info!(branch = %branch.name, from = %short(from_commit), "Branch created");
        Ok(branch)
    }

    /// Make `name` the branch new commits land on.
    pub async fn switch_branch(&self, name: &str) -> Result<BudgetBranch, HistoryError> {
        let _guard = self.write_lock.lock().await;
        let Some(mut branch) = self.store.get_branch(name).await? else {
            return Err(HistoryError::UnknownBranch(name.to_string()));
        };
        self.store.set_active_branch(name).await?;
        branch.is_active = true;
        info!(branch = %name, "Switched branch");
        Ok(branch)
    }

    /// Label `commit_hash`. `tag_type` defaults to `"milestone"`.
    pub async fn create_tag(
        &self,
        name: &str,
        commit_hash: &str,
        description: Option<&str>,
        tag_type: Option<&str>,
        author: Option<&str>,
    ) -> Result<BudgetTag, HistoryError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(HistoryError::InvalidCommit("tag name is required".into()));
        }

        let _guard = self.write_lock.lock().await;
        if self.store.get_tag(name).await?.is_some() {
            return Err(HistoryError::TagExists(name.to_string()));
        }
        if self.store.get_commit(commit_hash).await?.is_none() {
            return Err(HistoryError::UnknownCommit(commit_hash.to_string()));
        }

        let tag = BudgetTag {
            name: name.to_string(),
            description: description.map(str::to_string),
            commit_hash: commit_hash.to_string(),
            tag_type: tag_type.unwrap_or(DEFAULT_TAG_TYPE).to_string(),
            created_at: self.clock.now_millis(),
            author: self.author_or_default(author),
        };
        self.store.insert_tag(&tag).await?;
        info!(tag = %tag.name, commit = %short(commit_hash), "Tag created");
        Ok(tag)
    }

    fn author_or_default(&self, author: Option<&str>) -> String {
        author
            .filter(|a| !a.trim().is_empty())
            .map_or_else(|| self.default_author.clone(), str::to_string)
    }

    pub async fn branches(&self) -> Result<Vec<BudgetBranch>, HistoryError> {
        Ok(self.store.list_branches().await?)
    }

    pub async fn active_branch(&self) -> Result<Option<BudgetBranch>, HistoryError> {
        self.active_branch_locked().await
    }

    pub async fn tags(&self) -> Result<Vec<BudgetTag>, HistoryError> {
        Ok(self.store.list_tags().await?)
    }

    pub async fn get_commit(&self, hash: &str) -> Result<Option<BudgetCommit>, HistoryError> {
        Ok(self.store.get_commit(hash).await?)
    }

    pub async fn changes_for_commit(&self, hash: &str) -> Result<Vec<BudgetChange>, HistoryError> {
        Ok(self.store.changes_for_commit(hash).await?)
    }

    /// Most recent changes across all entities, newest first.
    pub async fn recent_changes(&self, limit: usize) -> Result<Vec<ChangeEntry>, HistoryError> {
        Ok(self.store.change_entries(None, None, Some(limit)).await?)
    }

    /// Every change to one entity, newest first.
    pub async fn entity_history(
        &self,
        entity_type: &str,
        entity_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<ChangeEntry>, HistoryError> {
        Ok(self
            .store
            .change_entries(None, Some((entity_type, entity_id)), limit)
            .await?)
    }

    /// Walk parent links from `from`, newest first.
    pub async fn log(&self, from: &str, limit: usize) -> Result<Vec<BudgetCommit>, HistoryError> {
        let mut commits = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor = Some(from.to_string());

        while let Some(hash) = cursor {
            if commits.len() >= limit || !seen.insert(hash.clone()) {
                break;
            }
            let Some(commit) = self.store.get_commit(&hash).await? else {
                if commits.is_empty() {
                    return Err(HistoryError::UnknownCommit(hash));
                }
                break;
            };
            cursor = commit.parent_hash.clone();
            commits.push(commit);
        }
        Ok(commits)
    }

    /// Changes introduced on `head`'s ancestry since it diverged from `base`, oldest first.
    pub async fn diff(&self, base: &str, head: &str) -> Result<Vec<BudgetChange>, HistoryError> {
        let base_ancestry: HashSet<String> = self
            .log(base, usize::MAX)
            .await?
            .into_iter()
            .map(|c| c.hash)
            .collect();

        let mut introduced = Vec::new();
        for commit in self.log(head, usize::MAX).await? {
            if base_ancestry.contains(&commit.hash) {
                break;
            }
            introduced.push(commit.hash);
        }

        let mut changes = Vec::new();
        for hash in introduced.iter().rev() {
            changes.extend(self.store.changes_for_commit(hash).await?);
        }
        Ok(changes)
    }

    /// Recompute a stored commit's hash. `false` means the row was altered.
    pub async fn verify_commit(&self, hash: &str) -> Result<bool, HistoryError> {
        let Some(commit) = self.store.get_commit(hash).await? else {
            return Err(HistoryError::UnknownCommit(hash.to_string()));
        };
        let changes = self.store.changes_for_commit(hash).await?;
        let recomputed = commit_hash_from_changes(&commit.author, commit.timestamp, &changes)?;
        Ok(recomputed == commit.hash)
    }

    /// Flag commits from a device the author has not used recently when the
    /// author already has [`MAX_DEVICES_PER_AUTHOR`] devices on record.
    pub async fn verify_device_consistency(
        &self,
        author: &str,
        device_fingerprint: &str,
    ) -> Result<DeviceConsistency, HistoryError> {
        let devices: HashSet<String> = self
            .store
            .list_commits(None)
            .await?
            .into_iter()
            .filter(|c| c.author == author)
            .take(DEVICE_HISTORY_WINDOW)
            .filter_map(|c| c.device_fingerprint)
            .collect();

        let known_device = devices.contains(device_fingerprint);
        let consistent = known_device || devices.len() < MAX_DEVICES_PER_AUTHOR;
        Ok(DeviceConsistency {
            consistent,
            known_device,
            distinct_devices: devices.len(),
            max_devices: MAX_DEVICES_PER_AUTHOR,
        })
    }

    /// Aggregate activity over the trailing `range`. Read-only.
    pub async fn change_patterns(&self, range: Duration) -> Result<ChangePatterns, HistoryError> {
        let range_end = self.clock.now_millis();
        let range_start = range_end.saturating_sub(range.as_millis() as i64);

        let commits = self.store.list_commits(Some(range_start)).await?;
        let entries = self.store.change_entries(Some(range_start), None, None).await?;

        let mut patterns = ChangePatterns {
            range_start,
            range_end,
            total_commits: commits.iter().filter(|c| c.timestamp <= range_end).count(),
            ..Default::default()
        };

        let mut hours: BTreeMap<u32, usize> = BTreeMap::new();
        for entry in entries.iter().filter(|e| e.timestamp <= range_end) {
            patterns.total_changes += 1;
            *patterns
                .changes_by_type
                .entry(entry.change.change_type.as_str().to_string())
                .or_default() += 1;
            *patterns
                .changes_by_entity
                .entry(entry.change.entity_type.clone())
                .or_default() += 1;
            *patterns.author_activity.entry(entry.author.clone()).or_default() += 1;

            if let Some(at) = chrono::DateTime::from_timestamp_millis(entry.timestamp) {
                *patterns
                    .daily_activity
                    .entry(at.format("%Y-%m-%d").to_string())
                    .or_default() += 1;
                *hours.entry(at.hour()).or_default() += 1;
            }
        }

        // Earliest hour wins ties
        patterns.most_active_hour = hours
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
            .map(|(hour, _)| *hour);

        let days = (range.as_secs_f64() / 86_400.0).max(1.0);
        patterns.average_changes_per_day = patterns.total_changes as f64 / days;
        Ok(patterns)
    }
}

fn entity_id_or_default(entity_id: Option<&str>) -> String {
    entity_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or(DEFAULT_ENTITY_ID)
        .to_string()
}

fn change_hash_input(
    entity_type: &str,
    entity_id: &str,
    change_type: ChangeType,
    description: Option<&str>,
    before: Option<&Value>,
    after: Option<&Value>,
) -> Value {
    json!({
        "entityType": entity_type,
        "entityId": entity_id,
        "changeType": change_type.as_str(),
        "description": description,
        "beforeData": before,
        "afterData": after,
    })
}

fn hash_of(author: &str, timestamp: i64, changes: Vec<Value>) -> Result<String, CryptoError> {
    crypto::generate_hash(&json!({
        "author": author,
        "timestamp": timestamp,
        "changes": changes,
    }))
}

fn commit_hash(author: &str, timestamp: i64, changes: &[(&ChangeInput, ChangeType)]) -> Result<String, CryptoError> {
    let inputs = changes
        .iter()
        .map(|(input, change_type)| {
            change_hash_input(
                &input.entity_type,
                &entity_id_or_default(input.entity_id.as_deref()),
                *change_type,
                input.description.as_deref(),
                input.before.as_ref(),
                input.after.as_ref(),
            )
        })
        .collect();
    hash_of(author, timestamp, inputs)
}

fn commit_hash_from_changes(author: &str, timestamp: i64, changes: &[BudgetChange]) -> Result<String, CryptoError> {
    let mut ordered: Vec<&BudgetChange> = changes.iter().collect();
    ordered.sort_by_key(|c| c.index);
    let inputs = ordered
        .into_iter()
        .map(|c| {
            change_hash_input(
                &c.entity_type,
                &c.entity_id,
                c.change_type,
                c.description.as_deref(),
                c.before_data.as_ref(),
                c.after_data.as_ref(),
            )
        })
        .collect();
    hash_of(author, timestamp, inputs)
}

fn short(hash: &str) -> &str {
    &hash[..hash.len().min(12)]
}
