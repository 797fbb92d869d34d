// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Persistence seam for the history ledger.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

use super::types::{BudgetBranch, BudgetChange, BudgetCommit, BudgetTag, ChangeEntry};
use crate::storage::StorageError;

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Insert a commit and its changes together.
    async fn insert_commit(&self, commit: &BudgetCommit, changes: &[BudgetChange]) -> Result<(), StorageError>;
    async fn get_commit(&self, hash: &str) -> Result<Option<BudgetCommit>, StorageError>;
    /// Commits with `timestamp >= since`, newest first.
    async fn list_commits(&self, since: Option<i64>) -> Result<Vec<BudgetCommit>, StorageError>;
    async fn changes_for_commit(&self, hash: &str) -> Result<Vec<BudgetChange>, StorageError>;
    /// Changes joined with their commits, newest first.
    async fn change_entries(
        &self,
        since: Option<i64>,
        entity: Option<(&str, &str)>,
        limit: Option<usize>,
    ) -> Result<Vec<ChangeEntry>, StorageError>;

    async fn insert_branch(&self, branch: &BudgetBranch) -> Result<(), StorageError>;
    async fn get_branch(&self, name: &str) -> Result<Option<BudgetBranch>, StorageError>;
    /// Oldest first.
    async fn list_branches(&self) -> Result<Vec<BudgetBranch>, StorageError>;
    async fn update_branch_head(&self, name: &str, head: &str) -> Result<(), StorageError>;
    /// Mark `name` active and every other branch inactive.
    async fn set_active_branch(&self, name: &str) -> Result<(), StorageError>;

    async fn insert_tag(&self, tag: &BudgetTag) -> Result<(), StorageError>;
    async fn get_tag(&self, name: &str) -> Result<Option<BudgetTag>, StorageError>;
    /// Newest first.
    async fn list_tags(&self) -> Result<Vec<BudgetTag>, StorageError>;
}

#[derive(Default)]
struct LedgerData {
    commits: HashMap<String, BudgetCommit>,
    changes: HashMap<String, Vec<BudgetChange>>,
    branches: Vec<BudgetBranch>,
    tags: Vec<BudgetTag>,
}

/// In-memory ledger store.
#[derive(Default)]
pub struct MemoryLedgerStore {
    data: RwLock<LedgerData>,
}

impl MemoryLedgerStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn commit_count(&self) -> usize {
        self.data.read().commits.len()
    }
}

fn newest_first(a: &BudgetCommit, b: &BudgetCommit) -> std::cmp::Ordering {
    b.timestamp.cmp(&a.timestamp).then_with(|| b.hash.cmp(&a.hash))
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn insert_commit(&self, commit: &BudgetCommit, changes: &[BudgetChange]) -> Result<(), StorageError> {
        let mut data = self.data.write();
        if data.commits.contains_key(&commit.hash) {
            return Err(StorageError::Backend(format!("commit {} already exists", commit.hash)));
        }
        data.commits.insert(commit.hash.clone(), commit.clone());
        data.changes.insert(commit.hash.clone(), changes.to_vec());
        Ok(())
    }

    async fn get_commit(&self, hash: &str) -> Result<Option<BudgetCommit>, StorageError> {
        Ok(self.data.read().commits.get(hash).cloned())
    }

    async fn list_commits(&self, since: Option<i64>) -> Result<Vec<BudgetCommit>, StorageError> {
        let data = self.data.read();
        let mut commits: Vec<_> = data
            .commits
            .values()
            .filter(|c| since.map_or(true, |s| c.timestamp >= s))
            .cloned()
            .collect();
        commits.sort_by(newest_first);
        Ok(commits)
    }

    async fn changes_for_commit(&self, hash: &str) -> Result<Vec<BudgetChange>, StorageError> {
        Ok(self.data.read().changes.get(hash).cloned().unwrap_or_default())
    }

    async fn change_entries(
        &self,
        since: Option<i64>,
        entity: Option<(&str, &str)>,
        limit: Option<usize>,
    ) -> Result<Vec<ChangeEntry>, StorageError> {
        let data = self.data.read();
        let mut commits: Vec<&BudgetCommit> = data
            .commits
            .values()
            .filter(|c| since.map_or(true, |s| c.timestamp >= s))
            .collect();
        commits.sort_by(|a, b| newest_first(a, b));

        let mut entries = Vec::new();
        for commit in commits {
            let Some(changes) = data.changes.get(&commit.hash) else {
                continue;
            };
            for change in changes {
                if let Some((ty, id)) = entity {
                    if change.entity_type != ty || change.entity_id != id {
                        continue;
                    }
                }
                entries.push(ChangeEntry {
                    change: change.clone(),
                    timestamp: commit.timestamp,
                    author: commit.author.clone(),
                    message: commit.message.clone(),
                });
                if limit.is_some_and(|l| entries.len() >= l) {
                    return Ok(entries);
                }
            }
        }
        Ok(entries)
    }

    async fn insert_branch(&self, branch: &BudgetBranch) -> Result<(), StorageError> {
        let mut data = self.data.write();
        if data.branches.iter().any(|b| b.name == branch.name) {
            return Err(StorageError::Backend(format!("branch {} already exists", branch.name)));
        }
        data.branches.push(branch.clone());
        Ok(())
    }

    async fn get_branch(&self, name: &str) -> Result<Option<BudgetBranch>, StorageError> {
        Ok(self.data.read().branches.iter().find(|b| b.name == name).cloned())
    }

    async fn list_branches(&self) -> Result<Vec<BudgetBranch>, StorageError> {
        Ok(self.data.read().branches.clone())
    }

    async fn update_branch_head(&self, name: &str, head: &str) -> Result<(), StorageError> {
        let mut data = self.data.write();
        let branch = data
            .branches
            .iter_mut()
            .find(|b| b.name == name)
            .ok_or(StorageError::NotFound)?;
        branch.head_commit_hash = head.to_string();
        Ok(())
    }

    async fn set_active_branch(&self, name: &str) -> Result<(), StorageError> {
        let mut data = self.data.write();
        if !data.branches.iter().any(|b| b.name == name) {
            return Err(StorageError::NotFound);
        }
        for branch in &mut data.branches {
            branch.is_active = branch.name == name;
        }
        Ok(())
    }

    async fn insert_tag(&self, tag: &BudgetTag) -> Result<(), StorageError> {
        let mut data = self.data.write();
        if data.tags.iter().any(|t| t.name == tag.name) {
            return Err(StorageError::Backend(format!("tag {} already exists", tag.name)));
        }
        data.tags.push(tag.clone());
        Ok(())
    }

    async fn get_tag(&self, name: &str) -> Result<Option<BudgetTag>, StorageError> {
        Ok(self.data.read().tags.iter().find(|t| t.name == name).cloned())
    }

    async fn list_tags(&self) -> Result<Vec<BudgetTag>, StorageError> {
        let mut tags = self.data.read().tags.clone();
        tags.reverse();
        tags.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(tags)
    }
}
