// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Ledger records.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::str::FromStr;

use super::HistoryError;

/// Entity id recorded when a change names none.
pub const DEFAULT_ENTITY_ID: &str = "main";
/// Tag type recorded when a tag names none.
pub const DEFAULT_TAG_TYPE: &str = "milestone";

/// Normalized kind of change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Create,
    Update,
    Delete,
}

impl ChangeType {
    /// Accepts the canonical names and common synonyms (`add`, `modify`, `remove`, ...).
    pub fn parse(raw: &str) -> Result<Self, HistoryError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "create" | "created" | "add" | "added" | "insert" | "new" => Ok(Self::Create),
            "update" | "updated" | "modify" | "modified" | "edit" | "change" => Ok(Self::Update),
            "delete" | "deleted" | "remove" | "removed" => Ok(Self::Delete),
            _ => Err(HistoryError::InvalidChangeType(raw.to_string())),
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl FromStr for ChangeType {
    type Err = HistoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl std::fmt::Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable, content-addressed commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetCommit {
    pub hash: String,
    pub timestamp: i64,
    pub message: String,
    pub author: String,
    #[serde(default)]
    pub parent_hash: Option<String>,
    #[serde(default)]
    pub device_fingerprint: Option<String>,
}

/// One entity-level change inside a commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetChange {
    pub commit_hash: String,
    /// Position within the commit
    pub index: u32,
    pub entity_type: String,
    pub entity_id: String,
    pub change_type: ChangeType,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub before_data: Option<Value>,
    #[serde(default)]
    pub after_data: Option<Value>,
}

/// A change joined with the commit that carries it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEntry {
    pub change: BudgetChange,
    pub timestamp: i64,
    pub author: String,
    pub message: String,
}

/// Named pointer into commit history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetBranch {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub source_commit_hash: String,
    pub head_commit_hash: String,
    pub is_active: bool,
    pub created_at: i64,
    pub author: String,
}

/// Named, immutable label on a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetTag {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub commit_hash: String,
    pub tag_type: String,
    pub created_at: i64,
    pub author: String,
}

/// Caller-side description of one change.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeInput {
    pub entity_type: String,
    pub entity_id: Option<String>,
    /// Raw change type; synonyms are normalized on commit
    pub change_type: String,
    pub description: Option<String>,
    pub before: Option<Value>,
    pub after: Option<Value>,
}

impl ChangeInput {
    #[must_use]
    pub fn new(entity_type: impl Into<String>, change_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: None,
            change_type: change_type.into(),
            description: None,
            before: None,
            after: None,
        }
    }

    #[must_use]
    pub fn entity_id(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    #[must_use]
    pub fn before(mut self, before: Value) -> Self {
        self.before = Some(before);
        self
    }

    #[must_use]
    pub fn after(mut self, after: Value) -> Self {
        self.after = Some(after);
        self
    }
}

/// Input to [`HistoryLedger::create_commit`](super::HistoryLedger::create_commit).
///
/// # Example
///
/// ```
/// use budget_sync::history::{ChangeInput, CommitRequest};
/// use serde_json::json;
///
/// let request = CommitRequest::new("Add rent bill")
///     .author("Sam")
///     .change(ChangeInput::new("bill", "add").entity_id("rent").after(json!({"amount": 1200})));
/// assert_eq!(request.changes.len(), 1);
/// ```
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CommitRequest {
    pub message: String,
    pub author: Option<String>,
    pub device_fingerprint: Option<String>,
    /// Epoch millis; the ledger clock is used when absent
    pub timestamp: Option<i64>,
    pub changes: Vec<ChangeInput>,
}

impl CommitRequest {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    #[must_use]
    pub fn device_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.device_fingerprint = Some(fingerprint.into());
        self
    }

    #[must_use]
    pub fn timestamp(mut self, millis: i64) -> Self {
        self.timestamp = Some(millis);
        self
    }

    #[must_use]
    pub fn change(mut self, change: ChangeInput) -> Self {
        self.changes.push(change);
        self
    }
}

/// A commit and its changes as returned by `create_commit`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitRecord {
    pub commit: BudgetCommit,
    pub changes: Vec<BudgetChange>,
    /// `false` when an identical commit already existed
    pub created: bool,
}

/// Result of `verify_device_consistency`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConsistency {
    pub consistent: bool,
    pub known_device: bool,
    pub distinct_devices: usize,
    pub max_devices: usize,
}

/// Read-only analytics over a time range.
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ChangePatterns {
    pub range_start: i64,
    pub range_end: i64,
    pub total_commits: usize,
    pub total_changes: usize,
    pub changes_by_type: BTreeMap<String, usize>,
    pub changes_by_entity: BTreeMap<String, usize>,
    pub author_activity: BTreeMap<String, usize>,
    /// `YYYY-MM-DD` (UTC) → changes
    pub daily_activity: BTreeMap<String, usize>,
    /// UTC hour with the most changes
    pub most_active_hour: Option<u32>,
    pub average_changes_per_day: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_type_synonyms() {
        assert_eq!(ChangeType::parse("add").unwrap(), ChangeType::Create);
        assert_eq!(ChangeType::parse(" Created ").unwrap(), ChangeType::Create);
        assert_eq!(ChangeType::parse("modify").unwrap(), ChangeType::Update);
        assert_eq!(ChangeType::parse("edit").unwrap(), ChangeType::Update);
        assert_eq!(ChangeType::parse("remove").unwrap(), ChangeType::Delete);
        assert_eq!("delete".parse::<ChangeType>().unwrap(), ChangeType::Delete);
        assert!(matches!(
            ChangeType::parse("explode"),
            Err(HistoryError::InvalidChangeType(_))
        ));
    }

    #[test]
    fn test_change_type_serde() {
        assert_eq!(serde_json::to_value(ChangeType::Create).unwrap(), "create");
        let parsed: ChangeType = serde_json::from_str("\"update\"").unwrap();
        assert_eq!(parsed, ChangeType::Update);
    }
}
