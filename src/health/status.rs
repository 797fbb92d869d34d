// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthState {
    Checking,
    Healthy,
    IssuesDetected,
    Error,
    CriticalFailure,
}

impl HealthState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Checking => "CHECKING",
            Self::Healthy => "HEALTHY",
            Self::IssuesDetected => "ISSUES_DETECTED",
            Self::Error => "ERROR",
            Self::CriticalFailure => "CRITICAL_FAILURE",
        }
    }
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of the latest health probe. Always replaced as a whole.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncHealthStatus {
    /// `None` while no check has completed
    pub is_healthy: Option<bool>,
    pub status: HealthState,
    /// Epoch millis
    pub last_checked: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_tests: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Entities that differ only because the cloud moved on
    pub remote_ahead: usize,
    pub quarantined: usize,
}

impl Default for SyncHealthStatus {
    fn default() -> Self {
        Self {
            is_healthy: None,
            status: HealthState::Checking,
            last_checked: None,
            failed_tests: None,
            error: None,
            remote_ahead: 0,
            quarantined: 0,
        }
    }
}

impl SyncHealthStatus {
    pub(crate) fn failed(status: HealthState, error: impl Into<String>, now: i64) -> Self {
        Self {
            is_healthy: Some(false),
            status,
            last_checked: Some(now),
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// One named check of the validation battery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl CheckResult {
    pub(crate) fn pass(name: &str) -> Self {
        Self {
            name: name.to_string(),
            passed: true,
            details: None,
        }
    }

    pub(crate) fn fail(name: &str, details: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            passed: false,
            details: Some(details.into()),
        }
    }

    pub(crate) fn from_failures(name: &str, failures: &[String]) -> Self {
        if failures.is_empty() {
            Self::pass(name)
        } else {
            Self::fail(name, failures.join(", "))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OverallStatus {
    AllSystemsGo,
    IssuesDetected,
    CriticalFailure,
}

impl OverallStatus {
    #[must_use]
    pub fn health_state(self) -> HealthState {
        match self {
            Self::AllSystemsGo => HealthState::Healthy,
            Self::IssuesDetected => HealthState::IssuesDetected,
            Self::CriticalFailure => HealthState::CriticalFailure,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationSummary {
    pub overall_status: OverallStatus,
    pub total_passed: usize,
    pub total_failed: usize,
    pub checks: Vec<CheckResult>,
    pub status: SyncHealthStatus,
}

/// Payload of the `syncCorruptionDetected` event. Never carries record data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CorruptionReport {
    pub failure_count: usize,
    /// First 8 characters followed by `...`
    pub budget_id: String,
    pub timestamp: i64,
    /// Document keys of the quarantined entities
    pub entities: Vec<String>,
}

impl CorruptionReport {
    pub(crate) fn new(budget_id: &str, entities: Vec<String>, timestamp: i64) -> Self {
        Self {
            failure_count: entities.len(),
            budget_id: redact_budget_id(budget_id),
            timestamp,
            entities,
        }
    }
}

pub(crate) fn redact_budget_id(budget_id: &str) -> String {
    let prefix: String = budget_id.chars().take(8).collect();
    format!("{prefix}...")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RecoveryDirection {
    /// Re-encrypt the local snapshot and overwrite the cloud copy.
    LocalToCloud,
    /// Decrypt the cloud copy and overwrite local records.
    CloudToLocal,
}

impl RecoveryDirection {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LocalToCloud => "local_to_cloud",
            Self::CloudToLocal => "cloud_to_local",
        }
    }
}

impl std::fmt::Display for RecoveryDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of `reset_cloud_data`. Failures are reported here, never thrown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryResult {
    pub success: bool,
    pub direction: RecoveryDirection,
    pub documents: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RecoveryResult {
    pub(crate) fn succeeded(direction: RecoveryDirection, documents: usize) -> Self {
        let message = match direction {
            RecoveryDirection::LocalToCloud => format!("Cloud data reset from {documents} local records"),
            RecoveryDirection::CloudToLocal => format!("Local data restored from {documents} cloud documents"),
        };
        Self {
            success: true,
            direction,
            documents,
            message: Some(message),
            error: None,
        }
    }

    pub(crate) fn failed(direction: RecoveryDirection, error: impl Into<String>) -> Self {
        Self {
            success: false,
            direction,
            documents: 0,
            message: None,
            error: Some(error.into()),
        }
    }
}
