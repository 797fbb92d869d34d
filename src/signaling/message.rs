// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Signal wire format.
//!
//! ```json
//! { "type": "data_changed", "budgetId": "budget_…", "timestamp": 1741615200000,
//!   "metadata": { "deviceId": "…", "userId": "…", "version": "2.0", "budgetId": "…" } }
//! ```
//!
//! A signal says *that* something changed, never *what*. There is no field
//! that could carry budget data, and inbound frames are rebuilt field by
//! field so unexpected keys never reach subscribers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Longest metadata value accepted in either direction.
pub const MAX_METADATA_LEN: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    Connected,
    Disconnected,
    Ping,
    Pong,
    DataChanged,
    BudgetUpdated,
    SyncRequested,
    Presence,
}

impl SignalType {
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "connected" => Self::Connected,
            "disconnected" => Self::Disconnected,
            "ping" => Self::Ping,
            "pong" => Self::Pong,
            "data_changed" => Self::DataChanged,
            "budget_updated" => Self::BudgetUpdated,
            "sync_requested" => Self::SyncRequested,
            "presence" => Self::Presence,
            _ => return None,
        })
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::DataChanged => "data_changed",
            Self::BudgetUpdated => "budget_updated",
            Self::SyncRequested => "sync_requested",
            Self::Presence => "presence",
        }
    }

    /// Signals that mean another device wrote data worth pulling.
    #[must_use]
    pub fn is_change_notice(self) -> bool {
        matches!(self, Self::DataChanged | Self::BudgetUpdated | Self::SyncRequested)
    }
}

impl std::fmt::Display for SignalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The only metadata a signal may carry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_id: Option<String>,
}

fn bounded(value: Option<String>) -> Option<String> {
    value.filter(|v| v.chars().count() <= MAX_METADATA_LEN)
}

fn bounded_str(value: Option<&Value>) -> Option<String> {
    bounded(value.and_then(Value::as_str).map(str::to_string))
}

impl SignalMetadata {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    #[must_use]
    pub fn user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    #[must_use]
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    #[must_use]
    pub fn budget_id(mut self, budget_id: impl Into<String>) -> Self {
        self.budget_id = Some(budget_id.into());
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.device_id.is_none() && self.user_id.is_none() && self.version.is_none() && self.budget_id.is_none()
    }

    /// Drop values longer than [`MAX_METADATA_LEN`].
    #[must_use]
    pub fn sanitized(self) -> Self {
        Self {
            device_id: bounded(self.device_id),
            user_id: bounded(self.user_id),
            version: bounded(self.version),
            budget_id: bounded(self.budget_id),
        }
    }

    /// Keep only whitelisted string fields of a JSON object.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        let metadata = Self {
            device_id: bounded_str(object.get("deviceId")),
            user_id: bounded_str(object.get("userId")),
            version: bounded_str(object.get("version")),
            budget_id: bounded_str(object.get("budgetId")),
        };
        (!metadata.is_empty()).then_some(metadata)
    }
}

/// One control-plane signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalMessage {
    #[serde(rename = "type")]
    pub signal_type: SignalType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budget_id: Option<String>,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<SignalMetadata>,
}

impl SignalMessage {
    #[must_use]
    pub fn new(signal_type: SignalType, budget_id: Option<String>, timestamp: i64, metadata: Option<SignalMetadata>) -> Self {
        Self {
            signal_type,
            budget_id,
            timestamp,
            metadata: metadata.map(SignalMetadata::sanitized).filter(|m| !m.is_empty()),
        }
    }

    /// Rebuild an inbound frame. `None` for malformed JSON or unknown types.
    /// `now` stands in for a missing or non-numeric timestamp.
    #[must_use]
    pub fn parse(text: &str, now: i64) -> Option<Self> {
        let raw: Value = serde_json::from_str(text).ok()?;
        let signal_type = SignalType::parse(raw.get("type")?.as_str()?)?;
        let budget_id = raw.get("budgetId").and_then(Value::as_str).map(str::to_string);
        let timestamp = raw
            .get("timestamp")
            .and_then(|t| t.as_i64().or_else(|| t.as_f64().map(|f| f as i64)))
            .unwrap_or(now);
        let metadata = raw.get("metadata").and_then(SignalMetadata::from_value);

        Some(Self {
            signal_type,
            budget_id,
            timestamp,
            metadata,
        })
    }

    /// Device that sent the signal, when stated.
    #[must_use]
    pub fn sender_device(&self) -> Option<&str> {
        self.metadata.as_ref().and_then(|m| m.device_id.as_deref())
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
