// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Queued request model and its state machine.
//!
//! ```text
//!            ┌──────────── success ───────────► (removed)
//!            │
//! Pending ──► InFlight ── retryable, attempt ≤ max ──► Retrying ──(next_retry_at)──► InFlight
//!            │
//!            └── non-retryable, or attempt > max ──► Exhausted (kept until acknowledged)
//! ```

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::storage::document_key;

/// Header carrying the request id so the endpoint can drop replays.
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Drain priority. Declaration order is drain order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestPriority {
    High,
    #[default]
    Normal,
    Low,
}

impl RequestPriority {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }
}

impl std::fmt::Display for RequestPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Pending,
    InFlight,
    Retrying,
    Exhausted,
}

impl RequestState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Retrying => "retrying",
            Self::Exhausted => "exhausted",
        }
    }
}

impl std::fmt::Display for RequestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything needed to replay a request later.
///
/// # Example
///
/// ```
/// use budget_sync::queue::{HttpMethod, RequestPriority, RequestSpec};
///
/// let spec = RequestSpec::new(HttpMethod::Put, "https://api.example.com/budgets/b/documents/bill:rent")
///     .header("Content-Type", "application/json")
///     .body(r#"{"ciphertext":"..."}"#)
///     .priority(RequestPriority::High)
///     .entity("bill", "rent");
/// assert_eq!(spec.priority, RequestPriority::High);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSpec {
    pub method: HttpMethod,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
    pub priority: RequestPriority,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    /// Overrides the queue's configured retry budget
    pub max_retries: Option<u32>,
    /// Caller-chosen id; a fresh v4 id is used when absent
    pub request_id: Option<Uuid>,
}

impl RequestSpec {
    #[must_use]
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: BTreeMap::new(),
            body: None,
            priority: RequestPriority::Normal,
            entity_type: None,
            entity_id: None,
            max_retries: None,
            request_id: None,
        }
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    #[must_use]
    pub fn priority(mut self, priority: RequestPriority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn entity(mut self, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }

    #[must_use]
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    #[must_use]
    pub fn request_id(mut self, request_id: Uuid) -> Self {
        self.request_id = Some(request_id);
        self
    }
}

/// A request persisted in the offline queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedRequest {
    pub request_id: Uuid,
    pub method: HttpMethod,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
    pub priority: RequestPriority,
    #[serde(default)]
    pub entity_type: Option<String>,
    #[serde(default)]
    pub entity_id: Option<String>,
    /// Failed delivery attempts so far
    pub attempt: u32,
    pub max_retries: u32,
    pub enqueued_at: i64,
    /// Tie-breaker for FIFO among requests enqueued in the same millisecond
    pub sequence: u64,
    pub state: RequestState,
    #[serde(default)]
    pub next_retry_at: Option<i64>,
    #[serde(default)]
    pub last_attempt_at: Option<i64>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl QueuedRequest {
    pub(crate) fn from_spec(spec: RequestSpec, max_retries: u32, enqueued_at: i64, sequence: u64) -> Self {
        let request_id = spec.request_id.unwrap_or_else(Uuid::new_v4);
        let mut headers = spec.headers;
        headers
            .entry(IDEMPOTENCY_HEADER.to_string())
            .or_insert_with(|| request_id.to_string());

        Self {
            request_id,
            method: spec.method,
            url: spec.url,
            headers,
            body: spec.body,
            priority: spec.priority,
            entity_type: spec.entity_type,
            entity_id: spec.entity_id,
            attempt: 0,
            max_retries: spec.max_retries.unwrap_or(max_retries),
            enqueued_at,
            sequence,
            state: RequestState::Pending,
            next_retry_at: None,
            last_attempt_at: None,
            last_error: None,
        }
    }

    /// Document key of the targeted entity, if any.
    #[must_use]
    pub fn entity_key(&self) -> Option<String> {
        match (&self.entity_type, &self.entity_id) {
            (Some(ty), Some(id)) => Some(document_key(ty, id)),
            _ => None,
        }
    }

    /// Eligible for a delivery attempt at `now`.
    #[must_use]
    pub fn is_ready(&self, now: i64) -> bool {
        match self.state {
            RequestState::Pending => true,
            RequestState::Retrying => self.next_retry_at.map_or(true, |at| at <= now),
            RequestState::InFlight | RequestState::Exhausted => false,
        }
    }

    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.state == RequestState::Exhausted
    }

    /// Priority tier first, then enqueue order.
    #[must_use]
    pub fn drain_order(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then(self.enqueued_at.cmp(&other.enqueued_at))
            .then(self.sequence.cmp(&other.sequence))
    }

    #[must_use]
    pub fn summary(&self) -> RequestSummary {
        RequestSummary {
            request_id: self.request_id,
            method: self.method,
            priority: self.priority,
            state: self.state,
            attempt: self.attempt,
            entity_type: self.entity_type.clone(),
            entity_id: self.entity_id.clone(),
            enqueued_at: self.enqueued_at,
            next_retry_at: self.next_retry_at,
            last_error: self.last_error.clone(),
        }
    }
}

/// Body-free view of a queued request for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSummary {
    pub request_id: Uuid,
    pub method: HttpMethod,
    pub priority: RequestPriority,
    pub state: RequestState,
    pub attempt: u32,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub enqueued_at: i64,
    pub next_retry_at: Option<i64>,
    pub last_error: Option<String>,
}
