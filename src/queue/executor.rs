// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Transport seam for queued requests.

use async_trait::async_trait;
use thiserror::Error;

use super::request::QueuedRequest;

/// Why a delivery attempt failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("network failure: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    /// The request can never succeed as built (bad URL, unserializable body).
    #[error("invalid request: {0}")]
    Invalid(String),
}

impl RequestError {
    /// Network errors, timeouts, 5xx, 429 and 408 are worth retrying.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout => true,
            Self::Status { status, .. } => *status >= 500 || *status == 429 || *status == 408,
            Self::Invalid(_) => false,
        }
    }

    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Successful response.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecutorResponse {
    pub status: u16,
    pub body: Option<String>,
}

/// Sends one queued request. Non-2xx responses are errors.
#[async_trait]
pub trait RequestExecutor: Send + Sync {
    async fn execute(&self, request: &QueuedRequest) -> Result<ExecutorResponse, RequestError>;
}
