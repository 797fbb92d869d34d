// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! HTTP client for the cloud document endpoint.
//!
//! ```text
//! GET    {base}/budgets/{budget}/documents            → [CloudDocument]
//! GET    {base}/budgets/{budget}/documents/{key}      → CloudDocument | 404
//! PUT    {base}/budgets/{budget}/documents/{key}      ← CloudDocument
//! DELETE {base}/budgets/{budget}/documents/{key}
//! DELETE {base}/budgets/{budget}/documents            → {"removed": n}
//! ```
//!
//! Writes are last-writer-wins on the server and carry an `Idempotency-Key`,
//! so replaying a queued request after an ambiguous failure is safe. A
//! DELETE answered with 404 has already taken effect and counts as delivered.

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::traits::{document_path, CloudDocument, CloudStore, StorageError};
use crate::queue::{
    ExecutorResponse, HttpMethod, QueuedRequest, RequestError, RequestExecutor, IDEMPOTENCY_HEADER,
};

#[derive(Deserialize)]
struct ClearResponse {
    #[serde(default)]
    removed: u64,
}

/// reqwest-backed [`CloudStore`] and [`RequestExecutor`].
#[derive(Clone)]
pub struct HttpCloudClient {
    client: Client,
    base_url: String,
}

impl HttpCloudClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, StorageError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StorageError::Backend(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Absolute URL of one document.
    #[must_use]
    pub fn document_url(&self, budget_id: &str, key: &str) -> String {
        format!("{}{}", self.base_url, document_path(budget_id, key))
    }

    fn collection_url(&self, budget_id: &str) -> String {
        format!("{}/budgets/{budget_id}/documents", self.base_url)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, RequestError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(RequestError::Status {
            status: status.as_u16(),
            message,
        })
    }
}

fn map_reqwest(err: reqwest::Error) -> RequestError {
    if err.is_timeout() {
        RequestError::Timeout
    } else if err.is_builder() {
        RequestError::Invalid(err.to_string())
    } else {
        RequestError::Network(err.to_string())
    }
}

fn to_storage(err: RequestError) -> StorageError {
    match err {
        RequestError::Status { status: 404, .. } => StorageError::NotFound,
        other => StorageError::Backend(other.to_string()),
    }
}

fn to_method(method: HttpMethod) -> Method {
    match method {
        HttpMethod::Get => Method::GET,
        HttpMethod::Post => Method::POST,
        HttpMethod::Put => Method::PUT,
        HttpMethod::Patch => Method::PATCH,
        HttpMethod::Delete => Method::DELETE,
    }
}

#[async_trait]
impl CloudStore for HttpCloudClient {
    async fn fetch(&self, budget_id: &str, key: &str) -> Result<Option<CloudDocument>, StorageError> {
        let response = self
            .client
            .get(self.document_url(budget_id, key))
            .send()
            .await
            .map_err(|e| to_storage(map_reqwest(e)))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::check(response).await.map_err(to_storage)?;
        let document = response
            .json::<CloudDocument>()
            .await
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        Ok(Some(document))
    }

    async fn list(&self, budget_id: &str) -> Result<Vec<CloudDocument>, StorageError> {
        let response = self
            .client
            .get(self.collection_url(budget_id))
            .send()
            .await
            .map_err(|e| to_storage(map_reqwest(e)))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let response = Self::check(response).await.map_err(to_storage)?;
        response
            .json::<Vec<CloudDocument>>()
            .await
            .map_err(|e| StorageError::Serialization(e.to_string()))
    }

    async fn upsert(&self, budget_id: &str, document: &CloudDocument) -> Result<(), StorageError> {
        let response = self
            .client
            .put(self.document_url(budget_id, &document.key()))
            .json(document)
            .send()
            .await
            .map_err(|e| to_storage(map_reqwest(e)))?;
        Self::check(response).await.map_err(to_storage)?;
        Ok(())
    }

    async fn remove(&self, budget_id: &str, key: &str) -> Result<bool, StorageError> {
        let response = self
            .client
            .delete(self.document_url(budget_id, key))
            .send()
            .await
            .map_err(|e| to_storage(map_reqwest(e)))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        Self::check(response).await.map_err(to_storage)?;
        Ok(true)
    }

    async fn clear(&self, budget_id: &str) -> Result<u64, StorageError> {
        let response = self
            .client
            .delete(self.collection_url(budget_id))
            .send()
            .await
            .map_err(|e| to_storage(map_reqwest(e)))?;
        let response = Self::check(response).await.map_err(to_storage)?;
        let body = response.text().await.unwrap_or_default();
        Ok(serde_json::from_str::<ClearResponse>(&body).map_or(0, |r| r.removed))
    }
}

#[async_trait]
impl RequestExecutor for HttpCloudClient {
    async fn execute(&self, request: &QueuedRequest) -> Result<ExecutorResponse, RequestError> {
        // Queued URLs are stored as paths so a changed base URL still applies
        let url = if request.url.starts_with("http://") || request.url.starts_with("https://") {
            request.url.clone()
        } else {
            format!("{}{}", self.base_url, request.url)
        };

        let mut builder = self.client.request(to_method(request.method), &url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.headers.contains_key(IDEMPOTENCY_HEADER) {
            builder = builder.header(IDEMPOTENCY_HEADER, request.request_id.to_string());
        }
        if let Some(body) = &request.body {
            builder = builder
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body.clone());
        }

        let response = builder.send().await.map_err(map_reqwest)?;
        if request.method == HttpMethod::Delete && response.status() == StatusCode::NOT_FOUND {
            debug!(request_id = %request.request_id, "Document already absent");
            return Ok(ExecutorResponse {
                status: StatusCode::NOT_FOUND.as_u16(),
                body: None,
            });
        }
        let response = Self::check(response).await?;
        let status = response.status().as_u16();
        let body = response.text().await.ok().filter(|b| !b.is_empty());
        debug!(request_id = %request.request_id, status, "Request delivered");
        Ok(ExecutorResponse { status, body })
    }
}
