//! Remote API seam.
//!
//! The sync engine and the gateways only see [`RemoteApi`]. The concrete
//! HTTP client targets a Frappe-style REST API:
//!
//! - `POST /api/resource/{DocType}` creates a document
//! - `PUT  /api/resource/{DocType}/{name}` updates one
//! - `GET  /api/resource/{DocType}` lists them
//!
//! Successful responses wrap the document in `{"data": ...}`; the
//! server-assigned identifier is the document's `name`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use erpsync_core::EntityType;
use reqwest::header::AUTHORIZATION;
use reqwest::{RequestBuilder, Url};
use serde_json::Value;

use crate::types::Fields;

/// How the sync engine should treat a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Network, timeout, 5xx, throttling or expired auth: retry later.
    Transient,
    /// Validation or business rule rejection: never retry automatically.
    Permanent,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("API error ({status}): {message}")]
    Status { status: u16, message: String },
    #[error("unexpected response: {0}")]
    Decode(String),
    #[error("request rejected before sending: {0}")]
    Rejected(String),
}

impl RemoteError {
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
        }
    }

    pub fn class(&self) -> FailureClass {
        match self {
            RemoteError::Network(_) | RemoteError::Timeout(_) => FailureClass::Transient,
            RemoteError::Status { status, .. } => classify_status(*status),
            // A 2xx we could not read may still have been applied; retrying
            // risks a duplicate document.
            RemoteError::Decode(_) => FailureClass::Permanent,
            RemoteError::Rejected(_) => FailureClass::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == FailureClass::Transient
    }
}

/// Status-code classification.
///
/// Auth failures (401/403) are transient: the session layer re-authenticates
/// and the write is still valid.
pub fn classify_status(status: u16) -> FailureClass {
    match status {
        401 | 403 | 408 | 425 | 429 => FailureClass::Transient,
        500..=599 => FailureClass::Transient,
        _ => FailureClass::Permanent,
    }
}

/// A document as returned by the list endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRecord {
    pub remote_id: String,
    pub fields: Fields,
}

/// Per-entity create/update/list endpoints.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Create a document; returns its server-assigned name.
    async fn create(&self, entity: EntityType, payload: &Fields) -> Result<String, RemoteError>;

    /// Update an existing document; returns its name.
    async fn update(
        &self,
        entity: EntityType,
        remote_id: &str,
        payload: &Fields,
    ) -> Result<String, RemoteError>;

    async fn list(&self, entity: EntityType) -> Result<Vec<RemoteRecord>, RemoteError>;
}

#[async_trait]
impl<R> RemoteApi for Arc<R>
where
    R: RemoteApi + ?Sized,
{
    async fn create(&self, entity: EntityType, payload: &Fields) -> Result<String, RemoteError> {
        (**self).create(entity, payload).await
    }

    async fn update(
        &self,
        entity: EntityType,
        remote_id: &str,
        payload: &Fields,
    ) -> Result<String, RemoteError> {
        (**self).update(entity, remote_id, payload).await
    }

    async fn list(&self, entity: EntityType) -> Result<Vec<RemoteRecord>, RemoteError> {
        (**self).list(entity).await
    }
}

/// `reqwest`-backed client for the resource API.
///
/// Request timeouts are configured on the client and surface as
/// [`RemoteError::Timeout`].
#[derive(Debug, Clone)]
pub struct HttpRemoteApi {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl HttpRemoteApi {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.into(),
            token: None,
            client,
        })
    }

    /// Attach an API token (`Authorization: token <key:secret>`).
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn resource_url(&self, entity: EntityType, name: Option<&str>) -> Result<Url, RemoteError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| RemoteError::Rejected(format!("invalid API base url: {e}")))?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| RemoteError::Rejected("API base url cannot carry a path".to_string()))?;
            segments
                .pop_if_empty()
                .extend(["api", "resource", entity.doctype()]);
            if let Some(name) = name {
                segments.push(name);
            }
        }
        Ok(url)
    }

    async fn send(&self, req: RequestBuilder) -> Result<Value, RemoteError> {
        let req = match &self.token {
            Some(token) => req.header(AUTHORIZATION, format!("token {token}")),
            None => req,
        };

        let resp = req.send().await.map_err(transport_error)?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(RemoteError::status(status.as_u16(), error_message(&body)));
        }

        resp.json::<Value>()
            .await
            .map_err(|e| RemoteError::Decode(format!("failed to parse response body: {e}")))
    }
}

#[async_trait]
impl RemoteApi for HttpRemoteApi {
    async fn create(&self, entity: EntityType, payload: &Fields) -> Result<String, RemoteError> {
        let url = self.resource_url(entity, None)?;
        let body = self.send(self.client.post(url).json(payload)).await?;
        document_name(&body)
    }

    async fn update(
        &self,
        entity: EntityType,
        remote_id: &str,
        payload: &Fields,
    ) -> Result<String, RemoteError> {
        let url = self.resource_url(entity, Some(remote_id))?;
        let body = self.send(self.client.put(url).json(payload)).await?;
        document_name(&body)
    }

    async fn list(&self, entity: EntityType) -> Result<Vec<RemoteRecord>, RemoteError> {
        let url = self.resource_url(entity, None)?;
        let req = self
            .client
            .get(url)
            .query(&[("fields", r#"["*"]"#), ("limit_page_length", "0")]);
        let body = self.send(req).await?;

        let docs = body
            .get("data")
            .and_then(Value::as_array)
            .ok_or_else(|| RemoteError::Decode("list response has no data array".to_string()))?;

        docs.iter()
            .map(|doc| {
                let fields = doc
                    .as_object()
                    .cloned()
                    .ok_or_else(|| RemoteError::Decode("list entry is not an object".to_string()))?;
                let remote_id = fields
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| RemoteError::Decode("list entry has no name".to_string()))?
                    .to_string();
                Ok(RemoteRecord { remote_id, fields })
            })
            .collect()
    }
}

fn transport_error(e: reqwest::Error) -> RemoteError {
    if e.is_timeout() {
        RemoteError::Timeout(e.to_string())
    } else {
        RemoteError::Network(e.to_string())
    }
}

/// Extract `data.name` from a write response.
fn document_name(body: &Value) -> Result<String, RemoteError> {
    body.get("data")
        .and_then(|d| d.get("name"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| RemoteError::Decode("response has no data.name".to_string()))
}

/// Best human-readable message from an error body.
fn error_message(body: &str) -> String {
    const MAX: usize = 300;

    if let Ok(json) = serde_json::from_str::<Value>(body) {
        for key in ["exception", "message", "exc_type"] {
            if let Some(msg) = json.get(key).and_then(Value::as_str) {
                return msg.to_string();
            }
        }
    }
    body.chars().take(MAX).collect()
}
