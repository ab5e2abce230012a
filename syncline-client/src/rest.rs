//! PostgREST-shaped HTTP accessor.
//!
//! Filters are encoded as `col=eq.v` and `col=in.(a,b)`, ordering as
//! `order=col.asc|desc` and the limit as `limit=n`. Writes ask for the
//! affected rows back with `Prefer: return=representation`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use syncline_core::{
    FetchError, FilterValue, MutationError, QueryDescriptor, Scalar, SyncError, SyncResult,
};
use tracing::{debug, warn};

use crate::config::{AuthConfig, SyncConfig};
use crate::remote::{RemoteQuery, RemoteWrite, WriteOperation, WriteRequest};

#[derive(Debug, thiserror::Error)]
pub enum RestClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Config error: {0}")]
    Config(String),
}

impl RestClientError {
    fn into_fetch(self, resource: &str) -> SyncError {
        match self {
            Self::Status { status, body } => FetchError::Rejected {
                resource: resource.to_string(),
                status,
                message: body,
            }
            .into(),
            Self::Http(e) => FetchError::Transport {
                reason: e.to_string(),
            }
            .into(),
            other => FetchError::QueryFailed {
                resource: resource.to_string(),
                reason: other.to_string(),
            }
            .into(),
        }
    }

    fn into_mutation(self, resource: &str) -> SyncError {
        match self {
            Self::Status { status, body } => MutationError::Rejected {
                resource: resource.to_string(),
                status,
                message: body,
            }
            .into(),
            other => MutationError::WriteFailed {
                resource: resource.to_string(),
                reason: other.to_string(),
            }
            .into(),
        }
    }
}

impl From<RestClientError> for SyncError {
    fn from(err: RestClientError) -> Self {
        FetchError::Transport {
            reason: err.to_string(),
        }
        .into()
    }
}

#[derive(Clone)]
pub struct RestAccessor {
    client: reqwest::Client,
    base_url: String,
    auth_header: HeaderMap,
}

impl RestAccessor {
    pub fn new(config: &SyncConfig) -> Result<Self, RestClientError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        let auth_header = build_auth_headers(&config.auth)?;
        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            auth_header,
        })
    }

    fn url(&self, resource: &str) -> String {
        format!("{}/{}", self.base_url, resource)
    }

    async fn parse_rows(response: reqwest::Response) -> Result<Vec<Value>, RestClientError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await?;
            return Err(RestClientError::Status {
                status: status.as_u16(),
                body,
            });
        }
        if status.as_u16() == 204 {
            return Ok(Vec::new());
        }
        match response.json::<Value>().await? {
            Value::Array(rows) => Ok(rows),
            Value::Null => Ok(Vec::new()),
            row => Ok(vec![row]),
        }
    }

    async fn send_query(&self, descriptor: &QueryDescriptor) -> Result<Vec<Value>, RestClientError> {
        let response = self
            .client
            .get(self.url(&descriptor.resource))
            .query(&query_params(descriptor))
            .headers(self.auth_header.clone())
            .send()
            .await?;
        Self::parse_rows(response).await
    }

    async fn send_write(&self, request: &WriteRequest) -> Result<Vec<Value>, RestClientError> {
        let url = self.url(&request.resource);
        let builder = match request.operation {
            WriteOperation::Insert => self.client.post(&url).json(&request.payload),
            WriteOperation::Update => self
                .client
                .patch(&url)
                .query(&write_params(&request.filters))
                .json(&request.payload),
            WriteOperation::Delete => self.client.delete(&url).query(&write_params(&request.filters)),
        };
        let response = builder
            .headers(self.auth_header.clone())
            .header("prefer", "return=representation")
            .send()
            .await?;
        Self::parse_rows(response).await
    }
}

#[async_trait]
impl RemoteQuery for RestAccessor {
    async fn query(&self, descriptor: &QueryDescriptor) -> SyncResult<Vec<Value>> {
        let resource = descriptor.resource.as_str();
        debug!(resource, "remote query");
        self.send_query(descriptor).await.map_err(|e| {
            warn!(resource, error = %e, "remote query failed");
            e.into_fetch(resource)
        })
    }
}

#[async_trait]
impl RemoteWrite for RestAccessor {
    async fn write(&self, request: WriteRequest) -> SyncResult<Vec<Value>> {
        let resource = request.resource.clone();
        if request.operation != WriteOperation::Insert && request.filters.is_empty() {
            return Err(MutationError::WriteFailed {
                resource,
                reason: format!("refusing unfiltered {}", request.operation.as_str()),
            }
            .into());
        }
        debug!(resource = %resource, operation = request.operation.as_str(), "remote write");
        self.send_write(&request).await.map_err(|e| {
            warn!(resource = %resource, error = %e, "remote write failed");
            e.into_mutation(&resource)
        })
    }
}

/// Query-string pairs for a read.
pub fn query_params(descriptor: &QueryDescriptor) -> Vec<(String, String)> {
    let mut params: Vec<(String, String)> = vec![("select".to_string(), "*".to_string())];
    for (field, value) in descriptor.active_filters() {
        let operand = match value {
            FilterValue::Scalar(s) => format!("eq.{}", s),
            FilterValue::List(items) => format!(
                "in.({})",
                items.iter().map(quote).collect::<Vec<_>>().join(",")
            ),
        };
        params.push((field.to_string(), operand));
    }
    if let Some(order) = &descriptor.order {
        let direction = if order.ascending { "asc" } else { "desc" };
        params.push(("order".to_string(), format!("{}.{}", order.column, direction)));
    }
    if let Some(limit) = descriptor.limit {
        params.push(("limit".to_string(), limit.to_string()));
    }
    params
}

fn write_params(filters: &BTreeMap<String, Scalar>) -> Vec<(String, String)> {
    filters
        .iter()
        .map(|(field, value)| (field.clone(), format!("eq.{}", value)))
        .collect()
}

/// List operands containing reserved characters are double-quoted.
fn quote(value: &Scalar) -> String {
    let text = value.to_string();
    if text.contains([',', '(', ')', '"', ' ']) {
        format!("\"{}\"", text.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        text
    }
}

pub(crate) fn build_auth_headers(auth: &AuthConfig) -> Result<HeaderMap, RestClientError> {
    let mut headers = HeaderMap::new();
    if let Some(api_key) = &auth.api_key {
        headers.insert(
            HeaderName::from_static("apikey"),
            HeaderValue::from_str(api_key).map_err(|e| RestClientError::Config(e.to_string()))?,
        );
    }
    if let Some(token) = auth.jwt.as_ref().or(auth.api_key.as_ref()) {
        let value = format!("Bearer {}", token);
        headers.insert(
            HeaderName::from_static("authorization"),
            HeaderValue::from_str(&value).map_err(|e| RestClientError::Config(e.to_string()))?,
        );
    }
    Ok(headers)
}
