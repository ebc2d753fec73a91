//! Remote collaborator contracts and their HTTP implementations.

use std::time::Duration;

use anyhow::Context;
use appsync_core::RemoteRecord;
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "appsync-providers";

/// Whether a failed call is worth repeating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    /// The resource will not appear on retry.
    Permanent,
    /// Throttling or a timeout; a later attempt may succeed.
    Transient,
    /// Anything else. Not retried.
    Unknown,
}

pub fn classify_status(status: u16) -> RetryDisposition {
    match status {
        404 | 403 => RetryDisposition::Permanent,
        405 => RetryDisposition::Transient,
        _ => RetryDisposition::Unknown,
    }
}

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("app not found")]
    NotFound,
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("http status {0}")]
    Status(u16),
    #[error("request timed out")]
    Timeout,
    #[error("request failed: {0}")]
    Request(String),
}

impl ProbeError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            ProbeError::Status(status) => classify_status(*status),
            ProbeError::Timeout => RetryDisposition::Transient,
            ProbeError::Request(_) => RetryDisposition::Unknown,
        }
    }
}

#[async_trait]
pub trait MetadataProvider: Send + Sync {
    async fn fetch(&self, app_id: &str) -> Result<RemoteRecord, MetadataError>;
}

#[async_trait]
pub trait SizeProvider: Send + Sync {
    /// Download size in bytes; zero when the endpoint does not report one.
    async fn probe(&self, app_id: &str) -> Result<u64, ProbeError>;
}

#[async_trait]
pub trait ReviewProvider: Send + Sync {
    /// Newest review texts, at most `limit`.
    async fn recent(&self, app_id: &str, limit: usize) -> anyhow::Result<Vec<String>>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: None,
        }
    }
}

pub fn build_client(config: &HttpClientConfig) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .timeout(config.timeout);
    if let Some(user_agent) = &config.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }
    builder.build().context("building reqwest client")
}

fn endpoint(base_url: &str, segments: &[&str]) -> anyhow::Result<Url> {
    let mut url = Url::parse(base_url).with_context(|| format!("parsing base url {base_url}"))?;
    url.path_segments_mut()
        .map_err(|_| anyhow::anyhow!("base url {base_url} cannot carry a path"))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// Metadata service speaking JSON at `{base}/apps/{app_id}`.
#[derive(Debug, Clone)]
pub struct HttpMetadataProvider {
    client: reqwest::Client,
    base_url: String,
}

impl HttpMetadataProvider {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl MetadataProvider for HttpMetadataProvider {
    async fn fetch(&self, app_id: &str) -> Result<RemoteRecord, MetadataError> {
        let url = endpoint(&self.base_url, &["apps", app_id])
            .map_err(|e| MetadataError::Other(e.to_string()))?;
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| MetadataError::Other(e.to_string()))?;

        match resp.status() {
            StatusCode::NOT_FOUND => Err(MetadataError::NotFound),
            status if status.is_success() => resp
                .json::<RemoteRecord>()
                .await
                .map_err(|e| MetadataError::Other(format!("decoding metadata: {e}"))),
            status => Err(MetadataError::Other(format!("http status {}", status.as_u16()))),
        }
    }
}

/// Size probe issuing `HEAD {base}/b/XAPK/{app_id}?version=latest`.
#[derive(Debug, Clone)]
pub struct HttpSizeProbe {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSizeProbe {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl SizeProvider for HttpSizeProbe {
    async fn probe(&self, app_id: &str) -> Result<u64, ProbeError> {
        let mut url = endpoint(&self.base_url, &["b", "XAPK", app_id])
            .map_err(|e| ProbeError::Request(e.to_string()))?;
        url.query_pairs_mut().append_pair("version", "latest");

        let resp = self.client.head(url).send().await.map_err(|err| {
            if err.is_timeout() {
                ProbeError::Timeout
            } else {
                ProbeError::Request(err.to_string())
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ProbeError::Status(status.as_u16()));
        }

        let bytes = resp
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(0);
        debug!(app_id, bytes, "size probe answered");
        Ok(bytes)
    }
}

#[derive(Debug, Deserialize)]
struct ReviewsPage {
    #[serde(default)]
    data: Vec<ReviewEntry>,
}

#[derive(Debug, Deserialize)]
struct ReviewEntry {
    text: Option<String>,
}

/// Review feed at `{base}/apps/{app_id}/reviews?num={limit}`.
#[derive(Debug, Clone)]
pub struct HttpReviewProvider {
    client: reqwest::Client,
    base_url: String,
}

impl HttpReviewProvider {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl ReviewProvider for HttpReviewProvider {
    async fn recent(&self, app_id: &str, limit: usize) -> anyhow::Result<Vec<String>> {
        let mut url = endpoint(&self.base_url, &["apps", app_id, "reviews"])?;
        url.query_pairs_mut()
            .append_pair("num", &limit.to_string())
            .append_pair("sort", "newest");
        let page: ReviewsPage = self
            .client
            .get(url)
            .send()
            .await
            .context("requesting reviews")?
            .error_for_status()
            .context("reviews endpoint status")?
            .json()
            .await
            .context("decoding reviews")?;
        Ok(page
            .data
            .into_iter()
            .filter_map(|r| r.text)
            .take(limit)
            .collect())
    }
}
