//! REST client for the scan and monitoring services.
//!
//! One `ApiClient` is built from [`ClientConfig`] and shared by reference;
//! the bearer token travels with the client, not in process-wide state.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::header::ACCEPT;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use super::{MonitoringService, ScanService};
use crate::config::ClientConfig;
use crate::normalize::normalize_recommendations;
use crate::types::{opaque_id, Recommendation, ScanHistoryEntry};

/// Non-success HTTP status, with the service's `detail` message if it sent one.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("HTTP {status}: {detail}")]
pub struct HttpStatusError {
    pub status: u16,
    pub detail: String,
}

impl HttpStatusError {
    pub fn is_not_found(&self) -> bool {
        self.status == 404
    }
}

#[derive(Debug, Clone)]
pub struct ApiClient {
    base: Url,
    client: reqwest::Client,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .use_rustls_tls()
            .build()
            .context("Failed to create HTTP client")?;
        Self::with_client(config, client)
    }

    /// Create with a caller-supplied reqwest client (custom TLS, proxies).
    pub fn with_client(config: &ClientConfig, client: reqwest::Client) -> Result<Self> {
        let base = Url::parse(&config.base_url).context("Invalid API base URL")?;
        if base.cannot_be_a_base() {
            bail!("API base URL cannot carry paths: {base}");
        }
        Ok(Self {
            base,
            client,
            token: config.token.clone(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// Base URL with `segments` appended, each percent-encoded.
    pub fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("API base URL cannot carry paths: {}", self.base))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get(&self, segments: &[&str]) -> Result<Value> {
        let url = self.endpoint(segments)?;
        self.send(self.client.get(url.clone()), &url).await
    }

    async fn post(&self, segments: &[&str]) -> Result<Value> {
        let url = self.endpoint(segments)?;
        self.send(self.client.post(url.clone()), &url).await
    }

    async fn send(&self, builder: reqwest::RequestBuilder, url: &Url) -> Result<Value> {
        let builder = match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        };
        debug!(%url, "calling service");
        let response = builder
            .header(ACCEPT, "application/json")
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let detail = serde_json::from_str::<Value>(&body)
                .ok()
                .and_then(|v| v.get("detail").and_then(Value::as_str).map(str::to_string))
                .unwrap_or(body);
            return Err(HttpStatusError {
                status: status.as_u16(),
                detail,
            }
            .into());
        }

        response
            .json::<Value>()
            .await
            .with_context(|| format!("invalid JSON from {url}"))
    }
}

#[async_trait]
impl ScanService for ApiClient {
    async fn submit_full(&self, target_id: &str) -> Result<String> {
        let body = self.post(&["security", target_id, "scan"]).await?;
        body.get("scan_id")
            .and_then(opaque_id)
            .ok_or_else(|| anyhow!("scan service accepted the request but returned no scan_id"))
    }

    async fn submit_quick(&self, target_id: &str) -> Result<Value> {
        self.post(&["security", "scan", "quick", target_id]).await
    }

    async fn scan_detail(&self, scan_id: &str) -> Result<Value> {
        self.get(&["security", "scan", scan_id]).await
    }

    async fn scan_history(&self, target_id: &str) -> Result<Vec<ScanHistoryEntry>> {
        let body = self.get(&["security", target_id, "scans"]).await?;
        decode_history(body)
    }

    async fn recommendations(&self, target_id: &str) -> Result<Vec<Recommendation>> {
        let body = self.get(&["security", "recommendations", target_id]).await?;
        Ok(normalize_recommendations(&body))
    }
}

#[async_trait]
impl MonitoringService for ApiClient {
    async fn check_server(&self, target_id: &str) -> Result<Value> {
        self.get(&["servers", target_id, "check"]).await
    }

    async fn check_all_servers(&self) -> Result<Vec<Value>> {
        match self.get(&["servers", "check", "all"]).await? {
            Value::Array(items) => Ok(items),
            other => bail!("expected a list of check results, got {}", kind_of(&other)),
        }
    }
}

/// Decode a history listing, skipping entries that do not fit.
pub fn decode_history(body: Value) -> Result<Vec<ScanHistoryEntry>> {
    let Value::Array(items) = body else {
        bail!("expected a list of scans, got {}", kind_of(&body));
    };
    Ok(items
        .into_iter()
        .filter_map(|item| match serde_json::from_value::<ScanHistoryEntry>(item) {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(error = %e, "skipping undecodable scan history entry");
                None
            }
        })
        .collect())
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}
