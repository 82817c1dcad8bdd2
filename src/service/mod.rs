//! Seams to the external scan and monitoring services.
//!
//! - `http` - the real REST client
//! - `mock` - scripted in-memory services for tests and demos

pub mod http;
pub mod mock;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::types::{Recommendation, ScanHistoryEntry};

pub use http::ApiClient;

/// The remote service that runs security scans.
#[async_trait]
pub trait ScanService: Send + Sync {
    /// `POST /security/{target}/scan`; returns the new job id.
    async fn submit_full(&self, target_id: &str) -> Result<String>;

    /// `POST /security/scan/quick/{target}`; either a job reference or an
    /// inline result body.
    async fn submit_quick(&self, target_id: &str) -> Result<Value>;

    /// `GET /security/scan/{id}`; raw detail including `status`.
    async fn scan_detail(&self, scan_id: &str) -> Result<Value>;

    /// `GET /security/{target}/scans`.
    async fn scan_history(&self, target_id: &str) -> Result<Vec<ScanHistoryEntry>>;

    /// `GET /security/recommendations/{target}`.
    async fn recommendations(&self, target_id: &str) -> Result<Vec<Recommendation>>;
}

/// The remote service that checks host reachability.
#[async_trait]
pub trait MonitoringService: Send + Sync {
    /// `GET /servers/{id}/check`.
    async fn check_server(&self, target_id: &str) -> Result<Value>;

    /// `GET /servers/check/all`; one result object per checked host.
    async fn check_all_servers(&self) -> Result<Vec<Value>>;
}

/// Status a scan detail reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteStatus {
    Queued,
    InProgress,
    Completed,
    Failed,
}

impl RemoteStatus {
    /// Read `status` from a detail payload. Missing or unrecognised values
    /// are treated as still queued so the poll loop keeps going.
    pub fn of(detail: &Value) -> Self {
        match detail
            .get("status")
            .and_then(Value::as_str)
            .map(|s| s.trim().to_ascii_lowercase())
            .as_deref()
        {
            Some("completed") | Some("done") => RemoteStatus::Completed,
            Some("failed") | Some("error") => RemoteStatus::Failed,
            Some("in_progress") | Some("running") => RemoteStatus::InProgress,
            _ => RemoteStatus::Queued,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RemoteStatus::Queued => "queued",
            RemoteStatus::InProgress => "in_progress",
            RemoteStatus::Completed => "completed",
            RemoteStatus::Failed => "failed",
        }
    }
}
