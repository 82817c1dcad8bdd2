//! Scripted in-memory services for testing
//!
//! Responses are queued ahead of time and every call is recorded so tests
//! can assert on exactly which requests were made.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use super::http::HttpStatusError;
use super::{MonitoringService, ScanService};
use crate::types::{Recommendation, ScanHistoryEntry};

/// Failure a scripted call should produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockFailure {
    /// Connection-level failure (refused, reset, timed out).
    Transport(String),
    /// The service answered with a non-success status.
    Status(u16, String),
}

impl MockFailure {
    fn into_error(self) -> anyhow::Error {
        match self {
            MockFailure::Transport(msg) => anyhow!(msg),
            MockFailure::Status(status, detail) => HttpStatusError { status, detail }.into(),
        }
    }
}

/// Scripted outcome of one call.
pub type Scripted<T> = std::result::Result<T, MockFailure>;

/// A queue of one-shot responses with an optional repeating fallback.
#[derive(Debug)]
struct Script<T> {
    queue: VecDeque<Scripted<T>>,
    sticky: Option<Scripted<T>>,
}

impl<T> Default for Script<T> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            sticky: None,
        }
    }
}

impl<T: Clone> Script<T> {
    fn next(&mut self, what: &str) -> Result<T> {
        let step = match self.queue.pop_front() {
            Some(step) => step,
            None => self
                .sticky
                .clone()
                .ok_or_else(|| anyhow!("mock: no scripted response for {what}"))?,
        };
        step.map_err(MockFailure::into_error)
    }
}

#[derive(Debug, Default)]
struct ScanScripts {
    submit_full: Script<String>,
    submit_quick: Script<Value>,
    details: HashMap<String, Script<Value>>,
    history: Script<Vec<ScanHistoryEntry>>,
    recommendations: Script<Vec<Recommendation>>,
}

/// Mock scan service
#[derive(Clone, Default)]
pub struct MockScanService {
    scripts: Arc<Mutex<ScanScripts>>,
    calls: Arc<Mutex<Vec<String>>>,
    detail_delay: Arc<Mutex<Option<Duration>>>,
}

impl MockScanService {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn queue_submit(&self, response: Scripted<&str>) {
        let mut scripts = self.scripts.lock().await;
        scripts
            .submit_full
            .queue
            .push_back(response.map(str::to_string));
    }

    pub async fn queue_quick(&self, response: Scripted<Value>) {
        self.scripts.lock().await.submit_quick.queue.push_back(response);
    }

    /// Queue detail responses for `scan_id`, returned in order.
    pub async fn queue_details(&self, scan_id: &str, responses: Vec<Scripted<Value>>) {
        let mut scripts = self.scripts.lock().await;
        scripts
            .details
            .entry(scan_id.to_string())
            .or_default()
            .queue
            .extend(responses);
    }

    /// Detail response returned for `scan_id` once its queue is empty.
    pub async fn repeat_detail(&self, scan_id: &str, response: Scripted<Value>) {
        let mut scripts = self.scripts.lock().await;
        scripts
            .details
            .entry(scan_id.to_string())
            .or_default()
            .sticky = Some(response);
    }

    pub async fn set_history(&self, response: Scripted<Vec<ScanHistoryEntry>>) {
        self.scripts.lock().await.history.sticky = Some(response);
    }

    pub async fn set_recommendations(&self, response: Scripted<Vec<Recommendation>>) {
        self.scripts.lock().await.recommendations.sticky = Some(response);
    }

    /// Make every detail request take `delay` before answering.
    pub async fn set_detail_delay(&self, delay: Duration) {
        *self.detail_delay.lock().await = Some(delay);
    }

    /// Calls made so far, as `"method:argument"`.
    pub async fn calls(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }

    pub async fn count_calls(&self, method: &str) -> usize {
        let prefix = format!("{method}:");
        self.calls
            .lock()
            .await
            .iter()
            .filter(|c| c.starts_with(&prefix))
            .count()
    }

    async fn record(&self, method: &str, arg: &str) {
        self.calls.lock().await.push(format!("{method}:{arg}"));
    }
}

#[async_trait]
impl ScanService for MockScanService {
    async fn submit_full(&self, target_id: &str) -> Result<String> {
        self.record("submit_full", target_id).await;
        self.scripts.lock().await.submit_full.next("submit_full")
    }

    async fn submit_quick(&self, target_id: &str) -> Result<Value> {
        self.record("submit_quick", target_id).await;
        self.scripts.lock().await.submit_quick.next("submit_quick")
    }

    async fn scan_detail(&self, scan_id: &str) -> Result<Value> {
        self.record("scan_detail", scan_id).await;
        let delay = *self.detail_delay.lock().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut scripts = self.scripts.lock().await;
        scripts
            .details
            .entry(scan_id.to_string())
            .or_default()
            .next("scan_detail")
    }

    async fn scan_history(&self, target_id: &str) -> Result<Vec<ScanHistoryEntry>> {
        self.record("scan_history", target_id).await;
        self.scripts.lock().await.history.next("scan_history")
    }

    async fn recommendations(&self, target_id: &str) -> Result<Vec<Recommendation>> {
        self.record("recommendations", target_id).await;
        self.scripts.lock().await.recommendations.next("recommendations")
    }
}

#[derive(Debug, Default)]
struct MonitoringScripts {
    single: HashMap<String, Script<Value>>,
    batch: Script<Vec<Value>>,
}

/// Mock monitoring service
#[derive(Clone, Default)]
pub struct MockMonitoringService {
    scripts: Arc<Mutex<MonitoringScripts>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl MockMonitoringService {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_check(&self, target_id: &str, response: Scripted<Value>) {
        let mut scripts = self.scripts.lock().await;
        scripts
            .single
            .entry(target_id.to_string())
            .or_default()
            .sticky = Some(response);
    }

    pub async fn queue_check_all(&self, response: Scripted<Vec<Value>>) {
        self.scripts.lock().await.batch.queue.push_back(response);
    }

    pub async fn calls(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl MonitoringService for MockMonitoringService {
    async fn check_server(&self, target_id: &str) -> Result<Value> {
        self.calls.lock().await.push(format!("check_server:{target_id}"));
        let mut scripts = self.scripts.lock().await;
        scripts
            .single
            .entry(target_id.to_string())
            .or_default()
            .next("check_server")
    }

    async fn check_all_servers(&self) -> Result<Vec<Value>> {
        self.calls.lock().await.push("check_all_servers:".to_string());
        self.scripts.lock().await.batch.next("check_all_servers")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn queued_then_sticky_details() {
        let mock = MockScanService::new();
        mock.queue_details("j1", vec![Ok(json!({"status": "queued"}))])
            .await;
        mock.repeat_detail("j1", Ok(json!({"status": "in_progress"})))
            .await;

        assert_eq!(mock.scan_detail("j1").await.unwrap()["status"], "queued");
        assert_eq!(mock.scan_detail("j1").await.unwrap()["status"], "in_progress");
        assert_eq!(mock.scan_detail("j1").await.unwrap()["status"], "in_progress");
        assert!(mock.scan_detail("other").await.is_err());
        assert_eq!(mock.count_calls("scan_detail").await, 4);
    }

    #[tokio::test]
    async fn status_failures_become_http_errors() {
        let mock = MockScanService::new();
        mock.set_history(Err(MockFailure::Status(404, "Server not found".into())))
            .await;
        let err = mock.scan_history("srv-1").await.unwrap_err();
        assert!(err.downcast_ref::<HttpStatusError>().unwrap().is_not_found());
    }
}
