//! Host reachability board.
//!
//! The board keeps the last known [`HealthResult`] per target. It only ever
//! moves forward on fresh data: failed calls and incomplete batch responses
//! leave existing entries untouched.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{describe, ScanError};
use crate::service::MonitoringService;
use crate::types::{HealthResult, HostStatus};

pub struct HealthPoller<M: ?Sized> {
    service: Arc<M>,
    board: RwLock<BTreeMap<String, HealthResult>>,
}

impl<M: MonitoringService + ?Sized> HealthPoller<M> {
    pub fn new(service: Arc<M>) -> Self {
        Self {
            service,
            board: RwLock::new(BTreeMap::new()),
        }
    }

    /// Check one target and record the result.
    pub async fn check_one(&self, target_id: &str) -> Result<HealthResult, ScanError> {
        let check_error = |reason: String| ScanError::HealthCheck {
            target_id: target_id.to_string(),
            reason,
        };
        let body = self
            .service
            .check_server(target_id)
            .await
            .map_err(|e| check_error(describe(&e)))?;
        let mut result = HealthResult::from_value(&body, Some(target_id))
            .ok_or_else(|| check_error("unexpected check payload".to_string()))?;
        result.target_id = target_id.to_string();

        debug!(target_id, status = ?result.status, ms = ?result.response_time_ms, "health checked");
        self.board
            .write()
            .await
            .insert(result.target_id.clone(), result.clone());
        Ok(result)
    }

    /// Check many targets with one batch call.
    ///
    /// The whole batch fails or succeeds: on error nothing is updated.
    /// Requested targets missing from the response keep their previous result
    /// (or an unchecked placeholder that is not stored). Results for targets
    /// that were not requested are ignored. An empty request applies every
    /// result the service returned.
    pub async fn check_all(&self, target_ids: &[String]) -> Result<Vec<HealthResult>, ScanError> {
        let items = self
            .service
            .check_all_servers()
            .await
            .map_err(|e| ScanError::HealthBatch {
                reason: describe(&e),
            })?;

        let mut fresh: HashMap<String, HealthResult> = HashMap::new();
        for item in &items {
            match HealthResult::from_value(item, None) {
                Some(result) => {
                    fresh.insert(result.target_id.clone(), result);
                }
                None => warn!("skipping health result without a target id"),
            }
        }

        let mut board = self.board.write().await;
        if target_ids.is_empty() {
            let mut all: Vec<HealthResult> = fresh.into_values().collect();
            all.sort_by(|a, b| a.target_id.cmp(&b.target_id));
            for result in &all {
                board.insert(result.target_id.clone(), result.clone());
            }
            info!(updated = all.len(), "health batch applied");
            return Ok(all);
        }

        let mut updated = 0;
        let results: Vec<HealthResult> = target_ids
            .iter()
            .map(|id| match fresh.remove(id) {
                Some(result) => {
                    updated += 1;
                    board.insert(id.clone(), result.clone());
                    result
                }
                None => {
                    debug!(target_id = %id, "missing from batch response, keeping last result");
                    board
                        .get(id)
                        .cloned()
                        .unwrap_or_else(|| HealthResult::unchecked(id.as_str()))
                }
            })
            .collect();
        info!(requested = target_ids.len(), updated, "health batch applied");
        Ok(results)
    }

    /// Snapshot of every known result, ordered by target id.
    pub async fn board(&self) -> Vec<HealthResult> {
        self.board.read().await.values().cloned().collect()
    }

    pub async fn result_of(&self, target_id: &str) -> Option<HealthResult> {
        self.board.read().await.get(target_id).cloned()
    }

    pub async fn status_of(&self, target_id: &str) -> HostStatus {
        self.result_of(target_id)
            .await
            .map(|r| r.status)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::mock::{MockFailure, MockMonitoringService};
    use serde_json::json;

    #[tokio::test]
    async fn check_one_records_result_under_requested_id() {
        let mock = Arc::new(MockMonitoringService::new());
        mock.set_check("7", Ok(json!({"id": 7, "status": "online", "response_time": 3.6})))
            .await;
        let poller = HealthPoller::new(mock.clone());

        let result = poller.check_one("7").await.unwrap();
        assert_eq!(result.response_time_ms, Some(4));
        assert_eq!(poller.status_of("7").await, HostStatus::Online);
        assert_eq!(poller.status_of("8").await, HostStatus::Unknown);
    }

    #[tokio::test]
    async fn failed_single_check_keeps_previous() {
        let mock = Arc::new(MockMonitoringService::new());
        mock.set_check("a", Ok(json!({"status": "online"}))).await;
        let poller = HealthPoller::new(mock.clone());
        poller.check_one("a").await.unwrap();

        mock.set_check("a", Err(MockFailure::Transport("connection reset".into())))
            .await;
        let err = poller.check_one("a").await.unwrap_err();
        assert!(matches!(err, ScanError::HealthCheck { .. }));
        assert_eq!(poller.status_of("a").await, HostStatus::Online);
    }

    #[tokio::test]
    async fn empty_request_applies_whole_batch() {
        let mock = Arc::new(MockMonitoringService::new());
        mock.queue_check_all(Ok(vec![
            json!({"id": 2, "status": "offline"}),
            json!({"id": 1, "status": "online"}),
            json!("garbage"),
        ]))
        .await;
        let poller = HealthPoller::new(mock.clone());

        let results = poller.check_all(&[]).await.unwrap();
        let ids: Vec<_> = results.iter().map(|r| r.target_id.as_str()).collect();
        assert_eq!(ids, ["1", "2"]);
        assert_eq!(poller.board().await.len(), 2);
    }
}
