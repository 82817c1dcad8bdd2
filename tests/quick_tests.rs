use std::sync::Arc;

use hostwatch_rs::error::ScanError;
use hostwatch_rs::quick::QuickCheckRunner;
use hostwatch_rs::service::mock::{MockFailure, MockScanService};
use hostwatch_rs::severity::Severity;
use hostwatch_rs::types::ResultShape;
use serde_json::json;

#[tokio::test]
async fn inline_result_needs_no_detail_fetch() {
    let mock = Arc::new(MockScanService::new());
    mock.queue_quick(Ok(json!({"overall_risk": "low", "checks": {"ssl": {"secure": true}}})))
        .await;

    let scan = QuickCheckRunner::new(mock.clone()).run("srv-1").await.unwrap();
    assert_eq!(scan.shape, ResultShape::Quick);
    assert_eq!(scan.risk_level, Severity::Low);
    assert!(scan.vulnerabilities.is_empty());
    assert_eq!(mock.calls().await, ["submit_quick:srv-1"]);
}

#[tokio::test]
async fn completed_reference_fetches_detail_once() {
    let mock = Arc::new(MockScanService::new());
    mock.queue_quick(Ok(json!({"scan_id": "q9", "status": "completed"})))
        .await;
    mock.queue_details(
        "q9",
        vec![Ok(json!({
            "status": "completed",
            "risk_level": "medium",
            "vulnerabilities": [
                {"severity": "LOW", "type": "banner", "description": "server banner disclosed"},
                {"severity": "Medium", "type": "ssl", "description": "TLS 1.0 enabled", "port": "443"}
            ],
            "scan_details": {"open_ports": [22, 443]}
        }))],
    )
    .await;

    let scan = QuickCheckRunner::new(mock.clone()).run("srv-1").await.unwrap();
    assert_eq!(scan.risk_level, Severity::Medium);
    assert_eq!(scan.vulnerabilities[0].kind, "ssl");
    assert_eq!(scan.vulnerabilities[0].port, Some(443));
    assert_eq!(scan.open_ports.items, ["22", "443"]);
    assert_eq!(mock.count_calls("scan_detail").await, 1);
}

#[tokio::test]
async fn failed_reference_is_terminal_without_fetch() {
    let mock = Arc::new(MockScanService::new());
    mock.queue_quick(Ok(json!({"scan_id": 3, "status": "failed", "error_message": "host unreachable"})))
        .await;

    let err = QuickCheckRunner::new(mock.clone()).run("srv-1").await.unwrap_err();
    assert_eq!(err.to_string(), "scan 3 failed: host unreachable");
    assert_eq!(mock.count_calls("scan_detail").await, 0);
}

#[tokio::test]
async fn detail_fetch_failure_is_a_quick_check_error() {
    let mock = Arc::new(MockScanService::new());
    mock.queue_quick(Ok(json!({"scan_id": "q1", "status": "in_progress"})))
        .await;
    mock.queue_details("q1", vec![Err(MockFailure::Status(500, "boom".into()))])
        .await;

    let err = QuickCheckRunner::new(mock).run("srv-1").await.unwrap_err();
    assert!(matches!(err, ScanError::QuickCheck { ref target_id, .. } if target_id == "srv-1"));
}

#[tokio::test]
async fn submit_failure_is_a_quick_check_error() {
    let mock = Arc::new(MockScanService::new());
    mock.queue_quick(Err(MockFailure::Transport("connection refused".into())))
        .await;

    let err = QuickCheckRunner::new(mock).run("srv-1").await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "quick scan for target srv-1 failed: connection refused"
    );
}
