use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info};

use crate::error::{describe, ScanError};
use crate::normalize::normalize;
use crate::service::{RemoteStatus, ScanService};
use crate::types::{opaque_id, NormalizedScan};

/// What the quick-scan endpoint answered with.
#[derive(Debug, Clone, PartialEq)]
pub enum QuickResponse {
    /// A result body to normalize as-is.
    Inline(Value),
    /// A stored job whose full detail has to be fetched.
    Reference {
        scan_id: String,
        status: RemoteStatus,
        body: Value,
    },
}

impl QuickResponse {
    /// A body is a job reference when it names a `scan_id` and either says
    /// the job is done (completed/failed) or carries no inline result fields.
    pub fn classify(body: Value) -> Self {
        let Some(scan_id) = body.get("scan_id").and_then(opaque_id) else {
            return QuickResponse::Inline(body);
        };
        let status = RemoteStatus::of(&body);
        let has_inline = body.get("checks").is_some() || body.get("overall_risk").is_some();
        let settled = matches!(status, RemoteStatus::Completed | RemoteStatus::Failed);
        if settled || !has_inline {
            QuickResponse::Reference {
                scan_id,
                status,
                body,
            }
        } else {
            QuickResponse::Inline(body)
        }
    }
}

/// Fire-and-wait quick scan: one submission, at most one detail fetch, no polling.
pub struct QuickCheckRunner<S: ?Sized> {
    service: Arc<S>,
}

impl<S: ScanService + ?Sized> QuickCheckRunner<S> {
    pub fn new(service: Arc<S>) -> Self {
        Self { service }
    }

    pub async fn run(&self, target_id: &str) -> Result<NormalizedScan, ScanError> {
        let body = self
            .service
            .submit_quick(target_id)
            .await
            .map_err(|e| ScanError::QuickCheck {
                target_id: target_id.to_string(),
                reason: describe(&e),
            })?;
        let scan = self.resolve(target_id, QuickResponse::classify(body)).await?;
        info!(target_id, risk = %scan.risk_level, findings = scan.vulnerabilities.len(), "quick scan finished");
        Ok(scan)
    }

    async fn resolve(
        &self,
        target_id: &str,
        response: QuickResponse,
    ) -> Result<NormalizedScan, ScanError> {
        match response {
            QuickResponse::Inline(body) => {
                debug!(target_id, "quick scan answered inline");
                Ok(normalize(&body))
            }
            QuickResponse::Reference {
                scan_id,
                status: RemoteStatus::Failed,
                body,
            } => Err(ScanError::TerminalFailure {
                message: failure_message(&body),
                scan_id,
            }),
            QuickResponse::Reference { scan_id, .. } => {
                debug!(target_id, %scan_id, "quick scan answered with a job reference");
                let detail = self.service.scan_detail(&scan_id).await.map_err(|e| {
                    ScanError::QuickCheck {
                        target_id: target_id.to_string(),
                        reason: describe(&e),
                    }
                })?;
                if RemoteStatus::of(&detail) == RemoteStatus::Failed {
                    return Err(ScanError::TerminalFailure {
                        message: failure_message(&detail),
                        scan_id,
                    });
                }
                Ok(normalize(&detail))
            }
        }
    }
}

/// Service-provided reason for a failed job, if any.
pub(crate) fn failure_message(detail: &Value) -> Option<String> {
    ["error_message", "message", "detail"]
        .iter()
        .find_map(|k| detail.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn inline_without_scan_id() {
        let body = json!({"overall_risk": "low", "checks": {}});
        assert!(matches!(QuickResponse::classify(body), QuickResponse::Inline(_)));
    }

    #[test]
    fn completed_reference_is_fetched_even_with_inline_fields() {
        let body = json!({"scan_id": 4, "status": "completed", "overall_risk": "high", "checks": {}});
        match QuickResponse::classify(body) {
            QuickResponse::Reference { scan_id, status, .. } => {
                assert_eq!(scan_id, "4");
                assert_eq!(status, RemoteStatus::Completed);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn bare_reference_without_inline_fields() {
        let body = json!({"scan_id": "q1", "status": "in_progress"});
        assert!(matches!(
            QuickResponse::classify(body),
            QuickResponse::Reference { status: RemoteStatus::InProgress, .. }
        ));
    }

    #[test]
    fn pending_reference_with_inline_fields_stays_inline() {
        let body = json!({"scan_id": "q1", "status": "in_progress", "checks": {}});
        assert!(matches!(QuickResponse::classify(body), QuickResponse::Inline(_)));
    }

    #[test]
    fn failure_message_prefers_error_message() {
        let detail = json!({"error_message": " nmap missing ", "message": "other"});
        assert_eq!(failure_message(&detail).as_deref(), Some("nmap missing"));
        assert_eq!(failure_message(&json!({"error_message": ""})), None);
    }
}
