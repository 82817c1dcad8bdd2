//! Scan job life cycle.
//!
//! `start` submits a scan and hands back a [`ScanJobHandle`]; a background
//! task then owns the [`ScanJob`] and drives it through the state machine:
//!
//! ```text
//! Submitting --submit ok--> Polling --completed--> Completed
//!                           Polling --failed-----> Failed
//!                           Polling --budget-----> TimedOut
//!                           Polling --queued/running/transport error--> Polling
//! ```
//!
//! Only one status request is in flight per job. The job state, attempt
//! counter and cancellation token live together in [`PollLoop`]; observers
//! get read-only snapshots through a `watch` channel.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PollPolicy;
use crate::error::{describe, ScanError};
use crate::normalize::normalize;
use crate::quick::{failure_message, QuickResponse};
use crate::service::{RemoteStatus, ScanService};
use crate::types::{opaque_id, JobState, NormalizedScan, ScanJob, ScanKind};

/// State-change notifications for one job, in the order they happened.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanEvent {
    /// A status poll finished without a terminal answer. `status` is `None`
    /// when the poll itself failed and will be retried.
    Progress {
        attempts: u32,
        status: Option<RemoteStatus>,
    },
    Completed(Arc<NormalizedScan>),
    Failed { reason: String },
    TimedOut { attempts: u32 },
}

pub type ScanOutcome = Result<Arc<NormalizedScan>, ScanError>;

/// Starts scans. Every `start` produces an independent job; jobs against
/// the same target are neither merged nor serialized.
pub struct ScanJobController<S: ?Sized> {
    service: Arc<S>,
    policy: PollPolicy,
}

impl<S> ScanJobController<S>
where
    S: ScanService + ?Sized + 'static,
{
    pub fn new(service: Arc<S>, policy: PollPolicy) -> Self {
        Self { service, policy }
    }

    pub fn policy(&self) -> &PollPolicy {
        &self.policy
    }

    /// Submit a scan. On failure no job exists and nothing is polled.
    pub async fn start(&self, target_id: &str, kind: ScanKind) -> Result<ScanJobHandle, ScanError> {
        let submission_error = |e: anyhow::Error| ScanError::Submission {
            target_id: target_id.to_string(),
            reason: describe(&e),
        };

        let (job_id, grace, inline) = match kind {
            ScanKind::Full => {
                let id = self
                    .service
                    .submit_full(target_id)
                    .await
                    .map_err(submission_error)?;
                (id, self.policy.grace, None)
            }
            // The quick endpoint answers at once; a referenced job is already
            // settled or close to it, so polling starts without a grace period.
            ScanKind::Quick => {
                let body = self
                    .service
                    .submit_quick(target_id)
                    .await
                    .map_err(submission_error)?;
                match QuickResponse::classify(body) {
                    QuickResponse::Reference { scan_id, .. } => (scan_id, Duration::ZERO, None),
                    QuickResponse::Inline(body) => {
                        let id = body
                            .get("scan_id")
                            .and_then(opaque_id)
                            .unwrap_or_else(|| format!("quick-{target_id}"));
                        (id, Duration::ZERO, Some(body))
                    }
                }
            }
        };

        let mut job = ScanJob::new(job_id, target_id, kind, self.policy.max_attempts);
        if let Err(e) = job.advance(JobState::Polling) {
            warn!(error = %e, "fresh job refused to start polling");
        }
        info!(scan_id = %job.id, target_id, ?kind, "scan submitted");

        let cancel = CancellationToken::new();
        let (snapshot_tx, snapshot_rx) = watch::channel(job.clone());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let poll = PollLoop {
            service: Arc::clone(&self.service),
            interval: self.policy.interval,
            job: job.clone(),
            cancel: cancel.clone(),
            snapshot: snapshot_tx,
            events: events_tx,
        };
        let task = tokio::spawn(poll.run(grace, inline));

        Ok(ScanJobHandle {
            job_id: job.id,
            target_id: target_id.to_string(),
            kind,
            cancel,
            snapshot: snapshot_rx,
            events: events_rx,
            task,
        })
    }

    /// Stop polling `handle`'s job. Best effort: the service keeps working
    /// on it and a response already in flight is discarded. Always safe,
    /// including after the job settled.
    pub fn cancel(&self, handle: &ScanJobHandle) {
        handle.cancel();
    }
}

/// Caller's side of one running job.
pub struct ScanJobHandle {
    job_id: String,
    target_id: String,
    kind: ScanKind,
    cancel: CancellationToken,
    snapshot: watch::Receiver<ScanJob>,
    events: mpsc::UnboundedReceiver<ScanEvent>,
    task: JoinHandle<ScanOutcome>,
}

impl ScanJobHandle {
    pub fn id(&self) -> &str {
        &self.job_id
    }

    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    pub fn kind(&self) -> ScanKind {
        self.kind
    }

    /// Current copy of the job record.
    pub fn snapshot(&self) -> ScanJob {
        self.snapshot.borrow().clone()
    }

    /// Follow job record changes independently of this handle.
    pub fn subscribe(&self) -> watch::Receiver<ScanJob> {
        self.snapshot.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Next notification; `None` once the job has settled and every event
    /// was delivered.
    pub async fn next_event(&mut self) -> Option<ScanEvent> {
        self.events.recv().await
    }

    /// Wait for the job to settle.
    pub async fn wait(self) -> ScanOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_cancelled() => Err(ScanError::Cancelled {
                scan_id: self.job_id,
            }),
            Err(e) => Err(ScanError::TerminalFailure {
                scan_id: self.job_id,
                message: Some(format!("scan task aborted: {e}")),
            }),
        }
    }
}

/// Everything one job's polling needs, owned by its task.
struct PollLoop<S: ?Sized> {
    service: Arc<S>,
    interval: Duration,
    job: ScanJob,
    cancel: CancellationToken,
    snapshot: watch::Sender<ScanJob>,
    events: mpsc::UnboundedSender<ScanEvent>,
}

impl<S> PollLoop<S>
where
    S: ScanService + ?Sized,
{
    async fn run(mut self, grace: Duration, inline: Option<Value>) -> ScanOutcome {
        if let Some(body) = inline {
            return Ok(self.complete(&body));
        }
        if !self.pause(grace).await {
            return Err(self.cancelled());
        }

        loop {
            if !self.job.record_attempt() {
                return Err(self.time_out());
            }
            self.publish();

            let polled = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(self.cancelled()),
                res = self.service.scan_detail(&self.job.id) => res,
            };
            // Cancelled while the answer was on its way: drop it.
            if self.cancel.is_cancelled() {
                return Err(self.cancelled());
            }

            match polled {
                Ok(detail) => match RemoteStatus::of(&detail) {
                    RemoteStatus::Completed => return Ok(self.complete(&detail)),
                    RemoteStatus::Failed => return Err(self.fail(failure_message(&detail))),
                    status => {
                        debug!(scan_id = %self.job.id, attempts = self.job.attempts, status = status.as_str(), "scan still running");
                        self.emit(ScanEvent::Progress {
                            attempts: self.job.attempts,
                            status: Some(status),
                        });
                    }
                },
                Err(e) => {
                    debug!(scan_id = %self.job.id, attempts = self.job.attempts, error = %describe(&e), "status check failed, will retry");
                    self.emit(ScanEvent::Progress {
                        attempts: self.job.attempts,
                        status: None,
                    });
                }
            }

            if !self.pause(self.interval).await {
                return Err(self.cancelled());
            }
        }
    }

    /// Sleep unless cancelled first. Returns false on cancellation.
    async fn pause(&self, delay: Duration) -> bool {
        if delay.is_zero() {
            return !self.cancel.is_cancelled();
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = time::sleep(delay) => true,
        }
    }

    fn complete(&mut self, detail: &Value) -> Arc<NormalizedScan> {
        let scan = Arc::new(normalize(detail));
        self.settle(JobState::Completed);
        info!(
            scan_id = %self.job.id,
            attempts = self.job.attempts,
            risk = %scan.risk_level,
            findings = scan.vulnerabilities.len(),
            "scan completed"
        );
        self.emit(ScanEvent::Completed(Arc::clone(&scan)));
        scan
    }

    fn fail(&mut self, message: Option<String>) -> ScanError {
        self.settle(JobState::Failed);
        let err = ScanError::TerminalFailure {
            scan_id: self.job.id.clone(),
            message,
        };
        warn!(scan_id = %self.job.id, error = %err, "scan failed");
        self.emit(ScanEvent::Failed {
            reason: err.to_string(),
        });
        err
    }

    fn time_out(&mut self) -> ScanError {
        self.settle(JobState::TimedOut);
        warn!(scan_id = %self.job.id, attempts = self.job.attempts, "scan is taking too long, giving up");
        self.emit(ScanEvent::TimedOut {
            attempts: self.job.attempts,
        });
        ScanError::Timeout {
            scan_id: self.job.id.clone(),
            attempts: self.job.attempts,
        }
    }

    fn cancelled(&self) -> ScanError {
        debug!(scan_id = %self.job.id, "polling cancelled");
        ScanError::Cancelled {
            scan_id: self.job.id.clone(),
        }
    }

    fn settle(&mut self, state: JobState) {
        if let Err(e) = self.job.advance(state) {
            warn!(scan_id = %self.job.id, error = %e, "ignoring invalid transition");
        }
        self.publish();
    }

    fn publish(&self) {
        self.snapshot.send_replace(self.job.clone());
    }

    fn emit(&self, event: ScanEvent) {
        // The handle may have been dropped; the job still settles.
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::mock::{MockFailure, MockScanService};
    use serde_json::json;

    fn policy(max_attempts: u32) -> PollPolicy {
        PollPolicy {
            grace: Duration::from_secs(2),
            interval: Duration::from_secs(3),
            max_attempts,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn submission_failure_creates_no_job() {
        let mock = Arc::new(MockScanService::new());
        mock.queue_submit(Err(MockFailure::Status(404, "Server not found".into())))
            .await;
        let controller = ScanJobController::new(mock.clone(), policy(3));

        let err = controller.start("srv-x", ScanKind::Full).await.err().unwrap();
        assert!(matches!(err, ScanError::Submission { .. }));
        assert!(err.to_string().contains("Server not found"));
        assert_eq!(mock.count_calls("scan_detail").await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn first_poll_waits_for_grace_period() {
        let mock = Arc::new(MockScanService::new());
        mock.queue_submit(Ok("j1")).await;
        mock.repeat_detail("j1", Ok(json!({"status": "completed"})))
            .await;
        let controller = ScanJobController::new(mock.clone(), policy(3));

        let started = time::Instant::now();
        let handle = controller.start("srv-1", ScanKind::Full).await.unwrap();
        handle.wait().await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_status_carries_service_message() {
        let mock = Arc::new(MockScanService::new());
        mock.queue_submit(Ok("j2")).await;
        mock.queue_details(
            "j2",
            vec![
                Ok(json!({"status": "in_progress"})),
                Ok(json!({"status": "failed", "error_message": "nmap not installed"})),
            ],
        )
        .await;
        let controller = ScanJobController::new(mock.clone(), policy(5));

        let mut handle = controller.start("srv-1", ScanKind::Full).await.unwrap();
        let mut events = Vec::new();
        while let Some(ev) = handle.next_event().await {
            events.push(ev);
        }
        assert!(matches!(events.last(), Some(ScanEvent::Failed { reason }) if reason.contains("nmap not installed")));
        let job = handle.snapshot();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempts, 2);
        let err = handle.wait().await.unwrap_err();
        assert_eq!(
            err,
            ScanError::TerminalFailure {
                scan_id: "j2".into(),
                message: Some("nmap not installed".into())
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn quick_inline_resolves_without_polling() {
        let mock = Arc::new(MockScanService::new());
        mock.queue_quick(Ok(json!({"overall_risk": "medium", "checks": {}})))
            .await;
        let controller = ScanJobController::new(mock.clone(), policy(3));

        let handle = controller.start("srv-1", ScanKind::Quick).await.unwrap();
        assert_eq!(handle.id(), "quick-srv-1");
        let scan = handle.wait().await.unwrap();
        assert_eq!(scan.risk_level, crate::severity::Severity::Medium);
        assert_eq!(mock.count_calls("scan_detail").await, 0);
    }
}
