//! Errors surfaced by the scan life cycle and the health poller.
//!
//! Transient poll failures never appear here: they are logged, counted
//! against the attempt budget and retried. An unrecognised result payload is
//! not an error either; see [`crate::types::NormalizedScan::is_fallback`].

use thiserror::Error;

use crate::types::JobState;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScanError {
    /// The service refused or never received the submission. No job exists.
    #[error("could not start scan for target {target_id}: {reason}")]
    Submission { target_id: String, reason: String },

    /// The service reported `status = failed` for the job.
    #[error("scan {scan_id} failed: {}", .message.as_deref().unwrap_or("unknown error"))]
    TerminalFailure {
        scan_id: String,
        message: Option<String>,
    },

    /// The attempt budget ran out while the job was still queued or running.
    #[error("scan {scan_id} is taking too long ({attempts} status checks); refresh later")]
    Timeout { scan_id: String, attempts: u32 },

    /// Local polling was stopped by the caller.
    #[error("scan {scan_id} was cancelled")]
    Cancelled { scan_id: String },

    #[error("quick scan for target {target_id} failed: {reason}")]
    QuickCheck { target_id: String, reason: String },

    #[error("could not load scan history for target {target_id}: {reason}")]
    History { target_id: String, reason: String },

    #[error("health check for target {target_id} failed: {reason}")]
    HealthCheck { target_id: String, reason: String },

    /// The batch call failed as a whole; no target was updated.
    #[error("checking all servers failed: {reason}")]
    HealthBatch { reason: String },
}

impl ScanError {
    /// Timeouts suggest "refresh later" rather than "the scan broke".
    pub fn is_retryable_later(&self) -> bool {
        matches!(self, ScanError::Timeout { .. })
    }
}

/// Rejected edge in the job state machine.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("invalid job transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: JobState,
    pub to: JobState,
}

/// Render an `anyhow` chain on one line for user-facing messages.
pub(crate) fn describe(err: &anyhow::Error) -> String {
    format!("{err:#}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_failure_message_defaults() {
        let err = ScanError::TerminalFailure {
            scan_id: "j1".into(),
            message: None,
        };
        assert_eq!(err.to_string(), "scan j1 failed: unknown error");
        let err = ScanError::TerminalFailure {
            scan_id: "j1".into(),
            message: Some("host unreachable".into()),
        };
        assert_eq!(err.to_string(), "scan j1 failed: host unreachable");
    }

    #[test]
    fn only_timeout_is_retryable_later() {
        let timeout = ScanError::Timeout {
            scan_id: "j1".into(),
            attempts: 30,
        };
        assert!(timeout.is_retryable_later());
        assert!(!ScanError::Cancelled {
            scan_id: "j1".into()
        }
        .is_retryable_later());
    }

    #[test]
    fn describe_includes_context_chain() {
        let err = anyhow::anyhow!("connection refused").context("GET /security/scan/1");
        assert_eq!(describe(&err), "GET /security/scan/1: connection refused");
    }
}
