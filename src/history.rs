//! Scan history and the per-target security dashboard.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{describe, ScanError};
use crate::normalize::normalize;
use crate::service::http::HttpStatusError;
use crate::service::ScanService;
use crate::severity::Severity;
use crate::types::{Finding, HistoryStatus, NormalizedScan, Recommendation, ScanHistoryEntry};

/// Findings per severity bucket. Unknown-severity findings are not counted.
#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeverityCounts {
    pub critical: u32,
    pub high: u32,
    pub medium: u32,
    pub low: u32,
}

impl SeverityCounts {
    pub fn from_findings(findings: &[Finding]) -> Self {
        findings
            .iter()
            .fold(Self::default(), |mut counts, f| {
                match f.severity {
                    Severity::Critical => counts.critical += 1,
                    Severity::High => counts.high += 1,
                    Severity::Medium => counts.medium += 1,
                    Severity::Low => counts.low += 1,
                    Severity::Unknown => {}
                }
                counts
            })
    }

    pub fn total(&self) -> u32 {
        self.critical + self.high + self.medium + self.low
    }
}

/// Severity counts for the dashboard header.
///
/// History entries only carry a `vulnerability_count`, so buckets are taken
/// from the currently displayed scan alone and never re-aggregated across
/// the timeline.
pub fn summarize(_history: &[ScanHistoryEntry], current: Option<&NormalizedScan>) -> SeverityCounts {
    current
        .map(|scan| SeverityCounts::from_findings(&scan.vulnerabilities))
        .unwrap_or_default()
}

/// Most recent completed entry, by `started_at` (falling back to
/// `completed_at`). On ties the entry listed first wins.
pub fn default_current(history: &[ScanHistoryEntry]) -> Option<&ScanHistoryEntry> {
    let mut best: Option<&ScanHistoryEntry> = None;
    for entry in history
        .iter()
        .filter(|e| e.status == HistoryStatus::Completed)
    {
        match best {
            Some(b) if sort_key(entry) <= sort_key(b) => {}
            _ => best = Some(entry),
        }
    }
    best
}

// RFC 3339 strings from one service compare chronologically as text.
fn sort_key(entry: &ScanHistoryEntry) -> Option<&str> {
    entry
        .started_at
        .as_deref()
        .or(entry.completed_at.as_deref())
}

/// Everything the security panel of one target shows.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct SecurityDashboard {
    pub target_id: String,
    pub history: Vec<ScanHistoryEntry>,
    /// Scan whose detail is shown; `None` when nothing completed yet or the
    /// detail could not be fetched.
    pub selected_scan_id: Option<String>,
    pub current: Option<Arc<NormalizedScan>>,
    pub counts: SeverityCounts,
    /// Standalone recommendations for the target (not tied to one scan).
    pub recommendations: Vec<Recommendation>,
}

impl SecurityDashboard {
    pub fn empty(target_id: impl Into<String>) -> Self {
        Self {
            target_id: target_id.into(),
            history: Vec::new(),
            selected_scan_id: None,
            current: None,
            counts: SeverityCounts::default(),
            recommendations: Vec::new(),
        }
    }

    /// Fetch history, the latest completed scan's detail and the target's
    /// recommendations. Only a failing history fetch fails the load.
    pub async fn load<S>(service: &S, target_id: &str) -> Result<Self, ScanError>
    where
        S: ScanService + ?Sized,
    {
        let history = match service.scan_history(target_id).await {
            Ok(history) => history,
            Err(e) if is_not_found(&e) => {
                debug!(target_id, "no scan history");
                Vec::new()
            }
            Err(e) => {
                return Err(ScanError::History {
                    target_id: target_id.to_string(),
                    reason: describe(&e),
                })
            }
        };

        let mut dashboard = Self::empty(target_id);
        dashboard.history = history;

        if let Some(scan_id) = default_current(&dashboard.history).map(|e| e.id.clone()) {
            match service.scan_detail(&scan_id).await {
                Ok(detail) => {
                    dashboard.selected_scan_id = Some(scan_id);
                    dashboard.current = Some(Arc::new(normalize(&detail)));
                }
                Err(e) => {
                    warn!(target_id, %scan_id, error = %describe(&e), "could not load latest scan detail")
                }
            }
        }

        dashboard.recommendations = match service.recommendations(target_id).await {
            Ok(recs) => recs,
            Err(e) if is_not_found(&e) => Vec::new(),
            Err(e) => {
                warn!(target_id, error = %describe(&e), "could not load recommendations");
                Vec::new()
            }
        };

        dashboard.recount();
        Ok(dashboard)
    }

    /// Show a specific scan from the timeline instead of the default one.
    pub async fn select<S>(&mut self, service: &S, scan_id: &str) -> Result<(), ScanError>
    where
        S: ScanService + ?Sized,
    {
        let detail = service
            .scan_detail(scan_id)
            .await
            .map_err(|e| ScanError::History {
                target_id: self.target_id.clone(),
                reason: describe(&e),
            })?;
        self.selected_scan_id = Some(scan_id.to_string());
        self.current = Some(Arc::new(normalize(&detail)));
        self.recount();
        Ok(())
    }

    /// Install a scan that just completed as the current one. A matching
    /// timeline entry is marked completed with the new figures.
    pub fn apply_completed(&mut self, scan: Arc<NormalizedScan>) {
        if let Some(id) = scan.scan_id.as_deref() {
            if let Some(entry) = self.history.iter_mut().find(|e| e.id == id) {
                entry.status = HistoryStatus::Completed;
                entry.risk_level = Some(scan.risk_level);
                entry.vulnerability_count =
                    u32::try_from(scan.vulnerabilities.len()).unwrap_or(u32::MAX);
                if scan.completed_at.is_some() {
                    entry.completed_at = scan.completed_at.clone();
                }
            }
        }
        self.selected_scan_id = scan.scan_id.clone();
        self.current = Some(scan);
        self.recount();
    }

    fn recount(&mut self) {
        self.counts = summarize(&self.history, self.current.as_deref());
    }
}

fn is_not_found(err: &anyhow::Error) -> bool {
    err.downcast_ref::<HttpStatusError>()
        .is_some_and(HttpStatusError::is_not_found)
}
