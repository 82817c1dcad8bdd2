use ::time::{format_description::well_known, OffsetDateTime};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::InvalidTransition;
use crate::severity::Severity;

/// Quick (synchronous, subset of probes) or full (asynchronous, polled) scan.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ScanKind {
    Quick,
    Full,
}

impl ScanKind {
    /// Anything that is not explicitly "quick" is a full scan
    /// ("standard" and "deep" are full-scan depths on the service side).
    pub fn from_label(label: &str) -> Self {
        if label.trim().eq_ignore_ascii_case("quick") {
            ScanKind::Quick
        } else {
            ScanKind::Full
        }
    }
}

/// Client-side life cycle of one scan job.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Submitting,
    Polling,
    Completed,
    Failed,
    TimedOut,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        JobState::Submitting,
        JobState::Polling,
        JobState::Completed,
        JobState::Failed,
        JobState::TimedOut,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::TimedOut
        )
    }

    /// Edges of the job state machine. Terminal states have no outgoing edges.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Submitting, Polling)
                | (Submitting, Failed)
                | (Polling, Polling)
                | (Polling, Completed)
                | (Polling, Failed)
                | (Polling, TimedOut)
        )
    }
}

/// One requested scan, as tracked by the controller that created it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScanJob {
    pub id: String,
    pub target_id: String,
    pub kind: ScanKind,
    pub state: JobState,
    pub attempts: u32,
    pub max_attempts: u32,
    pub started_at: String,
    pub resolved_at: Option<String>,
}

impl ScanJob {
    /// A job the service has just accepted under `id`, still in `Submitting`.
    pub fn new(
        id: impl Into<String>,
        target_id: impl Into<String>,
        kind: ScanKind,
        max_attempts: u32,
    ) -> Self {
        Self {
            id: id.into(),
            target_id: target_id.into(),
            kind,
            state: JobState::Submitting,
            attempts: 0,
            max_attempts,
            started_at: now_rfc3339(),
            resolved_at: None,
        }
    }

    /// Move to `next`, refusing any edge the state machine does not have.
    pub fn advance(&mut self, next: JobState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        if next.is_terminal() {
            self.resolved_at = Some(now_rfc3339());
        }
        Ok(())
    }

    /// Count one status poll. Returns false (and counts nothing) once the
    /// budget is spent or the job is no longer polling.
    pub fn record_attempt(&mut self) -> bool {
        if self.state != JobState::Polling || self.budget_exhausted() {
            return false;
        }
        self.attempts += 1;
        true
    }

    pub fn budget_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Which raw payload layout the normalizer recognised.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResultShape {
    /// Stored scan detail (`GET /security/scan/{id}`).
    Full,
    /// Inline quick-check body (`overall_risk` + `checks`).
    Quick,
    /// Raw scanner output with a `details` tree.
    Legacy,
    /// Nothing usable; defaults were substituted.
    Unrecognized,
}

/// A single detected vulnerability.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub severity: Severity,
    /// Severity string exactly as the service sent it.
    pub raw_severity: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub description: String,
    pub port: Option<u16>,
    pub service: Option<String>,
    pub cve_id: Option<String>,
    pub remediation: Option<String>,
}

impl Finding {
    pub fn rank(&self) -> u8 {
        self.severity.rank()
    }

    /// Display color. Informational findings keep their own blue even
    /// though they rank and count as low.
    pub fn color(&self) -> &'static str {
        match self.raw_severity.trim().to_ascii_lowercase().as_str() {
            "info" | "informational" => Severity::INFO_COLOR,
            _ => self.severity.color(),
        }
    }
}

/// Findings capped to a preview, plus the full count.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct FindingPreview {
    pub items: Vec<Finding>,
    pub total: usize,
}

impl FindingPreview {
    pub fn new(mut all: Vec<Finding>, limit: usize) -> Self {
        let total = all.len();
        all.truncate(limit);
        Self { items: all, total }
    }

    pub fn hidden(&self) -> usize {
        self.total.saturating_sub(self.items.len())
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }
}

/// One named check of a quick scan (`critical_ports`, `ssl`, ...).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CheckSummary {
    pub name: String,
    pub risk: Severity,
    pub secure: Option<bool>,
    pub protocol: Option<String>,
    pub error: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Recommendation {
    pub priority: Severity,
    pub raw_priority: String,
    pub category: String,
    pub action: String,
    pub details: String,
}

impl Recommendation {
    pub fn rank(&self) -> u8 {
        self.priority.rank()
    }
}

/// Deduplicated display strings capped to a preview, plus the full count.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct PreviewList {
    pub items: Vec<String>,
    pub total: usize,
}

impl PreviewList {
    pub fn new(mut all: Vec<String>, limit: usize) -> Self {
        let total = all.len();
        all.truncate(limit);
        Self { items: all, total }
    }

    /// Entries not shown in the preview ("+N more").
    pub fn hidden(&self) -> usize {
        self.total.saturating_sub(self.items.len())
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }
}

/// Canonical, presentation-ready scan result. Immutable once built.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NormalizedScan {
    pub shape: ResultShape,
    pub scan_id: Option<String>,
    pub status: Option<String>,
    pub risk_level: Severity,
    pub vulnerabilities: Vec<Finding>,
    pub recommendations: Vec<Recommendation>,
    pub open_ports: PreviewList,
    pub services: PreviewList,
    pub checks: Vec<CheckSummary>,
    pub critical_vulnerabilities: FindingPreview,
    /// Seconds, as reported by the scanner.
    pub scan_duration: Option<f64>,
    pub scan_type: Option<String>,
    pub error_message: Option<String>,
    pub completed_at: Option<String>,
    pub raw_details: Value,
}

impl NormalizedScan {
    /// The empty result substituted for unrecognised payloads.
    pub fn fallback(raw_details: Value) -> Self {
        Self {
            shape: ResultShape::Unrecognized,
            scan_id: None,
            status: None,
            risk_level: Severity::Unknown,
            vulnerabilities: Vec::new(),
            recommendations: Vec::new(),
            open_ports: PreviewList::default(),
            services: PreviewList::default(),
            checks: Vec::new(),
            critical_vulnerabilities: FindingPreview::default(),
            scan_duration: None,
            scan_type: None,
            error_message: None,
            completed_at: None,
            raw_details,
        }
    }

    pub fn is_fallback(&self) -> bool {
        self.shape == ResultShape::Unrecognized
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HistoryStatus {
    Completed,
    Failed,
    #[serde(alias = "running")]
    InProgress,
    #[serde(alias = "pending")]
    Queued,
}

/// Lightweight record of a past job for the timeline.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(from = "RawHistoryEntry")]
pub struct ScanHistoryEntry {
    pub id: String,
    pub kind: ScanKind,
    pub status: HistoryStatus,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub risk_level: Option<Severity>,
    pub vulnerability_count: u32,
}

#[derive(Deserialize)]
struct RawHistoryEntry {
    #[serde(deserialize_with = "deserialize_opaque_id")]
    id: String,
    #[serde(default, alias = "scan_type")]
    kind: Option<String>,
    status: HistoryStatus,
    #[serde(default)]
    started_at: Option<String>,
    #[serde(default)]
    completed_at: Option<String>,
    #[serde(default)]
    risk_level: Option<Severity>,
    #[serde(default)]
    vulnerability_count: Option<u32>,
}

impl From<RawHistoryEntry> for ScanHistoryEntry {
    fn from(raw: RawHistoryEntry) -> Self {
        let vulnerability_count = raw.vulnerability_count.unwrap_or(0);
        // Summaries from the service do not say which kind of scan they were;
        // quick checks only probe a handful of ports so they stay small.
        let kind = match raw.kind.as_deref() {
            Some(label) => ScanKind::from_label(label),
            None if vulnerability_count > 10 => ScanKind::Full,
            None => ScanKind::Quick,
        };
        Self {
            id: raw.id,
            kind,
            status: raw.status,
            started_at: raw.started_at,
            completed_at: raw.completed_at,
            risk_level: raw.risk_level,
            vulnerability_count,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum HostStatus {
    Online,
    Offline,
    #[default]
    Unknown,
}

impl HostStatus {
    pub fn classify(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "online" | "up" => HostStatus::Online,
            "offline" | "down" => HostStatus::Offline,
            _ => HostStatus::Unknown,
        }
    }
}

/// Reachability of one monitored host.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct HealthResult {
    pub target_id: String,
    pub status: HostStatus,
    pub response_time_ms: Option<u64>,
    pub message: Option<String>,
    pub checked_at: String,
}

impl HealthResult {
    /// Placeholder for a target that has never been checked.
    pub fn unchecked(target_id: impl Into<String>) -> Self {
        Self {
            target_id: target_id.into(),
            status: HostStatus::Unknown,
            response_time_ms: None,
            message: None,
            checked_at: String::new(),
        }
    }

    /// Decode one check result from the monitoring service. `fallback_id`
    /// is used when the payload does not name its target.
    pub fn from_value(value: &Value, fallback_id: Option<&str>) -> Option<Self> {
        let obj = value.as_object()?;
        let target_id = ["id", "target_id", "server_id"]
            .iter()
            .find_map(|k| obj.get(*k).and_then(opaque_id))
            .or_else(|| fallback_id.map(str::to_string))?;
        let status = obj
            .get("status")
            .and_then(Value::as_str)
            .map(HostStatus::classify)
            .unwrap_or_default();
        let response_time_ms = ["response_time_ms", "response_time"]
            .iter()
            .find_map(|k| obj.get(*k).and_then(Value::as_f64))
            .filter(|ms| *ms >= 0.0)
            .map(|ms| ms.round() as u64);
        let message = obj
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string);
        let checked_at = ["checked_at", "last_check"]
            .iter()
            .find_map(|k| obj.get(*k).and_then(Value::as_str))
            .map(str::to_string)
            .unwrap_or_else(now_rfc3339);
        Some(Self {
            target_id,
            status,
            response_time_ms,
            message,
            checked_at,
        })
    }
}

/// Ids are opaque: the service may send them as strings or numbers.
pub fn opaque_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn deserialize_opaque_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    opaque_id(&value).ok_or_else(|| serde::de::Error::custom("expected a string or numeric id"))
}

/// RFC 3339 UTC timestamp for the current instant.
pub fn now_rfc3339() -> String {
    let now = OffsetDateTime::now_utc();
    now.format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}
