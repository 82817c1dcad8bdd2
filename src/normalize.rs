//! Result normalization.
//!
//! The scan service answers with several payload layouts (stored scan
//! detail, inline quick-check body, raw scanner output) and stores some
//! structured fields as JSON-encoded strings. Everything is funnelled through
//! [`normalize`] so downstream code only ever sees [`NormalizedScan`].

use std::borrow::Cow;
use std::collections::HashSet;

use serde_json::{Map, Value};
use tracing::debug;

use crate::severity::Severity;
use crate::types::{
    opaque_id, CheckSummary, Finding, FindingPreview, NormalizedScan, PreviewList, Recommendation,
    ResultShape,
};

/// Open ports shown before collapsing into "+N more".
pub const PORT_PREVIEW: usize = 15;
/// Services shown before collapsing into "+N more".
pub const SERVICE_PREVIEW: usize = 12;
/// Critical findings from the scan details shown before "+N more".
pub const CRITICAL_PREVIEW: usize = 3;

/// Shape-detected view over a raw payload.
#[derive(Debug, Clone, Copy)]
enum RawResult<'a> {
    Full(&'a Map<String, Value>),
    Quick(&'a Map<String, Value>),
    Legacy(&'a Map<String, Value>),
    Unrecognized,
}

impl<'a> RawResult<'a> {
    fn detect(value: &'a Value) -> Self {
        let Some(obj) = value.as_object() else {
            return RawResult::Unrecognized;
        };
        if obj.contains_key("checks") || obj.contains_key("overall_risk") {
            RawResult::Quick(obj)
        } else if obj.contains_key("details") && !obj.contains_key("scan_details") {
            RawResult::Legacy(obj)
        } else if ["vulnerabilities", "recommendations", "scan_details", "risk_level", "status"]
            .iter()
            .any(|k| obj.contains_key(*k))
        {
            RawResult::Full(obj)
        } else {
            RawResult::Unrecognized
        }
    }

    fn shape(&self) -> ResultShape {
        match self {
            RawResult::Full(_) => ResultShape::Full,
            RawResult::Quick(_) => ResultShape::Quick,
            RawResult::Legacy(_) => ResultShape::Legacy,
            RawResult::Unrecognized => ResultShape::Unrecognized,
        }
    }
}

/// Normalize any raw payload. Never fails; unusable input yields
/// [`NormalizedScan::fallback`] carrying the input for diagnostics.
pub fn normalize(raw: &Value) -> NormalizedScan {
    // A whole payload delivered as a JSON string gets exactly one decode.
    let decoded = match raw {
        Value::String(text) => match serde_json::from_str::<Value>(text) {
            Ok(v) => Cow::Owned(v),
            Err(e) => {
                debug!(error = %e, "scan payload is not valid JSON, using fallback");
                return NormalizedScan::fallback(raw.clone());
            }
        },
        other => Cow::Borrowed(other),
    };

    let detected = RawResult::detect(&decoded);
    let obj = match detected {
        RawResult::Full(obj) | RawResult::Quick(obj) | RawResult::Legacy(obj) => obj,
        RawResult::Unrecognized => {
            debug!("unrecognised scan payload shape, using fallback");
            return NormalizedScan::fallback(decoded.into_owned());
        }
    };

    let mut vulnerabilities: Vec<Finding> = decode_list(obj.get("vulnerabilities"))
        .iter()
        .filter_map(finding_from)
        .collect();
    vulnerabilities.sort_by_key(Finding::rank);

    let recommendations = sorted_recommendations(&decode_list(obj.get("recommendations")));

    let stated_risk = match detected {
        RawResult::Quick(_) => obj.get("overall_risk").or_else(|| obj.get("risk_level")),
        _ => obj.get("risk_level"),
    };
    let risk_level = resolve_risk(stated_risk, &vulnerabilities);

    let scan_details = decode_field(obj.get("scan_details"));
    let stored = scan_details.as_deref();
    let stored_ports = stored.and_then(|d| decode_field(d.get("ports")));
    let legacy_ports = decode_field(obj.get("details"))
        .and_then(|d| d.get("ports").cloned());
    let inline_checks = decode_field(obj.get("checks"));
    // Stored quick scans keep their checks as the scan details.
    let check_maps: Vec<&Value> = inline_checks.as_deref().into_iter().chain(stored).collect();

    let mut port_sources: Vec<&Value> = Vec::new();
    let mut service_sources: Vec<&Value> = Vec::new();
    if let Some(details) = stored {
        port_sources.extend(details.get("open_ports"));
        service_sources.extend(details.get("services"));
    }
    if let Some(ports) = stored_ports.as_deref() {
        port_sources.extend(ports.get("open_ports"));
        service_sources.extend(ports.get("services"));
    }
    port_sources.extend(obj.get("open_ports"));
    if let Some(ports) = legacy_ports.as_ref() {
        port_sources.extend(ports.get("open_ports"));
        service_sources.extend(ports.get("services"));
    }
    for checks in check_maps.iter().copied() {
        port_sources.extend(checks.get("critical_ports").and_then(|c| c.get("open")));
    }
    // Any source may itself be an encoded string.
    let decoded_sources: Vec<Cow<'_, Value>> =
        port_sources.into_iter().filter_map(|v| decode_field(Some(v))).collect();
    let open_ports = PreviewList::new(
        dedup(decoded_sources.iter().flat_map(|v| entries(v)).filter_map(|(k, v)| port_label(k, v))),
        PORT_PREVIEW,
    );
    let decoded_sources: Vec<Cow<'_, Value>> =
        service_sources.into_iter().filter_map(|v| decode_field(Some(v))).collect();
    let services = PreviewList::new(
        dedup(decoded_sources.iter().flat_map(|v| entries(v)).filter_map(|(k, v)| service_label(k, v))),
        SERVICE_PREVIEW,
    );

    let checks = check_maps
        .iter()
        .filter_map(|v| v.as_object())
        .flat_map(|map| map.iter())
        .filter_map(|(name, v)| check_from(name, v))
        .fold(Vec::<CheckSummary>::new(), |mut acc, check| {
            if !acc.iter().any(|c| c.name == check.name) {
                acc.push(check);
            }
            acc
        });

    let critical = stored
        .map(|d| decode_list(d.get("critical_vulnerabilities")))
        .unwrap_or_default();
    let critical_vulnerabilities = FindingPreview::new(
        critical.iter().filter_map(critical_finding).collect(),
        CRITICAL_PREVIEW,
    );

    let scan_duration = scan_info(stored, obj, "scan_duration").and_then(seconds);
    let scan_type = text(scan_info(stored, obj, "scan_type"));

    NormalizedScan {
        shape: detected.shape(),
        scan_id: obj
            .get("scan_id")
            .or_else(|| obj.get("id"))
            .and_then(opaque_id),
        status: text(obj.get("status")),
        risk_level,
        vulnerabilities,
        recommendations,
        open_ports,
        services,
        checks,
        critical_vulnerabilities,
        scan_duration,
        scan_type,
        error_message: text(obj.get("error_message")),
        completed_at: text(obj.get("completed_at")),
        raw_details: decoded.into_owned(),
    }
}

/// Decode a standalone recommendations listing: either a bare list or an
/// object with a `recommendations` field. Stably sorted by priority.
pub fn normalize_recommendations(raw: &Value) -> Vec<Recommendation> {
    let list = match raw {
        Value::Object(obj) => decode_list(obj.get("recommendations")),
        other => decode_list(Some(other)),
    };
    sorted_recommendations(&list)
}

fn sorted_recommendations(list: &[Value]) -> Vec<Recommendation> {
    let mut recommendations: Vec<Recommendation> =
        list.iter().filter_map(recommendation_from).collect();
    recommendations.sort_by_key(Recommendation::rank);
    recommendations
}

/// Convenience for payloads read as text (files, logs).
pub fn normalize_str(raw: &str) -> NormalizedScan {
    normalize(&Value::String(raw.to_string()))
}

/// Risk level from the findings' scores, used when none was stated.
pub fn derive_risk(findings: &[Finding]) -> Severity {
    if findings.is_empty() {
        return Severity::Low;
    }
    let score: u32 = findings
        .iter()
        .map(|f| Severity::risk_score(&f.raw_severity))
        .sum();
    match score {
        s if s >= 20 => Severity::Critical,
        s if s >= 10 => Severity::High,
        s if s >= 5 => Severity::Medium,
        _ => Severity::Low,
    }
}

fn resolve_risk(stated: Option<&Value>, findings: &[Finding]) -> Severity {
    let level = Severity::classify_value(stated);
    if level != Severity::Unknown {
        return level;
    }
    // A pending scan is stored with risk "unknown" and nothing found yet.
    let stated_present = stated.is_some_and(|v| !v.is_null());
    if stated_present && findings.is_empty() {
        return Severity::Unknown;
    }
    derive_risk(findings)
}

/// Structured field that may arrive JSON-encoded. One decode attempt; a
/// failed decode or null counts as absent.
fn decode_field(value: Option<&Value>) -> Option<Cow<'_, Value>> {
    match value? {
        Value::Null => None,
        Value::String(text) => serde_json::from_str::<Value>(text).ok().map(Cow::Owned),
        other => Some(Cow::Borrowed(other)),
    }
}

fn decode_list(value: Option<&Value>) -> Vec<Value> {
    match decode_field(value) {
        Some(Cow::Owned(Value::Array(items))) => items,
        Some(Cow::Borrowed(Value::Array(items))) => items.clone(),
        _ => Vec::new(),
    }
}

/// Array items, or `(key, value)` pairs of a port-keyed map.
fn entries(value: &Value) -> Vec<(Option<&str>, &Value)> {
    match value {
        Value::Array(items) => items.iter().map(|v| (None, v)).collect(),
        Value::Object(map) => map.iter().map(|(k, v)| (Some(k.as_str()), v)).collect(),
        _ => Vec::new(),
    }
}

fn dedup(labels: impl Iterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    labels.filter(|l| seen.insert(l.clone())).collect()
}

fn port_label(key: Option<&str>, value: &Value) -> Option<String> {
    match value {
        Value::Object(obj) => {
            let port = obj
                .get("port")
                .and_then(scalar)
                .or_else(|| key.map(str::to_string))?;
            let protocol = text(obj.get("protocol")).unwrap_or_else(|| "tcp".to_string());
            Some(format!("{port}/{protocol}"))
        }
        other => scalar(other),
    }
}

fn service_label(key: Option<&str>, value: &Value) -> Option<String> {
    match value {
        Value::Object(obj) => {
            let name = text(obj.get("name")).or_else(|| text(obj.get("service")))?;
            let port = obj
                .get("port")
                .and_then(scalar)
                .or_else(|| key.map(str::to_string));
            Some(match port {
                Some(port) => format!("{name}:{port}"),
                None => name,
            })
        }
        other => scalar(other),
    }
}

fn finding_from(entry: &Value) -> Option<Finding> {
    let obj = match entry {
        Value::Object(obj) => obj,
        Value::Null => return None,
        other => {
            return Some(Finding {
                severity: Severity::Unknown,
                raw_severity: String::new(),
                kind: "unknown".to_string(),
                description: scalar(other).unwrap_or_default(),
                port: None,
                service: None,
                cve_id: None,
                remediation: None,
            })
        }
    };
    let raw_severity = text(obj.get("severity")).unwrap_or_default();
    Some(Finding {
        severity: Severity::classify(&raw_severity),
        raw_severity,
        kind: text(obj.get("type"))
            .or_else(|| text(obj.get("kind")))
            .unwrap_or_else(|| "unknown".to_string()),
        description: text(obj.get("description"))
            .or_else(|| text(obj.get("title")))
            .or_else(|| text(obj.get("name")))
            .unwrap_or_default(),
        port: obj.get("port").and_then(port_number),
        service: text(obj.get("service")),
        cve_id: text(obj.get("cve_id")).or_else(|| text(obj.get("cve"))),
        remediation: text(obj.get("remediation")),
    })
}

/// Entries under `critical_vulnerabilities` often omit their severity.
fn critical_finding(entry: &Value) -> Option<Finding> {
    let mut finding = finding_from(entry)?;
    if finding.raw_severity.is_empty() {
        finding.severity = Severity::Critical;
        finding.raw_severity = "critical".to_string();
    }
    Some(finding)
}

/// A named check only counts when it states its risk.
fn check_from(name: &str, value: &Value) -> Option<CheckSummary> {
    let obj = value.as_object()?;
    let risk = obj.get("risk")?;
    Some(CheckSummary {
        name: name.to_string(),
        risk: Severity::classify_value(Some(risk)),
        secure: obj.get("secure").and_then(Value::as_bool),
        protocol: text(obj.get("protocol")),
        error: text(obj.get("error")),
    })
}

/// Scan metadata lives in the details, or at the top level of older payloads.
fn scan_info<'v>(
    details: Option<&'v Value>,
    obj: &'v Map<String, Value>,
    key: &str,
) -> Option<&'v Value> {
    details.and_then(|d| d.get(key)).or_else(|| obj.get(key))
}

fn seconds(value: &Value) -> Option<f64> {
    let secs = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().trim_end_matches('s').parse().ok(),
        _ => None,
    }?;
    (secs.is_finite() && secs >= 0.0).then_some(secs)
}

fn recommendation_from(entry: &Value) -> Option<Recommendation> {
    let obj = entry.as_object()?;
    let raw_priority = text(obj.get("priority")).unwrap_or_default();
    Some(Recommendation {
        priority: Severity::classify(&raw_priority),
        raw_priority,
        category: text(obj.get("category")).unwrap_or_else(|| "general".to_string()),
        action: text(obj.get("action")).unwrap_or_default(),
        details: text(obj.get("details")).unwrap_or_default(),
    })
}

fn text(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn port_number(value: &Value) -> Option<u16> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn detects_shapes() {
        assert_eq!(normalize(&json!({"overall_risk": "low"})).shape, ResultShape::Quick);
        assert_eq!(normalize(&json!({"details": {}})).shape, ResultShape::Legacy);
        assert_eq!(normalize(&json!({"status": "completed"})).shape, ResultShape::Full);
        assert_eq!(normalize(&json!({"foo": 1})).shape, ResultShape::Unrecognized);
        assert_eq!(normalize(&json!([1, 2])).shape, ResultShape::Unrecognized);
    }

    #[test]
    fn derive_risk_uses_scores() {
        let f = |sev: &str| finding_from(&json!({"severity": sev})).unwrap();
        assert_eq!(derive_risk(&[]), Severity::Low);
        assert_eq!(derive_risk(&[f("critical")]), Severity::High);
        assert_eq!(derive_risk(&[f("critical"), f("critical")]), Severity::Critical);
        assert_eq!(derive_risk(&[f("medium"), f("low")]), Severity::Medium);
        assert_eq!(derive_risk(&[f("info"), f("low")]), Severity::Low);
    }

    #[test]
    fn stated_unknown_without_findings_stays_unknown() {
        let scan = normalize(&json!({"status": "in_progress", "risk_level": "unknown"}));
        assert_eq!(scan.risk_level, Severity::Unknown);
        let scan = normalize(&json!({"status": "completed"}));
        assert_eq!(scan.risk_level, Severity::Low);
    }

    #[test]
    fn port_and_service_labels() {
        assert_eq!(port_label(None, &json!(22)).as_deref(), Some("22"));
        assert_eq!(
            port_label(None, &json!({"port": 53, "protocol": "udp"})).as_deref(),
            Some("53/udp")
        );
        assert_eq!(port_label(Some("80"), &json!({})).as_deref(), Some("80/tcp"));
        assert_eq!(
            service_label(None, &json!({"service": "ssh", "port": 22})).as_deref(),
            Some("ssh:22")
        );
        assert_eq!(
            service_label(Some("443"), &json!({"name": "https"})).as_deref(),
            Some("https:443")
        );
        assert_eq!(service_label(None, &json!({"port": 1})), None);
    }

    #[test]
    fn scalar_findings_are_kept_as_unknown() {
        let scan = normalize(&json!({"vulnerabilities": ["telnet exposed", null]}));
        assert_eq!(scan.vulnerabilities.len(), 1);
        assert_eq!(scan.vulnerabilities[0].rank(), 4);
        assert_eq!(scan.vulnerabilities[0].description, "telnet exposed");
    }

    #[test]
    fn port_numbers_accept_strings() {
        assert_eq!(port_number(&json!("443")), Some(443));
        assert_eq!(port_number(&json!(70000)), None);
        assert_eq!(port_number(&json!(true)), None);
    }
}
