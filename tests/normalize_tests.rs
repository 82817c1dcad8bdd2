use hostwatch_rs::normalize::{
    normalize, normalize_recommendations, normalize_str, CRITICAL_PREVIEW, PORT_PREVIEW,
    SERVICE_PREVIEW,
};
use hostwatch_rs::severity::Severity;
use hostwatch_rs::types::ResultShape;
use serde_json::{json, Value};

#[test]
fn odd_payloads_fall_back_instead_of_failing() {
    let payloads = [
        Value::Null,
        json!(42),
        json!("{not json"),
        json!([]),
        json!({}),
        json!({"vulnerabilities": "[{broken"}),
        json!({"vulnerabilities": {"a": 1}, "recommendations": 7}),
        json!({"scan_details": "also broken", "status": "completed"}),
        json!({"details": null}),
        json!({"checks": null}),
    ];
    for raw in &payloads {
        let scan = normalize(raw);
        assert!(scan.recommendations.len() <= 1, "{raw}");
        if scan.is_fallback() {
            assert_eq!(scan.risk_level, Severity::Unknown);
            assert!(scan.vulnerabilities.is_empty());
        }
    }

    let broken = normalize_str("{not json");
    assert!(broken.is_fallback());
    assert_eq!(broken.raw_details, json!("{not json"));
}

#[test]
fn encoded_string_fields_are_decoded_once() {
    let raw = json!({
        "status": "completed",
        "vulnerabilities": "[{\"severity\": \"high\", \"type\": \"weak_cipher\"}]",
        "recommendations": "[{\"priority\": \"critical\", \"action\": \"Disable telnet\"}]",
        "scan_details": "{\"open_ports\": [{\"port\": 23, \"protocol\": \"tcp\"}], \"services\": {\"23\": {\"name\": \"telnet\"}}}"
    });
    let scan = normalize(&raw);
    assert_eq!(scan.shape, ResultShape::Full);
    assert_eq!(scan.vulnerabilities[0].severity, Severity::High);
    assert_eq!(scan.recommendations[0].action, "Disable telnet");
    assert_eq!(scan.recommendations[0].category, "general");
    assert_eq!(scan.open_ports.items, ["23/tcp"]);
    assert_eq!(scan.services.items, ["telnet:23"]);
}

#[test]
fn whole_payload_as_encoded_string() {
    let text = json!({"status": "completed", "risk_level": "HIGH"}).to_string();
    let scan = normalize(&Value::String(text));
    assert_eq!(scan.risk_level, Severity::High);
    assert_eq!(scan.status.as_deref(), Some("completed"));
}

#[test]
fn findings_sort_stably_with_unknown_last() {
    let raw = json!({
        "status": "completed",
        "vulnerabilities": [
            {"severity": "weird", "description": "a"},
            {"severity": "low", "description": "b"},
            {"severity": "CRITICAL", "description": "c"},
            {"severity": "low", "description": "d"},
            {"severity": "crit", "description": "e"},
            {"severity": "Moderate", "description": "f"}
        ]
    });
    let scan = normalize(&raw);
    let order: Vec<&str> = scan
        .vulnerabilities
        .iter()
        .map(|f| f.description.as_str())
        .collect();
    assert_eq!(order, ["c", "e", "f", "b", "d", "a"]);
    assert_eq!(scan.vulnerabilities[5].raw_severity, "weird");

    // Sorting an already sorted list changes nothing.
    let mut again = scan.vulnerabilities.clone();
    again.sort_by_key(|f| f.rank());
    assert_eq!(again, scan.vulnerabilities);
}

#[test]
fn long_descriptions_are_kept_whole() {
    let description = "x".repeat(5000);
    let scan = normalize(&json!({"vulnerabilities": [{"severity": "low", "description": description}]}));
    assert_eq!(scan.vulnerabilities[0].description.len(), 5000);
}

#[test]
fn previews_are_capped_with_full_count() {
    let ports: Vec<Value> = (1..=40).map(|p| json!({"port": p, "protocol": "tcp"})).collect();
    let services: Vec<Value> = (1..=20)
        .map(|p| json!({"name": format!("svc{p}"), "port": p}))
        .collect();
    let raw = json!({
        "status": "completed",
        "scan_details": {"open_ports": ports, "services": services}
    });
    let scan = normalize(&raw);
    assert_eq!(scan.open_ports.items.len(), PORT_PREVIEW);
    assert_eq!(scan.open_ports.total, 40);
    assert_eq!(scan.open_ports.hidden(), 25);
    assert_eq!(scan.services.items.len(), SERVICE_PREVIEW);
    assert_eq!(scan.services.hidden(), 8);
    // The untouched payload keeps every entry.
    assert_eq!(
        scan.raw_details["scan_details"]["open_ports"].as_array().map(Vec::len),
        Some(40)
    );
}

#[test]
fn legacy_and_quick_port_locations() {
    let legacy = normalize(&json!({
        "details": {"ports": {"open_ports": [22, "80", 22], "services": [{"service": "ssh", "port": 22}]}}
    }));
    assert_eq!(legacy.shape, ResultShape::Legacy);
    assert_eq!(legacy.open_ports.items, ["22", "80"]);
    assert_eq!(legacy.services.items, ["ssh:22"]);

    let quick = normalize(&json!({
        "overall_risk": "critical",
        "checks": {"critical_ports": {"open": [23, 3389]}}
    }));
    assert_eq!(quick.shape, ResultShape::Quick);
    assert_eq!(quick.risk_level, Severity::Critical);
    assert_eq!(quick.open_ports.items, ["23", "3389"]);
}

#[test]
fn stored_detail_port_locations() {
    let full = normalize(&json!({
        "id": 7,
        "status": "completed",
        "scan_details": {
            "ports": {
                "open_ports": [{"port": 22, "state": "open"}, {"port": 80, "state": "open"}],
                "services": {"22": {"port": 22, "name": "ssh"}}
            }
        }
    }));
    assert_eq!(full.shape, ResultShape::Full);
    assert_eq!(full.open_ports.total, 2);
    assert_eq!(full.open_ports.items, ["22/tcp", "80/tcp"]);
    assert_eq!(full.services.items, ["ssh:22"]);

    // A quick scan read back from history stores its checks as the details.
    let stored_quick = normalize(&json!({
        "id": 8,
        "status": "completed",
        "risk_level": "high",
        "scan_details": "{\"critical_ports\": {\"open\": [22, 23], \"risk\": \"high\"}}"
    }));
    assert_eq!(stored_quick.open_ports.total, 2);
    assert_eq!(stored_quick.open_ports.items, ["22", "23"]);
}

#[test]
fn quick_checks_are_summarized_inline_and_stored() {
    let checks = json!({
        "critical_ports": {"open": [23], "risk": "high"},
        "ssl": {"protocol": "TLSv1.3", "secure": true, "risk": "low"}
    });
    let inline = normalize(&json!({"overall_risk": "high", "checks": checks.clone()}));
    let stored = normalize(&json!({"id": 3, "status": "completed", "scan_details": checks}));
    for scan in [&inline, &stored] {
        assert_eq!(scan.checks.len(), 2);
        let ports = scan.checks.iter().find(|c| c.name == "critical_ports").unwrap();
        assert_eq!(ports.risk, Severity::High);
        assert_eq!(ports.secure, None);
        let ssl = scan.checks.iter().find(|c| c.name == "ssl").unwrap();
        assert_eq!(ssl.risk, Severity::Low);
        assert_eq!(ssl.secure, Some(true));
        assert_eq!(ssl.protocol.as_deref(), Some("TLSv1.3"));
    }

    let failed_ssl = normalize(&json!({
        "overall_risk": "low",
        "checks": {"ssl": {"error": "connection refused", "risk": "unknown"}}
    }));
    assert_eq!(failed_ssl.checks[0].risk, Severity::Unknown);
    assert_eq!(failed_ssl.checks[0].error.as_deref(), Some("connection refused"));

    // Full-scan details without a stated risk are not checks.
    let full = normalize(&json!({"status": "completed", "scan_details": {"ports": {"open_ports": [22]}}}));
    assert!(full.checks.is_empty());
}

#[test]
fn critical_preview_and_scan_info() {
    let critical: Vec<Value> = (1..=5)
        .map(|n| json!({"name": format!("CVE-2024-000{n}"), "port": 443}))
        .collect();
    let scan = normalize(&json!({
        "status": "completed",
        "scan_details": {
            "critical_vulnerabilities": critical,
            "scan_duration": 42.5,
            "scan_type": "deep"
        }
    }));
    assert_eq!(scan.critical_vulnerabilities.items.len(), CRITICAL_PREVIEW);
    assert_eq!(scan.critical_vulnerabilities.total, 5);
    assert_eq!(scan.critical_vulnerabilities.hidden(), 2);
    let first = &scan.critical_vulnerabilities.items[0];
    assert_eq!(first.severity, Severity::Critical);
    assert_eq!(first.description, "CVE-2024-0001");
    assert_eq!(first.port, Some(443));
    assert_eq!(scan.scan_duration, Some(42.5));
    assert_eq!(scan.scan_type.as_deref(), Some("deep"));

    let bare = normalize(&json!({"status": "completed"}));
    assert!(bare.critical_vulnerabilities.is_empty());
    assert_eq!(bare.scan_duration, None);
    assert_eq!(bare.scan_type, None);
}

#[test]
fn risk_is_derived_when_not_stated() {
    let scan = normalize(&json!({
        "status": "completed",
        "vulnerabilities": [
            {"severity": "critical"}, {"severity": "high"}, {"severity": "medium"}
        ]
    }));
    assert_eq!(scan.risk_level, Severity::Critical);

    let stated = normalize(&json!({
        "status": "completed",
        "risk_level": "low",
        "vulnerabilities": [{"severity": "critical"}, {"severity": "critical"}]
    }));
    assert_eq!(stated.risk_level, Severity::Low);
}

#[test]
fn standalone_recommendations_in_either_layout() {
    let bare = json!([
        {"priority": "low", "category": "hardening", "action": "Enable fail2ban"},
        {"priority": "high", "category": "network", "action": "Close port 23"}
    ]);
    let wrapped = json!({"recommendations": bare.clone()});
    for raw in [&bare, &wrapped] {
        let recs = normalize_recommendations(raw);
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].action, "Close port 23");
        assert_eq!(recs[0].priority.rank(), 1);
    }
    assert!(normalize_recommendations(&Value::Null).is_empty());
}
