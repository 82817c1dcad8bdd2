use serde::{Deserialize, Deserializer, Serialize};

/// Canonical severity / priority / risk level.
///
/// Variants are declared most severe first so the derived `Ord` matches `rank()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    #[default]
    Unknown,
}

impl Severity {
    pub const ALL: [Severity; 5] = [
        Severity::Critical,
        Severity::High,
        Severity::Medium,
        Severity::Low,
        Severity::Unknown,
    ];

    /// Badge color of informational findings, which otherwise count as low.
    pub const INFO_COLOR: &str = "#2563eb";

    /// Classify a free-form severity or priority string. Total: anything
    /// unrecognised is `Unknown`.
    pub fn classify(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "critical" | "crit" => Severity::Critical,
            "high" => Severity::High,
            "medium" | "moderate" | "med" => Severity::Medium,
            "low" | "info" | "informational" | "none" => Severity::Low,
            _ => Severity::Unknown,
        }
    }

    /// Classify an optional JSON value; non-strings are `Unknown`.
    pub fn classify_value(value: Option<&serde_json::Value>) -> Self {
        value
            .and_then(|v| v.as_str())
            .map(Severity::classify)
            .unwrap_or(Severity::Unknown)
    }

    /// 0 = critical .. 3 = low, 4 = unknown.
    pub fn rank(self) -> u8 {
        match self {
            Severity::Critical => 0,
            Severity::High => 1,
            Severity::Medium => 2,
            Severity::Low => 3,
            Severity::Unknown => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
            Severity::Unknown => "unknown",
        }
    }

    /// Badge color for a finding or recommendation of this severity.
    pub fn color(self) -> &'static str {
        match self {
            Severity::Critical => "#dc2626",
            Severity::High => "#ea580c",
            Severity::Medium => "#d97706",
            Severity::Low => "#65a30d",
            Severity::Unknown => "#6b7280",
        }
    }

    /// Badge color when the value is an overall risk level.
    pub fn risk_color(self) -> &'static str {
        match self {
            Severity::Low => "#10b981",
            other => other.color(),
        }
    }

    pub fn icon(self) -> &'static str {
        match self {
            Severity::Critical => "fa-skull-crossbones",
            Severity::High => "fa-exclamation-triangle",
            Severity::Medium => "fa-exclamation-circle",
            Severity::Low => "fa-info-circle",
            Severity::Unknown => "fa-question-circle",
        }
    }

    /// Weight used when a risk level has to be derived from findings.
    pub(crate) fn risk_score(raw: &str) -> u32 {
        match raw.trim().to_ascii_lowercase().as_str() {
            "critical" | "crit" => 10,
            "high" => 7,
            "medium" | "moderate" | "med" => 4,
            "low" => 1,
            _ => 0,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<&str> for Severity {
    fn from(raw: &str) -> Self {
        Severity::classify(raw)
    }
}

// Lenient on the way in: any string (or null) is accepted and classified.
impl<'de> Deserialize<'de> for Severity {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw.as_deref().map(Severity::classify).unwrap_or_default())
    }
}
