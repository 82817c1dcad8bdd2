use std::time::Duration;
use std::{env, fs, io};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Timing of the status-poll loop for full scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollPolicy {
    /// Delay before the first status check after submission.
    #[serde(with = "secs")]
    pub grace: Duration,
    /// Fixed delay between status checks.
    #[serde(with = "secs")]
    pub interval: Duration,
    /// Hard cap on status checks; reaching it times the job out.
    pub max_attempts: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(2),
            interval: Duration::from_secs(3),
            max_attempts: 30,
        }
    }
}

impl PollPolicy {
    /// Upper bound on how long a job may poll, grace period included.
    pub fn ceiling(&self) -> Duration {
        self.grace + self.interval * self.max_attempts
    }
}

/// How to reach the scan and monitoring services.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub base_url: String,
    /// Bearer token sent with every request, if the API requires one.
    pub token: Option<String>,
    pub timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000/api/v1".to_string(),
            token: None,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    pub client: ClientConfig,
    pub poll: PollPolicy,
    /// Listen address of the local console API.
    pub bind: String,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            client: ClientConfig::default(),
            poll: PollPolicy::default(),
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

impl ConsoleConfig {
    /// Defaults, overlaid by the JSON file named in `HOSTWATCH_CONFIG`
    /// (default `hostwatch.json`, optional), overlaid by `HOSTWATCH_*` variables.
    pub fn load() -> Result<Self> {
        let path = env::var("HOSTWATCH_CONFIG").unwrap_or_else(|_| "hostwatch.json".to_string());
        let mut cfg = Self::from_file(&path)?;
        cfg.apply_env(|key| env::var(key).ok())?;
        Ok(cfg)
    }

    /// Read `path` over the defaults. Only a missing file means "use defaults".
    pub fn from_file(path: &str) -> Result<Self> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e).with_context(|| format!("failed to read {path}")),
        };
        serde_json::from_str(&raw).with_context(|| format!("failed to parse {path}"))
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = var("HOSTWATCH_API_URL") {
            self.client.base_url = v;
        }
        if let Some(v) = var("HOSTWATCH_TOKEN") {
            self.client.token = Some(v).filter(|t| !t.is_empty());
        }
        if let Some(v) = var("HOSTWATCH_TIMEOUT_SECS") {
            self.client.timeout_secs = v.parse().context("HOSTWATCH_TIMEOUT_SECS")?;
        }
        if let Some(v) = var("HOSTWATCH_POLL_GRACE_SECS") {
            self.poll.grace = Duration::from_secs(v.parse().context("HOSTWATCH_POLL_GRACE_SECS")?);
        }
        if let Some(v) = var("HOSTWATCH_POLL_INTERVAL_SECS") {
            self.poll.interval =
                Duration::from_secs(v.parse().context("HOSTWATCH_POLL_INTERVAL_SECS")?);
        }
        if let Some(v) = var("HOSTWATCH_POLL_MAX_ATTEMPTS") {
            self.poll.max_attempts = v.parse().context("HOSTWATCH_POLL_MAX_ATTEMPTS")?;
        }
        if let Some(v) = var("HOSTWATCH_BIND") {
            self.bind = v;
        }
        Ok(())
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
