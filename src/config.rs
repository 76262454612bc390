//! Ingestion configuration
//!
//! Raw, operator-facing settings as deserialized from YAML. Nothing here is
//! trusted: [`crate::validate::compile`] checks every rule and turns a
//! consistent `IngestConfig` into a typed [`crate::validate::IngestPlan`].

use crate::error::{IngestError, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Smallest page size accepted by the Atlas list endpoints
pub const MIN_PAGE_SIZE: i64 = 1;

/// Documented Atlas API ceiling for `itemsPerPage`; revisit if the
/// platform changes its limits
pub const MAX_PAGE_SIZE: i64 = 500;

/// Known values of `alerts.mode`
pub const ALERT_MODE_LISTEN: &str = "listen";
pub const ALERT_MODE_POLL: &str = "poll";

/// Default Atlas Admin API base URL
pub const DEFAULT_BASE_URL: &str = "https://cloud.mongodb.com/api/atlas/v2";

/// Default OAuth token endpoint for Atlas service accounts
pub const DEFAULT_TOKEN_URL: &str = "https://cloud.mongodb.com/api/oauth/token";

/// Top-level ingestion configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Atlas API access, used by all polling sources
    pub api: ApiConfig,

    pub alerts: AlertsConfig,

    pub logs: LogsConfig,

    /// Events collection is enabled by the presence of this block
    pub events: Option<EventsConfig>,

    pub retry_on_failure: RetryConfig,

    /// Checkpoint file; cursors are kept in memory when unset
    pub storage: Option<PathBuf>,

    /// How long `stop()` waits for each poller and for open webhook connections
    #[serde(with = "duration")]
    pub shutdown_grace: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            api: ApiConfig::default(),
            alerts: AlertsConfig::default(),
            logs: LogsConfig::default(),
            events: None,
            retry_on_failure: RetryConfig::default(),
            storage: None,
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl IngestConfig {
    /// Parse a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| IngestError::ConfigFile(format!("Failed to parse configuration: {}", e)))
    }

    /// Read and parse a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|e| {
            IngestError::ConfigFile(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_yaml_str(&yaml)
    }
}

/// Atlas Admin API connection settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    pub token_url: String,
    /// Service account client id
    pub client_id: String,
    /// Service account client secret
    pub client_secret: String,
    #[serde(with = "duration")]
    pub request_timeout: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            token_url: DEFAULT_TOKEN_URL.to_string(),
            client_id: String::new(),
            client_secret: String::new(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Alerts surface; `mode` selects which of the field groups applies
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    pub enabled: bool,
    pub mode: String,

    // listen mode
    pub endpoint: String,
    pub secret: String,
    pub tls: Option<TlsConfig>,
    pub include_clusters: Vec<String>,
    pub exclude_clusters: Vec<String>,

    // poll mode
    pub projects: Vec<ProjectConfig>,
    #[serde(with = "duration")]
    pub poll_interval: Duration,
    pub page_size: i64,
    pub max_pages: i64,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: ALERT_MODE_LISTEN.to_string(),
            endpoint: String::new(),
            secret: String::new(),
            tls: None,
            include_clusters: Vec::new(),
            exclude_clusters: Vec::new(),
            projects: Vec::new(),
            poll_interval: Duration::from_secs(5 * 60),
            page_size: 100,
            max_pages: 10,
        }
    }
}

/// Certificate/key pair for the webhook listener
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub cert_file: String,
    pub key_file: String,
}

/// Logs surface
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogsConfig {
    pub enabled: bool,
    pub projects: Vec<ProjectConfig>,
    #[serde(with = "duration")]
    pub poll_interval: Duration,
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            projects: Vec::new(),
            poll_interval: Duration::from_secs(5 * 60),
        }
    }
}

/// Events surface
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub projects: Vec<ProjectConfig>,
    pub organizations: Vec<OrgConfig>,
    #[serde(with = "duration")]
    pub poll_interval: Duration,
    /// Event type names to request; empty means all types
    pub types: Vec<String>,
    pub page_size: i64,
    pub max_pages: i64,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            projects: Vec::new(),
            organizations: Vec::new(),
            poll_interval: Duration::from_secs(60),
            types: Vec::new(),
            page_size: 100,
            max_pages: 25,
        }
    }
}

/// One monitored project
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    pub name: String,
    pub include_clusters: Vec<String>,
    pub exclude_clusters: Vec<String>,
    /// Logs surface only: also download audit logs
    pub collect_audit_logs: bool,
}

impl ProjectConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn include(mut self, clusters: &[&str]) -> Self {
        self.include_clusters = clusters.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn exclude(mut self, clusters: &[&str]) -> Self {
        self.exclude_clusters = clusters.iter().map(|c| c.to_string()).collect();
        self
    }
}

/// One monitored organization
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrgConfig {
    pub id: String,
}

/// Retry/backoff settings shared by every poller
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub enabled: bool,
    #[serde(with = "duration")]
    pub initial_interval: Duration,
    #[serde(with = "duration")]
    pub max_interval: Duration,
    pub multiplier: f64,
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_interval: Duration::from_secs(5),
            max_interval: Duration::from_secs(30),
            multiplier: 1.5,
            max_attempts: 5,
        }
    }
}

/// Human-friendly durations: `250ms`, `30s`, `5m`, `1h`, or bare seconds
pub mod duration {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Raw::deserialize(deserializer)? {
            Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => parse(&text).map_err(serde::de::Error::custom),
        }
    }

    /// Parse a duration string
    pub fn parse(text: &str) -> Result<Duration, String> {
        let text = text.trim();
        let split = text
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(text.len());
        let (digits, unit) = text.split_at(split);
        let value: u64 = digits
            .parse()
            .map_err(|_| format!("invalid duration '{}'", text))?;

        let scale = |factor: u64| {
            value
                .checked_mul(factor)
                .map(Duration::from_secs)
                .ok_or_else(|| format!("duration '{}' is too large", text))
        };
        match unit {
            "ms" => Ok(Duration::from_millis(value)),
            "" | "s" => Ok(Duration::from_secs(value)),
            "m" => scale(60),
            "h" => scale(3600),
            other => Err(format!("unknown duration unit '{}' in '{}'", other, text)),
        }
    }
}
