//! Error types for a3s-atlas-ingest

use crate::types::Surface;
use thiserror::Error;

/// Errors that can occur while ingesting Atlas data
#[derive(Debug, Error)]
pub enum IngestError {
    /// Configuration is not self-consistent; carries every violation found
    #[error("Invalid configuration: {0}")]
    Config(ValidationErrors),

    /// Configuration file could not be read or parsed
    #[error("Configuration error: {0}")]
    ConfigFile(String),

    /// Webhook listener could not bind or load its TLS material
    #[error("Failed to bind webhook listener on '{addr}': {reason}")]
    Bind { addr: String, reason: String },

    /// Webhook request signature missing or mismatched
    #[error("Webhook authentication failed: {0}")]
    Authentication(String),

    /// Network error, 5xx or rate limit from the Atlas API
    #[error("Transient API error: {0}")]
    TransientApi(String),

    /// Authentication failure or malformed response from the Atlas API
    #[error("Permanent API error: {0}")]
    PermanentApi(String),

    /// Downstream consumer rejected a submission
    #[error("Downstream submission failed: {0}")]
    Sink(String),

    /// Checkpoint load/save failure
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Listener lifecycle misuse (e.g. starting twice)
    #[error("Listener error: {0}")]
    Listener(String),

    /// An adapter did not stop cleanly within the grace period
    #[error("Shutdown error: {0}")]
    Shutdown(String),

    /// One or more adapters failed to start or stop
    #[error("Adapter failures: {}", format_failures(.0))]
    Adapters(Vec<AdapterFailure>),
}

impl IngestError {
    /// Whether the retry policy should try the failed operation again
    pub fn is_transient(&self) -> bool {
        matches!(self, IngestError::TransientApi(_) | IngestError::Sink(_))
    }
}

/// Result type alias for ingestion operations
pub type Result<T> = std::result::Result<T, IngestError>;

/// A failure attributed to a single named adapter
#[derive(Debug)]
pub struct AdapterFailure {
    /// Adapter name (e.g. `alerts/project/prod`, `alerts/listener`)
    pub adapter: String,

    /// What went wrong
    pub error: IngestError,
}

fn format_failures(failures: &[AdapterFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("[{}] {}", f.adapter, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

/// A single configuration rule violation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("an endpoint must be specified")]
    NoEndpoint,

    #[error("failed to split endpoint '{endpoint}' into 'host:port' pair: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("a webhook secret must be specified")]
    NoSecret,

    #[error("tls was configured, but no cert file was specified")]
    NoCert,

    #[error("tls was configured, but no key file was specified")]
    NoKey,

    #[error("alert mode '{0}' not recognized. Known alert modes are: listen,poll")]
    UnrecognizedMode(String),

    #[error("{surface}: page size must be a value between 1 and 500, got {value}")]
    PageSize { surface: Surface, value: i64 },

    #[error("{surface}: max pages must not be negative, got {value}")]
    MaxPages { surface: Surface, value: i64 },

    #[error("{surface}: poll interval must be greater than zero")]
    PollInterval { surface: Surface },

    #[error("{surface}: at least one 'project' must be specified")]
    NoProjects { surface: Surface },

    #[error("at least one 'project' or 'organizations' event source must be specified")]
    NoEventSources,

    #[error("{scope}: only one of 'include_clusters' or 'exclude_clusters' may be specified")]
    ClusterConfig { scope: String },
}

/// All violations found by one validation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationErrors(pub Vec<ValidationError>);

impl ValidationErrors {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ValidationError> {
        self.0.iter()
    }

    pub fn contains(&self, error: &ValidationError) -> bool {
        self.0.contains(error)
    }
}

impl std::fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let joined = self
            .0
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        f.write_str(&joined)
    }
}
