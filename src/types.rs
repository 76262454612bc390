//! Core record types for the ingestion pipeline
//!
//! All types use camelCase JSON serialization for wire compatibility.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One of the three independently configurable ingestion categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Surface {
    Alerts,
    Logs,
    Events,
}

impl Surface {
    pub fn as_str(&self) -> &'static str {
        match self {
            Surface::Alerts => "alerts",
            Surface::Logs => "logs",
            Surface::Events => "events",
        }
    }
}

impl std::fmt::Display for Surface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a record came from on the platform side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type", content = "id")]
pub enum Origin {
    /// Project name (polling) or project id (webhook `groupId`)
    Project(String),
    /// Organization id
    Organization(String),
}

impl Origin {
    pub fn id(&self) -> &str {
        match self {
            Origin::Project(id) | Origin::Organization(id) => id,
        }
    }
}

/// A normalized record handed to the downstream consumer
///
/// Produced by the webhook listener or a poller; never mutated after
/// submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InternalEvent {
    /// Unique event identifier (evt-<uuid>)
    pub id: String,

    /// Surface that produced the record
    pub kind: Surface,

    /// Project or organization the record belongs to
    pub origin: Origin,

    /// Cluster attribution, when the platform provided one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<String>,

    /// Platform event type (e.g. "OUTSIDE_METRIC_THRESHOLD")
    #[serde(default)]
    pub event_type: String,

    /// Record body as delivered by the platform
    pub payload: serde_json::Value,

    /// Unix timestamp in milliseconds at ingestion
    pub ingested_at: u64,

    /// Optional key-value metadata
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl InternalEvent {
    /// Create a new event with auto-generated id and ingestion timestamp
    pub fn new(kind: Surface, origin: Origin, payload: serde_json::Value) -> Self {
        Self {
            id: format!("evt-{}", uuid::Uuid::new_v4()),
            kind,
            origin,
            cluster: None,
            event_type: String::new(),
            payload,
            ingested_at: now_millis(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_cluster(mut self, cluster: Option<String>) -> Self {
        self.cluster = cluster;
        self
    }

    pub fn with_event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = event_type.into();
        self
    }

    /// Add a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
