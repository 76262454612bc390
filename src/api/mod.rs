//! Paginated Atlas API abstraction
//!
//! Pollers only see `AtlasApi::fetch_page`. The HTTP implementation lives in
//! [`client`]; tests substitute in-process fakes.

use crate::checkpoint::Cursor;
use crate::error::Result;
use crate::types::{InternalEvent, Origin, Surface};
use async_trait::async_trait;

pub mod client;

pub use client::AtlasClient;

/// What a single poller polls
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollTarget {
    /// A project on one surface
    Project {
        surface: Surface,
        name: String,
        /// Logs surface only
        collect_audit_logs: bool,
    },
    /// An organization's event stream
    Organization { id: String },
}

impl PollTarget {
    pub fn project(surface: Surface, name: impl Into<String>) -> Self {
        PollTarget::Project {
            surface,
            name: name.into(),
            collect_audit_logs: false,
        }
    }

    pub fn organization(id: impl Into<String>) -> Self {
        PollTarget::Organization { id: id.into() }
    }

    pub fn surface(&self) -> Surface {
        match self {
            PollTarget::Project { surface, .. } => *surface,
            PollTarget::Organization { .. } => Surface::Events,
        }
    }

    pub fn origin(&self) -> Origin {
        match self {
            PollTarget::Project { name, .. } => Origin::Project(name.clone()),
            PollTarget::Organization { id } => Origin::Organization(id.clone()),
        }
    }

    /// Deterministic checkpoint key; also used as the adapter name
    pub fn checkpoint_key(&self) -> String {
        match self {
            PollTarget::Project { surface, name, .. } => format!("{}/project/{}", surface, name),
            PollTarget::Organization { id } => format!("events/organization/{}", id),
        }
    }
}

impl std::fmt::Display for PollTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.checkpoint_key())
    }
}

/// One page request
#[derive(Debug, Clone)]
pub struct PageRequest<'a> {
    pub target: &'a PollTarget,
    /// Cursor persisted by the last successful cycle; the same for every
    /// page of a cycle
    pub cursor: Option<&'a Cursor>,
    /// 1-based page number within the cycle
    pub page_num: u32,
    pub page_size: u32,
    /// Event type names to request (events surface only)
    pub event_types: &'a [String],
}

/// One record as returned by the API
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRecord {
    /// Cluster attribution used by the cluster filter
    pub cluster: Option<String>,
    pub event_type: Option<String>,
    pub payload: serde_json::Value,
}

impl ApiRecord {
    /// Build a record from an Atlas JSON object, reading `clusterName` and
    /// `eventTypeName`
    pub fn from_json(payload: serde_json::Value) -> Self {
        let cluster = payload
            .get("clusterName")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let event_type = payload
            .get("eventTypeName")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        Self {
            cluster,
            event_type,
            payload,
        }
    }

    /// Normalize into the record handed downstream
    pub fn into_event(self, kind: Surface, origin: Origin) -> InternalEvent {
        InternalEvent::new(kind, origin, self.payload)
            .with_cluster(self.cluster)
            .with_event_type(self.event_type.unwrap_or_default())
    }
}

/// One page of results
#[derive(Debug, Clone, Default)]
pub struct Page {
    /// Records in API order
    pub records: Vec<ApiRecord>,
    /// Whether another page follows
    pub has_next: bool,
    /// Highest position covered by this page, if it advanced the stream
    pub cursor: Option<Cursor>,
}

/// Paginated access to the Atlas API
#[async_trait]
pub trait AtlasApi: Send + Sync {
    /// Fetch one page for the request's target
    ///
    /// Returns [`crate::IngestError::TransientApi`] for failures worth
    /// retrying and [`crate::IngestError::PermanentApi`] otherwise.
    async fn fetch_page(&self, request: PageRequest<'_>) -> Result<Page>;
}
