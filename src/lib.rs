//! # a3s-atlas-ingest
//!
//! Dual-mode ingestion of MongoDB Atlas alerts, logs, and events for the A3S
//! ecosystem.
//!
//! ## Overview
//!
//! Alerts arrive either pushed by Atlas to a signed webhook (listen mode) or
//! pulled from the Admin API (poll mode). Logs and events are always pulled.
//! Every record is normalized into an [`InternalEvent`] and handed to an
//! [`EventSink`]. Each polling source keeps its own persisted [`Cursor`], so
//! a restart resumes where the last successful cycle stopped.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use a3s_atlas_ingest::{ChannelSink, IngestConfig, IngestionEngine};
//! use std::sync::Arc;
//!
//! # async fn example() -> a3s_atlas_ingest::Result<()> {
//! let config = IngestConfig::from_file("atlas.yaml")?;
//! let (sink, mut rx) = ChannelSink::channel(1024);
//!
//! let mut engine = IngestionEngine::from_config(&config, Arc::new(sink))?;
//! engine.start().await?;
//!
//! while let Some(event) = rx.recv().await {
//!     println!("{} {} {}", event.kind, event.origin.id(), event.event_type);
//! }
//!
//! engine.stop().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **validate**: checks a configuration and compiles it into an [`IngestPlan`]
//! - **ClusterFilter**: include/exclude cluster selection per project
//! - **WebhookListener**: HMAC-verified HTTP(S) endpoint for alert pushes
//! - **Poller**: paginated pull of one source with retries and checkpoints
//! - **IngestionEngine**: starts and stops every adapter

pub mod api;
pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod error;
pub mod filter;
pub mod listener;
pub mod poller;
pub mod retry;
pub mod sink;
pub mod types;
pub mod validate;

// Re-export core types
pub use api::{ApiRecord, AtlasApi, AtlasClient, Page, PageRequest, PollTarget};
pub use checkpoint::{CheckpointStore, Cursor, FileCheckpointStore, MemoryCheckpointStore};
pub use config::{
    AlertsConfig, ApiConfig, EventsConfig, IngestConfig, LogsConfig, OrgConfig, ProjectConfig,
    RetryConfig, TlsConfig,
};
pub use engine::IngestionEngine;
pub use error::{AdapterFailure, IngestError, Result, ValidationError, ValidationErrors};
pub use filter::{ClusterFilter, ClusterListConflict};
pub use listener::{ListenerState, WebhookListener};
pub use poller::{CycleReport, Poller};
pub use retry::{Backoff, ExponentialBackoff};
pub use sink::{ChannelSink, EventSink, MemorySink};
pub use types::{InternalEvent, Origin, Surface};
pub use validate::{compile, validate, IngestPlan};
