//! Ingestion engine: lifecycle of every adapter
//!
//! The engine turns an [`IngestPlan`] into running adapters (one poller per
//! polling source, plus the webhook listener in listen mode), all feeding
//! the same sink. Adapters are independent: one failing to start does not
//! stop the others, and shutdown always visits every adapter.

use crate::api::{AtlasApi, AtlasClient, PollTarget};
use crate::checkpoint::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
use crate::config::IngestConfig;
use crate::error::{AdapterFailure, IngestError, Result};
use crate::filter::ClusterFilter;
use crate::listener::{ListenerState, WebhookListener};
use crate::poller::Poller;
use crate::retry::Backoff;
use crate::sink::EventSink;
use crate::types::Surface;
use crate::validate::{compile, AlertSource, IngestPlan, PollSettings};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Adapter name used for the webhook listener
pub const LISTENER_ADAPTER: &str = "alerts/listener";

struct PollerHandle {
    name: String,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Runs all configured ingestion adapters
pub struct IngestionEngine {
    plan: IngestPlan,
    api: Arc<dyn AtlasApi>,
    sink: Arc<dyn EventSink>,
    checkpoints: Arc<dyn CheckpointStore>,
    backoff: Arc<dyn Backoff>,
    cancel: CancellationToken,
    pollers: Vec<PollerHandle>,
    listener: Option<WebhookListener>,
}

impl IngestionEngine {
    pub fn new(
        plan: IngestPlan,
        api: Arc<dyn AtlasApi>,
        sink: Arc<dyn EventSink>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Self {
        let backoff: Arc<dyn Backoff> = Arc::new(plan.backoff.clone());
        Self {
            plan,
            api,
            sink,
            checkpoints,
            backoff,
            cancel: CancellationToken::new(),
            pollers: Vec::new(),
            listener: None,
        }
    }

    /// Validate `config` and wire the HTTP client and checkpoint store
    ///
    /// Checkpoints go to a [`FileCheckpointStore`] when `storage` is set,
    /// otherwise they live in memory for the process lifetime.
    pub fn from_config(config: &IngestConfig, sink: Arc<dyn EventSink>) -> Result<Self> {
        let plan = compile(config)?;
        let api: Arc<dyn AtlasApi> = Arc::new(AtlasClient::new(&config.api)?);
        let checkpoints: Arc<dyn CheckpointStore> = match &plan.storage {
            Some(path) => Arc::new(FileCheckpointStore::new(path)),
            None => Arc::new(MemoryCheckpointStore::default()),
        };
        Ok(Self::new(plan, api, sink, checkpoints))
    }

    pub fn plan(&self) -> &IngestPlan {
        &self.plan
    }

    /// Start every adapter
    ///
    /// Adapters that start keep running even when others fail; the
    /// failures are returned together as [`IngestError::Adapters`].
    /// Calling `start` again after a partial failure retries only the
    /// adapters that are not running.
    pub async fn start(&mut self) -> Result<()> {
        let mut failures = Vec::new();

        if self.pollers.is_empty() {
            self.start_pollers(&mut failures);
        }

        if let Some(AlertSource::Listen(source)) = &self.plan.alerts {
            if self.listener.is_none() {
                let mut listener = WebhookListener::new(source.clone(), self.sink.clone())
                    .with_shutdown_grace(self.plan.shutdown_grace);
                match listener.start().await {
                    Ok(_) => self.listener = Some(listener),
                    Err(error) => failures.push(AdapterFailure {
                        adapter: LISTENER_ADAPTER.to_string(),
                        error,
                    }),
                }
            }
        }

        tracing::info!(
            pollers = self.pollers.len(),
            listener = self.listener.is_some(),
            failed = failures.len(),
            sink = self.sink.name(),
            "Ingestion engine started"
        );

        if failures.is_empty() {
            Ok(())
        } else {
            Err(IngestError::Adapters(failures))
        }
    }

    fn start_pollers(&mut self, failures: &mut Vec<AdapterFailure>) {
        let mut keys = HashSet::new();

        for poller in self.build_pollers() {
            let name = poller.key().to_string();
            if !keys.insert(name.clone()) {
                failures.push(AdapterFailure {
                    adapter: name.clone(),
                    error: IngestError::Checkpoint(format!(
                        "checkpoint key '{}' is already in use",
                        name
                    )),
                });
                continue;
            }

            let cancel = self.cancel.child_token();
            let handle = tokio::spawn(poller.run(cancel.clone()));
            self.pollers.push(PollerHandle {
                name,
                cancel,
                handle,
            });
        }
    }

    /// Stop every adapter, waiting up to the grace period for each poller
    pub async fn stop(&mut self) -> Result<()> {
        let mut failures = Vec::new();
        self.cancel.cancel();

        if let Some(mut listener) = self.listener.take() {
            if let Err(error) = listener.stop().await {
                failures.push(AdapterFailure {
                    adapter: LISTENER_ADAPTER.to_string(),
                    error,
                });
            }
        }

        let grace = self.plan.shutdown_grace;
        for PollerHandle {
            name,
            cancel,
            mut handle,
        } in self.pollers.drain(..)
        {
            cancel.cancel();
            match tokio::time::timeout(grace, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => failures.push(AdapterFailure {
                    adapter: name,
                    error: IngestError::Shutdown(format!("poller task failed: {}", e)),
                }),
                Err(_) => {
                    handle.abort();
                    tracing::warn!(source = %name, "Poller did not stop in time, aborted");
                    failures.push(AdapterFailure {
                        adapter: name,
                        error: IngestError::Shutdown(format!(
                            "did not stop within {:?}",
                            grace
                        )),
                    });
                }
            }
        }

        // A fresh token so the engine can be started again
        self.cancel = CancellationToken::new();

        tracing::info!(failed = failures.len(), "Ingestion engine stopped");

        if failures.is_empty() {
            Ok(())
        } else {
            Err(IngestError::Adapters(failures))
        }
    }

    /// Names of the adapters currently running
    pub fn running(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .pollers
            .iter()
            .filter(|p| !p.handle.is_finished())
            .map(|p| p.name.clone())
            .collect();
        if self
            .listener
            .as_ref()
            .is_some_and(|l| l.state() == ListenerState::Listening)
        {
            names.push(LISTENER_ADAPTER.to_string());
        }
        names
    }

    /// Bound webhook address, when the listener is running
    pub fn listener_addr(&self) -> Option<std::net::SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr())
    }

    fn build_pollers(&self) -> Vec<Poller> {
        let mut pollers = Vec::new();

        if let Some(AlertSource::Poll(source)) = &self.plan.alerts {
            for project in &source.projects {
                pollers.push(self.poller(
                    PollTarget::project(Surface::Alerts, &project.name),
                    project.filter.clone(),
                    source.settings,
                ));
            }
        }

        if let Some(logs) = &self.plan.logs {
            // Logs have no page size; each page covers one host
            let settings = PollSettings {
                interval: logs.interval,
                page_size: 1,
                max_pages: 0,
            };
            for project in &logs.projects {
                pollers.push(self.poller(
                    PollTarget::Project {
                        surface: Surface::Logs,
                        name: project.name.clone(),
                        collect_audit_logs: project.collect_audit_logs,
                    },
                    project.filter.clone(),
                    settings,
                ));
            }
        }

        if let Some(events) = &self.plan.events {
            let targets = events
                .projects
                .iter()
                .map(|p| {
                    (
                        PollTarget::project(Surface::Events, &p.name),
                        p.filter.clone(),
                    )
                })
                .chain(
                    events
                        .organizations
                        .iter()
                        .map(|o| (PollTarget::organization(&o.id), ClusterFilter::allow_all())),
                );
            for (target, filter) in targets {
                pollers.push(
                    self.poller(target, filter, events.settings)
                        .with_event_types(events.types.clone()),
                );
            }
        }

        pollers
    }

    fn poller(
        &self,
        target: PollTarget,
        filter: ClusterFilter,
        settings: PollSettings,
    ) -> Poller {
        Poller::new(
            target,
            filter,
            settings,
            self.api.clone(),
            self.sink.clone(),
            self.checkpoints.clone(),
            self.backoff.clone(),
        )
    }
}

impl Drop for IngestionEngine {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
