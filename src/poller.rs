//! Periodic pull of one Atlas source
//!
//! A [`Poller`] owns a single (surface, project) or (events, organization)
//! stream. Each cycle walks pages from the persisted cursor, forwards the
//! records its cluster filter accepts, and saves the highest cursor seen
//! once the last page has been forwarded. A cycle that fails part way
//! leaves the checkpoint untouched so the next one starts over from the
//! same position.

use crate::api::{AtlasApi, PageRequest, PollTarget};
use crate::checkpoint::{CheckpointStore, Cursor};
use crate::error::Result;
use crate::filter::ClusterFilter;
use crate::retry::{retry, Backoff};
use crate::sink::EventSink;
use crate::validate::PollSettings;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Outcome of one polling cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Pages fetched
    pub pages: u32,
    /// Records handed to the sink
    pub forwarded: usize,
    /// Records rejected by the cluster filter
    pub dropped: usize,
    /// Cursor persisted at the end of the cycle
    pub cursor: Option<Cursor>,
}

/// Polls one source on a fixed interval
pub struct Poller {
    target: PollTarget,
    filter: ClusterFilter,
    settings: PollSettings,
    event_types: Vec<String>,
    api: Arc<dyn AtlasApi>,
    sink: Arc<dyn EventSink>,
    checkpoints: Arc<dyn CheckpointStore>,
    backoff: Arc<dyn Backoff>,
    key: String,
}

impl Poller {
    pub fn new(
        target: PollTarget,
        filter: ClusterFilter,
        settings: PollSettings,
        api: Arc<dyn AtlasApi>,
        sink: Arc<dyn EventSink>,
        checkpoints: Arc<dyn CheckpointStore>,
        backoff: Arc<dyn Backoff>,
    ) -> Self {
        let key = target.checkpoint_key();
        Self {
            target,
            filter,
            settings,
            event_types: Vec::new(),
            api,
            sink,
            checkpoints,
            backoff,
            key,
        }
    }

    /// Restrict the events surface to these type names
    pub fn with_event_types(mut self, types: Vec<String>) -> Self {
        self.event_types = types;
        self
    }

    /// Checkpoint key, also the adapter name
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn target(&self) -> &PollTarget {
        &self.target
    }

    /// Run cycles until `cancel` fires; the first cycle starts immediately
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            source = %self.key,
            interval_ms = self.settings.interval.as_millis() as u64,
            page_size = self.settings.page_size,
            max_pages = self.settings.max_pages,
            "Poller started"
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                result = self.poll_cycle() => {
                    if let Err(e) = result {
                        tracing::error!(source = %self.key, error = %e, "Polling cycle abandoned");
                    }
                }
            }
        }

        tracing::info!(source = %self.key, "Poller stopped");
    }

    /// Run one cycle from the persisted cursor
    pub async fn poll_cycle(&self) -> Result<CycleReport> {
        let start = self.checkpoints.load(&self.key)?;
        let mut report = CycleReport::default();
        let mut highest = start.clone();
        let surface = self.target.surface();
        let origin = self.target.origin();

        loop {
            let page_num = report.pages + 1;
            let what = format!("{} page {}", self.key, page_num);
            let page = retry(self.backoff.as_ref(), &what, || {
                self.api.fetch_page(PageRequest {
                    target: &self.target,
                    cursor: start.as_ref(),
                    page_num,
                    page_size: self.settings.page_size,
                    event_types: &self.event_types,
                })
            })
            .await?;
            report.pages = page_num;

            for record in page.records {
                if !self.filter.matches_attribution(record.cluster.as_deref()) {
                    report.dropped += 1;
                    continue;
                }

                let event = record.into_event(surface, origin.clone());
                let submit_what = format!("{} submit {}", self.key, event.id);
                retry(self.backoff.as_ref(), &submit_what, || {
                    self.sink.submit(event.clone())
                })
                .await?;
                report.forwarded += 1;
            }

            if let Some(cursor) = page.cursor {
                if highest.as_ref().map_or(true, |h| cursor > *h) {
                    highest = Some(cursor);
                }
            }

            tracing::debug!(
                source = %self.key,
                page = page_num,
                forwarded = report.forwarded,
                dropped = report.dropped,
                "Fetched page"
            );

            let limit_reached =
                self.settings.max_pages != 0 && report.pages >= self.settings.max_pages;
            if !page.has_next || limit_reached {
                break;
            }
        }

        if let Some(cursor) = &highest {
            self.checkpoints.save(&self.key, cursor)?;
        }
        report.cursor = highest;

        tracing::debug!(
            source = %self.key,
            pages = report.pages,
            forwarded = report.forwarded,
            dropped = report.dropped,
            "Polling cycle complete"
        );
        Ok(report)
    }
}
