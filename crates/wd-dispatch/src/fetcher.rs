//! Queue Fetcher
//!
//! Polls the upstream queue and reconciles the working queue with it. Upstream
//! is authoritative: the empty sentinel or a 404 clears the working queue, and
//! queued entries missing from a response are evicted.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::lifecycle::{is_alive, sleep_while_alive};
use crate::state::{DispatchState, MergeReport};
use crate::upstream::{QueueResponse, QueueSource};

/// What one poll did to the working queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    Cleared { dropped: usize },
    Merged { report: MergeReport, rejected: usize },
    /// Fetch failed; the queue was left unchanged
    Failed,
}

pub struct QueueFetcher {
    source: Arc<dyn QueueSource>,
    state: Arc<DispatchState>,
    interval: Duration,
}

impl QueueFetcher {
    pub fn new(source: Arc<dyn QueueSource>, state: Arc<DispatchState>, interval: Duration) -> Self {
        Self {
            source,
            state,
            interval,
        }
    }

    /// Fetch once and reconcile
    pub async fn poll_once(&self) -> FetchOutcome {
        debug!("Refreshing message queue");

        let response = match self.source.fetch_queue().await {
            Ok(response) => response,
            Err(e) if e.is_not_found() => QueueResponse::Empty,
            Err(e) => {
                error!(error = %e, "Failed to fetch message queue");
                return FetchOutcome::Failed;
            }
        };

        match response {
            QueueResponse::Empty => {
                let dropped = self.state.clear_queue();
                if dropped > 0 {
                    info!(dropped = dropped, "Upstream queue empty, cleared working queue");
                } else {
                    debug!("Upstream queue empty");
                }
                FetchOutcome::Cleared { dropped }
            }
            QueueResponse::Batch(batch) => {
                for (id, e) in &batch.rejected {
                    warn!(message_id = ?id, error = %e, "Discarding invalid queue entry");
                }

                let rejected = batch.rejected.len();
                let report = self.state.merge_batch(batch.messages, &batch.upstream_ids);

                if report.added > 0 {
                    info!(added = report.added, "Queued new messages");
                }
                if report.evicted > 0 {
                    info!(evicted = report.evicted, "Evicted messages retracted upstream");
                }
                debug!(
                    skipped = report.skipped,
                    queue_depth = self.state.snapshot().queue_depth,
                    "Queue reconciled"
                );

                FetchOutcome::Merged { report, rejected }
            }
        }
    }

    /// Poll until `running` turns false
    pub async fn run(&self, mut running: watch::Receiver<bool>) {
        info!(interval_ms = self.interval.as_millis() as u64, "Queue fetcher started");
        while is_alive(&running) {
            if !sleep_while_alive(&mut running, self.interval).await {
                break;
            }
            self.poll_once().await;
        }
        info!("Queue fetcher stopped");
    }
}
