//! Claim poller behind the `upload_queue` long poll.
//!
//! Every iteration hands the oldest pending job to the producer, or sends a
//! heartbeat when there is nothing to do. The loop ends after a fixed
//! wall-clock budget and the producer reconnects.

use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ShareConfig;
use crate::database::models::ShareJobRecord;
use crate::database::repositories::ShareJobRepository;

/// One line of the `upload_queue` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum QueueEvent {
    /// A job the producer must now upload.
    Claimed(ShareJobRecord),
    /// Heartbeat carrying the current Unix time in seconds.
    Ping { ping: i64 },
}

impl QueueEvent {
    pub fn ping_now() -> Self {
        Self::Ping {
            ping: chrono::Utc::now().timestamp(),
        }
    }

    /// JSON object terminated by a newline.
    ///
    /// A frame that fails to serialize is replaced by a heartbeat.
    pub fn to_line(&self) -> String {
        let mut line = match serde_json::to_string(self) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "Failed to serialize queue event, sending heartbeat instead");
                heartbeat_frame(chrono::Utc::now().timestamp())
            }
        };
        line.push('\n');
        line
    }
}

fn heartbeat_frame(ping: i64) -> String {
    format!("{{\"ping\":{ping}}}")
}

#[derive(Clone)]
pub struct ClaimPoller {
    repository: Arc<dyn ShareJobRepository>,
    interval: Duration,
    budget: Duration,
}

impl ClaimPoller {
    pub fn new(repository: Arc<dyn ShareJobRepository>, config: &ShareConfig) -> Self {
        Self::with_timing(repository, config.poll_interval, config.queue_budget)
    }

    pub fn with_timing(
        repository: Arc<dyn ShareJobRepository>,
        interval: Duration,
        budget: Duration,
    ) -> Self {
        Self {
            repository,
            interval,
            budget,
        }
    }

    /// Run a single iteration: claim the oldest pending job or produce a heartbeat.
    ///
    /// A store failure is logged and answered with a heartbeat so the long
    /// poll survives a busy database.
    pub async fn poll_once(&self) -> QueueEvent {
        match self.repository.claim_oldest_pending().await {
            Ok(Some(job)) => {
                info!(file_identifier = %job.file_identifier, "Job claimed by producer");
                QueueEvent::Claimed(ShareJobRecord::from(&job))
            }
            Ok(None) => QueueEvent::ping_now(),
            Err(e) => {
                warn!(error = %e, "Failed to claim pending job, sending heartbeat instead");
                QueueEvent::ping_now()
            }
        }
    }

    /// Stream one event per iteration until the budget is spent.
    ///
    /// The first event is produced immediately. Dropping the stream (client
    /// disconnect) stops the loop.
    pub fn into_stream(self) -> impl Stream<Item = QueueEvent> + Send + 'static {
        let started = Instant::now();
        futures::stream::unfold((self, true), move |(poller, first)| async move {
            if !first {
                tokio::time::sleep(poller.interval).await;
                if started.elapsed() > poller.budget {
                    debug!(
                        budget_secs = poller.budget.as_secs(),
                        "Upload queue budget spent, closing long poll"
                    );
                    return None;
                }
            }
            let event = poller.poll_once().await;
            Some((event, (poller, false)))
        })
    }
}
