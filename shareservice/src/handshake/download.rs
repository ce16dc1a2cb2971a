//! Download waiter.
//!
//! A download request (re)opens the job for its identifier and then polls the
//! store until the producer's upload resolves it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::ShareConfig;
use crate::database::models::{JobStatus, ShareJobDbModel};
use crate::database::repositories::ShareJobRepository;
use crate::utils::fs::io_error;
use crate::utils::mime;
use crate::{Error, Result};

/// Artifact resolved for a download request.
#[derive(Debug, Clone)]
pub struct DownloadedFile {
    pub filename: String,
    pub mimetype: &'static str,
    pub content: Bytes,
}

pub struct DownloadWaiter {
    repository: Arc<dyn ShareJobRepository>,
    work_dir: PathBuf,
    interval: Duration,
    timeout: Duration,
}

impl DownloadWaiter {
    pub fn new(repository: Arc<dyn ShareJobRepository>, config: &ShareConfig) -> Self {
        Self {
            repository,
            work_dir: config.work_dir.clone(),
            interval: config.poll_interval,
            timeout: config.download_timeout,
        }
    }

    pub fn with_timing(mut self, interval: Duration, timeout: Duration) -> Self {
        self.interval = interval;
        self.timeout = timeout;
        self
    }

    /// Reset the job to pending and wait for it to reach a terminal status.
    ///
    /// Fails with [`Error::UploadFailed`] as soon as the producer reports a
    /// failure, and with [`Error::Timeout`] once the timeout has fully elapsed.
    pub async fn wait_for_upload(&self, file_identifier: &str) -> Result<DownloadedFile> {
        if file_identifier.trim().is_empty() {
            return Err(Error::validation("download requires a file identifier"));
        }

        self.repository.upsert_pending(file_identifier).await?;
        info!(file_identifier, "Download requested, waiting for upload");

        let deadline = Instant::now() + self.timeout;
        loop {
            match self.repository.get_job(file_identifier).await {
                Ok(Some(job)) => match job.job_status()? {
                    JobStatus::Uploaded => return self.resolve(&job).await,
                    JobStatus::UploadFailed => {
                        warn!(file_identifier, "Upload reported as failed");
                        return Err(Error::UploadFailed(file_identifier.to_string()));
                    }
                    status => debug!(file_identifier, %status, "Still waiting for upload"),
                },
                // Rows are never deleted here; an external cleanup may have removed it.
                Ok(None) => debug!(file_identifier, "Job row vanished while waiting"),
                Err(e) if e.is_retryable() => {
                    debug!(file_identifier, error = %e, "Job store busy, polling again")
                }
                Err(e) => return Err(e),
            }

            if Instant::now() >= deadline {
                warn!(
                    file_identifier,
                    timeout_secs = self.timeout.as_secs_f64(),
                    "Timed out waiting for upload"
                );
                return Err(Error::Timeout(file_identifier.to_string()));
            }
            tokio::time::sleep(self.interval).await;
        }
    }

    async fn resolve(&self, job: &ShareJobDbModel) -> Result<DownloadedFile> {
        let Some(filename) = job
            .filename
            .as_deref()
            .and_then(|name| Path::new(name).file_name())
            .and_then(|name| name.to_str())
        else {
            error!(file_identifier = %job.file_identifier, "Uploaded job has no stored filename");
            return Err(Error::not_found("Uploaded file", &job.file_identifier));
        };

        let path = self.work_dir.join(filename);
        let content = match tokio::fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                error!(
                    file_identifier = %job.file_identifier,
                    path = %path.display(),
                    "Uploaded file is missing from the working directory"
                );
                return Err(Error::not_found("Uploaded file", filename));
            }
            Err(e) => return Err(io_error("reading uploaded file", &path, e)),
        };

        let mimetype = mime::sniff(&content[..content.len().min(mime::SNIFF_LEN)]);
        info!(
            file_identifier = %job.file_identifier,
            filename,
            mimetype,
            size = content.len(),
            "Serving uploaded file"
        );

        Ok(DownloadedFile {
            filename: filename.to_string(),
            mimetype,
            content: Bytes::from(content),
        })
    }
}
