//! Upload handler.
//!
//! Lands a producer's file against a claimed job:
//! `claimed -> uploading -> uploaded`, or `upload_failed` when the upload is
//! rejected so the waiting downloader is released.

use std::path::Path;
use std::sync::Arc;

use tempfile::TempPath;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

use crate::config::ShareConfig;
use crate::database::models::JobStatus;
use crate::database::repositories::ShareJobRepository;
use crate::utils::fs::{ensure_dir_all_with_op, io_error, read_head};
use crate::utils::mime;
use crate::{Error, Result};

/// Prefix of staged transport files; the stored artifact keeps this name.
const STAGING_PREFIX: &str = "upload";

/// A transport file being written to the staging directory.
pub struct StagedUpload {
    file: tokio::fs::File,
    path: TempPath,
    size: u64,
}

impl StagedUpload {
    pub async fn create(staging_dir: &Path) -> Result<Self> {
        ensure_dir_all_with_op("creating staging directory", staging_dir).await?;
        let named = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempfile_in(staging_dir)
            .map_err(|e| io_error("creating staging file", staging_dir, e))?;
        let (file, path) = named.into_parts();
        Ok(Self {
            file: tokio::fs::File::from_std(file),
            path,
            size: 0,
        })
    }

    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        self.file
            .write_all(chunk)
            .await
            .map_err(|e| io_error("writing staging file", &self.path, e))?;
        self.size += chunk.len() as u64;
        Ok(())
    }

    pub async fn finish(mut self) -> Result<UploadedFile> {
        self.file
            .flush()
            .await
            .map_err(|e| io_error("flushing staging file", &self.path, e))?;
        drop(self.file);
        Ok(UploadedFile {
            path: self.path,
            size: self.size,
        })
    }
}

/// A completely received transport file. Removed from disk when dropped.
#[derive(Debug)]
pub struct UploadedFile {
    path: TempPath,
    size: u64,
}

impl UploadedFile {
    /// Stage an in-memory payload.
    pub async fn from_bytes(staging_dir: &Path, content: &[u8]) -> Result<Self> {
        let mut staged = StagedUpload::create(staging_dir).await?;
        staged.write_chunk(content).await?;
        staged.finish().await
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Basename of the transport file.
    pub fn temp_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| STAGING_PREFIX.to_string())
    }

    /// Delete the transport file.
    pub fn remove(self) {
        let path = self.path.to_path_buf();
        if let Err(e) = self.path.close() {
            warn!(path = %path.display(), error = %e, "Failed to remove staging file");
        }
    }
}

/// What the transport delivered for the `upload_file` part.
#[derive(Debug)]
pub enum TransportFile {
    Received(UploadedFile),
    /// No file part in the request.
    Missing,
    /// The transport broke off while receiving the file.
    Failed(String),
}

#[derive(Debug)]
pub struct UploadRequest {
    pub file_identifier: String,
    pub api_key: Option<String>,
    pub file: TransportFile,
}

/// An upload that passed every check and answers a claimed job.
struct ValidatedUpload {
    file: UploadedFile,
    mimetype: &'static str,
    extension: &'static str,
}

/// Outcome of a stored upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    pub file_identifier: String,
    pub filename: String,
    pub mimetype: &'static str,
    pub size: u64,
}

pub struct UploadHandler {
    repository: Arc<dyn ShareJobRepository>,
    config: Arc<ShareConfig>,
}

impl UploadHandler {
    pub fn new(repository: Arc<dyn ShareJobRepository>, config: Arc<ShareConfig>) -> Self {
        Self { repository, config }
    }

    /// Validate and store an upload.
    ///
    /// A rejected upload marks the job `upload_failed` (when the row is still
    /// live) before the error is returned. An upload for a job that was never
    /// claimed is refused without touching the store. Once the job is
    /// `uploading`, any failure marks it `upload_failed` and discards the
    /// stored copy.
    pub async fn handle(&self, request: UploadRequest) -> Result<UploadReceipt> {
        self.config.ensure_api_key_configured()?;

        let file_identifier = request.file_identifier.clone();
        let upload = match self.prepare(request).await {
            Ok(upload) => upload,
            Err(err) => {
                if err.marks_upload_failed() {
                    self.release_waiter(&file_identifier, &err).await;
                }
                return Err(err);
            }
        };

        self.store(&file_identifier, upload).await
    }

    /// Steps before the job is touched: key, transport, content and claim.
    async fn prepare(&self, request: UploadRequest) -> Result<ValidatedUpload> {
        let file_identifier = request.file_identifier.as_str();
        self.config.verify_api_key(request.api_key.as_deref())?;

        let file = match request.file {
            TransportFile::Received(file) => file,
            TransportFile::Missing => {
                return Err(Error::validation(format!(
                    "There is no file uploaded ({})",
                    file_identifier
                )));
            }
            TransportFile::Failed(reason) => {
                return Err(Error::validation(format!(
                    "Error processing the uploaded file: {}",
                    reason
                )));
            }
        };

        let (mimetype, extension) = self.validate(&file).await?;

        // The upload must answer a job the queue actually handed out.
        let claimed = self
            .repository
            .get_job(file_identifier)
            .await?
            .is_some_and(|job| job.status == JobStatus::Claimed.as_str());
        if !claimed {
            return Err(Error::not_found("Claimed job", file_identifier));
        }

        Ok(ValidatedUpload {
            file,
            mimetype,
            extension,
        })
    }

    async fn store(&self, file_identifier: &str, upload: ValidatedUpload) -> Result<UploadReceipt> {
        if !self
            .repository
            .transition(file_identifier, Some(JobStatus::Claimed), JobStatus::Uploading, None)
            .await?
        {
            // Reset or failed between the lookup and the transition.
            return Err(Error::not_found("Claimed job", file_identifier));
        }

        let ValidatedUpload {
            file,
            mimetype,
            extension,
        } = upload;
        let filename = format!("{}.{}", file.temp_name(), extension);
        let destination = self.config.work_dir.join(&filename);
        let size = file.size();

        if let Err(err) = self.land(file_identifier, file, &filename, &destination).await {
            self.abandon(file_identifier, &destination, &err).await;
            return Err(err);
        }

        info!(file_identifier, filename = %filename, mimetype, size, "File stored and ready to download");

        Ok(UploadReceipt {
            file_identifier: file_identifier.to_string(),
            filename,
            mimetype,
            size,
        })
    }

    /// Copy the staged file into the working directory and finish the job.
    async fn land(
        &self,
        file_identifier: &str,
        file: UploadedFile,
        filename: &str,
        destination: &Path,
    ) -> Result<()> {
        tokio::fs::copy(file.path(), destination)
            .await
            .map_err(|e| io_error("storing uploaded file", destination, e))?;
        file.remove();

        if !self
            .repository
            .transition(
                file_identifier,
                Some(JobStatus::Uploading),
                JobStatus::Uploaded,
                Some(filename),
            )
            .await?
        {
            return Err(Error::InvalidStateTransition {
                from: JobStatus::Uploading.to_string(),
                to: JobStatus::Uploaded.to_string(),
            });
        }
        Ok(())
    }

    /// Undo a half-finished store: drop the copy and fail the job if it is
    /// still ours. A row recycled by a new download is left alone.
    async fn abandon(&self, file_identifier: &str, destination: &Path, cause: &Error) {
        if let Err(e) = tokio::fs::remove_file(destination).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            debug!(path = %destination.display(), error = %e, "Failed to remove orphaned upload");
        }

        match self
            .repository
            .transition(
                file_identifier,
                Some(JobStatus::Uploading),
                JobStatus::UploadFailed,
                None,
            )
            .await
        {
            Ok(true) => {
                warn!(file_identifier, error = %cause, "Storing upload failed, job marked upload_failed")
            }
            Ok(false) => {
                debug!(file_identifier, error = %cause, "Storing upload failed, job no longer uploading")
            }
            Err(e) => error!(
                file_identifier,
                error = %e,
                "Failed to mark job upload_failed after storing failed"
            ),
        }
    }

    /// Size and content checks; returns the sniffed mimetype and its extension.
    async fn validate(&self, file: &UploadedFile) -> Result<(&'static str, &'static str)> {
        if file.size() == 0 {
            return Err(Error::validation("The file is empty."));
        }
        if file.size() > self.config.max_upload_bytes {
            return Err(Error::PayloadTooLarge {
                size: file.size(),
                limit: self.config.max_upload_bytes,
            });
        }

        let head = read_head(file.path(), mime::SNIFF_LEN).await?;
        let mimetype = mime::sniff(&head);
        let extension = self
            .config
            .extension_for(mimetype)
            .ok_or_else(|| Error::UnsupportedMediaType(mimetype.to_string()))?;
        Ok((mimetype, extension))
    }

    async fn release_waiter(&self, file_identifier: &str, cause: &Error) {
        if file_identifier.is_empty() {
            return;
        }
        match self.repository.mark_upload_failed(file_identifier).await {
            Ok(true) => {
                warn!(file_identifier, error = %cause, "Upload rejected, job marked upload_failed")
            }
            Ok(false) => {
                debug!(file_identifier, error = %cause, "Upload rejected, no live job to mark")
            }
            Err(e) => error!(
                file_identifier,
                error = %e,
                "Failed to mark job upload_failed after rejected upload"
            ),
        }
    }
}
