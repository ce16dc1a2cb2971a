//! Application-wide error types.

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    DatabaseSqlx(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Job store is busy: {0}")]
    StoreBusy(&'static str),

    #[error("Invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Upload too large: {size} bytes exceeds the limit of {limit} bytes")]
    PayloadTooLarge { size: u64, limit: u64 },

    #[error("File type not allowed: {0}")]
    UnsupportedMediaType(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Timeout while waiting for the photobooth to upload {0}")]
    Timeout(String),

    #[error("Photobooth had problems uploading {0}, check the photobooth log for errors")]
    UploadFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("IO error while {op} at {path}: {source}")]
    IoPath {
        op: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    pub fn io_path(op: &'static str, path: &std::path::Path, source: std::io::Error) -> Self {
        Self::IoPath {
            op,
            path: path.display().to_string(),
            source,
        }
    }

    /// Whether the caller may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreBusy(_))
    }

    /// Whether a rejected upload should release the waiting downloader.
    ///
    /// Errors raised after the file has been checked against the job row
    /// (`NotFound`) must not touch the row: it was never solicited.
    pub fn marks_upload_failed(&self) -> bool {
        matches!(
            self,
            Self::Unauthorized(_)
                | Self::Validation(_)
                | Self::PayloadTooLarge { .. }
                | Self::UnsupportedMediaType(_)
                | Self::Io(_)
                | Self::IoPath { .. }
        )
    }
}
