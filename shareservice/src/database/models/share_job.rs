//! Share job database models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::ms_to_datetime;
use crate::{Error, Result};

/// Share job database model.
/// One row of `upload_requests`: the handshake state for one identifier.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ShareJobDbModel {
    pub file_identifier: String,
    /// Stored artifact name inside the working directory, set once uploaded.
    pub filename: Option<String>,
    /// Unix epoch milliseconds of the last status transition.
    pub last_modified: i64,
    /// Status: pending, claimed, uploading, uploaded, upload_failed
    pub status: String,
}

impl ShareJobDbModel {
    /// Parsed status of the row.
    pub fn job_status(&self) -> Result<JobStatus> {
        JobStatus::parse(&self.status).ok_or_else(|| {
            Error::Other(format!(
                "Unknown status '{}' for job {}",
                self.status, self.file_identifier
            ))
        })
    }
}

/// Job status values.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Requested by a downloader, waiting for a producer.
    Pending,
    /// Handed to a producer through the upload queue.
    Claimed,
    /// The producer's file is being written to the working directory.
    Uploading,
    /// The artifact is stored and can be served.
    Uploaded,
    /// The producer could not deliver a valid artifact.
    UploadFailed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Uploading => "uploading",
            Self::Uploaded => "uploaded",
            Self::UploadFailed => "upload_failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "claimed" => Some(Self::Claimed),
            "uploading" => Some(Self::Uploading),
            "uploaded" => Some(Self::Uploaded),
            "upload_failed" => Some(Self::UploadFailed),
            _ => None,
        }
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Uploaded | Self::UploadFailed)
    }

    /// Whether `self -> next` is one of the forward handshake transitions.
    ///
    /// Resetting a row to `pending` is not a transition; it recycles the row
    /// and goes through the upsert instead.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match (self, next) {
            (Self::Pending, Self::Claimed)
            | (Self::Claimed, Self::Uploading)
            | (Self::Uploading, Self::Uploaded) => true,
            (from, Self::UploadFailed) => !from.is_terminal(),
            _ => false,
        }
    }

    /// Statuses from which a rejected upload may still mark the job failed.
    pub fn non_terminal() -> [JobStatus; 3] {
        [Self::Pending, Self::Claimed, Self::Uploading]
    }
}

/// Job as exposed on the wire (`upload_queue` lines and `list`).
///
/// Field names follow the row layout the photobooth producer parses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareJobRecord {
    pub file_identifier: String,
    pub filename: Option<String>,
    /// RFC 3339 timestamp of the last status transition.
    pub last_modified: String,
    pub status: String,
}

impl From<&ShareJobDbModel> for ShareJobRecord {
    fn from(job: &ShareJobDbModel) -> Self {
        Self {
            file_identifier: job.file_identifier.clone(),
            filename: job.filename.clone(),
            last_modified: ms_to_datetime(job.last_modified).to_rfc3339(),
            status: job.status.clone(),
        }
    }
}
