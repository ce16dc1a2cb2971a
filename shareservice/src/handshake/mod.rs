//! Job handshake between the download page and the photobooth.
//!
//! - [`DownloadWaiter`] opens a job and waits for it to resolve.
//! - [`ClaimPoller`] hands pending jobs to the producer's long poll.
//! - [`UploadHandler`] lands the producer's file against a claimed job.

pub mod claim;
pub mod download;
pub mod upload;

pub use claim::{ClaimPoller, QueueEvent};
pub use download::{DownloadWaiter, DownloadedFile};
pub use upload::{
    StagedUpload, TransportFile, UploadHandler, UploadReceipt, UploadRequest, UploadedFile,
};
