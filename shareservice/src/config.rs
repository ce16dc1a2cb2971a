//! Service configuration.
//!
//! Everything the handshake components need is carried in [`ShareConfig`],
//! built once at startup and handed to each component.

use std::path::PathBuf;
use std::time::Duration;

use crate::{Error, Result};

/// Placeholder shipped in the sample configuration. A service still using it
/// refuses every authenticated action.
pub const DEFAULT_API_KEY: &str = "changedefault!";

/// Minimum accepted length of the shared secret.
pub const MIN_API_KEY_LEN: usize = 8;

/// Protocol version reported by the `info` action.
pub const PROTOCOL_VERSION: u32 = 1;

/// Service name reported by the `info` action.
pub const SERVICE_NAME: &str = "Photo Booth App File Upload Extension";

/// Upload types accepted from the producer, with the extension used on disk.
pub const ALLOWED_UPLOAD_TYPES: &[(&str, &str)] = &[
    ("image/png", "png"),
    ("image/jpeg", "jpg"),
    ("image/gif", "gif"),
    ("video/mp4", "mp4"),
];

/// Sub-directory of the working directory holding in-flight transport files.
const STAGING_DIR_NAME: &str = ".incoming";

#[derive(Debug, Clone)]
pub struct ShareConfig {
    /// Shared secret the producer must present.
    pub api_key: String,
    /// Directory holding the uploaded artifacts.
    pub work_dir: PathBuf,
    /// SQLite database URL for the job store.
    pub database_url: String,
    /// Maximum accepted upload size in bytes.
    pub max_upload_bytes: u64,
    /// How long a download request waits for the upload.
    pub download_timeout: Duration,
    /// Sleep between two polls of the job store.
    pub poll_interval: Duration,
    /// Wall-clock budget of one `upload_queue` request.
    pub queue_budget: Duration,
    /// SQLite lock-wait before a write fails as busy.
    pub busy_timeout: Duration,
    /// Directory for rotated log files.
    pub log_dir: PathBuf,
}

impl Default for ShareConfig {
    fn default() -> Self {
        Self {
            api_key: DEFAULT_API_KEY.to_string(),
            work_dir: PathBuf::from("./uploads"),
            database_url: "sqlite:jobs.sqlite3?mode=rwc".to_string(),
            max_upload_bytes: 15 * 1024 * 1024,
            download_timeout: Duration::from_secs(15),
            poll_interval: Duration::from_millis(500),
            queue_budget: Duration::from_secs(240),
            busy_timeout: Duration::from_millis(200),
            log_dir: PathBuf::from("./logs"),
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|v| v.trim().parse().ok())
}

impl ShareConfig {
    /// Load the configuration from environment variables, falling back to defaults.
    ///
    /// Supported env vars:
    /// - `SHARE_APIKEY`
    /// - `SHARE_WORK_DIR`
    /// - `SHARE_DATABASE_URL`
    /// - `SHARE_MAX_UPLOAD_BYTES`
    /// - `SHARE_DOWNLOAD_TIMEOUT_SECS`
    /// - `SHARE_POLL_INTERVAL_MS`
    /// - `SHARE_QUEUE_BUDGET_SECS`
    /// - `SHARE_BUSY_TIMEOUT_MS`
    /// - `SHARE_LOG_DIR`
    pub fn from_env_or_default() -> Self {
        let mut config = Self::default();

        if let Some(api_key) = env_string("SHARE_APIKEY") {
            config.api_key = api_key;
        }
        if let Some(dir) = env_string("SHARE_WORK_DIR") {
            config.work_dir = PathBuf::from(dir);
        }
        if let Some(url) = env_string("SHARE_DATABASE_URL") {
            config.database_url = url;
        }
        if let Some(bytes) = env_parse::<u64>("SHARE_MAX_UPLOAD_BYTES") {
            config.max_upload_bytes = bytes;
        }
        if let Some(secs) = env_parse::<u64>("SHARE_DOWNLOAD_TIMEOUT_SECS") {
            config.download_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = env_parse::<u64>("SHARE_POLL_INTERVAL_MS")
            && ms > 0
        {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = env_parse::<u64>("SHARE_QUEUE_BUDGET_SECS") {
            config.queue_budget = Duration::from_secs(secs);
        }
        if let Some(ms) = env_parse::<u64>("SHARE_BUSY_TIMEOUT_MS") {
            config.busy_timeout = Duration::from_millis(ms);
        }
        if let Some(dir) = env_string("SHARE_LOG_DIR") {
            config.log_dir = PathBuf::from(dir);
        }

        config
    }

    /// Fail unless a usable shared secret has been configured.
    pub fn ensure_api_key_configured(&self) -> Result<()> {
        if self.api_key.chars().count() < MIN_API_KEY_LEN {
            return Err(Error::config(
                "APIKEY is empty or too short! Configure an APIKEY of at least 8 characters in the shareservice and the photobooth config to pair both systems.",
            ));
        }
        if self.api_key.contains(DEFAULT_API_KEY) {
            return Err(Error::config(
                "APIKEY is still the default! Change the APIKEY in the shareservice and the photobooth config to pair both systems.",
            ));
        }
        Ok(())
    }

    /// Compare the presented secret against the configured one.
    ///
    /// The configuration itself is checked first, so a service running with
    /// the placeholder secret rejects even a caller that presents it.
    pub fn verify_api_key(&self, presented: Option<&str>) -> Result<()> {
        self.ensure_api_key_configured()?;
        match presented {
            Some(key) if key == self.api_key => Ok(()),
            _ => Err(Error::unauthorized(
                "APIKEY not correct! Check the APIKEY in the shareservice and the photobooth config.",
            )),
        }
    }

    /// Extension stored on disk for an allowed mimetype.
    pub fn extension_for(&self, mimetype: &str) -> Option<&'static str> {
        ALLOWED_UPLOAD_TYPES
            .iter()
            .find(|(mime, _)| *mime == mimetype)
            .map(|(_, ext)| *ext)
    }

    /// Directory where transport files are staged before validation.
    pub fn staging_dir(&self) -> PathBuf {
        self.work_dir.join(STAGING_DIR_NAME)
    }

    /// Request body limit: the upload maximum plus room for the multipart envelope.
    pub fn body_limit(&self) -> usize {
        let limit = self.max_upload_bytes.saturating_add(1024 * 1024);
        usize::try_from(limit).unwrap_or(usize::MAX)
    }
}
