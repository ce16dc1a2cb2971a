//! End-to-end tests of the job handshake against a real SQLite store.
//!
//! Each test gets its own file-backed database in a temporary directory and
//! short timings so the waiting paths finish quickly.

use std::io::Cursor;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use tempfile::TempDir;

use shareservice::Error;
use shareservice::config::ShareConfig;
use shareservice::database::models::{JobStatus, ShareJobDbModel};
use shareservice::database::repositories::{ShareJobRepository, SqlxShareJobRepository};
use shareservice::database::{init_pool_with_busy_timeout, run_migrations};
use shareservice::handshake::{
    ClaimPoller, DownloadWaiter, QueueEvent, TransportFile, UploadHandler, UploadRequest,
    UploadedFile,
};

const API_KEY: &str = "booth-secret-1";

struct Harness {
    _dir: TempDir,
    config: Arc<ShareConfig>,
    repo: Arc<SqlxShareJobRepository>,
}

impl Harness {
    async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    async fn with_config(adjust: impl FnOnce(&mut ShareConfig)) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = ShareConfig {
            api_key: API_KEY.to_string(),
            work_dir: dir.path().join("uploads"),
            database_url: format!(
                "sqlite:{}?mode=rwc",
                dir.path().join("jobs.sqlite3").to_string_lossy().replace('\\', "/")
            ),
            max_upload_bytes: 1024 * 1024,
            download_timeout: Duration::from_millis(400),
            poll_interval: Duration::from_millis(20),
            queue_budget: Duration::from_millis(200),
            busy_timeout: Duration::from_millis(200),
            log_dir: dir.path().join("logs"),
        };
        adjust(&mut config);
        tokio::fs::create_dir_all(config.staging_dir()).await.unwrap();

        let pool = init_pool_with_busy_timeout(&config.database_url, config.busy_timeout)
            .await
            .unwrap();
        run_migrations(&pool).await.unwrap();

        Self {
            _dir: dir,
            config: Arc::new(config),
            repo: Arc::new(SqlxShareJobRepository::new(pool)),
        }
    }

    fn waiter(&self) -> DownloadWaiter {
        DownloadWaiter::new(self.repo.clone(), &self.config)
    }

    fn poller(&self) -> ClaimPoller {
        ClaimPoller::new(self.repo.clone(), &self.config)
    }

    fn handler(&self) -> UploadHandler {
        UploadHandler::new(self.repo.clone(), self.config.clone())
    }

    async fn staged(&self, content: &[u8]) -> TransportFile {
        TransportFile::Received(
            UploadedFile::from_bytes(&self.config.staging_dir(), content)
                .await
                .unwrap(),
        )
    }

    async fn upload(&self, id: &str, key: &str, content: &[u8]) -> shareservice::Result<String> {
        let file = self.staged(content).await;
        self.handler()
            .handle(UploadRequest {
                file_identifier: id.to_string(),
                api_key: Some(key.to_string()),
                file,
            })
            .await
            .map(|receipt| receipt.filename)
    }

    async fn status(&self, id: &str) -> Option<String> {
        self.repo.get_job(id).await.unwrap().map(|job| job.status)
    }

    /// Claim jobs until `id` comes up, as the producer's long poll would.
    async fn claim(&self, id: &str) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(job) = self.repo.claim_oldest_pending().await.unwrap()
                && job.file_identifier == id
            {
                return;
            }
            assert!(Instant::now() < deadline, "job {id} was never claimed");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

fn png_bytes() -> Vec<u8> {
    let image = image::RgbImage::from_pixel(4, 4, image::Rgb([200, 40, 90]));
    let mut buf = Cursor::new(Vec::new());
    image.write_to(&mut buf, image::ImageFormat::Png).unwrap();
    buf.into_inner()
}

fn mp4_bytes() -> Vec<u8> {
    iso_media(b"isom", b"isomiso2")
}

/// ISO base media header with the given major and compatible brands.
fn iso_media(major: &[u8; 4], compatible: &[u8]) -> Vec<u8> {
    let box_size = (16 + compatible.len()) as u32;
    let mut data = box_size.to_be_bytes().to_vec();
    data.extend_from_slice(b"ftyp");
    data.extend_from_slice(major);
    data.extend_from_slice(&[0x00, 0x00, 0x02, 0x00]);
    data.extend_from_slice(compatible);
    data.extend_from_slice(&[0u8; 32]);
    data
}

/// Regular files in the working directory (the staging dir is skipped).
fn stored_files(config: &ShareConfig) -> Vec<std::path::PathBuf> {
    std::fs::read_dir(&config.work_dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect()
}

/// Real store that reports itself busy whenever a job would become uploaded.
struct BusyOnFinish(Arc<SqlxShareJobRepository>);

#[async_trait]
impl ShareJobRepository for BusyOnFinish {
    async fn upsert_pending(&self, file_identifier: &str) -> shareservice::Result<ShareJobDbModel> {
        self.0.upsert_pending(file_identifier).await
    }

    async fn get_job(&self, file_identifier: &str) -> shareservice::Result<Option<ShareJobDbModel>> {
        self.0.get_job(file_identifier).await
    }

    async fn find_oldest_pending(&self) -> shareservice::Result<Option<ShareJobDbModel>> {
        self.0.find_oldest_pending().await
    }

    async fn claim_oldest_pending(&self) -> shareservice::Result<Option<ShareJobDbModel>> {
        self.0.claim_oldest_pending().await
    }

    async fn transition(
        &self,
        file_identifier: &str,
        from: Option<JobStatus>,
        to: JobStatus,
        filename: Option<&str>,
    ) -> shareservice::Result<bool> {
        if to == JobStatus::Uploaded {
            return Err(Error::StoreBusy("share_job.transition"));
        }
        self.0.transition(file_identifier, from, to, filename).await
    }

    async fn list_jobs(&self) -> shareservice::Result<Vec<ShareJobDbModel>> {
        self.0.list_jobs().await
    }
}

mod store_tests {
    use super::*;

    #[tokio::test]
    async fn test_migrations_create_upload_requests() {
        let h = Harness::new().await;
        let jobs = h.repo.list_jobs().await.unwrap();
        assert!(jobs.is_empty());
    }

    #[tokio::test]
    async fn test_upsert_resets_finished_job() {
        let h = Harness::new().await;
        h.repo.upsert_pending("abc123").await.unwrap();
        h.claim("abc123").await;
        assert!(
            h.repo
                .transition("abc123", Some(JobStatus::Claimed), JobStatus::Uploading, None)
                .await
                .unwrap()
        );
        assert!(
            h.repo
                .transition(
                    "abc123",
                    Some(JobStatus::Uploading),
                    JobStatus::Uploaded,
                    Some("upload1.png")
                )
                .await
                .unwrap()
        );

        let job = h.repo.upsert_pending("abc123").await.unwrap();
        assert_eq!(job.status, "pending");
        assert_eq!(job.filename, None);
        assert_eq!(h.repo.list_jobs().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_claim_takes_oldest_pending_once() {
        let h = Harness::new().await;
        h.repo.upsert_pending("first").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        h.repo.upsert_pending("second").await.unwrap();

        let oldest = h.repo.find_oldest_pending().await.unwrap().unwrap();
        assert_eq!(oldest.file_identifier, "first");

        let a =h.repo.claim_oldest_pending().await.unwrap().unwrap();
        let b = h.repo.claim_oldest_pending().await.unwrap().unwrap();
        assert_eq!(a.file_identifier, "first");
        assert_eq!(a.status, "claimed");
        assert_eq!(b.file_identifier, "second");
        assert!(h.repo.claim_oldest_pending().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_transition_refuses_skipped_steps() {
        let h = Harness::new().await;
        h.repo.upsert_pending("abc123").await.unwrap();

        // pending -> uploading skips the claim
        assert!(
            !h.repo
                .transition("abc123", None, JobStatus::Uploading, None)
                .await
                .unwrap()
        );
        // uploaded requires a filename
        assert!(matches!(
            h.repo
                .transition("abc123", None, JobStatus::Uploaded, None)
                .await,
            Err(Error::Validation(_))
        ));
        assert_eq!(h.status("abc123").await.as_deref(), Some("pending"));

        // upload_failed is reachable from any live status, but not twice
        assert!(h.repo.mark_upload_failed("abc123").await.unwrap());
        assert!(!h.repo.mark_upload_failed("abc123").await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_claims_never_hand_out_a_job_twice() {
        const JOBS: usize = 40;
        const WORKERS: usize = 8;

        let h = Harness::new().await;
        for i in 0..JOBS {
            h.repo.upsert_pending(&format!("job-{i}")).await.unwrap();
        }

        let mut set = tokio::task::JoinSet::new();
        for _ in 0..WORKERS {
            let repo = h.repo.clone();
            set.spawn(async move {
                let mut mine = Vec::new();
                loop {
                    match repo.claim_oldest_pending().await {
                        Ok(Some(job)) => mine.push(job.file_identifier),
                        Ok(None) => break,
                        Err(e) if e.is_retryable() => {
                            tokio::time::sleep(Duration::from_millis(2)).await
                        }
                        Err(e) => panic!("claim failed: {e}"),
                    }
                }
                mine
            });
        }

        let mut claimed = Vec::new();
        while let Some(result) = set.join_next().await {
            claimed.extend(result.unwrap());
        }
        claimed.sort();
        let before = claimed.len();
        claimed.dedup();
        assert_eq!(before, claimed.len(), "a job was claimed twice");
        assert_eq!(claimed.len(), JOBS);
    }
}

mod upload_tests {
    use super::*;

    #[tokio::test]
    async fn test_upload_stores_file_and_marks_uploaded() {
        let h = Harness::new().await;
        h.repo.upsert_pending("abc123").await.unwrap();
        h.claim("abc123").await;

        let filename = h.upload("abc123", API_KEY, &png_bytes()).await.unwrap();
        assert!(filename.ends_with(".png"));
        assert!(h.config.work_dir.join(&filename).is_file());

        let job = h.repo.get_job("abc123").await.unwrap().unwrap();
        assert_eq!(job.status, "uploaded");
        assert_eq!(job.filename.as_deref(), Some(filename.as_str()));
    }

    #[tokio::test]
    async fn test_video_upload_is_accepted() {
        let h = Harness::new().await;
        h.repo.upsert_pending("clip").await.unwrap();
        h.claim("clip").await;

        let filename = h.upload("clip", API_KEY, &mp4_bytes()).await.unwrap();
        assert!(filename.ends_with(".mp4"));
    }

    #[tokio::test]
    async fn test_upload_without_claim_leaves_store_untouched() {
        let h = Harness::new().await;

        let err = h.upload("ghost", API_KEY, &png_bytes()).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
        assert!(h.repo.get_job("ghost").await.unwrap().is_none());

        h.repo.upsert_pending("waiting").await.unwrap();
        let err = h.upload("waiting", API_KEY, &png_bytes()).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
        assert_eq!(h.status("waiting").await.as_deref(), Some("pending"));
    }

    #[tokio::test]
    async fn test_disallowed_type_marks_upload_failed() {
        let h = Harness::new().await;
        h.repo.upsert_pending("abc123").await.unwrap();
        h.claim("abc123").await;

        let err = h
            .upload("abc123", API_KEY, b"just some plain text")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedMediaType(_)));
        assert_eq!(h.status("abc123").await.as_deref(), Some("upload_failed"));
    }

    #[tokio::test]
    async fn test_non_mp4_iso_media_is_rejected() {
        let h = Harness::new().await;
        let cases: [(&str, &[u8; 4], &[u8]); 4] = [
            ("heic", b"heic", b"mif1heic"),
            ("m4a", b"M4A ", b"M4A mp42isom"),
            ("3gp", b"3gp4", b"3gp4isom"),
            ("cr3", b"crx ", b"crx isom"),
        ];

        for (id, major, compatible) in cases {
            h.repo.upsert_pending(id).await.unwrap();
            h.claim(id).await;

            let err = h
                .upload(id, API_KEY, &iso_media(major, compatible))
                .await
                .unwrap_err();
            assert!(matches!(err, Error::UnsupportedMediaType(_)), "{id}: {err}");
            assert_eq!(h.status(id).await.as_deref(), Some("upload_failed"), "{id}");
        }
        assert!(stored_files(&h.config).is_empty());
    }

    #[tokio::test]
    async fn test_oversized_upload_is_rejected() {
        let h = Harness::with_config(|c| c.max_upload_bytes = 32).await;
        h.repo.upsert_pending("big").await.unwrap();
        h.claim("big").await;

        let err = h.upload("big", API_KEY, &png_bytes()).await.unwrap_err();
        assert!(matches!(err, Error::PayloadTooLarge { .. }));
        assert_eq!(h.status("big").await.as_deref(), Some("upload_failed"));
    }

    #[tokio::test]
    async fn test_empty_and_missing_files_mark_upload_failed() {
        let h = Harness::new().await;
        for id in ["empty", "missing", "broken"] {
            h.repo.upsert_pending(id).await.unwrap();
            h.claim(id).await;
        }

        let err = h.upload("empty", API_KEY, b"").await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        for (id, file) in [
            ("missing", TransportFile::Missing),
            ("broken", TransportFile::Failed("connection reset".into())),
        ] {
            let err = h
                .handler()
                .handle(UploadRequest {
                    file_identifier: id.to_string(),
                    api_key: Some(API_KEY.to_string()),
                    file,
                })
                .await
                .unwrap_err();
            assert!(matches!(err, Error::Validation(_)));
        }

        for id in ["empty", "missing", "broken"] {
            assert_eq!(h.status(id).await.as_deref(), Some("upload_failed"));
        }
    }

    #[tokio::test]
    async fn test_wrong_api_key_leaves_other_jobs_untouched() {
        let h = Harness::new().await;
        h.repo.upsert_pending("target").await.unwrap();
        h.repo.upsert_pending("bystander").await.unwrap();
        h.claim("target").await;
        h.claim("bystander").await;

        let err = h
            .upload("target", "not-the-key", &png_bytes())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)));
        assert_eq!(h.status("bystander").await.as_deref(), Some("claimed"));

        let stored: Vec<_> = std::fs::read_dir(&h.config.work_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_file())
            .collect();
        assert!(stored.is_empty());
    }

    #[tokio::test]
    async fn test_unconfigured_key_refuses_without_marking() {
        let h = Harness::with_config(|c| c.api_key = "changedefault!".to_string()).await;
        h.repo.upsert_pending("abc123").await.unwrap();
        h.claim("abc123").await;

        let err = h
            .upload("abc123", "changedefault!", &png_bytes())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert_eq!(h.status("abc123").await.as_deref(), Some("claimed"));
    }

    #[tokio::test]
    async fn test_staging_files_are_cleaned_up() {
        let h = Harness::new().await;
        h.repo.upsert_pending("abc123").await.unwrap();
        h.claim("abc123").await;
        h.upload("abc123", API_KEY, &png_bytes()).await.unwrap();
        let _ = h.upload("nobody", API_KEY, &png_bytes()).await;

        let leftovers = std::fs::read_dir(h.config.staging_dir()).unwrap().count();
        assert_eq!(leftovers, 0);
    }
}

mod waiter_tests {
    use super::*;

    #[tokio::test]
    async fn test_failed_copy_into_work_dir_releases_waiter() {
        let h = Harness::with_config(|c| c.download_timeout = Duration::from_secs(10)).await;

        let waiter = h.waiter();
        let started = Instant::now();
        let download = tokio::spawn(async move { waiter.wait_for_upload("abc123").await });
        h.claim("abc123").await;

        let file = UploadedFile::from_bytes(&h.config.staging_dir(), &png_bytes())
            .await
            .unwrap();
        // A directory squatting on the destination name makes the copy fail.
        let destination = h.config.work_dir.join(format!("{}.png", file.temp_name()));
        std::fs::create_dir(&destination).unwrap();

        let err = h
            .handler()
            .handle(UploadRequest {
                file_identifier: "abc123".to_string(),
                api_key: Some(API_KEY.to_string()),
                file: TransportFile::Received(file),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::IoPath { .. }), "{err}");
        assert_eq!(h.status("abc123").await.as_deref(), Some("upload_failed"));

        let err = download.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::UploadFailed(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_store_failure_after_uploading_releases_waiter() {
        let h = Harness::with_config(|c| c.download_timeout = Duration::from_secs(10)).await;

        let waiter = h.waiter();
        let started = Instant::now();
        let download = tokio::spawn(async move { waiter.wait_for_upload("abc123").await });
        h.claim("abc123").await;

        let handler = UploadHandler::new(Arc::new(BusyOnFinish(h.repo.clone())), h.config.clone());
        let err = handler
            .handle(UploadRequest {
                file_identifier: "abc123".to_string(),
                api_key: Some(API_KEY.to_string()),
                file: h.staged(&png_bytes()).await,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StoreBusy(_)));
        assert_eq!(h.status("abc123").await.as_deref(), Some("upload_failed"));
        assert!(stored_files(&h.config).is_empty(), "stored copy was not discarded");

        let err = download.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::UploadFailed(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_end_to_end_handshake() {
        let h = Harness::with_config(|c| c.download_timeout = Duration::from_secs(5)).await;
        let png = png_bytes();

        let waiter = h.waiter();
        let download = tokio::spawn(async move { waiter.wait_for_upload("abc123").await });

        let mut queue = Box::pin(h.poller().into_stream());
        let claimed = loop {
            let event = queue.next().await;
            match event {
                Some(QueueEvent::Claimed(job)) => break job,
                Some(QueueEvent::Ping { .. }) => continue,
                None => queue = Box::pin(h.poller().into_stream()),
            }
        };
        assert_eq!(claimed.file_identifier, "abc123");
        assert_eq!(claimed.status, "claimed");

        h.upload("abc123", API_KEY, &png).await.unwrap();

        let file = download.await.unwrap().unwrap();
        assert_eq!(file.mimetype, "image/png");
        assert_eq!(file.content.as_ref(), png.as_slice());
        assert!(file.filename.ends_with(".png"));
        assert_eq!(h.status("abc123").await.as_deref(), Some("uploaded"));
    }

    #[tokio::test]
    async fn test_timeout_waits_the_full_period() {
        let h = Harness::with_config(|c| c.download_timeout = Duration::from_millis(150)).await;

        let started = Instant::now();
        let err = h.waiter().wait_for_upload("nobody-home").await.unwrap_err();

        assert!(matches!(err, Error::Timeout(_)));
        assert!(started.elapsed() >= Duration::from_millis(150));
        assert_eq!(h.status("nobody-home").await.as_deref(), Some("pending"));
    }

    #[tokio::test]
    async fn test_upload_failure_releases_waiter_early() {
        let h = Harness::with_config(|c| c.download_timeout = Duration::from_secs(10)).await;

        let waiter = h.waiter();
        let started = Instant::now();
        let download = tokio::spawn(async move { waiter.wait_for_upload("abc123").await });

        h.claim("abc123").await;
        let _ = h.upload("abc123", API_KEY, b"not an image").await;

        let err = download.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::UploadFailed(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_new_download_recycles_failed_job() {
        let h = Harness::new().await;
        h.repo.upsert_pending("abc123").await.unwrap();
        h.claim("abc123").await;
        h.repo.mark_upload_failed("abc123").await.unwrap();

        let waiter = h.waiter().with_timing(Duration::from_millis(10), Duration::from_millis(50));
        let err = waiter.wait_for_upload("abc123").await.unwrap_err();

        // A fresh wait starts from pending, not from the earlier failure.
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn test_empty_identifier_is_rejected() {
        let h = Harness::new().await;
        let err = h.waiter().wait_for_upload("").await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(h.repo.list_jobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_artifact_is_not_found() {
        let h = Harness::new().await;
        h.repo.upsert_pending("abc123").await.unwrap();
        h.claim("abc123").await;
        let filename = h.upload("abc123", API_KEY, &png_bytes()).await.unwrap();
        std::fs::remove_file(h.config.work_dir.join(&filename)).unwrap();

        // Re-mark as uploaded after the reset a new wait performs.
        let repo = h.repo.clone();
        let name = filename.clone();
        let restore = tokio::spawn(async move {
            let deadline = Instant::now() + Duration::from_secs(2);
            while Instant::now() < deadline {
                if let Some(job) = repo.claim_oldest_pending().await.unwrap()
                    && job.file_identifier == "abc123"
                {
                    repo.transition("abc123", None, JobStatus::Uploading, None)
                        .await
                        .unwrap();
                    repo.transition("abc123", None, JobStatus::Uploaded, Some(&name))
                        .await
                        .unwrap();
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        let err = h
            .waiter()
            .with_timing(Duration::from_millis(10), Duration::from_secs(2))
            .wait_for_upload("abc123")
            .await
            .unwrap_err();
        restore.await.unwrap();
        assert!(matches!(err, Error::NotFound { .. }));
    }
}

mod queue_tests {
    use super::*;

    #[tokio::test]
    async fn test_stream_claims_then_pings_until_budget() {
        let h = Harness::new().await;
        h.repo.upsert_pending("abc123").await.unwrap();

        let poller = h.poller();
        let started = Instant::now();
        let events: Vec<QueueEvent> = poller.into_stream().collect().await;

        assert!(started.elapsed() >= h.config.queue_budget);
        assert!(events.len() >= 2);
        match &events[0] {
            QueueEvent::Claimed(job) => assert_eq!(job.file_identifier, "abc123"),
            other => panic!("expected a claimed job first, got {other:?}"),
        }
        assert!(
            events[1..]
                .iter()
                .all(|e| matches!(e, QueueEvent::Ping { .. }))
        );
        assert_eq!(h.status("abc123").await.as_deref(), Some("claimed"));
    }

    #[tokio::test]
    async fn test_queue_lines_are_newline_delimited_json() {
        let h = Harness::new().await;
        h.repo.upsert_pending("abc123").await.unwrap();

        let mut stream = Box::pin(h.poller().into_stream());
        let first = stream.next().await.unwrap().to_line();
        let second = stream.next().await.unwrap().to_line();

        assert!(first.ends_with('\n'));
        let job: serde_json::Value = serde_json::from_str(first.trim_end()).unwrap();
        assert_eq!(job["file_identifier"], "abc123");
        assert_eq!(job["status"], "claimed");

        let ping: serde_json::Value = serde_json::from_str(second.trim_end()).unwrap();
        assert!(ping["ping"].as_i64().unwrap() > 0);
    }
}
