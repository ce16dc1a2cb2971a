//! Share job repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::begin_immediate;
use crate::database::models::{JobStatus, ShareJobDbModel};
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::now_ms;
use crate::{Error, Result};

/// Share job repository trait.
#[async_trait]
pub trait ShareJobRepository: Send + Sync {
    /// Insert the row as `pending`, or reset an existing row to `pending` and
    /// clear its filename.
    async fn upsert_pending(&self, file_identifier: &str) -> Result<ShareJobDbModel>;
    async fn get_job(&self, file_identifier: &str) -> Result<Option<ShareJobDbModel>>;
    /// Oldest `pending` row by `last_modified`, ties broken by identifier.
    async fn find_oldest_pending(&self) -> Result<Option<ShareJobDbModel>>;
    /// Atomically move the oldest `pending` row to `claimed` and return it.
    async fn claim_oldest_pending(&self) -> Result<Option<ShareJobDbModel>>;
    /// Conditional status update.
    ///
    /// With `from` set only a row in that status is updated; without it any
    /// status that may legally precede `to` qualifies. Returns whether a row
    /// was updated.
    async fn transition(
        &self,
        file_identifier: &str,
        from: Option<JobStatus>,
        to: JobStatus,
        filename: Option<&str>,
    ) -> Result<bool>;
    /// Mark a live job `upload_failed`; terminal rows are left alone.
    async fn mark_upload_failed(&self, file_identifier: &str) -> Result<bool> {
        self.transition(file_identifier, None, JobStatus::UploadFailed, None)
            .await
    }
    /// All jobs, most recently modified first.
    async fn list_jobs(&self) -> Result<Vec<ShareJobDbModel>>;
}

/// SQLx implementation of ShareJobRepository.
pub struct SqlxShareJobRepository {
    pool: SqlitePool,
}

impl SqlxShareJobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

/// Statuses a row may be in for `to` to be applied.
fn eligible_predecessors(from: Option<JobStatus>, to: JobStatus) -> Result<Vec<JobStatus>> {
    match from {
        Some(from) if from.can_transition_to(to) => Ok(vec![from]),
        Some(from) => Err(Error::InvalidStateTransition {
            from: from.to_string(),
            to: to.to_string(),
        }),
        None => {
            let candidates: Vec<JobStatus> = JobStatus::non_terminal()
                .into_iter()
                .filter(|s| s.can_transition_to(to))
                .collect();
            if candidates.is_empty() {
                return Err(Error::InvalidStateTransition {
                    from: "any".to_string(),
                    to: to.to_string(),
                });
            }
            Ok(candidates)
        }
    }
}

#[async_trait]
impl ShareJobRepository for SqlxShareJobRepository {
    async fn upsert_pending(&self, file_identifier: &str) -> Result<ShareJobDbModel> {
        retry_on_sqlite_busy("share_job.upsert_pending", || async {
            let job = sqlx::query_as::<_, ShareJobDbModel>(
                r#"
                INSERT INTO upload_requests (file_identifier, filename, last_modified, status)
                VALUES (?, NULL, ?, 'pending')
                ON CONFLICT(file_identifier) DO UPDATE SET
                    filename = NULL,
                    last_modified = excluded.last_modified,
                    status = 'pending'
                RETURNING file_identifier, filename, last_modified, status
                "#,
            )
            .bind(file_identifier)
            .bind(now_ms())
            .fetch_one(&self.pool)
            .await?;
            Ok(job)
        })
        .await
    }

    async fn get_job(&self, file_identifier: &str) -> Result<Option<ShareJobDbModel>> {
        let job = sqlx::query_as::<_, ShareJobDbModel>(
            "SELECT file_identifier, filename, last_modified, status FROM upload_requests WHERE file_identifier = ?",
        )
        .bind(file_identifier)
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    async fn find_oldest_pending(&self) -> Result<Option<ShareJobDbModel>> {
        let job = sqlx::query_as::<_, ShareJobDbModel>(
            r#"
            SELECT file_identifier, filename, last_modified, status FROM upload_requests
            WHERE status = 'pending'
            ORDER BY last_modified ASC, file_identifier ASC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    async fn claim_oldest_pending(&self) -> Result<Option<ShareJobDbModel>> {
        retry_on_sqlite_busy("share_job.claim_oldest_pending", || async {
            let mut tx = begin_immediate(&self.pool).await?;

            let candidate = sqlx::query_as::<_, ShareJobDbModel>(
                r#"
                SELECT file_identifier, filename, last_modified, status FROM upload_requests
                WHERE status = 'pending'
                ORDER BY last_modified ASC, file_identifier ASC
                LIMIT 1
                "#,
            )
            .fetch_optional(&mut *tx)
            .await?;

            let Some(candidate) = candidate else {
                tx.rollback().await?;
                return Ok(None);
            };

            let claimed = sqlx::query_as::<_, ShareJobDbModel>(
                r#"
                UPDATE upload_requests SET status = 'claimed', last_modified = ?
                WHERE file_identifier = ? AND status = 'pending'
                RETURNING file_identifier, filename, last_modified, status
                "#,
            )
            .bind(now_ms())
            .bind(&candidate.file_identifier)
            .fetch_optional(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(claimed)
        })
        .await
    }

    async fn transition(
        &self,
        file_identifier: &str,
        from: Option<JobStatus>,
        to: JobStatus,
        filename: Option<&str>,
    ) -> Result<bool> {
        match (to, filename) {
            (JobStatus::Uploaded, None) => {
                return Err(Error::validation(
                    "a job can only become uploaded together with its filename",
                ));
            }
            (status, Some(_)) if status != JobStatus::Uploaded => {
                return Err(Error::validation(format!(
                    "filename can only be recorded when the job becomes uploaded, not {}",
                    status
                )));
            }
            _ => {}
        }

        let predecessors = eligible_predecessors(from, to)?;
        let placeholders = vec!["?"; predecessors.len()].join(", ");
        let sql = format!(
            "UPDATE upload_requests SET status = ?, filename = COALESCE(?, filename), last_modified = ? \
             WHERE file_identifier = ? AND status IN ({})",
            placeholders
        );

        retry_on_sqlite_busy("share_job.transition", || async {
            let mut query = sqlx::query(&sql)
                .bind(to.as_str())
                .bind(filename)
                .bind(now_ms())
                .bind(file_identifier);
            for status in &predecessors {
                query = query.bind(status.as_str());
            }
            let result = query.execute(&self.pool).await?;
            Ok(result.rows_affected() == 1)
        })
        .await
    }

    async fn list_jobs(&self) -> Result<Vec<ShareJobDbModel>> {
        let jobs = sqlx::query_as::<_, ShareJobDbModel>(
            r#"
            SELECT file_identifier, filename, last_modified, status FROM upload_requests
            ORDER BY last_modified DESC, file_identifier ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }
}
