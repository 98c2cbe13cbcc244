//! Persisted download jobs.
//!
//! One row per chapter in `download_jobs`. The row is reused when a chapter
//! is downloaded again, so the table never holds two jobs for one chapter.

use std::time::Duration;

use async_trait::async_trait;
use core_library::{BookId, ChapterId};
use core_runtime::events::ErrorKind;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::{SchedulerError, SchedulerResult};

/// Download job state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    /// Waiting for a worker
    Queued,
    /// A worker is fetching the content
    Running,
    /// Content saved
    Succeeded,
    /// Last attempt failed; see `retry_count`
    Failed,
    /// Stopped by a caller
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Queued or running. At most one active job exists per chapter.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }
}

impl std::str::FromStr for JobState {
    type Err = SchedulerError;

    fn from_str(s: &str) -> SchedulerResult<Self> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(SchedulerError::InvalidState(format!(
                "unknown job state '{}'",
                s
            ))),
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadJob {
    pub id: String,
    pub book_id: BookId,
    pub chapter_id: ChapterId,
    pub state: JobState,
    /// Failed attempts. Cancellation does not count.
    pub retry_count: u32,
    pub last_error_kind: Option<ErrorKind>,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl DownloadJob {
    pub fn new(book_id: BookId, chapter_id: ChapterId, now: i64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            book_id,
            chapter_id,
            state: JobState::Queued,
            retry_count: 0,
            last_error_kind: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Failed often enough that no further attempt will be made
    pub fn is_exhausted(&self, retry_cap: u32) -> bool {
        self.state == JobState::Failed && self.retry_count >= retry_cap
    }

    /// Backoff before the next automatic attempt: `base * 2^(retry_count - 1)`
    pub fn next_retry_delay(&self, base: Duration) -> Duration {
        let exponent = self.retry_count.saturating_sub(1).min(16);
        base.saturating_mul(1u32 << exponent)
    }

    pub(crate) fn requeue(&mut self, now: i64) {
        self.state = JobState::Queued;
        self.updated_at = now;
    }

    /// Start over with a fresh retry budget
    pub(crate) fn restart(&mut self, now: i64) {
        self.retry_count = 0;
        self.last_error_kind = None;
        self.last_error = None;
        self.requeue(now);
    }

    pub(crate) fn start(&mut self, now: i64) {
        self.state = JobState::Running;
        self.updated_at = now;
    }

    pub(crate) fn succeed(&mut self, now: i64) {
        self.state = JobState::Succeeded;
        self.last_error_kind = None;
        self.last_error = None;
        self.updated_at = now;
    }

    pub(crate) fn fail(&mut self, kind: ErrorKind, message: String, now: i64) {
        self.state = JobState::Failed;
        self.retry_count += 1;
        self.last_error_kind = Some(kind);
        self.last_error = Some(message);
        self.updated_at = now;
    }

    pub(crate) fn cancel(&mut self, now: i64) {
        self.state = JobState::Cancelled;
        self.updated_at = now;
    }
}

/// Repository trait for persisting download jobs
#[async_trait]
pub trait DownloadJobRepository: Send + Sync {
    async fn insert(&self, job: &DownloadJob) -> SchedulerResult<()>;

    /// Write state, counters and errors of an existing row
    async fn update(&self, job: &DownloadJob) -> SchedulerResult<()>;

    async fn find_by_chapter(&self, chapter_id: ChapterId) -> SchedulerResult<Option<DownloadJob>>;

    /// All jobs, oldest first
    async fn list(&self) -> SchedulerResult<Vec<DownloadJob>>;

    /// Queued and running jobs, oldest first
    async fn list_active(&self) -> SchedulerResult<Vec<DownloadJob>>;

    /// Remove succeeded rows, returning how many went
    async fn delete_succeeded(&self) -> SchedulerResult<u64>;
}

/// SQLite implementation of download job repository
#[derive(Clone)]
pub struct SqliteDownloadJobRepository {
    pool: SqlitePool,
}

impl SqliteDownloadJobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

const SELECT_JOB: &str = r#"
    SELECT id, book_id, chapter_id, state, retry_count, last_error_kind,
           last_error, created_at, updated_at
    FROM download_jobs
"#;

fn job_from_row(row: &SqliteRow) -> SchedulerResult<DownloadJob> {
    let last_error_kind = row
        .try_get::<Option<String>, _>("last_error_kind")?
        .map(|kind| ErrorKind::parse(&kind));

    Ok(DownloadJob {
        id: row.try_get("id")?,
        book_id: BookId(row.try_get("book_id")?),
        chapter_id: ChapterId(row.try_get("chapter_id")?),
        state: row.try_get::<String, _>("state")?.parse()?,
        retry_count: row.try_get::<i64, _>("retry_count")? as u32,
        last_error_kind,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl DownloadJobRepository for SqliteDownloadJobRepository {
    async fn insert(&self, job: &DownloadJob) -> SchedulerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO download_jobs (
                id, book_id, chapter_id, state, retry_count, last_error_kind,
                last_error, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(job.book_id)
        .bind(job.chapter_id)
        .bind(job.state.as_str())
        .bind(i64::from(job.retry_count))
        .bind(job.last_error_kind.map(|kind| kind.as_str()))
        .bind(&job.last_error)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update(&self, job: &DownloadJob) -> SchedulerResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE download_jobs SET
                state = ?,
                retry_count = ?,
                last_error_kind = ?,
                last_error = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(job.state.as_str())
        .bind(i64::from(job.retry_count))
        .bind(job.last_error_kind.map(|kind| kind.as_str()))
        .bind(&job.last_error)
        .bind(job.updated_at)
        .bind(&job.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SchedulerError::JobNotFound(job.chapter_id));
        }
        Ok(())
    }

    async fn find_by_chapter(&self, chapter_id: ChapterId) -> SchedulerResult<Option<DownloadJob>> {
        let row = sqlx::query(&format!("{} WHERE chapter_id = ?", SELECT_JOB))
            .bind(chapter_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn list(&self) -> SchedulerResult<Vec<DownloadJob>> {
        let rows = sqlx::query(&format!("{} ORDER BY created_at ASC, rowid ASC", SELECT_JOB))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(job_from_row).collect()
    }

    async fn list_active(&self) -> SchedulerResult<Vec<DownloadJob>> {
        let rows = sqlx::query(&format!(
            "{} WHERE state IN ('queued', 'running') ORDER BY created_at ASC, rowid ASC",
            SELECT_JOB
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(job_from_row).collect()
    }

    async fn delete_succeeded(&self) -> SchedulerResult<u64> {
        let result = sqlx::query("DELETE FROM download_jobs WHERE state = 'succeeded'")
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_library::db::create_test_pool;

    async fn setup() -> (SqliteDownloadJobRepository, BookId, ChapterId, ChapterId) {
        let pool = create_test_pool().await.unwrap();
        let book_id: i64 = sqlx::query_scalar(
            "INSERT INTO books (source_id, remote_key, title, title_key) VALUES ('s', 'k', 'T', 't') RETURNING id",
        )
        .fetch_one(&pool)
        .await
        .unwrap();

        let mut chapters = Vec::new();
        for (position, key) in ["title:a", "title:b"].iter().enumerate() {
            let id: i64 = sqlx::query_scalar(
                "INSERT INTO chapters (book_id, match_key, title, position, content_key, fetched_at) VALUES (?, ?, 'c', ?, '/c', 0) RETURNING id",
            )
            .bind(book_id)
            .bind(key)
            .bind(position as i64)
            .fetch_one(&pool)
            .await
            .unwrap();
            chapters.push(ChapterId(id));
        }

        (
            SqliteDownloadJobRepository::new(pool),
            BookId(book_id),
            chapters[0],
            chapters[1],
        )
    }

    #[test]
    fn test_state_round_trip() {
        for state in [
            JobState::Queued,
            JobState::Running,
            JobState::Succeeded,
            JobState::Failed,
            JobState::Cancelled,
        ] {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        assert!("paused".parse::<JobState>().is_err());
        assert!(JobState::Running.is_active());
        assert!(!JobState::Failed.is_active());
    }

    #[test]
    fn test_retry_delay_doubles() {
        let mut job = DownloadJob::new(BookId(1), ChapterId(1), 0);
        let base = Duration::from_millis(100);

        job.retry_count = 1;
        assert_eq!(job.next_retry_delay(base), Duration::from_millis(100));
        job.retry_count = 3;
        assert_eq!(job.next_retry_delay(base), Duration::from_millis(400));
    }

    #[test]
    fn test_fail_counts_and_cancel_does_not() {
        let mut job = DownloadJob::new(BookId(1), ChapterId(1), 0);
        job.fail(ErrorKind::Network, "boom".to_string(), 1);
        job.cancel(2);
        assert_eq!(job.retry_count, 1);
        assert_eq!(job.state, JobState::Cancelled);

        job.fail(ErrorKind::Network, "boom".to_string(), 3);
        assert!(job.is_exhausted(2));

        job.restart(4);
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.state, JobState::Queued);
        assert!(job.last_error.is_none());
    }

    #[tokio::test]
    async fn test_insert_update_and_find() {
        let (repo, book_id, chapter_id, _) = setup().await;

        let mut job = DownloadJob::new(book_id, chapter_id, 10);
        repo.insert(&job).await.unwrap();

        job.start(11);
        job.fail(ErrorKind::RateLimited, "slow down".to_string(), 12);
        repo.update(&job).await.unwrap();

        let found = repo.find_by_chapter(chapter_id).await.unwrap().unwrap();
        assert_eq!(found, job);
        assert_eq!(found.last_error_kind, Some(ErrorKind::RateLimited));
    }

    #[tokio::test]
    async fn test_one_row_per_chapter() {
        let (repo, book_id, chapter_id, _) = setup().await;

        repo.insert(&DownloadJob::new(book_id, chapter_id, 1))
            .await
            .unwrap();
        let duplicate = repo.insert(&DownloadJob::new(book_id, chapter_id, 2)).await;
        assert!(matches!(duplicate, Err(SchedulerError::Database(_))));
    }

    #[tokio::test]
    async fn test_list_active_and_cleanup() {
        let (repo, book_id, first, second) = setup().await;

        let mut done = DownloadJob::new(book_id, first, 1);
        repo.insert(&done).await.unwrap();
        done.succeed(2);
        repo.update(&done).await.unwrap();

        let queued = DownloadJob::new(book_id, second, 3);
        repo.insert(&queued).await.unwrap();

        let active = repo.list_active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].chapter_id, second);
        assert_eq!(repo.list().await.unwrap().len(), 2);

        assert_eq!(repo.delete_succeeded().await.unwrap(), 1);
        assert_eq!(repo.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_missing_row() {
        let (repo, book_id, chapter_id, _) = setup().await;
        let job = DownloadJob::new(book_id, chapter_id, 1);
        assert!(matches!(
            repo.update(&job).await,
            Err(SchedulerError::JobNotFound(_))
        ));
    }
}
