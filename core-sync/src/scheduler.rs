//! # Download Scheduler
//!
//! Fetches chapter content in the background with a bounded worker pool.
//!
//! ## Features
//!
//! - **Idempotent enqueue**: a chapter with a queued or running job gets that
//!   job back instead of a second one
//! - **FIFO workers**: `max_workers` tasks pull jobs in enqueue order,
//!   independent of refresh cycles
//! - **Retry cap**: failed attempts are counted; reaching the cap is terminal
//!   and reported as `RetryExhausted`
//! - **Cancellation**: cancelled jobs end as `Cancelled` and keep their retry
//!   count untouched
//! - **Persistence**: every transition is written to `download_jobs`, and
//!   [`DownloadScheduler::resume`] re-queues what a previous process left
//!   unfinished
//!
//! ## Usage
//!
//! ```rust,ignore
//! let scheduler = DownloadScheduler::new(config, store, registry, repository, event_bus, clock);
//! scheduler.start().await?;
//!
//! scheduler.enqueue_book(book_id).await?;
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use bridge_traits::source::{ContentPayload, FetchError, SourceId};
use bridge_traits::time::Clock;
use core_library::{BookId, Chapter, ChapterFilter, ChapterId, ChapterSort, LocalStore};
use core_runtime::config::DownloadSettings;
use core_runtime::events::{CoreEvent, DownloadEvent, ErrorKind, EventBus, FailureReason};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::download_job::{DownloadJob, DownloadJobRepository, JobState};
use crate::error::{SchedulerError, SchedulerResult};
use crate::registry::SourceRegistry;

/// Download scheduler configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub max_workers: usize,
    /// Failed attempts after which a job is not tried again
    pub retry_cap: u32,
    /// Re-queue failed jobs automatically with exponential backoff
    pub auto_retry: bool,
    pub retry_base_delay: Duration,
    pub fetch_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from(&DownloadSettings::default())
    }
}

impl From<&DownloadSettings> for SchedulerConfig {
    fn from(settings: &DownloadSettings) -> Self {
        Self {
            max_workers: settings.max_workers.max(1),
            retry_cap: settings.retry_cap.max(1),
            auto_retry: settings.auto_retry,
            retry_base_delay: settings.retry_base_delay,
            fetch_timeout: settings.fetch_timeout,
        }
    }
}

/// How one attempt ended short of success
#[derive(Debug)]
enum AttemptError {
    Cancelled,
    Failed { kind: ErrorKind, message: String },
}

impl From<FetchError> for AttemptError {
    fn from(err: FetchError) -> Self {
        AttemptError::Failed {
            kind: err.kind().into(),
            message: err.to_string(),
        }
    }
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<ChapterId>,
    jobs: HashMap<ChapterId, DownloadJob>,
    running: HashMap<ChapterId, CancellationToken>,
}

struct Inner {
    config: SchedulerConfig,
    store: Arc<dyn LocalStore>,
    registry: Arc<SourceRegistry>,
    repository: Arc<dyn DownloadJobRepository>,
    event_bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    state: Mutex<QueueState>,
    notify: Notify,
    shutdown: CancellationToken,
}

/// Background chapter downloads
pub struct DownloadScheduler {
    inner: Arc<Inner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl DownloadScheduler {
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn LocalStore>,
        registry: Arc<SourceRegistry>,
        repository: Arc<dyn DownloadJobRepository>,
        event_bus: Arc<EventBus>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                registry,
                repository,
                event_bus,
                clock,
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
                shutdown: CancellationToken::new(),
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Spawn the worker pool and re-queue jobs left over from a previous run.
    ///
    /// Calling it again while workers are running only resumes.
    #[instrument(skip(self))]
    pub async fn start(&self) -> SchedulerResult<u64> {
        self.ensure_running()?;

        let mut workers = self.workers.lock().await;
        if workers.is_empty() {
            for worker_id in 0..self.inner.config.max_workers {
                let inner = self.inner.clone();
                workers.push(tokio::spawn(async move {
                    inner.worker_loop(worker_id).await;
                }));
            }
            info!(workers = workers.len(), "Download workers started");
        }
        drop(workers);

        self.resume().await
    }

    /// Queue a chapter download.
    ///
    /// # Errors
    ///
    /// `ChapterNotFound` when the chapter has not been committed to the store.
    #[instrument(skip(self), fields(chapter_id = %chapter_id))]
    pub async fn enqueue_chapter(&self, chapter_id: ChapterId) -> SchedulerResult<DownloadJob> {
        self.ensure_running()?;

        let chapter = self
            .inner
            .store
            .get_chapter(chapter_id)
            .await?
            .ok_or(SchedulerError::ChapterNotFound(chapter_id))?;

        self.inner.enqueue(&chapter, true).await
    }

    /// Queue every chapter of a book that has no downloaded content yet.
    ///
    /// Chapters whose job reached the retry cap are left failed; only
    /// [`enqueue_chapter`](Self::enqueue_chapter) revives them.
    #[instrument(skip(self), fields(book_id = %book_id))]
    pub async fn enqueue_book(&self, book_id: BookId) -> SchedulerResult<Vec<DownloadJob>> {
        self.ensure_running()?;

        self.inner
            .store
            .get_book(book_id)
            .await?
            .ok_or(SchedulerError::BookNotFound(book_id))?;

        let chapters = self
            .inner
            .store
            .get_chapters(book_id, ChapterFilter::default(), ChapterSort::Ascending)
            .await?;

        let cap = self.inner.config.retry_cap;
        let mut jobs = Vec::new();
        for chapter in chapters.iter().filter(|c| !c.has_content()) {
            let job = self.inner.enqueue(chapter, false).await?;
            if !job.is_exhausted(cap) {
                jobs.push(job);
            }
        }

        info!(
            book_id = %book_id,
            queued = jobs.len(),
            skipped = chapters.len() - jobs.len(),
            "Book download queued"
        );
        Ok(jobs)
    }

    /// Queue a selection of chapters. Fails on the first unknown chapter;
    /// chapters before it stay queued.
    pub async fn enqueue_chapters(&self, ids: &[ChapterId]) -> SchedulerResult<Vec<DownloadJob>> {
        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            jobs.push(self.enqueue_chapter(*id).await?);
        }
        Ok(jobs)
    }

    /// Cancel a chapter's job.
    ///
    /// A queued job ends immediately; a running job ends once its worker
    /// observes the cancellation. Finished jobs are returned unchanged.
    #[instrument(skip(self), fields(chapter_id = %chapter_id))]
    pub async fn cancel(&self, chapter_id: ChapterId) -> SchedulerResult<DownloadJob> {
        let mut state = self.inner.state.lock().await;
        self.inner.cancel_locked(&mut state, chapter_id).await
    }

    /// Cancel every active job of a book, returning how many were cancelled.
    #[instrument(skip(self), fields(book_id = %book_id))]
    pub async fn cancel_book(&self, book_id: BookId) -> SchedulerResult<u64> {
        let mut state = self.inner.state.lock().await;

        let targets: Vec<ChapterId> = state
            .jobs
            .values()
            .filter(|job| job.book_id == book_id && job.state.is_active())
            .map(|job| job.chapter_id)
            .collect();

        for chapter_id in &targets {
            self.inner.cancel_locked(&mut state, *chapter_id).await?;
        }

        info!(book_id = %book_id, cancelled = targets.len(), "Book downloads cancelled");
        Ok(targets.len() as u64)
    }

    /// Re-queue a failed or cancelled job, keeping its retry count.
    ///
    /// # Errors
    ///
    /// `RetryExhausted` once the job has failed `retry_cap` times.
    #[instrument(skip(self), fields(chapter_id = %chapter_id))]
    pub async fn retry(&self, chapter_id: ChapterId) -> SchedulerResult<DownloadJob> {
        self.ensure_running()?;

        let mut state = self.inner.state.lock().await;
        let job = self.inner.load_job(&mut state, chapter_id).await?;

        match job.state {
            JobState::Queued | JobState::Running => return Ok(job),
            JobState::Succeeded => {
                return Err(SchedulerError::InvalidState(format!(
                    "download of chapter {} already succeeded",
                    chapter_id
                )))
            }
            JobState::Failed | JobState::Cancelled
                if job.retry_count >= self.inner.config.retry_cap =>
            {
                return Err(SchedulerError::RetryExhausted {
                    chapter_id,
                    retry_count: job.retry_count,
                })
            }
            JobState::Failed | JobState::Cancelled => {}
        }

        let now = self.inner.clock.unix_timestamp_millis();
        let job = self
            .inner
            .push_locked(&mut state, chapter_id, |job| job.requeue(now))
            .await?;
        drop(state);

        self.inner.notify.notify_one();
        Ok(job)
    }

    /// Current job of a chapter, from memory or the persisted table
    pub async fn job(&self, chapter_id: ChapterId) -> SchedulerResult<Option<DownloadJob>> {
        {
            let state = self.inner.state.lock().await;
            if let Some(job) = state.jobs.get(&chapter_id) {
                return Ok(Some(job.clone()));
            }
        }
        self.inner.repository.find_by_chapter(chapter_id).await
    }

    /// Every persisted job, oldest first
    pub async fn jobs(&self) -> SchedulerResult<Vec<DownloadJob>> {
        self.inner.repository.list().await
    }

    /// Queued job count, running jobs excluded
    pub async fn queued(&self) -> usize {
        self.inner.state.lock().await.queue.len()
    }

    /// Re-queue jobs persisted as queued or running, returning how many.
    #[instrument(skip(self))]
    pub async fn resume(&self) -> SchedulerResult<u64> {
        self.ensure_running()?;

        let persisted = self.inner.repository.list_active().await?;
        let now = self.inner.clock.unix_timestamp_millis();
        let mut resumed = 0u64;

        let mut state = self.inner.state.lock().await;
        for mut job in persisted {
            let chapter_id = job.chapter_id;
            let in_memory = state
                .jobs
                .get(&chapter_id)
                .is_some_and(|current| current.state.is_active());
            if in_memory {
                continue;
            }

            job.requeue(now);
            self.inner.repository.update(&job).await?;
            state.jobs.insert(chapter_id, job);
            state.queue.push_back(chapter_id);
            resumed += 1;
        }
        drop(state);

        for _ in 0..resumed {
            self.inner.notify.notify_one();
        }
        if resumed > 0 {
            info!(resumed, "Resumed persisted downloads");
        }
        Ok(resumed)
    }

    /// Stop the workers.
    ///
    /// In-flight fetches are abandoned and their jobs stay persisted as
    /// running, so the next [`resume`](Self::resume) picks them up again.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.notify.notify_waiters();

        let workers: Vec<_> = self.workers.lock().await.drain(..).collect();
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "Download worker ended abnormally");
            }
        }
        info!("Download scheduler shut down");
    }

    fn ensure_running(&self) -> SchedulerResult<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(SchedulerError::ShutDown);
        }
        Ok(())
    }
}

impl Inner {
    // ========================================================================
    // Queue bookkeeping
    // ========================================================================

    /// Queue `chapter`. An existing job at the retry cap only restarts when
    /// `revive_exhausted` is set.
    async fn enqueue(
        &self,
        chapter: &Chapter,
        revive_exhausted: bool,
    ) -> SchedulerResult<DownloadJob> {
        let chapter_id = chapter.id;
        let now = self.clock.unix_timestamp_millis();

        let mut state = self.state.lock().await;

        let job = match self.find_job(&mut state, chapter_id).await? {
            Some(job) if job.state.is_active() => {
                debug!(job_id = %job.id, state = %job.state, "Download already active");
                return Ok(job);
            }
            Some(job) if !revive_exhausted && job.is_exhausted(self.config.retry_cap) => {
                debug!(job_id = %job.id, "Download failed terminally, not revived");
                return Ok(job);
            }
            Some(_) => {
                self.push_locked(&mut state, chapter_id, |job| job.restart(now))
                    .await?
            }
            None => {
                let job = DownloadJob::new(chapter.book_id, chapter_id, now);
                self.repository.insert(&job).await?;
                state.jobs.insert(chapter_id, job.clone());
                state.queue.push_back(chapter_id);
                self.emit_queued(&job);
                job
            }
        };
        drop(state);

        self.notify.notify_one();
        Ok(job)
    }

    /// Job from memory, falling back to the persisted row.
    ///
    /// A persisted row still queued or running belongs to no worker of this
    /// process; it is put back on the queue as it is loaded.
    async fn find_job(
        &self,
        state: &mut QueueState,
        chapter_id: ChapterId,
    ) -> SchedulerResult<Option<DownloadJob>> {
        if let Some(job) = state.jobs.get(&chapter_id) {
            return Ok(Some(job.clone()));
        }
        let Some(mut job) = self.repository.find_by_chapter(chapter_id).await? else {
            return Ok(None);
        };

        if job.state.is_active() && !state.running.contains_key(&chapter_id) {
            job.requeue(self.clock.unix_timestamp_millis());
            self.repository.update(&job).await?;
            state.queue.push_back(chapter_id);
            self.notify.notify_one();
            debug!(job_id = %job.id, "Adopted persisted download");
        }
        state.jobs.insert(chapter_id, job.clone());
        Ok(Some(job))
    }

    async fn load_job(
        &self,
        state: &mut QueueState,
        chapter_id: ChapterId,
    ) -> SchedulerResult<DownloadJob> {
        self.find_job(state, chapter_id)
            .await?
            .ok_or(SchedulerError::JobNotFound(chapter_id))
    }

    /// Apply `transition` to a known job, persist it and put it at the back
    /// of the queue.
    async fn push_locked(
        &self,
        state: &mut QueueState,
        chapter_id: ChapterId,
        transition: impl FnOnce(&mut DownloadJob),
    ) -> SchedulerResult<DownloadJob> {
        let job = state
            .jobs
            .get_mut(&chapter_id)
            .ok_or(SchedulerError::JobNotFound(chapter_id))?;
        transition(job);
        let job = job.clone();

        self.repository.update(&job).await?;
        state.queue.push_back(chapter_id);
        self.emit_queued(&job);
        Ok(job)
    }

    async fn cancel_locked(
        &self,
        state: &mut QueueState,
        chapter_id: ChapterId,
    ) -> SchedulerResult<DownloadJob> {
        let job = self.load_job(state, chapter_id).await?;

        match job.state {
            JobState::Failed if job.is_exhausted(self.config.retry_cap) => Ok(job),
            JobState::Running => {
                if let Some(token) = state.running.get(&chapter_id) {
                    info!(job_id = %job.id, "Cancelling running download");
                    token.cancel();
                }
                Ok(job)
            }
            // A failed job may be waiting for its automatic retry
            JobState::Queued | JobState::Failed => {
                state.queue.retain(|id| *id != chapter_id);
                let now = self.clock.unix_timestamp_millis();
                let Some(entry) = state.jobs.get_mut(&chapter_id) else {
                    return Err(SchedulerError::JobNotFound(chapter_id));
                };
                entry.cancel(now);
                let job = entry.clone();

                self.repository.update(&job).await?;
                info!(job_id = %job.id, "Download cancelled");
                self.emit_failed(&job, FailureReason::Cancelled);
                Ok(job)
            }
            JobState::Succeeded | JobState::Cancelled => Ok(job),
        }
    }

    // ========================================================================
    // Workers
    // ========================================================================

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        debug!(worker_id, "Download worker started");
        loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => None,
                next = self.next_job() => Some(next),
            };
            let Some((job, token)) = next else {
                break;
            };
            self.run_job(job, token).await;
        }
        debug!(worker_id, "Download worker stopped");
    }

    /// Wait for the next queued job and mark it running
    async fn next_job(&self) -> (DownloadJob, CancellationToken) {
        loop {
            {
                let mut state = self.state.lock().await;
                while let Some(chapter_id) = state.queue.pop_front() {
                    let now = self.clock.unix_timestamp_millis();
                    let Some(job) = state.jobs.get_mut(&chapter_id) else {
                        continue;
                    };
                    if job.state != JobState::Queued {
                        continue;
                    }
                    job.start(now);
                    let job = job.clone();

                    let token = CancellationToken::new();
                    state.running.insert(chapter_id, token.clone());

                    if let Err(e) = self.repository.update(&job).await {
                        error!(job_id = %job.id, error = %e, "Failed to persist job start");
                    }
                    return (job, token);
                }
            }
            self.notify.notified().await;
        }
    }

    #[instrument(skip_all, fields(job_id = %job.id, chapter_id = %job.chapter_id))]
    async fn run_job(self: &Arc<Self>, job: DownloadJob, token: CancellationToken) {
        info!(attempt = job.retry_count + 1, "Download started");
        self.emit(DownloadEvent::JobStarted {
            job_id: job.id.clone(),
            book_id: job.book_id.0,
            chapter_id: job.chapter_id.0,
            attempt: job.retry_count + 1,
        });

        let fetched = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => {
                debug!("Abandoning download on shutdown");
                self.state.lock().await.running.remove(&job.chapter_id);
                return;
            }
            _ = token.cancelled() => Err(AttemptError::Cancelled),
            result = self.fetch(&job) => result,
        };

        let result = match fetched {
            Ok(_) if token.is_cancelled() => Err(AttemptError::Cancelled),
            Ok(payload) => self
                .store
                .save_chapter_content(job.chapter_id, &payload)
                .await
                .map_err(|e| AttemptError::Failed {
                    kind: ErrorKind::TransactionAborted,
                    message: e.to_string(),
                }),
            Err(e) => Err(e),
        };

        self.complete(job.chapter_id, result).await;
    }

    async fn fetch(&self, job: &DownloadJob) -> Result<ContentPayload, AttemptError> {
        let chapter = self
            .store
            .get_chapter(job.chapter_id)
            .await
            .map_err(library_failure)?
            .ok_or_else(|| {
                AttemptError::from(FetchError::NotFound(format!("chapter {}", job.chapter_id)))
            })?;
        let book = self
            .store
            .get_book(chapter.book_id)
            .await
            .map_err(library_failure)?
            .ok_or_else(|| {
                AttemptError::from(FetchError::NotFound(format!("book {}", chapter.book_id)))
            })?;

        let source_id = SourceId::new(book.source_id);
        let adapter = self
            .registry
            .get(&source_id)
            .await
            .ok_or_else(|| AttemptError::Failed {
                kind: ErrorKind::Unknown,
                message: format!("no adapter registered for source {}", source_id),
            })?;

        let payload = match tokio::time::timeout(
            self.config.fetch_timeout,
            adapter.fetch_content(&chapter.content_key),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(FetchError::timed_out(self.config.fetch_timeout).into()),
        };

        if payload.is_blank() {
            return Err(FetchError::ParseFailure("content has no text".to_string()).into());
        }
        Ok(payload)
    }

    async fn complete(self: &Arc<Self>, chapter_id: ChapterId, result: Result<(), AttemptError>) {
        let now = self.clock.unix_timestamp_millis();
        let cap = self.config.retry_cap;

        let mut state = self.state.lock().await;
        state.running.remove(&chapter_id);
        let Some(job) = state.jobs.get_mut(&chapter_id) else {
            return;
        };

        let reason = match result {
            Ok(()) => {
                job.succeed(now);
                None
            }
            Err(AttemptError::Cancelled) => {
                job.cancel(now);
                Some(FailureReason::Cancelled)
            }
            Err(AttemptError::Failed { kind, message }) => {
                job.fail(kind, message.clone(), now);
                if job.is_exhausted(cap) {
                    Some(FailureReason::RetryExhausted { kind, message })
                } else {
                    Some(FailureReason::Error { kind, message })
                }
            }
        };
        let job = job.clone();

        if let Err(e) = self.repository.update(&job).await {
            error!(job_id = %job.id, error = %e, "Failed to persist job outcome");
        }
        drop(state);

        let Some(reason) = reason else {
            info!(job_id = %job.id, "Download succeeded");
            self.emit(DownloadEvent::JobSucceeded {
                job_id: job.id.clone(),
                book_id: job.book_id.0,
                chapter_id: job.chapter_id.0,
            });
            return;
        };

        match &reason {
            FailureReason::Cancelled => info!(job_id = %job.id, "Download cancelled"),
            FailureReason::RetryExhausted { kind, message } => error!(
                job_id = %job.id,
                kind = %kind,
                retry_count = job.retry_count,
                error = %message,
                "Download failed, retry cap reached"
            ),
            FailureReason::Error { kind, message } => warn!(
                job_id = %job.id,
                kind = %kind,
                retry_count = job.retry_count,
                error = %message,
                "Download failed"
            ),
        }

        let retry = matches!(reason, FailureReason::Error { .. }) && self.config.auto_retry;
        self.emit_failed(&job, reason);

        if retry {
            self.schedule_retry(&job);
        }
    }

    /// Re-queue a failed job after its backoff unless something else touched
    /// it in the meantime.
    fn schedule_retry(self: &Arc<Self>, job: &DownloadJob) {
        let delay = job.next_retry_delay(self.config.retry_base_delay);
        let chapter_id = job.chapter_id;
        let attempt = job.retry_count;
        let inner = self.clone();

        debug!(job_id = %job.id, delay_ms = delay.as_millis() as u64, "Scheduling retry");

        tokio::spawn(async move {
            tokio::select! {
                _ = inner.shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let mut state = inner.state.lock().await;
                    let still_failed = state.jobs.get(&chapter_id).is_some_and(|job| {
                        job.state == JobState::Failed && job.retry_count == attempt
                    });
                    if !still_failed {
                        return;
                    }

                    let now = inner.clock.unix_timestamp_millis();
                    let pushed = inner
                        .push_locked(&mut state, chapter_id, |job| job.requeue(now))
                        .await;
                    drop(state);

                    match pushed {
                        Ok(_) => inner.notify.notify_one(),
                        Err(e) => {
                            error!(chapter_id = %chapter_id, error = %e, "Automatic retry failed")
                        }
                    }
                }
            }
        });
    }

    // ========================================================================
    // Events
    // ========================================================================

    fn emit(&self, event: DownloadEvent) {
        self.event_bus.emit(CoreEvent::Download(event)).ok();
    }

    fn emit_queued(&self, job: &DownloadJob) {
        debug!(job_id = %job.id, chapter_id = %job.chapter_id, "Download queued");
        self.emit(DownloadEvent::JobQueued {
            job_id: job.id.clone(),
            book_id: job.book_id.0,
            chapter_id: job.chapter_id.0,
        });
    }

    fn emit_failed(&self, job: &DownloadJob, reason: FailureReason) {
        self.emit(DownloadEvent::JobFailed {
            job_id: job.id.clone(),
            book_id: job.book_id.0,
            chapter_id: job.chapter_id.0,
            reason,
            retry_count: job.retry_count,
        });
    }
}

fn library_failure(err: core_library::LibraryError) -> AttemptError {
    AttemptError::Failed {
        kind: ErrorKind::Unknown,
        message: err.to_string(),
    }
}
