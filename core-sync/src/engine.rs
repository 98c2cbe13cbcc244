//! # Sync Engine
//!
//! Runs refresh cycles: fetch detail, merge it, fetch the chapter list, merge
//! it together with the detail.
//!
//! ## Concurrency
//!
//! - At most one cycle per book. A trigger while a cycle runs either returns
//!   the running cycle's handle (`RefreshTrigger::IfIdle`) or cancels it and
//!   starts over (`RefreshTrigger::Force`).
//! - Merges for one book are serialized through a per-book lock; unrelated
//!   books sync in parallel.
//! - Cancelling drops the outstanding adapter call. Merge steps that already
//!   committed stay committed.
//!
//! ## Failure
//!
//! Adapter and store failures never escape a cycle: they end it and are
//! published as `SyncEvent::Failed` with the error kind. `last_fetch` only
//! moves on a fully successful cycle.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let engine = SyncEngine::new(SyncConfig::default(), store, registry, event_bus);
//!
//! let handle = engine.refresh_book(book_id, RefreshOptions::default()).await?;
//! match handle.wait().await {
//!     CycleOutcome::Succeeded(summary) => println!("{} new", summary.chapters.added),
//!     CycleOutcome::Failed { kind, .. } => println!("failed: {}", kind),
//!     CycleOutcome::Cancelled => {}
//! }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bridge_traits::source::{
    CanonicalBook, CanonicalChapter, FetchError, FetchResult, RawPage, SourceAdapter, SourceId,
};
use core_library::{Book, BookId, ChapterFilter, ChapterSort, LocalStore};
use core_runtime::config::SyncSettings;
use core_runtime::events::{CoreEvent, EventBus, SyncEvent};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::cycle::{CycleHandle, CycleOutcome, CyclePhase, CycleSummary, CycleTracker};
use crate::dedup::{Deduplicator, DuplicatePolicy};
use crate::error::{MergeError, Result, SyncError};
use crate::merge::{ChapterMergeStats, MergePolicy, ResyncMode};
use crate::registry::SourceRegistry;

/// Sync engine configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Budget for one adapter call; exceeding it fails the cycle as a network error
    pub adapter_timeout: Duration,

    /// Trigger used by [`SyncEngine::refresh`]
    pub default_trigger: RefreshTrigger,

    /// Survivor among fetched chapters sharing a matching key
    pub duplicate_policy: DuplicatePolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            adapter_timeout: Duration::from_secs(30),
            default_trigger: RefreshTrigger::IfIdle,
            duplicate_policy: DuplicatePolicy::default(),
        }
    }
}

impl From<&SyncSettings> for SyncConfig {
    fn from(settings: &SyncSettings) -> Self {
        Self {
            adapter_timeout: settings.adapter_timeout,
            default_trigger: if settings.force_refresh_by_default {
                RefreshTrigger::Force
            } else {
                RefreshTrigger::IfIdle
            },
            duplicate_policy: DuplicatePolicy::default(),
        }
    }
}

/// What a trigger does while a cycle for the same book is running
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RefreshTrigger {
    /// Return the running cycle's handle
    #[default]
    IfIdle,
    /// Cancel the running cycle and start a new one
    Force,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshOptions {
    pub trigger: RefreshTrigger,
    pub resync: ResyncMode,
}

impl RefreshOptions {
    pub fn force() -> Self {
        Self {
            trigger: RefreshTrigger::Force,
            ..Default::default()
        }
    }

    pub fn destructive(mut self) -> Self {
        self.resync = ResyncMode::Destructive;
        self
    }
}

/// Active cycle tracking
struct ActiveCycle {
    cycle_id: String,
    token: CancellationToken,
    handle: CycleHandle,
}

/// Per-book refresh orchestration
#[derive(Clone)]
pub struct SyncEngine {
    config: SyncConfig,
    store: Arc<dyn LocalStore>,
    registry: Arc<SourceRegistry>,
    event_bus: Arc<EventBus>,
    policy: Arc<MergePolicy>,

    /// Running cycles by book
    active: Arc<Mutex<HashMap<BookId, ActiveCycle>>>,

    /// Merge serialization, one lock per book
    merge_locks: Arc<Mutex<HashMap<BookId, Arc<Mutex<()>>>>>,
}

impl SyncEngine {
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn LocalStore>,
        registry: Arc<SourceRegistry>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        let policy = MergePolicy::new(Deduplicator::new(config.duplicate_policy));
        Self {
            config,
            store,
            registry,
            event_bus,
            policy: Arc::new(policy),
            active: Arc::new(Mutex::new(HashMap::new())),
            merge_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Refresh with the configured default trigger and a non-destructive resync
    pub async fn refresh(&self, book_id: BookId) -> Result<CycleHandle> {
        let options = RefreshOptions {
            trigger: self.config.default_trigger,
            resync: ResyncMode::Preserve,
        };
        self.refresh_book(book_id, options).await
    }

    /// Start a refresh cycle for a book.
    ///
    /// # Errors
    ///
    /// Fails before any cycle starts when the book is unknown or its source
    /// has no registered adapter. Every later failure is reported through the
    /// handle and the event bus instead.
    #[instrument(skip(self), fields(book_id = %book_id))]
    pub async fn refresh_book(
        &self,
        book_id: BookId,
        options: RefreshOptions,
    ) -> Result<CycleHandle> {
        let book = self
            .store
            .get_book(book_id)
            .await?
            .ok_or(SyncError::BookNotFound(book_id))?;
        let adapter = self.adapter_for(&book).await?;

        let mut active = self.active.lock().await;

        if let Some(existing) = active.get(&book_id) {
            if !existing.handle.is_finished() {
                match options.trigger {
                    RefreshTrigger::IfIdle => {
                        debug!(cycle_id = %existing.cycle_id, "Cycle already running");
                        return Ok(existing.handle.clone());
                    }
                    RefreshTrigger::Force => {
                        info!(cycle_id = %existing.cycle_id, "Cancelling running cycle for forced refresh");
                        existing.token.cancel();
                    }
                }
            }
        }

        let cycle_id = Uuid::new_v4().to_string();
        let token = CancellationToken::new();
        let (tracker, handle) = CycleTracker::new(book_id, cycle_id.clone());

        active.insert(
            book_id,
            ActiveCycle {
                cycle_id: cycle_id.clone(),
                token: token.clone(),
                handle: handle.clone(),
            },
        );
        drop(active);

        self.emit(SyncEvent::Started {
            book_id: book_id.0,
            cycle_id: cycle_id.clone(),
        });
        info!(cycle_id = %cycle_id, remote_key = %book.remote_key, "Refresh cycle started");

        let engine = self.clone();
        tokio::spawn(async move {
            engine
                .run_cycle(book, adapter, options.resync, token, tracker)
                .await;
        });

        Ok(handle)
    }

    /// Merge a page captured outside the engine (for example rendered by the
    /// host) through the source's page parser.
    ///
    /// Detail and chapters found on the page are merged in one transaction.
    #[instrument(skip(self, page), fields(book_id = %book_id, url = %page.url))]
    pub async fn refresh_from_page(
        &self,
        book_id: BookId,
        page: RawPage,
        resync: ResyncMode,
    ) -> Result<CycleSummary> {
        let book = self
            .store
            .get_book(book_id)
            .await?
            .ok_or(SyncError::BookNotFound(book_id))?;
        let adapter = self.adapter_for(&book).await?;
        let source = adapter
            .page_source()
            .cloned()
            .ok_or_else(|| SyncError::Unsupported {
                source_id: adapter.source_id(),
                operation: "page parsing",
            })?;

        let cycle_id = Uuid::new_v4().to_string();
        self.emit(SyncEvent::Started {
            book_id: book_id.0,
            cycle_id: cycle_id.clone(),
        });
        self.emit_progress(book_id, &cycle_id, CyclePhase::Merging);

        let result = async {
            let snapshot = source.parse_page(&page)?;
            if snapshot.book.is_none() && snapshot.chapters.is_empty() {
                return Err(SyncError::Fetch(FetchError::ParseFailure(
                    "page yielded neither detail nor chapters".to_string(),
                )));
            }
            self.merge_chapters(book_id, snapshot.book.as_ref(), &snapshot.chapters, resync)
                .await
        }
        .await;

        match result {
            Ok(chapters) => {
                let summary = CycleSummary { book_id, chapters };
                self.emit_succeeded(&cycle_id, &summary);
                Ok(summary)
            }
            Err(e) => {
                let kind = e.kind();
                warn!(error = %e, kind = %kind, "Page merge failed");
                self.emit(SyncEvent::Failed {
                    book_id: book_id.0,
                    cycle_id,
                    kind,
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Cancel the running cycle of a book. Returns false when none is running.
    #[instrument(skip(self), fields(book_id = %book_id))]
    pub async fn cancel(&self, book_id: BookId) -> bool {
        let active = self.active.lock().await;
        match active.get(&book_id) {
            Some(cycle) if !cycle.handle.is_finished() => {
                info!(cycle_id = %cycle.cycle_id, "Cancelling refresh cycle");
                cycle.token.cancel();
                true
            }
            _ => false,
        }
    }

    /// Books with a running cycle
    pub async fn active_cycles(&self) -> Vec<BookId> {
        let active = self.active.lock().await;
        let mut ids: Vec<_> = active
            .iter()
            .filter(|(_, cycle)| !cycle.handle.is_finished())
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    pub async fn handle(&self, book_id: BookId) -> Option<CycleHandle> {
        let active = self.active.lock().await;
        active.get(&book_id).map(|cycle| cycle.handle.clone())
    }

    /// Phase of the running cycle, `None` when the book is idle
    pub async fn phase(&self, book_id: BookId) -> Option<CyclePhase> {
        self.handle(book_id)
            .await
            .map(|handle| handle.phase())
            .filter(|phase| *phase != CyclePhase::Finished)
    }

    /// Never refreshed, or refreshed without any chapter
    pub async fn is_stale(&self, book_id: BookId) -> Result<bool> {
        let book = self
            .store
            .get_book(book_id)
            .await?
            .ok_or(SyncError::BookNotFound(book_id))?;
        Ok(book.is_stale())
    }

    // ========================================================================
    // Cycle execution
    // ========================================================================

    async fn adapter_for(&self, book: &Book) -> Result<SourceAdapter> {
        let source_id = SourceId::new(book.source_id.clone());
        self.registry
            .get(&source_id)
            .await
            .ok_or(SyncError::SourceNotRegistered(source_id))
    }

    #[instrument(skip_all, fields(book_id = %book.id, cycle_id = %tracker.cycle_id()))]
    async fn run_cycle(
        &self,
        book: Book,
        adapter: SourceAdapter,
        resync: ResyncMode,
        token: CancellationToken,
        tracker: CycleTracker,
    ) {
        let book_id = book.id;

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => Err(SyncError::Cancelled),
            result = self.execute_cycle(&book, &adapter, resync, &tracker) => result,
        };

        let cycle_id = tracker.cycle_id().to_string();
        let outcome = match result {
            Ok(chapters) => {
                let summary = CycleSummary { book_id, chapters };
                self.emit_succeeded(&cycle_id, &summary);
                CycleOutcome::Succeeded(summary)
            }
            Err(SyncError::Cancelled) => {
                info!("Refresh cycle cancelled");
                self.emit(SyncEvent::Cancelled {
                    book_id: book_id.0,
                    cycle_id: cycle_id.clone(),
                });
                CycleOutcome::Cancelled
            }
            Err(e) => {
                let kind = e.kind();
                warn!(error = %e, kind = %kind, "Refresh cycle failed");
                self.emit(SyncEvent::Failed {
                    book_id: book_id.0,
                    cycle_id: cycle_id.clone(),
                    kind,
                    message: e.to_string(),
                });
                CycleOutcome::Failed {
                    kind,
                    message: e.to_string(),
                }
            }
        };

        // Leave the active table before publishing so a caller woken by the
        // outcome can start a fresh cycle immediately.
        {
            let mut active = self.active.lock().await;
            if active
                .get(&book_id)
                .is_some_and(|cycle| cycle.cycle_id == cycle_id)
            {
                active.remove(&book_id);
            }
        }
        tracker.finish(outcome);
    }

    async fn execute_cycle(
        &self,
        book: &Book,
        adapter: &SourceAdapter,
        resync: ResyncMode,
        tracker: &CycleTracker,
    ) -> Result<ChapterMergeStats> {
        let remote_key = book.remote_key.as_str();

        self.enter(book.id, tracker, CyclePhase::FetchingDetail);
        let detail = self.call(adapter.fetch_detail(remote_key)).await?;
        self.merge_detail(book.id, &detail).await?;

        self.enter(book.id, tracker, CyclePhase::FetchingChapters);
        let chapters = self.call(adapter.fetch_chapter_list(remote_key)).await?;

        self.enter(book.id, tracker, CyclePhase::Merging);
        self.merge_chapters(book.id, Some(&detail), &chapters, resync)
            .await
    }

    /// One adapter call under the configured time budget
    async fn call<T>(&self, call: impl Future<Output = FetchResult<T>>) -> Result<T> {
        match tokio::time::timeout(self.config.adapter_timeout, call).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(FetchError::timed_out(self.config.adapter_timeout).into()),
        }
    }

    async fn lock_book(&self, book_id: BookId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.merge_locks.lock().await;
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(book_id).or_default().clone()
        };
        lock.lock_owned().await
    }

    async fn load_book(&self, book_id: BookId) -> Result<Book> {
        self.store
            .get_book(book_id)
            .await?
            .ok_or(SyncError::BookNotFound(book_id))
    }

    async fn merge_detail(&self, book_id: BookId, detail: &CanonicalBook) -> Result<()> {
        let _guard = self.lock_book(book_id).await;

        let local = self.load_book(book_id).await?;
        let merged = MergePolicy::merge_book(&local, detail);
        self.store
            .merge_book_detail(&merged)
            .await
            .map_err(|source| MergeError::TransactionAborted { book_id, source })?;

        debug!(book_id = %book_id, "Detail merged");
        Ok(())
    }

    async fn merge_chapters(
        &self,
        book_id: BookId,
        detail: Option<&CanonicalBook>,
        chapters: &[CanonicalChapter],
        resync: ResyncMode,
    ) -> Result<ChapterMergeStats> {
        let _guard = self.lock_book(book_id).await;

        let local = self.load_book(book_id).await?;
        let mut merged = match detail {
            Some(detail) => MergePolicy::merge_book(&local, detail),
            None => local,
        };

        let stored = self
            .store
            .get_chapters(book_id, ChapterFilter::default(), ChapterSort::Ascending)
            .await?;
        let plan = self.policy.plan_chapters(&stored, chapters, resync);

        if detail.map_or(true, |d| !d.total_chapters.is_known()) {
            merged.total_chapters = plan.chapter_count;
        }

        self.store
            .merge_book_and_chapters(&merged, &plan.changes)
            .await
            .map_err(|source| MergeError::TransactionAborted { book_id, source })?;

        debug!(book_id = %book_id, stats = ?plan.stats, "Chapters merged");
        Ok(plan.stats)
    }

    // ========================================================================
    // Events
    // ========================================================================

    fn emit(&self, event: SyncEvent) {
        self.event_bus.emit(CoreEvent::Sync(event)).ok();
    }

    fn enter(&self, book_id: BookId, tracker: &CycleTracker, phase: CyclePhase) {
        tracker.enter(phase);
        self.emit_progress(book_id, tracker.cycle_id(), phase);
    }

    fn emit_progress(&self, book_id: BookId, cycle_id: &str, phase: CyclePhase) {
        if let Some(phase) = phase.sync_phase() {
            debug!(book_id = %book_id, phase = phase.as_str(), "Cycle phase");
            self.emit(SyncEvent::Progress {
                book_id: book_id.0,
                cycle_id: cycle_id.to_string(),
                phase,
            });
        }
    }

    fn emit_succeeded(&self, cycle_id: &str, summary: &CycleSummary) {
        info!(
            book_id = %summary.book_id,
            added = summary.chapters.added,
            updated = summary.chapters.updated,
            retained = summary.chapters.retained,
            removed = summary.chapters.removed,
            "Refresh cycle succeeded"
        );
        self.emit(SyncEvent::Succeeded {
            book_id: summary.book_id.0,
            cycle_id: cycle_id.to_string(),
            chapters_added: summary.chapters.added,
            chapters_updated: summary.chapters.updated,
            chapters_retained: summary.chapters.retained,
            chapters_removed: summary.chapters.removed,
        });
    }
}
