//! The [`CoreService`] façade.

use std::sync::{Arc, Mutex};

use bridge_traits::source::{BookSummary, RawPage, SearchPage, SourceAdapter, SourceId};
use bridge_traits::{CatalogSource, Clock, HttpClient, PageSource};
use core_library::db::{create_pool, DatabaseConfig};
use core_library::{
    Book, BookId, Chapter, ChapterFilter, ChapterId, ChapterSort, History, LocalStore, NewBook,
    SqliteLocalStore, StoreChange,
};
use core_runtime::config::CoreConfig;
use core_runtime::events::{CoreEvent, EventBus, EventStream, LibraryEvent};
use core_sync::{
    CycleHandle, CycleSummary, DownloadJob, DownloadScheduler, RefreshOptions, ResyncMode,
    SchedulerConfig, SchedulerError, SourceRegistry, SqliteDownloadJobRepository, SyncConfig,
    SyncEngine,
};
use futures::stream::BoxStream;
use provider_catalog::{
    CatalogClient, HtmlPageSource, HtmlSourceConfig, JsonCatalogConfig, JsonCatalogSource,
    PageRules, RulePageParser,
};
use sqlx::SqlitePool;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::error::{Result, ServiceError};

/// Primary façade exposed to host applications.
///
/// Owns the database pool, the local store, the source registry, the sync
/// engine and the download scheduler, and forwards committed store changes
/// to the event bus as [`LibraryEvent`]s.
pub struct CoreService {
    config: CoreConfig,
    pool: SqlitePool,
    store: Arc<SqliteLocalStore>,
    registry: Arc<SourceRegistry>,
    engine: SyncEngine,
    scheduler: DownloadScheduler,
    event_bus: Arc<EventBus>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl CoreService {
    /// Open the database named by `config` and start the service.
    ///
    /// A database path of `:memory:` opens a private in-memory database.
    pub async fn bootstrap(config: CoreConfig) -> Result<Self> {
        // One connection per download worker plus one for refresh cycles
        let db_config = DatabaseConfig::for_path(&config.database_path)
            .with_max_connections(config.downloads.max_workers as u32 + 1);
        let pool = create_pool(db_config)
            .await
            .map_err(|err| ServiceError::InitializationFailed(err.to_string()))?;

        Self::with_pool(config, pool).await
    }

    /// Start the service on an already migrated pool.
    ///
    /// Download jobs left queued or running by a previous process are resumed.
    pub async fn with_pool(config: CoreConfig, pool: SqlitePool) -> Result<Self> {
        let clock: Arc<dyn Clock> = config.clock.clone();
        let store = Arc::new(SqliteLocalStore::new(pool.clone(), clock.clone()));
        let registry = Arc::new(SourceRegistry::new());
        let event_bus = Arc::new(EventBus::new(config.event_buffer_size));

        let engine = SyncEngine::new(
            SyncConfig::from(&config.sync),
            store.clone(),
            registry.clone(),
            event_bus.clone(),
        );
        let scheduler = DownloadScheduler::new(
            SchedulerConfig::from(&config.downloads),
            store.clone(),
            registry.clone(),
            Arc::new(SqliteDownloadJobRepository::new(pool.clone())),
            event_bus.clone(),
            clock,
        );

        let forwarder = spawn_change_forwarder(store.as_ref(), event_bus.clone());
        let resumed = scheduler.start().await?;

        info!(
            database = %config.database_path.display(),
            resumed_jobs = resumed,
            "Core service started"
        );

        Ok(Self {
            config,
            pool,
            store,
            registry,
            engine,
            scheduler,
            event_bus,
            forwarder: Mutex::new(Some(forwarder)),
        })
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// HTTP client injected through the configuration, for building adapters
    pub fn http_client(&self) -> Arc<dyn HttpClient> {
        self.config.http_client.clone()
    }

    pub fn store(&self) -> Arc<SqliteLocalStore> {
        self.store.clone()
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    pub fn scheduler(&self) -> &DownloadScheduler {
        &self.scheduler
    }

    pub fn subscribe_events(&self) -> EventStream {
        EventStream::new(self.event_bus.subscribe())
    }

    /// Stop downloads and change forwarding, then close the pool.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        let forwarder = self
            .forwarder
            .lock()
            .ok()
            .and_then(|mut handle| handle.take());
        if let Some(handle) = forwarder {
            handle.abort();
        }
        self.pool.close().await;
        info!("Core service stopped");
    }

    // ========================================================================
    // Sources
    // ========================================================================

    pub async fn register_source(&self, adapter: SourceAdapter) {
        let source_id = adapter.source_id();
        if self.registry.register(adapter).await.is_some() {
            warn!(source_id = %source_id, "Replaced a registered source");
        }
    }

    pub async fn register_catalog(&self, source: Arc<dyn CatalogSource>) {
        self.register_source(SourceAdapter::Metadata(source)).await;
    }

    pub async fn register_page_source(&self, source: Arc<dyn PageSource>) {
        self.register_source(SourceAdapter::Http(source)).await;
    }

    /// Register a JSON catalog over the configured HTTP client.
    pub async fn add_json_catalog(&self, config: JsonCatalogConfig) -> SourceId {
        let source = JsonCatalogSource::new(config, CatalogClient::new(self.http_client()));
        let source_id = source.source_id();
        self.register_catalog(Arc::new(source)).await;
        source_id
    }

    /// Register an HTML page source parsed with `rules`.
    pub async fn add_html_source(
        &self,
        config: HtmlSourceConfig,
        rules: PageRules,
    ) -> Result<SourceId> {
        let parser = RulePageParser::new(rules)?;
        let source =
            HtmlPageSource::new(config, CatalogClient::new(self.http_client()), parser);
        let source_id = source.source_id();
        self.register_page_source(Arc::new(source)).await;
        Ok(source_id)
    }

    pub async fn sources(&self) -> Vec<SourceId> {
        self.registry.source_ids().await
    }

    #[instrument(skip(self), fields(source_id = %source_id))]
    pub async fn search(&self, source_id: &SourceId, query: &str, page: u32) -> Result<SearchPage> {
        let adapter = self
            .registry
            .get(source_id)
            .await
            .ok_or_else(|| ServiceError::SourceNotRegistered(source_id.clone()))?;
        Ok(adapter.search(query, page).await?)
    }

    // ========================================================================
    // Library
    // ========================================================================

    /// Put a search result in the library.
    ///
    /// Creates the book (in the library, added now) or marks an already
    /// stored book as a library book.
    #[instrument(skip(self, summary), fields(source_id = %source_id, remote_key = %summary.remote_key))]
    pub async fn add_to_library(&self, source_id: &SourceId, summary: &BookSummary) -> Result<BookId> {
        if let Some(existing) = self
            .store
            .find_book_by_remote(source_id.as_str(), &summary.remote_key)
            .await?
        {
            if !existing.favorite {
                self.store.set_favorite(existing.id, true).await?;
                self.emit(LibraryEvent::FavoriteChanged {
                    book_id: existing.id.0,
                    favorite: true,
                });
            }
            return Ok(existing.id);
        }

        let mut book = NewBook::new(source_id.as_str(), &summary.remote_key, &summary.title)
            .in_library(self.config.clock.unix_timestamp_millis());
        book.cover_url = summary.cover_url.clone();
        let book_id = self.store.upsert_book(&book).await?;

        info!(book_id = %book_id, "Book added to library");
        self.emit(LibraryEvent::BookAdded {
            book_id: book_id.0,
            title: summary.title.clone(),
        });
        Ok(book_id)
    }

    /// Flip library membership; returns the new state.
    pub async fn toggle_favorite(&self, book_id: BookId) -> Result<bool> {
        let book = self.book(book_id).await?;
        let favorite = !book.favorite;
        self.store.set_favorite(book_id, favorite).await?;
        self.emit(LibraryEvent::FavoriteChanged {
            book_id: book_id.0,
            favorite,
        });
        Ok(favorite)
    }

    pub async fn library_books(&self) -> Result<Vec<Book>> {
        Ok(self.store.library_books().await?)
    }

    pub async fn book(&self, book_id: BookId) -> Result<Book> {
        self.store
            .get_book(book_id)
            .await?
            .ok_or(ServiceError::BookNotFound(book_id))
    }

    /// Another library book with the same normalized title, used to warn
    /// before keeping two copies of one work.
    pub async fn find_duplicate_book(&self, book_id: BookId) -> Result<Option<Book>> {
        let book = self.book(book_id).await?;
        Ok(self.store.find_duplicate_book(&book).await?)
    }

    pub fn subscribe_book(&self, book_id: BookId) -> BoxStream<'static, core_library::Result<Option<Book>>> {
        self.store.subscribe_book(book_id)
    }

    // ========================================================================
    // Chapters
    // ========================================================================

    pub async fn chapters(
        &self,
        book_id: BookId,
        filter: ChapterFilter,
        sort: ChapterSort,
    ) -> Result<Vec<Chapter>> {
        Ok(self.store.get_chapters(book_id, filter, sort).await?)
    }

    pub async fn chapter(&self, chapter_id: ChapterId) -> Result<Option<Chapter>> {
        Ok(self.store.get_chapter(chapter_id).await?)
    }

    pub fn subscribe_chapters(
        &self,
        book_id: BookId,
    ) -> BoxStream<'static, core_library::Result<Vec<Chapter>>> {
        self.store.subscribe_chapters(book_id)
    }

    pub async fn set_read(&self, book_id: BookId, ids: &[ChapterId], read: bool) -> Result<u64> {
        Ok(self.store.set_read(book_id, ids, read).await?)
    }

    pub async fn set_bookmark(
        &self,
        book_id: BookId,
        ids: &[ChapterId],
        bookmark: bool,
    ) -> Result<u64> {
        Ok(self.store.set_bookmark(book_id, ids, bookmark).await?)
    }

    pub async fn move_chapter(&self, book_id: BookId, chapter_id: ChapterId, position: i64) -> Result<()> {
        Ok(self.store.move_chapter(book_id, chapter_id, position).await?)
    }

    /// Delete chapters on explicit user request, cancelling their downloads.
    #[instrument(skip(self, ids), fields(book_id = %book_id, count = ids.len()))]
    pub async fn delete_chapters(&self, book_id: BookId, ids: &[ChapterId]) -> Result<u64> {
        for id in ids {
            self.cancel_if_active(*id).await?;
        }

        let deleted = self.store.delete_chapters(book_id, ids).await?;
        if deleted > 0 {
            self.emit(LibraryEvent::ChaptersDeleted {
                book_id: book_id.0,
                count: deleted,
            });
        }
        Ok(deleted)
    }

    /// Drop every downloaded chapter body of the book.
    #[instrument(skip(self), fields(book_id = %book_id))]
    pub async fn clear_downloads(&self, book_id: BookId) -> Result<u64> {
        self.scheduler.cancel_book(book_id).await?;

        let downloaded: Vec<ChapterId> = self
            .store
            .get_chapters(
                book_id,
                ChapterFilter {
                    downloaded_only: true,
                    ..Default::default()
                },
                ChapterSort::Ascending,
            )
            .await?
            .into_iter()
            .map(|chapter| chapter.id)
            .collect();

        let cleared = self.store.clear_downloads(book_id, &downloaded).await?;
        debug!(cleared, "Cleared downloaded content");
        Ok(cleared)
    }

    pub async fn record_read(&self, book_id: BookId, chapter_id: ChapterId) -> Result<()> {
        Ok(self.store.record_read(book_id, chapter_id).await?)
    }

    pub async fn last_read(&self, book_id: BookId) -> Result<Option<History>> {
        Ok(self.store.last_read(book_id).await?)
    }

    // ========================================================================
    // Refresh
    // ========================================================================

    /// Refresh with the configured defaults
    pub async fn refresh_book(&self, book_id: BookId) -> Result<CycleHandle> {
        Ok(self.engine.refresh(book_id).await?)
    }

    pub async fn refresh_book_with(
        &self,
        book_id: BookId,
        options: RefreshOptions,
    ) -> Result<CycleHandle> {
        Ok(self.engine.refresh_book(book_id, options).await?)
    }

    /// Merge a page the host captured itself, for example after a challenge
    /// page was solved in a web view.
    pub async fn refresh_from_page(
        &self,
        book_id: BookId,
        page: RawPage,
        resync: ResyncMode,
    ) -> Result<CycleSummary> {
        Ok(self.engine.refresh_from_page(book_id, page, resync).await?)
    }

    pub async fn cancel_refresh(&self, book_id: BookId) -> bool {
        self.engine.cancel(book_id).await
    }

    /// Whether the book should be refreshed when opened
    pub async fn is_stale(&self, book_id: BookId) -> Result<bool> {
        Ok(self.engine.is_stale(book_id).await?)
    }

    // ========================================================================
    // Downloads
    // ========================================================================

    pub async fn download_chapter(&self, chapter_id: ChapterId) -> Result<DownloadJob> {
        Ok(self.scheduler.enqueue_chapter(chapter_id).await?)
    }

    /// Queue every chapter of the book that has no content yet
    pub async fn download_book(&self, book_id: BookId) -> Result<Vec<DownloadJob>> {
        Ok(self.scheduler.enqueue_book(book_id).await?)
    }

    pub async fn download_chapters(&self, ids: &[ChapterId]) -> Result<Vec<DownloadJob>> {
        Ok(self.scheduler.enqueue_chapters(ids).await?)
    }

    pub async fn cancel_download(&self, chapter_id: ChapterId) -> Result<DownloadJob> {
        Ok(self.scheduler.cancel(chapter_id).await?)
    }

    pub async fn cancel_book_downloads(&self, book_id: BookId) -> Result<u64> {
        Ok(self.scheduler.cancel_book(book_id).await?)
    }

    pub async fn retry_download(&self, chapter_id: ChapterId) -> Result<DownloadJob> {
        Ok(self.scheduler.retry(chapter_id).await?)
    }

    pub async fn download_jobs(&self) -> Result<Vec<DownloadJob>> {
        Ok(self.scheduler.jobs().await?)
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    async fn cancel_if_active(&self, chapter_id: ChapterId) -> Result<()> {
        match self.scheduler.job(chapter_id).await? {
            Some(job) if job.state.is_active() => match self.scheduler.cancel(chapter_id).await {
                Ok(_) | Err(SchedulerError::JobNotFound(_)) => Ok(()),
                Err(err) => Err(err.into()),
            },
            _ => Ok(()),
        }
    }

    fn emit(&self, event: LibraryEvent) {
        self.event_bus.emit(CoreEvent::Library(event)).ok();
    }
}

/// Republish committed store changes as library events until the store's
/// change feed closes.
fn spawn_change_forwarder(store: &SqliteLocalStore, event_bus: Arc<EventBus>) -> JoinHandle<()> {
    let mut changes = store.changes();
    tokio::spawn(async move {
        loop {
            let change = match changes.recv().await {
                Ok(change) => change,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Store change forwarder lagged");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };

            let event = match change {
                StoreChange::Book(id) => LibraryEvent::BookUpdated { book_id: id.0 },
                StoreChange::Chapters(id) => LibraryEvent::ChaptersChanged { book_id: id.0 },
            };
            event_bus.emit(CoreEvent::Library(event)).ok();
        }
    })
}
