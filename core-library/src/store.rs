//! # Local Store
//!
//! The persistence port consumed by the sync engine and download scheduler,
//! and its SQLite implementation.
//!
//! Every write is a single transaction scoped to one book (detail plus
//! chapters) or one chapter (content payload). Committed writes publish a
//! [`StoreChange`]; `subscribe_*` streams re-query on each relevant change so
//! observers always see committed state.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use bridge_traits::source::ContentPayload;
use bridge_traits::Clock;
use futures::stream::{self, BoxStream, StreamExt};
use sqlx::SqlitePool;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, instrument};

use crate::error::{LibraryError, Result};
use crate::models::{
    Book, BookId, Chapter, ChapterChanges, ChapterFilter, ChapterId, ChapterSort, History,
    MergeSummary, NewBook, NewChapter,
};
use crate::repositories::{
    book, chapter, BookRepository, ChapterRepository, HistoryRepository, SqliteBookRepository,
    SqliteChapterRepository, SqliteHistoryRepository,
};

const CHANGE_BUFFER_SIZE: usize = 128;

/// A committed write, identified by the book it touched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreChange {
    /// Book row fields changed
    Book(BookId),
    /// Chapter rows of the book were inserted, updated or deleted
    Chapters(BookId),
}

impl StoreChange {
    pub fn book_id(&self) -> BookId {
        match self {
            StoreChange::Book(id) | StoreChange::Chapters(id) => *id,
        }
    }
}

#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn get_book(&self, id: BookId) -> Result<Option<Book>>;

    async fn find_book_by_remote(&self, source_id: &str, remote_key: &str)
        -> Result<Option<Book>>;

    /// Another library book whose normalized title matches `book`'s
    async fn find_duplicate_book(&self, book: &Book) -> Result<Option<Book>>;

    /// Current value, then a new value after every committed change to the book
    fn subscribe_book(&self, id: BookId) -> BoxStream<'static, Result<Option<Book>>>;

    /// Create the book unless it exists; returns the local id either way
    async fn upsert_book(&self, book: &NewBook) -> Result<BookId>;

    async fn get_chapters(
        &self,
        book_id: BookId,
        filter: ChapterFilter,
        sort: ChapterSort,
    ) -> Result<Vec<Chapter>>;

    async fn get_chapter(&self, id: ChapterId) -> Result<Option<Chapter>>;

    /// Current chapter list in ascending order, re-emitted after every
    /// committed change to the book's chapters
    fn subscribe_chapters(&self, book_id: BookId) -> BoxStream<'static, Result<Vec<Chapter>>>;

    /// Insert chapters whose match key is not stored yet
    async fn upsert_chapters(&self, book_id: BookId, chapters: &[NewChapter]) -> Result<u64>;

    /// Write remote-derived book fields without marking the book refreshed
    async fn merge_book_detail(&self, book: &Book) -> Result<()>;

    /// Write remote-derived book fields and the chapter changes atomically,
    /// stamping `last_fetch`. Either everything commits or nothing does.
    async fn merge_book_and_chapters(
        &self,
        book: &Book,
        changes: &ChapterChanges,
    ) -> Result<MergeSummary>;

    /// Persist downloaded content for one chapter
    async fn save_chapter_content(&self, id: ChapterId, content: &ContentPayload) -> Result<()>;

    async fn set_favorite(&self, id: BookId, favorite: bool) -> Result<()>;

    async fn library_books(&self) -> Result<Vec<Book>>;

    async fn set_read(&self, book_id: BookId, ids: &[ChapterId], read: bool) -> Result<u64>;

    async fn set_bookmark(&self, book_id: BookId, ids: &[ChapterId], bookmark: bool)
        -> Result<u64>;

    /// Manual reorder; the position survives later merges
    async fn move_chapter(&self, book_id: BookId, id: ChapterId, position: i64) -> Result<()>;

    /// Explicit user deletion, ignoring bookmark and download state
    async fn delete_chapters(&self, book_id: BookId, ids: &[ChapterId]) -> Result<u64>;

    /// Drop downloaded content, keeping the chapters
    async fn clear_downloads(&self, book_id: BookId, ids: &[ChapterId]) -> Result<u64>;

    async fn record_read(&self, book_id: BookId, chapter_id: ChapterId) -> Result<()>;

    async fn last_read(&self, book_id: BookId) -> Result<Option<History>>;

    /// Raw feed of committed changes
    fn changes(&self) -> broadcast::Receiver<StoreChange>;
}

/// SQLite-backed [`LocalStore`]
#[derive(Clone)]
pub struct SqliteLocalStore {
    pool: SqlitePool,
    books: SqliteBookRepository,
    chapters: SqliteChapterRepository,
    history: SqliteHistoryRepository,
    clock: Arc<dyn Clock>,
    changes: broadcast::Sender<StoreChange>,
}

impl SqliteLocalStore {
    pub fn new(pool: SqlitePool, clock: Arc<dyn Clock>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER_SIZE);
        Self {
            books: SqliteBookRepository::new(pool.clone()),
            chapters: SqliteChapterRepository::new(pool.clone()),
            history: SqliteHistoryRepository::new(pool.clone()),
            pool,
            clock,
            changes,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn notify(&self, change: StoreChange) {
        debug!(book_id = %change.book_id(), ?change, "Store change committed");
        self.changes.send(change).ok();
    }

    /// Stream `load` once immediately and again after each change matching
    /// `relevant`. A lagged receiver re-queries instead of replaying.
    fn watch<T, F, Fut>(
        &self,
        relevant: impl Fn(&StoreChange) -> bool + Send + Sync + 'static,
        load: F,
    ) -> BoxStream<'static, Result<T>>
    where
        T: Send + 'static,
        F: Fn(SqliteLocalStore) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let receiver = self.changes.subscribe();
        let state = (self.clone(), receiver, true, relevant, load);

        stream::unfold(
            state,
            |(store, mut receiver, first, relevant, load)| async move {
                if !first {
                    loop {
                        match receiver.recv().await {
                            Ok(change) if relevant(&change) => break,
                            Ok(_) => continue,
                            Err(RecvError::Lagged(_)) => break,
                            Err(RecvError::Closed) => return None,
                        }
                    }
                }
                let item = load(store.clone()).await;
                Some((item, (store, receiver, false, relevant, load)))
            },
        )
        .boxed()
    }
}

#[async_trait]
impl LocalStore for SqliteLocalStore {
    async fn get_book(&self, id: BookId) -> Result<Option<Book>> {
        self.books.find_by_id(id).await
    }

    async fn find_book_by_remote(
        &self,
        source_id: &str,
        remote_key: &str,
    ) -> Result<Option<Book>> {
        self.books.find_by_remote(source_id, remote_key).await
    }

    async fn find_duplicate_book(&self, book: &Book) -> Result<Option<Book>> {
        self.books.find_duplicate(&book.title, Some(book.id)).await
    }

    fn subscribe_book(&self, id: BookId) -> BoxStream<'static, Result<Option<Book>>> {
        self.watch(
            move |change| *change == StoreChange::Book(id),
            move |store| async move { store.books.find_by_id(id).await },
        )
    }

    #[instrument(skip(self, book), fields(source_id = %book.source_id, remote_key = %book.remote_key))]
    async fn upsert_book(&self, book: &NewBook) -> Result<BookId> {
        let existing = self
            .books
            .find_by_remote(&book.source_id, &book.remote_key)
            .await?;
        let id = self.books.insert_or_get(book).await?;
        if existing.is_none() {
            debug!(book_id = %id, "Book created");
            self.notify(StoreChange::Book(id));
        }
        Ok(id)
    }

    async fn get_chapters(
        &self,
        book_id: BookId,
        filter: ChapterFilter,
        sort: ChapterSort,
    ) -> Result<Vec<Chapter>> {
        self.chapters.list(book_id, filter, sort).await
    }

    async fn get_chapter(&self, id: ChapterId) -> Result<Option<Chapter>> {
        self.chapters.find_by_id(id).await
    }

    fn subscribe_chapters(&self, book_id: BookId) -> BoxStream<'static, Result<Vec<Chapter>>> {
        self.watch(
            move |change| *change == StoreChange::Chapters(book_id),
            move |store| async move {
                store
                    .chapters
                    .list(book_id, ChapterFilter::default(), ChapterSort::Ascending)
                    .await
            },
        )
    }

    async fn upsert_chapters(&self, book_id: BookId, chapters: &[NewChapter]) -> Result<u64> {
        let inserted = self
            .chapters
            .insert_missing(book_id, chapters, self.clock.unix_timestamp_millis())
            .await?;
        if inserted > 0 {
            self.notify(StoreChange::Chapters(book_id));
        }
        Ok(inserted)
    }

    #[instrument(skip(self, book), fields(book_id = %book.id))]
    async fn merge_book_detail(&self, book: &Book) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        book::update_remote_fields(&mut tx, book, None).await?;
        tx.commit().await?;

        self.notify(StoreChange::Book(book.id));
        Ok(())
    }

    #[instrument(
        skip(self, book, changes),
        fields(
            book_id = %book.id,
            inserts = changes.inserts.len(),
            updates = changes.updates.len(),
            deletes = changes.deletes.len()
        )
    )]
    async fn merge_book_and_chapters(
        &self,
        book: &Book,
        changes: &ChapterChanges,
    ) -> Result<MergeSummary> {
        let now = self.clock.unix_timestamp_millis();
        let mut tx = self.pool.begin().await?;

        book::update_remote_fields(&mut tx, book, Some(now)).await?;
        // Deletes run first so their match keys are free for updates and inserts
        let deleted = chapter::delete_unattached(&mut tx, book.id, &changes.deletes).await?;
        let updated = chapter::update_remote_fields(&mut tx, book.id, &changes.updates).await?;
        let inserted = chapter::insert_chapters(&mut tx, book.id, &changes.inserts, now).await?;

        tx.commit().await?;

        let summary = MergeSummary {
            inserted,
            updated,
            deleted,
        };
        debug!(?summary, "Merge committed");

        self.notify(StoreChange::Book(book.id));
        if !changes.is_empty() {
            self.notify(StoreChange::Chapters(book.id));
        }
        Ok(summary)
    }

    async fn save_chapter_content(&self, id: ChapterId, content: &ContentPayload) -> Result<()> {
        let chapter = self
            .chapters
            .find_by_id(id)
            .await?
            .ok_or_else(|| LibraryError::not_found("Chapter", id))?;
        self.chapters.save_content(id, content).await?;
        self.notify(StoreChange::Chapters(chapter.book_id));
        Ok(())
    }

    async fn set_favorite(&self, id: BookId, favorite: bool) -> Result<()> {
        self.books
            .set_favorite(id, favorite, self.clock.unix_timestamp_millis())
            .await?;
        self.notify(StoreChange::Book(id));
        Ok(())
    }

    async fn library_books(&self) -> Result<Vec<Book>> {
        self.books.library().await
    }

    async fn set_read(&self, book_id: BookId, ids: &[ChapterId], read: bool) -> Result<u64> {
        let changed = self.chapters.set_read(book_id, ids, read).await?;
        if changed > 0 {
            self.notify(StoreChange::Chapters(book_id));
        }
        Ok(changed)
    }

    async fn set_bookmark(
        &self,
        book_id: BookId,
        ids: &[ChapterId],
        bookmark: bool,
    ) -> Result<u64> {
        let changed = self.chapters.set_bookmark(book_id, ids, bookmark).await?;
        if changed > 0 {
            self.notify(StoreChange::Chapters(book_id));
        }
        Ok(changed)
    }

    async fn move_chapter(&self, book_id: BookId, id: ChapterId, position: i64) -> Result<()> {
        match self.chapters.find_by_id(id).await? {
            Some(chapter) if chapter.book_id == book_id => {}
            _ => return Err(LibraryError::not_found("Chapter", id)),
        }
        self.chapters.move_to(id, position).await?;
        self.notify(StoreChange::Chapters(book_id));
        Ok(())
    }

    async fn delete_chapters(&self, book_id: BookId, ids: &[ChapterId]) -> Result<u64> {
        let deleted = self.chapters.delete(book_id, ids).await?;
        if deleted > 0 {
            self.notify(StoreChange::Chapters(book_id));
        }
        Ok(deleted)
    }

    async fn clear_downloads(&self, book_id: BookId, ids: &[ChapterId]) -> Result<u64> {
        let cleared = self.chapters.clear_content(book_id, ids).await?;
        if cleared > 0 {
            self.notify(StoreChange::Chapters(book_id));
        }
        Ok(cleared)
    }

    async fn record_read(&self, book_id: BookId, chapter_id: ChapterId) -> Result<()> {
        self.history
            .record(book_id, chapter_id, self.clock.unix_timestamp_millis())
            .await
    }

    async fn last_read(&self, book_id: BookId) -> Result<Option<History>> {
        self.history.last_read(book_id).await
    }

    fn changes(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }
}
