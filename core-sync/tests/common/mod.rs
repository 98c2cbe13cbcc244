//! Shared fixtures: an in-memory store and a scriptable catalog source.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bridge_traits::source::{
    CanonicalBook, CanonicalChapter, CatalogSource, ContentPayload, FetchError, FetchResult,
    PageSnapshot, PageSource, RawPage, RemoteValue, SearchPage, SourceId,
};
use bridge_traits::ManualClock;
use core_library::db::create_test_pool;
use core_library::{
    BookId, Chapter, ChapterFilter, ChapterSort, LocalStore, NewBook, NewChapter,
    SqliteLocalStore,
};
use core_runtime::events::{CoreEvent, EventBus};
use core_sync::{
    CycleHandle, CyclePhase, DownloadScheduler, SchedulerConfig, SourceRegistry,
    SqliteDownloadJobRepository, SyncConfig, SyncEngine,
};
use sqlx::SqlitePool;
use tokio::sync::{broadcast, Semaphore};

pub const SOURCE: &str = "fake";

/// Catalog source whose answers are set by the test.
pub struct FakeCatalog {
    detail: Mutex<FetchResult<CanonicalBook>>,
    chapters: Mutex<FetchResult<Vec<CanonicalChapter>>>,
    content: Mutex<HashMap<String, VecDeque<FetchResult<ContentPayload>>>>,
    /// Chapter list fetches wait until the gate is closed when set
    chapter_gate: Mutex<Option<Arc<Semaphore>>>,
    /// Content fetches wait until the gate is closed when set
    content_gate: Mutex<Option<Arc<Semaphore>>>,
    chapter_delay: Mutex<Option<Duration>>,
    pub detail_calls: AtomicUsize,
    pub chapter_calls: AtomicUsize,
    pub content_calls: AtomicUsize,
}

impl FakeCatalog {
    pub fn new() -> Self {
        let mut detail = CanonicalBook::new("book-1");
        detail.title = RemoteValue::Known("Remote Title".to_string());
        Self {
            detail: Mutex::new(Ok(detail)),
            chapters: Mutex::new(Ok(Vec::new())),
            content: Mutex::new(HashMap::new()),
            chapter_gate: Mutex::new(None),
            content_gate: Mutex::new(None),
            chapter_delay: Mutex::new(None),
            detail_calls: AtomicUsize::new(0),
            chapter_calls: AtomicUsize::new(0),
            content_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_detail(&self, detail: FetchResult<CanonicalBook>) {
        *self.detail.lock().unwrap() = detail;
    }

    pub fn set_chapters(&self, chapters: FetchResult<Vec<CanonicalChapter>>) {
        *self.chapters.lock().unwrap() = chapters;
    }

    /// Answers for successive content fetches of `key`; once used up the
    /// fetch succeeds with generated text.
    pub fn script_content(&self, key: &str, answers: Vec<FetchResult<ContentPayload>>) {
        self.content
            .lock()
            .unwrap()
            .insert(key.to_string(), answers.into_iter().collect());
    }

    /// Block chapter list fetches until the returned gate is closed
    pub fn hold_chapters(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.chapter_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    /// Block content fetches until the returned gate is closed
    pub fn hold_content(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.content_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn delay_chapters(&self, delay: Duration) {
        *self.chapter_delay.lock().unwrap() = Some(delay);
    }
}

#[async_trait]
impl CatalogSource for FakeCatalog {
    fn source_id(&self) -> SourceId {
        SourceId::new(SOURCE)
    }

    async fn search(&self, _query: &str, _page: u32) -> FetchResult<SearchPage> {
        Ok(SearchPage::default())
    }

    async fn fetch_detail(&self, _remote_key: &str) -> FetchResult<CanonicalBook> {
        self.detail_calls.fetch_add(1, Ordering::SeqCst);
        self.detail.lock().unwrap().clone()
    }

    async fn fetch_chapter_list(&self, _remote_key: &str) -> FetchResult<Vec<CanonicalChapter>> {
        self.chapter_calls.fetch_add(1, Ordering::SeqCst);

        let gate = self.chapter_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            // Closing the gate fails the acquire and lets the fetch through
            let _ = gate.acquire().await;
        }
        let delay = *self.chapter_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.chapters.lock().unwrap().clone()
    }

    async fn fetch_content(&self, content_key: &str) -> FetchResult<ContentPayload> {
        self.content_calls.fetch_add(1, Ordering::SeqCst);

        let gate = self.content_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            // Closing the gate fails the acquire and lets the fetch through
            let _ = gate.acquire().await;
        }

        let scripted = self
            .content
            .lock()
            .unwrap()
            .get_mut(content_key)
            .and_then(|answers| answers.pop_front());
        scripted.unwrap_or_else(|| {
            Ok(ContentPayload::new(vec![format!("Text of {}", content_key)]))
        })
    }
}

/// Page source parsing a tiny line format: `title:<t>` sets the book title,
/// `chapter:<title>|<key>` adds a chapter.
pub struct FakePages;

#[async_trait]
impl CatalogSource for FakePages {
    fn source_id(&self) -> SourceId {
        SourceId::new("pages")
    }

    async fn search(&self, _query: &str, _page: u32) -> FetchResult<SearchPage> {
        Ok(SearchPage::default())
    }

    async fn fetch_detail(&self, remote_key: &str) -> FetchResult<CanonicalBook> {
        Err(FetchError::NotFound(remote_key.to_string()))
    }

    async fn fetch_chapter_list(&self, remote_key: &str) -> FetchResult<Vec<CanonicalChapter>> {
        Err(FetchError::NotFound(remote_key.to_string()))
    }

    async fn fetch_content(&self, content_key: &str) -> FetchResult<ContentPayload> {
        Err(FetchError::NotFound(content_key.to_string()))
    }
}

#[async_trait]
impl PageSource for FakePages {
    async fn fetch_page(&self, url: &str) -> FetchResult<RawPage> {
        Err(FetchError::NotFound(url.to_string()))
    }

    fn parse_page(&self, page: &RawPage) -> FetchResult<PageSnapshot> {
        let mut snapshot = PageSnapshot::default();
        for line in page.body.lines() {
            if let Some(title) = line.strip_prefix("title:") {
                let mut book = CanonicalBook::new(page.url.clone());
                book.title = RemoteValue::Known(title.to_string());
                snapshot.book = Some(book);
            } else if let Some(rest) = line.strip_prefix("chapter:") {
                let (title, key) = rest
                    .split_once('|')
                    .ok_or_else(|| FetchError::ParseFailure(line.to_string()))?;
                snapshot.chapters.push(CanonicalChapter::new(title, key));
            }
        }
        Ok(snapshot)
    }
}

pub struct Harness {
    pub pool: SqlitePool,
    pub store: Arc<SqliteLocalStore>,
    pub registry: Arc<SourceRegistry>,
    pub event_bus: Arc<EventBus>,
    pub clock: Arc<ManualClock>,
    pub source: Arc<FakeCatalog>,
}

impl Harness {
    pub async fn new() -> Self {
        let pool = create_test_pool().await.unwrap();
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let store = Arc::new(SqliteLocalStore::new(pool.clone(), clock.clone()));
        let registry = Arc::new(SourceRegistry::new());
        let source = Arc::new(FakeCatalog::new());
        registry.register_catalog(source.clone()).await;

        Self {
            pool,
            store,
            registry,
            event_bus: Arc::new(EventBus::new(256)),
            clock,
            source,
        }
    }

    pub fn engine(&self) -> SyncEngine {
        self.engine_with(SyncConfig::default())
    }

    pub fn engine_with(&self, config: SyncConfig) -> SyncEngine {
        SyncEngine::new(
            config,
            self.store.clone(),
            self.registry.clone(),
            self.event_bus.clone(),
        )
    }

    pub fn scheduler(&self, config: SchedulerConfig) -> DownloadScheduler {
        DownloadScheduler::new(
            config,
            self.store.clone(),
            self.registry.clone(),
            Arc::new(SqliteDownloadJobRepository::new(self.pool.clone())),
            self.event_bus.clone(),
            self.clock.clone(),
        )
    }

    pub fn events(&self) -> broadcast::Receiver<CoreEvent> {
        self.event_bus.subscribe()
    }

    pub async fn add_book(&self) -> BookId {
        self.add_book_from(SOURCE, "book-1").await
    }

    pub async fn add_book_from(&self, source_id: &str, remote_key: &str) -> BookId {
        self.store
            .upsert_book(&NewBook::new(source_id, remote_key, "Local Title"))
            .await
            .unwrap()
    }

    /// Store chapters as if an earlier cycle had merged them
    pub async fn seed_chapters(&self, book_id: BookId, titles: &[&str]) -> Vec<Chapter> {
        let chapters: Vec<NewChapter> = titles
            .iter()
            .enumerate()
            .map(|(position, title)| NewChapter {
                match_key: format!("title:{}", core_library::normalize_title(title)),
                remote_id: None,
                title: title.to_string(),
                position: position as i64,
                content_key: format!("/{}", title),
                published_at: None,
            })
            .collect();
        self.store.upsert_chapters(book_id, &chapters).await.unwrap();
        self.chapters(book_id).await
    }

    pub async fn chapters(&self, book_id: BookId) -> Vec<Chapter> {
        self.store
            .get_chapters(book_id, ChapterFilter::default(), ChapterSort::Ascending)
            .await
            .unwrap()
    }
}

pub fn chapter(title: &str) -> CanonicalChapter {
    CanonicalChapter::new(title, format!("/{}", title))
}

pub fn chapters(titles: &[&str]) -> Vec<CanonicalChapter> {
    titles.iter().map(|title| chapter(title)).collect()
}

/// Poll until the cycle reaches `phase`, failing after a second.
pub async fn wait_for_phase(handle: &CycleHandle, phase: CyclePhase) {
    tokio::time::timeout(Duration::from_secs(1), async {
        while handle.phase() != phase {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("cycle did not reach the expected phase");
}

/// Next event matching `predicate`, failing after two seconds.
pub async fn next_event<F>(events: &mut broadcast::Receiver<CoreEvent>, predicate: F) -> CoreEvent
where
    F: Fn(&CoreEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let event = events.recv().await.expect("event bus closed");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .expect("expected event was not published")
}
