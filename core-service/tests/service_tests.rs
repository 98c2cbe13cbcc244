//! Façade behaviour over an in-memory database.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bridge_traits::error::{BridgeError, Result as BridgeResult};
use bridge_traits::source::{
    BookSummary, CanonicalBook, CanonicalChapter, CatalogSource, ContentPayload, FetchResult,
    RemoteValue, SearchPage, SourceId,
};
use bridge_traits::{HttpClient, HttpRequest, HttpResponse, ManualClock};
use core_library::db::create_test_pool;
use core_library::{ChapterFilter, ChapterSort};
use core_runtime::config::{CoreConfig, DownloadSettings};
use core_runtime::events::{CoreEvent, DownloadEvent, EventStream, LibraryEvent};
use core_service::{CoreService, ServiceError};
use core_sync::CycleOutcome;
use provider_catalog::{HtmlSourceConfig, JsonCatalogConfig, PageRules};

const START: i64 = 1_700_000_000_000;

struct OfflineHttpClient;

#[async_trait]
impl HttpClient for OfflineHttpClient {
    async fn execute(&self, _request: HttpRequest) -> BridgeResult<HttpResponse> {
        Err(BridgeError::NotAvailable("offline".to_string()))
    }
}

/// Catalog with one book of three chapters.
struct ShelfCatalog;

#[async_trait]
impl CatalogSource for ShelfCatalog {
    fn source_id(&self) -> SourceId {
        SourceId::new("shelf")
    }

    async fn search(&self, query: &str, _page: u32) -> FetchResult<SearchPage> {
        Ok(SearchPage {
            items: vec![BookSummary {
                remote_key: "road".to_string(),
                title: format!("The {}", query),
                cover_url: None,
            }],
            has_next_page: false,
        })
    }

    async fn fetch_detail(&self, remote_key: &str) -> FetchResult<CanonicalBook> {
        let mut book = CanonicalBook::new(remote_key);
        book.author = RemoteValue::Known("A. Writer".to_string());
        Ok(book)
    }

    async fn fetch_chapter_list(&self, _remote_key: &str) -> FetchResult<Vec<CanonicalChapter>> {
        Ok(["One", "Two", "Three"]
            .iter()
            .map(|title| CanonicalChapter::new(*title, format!("/{}", title)))
            .collect())
    }

    async fn fetch_content(&self, content_key: &str) -> FetchResult<ContentPayload> {
        Ok(ContentPayload::new(vec![format!("Body of {}", content_key)]))
    }
}

async fn service() -> CoreService {
    let config = CoreConfig::builder()
        .database_path(":memory:")
        .http_client(Arc::new(OfflineHttpClient))
        .clock(Arc::new(ManualClock::new(START)))
        .downloads(DownloadSettings {
            max_workers: 2,
            auto_retry: false,
            ..Default::default()
        })
        .build()
        .unwrap();
    let pool = create_test_pool().await.unwrap();

    let service = CoreService::with_pool(config, pool).await.unwrap();
    service.register_catalog(Arc::new(ShelfCatalog)).await;
    service
}

fn summary(remote_key: &str, title: &str) -> BookSummary {
    BookSummary {
        remote_key: remote_key.to_string(),
        title: title.to_string(),
        cover_url: Some("https://img.example.org/c.jpg".to_string()),
    }
}

async fn next_matching<F>(events: &mut EventStream, predicate: F) -> CoreEvent
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

#[tokio::test]
async fn test_add_to_library_creates_once() {
    let core = service().await;
    let shelf = SourceId::new("shelf");
    let mut events = core.subscribe_events();

    let book_id = core
        .add_to_library(&shelf, &summary("road", "The Long Road"))
        .await
        .unwrap();
    let again = core
        .add_to_library(&shelf, &summary("road", "The Long Road"))
        .await
        .unwrap();
    assert_eq!(book_id, again);

    let book = core.book(book_id).await.unwrap();
    assert!(book.favorite);
    assert_eq!(book.date_added, Some(START));
    assert_eq!(book.cover_url.as_deref(), Some("https://img.example.org/c.jpg"));
    assert!(book.is_stale());

    let added = next_matching(&mut events, |event| {
        matches!(event, CoreEvent::Library(LibraryEvent::BookAdded { .. }))
    })
    .await;
    assert_eq!(added.book_id(), Some(book_id.0));
}

#[tokio::test]
async fn test_toggle_favorite_updates_library() {
    let core = service().await;
    let shelf = SourceId::new("shelf");
    let book_id = core
        .add_to_library(&shelf, &summary("road", "The Long Road"))
        .await
        .unwrap();

    assert!(!core.toggle_favorite(book_id).await.unwrap());
    assert!(core.library_books().await.unwrap().is_empty());

    // Re-adding a stored book only flips it back into the library
    core.add_to_library(&shelf, &summary("road", "The Long Road"))
        .await
        .unwrap();
    let library = core.library_books().await.unwrap();
    assert_eq!(library.len(), 1);
    assert_eq!(library[0].id, book_id);
}

#[tokio::test]
async fn test_find_duplicate_book_across_sources() {
    let core = service().await;
    let first = core
        .add_to_library(&SourceId::new("shelf"), &summary("road", "The Long Road"))
        .await
        .unwrap();
    let second = core
        .add_to_library(&SourceId::new("mirror"), &summary("r-1", "the long  road"))
        .await
        .unwrap();

    let duplicate = core.find_duplicate_book(second).await.unwrap();
    assert_eq!(duplicate.map(|book| book.id), Some(first));

    let missing = core
        .find_duplicate_book(core_library::BookId(999))
        .await
        .unwrap_err();
    assert!(matches!(missing, ServiceError::BookNotFound(_)));
}

#[tokio::test]
async fn test_refresh_merges_and_forwards_changes() {
    let core = service().await;
    let book_id = core
        .add_to_library(&SourceId::new("shelf"), &summary("road", "The Long Road"))
        .await
        .unwrap();
    let mut events = core.subscribe_events().for_book(book_id.0);

    let handle = core.refresh_book(book_id).await.unwrap();
    let outcome = handle.wait().await;
    assert!(outcome.is_success(), "unexpected outcome: {outcome:?}");
    if let CycleOutcome::Succeeded(summary) = outcome {
        assert_eq!(summary.chapters.added, 3);
    }

    next_matching(&mut events, |event| {
        matches!(event, CoreEvent::Library(LibraryEvent::ChaptersChanged { .. }))
    })
    .await;

    let book = core.book(book_id).await.unwrap();
    assert_eq!(book.author.as_deref(), Some("A. Writer"));
    assert_eq!(book.last_fetch, Some(START));
    assert!(!core.is_stale(book_id).await.unwrap());

    let chapters = core
        .chapters(book_id, ChapterFilter::default(), ChapterSort::Descending)
        .await
        .unwrap();
    let titles: Vec<_> = chapters.iter().map(|c| c.title.as_str()).collect();
    assert_eq!(titles, vec!["Three", "Two", "One"]);
}

#[tokio::test]
async fn test_download_book_then_clear_downloads() {
    let core = service().await;
    let book_id = core
        .add_to_library(&SourceId::new("shelf"), &summary("road", "The Long Road"))
        .await
        .unwrap();
    core.refresh_book(book_id).await.unwrap().wait().await;
    let mut events = core.subscribe_events();

    let jobs = core.download_book(book_id).await.unwrap();
    assert_eq!(jobs.len(), 3);

    for _ in 0..3 {
        next_matching(&mut events, |event| {
            matches!(event, CoreEvent::Download(DownloadEvent::JobSucceeded { .. }))
        })
        .await;
    }

    let downloaded = ChapterFilter {
        downloaded_only: true,
        ..Default::default()
    };
    let chapters = core
        .chapters(book_id, downloaded, ChapterSort::Ascending)
        .await
        .unwrap();
    assert_eq!(chapters.len(), 3);
    assert_eq!(
        chapters[0].content,
        Some(ContentPayload::new(vec!["Body of /One".to_string()]))
    );

    assert_eq!(core.clear_downloads(book_id).await.unwrap(), 3);
    let chapters = core
        .chapters(book_id, downloaded, ChapterSort::Ascending)
        .await
        .unwrap();
    assert!(chapters.is_empty());
    // Clearing content never removes the chapters themselves
    assert_eq!(
        core.chapters(book_id, ChapterFilter::default(), ChapterSort::Ascending)
            .await
            .unwrap()
            .len(),
        3
    );
}

#[tokio::test]
async fn test_chapter_user_actions() {
    let core = service().await;
    let book_id = core
        .add_to_library(&SourceId::new("shelf"), &summary("road", "The Long Road"))
        .await
        .unwrap();
    core.refresh_book(book_id).await.unwrap().wait().await;
    let chapters = core
        .chapters(book_id, ChapterFilter::default(), ChapterSort::Ascending)
        .await
        .unwrap();
    let ids: Vec<_> = chapters.iter().map(|c| c.id).collect();

    assert_eq!(core.set_read(book_id, &ids[..2], true).await.unwrap(), 2);
    assert_eq!(core.set_bookmark(book_id, &ids[2..], true).await.unwrap(), 1);

    let unread = core
        .chapters(
            book_id,
            ChapterFilter {
                unread_only: true,
                ..Default::default()
            },
            ChapterSort::Ascending,
        )
        .await
        .unwrap();
    assert_eq!(unread.len(), 1);
    assert!(unread[0].bookmark);

    core.record_read(book_id, ids[1]).await.unwrap();
    let history = core.last_read(book_id).await.unwrap().unwrap();
    assert_eq!(history.chapter_id, ids[1]);
    assert_eq!(history.read_at, START);

    let mut events = core.subscribe_events();
    assert_eq!(core.delete_chapters(book_id, &ids[..1]).await.unwrap(), 1);
    let deleted = next_matching(&mut events, |event| {
        matches!(event, CoreEvent::Library(LibraryEvent::ChaptersDeleted { .. }))
    })
    .await;
    assert!(matches!(
        deleted,
        CoreEvent::Library(LibraryEvent::ChaptersDeleted { count: 1, .. })
    ));
}

#[tokio::test]
async fn test_search_requires_registered_source() {
    let core = service().await;

    let page = core
        .search(&SourceId::new("shelf"), "Long Road", 1)
        .await
        .unwrap();
    assert_eq!(page.items[0].title, "The Long Road");

    let err = core
        .search(&SourceId::new("nowhere"), "x", 1)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::SourceNotRegistered(_)));
}

#[tokio::test]
async fn test_bundled_sources_register_over_injected_client() {
    let core = service().await;

    let json = core
        .add_json_catalog(JsonCatalogConfig::new("api", "https://api.example.org"))
        .await;
    let html = core
        .add_html_source(
            HtmlSourceConfig::new("site", "https://read.example.org"),
            PageRules {
                title: Some(r"<h1>([^<]+)</h1>".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let sources = core.sources().await;
    assert!(sources.contains(&json));
    assert!(sources.contains(&html));

    // The injected client is offline, so fetches fail as adapter errors
    let err = core.search(&json, "x", 1).await.unwrap_err();
    assert!(matches!(err, ServiceError::Fetch(_)));

    let bad_rules = core
        .add_html_source(
            HtmlSourceConfig::new("broken", "https://read.example.org"),
            PageRules {
                chapter: Some("(".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(bad_rules, ServiceError::Catalog(_)));
}

#[tokio::test]
async fn test_shutdown_stops_downloads() {
    let core = service().await;
    core.shutdown().await;

    let err = core.download_chapter(core_library::ChapterId(1)).await.unwrap_err();
    assert!(matches!(err, ServiceError::Scheduler(_)));
}
