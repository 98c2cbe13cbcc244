//! Adapters driven end to end over a routed in-memory HTTP client.

use async_trait::async_trait;
use bridge_traits::error::{BridgeError, Result as BridgeResult};
use bridge_traits::http::{HttpClient, HttpRequest, HttpResponse, RetryPolicy};
use bridge_traits::source::{
    CatalogSource, FetchError, FetchErrorKind, PageSource, RawPage, RemoteValue,
};
use bytes::Bytes;
use provider_catalog::{
    CatalogClient, HtmlPageSource, HtmlSourceConfig, JsonCatalogConfig, JsonCatalogSource,
    PageRules, RulePageParser,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Answers requests by exact URL; unknown URLs get a 404.
#[derive(Default)]
struct RoutedHttpClient {
    routes: Mutex<HashMap<String, Vec<BridgeResult<(u16, String)>>>>,
    requests: Mutex<Vec<String>>,
}

impl RoutedHttpClient {
    fn route(&self, url: &str, status: u16, body: &str) {
        self.routes
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .push(Ok((status, body.to_string())));
    }

    fn fail(&self, url: &str, error: BridgeError) {
        self.routes
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .push(Err(error));
    }

    fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpClient for RoutedHttpClient {
    async fn execute(&self, request: HttpRequest) -> BridgeResult<HttpResponse> {
        self.requests.lock().unwrap().push(request.url.clone());

        let mut routes = self.routes.lock().unwrap();
        let answer = match routes.get_mut(&request.url) {
            // The last scripted answer repeats
            Some(answers) if answers.len() > 1 => answers.remove(0),
            Some(answers) => match answers.first() {
                Some(Ok(ok)) => Ok(ok.clone()),
                Some(Err(_)) => Err(BridgeError::Network("scripted failure".to_string())),
                None => Ok((404, String::new())),
            },
            None => Ok((404, String::new())),
        };

        answer.map(|(status, body)| HttpResponse {
            status,
            headers: HashMap::new(),
            body: Bytes::from(body),
        })
    }
}

fn client(http: Arc<RoutedHttpClient>) -> CatalogClient {
    CatalogClient::new(http).with_retry_policy(RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        use_exponential_backoff: true,
    })
}

// ============================================================================
// JSON catalog
// ============================================================================

const API: &str = "https://api.example.org/v1";

fn json_source(http: Arc<RoutedHttpClient>) -> JsonCatalogSource {
    JsonCatalogSource::new(
        JsonCatalogConfig::new("novels", API).with_display_name("Novels API"),
        client(http),
    )
}

#[tokio::test]
async fn test_json_detail_and_chapters() {
    let http = Arc::new(RoutedHttpClient::default());
    http.route(
        &format!("{}/books/42", API),
        200,
        r#"{"id":"42","title":"The Long Road","author":"A. Writer","chapterCount":2}"#,
    );
    http.route(
        &format!("{}/books/42/chapters", API),
        200,
        r#"{"chapters":[
            {"id":"c1","title":" Chapter 1 ","url":"/chapters/c1","publishedAt":"2024-01-01T00:00:00Z"},
            {"title":"Chapter 2","url":"/chapters/c2"}
        ]}"#,
    );
    let source = json_source(http);

    assert_eq!(source.display_name(), "Novels API");

    let book = source.fetch_detail("42").await.unwrap();
    assert_eq!(book.title, RemoteValue::Known("The Long Road".to_string()));
    assert_eq!(book.description, RemoteValue::Unknown);
    assert_eq!(book.total_chapters, RemoteValue::Known(2));

    let chapters = source.fetch_chapter_list("42").await.unwrap();
    assert_eq!(chapters.len(), 2);
    assert_eq!(chapters[0].title, "Chapter 1");
    assert_eq!(chapters[0].remote_id.as_deref(), Some("c1"));
    assert_eq!(chapters[0].published_at, RemoteValue::Known(1_704_067_200_000));
    assert_eq!(chapters[1].remote_id, None);
    assert_eq!(chapters[1].published_at, RemoteValue::Unknown);
}

#[tokio::test]
async fn test_json_search_encodes_query() {
    let http = Arc::new(RoutedHttpClient::default());
    http.route(
        &format!("{}/search?q=long%20road&page=1", API),
        200,
        r#"{"items":[{"id":"42","title":"The Long Road"}],"hasNextPage":true}"#,
    );
    let source = json_source(http);

    let page = source.search("long road", 0).await.unwrap();

    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0].remote_key, "42");
    assert!(page.has_next_page);
}

#[tokio::test]
async fn test_json_content() {
    let http = Arc::new(RoutedHttpClient::default());
    http.route(
        &format!("{}/chapters/c1", API),
        200,
        r#"{"paragraphs":["One.","Two."]}"#,
    );
    http.route(&format!("{}/chapters/blank", API), 200, r#"{"paragraphs":["  "]}"#);
    let source = json_source(http);

    let content = source.fetch_content("/chapters/c1").await.unwrap();
    assert_eq!(content.paragraphs, vec!["One.".to_string(), "Two.".to_string()]);

    let err = source.fetch_content("/chapters/blank").await.unwrap_err();
    assert_eq!(err.kind(), FetchErrorKind::ParseFailure);
}

#[tokio::test]
async fn test_json_status_mapping() {
    let http = Arc::new(RoutedHttpClient::default());
    http.route(&format!("{}/books/throttled", API), 429, "");
    http.route(&format!("{}/books/broken", API), 200, "not json");
    http.fail(
        &format!("{}/books/offline", API),
        BridgeError::Network("connection refused".to_string()),
    );
    let source = json_source(http.clone());

    let missing = source.fetch_detail("gone").await.unwrap_err();
    assert_eq!(missing.kind(), FetchErrorKind::NotFound);

    let throttled = source.fetch_detail("throttled").await.unwrap_err();
    assert_eq!(throttled, FetchError::RateLimited { retry_after: None });

    let broken = source.fetch_detail("broken").await.unwrap_err();
    assert_eq!(broken.kind(), FetchErrorKind::ParseFailure);

    let offline = source.fetch_detail("offline").await.unwrap_err();
    assert_eq!(offline.kind(), FetchErrorKind::Network);

    // 404 is answered once, 429 and transport failures use every attempt
    let requests = http.requests();
    let count = |suffix: &str| requests.iter().filter(|url| url.ends_with(suffix)).count();
    assert_eq!(count("/books/gone"), 1);
    assert_eq!(count("/books/throttled"), 3);
    assert_eq!(count("/books/offline"), 3);
}

#[tokio::test]
async fn test_json_recovers_after_server_error() {
    let http = Arc::new(RoutedHttpClient::default());
    let url = format!("{}/books/42", API);
    http.route(&url, 502, "bad gateway");
    http.route(&url, 200, r#"{"id":"42","title":"Back"}"#);
    let source = json_source(http);

    let book = source.fetch_detail("42").await.unwrap();
    assert_eq!(book.title, RemoteValue::Known("Back".to_string()));
}

// ============================================================================
// HTML pages
// ============================================================================

const SITE: &str = "https://read.example.org";

const BOOK_PAGE: &str = r#"
<html><body>
  <h1>The Long Road</h1>
  <p class="author">A. Writer</p>
  <ol>
    <li><a href="/book/9/1">Chapter 1</a></li>
    <li><a href="/book/9/2">Chapter 2</a></li>
  </ol>
</body></html>
"#;

fn rules() -> PageRules {
    PageRules {
        title: Some(r"<h1>(?P<value>[^<]+)</h1>".to_string()),
        author: Some(r#"<p class="author">([^<]+)</p>"#.to_string()),
        chapter: Some(r#"<li><a href="(?P<url>[^"]+)">(?P<title>[^<]+)</a></li>"#.to_string()),
        content: Some(r#"(?s)<article>(?P<body>.*?)</article>"#.to_string()),
        ..Default::default()
    }
}

fn html_source(http: Arc<RoutedHttpClient>) -> HtmlPageSource<RulePageParser> {
    HtmlPageSource::new(
        HtmlSourceConfig::new("reader", SITE)
            .with_detail_url("{base}/book/{key}")
            .with_chapters_url("{base}/book/{key}"),
        client(http),
        RulePageParser::new(rules()).unwrap(),
    )
}

#[tokio::test]
async fn test_html_detail_and_chapters() {
    let http = Arc::new(RoutedHttpClient::default());
    http.route(&format!("{}/book/9", SITE), 200, BOOK_PAGE);
    let source = html_source(http);

    let book = source.fetch_detail("9").await.unwrap();
    assert_eq!(book.remote_key, "9");
    assert_eq!(book.title, RemoteValue::Known("The Long Road".to_string()));
    assert_eq!(book.author, RemoteValue::Known("A. Writer".to_string()));

    let chapters = source.fetch_chapter_list("9").await.unwrap();
    let titles: Vec<_> = chapters.iter().map(|c| c.title.as_str()).collect();
    assert_eq!(titles, vec!["Chapter 1", "Chapter 2"]);
    assert_eq!(chapters[1].content_key, "/book/9/2");
}

#[tokio::test]
async fn test_html_content_fetch() {
    let http = Arc::new(RoutedHttpClient::default());
    http.route(
        &format!("{}/book/9/1", SITE),
        200,
        "<article><p>It began.</p><p>It ended.</p></article>",
    );
    http.route(&format!("{}/book/9/2", SITE), 200, "<article> </article>");
    let source = html_source(http);

    let content = source.fetch_content("/book/9/1").await.unwrap();
    assert_eq!(
        content.paragraphs,
        vec!["It began.".to_string(), "It ended.".to_string()]
    );

    let blank = source.fetch_content("/book/9/2").await.unwrap_err();
    assert_eq!(blank.kind(), FetchErrorKind::ParseFailure);
}

#[tokio::test]
async fn test_html_parse_captured_page_matches_fetch() {
    let http = Arc::new(RoutedHttpClient::default());
    http.route(&format!("{}/book/9", SITE), 200, BOOK_PAGE);
    let source = html_source(http);

    let fetched = source.fetch_page("/book/9").await.unwrap();
    assert_eq!(fetched.url, format!("{}/book/9", SITE));

    let captured = RawPage::new(format!("{}/book/9", SITE), BOOK_PAGE);
    assert_eq!(
        source.parse_page(&fetched).unwrap(),
        source.parse_page(&captured).unwrap()
    );

    let snapshot = source.parse_page(&captured).unwrap();
    assert!(snapshot.book.is_some());
    assert_eq!(snapshot.chapters.len(), 2);
}

#[tokio::test]
async fn test_html_page_without_detail_is_parse_failure() {
    let http = Arc::new(RoutedHttpClient::default());
    http.route(&format!("{}/book/7", SITE), 200, "<html>challenge</html>");
    let source = html_source(http);

    let err = source.fetch_detail("7").await.unwrap_err();
    assert_eq!(err.kind(), FetchErrorKind::ParseFailure);
}
