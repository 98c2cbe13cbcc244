//! HTML page source
//!
//! HTTP-content adapter: fetches pages by URL template and hands the markup to
//! a [`PageParser`]. The same parser interprets pages captured by the host
//! (for example a page rendered in a web view after a challenge), so a page
//! obtained either way yields the same canonical data.

use async_trait::async_trait;
use bridge_traits::source::{
    CanonicalBook, CanonicalChapter, CatalogSource, ContentPayload, FetchError, FetchResult,
    PageSnapshot, PageSource, RawPage, SearchPage, SourceId,
};
use tracing::{debug, info, instrument};

use crate::client::{expand_template, resolve_url, CatalogClient};

/// Turns raw markup into canonical data.
///
/// Parsers are pure: they never perform I/O and give the same answer for the
/// same page.
pub trait PageParser: Send + Sync {
    fn parse_search(&self, page: &RawPage) -> FetchResult<SearchPage>;

    /// Book detail on the page, `None` when the page carries none
    fn parse_detail(&self, page: &RawPage) -> FetchResult<Option<CanonicalBook>>;

    /// Chapters in page order
    fn parse_chapters(&self, page: &RawPage) -> FetchResult<Vec<CanonicalChapter>>;

    fn parse_content(&self, page: &RawPage) -> FetchResult<ContentPayload>;
}

/// URL layout of an HTML catalog.
///
/// Templates accept `{base}`, `{key}` (inserted as a path), `{query}` and
/// `{page}` (URL-encoded).
#[derive(Debug, Clone)]
pub struct HtmlSourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub base_url: String,
    pub search_url: String,
    pub detail_url: String,
    /// Defaults to the detail page, where most catalogs list chapters
    pub chapters_url: String,
}

impl HtmlSourceConfig {
    pub fn new(source_id: impl Into<String>, base_url: impl Into<String>) -> Self {
        let source_id = source_id.into();
        Self {
            display_name: source_id.clone(),
            source_id,
            base_url: base_url.into(),
            search_url: "{base}/search?q={query}&page={page}".to_string(),
            detail_url: "{base}/{key}".to_string(),
            chapters_url: "{base}/{key}".to_string(),
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    pub fn with_search_url(mut self, template: impl Into<String>) -> Self {
        self.search_url = template.into();
        self
    }

    pub fn with_detail_url(mut self, template: impl Into<String>) -> Self {
        self.detail_url = template.into();
        self
    }

    pub fn with_chapters_url(mut self, template: impl Into<String>) -> Self {
        self.chapters_url = template.into();
        self
    }
}

pub struct HtmlPageSource<P: PageParser> {
    config: HtmlSourceConfig,
    client: CatalogClient,
    parser: P,
}

impl<P: PageParser> HtmlPageSource<P> {
    pub fn new(config: HtmlSourceConfig, client: CatalogClient, parser: P) -> Self {
        Self {
            config,
            client,
            parser,
        }
    }

    pub fn parser(&self) -> &P {
        &self.parser
    }

    fn url(&self, template: &str, vars: &[(&str, &str)]) -> String {
        expand_template(template, &self.config.base_url, vars)
    }
}

#[async_trait]
impl<P: PageParser> CatalogSource for HtmlPageSource<P> {
    fn source_id(&self) -> SourceId {
        SourceId::new(self.config.source_id.clone())
    }

    fn display_name(&self) -> String {
        self.config.display_name.clone()
    }

    #[instrument(skip(self), fields(source = %self.config.source_id))]
    async fn search(&self, query: &str, page: u32) -> FetchResult<SearchPage> {
        let page_str = page.max(1).to_string();
        let url = self.url(
            &self.config.search_url,
            &[("query", query), ("page", &page_str)],
        );
        let raw = self.fetch_page(&url).await?;
        self.parser.parse_search(&raw)
    }

    #[instrument(skip(self), fields(source = %self.config.source_id))]
    async fn fetch_detail(&self, remote_key: &str) -> FetchResult<CanonicalBook> {
        let url = self.url(&self.config.detail_url, &[("key", remote_key)]);
        let raw = self.fetch_page(&url).await?;

        let mut book = self
            .parser
            .parse_detail(&raw)?
            .ok_or_else(|| FetchError::ParseFailure(format!("No book detail on {}", url)))?;
        book.remote_key = remote_key.to_string();
        Ok(book)
    }

    #[instrument(skip(self), fields(source = %self.config.source_id))]
    async fn fetch_chapter_list(&self, remote_key: &str) -> FetchResult<Vec<CanonicalChapter>> {
        let url = self.url(&self.config.chapters_url, &[("key", remote_key)]);
        let raw = self.fetch_page(&url).await?;
        let chapters = self.parser.parse_chapters(&raw)?;

        info!("Parsed {} chapters from {}", chapters.len(), url);
        Ok(chapters)
    }

    #[instrument(skip(self), fields(source = %self.config.source_id))]
    async fn fetch_content(&self, content_key: &str) -> FetchResult<ContentPayload> {
        let raw = self.fetch_page(content_key).await?;
        let content = self.parser.parse_content(&raw)?;

        if content.is_blank() {
            return Err(FetchError::ParseFailure(format!(
                "Empty chapter body at {}",
                raw.url
            )));
        }
        Ok(content)
    }
}

#[async_trait]
impl<P: PageParser> PageSource for HtmlPageSource<P> {
    async fn fetch_page(&self, url: &str) -> FetchResult<RawPage> {
        let url = resolve_url(&self.config.base_url, url);
        let body = self.client.get_text(&url, "text/html").await?;

        debug!("Fetched {} bytes from {}", body.len(), url);
        Ok(RawPage::new(url, body))
    }

    fn parse_page(&self, page: &RawPage) -> FetchResult<PageSnapshot> {
        Ok(PageSnapshot {
            book: self.parser.parse_detail(page)?,
            chapters: self.parser.parse_chapters(page)?,
        })
    }
}
