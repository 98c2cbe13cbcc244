//! JSON catalog source
//!
//! Metadata adapter for catalogs exposing a small JSON API:
//!
//! | Operation | Endpoint |
//! |-----------|----------|
//! | search | `GET {base}/search?q={query}&page={page}` |
//! | detail | `GET {base}/books/{key}` |
//! | chapter list | `GET {base}/books/{key}/chapters` |
//! | content | `GET {base}/{content key}` (absolute keys are fetched as-is) |

use async_trait::async_trait;
use bridge_traits::http::HttpClient;
use bridge_traits::source::{
    BookStatus, BookSummary, CanonicalBook, CanonicalChapter, CatalogSource, ContentPayload,
    FetchResult, RemoteValue, SearchPage, SourceId,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::client::{expand_template, resolve_url, CatalogClient};
use crate::error::CatalogError;
use crate::types::{
    BookDetailResponse, ChapterListResponse, ContentResponse, SearchResponse,
};

/// Identity and location of a JSON catalog
#[derive(Debug, Clone)]
pub struct JsonCatalogConfig {
    pub source_id: String,
    pub display_name: String,
    pub base_url: String,
}

impl JsonCatalogConfig {
    pub fn new(source_id: impl Into<String>, base_url: impl Into<String>) -> Self {
        let source_id = source_id.into();
        Self {
            display_name: source_id.clone(),
            source_id,
            base_url: base_url.into(),
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }
}

/// Catalog adapter over a JSON API.
///
/// # Example
///
/// ```ignore
/// use provider_catalog::{CatalogClient, JsonCatalogConfig, JsonCatalogSource};
///
/// let source = JsonCatalogSource::new(
///     JsonCatalogConfig::new("novels", "https://api.example.org/v1"),
///     CatalogClient::new(http_client),
/// );
/// let detail = source.fetch_detail("42").await?;
/// ```
pub struct JsonCatalogSource {
    config: JsonCatalogConfig,
    client: CatalogClient,
}

impl JsonCatalogSource {
    pub fn new(config: JsonCatalogConfig, client: CatalogClient) -> Self {
        Self { config, client }
    }

    /// Adapter with default retry and timeout settings.
    pub fn with_http_client(config: JsonCatalogConfig, http_client: Arc<dyn HttpClient>) -> Self {
        Self::new(config, CatalogClient::new(http_client))
    }

    fn url(&self, template: &str, vars: &[(&str, &str)]) -> String {
        expand_template(template, &self.config.base_url, vars)
    }

    /// Parse RFC 3339 timestamp to Unix millis
    fn parse_timestamp(rfc3339: &str) -> Option<i64> {
        DateTime::parse_from_rfc3339(rfc3339)
            .ok()
            .map(|dt| dt.with_timezone(&Utc).timestamp_millis())
    }

    fn convert_detail(&self, remote_key: &str, detail: BookDetailResponse) -> CanonicalBook {
        let mut book = CanonicalBook::new(remote_key);
        book.title = detail.title.into();
        book.author = detail.author.into();
        book.description = detail.description.into();
        book.cover_url = detail
            .cover_url
            .map(|cover| resolve_url(&self.config.base_url, &cover))
            .into();
        book.tags = detail.genres.into();
        // Unrecognized status strings carry no information
        book.status = detail
            .status
            .and_then(|status| status.parse::<BookStatus>().ok())
            .into();
        book.total_chapters = detail.chapter_count.into();
        book.last_update = detail
            .updated_at
            .as_deref()
            .and_then(Self::parse_timestamp)
            .into();
        book
    }

    fn convert_chapters(response: ChapterListResponse) -> Vec<CanonicalChapter> {
        response
            .chapters
            .into_iter()
            .map(|item| CanonicalChapter {
                remote_id: item.id,
                title: item.title.trim().to_string(),
                content_key: item.url,
                published_at: item
                    .published_at
                    .as_deref()
                    .and_then(Self::parse_timestamp)
                    .into(),
            })
            .collect()
    }

    fn convert_content(response: ContentResponse) -> ContentPayload {
        if !response.paragraphs.is_empty() {
            return ContentPayload::new(response.paragraphs);
        }
        let paragraphs = response
            .text
            .unwrap_or_default()
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        ContentPayload::new(paragraphs)
    }
}

#[async_trait]
impl CatalogSource for JsonCatalogSource {
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
            "{base}/search?q={query}&page={page}",
            &[("query", query), ("page", &page_str)],
        );

        let response: SearchResponse = self.client.get_json(&url).await?;
        let items: Vec<BookSummary> = response
            .items
            .into_iter()
            .map(|item| BookSummary {
                remote_key: item.id,
                title: item.title,
                cover_url: item
                    .cover_url
                    .map(|cover| resolve_url(&self.config.base_url, &cover)),
            })
            .collect();

        debug!("Search returned {} items", items.len());
        Ok(SearchPage {
            items,
            has_next_page: response.has_next_page,
        })
    }

    #[instrument(skip(self), fields(source = %self.config.source_id))]
    async fn fetch_detail(&self, remote_key: &str) -> FetchResult<CanonicalBook> {
        let url = self.url("{base}/books/{id}", &[("id", remote_key)]);
        let detail: BookDetailResponse = self.client.get_json(&url).await?;
        Ok(self.convert_detail(remote_key, detail))
    }

    #[instrument(skip(self), fields(source = %self.config.source_id))]
    async fn fetch_chapter_list(&self, remote_key: &str) -> FetchResult<Vec<CanonicalChapter>> {
        let url = self.url("{base}/books/{id}/chapters", &[("id", remote_key)]);
        let response: ChapterListResponse = self.client.get_json(&url).await?;
        let chapters = Self::convert_chapters(response);

        info!("Fetched {} chapters for {}", chapters.len(), remote_key);
        Ok(chapters)
    }

    #[instrument(skip(self), fields(source = %self.config.source_id))]
    async fn fetch_content(&self, content_key: &str) -> FetchResult<ContentPayload> {
        let url = resolve_url(&self.config.base_url, content_key);
        let response: ContentResponse = self.client.get_json(&url).await?;
        let content = Self::convert_content(response);

        if content.is_blank() {
            return Err(CatalogError::ParseError(format!("Empty chapter body at {}", url)).into());
        }
        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> JsonCatalogSource {
        struct Offline;

        #[async_trait]
        impl HttpClient for Offline {
            async fn execute(
                &self,
                _request: bridge_traits::http::HttpRequest,
            ) -> bridge_traits::error::Result<bridge_traits::http::HttpResponse> {
                Err(bridge_traits::error::BridgeError::NotAvailable(
                    "offline".to_string(),
                ))
            }
        }

        JsonCatalogSource::with_http_client(
            JsonCatalogConfig::new("novels", "https://api.example.org"),
            Arc::new(Offline),
        )
    }

    #[test]
    fn test_convert_detail_keeps_missing_fields_unknown() {
        let detail = BookDetailResponse {
            id: "42".to_string(),
            title: Some("The Long Road".to_string()),
            author: None,
            description: Some(String::new()),
            cover_url: Some("/covers/42.jpg".to_string()),
            genres: None,
            status: Some("Completed".to_string()),
            chapter_count: Some(120),
            updated_at: Some("2024-03-01T12:00:00Z".to_string()),
        };

        let book = source().convert_detail("42", detail);

        assert_eq!(book.remote_key, "42");
        assert_eq!(book.title, RemoteValue::Known("The Long Road".to_string()));
        assert_eq!(book.author, RemoteValue::Unknown);
        // An explicit empty value is still a known value
        assert_eq!(book.description, RemoteValue::Known(String::new()));
        assert_eq!(
            book.cover_url,
            RemoteValue::Known("https://api.example.org/covers/42.jpg".to_string())
        );
        assert_eq!(book.tags, RemoteValue::Unknown);
        assert_eq!(book.status, RemoteValue::Known(BookStatus::Completed));
        assert_eq!(book.total_chapters, RemoteValue::Known(120));
        assert_eq!(book.last_update, RemoteValue::Known(1_709_294_400_000));
    }

    #[test]
    fn test_unrecognized_status_is_unknown() {
        let detail = BookDetailResponse {
            id: "1".to_string(),
            status: Some("hiatus-ish".to_string()),
            ..Default::default()
        };

        let book = source().convert_detail("1", detail);
        assert_eq!(book.status, RemoteValue::Unknown);
    }

    #[test]
    fn test_convert_content_falls_back_to_text() {
        let content = JsonCatalogSource::convert_content(ContentResponse {
            paragraphs: Vec::new(),
            text: Some("First line\n\n  Second line  \n".to_string()),
        });

        assert_eq!(
            content.paragraphs,
            vec!["First line".to_string(), "Second line".to_string()]
        );
    }
}
