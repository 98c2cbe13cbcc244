//! Remote Catalog Abstractions
//!
//! A *source* is one remote catalog of books. Adapters translate the catalog's
//! native payloads into the canonical shapes defined here; the sync core never
//! sees anything else.
//!
//! Two adapter capabilities exist:
//!
//! - [`CatalogSource`]: search, book detail, chapter list and chapter content.
//! - [`PageSource`]: everything a catalog source does, plus retrieval of raw
//!   pages and parsing of a page that was obtained elsewhere (for example a
//!   page rendered by a host web view).
//!
//! [`SourceAdapter`] is the closed set of variants the registry stores. Callers
//! dispatch through it instead of inspecting concrete adapter types.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// Identity
// ============================================================================

/// Identifier of a remote catalog, unique within a registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(String);

impl SourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SourceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

// ============================================================================
// Canonical model
// ============================================================================

/// A remote-derived value that the adapter may not have been able to supply.
///
/// `Unknown` means "the remote gave us nothing", which is different from
/// `Known(String::new())`, where the remote explicitly reports an empty value.
/// Merges overwrite local data with `Known` values and leave it untouched for
/// `Unknown` ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "value", rename_all = "snake_case")]
pub enum RemoteValue<T> {
    Unknown,
    Known(T),
}

impl<T> Default for RemoteValue<T> {
    fn default() -> Self {
        RemoteValue::Unknown
    }
}

impl<T> RemoteValue<T> {
    pub fn is_known(&self) -> bool {
        matches!(self, RemoteValue::Known(_))
    }

    pub fn as_known(&self) -> Option<&T> {
        match self {
            RemoteValue::Known(value) => Some(value),
            RemoteValue::Unknown => None,
        }
    }

    pub fn into_option(self) -> Option<T> {
        match self {
            RemoteValue::Known(value) => Some(value),
            RemoteValue::Unknown => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> RemoteValue<U> {
        match self {
            RemoteValue::Known(value) => RemoteValue::Known(f(value)),
            RemoteValue::Unknown => RemoteValue::Unknown,
        }
    }

    /// Remote value when known, otherwise the current local value.
    pub fn or_keep(self, local: T) -> T {
        match self {
            RemoteValue::Known(value) => value,
            RemoteValue::Unknown => local,
        }
    }
}

impl<T> From<Option<T>> for RemoteValue<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(value) => RemoteValue::Known(value),
            None => RemoteValue::Unknown,
        }
    }
}

/// Publication status reported by a catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BookStatus {
    Ongoing,
    Completed,
    #[default]
    Unknown,
}

impl BookStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookStatus::Ongoing => "ongoing",
            BookStatus::Completed => "completed",
            BookStatus::Unknown => "unknown",
        }
    }
}

impl FromStr for BookStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ongoing" | "publishing" => Ok(BookStatus::Ongoing),
            "completed" | "complete" | "finished" => Ok(BookStatus::Completed),
            "unknown" | "" => Ok(BookStatus::Unknown),
            other => Err(format!("Invalid book status: {}", other)),
        }
    }
}

impl fmt::Display for BookStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Book detail as produced by an adapter.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CanonicalBook {
    /// Key of the book within its source
    pub remote_key: String,
    pub title: RemoteValue<String>,
    pub author: RemoteValue<String>,
    pub description: RemoteValue<String>,
    pub cover_url: RemoteValue<String>,
    pub tags: RemoteValue<Vec<String>>,
    pub status: RemoteValue<BookStatus>,
    /// Chapter count as advertised on the detail page
    pub total_chapters: RemoteValue<u32>,
    /// Last remote update, Unix millis
    pub last_update: RemoteValue<i64>,
}

impl CanonicalBook {
    pub fn new(remote_key: impl Into<String>) -> Self {
        Self {
            remote_key: remote_key.into(),
            ..Default::default()
        }
    }
}

/// One entry of a fetched chapter list.
///
/// The chapter's ordinal is its index in the list returned by the adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalChapter {
    /// Stable id, when the catalog exposes one
    pub remote_id: Option<String>,
    pub title: String,
    /// Key passed back to `fetch_content`
    pub content_key: String,
    /// Remote publication time, Unix millis
    pub published_at: RemoteValue<i64>,
}

impl CanonicalChapter {
    pub fn new(title: impl Into<String>, content_key: impl Into<String>) -> Self {
        Self {
            remote_id: None,
            title: title.into(),
            content_key: content_key.into(),
            published_at: RemoteValue::Unknown,
        }
    }

    pub fn with_remote_id(mut self, id: impl Into<String>) -> Self {
        self.remote_id = Some(id.into());
        self
    }
}

/// Downloaded body of a chapter.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContentPayload {
    pub paragraphs: Vec<String>,
}

impl ContentPayload {
    pub fn new(paragraphs: Vec<String>) -> Self {
        Self { paragraphs }
    }

    /// True when there is no visible text at all.
    pub fn is_blank(&self) -> bool {
        self.paragraphs.iter().all(|p| p.trim().is_empty())
    }
}

/// Lightweight listing entry returned by search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookSummary {
    pub remote_key: String,
    pub title: String,
    pub cover_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SearchPage {
    pub items: Vec<BookSummary>,
    pub has_next_page: bool,
}

/// Raw page body as retrieved from (or handed over for) a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPage {
    pub url: String,
    pub body: String,
}

impl RawPage {
    pub fn new(url: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            body: body.into(),
        }
    }
}

/// Everything a single page yielded. A chapter index page may carry no
/// book detail, a detail page may carry no chapters.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PageSnapshot {
    pub book: Option<CanonicalBook>,
    pub chapters: Vec<CanonicalChapter>,
}

// ============================================================================
// Errors
// ============================================================================

/// Failure kinds an adapter can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchErrorKind {
    Network,
    NotFound,
    ParseFailure,
    RateLimited,
    Unknown,
}

impl FetchErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchErrorKind::Network => "network",
            FetchErrorKind::NotFound => "not_found",
            FetchErrorKind::ParseFailure => "parse_failure",
            FetchErrorKind::RateLimited => "rate_limited",
            FetchErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Failed to parse response: {0}")]
    ParseFailure(String),

    #[error("Rate limited by source")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Source error: {0}")]
    Unknown(String),
}

impl FetchError {
    pub fn kind(&self) -> FetchErrorKind {
        match self {
            FetchError::Network(_) => FetchErrorKind::Network,
            FetchError::NotFound(_) => FetchErrorKind::NotFound,
            FetchError::ParseFailure(_) => FetchErrorKind::ParseFailure,
            FetchError::RateLimited { .. } => FetchErrorKind::RateLimited,
            FetchError::Unknown(_) => FetchErrorKind::Unknown,
        }
    }

    /// Error used when a call exceeds its time budget.
    pub fn timed_out(after: Duration) -> Self {
        FetchError::Network(format!("call timed out after {:?}", after))
    }
}

pub type FetchResult<T> = std::result::Result<T, FetchError>;

// ============================================================================
// Adapter traits
// ============================================================================

/// Metadata adapter for one remote catalog.
///
/// Every call is independent: implementations keep no state between calls
/// that would change the outcome of a later one. Callers may drop a call's
/// future at any point to cancel it.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// Identifier this adapter registers under
    fn source_id(&self) -> SourceId;

    /// Human-readable catalog name
    fn display_name(&self) -> String {
        self.source_id().to_string()
    }

    /// Search or list books. `page` is 1-based.
    async fn search(&self, query: &str, page: u32) -> FetchResult<SearchPage>;

    async fn fetch_detail(&self, remote_key: &str) -> FetchResult<CanonicalBook>;

    /// Chapters in remote order
    async fn fetch_chapter_list(&self, remote_key: &str) -> FetchResult<Vec<CanonicalChapter>>;

    async fn fetch_content(&self, content_key: &str) -> FetchResult<ContentPayload>;
}

/// HTTP-content adapter: can also retrieve and interpret raw pages.
#[async_trait]
pub trait PageSource: CatalogSource {
    async fn fetch_page(&self, url: &str) -> FetchResult<RawPage>;

    /// Interpret a page that may have been captured outside the adapter.
    fn parse_page(&self, page: &RawPage) -> FetchResult<PageSnapshot>;
}

/// Registered adapter, one variant per capability set.
#[derive(Clone)]
pub enum SourceAdapter {
    Metadata(Arc<dyn CatalogSource>),
    Http(Arc<dyn PageSource>),
}

impl SourceAdapter {
    pub fn source_id(&self) -> SourceId {
        match self {
            SourceAdapter::Metadata(source) => source.source_id(),
            SourceAdapter::Http(source) => source.source_id(),
        }
    }

    pub fn display_name(&self) -> String {
        match self {
            SourceAdapter::Metadata(source) => source.display_name(),
            SourceAdapter::Http(source) => source.display_name(),
        }
    }

    pub async fn search(&self, query: &str, page: u32) -> FetchResult<SearchPage> {
        match self {
            SourceAdapter::Metadata(source) => source.search(query, page).await,
            SourceAdapter::Http(source) => source.search(query, page).await,
        }
    }

    pub async fn fetch_detail(&self, remote_key: &str) -> FetchResult<CanonicalBook> {
        match self {
            SourceAdapter::Metadata(source) => source.fetch_detail(remote_key).await,
            SourceAdapter::Http(source) => source.fetch_detail(remote_key).await,
        }
    }

    pub async fn fetch_chapter_list(
        &self,
        remote_key: &str,
    ) -> FetchResult<Vec<CanonicalChapter>> {
        match self {
            SourceAdapter::Metadata(source) => source.fetch_chapter_list(remote_key).await,
            SourceAdapter::Http(source) => source.fetch_chapter_list(remote_key).await,
        }
    }

    pub async fn fetch_content(&self, content_key: &str) -> FetchResult<ContentPayload> {
        match self {
            SourceAdapter::Metadata(source) => source.fetch_content(content_key).await,
            SourceAdapter::Http(source) => source.fetch_content(content_key).await,
        }
    }

    /// Page capability, only present on the HTTP-content variant.
    pub fn page_source(&self) -> Option<&Arc<dyn PageSource>> {
        match self {
            SourceAdapter::Http(source) => Some(source),
            SourceAdapter::Metadata(_) => None,
        }
    }
}

impl fmt::Debug for SourceAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let variant = match self {
            SourceAdapter::Metadata(_) => "Metadata",
            SourceAdapter::Http(_) => "Http",
        };
        f.debug_struct("SourceAdapter")
            .field("variant", &variant)
            .field("source_id", &self.source_id())
            .finish()
    }
}
