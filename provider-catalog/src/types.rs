//! JSON catalog API response types
//!
//! Every field the catalog may leave out is optional here. Conversion into the
//! canonical model turns an absent field into `RemoteValue::Unknown`, never into
//! an empty default.

use serde::{Deserialize, Serialize};

/// `GET {base}/search` response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    #[serde(default)]
    pub items: Vec<BookListItem>,

    #[serde(default)]
    pub has_next_page: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookListItem {
    /// Book key within the catalog
    pub id: String,

    pub title: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cover_url: Option<String>,
}

/// `GET {base}/books/{id}` response
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookDetailResponse {
    pub id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cover_url: Option<String>,

    /// Genres or tags, absent when the catalog does not categorize
    #[serde(skip_serializing_if = "Option::is_none")]
    pub genres: Option<Vec<String>>,

    /// Free-form status string ("ongoing", "completed", ...)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub chapter_count: Option<u32>,

    /// Last update (RFC 3339)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

/// `GET {base}/books/{id}/chapters` response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChapterListResponse {
    pub chapters: Vec<ChapterItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChapterItem {
    /// Stable chapter id, when exposed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    pub title: String,

    /// Path or URL of the chapter body
    pub url: String,

    /// Publication time (RFC 3339)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_at: Option<String>,
}

/// `GET {base}/{content key}` response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentResponse {
    /// Body split into paragraphs
    #[serde(default)]
    pub paragraphs: Vec<String>,

    /// Body as a single text blob, used when `paragraphs` is empty
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}
