//! Library domain models
//!
//! Books and chapters as persisted locally. Remote-derived fields are written
//! by merges; local-only fields (favorite, date added, read, bookmark,
//! downloaded content) are written by user actions and by the download
//! scheduler only.

use bridge_traits::source::{BookStatus, ContentPayload};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;

use crate::error::{LibraryError, Result};

// ============================================================================
// ID Types
// ============================================================================

/// Local surrogate id of a book
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(transparent)]
pub struct BookId(pub i64);

impl fmt::Display for BookId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Local surrogate id of a chapter
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(transparent)]
pub struct ChapterId(pub i64);

impl fmt::Display for ChapterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Comparison form of a title: trimmed, inner whitespace collapsed, case-folded.
///
/// Only used for matching; stored titles keep their original casing.
pub fn normalize_title(title: &str) -> String {
    title
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

// ============================================================================
// Book
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Book {
    pub id: BookId,
    /// Catalog the book comes from
    pub source_id: String,
    /// Key of the book within its catalog
    pub remote_key: String,
    pub title: String,
    pub author: Option<String>,
    pub description: Option<String>,
    pub cover_url: Option<String>,
    pub tags: Vec<String>,
    pub status: BookStatus,
    pub total_chapters: i64,
    /// Last remote update, Unix millis
    pub last_update: Option<i64>,
    /// In the user's library
    pub favorite: bool,
    /// When the book entered the library, Unix millis
    pub date_added: Option<i64>,
    /// Last successful refresh cycle, Unix millis
    pub last_fetch: Option<i64>,
}

impl Book {
    /// Never refreshed, or refreshed without yielding any chapter.
    pub fn is_stale(&self) -> bool {
        self.last_fetch.is_none() || self.total_chapters < 1
    }
}

/// Values needed to create a book row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBook {
    pub source_id: String,
    pub remote_key: String,
    pub title: String,
    pub cover_url: Option<String>,
    pub favorite: bool,
    pub date_added: Option<i64>,
}

impl NewBook {
    pub fn new(
        source_id: impl Into<String>,
        remote_key: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            remote_key: remote_key.into(),
            title: title.into(),
            cover_url: None,
            favorite: false,
            date_added: None,
        }
    }

    pub fn in_library(mut self, date_added: i64) -> Self {
        self.favorite = true;
        self.date_added = Some(date_added);
        self
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct BookRow {
    pub id: i64,
    pub source_id: String,
    pub remote_key: String,
    pub title: String,
    pub author: Option<String>,
    pub description: Option<String>,
    pub cover_url: Option<String>,
    pub tags: String,
    pub status: String,
    pub total_chapters: i64,
    pub last_update: Option<i64>,
    pub favorite: bool,
    pub date_added: Option<i64>,
    pub last_fetch: Option<i64>,
}

impl TryFrom<BookRow> for Book {
    type Error = LibraryError;

    fn try_from(row: BookRow) -> Result<Self> {
        let tags: Vec<String> = serde_json::from_str(&row.tags).map_err(|e| {
            LibraryError::InvalidInput {
                field: "tags".to_string(),
                message: e.to_string(),
            }
        })?;
        let status = row
            .status
            .parse::<BookStatus>()
            .map_err(|message| LibraryError::InvalidInput {
                field: "status".to_string(),
                message,
            })?;

        Ok(Book {
            id: BookId(row.id),
            source_id: row.source_id,
            remote_key: row.remote_key,
            title: row.title,
            author: row.author,
            description: row.description,
            cover_url: row.cover_url,
            tags,
            status,
            total_chapters: row.total_chapters,
            last_update: row.last_update,
            favorite: row.favorite,
            date_added: row.date_added,
            last_fetch: row.last_fetch,
        })
    }
}

// ============================================================================
// Chapter
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chapter {
    pub id: ChapterId,
    pub book_id: BookId,
    /// Identity within the book; unique per book
    pub match_key: String,
    pub remote_id: Option<String>,
    pub title: String,
    /// Remote-reported order unless `position_locked`
    pub position: i64,
    /// Set when the user reordered the chapter manually
    pub position_locked: bool,
    pub content_key: String,
    pub published_at: Option<i64>,
    pub read: bool,
    pub bookmark: bool,
    pub content: Option<ContentPayload>,
    /// First time the chapter was seen remotely, Unix millis
    pub fetched_at: i64,
}

impl Chapter {
    /// A payload is stored. Blank payloads are never written, so this agrees
    /// with `content IS NOT NULL`.
    pub fn has_content(&self) -> bool {
        self.content.is_some()
    }

    /// Carries state the user attached; never removed implicitly.
    pub fn has_user_state(&self) -> bool {
        self.bookmark || self.has_content()
    }
}

/// A chapter about to be inserted. Local-only fields start at their defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewChapter {
    pub match_key: String,
    pub remote_id: Option<String>,
    pub title: String,
    pub position: i64,
    pub content_key: String,
    pub published_at: Option<i64>,
}

/// Remote-derived values written onto an existing chapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterRemoteUpdate {
    pub id: ChapterId,
    pub match_key: String,
    pub remote_id: Option<String>,
    pub title: String,
    /// `None` keeps the stored position (manual reorder)
    pub position: Option<i64>,
    pub content_key: String,
    pub published_at: Option<i64>,
}

/// Chapter writes of one merge, applied in a single transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChapterChanges {
    pub inserts: Vec<NewChapter>,
    pub updates: Vec<ChapterRemoteUpdate>,
    pub deletes: Vec<ChapterId>,
}

impl ChapterChanges {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }
}

/// Row counts of a committed merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub inserted: u64,
    pub updated: u64,
    pub deleted: u64,
}

#[derive(Debug, FromRow)]
pub(crate) struct ChapterRow {
    pub id: i64,
    pub book_id: i64,
    pub match_key: String,
    pub remote_id: Option<String>,
    pub title: String,
    pub position: i64,
    pub position_locked: bool,
    pub content_key: String,
    pub published_at: Option<i64>,
    pub read: bool,
    pub bookmark: bool,
    pub content: Option<String>,
    pub fetched_at: i64,
}

impl TryFrom<ChapterRow> for Chapter {
    type Error = LibraryError;

    fn try_from(row: ChapterRow) -> Result<Self> {
        let content = row
            .content
            .map(|raw| {
                serde_json::from_str::<Vec<String>>(&raw).map_err(|e| LibraryError::InvalidInput {
                    field: "content".to_string(),
                    message: e.to_string(),
                })
            })
            .transpose()?
            .map(ContentPayload::new);

        Ok(Chapter {
            id: ChapterId(row.id),
            book_id: BookId(row.book_id),
            match_key: row.match_key,
            remote_id: row.remote_id,
            title: row.title,
            position: row.position,
            position_locked: row.position_locked,
            content_key: row.content_key,
            published_at: row.published_at,
            read: row.read,
            bookmark: row.bookmark,
            content,
            fetched_at: row.fetched_at,
        })
    }
}

/// Narrow a chapter listing. Unset flags do not filter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterFilter {
    pub unread_only: bool,
    pub bookmarked_only: bool,
    pub downloaded_only: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChapterSort {
    #[default]
    Ascending,
    Descending,
}

// ============================================================================
// History
// ============================================================================

/// Last chapter opened for a book.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct History {
    pub book_id: BookId,
    pub chapter_id: ChapterId,
    /// Unix millis
    pub read_at: i64,
}
