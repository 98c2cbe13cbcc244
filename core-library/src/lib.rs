//! # Library Module
//!
//! Owns the local book library database: books, chapters, reading history
//! and persisted download jobs.
//!
//! ## Overview
//!
//! - SQLite schema, pooling and migrations (`db`)
//! - Repository traits with SQLite implementations (`repositories`)
//! - The [`LocalStore`] port used by sync and downloads, with atomic merges
//!   and change subscriptions (`store`)

pub mod db;
pub mod error;
pub mod models;
pub mod repositories;
pub mod store;

pub use error::{LibraryError, Result};
pub use models::{
    normalize_title, Book, BookId, Chapter, ChapterChanges, ChapterFilter, ChapterId,
    ChapterRemoteUpdate, ChapterSort, History, MergeSummary, NewBook, NewChapter,
};
pub use store::{LocalStore, SqliteLocalStore, StoreChange};
