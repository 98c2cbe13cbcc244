//! # Repository Pattern Implementation
//!
//! Repository traits and their SQLite implementations.
//!
//! ## Architecture
//!
//! - Traits define the interface for each repository
//! - SQLite implementations use sqlx for async database access
//! - Writes that must land together (merges) are exposed as crate-private
//!   helpers taking an open transaction
//!
//! ## Available Repositories
//!
//! - `BookRepository` - Books and their library membership
//! - `ChapterRepository` - Chapters with read/bookmark/download state
//! - `HistoryRepository` - Last chapter read per book

pub mod book;
pub mod chapter;
pub mod history;

pub use book::{BookRepository, SqliteBookRepository};
pub use chapter::{ChapterRepository, SqliteChapterRepository};
pub use history::{HistoryRepository, SqliteHistoryRepository};
