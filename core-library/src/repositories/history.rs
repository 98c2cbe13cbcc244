//! Reading history repository

use crate::error::Result;
use crate::models::{BookId, ChapterId, History};
use async_trait::async_trait;
use sqlx::SqlitePool;

#[async_trait]
pub trait HistoryRepository: Send + Sync {
    /// Record `chapter_id` as the last chapter opened for `book_id`
    async fn record(&self, book_id: BookId, chapter_id: ChapterId, read_at: i64) -> Result<()>;

    async fn last_read(&self, book_id: BookId) -> Result<Option<History>>;
}

/// SQLite implementation of HistoryRepository
#[derive(Clone)]
pub struct SqliteHistoryRepository {
    pool: SqlitePool,
}

impl SqliteHistoryRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl HistoryRepository for SqliteHistoryRepository {
    async fn record(&self, book_id: BookId, chapter_id: ChapterId, read_at: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO history (book_id, chapter_id, read_at) VALUES (?, ?, ?)
            ON CONFLICT(book_id) DO UPDATE SET
                chapter_id = excluded.chapter_id,
                read_at = excluded.read_at
            "#,
        )
        .bind(book_id)
        .bind(chapter_id)
        .bind(read_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn last_read(&self, book_id: BookId) -> Result<Option<History>> {
        let history = sqlx::query_as::<_, History>(
            "SELECT book_id, chapter_id, read_at FROM history WHERE book_id = ?",
        )
        .bind(book_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(history)
    }
}
