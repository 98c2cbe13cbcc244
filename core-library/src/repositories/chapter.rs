//! Chapter repository trait and implementation

use crate::error::{LibraryError, Result};
use crate::models::{
    BookId, Chapter, ChapterFilter, ChapterId, ChapterRemoteUpdate, ChapterRow, ChapterSort,
    NewChapter,
};
use async_trait::async_trait;
use bridge_traits::source::ContentPayload;
use sqlx::{query_as, QueryBuilder, Sqlite, SqlitePool, Transaction};

const CHAPTER_COLUMNS: &str = r#"
    id, book_id, match_key, remote_id, title, position, position_locked,
    content_key, published_at, read, bookmark, content, fetched_at
"#;

/// Chapter repository interface for data access operations
#[async_trait]
pub trait ChapterRepository: Send + Sync {
    async fn find_by_id(&self, id: ChapterId) -> Result<Option<Chapter>>;

    /// Chapters of a book, filtered and ordered by position
    async fn list(
        &self,
        book_id: BookId,
        filter: ChapterFilter,
        sort: ChapterSort,
    ) -> Result<Vec<Chapter>>;

    /// Insert chapters, skipping any whose match key already exists for the book
    ///
    /// # Returns
    /// Number of rows actually inserted
    async fn insert_missing(
        &self,
        book_id: BookId,
        chapters: &[NewChapter],
        fetched_at: i64,
    ) -> Result<u64>;

    /// Store downloaded content. A blank payload clears it.
    async fn save_content(&self, id: ChapterId, content: &ContentPayload) -> Result<()>;

    /// Mark chapters of a book read or unread
    async fn set_read(&self, book_id: BookId, ids: &[ChapterId], read: bool) -> Result<u64>;

    /// Set or clear the bookmark flag
    async fn set_bookmark(&self, book_id: BookId, ids: &[ChapterId], bookmark: bool)
        -> Result<u64>;

    /// Pin a chapter at `position`; later merges keep the position
    async fn move_to(&self, id: ChapterId, position: i64) -> Result<()>;

    /// Drop downloaded content of chapters, keeping the rows
    async fn clear_content(&self, book_id: BookId, ids: &[ChapterId]) -> Result<u64>;

    /// Delete chapter rows regardless of their local state
    async fn delete(&self, book_id: BookId, ids: &[ChapterId]) -> Result<u64>;

    async fn count(&self, book_id: BookId) -> Result<i64>;
}

/// SQLite implementation of ChapterRepository
#[derive(Clone)]
pub struct SqliteChapterRepository {
    pool: SqlitePool,
}

impl SqliteChapterRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn update_flag(
        &self,
        column: &str,
        book_id: BookId,
        ids: &[ChapterId],
        value: bool,
    ) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut builder = QueryBuilder::<Sqlite>::new(format!("UPDATE chapters SET {} = ", column));
        builder.push_bind(value);
        push_id_filter(&mut builder, book_id, ids);

        let result = builder.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}

fn push_id_filter(builder: &mut QueryBuilder<'_, Sqlite>, book_id: BookId, ids: &[ChapterId]) {
    builder.push(" WHERE book_id = ");
    builder.push_bind(book_id.0);
    builder.push(" AND id IN (");
    let mut separated = builder.separated(", ");
    for id in ids {
        separated.push_bind(id.0);
    }
    separated.push_unseparated(")");
}

fn encode_content(content: &ContentPayload) -> Result<Option<String>> {
    if content.is_blank() {
        return Ok(None);
    }
    serde_json::to_string(&content.paragraphs)
        .map(Some)
        .map_err(|e| LibraryError::InvalidInput {
            field: "content".to_string(),
            message: e.to_string(),
        })
}

#[async_trait]
impl ChapterRepository for SqliteChapterRepository {
    async fn find_by_id(&self, id: ChapterId) -> Result<Option<Chapter>> {
        let row = query_as::<_, ChapterRow>(&format!(
            "SELECT {} FROM chapters WHERE id = ?",
            CHAPTER_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Chapter::try_from).transpose()
    }

    async fn list(
        &self,
        book_id: BookId,
        filter: ChapterFilter,
        sort: ChapterSort,
    ) -> Result<Vec<Chapter>> {
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {} FROM chapters WHERE book_id = ",
            CHAPTER_COLUMNS
        ));
        builder.push_bind(book_id.0);

        if filter.unread_only {
            builder.push(" AND read = 0");
        }
        if filter.bookmarked_only {
            builder.push(" AND bookmark = 1");
        }
        if filter.downloaded_only {
            builder.push(" AND content IS NOT NULL");
        }

        builder.push(match sort {
            ChapterSort::Ascending => " ORDER BY position ASC, id ASC",
            ChapterSort::Descending => " ORDER BY position DESC, id DESC",
        });

        let rows = builder
            .build_query_as::<ChapterRow>()
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Chapter::try_from).collect()
    }

    async fn insert_missing(
        &self,
        book_id: BookId,
        chapters: &[NewChapter],
        fetched_at: i64,
    ) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let inserted = insert_chapters(&mut tx, book_id, chapters, fetched_at).await?;
        tx.commit().await?;
        Ok(inserted)
    }

    async fn save_content(&self, id: ChapterId, content: &ContentPayload) -> Result<()> {
        let encoded = encode_content(content)?;

        let result = sqlx::query("UPDATE chapters SET content = ? WHERE id = ?")
            .bind(encoded)
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(LibraryError::not_found("Chapter", id));
        }

        Ok(())
    }

    async fn set_read(&self, book_id: BookId, ids: &[ChapterId], read: bool) -> Result<u64> {
        self.update_flag("read", book_id, ids, read).await
    }

    async fn set_bookmark(
        &self,
        book_id: BookId,
        ids: &[ChapterId],
        bookmark: bool,
    ) -> Result<u64> {
        self.update_flag("bookmark", book_id, ids, bookmark).await
    }

    async fn move_to(&self, id: ChapterId, position: i64) -> Result<()> {
        let result =
            sqlx::query("UPDATE chapters SET position = ?, position_locked = 1 WHERE id = ?")
                .bind(position)
                .bind(id)
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(LibraryError::not_found("Chapter", id));
        }

        Ok(())
    }

    async fn clear_content(&self, book_id: BookId, ids: &[ChapterId]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut builder = QueryBuilder::<Sqlite>::new("UPDATE chapters SET content = NULL");
        push_id_filter(&mut builder, book_id, ids);
        builder.push(" AND content IS NOT NULL");

        let result = builder.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn delete(&self, book_id: BookId, ids: &[ChapterId]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut builder = QueryBuilder::<Sqlite>::new("DELETE FROM chapters");
        push_id_filter(&mut builder, book_id, ids);

        let result = builder.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn count(&self, book_id: BookId) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM chapters WHERE book_id = ?")
            .bind(book_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }
}

// ============================================================================
// Transactional helpers used by merges
// ============================================================================

pub(crate) async fn insert_chapters(
    tx: &mut Transaction<'_, Sqlite>,
    book_id: BookId,
    chapters: &[NewChapter],
    fetched_at: i64,
) -> Result<u64> {
    let mut inserted = 0;

    for chapter in chapters {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO chapters (
                book_id, match_key, remote_id, title, position,
                content_key, published_at, fetched_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(book_id)
        .bind(&chapter.match_key)
        .bind(&chapter.remote_id)
        .bind(&chapter.title)
        .bind(chapter.position)
        .bind(&chapter.content_key)
        .bind(chapter.published_at)
        .bind(fetched_at)
        .execute(&mut **tx)
        .await?;

        inserted += result.rows_affected();
    }

    Ok(inserted)
}

/// Apply remote values to existing chapters of `book_id`. Local-only columns
/// (read, bookmark, content, fetched_at) are never touched.
pub(crate) async fn update_remote_fields(
    tx: &mut Transaction<'_, Sqlite>,
    book_id: BookId,
    updates: &[ChapterRemoteUpdate],
) -> Result<u64> {
    let mut updated = 0;

    // Keys may move between rows within one merge; release them first so the
    // per-book uniqueness constraint holds after every statement.
    for update in updates {
        sqlx::query("UPDATE chapters SET match_key = '~' || id WHERE id = ? AND book_id = ?")
            .bind(update.id)
            .bind(book_id)
            .execute(&mut **tx)
            .await?;
    }

    for update in updates {
        let result = sqlx::query(
            r#"
            UPDATE chapters SET
                match_key = ?, remote_id = ?, title = ?,
                position = CASE WHEN position_locked = 1 THEN position ELSE COALESCE(?, position) END,
                content_key = ?, published_at = ?
            WHERE id = ? AND book_id = ?
            "#,
        )
        .bind(&update.match_key)
        .bind(&update.remote_id)
        .bind(&update.title)
        .bind(update.position)
        .bind(&update.content_key)
        .bind(update.published_at)
        .bind(update.id)
        .bind(book_id)
        .execute(&mut **tx)
        .await?;

        updated += result.rows_affected();
    }

    Ok(updated)
}

/// Delete chapters that carry no user state. Bookmarked or downloaded
/// chapters are skipped even if listed.
pub(crate) async fn delete_unattached(
    tx: &mut Transaction<'_, Sqlite>,
    book_id: BookId,
    ids: &[ChapterId],
) -> Result<u64> {
    if ids.is_empty() {
        return Ok(0);
    }

    let mut builder = QueryBuilder::<Sqlite>::new("DELETE FROM chapters");
    push_id_filter(&mut builder, book_id, ids);
    builder.push(" AND bookmark = 0 AND content IS NULL");

    let result = builder.build().execute(&mut **tx).await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_test_pool;
    use crate::models::NewBook;
    use crate::repositories::{BookRepository, SqliteBookRepository};

    fn new_chapter(key: &str, position: i64) -> NewChapter {
        NewChapter {
            match_key: key.to_string(),
            remote_id: None,
            title: key.to_uppercase(),
            position,
            content_key: format!("/c/{}", key),
            published_at: None,
        }
    }

    async fn setup() -> (SqliteChapterRepository, BookId) {
        let pool = create_test_pool().await.unwrap();
        let book_id = SqliteBookRepository::new(pool.clone())
            .insert_or_get(&NewBook::new("catalog", "b-1", "Book"))
            .await
            .unwrap();
        (SqliteChapterRepository::new(pool), book_id)
    }

    #[tokio::test]
    async fn test_insert_missing_skips_existing_keys() {
        let (repo, book_id) = setup().await;

        let inserted = repo
            .insert_missing(book_id, &[new_chapter("a", 0), new_chapter("b", 1)], 10)
            .await
            .unwrap();
        assert_eq!(inserted, 2);

        let inserted = repo
            .insert_missing(book_id, &[new_chapter("b", 5), new_chapter("c", 2)], 20)
            .await
            .unwrap();
        assert_eq!(inserted, 1);
        assert_eq!(repo.count(book_id).await.unwrap(), 3);

        let chapters = repo
            .list(book_id, ChapterFilter::default(), ChapterSort::Ascending)
            .await
            .unwrap();
        let keys: Vec<_> = chapters.iter().map(|c| c.match_key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
        assert_eq!(chapters[1].fetched_at, 10);
    }

    #[tokio::test]
    async fn test_filters_and_sort() {
        let (repo, book_id) = setup().await;
        repo.insert_missing(
            book_id,
            &[new_chapter("a", 0), new_chapter("b", 1), new_chapter("c", 2)],
            0,
        )
        .await
        .unwrap();
        let chapters = repo
            .list(book_id, ChapterFilter::default(), ChapterSort::Descending)
            .await
            .unwrap();
        assert_eq!(chapters[0].match_key, "c");

        let (a, b, c) = (chapters[2].id, chapters[1].id, chapters[0].id);
        repo.set_read(book_id, &[a], true).await.unwrap();
        repo.set_bookmark(book_id, &[b], true).await.unwrap();
        repo.save_content(c, &ContentPayload::new(vec!["text".to_string()]))
            .await
            .unwrap();

        let unread = repo
            .list(
                book_id,
                ChapterFilter {
                    unread_only: true,
                    ..Default::default()
                },
                ChapterSort::Ascending,
            )
            .await
            .unwrap();
        assert_eq!(unread.len(), 2);

        let bookmarked = repo
            .list(
                book_id,
                ChapterFilter {
                    bookmarked_only: true,
                    ..Default::default()
                },
                ChapterSort::Ascending,
            )
            .await
            .unwrap();
        assert_eq!(bookmarked.len(), 1);
        assert_eq!(bookmarked[0].id, b);

        let downloaded = repo
            .list(
                book_id,
                ChapterFilter {
                    downloaded_only: true,
                    ..Default::default()
                },
                ChapterSort::Ascending,
            )
            .await
            .unwrap();
        assert_eq!(downloaded.len(), 1);
        assert!(downloaded[0].has_content());
    }

    #[tokio::test]
    async fn test_blank_content_is_not_stored() {
        let (repo, book_id) = setup().await;
        repo.insert_missing(book_id, &[new_chapter("a", 0)], 0)
            .await
            .unwrap();
        let id = repo
            .list(book_id, ChapterFilter::default(), ChapterSort::Ascending)
            .await
            .unwrap()[0]
            .id;

        repo.save_content(id, &ContentPayload::new(vec![" ".to_string()]))
            .await
            .unwrap();
        let chapter = repo.find_by_id(id).await.unwrap().unwrap();
        assert!(chapter.content.is_none());
    }

    #[tokio::test]
    async fn test_delete_unattached_keeps_user_state() {
        let (repo, book_id) = setup().await;
        repo.insert_missing(
            book_id,
            &[new_chapter("a", 0), new_chapter("b", 1), new_chapter("c", 2)],
            0,
        )
        .await
        .unwrap();
        let chapters = repo
            .list(book_id, ChapterFilter::default(), ChapterSort::Ascending)
            .await
            .unwrap();
        let ids: Vec<_> = chapters.iter().map(|c| c.id).collect();
        repo.set_bookmark(book_id, &ids[1..2], true).await.unwrap();
        repo.save_content(ids[2], &ContentPayload::new(vec!["x".to_string()]))
            .await
            .unwrap();

        let mut tx = repo.pool.begin().await.unwrap();
        let deleted = delete_unattached(&mut tx, book_id, &ids).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(deleted, 1);
        assert_eq!(repo.count(book_id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_locked_position_survives_update() {
        let (repo, book_id) = setup().await;
        repo.insert_missing(book_id, &[new_chapter("a", 0)], 0)
            .await
            .unwrap();
        let id = repo
            .list(book_id, ChapterFilter::default(), ChapterSort::Ascending)
            .await
            .unwrap()[0]
            .id;
        repo.move_to(id, 7).await.unwrap();

        let mut tx = repo.pool.begin().await.unwrap();
        update_remote_fields(
            &mut tx,
            book_id,
            &[ChapterRemoteUpdate {
                id,
                match_key: "a".to_string(),
                remote_id: Some("r-a".to_string()),
                title: "Renamed".to_string(),
                position: Some(0),
                content_key: "/c/a".to_string(),
                published_at: None,
            }],
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let chapter = repo.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(chapter.position, 7);
        assert_eq!(chapter.title, "Renamed");
        assert_eq!(chapter.remote_id.as_deref(), Some("r-a"));
    }
}
