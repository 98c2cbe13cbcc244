//! Book repository trait and implementation

use crate::error::{LibraryError, Result};
use crate::models::{normalize_title, Book, BookId, BookRow, NewBook};
use async_trait::async_trait;
use sqlx::{query_as, Sqlite, SqlitePool, Transaction};

const BOOK_COLUMNS: &str = r#"
    id, source_id, remote_key, title, author, description, cover_url, tags,
    status, total_chapters, last_update, favorite, date_added, last_fetch
"#;

/// Book repository interface for data access operations
#[async_trait]
pub trait BookRepository: Send + Sync {
    /// Find a book by its local id
    async fn find_by_id(&self, id: BookId) -> Result<Option<Book>>;

    /// Find a book by its catalog identity
    async fn find_by_remote(&self, source_id: &str, remote_key: &str) -> Result<Option<Book>>;

    /// Find a library book from another entry with the same normalized title
    ///
    /// # Arguments
    /// * `title` - Title to compare, normalized before comparison
    /// * `exclude` - Book to leave out of the comparison (usually the caller)
    async fn find_duplicate(&self, title: &str, exclude: Option<BookId>) -> Result<Option<Book>>;

    /// Insert a book unless one with the same catalog identity exists
    ///
    /// # Returns
    /// Id of the new or already-stored book
    async fn insert_or_get(&self, book: &NewBook) -> Result<BookId>;

    /// Set the library flag. Entering the library stamps `date_added`.
    ///
    /// # Errors
    /// Returns `NotFound` if the book does not exist
    async fn set_favorite(&self, id: BookId, favorite: bool, now: i64) -> Result<()>;

    /// Books in the user's library, most recently added first
    async fn library(&self) -> Result<Vec<Book>>;

    /// Delete a book and, through cascades, its chapters
    async fn delete(&self, id: BookId) -> Result<bool>;
}

/// SQLite implementation of BookRepository
#[derive(Clone)]
pub struct SqliteBookRepository {
    pool: SqlitePool,
}

impl SqliteBookRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BookRepository for SqliteBookRepository {
    async fn find_by_id(&self, id: BookId) -> Result<Option<Book>> {
        let row = query_as::<_, BookRow>(&format!(
            "SELECT {} FROM books WHERE id = ?",
            BOOK_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Book::try_from).transpose()
    }

    async fn find_by_remote(&self, source_id: &str, remote_key: &str) -> Result<Option<Book>> {
        let row = query_as::<_, BookRow>(&format!(
            "SELECT {} FROM books WHERE source_id = ? AND remote_key = ?",
            BOOK_COLUMNS
        ))
        .bind(source_id)
        .bind(remote_key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Book::try_from).transpose()
    }

    async fn find_duplicate(&self, title: &str, exclude: Option<BookId>) -> Result<Option<Book>> {
        let row = query_as::<_, BookRow>(&format!(
            r#"
            SELECT {} FROM books
            WHERE title_key = ? AND favorite = 1 AND id != ?
            ORDER BY date_added ASC
            LIMIT 1
            "#,
            BOOK_COLUMNS
        ))
        .bind(normalize_title(title))
        .bind(exclude.map(|id| id.0).unwrap_or(-1))
        .fetch_optional(&self.pool)
        .await?;

        row.map(Book::try_from).transpose()
    }

    async fn insert_or_get(&self, book: &NewBook) -> Result<BookId> {
        if book.remote_key.trim().is_empty() {
            return Err(LibraryError::InvalidInput {
                field: "remote_key".to_string(),
                message: "Remote key cannot be empty".to_string(),
            });
        }

        sqlx::query(
            r#"
            INSERT OR IGNORE INTO books (
                source_id, remote_key, title, title_key, cover_url, favorite, date_added
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&book.source_id)
        .bind(&book.remote_key)
        .bind(&book.title)
        .bind(normalize_title(&book.title))
        .bind(&book.cover_url)
        .bind(book.favorite)
        .bind(book.date_added)
        .execute(&self.pool)
        .await?;

        let (id,): (i64,) =
            sqlx::query_as("SELECT id FROM books WHERE source_id = ? AND remote_key = ?")
                .bind(&book.source_id)
                .bind(&book.remote_key)
                .fetch_one(&self.pool)
                .await?;

        Ok(BookId(id))
    }

    async fn set_favorite(&self, id: BookId, favorite: bool, now: i64) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE books SET
                favorite = ?,
                date_added = CASE WHEN ? THEN COALESCE(date_added, ?) ELSE date_added END
            WHERE id = ?
            "#,
        )
        .bind(favorite)
        .bind(favorite)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LibraryError::not_found("Book", id));
        }

        Ok(())
    }

    async fn library(&self) -> Result<Vec<Book>> {
        let rows = query_as::<_, BookRow>(&format!(
            "SELECT {} FROM books WHERE favorite = 1 ORDER BY date_added DESC, id DESC",
            BOOK_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Book::try_from).collect()
    }

    async fn delete(&self, id: BookId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM books WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

/// Write the remote-derived columns of `book`, leaving local-only columns alone.
///
/// `last_fetch` is only written when `stamp_fetch` is set; a partial merge
/// must not mark the book as refreshed.
pub(crate) async fn update_remote_fields(
    tx: &mut Transaction<'_, Sqlite>,
    book: &Book,
    stamp_fetch: Option<i64>,
) -> Result<()> {
    let tags = serde_json::to_string(&book.tags).map_err(|e| LibraryError::InvalidInput {
        field: "tags".to_string(),
        message: e.to_string(),
    })?;

    let result = sqlx::query(
        r#"
        UPDATE books SET
            title = ?, title_key = ?, author = ?, description = ?, cover_url = ?,
            tags = ?, status = ?, total_chapters = ?, last_update = ?,
            last_fetch = COALESCE(?, last_fetch)
        WHERE id = ?
        "#,
    )
    .bind(&book.title)
    .bind(normalize_title(&book.title))
    .bind(&book.author)
    .bind(&book.description)
    .bind(&book.cover_url)
    .bind(tags)
    .bind(book.status.as_str())
    .bind(book.total_chapters)
    .bind(book.last_update)
    .bind(stamp_fetch)
    .bind(book.id)
    .execute(&mut **tx)
    .await?;

    if result.rows_affected() == 0 {
        return Err(LibraryError::not_found("Book", book.id));
    }

    Ok(())
}
