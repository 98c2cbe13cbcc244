use bridge_traits::source::{FetchError, SourceId};
use core_library::{BookId, ChapterId, LibraryError};
use core_runtime::events::ErrorKind;
use thiserror::Error;

/// A merge step that did not commit. Nothing of the step was written.
#[derive(Error, Debug)]
pub enum MergeError {
    #[error("Merge transaction aborted for book {book_id}: {source}")]
    TransactionAborted {
        book_id: BookId,
        #[source]
        source: LibraryError,
    },
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Book {0} not found")]
    BookNotFound(BookId),

    #[error("No adapter registered for source {0}")]
    SourceNotRegistered(SourceId),

    #[error("Source {source_id} does not support {operation}")]
    Unsupported {
        source_id: SourceId,
        operation: &'static str,
    },

    #[error("Fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error("Library error: {0}")]
    Library(#[from] LibraryError),

    #[error("Sync cancelled")]
    Cancelled,
}

impl SyncError {
    /// Kind reported on failure events
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Fetch(err) => err.kind().into(),
            SyncError::Merge(_) => ErrorKind::TransactionAborted,
            SyncError::BookNotFound(_) => ErrorKind::NotFound,
            _ => ErrorKind::Unknown,
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Chapter {0} not found")]
    ChapterNotFound(ChapterId),

    #[error("Book {0} not found")]
    BookNotFound(BookId),

    #[error("No download job for chapter {0}")]
    JobNotFound(ChapterId),

    #[error("Download of chapter {chapter_id} failed {retry_count} times, giving up")]
    RetryExhausted { chapter_id: ChapterId, retry_count: u32 },

    #[error("Download of chapter {0} cancelled")]
    Cancelled(ChapterId),

    #[error("No adapter registered for source {0}")]
    SourceNotRegistered(SourceId),

    #[error("Invalid job state: {0}")]
    InvalidState(String),

    #[error("Scheduler is shut down")]
    ShutDown,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Library error: {0}")]
    Library(#[from] LibraryError),
}

pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;
