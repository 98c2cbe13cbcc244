use bridge_traits::source::{FetchError, SourceId};
use core_library::BookId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Core initialization failed: {0}")]
    InitializationFailed(String),

    #[error("Book {0} not found")]
    BookNotFound(BookId),

    #[error("No adapter registered for source {0}")]
    SourceNotRegistered(SourceId),

    #[error("Runtime error: {0}")]
    Runtime(#[from] core_runtime::Error),

    #[error("Library error: {0}")]
    Library(#[from] core_library::LibraryError),

    #[error("Sync error: {0}")]
    Sync(#[from] core_sync::SyncError),

    #[error("Download error: {0}")]
    Scheduler(#[from] core_sync::SchedulerError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] provider_catalog::CatalogError),

    #[error("Fetch failed: {0}")]
    Fetch(#[from] FetchError),
}

pub type Result<T> = std::result::Result<T, ServiceError>;
