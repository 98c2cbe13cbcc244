//! # Host Bridge Traits
//!
//! Ports that the sync core consumes but never implements itself.
//!
//! ## Traits
//!
//! ### Networking
//! - [`HttpClient`](http::HttpClient) - Async HTTP transport used by source adapters
//!
//! ### Remote catalogs
//! - [`CatalogSource`](source::CatalogSource) - Metadata adapter: search, detail, chapter list, content
//! - [`PageSource`](source::PageSource) - HTTP-content adapter that can also retrieve and parse raw pages
//! - [`SourceAdapter`](source::SourceAdapter) - Closed set of adapter variants, dispatched by source id
//!
//! ### Utilities
//! - [`Clock`](time::Clock) - Time source for deterministic testing
//! - [`LoggerSink`](time::LoggerSink) - Forward structured logs to host logging
//!
//! ## Error Handling
//!
//! Transport-level traits use [`BridgeError`](error::BridgeError). Source adapters
//! report failures through [`FetchError`](source::FetchError), whose kinds are the
//! only adapter failures the sync core understands:
//!
//! | Kind | Typical cause |
//! |------|---------------|
//! | `Network` | Connection failure, TLS failure, call timeout |
//! | `NotFound` | The remote key no longer exists |
//! | `ParseFailure` | The remote answered but the payload could not be understood |
//! | `RateLimited` | HTTP 429 or an equivalent throttle signal |
//! | `Unknown` | Anything else |
//!
//! ## Thread Safety
//!
//! All bridge traits require `Send + Sync` so a single adapter instance can be
//! shared by the sync engine and the download workers.

pub mod error;
pub mod http;
pub mod source;
pub mod time;

pub use error::BridgeError;

pub use http::{HttpClient, HttpMethod, HttpRequest, HttpResponse, RetryPolicy};
pub use source::{
    BookStatus, BookSummary, CanonicalBook, CanonicalChapter, CatalogSource, ContentPayload,
    FetchError, FetchErrorKind, FetchResult, PageSnapshot, PageSource, RawPage, RemoteValue, SearchPage,
    SourceAdapter, SourceId,
};
pub use time::{Clock, LogEntry, LogLevel, LoggerSink, ManualClock, SystemClock};
