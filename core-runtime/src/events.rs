//! # Event Bus System
//!
//! Typed, broadcast-based notifications emitted by the sync core using
//! `tokio::sync::broadcast`.
//!
//! ## Overview
//!
//! - **Event Types**: one enum per domain, wrapped in [`CoreEvent`]
//! - **EventBus**: central broadcast channel for publishing events
//! - **EventStream**: receiver wrapper with optional filtering
//!
//! ```text
//! ┌─────────────┐     emit      ┌───────────┐
//! │ Sync Engine ├──────────────>│           │     subscribe    ┌────────────┐
//! └─────────────┘               │ EventBus  ├─────────────────>│ Subscriber │
//! ┌─────────────┐     emit      │ (broadcast│                  └────────────┘
//! │ Downloads   ├──────────────>│  channel) │     subscribe    ┌────────────┐
//! └─────────────┘               │           ├─────────────────>│ Subscriber │
//! ┌─────────────┐     emit      │           │                  └────────────┘
//! │ Library     ├──────────────>│           │
//! └─────────────┘               └───────────┘
//! ```
//!
//! Events flow one way. Nothing inside the core reacts to its own events;
//! only external triggers start sync cycles or downloads.
//!
//! ## Usage
//!
//! ```rust
//! use core_runtime::events::{CoreEvent, EventBus, SyncEvent};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let event_bus = EventBus::new(100);
//! let mut stream = event_bus.subscribe();
//!
//! event_bus
//!     .emit(CoreEvent::Sync(SyncEvent::Started {
//!         book_id: 42,
//!         cycle_id: "c-1".to_string(),
//!     }))
//!     .ok();
//!
//! let event = stream.recv().await.unwrap();
//! assert_eq!(event.book_id(), Some(42));
//! # }
//! ```
//!
//! ## Error Handling
//!
//! - **`RecvError::Lagged(n)`**: the subscriber was too slow and missed `n` events.
//!   Non-fatal; keep receiving.
//! - **`RecvError::Closed`**: all senders were dropped. Treat as shutdown.
//!
//! Publishing with no subscribers returns an error; emitters ignore it with `.ok()`.

use bridge_traits::source::FetchErrorKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

pub use tokio::sync::broadcast::error::{RecvError, SendError};
pub use tokio::sync::broadcast::Receiver;

/// Default buffer size for the event bus channel.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 256;

// ============================================================================
// Core Event Types
// ============================================================================

/// Top-level event enum encompassing all event categories.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    /// Per-book refresh cycle events
    Sync(SyncEvent),
    /// Content download job events
    Download(DownloadEvent),
    /// Committed library changes and user actions
    Library(LibraryEvent),
}

impl CoreEvent {
    pub fn description(&self) -> &str {
        match self {
            CoreEvent::Sync(e) => e.description(),
            CoreEvent::Download(e) => e.description(),
            CoreEvent::Library(e) => e.description(),
        }
    }

    pub fn severity(&self) -> EventSeverity {
        match self {
            CoreEvent::Sync(SyncEvent::Failed { .. }) => EventSeverity::Error,
            CoreEvent::Download(DownloadEvent::JobFailed { reason, .. }) => match reason {
                FailureReason::Cancelled => EventSeverity::Info,
                FailureReason::Error { .. } => EventSeverity::Warning,
                FailureReason::RetryExhausted { .. } => EventSeverity::Error,
            },
            CoreEvent::Sync(SyncEvent::Succeeded { .. }) => EventSeverity::Info,
            CoreEvent::Download(DownloadEvent::JobSucceeded { .. }) => EventSeverity::Info,
            _ => EventSeverity::Debug,
        }
    }

    /// Book the event is about, when there is one.
    pub fn book_id(&self) -> Option<i64> {
        match self {
            CoreEvent::Sync(e) => Some(e.book_id()),
            CoreEvent::Download(e) => Some(e.book_id()),
            CoreEvent::Library(e) => Some(e.book_id()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

/// Failure kind carried by failure events.
///
/// Adapter failures map one to one; `TransactionAborted` covers a merge whose
/// store transaction did not commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    NotFound,
    ParseFailure,
    RateLimited,
    Unknown,
    TransactionAborted,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::NotFound => "not_found",
            ErrorKind::ParseFailure => "parse_failure",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Unknown => "unknown",
            ErrorKind::TransactionAborted => "transaction_aborted",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "network" => ErrorKind::Network,
            "not_found" => ErrorKind::NotFound,
            "parse_failure" => ErrorKind::ParseFailure,
            "rate_limited" => ErrorKind::RateLimited,
            "transaction_aborted" => ErrorKind::TransactionAborted,
            _ => ErrorKind::Unknown,
        }
    }
}

impl From<FetchErrorKind> for ErrorKind {
    fn from(kind: FetchErrorKind) -> Self {
        match kind {
            FetchErrorKind::Network => ErrorKind::Network,
            FetchErrorKind::NotFound => ErrorKind::NotFound,
            FetchErrorKind::ParseFailure => ErrorKind::ParseFailure,
            FetchErrorKind::RateLimited => ErrorKind::RateLimited,
            FetchErrorKind::Unknown => ErrorKind::Unknown,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Sync Events
// ============================================================================

/// Phase a refresh cycle is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    FetchingDetail,
    FetchingChapters,
    Merging,
}

impl SyncPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::FetchingDetail => "fetching_detail",
            SyncPhase::FetchingChapters => "fetching_chapters",
            SyncPhase::Merging => "merging",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum SyncEvent {
    Started {
        book_id: i64,
        cycle_id: String,
    },
    Progress {
        book_id: i64,
        cycle_id: String,
        phase: SyncPhase,
    },
    Succeeded {
        book_id: i64,
        cycle_id: String,
        chapters_added: u64,
        chapters_updated: u64,
        /// Chapters absent remotely but kept locally
        chapters_retained: u64,
        chapters_removed: u64,
    },
    Failed {
        book_id: i64,
        cycle_id: String,
        kind: ErrorKind,
        message: String,
    },
    Cancelled {
        book_id: i64,
        cycle_id: String,
    },
}

impl SyncEvent {
    fn description(&self) -> &str {
        match self {
            SyncEvent::Started { .. } => "Refresh started",
            SyncEvent::Progress { .. } => "Refresh in progress",
            SyncEvent::Succeeded { .. } => "Refresh completed successfully",
            SyncEvent::Failed { .. } => "Refresh failed",
            SyncEvent::Cancelled { .. } => "Refresh cancelled",
        }
    }

    pub fn book_id(&self) -> i64 {
        match self {
            SyncEvent::Started { book_id, .. }
            | SyncEvent::Progress { book_id, .. }
            | SyncEvent::Succeeded { book_id, .. }
            | SyncEvent::Failed { book_id, .. }
            | SyncEvent::Cancelled { book_id, .. } => *book_id,
        }
    }
}

// ============================================================================
// Download Events
// ============================================================================

/// Why a download job ended in `Failed`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FailureReason {
    /// Attempt failed; the job may be re-enqueued
    Error { kind: ErrorKind, message: String },
    /// Cancelled by a caller; does not count against the retry cap
    Cancelled,
    /// Retry cap reached; terminal
    RetryExhausted { kind: ErrorKind, message: String },
}

impl FailureReason {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FailureReason::RetryExhausted { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum DownloadEvent {
    JobQueued {
        job_id: String,
        book_id: i64,
        chapter_id: i64,
    },
    JobStarted {
        job_id: String,
        book_id: i64,
        chapter_id: i64,
        attempt: u32,
    },
    JobSucceeded {
        job_id: String,
        book_id: i64,
        chapter_id: i64,
    },
    JobFailed {
        job_id: String,
        book_id: i64,
        chapter_id: i64,
        reason: FailureReason,
        retry_count: u32,
    },
}

impl DownloadEvent {
    fn description(&self) -> &str {
        match self {
            DownloadEvent::JobQueued { .. } => "Download queued",
            DownloadEvent::JobStarted { .. } => "Download started",
            DownloadEvent::JobSucceeded { .. } => "Download completed",
            DownloadEvent::JobFailed { .. } => "Download failed",
        }
    }

    pub fn book_id(&self) -> i64 {
        match self {
            DownloadEvent::JobQueued { book_id, .. }
            | DownloadEvent::JobStarted { book_id, .. }
            | DownloadEvent::JobSucceeded { book_id, .. }
            | DownloadEvent::JobFailed { book_id, .. } => *book_id,
        }
    }
}

// ============================================================================
// Library Events
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum LibraryEvent {
    BookAdded {
        book_id: i64,
        title: String,
    },
    BookUpdated {
        book_id: i64,
    },
    FavoriteChanged {
        book_id: i64,
        favorite: bool,
    },
    ChaptersChanged {
        book_id: i64,
    },
    ChaptersDeleted {
        book_id: i64,
        count: u64,
    },
}

impl LibraryEvent {
    fn description(&self) -> &str {
        match self {
            LibraryEvent::BookAdded { .. } => "Book added to library",
            LibraryEvent::BookUpdated { .. } => "Book updated",
            LibraryEvent::FavoriteChanged { .. } => "Library membership changed",
            LibraryEvent::ChaptersChanged { .. } => "Chapter list changed",
            LibraryEvent::ChaptersDeleted { .. } => "Chapters deleted",
        }
    }

    pub fn book_id(&self) -> i64 {
        match self {
            LibraryEvent::BookAdded { book_id, .. }
            | LibraryEvent::BookUpdated { book_id }
            | LibraryEvent::FavoriteChanged { book_id, .. }
            | LibraryEvent::ChaptersChanged { book_id }
            | LibraryEvent::ChaptersDeleted { book_id, .. } => *book_id,
        }
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Cloneable handle to the broadcast channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publishes an event to all subscribers.
    ///
    /// Returns the number of subscribers that received the event, or an error
    /// when nobody is listening.
    pub fn emit(&self, event: CoreEvent) -> Result<usize, SendError<CoreEvent>> {
        self.sender.send(event)
    }

    /// New independent receiver. Past events are not replayed.
    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

// ============================================================================
// Event Stream Wrapper
// ============================================================================

type EventFilter = Box<dyn Fn(&CoreEvent) -> bool + Send + Sync>;

/// A wrapper around `broadcast::Receiver` with filtering.
///
/// ```rust
/// use core_runtime::events::{CoreEvent, EventBus, EventStream};
///
/// let event_bus = EventBus::new(100);
/// let downloads = EventStream::new(event_bus.subscribe())
///     .filter(|event| matches!(event, CoreEvent::Download(_)));
/// ```
pub struct EventStream {
    receiver: Receiver<CoreEvent>,
    filter: Option<EventFilter>,
}

impl EventStream {
    pub fn new(receiver: Receiver<CoreEvent>) -> Self {
        Self {
            receiver,
            filter: None,
        }
    }

    /// Only events matching `predicate` are returned by `recv()`.
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&CoreEvent) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Box::new(predicate));
        self
    }

    /// Restrict the stream to events about one book.
    pub fn for_book(self, book_id: i64) -> Self {
        self.filter(move |event| event.book_id() == Some(book_id))
    }

    /// Receives the next event that passes the filter (if any).
    ///
    /// # Errors
    ///
    /// Returns `RecvError::Lagged(n)` if the subscriber fell behind by `n` events.
    /// Returns `RecvError::Closed` if all senders have been dropped.
    pub async fn recv(&mut self) -> Result<CoreEvent, RecvError> {
        loop {
            let event = self.receiver.recv().await?;

            let Some(filter) = &self.filter else {
                return Ok(event);
            };

            if filter(&event) {
                return Ok(event);
            }
        }
    }

    /// Non-blocking receive; `None` when nothing is buffered.
    pub fn try_recv(&mut self) -> Option<Result<CoreEvent, RecvError>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    let Some(filter) = &self.filter else {
                        return Some(Ok(event));
                    };

                    if filter(&event) {
                        return Some(Ok(event));
                    }
                }
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    return Some(Err(RecvError::Lagged(n)))
                }
                Err(broadcast::error::TryRecvError::Closed) => return Some(Err(RecvError::Closed)),
            }
        }
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("has_filter", &self.filter.is_some())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn started(book_id: i64) -> CoreEvent {
        CoreEvent::Sync(SyncEvent::Started {
            book_id,
            cycle_id: format!("cycle-{}", book_id),
        })
    }

    #[tokio::test]
    async fn test_event_bus_subscription() {
        let bus = EventBus::new(10);
        assert_eq!(bus.subscriber_count(), 0);

        let _sub1 = bus.subscribe();
        let _sub2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);
    }

    #[tokio::test]
    async fn test_event_emission_no_subscribers() {
        let bus = EventBus::new(10);
        assert!(bus.emit(started(1)).is_err());
    }

    #[tokio::test]
    async fn test_multiple_subscribers_receive_same_event() {
        let bus = EventBus::new(10);
        let mut sub1 = bus.subscribe();
        let mut sub2 = bus.subscribe();

        let event = started(7);
        assert_eq!(bus.emit(event.clone()).unwrap(), 2);

        assert_eq!(sub1.recv().await.unwrap(), event);
        assert_eq!(sub2.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn test_event_stream_with_filter() {
        let bus = EventBus::new(10);
        let mut stream = EventStream::new(bus.subscribe())
            .filter(|event| matches!(event, CoreEvent::Download(_)));

        bus.emit(started(1)).ok();
        let queued = CoreEvent::Download(DownloadEvent::JobQueued {
            job_id: "job-1".to_string(),
            book_id: 1,
            chapter_id: 10,
        });
        bus.emit(queued.clone()).ok();

        assert_eq!(stream.recv().await.unwrap(), queued);
    }

    #[tokio::test]
    async fn test_event_stream_for_book() {
        let bus = EventBus::new(10);
        let mut stream = EventStream::new(bus.subscribe()).for_book(42);

        bus.emit(started(1)).ok();
        bus.emit(started(42)).ok();

        assert_eq!(stream.recv().await.unwrap(), started(42));
        assert!(stream.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_lagged_subscriber() {
        let bus = EventBus::new(2);
        let mut sub = bus.subscribe();

        for i in 0..5 {
            bus.emit(started(i)).ok();
        }

        assert!(matches!(sub.recv().await, Err(RecvError::Lagged(_))));
    }

    #[test]
    fn test_event_severity() {
        let failed = CoreEvent::Sync(SyncEvent::Failed {
            book_id: 1,
            cycle_id: "c".to_string(),
            kind: ErrorKind::Network,
            message: "timeout".to_string(),
        });
        assert_eq!(failed.severity(), EventSeverity::Error);

        let cancelled = CoreEvent::Download(DownloadEvent::JobFailed {
            job_id: "j".to_string(),
            book_id: 1,
            chapter_id: 2,
            reason: FailureReason::Cancelled,
            retry_count: 0,
        });
        assert_eq!(cancelled.severity(), EventSeverity::Info);

        let exhausted = CoreEvent::Download(DownloadEvent::JobFailed {
            job_id: "j".to_string(),
            book_id: 1,
            chapter_id: 2,
            reason: FailureReason::RetryExhausted {
                kind: ErrorKind::RateLimited,
                message: "429".to_string(),
            },
            retry_count: 3,
        });
        assert_eq!(exhausted.severity(), EventSeverity::Error);
        assert_eq!(started(1).severity(), EventSeverity::Debug);
    }

    #[test]
    fn test_event_serialization_shape() {
        let event = CoreEvent::Sync(SyncEvent::Progress {
            book_id: 3,
            cycle_id: "c-3".to_string(),
            phase: SyncPhase::FetchingChapters,
        });

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "Sync");
        assert_eq!(json["payload"]["event"], "Progress");
        assert_eq!(json["payload"]["phase"], "fetching_chapters");

        let back: CoreEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_error_kind_from_fetch_kind() {
        assert_eq!(ErrorKind::from(FetchErrorKind::RateLimited), ErrorKind::RateLimited);
        assert_eq!(ErrorKind::parse("transaction_aborted"), ErrorKind::TransactionAborted);
        assert_eq!(ErrorKind::parse("???"), ErrorKind::Unknown);
    }
}
