//! # Sync Module
//!
//! Keeps locally stored books in step with their remote catalogs.
//!
//! ## Overview
//!
//! A refresh cycle fetches a book's detail and chapter list through the
//! book's source adapter, reconciles them with the stored state and commits
//! the result in per-book atomic steps. Chapter content is fetched separately
//! by the download scheduler.
//!
//! ## Components
//!
//! - **Source Registry** (`registry`): adapters by source id
//! - **Deduplicator** (`dedup`): matching keys and Matched/New/Missing partitions
//! - **Merge Policy** (`merge`): remote-over-local rules that never touch user state
//! - **Sync Engine** (`engine`): one cycle per book, cancellation, timeouts, events
//! - **Cycle handles** (`cycle`): phase and outcome of a running cycle
//! - **Download Scheduler** (`scheduler`): bounded FIFO workers with a retry cap
//! - **Download jobs** (`download_job`): persisted scheduler state

pub mod cycle;
pub mod dedup;
pub mod download_job;
pub mod engine;
pub mod error;
pub mod merge;
pub mod registry;
pub mod scheduler;

pub use cycle::{CycleHandle, CycleOutcome, CyclePhase, CycleSummary};
pub use dedup::{chapter_key, DuplicatePolicy, Deduplicator, MatchMode, Partitions};
pub use download_job::{
    DownloadJob, DownloadJobRepository, JobState, SqliteDownloadJobRepository,
};
pub use engine::{RefreshOptions, RefreshTrigger, SyncConfig, SyncEngine};
pub use error::{MergeError, Result, SchedulerError, SchedulerResult, SyncError};
pub use merge::{ChapterMergeStats, ChapterPlan, MergePolicy, ResyncMode};
pub use registry::SourceRegistry;
pub use scheduler::{DownloadScheduler, SchedulerConfig};
