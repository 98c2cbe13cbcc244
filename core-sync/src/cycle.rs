//! Refresh cycle state as seen by callers.

use core_library::BookId;
use core_runtime::events::{ErrorKind, SyncPhase};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::merge::ChapterMergeStats;

/// Where a cycle is. `Finished` covers success, failure and cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CyclePhase {
    Starting,
    FetchingDetail,
    FetchingChapters,
    Merging,
    Finished,
}

impl CyclePhase {
    /// Phase reported on progress events, if any
    pub fn sync_phase(&self) -> Option<SyncPhase> {
        match self {
            CyclePhase::FetchingDetail => Some(SyncPhase::FetchingDetail),
            CyclePhase::FetchingChapters => Some(SyncPhase::FetchingChapters),
            CyclePhase::Merging => Some(SyncPhase::Merging),
            CyclePhase::Starting | CyclePhase::Finished => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleSummary {
    pub book_id: BookId,
    pub chapters: ChapterMergeStats,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CycleOutcome {
    Succeeded(CycleSummary),
    Failed { kind: ErrorKind, message: String },
    Cancelled,
}

impl CycleOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CycleOutcome::Succeeded(_))
    }
}

/// Caller's view of one cycle. Cheap to clone; every clone observes the same
/// cycle.
#[derive(Debug, Clone)]
pub struct CycleHandle {
    book_id: BookId,
    cycle_id: String,
    phase: watch::Receiver<CyclePhase>,
    outcome: watch::Receiver<Option<CycleOutcome>>,
}

impl CycleHandle {
    pub fn book_id(&self) -> BookId {
        self.book_id
    }

    pub fn cycle_id(&self) -> &str {
        &self.cycle_id
    }

    pub fn phase(&self) -> CyclePhase {
        *self.phase.borrow()
    }

    pub fn outcome(&self) -> Option<CycleOutcome> {
        self.outcome.borrow().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.borrow().is_some()
    }

    /// Wait for the cycle to end.
    pub async fn wait(&self) -> CycleOutcome {
        let mut outcome = self.outcome.clone();
        loop {
            if let Some(done) = outcome.borrow_and_update().clone() {
                return done;
            }
            if outcome.changed().await.is_err() {
                // Tracker dropped without reporting; only happens if the task aborted
                return outcome.borrow().clone().unwrap_or(CycleOutcome::Cancelled);
            }
        }
    }
}

/// Engine-side writer for a cycle's handle.
pub(crate) struct CycleTracker {
    cycle_id: String,
    phase: watch::Sender<CyclePhase>,
    outcome: watch::Sender<Option<CycleOutcome>>,
}

impl CycleTracker {
    pub(crate) fn new(book_id: BookId, cycle_id: String) -> (Self, CycleHandle) {
        let (phase_tx, phase_rx) = watch::channel(CyclePhase::Starting);
        let (outcome_tx, outcome_rx) = watch::channel(None);

        let handle = CycleHandle {
            book_id,
            cycle_id: cycle_id.clone(),
            phase: phase_rx,
            outcome: outcome_rx,
        };
        let tracker = Self {
            cycle_id,
            phase: phase_tx,
            outcome: outcome_tx,
        };
        (tracker, handle)
    }

    pub(crate) fn cycle_id(&self) -> &str {
        &self.cycle_id
    }

    pub(crate) fn enter(&self, phase: CyclePhase) {
        self.phase.send_replace(phase);
    }

    pub(crate) fn finish(self, outcome: CycleOutcome) {
        self.phase.send_replace(CyclePhase::Finished);
        self.outcome.send_replace(Some(outcome));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_returns_outcome() {
        let (tracker, handle) = CycleTracker::new(BookId(1), "c-1".to_string());
        assert_eq!(handle.phase(), CyclePhase::Starting);
        assert!(!handle.is_finished());

        let waiter = handle.clone();
        let task = tokio::spawn(async move { waiter.wait().await });

        tracker.enter(CyclePhase::Merging);
        assert_eq!(handle.phase(), CyclePhase::Merging);
        tracker.finish(CycleOutcome::Cancelled);

        assert_eq!(task.await.unwrap(), CycleOutcome::Cancelled);
        assert_eq!(handle.phase(), CyclePhase::Finished);
        assert_eq!(handle.outcome(), Some(CycleOutcome::Cancelled));
    }

    #[tokio::test]
    async fn test_dropped_tracker_reads_as_cancelled() {
        let (tracker, handle) = CycleTracker::new(BookId(1), "c-1".to_string());
        drop(tracker);
        assert_eq!(handle.wait().await, CycleOutcome::Cancelled);
    }

    #[test]
    fn test_phase_mapping() {
        assert_eq!(
            CyclePhase::FetchingChapters.sync_phase(),
            Some(SyncPhase::FetchingChapters)
        );
        assert_eq!(CyclePhase::Finished.sync_phase(), None);
    }
}
