//! # Chapter Deduplication
//!
//! Matches a freshly fetched chapter list against the stored one.
//!
//! Every chapter carries its own key: `id:<remote id>` when it has a remote
//! id, otherwise `title:<normalized title>`. Matching runs per chapter in two
//! passes:
//!
//! 1. A fetched chapter with a remote id claims the stored chapter with the
//!    same remote id.
//! 2. What is left is matched on normalized title, but only for pairs where
//!    at least one side has no remote id. Two different remote ids never
//!    match, whatever their titles.
//!
//! The result is three partitions:
//!
//! - **Matched**: paired chapters, local state carried forward
//! - **New**: fetched chapters without a stored counterpart
//! - **Missing**: stored chapters without a fetched counterpart
//!
//! Fetched chapters sharing a key are collapsed according to
//! [`DuplicatePolicy`]; the survivor keeps its own ordinal.

use std::collections::{HashMap, HashSet};

use bridge_traits::source::CanonicalChapter;
use core_library::{normalize_title, Chapter};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Which fetched chapter survives when several share a matching key
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DuplicatePolicy {
    /// The one appearing last in remote order
    #[default]
    KeepHighestOrdinal,
    /// The one appearing first in remote order
    KeepLowestOrdinal,
}

/// How a matched pair was found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    RemoteId,
    Title,
}

/// A fetched chapter with its remote position and computed key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedChapter {
    pub ordinal: usize,
    pub key: String,
    pub chapter: CanonicalChapter,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchedChapter {
    pub local: Chapter,
    pub fetched: FetchedChapter,
    pub by: MatchMode,
}

impl MatchedChapter {
    /// Remote id after the merge; a fetch without one keeps the stored id.
    pub fn merged_remote_id(&self) -> Option<String> {
        self.fetched
            .chapter
            .remote_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .or_else(|| self.local.remote_id.clone())
    }

    /// Key the matched row is stored under after the merge
    pub fn merged_key(&self) -> String {
        chapter_key(self.merged_remote_id().as_deref(), &self.fetched.chapter.title)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Partitions {
    pub matched: Vec<MatchedChapter>,
    pub new: Vec<FetchedChapter>,
    pub missing: Vec<Chapter>,
    /// Fetched entries dropped as duplicates of another key holder
    pub collapsed: usize,
}

impl Partitions {
    pub fn matched_by(&self, mode: MatchMode) -> usize {
        self.matched.iter().filter(|m| m.by == mode).count()
    }
}

/// Matching key for a chapter with the given remote id and title.
pub fn chapter_key(remote_id: Option<&str>, title: &str) -> String {
    match remote_id.map(str::trim).filter(|id| !id.is_empty()) {
        Some(id) => format!("id:{}", id),
        None => format!("title:{}", normalize_title(title)),
    }
}

#[derive(Debug, Clone, Default)]
pub struct Deduplicator {
    policy: DuplicatePolicy,
}

impl Deduplicator {
    pub fn new(policy: DuplicatePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> DuplicatePolicy {
        self.policy
    }

    pub fn partition(&self, local: &[Chapter], fetched: &[CanonicalChapter]) -> Partitions {
        // Collapse fetched duplicates
        let mut survivor_by_key: HashMap<String, usize> = HashMap::new();
        for (ordinal, chapter) in fetched.iter().enumerate() {
            let key = chapter_key(chapter.remote_id.as_deref(), &chapter.title);
            match self.policy {
                DuplicatePolicy::KeepHighestOrdinal => {
                    survivor_by_key.insert(key, ordinal);
                }
                DuplicatePolicy::KeepLowestOrdinal => {
                    survivor_by_key.entry(key).or_insert(ordinal);
                }
            }
        }
        let collapsed = fetched.len() - survivor_by_key.len();

        let mut survivors: Vec<FetchedChapter> = survivor_by_key
            .into_iter()
            .map(|(key, ordinal)| FetchedChapter {
                ordinal,
                key,
                chapter: fetched[ordinal].clone(),
            })
            .collect();
        survivors.sort_by_key(|f| f.ordinal);

        // Stored rows in claim order: lowest position first
        let mut local_sorted: Vec<&Chapter> = local.iter().collect();
        local_sorted.sort_by_key(|c| (c.position, c.id));

        let mut used: HashSet<i64> = HashSet::new();
        let mut paired: Vec<Option<(&Chapter, MatchMode)>> = vec![None; survivors.len()];

        // Pass 1: remote ids
        let mut by_id: HashMap<&str, Vec<&Chapter>> = HashMap::new();
        for &chapter in &local_sorted {
            if let Some(id) = remote_id(&chapter.remote_id) {
                by_id.entry(id).or_default().push(chapter);
            }
        }
        for (slot, fetched) in paired.iter_mut().zip(&survivors) {
            let Some(id) = remote_id(&fetched.chapter.remote_id) else {
                continue;
            };
            let candidates = by_id.get(id).map(Vec::as_slice).unwrap_or_default();
            if let Some(local) = pick(candidates, &fetched.key, &used) {
                used.insert(local.id.0);
                *slot = Some((local, MatchMode::RemoteId));
            }
        }

        // Pass 2: normalized titles, never across two different remote ids
        let mut by_title: HashMap<String, Vec<&Chapter>> = HashMap::new();
        for &chapter in &local_sorted {
            if !used.contains(&chapter.id.0) {
                by_title
                    .entry(normalize_title(&chapter.title))
                    .or_default()
                    .push(chapter);
            }
        }
        for (slot, fetched) in paired.iter_mut().zip(&survivors) {
            if slot.is_some() {
                continue;
            }
            let fetched_has_id = remote_id(&fetched.chapter.remote_id).is_some();
            let title_key = chapter_key(None, &fetched.chapter.title);
            let candidates: Vec<&Chapter> = by_title
                .get(&normalize_title(&fetched.chapter.title))
                .map(|chapters| {
                    chapters
                        .iter()
                        .copied()
                        .filter(|c| !(fetched_has_id && remote_id(&c.remote_id).is_some()))
                        .collect()
                })
                .unwrap_or_default();
            if let Some(local) = pick(&candidates, &title_key, &used) {
                used.insert(local.id.0);
                *slot = Some((local, MatchMode::Title));
            }
        }

        let mut matched = Vec::new();
        let mut new = Vec::new();
        for (slot, fetched) in paired.into_iter().zip(survivors) {
            match slot {
                Some((local, by)) => matched.push(MatchedChapter {
                    local: local.clone(),
                    fetched,
                    by,
                }),
                None => new.push(fetched),
            }
        }

        let missing: Vec<Chapter> = local_sorted
            .into_iter()
            .filter(|c| !used.contains(&c.id.0))
            .cloned()
            .collect();

        let partitions = Partitions {
            matched,
            new,
            missing,
            collapsed,
        };
        debug!(
            by_id = partitions.matched_by(MatchMode::RemoteId),
            by_title = partitions.matched_by(MatchMode::Title),
            new = partitions.new.len(),
            missing = partitions.missing.len(),
            collapsed,
            "Partitioned chapter list"
        );
        partitions
    }
}

fn remote_id(id: &Option<String>) -> Option<&str> {
    id.as_deref().map(str::trim).filter(|id| !id.is_empty())
}

/// First unused candidate, preferring the row already stored under `key`.
fn pick<'a>(candidates: &[&'a Chapter], key: &str, used: &HashSet<i64>) -> Option<&'a Chapter> {
    let mut free = candidates.iter().copied().filter(|c| !used.contains(&c.id.0));
    let first = free.next()?;
    if first.match_key == key {
        return Some(first);
    }
    Some(free.find(|c| c.match_key == key).unwrap_or(first))
}
