//! # Merge Policy
//!
//! Reconciles a fetched snapshot with persisted state.
//!
//! Book: known remote values overwrite, unknown values keep the stored one,
//! local-only fields (favorite, date added, last fetch) are never touched.
//!
//! Chapters: matched rows take remote title, ordinal, content key and
//! publication time and keep read/bookmark/content; new rows start with
//! default local state; missing rows are kept unless a destructive resync
//! was requested, and even then rows with a bookmark or downloaded content
//! stay.

use bridge_traits::source::{CanonicalBook, CanonicalChapter};
use core_library::{Book, Chapter, ChapterChanges, ChapterRemoteUpdate, NewChapter};
use serde::{Deserialize, Serialize};

use crate::dedup::{Deduplicator, FetchedChapter, MatchedChapter};

/// What happens to stored chapters absent from the fetched list
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResyncMode {
    /// Keep them
    #[default]
    Preserve,
    /// Remove those without user state
    Destructive,
}

/// Outcome counts of one chapter merge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterMergeStats {
    pub added: u64,
    pub updated: u64,
    pub unchanged: u64,
    /// Missing remotely, kept locally
    pub retained: u64,
    pub removed: u64,
}

/// Writes needed to bring the stored chapter list in line with a fetch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChapterPlan {
    pub changes: ChapterChanges,
    pub stats: ChapterMergeStats,
    /// Chapters stored for the book once the plan is applied
    pub chapter_count: i64,
}

#[derive(Debug, Clone, Default)]
pub struct MergePolicy {
    dedup: Deduplicator,
}

impl MergePolicy {
    pub fn new(dedup: Deduplicator) -> Self {
        Self { dedup }
    }

    pub fn deduplicator(&self) -> &Deduplicator {
        &self.dedup
    }

    /// Apply remote detail onto the stored book.
    pub fn merge_book(local: &Book, remote: &CanonicalBook) -> Book {
        let mut merged = local.clone();

        if let Some(title) = remote.title.as_known() {
            if !title.trim().is_empty() {
                merged.title = title.clone();
            }
        }
        if let Some(author) = remote.author.as_known() {
            merged.author = Some(author.clone());
        }
        if let Some(description) = remote.description.as_known() {
            merged.description = Some(description.clone());
        }
        if let Some(cover_url) = remote.cover_url.as_known() {
            merged.cover_url = Some(cover_url.clone());
        }
        if let Some(tags) = remote.tags.as_known() {
            merged.tags = tags.clone();
        }
        if let Some(status) = remote.status.as_known() {
            merged.status = *status;
        }
        if let Some(total) = remote.total_chapters.as_known() {
            merged.total_chapters = i64::from(*total);
        }
        if let Some(last_update) = remote.last_update.as_known() {
            merged.last_update = Some(*last_update);
        }

        merged
    }

    pub fn plan_chapters(
        &self,
        local: &[Chapter],
        fetched: &[CanonicalChapter],
        mode: ResyncMode,
    ) -> ChapterPlan {
        let partitions = self.dedup.partition(local, fetched);
        let mut plan = ChapterPlan::default();

        for matched in &partitions.matched {
            match remote_update(matched) {
                Some(update) => {
                    plan.changes.updates.push(update);
                    plan.stats.updated += 1;
                }
                None => plan.stats.unchanged += 1,
            }
        }

        for fetched in &partitions.new {
            plan.changes.inserts.push(new_chapter(fetched));
            plan.stats.added += 1;
        }

        for chapter in &partitions.missing {
            if mode == ResyncMode::Destructive && !chapter.has_user_state() {
                plan.changes.deletes.push(chapter.id);
                plan.stats.removed += 1;
            } else {
                plan.stats.retained += 1;
            }
        }

        plan.chapter_count =
            (partitions.matched.len() + partitions.new.len()) as i64 + plan.stats.retained as i64;
        plan
    }
}

fn new_chapter(fetched: &FetchedChapter) -> NewChapter {
    NewChapter {
        match_key: fetched.key.clone(),
        remote_id: fetched.chapter.remote_id.clone(),
        title: fetched.chapter.title.clone(),
        position: fetched.ordinal as i64,
        content_key: fetched.chapter.content_key.clone(),
        published_at: fetched.chapter.published_at.clone().into_option(),
    }
}

/// Remote-derived values for a matched chapter, or `None` when nothing changed.
fn remote_update(matched: &MatchedChapter) -> Option<ChapterRemoteUpdate> {
    let local = &matched.local;
    let remote = &matched.fetched.chapter;

    let remote_id = matched.merged_remote_id();
    let match_key = matched.merged_key();
    let published_at = remote
        .published_at
        .clone()
        .into_option()
        .or(local.published_at);
    let position = (!local.position_locked).then_some(matched.fetched.ordinal as i64);

    let unchanged = local.match_key == match_key
        && local.remote_id == remote_id
        && local.title == remote.title
        && position.map_or(true, |p| p == local.position)
        && local.content_key == remote.content_key
        && local.published_at == published_at;

    if unchanged {
        return None;
    }

    Some(ChapterRemoteUpdate {
        id: local.id,
        match_key,
        remote_id,
        title: remote.title.clone(),
        position,
        content_key: remote.content_key.clone(),
        published_at,
    })
}
