//! Core domain model for the app catalog sync engine.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod text;

pub const CRATE_NAME: &str = "appsync-core";

/// Version string the upstream reports when the value depends on the device.
pub const SENTINEL_VERSION: &str = "VARY";

/// Identity entry in the traversal list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub app_id: String,
    #[serde(default)]
    pub download_obb: bool,
    #[serde(default)]
    pub is_available_on_play_store: bool,
}

impl Candidate {
    pub fn new(app_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            download_obb: false,
            is_available_on_play_store: true,
        }
    }
}

/// Drops repeated app ids, keeping the first occurrence so traversal order stays stable.
pub fn dedup_candidates(candidates: Vec<Candidate>) -> Vec<Candidate> {
    let mut seen = HashSet::with_capacity(candidates.len());
    candidates
        .into_iter()
        .filter(|c| seen.insert(c.app_id.clone()))
        .collect()
}

/// Transient metadata fetch result.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RemoteRecord {
    pub app_id: String,
    pub version: Option<String>,
    pub title: Option<String>,
    pub score_text: Option<String>,
    pub ratings: Option<u64>,
    pub summary: Option<String>,
    pub description: Option<String>,
    pub icon: Option<String>,
    pub screenshots: Vec<String>,
    pub installs: Option<String>,
    pub genre: Option<String>,
    pub genre_id: Option<String>,
    pub android_version: Option<String>,
    pub free: Option<bool>,
    pub developer: Option<String>,
    pub recent_changes: Option<String>,
    pub url: Option<String>,
}

impl RemoteRecord {
    /// Title, if the record carries the identity fields a stored record needs.
    pub fn identity_title(&self) -> Option<&str> {
        if self.app_id.trim().is_empty() {
            return None;
        }
        self.title.as_deref().filter(|t| !t.trim().is_empty())
    }

    pub fn version_or_unknown(&self) -> String {
        self.version.clone().unwrap_or_else(|| "Unknown".to_string())
    }

    pub fn is_sentinel_version(&self) -> bool {
        self.version.as_deref() == Some(SENTINEL_VERSION)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub text: String,
    pub username: String,
    pub date: DateTime<Utc>,
}

/// Persisted projection of an app, keyed by `app_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredRecord {
    pub app_id: String,
    pub slug: String,
    pub os: Option<String>,
    pub download_obb: bool,
    pub is_available_on_play_store: bool,
    pub app_install: String,
    pub app_size: String,
    pub title: String,
    pub rating: String,
    pub version: String,
    pub free: bool,
    pub platform: String,
    #[serde(rename = "downloadURL")]
    pub download_url: String,
    pub reviews: u64,
    pub developer: String,
    #[serde(rename = "developerURL")]
    pub developer_url: String,
    pub summary: String,
    pub recent_changes: Option<String>,
    pub category: String,
    #[serde(rename = "categoryURL")]
    pub category_url: String,
    pub description: String,
    pub icon: String,
    pub screenshots: Vec<String>,
    pub url: String,
    pub updated: DateTime<Utc>,
    #[serde(default)]
    pub comments: Vec<Comment>,
}

impl StoredRecord {
    /// Applies a patch the same way the storage layer merges it.
    pub fn apply(&mut self, patch: &RecordPatch) {
        self.version = patch.version.clone();
        self.title = patch.title.clone();
        self.rating = patch.rating.clone();
        self.reviews = patch.reviews;
        self.summary = patch.summary.clone();
        self.description = patch.description.clone();
        self.icon = patch.icon.clone();
        self.screenshots = patch.screenshots.clone();
        self.app_size = patch.app_size.clone();
        self.updated = patch.updated;
        self.comments = patch.comments.clone();
    }
}

/// Fields refreshed on update; everything else keeps its stored value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordPatch {
    pub version: String,
    pub title: String,
    pub rating: String,
    pub reviews: u64,
    pub summary: String,
    pub description: String,
    pub icon: String,
    pub screenshots: Vec<String>,
    pub app_size: String,
    pub updated: DateTime<Utc>,
    pub comments: Vec<Comment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TitleLists {
    pub inserted: Vec<String>,
    pub updated: Vec<String>,
    pub no_change: Vec<String>,
}

/// Durable checkpoint for one pass over the candidate list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Progress {
    /// Index of the last item of the last committed batch.
    pub cursor: Option<usize>,
    /// App id of the last committed candidate that was not deleted.
    pub cursor_id: Option<String>,
    pub processed_count: u64,
    pub inserted_count: u64,
    pub updated_count: u64,
    pub no_change_count: u64,
    pub deleted_count: u64,
    pub runs_this_period: u32,
    pub period_key: String,
    pub allowed_to_run: bool,
    pub title_lists: TitleLists,
}

impl Default for Progress {
    fn default() -> Self {
        Self {
            cursor: None,
            cursor_id: None,
            processed_count: 0,
            inserted_count: 0,
            updated_count: 0,
            no_change_count: 0,
            deleted_count: 0,
            runs_this_period: 0,
            period_key: String::new(),
            allowed_to_run: true,
            title_lists: TitleLists::default(),
        }
    }
}

impl Progress {
    pub fn for_period(period_key: impl Into<String>) -> Self {
        Self {
            period_key: period_key.into(),
            ..Self::default()
        }
    }

    /// State after a full traversal: counters cleared, no further runs this period.
    pub fn completed_for_period(period_key: impl Into<String>) -> Self {
        Self {
            allowed_to_run: false,
            ..Self::for_period(period_key)
        }
    }

    /// First index a run should visit over `candidates`.
    ///
    /// Re-anchors on `cursor_id` so deletions made by an earlier invocation do not
    /// shift the resume point.
    pub fn resume_index(&self, candidates: &[Candidate]) -> usize {
        let Some(cursor) = self.cursor else {
            return 0;
        };
        match &self.cursor_id {
            Some(id) => candidates
                .iter()
                .position(|c| &c.app_id == id)
                .map(|pos| pos + 1)
                .unwrap_or_else(|| (cursor + 1).min(candidates.len())),
            // every committed candidate was deleted, so none remain ahead of the resume point
            None if self.deleted_count > 0 => 0,
            None => (cursor + 1).min(candidates.len()),
        }
    }
}

/// One record per completed traversal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub run_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub processed_count: u64,
    pub inserted_count: u64,
    pub updated_count: u64,
    pub no_change_count: u64,
    pub deleted_count: u64,
    pub title_lists: TitleLists,
}
