//! Projection of fetched metadata into stored documents.

use appsync_core::text::{self, build_comments, random_install_percent};
use appsync_core::{Candidate, RecordPatch, RemoteRecord, StoredRecord};
use chrono::{DateTime, Utc};
use tracing::warn;

/// Builds the document written for a new catalog entry.
pub fn build_record(
    candidate: &Candidate,
    remote: &RemoteRecord,
    title: &str,
    app_size: String,
    reviews: Vec<String>,
    now: DateTime<Utc>,
) -> StoredRecord {
    let mut rng = rand::rng();
    let installs = remote.installs.clone().unwrap_or_default();
    let app_install = match text::display_installs(&installs, random_install_percent(&mut rng)) {
        Ok(display) => display,
        Err(err) => {
            warn!(app_id = %remote.app_id, error = %err, "keeping raw installs string");
            installs
        }
    };
    let developer = remote.developer.clone().unwrap_or_default();

    StoredRecord {
        app_id: remote.app_id.clone(),
        slug: text::slug(title),
        os: remote.android_version.clone(),
        download_obb: candidate.download_obb,
        is_available_on_play_store: candidate.is_available_on_play_store,
        app_install,
        app_size,
        title: title.to_string(),
        rating: remote.score_text.clone().unwrap_or_else(|| "0".to_string()),
        version: remote.version_or_unknown(),
        free: remote.free.unwrap_or(false),
        platform: "android".to_string(),
        download_url: "download".to_string(),
        reviews: remote.ratings.unwrap_or(0),
        developer_url: text::slug(&developer),
        developer,
        summary: remote.summary.clone().unwrap_or_default(),
        recent_changes: remote.recent_changes.clone(),
        category: remote.genre.clone().unwrap_or_default(),
        category_url: text::category_url(remote.genre_id.as_deref().unwrap_or_default()),
        description: remote.description.clone().unwrap_or_default(),
        icon: remote.icon.clone().unwrap_or_default(),
        screenshots: remote.screenshots.clone(),
        url: remote.url.clone().unwrap_or_default(),
        updated: now,
        comments: build_comments(reviews, &mut rng),
    }
}

/// Builds the partial merge applied to an existing document.
pub fn build_patch(
    remote: &RemoteRecord,
    title: &str,
    app_size: String,
    reviews: Vec<String>,
    now: DateTime<Utc>,
) -> RecordPatch {
    let mut rng = rand::rng();
    RecordPatch {
        version: remote.version_or_unknown(),
        title: title.to_string(),
        rating: remote.score_text.clone().unwrap_or_else(|| "0".to_string()),
        reviews: remote.ratings.unwrap_or(0),
        summary: remote.summary.clone().unwrap_or_default(),
        description: remote.description.clone().unwrap_or_default(),
        icon: remote.icon.clone().unwrap_or_default(),
        screenshots: remote.screenshots.clone(),
        app_size,
        updated: now,
        comments: build_comments(reviews, &mut rng),
    }
}
