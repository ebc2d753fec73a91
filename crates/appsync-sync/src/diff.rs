//! Insert/update/no-change classification.
//!
//! Only the version string is compared. Field-level differences under an
//! unchanged version are not picked up until the version moves.

use appsync_core::{RemoteRecord, StoredRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Insert,
    Update,
    NoChange,
}

pub fn classify(existing: Option<&StoredRecord>, remote: &RemoteRecord) -> Classification {
    let Some(existing) = existing else {
        return Classification::Insert;
    };
    // a missing remote version is stored as "Unknown", so compare in that form
    if remote.is_sentinel_version() || remote.version_or_unknown() != existing.version {
        Classification::Update
    } else {
        Classification::NoChange
    }
}
