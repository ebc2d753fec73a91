//! Per-pass tallies and the audit record written when a pass completes.

use appsync_core::{AuditRecord, Progress, TitleLists};
use appsync_storage::{CatalogStore, StoreError};
use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

/// What happened to one candidate in a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Inserted { title: String },
    Updated { title: String },
    Unchanged { title: String },
    /// Upstream no longer lists the app; removed from the catalog.
    Deleted,
    /// A new app whose size could not be determined.
    InsertSkipped { title: String },
    FetchFailed,
    Malformed,
}

/// Accumulator view over the tallies carried in `Progress`, so a pass that spans
/// several invocations keeps one set of totals.
pub struct SyncReport<'a> {
    progress: &'a mut Progress,
}

impl<'a> SyncReport<'a> {
    pub fn new(progress: &'a mut Progress) -> Self {
        Self { progress }
    }

    pub fn record(&mut self, outcome: &ItemOutcome) {
        let p = &mut *self.progress;
        match outcome {
            ItemOutcome::Inserted { title } => {
                p.processed_count += 1;
                p.inserted_count += 1;
                p.title_lists.inserted.push(title.clone());
            }
            ItemOutcome::Updated { title } => {
                p.processed_count += 1;
                p.updated_count += 1;
                p.title_lists.updated.push(title.clone());
            }
            ItemOutcome::Unchanged { title } => {
                p.processed_count += 1;
                p.no_change_count += 1;
                p.title_lists.no_change.push(title.clone());
            }
            ItemOutcome::InsertSkipped { .. } => p.processed_count += 1,
            ItemOutcome::Deleted => p.deleted_count += 1,
            ItemOutcome::FetchFailed | ItemOutcome::Malformed => {}
        }
    }

    pub fn audit(&self, run_id: Uuid, now: DateTime<Utc>) -> AuditRecord {
        AuditRecord {
            run_id,
            timestamp: now,
            processed_count: self.progress.processed_count,
            inserted_count: self.progress.inserted_count,
            updated_count: self.progress.updated_count,
            no_change_count: self.progress.no_change_count,
            deleted_count: self.progress.deleted_count,
            title_lists: self.progress.title_lists.clone(),
        }
    }

    /// Appends the audit record and clears the tallies.
    pub async fn flush(
        self,
        store: &dyn CatalogStore,
        run_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<AuditRecord, StoreError> {
        let audit = self.audit(run_id, now);
        store.append_audit(&audit).await?;
        info!(
            %run_id,
            inserted = audit.inserted_count,
            updated = audit.updated_count,
            unchanged = audit.no_change_count,
            deleted = audit.deleted_count,
            "pass complete"
        );

        let p = self.progress;
        p.processed_count = 0;
        p.inserted_count = 0;
        p.updated_count = 0;
        p.no_change_count = 0;
        p.deleted_count = 0;
        p.title_lists = TitleLists::default();
        Ok(audit)
    }
}
