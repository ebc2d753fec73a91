//! Batched traversal of the candidate list.

use std::sync::Arc;
use std::time::Duration;

use appsync_core::{AuditRecord, Candidate, Progress, RemoteRecord, StoredRecord};
use appsync_providers::{MetadataError, MetadataProvider, ReviewProvider};
use appsync_storage::{CatalogStore, ProgressStore};
use chrono::Utc;
use futures::future::join_all;
use rand::Rng;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::budget::RunBudget;
use crate::diff::{classify, Classification};
use crate::enrichment::{size_for_insert, size_for_update, EnrichmentError, EnrichmentRetrier};
use crate::record::{build_patch, build_record};
use crate::report::{ItemOutcome, SyncReport};
use crate::SyncError;

pub const DEFAULT_BATCH_SIZE: usize = 2;
pub const DEFAULT_REVIEW_LIMIT: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverSettings {
    pub batch_size: usize,
    pub pacing_min: Duration,
    pub pacing_max: Duration,
    pub review_limit: usize,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            pacing_min: Duration::from_secs(1),
            pacing_max: Duration::from_secs(3),
            review_limit: DEFAULT_REVIEW_LIMIT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The whole list was traversed and the audit record written.
    Completed {
        audit: AuditRecord,
        last_cursor: Option<usize>,
        progress: Progress,
    },
    /// The budget ran out; the next invocation resumes from `progress`.
    Suspended { progress: Progress },
}

/// Per-item state between classification and persistence.
enum Planned {
    Settled(ItemOutcome),
    /// Delisted upstream; removed during the sequential write stage.
    Delete,
    Write(PendingWrite),
}

struct PendingWrite {
    remote: RemoteRecord,
    title: String,
    /// `None` for a new app.
    existing: Option<StoredRecord>,
}

enum Enriched {
    Settled(ItemOutcome),
    Delete,
    Write {
        pending: PendingWrite,
        size: Result<String, EnrichmentError>,
        reviews: Vec<String>,
    },
}

/// What one batch left behind. `outcomes` covers the committed prefix of the
/// batch, in order; `failure` is the storage error that stopped it, if any.
struct BatchOutcome {
    outcomes: Vec<ItemOutcome>,
    failure: Option<SyncError>,
}

impl BatchOutcome {
    fn failed(outcomes: Vec<ItemOutcome>, failure: SyncError) -> Self {
        Self {
            outcomes,
            failure: Some(failure),
        }
    }
}

pub struct BatchDriver {
    store: Arc<dyn CatalogStore>,
    progress_store: Arc<dyn ProgressStore>,
    metadata: Arc<dyn MetadataProvider>,
    sizes: EnrichmentRetrier,
    reviews: Arc<dyn ReviewProvider>,
    settings: DriverSettings,
}

impl BatchDriver {
    pub fn new(
        store: Arc<dyn CatalogStore>,
        progress_store: Arc<dyn ProgressStore>,
        metadata: Arc<dyn MetadataProvider>,
        sizes: EnrichmentRetrier,
        reviews: Arc<dyn ReviewProvider>,
        settings: DriverSettings,
    ) -> Self {
        Self {
            store,
            progress_store,
            metadata,
            sizes,
            reviews,
            settings,
        }
    }

    /// Walks `candidates` from the checkpoint until the list or the budget runs out.
    ///
    /// The checkpoint is saved after every batch. A storage failure ends the run
    /// with the checkpoint just past the last item written before the failure.
    pub async fn run(
        &self,
        candidates: &[Candidate],
        mut progress: Progress,
        budget: &RunBudget,
        run_id: Uuid,
    ) -> Result<RunOutcome, SyncError> {
        let batch_size = self.settings.batch_size.max(1);
        let mut index = progress.resume_index(candidates);
        info!(%run_id, start = index, total = candidates.len(), "resuming traversal");

        while index < candidates.len() && budget.has_time_remaining() {
            let end = (index + batch_size).min(candidates.len());
            let batch = &candidates[index..end];
            let BatchOutcome { outcomes, failure } = self
                .process_batch(batch)
                .instrument(info_span!("batch", start = index, size = batch.len()))
                .await;

            if !outcomes.is_empty() {
                progress = self.commit(&progress, &batch[..outcomes.len()], &outcomes, index).await?;
                index += outcomes.len();
            }
            if let Some(err) = failure {
                warn!(cursor = ?progress.cursor, error = %err, "batch aborted; checkpoint kept at last write");
                return Err(err);
            }

            if index < candidates.len() {
                tokio::time::sleep(self.pacing_delay()).await;
            }
        }

        if index >= candidates.len() {
            let last_cursor = progress.cursor;
            let audit = SyncReport::new(&mut progress)
                .flush(self.store.as_ref(), run_id, Utc::now())
                .await
                .map_err(SyncError::Audit)?;
            let progress = Progress::completed_for_period(progress.period_key.clone());
            self.save(&progress).await?;
            return Ok(RunOutcome::Completed {
                audit,
                last_cursor,
                progress,
            });
        }

        progress.runs_this_period += 1;
        self.save(&progress).await?;
        info!(
            cursor = ?progress.cursor,
            runs = progress.runs_this_period,
            elapsed_secs = budget.elapsed().as_secs(),
            "run budget exhausted; suspending"
        );
        Ok(RunOutcome::Suspended { progress })
    }

    /// Folds the outcomes of `committed` into a new checkpoint and saves it.
    /// `start` is the list index of the first committed candidate.
    async fn commit(
        &self,
        progress: &Progress,
        committed: &[Candidate],
        outcomes: &[ItemOutcome],
        start: usize,
    ) -> Result<Progress, SyncError> {
        let mut next = progress.clone();
        let mut report = SyncReport::new(&mut next);
        for outcome in outcomes {
            report.record(outcome);
        }
        if let Some((anchor, _)) = committed
            .iter()
            .zip(outcomes)
            .rev()
            .find(|(_, outcome)| **outcome != ItemOutcome::Deleted)
        {
            next.cursor_id = Some(anchor.app_id.clone());
        }
        let cursor = start + outcomes.len() - 1;
        next.cursor = Some(cursor);
        self.save(&next).await?;
        debug!(cursor, processed = next.processed_count, "checkpoint saved");
        Ok(next)
    }

    /// Fetches run concurrently across the batch; writes run one at a time in
    /// batch order so a failure leaves an exact committed prefix.
    async fn process_batch(&self, batch: &[Candidate]) -> BatchOutcome {
        let fetched = join_all(batch.iter().map(|c| self.metadata.fetch(&c.app_id))).await;

        let mut plans = Vec::with_capacity(batch.len());
        for (candidate, result) in batch.iter().zip(fetched) {
            match self.plan(candidate, result).await {
                Ok(plan) => plans.push(plan),
                Err(err) => return BatchOutcome::failed(Vec::new(), err),
            }
        }

        let enriched = join_all(plans.into_iter().map(|plan| self.enrich(plan))).await;

        let mut outcomes = Vec::with_capacity(batch.len());
        for (candidate, item) in batch.iter().zip(enriched) {
            let written = match item {
                Enriched::Settled(outcome) => Ok(outcome),
                Enriched::Delete => self.remove(&candidate.app_id).await,
                Enriched::Write {
                    pending,
                    size,
                    reviews,
                } => self.persist(candidate, pending, size, reviews).await,
            };
            match written {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => return BatchOutcome::failed(outcomes, err),
            }
        }
        BatchOutcome {
            outcomes,
            failure: None,
        }
    }

    async fn plan(
        &self,
        candidate: &Candidate,
        fetched: Result<RemoteRecord, MetadataError>,
    ) -> Result<Planned, SyncError> {
        let app_id = candidate.app_id.as_str();
        let remote = match fetched {
            Ok(remote) => remote,
            Err(MetadataError::NotFound) => return Ok(Planned::Delete),
            Err(err) => {
                warn!(app_id, error = %err, "metadata fetch failed; skipping");
                return Ok(Planned::Settled(ItemOutcome::FetchFailed));
            }
        };

        let Some(title) = remote.identity_title().map(str::to_string) else {
            warn!(app_id, "metadata lacks identity fields; skipping");
            return Ok(Planned::Settled(ItemOutcome::Malformed));
        };

        let existing = self
            .store
            .find(app_id)
            .await
            .map_err(|source| SyncError::storage(app_id, source))?;
        match classify(existing.as_ref(), &remote) {
            Classification::NoChange => Ok(Planned::Settled(ItemOutcome::Unchanged { title })),
            Classification::Insert | Classification::Update => Ok(Planned::Write(PendingWrite {
                remote,
                title,
                existing,
            })),
        }
    }

    async fn enrich(&self, plan: Planned) -> Enriched {
        let pending = match plan {
            Planned::Settled(outcome) => return Enriched::Settled(outcome),
            Planned::Delete => return Enriched::Delete,
            Planned::Write(pending) => pending,
        };
        let app_id = pending.remote.app_id.as_str();
        let (size, reviews) = tokio::join!(self.sizes.fetch_size(app_id), self.recent_reviews(app_id));
        Enriched::Write {
            pending,
            size,
            reviews,
        }
    }

    async fn recent_reviews(&self, app_id: &str) -> Vec<String> {
        match self.reviews.recent(app_id, self.settings.review_limit).await {
            Ok(reviews) => reviews,
            Err(err) => {
                warn!(app_id, error = %err, "review fetch failed; storing no comments");
                Vec::new()
            }
        }
    }

    async fn remove(&self, app_id: &str) -> Result<ItemOutcome, SyncError> {
        self.store
            .delete(app_id)
            .await
            .map_err(|source| SyncError::storage(app_id, source))?;
        info!(app_id, "app no longer listed upstream; removed");
        Ok(ItemOutcome::Deleted)
    }

    async fn persist(
        &self,
        candidate: &Candidate,
        pending: PendingWrite,
        size: Result<String, EnrichmentError>,
        reviews: Vec<String>,
    ) -> Result<ItemOutcome, SyncError> {
        let app_id = candidate.app_id.as_str();
        let PendingWrite {
            remote,
            title,
            existing,
        } = pending;

        match existing {
            None => {
                let Some(app_size) = size_for_insert(size) else {
                    warn!(app_id, "size unavailable; new app not inserted");
                    return Ok(ItemOutcome::InsertSkipped { title });
                };
                let record = build_record(candidate, &remote, &title, app_size, reviews, Utc::now());
                self.store
                    .insert(&record)
                    .await
                    .map_err(|source| SyncError::storage(app_id, source))?;
                info!(app_id, version = %record.version, "inserted");
                Ok(ItemOutcome::Inserted { title })
            }
            Some(existing) => {
                let app_size = size_for_update(size, &existing.app_size);
                let patch = build_patch(&remote, &title, app_size, reviews, Utc::now());
                self.store
                    .update(app_id, &patch)
                    .await
                    .map_err(|source| SyncError::storage(app_id, source))?;
                info!(app_id, from = %existing.version, to = %patch.version, "updated");
                Ok(ItemOutcome::Updated { title })
            }
        }
    }

    async fn save(&self, progress: &Progress) -> Result<(), SyncError> {
        self.progress_store
            .save(progress)
            .await
            .map_err(SyncError::Checkpoint)
    }

    fn pacing_delay(&self) -> Duration {
        let (min, max) = (self.settings.pacing_min, self.settings.pacing_max);
        if max <= min {
            return min;
        }
        let millis = rand::rng().random_range(min.as_millis() as u64..=max.as_millis() as u64);
        Duration::from_millis(millis)
    }
}
