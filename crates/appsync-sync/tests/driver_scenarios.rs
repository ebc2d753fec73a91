use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use appsync_core::{Candidate, Progress, RemoteRecord, StoredRecord};
use appsync_providers::{MetadataError, MetadataProvider, ProbeError, ReviewProvider, SizeProvider};
use appsync_storage::{InMemoryCatalogStore, JsonFileProgressStore, ProgressStore};
use appsync_sync::driver::DriverSettings;
use appsync_sync::gate::{DenyReason, ScheduleGate, DEFAULT_RUN_CAP};
use appsync_sync::record::build_record;
use appsync_sync::retry::RetryPolicy;
use appsync_sync::{Collaborators, EngineSettings, RunStatus, SyncEngine, SyncError};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

const FIFTY_MB: u64 = 50 * 1024 * 1024;

#[derive(Debug, Clone)]
enum Listing {
    Version(&'static str),
    Gone,
    Broken,
    Untitled,
}

fn delay_for(delays: &Mutex<HashMap<String, Duration>>, app_id: &str) -> Duration {
    delays.lock().unwrap().get(app_id).copied().unwrap_or_default()
}

#[derive(Default)]
struct StubMetadata {
    listings: Mutex<HashMap<String, Listing>>,
    delays: Mutex<HashMap<String, Duration>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl StubMetadata {
    fn list(&self, app_id: &str, listing: Listing) {
        self.listings.lock().unwrap().insert(app_id.to_string(), listing);
    }

    fn slow(&self, app_id: &str, delay: Duration) {
        self.delays.lock().unwrap().insert(app_id.to_string(), delay);
    }

    fn calls(&self, app_id: &str) -> usize {
        self.calls.lock().unwrap().get(app_id).copied().unwrap_or(0)
    }

    fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl MetadataProvider for StubMetadata {
    async fn fetch(&self, app_id: &str) -> Result<RemoteRecord, MetadataError> {
        *self.calls.lock().unwrap().entry(app_id.to_string()).or_default() += 1;
        tokio::time::sleep(delay_for(&self.delays, app_id)).await;
        let listing = self
            .listings
            .lock()
            .unwrap()
            .get(app_id)
            .cloned()
            .unwrap_or(Listing::Version("1.0"));
        match listing {
            Listing::Version(version) => Ok(RemoteRecord {
                app_id: app_id.to_string(),
                title: Some(title(app_id)),
                version: Some(version.to_string()),
                installs: Some("10,000+".into()),
                genre_id: Some("GAME_PUZZLE".into()),
                ..RemoteRecord::default()
            }),
            Listing::Gone => Err(MetadataError::NotFound),
            Listing::Broken => Err(MetadataError::Other("connection reset".into())),
            Listing::Untitled => Ok(RemoteRecord {
                app_id: app_id.to_string(),
                version: Some("1.0".into()),
                ..RemoteRecord::default()
            }),
        }
    }
}

#[derive(Default)]
struct StubSizes {
    statuses: Mutex<HashMap<String, u16>>,
    delays: Mutex<HashMap<String, Duration>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl StubSizes {
    fn fail_with(&self, app_id: &str, status: u16) {
        self.statuses.lock().unwrap().insert(app_id.to_string(), status);
    }

    fn slow(&self, app_id: &str, delay: Duration) {
        self.delays.lock().unwrap().insert(app_id.to_string(), delay);
    }

    fn calls(&self, app_id: &str) -> usize {
        self.calls.lock().unwrap().get(app_id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl SizeProvider for StubSizes {
    async fn probe(&self, app_id: &str) -> Result<u64, ProbeError> {
        *self.calls.lock().unwrap().entry(app_id.to_string()).or_default() += 1;
        tokio::time::sleep(delay_for(&self.delays, app_id)).await;
        let status = self.statuses.lock().unwrap().get(app_id).copied();
        match status {
            Some(status) => Err(ProbeError::Status(status)),
            None => Ok(FIFTY_MB),
        }
    }
}

struct StubReviews;

#[async_trait]
impl ReviewProvider for StubReviews {
    async fn recent(&self, _app_id: &str, limit: usize) -> anyhow::Result<Vec<String>> {
        Ok(vec!["great game".to_string(); limit.min(3)])
    }
}

fn title(app_id: &str) -> String {
    format!("Title {app_id}")
}

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 1, 9, 0, 0).unwrap()
}

fn existing(app_id: &str, version: &str, app_size: &str) -> StoredRecord {
    let remote = RemoteRecord {
        app_id: app_id.to_string(),
        title: Some(title(app_id)),
        version: Some(version.to_string()),
        installs: Some("10,000+".into()),
        ..RemoteRecord::default()
    };
    build_record(
        &Candidate::new(app_id),
        &remote,
        &title(app_id),
        app_size.to_string(),
        vec![],
        Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap(),
    )
}

struct Harness {
    store: Arc<InMemoryCatalogStore>,
    progress: Arc<dyn ProgressStore>,
    metadata: Arc<StubMetadata>,
    sizes: Arc<StubSizes>,
}

impl Harness {
    fn new(ids: &[&str]) -> Self {
        Self::with_progress_store(ids, Arc::new(appsync_storage::InMemoryProgressStore::default()))
    }

    fn with_progress_store(ids: &[&str], progress: Arc<dyn ProgressStore>) -> Self {
        let candidates = ids.iter().map(|id| Candidate::new(*id)).collect();
        Self {
            store: Arc::new(InMemoryCatalogStore::with_candidates(candidates)),
            progress,
            metadata: Arc::new(StubMetadata::default()),
            sizes: Arc::new(StubSizes::default()),
        }
    }

    fn engine(&self, budget: Duration) -> SyncEngine {
        let collaborators = Collaborators {
            store: self.store.clone(),
            candidates: self.store.clone(),
            progress: self.progress.clone(),
            metadata: self.metadata.clone(),
            sizes: self.sizes.clone(),
            reviews: Arc::new(StubReviews),
        };
        let settings = EngineSettings {
            gate: ScheduleGate::new(Vec::new(), DEFAULT_RUN_CAP),
            budget,
            retry: RetryPolicy::default(),
            driver: DriverSettings {
                batch_size: 2,
                pacing_min: Duration::from_secs(2),
                pacing_max: Duration::from_secs(2),
                review_limit: 30,
            },
        };
        SyncEngine::new(collaborators, settings)
    }

    async fn run(&self, budget: Duration) -> RunStatus {
        self.engine(budget).run_once(now()).await.unwrap().status
    }
}

const LONG: Duration = Duration::from_secs(3600);

#[tokio::test(start_paused = true)]
async fn five_candidates_insert_update_and_delete() {
    let h = Harness::new(&["c0", "c1", "c2", "c3", "c4"]);
    h.store.seed(existing("c1", "1.0", "42MB")).await;
    h.store.seed(existing("c2", "3.0", "42MB")).await;
    h.store.seed(existing("c3", "1.0", "42MB")).await;
    h.metadata.list("c1", Listing::Version("2.0"));
    h.metadata.list("c2", Listing::Version("VARY"));
    h.metadata.list("c3", Listing::Gone);

    let RunStatus::Completed { audit, last_cursor } = h.run(LONG).await else {
        panic!("expected a completed traversal");
    };

    assert_eq!(last_cursor, Some(4));
    assert_eq!(audit.inserted_count, 2);
    assert_eq!(audit.updated_count, 2);
    assert_eq!(audit.no_change_count, 0);
    assert_eq!(audit.deleted_count, 1);
    assert_eq!(audit.title_lists.inserted, vec![title("c0"), title("c4")]);
    assert_eq!(audit.title_lists.updated, vec![title("c1"), title("c2")]);
    assert_eq!(h.store.audits().await.len(), 1);

    let primary = h.store.primary().await;
    assert!(!primary.contains_key("c3"));
    assert!(!h.store.backup().await.contains_key("c3"));
    assert!(!h.store.candidate_ids().await.contains(&"c3".to_string()));
    assert_eq!(primary["c1"].version, "2.0");
    assert_eq!(primary["c2"].version, "VARY");
    assert_eq!(primary["c0"].app_size, "50MB");
    assert_eq!(primary["c0"].comments.len(), 3);
    assert_eq!(h.store.backup().await["c4"], primary["c4"]);
    assert!(h.store.is_closed().await);

    let progress = h.progress.load().await.unwrap();
    assert_eq!(progress, Progress::completed_for_period("2026-10"));
}

#[tokio::test(start_paused = true)]
async fn completed_pass_blocks_further_runs_this_period() {
    let h = Harness::new(&["c0"]);
    assert!(matches!(h.run(LONG).await, RunStatus::Completed { .. }));

    assert_eq!(h.run(LONG).await, RunStatus::Denied(DenyReason::NotAllowed));
    assert_eq!(h.metadata.calls("c0"), 1);
}

#[tokio::test(start_paused = true)]
async fn new_candidate_with_missing_download_is_not_inserted() {
    let h = Harness::new(&["c0"]);
    h.sizes.fail_with("c0", 404);

    let RunStatus::Completed { audit, last_cursor } = h.run(LONG).await else {
        panic!("expected a completed traversal");
    };

    assert_eq!(last_cursor, Some(0));
    assert_eq!(audit.inserted_count, 0);
    assert!(h.store.primary().await.get("c0").cloned().is_none());
    assert_eq!(h.sizes.calls("c0"), 1);
}

#[tokio::test(start_paused = true)]
async fn throttled_size_lookup_keeps_previous_size_on_update() {
    let h = Harness::new(&["c0"]);
    h.store.seed(existing("c0", "1.0", "42MB")).await;
    h.metadata.list("c0", Listing::Version("1.1"));
    h.sizes.fail_with("c0", 405);
    let started = tokio::time::Instant::now();

    let RunStatus::Completed { audit, .. } = h.run(LONG).await else {
        panic!("expected a completed traversal");
    };

    assert_eq!(h.sizes.calls("c0"), 6);
    assert_eq!(started.elapsed(), Duration::from_secs(10));
    assert_eq!(audit.updated_count, 1);
    let record = h.store.primary().await.get("c0").cloned().unwrap();
    assert_eq!(record.version, "1.1");
    assert_eq!(record.app_size, "42MB");
}

#[tokio::test(start_paused = true)]
async fn throttled_size_lookup_skips_new_candidate() {
    let h = Harness::new(&["c0", "c1"]);
    h.sizes.fail_with("c0", 405);

    let RunStatus::Completed { audit, .. } = h.run(LONG).await else {
        panic!("expected a completed traversal");
    };

    assert_eq!(h.sizes.calls("c0"), 6);
    assert!(h.store.primary().await.get("c0").cloned().is_none());
    assert!(h.store.backup().await.get("c0").cloned().is_none());
    assert_eq!(audit.inserted_count, 1);
    assert_eq!(audit.title_lists.inserted, vec![title("c1")]);
}

#[tokio::test(start_paused = true)]
async fn batch_fetches_and_size_lookups_overlap() {
    let h = Harness::new(&["c0", "c1"]);
    for id in ["c0", "c1"] {
        h.metadata.slow(id, Duration::from_secs(5));
        h.sizes.slow(id, Duration::from_secs(5));
    }
    let started = tokio::time::Instant::now();

    let RunStatus::Completed { audit, .. } = h.run(LONG).await else {
        panic!("expected a completed traversal");
    };

    // one metadata wait plus one size wait; sequential lookups would take 20s
    assert_eq!(started.elapsed(), Duration::from_secs(10));
    assert_eq!(audit.inserted_count, 2);
}

#[tokio::test(start_paused = true)]
async fn slow_or_failing_item_does_not_hold_up_its_sibling() {
    let h = Harness::new(&["c0", "c1"]);
    h.store.seed(existing("c1", "1.0", "42MB")).await;
    h.metadata.list("c1", Listing::Version("1.1"));
    h.metadata.slow("c0", Duration::from_secs(5));
    h.sizes.slow("c0", Duration::from_secs(8));
    h.sizes.fail_with("c1", 405);
    let started = tokio::time::Instant::now();

    let RunStatus::Completed { audit, .. } = h.run(LONG).await else {
        panic!("expected a completed traversal");
    };

    // c1 retries for 10s while c0's 8s lookup runs alongside it
    assert_eq!(started.elapsed(), Duration::from_secs(15));
    assert_eq!(h.sizes.calls("c1"), 6);
    assert_eq!(audit.inserted_count, 1);
    assert_eq!(audit.updated_count, 1);
    let primary = h.store.primary().await;
    assert_eq!(primary["c0"].app_size, "50MB");
    assert_eq!(primary["c1"].app_size, "42MB");

    let h = Harness::new(&["c0", "c1"]);
    h.metadata.slow("c0", Duration::from_secs(5));
    h.metadata.list("c1", Listing::Broken);
    let started = tokio::time::Instant::now();

    let RunStatus::Completed { audit, .. } = h.run(LONG).await else {
        panic!("expected a completed traversal");
    };
    assert_eq!(started.elapsed(), Duration::from_secs(5));
    assert_eq!(audit.title_lists.inserted, vec![title("c0")]);
}

#[tokio::test(start_paused = true)]
async fn unchanged_version_leaves_store_untouched() {
    let h = Harness::new(&["c0"]);
    let before = existing("c0", "1.0", "42MB");
    h.store.seed(before.clone()).await;

    let RunStatus::Completed { audit, .. } = h.run(LONG).await else {
        panic!("expected a completed traversal");
    };

    assert_eq!(audit.no_change_count, 1);
    assert_eq!(audit.title_lists.no_change, vec![title("c0")]);
    assert_eq!(h.store.primary().await.get("c0").cloned(), Some(before));
    assert_eq!(h.sizes.calls("c0"), 0);
}

#[tokio::test(start_paused = true)]
async fn fetch_failures_and_malformed_records_are_skipped() {
    let h = Harness::new(&["c0", "c1", "c2"]);
    h.metadata.list("c0", Listing::Broken);
    h.metadata.list("c1", Listing::Untitled);

    let RunStatus::Completed { audit, last_cursor } = h.run(LONG).await else {
        panic!("expected a completed traversal");
    };

    assert_eq!(last_cursor, Some(2));
    assert_eq!(audit.processed_count, 1);
    assert_eq!(audit.inserted_count, 1);
    let primary = h.store.primary().await;
    assert!(!primary.contains_key("c0"));
    assert!(!primary.contains_key("c1"));
    // skipped candidates stay listed for the next pass
    assert_eq!(h.store.candidate_ids().await.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn interrupted_run_resumes_without_refetching() {
    let ids = ["c0", "c1", "c2", "c3", "c4", "c5"];
    let h = Harness::new(&ids);

    // batches start at t=0 and t=2; the 3s budget is gone after the second pacing sleep
    let status = h.run(Duration::from_secs(3)).await;
    assert_eq!(
        status,
        RunStatus::Suspended {
            cursor: Some(3),
            runs_this_period: 1
        }
    );
    assert_eq!(h.metadata.total_calls(), 4);
    assert!(h.store.audits().await.is_empty());
    assert!(h.store.is_closed().await);

    let RunStatus::Completed { audit, last_cursor } = h.run(LONG).await else {
        panic!("expected the resumed run to complete");
    };
    assert_eq!(last_cursor, Some(5));
    for id in ids {
        assert_eq!(h.metadata.calls(id), 1, "{id} fetched more than once");
    }

    let reference = Harness::new(&ids);
    let RunStatus::Completed {
        audit: uninterrupted,
        ..
    } = reference.run(LONG).await
    else {
        panic!("expected a completed traversal");
    };
    assert_eq!(audit.inserted_count, uninterrupted.inserted_count);
    assert_eq!(audit.processed_count, uninterrupted.processed_count);
    assert_eq!(audit.title_lists, uninterrupted.title_lists);
    assert_eq!(
        h.store.primary().await.keys().collect::<Vec<_>>(),
        reference.store.primary().await.keys().collect::<Vec<_>>()
    );
}

#[tokio::test(start_paused = true)]
async fn storage_failure_keeps_checkpoint_at_last_committed_batch() {
    let h = Harness::new(&["c0", "c1", "c2", "c3"]);
    h.store.reject_writes_for("c2").await;

    let err = h.engine(LONG).run_once(now()).await.unwrap_err();
    assert!(matches!(err, SyncError::Storage { ref app_id, .. } if app_id == "c2"));
    assert!(h.store.is_closed().await);

    let progress = h.progress.load().await.unwrap();
    assert_eq!(progress.cursor, Some(1));
    assert_eq!(progress.inserted_count, 2);
    assert_eq!(progress.runs_this_period, 0);
    assert!(h.store.primary().await.get("c3").cloned().is_none());

    h.store.accept_all_writes().await;
    let RunStatus::Completed { audit, last_cursor } = h.run(LONG).await else {
        panic!("expected the rerun to complete");
    };
    assert_eq!(last_cursor, Some(3));
    assert_eq!(audit.inserted_count, 4);
    assert_eq!(h.metadata.calls("c0"), 1);
    assert_eq!(h.metadata.calls("c2"), 2);
}

#[tokio::test(start_paused = true)]
async fn storage_failure_mid_batch_checkpoints_the_written_prefix() {
    let h = Harness::new(&["c0", "c1", "c2", "c3"]);
    h.store.reject_writes_for("c3").await;

    let err = h.engine(LONG).run_once(now()).await.unwrap_err();
    assert!(matches!(err, SyncError::Storage { ref app_id, .. } if app_id == "c3"));

    let progress = h.progress.load().await.unwrap();
    assert_eq!(progress.cursor, Some(2));
    assert_eq!(progress.cursor_id.as_deref(), Some("c2"));
    assert_eq!(progress.inserted_count, 3);
    assert!(h.store.primary().await.contains_key("c2"));

    h.store.accept_all_writes().await;
    let RunStatus::Completed { audit, last_cursor } = h.run(LONG).await else {
        panic!("expected the rerun to complete");
    };
    assert_eq!(last_cursor, Some(3));
    assert_eq!(audit.inserted_count, 4);
    assert_eq!(audit.no_change_count, 0);
    assert_eq!(
        audit.title_lists.inserted,
        vec![title("c0"), title("c1"), title("c2"), title("c3")]
    );
    assert_eq!(h.metadata.calls("c2"), 1);
    assert_eq!(h.metadata.calls("c3"), 2);
}

#[tokio::test(start_paused = true)]
async fn deletion_before_a_failed_write_stays_counted() {
    let h = Harness::new(&["c0", "c1", "c2", "c3", "c4"]);
    h.metadata.list("c2", Listing::Gone);
    h.store.reject_writes_for("c3").await;

    let err = h.engine(LONG).run_once(now()).await.unwrap_err();
    assert!(matches!(err, SyncError::Storage { ref app_id, .. } if app_id == "c3"));

    let progress = h.progress.load().await.unwrap();
    assert_eq!(progress.cursor, Some(2));
    assert_eq!(progress.cursor_id.as_deref(), Some("c1"));
    assert_eq!(progress.deleted_count, 1);
    assert!(!h.store.candidate_ids().await.contains(&"c2".to_string()));

    h.store.accept_all_writes().await;
    let RunStatus::Completed { audit, .. } = h.run(LONG).await else {
        panic!("expected the rerun to complete");
    };
    assert_eq!(audit.inserted_count, 4);
    assert_eq!(audit.deleted_count, 1);
    assert_eq!(h.metadata.calls("c2"), 1);
    assert_eq!(h.metadata.calls("c3"), 2);
    assert_eq!(h.metadata.calls("c4"), 1);
}

#[tokio::test(start_paused = true)]
async fn exhausted_quota_denies_without_fetching() {
    let h = Harness::new(&["c0"]);
    let mut progress = Progress::for_period("2026-10");
    progress.runs_this_period = DEFAULT_RUN_CAP;
    h.progress.save(&progress).await.unwrap();

    let status = h.run(LONG).await;

    assert_eq!(
        status,
        RunStatus::Denied(DenyReason::QuotaReached {
            runs: DEFAULT_RUN_CAP,
            cap: DEFAULT_RUN_CAP
        })
    );
    assert_eq!(h.metadata.total_calls(), 0);
    assert!(h.store.is_closed().await);
}

#[tokio::test(start_paused = true)]
async fn quota_resets_in_a_new_period() {
    let h = Harness::new(&["c0"]);
    let mut progress = Progress::completed_for_period("2026-09");
    progress.runs_this_period = DEFAULT_RUN_CAP;
    h.progress.save(&progress).await.unwrap();

    assert!(matches!(h.run(LONG).await, RunStatus::Completed { .. }));
    assert_eq!(h.metadata.calls("c0"), 1);
}

#[tokio::test(start_paused = true)]
async fn deletions_do_not_shift_the_resume_point() {
    let ids = ["a", "b", "c", "d", "e", "f"];
    let h = Harness::new(&ids);
    h.metadata.list("c", Listing::Gone);

    let status = h.run(Duration::from_secs(3)).await;
    assert!(matches!(status, RunStatus::Suspended { cursor: Some(3), .. }));
    assert_eq!(
        h.store.candidate_ids().await,
        vec!["a", "b", "d", "e", "f"]
            .into_iter()
            .map(String::from)
            .collect::<Vec<_>>()
    );

    let RunStatus::Completed { audit, .. } = h.run(LONG).await else {
        panic!("expected the resumed run to complete");
    };
    assert_eq!(audit.inserted_count, 5);
    assert_eq!(audit.deleted_count, 1);
    for id in ["a", "b", "c", "d", "e", "f"] {
        assert_eq!(h.metadata.calls(id), 1, "{id}");
    }
}

#[tokio::test(start_paused = true)]
async fn json_checkpoint_survives_between_engines() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state").join("progress.json");
    let ids = ["c0", "c1", "c2", "c3", "c4"];
    let h = Harness::with_progress_store(&ids, Arc::new(JsonFileProgressStore::new(&path)));

    let status = h.run(Duration::from_secs(3)).await;
    assert!(matches!(status, RunStatus::Suspended { cursor: Some(3), .. }));

    let on_disk = JsonFileProgressStore::new(&path).load().await.unwrap();
    assert_eq!(on_disk.cursor, Some(3));
    assert_eq!(on_disk.cursor_id.as_deref(), Some("c3"));
    assert_eq!(on_disk.inserted_count, 4);
    assert_eq!(on_disk.runs_this_period, 1);

    let RunStatus::Completed { audit, last_cursor } = h.run(LONG).await else {
        panic!("expected the resumed run to complete");
    };
    assert_eq!(last_cursor, Some(4));
    assert_eq!(audit.inserted_count, 5);
    assert_eq!(h.metadata.calls("c4"), 1);
}
