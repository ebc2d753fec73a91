//! Catalog persistence, candidate source, and checkpoint storage.

use std::collections::{BTreeMap, HashSet};

use appsync_core::{AuditRecord, Candidate, Progress, RecordPatch, StoredRecord};
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;

mod postgres;
mod progress;

pub use postgres::PgCatalogStore;
pub use progress::JsonFileProgressStore;

pub const CRATE_NAME: &str = "appsync-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serializing document: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("write rejected for {app_id}: {reason}")]
    WriteRejected { app_id: String, reason: String },
}

/// Primary catalog collection, mirrored into a backup collection on every write.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn find(&self, app_id: &str) -> Result<Option<StoredRecord>, StoreError>;

    /// Writes the record to the primary and backup collections.
    async fn insert(&self, record: &StoredRecord) -> Result<(), StoreError>;

    /// Merges `patch` into the stored record in both collections.
    async fn update(&self, app_id: &str, patch: &RecordPatch) -> Result<(), StoreError>;

    /// Removes the candidate entry and every stored copy of the record.
    async fn delete(&self, app_id: &str) -> Result<(), StoreError>;

    async fn append_audit(&self, audit: &AuditRecord) -> Result<(), StoreError>;

    /// Releases held connections. Safe to call more than once.
    async fn close(&self) {}
}

#[async_trait]
pub trait CandidateSource: Send + Sync {
    /// Ordered candidate list, read once at the start of a run.
    async fn load_candidates(&self) -> Result<Vec<Candidate>, StoreError>;
}

#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Saved checkpoint, or defaults when none exists.
    async fn load(&self) -> anyhow::Result<Progress>;

    /// Replaces the checkpoint atomically.
    async fn save(&self, progress: &Progress) -> anyhow::Result<()>;

    async fn clear(&self) -> anyhow::Result<()>;
}

#[derive(Debug, Default)]
struct MemoryState {
    candidates: Vec<Candidate>,
    primary: BTreeMap<String, StoredRecord>,
    backup: BTreeMap<String, StoredRecord>,
    audits: Vec<AuditRecord>,
    rejecting: HashSet<String>,
    closed: bool,
}

impl MemoryState {
    fn check_writable(&self, app_id: &str) -> Result<(), StoreError> {
        if self.rejecting.contains(app_id) {
            return Err(StoreError::WriteRejected {
                app_id: app_id.to_string(),
                reason: "configured to reject writes".to_string(),
            });
        }
        Ok(())
    }
}

/// Process-local store used for dry runs and tests.
#[derive(Debug, Default)]
pub struct InMemoryCatalogStore {
    state: Mutex<MemoryState>,
}

impl InMemoryCatalogStore {
    pub fn with_candidates(candidates: Vec<Candidate>) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                candidates,
                ..MemoryState::default()
            }),
        }
    }

    /// Places an existing record in both collections.
    pub async fn seed(&self, record: StoredRecord) {
        let mut state = self.state.lock().await;
        state.backup.insert(record.app_id.clone(), record.clone());
        state.primary.insert(record.app_id.clone(), record);
    }

    /// Makes every subsequent write touching `app_id` fail.
    pub async fn reject_writes_for(&self, app_id: &str) {
        self.state.lock().await.rejecting.insert(app_id.to_string());
    }

    pub async fn accept_all_writes(&self) {
        self.state.lock().await.rejecting.clear();
    }

    pub async fn primary(&self) -> BTreeMap<String, StoredRecord> {
        self.state.lock().await.primary.clone()
    }

    pub async fn backup(&self) -> BTreeMap<String, StoredRecord> {
        self.state.lock().await.backup.clone()
    }

    pub async fn audits(&self) -> Vec<AuditRecord> {
        self.state.lock().await.audits.clone()
    }

    pub async fn candidate_ids(&self) -> Vec<String> {
        self.state
            .lock()
            .await
            .candidates
            .iter()
            .map(|c| c.app_id.clone())
            .collect()
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }
}

#[async_trait]
impl CatalogStore for InMemoryCatalogStore {
    async fn find(&self, app_id: &str) -> Result<Option<StoredRecord>, StoreError> {
        Ok(self.state.lock().await.primary.get(app_id).cloned())
    }

    async fn insert(&self, record: &StoredRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.check_writable(&record.app_id)?;
        state.primary.insert(record.app_id.clone(), record.clone());
        state.backup.insert(record.app_id.clone(), record.clone());
        Ok(())
    }

    async fn update(&self, app_id: &str, patch: &RecordPatch) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.check_writable(app_id)?;
        if let Some(record) = state.primary.get_mut(app_id) {
            record.apply(patch);
        }
        if let Some(record) = state.backup.get_mut(app_id) {
            record.apply(patch);
        }
        Ok(())
    }

    async fn delete(&self, app_id: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.check_writable(app_id)?;
        state.candidates.retain(|c| c.app_id != app_id);
        state.primary.remove(app_id);
        state.backup.remove(app_id);
        Ok(())
    }

    async fn append_audit(&self, audit: &AuditRecord) -> Result<(), StoreError> {
        self.state.lock().await.audits.push(audit.clone());
        Ok(())
    }

    async fn close(&self) {
        self.state.lock().await.closed = true;
    }
}

#[async_trait]
impl CandidateSource for InMemoryCatalogStore {
    async fn load_candidates(&self) -> Result<Vec<Candidate>, StoreError> {
        Ok(self.state.lock().await.candidates.clone())
    }
}

/// Checkpoint held in memory; survives only as long as the value.
#[derive(Debug, Default)]
pub struct InMemoryProgressStore {
    saved: Mutex<Option<Progress>>,
    save_count: Mutex<usize>,
}

impl InMemoryProgressStore {
    pub fn with_progress(progress: Progress) -> Self {
        Self {
            saved: Mutex::new(Some(progress)),
            save_count: Mutex::new(0),
        }
    }

    pub async fn snapshot(&self) -> Option<Progress> {
        self.saved.lock().await.clone()
    }

    pub async fn save_count(&self) -> usize {
        *self.save_count.lock().await
    }
}

#[async_trait]
impl ProgressStore for InMemoryProgressStore {
    async fn load(&self) -> anyhow::Result<Progress> {
        Ok(self.saved.lock().await.clone().unwrap_or_default())
    }

    async fn save(&self, progress: &Progress) -> anyhow::Result<()> {
        *self.saved.lock().await = Some(progress.clone());
        *self.save_count.lock().await += 1;
        Ok(())
    }

    async fn clear(&self) -> anyhow::Result<()> {
        *self.saved.lock().await = None;
        Ok(())
    }
}
