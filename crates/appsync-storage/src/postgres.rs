use appsync_core::{AuditRecord, Candidate, RecordPatch, StoredRecord};
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::info;

use crate::{CandidateSource, CatalogStore, StoreError};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS candidates (
        position BIGSERIAL PRIMARY KEY,
        app_id TEXT NOT NULL UNIQUE,
        download_obb BOOLEAN NOT NULL DEFAULT FALSE,
        is_available_on_play_store BOOLEAN NOT NULL DEFAULT TRUE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS apps (
        app_id TEXT PRIMARY KEY,
        record JSONB NOT NULL,
        written_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS apps_backup (
        app_id TEXT PRIMARY KEY,
        record JSONB NOT NULL,
        written_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sync_log (
        run_id UUID PRIMARY KEY,
        logged_at TIMESTAMPTZ NOT NULL,
        record JSONB NOT NULL
    )
    "#,
];

/// Postgres-backed catalog. Records are JSONB documents so updates can merge a
/// partial patch with `record || patch`.
#[derive(Debug, Clone)]
pub struct PgCatalogStore {
    pool: PgPool,
}

impl PgCatalogStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("catalog schema ready");
        Ok(())
    }

    /// Appends candidates to the traversal list, ignoring ids already present.
    pub async fn import_candidates(&self, candidates: &[Candidate]) -> Result<u64, StoreError> {
        let mut added = 0;
        let mut tx = self.pool.begin().await?;
        for candidate in candidates {
            let result = sqlx::query(
                r#"
                INSERT INTO candidates (app_id, download_obb, is_available_on_play_store)
                VALUES ($1, $2, $3)
                ON CONFLICT (app_id) DO NOTHING
                "#,
            )
            .bind(&candidate.app_id)
            .bind(candidate.download_obb)
            .bind(candidate.is_available_on_play_store)
            .execute(&mut *tx)
            .await?;
            added += result.rows_affected();
        }
        tx.commit().await?;
        Ok(added)
    }
}

#[async_trait]
impl CatalogStore for PgCatalogStore {
    async fn find(&self, app_id: &str) -> Result<Option<StoredRecord>, StoreError> {
        let row = sqlx::query("SELECT record FROM apps WHERE app_id = $1")
            .bind(app_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let Json(record): Json<StoredRecord> = row.try_get("record")?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn insert(&self, record: &StoredRecord) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for table in ["apps", "apps_backup"] {
            sqlx::query(&format!(
                r#"
                INSERT INTO {table} (app_id, record)
                VALUES ($1, $2)
                ON CONFLICT (app_id) DO UPDATE
                   SET record = EXCLUDED.record,
                       written_at = NOW()
                "#
            ))
            .bind(&record.app_id)
            .bind(Json(record))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn update(&self, app_id: &str, patch: &RecordPatch) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for table in ["apps", "apps_backup"] {
            sqlx::query(&format!(
                r#"
                UPDATE {table}
                   SET record = record || $2,
                       written_at = NOW()
                 WHERE app_id = $1
                "#
            ))
            .bind(app_id)
            .bind(Json(patch))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete(&self, app_id: &str) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for table in ["candidates", "apps", "apps_backup"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE app_id = $1"))
                .bind(app_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn append_audit(&self, audit: &AuditRecord) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO sync_log (run_id, logged_at, record) VALUES ($1, $2, $3)")
            .bind(audit.run_id)
            .bind(audit.timestamp)
            .bind(Json(audit))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl CandidateSource for PgCatalogStore {
    async fn load_candidates(&self) -> Result<Vec<Candidate>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT app_id, download_obb, is_available_on_play_store
              FROM candidates
             ORDER BY position
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(Candidate {
                app_id: row.try_get("app_id")?,
                download_obb: row.try_get("download_obb")?,
                is_available_on_play_store: row.try_get("is_available_on_play_store")?,
            });
        }
        Ok(out)
    }
}
