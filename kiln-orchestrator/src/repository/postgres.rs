//! Postgres Store
//!
//! Handles all database operations for materializations. The version
//! sequence of a pipeline is serialized by locking its `pipelines` row
//! (`SELECT ... FOR UPDATE`) inside the write transaction; the
//! `(pipeline_id, number)` unique constraint backs this up.

use async_trait::async_trait;
use kiln_core::domain::build::{Build, Stage, Step};
use kiln_core::domain::pipeline::Pipeline;
use kiln_core::domain::version::{PipelineVersion, TriggerEvent};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::{BuildStore, Result, StoreError, StoreTransaction};
use crate::config::Config;
use crate::db;

/// Postgres-backed build store
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Validate `config`, connect and run migrations
    pub async fn connect(config: &Config) -> anyhow::Result<Self> {
        config.validate()?;
        let pool = db::create_pool(config).await?;
        db::run_migrations(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl BuildStore for PgStore {
    async fn find_pipeline(&self, id: Uuid) -> Result<Option<Pipeline>> {
        let row = sqlx::query_as::<_, PipelineRow>(
            r#"
            SELECT id, name, display_name, content, clone_url, username,
                   access_token, deleted, created_at, updated_at
            FROM pipelines
            WHERE id = $1 AND deleted = FALSE
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into()))
    }

    async fn find_version(&self, id: Uuid) -> Result<Option<PipelineVersion>> {
        let row = sqlx::query_as::<_, VersionRow>(
            r#"
            SELECT id, pipeline_id, number, event, sha, pipeline_name,
                   pipeline_display_name, clone_url, content, created_at
            FROM pipeline_versions
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(PipelineVersion::try_from).transpose()
    }

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTransaction { tx }))
    }
}

/// Write transaction over one pooled connection
pub struct PgTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTransaction for PgTransaction {
    async fn lock_max_number(&mut self, pipeline_id: Uuid) -> Result<Option<i64>> {
        let locked: Option<Uuid> = sqlx::query_scalar(
            "SELECT id FROM pipelines WHERE id = $1 AND deleted = FALSE FOR UPDATE",
        )
        .bind(pipeline_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        if locked.is_none() {
            return Err(StoreError::PipelineUnavailable(pipeline_id));
        }

        let max: Option<i64> =
            sqlx::query_scalar("SELECT MAX(number) FROM pipeline_versions WHERE pipeline_id = $1")
                .bind(pipeline_id)
                .fetch_one(&mut *self.tx)
                .await?;

        Ok(max)
    }

    async fn insert_version(&mut self, version: &PipelineVersion) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO pipeline_versions (
                id, pipeline_id, number, event, sha, pipeline_name,
                pipeline_display_name, clone_url, content, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(version.id)
        .bind(version.pipeline_id)
        .bind(version.number)
        .bind(version.event.as_str())
        .bind(&version.sha)
        .bind(&version.pipeline_name)
        .bind(&version.pipeline_display_name)
        .bind(&version.clone_url)
        .bind(&version.content)
        .bind(version.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|err| {
            if let sqlx::Error::Database(db_err) = &err {
                if db_err.is_unique_violation() {
                    return StoreError::DuplicateVersion {
                        pipeline_id: version.pipeline_id,
                        number: version.number,
                    };
                }
            }
            StoreError::Database(err)
        })?;

        Ok(())
    }

    async fn insert_build(&mut self, build: &Build) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO builds (id, pipeline_id, version_id, status, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(build.id)
        .bind(build.pipeline_id)
        .bind(build.version_id)
        .bind(build.status.as_str())
        .bind(build.created_at)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn insert_stage(&mut self, stage: &Stage) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO stages (
                id, build_id, version_id, name, display_name, kind,
                sort, status, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(stage.id)
        .bind(stage.build_id)
        .bind(stage.version_id)
        .bind(&stage.name)
        .bind(&stage.display_name)
        .bind(&stage.kind)
        .bind(stage.order)
        .bind(stage.status.as_str())
        .bind(stage.created_at)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn insert_step(&mut self, step: &Step) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO steps (
                id, build_id, stage_id, version_id, name, display_name, kind,
                commands, waits, env, sort, status, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(step.id)
        .bind(step.build_id)
        .bind(step.stage_id)
        .bind(step.version_id)
        .bind(&step.name)
        .bind(&step.display_name)
        .bind(&step.kind)
        .bind(&step.commands)
        .bind(&step.waits)
        .bind(&step.env)
        .bind(step.order)
        .bind(step.status.as_str())
        .bind(step.created_at)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct PipelineRow {
    id: Uuid,
    name: String,
    display_name: String,
    content: String,
    clone_url: String,
    username: String,
    access_token: String,
    deleted: bool,
    created_at: chrono::DateTime<chrono::Utc>,
    updated_at: chrono::DateTime<chrono::Utc>,
}

impl From<PipelineRow> for Pipeline {
    fn from(row: PipelineRow) -> Self {
        Pipeline {
            id: row.id,
            name: row.name,
            display_name: row.display_name,
            content: row.content,
            clone_url: row.clone_url,
            username: row.username,
            access_token: row.access_token,
            deleted: row.deleted,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct VersionRow {
    id: Uuid,
    pipeline_id: Uuid,
    number: i64,
    event: String,
    sha: String,
    pipeline_name: String,
    pipeline_display_name: String,
    clone_url: String,
    content: String,
    created_at: chrono::DateTime<chrono::Utc>,
}

impl TryFrom<VersionRow> for PipelineVersion {
    type Error = StoreError;

    fn try_from(row: VersionRow) -> Result<Self> {
        let event = TriggerEvent::parse(&row.event).ok_or_else(|| StoreError::CorruptRow {
            id: row.id,
            reason: format!("unknown trigger event '{}'", row.event),
        })?;

        Ok(PipelineVersion {
            id: row.id,
            pipeline_id: row.pipeline_id,
            number: row.number,
            event,
            sha: row.sha,
            pipeline_name: row.pipeline_name,
            pipeline_display_name: row.pipeline_display_name,
            clone_url: row.clone_url,
            content: row.content,
            created_at: row.created_at,
        })
    }
}
