//! In-memory store
//!
//! Process-local implementation of [`BuildStore`] with the same guarantees
//! as the Postgres store: a per-pipeline lock held from `lock_max_number`
//! until the transaction ends, and writes staged privately until commit.
//! Writes can be made to fail on purpose with [`MemoryStore::fail_next`].
//! Store operations fail with [`StoreError::LockPoisoned`] once a thread has
//! panicked while holding shared state.

use async_trait::async_trait;
use kiln_core::domain::build::{Build, Stage, Step};
use kiln_core::domain::pipeline::Pipeline;
use kiln_core::domain::version::PipelineVersion;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use super::{BuildStore, Result, StoreError, StoreTransaction};

/// Write that [`MemoryStore::fail_next`] can break
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    Version,
    Build,
    Stage,
    Step,
    Commit,
}

impl std::fmt::Display for FailPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailPoint::Version => write!(f, "version"),
            FailPoint::Build => write!(f, "build"),
            FailPoint::Stage => write!(f, "stage"),
            FailPoint::Step => write!(f, "step"),
            FailPoint::Commit => write!(f, "commit"),
        }
    }
}

#[derive(Debug, Default, Clone)]
struct Rows {
    versions: Vec<PipelineVersion>,
    builds: Vec<Build>,
    stages: Vec<Stage>,
    steps: Vec<Step>,
}

#[derive(Default)]
struct Inner {
    pipelines: Mutex<HashMap<Uuid, Pipeline>>,
    rows: Mutex<Rows>,
    sequences: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
    fail_point: Mutex<Option<FailPoint>>,
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex.lock().map_err(|_| StoreError::LockPoisoned)
}

/// Inspection access for callers outside a transaction
fn peek<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Inner {
    /// Fail once if `point` is armed
    fn trip(&self, point: FailPoint) -> Result<()> {
        let mut armed = lock(&self.fail_point)?;
        if *armed == Some(point) {
            *armed = None;
            return Err(StoreError::Injected(point));
        }
        Ok(())
    }

    fn sequence(&self, pipeline_id: Uuid) -> Result<Arc<tokio::sync::Mutex<()>>> {
        Ok(lock(&self.sequences)?.entry(pipeline_id).or_default().clone())
    }
}

/// In-memory build store
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a pipeline
    pub fn insert_pipeline(&self, pipeline: Pipeline) {
        peek(&self.inner.pipelines).insert(pipeline.id, pipeline);
    }

    /// Make the next write at `point` fail
    pub fn fail_next(&self, point: FailPoint) {
        *peek(&self.inner.fail_point) = Some(point);
    }

    /// Committed versions of a pipeline, by number
    pub fn versions(&self, pipeline_id: Uuid) -> Vec<PipelineVersion> {
        let mut versions: Vec<PipelineVersion> = peek(&self.inner.rows)
            .versions
            .iter()
            .filter(|v| v.pipeline_id == pipeline_id)
            .cloned()
            .collect();
        versions.sort_by_key(|v| v.number);
        versions
    }

    pub fn builds(&self) -> Vec<Build> {
        peek(&self.inner.rows).builds.clone()
    }

    pub fn stages(&self) -> Vec<Stage> {
        peek(&self.inner.rows).stages.clone()
    }

    pub fn steps(&self) -> Vec<Step> {
        peek(&self.inner.rows).steps.clone()
    }

    /// Committed rows across all four tables
    pub fn row_count(&self) -> usize {
        let rows = peek(&self.inner.rows);
        rows.versions.len() + rows.builds.len() + rows.stages.len() + rows.steps.len()
    }
}

#[async_trait]
impl BuildStore for MemoryStore {
    async fn find_pipeline(&self, id: Uuid) -> Result<Option<Pipeline>> {
        Ok(lock(&self.inner.pipelines)?
            .get(&id)
            .filter(|p| !p.deleted)
            .cloned())
    }

    async fn find_version(&self, id: Uuid) -> Result<Option<PipelineVersion>> {
        Ok(lock(&self.inner.rows)?
            .versions
            .iter()
            .find(|v| v.id == id)
            .cloned())
    }

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        Ok(Box::new(MemoryTransaction {
            inner: self.inner.clone(),
            staged: Rows::default(),
            locks: Vec::new(),
        }))
    }
}

struct MemoryTransaction {
    inner: Arc<Inner>,
    staged: Rows,
    locks: Vec<OwnedMutexGuard<()>>,
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn lock_max_number(&mut self, pipeline_id: Uuid) -> Result<Option<i64>> {
        let sequence = self.inner.sequence(pipeline_id)?;
        self.locks.push(sequence.lock_owned().await);

        let available = lock(&self.inner.pipelines)?
            .get(&pipeline_id)
            .is_some_and(|p| !p.deleted);
        if !available {
            return Err(StoreError::PipelineUnavailable(pipeline_id));
        }

        Ok(lock(&self.inner.rows)?
            .versions
            .iter()
            .filter(|v| v.pipeline_id == pipeline_id)
            .map(|v| v.number)
            .max())
    }

    async fn insert_version(&mut self, version: &PipelineVersion) -> Result<()> {
        self.inner.trip(FailPoint::Version)?;
        self.staged.versions.push(version.clone());
        Ok(())
    }

    async fn insert_build(&mut self, build: &Build) -> Result<()> {
        self.inner.trip(FailPoint::Build)?;
        self.staged.builds.push(build.clone());
        Ok(())
    }

    async fn insert_stage(&mut self, stage: &Stage) -> Result<()> {
        self.inner.trip(FailPoint::Stage)?;
        self.staged.stages.push(stage.clone());
        Ok(())
    }

    async fn insert_step(&mut self, step: &Step) -> Result<()> {
        self.inner.trip(FailPoint::Step)?;
        self.staged.steps.push(step.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.inner.trip(FailPoint::Commit)?;

        let mut rows = lock(&self.inner.rows)?;
        for version in &self.staged.versions {
            let taken = rows
                .versions
                .iter()
                .any(|v| v.pipeline_id == version.pipeline_id && v.number == version.number);
            if taken {
                return Err(StoreError::DuplicateVersion {
                    pipeline_id: version.pipeline_id,
                    number: version.number,
                });
            }
        }

        let staged = self.staged.clone();
        rows.versions.extend(staged.versions);
        rows.builds.extend(staged.builds);
        rows.stages.extend(staged.stages);
        rows.steps.extend(staged.steps);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
