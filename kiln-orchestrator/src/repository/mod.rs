//! Repository Module
//!
//! Data access layer for the orchestrator.
//!
//! [`BuildStore`] reads pipelines and versions and opens write transactions;
//! [`StoreTransaction`] holds the per-pipeline version lock and buffers the
//! rows of one materialization until commit. Dropping a transaction without
//! committing discards every write made through it.

pub mod memory;
pub mod postgres;

pub use memory::{FailPoint, MemoryStore};
pub use postgres::PgStore;

use async_trait::async_trait;
use kiln_core::domain::build::{Build, Stage, Step};
use kiln_core::domain::pipeline::Pipeline;
use kiln_core::domain::version::PipelineVersion;
use uuid::Uuid;

/// Errors produced by store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Underlying database failure
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Another version already holds this number
    #[error("version {number} already exists for pipeline {pipeline_id}")]
    DuplicateVersion { pipeline_id: Uuid, number: i64 },

    /// The pipeline vanished or was deleted before its sequence could be locked
    #[error("pipeline {0} is not available")]
    PipelineUnavailable(Uuid),

    /// A stored row holds a value the domain cannot represent
    #[error("row {id} is corrupt: {reason}")]
    CorruptRow { id: Uuid, reason: String },

    /// A thread panicked while holding in-memory state
    #[error("in-memory store lock poisoned")]
    LockPoisoned,

    /// A write failed on purpose (in-memory store only)
    #[error("injected failure writing {0}")]
    Injected(FailPoint),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Storage contract for materializations
///
/// Implementations must be `Send + Sync` for use behind `Arc<dyn BuildStore>`.
#[async_trait]
pub trait BuildStore: Send + Sync {
    /// Find a pipeline that has not been soft-deleted
    async fn find_pipeline(&self, id: Uuid) -> Result<Option<Pipeline>>;

    /// Find a stored version
    async fn find_version(&self, id: Uuid) -> Result<Option<PipelineVersion>>;

    /// Open a write transaction
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>>;
}

/// One all-or-nothing write unit
#[async_trait]
pub trait StoreTransaction: Send {
    /// Lock the pipeline's version sequence until commit or rollback and
    /// return the highest number already taken
    async fn lock_max_number(&mut self, pipeline_id: Uuid) -> Result<Option<i64>>;

    async fn insert_version(&mut self, version: &PipelineVersion) -> Result<()>;

    async fn insert_build(&mut self, build: &Build) -> Result<()>;

    async fn insert_stage(&mut self, stage: &Stage) -> Result<()>;

    async fn insert_step(&mut self, step: &Step) -> Result<()>;

    /// Make every write visible at once
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Discard every write
    async fn rollback(self: Box<Self>) -> Result<()>;
}
