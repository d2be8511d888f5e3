//! Build Service
//!
//! Trigger entry points. `run` materializes the live pipeline definition at a
//! source reference; `rebuild` re-materializes a stored version's document.
//! Both go through the same procedure:
//!
//! 1. Resolve the pipeline and the definition document
//! 2. Parse, check and normalize the definition
//! 3. Allocate the next version number (inside the write transaction)
//! 4. Build the canonical graph
//! 5. Persist its rows and commit
//! 6. Dispatch its runtime projection to the engine
//!
//! Nothing is written before step 3, and nothing is dispatched unless step 5
//! committed.

use kiln_core::definition::{self, DefinitionError};
use kiln_core::domain::pipeline::Pipeline;
use kiln_core::domain::version::{PipelineVersion, TriggerEvent};
use kiln_core::graph::{GraphBuilder, TriggerContext};
use kiln_core::id::{IdGenerator, UuidGenerator};
use kiln_core::runtime;
use std::sync::Arc;
use uuid::Uuid;

use crate::repository::{BuildStore, StoreError};
use crate::service::dispatch::{DispatchError, Dispatcher};
use crate::service::{allocator, persister};

/// Service error type
#[derive(Debug, thiserror::Error)]
pub enum MaterializeError {
    #[error("Pipeline {0} not found")]
    PipelineNotFound(Uuid),

    #[error("Pipeline version {0} not found")]
    VersionNotFound(Uuid),

    #[error("Pipeline {0} has an empty definition")]
    EmptyDefinition(Uuid),

    #[error(transparent)]
    InvalidDefinition(#[from] DefinitionError),

    #[error("Failed to read pipeline data: {0}")]
    Lookup(#[source] StoreError),

    #[error("Failed to allocate version number: {0}")]
    NumberingFailure(#[source] StoreError),

    #[error("Failed to persist build: {0}")]
    PersistenceFailure(#[source] StoreError),

    /// The build is durable and `Pending` but the engine never received it
    #[error("Build {} persisted but not dispatched: {source}", .build.id)]
    DispatchFailure {
        version: Box<PipelineVersion>,
        build: Box<runtime::Build>,
        #[source]
        source: DispatchError,
    },
}

pub type Result<T> = std::result::Result<T, MaterializeError>;

/// Materializes triggers into persisted, dispatched builds
#[derive(Clone)]
pub struct BuildService {
    store: Arc<dyn BuildStore>,
    ids: Arc<dyn IdGenerator>,
    dispatcher: Dispatcher,
}

impl BuildService {
    pub fn new(store: Arc<dyn BuildStore>, dispatcher: Dispatcher) -> Self {
        Self {
            store,
            ids: Arc::new(UuidGenerator),
            dispatcher,
        }
    }

    /// Use a different ID source for new graph nodes
    pub fn with_ids(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    /// Materialize the live definition of `pipeline_id` at `sha`
    pub async fn run(&self, pipeline_id: Uuid, sha: &str) -> Result<PipelineVersion> {
        let pipeline = self.find_pipeline(pipeline_id).await?;

        if !pipeline.has_content() {
            return Err(MaterializeError::EmptyDefinition(pipeline.id));
        }

        let content = pipeline.content.clone();
        self.materialize(&pipeline, TriggerEvent::Run, sha, &content)
            .await
    }

    /// Materialize a stored version's document again, as a new version
    pub async fn rebuild(&self, version: &PipelineVersion) -> Result<PipelineVersion> {
        let pipeline = self.find_pipeline(version.pipeline_id).await?;

        if version.content.trim().is_empty() {
            return Err(MaterializeError::EmptyDefinition(pipeline.id));
        }

        self.materialize(
            &pipeline,
            TriggerEvent::Rebuild,
            &version.sha,
            &version.content,
        )
        .await
    }

    /// Load a stored version by ID and rebuild it
    pub async fn rebuild_version(&self, version_id: Uuid) -> Result<PipelineVersion> {
        let version = self
            .store
            .find_version(version_id)
            .await
            .map_err(MaterializeError::Lookup)?
            .ok_or(MaterializeError::VersionNotFound(version_id))?;

        self.rebuild(&version).await
    }

    async fn find_pipeline(&self, id: Uuid) -> Result<Pipeline> {
        self.store
            .find_pipeline(id)
            .await
            .map_err(MaterializeError::Lookup)?
            .ok_or(MaterializeError::PipelineNotFound(id))
    }

    async fn materialize(
        &self,
        pipeline: &Pipeline,
        event: TriggerEvent,
        sha: &str,
        content: &str,
    ) -> Result<PipelineVersion> {
        let mut definition = definition::parse(content)?;
        definition.check()?;
        definition.normalize();

        let mut tx = self
            .store
            .begin()
            .await
            .map_err(MaterializeError::NumberingFailure)?;

        let number = match allocator::allocate_number(tx.as_mut(), pipeline.id).await {
            Ok(number) => number,
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!("Rollback after numbering failure failed: {}", rollback_err);
                }
                return Err(MaterializeError::NumberingFailure(err));
            }
        };

        let trigger = TriggerContext {
            pipeline,
            event,
            sha,
            content,
        };
        let graph = GraphBuilder::new(self.ids.as_ref()).build(trigger, &definition, number);

        persister::persist(tx, &graph.records())
            .await
            .map_err(MaterializeError::PersistenceFailure)?;

        tracing::info!(
            "Pipeline {} version {} materialized ({}): build {}, {} stages, {} steps",
            pipeline.name,
            number,
            event,
            graph.build.id,
            graph.stages.len(),
            graph.step_count()
        );

        let build = graph.runtime();
        if let Err(source) = self.dispatcher.dispatch(build.clone()).await {
            tracing::warn!(
                "Build {} of pipeline {} is persisted but was not dispatched: {}",
                build.id,
                pipeline.id,
                source
            );
            return Err(MaterializeError::DispatchFailure {
                version: Box::new(graph.version),
                build: Box::new(build),
                source,
            });
        }

        Ok(graph.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{FailPoint, MemoryStore};
    use crate::service::dispatch::EngineIntake;
    use async_trait::async_trait;
    use chrono::Utc;
    use kiln_core::domain::build::BuildStatus;
    use kiln_core::id::SequentialGenerator;
    use std::collections::HashSet;
    use std::sync::Mutex;

    const DOCUMENT: &str = r#"{
        "name": "ci",
        "stages": [
            {"name": "build", "stage": "build", "steps": [
                {"name": "fetch", "step": "shell@sh", "commands": "cargo fetch"},
                {"name": "compile", "step": "shell@sh", "commands": ["cargo build"],
                 "env": {"PROFILE": "release"}},
                {"name": "lint", "step": "shell@sh", "commands": ["cargo clippy"]}
            ]},
            {"name": "test", "stage": "test", "steps": [
                {"name": "unit", "step": "shell@sh", "commands": ["cargo test"],
                 "waits": ["compile"]},
                {"name": "doc", "step": "shell@sh", "commands": ["cargo test --doc"]}
            ]}
        ]
    }"#;

    const OTHER_DOCUMENT: &str = r#"{
        "name": "ci",
        "stages": [
            {"name": "release", "stage": "deploy", "steps": [
                {"name": "publish", "step": "shell@sh", "commands": ["cargo publish"]}
            ]}
        ]
    }"#;

    /// Intake that remembers every submitted graph
    #[derive(Default)]
    struct RecordingIntake {
        submitted: Mutex<Vec<runtime::Build>>,
    }

    impl RecordingIntake {
        fn submitted(&self) -> Vec<runtime::Build> {
            self.submitted.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EngineIntake for RecordingIntake {
        async fn submit(&self, build: runtime::Build) -> std::result::Result<(), DispatchError> {
            self.submitted.lock().unwrap().push(build);
            Ok(())
        }
    }

    struct UnreachableIntake;

    #[async_trait]
    impl EngineIntake for UnreachableIntake {
        async fn submit(&self, _build: runtime::Build) -> std::result::Result<(), DispatchError> {
            Err(DispatchError::Unreachable("connection refused".to_string()))
        }
    }

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn pipeline(content: &str) -> Pipeline {
        Pipeline {
            id: Uuid::new_v4(),
            name: "ci".to_string(),
            display_name: "CI".to_string(),
            content: content.to_string(),
            clone_url: "https://example.com/repo.git".to_string(),
            username: "octo".to_string(),
            access_token: "token".to_string(),
            deleted: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    struct Harness {
        store: MemoryStore,
        intake: Arc<RecordingIntake>,
        service: BuildService,
        pipeline: Pipeline,
    }

    fn harness(content: &str) -> Harness {
        init_tracing();
        let store = MemoryStore::new();
        let pipeline = pipeline(content);
        store.insert_pipeline(pipeline.clone());

        let intake = Arc::new(RecordingIntake::default());
        let service = BuildService::new(
            Arc::new(store.clone()),
            Dispatcher::new(intake.clone()),
        );

        Harness {
            store,
            intake,
            service,
            pipeline,
        }
    }

    fn assert_nothing_happened(h: &Harness) {
        assert_eq!(h.store.row_count(), 0);
        assert!(h.intake.submitted().is_empty());
    }

    #[tokio::test]
    async fn test_run_materializes_graph() {
        let h = harness(DOCUMENT);

        let version = h.service.run(h.pipeline.id, "abc123").await.unwrap();

        assert_eq!(version.number, 1);
        assert_eq!(version.event, TriggerEvent::Run);
        assert_eq!(version.sha, "abc123");
        assert_eq!(version.content, DOCUMENT);
        assert_eq!(h.store.versions(h.pipeline.id), vec![version.clone()]);

        let builds = h.store.builds();
        assert_eq!(builds.len(), 1);
        assert_eq!(builds[0].version_id, version.id);
        assert_eq!(builds[0].status, BuildStatus::Pending);

        let stages = h.store.stages();
        assert_eq!(stages.len(), 2);
        assert_eq!(stages.iter().map(|s| s.order).collect::<Vec<_>>(), vec![0, 1]);
        assert!(stages.iter().all(|s| s.status == BuildStatus::Pending));

        let steps = h.store.steps();
        assert_eq!(steps.len(), 5);
        assert!(steps.iter().all(|s| s.status == BuildStatus::Pending));
        let orders_in = |stage_id: Uuid| -> Vec<i32> {
            steps
                .iter()
                .filter(|s| s.stage_id == stage_id)
                .map(|s| s.order)
                .collect()
        };
        assert_eq!(orders_in(stages[0].id), vec![0, 1, 2]);
        assert_eq!(orders_in(stages[1].id), vec![0, 1]);

        let submitted = h.intake.submitted();
        assert_eq!(submitted.len(), 1);
        let build = &submitted[0];
        assert_eq!(build.id, builds[0].id);
        assert_eq!(build.repo.sha, "abc123");

        let runtime_stage_ids: Vec<Uuid> = build.stages.iter().map(|s| s.id).collect();
        let stored_stage_ids: Vec<Uuid> = stages.iter().map(|s| s.id).collect();
        assert_eq!(runtime_stage_ids, stored_stage_ids);

        let runtime_step_ids: Vec<Uuid> = build.steps().map(|s| s.id).collect();
        let stored_step_ids: Vec<Uuid> = steps.iter().map(|s| s.id).collect();
        assert_eq!(runtime_step_ids, stored_step_ids);
    }

    #[tokio::test]
    async fn test_run_stores_normalized_commands() {
        let h = harness(DOCUMENT);
        h.service.run(h.pipeline.id, "abc").await.unwrap();

        let steps = h.store.steps();
        let compile = steps.iter().find(|s| s.name == "compile").unwrap();
        assert_eq!(compile.commands, serde_json::json!(["cargo build"]));
        assert_eq!(compile.env, serde_json::json!({"PROFILE": "release"}));

        let unit = steps.iter().find(|s| s.name == "unit").unwrap();
        assert_eq!(unit.waits, serde_json::json!(["compile"]));

        let submitted = h.intake.submitted();
        let fetch = submitted[0].steps().find(|s| s.name == "fetch").unwrap();
        assert_eq!(fetch.commands, vec!["cargo fetch"]);
    }

    #[tokio::test]
    async fn test_sequential_runs_number_from_one() {
        let h = harness(DOCUMENT);

        for expected in 1..=4 {
            let version = h.service.run(h.pipeline.id, "abc").await.unwrap();
            assert_eq!(version.number, expected);
        }

        let numbers: Vec<i64> = h
            .store
            .versions(h.pipeline.id)
            .iter()
            .map(|v| v.number)
            .collect();
        assert_eq!(numbers, vec![1, 2, 3, 4]);
        assert_eq!(h.intake.submitted().len(), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_runs_never_share_a_number() {
        let h = harness(DOCUMENT);

        let mut handles = Vec::new();
        for i in 0..16 {
            let service = h.service.clone();
            let pipeline_id = h.pipeline.id;
            handles.push(tokio::spawn(async move {
                service.run(pipeline_id, &format!("sha-{}", i)).await
            }));
        }

        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let numbers: Vec<i64> = h
            .store
            .versions(h.pipeline.id)
            .iter()
            .map(|v| v.number)
            .collect();
        assert_eq!(numbers, (1..=16).collect::<Vec<i64>>());
        assert_eq!(h.store.builds().len(), 16);
        assert_eq!(h.intake.submitted().len(), 16);
    }

    #[tokio::test]
    async fn test_pipelines_number_independently() {
        let h = harness(DOCUMENT);
        let other = pipeline(DOCUMENT);
        h.store.insert_pipeline(other.clone());

        h.service.run(h.pipeline.id, "a").await.unwrap();
        h.service.run(h.pipeline.id, "b").await.unwrap();
        let first_other = h.service.run(other.id, "c").await.unwrap();

        assert_eq!(first_other.number, 1);
    }

    #[tokio::test]
    async fn test_run_unknown_pipeline() {
        let h = harness(DOCUMENT);
        let missing = Uuid::new_v4();

        let err = h.service.run(missing, "abc").await.unwrap_err();
        assert!(matches!(err, MaterializeError::PipelineNotFound(id) if id == missing));
        assert_nothing_happened(&h);
    }

    #[tokio::test]
    async fn test_run_deleted_pipeline() {
        let h = harness(DOCUMENT);
        let mut deleted = h.pipeline.clone();
        deleted.deleted = true;
        h.store.insert_pipeline(deleted);

        let err = h.service.run(h.pipeline.id, "abc").await.unwrap_err();
        assert!(matches!(err, MaterializeError::PipelineNotFound(_)));
        assert_nothing_happened(&h);
    }

    #[tokio::test]
    async fn test_run_empty_definition() {
        let h = harness("   ");

        let err = h.service.run(h.pipeline.id, "abc").await.unwrap_err();
        assert!(matches!(err, MaterializeError::EmptyDefinition(_)));
        assert_nothing_happened(&h);
    }

    #[tokio::test]
    async fn test_run_unparsable_definition() {
        let h = harness("stages: [oops");

        let err = h.service.run(h.pipeline.id, "abc").await.unwrap_err();
        assert!(matches!(
            err,
            MaterializeError::InvalidDefinition(DefinitionError::Parse(_))
        ));
        assert_nothing_happened(&h);
    }

    #[tokio::test]
    async fn test_run_invalid_definition() {
        let h = harness(r#"{"name": "ci", "stages": [{"name": "build", "steps": []}]}"#);

        let err = h.service.run(h.pipeline.id, "abc").await.unwrap_err();
        assert!(matches!(
            err,
            MaterializeError::InvalidDefinition(DefinitionError::Invalid(_))
        ));
        assert_nothing_happened(&h);
    }

    #[tokio::test]
    async fn test_write_failure_leaves_no_rows() {
        for point in [
            FailPoint::Version,
            FailPoint::Build,
            FailPoint::Stage,
            FailPoint::Step,
            FailPoint::Commit,
        ] {
            let h = harness(DOCUMENT);
            h.store.fail_next(point);

            let err = h.service.run(h.pipeline.id, "abc").await.unwrap_err();
            assert!(
                matches!(
                    err,
                    MaterializeError::PersistenceFailure(StoreError::Injected(p)) if p == point
                ),
                "unexpected error for {point}: {err}"
            );
            assert_nothing_happened(&h);
        }
    }

    #[tokio::test]
    async fn test_failed_write_does_not_consume_number() {
        let h = harness(DOCUMENT);
        h.store.fail_next(FailPoint::Step);
        assert!(h.service.run(h.pipeline.id, "abc").await.is_err());

        let version = h.service.run(h.pipeline.id, "abc").await.unwrap();
        assert_eq!(version.number, 1);
    }

    #[tokio::test]
    async fn test_dispatch_failure_keeps_rows() {
        init_tracing();
        let store = MemoryStore::new();
        let pipeline = pipeline(DOCUMENT);
        store.insert_pipeline(pipeline.clone());
        let service = BuildService::new(
            Arc::new(store.clone()),
            Dispatcher::new(Arc::new(UnreachableIntake)),
        );

        let err = service.run(pipeline.id, "abc").await.unwrap_err();
        match err {
            MaterializeError::DispatchFailure {
                version,
                build,
                source,
            } => {
                assert_eq!(version.number, 1);
                assert!(matches!(source, DispatchError::Unreachable(_)));
                assert_eq!(store.builds()[0].id, build.id);
                assert_eq!(store.builds()[0].status, BuildStatus::Pending);
            }
            other => panic!("expected dispatch failure, got {other}"),
        }

        assert_eq!(store.versions(pipeline.id).len(), 1);
        assert_eq!(store.steps().len(), 5);
    }

    #[tokio::test]
    async fn test_rebuild_uses_stored_content() {
        let h = harness(DOCUMENT);
        let first = h.service.run(h.pipeline.id, "abc").await.unwrap();

        let mut changed = h.pipeline.clone();
        changed.content = OTHER_DOCUMENT.to_string();
        h.store.insert_pipeline(changed);

        let rebuilt = h.service.rebuild(&first).await.unwrap();
        assert_eq!(rebuilt.number, 2);
        assert_ne!(rebuilt.id, first.id);
        assert_eq!(rebuilt.event, TriggerEvent::Rebuild);
        assert_eq!(rebuilt.sha, "abc");
        assert_eq!(rebuilt.content, DOCUMENT);

        let submitted = h.intake.submitted();
        assert_eq!(submitted.len(), 2);
        let names: Vec<&str> = submitted[1].stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["build", "test"]);

        let first_ids: HashSet<Uuid> = submitted[0].steps().map(|s| s.id).collect();
        assert!(submitted[1].steps().all(|s| !first_ids.contains(&s.id)));

        let live = h.service.run(h.pipeline.id, "def").await.unwrap();
        assert_eq!(live.number, 3);
        assert_eq!(live.content, OTHER_DOCUMENT);
    }

    #[tokio::test]
    async fn test_rebuild_version_by_id() {
        let h = harness(DOCUMENT);
        let first = h.service.run(h.pipeline.id, "abc").await.unwrap();

        let rebuilt = h.service.rebuild_version(first.id).await.unwrap();
        assert_eq!(rebuilt.number, 2);

        let missing = Uuid::new_v4();
        let err = h.service.rebuild_version(missing).await.unwrap_err();
        assert!(matches!(err, MaterializeError::VersionNotFound(id) if id == missing));
    }

    #[tokio::test]
    async fn test_rebuild_rejects_empty_or_invalid_content() {
        let h = harness(DOCUMENT);
        let mut version = h.service.run(h.pipeline.id, "abc").await.unwrap();
        let rows = h.store.row_count();

        version.content = String::new();
        let err = h.service.rebuild(&version).await.unwrap_err();
        assert!(matches!(err, MaterializeError::EmptyDefinition(_)));

        version.content = "{".to_string();
        let err = h.service.rebuild(&version).await.unwrap_err();
        assert!(matches!(err, MaterializeError::InvalidDefinition(_)));

        assert_eq!(h.store.row_count(), rows);
        assert_eq!(h.intake.submitted().len(), 1);
    }

    #[tokio::test]
    async fn test_rebuild_of_deleted_pipeline() {
        let h = harness(DOCUMENT);
        let version = h.service.run(h.pipeline.id, "abc").await.unwrap();

        let mut deleted = h.pipeline.clone();
        deleted.deleted = true;
        h.store.insert_pipeline(deleted);

        let err = h.service.rebuild(&version).await.unwrap_err();
        assert!(matches!(err, MaterializeError::PipelineNotFound(_)));
    }

    #[tokio::test]
    async fn test_injected_ids_flow_to_rows_and_runtime() {
        let h = harness(DOCUMENT);
        let service = h
            .service
            .clone()
            .with_ids(Arc::new(SequentialGenerator::new()));

        let version = service.run(h.pipeline.id, "abc").await.unwrap();

        assert_eq!(version.id, Uuid::from_u128(1));
        assert_eq!(h.store.builds()[0].id, Uuid::from_u128(2));
        assert_eq!(h.intake.submitted()[0].id, Uuid::from_u128(2));
        assert_eq!(h.intake.submitted()[0].stages[0].id, Uuid::from_u128(3));
    }
}
