//! Canonical build graph
//!
//! A materialization builds exactly one [`BuildGraph`] from a checked,
//! normalized definition. Both the persisted rows ([`BuildGraph::records`])
//! and the execution-ready graph ([`BuildGraph::runtime`]) are derived from
//! it, so the two can never disagree on IDs, order or field values.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::definition::PipelineDefinition;
use crate::domain::build::{Build, BuildStatus, Stage, Step};
use crate::domain::pipeline::Pipeline;
use crate::domain::version::{PipelineVersion, TriggerEvent};
use crate::id::IdGenerator;
use crate::runtime::{self, Repository};

/// Resolved trigger: which pipeline, which document, which source reference
#[derive(Debug, Clone, Copy)]
pub struct TriggerContext<'a> {
    pub pipeline: &'a Pipeline,
    pub event: TriggerEvent,
    pub sha: &'a str,
    /// The document the definition was parsed from
    pub content: &'a str,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuildGraph {
    pub version: PipelineVersion,
    pub build: BuildNode,
    pub repo: Repository,
    pub stages: Vec<StageNode>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuildNode {
    pub id: Uuid,
    pub pipeline_id: Uuid,
    pub status: BuildStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StageNode {
    pub id: Uuid,
    pub name: String,
    pub display_name: String,
    pub kind: String,
    pub order: i32,
    pub status: BuildStatus,
    pub created_at: DateTime<Utc>,
    pub steps: Vec<StepNode>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepNode {
    pub id: Uuid,
    pub name: String,
    pub display_name: String,
    pub kind: String,
    pub commands: Vec<String>,
    pub waits: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub order: i32,
    pub status: BuildStatus,
    pub created_at: DateTime<Utc>,
}

/// Persisted projection: one row per version, build, stage and step
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedGraph {
    pub version: PipelineVersion,
    pub build: Build,
    pub stages: Vec<Stage>,
    pub steps: Vec<Step>,
}

/// 0-based position as stored in the `sort` column
///
/// [`PipelineDefinition::check`] rejects more than `i32::MAX` stages, or
/// steps in one stage, so a checked definition never saturates.
fn position(index: usize) -> i32 {
    i32::try_from(index).unwrap_or(i32::MAX)
}

/// Builds canonical graphs, drawing every node ID from `ids`
pub struct GraphBuilder<'a> {
    ids: &'a dyn IdGenerator,
    now: DateTime<Utc>,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(ids: &'a dyn IdGenerator) -> Self {
        Self {
            ids,
            now: Utc::now(),
        }
    }

    /// Use a fixed creation timestamp for every node
    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    /// Build the graph for version `number` of the triggered pipeline
    ///
    /// Stages and steps keep their declaration order; `order` is the 0-based
    /// position within the parent. Every node starts `Pending`.
    pub fn build(
        &self,
        trigger: TriggerContext<'_>,
        definition: &PipelineDefinition,
        number: i64,
    ) -> BuildGraph {
        let pipeline = trigger.pipeline;

        let version = PipelineVersion {
            id: self.ids.new_id(),
            pipeline_id: pipeline.id,
            number,
            event: trigger.event,
            sha: trigger.sha.to_string(),
            pipeline_name: pipeline.name.clone(),
            pipeline_display_name: pipeline.display_name.clone(),
            clone_url: pipeline.clone_url.clone(),
            content: trigger.content.to_string(),
            created_at: self.now,
        };

        let build = BuildNode {
            id: self.ids.new_id(),
            pipeline_id: pipeline.id,
            status: BuildStatus::Pending,
            created_at: self.now,
        };

        let stages = definition
            .stages
            .iter()
            .enumerate()
            .map(|(i, stage)| StageNode {
                id: self.ids.new_id(),
                name: stage.name.clone(),
                display_name: stage.display_name().to_string(),
                kind: stage.stage.clone(),
                order: position(i),
                status: BuildStatus::Pending,
                created_at: self.now,
                steps: stage
                    .steps
                    .iter()
                    .enumerate()
                    .map(|(j, step)| StepNode {
                        id: self.ids.new_id(),
                        name: step.name.clone(),
                        display_name: step.display_name().to_string(),
                        kind: step.step.clone(),
                        commands: step.commands.to_vec(),
                        waits: step.waits.clone(),
                        env: step.env.clone(),
                        order: position(j),
                        status: BuildStatus::Pending,
                        created_at: self.now,
                    })
                    .collect(),
            })
            .collect();

        BuildGraph {
            version,
            build,
            repo: Repository::for_pipeline(pipeline, trigger.sha),
            stages,
        }
    }
}

impl BuildGraph {
    pub fn step_count(&self) -> usize {
        self.stages.iter().map(|stage| stage.steps.len()).sum()
    }

    /// Rows to persist, in insertion order
    pub fn records(&self) -> PersistedGraph {
        let version_id = self.version.id;
        let build_id = self.build.id;

        let build = Build {
            id: build_id,
            pipeline_id: self.build.pipeline_id,
            version_id,
            status: self.build.status,
            created_at: self.build.created_at,
        };

        let stages = self
            .stages
            .iter()
            .map(|stage| Stage {
                id: stage.id,
                build_id,
                version_id,
                name: stage.name.clone(),
                display_name: stage.display_name.clone(),
                kind: stage.kind.clone(),
                order: stage.order,
                status: stage.status,
                created_at: stage.created_at,
            })
            .collect();

        let steps = self
            .stages
            .iter()
            .flat_map(|stage| {
                stage.steps.iter().map(move |step| Step {
                    id: step.id,
                    build_id,
                    stage_id: stage.id,
                    version_id,
                    name: step.name.clone(),
                    display_name: step.display_name.clone(),
                    kind: step.kind.clone(),
                    commands: Value::from(step.commands.clone()),
                    waits: Value::from(step.waits.clone()),
                    env: Value::Object(
                        step.env
                            .iter()
                            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                            .collect(),
                    ),
                    order: step.order,
                    status: step.status,
                    created_at: step.created_at,
                })
            })
            .collect();

        PersistedGraph {
            version: self.version.clone(),
            build,
            stages,
            steps,
        }
    }

    /// Execution-ready graph for the engine
    pub fn runtime(&self) -> runtime::Build {
        let build_id = self.build.id;

        runtime::Build {
            id: build_id,
            pipeline_id: self.build.pipeline_id,
            version_id: self.version.id,
            status: self.build.status,
            created_at: self.build.created_at,
            repo: self.repo.clone(),
            stages: self
                .stages
                .iter()
                .map(|stage| runtime::Stage {
                    id: stage.id,
                    build_id,
                    name: stage.name.clone(),
                    display_name: stage.display_name.clone(),
                    kind: stage.kind.clone(),
                    status: stage.status,
                    created_at: stage.created_at,
                    steps: stage
                        .steps
                        .iter()
                        .map(|step| runtime::Step {
                            id: step.id,
                            build_id,
                            stage_id: stage.id,
                            name: step.name.clone(),
                            display_name: step.display_name.clone(),
                            kind: step.kind.clone(),
                            status: step.status,
                            commands: step.commands.clone(),
                            waits: step.waits.clone(),
                            env: step.env.clone(),
                        })
                        .collect(),
                })
                .collect(),
        }
    }
}
