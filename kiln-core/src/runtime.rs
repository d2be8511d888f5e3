//! Execution-ready build graph
//!
//! This is what an execution engine receives. It carries the same IDs as the
//! persisted rows, with commands, waits and environment already decoded.
//! It is never persisted itself.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::domain::build::BuildStatus;
use crate::domain::pipeline::Pipeline;

/// Where the engine fetches sources from
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Repository {
    pub name: String,
    pub token: String,
    pub sha: String,
    pub clone_url: String,
}

impl Repository {
    pub fn for_pipeline(pipeline: &Pipeline, sha: &str) -> Self {
        Self {
            name: pipeline.username.clone(),
            token: pipeline.access_token.clone(),
            sha: sha.to_string(),
            clone_url: pipeline.clone_url.clone(),
        }
    }
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("name", &self.name)
            .field("token", &"<redacted>")
            .field("sha", &self.sha)
            .field("clone_url", &self.clone_url)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Build {
    pub id: Uuid,
    pub pipeline_id: Uuid,
    pub version_id: Uuid,
    pub status: BuildStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub repo: Repository,
    pub stages: Vec<Stage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub id: Uuid,
    pub build_id: Uuid,
    pub name: String,
    pub display_name: String,
    pub kind: String,
    pub status: BuildStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: Uuid,
    pub build_id: Uuid,
    pub stage_id: Uuid,
    pub name: String,
    pub display_name: String,
    pub kind: String,
    pub status: BuildStatus,
    pub commands: Vec<String>,
    pub waits: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl Build {
    /// All steps in execution order
    pub fn steps(&self) -> impl Iterator<Item = &Step> {
        self.stages.iter().flat_map(|stage| stage.steps.iter())
    }
}
