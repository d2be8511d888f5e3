//! Build domain types
//!
//! Row shapes for the persisted projection of a build graph. Every row is
//! created `Pending`; later transitions belong to the execution engine.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Build, stage and step status
///
/// Materialization only writes `Pending`. The remaining states are set by
/// the execution engine and read back from stored rows through `parse`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    Skipped,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Pending => "Pending",
            BuildStatus::Running => "Running",
            BuildStatus::Succeeded => "Succeeded",
            BuildStatus::Failed => "Failed",
            BuildStatus::Cancelled => "Cancelled",
            BuildStatus::Skipped => "Skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Pending" => Some(BuildStatus::Pending),
            "Running" => Some(BuildStatus::Running),
            "Succeeded" => Some(BuildStatus::Succeeded),
            "Failed" => Some(BuildStatus::Failed),
            "Cancelled" => Some(BuildStatus::Cancelled),
            "Skipped" => Some(BuildStatus::Skipped),
            _ => None,
        }
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted build row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Build {
    pub id: Uuid,
    pub pipeline_id: Uuid,
    pub version_id: Uuid,
    pub status: BuildStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Persisted stage row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub id: Uuid,
    pub build_id: Uuid,
    pub version_id: Uuid,
    pub name: String,
    pub display_name: String,
    pub kind: String,
    /// 0-based position within the build
    pub order: i32,
    pub status: BuildStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Persisted step row
///
/// `commands`, `waits` and `env` are stored as JSON values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: Uuid,
    pub build_id: Uuid,
    pub stage_id: Uuid,
    pub version_id: Uuid,
    pub name: String,
    pub display_name: String,
    pub kind: String,
    pub commands: serde_json::Value,
    pub waits: serde_json::Value,
    pub env: serde_json::Value,
    /// 0-based position within the stage
    pub order: i32,
    pub status: BuildStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Step {
    /// Decode the stored command list
    pub fn decoded_commands(&self) -> serde_json::Result<Vec<String>> {
        serde_json::from_value(self.commands.clone())
    }

    /// Decode the stored wait conditions
    pub fn decoded_waits(&self) -> serde_json::Result<Vec<String>> {
        serde_json::from_value(self.waits.clone())
    }

    /// Decode the stored environment
    pub fn decoded_env(&self) -> serde_json::Result<BTreeMap<String, String>> {
        serde_json::from_value(self.env.clone())
    }
}
