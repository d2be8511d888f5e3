//! Pipeline version domain types

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What caused a materialization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerEvent {
    /// A commit reference on the live pipeline definition
    Run,
    /// A re-run of a previously stored version
    Rebuild,
}

impl TriggerEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerEvent::Run => "run",
            TriggerEvent::Rebuild => "rebuild",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "run" => Some(TriggerEvent::Run),
            "rebuild" => Some(TriggerEvent::Rebuild),
            _ => None,
        }
    }
}

impl std::fmt::Display for TriggerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable, numbered snapshot of a pipeline definition
///
/// `number` is strictly increasing per pipeline, starting at 1. `content` is
/// the exact document the materialization was built from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineVersion {
    pub id: Uuid,
    pub pipeline_id: Uuid,
    pub number: i64,
    pub event: TriggerEvent,
    pub sha: String,
    pub pipeline_name: String,
    pub pipeline_display_name: String,
    pub clone_url: String,
    pub content: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_event_strings() {
        for event in [TriggerEvent::Run, TriggerEvent::Rebuild] {
            assert_eq!(TriggerEvent::parse(event.as_str()), Some(event));
        }
        assert_eq!(TriggerEvent::parse("push"), None);
        assert_eq!(
            serde_json::to_string(&TriggerEvent::Rebuild).unwrap(),
            "\"rebuild\""
        );
    }
}
