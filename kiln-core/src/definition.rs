//! Pipeline definition documents
//!
//! A pipeline stores its definition as a JSON document. This module parses
//! that document into ordered stages and steps, validates its structure
//! (`check`) and rewrites step commands into their canonical list form
//! (`normalize`). The graph builder only ever sees checked, normalized
//! definitions.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Errors produced while reading a definition document
#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    /// The document is not a well-formed definition
    #[error("Failed to parse pipeline definition: {0}")]
    Parse(#[from] serde_json::Error),

    /// The document parsed but breaks a structural rule
    #[error("Invalid pipeline definition: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, DefinitionError>;

/// Parsed pipeline definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineDefinition {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub stages: Vec<StageDefinition>,
}

/// Stage as declared in the document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageDefinition {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Stage type tag
    #[serde(default)]
    pub stage: String,
    #[serde(default)]
    pub steps: Vec<StepDefinition>,
}

/// Step as declared in the document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepDefinition {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Step type tag, e.g. `shell@sh`
    #[serde(default)]
    pub step: String,
    #[serde(default)]
    pub commands: Commands,
    #[serde(default)]
    pub waits: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Step commands: a script block or an explicit list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Commands {
    Script(String),
    List(Vec<String>),
}

impl Default for Commands {
    fn default() -> Self {
        Commands::List(Vec::new())
    }
}

impl Commands {
    /// Commands as declared, one entry per declared item
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            Commands::Script(script) => vec![script.clone()],
            Commands::List(list) => list.clone(),
        }
    }

    /// Canonical form: one trimmed, non-blank command per entry
    fn canonical(&self) -> Vec<String> {
        let raw: Vec<&str> = match self {
            Commands::Script(script) => script.lines().collect(),
            Commands::List(list) => list.iter().map(String::as_str).collect(),
        };

        raw.into_iter()
            .map(str::trim)
            .filter(|cmd| !cmd.is_empty())
            .map(str::to_string)
            .collect()
    }
}

impl StageDefinition {
    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }
}

impl StepDefinition {
    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }
}

/// Parse a definition document
///
/// # Errors
/// Returns [`DefinitionError::Parse`] if the document is not valid JSON or
/// does not have the definition's shape.
pub fn parse(document: &str) -> Result<PipelineDefinition> {
    let definition = serde_json::from_str(document)?;
    Ok(definition)
}

impl PipelineDefinition {
    /// Validate the definition's structure
    ///
    /// # Errors
    /// Returns [`DefinitionError::Invalid`] if:
    /// - There are no stages, or a stage has no steps
    /// - A stage or step name is empty or duplicated within its scope
    /// - A step has no type tag
    /// - A step waits on itself or on a step that does not exist
    pub fn check(&self) -> Result<()> {
        if self.stages.is_empty() {
            return invalid("Pipeline must have at least one stage");
        }
        if i32::try_from(self.stages.len()).is_err() {
            return invalid("Pipeline has too many stages");
        }

        let step_names: HashSet<&str> = self
            .stages
            .iter()
            .flat_map(|stage| stage.steps.iter().map(|step| step.name.as_str()))
            .collect();

        let mut stage_names = HashSet::new();
        for (i, stage) in self.stages.iter().enumerate() {
            if stage.name.trim().is_empty() {
                return invalid(format!("Stage {} must have a 'name' field", i));
            }
            if !stage_names.insert(stage.name.as_str()) {
                return invalid(format!("Duplicate stage name '{}'", stage.name));
            }
            if stage.steps.is_empty() {
                return invalid(format!("Stage '{}' must have at least one step", stage.name));
            }
            if i32::try_from(stage.steps.len()).is_err() {
                return invalid(format!("Stage '{}' has too many steps", stage.name));
            }

            let mut names_in_stage = HashSet::new();
            for (j, step) in stage.steps.iter().enumerate() {
                if step.name.trim().is_empty() {
                    return invalid(format!(
                        "Step {} of stage '{}' must have a 'name' field",
                        j, stage.name
                    ));
                }
                if !names_in_stage.insert(step.name.as_str()) {
                    return invalid(format!(
                        "Duplicate step name '{}' in stage '{}'",
                        step.name, stage.name
                    ));
                }
                if step.step.trim().is_empty() {
                    return invalid(format!("Step '{}' must have a 'step' field", step.name));
                }
                for wait in &step.waits {
                    if wait == &step.name {
                        return invalid(format!("Step '{}' cannot wait on itself", step.name));
                    }
                    if !step_names.contains(wait.as_str()) {
                        return invalid(format!(
                            "Step '{}' waits on unknown step '{}'",
                            step.name, wait
                        ));
                    }
                }
            }
        }

        Ok(())
    }

    /// Rewrite every step's commands into canonical list form
    ///
    /// Script blocks are split into lines; every command is trimmed and blank
    /// entries are dropped. Running it twice changes nothing.
    pub fn normalize(&mut self) {
        for step in self.stages.iter_mut().flat_map(|stage| stage.steps.iter_mut()) {
            step.commands = Commands::List(step.commands.canonical());
        }
    }

    /// Total number of steps across all stages
    pub fn step_count(&self) -> usize {
        self.stages.iter().map(|stage| stage.steps.len()).sum()
    }
}

fn invalid<T>(reason: impl Into<String>) -> Result<T> {
    Err(DefinitionError::Invalid(reason.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOCUMENT: &str = r#"{
        "name": "ci",
        "displayName": "Continuous Integration",
        "stages": [
            {
                "name": "build",
                "displayName": "Build",
                "stage": "build",
                "steps": [
                    {
                        "name": "compile",
                        "step": "shell@sh",
                        "commands": "cargo fetch\n\n  cargo build --release  \n",
                        "env": {"RUST_LOG": "info"}
                    }
                ]
            },
            {
                "name": "test",
                "steps": [
                    {
                        "name": "unit",
                        "displayName": "Unit tests",
                        "step": "shell@sh",
                        "commands": ["cargo test", "  "],
                        "waits": ["compile"]
                    }
                ]
            }
        ]
    }"#;

    fn parsed() -> PipelineDefinition {
        parse(DOCUMENT).unwrap()
    }

    #[test]
    fn test_parse_document() {
        let def = parsed();
        assert_eq!(def.name, "ci");
        assert_eq!(def.stages.len(), 2);
        assert_eq!(def.step_count(), 2);
        assert_eq!(def.stages[0].display_name(), "Build");
        assert_eq!(def.stages[1].display_name(), "test");
        assert_eq!(def.stages[1].steps[0].waits, vec!["compile"]);
        assert!(def.stages[1].steps[0].env.is_empty());
        assert!(matches!(def.stages[0].steps[0].commands, Commands::Script(_)));
    }

    #[test]
    fn test_parse_rejects_malformed_document() {
        assert!(matches!(parse("{ not json"), Err(DefinitionError::Parse(_))));
        assert!(matches!(
            parse(r#"{"stages": "nope"}"#),
            Err(DefinitionError::Parse(_))
        ));
    }

    #[test]
    fn test_check_accepts_valid_definition() {
        assert!(parsed().check().is_ok());
    }

    #[test]
    fn test_check_requires_stages() {
        let def = parse(r#"{"name": "empty"}"#).unwrap();
        assert!(matches!(def.check(), Err(DefinitionError::Invalid(_))));
    }

    #[test]
    fn test_check_requires_steps() {
        let mut def = parsed();
        def.stages[1].steps.clear();
        assert!(matches!(def.check(), Err(DefinitionError::Invalid(_))));
    }

    #[test]
    fn test_check_rejects_missing_names() {
        let mut def = parsed();
        def.stages[0].name = " ".to_string();
        assert!(def.check().is_err());

        let mut def = parsed();
        def.stages[0].steps[0].name = String::new();
        assert!(def.check().is_err());
    }

    #[test]
    fn test_check_rejects_missing_step_type() {
        let mut def = parsed();
        def.stages[0].steps[0].step = String::new();
        let err = def.check().unwrap_err();
        assert!(err.to_string().contains("'step'"), "got: {err}");
    }

    #[test]
    fn test_check_rejects_duplicate_names() {
        let mut def = parsed();
        def.stages[1].name = "build".to_string();
        assert!(def.check().is_err());

        let mut def = parsed();
        let copy = def.stages[0].steps[0].clone();
        def.stages[0].steps.push(copy);
        assert!(def.check().is_err());
    }

    #[test]
    fn test_check_rejects_bad_waits() {
        let mut def = parsed();
        def.stages[1].steps[0].waits = vec!["deploy".to_string()];
        assert!(def.check().is_err());

        let mut def = parsed();
        def.stages[1].steps[0].waits = vec!["unit".to_string()];
        assert!(def.check().is_err());
    }

    #[test]
    fn test_normalize_commands() {
        let mut def = parsed();
        def.normalize();

        assert_eq!(
            def.stages[0].steps[0].commands,
            Commands::List(vec![
                "cargo fetch".to_string(),
                "cargo build --release".to_string()
            ])
        );
        assert_eq!(def.stages[1].steps[0].commands.to_vec(), vec!["cargo test"]);

        let once = def.clone();
        def.normalize();
        assert_eq!(def, once);
    }
}
