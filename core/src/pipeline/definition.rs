// conveyor/src/pipeline/definition.rs

//! Contains the `PipelineDefinition` struct: an ordered, validated list of stages
//! plus the trigger filter deciding which events start a run of it.

use crate::error::{ConveyorError, ConveyorResult};
use crate::pipeline::stage::{RetryPolicy, StageSpec, MAX_RETRY_ATTEMPTS};
use crate::pipeline::trigger::TriggerFilter;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::{event, Level};

/// Identifies a definition by name and version. Runs keep only this reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DefinitionRef {
  pub name: String,
  pub version: u32,
}

impl std::fmt::Display for DefinitionRef {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}@v{}", self.name, self.version)
  }
}

/// A static, ordered pipeline. Immutable once registered with the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineDefinition {
  pub name: String,
  #[serde(default = "default_version")]
  pub version: u32,
  pub stages: Vec<StageSpec>,
  #[serde(default)]
  pub trigger: TriggerFilter,
}

fn default_version() -> u32 {
  1
}

impl PipelineDefinition {
  pub fn new<S: Into<String>>(name: S, version: u32) -> Self {
    Self {
      name: name.into(),
      version,
      stages: Vec::new(),
      trigger: TriggerFilter::default(),
    }
  }

  pub fn with_stage(mut self, stage: StageSpec) -> Self {
    self.stages.push(stage);
    self
  }

  pub fn with_trigger(mut self, trigger: TriggerFilter) -> Self {
    self.trigger = trigger;
    self
  }

  /// Parses a JSON definition and validates it.
  pub fn from_json(json: &str) -> ConveyorResult<Self> {
    let definition: PipelineDefinition =
      serde_json::from_str(json).map_err(|e| ConveyorError::InvalidDefinition {
        pipeline: "<unparsed>".to_string(),
        message: format!("malformed JSON: {}", e),
      })?;
    definition.validate()?;
    Ok(definition)
  }

  /// Reads and validates a JSON definition file.
  pub fn load(path: &Path) -> ConveyorResult<Self> {
    let json = std::fs::read_to_string(path).map_err(|e| ConveyorError::InvalidDefinition {
      pipeline: path.display().to_string(),
      message: format!("unreadable definition file: {}", e),
    })?;
    let definition = Self::from_json(&json)?;
    event!(Level::INFO, pipeline = %definition.reference(), path = %path.display(), "Pipeline definition loaded.");
    Ok(definition)
  }

  pub fn reference(&self) -> DefinitionRef {
    DefinitionRef {
      name: self.name.clone(),
      version: self.version,
    }
  }

  pub fn len(&self) -> usize {
    self.stages.len()
  }

  pub fn is_empty(&self) -> bool {
    self.stages.is_empty()
  }

  pub fn stage(&self, index: usize) -> Option<&StageSpec> {
    self.stages.get(index)
  }

  pub fn stage_index(&self, name: &str) -> Option<usize> {
    self.stages.iter().position(|s| s.name == name)
  }

  /// Fills every stage without an explicit retry policy with `default`.
  pub fn resolve_retry_policies(mut self, default: RetryPolicy) -> Self {
    for stage in &mut self.stages {
      if stage.retry_policy.is_none() {
        stage.retry_policy = Some(default);
      }
    }
    self
  }

  /// Checks the load-time rules. Any violation is `InvalidDefinition`.
  ///
  /// Between two executable stages there may be at most one approval gate.
  /// A gated stage with commands counts as executable once approved.
  pub fn validate(&self) -> ConveyorResult<()> {
    let invalid = |message: String| ConveyorError::InvalidDefinition {
      pipeline: self.name.clone(),
      message,
    };

    if self.name.trim().is_empty() {
      return Err(invalid("pipeline name must not be empty".to_string()));
    }
    if self.stages.is_empty() {
      return Err(invalid("pipeline has no stages".to_string()));
    }
    if self.trigger.branches.iter().any(|b| b.trim().is_empty()) {
      return Err(invalid("trigger branch patterns must not be empty".to_string()));
    }

    let mut seen: HashSet<&str> = HashSet::new();
    let mut artifact_producers: HashSet<&str> = HashSet::new();
    let mut gate_pending = false;

    for stage in &self.stages {
      let name = stage.name.as_str();
      if name.trim().is_empty() {
        return Err(invalid("stage names must not be empty".to_string()));
      }
      if !seen.insert(name) {
        return Err(invalid(format!("duplicate stage name '{}'", name)));
      }
      if !stage.is_executable() && !stage.requires_approval {
        return Err(invalid(format!("stage '{}' has no commands and is not an approval gate", name)));
      }
      if let Some(policy) = &stage.retry_policy {
        if policy.max_attempts == 0 || policy.max_attempts > MAX_RETRY_ATTEMPTS {
          return Err(invalid(format!(
            "stage '{}' max_attempts must be within 1..={} (got {})",
            name, MAX_RETRY_ATTEMPTS, policy.max_attempts
          )));
        }
      }
      if stage.timeout_secs == Some(0) {
        return Err(invalid(format!("stage '{}' has a zero timeout", name)));
      }
      if let Some(input) = &stage.input_artifact {
        if !artifact_producers.contains(input.as_str()) {
          return Err(invalid(format!(
            "stage '{}' consumes artifact of '{}', which is not an earlier artifact-producing stage",
            name, input
          )));
        }
      }

      if stage.requires_approval {
        if gate_pending {
          return Err(invalid(format!(
            "stage '{}' adds a second approval gate with no executable stage in between",
            name
          )));
        }
        gate_pending = true;
      }
      if stage.is_executable() {
        gate_pending = false;
      }
      if stage.produces_artifact {
        artifact_producers.insert(name);
      }
    }

    Ok(())
  }
}
