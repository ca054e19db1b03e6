// conveyor/src/error.rs
use anyhow::Error as AnyhowError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConveyorError {
  #[error("Invalid pipeline definition '{pipeline}': {message}")]
  InvalidDefinition { pipeline: String, message: String },

  #[error("Pipeline not found: {pipeline}")]
  PipelineNotFound { pipeline: String },

  #[error("Run {active_run_id} is already in progress for pipeline '{pipeline}' on branch '{branch}'")]
  RunInProgress {
    pipeline: String,
    branch: String,
    active_run_id: String,
  },

  #[error("Concurrent run limit reached ({limit})")]
  CapacityExhausted { limit: usize },

  #[error("Run not found: {run_id}")]
  RunNotFound { run_id: String },

  #[error("Stage '{stage_name}' failed after {attempts} attempt(s): {message}")]
  StageExecutionFailure {
    stage_name: String,
    attempts: u32,
    message: String,
  },

  #[error("Approval for stage '{stage_name}' of run {run_id} timed out")]
  ApprovalTimeout { run_id: String, stage_name: String },

  #[error("Approval for stage '{stage_name}' of run {run_id} was rejected")]
  ApprovalRejected { run_id: String, stage_name: String },

  #[error("Run {run_id} is already terminal ({status})")]
  AlreadyTerminal { run_id: String, status: String },

  #[error("Approval for stage '{stage_name}' of run {run_id} was already decided")]
  AlreadyDecided { run_id: String, stage_name: String },

  #[error("Run {run_id} is not awaiting approval for stage '{stage_name}'")]
  NotAwaitingApproval { run_id: String, stage_name: String },

  #[error("Persistence failure while {operation}. Source: {source}")]
  PersistenceFailure {
    operation: String,
    #[source]
    source: AnyhowError,
  },

  #[error("Artifact store failure for {run_id}/{stage_name}. Source: {source}")]
  ArtifactStore {
    run_id: String,
    stage_name: String,
    #[source]
    source: AnyhowError,
  },

  #[error("Configuration error for '{key}': {message}")]
  Configuration { key: String, message: String },

  #[error("Error in adapter or external operation. Source: {source}")]
  External {
    #[source]
    source: AnyhowError,
  },

  #[error("Internal conveyor error: {0}")]
  Internal(String),
}

impl ConveyorError {
  pub(crate) fn persistence(operation: impl Into<String>, source: impl Into<AnyhowError>) -> Self {
    ConveyorError::PersistenceFailure {
      operation: operation.into(),
      source: source.into(),
    }
  }

  /// Errors a caller may retry later without changing anything on its side.
  pub fn is_recoverable(&self) -> bool {
    matches!(
      self,
      ConveyorError::RunInProgress { .. } | ConveyorError::CapacityExhausted { .. }
    )
  }

  /// Idempotency guards. These report "nothing to do" rather than a user error.
  pub fn is_idempotency_guard(&self) -> bool {
    matches!(
      self,
      ConveyorError::AlreadyTerminal { .. } | ConveyorError::AlreadyDecided { .. }
    )
  }

  /// Failures of the orchestrator's own infrastructure, as opposed to stage logic.
  /// These never consume a stage's retry budget.
  pub fn is_infrastructure(&self) -> bool {
    matches!(
      self,
      ConveyorError::PersistenceFailure { .. } | ConveyorError::ArtifactStore { .. } | ConveyorError::External { .. }
    )
  }
}

impl From<AnyhowError> for ConveyorError {
  fn from(err: AnyhowError) -> Self {
    match err.downcast::<ConveyorError>() {
      Ok(conveyor_err) => conveyor_err,
      Err(err) => ConveyorError::External { source: err },
    }
  }
}

pub type ConveyorResult<T, E = ConveyorError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn anyhow_wrapping_a_conveyor_error_is_unwrapped() {
    let inner = ConveyorError::RunNotFound {
      run_id: "r-1".to_string(),
    };
    let converted = ConveyorError::from(anyhow::Error::new(inner));
    assert!(matches!(converted, ConveyorError::RunNotFound { run_id } if run_id == "r-1"));
  }

  #[test]
  fn classification() {
    let busy = ConveyorError::RunInProgress {
      pipeline: "p".into(),
      branch: "main".into(),
      active_run_id: "r".into(),
    };
    assert!(busy.is_recoverable());
    assert!(!busy.is_infrastructure());

    let disk = ConveyorError::persistence("saving run", anyhow::anyhow!("disk full"));
    assert!(disk.is_infrastructure());
    assert!(!disk.is_recoverable());

    let dup = ConveyorError::AlreadyDecided {
      run_id: "r".into(),
      stage_name: "Approve".into(),
    };
    assert!(dup.is_idempotency_guard());
  }
}
