// conveyor/src/run/model.rs

//! Persisted shape of a pipeline run and the per-stage results it accumulates.

use crate::artifact::ArtifactRef;
use crate::error::ConveyorError;
use crate::pipeline::{DefinitionRef, TriggerRef};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Longest stderr tail kept in a diagnostic.
pub const MAX_DIAGNOSTIC_BYTES: usize = 4 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
  pub fn generate() -> Self {
    RunId(Uuid::new_v4().to_string())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl From<&str> for RunId {
  fn from(value: &str) -> Self {
    RunId(value.to_string())
  }
}

impl From<String> for RunId {
  fn from(value: String) -> Self {
    RunId(value)
  }
}

impl std::fmt::Display for RunId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.0)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunStatus {
  Pending,
  Running,
  AwaitingApproval,
  Succeeded,
  Failed,
  Cancelled,
}

impl RunStatus {
  pub fn is_terminal(&self) -> bool {
    matches!(self, RunStatus::Succeeded | RunStatus::Failed | RunStatus::Cancelled)
  }
}

impl std::fmt::Display for RunStatus {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let s = match self {
      RunStatus::Pending => "pending",
      RunStatus::Running => "running",
      RunStatus::AwaitingApproval => "awaiting_approval",
      RunStatus::Succeeded => "succeeded",
      RunStatus::Failed => "failed",
      RunStatus::Cancelled => "cancelled",
    };
    f.write_str(s)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutcomeKind {
  Success,
  Failure,
  TimedOut,
}

/// Short reference to what went wrong. Full command output is never stored on the run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
  pub summary: String,
  #[serde(default)]
  pub exit_code: Option<i32>,
  #[serde(default)]
  pub stderr_tail: Option<String>,
}

impl Diagnostic {
  pub fn new<S: Into<String>>(summary: S) -> Self {
    Self {
      summary: summary.into(),
      exit_code: None,
      stderr_tail: None,
    }
  }

  pub fn with_exit_code(mut self, code: Option<i32>) -> Self {
    self.exit_code = code;
    self
  }

  /// Keeps at most `MAX_DIAGNOSTIC_BYTES` from the end of `stderr`.
  pub fn with_stderr(mut self, stderr: &[u8]) -> Self {
    if stderr.is_empty() {
      return self;
    }
    let start = stderr.len().saturating_sub(MAX_DIAGNOSTIC_BYTES);
    self.stderr_tail = Some(String::from_utf8_lossy(&stderr[start..]).into_owned());
    self
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
  pub attempt: u32,
  pub outcome: OutcomeKind,
  pub started_at: DateTime<Utc>,
  pub finished_at: DateTime<Utc>,
  #[serde(default)]
  pub diagnostic: Option<Diagnostic>,
}

/// One entry per completed stage. Retries live in `attempts`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageResult {
  pub stage_name: String,
  pub attempts: Vec<AttemptRecord>,
  pub outcome: OutcomeKind,
  pub started_at: DateTime<Utc>,
  pub finished_at: DateTime<Utc>,
  #[serde(default)]
  pub artifact: Option<ArtifactRef>,
}

impl StageResult {
  pub fn attempt_count(&self) -> u32 {
    self.attempts.len() as u32
  }
}

/// The attempt currently handed to the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InFlightAttempt {
  pub attempt: u32,
  pub started_at: DateTime<Utc>,
  /// Earliest start of a retry, so a restart still honors the backoff.
  #[serde(default)]
  pub not_before: Option<DateTime<Utc>>,
}

impl InFlightAttempt {
  pub fn new(attempt: u32, started_at: DateTime<Utc>) -> Self {
    Self {
      attempt,
      started_at,
      not_before: None,
    }
  }

  /// What is left of the backoff at `now`.
  pub fn remaining_delay(&self, now: DateTime<Utc>) -> Duration {
    self
      .not_before
      .and_then(|at| (at - now).to_std().ok())
      .unwrap_or(Duration::ZERO)
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunFailure {
  StageExhausted { stage_name: String, attempts: u32 },
  StageCancelled { stage_name: String },
  ApprovalRejected { stage_name: String, actor: String },
  ApprovalTimedOut { stage_name: String },
}

impl RunFailure {
  pub fn to_error(&self, run_id: &RunId) -> ConveyorError {
    match self {
      RunFailure::StageExhausted { stage_name, attempts } => ConveyorError::StageExecutionFailure {
        stage_name: stage_name.clone(),
        attempts: *attempts,
        message: "retry budget exhausted".to_string(),
      },
      RunFailure::StageCancelled { stage_name } => ConveyorError::StageExecutionFailure {
        stage_name: stage_name.clone(),
        attempts: 1,
        message: "stage reported cancellation".to_string(),
      },
      RunFailure::ApprovalRejected { stage_name, .. } => ConveyorError::ApprovalRejected {
        run_id: run_id.to_string(),
        stage_name: stage_name.clone(),
      },
      RunFailure::ApprovalTimedOut { stage_name } => ConveyorError::ApprovalTimeout {
        run_id: run_id.to_string(),
        stage_name: stage_name.clone(),
      },
    }
  }
}

/// A single execution of a pipeline definition for one trigger.
///
/// Only `run::machine::advance` mutates a run; everything else reads snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
  pub run_id: RunId,
  pub definition: DefinitionRef,
  pub trigger: TriggerRef,
  pub current_stage_index: usize,
  pub status: RunStatus,
  pub stage_history: Vec<StageResult>,
  /// Finished attempts of the stage at `current_stage_index` that has not completed yet.
  #[serde(default)]
  pub pending_attempts: Vec<AttemptRecord>,
  #[serde(default)]
  pub in_flight: Option<InFlightAttempt>,
  /// Index of a gated stage whose approval has been granted.
  #[serde(default)]
  pub gate_cleared: Option<usize>,
  #[serde(default)]
  pub gate_opened_at: Option<DateTime<Utc>>,
  #[serde(default)]
  pub failure: Option<RunFailure>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
  /// Bumped on every transition.
  pub revision: u64,
}

impl Run {
  pub fn new(run_id: RunId, definition: DefinitionRef, trigger: TriggerRef, now: DateTime<Utc>) -> Self {
    Self {
      run_id,
      definition,
      trigger,
      current_stage_index: 0,
      status: RunStatus::Pending,
      stage_history: Vec::new(),
      pending_attempts: Vec::new(),
      in_flight: None,
      gate_cleared: None,
      gate_opened_at: None,
      failure: None,
      created_at: now,
      updated_at: now,
      revision: 0,
    }
  }

  pub fn is_terminal(&self) -> bool {
    self.status.is_terminal()
  }

  /// Artifact produced by a completed stage of this run.
  pub fn artifact_of(&self, stage_name: &str) -> Option<&ArtifactRef> {
    self
      .stage_history
      .iter()
      .find(|r| r.stage_name == stage_name)
      .and_then(|r| r.artifact.as_ref())
  }

  pub fn result_for(&self, stage_name: &str) -> Option<&StageResult> {
    self.stage_history.iter().find(|r| r.stage_name == stage_name)
  }

  /// The error a caller should see for a failed run, if any.
  pub fn failure_error(&self) -> Option<ConveyorError> {
    self.failure.as_ref().map(|f| f.to_error(&self.run_id))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn diagnostic_keeps_only_the_tail() {
    let noisy = vec![b'x'; MAX_DIAGNOSTIC_BYTES + 100];
    let diag = Diagnostic::new("boom").with_stderr(&noisy);
    assert_eq!(diag.stderr_tail.unwrap().len(), MAX_DIAGNOSTIC_BYTES);

    let quiet = Diagnostic::new("boom").with_stderr(b"");
    assert!(quiet.stderr_tail.is_none());
  }

  #[test]
  fn terminal_statuses() {
    assert!(RunStatus::Succeeded.is_terminal());
    assert!(RunStatus::Failed.is_terminal());
    assert!(RunStatus::Cancelled.is_terminal());
    assert!(!RunStatus::AwaitingApproval.is_terminal());
    assert!(!RunStatus::Pending.is_terminal());
  }

  #[test]
  fn run_round_trips_through_json_with_defaults() {
    let run = Run::new(
      RunId::from("r-1"),
      DefinitionRef {
        name: "p".into(),
        version: 2,
      },
      TriggerRef {
        branch: "main".into(),
        commit: "abc".into(),
        event: crate::pipeline::EventType::Push,
      },
      Utc::now(),
    );
    let mut value = serde_json::to_value(&run).unwrap();
    value.as_object_mut().unwrap().remove("pending_attempts");
    value.as_object_mut().unwrap().remove("gate_cleared");
    let back: Run = serde_json::from_value(value).unwrap();
    assert_eq!(back, run);
  }
}
