// conveyor/src/executor/mod.rs

//! The `StageExecutor` seam: runs one stage's commands and reports what happened.

pub mod shell;

use crate::artifact::ArtifactRef;
use crate::error::ConveyorResult;
use crate::pipeline::{DefinitionRef, StageSpec, TriggerRef};
use crate::run::model::{Diagnostic, OutcomeKind, RunId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

pub use shell::ShellStageExecutor;

/// Everything an executor knows about the attempt it is running.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
  pub run_id: RunId,
  pub definition: DefinitionRef,
  pub trigger: TriggerRef,
  pub stage_index: usize,
  pub attempt: u32,
  /// Artifact of the stage named in `StageSpec::input_artifact`, if any.
  pub input: Option<ArtifactRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
  CommandFailed { command: String, exit_code: Option<i32> },
  MissingArtifact,
  /// The attempt was stopped by a cancellation signal. Never retried.
  Cancelled,
}

/// Result of one attempt, as reported by an executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
  Success { artifact: Option<ArtifactRef> },
  Failure { reason: FailureReason, diagnostic: Option<Diagnostic> },
  TimedOut { diagnostic: Option<Diagnostic> },
}

impl StageOutcome {
  pub fn success() -> Self {
    StageOutcome::Success { artifact: None }
  }

  pub fn failed<S: Into<String>>(summary: S) -> Self {
    let summary = summary.into();
    StageOutcome::Failure {
      reason: FailureReason::CommandFailed {
        command: summary.clone(),
        exit_code: None,
      },
      diagnostic: Some(Diagnostic::new(summary)),
    }
  }

  pub fn cancelled() -> Self {
    StageOutcome::Failure {
      reason: FailureReason::Cancelled,
      diagnostic: Some(Diagnostic::new("cancelled")),
    }
  }

  pub fn kind(&self) -> OutcomeKind {
    match self {
      StageOutcome::Success { .. } => OutcomeKind::Success,
      StageOutcome::Failure { .. } => OutcomeKind::Failure,
      StageOutcome::TimedOut { .. } => OutcomeKind::TimedOut,
    }
  }

  pub fn is_cancellation(&self) -> bool {
    matches!(
      self,
      StageOutcome::Failure {
        reason: FailureReason::Cancelled,
        ..
      }
    )
  }

  pub fn diagnostic(&self) -> Option<&Diagnostic> {
    match self {
      StageOutcome::Success { .. } => None,
      StageOutcome::Failure { diagnostic, .. } | StageOutcome::TimedOut { diagnostic } => diagnostic.as_ref(),
    }
  }
}

/// Runs a stage's command sequence.
///
/// `Ok` carries the stage-logic outcome, including failures. `Err` is reserved for
/// infrastructure trouble (artifact store unreachable, work directory unusable); those
/// leave the run where it was and never consume retry budget.
///
/// Implementations should watch `cancel` and return `StageOutcome::cancelled()` once it fires.
#[async_trait]
pub trait StageExecutor: Send + Sync + 'static {
  async fn execute(
    &self,
    ctx: &ExecutionContext,
    stage: &StageSpec,
    cancel: CancellationToken,
  ) -> ConveyorResult<StageOutcome>;
}
