// conveyor/src/run/machine.rs

//! The run state machine.
//!
//! `advance` is a pure function over a `Run` snapshot: it applies one event, mutates
//! the run, and returns the `Effect` the driver must carry out next. It performs no
//! I/O, which is what lets the driver persist each transition before acting on it.
//!
//! ```text
//! Pending -> Running -> (AwaitingApproval -> Running)* -> Succeeded | Failed | Cancelled
//! ```

use crate::approval::ApprovalResolution;
use crate::error::{ConveyorError, ConveyorResult};
use crate::executor::{FailureReason, StageOutcome};
use crate::pipeline::PipelineDefinition;
use crate::run::model::{
  AttemptRecord, Diagnostic, InFlightAttempt, OutcomeKind, Run, RunFailure, RunStatus, StageResult,
};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{event, Level};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
  Start,
  StageCompleted {
    stage_index: usize,
    attempt: u32,
    outcome: StageOutcome,
  },
  ApprovalDecision {
    stage_name: String,
    resolution: ApprovalResolution,
  },
  CancelRequested,
}

/// What the driver has to do after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
  /// Invoke the executor for `stage_index`, after waiting `delay`.
  ExecuteStage {
    stage_index: usize,
    attempt: u32,
    delay: Duration,
  },
  /// Open the approval gate of `stage_index` and wait for its resolution.
  RequestApproval { stage_index: usize },
  /// The run reached a terminal status.
  Finished(RunStatus),
  /// The event was stale or a duplicate; nothing changed.
  Ignored,
}

/// Applies `event` to `run`.
///
/// Events on a terminal run return `AlreadyTerminal` and leave it untouched.
/// A `StageCompleted` that does not match the in-flight attempt is `Ignored`.
pub fn advance(
  run: &mut Run,
  definition: &PipelineDefinition,
  event: RunEvent,
  now: DateTime<Utc>,
) -> ConveyorResult<Effect> {
  if run.status.is_terminal() {
    return Err(ConveyorError::AlreadyTerminal {
      run_id: run.run_id.to_string(),
      status: run.status.to_string(),
    });
  }

  let effect = match event {
    RunEvent::Start => {
      if run.status != RunStatus::Pending {
        return Ok(Effect::Ignored);
      }
      run.status = RunStatus::Running;
      enter_stage(run, definition, now)?
    }
    RunEvent::StageCompleted {
      stage_index,
      attempt,
      outcome,
    } => {
      let in_flight = match run.in_flight {
        Some(f) if run.status == RunStatus::Running && f.attempt == attempt && run.current_stage_index == stage_index => f,
        _ => {
          event!(Level::DEBUG, run_id = %run.run_id, stage_index, attempt, "Ignoring stale stage completion.");
          return Ok(Effect::Ignored);
        }
      };
      on_stage_completed(run, definition, in_flight, outcome, now)?
    }
    RunEvent::ApprovalDecision { stage_name, resolution } => {
      let stage_matches = definition
        .stage(run.current_stage_index)
        .map_or(false, |s| s.name == stage_name);
      if run.status != RunStatus::AwaitingApproval || !stage_matches {
        return Err(ConveyorError::NotAwaitingApproval {
          run_id: run.run_id.to_string(),
          stage_name,
        });
      }
      on_approval(run, definition, stage_name, resolution, now)?
    }
    RunEvent::CancelRequested => {
      // Completed stage results stay as they are; the in-flight attempt is dropped.
      run.in_flight = None;
      run.status = RunStatus::Cancelled;
      Effect::Finished(RunStatus::Cancelled)
    }
  };

  run.updated_at = now;
  run.revision += 1;
  Ok(effect)
}

/// Computes the effect that continues a persisted run, e.g. after a restart.
///
/// A `Pending` run is started. A `Running` run re-executes its in-flight attempt
/// under the same attempt number, after whatever remains of its backoff; completed
/// stages are never revisited.
pub fn resume(run: &mut Run, definition: &PipelineDefinition, now: DateTime<Utc>) -> ConveyorResult<Effect> {
  match run.status {
    RunStatus::Pending => advance(run, definition, RunEvent::Start, now),
    RunStatus::Running => match run.in_flight {
      Some(f) => Ok(Effect::ExecuteStage {
        stage_index: run.current_stage_index,
        attempt: f.attempt,
        delay: f.remaining_delay(now),
      }),
      None => Err(ConveyorError::Internal(format!(
        "run {} is running stage {} without an in-flight attempt",
        run.run_id, run.current_stage_index
      ))),
    },
    RunStatus::AwaitingApproval => Ok(Effect::RequestApproval {
      stage_index: run.current_stage_index,
    }),
    status => Ok(Effect::Finished(status)),
  }
}

fn enter_stage(run: &mut Run, definition: &PipelineDefinition, now: DateTime<Utc>) -> ConveyorResult<Effect> {
  run.pending_attempts.clear();
  run.in_flight = None;
  run.gate_opened_at = None;

  let index = run.current_stage_index;
  let Some(stage) = definition.stage(index) else {
    run.status = RunStatus::Succeeded;
    event!(Level::INFO, run_id = %run.run_id, stages = run.stage_history.len(), "Run succeeded.");
    return Ok(Effect::Finished(RunStatus::Succeeded));
  };

  if stage.requires_approval && run.gate_cleared != Some(index) {
    run.status = RunStatus::AwaitingApproval;
    run.gate_opened_at = Some(now);
    event!(Level::INFO, run_id = %run.run_id, stage = %stage.name, "Run awaiting approval.");
    return Ok(Effect::RequestApproval { stage_index: index });
  }

  run.status = RunStatus::Running;
  run.in_flight = Some(InFlightAttempt::new(1, now));
  Ok(Effect::ExecuteStage {
    stage_index: index,
    attempt: 1,
    delay: Duration::ZERO,
  })
}

fn on_stage_completed(
  run: &mut Run,
  definition: &PipelineDefinition,
  in_flight: InFlightAttempt,
  outcome: StageOutcome,
  now: DateTime<Utc>,
) -> ConveyorResult<Effect> {
  let index = run.current_stage_index;
  let stage = definition
    .stage(index)
    .ok_or_else(|| ConveyorError::Internal(format!("run {} points past its last stage", run.run_id)))?;

  run.in_flight = None;
  run.pending_attempts.push(AttemptRecord {
    attempt: in_flight.attempt,
    outcome: outcome.kind(),
    started_at: in_flight.started_at,
    finished_at: now,
    diagnostic: outcome.diagnostic().cloned(),
  });

  match outcome {
    StageOutcome::Success { artifact } => {
      complete_stage(run, &stage.name, OutcomeKind::Success, artifact, now);
      run.current_stage_index += 1;
      enter_stage(run, definition, now)
    }
    StageOutcome::Failure {
      reason: FailureReason::Cancelled,
      ..
    } => {
      complete_stage(run, &stage.name, OutcomeKind::Failure, None, now);
      run.status = RunStatus::Failed;
      run.failure = Some(RunFailure::StageCancelled {
        stage_name: stage.name.clone(),
      });
      event!(Level::WARN, run_id = %run.run_id, stage = %stage.name, "Stage reported cancellation; not retrying.");
      Ok(Effect::Finished(RunStatus::Failed))
    }
    failed => {
      let policy = stage.effective_retry();
      let next_attempt = in_flight.attempt + 1;
      if policy.allows_attempt(next_attempt) {
        let delay = policy.backoff.delay_after(in_flight.attempt);
        run.in_flight = Some(InFlightAttempt {
          attempt: next_attempt,
          started_at: now,
          not_before: chrono::Duration::from_std(delay).ok().map(|d| now + d),
        });
        event!(Level::WARN, run_id = %run.run_id, stage = %stage.name, attempt = in_flight.attempt, max_attempts = policy.max_attempts, "Stage attempt failed; retrying.");
        Ok(Effect::ExecuteStage {
          stage_index: index,
          attempt: next_attempt,
          delay,
        })
      } else {
        complete_stage(run, &stage.name, failed.kind(), None, now);
        run.status = RunStatus::Failed;
        run.failure = Some(RunFailure::StageExhausted {
          stage_name: stage.name.clone(),
          attempts: in_flight.attempt,
        });
        event!(Level::ERROR, run_id = %run.run_id, stage = %stage.name, attempts = in_flight.attempt, "Stage failed; retries exhausted.");
        Ok(Effect::Finished(RunStatus::Failed))
      }
    }
  }
}

fn on_approval(
  run: &mut Run,
  definition: &PipelineDefinition,
  stage_name: String,
  resolution: ApprovalResolution,
  now: DateTime<Utc>,
) -> ConveyorResult<Effect> {
  let index = run.current_stage_index;
  let opened_at = run.gate_opened_at.unwrap_or(now);
  let gate_record = |outcome: OutcomeKind, diagnostic: Option<Diagnostic>| AttemptRecord {
    attempt: 1,
    outcome,
    started_at: opened_at,
    finished_at: now,
    diagnostic,
  };

  match resolution {
    ApprovalResolution::Approved { by } => {
      event!(Level::INFO, run_id = %run.run_id, stage = %stage_name, %by, "Gate approved.");
      run.gate_cleared = Some(index);
      let is_pure_gate = definition.stage(index).map_or(false, |s| s.is_pure_gate());
      if is_pure_gate {
        run.pending_attempts.push(gate_record(OutcomeKind::Success, None));
        complete_stage(run, &stage_name, OutcomeKind::Success, None, now);
        run.current_stage_index += 1;
        enter_stage(run, definition, now)
      } else {
        run.gate_opened_at = None;
        run.status = RunStatus::Running;
        run.in_flight = Some(InFlightAttempt::new(1, now));
        Ok(Effect::ExecuteStage {
          stage_index: index,
          attempt: 1,
          delay: Duration::ZERO,
        })
      }
    }
    ApprovalResolution::Rejected { by } => {
      let diagnostic = Diagnostic::new(format!("rejected by {}", by));
      run.pending_attempts.push(gate_record(OutcomeKind::Failure, Some(diagnostic)));
      complete_stage(run, &stage_name, OutcomeKind::Failure, None, now);
      run.status = RunStatus::Failed;
      run.failure = Some(RunFailure::ApprovalRejected {
        stage_name: stage_name.clone(),
        actor: by,
      });
      event!(Level::WARN, run_id = %run.run_id, stage = %stage_name, "Gate rejected.");
      Ok(Effect::Finished(RunStatus::Failed))
    }
    ApprovalResolution::TimedOut => {
      let diagnostic = Diagnostic::new("approval timed out");
      run.pending_attempts.push(gate_record(OutcomeKind::TimedOut, Some(diagnostic)));
      complete_stage(run, &stage_name, OutcomeKind::TimedOut, None, now);
      run.status = RunStatus::Failed;
      run.failure = Some(RunFailure::ApprovalTimedOut {
        stage_name: stage_name.clone(),
      });
      event!(Level::WARN, run_id = %run.run_id, stage = %stage_name, "Gate timed out.");
      Ok(Effect::Finished(RunStatus::Failed))
    }
  }
}

/// Folds the pending attempts into the single `StageResult` of the current stage.
fn complete_stage(
  run: &mut Run,
  stage_name: &str,
  outcome: OutcomeKind,
  artifact: Option<crate::artifact::ArtifactRef>,
  now: DateTime<Utc>,
) {
  let attempts = std::mem::take(&mut run.pending_attempts);
  let started_at = attempts.first().map_or(now, |a| a.started_at);
  run.stage_history.push(StageResult {
    stage_name: stage_name.to_string(),
    attempts,
    outcome,
    started_at,
    finished_at: now,
    artifact,
  });
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::pipeline::{Backoff, DefinitionRef, EventType, RetryPolicy, StageSpec, TriggerRef};
  use crate::run::model::RunId;

  fn definition() -> PipelineDefinition {
    PipelineDefinition::new("web", 1)
      .with_stage(StageSpec::new("Build").command("make").retry(RetryPolicy::new(3, Backoff::Fixed { delay_ms: 5 })))
      .with_stage(StageSpec::approval("Approve"))
      .with_stage(StageSpec::new("Deploy").command("make deploy"))
  }

  fn new_run() -> Run {
    Run::new(
      RunId::from("r-1"),
      DefinitionRef {
        name: "web".into(),
        version: 1,
      },
      TriggerRef {
        branch: "main".into(),
        commit: "abc".into(),
        event: EventType::Push,
      },
      Utc::now(),
    )
  }

  fn completed(stage_index: usize, attempt: u32, outcome: StageOutcome) -> RunEvent {
    RunEvent::StageCompleted {
      stage_index,
      attempt,
      outcome,
    }
  }

  #[test]
  fn start_enters_first_stage() {
    let def = definition();
    let mut run = new_run();
    let effect = advance(&mut run, &def, RunEvent::Start, Utc::now()).unwrap();
    assert_eq!(
      effect,
      Effect::ExecuteStage {
        stage_index: 0,
        attempt: 1,
        delay: Duration::ZERO
      }
    );
    assert_eq!(run.status, RunStatus::Running);
    assert_eq!(run.revision, 1);

    // Duplicate start is a no-op.
    assert_eq!(advance(&mut run, &def, RunEvent::Start, Utc::now()).unwrap(), Effect::Ignored);
  }

  #[test]
  fn failure_retries_with_backoff_then_succeeds() {
    let def = definition();
    let mut run = new_run();
    advance(&mut run, &def, RunEvent::Start, Utc::now()).unwrap();

    let effect = advance(&mut run, &def, completed(0, 1, StageOutcome::failed("make")), Utc::now()).unwrap();
    assert_eq!(
      effect,
      Effect::ExecuteStage {
        stage_index: 0,
        attempt: 2,
        delay: Duration::from_millis(5)
      }
    );
    assert!(run.stage_history.is_empty());

    let effect = advance(&mut run, &def, completed(0, 2, StageOutcome::success()), Utc::now()).unwrap();
    assert_eq!(effect, Effect::RequestApproval { stage_index: 1 });
    assert_eq!(run.stage_history.len(), 1);
    assert_eq!(run.stage_history[0].attempt_count(), 2);
    assert_eq!(run.stage_history[0].outcome, OutcomeKind::Success);
    assert_eq!(run.status, RunStatus::AwaitingApproval);
  }

  #[test]
  fn stale_completion_is_ignored() {
    let def = definition();
    let mut run = new_run();
    advance(&mut run, &def, RunEvent::Start, Utc::now()).unwrap();
    advance(&mut run, &def, completed(0, 1, StageOutcome::success()), Utc::now()).unwrap();
    let before = run.clone();

    let effect = advance(&mut run, &def, completed(0, 1, StageOutcome::success()), Utc::now()).unwrap();
    assert_eq!(effect, Effect::Ignored);
    assert_eq!(run, before);
  }

  #[test]
  fn exhausted_retries_fail_the_run() {
    let def = definition();
    let mut run = new_run();
    advance(&mut run, &def, RunEvent::Start, Utc::now()).unwrap();
    for attempt in 1..=3 {
      advance(&mut run, &def, completed(0, attempt, StageOutcome::failed("make")), Utc::now()).unwrap();
    }
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.stage_history.len(), 1);
    assert_eq!(run.stage_history[0].attempt_count(), 3);
    assert!(matches!(
      run.failure_error(),
      Some(ConveyorError::StageExecutionFailure { attempts: 3, .. })
    ));
  }

  #[test]
  fn cancellation_outcome_is_not_retried() {
    let def = definition();
    let mut run = new_run();
    advance(&mut run, &def, RunEvent::Start, Utc::now()).unwrap();
    let effect = advance(&mut run, &def, completed(0, 1, StageOutcome::cancelled()), Utc::now()).unwrap();
    assert_eq!(effect, Effect::Finished(RunStatus::Failed));
    assert!(matches!(run.failure, Some(RunFailure::StageCancelled { .. })));
  }

  #[test]
  fn approval_only_accepted_while_awaiting() {
    let def = definition();
    let mut run = new_run();
    advance(&mut run, &def, RunEvent::Start, Utc::now()).unwrap();
    let early = advance(
      &mut run,
      &def,
      RunEvent::ApprovalDecision {
        stage_name: "Approve".into(),
        resolution: ApprovalResolution::Approved { by: "alice".into() },
      },
      Utc::now(),
    );
    assert!(matches!(early, Err(ConveyorError::NotAwaitingApproval { .. })));

    advance(&mut run, &def, completed(0, 1, StageOutcome::success()), Utc::now()).unwrap();
    let effect = advance(
      &mut run,
      &def,
      RunEvent::ApprovalDecision {
        stage_name: "Approve".into(),
        resolution: ApprovalResolution::Approved { by: "alice".into() },
      },
      Utc::now(),
    )
    .unwrap();
    assert_eq!(
      effect,
      Effect::ExecuteStage {
        stage_index: 2,
        attempt: 1,
        delay: Duration::ZERO
      }
    );
    assert_eq!(run.stage_history[1].stage_name, "Approve");
    assert_eq!(run.stage_history[1].outcome, OutcomeKind::Success);
  }

  #[test]
  fn gated_executable_stage_runs_after_approval() {
    let def = PipelineDefinition::new("p", 1).with_stage(StageSpec::new("Prod").command("deploy").requires_approval());
    let mut run = new_run();
    let effect = advance(&mut run, &def, RunEvent::Start, Utc::now()).unwrap();
    assert_eq!(effect, Effect::RequestApproval { stage_index: 0 });

    let effect = advance(
      &mut run,
      &def,
      RunEvent::ApprovalDecision {
        stage_name: "Prod".into(),
        resolution: ApprovalResolution::Approved { by: "ops".into() },
      },
      Utc::now(),
    )
    .unwrap();
    assert_eq!(
      effect,
      Effect::ExecuteStage {
        stage_index: 0,
        attempt: 1,
        delay: Duration::ZERO
      }
    );
    assert_eq!(run.gate_cleared, Some(0));

    advance(&mut run, &def, completed(0, 1, StageOutcome::success()), Utc::now()).unwrap();
    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.stage_history.len(), 1);
  }

  #[test]
  fn rejection_and_timeout_fail_the_run() {
    for (resolution, outcome) in [
      (ApprovalResolution::Rejected { by: "bob".into() }, OutcomeKind::Failure),
      (ApprovalResolution::TimedOut, OutcomeKind::TimedOut),
    ] {
      let def = definition();
      let mut run = new_run();
      advance(&mut run, &def, RunEvent::Start, Utc::now()).unwrap();
      advance(&mut run, &def, completed(0, 1, StageOutcome::success()), Utc::now()).unwrap();
      let effect = advance(
        &mut run,
        &def,
        RunEvent::ApprovalDecision {
          stage_name: "Approve".into(),
          resolution,
        },
        Utc::now(),
      )
      .unwrap();
      assert_eq!(effect, Effect::Finished(RunStatus::Failed));
      assert_eq!(run.stage_history[1].outcome, outcome);
    }
  }

  #[test]
  fn terminal_runs_reject_further_events() {
    let def = definition();
    let mut run = new_run();
    advance(&mut run, &def, RunEvent::Start, Utc::now()).unwrap();
    advance(&mut run, &def, RunEvent::CancelRequested, Utc::now()).unwrap();
    let snapshot = run.clone();

    for event in [
      RunEvent::CancelRequested,
      completed(0, 1, StageOutcome::success()),
      RunEvent::Start,
    ] {
      let result = advance(&mut run, &def, event, Utc::now());
      assert!(matches!(result, Err(ConveyorError::AlreadyTerminal { .. })));
    }
    assert_eq!(run, snapshot);
  }

  #[test]
  fn resume_without_in_flight_attempt_is_an_internal_error() {
    let def = definition();
    let mut run = new_run();
    advance(&mut run, &def, RunEvent::Start, Utc::now()).unwrap();
    run.in_flight = None;
    assert!(matches!(resume(&mut run, &def, Utc::now()), Err(ConveyorError::Internal(_))));
  }

  #[test]
  fn resume_reexecutes_in_flight_attempt() {
    let def = definition();
    let mut run = new_run();
    let failed_at = Utc::now();
    advance(&mut run, &def, RunEvent::Start, failed_at).unwrap();
    advance(&mut run, &def, completed(0, 1, StageOutcome::failed("make")), failed_at).unwrap();

    // Restarted inside the backoff window: the rest of the backoff still applies.
    let effect = resume(&mut run.clone(), &def, failed_at + chrono::Duration::milliseconds(2)).unwrap();
    assert_eq!(
      effect,
      Effect::ExecuteStage {
        stage_index: 0,
        attempt: 2,
        delay: Duration::from_millis(3)
      }
    );

    let effect = resume(&mut run, &def, failed_at + chrono::Duration::seconds(1)).unwrap();
    assert_eq!(
      effect,
      Effect::ExecuteStage {
        stage_index: 0,
        attempt: 2,
        delay: Duration::ZERO
      }
    );

    let mut pending = new_run();
    assert_eq!(
      resume(&mut pending, &def, Utc::now()).unwrap(),
      Effect::ExecuteStage {
        stage_index: 0,
        attempt: 1,
        delay: Duration::ZERO
      }
    );
  }
}
