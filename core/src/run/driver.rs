// conveyor/src/run/driver.rs

//! The async side of a run: carries out the effects `advance` returns.
//!
//! Every transition is applied to a copy of the run, persisted, and only then
//! adopted. If the store rejects a write the driver stops with the error and the
//! last durable snapshot stays authoritative for a later `resume`.

use crate::approval::{ApprovalGate, ApprovalRequest};
use crate::error::{ConveyorError, ConveyorResult};
use crate::executor::{ExecutionContext, FailureReason, StageExecutor, StageOutcome};
use crate::pipeline::PipelineDefinition;
use crate::run::machine::{self, Effect, RunEvent};
use crate::run::model::{Diagnostic, Run};
use crate::store::RunStore;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{event, instrument, Level};

/// How long a cancelled or timed-out executor task may keep running before it is aborted.
const EXECUTOR_GRACE: Duration = Duration::from_secs(5);

/// Cancellation handle shared by a run's driver and whoever may cancel it.
///
/// The driver holds `commit` while it persists a transition, and a canceller holds it
/// while it checks the durable state and signals `cancel`. A cancellation accepted
/// under the lock therefore always wins over a transition that has not been written.
#[derive(Debug, Default)]
pub struct RunControl {
  cancel: CancellationToken,
  commit: Mutex<()>,
}

impl RunControl {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn token(&self) -> CancellationToken {
    self.cancel.clone()
  }

  pub fn is_cancelled(&self) -> bool {
    self.cancel.is_cancelled()
  }

  /// Signals cancellation. Callers that need the signal ordered against the driver's
  /// writes hold `lock_commits` around it.
  pub fn cancel(&self) {
    self.cancel.cancel();
  }

  pub async fn lock_commits(&self) -> MutexGuard<'_, ()> {
    self.commit.lock().await
  }
}

pub struct RunDriver {
  definition: Arc<PipelineDefinition>,
  executor: Arc<dyn StageExecutor>,
  store: Arc<dyn RunStore>,
  gate: Arc<ApprovalGate>,
  control: Arc<RunControl>,
  cancel: CancellationToken,
}

/// Why `execute_attempt` returned without an outcome.
enum Interrupted {
  Cancelled,
}

impl RunDriver {
  pub fn new(
    definition: Arc<PipelineDefinition>,
    executor: Arc<dyn StageExecutor>,
    store: Arc<dyn RunStore>,
    gate: Arc<ApprovalGate>,
    control: Arc<RunControl>,
  ) -> Self {
    let cancel = control.token();
    Self {
      definition,
      executor,
      store,
      gate,
      control,
      cancel,
    }
  }

  pub fn control(&self) -> Arc<RunControl> {
    self.control.clone()
  }

  /// Drives `run` from its persisted state until it is terminal.
  ///
  /// Completed stages are never re-executed. An attempt that was in flight when the
  /// previous driver died is executed again under the same attempt number.
  #[instrument(name = "RunDriver::drive", skip_all, fields(run_id = %run.run_id, pipeline = %run.definition), err(Display))]
  pub async fn drive(&self, mut run: Run) -> ConveyorResult<Run> {
    if run.is_terminal() {
      return Ok(run);
    }

    let mut effect = {
      let _commit = self.control.lock_commits().await;
      if self.cancel.is_cancelled() {
        self.commit(&mut run, RunEvent::CancelRequested).await?
      } else {
        let mut next = run.clone();
        let effect = machine::resume(&mut next, &self.definition, Utc::now())?;
        if next != run {
          self.store.save_run(&next).await?;
          run = next;
        }
        effect
      }
    };

    loop {
      event!(Level::TRACE, ?effect, status = %run.status, "Executing effect.");
      effect = match effect {
        Effect::Finished(status) => {
          event!(Level::DEBUG, %status, "Driver finished.");
          return Ok(run);
        }
        Effect::Ignored => {
          return Err(ConveyorError::Internal(format!(
            "run {} produced no progress in state {}",
            run.run_id, run.status
          )));
        }
        Effect::ExecuteStage {
          stage_index,
          attempt,
          delay,
        } => {
          if !delay.is_zero() {
            event!(Level::DEBUG, stage_index, attempt, delay_ms = delay.as_millis() as u64, "Backing off before retry.");
            tokio::select! {
              _ = tokio::time::sleep(delay) => {}
              _ = self.cancel.cancelled() => {
                effect = self.apply_cancel(&mut run).await?;
                continue;
              }
            }
          }
          match self.execute_attempt(&run, stage_index, attempt).await? {
            Ok(outcome) => {
              self
                .apply(
                  &mut run,
                  RunEvent::StageCompleted {
                    stage_index,
                    attempt,
                    outcome,
                  },
                )
                .await?
            }
            Err(Interrupted::Cancelled) => self.apply_cancel(&mut run).await?,
          }
        }
        Effect::RequestApproval { stage_index } => {
          let stage_name = self
            .definition
            .stage(stage_index)
            .map(|s| s.name.clone())
            .ok_or_else(|| ConveyorError::Internal(format!("gate index {} out of range", stage_index)))?;
          let requested_at = run.gate_opened_at.unwrap_or_else(Utc::now);
          let subscription = self
            .gate
            .request(ApprovalRequest::new(run.run_id.clone(), stage_name.clone(), requested_at))
            .await?;

          let resolution = tokio::select! {
            resolution = self.gate.wait(subscription) => resolution?,
            _ = self.cancel.cancelled() => {
              self.gate.withdraw(&run.run_id, &stage_name);
              effect = self.apply_cancel(&mut run).await?;
              continue;
            }
          };
          self
            .apply(&mut run, RunEvent::ApprovalDecision { stage_name, resolution })
            .await?
        }
      };
    }
  }

  /// Applies one event: advance a copy, persist it, adopt it. Once cancellation has
  /// been signalled every event is recorded as `CancelRequested`.
  async fn apply(&self, run: &mut Run, event: RunEvent) -> ConveyorResult<Effect> {
    let _commit = self.control.lock_commits().await;
    let event = if self.cancel.is_cancelled() && event != RunEvent::CancelRequested {
      event!(Level::DEBUG, run_id = %run.run_id, ?event, "Cancellation signalled; recording it instead.");
      RunEvent::CancelRequested
    } else {
      event
    };
    self.commit(run, event).await
  }

  /// Caller holds the commit lock.
  async fn commit(&self, run: &mut Run, event: RunEvent) -> ConveyorResult<Effect> {
    let mut next = run.clone();
    let effect = machine::advance(&mut next, &self.definition, event, Utc::now())?;
    if effect != Effect::Ignored {
      self.store.save_run(&next).await?;
      *run = next;
    }
    Ok(effect)
  }

  async fn apply_cancel(&self, run: &mut Run) -> ConveyorResult<Effect> {
    event!(Level::INFO, run_id = %run.run_id, stage_index = run.current_stage_index, "Cancelling run.");
    match self.apply(run, RunEvent::CancelRequested).await {
      Err(ConveyorError::AlreadyTerminal { .. }) => Ok(Effect::Finished(run.status)),
      other => other,
    }
  }

  /// Runs one attempt in its own task, bounded by the stage timeout and the run's
  /// cancellation token.
  async fn execute_attempt(
    &self,
    run: &Run,
    stage_index: usize,
    attempt: u32,
  ) -> ConveyorResult<Result<StageOutcome, Interrupted>> {
    let stage = self
      .definition
      .stage(stage_index)
      .cloned()
      .ok_or_else(|| ConveyorError::Internal(format!("stage index {} out of range", stage_index)))?;

    let input = match &stage.input_artifact {
      Some(producer) => match run.artifact_of(producer) {
        Some(reference) => Some(reference.clone()),
        None => {
          event!(Level::WARN, stage = %stage.name, %producer, "Input artifact missing from run history.");
          return Ok(Ok(StageOutcome::Failure {
            reason: FailureReason::MissingArtifact,
            diagnostic: Some(Diagnostic::new(format!("stage '{}' left no artifact", producer))),
          }));
        }
      },
      None => None,
    };

    let ctx = ExecutionContext {
      run_id: run.run_id.clone(),
      definition: run.definition.clone(),
      trigger: run.trigger.clone(),
      stage_index,
      attempt,
      input,
    };
    let timeout = stage.timeout();
    let attempt_token = self.cancel.child_token();

    event!(Level::INFO, stage = %stage.name, attempt, "Executing stage.");
    let mut task: JoinHandle<ConveyorResult<StageOutcome>> = {
      let executor = self.executor.clone();
      let token = attempt_token.clone();
      tokio::spawn(async move { executor.execute(&ctx, &stage, token).await })
    };

    let expiry = async move {
      match timeout {
        Some(limit) => tokio::time::sleep(limit).await,
        None => std::future::pending::<()>().await,
      }
    };

    tokio::select! {
      joined = &mut task => {
        if self.cancel.is_cancelled() {
          return Ok(Err(Interrupted::Cancelled));
        }
        let outcome = joined.map_err(|e| ConveyorError::Internal(format!("stage executor task failed: {}", e)))??;
        Ok(Ok(outcome))
      }
      _ = expiry => {
        attempt_token.cancel();
        detach(task);
        let limit = timeout.unwrap_or_default();
        event!(Level::WARN, attempt, timeout_secs = limit.as_secs(), "Stage attempt timed out.");
        Ok(Ok(StageOutcome::TimedOut {
          diagnostic: Some(Diagnostic::new(format!("attempt exceeded its {}s timeout", limit.as_secs()))),
        }))
      }
      _ = self.cancel.cancelled() => {
        detach(task);
        Ok(Err(Interrupted::Cancelled))
      }
    }
  }
}

/// Lets a signalled executor task wind down, then aborts it. Its outcome is dropped.
fn detach(mut task: JoinHandle<ConveyorResult<StageOutcome>>) {
  tokio::spawn(async move {
    if tokio::time::timeout(EXECUTOR_GRACE, &mut task).await.is_err() {
      event!(Level::WARN, "Stage executor ignored cancellation; aborting its task.");
      task.abort();
    }
  });
}
