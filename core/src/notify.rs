// conveyor/src/notify.rs

//! Where the orchestrator reports runs that reached a terminal status.

use crate::error::ConveyorError;
use crate::pipeline::DefinitionRef;
use crate::run::model::{Run, RunFailure, RunId, RunStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{event, Level};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunNotice {
  pub run_id: RunId,
  pub definition: DefinitionRef,
  pub branch: String,
  pub commit: String,
  pub status: RunStatus,
  pub failure: Option<RunFailure>,
  pub stages_completed: usize,
  pub finished_at: DateTime<Utc>,
}

impl RunNotice {
  pub fn from_run(run: &Run) -> Self {
    Self {
      run_id: run.run_id.clone(),
      definition: run.definition.clone(),
      branch: run.trigger.branch.clone(),
      commit: run.trigger.commit.clone(),
      status: run.status,
      failure: run.failure.clone(),
      stages_completed: run.stage_history.len(),
      finished_at: run.updated_at,
    }
  }

  pub fn failure_error(&self) -> Option<ConveyorError> {
    self.failure.as_ref().map(|f| f.to_error(&self.run_id))
  }
}

/// Receives one notice per run, after its terminal state is persisted.
///
/// Called outside every orchestrator lock. Implementations must not block.
pub trait NotificationSink: Send + Sync + 'static {
  fn notify(&self, notice: RunNotice);
}

/// Writes notices to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotificationSink;

impl NotificationSink for TracingNotificationSink {
  fn notify(&self, notice: RunNotice) {
    match notice.failure_error() {
      Some(err) => {
        event!(Level::WARN, run_id = %notice.run_id, pipeline = %notice.definition, branch = %notice.branch, status = %notice.status, error = %err, "Run finished.")
      }
      None => {
        event!(Level::INFO, run_id = %notice.run_id, pipeline = %notice.definition, branch = %notice.branch, status = %notice.status, stages = notice.stages_completed, "Run finished.")
      }
    }
  }
}

/// Forwards notices to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelNotificationSink {
  tx: mpsc::UnboundedSender<RunNotice>,
}

impl ChannelNotificationSink {
  pub fn channel() -> (Self, mpsc::UnboundedReceiver<RunNotice>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Self { tx }, rx)
  }
}

impl NotificationSink for ChannelNotificationSink {
  fn notify(&self, notice: RunNotice) {
    if self.tx.send(notice).is_err() {
      event!(Level::DEBUG, "Notice receiver dropped; discarding run notice.");
    }
  }
}
