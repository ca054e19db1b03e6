// conveyor/src/store/memory.rs

use crate::approval::ApprovalRequest;
use crate::error::ConveyorResult;
use crate::run::model::{Run, RunId};
use crate::store::RunStore;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Process-local store. Survives driver restarts within one process, which is what
/// the crash-recovery tests rely on.
#[derive(Debug, Default)]
pub struct InMemoryRunStore {
  runs: RwLock<HashMap<RunId, Run>>,
  approvals: RwLock<HashMap<(RunId, String), ApprovalRequest>>,
}

impl InMemoryRunStore {
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
  async fn save_run(&self, run: &Run) -> ConveyorResult<()> {
    self.runs.write().insert(run.run_id.clone(), run.clone());
    Ok(())
  }

  async fn load_run(&self, run_id: &RunId) -> ConveyorResult<Option<Run>> {
    Ok(self.runs.read().get(run_id).cloned())
  }

  async fn list_runs(&self) -> ConveyorResult<Vec<Run>> {
    let mut runs: Vec<Run> = self.runs.read().values().cloned().collect();
    runs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.run_id.cmp(&b.run_id)));
    Ok(runs)
  }

  async fn save_approval(&self, request: &ApprovalRequest) -> ConveyorResult<()> {
    self
      .approvals
      .write()
      .insert((request.run_id.clone(), request.stage_name.clone()), request.clone());
    Ok(())
  }

  async fn load_approval(&self, run_id: &RunId, stage_name: &str) -> ConveyorResult<Option<ApprovalRequest>> {
    Ok(
      self
        .approvals
        .read()
        .get(&(run_id.clone(), stage_name.to_string()))
        .cloned(),
    )
  }
}
