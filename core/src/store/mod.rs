// conveyor/src/store/mod.rs

//! Durable records: one per run, one per approval request.

pub mod file;
pub mod memory;

use crate::approval::ApprovalRequest;
use crate::error::ConveyorResult;
use crate::run::model::{Run, RunId};
use async_trait::async_trait;

pub use file::FileRunStore;
pub use memory::InMemoryRunStore;

/// Persistence seam for the run state machine.
///
/// A successful `save_*` must be readable after a crash. Failures surface as
/// `ConveyorError::PersistenceFailure`.
#[async_trait]
pub trait RunStore: Send + Sync + 'static {
  async fn save_run(&self, run: &Run) -> ConveyorResult<()>;

  async fn load_run(&self, run_id: &RunId) -> ConveyorResult<Option<Run>>;

  /// All runs, oldest first.
  async fn list_runs(&self) -> ConveyorResult<Vec<Run>>;

  async fn save_approval(&self, request: &ApprovalRequest) -> ConveyorResult<()>;

  async fn load_approval(&self, run_id: &RunId, stage_name: &str) -> ConveyorResult<Option<ApprovalRequest>>;
}
