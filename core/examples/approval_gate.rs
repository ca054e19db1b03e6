// conveyor/examples/approval_gate.rs

use conveyor::{
  ApprovalVerdict, ConveyorResult, InMemoryArtifactStore, InMemoryRunStore, Orchestrator, OrchestratorConfig,
  PipelineDefinition, RunStatus, ShellStageExecutor, StageSpec, TracingNotificationSink, Trigger,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() -> ConveyorResult<()> {
  tracing_subscriber::fmt().with_max_level(tracing::Level::INFO).init();

  info!("--- Approval Gate Example ---");

  // 1. Local adapters: memory-backed records and blobs, commands run through `sh`.
  let work_dir = std::env::temp_dir().join("conveyor-example");
  let artifacts = Arc::new(InMemoryArtifactStore::new());
  let executor = Arc::new(ShellStageExecutor::new(artifacts, work_dir));
  let orchestrator = Orchestrator::new(
    OrchestratorConfig::default(),
    Arc::new(InMemoryRunStore::new()),
    executor,
    Arc::new(TracingNotificationSink),
  )?;

  // 2. Build → Approve → Deploy, with Deploy reading the Build artifact.
  let definition = PipelineDefinition::new("example", 1)
    .with_stage(
      StageSpec::new("Build")
        .command("echo \"built $CONVEYOR_COMMIT\" > \"$CONVEYOR_OUTPUT\"")
        .produces_artifact(),
    )
    .with_stage(StageSpec::approval("Approve"))
    .with_stage(StageSpec::new("Deploy").command("cat \"$CONVEYOR_INPUT\"").consumes("Build"));
  orchestrator.register_definition(definition)?;

  // 3. Trigger a run and wait for it to reach the gate.
  let receipt = orchestrator.trigger(Trigger::push("example", "main", "4f2a9c1")).await?;
  let Some(run_id) = receipt.run_id else {
    info!(?receipt, "Trigger was not started.");
    return Ok(());
  };
  loop {
    let run = orchestrator.run_status(&run_id).await?;
    if run.status == RunStatus::AwaitingApproval || run.is_terminal() {
      break;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
  }

  // 4. Approve, then wait for the outcome.
  orchestrator
    .decide_approval(&run_id, "Approve", ApprovalVerdict::Approve, "example-user")
    .await?;
  let run = orchestrator.wait_for_terminal(&run_id).await?;

  info!(status = %run.status, "Run finished.");
  for result in &run.stage_history {
    info!(stage = %result.stage_name, outcome = ?result.outcome, attempts = result.attempt_count(), "Stage result");
  }
  Ok(())
}
