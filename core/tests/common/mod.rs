// conveyor/tests/common/mod.rs
#![allow(dead_code)] // Allow unused code in this common test module

use async_trait::async_trait;
use conveyor::{
  ApprovalRequest, ArtifactStore, ChannelNotificationSink, ConveyorError, ConveyorResult, ExecutionContext,
  InMemoryArtifactStore, InMemoryRunStore, Orchestrator, OrchestratorConfig, PipelineDefinition, RunId, RunNotice,
  RunStore, StageExecutor, StageOutcome, StageSpec,
};
use conveyor::run::Run;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Level;

// --- Scripted executor ---

/// What the scripted executor does for one attempt.
#[derive(Clone, Debug)]
pub enum Step {
  Succeed,
  /// Succeeds and stores `bytes` as the stage artifact.
  Produce(&'static [u8]),
  Fail(&'static str),
  /// Sleeps, then succeeds. Honors cancellation.
  Sleep(Duration),
  /// Blocks until cancelled.
  Hang,
  /// Sleeps without looking at the cancellation token, then succeeds.
  IgnoreCancel(Duration),
  /// Returns an infrastructure error.
  Infra(&'static str),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Call {
  pub run_id: RunId,
  pub stage: String,
  pub attempt: u32,
  pub had_input: bool,
}

/// Plays back per-stage scripts. A stage without (remaining) script succeeds.
pub struct ScriptedExecutor {
  scripts: Mutex<HashMap<String, VecDeque<Step>>>,
  calls: Mutex<Vec<Call>>,
  artifacts: Arc<InMemoryArtifactStore>,
  pub late_completions: AtomicUsize,
}

impl ScriptedExecutor {
  pub fn new() -> Arc<Self> {
    Arc::new(Self {
      scripts: Mutex::new(HashMap::new()),
      calls: Mutex::new(Vec::new()),
      artifacts: Arc::new(InMemoryArtifactStore::new()),
      late_completions: AtomicUsize::new(0),
    })
  }

  pub fn script(&self, stage: &str, steps: impl IntoIterator<Item = Step>) {
    self
      .scripts
      .lock()
      .entry(stage.to_string())
      .or_default()
      .extend(steps);
  }

  pub fn calls(&self) -> Vec<Call> {
    self.calls.lock().clone()
  }

  pub fn calls_for(&self, stage: &str) -> Vec<Call> {
    self.calls.lock().iter().filter(|c| c.stage == stage).cloned().collect()
  }

  pub fn artifacts(&self) -> Arc<InMemoryArtifactStore> {
    self.artifacts.clone()
  }
}

#[async_trait]
impl StageExecutor for ScriptedExecutor {
  async fn execute(
    &self,
    ctx: &ExecutionContext,
    stage: &StageSpec,
    cancel: CancellationToken,
  ) -> ConveyorResult<StageOutcome> {
    self.calls.lock().push(Call {
      run_id: ctx.run_id.clone(),
      stage: stage.name.clone(),
      attempt: ctx.attempt,
      had_input: ctx.input.is_some(),
    });
    let step = self
      .scripts
      .lock()
      .get_mut(&stage.name)
      .and_then(|q| q.pop_front())
      .unwrap_or(Step::Succeed);
    tracing::debug!(target: "scripted_executor", stage = %stage.name, attempt = ctx.attempt, ?step, "executing");

    match step {
      Step::Succeed => Ok(StageOutcome::success()),
      Step::Produce(bytes) => {
        let artifact = self.artifacts.put(&ctx.run_id, &stage.name, bytes.to_vec()).await?;
        Ok(StageOutcome::Success {
          artifact: Some(artifact),
        })
      }
      Step::Fail(message) => Ok(StageOutcome::failed(message)),
      Step::Sleep(duration) => tokio::select! {
        _ = tokio::time::sleep(duration) => Ok(StageOutcome::success()),
        _ = cancel.cancelled() => Ok(StageOutcome::cancelled()),
      },
      Step::Hang => {
        cancel.cancelled().await;
        Ok(StageOutcome::cancelled())
      }
      Step::IgnoreCancel(duration) => {
        tokio::time::sleep(duration).await;
        self.late_completions.fetch_add(1, Ordering::SeqCst);
        Ok(StageOutcome::success())
      }
      Step::Infra(message) => Err(ConveyorError::External {
        source: anyhow::anyhow!(message),
      }),
    }
  }
}

// --- Store that can be made to fail ---

/// Delegates to an in-memory store; `save_run` fails while `failing` is set, or once
/// `fail_after` more run saves have succeeded. Terminal saves and the next load can
/// be slowed down to widen race windows.
pub struct FlakyStore {
  pub inner: InMemoryRunStore,
  failing: AtomicBool,
  fail_after: Mutex<Option<usize>>,
  terminal_save_delay: Mutex<Option<Duration>>,
  next_load_delay: Mutex<Option<Duration>>,
  pub run_saves: AtomicUsize,
}

impl FlakyStore {
  pub fn new() -> Arc<Self> {
    Arc::new(Self {
      inner: InMemoryRunStore::new(),
      failing: AtomicBool::new(false),
      fail_after: Mutex::new(None),
      terminal_save_delay: Mutex::new(None),
      next_load_delay: Mutex::new(None),
      run_saves: AtomicUsize::new(0),
    })
  }

  pub fn set_failing(&self, failing: bool) {
    self.failing.store(failing, Ordering::SeqCst);
  }

  /// Clears every failure mode.
  pub fn heal(&self) {
    *self.fail_after.lock() = None;
    self.failing.store(false, Ordering::SeqCst);
  }

  /// Lets `n` more run saves through, then fails every one after.
  pub fn fail_after(&self, n: usize) {
    *self.fail_after.lock() = Some(n);
  }

  /// Every save of a terminal run sleeps `delay` before it is written.
  pub fn slow_terminal_saves(&self, delay: Duration) {
    *self.terminal_save_delay.lock() = Some(delay);
  }

  /// The next `load_run` sleeps `delay` before reading.
  pub fn slow_next_load(&self, delay: Duration) {
    *self.next_load_delay.lock() = Some(delay);
  }

  fn should_fail(&self) -> bool {
    if self.failing.load(Ordering::SeqCst) {
      return true;
    }
    let mut remaining = self.fail_after.lock();
    match remaining.as_mut() {
      Some(0) => {
        self.failing.store(true, Ordering::SeqCst);
        true
      }
      Some(n) => {
        *n -= 1;
        false
      }
      None => false,
    }
  }
}

#[async_trait]
impl RunStore for FlakyStore {
  async fn save_run(&self, run: &Run) -> ConveyorResult<()> {
    if self.should_fail() {
      return Err(ConveyorError::PersistenceFailure {
        operation: format!("saving run {}", run.run_id),
        source: anyhow::anyhow!("disk full"),
      });
    }
    let delay = *self.terminal_save_delay.lock();
    if let Some(delay) = delay.filter(|_| run.is_terminal()) {
      tokio::time::sleep(delay).await;
    }
    self.run_saves.fetch_add(1, Ordering::SeqCst);
    self.inner.save_run(run).await
  }

  async fn load_run(&self, run_id: &RunId) -> ConveyorResult<Option<Run>> {
    let delay = self.next_load_delay.lock().take();
    if let Some(delay) = delay {
      tokio::time::sleep(delay).await;
    }
    self.inner.load_run(run_id).await
  }

  async fn list_runs(&self) -> ConveyorResult<Vec<Run>> {
    self.inner.list_runs().await
  }

  async fn save_approval(&self, request: &ApprovalRequest) -> ConveyorResult<()> {
    self.inner.save_approval(request).await
  }

  async fn load_approval(&self, run_id: &RunId, stage_name: &str) -> ConveyorResult<Option<ApprovalRequest>> {
    self.inner.load_approval(run_id, stage_name).await
  }
}

// --- Definitions ---

/// `stages` plain stages named `stage-1` .. `stage-N`.
pub fn linear_pipeline(name: &str, stages: usize) -> PipelineDefinition {
  (1..=stages).fold(PipelineDefinition::new(name, 1), |def, i| {
    def.with_stage(StageSpec::new(format!("stage-{}", i)).command(format!("step {}", i)))
  })
}

/// Build (artifact) → Approve (gate) → Deploy (consumes Build).
pub fn gated_pipeline(name: &str) -> PipelineDefinition {
  PipelineDefinition::new(name, 1)
    .with_stage(StageSpec::new("Build").command("make").produces_artifact())
    .with_stage(StageSpec::approval("Approve"))
    .with_stage(StageSpec::new("Deploy").command("make deploy").consumes("Build"))
}

// --- Harness ---

pub struct Harness {
  pub orchestrator: Orchestrator,
  pub executor: Arc<ScriptedExecutor>,
  pub store: Arc<FlakyStore>,
  pub notices: mpsc::UnboundedReceiver<RunNotice>,
}

pub fn harness(config: OrchestratorConfig) -> Harness {
  harness_with(config, FlakyStore::new(), ScriptedExecutor::new())
}

pub fn harness_with(config: OrchestratorConfig, store: Arc<FlakyStore>, executor: Arc<ScriptedExecutor>) -> Harness {
  let (sink, notices) = ChannelNotificationSink::channel();
  let orchestrator = Orchestrator::new(config, store.clone(), executor.clone(), Arc::new(sink))
    .expect("valid test configuration");
  Harness {
    orchestrator,
    executor,
    store,
    notices,
  }
}

/// Polls until `check` holds for the persisted run, or panics after ~5s.
pub async fn wait_until<F>(orchestrator: &Orchestrator, run_id: &RunId, check: F) -> Run
where
  F: Fn(&Run) -> bool,
{
  for _ in 0..500 {
    if let Ok(run) = orchestrator.run_status(run_id).await {
      if check(&run) {
        return run;
      }
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
  panic!("run {} never reached the expected state", run_id);
}

// --- Helper for Tracing Setup (call once per test run if needed) ---
use once_cell::sync::Lazy;
static TRACING_INIT: Lazy<()> = Lazy::new(|| {
  tracing_subscriber::fmt()
    .with_max_level(Level::DEBUG)
    .with_test_writer() // Important for tests to capture output
    .try_init()
    .ok(); // Allow multiple initializations in tests (ok if fails)
});

pub fn setup_tracing() {
  Lazy::force(&TRACING_INIT);
}
