// conveyor/src/orchestrator.rs

//! Owns the set of live runs and turns triggers into runs.
//!
//! One slot exists per (pipeline, branch) with a non-terminal run. Reserving a slot,
//! clearing it, and promoting a queued trigger into it all happen under the same
//! `parking_lot` mutex, which is never held across an `.await`.

use crate::approval::{ApprovalGate, ApprovalRequest, ApprovalVerdict};
use crate::config::{DuplicateTriggerPolicy, OrchestratorConfig};
use crate::error::{ConveyorError, ConveyorResult};
use crate::executor::StageExecutor;
use crate::notify::{NotificationSink, RunNotice};
use crate::pipeline::{DefinitionRef, PipelineDefinition, Trigger};
use crate::run::machine::{self, RunEvent};
use crate::run::model::{Run, RunId, RunStatus};
use crate::run::{RunControl, RunDriver};
use crate::store::RunStore;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{event, info_span, instrument, Instrument, Level};

/// Answer to a trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerReceipt {
  pub accepted: bool,
  /// Set when a run was created for this trigger.
  pub run_id: Option<RunId>,
  pub reason: Option<String>,
}

impl TriggerReceipt {
  fn started(run_id: RunId) -> Self {
    Self {
      accepted: true,
      run_id: Some(run_id),
      reason: None,
    }
  }

  fn queued(behind: &RunId, position: usize) -> Self {
    Self {
      accepted: true,
      run_id: None,
      reason: Some(format!("queued at position {} behind run {}", position, behind)),
    }
  }

  fn ignored(reason: String) -> Self {
    Self {
      accepted: false,
      run_id: None,
      reason: Some(reason),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReceipt {
  Accepted,
  AlreadyTerminal,
}

type RunKey = (String, String);

const CLAIM_POLL_INTERVAL: Duration = Duration::from_millis(10);

fn run_key(pipeline: &str, branch: &str) -> RunKey {
  (pipeline.to_string(), branch.to_string())
}

struct Slot {
  run_id: RunId,
  queue: VecDeque<Trigger>,
}

/// A run somebody is acting on: a driver is running it (`done` set), or a resume or
/// a stalled cancellation holds it. At most one exists per run id.
struct LiveRun {
  control: Arc<RunControl>,
  done: Option<watch::Receiver<bool>>,
}

#[derive(Default)]
struct State {
  slots: HashMap<RunKey, Slot>,
  live: HashMap<RunId, LiveRun>,
  /// Stalled runs whose cancellation was accepted before their driver stopped.
  cancel_requested: HashSet<RunId>,
}

impl State {
  /// Claims `run_id` for the caller, or hands back the control of whoever holds it.
  fn claim(&mut self, run_id: &RunId) -> Result<Arc<RunControl>, Arc<RunControl>> {
    if let Some(live) = self.live.get(run_id) {
      return Err(live.control.clone());
    }
    let control = Arc::new(RunControl::new());
    if self.cancel_requested.contains(run_id) {
      control.cancel();
    }
    self.live.insert(
      run_id.clone(),
      LiveRun {
        control: control.clone(),
        done: None,
      },
    );
    Ok(control)
  }

  fn holds(&self, run_id: &RunId, control: &Arc<RunControl>) -> bool {
    self
      .live
      .get(run_id)
      .map_or(false, |live| Arc::ptr_eq(&live.control, control))
  }

  /// Frees the slot held by `finished`, or hands it to the next queued trigger under a
  /// fresh run id.
  fn release(&mut self, key: &RunKey, finished: &RunId) -> Option<(RunId, Trigger)> {
    let slot = self.slots.get_mut(key)?;
    if &slot.run_id != finished {
      return None;
    }
    match slot.queue.pop_front() {
      Some(trigger) => {
        let run_id = RunId::generate();
        slot.run_id = run_id.clone();
        Some((run_id, trigger))
      }
      None => {
        self.slots.remove(key);
        None
      }
    }
  }
}

#[derive(Default)]
struct Definitions {
  by_ref: HashMap<DefinitionRef, Arc<PipelineDefinition>>,
  latest: HashMap<String, u32>,
}

struct Inner {
  config: OrchestratorConfig,
  store: Arc<dyn RunStore>,
  executor: Arc<dyn StageExecutor>,
  notifier: Arc<dyn NotificationSink>,
  gate: Arc<ApprovalGate>,
  definitions: RwLock<Definitions>,
  state: Mutex<State>,
}

/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Orchestrator {
  inner: Arc<Inner>,
}

impl Orchestrator {
  pub fn new(
    config: OrchestratorConfig,
    store: Arc<dyn RunStore>,
    executor: Arc<dyn StageExecutor>,
    notifier: Arc<dyn NotificationSink>,
  ) -> ConveyorResult<Self> {
    config.validate()?;
    let gate = Arc::new(ApprovalGate::new(store.clone(), config.approval_timeout));
    Ok(Self {
      inner: Arc::new(Inner {
        config,
        store,
        executor,
        notifier,
        gate,
        definitions: RwLock::new(Definitions::default()),
        state: Mutex::new(State::default()),
      }),
    })
  }

  pub fn config(&self) -> &OrchestratorConfig {
    &self.inner.config
  }

  /// Validates and registers a definition. Stages without a retry policy get the
  /// configured default. Re-registering an identical definition is a no-op; a
  /// different definition under an existing name and version is rejected.
  pub fn register_definition(&self, definition: PipelineDefinition) -> ConveyorResult<DefinitionRef> {
    definition.validate()?;
    let definition = definition.resolve_retry_policies(self.inner.config.default_retry_policy);
    let reference = definition.reference();

    let mut defs = self.inner.definitions.write();
    if let Some(existing) = defs.by_ref.get(&reference) {
      if **existing != definition {
        return Err(ConveyorError::InvalidDefinition {
          pipeline: reference.name.clone(),
          message: format!("{} is already registered with different content", reference),
        });
      }
      return Ok(reference);
    }
    defs.by_ref.insert(reference.clone(), Arc::new(definition));
    let latest = defs.latest.entry(reference.name.clone()).or_insert(reference.version);
    if *latest < reference.version {
      *latest = reference.version;
    }
    event!(Level::INFO, pipeline = %reference, stages = defs.by_ref[&reference].len(), "Pipeline definition registered.");
    Ok(reference)
  }

  fn latest_definition(&self, pipeline: &str) -> ConveyorResult<Arc<PipelineDefinition>> {
    let defs = self.inner.definitions.read();
    defs
      .latest
      .get(pipeline)
      .and_then(|version| {
        defs.by_ref.get(&DefinitionRef {
          name: pipeline.to_string(),
          version: *version,
        })
      })
      .cloned()
      .ok_or_else(|| ConveyorError::PipelineNotFound {
        pipeline: pipeline.to_string(),
      })
  }

  fn definition(&self, reference: &DefinitionRef) -> ConveyorResult<Arc<PipelineDefinition>> {
    self
      .inner
      .definitions
      .read()
      .by_ref
      .get(reference)
      .cloned()
      .ok_or_else(|| ConveyorError::PipelineNotFound {
        pipeline: reference.to_string(),
      })
  }

  /// Turns a trigger into a run of the latest registered version of its pipeline.
  #[instrument(name = "Orchestrator::trigger", skip_all, fields(pipeline = %trigger.pipeline, branch = %trigger.branch, commit = %trigger.commit), err(Display))]
  pub async fn trigger(&self, trigger: Trigger) -> ConveyorResult<TriggerReceipt> {
    let definition = self.latest_definition(&trigger.pipeline)?;
    if !definition.trigger.matches(&trigger) {
      event!(Level::DEBUG, trigger_event = ?trigger.event, "Trigger does not match the pipeline's filter.");
      return Ok(TriggerReceipt::ignored(format!(
        "{:?} on '{}' does not match the trigger filter of {}",
        trigger.event,
        trigger.branch,
        definition.reference()
      )));
    }

    let key = run_key(&trigger.pipeline, &trigger.branch);
    let run_id = {
      let mut state = self.inner.state.lock();
      if let Some(slot) = state.slots.get_mut(&key) {
        return match self.inner.config.duplicate_trigger_policy {
          DuplicateTriggerPolicy::Reject => Err(ConveyorError::RunInProgress {
            pipeline: trigger.pipeline.clone(),
            branch: trigger.branch.clone(),
            active_run_id: slot.run_id.to_string(),
          }),
          DuplicateTriggerPolicy::Queue => {
            slot.queue.push_back(trigger);
            event!(Level::INFO, active_run_id = %slot.run_id, queued = slot.queue.len(), "Trigger queued behind live run.");
            Ok(TriggerReceipt::queued(&slot.run_id, slot.queue.len()))
          }
        };
      }
      if state.slots.len() >= self.inner.config.max_concurrent_runs {
        return Err(ConveyorError::CapacityExhausted {
          limit: self.inner.config.max_concurrent_runs,
        });
      }
      let run_id = RunId::generate();
      state.slots.insert(
        key.clone(),
        Slot {
          run_id: run_id.clone(),
          queue: VecDeque::new(),
        },
      );
      run_id
    };

    match self.start_run(run_id.clone(), definition, &trigger).await {
      Ok(()) => Ok(TriggerReceipt::started(run_id)),
      Err(e) => {
        // Nothing durable exists for this run; hand the slot on.
        self.start_next_queued(key, run_id).await;
        Err(e)
      }
    }
  }

  /// Persists a `Pending` run and spawns its driver.
  async fn start_run(&self, run_id: RunId, definition: Arc<PipelineDefinition>, trigger: &Trigger) -> ConveyorResult<()> {
    let control = self
      .inner
      .state
      .lock()
      .claim(&run_id)
      .map_err(|_| ConveyorError::Internal(format!("fresh run id {} is already live", run_id)))?;
    let run = Run::new(run_id, definition.reference(), trigger.reference(), Utc::now());
    if let Err(e) = self.inner.store.save_run(&run).await {
      self.inner.state.lock().live.remove(&run.run_id);
      return Err(e);
    }
    event!(Level::INFO, run_id = %run.run_id, pipeline = %run.definition, "Run created.");
    self.spawn_driver(run, definition, control);
    Ok(())
  }

  /// Caller holds the claim on the run.
  fn spawn_driver(&self, run: Run, definition: Arc<PipelineDefinition>, control: Arc<RunControl>) {
    let run_id = run.run_id.clone();
    let key = run_key(&run.definition.name, &run.trigger.branch);
    let (done_tx, done_rx) = watch::channel(false);
    self.inner.state.lock().live.insert(
      run_id.clone(),
      LiveRun {
        control: control.clone(),
        done: Some(done_rx),
      },
    );

    let driver = RunDriver::new(
      definition,
      self.inner.executor.clone(),
      self.inner.store.clone(),
      self.inner.gate.clone(),
      control.clone(),
    );
    let span = info_span!("run", run_id = %run_id, pipeline = %run.definition, branch = %run.trigger.branch);
    let this = self.clone();
    tokio::spawn(
      async move {
        let result = driver.drive(run).await;
        this.on_driver_exit(key, run_id, control, result).await;
        let _ = done_tx.send(true);
      }
      .instrument(span),
    );
  }

  async fn on_driver_exit(&self, key: RunKey, run_id: RunId, control: Arc<RunControl>, result: ConveyorResult<Run>) {
    let terminal = matches!(&result, Ok(run) if run.is_terminal());
    self.release_claim(&run_id, &control, terminal).await;

    match result {
      Ok(run) if run.is_terminal() => {
        self.inner.notifier.notify(RunNotice::from_run(&run));
        self.start_next_queued(key, run_id).await;
      }
      Ok(run) => {
        event!(Level::WARN, status = %run.status, "Driver returned a non-terminal run; slot kept for resumption.");
      }
      Err(e) => {
        // The last persisted snapshot stays authoritative; `resume` picks it up.
        event!(Level::ERROR, error = %e, "Run driver stopped; run is stalled until resumed.");
      }
    }
  }

  /// Drops the claim on `run_id`. Taking the commit lock first means a canceller that
  /// holds the same control either signalled before this point, and is remembered for
  /// the next resume, or finds the claim gone and retries.
  async fn release_claim(&self, run_id: &RunId, control: &Arc<RunControl>, terminal: bool) {
    let _commit = control.lock_commits().await;
    let mut state = self.inner.state.lock();
    if state.holds(run_id, control) {
      state.live.remove(run_id);
    }
    if terminal {
      state.cancel_requested.remove(run_id);
    } else if control.is_cancelled() {
      state.cancel_requested.insert(run_id.clone());
    }
  }

  /// Releases the slot `finished` held and starts queued triggers until one succeeds.
  async fn start_next_queued(&self, key: RunKey, mut finished: RunId) {
    loop {
      let next = self.inner.state.lock().release(&key, &finished);
      let Some((run_id, trigger)) = next else {
        return;
      };
      let started = match self.latest_definition(&trigger.pipeline) {
        Ok(definition) => self.start_run(run_id.clone(), definition, &trigger).await,
        Err(e) => Err(e),
      };
      match started {
        Ok(()) => {
          event!(Level::INFO, run_id = %run_id, pipeline = %key.0, branch = %key.1, "Queued trigger started.");
          return;
        }
        Err(e) => {
          event!(Level::ERROR, pipeline = %key.0, branch = %key.1, error = %e, "Dropping queued trigger that failed to start.");
          finished = run_id;
        }
      }
    }
  }

  /// Records an approval decision for the gate a run is waiting on.
  #[instrument(name = "Orchestrator::decide_approval", skip_all, fields(run_id = %run_id, stage = %stage_name, verdict = ?verdict, actor = %actor), err(Display))]
  pub async fn decide_approval(
    &self,
    run_id: &RunId,
    stage_name: &str,
    verdict: ApprovalVerdict,
    actor: &str,
  ) -> ConveyorResult<ApprovalRequest> {
    let run = self.run_status(run_id).await?;
    let definition = self.definition(&run.definition)?;
    let waiting_here = run.status == RunStatus::AwaitingApproval
      && definition
        .stage(run.current_stage_index)
        .map_or(false, |s| s.name == stage_name);

    if !waiting_here {
      let decided = self
        .inner
        .store
        .load_approval(run_id, stage_name)
        .await?
        .map_or(false, |r| r.is_decided());
      return Err(if decided {
        ConveyorError::AlreadyDecided {
          run_id: run_id.to_string(),
          stage_name: stage_name.to_string(),
        }
      } else {
        ConveyorError::NotAwaitingApproval {
          run_id: run_id.to_string(),
          stage_name: stage_name.to_string(),
        }
      });
    }

    // The driver may not have opened the gate yet; open it from the run's record.
    let requested_at = run.gate_opened_at.unwrap_or(run.updated_at);
    self
      .inner
      .gate
      .open(ApprovalRequest::new(run_id.clone(), stage_name, requested_at))
      .await?;
    self.inner.gate.decide(run_id, stage_name, verdict, actor).await
  }

  pub async fn run_status(&self, run_id: &RunId) -> ConveyorResult<Run> {
    self
      .inner
      .store
      .load_run(run_id)
      .await?
      .ok_or_else(|| ConveyorError::RunNotFound {
        run_id: run_id.to_string(),
      })
  }

  /// Every persisted run, oldest first.
  pub async fn list_runs(&self) -> ConveyorResult<Vec<Run>> {
    self.inner.store.list_runs().await
  }

  /// The run currently holding the (pipeline, branch) slot.
  pub fn active_run(&self, pipeline: &str, branch: &str) -> Option<RunId> {
    self
      .inner
      .state
      .lock()
      .slots
      .get(&run_key(pipeline, branch))
      .map(|slot| slot.run_id.clone())
  }

  pub fn queued_triggers(&self, pipeline: &str, branch: &str) -> usize {
    self
      .inner
      .state
      .lock()
      .slots
      .get(&run_key(pipeline, branch))
      .map_or(0, |slot| slot.queue.len())
  }

  /// Requests cancellation.
  ///
  /// A live run is signalled and its driver records `Cancelled`; once `Accepted` is
  /// returned no other terminal state can be written. A stalled run is cancelled
  /// directly. `AlreadyTerminal` means the run finished first.
  #[instrument(name = "Orchestrator::cancel", skip_all, fields(run_id = %run_id), err(Display))]
  pub async fn cancel(&self, run_id: &RunId) -> ConveyorResult<CancelReceipt> {
    loop {
      let claim = self.inner.state.lock().claim(run_id);
      let (control, claimed) = match claim {
        Ok(control) => (control, true),
        Err(control) => (control, false),
      };

      let _commit = control.lock_commits().await;
      if !claimed && !self.inner.state.lock().holds(run_id, &control) {
        // Its driver exited while we waited; look again.
        continue;
      }

      let receipt = match self.run_status(run_id).await {
        Ok(run) if run.is_terminal() => Ok(CancelReceipt::AlreadyTerminal),
        Ok(_) if !claimed => {
          control.cancel();
          event!(Level::INFO, "Cancellation signalled to live run.");
          Ok(CancelReceipt::Accepted)
        }
        Ok(run) => self.cancel_stalled(run).await,
        Err(e) => Err(e),
      };
      if claimed {
        self.inner.state.lock().live.remove(run_id);
      }
      return receipt;
    }
  }

  /// Caller holds the claim on a run that has no driver.
  async fn cancel_stalled(&self, mut run: Run) -> ConveyorResult<CancelReceipt> {
    let definition = self.definition(&run.definition)?;
    match machine::advance(&mut run, &definition, RunEvent::CancelRequested, Utc::now()) {
      Ok(_) => {}
      Err(ConveyorError::AlreadyTerminal { .. }) => return Ok(CancelReceipt::AlreadyTerminal),
      Err(e) => return Err(e),
    }
    self.inner.store.save_run(&run).await?;
    event!(Level::INFO, "Stalled run cancelled.");
    self.inner.state.lock().cancel_requested.remove(&run.run_id);
    self.inner.notifier.notify(RunNotice::from_run(&run));
    self
      .start_next_queued(run_key(&run.definition.name, &run.trigger.branch), run.run_id.clone())
      .await;
    Ok(CancelReceipt::Accepted)
  }

  /// Restarts the driver of a persisted, non-terminal run that has none.
  ///
  /// Completed stages are not re-executed. A run that is already being driven, resumed
  /// or cancelled is left alone and its current snapshot returned. Recovery does not
  /// count against `max_concurrent_runs` so a restart never strands durable runs.
  #[instrument(name = "Orchestrator::resume", skip_all, fields(run_id = %run_id), err(Display))]
  pub async fn resume(&self, run_id: &RunId) -> ConveyorResult<Run> {
    let claim = self.inner.state.lock().claim(run_id);
    let Ok(control) = claim else {
      event!(Level::DEBUG, "Run is already held; not resuming.");
      return self.run_status(run_id).await;
    };
    let resumed = self.resume_claimed(run_id, control.clone()).await;
    match &resumed {
      Ok(run) if !run.is_terminal() => {}
      Ok(_) => self.release_claim(run_id, &control, true).await,
      Err(_) => self.release_claim(run_id, &control, false).await,
    }
    resumed
  }

  /// Loads the run only after claiming it, so the snapshot cannot be overtaken by
  /// another driver.
  async fn resume_claimed(&self, run_id: &RunId, control: Arc<RunControl>) -> ConveyorResult<Run> {
    let run = self.run_status(run_id).await?;
    if run.is_terminal() {
      return Ok(run);
    }
    let definition = self.definition(&run.definition)?;
    let key = run_key(&run.definition.name, &run.trigger.branch);
    {
      let mut state = self.inner.state.lock();
      match state.slots.get(&key) {
        Some(slot) if &slot.run_id != run_id => {
          return Err(ConveyorError::RunInProgress {
            pipeline: key.0.clone(),
            branch: key.1.clone(),
            active_run_id: slot.run_id.to_string(),
          });
        }
        Some(_) => {}
        None => {
          state.slots.insert(
            key,
            Slot {
              run_id: run_id.clone(),
              queue: VecDeque::new(),
            },
          );
        }
      }
    }
    event!(Level::INFO, status = %run.status, stage_index = run.current_stage_index, "Resuming run.");
    self.spawn_driver(run.clone(), definition, control);
    Ok(run)
  }

  /// Crash recovery: resumes every non-terminal run found in the store. Runs whose
  /// definition is not registered are skipped with a warning.
  pub async fn resume_incomplete(&self) -> ConveyorResult<Vec<RunId>> {
    let mut resumed = Vec::new();
    for run in self.inner.store.list_runs().await? {
      if run.is_terminal() {
        continue;
      }
      match self.resume(&run.run_id).await {
        Ok(_) => resumed.push(run.run_id),
        Err(e) => {
          event!(Level::WARN, run_id = %run.run_id, error = %e, "Could not resume run.");
        }
      }
    }
    event!(Level::INFO, count = resumed.len(), "Incomplete runs resumed.");
    Ok(resumed)
  }

  /// Waits until the run's driver exits, then returns the persisted run.
  ///
  /// Fails with `Internal` if the driver stopped without reaching a terminal state.
  pub async fn wait_for_terminal(&self, run_id: &RunId) -> ConveyorResult<Run> {
    loop {
      let done = self.inner.state.lock().live.get(run_id).map(|l| l.done.clone());
      match done {
        Some(Some(mut done)) => {
          // A dropped sender also means the driver is gone.
          let _ = done.wait_for(|finished| *finished).await;
          break;
        }
        // Claimed by a resume or cancellation that has not finished yet.
        Some(None) => tokio::time::sleep(CLAIM_POLL_INTERVAL).await,
        None => break,
      }
    }
    let run = self.run_status(run_id).await?;
    if run.is_terminal() {
      Ok(run)
    } else {
      Err(ConveyorError::Internal(format!(
        "run {} has no driver and stopped in state {}",
        run_id, run.status
      )))
    }
  }
}
