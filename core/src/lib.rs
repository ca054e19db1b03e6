// conveyor/src/lib.rs

//! Conveyor: an async orchestration core for deployment pipelines.
//!
//! Conveyor drives pipeline runs (Source → Build → Approve → Deploy and the like)
//! stage by stage:
//!  - Ordered stages, each a list of commands run by a pluggable `StageExecutor`.
//!  - Manual approval gates with durable requests and a timeout.
//!  - Per-stage retry policies with backoff, plus per-attempt timeouts.
//!  - Cooperative cancellation at every suspension point.
//!  - Every transition persisted before the next external call, so runs resume after a crash.
//!  - At most one live run per (pipeline, branch), with reject or queue semantics for duplicates.

pub mod approval;
pub mod artifact;
pub mod config;
pub mod error;
pub mod executor;
pub mod notify;
pub mod orchestrator;
pub mod pipeline;
pub mod run;
pub mod store;

// --- Re-exports for the Public API ---

pub use crate::approval::{ApprovalGate, ApprovalRequest, ApprovalResolution, ApprovalVerdict, Decision};
pub use crate::artifact::{ArtifactRef, ArtifactStore, FsArtifactStore, InMemoryArtifactStore};
pub use crate::config::{DuplicateTriggerPolicy, OrchestratorConfig};
pub use crate::error::{ConveyorError, ConveyorResult};
pub use crate::executor::{ExecutionContext, FailureReason, ShellStageExecutor, StageExecutor, StageOutcome};
pub use crate::notify::{ChannelNotificationSink, NotificationSink, RunNotice, TracingNotificationSink};
pub use crate::orchestrator::{CancelReceipt, Orchestrator, TriggerReceipt};
pub use crate::pipeline::{
  Backoff, DefinitionRef, EventType, PipelineDefinition, RetryPolicy, SourceRepository, StageSpec, Trigger,
  TriggerFilter, TriggerRef,
};
pub use crate::run::{Effect, OutcomeKind, Run, RunControl, RunDriver, RunEvent, RunId, RunStatus, StageResult};
pub use crate::store::{FileRunStore, InMemoryRunStore, RunStore};
