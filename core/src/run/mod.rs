// conveyor/src/run/mod.rs

pub mod driver;
pub mod machine;
pub mod model;

pub use driver::{RunControl, RunDriver};
pub use machine::{advance, resume, Effect, RunEvent};
pub use model::{
  AttemptRecord, Diagnostic, InFlightAttempt, OutcomeKind, Run, RunFailure, RunId, RunStatus, StageResult,
};
