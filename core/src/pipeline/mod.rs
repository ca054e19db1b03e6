// conveyor/src/pipeline/mod.rs

//! Static pipeline definitions: stages, retry policies, trigger filters.

pub mod definition;
pub mod stage;
pub mod standard;
pub mod trigger;

pub use definition::{DefinitionRef, PipelineDefinition};
pub use stage::{Backoff, RetryPolicy, StageSpec, MAX_RETRY_ATTEMPTS};
pub use standard::SourceRepository;
pub use trigger::{EventType, Trigger, TriggerFilter, TriggerRef};
