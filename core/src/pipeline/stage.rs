// conveyor/src/pipeline/stage.rs

//! Defines a single stage of a pipeline and the retry policy that governs it.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Upper bound on `RetryPolicy::max_attempts`. Definitions above it fail to load.
pub const MAX_RETRY_ATTEMPTS: u32 = 10;

/// Delay inserted between a failed attempt and the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
  None,
  Fixed { delay_ms: u64 },
  Exponential { initial_ms: u64, max_ms: u64 },
}

impl Backoff {
  /// Delay to wait after attempt number `failed_attempt` (1-based) failed.
  pub fn delay_after(&self, failed_attempt: u32) -> Duration {
    match *self {
      Backoff::None => Duration::ZERO,
      Backoff::Fixed { delay_ms } => Duration::from_millis(delay_ms),
      Backoff::Exponential { initial_ms, max_ms } => {
        let shift = failed_attempt.saturating_sub(1).min(31);
        let delay = initial_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(delay.min(max_ms))
      }
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
  pub max_attempts: u32,
  pub backoff: Backoff,
}

impl RetryPolicy {
  pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
    Self { max_attempts, backoff }
  }

  /// A policy that never retries.
  pub fn once() -> Self {
    Self::new(1, Backoff::None)
  }

  pub fn allows_attempt(&self, attempt: u32) -> bool {
    attempt <= self.max_attempts
  }
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self::once()
  }
}

/// Definition of one pipeline stage.
///
/// A stage with commands is *executable*. A stage with `requires_approval` is a *gate*;
/// a gate with no commands only records the approval and moves on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSpec {
  pub name: String,
  #[serde(default)]
  pub commands: Vec<String>,
  /// Name of an earlier stage whose artifact this stage consumes.
  #[serde(default)]
  pub input_artifact: Option<String>,
  #[serde(default)]
  pub produces_artifact: bool,
  #[serde(default)]
  pub requires_approval: bool,
  /// `None` means "use the orchestrator's default", resolved at registration.
  #[serde(default)]
  pub retry_policy: Option<RetryPolicy>,
  /// Wall-clock bound for a single attempt.
  #[serde(default)]
  pub timeout_secs: Option<u64>,
}

impl StageSpec {
  pub fn new<S: Into<String>>(name: S) -> Self {
    Self {
      name: name.into(),
      commands: Vec::new(),
      input_artifact: None,
      produces_artifact: false,
      requires_approval: false,
      retry_policy: None,
      timeout_secs: None,
    }
  }

  /// A gate stage without commands.
  pub fn approval<S: Into<String>>(name: S) -> Self {
    Self::new(name).requires_approval()
  }

  pub fn command<S: Into<String>>(mut self, command: S) -> Self {
    self.commands.push(command.into());
    self
  }

  pub fn commands<I, S>(mut self, commands: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.commands.extend(commands.into_iter().map(Into::into));
    self
  }

  pub fn consumes<S: Into<String>>(mut self, stage_name: S) -> Self {
    self.input_artifact = Some(stage_name.into());
    self
  }

  pub fn produces_artifact(mut self) -> Self {
    self.produces_artifact = true;
    self
  }

  pub fn requires_approval(mut self) -> Self {
    self.requires_approval = true;
    self
  }

  pub fn retry(mut self, policy: RetryPolicy) -> Self {
    self.retry_policy = Some(policy);
    self
  }

  pub fn timeout_secs(mut self, secs: u64) -> Self {
    self.timeout_secs = Some(secs);
    self
  }

  pub fn is_executable(&self) -> bool {
    !self.commands.is_empty()
  }

  pub fn is_pure_gate(&self) -> bool {
    self.requires_approval && !self.is_executable()
  }

  /// The policy in force for this stage. Unresolved stages fall back to a single attempt.
  pub fn effective_retry(&self) -> RetryPolicy {
    self.retry_policy.unwrap_or_default()
  }

  pub fn timeout(&self) -> Option<Duration> {
    self.timeout_secs.map(Duration::from_secs)
  }
}
