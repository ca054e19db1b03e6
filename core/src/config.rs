// conveyor/src/config.rs

use crate::error::{ConveyorError, ConveyorResult};
use crate::pipeline::{Backoff, RetryPolicy, MAX_RETRY_ATTEMPTS};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use tracing::{event, Level};

/// What to do with a trigger for a (pipeline, branch) that already has a live run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateTriggerPolicy {
  /// Answer `RunInProgress`.
  #[default]
  Reject,
  /// Hold the trigger and start it once the live run terminates.
  Queue,
}

impl FromStr for DuplicateTriggerPolicy {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_ascii_lowercase().as_str() {
      "reject" => Ok(DuplicateTriggerPolicy::Reject),
      "queue" => Ok(DuplicateTriggerPolicy::Queue),
      other => Err(format!("expected 'reject' or 'queue', got '{}'", other)),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
  /// Upper bound on non-terminal runs across all pipelines.
  pub max_concurrent_runs: usize,
  /// Applied to stages whose definition carries no retry policy.
  pub default_retry_policy: RetryPolicy,
  pub approval_timeout: Duration,
  pub duplicate_trigger_policy: DuplicateTriggerPolicy,
}

impl Default for OrchestratorConfig {
  fn default() -> Self {
    Self {
      max_concurrent_runs: 16,
      default_retry_policy: RetryPolicy::once(),
      approval_timeout: Duration::from_secs(7 * 24 * 60 * 60),
      duplicate_trigger_policy: DuplicateTriggerPolicy::Reject,
    }
  }
}

impl OrchestratorConfig {
  /// Reads `CONVEYOR_*` variables from the process environment, falling back to defaults:
  ///
  /// - `CONVEYOR_MAX_CONCURRENT_RUNS`
  /// - `CONVEYOR_DEFAULT_MAX_ATTEMPTS`
  /// - `CONVEYOR_DEFAULT_BACKOFF_MS` (fixed backoff; `0` disables it)
  /// - `CONVEYOR_APPROVAL_TIMEOUT_SECS`
  /// - `CONVEYOR_DUPLICATE_TRIGGER_POLICY` (`reject` | `queue`)
  pub fn from_env() -> ConveyorResult<Self> {
    Self::from_lookup(|key| std::env::var(key).ok())
  }

  pub fn from_lookup<F>(lookup: F) -> ConveyorResult<Self>
  where
    F: Fn(&str) -> Option<String>,
  {
    let defaults = Self::default();

    let max_concurrent_runs = parse_var(&lookup, "CONVEYOR_MAX_CONCURRENT_RUNS")?.unwrap_or(defaults.max_concurrent_runs);
    let max_attempts =
      parse_var(&lookup, "CONVEYOR_DEFAULT_MAX_ATTEMPTS")?.unwrap_or(defaults.default_retry_policy.max_attempts);
    let backoff = match parse_var::<u64, _>(&lookup, "CONVEYOR_DEFAULT_BACKOFF_MS")? {
      Some(0) => Backoff::None,
      Some(delay_ms) => Backoff::Fixed { delay_ms },
      None => defaults.default_retry_policy.backoff,
    };
    let approval_timeout = parse_var(&lookup, "CONVEYOR_APPROVAL_TIMEOUT_SECS")?
      .map(Duration::from_secs)
      .unwrap_or(defaults.approval_timeout);
    let duplicate_trigger_policy =
      parse_var(&lookup, "CONVEYOR_DUPLICATE_TRIGGER_POLICY")?.unwrap_or(defaults.duplicate_trigger_policy);

    let config = Self {
      max_concurrent_runs,
      default_retry_policy: RetryPolicy::new(max_attempts, backoff),
      approval_timeout,
      duplicate_trigger_policy,
    };
    config.validate()?;
    event!(Level::DEBUG, ?config, "Orchestrator configuration loaded.");
    Ok(config)
  }

  pub fn validate(&self) -> ConveyorResult<()> {
    if self.max_concurrent_runs == 0 {
      return Err(ConveyorError::Configuration {
        key: "max_concurrent_runs".to_string(),
        message: "must be at least 1".to_string(),
      });
    }
    let attempts = self.default_retry_policy.max_attempts;
    if attempts == 0 || attempts > MAX_RETRY_ATTEMPTS {
      return Err(ConveyorError::Configuration {
        key: "default_retry_policy.max_attempts".to_string(),
        message: format!("must lie in 1..={}, got {}", MAX_RETRY_ATTEMPTS, attempts),
      });
    }
    if self.approval_timeout.is_zero() {
      return Err(ConveyorError::Configuration {
        key: "approval_timeout".to_string(),
        message: "must be positive".to_string(),
      });
    }
    Ok(())
  }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> ConveyorResult<Option<T>>
where
  T: FromStr,
  T::Err: std::fmt::Display,
  F: Fn(&str) -> Option<String>,
{
  match lookup(key) {
    None => Ok(None),
    Some(raw) if raw.trim().is_empty() => Ok(None),
    Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|e| ConveyorError::Configuration {
      key: key.to_string(),
      message: format!("invalid value '{}': {}", raw, e),
    }),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashMap;

  fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    move |key| map.get(key).cloned()
  }

  #[test]
  fn empty_environment_yields_defaults() {
    let config = OrchestratorConfig::from_lookup(lookup(&[])).unwrap();
    assert_eq!(config, OrchestratorConfig::default());
    assert_eq!(config.duplicate_trigger_policy, DuplicateTriggerPolicy::Reject);
  }

  #[test]
  fn variables_override_defaults() {
    let config = OrchestratorConfig::from_lookup(lookup(&[
      ("CONVEYOR_MAX_CONCURRENT_RUNS", "4"),
      ("CONVEYOR_DEFAULT_MAX_ATTEMPTS", "3"),
      ("CONVEYOR_DEFAULT_BACKOFF_MS", "250"),
      ("CONVEYOR_APPROVAL_TIMEOUT_SECS", "3600"),
      ("CONVEYOR_DUPLICATE_TRIGGER_POLICY", "Queue"),
    ]))
    .unwrap();
    assert_eq!(config.max_concurrent_runs, 4);
    assert_eq!(
      config.default_retry_policy,
      RetryPolicy::new(3, Backoff::Fixed { delay_ms: 250 })
    );
    assert_eq!(config.approval_timeout, Duration::from_secs(3600));
    assert_eq!(config.duplicate_trigger_policy, DuplicateTriggerPolicy::Queue);
  }

  #[test]
  fn malformed_values_name_the_variable() {
    let err = OrchestratorConfig::from_lookup(lookup(&[("CONVEYOR_MAX_CONCURRENT_RUNS", "many")])).unwrap_err();
    assert!(matches!(err, ConveyorError::Configuration { ref key, .. } if key == "CONVEYOR_MAX_CONCURRENT_RUNS"));

    let err = OrchestratorConfig::from_lookup(lookup(&[("CONVEYOR_DUPLICATE_TRIGGER_POLICY", "drop")])).unwrap_err();
    assert!(matches!(err, ConveyorError::Configuration { .. }));
  }

  #[test]
  fn out_of_range_values_fail_validation() {
    assert!(OrchestratorConfig::from_lookup(lookup(&[("CONVEYOR_DEFAULT_MAX_ATTEMPTS", "11")])).is_err());
    assert!(OrchestratorConfig::from_lookup(lookup(&[("CONVEYOR_MAX_CONCURRENT_RUNS", "0")])).is_err());
    assert!(OrchestratorConfig::from_lookup(lookup(&[("CONVEYOR_APPROVAL_TIMEOUT_SECS", "0")])).is_err());
  }
}
