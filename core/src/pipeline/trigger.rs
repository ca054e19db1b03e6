// conveyor/src/pipeline/trigger.rs

//! Trigger events and the per-definition filter deciding which of them start a run.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
  Push,
  PullRequest,
}

/// An external request for a new run (e.g. a source push).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
  pub pipeline: String,
  pub branch: String,
  pub commit: String,
  pub event: EventType,
}

impl Trigger {
  pub fn push<P: Into<String>, B: Into<String>, C: Into<String>>(pipeline: P, branch: B, commit: C) -> Self {
    Self {
      pipeline: pipeline.into(),
      branch: branch.into(),
      commit: commit.into(),
      event: EventType::Push,
    }
  }

  pub fn reference(&self) -> TriggerRef {
    TriggerRef {
      branch: self.branch.clone(),
      commit: self.commit.clone(),
      event: self.event,
    }
  }
}

/// What a run records about the trigger that started it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerRef {
  pub branch: String,
  pub commit: String,
  pub event: EventType,
}

/// Which triggers a definition reacts to. Empty lists match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerFilter {
  #[serde(default)]
  pub events: Vec<EventType>,
  /// Glob patterns, e.g. `main` or `release/*`.
  #[serde(default)]
  pub branches: Vec<String>,
}

impl TriggerFilter {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn on_event(mut self, event: EventType) -> Self {
    if !self.events.contains(&event) {
      self.events.push(event);
    }
    self
  }

  pub fn on_branch<S: Into<String>>(mut self, pattern: S) -> Self {
    self.branches.push(pattern.into());
    self
  }

  pub fn matches(&self, trigger: &Trigger) -> bool {
    let event_ok = self.events.is_empty() || self.events.contains(&trigger.event);
    let branch_ok = self.branches.is_empty()
      || self
        .branches
        .iter()
        .any(|pattern| glob_match::glob_match(pattern, &trigger.branch));
    event_ok && branch_ok
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn empty_filter_matches_everything() {
    let filter = TriggerFilter::new();
    assert!(filter.matches(&Trigger::push("p", "feature/x", "abc")));
  }

  #[test]
  fn filter_checks_event_and_branch() {
    let filter = TriggerFilter::new()
      .on_event(EventType::Push)
      .on_branch("master")
      .on_branch("release/*");

    assert!(filter.matches(&Trigger::push("p", "master", "abc")));
    assert!(filter.matches(&Trigger::push("p", "release/1.2", "abc")));
    assert!(!filter.matches(&Trigger::push("p", "feature/x", "abc")));

    let mut pr = Trigger::push("p", "master", "abc");
    pr.event = EventType::PullRequest;
    assert!(!filter.matches(&pr));
  }
}
