// conveyor/src/approval.rs

//! Approval gates: durable approval requests and the subscriptions that wait on them.
//!
//! A request is persisted before anyone waits on it, and its deadline is derived from
//! the persisted `requested_at`, so a restarted process picks up both pending and
//! already-decided requests where they were.

use crate::error::{ConveyorError, ConveyorResult};
use crate::run::model::RunId;
use crate::store::RunStore;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{event, instrument, Level};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
  Pending,
  Approved,
  Rejected,
}

/// What an external approver can say.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalVerdict {
  Approve,
  Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
  Rejected,
  TimedOut,
}

/// How a gate was resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalResolution {
  Approved { by: String },
  Rejected { by: String },
  TimedOut,
}

/// Actor recorded when a gate expires.
pub const TIMEOUT_ACTOR: &str = "conveyor:timeout";

/// One per gated stage per run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRequest {
  pub run_id: RunId,
  pub stage_name: String,
  pub requested_at: DateTime<Utc>,
  pub decision: Decision,
  #[serde(default)]
  pub decided_at: Option<DateTime<Utc>>,
  #[serde(default)]
  pub decided_by: Option<String>,
  #[serde(default)]
  pub rejection: Option<RejectionReason>,
}

impl ApprovalRequest {
  pub fn new<S: Into<String>>(run_id: RunId, stage_name: S, requested_at: DateTime<Utc>) -> Self {
    Self {
      run_id,
      stage_name: stage_name.into(),
      requested_at,
      decision: Decision::Pending,
      decided_at: None,
      decided_by: None,
      rejection: None,
    }
  }

  pub fn is_decided(&self) -> bool {
    self.decision != Decision::Pending
  }

  pub fn resolution(&self) -> Option<ApprovalResolution> {
    let by = self.decided_by.clone().unwrap_or_default();
    match (self.decision, self.rejection) {
      (Decision::Pending, _) => None,
      (Decision::Approved, _) => Some(ApprovalResolution::Approved { by }),
      (Decision::Rejected, Some(RejectionReason::TimedOut)) => Some(ApprovalResolution::TimedOut),
      (Decision::Rejected, _) => Some(ApprovalResolution::Rejected { by }),
    }
  }

  fn record(&mut self, resolution: &ApprovalResolution, now: DateTime<Utc>) {
    self.decided_at = Some(now);
    match resolution {
      ApprovalResolution::Approved { by } => {
        self.decision = Decision::Approved;
        self.decided_by = Some(by.clone());
      }
      ApprovalResolution::Rejected { by } => {
        self.decision = Decision::Rejected;
        self.rejection = Some(RejectionReason::Rejected);
        self.decided_by = Some(by.clone());
      }
      ApprovalResolution::TimedOut => {
        self.decision = Decision::Rejected;
        self.rejection = Some(RejectionReason::TimedOut);
        self.decided_by = Some(TIMEOUT_ACTOR.to_string());
      }
    }
  }
}

type GateKey = (RunId, String);

/// Handle returned by `ApprovalGate::request`; pass it to `ApprovalGate::wait`.
pub struct ApprovalSubscription {
  key: GateKey,
  deadline: DateTime<Utc>,
  rx: watch::Receiver<Option<ApprovalResolution>>,
}

impl ApprovalSubscription {
  pub fn deadline(&self) -> DateTime<Utc> {
    self.deadline
  }
}

pub struct ApprovalGate {
  store: Arc<dyn RunStore>,
  timeout: Duration,
  waiters: Mutex<HashMap<GateKey, watch::Sender<Option<ApprovalResolution>>>>,
  // Serializes every check-then-write on approval records, so each request resolves once.
  decisions: tokio::sync::Mutex<()>,
}

impl ApprovalGate {
  pub fn new(store: Arc<dyn RunStore>, timeout: Duration) -> Self {
    Self {
      store,
      timeout,
      waiters: Mutex::new(HashMap::new()),
      decisions: tokio::sync::Mutex::new(()),
    }
  }

  pub fn timeout(&self) -> Duration {
    self.timeout
  }

  /// Persists `request` unless a record already exists, and returns the durable record.
  pub async fn open(&self, request: ApprovalRequest) -> ConveyorResult<ApprovalRequest> {
    let _guard = self.decisions.lock().await;
    self.open_locked(request).await
  }

  async fn open_locked(&self, request: ApprovalRequest) -> ConveyorResult<ApprovalRequest> {
    match self.store.load_approval(&request.run_id, &request.stage_name).await? {
      Some(existing) => {
        event!(Level::DEBUG, decision = ?existing.decision, "Reusing persisted approval request.");
        Ok(existing)
      }
      None => {
        self.store.save_approval(&request).await?;
        event!(Level::INFO, run_id = %request.run_id, stage = %request.stage_name, "Approval requested.");
        Ok(request)
      }
    }
  }

  /// Opens `request` and subscribes to its resolution.
  #[instrument(name = "ApprovalGate::request", skip_all, fields(run_id = %request.run_id, stage = %request.stage_name), err(Display))]
  pub async fn request(&self, request: ApprovalRequest) -> ConveyorResult<ApprovalSubscription> {
    let _guard = self.decisions.lock().await;
    let record = self.open_locked(request).await?;

    let key = (record.run_id.clone(), record.stage_name.clone());
    let (tx, rx) = watch::channel(record.resolution());
    self.waiters.lock().insert(key.clone(), tx);

    let timeout = chrono::Duration::from_std(self.timeout).unwrap_or(chrono::Duration::MAX);
    let deadline = record
      .requested_at
      .checked_add_signed(timeout)
      .unwrap_or(DateTime::<Utc>::MAX_UTC);

    Ok(ApprovalSubscription { key, deadline, rx })
  }

  /// Waits until the request is decided or its deadline passes.
  pub async fn wait(&self, mut subscription: ApprovalSubscription) -> ConveyorResult<ApprovalResolution> {
    loop {
      let current = subscription.rx.borrow_and_update().clone();
      if let Some(resolution) = current {
        self.withdraw(&subscription.key.0, &subscription.key.1);
        return Ok(resolution);
      }

      let remaining = (subscription.deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
      tokio::select! {
        changed = subscription.rx.changed() => {
          if changed.is_err() {
            // Sender replaced or withdrawn; fall back to the durable record.
            return self.resolution_from_store(&subscription.key).await;
          }
        }
        _ = tokio::time::sleep(remaining) => {
          let (run_id, stage_name) = &subscription.key;
          match self.resolve(run_id, stage_name, ApprovalResolution::TimedOut).await {
            Ok(_) => {
              event!(Level::WARN, run_id = %run_id, stage = %stage_name, "Approval timed out.");
              self.withdraw(run_id, stage_name);
              return Ok(ApprovalResolution::TimedOut);
            }
            Err(ConveyorError::AlreadyDecided { .. }) => {
              return self.resolution_from_store(&subscription.key).await;
            }
            Err(e) => return Err(e),
          }
        }
      }
    }
  }

  /// Records an external verdict. Exactly one decision wins; later ones get `AlreadyDecided`.
  pub async fn decide(
    &self,
    run_id: &RunId,
    stage_name: &str,
    verdict: ApprovalVerdict,
    actor: &str,
  ) -> ConveyorResult<ApprovalRequest> {
    let resolution = match verdict {
      ApprovalVerdict::Approve => ApprovalResolution::Approved { by: actor.to_string() },
      ApprovalVerdict::Reject => ApprovalResolution::Rejected { by: actor.to_string() },
    };
    self.resolve(run_id, stage_name, resolution).await
  }

  /// Drops the in-process waiter for a request. The durable record is kept.
  pub fn withdraw(&self, run_id: &RunId, stage_name: &str) {
    self.waiters.lock().remove(&(run_id.clone(), stage_name.to_string()));
  }

  async fn resolve(
    &self,
    run_id: &RunId,
    stage_name: &str,
    resolution: ApprovalResolution,
  ) -> ConveyorResult<ApprovalRequest> {
    let _guard = self.decisions.lock().await;
    let mut record = self
      .store
      .load_approval(run_id, stage_name)
      .await?
      .ok_or_else(|| ConveyorError::NotAwaitingApproval {
        run_id: run_id.to_string(),
        stage_name: stage_name.to_string(),
      })?;

    if record.is_decided() {
      return Err(ConveyorError::AlreadyDecided {
        run_id: run_id.to_string(),
        stage_name: stage_name.to_string(),
      });
    }

    record.record(&resolution, Utc::now());
    self.store.save_approval(&record).await?;
    event!(Level::INFO, run_id = %run_id, stage = %stage_name, decision = ?record.decision, by = ?record.decided_by, "Approval decided.");

    if let Some(tx) = self.waiters.lock().get(&(run_id.clone(), stage_name.to_string())) {
      let _ = tx.send(Some(resolution));
    }
    Ok(record)
  }

  async fn resolution_from_store(&self, key: &GateKey) -> ConveyorResult<ApprovalResolution> {
    let record = self.store.load_approval(&key.0, &key.1).await?;
    record
      .and_then(|r| r.resolution())
      .ok_or_else(|| ConveyorError::Internal(format!("approval for {}/{} vanished while waiting", key.0, key.1)))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::InMemoryRunStore;

  fn gate(timeout: Duration) -> (Arc<InMemoryRunStore>, ApprovalGate) {
    let store = Arc::new(InMemoryRunStore::new());
    let gate = ApprovalGate::new(store.clone(), timeout);
    (store, gate)
  }

  #[tokio::test]
  async fn decision_wakes_the_waiter_once() {
    let (_store, gate) = gate(Duration::from_secs(60));
    let gate = Arc::new(gate);
    let run_id = RunId::from("r-1");

    let sub = gate
      .request(ApprovalRequest::new(run_id.clone(), "Approve", Utc::now()))
      .await
      .unwrap();

    let waiter = {
      let gate = gate.clone();
      tokio::spawn(async move { gate.wait(sub).await })
    };

    gate
      .decide(&run_id, "Approve", ApprovalVerdict::Approve, "alice")
      .await
      .unwrap();
    let resolution = waiter.await.unwrap().unwrap();
    assert_eq!(resolution, ApprovalResolution::Approved { by: "alice".into() });

    let again = gate.decide(&run_id, "Approve", ApprovalVerdict::Reject, "bob").await;
    assert!(matches!(again, Err(ConveyorError::AlreadyDecided { .. })));
  }

  #[tokio::test]
  async fn timeout_rejects_and_blocks_late_decisions() {
    let (store, gate) = gate(Duration::from_millis(20));
    let run_id = RunId::from("r-2");
    let sub = gate
      .request(ApprovalRequest::new(run_id.clone(), "Approve", Utc::now()))
      .await
      .unwrap();

    assert_eq!(gate.wait(sub).await.unwrap(), ApprovalResolution::TimedOut);

    let record = store.load_approval(&run_id, "Approve").await.unwrap().unwrap();
    assert_eq!(record.decision, Decision::Rejected);
    assert_eq!(record.rejection, Some(RejectionReason::TimedOut));

    let late = gate.decide(&run_id, "Approve", ApprovalVerdict::Approve, "alice").await;
    assert!(matches!(late, Err(ConveyorError::AlreadyDecided { .. })));
  }

  #[tokio::test]
  async fn decided_record_resolves_immediately_on_rerequest() {
    let (_store, gate) = gate(Duration::from_secs(60));
    let run_id = RunId::from("r-3");
    gate
      .request(ApprovalRequest::new(run_id.clone(), "Approve", Utc::now()))
      .await
      .unwrap();
    gate
      .decide(&run_id, "Approve", ApprovalVerdict::Reject, "carol")
      .await
      .unwrap();

    let sub = gate
      .request(ApprovalRequest::new(run_id.clone(), "Approve", Utc::now()))
      .await
      .unwrap();
    assert_eq!(
      gate.wait(sub).await.unwrap(),
      ApprovalResolution::Rejected { by: "carol".into() }
    );
  }

  #[tokio::test]
  async fn deadline_counts_from_the_persisted_request_time() {
    let (_store, gate) = gate(Duration::from_secs(60));
    let run_id = RunId::from("r-4");
    let long_ago = Utc::now() - chrono::Duration::seconds(120);
    gate
      .request(ApprovalRequest::new(run_id.clone(), "Approve", long_ago))
      .await
      .unwrap();

    // A restart re-requests with a fresh timestamp; the original one wins.
    let sub = gate
      .request(ApprovalRequest::new(run_id.clone(), "Approve", Utc::now()))
      .await
      .unwrap();
    assert!(sub.deadline() < Utc::now());
    assert_eq!(gate.wait(sub).await.unwrap(), ApprovalResolution::TimedOut);
  }

  #[tokio::test]
  async fn deciding_an_unknown_request_is_not_awaiting_approval() {
    let (_store, gate) = gate(Duration::from_secs(60));
    let result = gate
      .decide(&RunId::from("nope"), "Approve", ApprovalVerdict::Approve, "alice")
      .await;
    assert!(matches!(result, Err(ConveyorError::NotAwaitingApproval { .. })));
  }
}
