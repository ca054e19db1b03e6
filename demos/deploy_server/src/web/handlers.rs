// demos/deploy_server/src/web/handlers.rs

use actix_web::{web, HttpResponse};
use conveyor::{ApprovalVerdict, EventType, Run, RunId, RunStatus, Trigger};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::instrument;

use crate::errors::{AppError, Result};
use crate::state::AppState;

pub async fn health_check_handler(app_state: web::Data<AppState>) -> HttpResponse {
  let orchestrator = &app_state.config.orchestrator;
  HttpResponse::Ok().json(json!({
    "status": "ok",
    "max_concurrent_runs": orchestrator.max_concurrent_runs,
    "duplicate_trigger_policy": orchestrator.duplicate_trigger_policy,
  }))
}

// --- Request DTOs ---

#[derive(Deserialize, Debug)]
pub struct TriggerPayload {
  pub pipeline: String,
  pub branch: String,
  pub commit: String,
  #[serde(default = "default_event")]
  pub event: EventType,
}

fn default_event() -> EventType {
  EventType::Push
}

#[derive(Deserialize, Debug)]
pub struct ApprovalPayload {
  pub stage_name: String,
  pub decision: ApprovalVerdict,
  pub actor: String,
}

#[derive(Deserialize, Debug)]
pub struct ListQuery {
  pub status: Option<RunStatus>,
}

/// Condensed view for listings; `GET /runs/{id}` returns the full record.
#[derive(Serialize, Debug)]
pub struct RunSummary<'a> {
  pub run_id: &'a RunId,
  pub pipeline: String,
  pub branch: &'a str,
  pub commit: &'a str,
  pub status: RunStatus,
  pub current_stage_index: usize,
  pub stages_completed: usize,
}

impl<'a> From<&'a Run> for RunSummary<'a> {
  fn from(run: &'a Run) -> Self {
    Self {
      run_id: &run.run_id,
      pipeline: run.definition.to_string(),
      branch: &run.trigger.branch,
      commit: &run.trigger.commit,
      status: run.status,
      current_stage_index: run.current_stage_index,
      stages_completed: run.stage_history.len(),
    }
  }
}

// --- Handler Implementations ---

#[instrument(name = "handler::trigger", skip(app_state, payload), fields(pipeline = %payload.pipeline, branch = %payload.branch))]
pub async fn trigger_handler(
  app_state: web::Data<AppState>,
  payload: web::Json<TriggerPayload>,
) -> Result<HttpResponse> {
  let payload = payload.into_inner();
  if payload.commit.trim().is_empty() {
    return Err(AppError::Validation("commit must not be empty".to_string()));
  }
  let receipt = app_state
    .orchestrator
    .trigger(Trigger {
      pipeline: payload.pipeline,
      branch: payload.branch,
      commit: payload.commit,
      event: payload.event,
    })
    .await?;

  Ok(if receipt.run_id.is_some() {
    HttpResponse::Created().json(receipt)
  } else {
    HttpResponse::Accepted().json(receipt)
  })
}

#[instrument(name = "handler::approval", skip_all, fields(run_id = %path, stage = %payload.stage_name))]
pub async fn approval_handler(
  app_state: web::Data<AppState>,
  path: web::Path<String>,
  payload: web::Json<ApprovalPayload>,
) -> Result<HttpResponse> {
  let run_id = RunId::from(path.into_inner());
  let record = app_state
    .orchestrator
    .decide_approval(&run_id, &payload.stage_name, payload.decision, &payload.actor)
    .await?;
  Ok(HttpResponse::Ok().json(record))
}

#[instrument(name = "handler::run_status", skip_all, fields(run_id = %path))]
pub async fn run_status_handler(app_state: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse> {
  let run = app_state.orchestrator.run_status(&RunId::from(path.into_inner())).await?;
  Ok(HttpResponse::Ok().json(run))
}

pub async fn list_runs_handler(app_state: web::Data<AppState>, query: web::Query<ListQuery>) -> Result<HttpResponse> {
  let runs = app_state.orchestrator.list_runs().await?;
  let summaries: Vec<RunSummary<'_>> = runs
    .iter()
    .filter(|r| query.status.map_or(true, |s| r.status == s))
    .map(RunSummary::from)
    .collect();
  Ok(HttpResponse::Ok().json(summaries))
}

#[instrument(name = "handler::cancel", skip_all, fields(run_id = %path))]
pub async fn cancel_handler(app_state: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse> {
  let receipt = app_state.orchestrator.cancel(&RunId::from(path.into_inner())).await?;
  Ok(HttpResponse::Accepted().json(json!({ "result": receipt })))
}
