// demos/deploy_server/src/errors.rs

use actix_web::{HttpResponse, ResponseError};
use conveyor::ConveyorError;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
  #[error("Validation Error: {0}")]
  Validation(String),

  #[error("Configuration Error: {0}")]
  Config(String),

  #[error("Orchestration Error: {source}")]
  Workflow {
    #[from]
    source: ConveyorError,
  },

  #[error("Internal Server Error: {0}")]
  Internal(String),
}

impl From<anyhow::Error> for AppError {
  fn from(err: anyhow::Error) -> Self {
    match err.downcast::<ConveyorError>() {
      Ok(source) => AppError::Workflow { source },
      Err(err) => AppError::Internal(err.to_string()),
    }
  }
}

impl ResponseError for AppError {
  fn error_response(&self) -> HttpResponse {
    tracing::error!(application_error = %self, "Responding with error");
    match self {
      AppError::Validation(m) => HttpResponse::BadRequest().json(json!({"error": m})),
      AppError::Config(m) => {
        HttpResponse::InternalServerError().json(json!({"error": "Configuration issue", "detail": m}))
      }
      AppError::Workflow { source } => {
        let body = json!({"error": kind_of(source), "detail": source.to_string()});
        match source {
          ConveyorError::RunNotFound { .. } | ConveyorError::PipelineNotFound { .. } => HttpResponse::NotFound().json(body),
          ConveyorError::InvalidDefinition { .. } => HttpResponse::BadRequest().json(body),
          ConveyorError::RunInProgress { .. }
          | ConveyorError::AlreadyDecided { .. }
          | ConveyorError::AlreadyTerminal { .. }
          | ConveyorError::NotAwaitingApproval { .. } => HttpResponse::Conflict().json(body),
          ConveyorError::CapacityExhausted { .. } => HttpResponse::ServiceUnavailable().json(body),
          _ => HttpResponse::InternalServerError().json(body),
        }
      }
      AppError::Internal(m) => {
        HttpResponse::InternalServerError().json(json!({"error": "An internal error occurred", "detail": m}))
      }
    }
  }
}

fn kind_of(err: &ConveyorError) -> &'static str {
  match err {
    ConveyorError::InvalidDefinition { .. } => "invalid_definition",
    ConveyorError::PipelineNotFound { .. } => "pipeline_not_found",
    ConveyorError::RunInProgress { .. } => "run_in_progress",
    ConveyorError::CapacityExhausted { .. } => "capacity_exhausted",
    ConveyorError::RunNotFound { .. } => "run_not_found",
    ConveyorError::AlreadyTerminal { .. } => "already_terminal",
    ConveyorError::AlreadyDecided { .. } => "already_decided",
    ConveyorError::NotAwaitingApproval { .. } => "not_awaiting_approval",
    ConveyorError::PersistenceFailure { .. } => "persistence_failure",
    _ => "orchestration_error",
  }
}

pub type Result<T, E = AppError> = std::result::Result<T, E>;
