// demos/deploy_server/src/main.rs

mod config;
mod errors;
mod state;
mod web;

use crate::config::AppConfig;
use crate::errors::Result as AppResult;
use crate::state::AppState;

use actix_web::{web as actix_data, App, HttpServer};
use conveyor::{
  FileRunStore, FsArtifactStore, Orchestrator, PipelineDefinition, ShellStageExecutor, TracingNotificationSink,
};
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
  tracing_subscriber::fmt()
    .with_max_level(Level::INFO)
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env()) // Allow RUST_LOG override
    .with_span_events(FmtSpan::CLOSE)
    .init();

  tracing::info!("Starting deploy server...");

  let app_config = match AppConfig::from_env() {
    Ok(cfg) => Arc::new(cfg),
    Err(e) => {
      tracing::error!(error = %e, "Failed to load application configuration.");
      return Err(std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()));
    }
  };

  let orchestrator = match build_orchestrator(&app_config).await {
    Ok(orchestrator) => orchestrator,
    Err(e) => {
      tracing::error!(error = %e, "Failed to initialize the orchestrator.");
      return Err(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()));
    }
  };

  let app_state = AppState {
    orchestrator,
    config: app_config.clone(),
  };

  let server_address = format!("{}:{}", app_config.server_host, app_config.server_port);
  tracing::info!("Attempting to bind server to {}...", server_address);

  HttpServer::new(move || {
    App::new()
      .app_data(actix_data::Data::new(app_state.clone()))
      .wrap(tracing_actix_web::TracingLogger::default())
      .configure(web::routes::configure_app_routes)
  })
  .bind(&server_address)?
  .run()
  .await
}

/// Wires the local adapters, registers pipelines, and resumes runs a previous
/// process left unfinished.
async fn build_orchestrator(config: &AppConfig) -> AppResult<Orchestrator> {
  let store = Arc::new(FileRunStore::open(config.data_dir.join("state")).await?);
  let artifacts = Arc::new(FsArtifactStore::new(config.data_dir.join("artifacts")));
  let executor = Arc::new(ShellStageExecutor::new(artifacts, config.data_dir.join("work")));
  let orchestrator = Orchestrator::new(
    config.orchestrator.clone(),
    store,
    executor,
    Arc::new(TracingNotificationSink),
  )?;

  if let Some(source) = &config.standard_source {
    let reference = orchestrator.register_definition(PipelineDefinition::standard(&config.standard_prefix, source))?;
    tracing::info!(pipeline = %reference, repo = %source.clone_url(), "Standard pipeline registered.");
  }
  for path in &config.definition_files {
    orchestrator.register_definition(PipelineDefinition::load(path)?)?;
  }

  let resumed = orchestrator.resume_incomplete().await?;
  if !resumed.is_empty() {
    tracing::info!(count = resumed.len(), "Resumed unfinished runs from a previous process.");
  }
  Ok(orchestrator)
}
