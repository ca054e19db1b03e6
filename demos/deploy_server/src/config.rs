// demos/deploy_server/src/config.rs

use crate::errors::{AppError, Result};
use conveyor::{OrchestratorConfig, SourceRepository};
use dotenvy::dotenv;
use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct AppConfig {
  pub server_host: String,
  pub server_port: u16,
  /// Holds `state/` (run and approval records), `artifacts/` and `work/`.
  pub data_dir: PathBuf,
  /// JSON pipeline definitions to register at startup.
  pub definition_files: Vec<PathBuf>,
  /// When set, the canonical Source → Build → Approve → Deploy pipeline is registered
  /// for this repository under `standard_prefix`.
  pub standard_source: Option<SourceRepository>,
  pub standard_prefix: String,
  pub orchestrator: OrchestratorConfig,
}

impl AppConfig {
  pub fn from_env() -> Result<Self> {
    dotenv().ok(); // Load .env file if present

    let get_env = |var_name: &str| env::var(var_name).ok().filter(|v| !v.trim().is_empty());

    let server_host = get_env("SERVER_HOST").unwrap_or_else(|| "127.0.0.1".to_string());
    let server_port = get_env("SERVER_PORT")
      .unwrap_or_else(|| "8080".to_string())
      .parse::<u16>()
      .map_err(|e| AppError::Config(format!("Invalid SERVER_PORT: {}", e)))?;
    let data_dir = PathBuf::from(get_env("CONVEYOR_DATA_DIR").unwrap_or_else(|| "./conveyor-data".to_string()));

    let definition_files = get_env("CONVEYOR_DEFINITIONS")
      .map(|list| list.split(',').map(|p| PathBuf::from(p.trim())).collect())
      .unwrap_or_default();

    let standard_source = match (get_env("SOURCE_OWNER"), get_env("SOURCE_REPO")) {
      (Some(owner), Some(repo)) => Some(SourceRepository {
        owner,
        repo,
        branch: get_env("SOURCE_BRANCH").unwrap_or_else(|| "main".to_string()),
      }),
      (None, None) => None,
      _ => {
        return Err(AppError::Config(
          "SOURCE_OWNER and SOURCE_REPO must be set together".to_string(),
        ))
      }
    };
    let standard_prefix = get_env("PIPELINE_PREFIX").unwrap_or_else(|| "app".to_string());

    let orchestrator = OrchestratorConfig::from_env()?;

    tracing::info!("Application configuration loaded successfully.");

    Ok(Self {
      server_host,
      server_port,
      data_dir,
      definition_files,
      standard_source,
      standard_prefix,
      orchestrator,
    })
  }
}
