// demos/deploy_server/src/state.rs
use crate::config::AppConfig;
use conveyor::Orchestrator;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
  pub orchestrator: Orchestrator,
  pub config: Arc<AppConfig>,
}
