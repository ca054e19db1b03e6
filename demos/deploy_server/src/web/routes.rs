// demos/deploy_server/src/web/routes.rs

use crate::web::handlers;
use actix_web::web;

pub fn configure_app_routes(cfg: &mut web::ServiceConfig) {
  cfg
    .route("/health", web::get().to(handlers::health_check_handler))
    .route("/triggers", web::post().to(handlers::trigger_handler))
    .service(
      web::scope("/runs")
        .route("", web::get().to(handlers::list_runs_handler))
        .route("/{run_id}", web::get().to(handlers::run_status_handler))
        .route("/{run_id}/approvals", web::post().to(handlers::approval_handler))
        .route("/{run_id}/cancel", web::post().to(handlers::cancel_handler)),
    );
}
