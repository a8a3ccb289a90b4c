//! Axum router configuration with middleware.
//!
//! All routes are under `/api/v1/`. Middleware: CORS and request tracing.

use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::http::handlers;
use crate::state::AppState;

/// Build the complete API router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        // Workflow definitions
        .route("/workflows", post(handlers::workflow::publish_workflow))
        .route("/workflows", get(handlers::workflow::list_workflows))
        .route("/workflows/{id}", get(handlers::workflow::get_workflow))
        .route(
            "/workflows/{id}/enable",
            post(handlers::workflow::enable_workflow),
        )
        .route(
            "/workflows/{id}/disable",
            post(handlers::workflow::disable_workflow),
        )
        // Trigger ingestion and dry-run
        .route(
            "/workflows/{id}/trigger",
            post(handlers::workflow::trigger_workflow),
        )
        .route(
            "/workflows/{id}/simulate",
            post(handlers::workflow::simulate_workflow),
        )
        // Runs
        .route("/runs", get(handlers::run::list_runs))
        .route("/runs/{id}", get(handlers::run::get_run))
        .route("/runs/{id}/cancel", post(handlers::run::cancel_run))
        .route("/runs/{id}/signal", post(handlers::run::send_signal))
        // Dead letters
        .route(
            "/dead-letters",
            get(handlers::dead_letter::list_dead_letters),
        )
        .route(
            "/dead-letters/{id}",
            get(handlers::dead_letter::get_dead_letter),
        )
        .route(
            "/dead-letters/{id}/resolve",
            post(handlers::dead_letter::resolve_dead_letter),
        )
        .route(
            "/dead-letters/{id}/retry",
            post(handlers::dead_letter::retry_dead_letter),
        );

    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .nest("/api/v1", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
