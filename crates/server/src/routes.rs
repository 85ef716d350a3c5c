//! Route configuration.

use crate::handlers;
use crate::state::AppState;
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let api_routes = Router::new()
        // Health check (intentionally unauthenticated for probes)
        .route("/v1/health", get(handlers::health_check))
        // Repos
        .route(
            "/v1/repos",
            post(handlers::create_repo).get(handlers::list_repo),
        )
        .route(
            "/v1/repos/{repo}",
            get(handlers::inspect_repo).delete(handlers::delete_repo),
        )
        // Branches
        .route(
            "/v1/repos/{repo}/branches",
            post(handlers::create_branch).get(handlers::list_branch),
        )
        .route(
            "/v1/repos/{repo}/branches/{branch}",
            get(handlers::inspect_branch).delete(handlers::delete_branch),
        )
        // Commits
        .route(
            "/v1/repos/{repo}/commits",
            post(handlers::start_commit).get(handlers::list_commit),
        )
        .route(
            "/v1/repos/{repo}/commits/subscribe",
            get(handlers::subscribe_commit),
        )
        .route(
            "/v1/repos/{repo}/commits/{commit}",
            get(handlers::inspect_commit),
        )
        .route(
            "/v1/repos/{repo}/commits/{commit}/finish",
            post(handlers::finish_commit),
        )
        // Commit sets
        .route("/v1/commitsets", get(handlers::list_commit_set))
        .route("/v1/commitsets/{id}", get(handlers::inspect_commit_set))
        .route(
            "/v1/commitsets/{id}/squash",
            post(handlers::squash_commit_set),
        )
        .route("/v1/commitsets/{id}/drop", post(handlers::drop_commit_set))
        // Files
        .route(
            "/v1/repos/{repo}/commits/{commit}/files",
            post(handlers::modify_file),
        )
        .route(
            "/v1/repos/{repo}/commits/{commit}/files/get",
            get(handlers::get_file),
        )
        .route(
            "/v1/repos/{repo}/commits/{commit}/files/tar",
            get(handlers::get_file_tar),
        )
        .route(
            "/v1/repos/{repo}/commits/{commit}/files/inspect",
            get(handlers::inspect_file),
        )
        .route(
            "/v1/repos/{repo}/commits/{commit}/files/list",
            get(handlers::list_file),
        )
        .route(
            "/v1/repos/{repo}/commits/{commit}/files/walk",
            get(handlers::walk_file),
        )
        .route(
            "/v1/repos/{repo}/commits/{commit}/files/glob",
            get(handlers::glob_file),
        )
        .route(
            "/v1/repos/{repo}/commits/{commit}/files/diff",
            get(handlers::diff_file),
        )
        // Pipelines
        .route(
            "/v1/pipelines",
            post(handlers::create_pipeline).get(handlers::list_pipeline),
        )
        .route(
            "/v1/pipelines/{pipeline}",
            get(handlers::inspect_pipeline).delete(handlers::delete_pipeline),
        )
        .route(
            "/v1/pipelines/{pipeline}/start",
            post(handlers::start_pipeline),
        )
        .route(
            "/v1/pipelines/{pipeline}/stop",
            post(handlers::stop_pipeline),
        )
        .route("/v1/pipelines/{pipeline}/run", post(handlers::run_pipeline))
        // Jobs and datums
        .route("/v1/pipelines/{pipeline}/jobs", get(handlers::list_job))
        .route(
            "/v1/pipelines/{pipeline}/jobs/{job}",
            get(handlers::inspect_job),
        )
        .route(
            "/v1/pipelines/{pipeline}/jobs/{job}/stop",
            post(handlers::stop_job),
        )
        .route(
            "/v1/pipelines/{pipeline}/jobs/{job}/datums",
            get(handlers::list_datum),
        )
        .route(
            "/v1/pipelines/{pipeline}/jobs/{job}/datums/{datum}",
            get(handlers::inspect_datum),
        )
        .route(
            "/v1/pipelines/{pipeline}/jobs/{job}/datums/{datum}/restart",
            post(handlers::restart_datum),
        );

    let router = Router::new().merge(api_routes).with_state(state.clone());
    if state.config.server.enable_tracing {
        router.layer(TraceLayer::new_for_http())
    } else {
        router
    }
}
