use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tower_http::cors::CorsLayer;

use crate::error::SchedulingError;
use crate::metrics::Metrics;
use crate::scheduler::{Scheduler, SchedulerStatus};

#[derive(Clone)]
pub struct AppState {
    pub scheduler: Scheduler,
}

/// Status surface. `/metrics` is mounted only when a recorder is installed.
pub fn router(scheduler: Scheduler, metrics: Option<&Metrics>) -> Router {
    let state = AppState { scheduler };

    let mut app = Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/scheduler/status", get(scheduler_status))
        .route("/scheduler/run", post(scheduler_run))
        .with_state(state);

    if let Some(m) = metrics {
        app = app.merge(m.router());
    }
    app.layer(CorsLayer::very_permissive())
}

async fn scheduler_status(State(state): State<AppState>) -> Json<SchedulerStatus> {
    Json(state.scheduler.status())
}

async fn scheduler_run(State(state): State<AppState>) -> impl IntoResponse {
    match state.scheduler.trigger_now() {
        Ok(()) => (StatusCode::ACCEPTED, Json(json!({ "status": "started" }))),
        Err(SchedulingError::AlreadyRunning) => (
            StatusCode::CONFLICT,
            Json(json!({ "status": "busy", "error": "a run is already in progress" })),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "status": "error", "error": e.to_string() })),
        ),
    }
}
