use axum::{Json, Router, extract::State, routing::get};
use serde::Serialize;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health))
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    model: String,
    backend_initialized: bool,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let status = if state.model().is_released() {
        "unavailable"
    } else {
        "ok"
    };
    Json(HealthResponse {
        status,
        model: state.model().path().display().to_string(),
        backend_initialized: state.backend().is_initialized(),
    })
}
