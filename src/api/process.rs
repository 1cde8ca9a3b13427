//! Legacy REST entry point for the extraction pipeline

use std::sync::Arc;

use axum::{Json, Router, extract::State, routing::post};

use super::AppState;
use crate::pipeline::{ProcessRequest, ProcessResult};

/// `POST /api/process`; failures are reported inside the result body
async fn process(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ProcessRequest>,
) -> Json<ProcessResult> {
    Json(state.process.run(request).await)
}

/// Build the REST router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/process", post(process))
        .with_state(state)
}
