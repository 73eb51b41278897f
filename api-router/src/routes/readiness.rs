use axum::{extract::State, http::StatusCode, response::IntoResponse};
use tracing::warn;

use crate::api_state::ApiState;

/// Ready once the database answers. The LLM provider is intentionally not a
/// readiness gate: search degrades without it.
pub async fn ready(State(state): State<ApiState>) -> impl IntoResponse {
    match state.db.query("RETURN 1;").await {
        Ok(_) => StatusCode::OK,
        Err(err) => {
            warn!(error = %err, "readiness probe failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}
