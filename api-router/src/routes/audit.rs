use axum::{
    extract::{Query, State},
    response::IntoResponse,
    Extension,
};
use serde::Deserialize;
use serde_json::json;

use common::storage::types::audit_event::AuditEvent;

use crate::{api_state::ApiState, error::ApiError, middleware_api_auth::AuthContext};

use super::data_with_meta;

const DEFAULT_PAGE_SIZE: usize = 50;
const MAX_PAGE_SIZE: usize = 200;

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    pub limit: Option<usize>,
    pub start: Option<usize>,
    pub action: Option<String>,
    pub actor_id: Option<String>,
}

/// Workspace-scoped audit listing, newest first. Cross-workspace listing
/// does not exist: the workspace always comes from the principal.
pub async fn list_audit_events(
    State(state): State<ApiState>,
    Extension(auth): Extension<AuthContext>,
    Query(query): Query<AuditQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let events = if let Some(action) = &query.action {
        AuditEvent::list_by_action(&state.db, &auth.workspace_id, action).await?
    } else if let Some(actor_id) = &query.actor_id {
        AuditEvent::list_by_actor(&state.db, &auth.workspace_id, actor_id).await?
    } else {
        let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE).min(MAX_PAGE_SIZE);
        let start = query.start.unwrap_or(0);
        AuditEvent::list_by_workspace(&state.db, &auth.workspace_id, limit, start).await?
    };

    let count = events.len();
    Ok(data_with_meta(events, json!({ "count": count })))
}
