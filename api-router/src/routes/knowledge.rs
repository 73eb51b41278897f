use axum::{extract::State, response::IntoResponse, Extension, Json};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use common::{
    bus::{ChangeType, RecordChange},
    storage::types::{
        audit_event::{ActorType, AuditEvent, AuditOutcome},
        knowledge_item::SourceType,
    },
};
use ingestion_pipeline::{IngestParams, ReindexOutcome};

use crate::{api_state::ApiState, error::ApiError, middleware_api_auth::AuthContext};

use super::{data, data_with_meta};

#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    pub source_type: SourceType,
    pub title: String,
    pub raw_content: String,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub metadata: Option<Value>,
}

pub async fn ingest_knowledge(
    State(state): State<ApiState>,
    Extension(auth): Extension<AuthContext>,
    Json(request): Json<IngestRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let result = state
        .ingestion
        .ingest(IngestParams {
            workspace_id: auth.workspace_id.clone(),
            source_type: request.source_type,
            title: request.title,
            raw_content: request.raw_content,
            entity_type: request.entity_type,
            entity_id: request.entity_id,
            metadata: request.metadata,
        })
        .await;

    let outcome = if result.is_ok() {
        AuditOutcome::Success
    } else {
        AuditOutcome::Error
    };
    let mut event = AuditEvent::new(
        &auth.workspace_id,
        &auth.user_id,
        ActorType::User,
        "knowledge.ingest",
        outcome,
    );
    if let Ok(item) = &result {
        event = event.with_entity("knowledge_item", &item.id);
    }
    AuditEvent::log(&state.db, event).await?;

    Ok(data(result?))
}

#[derive(Debug, Deserialize)]
pub struct ReindexRequest {
    pub entity_type: String,
    pub entity_id: String,
    pub change_type: ChangeType,
    pub occurred_at: DateTime<Utc>,
}

pub async fn reindex_knowledge(
    State(state): State<ApiState>,
    Extension(auth): Extension<AuthContext>,
    Json(request): Json<ReindexRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = state
        .reindexer
        .handle(&RecordChange {
            entity_type: request.entity_type,
            entity_id: request.entity_id,
            workspace_id: auth.workspace_id,
            change_type: request.change_type,
            occurred_at: request.occurred_at,
        })
        .await?;

    let outcome = match outcome {
        ReindexOutcome::Refreshed => "refreshed",
        ReindexOutcome::Removed => "removed",
        ReindexOutcome::Skipped => "skipped",
    };
    Ok(data(json!({ "outcome": outcome })))
}

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    pub limit: Option<i64>,
}

pub async fn search_knowledge(
    State(state): State<ApiState>,
    Extension(auth): Extension<AuthContext>,
    Json(request): Json<SearchRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let results = state
        .search
        .search(&auth.workspace_id, &request.query, request.limit)
        .await?;

    let count = results.len();
    Ok(data_with_meta(results, json!({ "count": count })))
}

pub async fn build_evidence(
    State(state): State<ApiState>,
    Extension(auth): Extension<AuthContext>,
    Json(request): Json<SearchRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let pack = state
        .evidence
        .build_pack(
            &auth.workspace_id,
            &auth.user_id,
            &request.query,
            request.limit,
        )
        .await?;

    Ok(data(pack))
}
