use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Extension, Json,
};
use serde::Deserialize;
use serde_json::Value;

use common::storage::types::prompt_version::PromptStatus;

use crate::{api_state::ApiState, error::ApiError, middleware_api_auth::AuthContext};

use super::data;

#[derive(Debug, Deserialize)]
pub struct CreateToolRequest {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    #[serde(default)]
    pub required_permissions: Vec<String>,
}

pub async fn list_tools(
    State(state): State<ApiState>,
    Extension(auth): Extension<AuthContext>,
) -> Result<impl IntoResponse, ApiError> {
    let definitions = state.registry.list_definitions(&auth.workspace_id).await?;
    Ok(data(definitions))
}

pub async fn create_tool(
    State(state): State<ApiState>,
    Extension(auth): Extension<AuthContext>,
    Json(request): Json<CreateToolRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if request.name.trim().is_empty() {
        return Err(ApiError::Validation {
            message: "tool name must not be empty".to_string(),
            details: Some(serde_json::json!({ "field": "name" })),
        });
    }

    let definition = state
        .registry
        .create_definition(
            &auth.workspace_id,
            &request.name,
            &request.description,
            request.input_schema,
            request.required_permissions,
        )
        .await?;

    Ok(data(definition))
}

#[derive(Debug, Deserialize)]
pub struct PromptListQuery {
    pub agent_id: String,
}

pub async fn list_prompt_versions(
    State(state): State<ApiState>,
    Extension(auth): Extension<AuthContext>,
    Query(query): Query<PromptListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let versions = state
        .prompts
        .list_versions(&auth.workspace_id, &query.agent_id)
        .await?;
    Ok(data(versions))
}

#[derive(Debug, Deserialize)]
pub struct CreatePromptRequest {
    pub agent_definition_id: String,
    pub system_prompt: String,
    pub user_prompt_template: Option<String>,
    #[serde(default)]
    pub config: Value,
}

pub async fn create_prompt_version(
    State(state): State<ApiState>,
    Extension(auth): Extension<AuthContext>,
    Json(request): Json<CreatePromptRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let version = state
        .prompts
        .create_version(
            &auth.workspace_id,
            &auth.user_id,
            &request.agent_definition_id,
            request.system_prompt,
            request.user_prompt_template,
            request.config,
        )
        .await?;

    Ok(data(version))
}

#[derive(Debug, Deserialize)]
pub struct UpdatePromptRequest {
    pub system_prompt: Option<String>,
    pub user_prompt_template: Option<String>,
    pub status: Option<String>,
}

fn parse_prompt_status(raw: &str) -> Result<PromptStatus, ApiError> {
    match raw {
        "draft" => Ok(PromptStatus::Draft),
        "testing" => Ok(PromptStatus::Testing),
        "active" => Ok(PromptStatus::Active),
        "archived" => Ok(PromptStatus::Archived),
        other => Err(ApiError::Validation {
            message: format!("unknown prompt status '{other}'"),
            details: Some(serde_json::json!({ "field": "status" })),
        }),
    }
}

pub async fn update_prompt_version(
    State(state): State<ApiState>,
    Extension(auth): Extension<AuthContext>,
    Path(version_id): Path<String>,
    Json(request): Json<UpdatePromptRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let status = request
        .status
        .as_deref()
        .map(parse_prompt_status)
        .transpose()?;

    let version = state
        .prompts
        .update_version(
            &auth.workspace_id,
            &auth.user_id,
            &version_id,
            request.system_prompt,
            request.user_prompt_template.map(Some),
            status,
        )
        .await?;

    Ok(data(version))
}

pub async fn promote_prompt(
    State(state): State<ApiState>,
    Extension(auth): Extension<AuthContext>,
    Path(version_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let version = state
        .prompts
        .promote(&auth.workspace_id, &auth.user_id, &version_id)
        .await?;

    Ok(data(version))
}

#[derive(Debug, Deserialize)]
pub struct RollbackRequest {
    pub agent_definition_id: String,
}

pub async fn rollback_prompt(
    State(state): State<ApiState>,
    Extension(auth): Extension<AuthContext>,
    Json(request): Json<RollbackRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let version = state
        .prompts
        .rollback(&auth.workspace_id, &auth.user_id, &request.agent_definition_id)
        .await?;

    Ok(data(version))
}
