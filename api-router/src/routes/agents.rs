use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Extension, Json,
};
use serde::Deserialize;
use serde_json::Value;

use agent_runtime::TriggerRequest;
use common::storage::types::agent_run::{AgentRun, TriggerType};

use crate::{api_state::ApiState, error::ApiError, middleware_api_auth::AuthContext};

use super::data;

#[derive(Debug, Deserialize)]
pub struct TriggerRunRequest {
    pub trigger_type: String,
    #[serde(default)]
    pub inputs: Value,
}

fn parse_trigger_type(raw: &str) -> Result<TriggerType, ApiError> {
    match raw {
        "event" => Ok(TriggerType::Event),
        "schedule" => Ok(TriggerType::Schedule),
        "manual" => Ok(TriggerType::Manual),
        "copilot" => Ok(TriggerType::Copilot),
        other => Err(ApiError::Validation {
            message: format!("unknown trigger type '{other}'"),
            details: Some(serde_json::json!({ "field": "trigger_type" })),
        }),
    }
}

/// Triggers and synchronously executes a run; the response carries the
/// terminal run. Execution errors become terminal run states, not 5xx.
pub async fn trigger_run(
    State(state): State<ApiState>,
    Extension(auth): Extension<AuthContext>,
    Path(agent_id): Path<String>,
    Json(request): Json<TriggerRunRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let trigger_type = parse_trigger_type(&request.trigger_type)?;

    let run = state
        .orchestrator
        .trigger_agent(TriggerRequest {
            agent_id,
            workspace_id: auth.workspace_id.clone(),
            trigger_type,
            triggered_by: Some(auth.user_id.clone()),
            inputs: request.inputs,
        })
        .await?;

    let finalized = state
        .orchestrator
        .execute_run(&auth.workspace_id, &run.id)
        .await?;

    Ok(data(finalized))
}

pub async fn get_run(
    State(state): State<ApiState>,
    Extension(auth): Extension<AuthContext>,
    Path((agent_id, run_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let run = AgentRun::get_scoped(&state.db, &auth.workspace_id, &run_id)
        .await?
        .filter(|run| run.agent_definition_id == agent_id)
        .ok_or_else(|| ApiError::NotFound(format!("run {run_id}")))?;

    Ok(data(run))
}

#[derive(Debug, Deserialize)]
pub struct HandoffRequest {
    pub case_id: String,
    pub reason: Option<String>,
}

pub async fn handoff_run(
    State(state): State<ApiState>,
    Extension(auth): Extension<AuthContext>,
    Path(run_id): Path<String>,
    Json(request): Json<HandoffRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let reason = request.reason.unwrap_or_else(|| "manual handoff".to_string());
    let package = state
        .orchestrator
        .initiate_handoff(&auth.workspace_id, &run_id, &request.case_id, &reason)
        .await?;

    Ok(data(package))
}
