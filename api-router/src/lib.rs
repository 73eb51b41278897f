#![allow(clippy::missing_docs_in_private_items)]

use api_state::ApiState;
use axum::{
    middleware::from_fn,
    routing::{get, post, put},
    Router,
};
use middleware_api_auth::api_auth;
use routes::{
    admin::{
        create_prompt_version, create_tool, list_prompt_versions, list_tools, promote_prompt,
        rollback_prompt, update_prompt_version,
    },
    agents::{get_run, handoff_run, trigger_run},
    audit::list_audit_events,
    copilot::copilot_chat,
    knowledge::{build_evidence, ingest_knowledge, reindex_knowledge, search_knowledge},
    liveness::live,
    readiness::ready,
};

pub mod api_state;
pub mod error;
pub mod middleware_api_auth;
mod routes;

/// Router for API functionality, version 1
pub fn api_routes_v1(app_state: &ApiState) -> Router {
    // Public, unauthenticated endpoints (for k8s/systemd probes)
    let public = Router::new()
        .route("/ready", get(ready))
        .route("/live", get(live));

    // Protected endpoints; the upstream verifier attaches the principal.
    let protected = Router::new()
        .route("/knowledge/ingest", post(ingest_knowledge))
        .route("/knowledge/reindex", post(reindex_knowledge))
        .route("/knowledge/search", post(search_knowledge))
        .route("/knowledge/evidence", post(build_evidence))
        .route("/agents/{id}/runs", post(trigger_run))
        .route("/agents/{id}/runs/{run_id}", get(get_run))
        .route("/agents/runs/{run_id}/handoff", post(handoff_run))
        .route("/admin/tools", get(list_tools).post(create_tool))
        .route(
            "/admin/prompts",
            get(list_prompt_versions).post(create_prompt_version),
        )
        .route("/admin/prompts/{id}", put(update_prompt_version))
        .route("/admin/prompts/{id}/promote", post(promote_prompt))
        .route("/admin/prompts/rollback", post(rollback_prompt))
        .route("/copilot/chat", post(copilot_chat))
        .route("/audit/events", get(list_audit_events))
        .route_layer(from_fn(api_auth));

    public.merge(protected).with_state(app_state.clone())
}
