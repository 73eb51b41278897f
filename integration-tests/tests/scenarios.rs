use std::sync::Arc;

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
};
use chrono::{Duration, Utc};
use common::{
    bus::{BusEvent, TOPIC_AGENT_HANDOFF},
    records::RecordStore,
    storage::types::{
        audit_event::{ActorType, AuditEvent, AuditOutcome},
        embedding_document::EmbeddingDocument,
        operational_record::{OperationalRecord, RecordEntityType},
    },
    utils::{
        config::{AppConfig, LlmBackend},
        llm::LlmProvider,
    },
};
use serde_json::json;
use tower::ServiceExt;

use test_utils::{
    authed_request, body_json, get_json, post_json, seed_embedded_article, send, spawn_app,
    spawn_app_with_provider, store_agent, TestApp, USER, WORKSPACE,
};

fn records_of(app: &TestApp) -> RecordStore {
    app.state.records.clone()
}

async fn open_case(app: &TestApp, subject: &str) -> OperationalRecord {
    records_of(app)
        .create(
            WORKSPACE,
            RecordEntityType::Case,
            subject.to_string(),
            "open".to_string(),
            json!({}),
        )
        .await
        .expect("case")
}

#[tokio::test]
async fn probes_answer_without_auth() {
    let app = spawn_app().await;

    let response = send(
        &app.app,
        Request::builder()
            .uri("/api/v1/live")
            .body(Body::empty())
            .expect("request"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = send(
        &app.app,
        Request::builder()
            .uri("/api/v1/ready")
            .body(Body::empty())
            .expect("request"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn protected_routes_reject_missing_principal() {
    let app = spawn_app().await;

    // Bearer token but no principal headers.
    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/knowledge/search")
        .header(header::AUTHORIZATION, "Bearer test-token")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(json!({ "query": "vpn" }).to_string()))
        .expect("request");
    let response = send(&app.app, request).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "UNAUTHENTICATED");

    // No Authorization header at all.
    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/knowledge/search")
        .header("X-Workspace-Id", WORKSPACE)
        .header("X-User-Id", USER)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(json!({ "query": "vpn" }).to_string()))
        .expect("request");
    let response = send(&app.app, request).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

// Scenario: near-duplicate articles collapse into one source with high
// confidence and a dedup warning.
#[tokio::test]
async fn evidence_pack_deduplicates_near_identical_articles() {
    let app = spawn_app().await;
    let body = "reset the user password from the admin console then notify the requester by email";
    seed_embedded_article(&app, "Password reset", body).await;
    seed_embedded_article(&app, "Password reset (copy)", body).await;
    seed_embedded_article(&app, "Password reset (old)", body).await;

    let (status, response) = post_json(
        &app.app,
        "/api/v1/knowledge/evidence",
        json!({ "query": "password reset", "limit": 10 }),
    )
    .await;

    assert_eq!(status, StatusCode::OK, "{response}");
    let pack = &response["data"];
    assert_eq!(pack["total_candidates"], 3);
    assert!(pack["filtered_count"].as_u64().expect("filtered") >= 1);
    let sources = pack["sources"].as_array().expect("sources");
    assert!(!sources.is_empty() && sources.len() <= 2, "{pack}");
    assert_eq!(pack["confidence"], "high");
    assert!(pack["warnings"]
        .as_array()
        .expect("warnings")
        .iter()
        .any(|w| w.as_str().unwrap_or_default().contains("items deduplicated")));
}

// Scenario: with the embed provider down, search still answers from BM25.
#[tokio::test]
async fn search_degrades_to_bm25_when_embeddings_fail() {
    let mut config = AppConfig::for_tests();
    config.llm_provider = LlmBackend::Http;
    config.llm_base_url = "http://127.0.0.1:9/v1".to_string();
    config.embed_timeout_secs = 2;
    let provider = Arc::new(LlmProvider::from_config(&config));

    let app = spawn_app_with_provider(provider).await;
    let (status, _) = post_json(
        &app.app,
        "/api/v1/knowledge/ingest",
        json!({
            "source_type": "kb_article",
            "title": "Urgent invoice",
            "raw_content": "urgent invoice escalation playbook",
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, response) = post_json(
        &app.app,
        "/api/v1/knowledge/search",
        json!({ "query": "urgent invoice" }),
    )
    .await;

    assert_eq!(status, StatusCode::OK, "degradation must not error");
    let results = response["data"].as_array().expect("results");
    assert!(!results.is_empty());
    assert!(results.iter().all(|r| r["method"] == "bm25"));
}

// Scenario: support agent resolves a case from a matching KB article.
#[tokio::test]
async fn support_agent_resolves_case_with_one_update_case_call() {
    let app = spawn_app().await;
    let agent = store_agent(&app, "support-triage").await;
    seed_embedded_article(
        &app,
        "VPN restart",
        "VPN down recovery: restart the vpn appliance and verify the tunnel",
    )
    .await;
    let case = open_case(&app, "VPN down").await;

    let (status, response) = post_json(
        &app.app,
        &format!("/api/v1/agents/{}/runs", agent.id),
        json!({ "trigger_type": "manual", "inputs": { "case_id": case.id } }),
    )
    .await;

    assert_eq!(status, StatusCode::OK, "{response}");
    let run = &response["data"];
    assert_eq!(run["status"], "success");

    let tool_calls = run["tool_calls"].as_array().expect("tool calls");
    assert_eq!(tool_calls.len(), 1);
    assert_eq!(tool_calls[0]["name"], "update-case");

    assert!(!run["retrieved_evidence_ids"]
        .as_array()
        .expect("evidence ids")
        .is_empty());

    let case = records_of(&app)
        .get(WORKSPACE, &case.id)
        .await
        .expect("get")
        .expect("case");
    assert_eq!(case.status, "resolved");

    let audits = AuditEvent::list_by_action(&app.state.db, WORKSPACE, "tool.update-case")
        .await
        .expect("audit");
    assert_eq!(audits.len(), 1);
    assert_eq!(audits[0].actor_type, ActorType::Agent);
    assert_eq!(audits[0].outcome, AuditOutcome::Success);

    // The run is also fetchable afterwards.
    let (status, fetched) = get_json(
        &app.app,
        &format!("/api/v1/agents/{}/runs/{}", agent.id, run["id"].as_str().expect("id")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["data"]["status"], "success");
}

// Scenario: nothing relevant in the KB escalates the case to a human.
#[tokio::test]
async fn agent_abstains_and_hands_off_unanswerable_cases() {
    let app = spawn_app().await;
    let agent = store_agent(&app, "support-triage").await;
    let case = open_case(&app, "quantum entanglement support").await;
    let mut handoffs = app.bus.subscribe(TOPIC_AGENT_HANDOFF);

    let (status, response) = post_json(
        &app.app,
        &format!("/api/v1/agents/{}/runs", agent.id),
        json!({ "trigger_type": "manual", "inputs": { "case_id": case.id } }),
    )
    .await;

    assert_eq!(status, StatusCode::OK, "{response}");
    let run = &response["data"];
    assert_eq!(run["status"], "escalated");
    assert_eq!(run["abstention_reason"], "no solution found");

    let case = records_of(&app)
        .get(WORKSPACE, &case.id)
        .await
        .expect("get")
        .expect("case");
    assert_eq!(case.status, "escalated");

    let event = handoffs.recv().await.expect("handoff event");
    let BusEvent::AgentHandoff { reason, package, .. } = event else {
        panic!("unexpected event type");
    };
    assert_eq!(reason, "no solution found");
    assert!(package["reasoning_trace"]
        .as_array()
        .is_some_and(|trace| !trace.is_empty()));
    assert_eq!(package["reason"], "no solution found");
}

// Scenario: prompt promote/rollback lifecycle over the admin surface.
#[tokio::test]
async fn prompt_promote_and_rollback_lifecycle() {
    let app = spawn_app().await;
    let agent = store_agent(&app, "support-triage").await;

    let create = |prompt: &str| {
        json!({
            "agent_definition_id": agent.id,
            "system_prompt": prompt,
        })
    };

    let (status, v1) = post_json(&app.app, "/api/v1/admin/prompts", create("Version one.")).await;
    assert_eq!(status, StatusCode::OK);
    let v1_id = v1["data"]["id"].as_str().expect("v1 id").to_string();

    let (status, _) = post_json(
        &app.app,
        &format!("/api/v1/admin/prompts/{v1_id}/promote"),
        json!({}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, v2) = post_json(&app.app, "/api/v1/admin/prompts", create("Version two.")).await;
    assert_eq!(status, StatusCode::OK);
    let v2_id = v2["data"]["id"].as_str().expect("v2 id").to_string();

    let (status, _) = post_json(
        &app.app,
        &format!("/api/v1/admin/prompts/{v2_id}/promote"),
        json!({}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let statuses = |versions: &serde_json::Value| {
        versions["data"]
            .as_array()
            .expect("versions")
            .iter()
            .map(|v| {
                (
                    v["id"].as_str().expect("id").to_string(),
                    v["status"].as_str().expect("status").to_string(),
                )
            })
            .collect::<std::collections::HashMap<_, _>>()
    };

    let (_, listed) = get_json(
        &app.app,
        &format!("/api/v1/admin/prompts?agent_id={}", agent.id),
    )
    .await;
    let map = statuses(&listed);
    assert_eq!(map[&v1_id], "archived");
    assert_eq!(map[&v2_id], "active");

    // Rollback restores v1 and archives v2.
    let (status, restored) = post_json(
        &app.app,
        "/api/v1/admin/prompts/rollback",
        json!({ "agent_definition_id": agent.id }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(restored["data"]["id"], v1_id.as_str());

    let (_, listed) = get_json(
        &app.app,
        &format!("/api/v1/admin/prompts?agent_id={}", agent.id),
    )
    .await;
    let map = statuses(&listed);
    assert_eq!(map[&v1_id], "active");
    assert_eq!(map[&v2_id], "archived");

    // Re-promoting the rolled-back version succeeds.
    let (status, _) = post_json(
        &app.app,
        &format!("/api/v1/admin/prompts/{v2_id}/promote"),
        json!({}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, listed) = get_json(
        &app.app,
        &format!("/api/v1/admin/prompts?agent_id={}", agent.id),
    )
    .await;
    let map = statuses(&listed);
    assert_eq!(map[&v1_id], "archived");
    assert_eq!(map[&v2_id], "active");

    // A version archived straight from draft was never deployed and cannot
    // be promoted.
    let (status, v3) = post_json(&app.app, "/api/v1/admin/prompts", create("Version three.")).await;
    assert_eq!(status, StatusCode::OK);
    let v3_id = v3["data"]["id"].as_str().expect("v3 id").to_string();

    let (status, _) = send_put(
        &app.app,
        &format!("/api/v1/admin/prompts/{v3_id}"),
        json!({ "status": "archived" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, response) = post_json(
        &app.app,
        &format!("/api/v1/admin/prompts/{v3_id}/promote"),
        json!({}),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(response["error"]["code"], "CONFLICT");

    // Direct activation is also refused.
    let (status, response) = send_put(
        &app.app,
        &format!("/api/v1/admin/prompts/{v2_id}"),
        json!({ "status": "active" }),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(response["error"]["code"], "CONFLICT");
}

async fn send_put(
    app: &axum::Router,
    uri: &str,
    body: serde_json::Value,
) -> (StatusCode, serde_json::Value) {
    let response = send(app, authed_request("PUT", uri, body)).await;
    let status = response.status();
    (status, body_json(response).await)
}

// Scenario: CDC replay with equal or older timestamps causes no chunk churn.
#[tokio::test]
async fn reindex_ignores_non_increasing_occurred_at() {
    let app = spawn_app().await;
    let case = open_case(&app, "VPN down").await;
    let t1 = Utc::now();

    let payload = |occurred_at: chrono::DateTime<Utc>| {
        json!({
            "entity_type": "case",
            "entity_id": case.id,
            "change_type": "updated",
            "occurred_at": occurred_at.to_rfc3339(),
        })
    };

    let (status, response) =
        post_json(&app.app, "/api/v1/knowledge/reindex", payload(t1)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["data"]["outcome"], "refreshed");

    let item = common::storage::types::knowledge_item::KnowledgeItem::find_by_entity(
        &app.state.db,
        WORKSPACE,
        "case",
        &case.id,
    )
    .await
    .expect("find")
    .expect("indexed item");
    let chunks_before = EmbeddingDocument::list_for_item(&app.state.db, &item.id)
        .await
        .expect("chunks");

    let (_, response) = post_json(&app.app, "/api/v1/knowledge/reindex", payload(t1)).await;
    assert_eq!(response["data"]["outcome"], "skipped");

    let (_, response) = post_json(
        &app.app,
        "/api/v1/knowledge/reindex",
        payload(t1 - Duration::seconds(45)),
    )
    .await;
    assert_eq!(response["data"]["outcome"], "skipped");

    let chunks_after = EmbeddingDocument::list_for_item(&app.state.db, &item.id)
        .await
        .expect("chunks");
    let ids = |chunks: &[EmbeddingDocument]| {
        chunks.iter().map(|c| c.id.clone()).collect::<Vec<_>>()
    };
    assert_eq!(ids(&chunks_before), ids(&chunks_after), "no chunk churn");
}

// The copilot stream emits evidence, token and final frames.
#[tokio::test]
async fn copilot_chat_streams_frames_until_final() {
    let app = spawn_app().await;
    seed_embedded_article(&app, "VPN restart", "restart the vpn appliance to recover").await;

    let request = authed_request(
        "POST",
        "/api/v1/copilot/chat",
        json!({ "message": "how do I restart the vpn" }),
    );
    let response = app.app.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert!(content_type.starts_with("text/event-stream"), "{content_type}");

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("stream body");
    let text = String::from_utf8_lossy(&bytes);

    let frames: Vec<serde_json::Value> = text
        .lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .filter_map(|data| serde_json::from_str(data).ok())
        .collect();

    assert!(frames.iter().any(|f| f["type"] == "evidence"));
    assert!(frames.iter().any(|f| f["type"] == "token"));
    assert!(frames.last().is_some_and(|f| f["type"] == "final"));
}

// Workspace isolation: another tenant's content is invisible end to end.
#[tokio::test]
async fn foreign_workspace_sees_nothing() {
    let app = spawn_app().await;
    seed_embedded_article(&app, "VPN restart", "restart the vpn appliance").await;

    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/knowledge/search")
        .header(header::AUTHORIZATION, "Bearer test-token")
        .header("X-Workspace-Id", "ws_other")
        .header("X-User-Id", "user_other")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(json!({ "query": "vpn restart" }).to_string()))
        .expect("request");
    let response = send(&app.app, request).await;
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["data"].as_array().expect("results").len(), 0);
}
