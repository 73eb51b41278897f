use std::{pin::Pin, time::Duration};

use async_stream::stream;
use axum::{
    extract::State,
    response::{
        sse::{Event, KeepAlive, KeepAliveStream, Sse},
        IntoResponse,
    },
    Extension, Json,
};
use futures::{stream, Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::error;

use agent_runtime::TriggerRequest;
use common::{
    storage::types::agent_run::TriggerType,
    utils::llm::ChatMessage,
};

use crate::{api_state::ApiState, middleware_api_auth::AuthContext};

type EventStream = Pin<Box<dyn Stream<Item = Result<Event, axum::Error>> + Send>>;
type SseResponse = Sse<KeepAliveStream<EventStream>>;

const EVIDENCE_LIMIT: i64 = 5;
const TOKEN_BATCH_CHARS: usize = 48;

fn sse_with_keep_alive(stream: EventStream) -> SseResponse {
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}

/// Compact JSON frame with a `type` discriminator.
fn frame(payload: &Value) -> Event {
    Event::default().data(payload.to_string())
}

fn error_frame(message: impl Into<String>) -> Value {
    json!({ "type": "error", "message": message.into() })
}

fn single_frame_stream(payload: Value) -> EventStream {
    stream::once(async move { Ok(frame(&payload)) }).boxed()
}

#[derive(Debug, Deserialize)]
pub struct CopilotChatRequest {
    pub message: String,
    pub agent_id: Option<String>,
}

/// Long-lived copilot stream. Emits a frame per meaningful state change:
/// evidence, token batches, tool calls, then a final (or error) frame. The
/// stream closes once the interaction reaches a terminal state; a client
/// disconnect drops the stream and cancels the work in flight.
pub async fn copilot_chat(
    State(state): State<ApiState>,
    Extension(auth): Extension<AuthContext>,
    Json(request): Json<CopilotChatRequest>,
) -> impl IntoResponse {
    if request.message.trim().is_empty() {
        return sse_with_keep_alive(single_frame_stream(error_frame("message must not be empty")));
    }

    let event_stream: EventStream = stream! {
        let pack = match state
            .evidence
            .build_pack(&auth.workspace_id, &auth.user_id, &request.message, Some(EVIDENCE_LIMIT))
            .await
        {
            Ok(pack) => pack,
            Err(err) => {
                error!(error = %err, "copilot evidence retrieval failed");
                yield Ok(frame(&error_frame("evidence retrieval failed")));
                return;
            }
        };

        yield Ok(frame(&json!({
            "type": "evidence",
            "confidence": pack.confidence,
            "warnings": pack.warnings,
            "sources": pack.sources.iter().map(|source| json!({
                "knowledge_item_id": source.knowledge_item_id,
                "title": source.title,
                "score": source.score,
            })).collect::<Vec<_>>(),
        })));

        match &request.agent_id {
            Some(agent_id) => {
                let triggered = state
                    .orchestrator
                    .trigger_agent(TriggerRequest {
                        agent_id: agent_id.clone(),
                        workspace_id: auth.workspace_id.clone(),
                        trigger_type: TriggerType::Copilot,
                        triggered_by: Some(auth.user_id.clone()),
                        inputs: json!({ "query": request.message }),
                    })
                    .await;

                let run = match triggered {
                    Ok(run) => run,
                    Err(err) => {
                        yield Ok(frame(&error_frame(err.to_string())));
                        return;
                    }
                };

                match state.orchestrator.execute_run(&auth.workspace_id, &run.id).await {
                    Ok(finalized) => {
                        for call in &finalized.tool_calls {
                            yield Ok(frame(&json!({
                                "type": "tool_call",
                                "name": call.name,
                                "outcome": call.outcome,
                            })));
                        }
                        yield Ok(frame(&json!({
                            "type": "final",
                            "run_id": finalized.id,
                            "status": finalized.status,
                            "outputs": finalized.outputs,
                            "abstention_reason": finalized.abstention_reason,
                        })));
                    }
                    Err(err) => {
                        error!(error = %err, "copilot run failed");
                        yield Ok(frame(&error_frame("agent run failed")));
                    }
                }
            }
            None => {
                let context = pack
                    .sources
                    .iter()
                    .map(|source| format!("- {}: {}", source.title, source.snippet))
                    .collect::<Vec<_>>()
                    .join("\n");
                let messages = vec![
                    ChatMessage::system(format!(
                        "Answer using only the evidence below. Cite titles.\n{context}"
                    )),
                    ChatMessage::user(request.message.clone()),
                ];

                match state.provider.chat(messages, None, None).await {
                    Ok(output) => {
                        let chars: Vec<char> = output.content.chars().collect();
                        for batch in chars.chunks(TOKEN_BATCH_CHARS) {
                            let content: String = batch.iter().collect();
                            yield Ok(frame(&json!({ "type": "token", "content": content })));
                        }
                        yield Ok(frame(&json!({
                            "type": "final",
                            "content": output.content,
                            "evidence_ids": pack.evidence_ids(),
                        })));
                    }
                    Err(err) => {
                        error!(error = %err, "copilot chat failed");
                        yield Ok(frame(&error_frame("chat generation failed")));
                    }
                }
            }
        }
    }
    .boxed();

    sse_with_keep_alive(event_stream)
}
