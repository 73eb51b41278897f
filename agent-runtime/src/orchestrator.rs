use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, instrument, warn};

use common::{
    bus::{BusEvent, EventBus, TOPIC_AGENT_HANDOFF},
    error::AppError,
    records::RecordStore,
    storage::{
        db::SurrealDbClient,
        types::{
            agent_definition::{
                AgentDefinition, AgentStatus, LIMIT_MAX_COST_PER_DAY, LIMIT_MAX_RUNS_PER_DAY,
            },
            agent_run::{
                AgentRun, ReasoningStep, RunOutcome, RunStatus, ToolCallRecord, TriggerType,
            },
            audit_event::{ActorType, AuditEvent, AuditOutcome},
            operational_record::{OperationalRecord, RecordEntityType},
        },
    },
};
use retrieval_pipeline::{Confidence, EvidencePack, EvidencePackBuilder};

use crate::registry::{ToolContext, ToolRegistry};

/// Evidence requested per run.
const RUN_EVIDENCE_LIMIT: i64 = 5;
const NO_SOLUTION_REASON: &str = "no solution found";

#[derive(Debug, Clone)]
pub struct TriggerRequest {
    pub agent_id: String,
    pub workspace_id: String,
    pub trigger_type: TriggerType,
    pub triggered_by: Option<String>,
    pub inputs: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct HandoffPackage {
    pub run_id: String,
    pub agent_definition_id: String,
    pub trace_id: String,
    pub run_status: RunStatus,
    pub reasoning_trace: Vec<ReasoningStep>,
    pub tool_calls: Vec<ToolCallRecord>,
    pub evidence_ids: Vec<String>,
    pub case_id: String,
    pub case_subject: String,
    pub case_status: String,
    pub reason: String,
}

/// Drives bounded agent runs: quota-checked triggering, evidence-grounded
/// decisions, tool dispatch, and handoff packaging. Every run ends in a
/// terminal state; execution errors become `failed` runs, never 500s.
pub struct AgentOrchestrator {
    db: Arc<SurrealDbClient>,
    bus: Arc<EventBus>,
    registry: Arc<ToolRegistry>,
    evidence: Arc<EvidencePackBuilder>,
    records: RecordStore,
}

impl AgentOrchestrator {
    pub fn new(
        db: Arc<SurrealDbClient>,
        bus: Arc<EventBus>,
        registry: Arc<ToolRegistry>,
        evidence: Arc<EvidencePackBuilder>,
        records: RecordStore,
    ) -> Self {
        Self {
            db,
            bus,
            registry,
            evidence,
            records,
        }
    }

    /// Validates the trigger and inserts the `running` row. Quota breaches
    /// fail the trigger before any run exists.
    #[instrument(skip(self, request), fields(workspace_id = %request.workspace_id, agent_id = %request.agent_id))]
    pub async fn trigger_agent(&self, request: TriggerRequest) -> Result<AgentRun, AppError> {
        let agent = AgentDefinition::get_scoped(&self.db, &request.workspace_id, &request.agent_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("agent {}", request.agent_id)))?;

        if agent.status != AgentStatus::Active {
            return Err(AppError::Conflict(format!(
                "agent '{}' is not active",
                agent.name
            )));
        }

        if let Err(err) = self.check_quotas(&agent).await {
            AuditEvent::log(
                &self.db,
                AuditEvent::new(
                    &agent.workspace_id,
                    &agent.id,
                    ActorType::Agent,
                    "agent.trigger",
                    AuditOutcome::Denied,
                )
                .with_entity("agent_definition", &agent.id)
                .with_details(json!({ "reason": err.to_string() })),
            )
            .await?;
            return Err(err);
        }

        let run = AgentRun::start(
            request.workspace_id.clone(),
            agent.id.clone(),
            request.trigger_type,
            request.triggered_by,
            request.inputs,
        );
        self.db
            .store_item(run.clone())
            .await?
            .ok_or_else(|| AppError::InternalError("run insert returned nothing".into()))?;

        AuditEvent::log(
            &self.db,
            AuditEvent::new(
                &agent.workspace_id,
                &agent.id,
                ActorType::Agent,
                "agent.trigger",
                AuditOutcome::Success,
            )
            .with_entity("agent_run", &run.id)
            .with_trace(run.trace_id.clone()),
        )
        .await?;

        Ok(run)
    }

    async fn check_quotas(&self, agent: &AgentDefinition) -> Result<(), AppError> {
        let day_start = Utc::now()
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc())
            .unwrap_or_else(Utc::now);

        if let Some(max_runs) = agent.limits.get(LIMIT_MAX_RUNS_PER_DAY) {
            let used =
                AgentRun::count_started_since(&self.db, &agent.workspace_id, &agent.id, day_start)
                    .await?;
            if used as f64 >= *max_runs {
                return Err(AppError::QuotaExceeded(format!(
                    "agent '{}' reached {max_runs} runs today",
                    agent.name
                )));
            }
        }

        if let Some(max_cost) = agent.limits.get(LIMIT_MAX_COST_PER_DAY) {
            let spent = AgentRun::cost_since(&self.db, &agent.workspace_id, &agent.id, day_start)
                .await?;
            if spent >= *max_cost {
                return Err(AppError::QuotaExceeded(format!(
                    "agent '{}' reached its daily cost budget",
                    agent.name
                )));
            }
        }

        Ok(())
    }

    /// Runs the bounded execution loop for a freshly triggered run and
    /// finalizes it. Always returns the terminal run on success.
    #[instrument(skip(self), fields(run_id))]
    pub async fn execute_run(&self, workspace_id: &str, run_id: &str) -> Result<AgentRun, AppError> {
        let run = AgentRun::get_scoped(&self.db, workspace_id, run_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("run {run_id}")))?;
        if run.status != RunStatus::Running {
            return Err(AppError::Conflict("run is not in the running state".into()));
        }

        let started = std::time::Instant::now();
        let mut trace: Vec<ReasoningStep> = Vec::new();
        let mut tool_calls: Vec<ToolCallRecord> = Vec::new();

        let case_id = run
            .inputs
            .get("case_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        let case = match &case_id {
            Some(case_id) => {
                match self.records.get(workspace_id, case_id).await? {
                    Some(record) if record.entity_type == RecordEntityType::Case => Some(record),
                    _ => {
                        return self
                            .finish(
                                &run,
                                trace,
                                tool_calls,
                                Vec::new(),
                                Vec::new(),
                                RunStatus::Failed,
                                json!({ "error": format!("case {case_id} not found") }),
                                None,
                                started,
                            )
                            .await;
                    }
                }
            }
            None => None,
        };

        let query = run
            .inputs
            .get("query")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| case.as_ref().map(|c| c.subject.clone()));
        let Some(query) = query else {
            return self
                .finish(
                    &run,
                    trace,
                    tool_calls,
                    Vec::new(),
                    Vec::new(),
                    RunStatus::Failed,
                    json!({ "error": "no retrieval query derivable from inputs" }),
                    None,
                    started,
                )
                .await;
        };

        push_step(&mut trace, "derive_query", &query);

        let actor = run.triggered_by_user_id.clone().unwrap_or_else(|| run.agent_definition_id.clone());
        let pack = match self
            .evidence
            .build_pack(workspace_id, &actor, &query, Some(RUN_EVIDENCE_LIMIT))
            .await
        {
            Ok(pack) => pack,
            Err(err) => {
                warn!(error = %err, "evidence retrieval failed; failing the run");
                push_step(&mut trace, "retrieve", &format!("retrieval failed: {err}"));
                return self
                    .finish(
                        &run,
                        trace,
                        tool_calls,
                        vec![query],
                        Vec::new(),
                        RunStatus::Failed,
                        json!({ "error": err.to_string() }),
                        None,
                        started,
                    )
                    .await;
            }
        };

        push_step(
            &mut trace,
            "retrieve",
            &format!(
                "{} sources, confidence {:?}, {} candidates",
                pack.sources.len(),
                pack.confidence,
                pack.total_candidates
            ),
        );

        let evidence_ids = pack.evidence_ids();
        let ctx = ToolContext::for_agent(workspace_id, &run.agent_definition_id, &run.trace_id);

        let (status, outputs, abstention) = match pack.confidence {
            Confidence::High => {
                self.apply_action(&ctx, &pack, case.as_ref(), &mut trace, &mut tool_calls)
                    .await
            }
            Confidence::Medium => {
                self.create_followup(&ctx, &query, case.as_ref(), &mut trace, &mut tool_calls)
                    .await
            }
            Confidence::Low => {
                push_step(&mut trace, "abstain", NO_SOLUTION_REASON);
                let status = if case.is_some() {
                    RunStatus::Escalated
                } else {
                    RunStatus::Abstained
                };
                (
                    status,
                    json!({ "abstained": true }),
                    Some(NO_SOLUTION_REASON.to_string()),
                )
            }
        };

        let finalized = self
            .finish(
                &run,
                trace,
                tool_calls,
                vec![query],
                evidence_ids,
                status,
                outputs,
                abstention,
                started,
            )
            .await?;

        if finalized.status == RunStatus::Escalated {
            if let Some(case_id) = case_id {
                self.initiate_handoff(workspace_id, &finalized.id, &case_id, NO_SOLUTION_REASON)
                    .await?;
            }
        }

        Ok(finalized)
    }

    /// High confidence: apply the top source through a tool.
    async fn apply_action(
        &self,
        ctx: &ToolContext,
        pack: &EvidencePack,
        case: Option<&OperationalRecord>,
        trace: &mut Vec<ReasoningStep>,
        tool_calls: &mut Vec<ToolCallRecord>,
    ) -> (RunStatus, Value, Option<String>) {
        let Some(top) = pack.sources.first() else {
            return (
                RunStatus::Abstained,
                json!({ "abstained": true }),
                Some(NO_SOLUTION_REASON.to_string()),
            );
        };

        match case {
            Some(case) => {
                let params = json!({
                    "case_id": case.id,
                    "status": "resolved",
                    "resolution": format!("Apply '{}'", top.title),
                });
                push_step(trace, "decide", &format!("high confidence, applying '{}'", top.title));
                match self.call_tool(ctx, "update-case", params, tool_calls).await {
                    Ok(result) => (
                        RunStatus::Success,
                        json!({
                            "action": "case_updated",
                            "case_id": case.id,
                            "applied_source": top.knowledge_item_id,
                            "tool_result": result,
                        }),
                        None,
                    ),
                    Err(err) => (
                        RunStatus::Failed,
                        json!({ "error": err.to_string() }),
                        None,
                    ),
                }
            }
            None => {
                push_step(trace, "decide", "high confidence, answering directly");
                (
                    RunStatus::Success,
                    json!({
                        "action": "answered",
                        "answer": top.snippet,
                        "source": top.knowledge_item_id,
                    }),
                    None,
                )
            }
        }
    }

    /// Medium confidence: leave a follow-up task instead of acting.
    async fn create_followup(
        &self,
        ctx: &ToolContext,
        query: &str,
        case: Option<&OperationalRecord>,
        trace: &mut Vec<ReasoningStep>,
        tool_calls: &mut Vec<ToolCallRecord>,
    ) -> (RunStatus, Value, Option<String>) {
        push_step(trace, "decide", "medium confidence, creating follow-up task");

        let mut params = json!({
            "subject": format!("Review: {query}"),
            "description": "Automated follow-up; evidence was inconclusive.",
        });
        if let Some(case) = case {
            params["case_id"] = Value::String(case.id.clone());
        }

        match self.call_tool(ctx, "create-task", params, tool_calls).await {
            Ok(result) => (
                RunStatus::Partial,
                json!({ "action": "task_created", "tool_result": result }),
                None,
            ),
            Err(err) => (RunStatus::Failed, json!({ "error": err.to_string() }), None),
        }
    }

    async fn call_tool(
        &self,
        ctx: &ToolContext,
        name: &str,
        params: Value,
        tool_calls: &mut Vec<ToolCallRecord>,
    ) -> Result<Value, AppError> {
        let result = self.registry.execute(ctx, name, params.clone()).await;

        tool_calls.push(ToolCallRecord {
            name: name.to_string(),
            params,
            outcome: if result.is_ok() { "success" } else { "error" }.to_string(),
            result: result.as_ref().ok().cloned(),
            error: result.as_ref().err().map(ToString::to_string),
            at: Utc::now(),
        });

        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish(
        &self,
        run: &AgentRun,
        trace: Vec<ReasoningStep>,
        tool_calls: Vec<ToolCallRecord>,
        retrieval_queries: Vec<String>,
        retrieved_evidence_ids: Vec<String>,
        status: RunStatus,
        outputs: Value,
        abstention_reason: Option<String>,
        started: std::time::Instant,
    ) -> Result<AgentRun, AppError> {
        let finalized = AgentRun::finalize(
            &self.db,
            &run.workspace_id,
            &run.id,
            RunOutcome {
                status,
                outputs,
                retrieval_queries,
                retrieved_evidence_ids,
                reasoning_trace: trace,
                tool_calls,
                abstention_reason,
                total_tokens: None,
                total_cost: None,
                latency_ms: Some(started.elapsed().as_millis() as u64),
            },
        )
        .await?;

        let outcome = match finalized.status {
            RunStatus::Failed => AuditOutcome::Error,
            _ => AuditOutcome::Success,
        };
        AuditEvent::log(
            &self.db,
            AuditEvent::new(
                &finalized.workspace_id,
                &finalized.agent_definition_id,
                ActorType::Agent,
                "agent.run",
                outcome,
            )
            .with_entity("agent_run", &finalized.id)
            .with_details(json!({ "status": finalized.status }))
            .with_trace(finalized.trace_id.clone()),
        )
        .await?;

        info!(run_id = %finalized.id, status = ?finalized.status, "run finalized");
        Ok(finalized)
    }

    /// Escalates a case to a human with the full run context and announces
    /// it on the bus.
    pub async fn initiate_handoff(
        &self,
        workspace_id: &str,
        run_id: &str,
        case_id: &str,
        reason: &str,
    ) -> Result<HandoffPackage, AppError> {
        let mut package = self
            .assemble_package(workspace_id, run_id, case_id, reason)
            .await?;

        let case = self
            .records
            .set_status(workspace_id, case_id, "escalated")
            .await?;
        package.case_status = case.status;

        self.bus.publish(
            TOPIC_AGENT_HANDOFF,
            &BusEvent::AgentHandoff {
                workspace_id: workspace_id.to_string(),
                run_id: run_id.to_string(),
                case_id: case_id.to_string(),
                reason: reason.to_string(),
                package: serde_json::to_value(&package)
                    .unwrap_or(Value::Null),
            },
        );

        AuditEvent::log(
            &self.db,
            AuditEvent::new(
                workspace_id,
                &package.agent_definition_id,
                ActorType::Agent,
                "agent.handoff",
                AuditOutcome::Success,
            )
            .with_entity("case", case_id)
            .with_details(json!({ "run_id": run_id, "reason": reason }))
            .with_trace(package.trace_id.clone()),
        )
        .await?;

        Ok(package)
    }

    /// Read-only variant: the same package without the status transition or
    /// bus event.
    pub async fn get_handoff_package(
        &self,
        workspace_id: &str,
        run_id: &str,
        case_id: &str,
        reason: &str,
    ) -> Result<HandoffPackage, AppError> {
        self.assemble_package(workspace_id, run_id, case_id, reason)
            .await
    }

    async fn assemble_package(
        &self,
        workspace_id: &str,
        run_id: &str,
        case_id: &str,
        reason: &str,
    ) -> Result<HandoffPackage, AppError> {
        let run = AgentRun::get_scoped(&self.db, workspace_id, run_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("run {run_id}")))?;

        let case = self
            .records
            .get(workspace_id, case_id)
            .await?
            .filter(|record| record.entity_type == RecordEntityType::Case)
            .ok_or_else(|| AppError::NotFound(format!("case {case_id}")))?;

        Ok(HandoffPackage {
            run_id: run.id,
            agent_definition_id: run.agent_definition_id,
            trace_id: run.trace_id,
            run_status: run.status,
            reasoning_trace: run.reasoning_trace,
            tool_calls: run.tool_calls,
            evidence_ids: run.retrieved_evidence_ids,
            case_id: case.id,
            case_subject: case.subject,
            case_status: case.status,
            reason: reason.to_string(),
        })
    }
}

fn push_step(trace: &mut Vec<ReasoningStep>, action: &str, detail: &str) {
    trace.push(ReasoningStep {
        step: trace.len() as u32,
        action: action.to_string(),
        detail: detail.to_string(),
        at: Utc::now(),
    });
}
