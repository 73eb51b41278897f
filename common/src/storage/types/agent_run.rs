use serde_json::Value;
use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    Event,
    Schedule,
    Manual,
    Copilot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Success,
    Partial,
    Abstained,
    Failed,
    Escalated,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// One entry of the ordered reasoning trace. Serialized as plain JSON; the
/// trace is opaque to queries.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ReasoningStep {
    pub step: u32,
    pub action: String,
    pub detail: String,
    pub at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ToolCallRecord {
    pub name: String,
    pub params: Value,
    pub outcome: String,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub at: chrono::DateTime<chrono::Utc>,
}

stored_object!(AgentRun, "agent_run", {
    workspace_id: String,
    agent_definition_id: String,
    triggered_by_user_id: Option<String>,
    trigger_type: TriggerType,
    status: RunStatus,
    #[serde(default)]
    inputs: Value,
    #[serde(default)]
    outputs: Value,
    retrieval_queries: Vec<String>,
    retrieved_evidence_ids: Vec<String>,
    reasoning_trace: Vec<ReasoningStep>,
    tool_calls: Vec<ToolCallRecord>,
    abstention_reason: Option<String>,
    total_tokens: Option<u32>,
    total_cost: Option<f64>,
    latency_ms: Option<u64>,
    trace_id: String,
    #[serde(
        serialize_with = "serialize_datetime",
        deserialize_with = "deserialize_datetime",
        default
    )]
    started_at: DateTime<Utc>,
    #[serde(
        serialize_with = "serialize_option_datetime",
        deserialize_with = "deserialize_option_datetime",
        default
    )]
    completed_at: Option<DateTime<Utc>>
});

/// Everything written when a run leaves `running`. Applied as one statement.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub outputs: Value,
    pub retrieval_queries: Vec<String>,
    pub retrieved_evidence_ids: Vec<String>,
    pub reasoning_trace: Vec<ReasoningStep>,
    pub tool_calls: Vec<ToolCallRecord>,
    pub abstention_reason: Option<String>,
    pub total_tokens: Option<u32>,
    pub total_cost: Option<f64>,
    pub latency_ms: Option<u64>,
}

impl AgentRun {
    pub fn start(
        workspace_id: String,
        agent_definition_id: String,
        trigger_type: TriggerType,
        triggered_by_user_id: Option<String>,
        inputs: Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7().to_string(),
            created_at: now,
            updated_at: now,
            workspace_id,
            agent_definition_id,
            triggered_by_user_id,
            trigger_type,
            status: RunStatus::Running,
            inputs,
            outputs: Value::Object(serde_json::Map::new()),
            retrieval_queries: Vec::new(),
            retrieved_evidence_ids: Vec::new(),
            reasoning_trace: Vec::new(),
            tool_calls: Vec::new(),
            abstention_reason: None,
            total_tokens: None,
            total_cost: None,
            latency_ms: None,
            trace_id: Uuid::now_v7().to_string(),
            started_at: now,
            completed_at: None,
        }
    }

    pub async fn get_scoped(
        db: &SurrealDbClient,
        workspace_id: &str,
        id: &str,
    ) -> Result<Option<Self>, AppError> {
        let run: Option<Self> = db.get_item(id).await?;
        Ok(run.filter(|run| run.workspace_id == workspace_id))
    }

    /// Moves the run out of `running` in a single guarded statement.
    ///
    /// `completed_at` is set exactly once: the `status = 'running'` predicate
    /// makes a second finalize a conflict instead of an overwrite.
    pub async fn finalize(
        db: &SurrealDbClient,
        workspace_id: &str,
        id: &str,
        outcome: RunOutcome,
    ) -> Result<Self, AppError> {
        if !outcome.status.is_terminal() {
            return Err(AppError::Validation(
                "a run can only be finalized into a terminal status".to_string(),
            ));
        }

        let mut response = db
            .query(
                "UPDATE type::thing($table, $id)
                 SET status = $status,
                     outputs = $outputs,
                     retrieval_queries = $retrieval_queries,
                     retrieved_evidence_ids = $retrieved_evidence_ids,
                     reasoning_trace = $reasoning_trace,
                     tool_calls = $tool_calls,
                     abstention_reason = $abstention_reason,
                     total_tokens = $total_tokens,
                     total_cost = $total_cost,
                     latency_ms = $latency_ms,
                     completed_at = time::now(),
                     updated_at = time::now()
                 WHERE workspace_id = $workspace_id
                   AND status = 'running'
                 RETURN AFTER;",
            )
            .bind(("table", Self::table_name()))
            .bind(("id", id.to_owned()))
            .bind(("workspace_id", workspace_id.to_owned()))
            .bind(("status", outcome.status))
            .bind(("outputs", outcome.outputs))
            .bind(("retrieval_queries", outcome.retrieval_queries))
            .bind((
                "retrieved_evidence_ids",
                outcome.retrieved_evidence_ids,
            ))
            .bind(("reasoning_trace", outcome.reasoning_trace))
            .bind(("tool_calls", outcome.tool_calls))
            .bind(("abstention_reason", outcome.abstention_reason))
            .bind(("total_tokens", outcome.total_tokens))
            .bind(("total_cost", outcome.total_cost))
            .bind(("latency_ms", outcome.latency_ms))
            .await?;

        let updated: Vec<Self> = response.take(0)?;
        updated.into_iter().next().ok_or_else(|| {
            AppError::Conflict("run is not in the running state".to_string())
        })
    }

    /// Number of runs started today for one agent; feeds the runs/day quota.
    pub async fn count_started_since(
        db: &SurrealDbClient,
        workspace_id: &str,
        agent_definition_id: &str,
        since: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        #[derive(Deserialize)]
        struct Row {
            count: u64,
        }

        let mut response = db
            .query(
                "SELECT count() AS count FROM type::table($table)
                 WHERE workspace_id = $workspace_id
                   AND agent_definition_id = $agent_definition_id
                   AND started_at >= $since
                 GROUP ALL;",
            )
            .bind(("table", Self::table_name()))
            .bind(("workspace_id", workspace_id.to_owned()))
            .bind(("agent_definition_id", agent_definition_id.to_owned()))
            .bind(("since", surrealdb::sql::Datetime::from(since)))
            .await?;

        let rows: Vec<Row> = response.take(0).unwrap_or_default();
        Ok(rows.first().map_or(0, |r| r.count))
    }

    /// Summed run cost since `since`; feeds the cost/day quota.
    pub async fn cost_since(
        db: &SurrealDbClient,
        workspace_id: &str,
        agent_definition_id: &str,
        since: DateTime<Utc>,
    ) -> Result<f64, AppError> {
        #[derive(Deserialize)]
        struct Row {
            total: f64,
        }

        let mut response = db
            .query(
                "SELECT math::sum(total_cost) AS total FROM type::table($table)
                 WHERE workspace_id = $workspace_id
                   AND agent_definition_id = $agent_definition_id
                   AND started_at >= $since
                   AND total_cost != NONE
                 GROUP ALL;",
            )
            .bind(("table", Self::table_name()))
            .bind(("workspace_id", workspace_id.to_owned()))
            .bind(("agent_definition_id", agent_definition_id.to_owned()))
            .bind(("since", surrealdb::sql::Datetime::from(since)))
            .await?;

        let rows: Vec<Row> = response.take(0).unwrap_or_default();
        Ok(rows.first().map_or(0.0, |r| r.total))
    }
}
