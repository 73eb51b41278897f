use std::collections::HashMap;

use serde_json::Value;
use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Active,
    Paused,
    Archived,
}

/// Quota keys understood by the orchestrator. Values live in `limits`.
pub const LIMIT_MAX_RUNS_PER_DAY: &str = "max_runs_per_day";
pub const LIMIT_MAX_COST_PER_DAY: &str = "max_cost_per_day";

stored_object!(AgentDefinition, "agent_definition", {
    workspace_id: String,
    name: String,
    agent_type: String,
    #[serde(default)]
    objective: Value,
    allowed_tools: Vec<String>,
    limits: HashMap<String, f64>,
    #[serde(default)]
    trigger_config: Value,
    active_prompt_version_id: Option<String>,
    status: AgentStatus
});

impl AgentDefinition {
    pub fn new(
        workspace_id: String,
        name: String,
        agent_type: String,
        objective: Value,
        allowed_tools: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7().to_string(),
            created_at: now,
            updated_at: now,
            workspace_id,
            name,
            agent_type,
            objective,
            allowed_tools,
            limits: HashMap::new(),
            trigger_config: Value::Null,
            active_prompt_version_id: None,
            status: AgentStatus::Active,
        }
    }

    pub fn with_limit(mut self, key: &str, value: f64) -> Self {
        self.limits.insert(key.to_string(), value);
        self
    }

    pub async fn get_scoped(
        db: &SurrealDbClient,
        workspace_id: &str,
        id: &str,
    ) -> Result<Option<Self>, AppError> {
        let agent: Option<Self> = db.get_item(id).await?;
        Ok(agent.filter(|agent| agent.workspace_id == workspace_id))
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    async fn setup_db() -> SurrealDbClient {
        let db = SurrealDbClient::memory("test_ns", &Uuid::now_v7().to_string())
            .await
            .expect("Failed to start in-memory surrealdb");
        db.apply_migrations().await.expect("migrations");
        db
    }

    #[tokio::test]
    async fn new_agents_start_active_with_empty_limits() {
        let agent = AgentDefinition::new(
            "ws_1".into(),
            "support-triage".into(),
            "support".into(),
            Value::Null,
            vec!["update-case".into()],
        );

        assert_eq!(agent.status, AgentStatus::Active);
        assert!(agent.limits.is_empty());
        assert!(agent.active_prompt_version_id.is_none());
    }

    #[tokio::test]
    async fn get_scoped_checks_the_workspace() {
        let db = setup_db().await;
        let agent = AgentDefinition::new(
            "ws_1".into(),
            "support-triage".into(),
            "support".into(),
            Value::Null,
            vec![],
        );
        db.store_item(agent.clone()).await.expect("store");

        assert!(AgentDefinition::get_scoped(&db, "ws_1", &agent.id)
            .await
            .expect("get")
            .is_some());
        assert!(AgentDefinition::get_scoped(&db, "ws_2", &agent.id)
            .await
            .expect("get")
            .is_none());
    }

    #[tokio::test]
    async fn limits_accumulate_through_the_builder() {
        let agent = AgentDefinition::new(
            "ws_1".into(),
            "support-triage".into(),
            "support".into(),
            Value::Null,
            vec![],
        )
        .with_limit(LIMIT_MAX_RUNS_PER_DAY, 20.0)
        .with_limit(LIMIT_MAX_COST_PER_DAY, 5.0);

        assert_eq!(agent.limits.get(LIMIT_MAX_RUNS_PER_DAY), Some(&20.0));
        assert_eq!(agent.limits.get(LIMIT_MAX_COST_PER_DAY), Some(&5.0));
    }
}
