use serde_json::Value;
use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptStatus {
    Draft,
    Testing,
    Active,
    Archived,
}

stored_object!(PromptVersion, "prompt_version", {
    workspace_id: String,
    agent_definition_id: String,
    version_number: u32,
    system_prompt: String,
    user_prompt_template: Option<String>,
    config: Value,
    status: PromptStatus,
    #[serde(
        serialize_with = "serialize_option_datetime",
        deserialize_with = "deserialize_option_datetime",
        default
    )]
    activated_at: Option<DateTime<Utc>>
});

impl PromptVersion {
    /// Creates the next version for an agent; `version_number` is monotonic
    /// per (workspace, agent).
    pub async fn create(
        db: &SurrealDbClient,
        workspace_id: &str,
        agent_definition_id: &str,
        system_prompt: String,
        user_prompt_template: Option<String>,
        config: Value,
    ) -> Result<Self, AppError> {
        #[derive(Deserialize)]
        struct Row {
            highest: u32,
        }

        let mut response = db
            .query(
                "SELECT math::max(version_number) AS highest FROM type::table($table)
                 WHERE workspace_id = $workspace_id
                   AND agent_definition_id = $agent_definition_id
                 GROUP ALL;",
            )
            .bind(("table", Self::table_name()))
            .bind(("workspace_id", workspace_id.to_owned()))
            .bind(("agent_definition_id", agent_definition_id.to_owned()))
            .await?;
        let rows: Vec<Row> = response.take(0).unwrap_or_default();
        let next_number = rows.first().map_or(1, |r| r.highest.saturating_add(1));

        let now = Utc::now();
        let version = Self {
            id: Uuid::now_v7().to_string(),
            created_at: now,
            updated_at: now,
            workspace_id: workspace_id.to_string(),
            agent_definition_id: agent_definition_id.to_string(),
            version_number: next_number,
            system_prompt,
            user_prompt_template,
            config,
            status: PromptStatus::Draft,
            activated_at: None,
        };

        db.store_item(version.clone()).await?;
        Ok(version)
    }

    pub async fn get_scoped(
        db: &SurrealDbClient,
        workspace_id: &str,
        id: &str,
    ) -> Result<Option<Self>, AppError> {
        let version: Option<Self> = db.get_item(id).await?;
        Ok(version.filter(|v| v.workspace_id == workspace_id))
    }

    pub async fn list_for_agent(
        db: &SurrealDbClient,
        workspace_id: &str,
        agent_definition_id: &str,
    ) -> Result<Vec<Self>, AppError> {
        let mut response = db
            .query(
                "SELECT * FROM type::table($table)
                 WHERE workspace_id = $workspace_id
                   AND agent_definition_id = $agent_definition_id
                 ORDER BY version_number ASC;",
            )
            .bind(("table", Self::table_name()))
            .bind(("workspace_id", workspace_id.to_owned()))
            .bind(("agent_definition_id", agent_definition_id.to_owned()))
            .await?;

        Ok(response.take(0)?)
    }

    pub async fn get_active(
        db: &SurrealDbClient,
        workspace_id: &str,
        agent_definition_id: &str,
    ) -> Result<Option<Self>, AppError> {
        let mut response = db
            .query(
                "SELECT * FROM type::table($table)
                 WHERE workspace_id = $workspace_id
                   AND agent_definition_id = $agent_definition_id
                   AND status = 'active'
                 LIMIT 1;",
            )
            .bind(("table", Self::table_name()))
            .bind(("workspace_id", workspace_id.to_owned()))
            .bind(("agent_definition_id", agent_definition_id.to_owned()))
            .await?;

        let versions: Vec<Self> = response.take(0)?;
        Ok(versions.into_iter().next())
    }

    /// Activates `version_id`, archiving whichever version is currently
    /// active for the same agent, in one transaction.
    ///
    /// A version that was archived without ever having been deployed cannot
    /// be promoted; versions archived by a later promote or a rollback keep
    /// their `activated_at` and may be re-promoted.
    pub async fn promote(
        db: &SurrealDbClient,
        workspace_id: &str,
        version_id: &str,
    ) -> Result<Self, AppError> {
        let target = Self::get_scoped(db, workspace_id, version_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("prompt version {version_id}")))?;

        if target.status == PromptStatus::Active {
            return Err(AppError::Conflict(
                "prompt version is already active".to_string(),
            ));
        }
        if target.status == PromptStatus::Archived && target.activated_at.is_none() {
            return Err(AppError::Conflict(
                "an archived prompt version cannot be promoted".to_string(),
            ));
        }

        db.client
            .query("BEGIN TRANSACTION;")
            .query(format!(
                "UPDATE {table}
                 SET status = 'archived', updated_at = time::now()
                 WHERE workspace_id = $workspace_id
                   AND agent_definition_id = $agent_definition_id
                   AND status = 'active';",
                table = Self::table_name(),
            ))
            .query(format!(
                "UPDATE type::thing('{table}', $version_id)
                 SET status = 'active', activated_at = time::now(), updated_at = time::now();",
                table = Self::table_name(),
            ))
            .query(
                "UPDATE type::thing('agent_definition', $agent_definition_id)
                 SET active_prompt_version_id = $version_id, updated_at = time::now();",
            )
            .query("COMMIT TRANSACTION;")
            .bind(("workspace_id", workspace_id.to_owned()))
            .bind(("agent_definition_id", target.agent_definition_id.clone()))
            .bind(("version_id", version_id.to_owned()))
            .await?
            .check()?;

        Self::get_scoped(db, workspace_id, version_id)
            .await?
            .ok_or_else(|| AppError::InternalError("promoted version vanished".to_string()))
    }

    /// Re-activates the most recently archived version and archives the
    /// current active one. Fails when there is nothing to roll back to.
    pub async fn rollback(
        db: &SurrealDbClient,
        workspace_id: &str,
        agent_definition_id: &str,
    ) -> Result<Self, AppError> {
        let mut response = db
            .query(
                "SELECT * FROM type::table($table)
                 WHERE workspace_id = $workspace_id
                   AND agent_definition_id = $agent_definition_id
                   AND status = 'archived'
                   AND activated_at != NONE
                 ORDER BY updated_at DESC
                 LIMIT 1;",
            )
            .bind(("table", Self::table_name()))
            .bind(("workspace_id", workspace_id.to_owned()))
            .bind(("agent_definition_id", agent_definition_id.to_owned()))
            .await?;
        let candidates: Vec<Self> = response.take(0)?;
        let target = candidates.into_iter().next().ok_or_else(|| {
            AppError::Conflict("no archived prompt version to roll back to".to_string())
        })?;

        Self::promote(db, workspace_id, &target.id).await
    }
}
