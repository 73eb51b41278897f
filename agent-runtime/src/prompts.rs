use std::sync::Arc;

use serde_json::{json, Value};

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{
            audit_event::{ActorType, AuditEvent, AuditOutcome},
            prompt_version::{PromptStatus, PromptVersion},
            StoredObject,
        },
    },
};

/// Prompt versioning under the orchestrator's management. Transitions go
/// through `promote`/`rollback`; the direct update surface refuses to
/// activate a version on its own.
pub struct PromptManager {
    db: Arc<SurrealDbClient>,
}

impl PromptManager {
    pub fn new(db: Arc<SurrealDbClient>) -> Self {
        Self { db }
    }

    pub async fn create_version(
        &self,
        workspace_id: &str,
        actor_id: &str,
        agent_definition_id: &str,
        system_prompt: String,
        user_prompt_template: Option<String>,
        config: Value,
    ) -> Result<PromptVersion, AppError> {
        if system_prompt.trim().is_empty() {
            return Err(AppError::InvalidField {
                field: "system_prompt".to_string(),
                message: "system prompt must not be empty".to_string(),
            });
        }

        let version = PromptVersion::create(
            &self.db,
            workspace_id,
            agent_definition_id,
            system_prompt,
            user_prompt_template,
            config,
        )
        .await?;

        self.audit(
            workspace_id,
            actor_id,
            "prompt.create",
            &version.id,
            json!({ "version_number": version.version_number }),
        )
        .await?;

        Ok(version)
    }

    pub async fn list_versions(
        &self,
        workspace_id: &str,
        agent_definition_id: &str,
    ) -> Result<Vec<PromptVersion>, AppError> {
        PromptVersion::list_for_agent(&self.db, workspace_id, agent_definition_id).await
    }

    /// Edits a draft or testing version. Setting `status = active` directly
    /// is refused; promotion is the only activation path.
    pub async fn update_version(
        &self,
        workspace_id: &str,
        actor_id: &str,
        version_id: &str,
        system_prompt: Option<String>,
        user_prompt_template: Option<Option<String>>,
        status: Option<PromptStatus>,
    ) -> Result<PromptVersion, AppError> {
        let mut version = PromptVersion::get_scoped(&self.db, workspace_id, version_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("prompt version {version_id}")))?;

        if let Some(status) = status {
            match status {
                PromptStatus::Active => {
                    return Err(AppError::Conflict(
                        "versions are activated through promote, not direct update".to_string(),
                    ))
                }
                PromptStatus::Draft | PromptStatus::Testing | PromptStatus::Archived => {
                    if version.status == PromptStatus::Active {
                        return Err(AppError::Conflict(
                            "demote the active version with promote or rollback".to_string(),
                        ));
                    }
                    version.status = status;
                }
            }
        }

        if system_prompt.is_some() || user_prompt_template.is_some() {
            if !matches!(version.status, PromptStatus::Draft | PromptStatus::Testing) {
                return Err(AppError::Conflict(
                    "only draft and testing versions are editable".to_string(),
                ));
            }
            if let Some(system_prompt) = system_prompt {
                version.system_prompt = system_prompt;
            }
            if let Some(user_prompt_template) = user_prompt_template {
                version.user_prompt_template = user_prompt_template;
            }
        }

        version.updated_at = chrono::Utc::now();
        self.db
            .query(
                "UPDATE type::thing($table, $id)
                 CONTENT $version
                 WHERE workspace_id = $workspace_id;",
            )
            .bind(("table", PromptVersion::table_name()))
            .bind(("id", version.id.clone()))
            .bind(("workspace_id", workspace_id.to_owned()))
            .bind(("version", version.clone()))
            .await?
            .check()?;

        self.audit(
            workspace_id,
            actor_id,
            "prompt.update",
            &version.id,
            json!({ "status": version.status }),
        )
        .await?;

        Ok(version)
    }

    pub async fn promote(
        &self,
        workspace_id: &str,
        actor_id: &str,
        version_id: &str,
    ) -> Result<PromptVersion, AppError> {
        let promoted = PromptVersion::promote(&self.db, workspace_id, version_id).await?;

        self.audit(
            workspace_id,
            actor_id,
            "prompt.promote",
            &promoted.id,
            json!({ "version_number": promoted.version_number }),
        )
        .await?;

        Ok(promoted)
    }

    pub async fn rollback(
        &self,
        workspace_id: &str,
        actor_id: &str,
        agent_definition_id: &str,
    ) -> Result<PromptVersion, AppError> {
        let restored = PromptVersion::rollback(&self.db, workspace_id, agent_definition_id).await?;

        self.audit(
            workspace_id,
            actor_id,
            "prompt.rollback",
            &restored.id,
            json!({ "version_number": restored.version_number }),
        )
        .await?;

        Ok(restored)
    }

    async fn audit(
        &self,
        workspace_id: &str,
        actor_id: &str,
        action: &str,
        version_id: &str,
        details: Value,
    ) -> Result<(), AppError> {
        AuditEvent::log(
            &self.db,
            AuditEvent::new(workspace_id, actor_id, ActorType::User, action, AuditOutcome::Success)
                .with_entity("prompt_version", version_id)
                .with_details(details),
        )
        .await
    }
}
