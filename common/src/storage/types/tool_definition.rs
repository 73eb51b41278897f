use serde_json::Value;
use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

stored_object!(ToolDefinition, "tool_definition", {
    workspace_id: String,
    name: String,
    description: String,
    input_schema: Value,
    required_permissions: Vec<String>,
    is_active: bool
});

impl ToolDefinition {
    pub fn new(
        workspace_id: String,
        name: String,
        description: String,
        input_schema: Value,
        required_permissions: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7().to_string(),
            created_at: now,
            updated_at: now,
            workspace_id,
            name,
            description,
            input_schema,
            required_permissions,
            is_active: true,
        }
    }

    /// Inserts the definition; the unique (workspace_id, name) index turns a
    /// duplicate into a conflict.
    pub async fn insert(db: &SurrealDbClient, definition: Self) -> Result<Self, AppError> {
        let name = definition.name.clone();
        match db.store_item(definition).await {
            Ok(Some(created)) => Ok(created),
            Ok(None) => Err(AppError::InternalError(
                "tool definition insert returned nothing".to_string(),
            )),
            Err(err) if err.to_string().contains("already contains") => Err(AppError::Conflict(
                format!("tool '{name}' already exists in this workspace"),
            )),
            Err(err) => Err(AppError::Database(err)),
        }
    }

    pub async fn find_by_name(
        db: &SurrealDbClient,
        workspace_id: &str,
        name: &str,
    ) -> Result<Option<Self>, AppError> {
        let mut response = db
            .query(
                "SELECT * FROM type::table($table)
                 WHERE workspace_id = $workspace_id
                   AND name = $name
                 LIMIT 1;",
            )
            .bind(("table", Self::table_name()))
            .bind(("workspace_id", workspace_id.to_owned()))
            .bind(("name", name.to_owned()))
            .await?;

        let definitions: Vec<Self> = response.take(0)?;
        Ok(definitions.into_iter().next())
    }

    pub async fn list_active(
        db: &SurrealDbClient,
        workspace_id: &str,
    ) -> Result<Vec<Self>, AppError> {
        let mut response = db
            .query(
                "SELECT * FROM type::table($table)
                 WHERE workspace_id = $workspace_id
                   AND is_active = true
                 ORDER BY name ASC;",
            )
            .bind(("table", Self::table_name()))
            .bind(("workspace_id", workspace_id.to_owned()))
            .await?;

        Ok(response.take(0)?)
    }
}
