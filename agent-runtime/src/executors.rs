use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use common::{
    error::AppError,
    records::RecordStore,
    storage::{
        db::SurrealDbClient,
        types::{
            knowledge_item::SourceType,
            operational_record::{OperationalRecord, RecordEntityType},
        },
    },
};
use ingestion_pipeline::{IngestParams, IngestionService};

use crate::registry::{ToolContext, ToolError, ToolExecutor, ToolRegistry};

fn required_str<'a>(params: &'a Value, field: &str) -> Result<&'a str, ToolError> {
    params
        .get(field)
        .and_then(Value::as_str)
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| ToolError::Validation {
            field: field.to_string(),
            message: "must be a non-empty string".to_string(),
        })
}

fn optional_str<'a>(params: &'a Value, field: &str) -> Option<&'a str> {
    params.get(field).and_then(Value::as_str)
}

async fn load_record(
    records: &RecordStore,
    ctx: &ToolContext,
    id: &str,
    expected: RecordEntityType,
) -> Result<OperationalRecord, ToolError> {
    let record = records
        .get(&ctx.workspace_id, id)
        .await
        .map_err(|err| ToolError::ExecutionFailed(err.to_string()))?
        .filter(|record| record.entity_type == expected)
        .ok_or_else(|| ToolError::Validation {
            field: "id".to_string(),
            message: format!("no {} with id '{id}'", expected.as_str()),
        })?;
    Ok(record)
}

fn store_error(err: AppError) -> ToolError {
    ToolError::ExecutionFailed(err.to_string())
}

/// `create-task`: opens a follow-up task, optionally linked to a case.
///
/// Declares idempotency support: a repeated call with the same
/// `idempotency_key` returns the task created the first time.
pub struct CreateTaskExecutor {
    records: RecordStore,
}

impl CreateTaskExecutor {
    async fn find_by_key(
        &self,
        ctx: &ToolContext,
        key: &str,
    ) -> Result<Option<OperationalRecord>, ToolError> {
        let tasks = self
            .records
            .list(&ctx.workspace_id, RecordEntityType::Task)
            .await
            .map_err(store_error)?;
        Ok(tasks
            .into_iter()
            .find(|task| task.data.get("idempotency_key").and_then(Value::as_str) == Some(key)))
    }
}

#[async_trait]
impl ToolExecutor for CreateTaskExecutor {
    async fn execute(&self, ctx: &ToolContext, params: Value) -> Result<Value, ToolError> {
        let subject = required_str(&params, "subject")?;

        if let Some(key) = optional_str(&params, "idempotency_key") {
            if let Some(existing) = self.find_by_key(ctx, key).await? {
                return Ok(json!({ "task_id": existing.id, "status": existing.status }));
            }
        }

        let mut data = json!({
            "description": optional_str(&params, "description").unwrap_or_default(),
            "created_by": ctx.actor_id,
        });
        if let Some(case_id) = optional_str(&params, "case_id") {
            data["case_id"] = Value::String(case_id.to_string());
        }
        if let Some(key) = optional_str(&params, "idempotency_key") {
            data["idempotency_key"] = Value::String(key.to_string());
        }

        let task = self
            .records
            .create(
                &ctx.workspace_id,
                RecordEntityType::Task,
                subject.to_string(),
                "open".to_string(),
                data,
            )
            .await
            .map_err(store_error)?;

        Ok(json!({ "task_id": task.id, "status": task.status }))
    }
}

/// `update-case`: transitions a case and records the resolution text.
pub struct UpdateCaseExecutor {
    records: RecordStore,
}

#[async_trait]
impl ToolExecutor for UpdateCaseExecutor {
    async fn execute(&self, ctx: &ToolContext, params: Value) -> Result<Value, ToolError> {
        let case_id = required_str(&params, "case_id")?;
        let case = load_record(&self.records, ctx, case_id, RecordEntityType::Case).await?;

        let status = optional_str(&params, "status").unwrap_or(&case.status).to_string();
        let mut data = case.data.clone();
        if let Some(resolution) = optional_str(&params, "resolution") {
            if !data.is_object() {
                data = json!({});
            }
            data["resolution"] = Value::String(resolution.to_string());
        }

        let updated = self
            .records
            .update(
                &ctx.workspace_id,
                case_id,
                None,
                Some(status),
                Some(data),
            )
            .await
            .map_err(store_error)?;

        Ok(json!({ "case_id": updated.id, "status": updated.status }))
    }
}

/// `send-reply`: appends a reply note to a case.
pub struct SendReplyExecutor {
    records: RecordStore,
}

#[async_trait]
impl ToolExecutor for SendReplyExecutor {
    async fn execute(&self, ctx: &ToolContext, params: Value) -> Result<Value, ToolError> {
        let case_id = required_str(&params, "case_id")?;
        let body = required_str(&params, "body")?;
        let case = load_record(&self.records, ctx, case_id, RecordEntityType::Case).await?;

        let note = self
            .records
            .create(
                &ctx.workspace_id,
                RecordEntityType::Note,
                format!("Reply: {}", case.subject),
                "sent".to_string(),
                json!({ "case_id": case_id, "body": body, "author": ctx.actor_id }),
            )
            .await
            .map_err(store_error)?;

        Ok(json!({ "note_id": note.id, "case_id": case_id }))
    }
}

/// `get-lead` / `get-account`: compact read of one record.
pub struct GetRecordExecutor {
    records: RecordStore,
    entity_type: RecordEntityType,
    id_field: &'static str,
}

#[async_trait]
impl ToolExecutor for GetRecordExecutor {
    async fn execute(&self, ctx: &ToolContext, params: Value) -> Result<Value, ToolError> {
        let id = required_str(&params, self.id_field)?;
        let record = load_record(&self.records, ctx, id, self.entity_type).await?;

        Ok(json!({
            "id": record.id,
            "subject": record.subject,
            "status": record.status,
            "data": record.data,
            "updated_at": record.updated_at.to_rfc3339(),
        }))
    }
}

/// `create-knowledge-item`: pushes content through the ingest pipeline.
pub struct CreateKnowledgeItemExecutor {
    ingestion: IngestionService,
}

#[async_trait]
impl ToolExecutor for CreateKnowledgeItemExecutor {
    async fn execute(&self, ctx: &ToolContext, params: Value) -> Result<Value, ToolError> {
        let title = required_str(&params, "title")?;
        let content = required_str(&params, "content")?;

        let item = self
            .ingestion
            .ingest(IngestParams {
                workspace_id: ctx.workspace_id.clone(),
                source_type: SourceType::KbArticle,
                title: title.to_string(),
                raw_content: content.to_string(),
                entity_type: None,
                entity_id: None,
                metadata: Some(json!({ "created_by": ctx.actor_id })),
            })
            .await
            .map_err(store_error)?;

        Ok(json!({ "knowledge_item_id": item.id, "title": item.title }))
    }
}

/// `update-knowledge-item`: edits and re-chunks an existing item.
pub struct UpdateKnowledgeItemExecutor {
    ingestion: IngestionService,
}

#[async_trait]
impl ToolExecutor for UpdateKnowledgeItemExecutor {
    async fn execute(&self, ctx: &ToolContext, params: Value) -> Result<Value, ToolError> {
        let id = required_str(&params, "knowledge_item_id")?;
        let title = optional_str(&params, "title").map(str::to_string);
        let content = optional_str(&params, "content").map(str::to_string);

        if title.is_none() && content.is_none() {
            return Err(ToolError::Validation {
                field: "content".to_string(),
                message: "nothing to update".to_string(),
            });
        }

        let item = self
            .ingestion
            .update_item(&ctx.workspace_id, id, title, content)
            .await
            .map_err(|err| match err {
                AppError::NotFound(message) => ToolError::Validation {
                    field: "knowledge_item_id".to_string(),
                    message,
                },
                other => store_error(other),
            })?;

        Ok(json!({ "knowledge_item_id": item.id, "title": item.title }))
    }
}

/// `query-metrics`: small read-only aggregates for one workspace.
pub struct QueryMetricsExecutor {
    db: Arc<SurrealDbClient>,
}

#[async_trait]
impl ToolExecutor for QueryMetricsExecutor {
    async fn execute(&self, ctx: &ToolContext, params: Value) -> Result<Value, ToolError> {
        let metric = required_str(&params, "metric")?;
        let (table, extra) = match metric {
            "knowledge_items" => ("knowledge_item", " AND deleted_at = NONE"),
            "open_cases" => ("operational_record", " AND entity_type = 'case' AND status = 'open' AND deleted_at = NONE"),
            "agent_runs" => ("agent_run", ""),
            other => {
                return Err(ToolError::Validation {
                    field: "metric".to_string(),
                    message: format!("unknown metric '{other}'"),
                })
            }
        };

        #[derive(serde::Deserialize)]
        struct Row {
            count: u64,
        }

        let sql = format!(
            "SELECT count() AS count FROM {table} WHERE workspace_id = $workspace_id{extra} GROUP ALL;"
        );
        let mut response = self
            .db
            .query(sql)
            .bind(("workspace_id", ctx.workspace_id.clone()))
            .await
            .map_err(|err| ToolError::ExecutionFailed(err.to_string()))?;
        let rows: Vec<Row> = response.take(0).unwrap_or_default();

        Ok(json!({ "metric": metric, "value": rows.first().map_or(0, |r| r.count) }))
    }
}

fn object_schema(required: &[&str], properties: Value) -> Value {
    json!({
        "type": "object",
        "required": required,
        "properties": properties,
        "additionalProperties": false
    })
}

/// Schema-bearing definitions for every built-in tool, ready to insert for a
/// workspace.
pub fn builtin_definitions() -> Vec<(&'static str, &'static str, Value, Vec<String>)> {
    vec![
        (
            "create-task",
            "Create a follow-up task, optionally linked to a case",
            object_schema(
                &["subject"],
                json!({
                    "subject": { "type": "string" },
                    "description": { "type": "string" },
                    "case_id": { "type": "string" },
                    "idempotency_key": { "type": "string" }
                }),
            ),
            vec!["task:write".to_string()],
        ),
        (
            "update-case",
            "Update a case's status and resolution",
            object_schema(
                &["case_id"],
                json!({
                    "case_id": { "type": "string" },
                    "status": { "type": "string" },
                    "resolution": { "type": "string" }
                }),
            ),
            vec!["case:write".to_string()],
        ),
        (
            "send-reply",
            "Append a reply note to a case",
            object_schema(
                &["case_id", "body"],
                json!({
                    "case_id": { "type": "string" },
                    "body": { "type": "string" }
                }),
            ),
            vec!["case:write".to_string()],
        ),
        (
            "get-lead",
            "Fetch a lead record",
            object_schema(&["lead_id"], json!({ "lead_id": { "type": "string" } })),
            vec!["lead:read".to_string()],
        ),
        (
            "get-account",
            "Fetch an account record",
            object_schema(&["account_id"], json!({ "account_id": { "type": "string" } })),
            vec!["account:read".to_string()],
        ),
        (
            "create-knowledge-item",
            "Ingest new knowledge content",
            object_schema(
                &["title", "content"],
                json!({
                    "title": { "type": "string" },
                    "content": { "type": "string" }
                }),
            ),
            vec!["knowledge:write".to_string()],
        ),
        (
            "update-knowledge-item",
            "Edit and re-chunk an existing knowledge item",
            object_schema(
                &["knowledge_item_id"],
                json!({
                    "knowledge_item_id": { "type": "string" },
                    "title": { "type": "string" },
                    "content": { "type": "string" }
                }),
            ),
            vec!["knowledge:write".to_string()],
        ),
        (
            "query-metrics",
            "Read workspace-level aggregates",
            object_schema(&["metric"], json!({ "metric": { "type": "string" } })),
            vec!["metrics:read".to_string()],
        ),
    ]
}

/// Registers every built-in executor into the dispatch table. Called once at
/// startup, before the registry is shared.
pub fn register_builtin_executors(
    registry: &mut ToolRegistry,
    records: RecordStore,
    ingestion: IngestionService,
    db: Arc<SurrealDbClient>,
) -> Result<(), ToolError> {
    registry.register(
        "create-task",
        Arc::new(CreateTaskExecutor {
            records: records.clone(),
        }),
    )?;
    registry.register(
        "update-case",
        Arc::new(UpdateCaseExecutor {
            records: records.clone(),
        }),
    )?;
    registry.register(
        "send-reply",
        Arc::new(SendReplyExecutor {
            records: records.clone(),
        }),
    )?;
    registry.register(
        "get-lead",
        Arc::new(GetRecordExecutor {
            records: records.clone(),
            entity_type: RecordEntityType::Lead,
            id_field: "lead_id",
        }),
    )?;
    registry.register(
        "get-account",
        Arc::new(GetRecordExecutor {
            records,
            entity_type: RecordEntityType::Account,
            id_field: "account_id",
        }),
    )?;
    registry.register(
        "create-knowledge-item",
        Arc::new(CreateKnowledgeItemExecutor {
            ingestion: ingestion.clone(),
        }),
    )?;
    registry.register(
        "update-knowledge-item",
        Arc::new(UpdateKnowledgeItemExecutor { ingestion }),
    )?;
    registry.register("query-metrics", Arc::new(QueryMetricsExecutor { db }))?;

    Ok(())
}

/// Inserts any missing built-in definitions for a workspace. Idempotent.
pub async fn ensure_builtin_definitions(
    registry: &ToolRegistry,
    db: &SurrealDbClient,
    workspace_id: &str,
) -> Result<(), AppError> {
    use common::storage::types::tool_definition::ToolDefinition;

    for (name, description, schema, permissions) in builtin_definitions() {
        if ToolDefinition::find_by_name(db, workspace_id, name)
            .await?
            .is_none()
        {
            registry
                .create_definition(workspace_id, name, description, schema, permissions)
                .await?;
        }
    }

    Ok(())
}
