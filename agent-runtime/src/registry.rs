use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::instrument;

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{
            audit_event::{ActorType, AuditEvent, AuditOutcome},
            tool_definition::ToolDefinition,
        },
    },
};

/// Grants every permission; used for system-triggered executions.
pub const PERMISSION_WILDCARD: &str = "*";

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("tool '{0}' is already registered")]
    AlreadyRegistered(String),
    #[error("tool '{0}' is not registered")]
    NotRegistered(String),
    #[error("invalid parameter '{field}': {message}")]
    Validation { field: String, message: String },
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("tool execution failed: {0}")]
    ExecutionFailed(String),
}

impl From<ToolError> for AppError {
    fn from(err: ToolError) -> Self {
        match err {
            ToolError::AlreadyRegistered(name) => {
                AppError::Conflict(format!("tool '{name}' is already registered"))
            }
            ToolError::NotRegistered(name) => {
                AppError::NotFound(format!("tool '{name}' is not registered"))
            }
            ToolError::Validation { field, message } => AppError::InvalidField { field, message },
            ToolError::PermissionDenied(message) => AppError::PermissionDenied(message),
            ToolError::ExecutionFailed(message) => {
                AppError::InternalError(format!("tool execution failed: {message}"))
            }
        }
    }
}

/// Per-invocation context handed to executors. Carries the tenant scope the
/// executor must honor; executors never see foreign workspaces.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub workspace_id: String,
    pub user_id: String,
    pub actor_id: String,
    pub actor_type: ActorType,
    pub permissions: Vec<String>,
    pub trace_id: Option<String>,
}

impl ToolContext {
    pub fn for_user(workspace_id: &str, user_id: &str, permissions: Vec<String>) -> Self {
        Self {
            workspace_id: workspace_id.to_string(),
            user_id: user_id.to_string(),
            actor_id: user_id.to_string(),
            actor_type: ActorType::User,
            permissions,
            trace_id: None,
        }
    }

    pub fn for_agent(workspace_id: &str, agent_id: &str, trace_id: &str) -> Self {
        Self {
            workspace_id: workspace_id.to_string(),
            user_id: agent_id.to_string(),
            actor_id: agent_id.to_string(),
            actor_type: ActorType::Agent,
            permissions: vec![PERMISSION_WILDCARD.to_string()],
            trace_id: Some(trace_id.to_string()),
        }
    }

    fn has_permission(&self, required: &str) -> bool {
        self.permissions
            .iter()
            .any(|granted| granted == PERMISSION_WILDCARD || granted == required)
    }
}

#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, ctx: &ToolContext, params: Value) -> Result<Value, ToolError>;
}

/// Two layers: persisted, tenant-scoped definitions and a process-local
/// dispatch table. The table is populated at startup and read-only after.
pub struct ToolRegistry {
    db: Arc<SurrealDbClient>,
    executors: HashMap<String, Arc<dyn ToolExecutor>>,
}

impl ToolRegistry {
    pub fn new(db: Arc<SurrealDbClient>) -> Self {
        Self {
            db,
            executors: HashMap::new(),
        }
    }

    pub fn register(
        &mut self,
        name: &str,
        executor: Arc<dyn ToolExecutor>,
    ) -> Result<(), ToolError> {
        if self.executors.contains_key(name) {
            return Err(ToolError::AlreadyRegistered(name.to_string()));
        }
        self.executors.insert(name.to_string(), executor);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn ToolExecutor>, ToolError> {
        self.executors
            .get(name)
            .cloned()
            .ok_or_else(|| ToolError::NotRegistered(name.to_string()))
    }

    /// Validates the JSON-shape description and stores the definition.
    pub async fn create_definition(
        &self,
        workspace_id: &str,
        name: &str,
        description: &str,
        input_schema: Value,
        required_permissions: Vec<String>,
    ) -> Result<ToolDefinition, AppError> {
        validate_schema(&input_schema).map_err(AppError::from)?;

        ToolDefinition::insert(
            &self.db,
            ToolDefinition::new(
                workspace_id.to_string(),
                name.to_string(),
                description.to_string(),
                input_schema,
                required_permissions,
            ),
        )
        .await
    }

    pub async fn list_definitions(
        &self,
        workspace_id: &str,
    ) -> Result<Vec<ToolDefinition>, AppError> {
        ToolDefinition::list_active(&self.db, workspace_id).await
    }

    /// Definition lookup → schema validation → permission check → dispatch.
    /// Every attempt is audited, with `denied` and `error` kept distinct.
    #[instrument(skip(self, ctx, params), fields(workspace_id = %ctx.workspace_id, tool = name))]
    pub async fn execute(
        &self,
        ctx: &ToolContext,
        name: &str,
        params: Value,
    ) -> Result<Value, AppError> {
        let result = self.execute_inner(ctx, name, params.clone()).await;

        let (outcome, details) = match &result {
            Ok(_) => (AuditOutcome::Success, serde_json::json!({ "params": params })),
            Err(ToolError::PermissionDenied(message)) => (
                AuditOutcome::Denied,
                serde_json::json!({ "params": params, "reason": message }),
            ),
            Err(err) => (
                AuditOutcome::Error,
                serde_json::json!({ "params": params, "reason": err.to_string() }),
            ),
        };

        let permissions_checked = match ToolDefinition::find_by_name(&self.db, &ctx.workspace_id, name).await {
            Ok(Some(definition)) => definition.required_permissions,
            _ => Vec::new(),
        };

        let mut event = AuditEvent::new(
            &ctx.workspace_id,
            &ctx.actor_id,
            ctx.actor_type,
            format!("tool.{name}"),
            outcome,
        )
        .with_details(details)
        .with_permissions(permissions_checked);
        if let Some(trace_id) = &ctx.trace_id {
            event = event.with_trace(trace_id.clone());
        }
        AuditEvent::log(&self.db, event).await?;

        result.map_err(AppError::from)
    }

    async fn execute_inner(
        &self,
        ctx: &ToolContext,
        name: &str,
        params: Value,
    ) -> Result<Value, ToolError> {
        let definition = ToolDefinition::find_by_name(&self.db, &ctx.workspace_id, name)
            .await
            .map_err(|err| ToolError::ExecutionFailed(err.to_string()))?
            .filter(|definition| definition.is_active)
            .ok_or_else(|| ToolError::NotRegistered(name.to_string()))?;

        validate_params(&definition.input_schema, &params)?;

        for required in &definition.required_permissions {
            if !ctx.has_permission(required) {
                return Err(ToolError::PermissionDenied(format!(
                    "missing permission '{required}'"
                )));
            }
        }

        let executor = self.get(name)?;
        executor.execute(ctx, params).await
    }
}

/// Checks that a definition's input schema is a well-formed JSON-shape
/// description: an object schema whose properties carry known types and
/// whose `required` entries name declared properties.
pub fn validate_schema(schema: &Value) -> Result<(), ToolError> {
    let object = schema.as_object().ok_or_else(|| ToolError::Validation {
        field: "input_schema".to_string(),
        message: "schema must be an object".to_string(),
    })?;

    if object.get("type").and_then(Value::as_str) != Some("object") {
        return Err(ToolError::Validation {
            field: "input_schema.type".to_string(),
            message: "schema type must be 'object'".to_string(),
        });
    }

    let empty = serde_json::Map::new();
    let properties = match object.get("properties") {
        Some(Value::Object(map)) => map,
        Some(_) => {
            return Err(ToolError::Validation {
                field: "input_schema.properties".to_string(),
                message: "properties must be an object".to_string(),
            })
        }
        None => &empty,
    };

    for (name, property) in properties {
        let declared = property
            .as_object()
            .and_then(|p| p.get("type"))
            .and_then(Value::as_str);
        match declared {
            Some("string" | "number" | "integer" | "boolean" | "object" | "array") => {}
            _ => {
                return Err(ToolError::Validation {
                    field: format!("input_schema.properties.{name}"),
                    message: "property must declare a known type".to_string(),
                })
            }
        }
    }

    if let Some(required) = object.get("required") {
        let required = required.as_array().ok_or_else(|| ToolError::Validation {
            field: "input_schema.required".to_string(),
            message: "required must be an array".to_string(),
        })?;
        for entry in required {
            let name = entry.as_str().ok_or_else(|| ToolError::Validation {
                field: "input_schema.required".to_string(),
                message: "required entries must be strings".to_string(),
            })?;
            if !properties.contains_key(name) {
                return Err(ToolError::Validation {
                    field: "input_schema.required".to_string(),
                    message: format!("required field '{name}' is not declared"),
                });
            }
        }
    }

    Ok(())
}

/// Validates call params against a definition schema: required fields,
/// per-property types and `additionalProperties: false`.
pub fn validate_params(schema: &Value, params: &Value) -> Result<(), ToolError> {
    let params_object = params.as_object().ok_or_else(|| ToolError::Validation {
        field: "params".to_string(),
        message: "params must be an object".to_string(),
    })?;

    let empty = serde_json::Map::new();
    let properties = schema
        .get("properties")
        .and_then(Value::as_object)
        .unwrap_or(&empty);

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for entry in required {
            let name = entry.as_str().unwrap_or_default();
            if !params_object.contains_key(name) {
                return Err(ToolError::Validation {
                    field: name.to_string(),
                    message: "required field is missing".to_string(),
                });
            }
        }
    }

    for (name, value) in params_object {
        let Some(property) = properties.get(name) else {
            if schema.get("additionalProperties").and_then(Value::as_bool) == Some(false) {
                return Err(ToolError::Validation {
                    field: name.clone(),
                    message: "unknown field".to_string(),
                });
            }
            continue;
        };

        let expected = property.get("type").and_then(Value::as_str).unwrap_or("");
        let matches = match expected {
            "string" => value.is_string(),
            "number" => value.is_number(),
            "integer" => value.is_i64() || value.is_u64(),
            "boolean" => value.is_boolean(),
            "object" => value.is_object(),
            "array" => value.is_array(),
            _ => true,
        };
        if !matches {
            return Err(ToolError::Validation {
                field: name.clone(),
                message: format!("expected {expected}"),
            });
        }
    }

    Ok(())
}
