use serde_json::Value;
use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorType {
    User,
    Agent,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Success,
    Denied,
    Error,
}

stored_object!(AuditEvent, "audit_event", {
    workspace_id: String,
    actor_id: String,
    actor_type: ActorType,
    action: String,
    entity_type: Option<String>,
    entity_id: Option<String>,
    #[serde(default)]
    details: Value,
    permissions_checked: Vec<String>,
    outcome: AuditOutcome,
    trace_id: Option<String>,
    ip_address: Option<String>,
    user_agent: Option<String>
});

impl AuditEvent {
    pub fn new(
        workspace_id: impl Into<String>,
        actor_id: impl Into<String>,
        actor_type: ActorType,
        action: impl Into<String>,
        outcome: AuditOutcome,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7().to_string(),
            created_at: now,
            updated_at: now,
            workspace_id: workspace_id.into(),
            actor_id: actor_id.into(),
            actor_type,
            action: action.into(),
            entity_type: None,
            entity_id: None,
            details: Value::Null,
            permissions_checked: Vec::new(),
            outcome,
            trace_id: None,
            ip_address: None,
            user_agent: None,
        }
    }

    pub fn with_entity(mut self, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    pub fn with_permissions(mut self, permissions: Vec<String>) -> Self {
        self.permissions_checked = permissions;
        self
    }

    pub fn with_trace(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    /// Appends the event. This is the whole write surface of the audit log;
    /// there is no update or delete.
    pub async fn log(db: &SurrealDbClient, event: Self) -> Result<(), AppError> {
        if event.workspace_id.trim().is_empty() {
            return Err(AppError::Validation(
                "audit event requires a workspace_id".to_string(),
            ));
        }
        if event.actor_id.trim().is_empty() {
            return Err(AppError::Validation(
                "audit event requires an actor_id".to_string(),
            ));
        }
        if event.action.trim().is_empty() {
            return Err(AppError::Validation(
                "audit event requires an action".to_string(),
            ));
        }

        db.store_item(event).await?;
        Ok(())
    }

    pub async fn get_scoped(
        db: &SurrealDbClient,
        workspace_id: &str,
        id: &str,
    ) -> Result<Option<Self>, AppError> {
        let event: Option<Self> = db.get_item(id).await?;
        Ok(event.filter(|event| event.workspace_id == workspace_id))
    }

    /// Newest-first page of a workspace's audit trail.
    pub async fn list_by_workspace(
        db: &SurrealDbClient,
        workspace_id: &str,
        limit: usize,
        start: usize,
    ) -> Result<Vec<Self>, AppError> {
        let mut response = db
            .query(
                "SELECT * FROM type::table($table)
                 WHERE workspace_id = $workspace_id
                 ORDER BY created_at DESC
                 LIMIT $limit
                 START $start;",
            )
            .bind(("table", Self::table_name()))
            .bind(("workspace_id", workspace_id.to_owned()))
            .bind(("limit", i64::try_from(limit).unwrap_or(i64::MAX)))
            .bind(("start", i64::try_from(start).unwrap_or(0)))
            .await?;

        Ok(response.take(0)?)
    }

    pub async fn list_by_actor(
        db: &SurrealDbClient,
        workspace_id: &str,
        actor_id: &str,
    ) -> Result<Vec<Self>, AppError> {
        Self::list_filtered(db, workspace_id, "actor_id", actor_id).await
    }

    pub async fn list_by_action(
        db: &SurrealDbClient,
        workspace_id: &str,
        action: &str,
    ) -> Result<Vec<Self>, AppError> {
        Self::list_filtered(db, workspace_id, "action", action).await
    }

    pub async fn list_by_outcome(
        db: &SurrealDbClient,
        workspace_id: &str,
        outcome: AuditOutcome,
    ) -> Result<Vec<Self>, AppError> {
        let mut response = db
            .query(
                "SELECT * FROM type::table($table)
                 WHERE workspace_id = $workspace_id
                   AND outcome = $outcome
                 ORDER BY created_at DESC;",
            )
            .bind(("table", Self::table_name()))
            .bind(("workspace_id", workspace_id.to_owned()))
            .bind(("outcome", outcome))
            .await?;

        Ok(response.take(0)?)
    }

    pub async fn list_by_entity(
        db: &SurrealDbClient,
        workspace_id: &str,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Vec<Self>, AppError> {
        let mut response = db
            .query(
                "SELECT * FROM type::table($table)
                 WHERE workspace_id = $workspace_id
                   AND entity_type = $entity_type
                   AND entity_id = $entity_id
                 ORDER BY created_at DESC;",
            )
            .bind(("table", Self::table_name()))
            .bind(("workspace_id", workspace_id.to_owned()))
            .bind(("entity_type", entity_type.to_owned()))
            .bind(("entity_id", entity_id.to_owned()))
            .await?;

        Ok(response.take(0)?)
    }

    pub async fn list_in_range(
        db: &SurrealDbClient,
        workspace_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Self>, AppError> {
        let mut response = db
            .query(
                "SELECT * FROM type::table($table)
                 WHERE workspace_id = $workspace_id
                   AND created_at >= $from
                   AND created_at <= $to
                 ORDER BY created_at DESC;",
            )
            .bind(("table", Self::table_name()))
            .bind(("workspace_id", workspace_id.to_owned()))
            .bind(("from", surrealdb::sql::Datetime::from(from)))
            .bind(("to", surrealdb::sql::Datetime::from(to)))
            .await?;

        Ok(response.take(0)?)
    }

    async fn list_filtered(
        db: &SurrealDbClient,
        workspace_id: &str,
        field: &'static str,
        value: &str,
    ) -> Result<Vec<Self>, AppError> {
        let sql = format!(
            "SELECT * FROM type::table($table)
             WHERE workspace_id = $workspace_id
               AND {field} = $value
             ORDER BY created_at DESC;",
        );

        let mut response = db
            .query(sql)
            .bind(("table", Self::table_name()))
            .bind(("workspace_id", workspace_id.to_owned()))
            .bind(("value", value.to_owned()))
            .await?;

        Ok(response.take(0)?)
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
    async fn log_rejects_missing_required_fields() {
        let db = setup_db().await;

        let missing_ws = AuditEvent::new("", "user_1", ActorType::User, "knowledge.ingest", AuditOutcome::Success);
        assert!(matches!(
            AuditEvent::log(&db, missing_ws).await,
            Err(AppError::Validation(_))
        ));

        let missing_action = AuditEvent::new("ws_1", "user_1", ActorType::User, " ", AuditOutcome::Success);
        assert!(matches!(
            AuditEvent::log(&db, missing_action).await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn listing_returns_all_events_newest_first() {
        let db = setup_db().await;
        for i in 0..5 {
            let mut event = AuditEvent::new(
                "ws_1",
                "user_1",
                ActorType::User,
                format!("action.{i}"),
                AuditOutcome::Success,
            );
            event.created_at = Utc::now() + chrono::Duration::milliseconds(i);
            AuditEvent::log(&db, event).await.expect("log");
        }

        let events = AuditEvent::list_by_workspace(&db, "ws_1", 10, 0)
            .await
            .expect("list");

        assert_eq!(events.len(), 5);
        for pair in events.windows(2) {
            assert!(pair[0].created_at >= pair[1].created_at);
        }
    }

    #[tokio::test]
    async fn listing_is_workspace_scoped_and_paginated() {
        let db = setup_db().await;
        for i in 0..4 {
            AuditEvent::log(
                &db,
                AuditEvent::new("ws_1", "user_1", ActorType::User, format!("a.{i}"), AuditOutcome::Success),
            )
            .await
            .expect("log");
        }
        AuditEvent::log(
            &db,
            AuditEvent::new("ws_2", "user_9", ActorType::User, "other", AuditOutcome::Success),
        )
        .await
        .expect("log");

        let first_page = AuditEvent::list_by_workspace(&db, "ws_1", 3, 0)
            .await
            .expect("page 1");
        let second_page = AuditEvent::list_by_workspace(&db, "ws_1", 3, 3)
            .await
            .expect("page 2");

        assert_eq!(first_page.len(), 3);
        assert_eq!(second_page.len(), 1);
        assert!(first_page.iter().all(|e| e.workspace_id == "ws_1"));
    }

    #[tokio::test]
    async fn filters_cover_actor_outcome_action_entity_and_range() {
        let db = setup_db().await;
        let denied = AuditEvent::new("ws_1", "agent_1", ActorType::Agent, "tool.execute", AuditOutcome::Denied)
            .with_entity("case", "case_1")
            .with_permissions(vec!["case:write".into()]);
        AuditEvent::log(&db, denied).await.expect("log");
        AuditEvent::log(
            &db,
            AuditEvent::new("ws_1", "user_1", ActorType::User, "knowledge.ingest", AuditOutcome::Success),
        )
        .await
        .expect("log");

        let by_actor = AuditEvent::list_by_actor(&db, "ws_1", "agent_1").await.expect("actor");
        assert_eq!(by_actor.len(), 1);
        assert_eq!(by_actor[0].actor_type, ActorType::Agent);

        let by_outcome = AuditEvent::list_by_outcome(&db, "ws_1", AuditOutcome::Denied)
            .await
            .expect("outcome");
        assert_eq!(by_outcome.len(), 1);

        let by_action = AuditEvent::list_by_action(&db, "ws_1", "knowledge.ingest")
            .await
            .expect("action");
        assert_eq!(by_action.len(), 1);

        let by_entity = AuditEvent::list_by_entity(&db, "ws_1", "case", "case_1")
            .await
            .expect("entity");
        assert_eq!(by_entity.len(), 1);

        let in_range = AuditEvent::list_in_range(
            &db,
            "ws_1",
            Utc::now() - chrono::Duration::minutes(5),
            Utc::now() + chrono::Duration::minutes(5),
        )
        .await
        .expect("range");
        assert_eq!(in_range.len(), 2);
    }
}
