use serde_json::Value;
use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

/// Polymorphic record kinds. Validation of `entity_type` strings coming off
/// the wire goes through [`RecordEntityType::parse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordEntityType {
    Account,
    Contact,
    Lead,
    Deal,
    Case,
    Activity,
    Note,
    Attachment,
    Task,
}

impl RecordEntityType {
    pub fn parse(value: &str) -> Result<Self, AppError> {
        serde_json::from_value(Value::String(value.to_string())).map_err(|_| {
            AppError::Validation(format!("unknown entity type '{value}'"))
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Account => "account",
            Self::Contact => "contact",
            Self::Lead => "lead",
            Self::Deal => "deal",
            Self::Case => "case",
            Self::Activity => "activity",
            Self::Note => "note",
            Self::Attachment => "attachment",
            Self::Task => "task",
        }
    }
}

stored_object!(OperationalRecord, "operational_record", {
    workspace_id: String,
    entity_type: RecordEntityType,
    subject: String,
    status: String,
    data: Value,
    #[serde(
        serialize_with = "serialize_option_datetime",
        deserialize_with = "deserialize_option_datetime",
        default
    )]
    deleted_at: Option<DateTime<Utc>>
});

impl OperationalRecord {
    pub fn new(
        workspace_id: String,
        entity_type: RecordEntityType,
        subject: String,
        status: String,
        data: Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7().to_string(),
            created_at: now,
            updated_at: now,
            workspace_id,
            entity_type,
            subject,
            status,
            data,
            deleted_at: None,
        }
    }

    pub async fn get_scoped(
        db: &SurrealDbClient,
        workspace_id: &str,
        id: &str,
    ) -> Result<Option<Self>, AppError> {
        let record: Option<Self> = db.get_item(id).await?;
        Ok(record.filter(|record| record.workspace_id == workspace_id))
    }

    pub async fn list_by_type(
        db: &SurrealDbClient,
        workspace_id: &str,
        entity_type: RecordEntityType,
    ) -> Result<Vec<Self>, AppError> {
        let mut response = db
            .query(
                "SELECT * FROM type::table($table)
                 WHERE workspace_id = $workspace_id
                   AND entity_type = $entity_type
                   AND deleted_at = NONE
                 ORDER BY created_at DESC;",
            )
            .bind(("table", Self::table_name()))
            .bind(("workspace_id", workspace_id.to_owned()))
            .bind(("entity_type", entity_type))
            .await?;

        Ok(response.take(0)?)
    }

    pub async fn set_status(
        db: &SurrealDbClient,
        workspace_id: &str,
        id: &str,
        status: &str,
    ) -> Result<Self, AppError> {
        let mut response = db
            .query(
                "UPDATE type::thing($table, $id)
                 SET status = $status, updated_at = time::now()
                 WHERE workspace_id = $workspace_id
                 RETURN AFTER;",
            )
            .bind(("table", Self::table_name()))
            .bind(("id", id.to_owned()))
            .bind(("workspace_id", workspace_id.to_owned()))
            .bind(("status", status.to_owned()))
            .await?;

        let updated: Vec<Self> = response.take(0)?;
        updated
            .into_iter()
            .next()
            .ok_or_else(|| AppError::NotFound(format!("record {id}")))
    }

    pub async fn update_fields(
        db: &SurrealDbClient,
        workspace_id: &str,
        id: &str,
        subject: Option<String>,
        status: Option<String>,
        data: Option<Value>,
    ) -> Result<Self, AppError> {
        let current = Self::get_scoped(db, workspace_id, id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("record {id}")))?;

        let mut response = db
            .query(
                "UPDATE type::thing($table, $id)
                 SET subject = $subject, status = $status, data = $data, updated_at = time::now()
                 WHERE workspace_id = $workspace_id
                 RETURN AFTER;",
            )
            .bind(("table", Self::table_name()))
            .bind(("id", id.to_owned()))
            .bind(("workspace_id", workspace_id.to_owned()))
            .bind(("subject", subject.unwrap_or(current.subject)))
            .bind(("status", status.unwrap_or(current.status)))
            .bind(("data", data.unwrap_or(current.data)))
            .await?;

        let updated: Vec<Self> = response.take(0)?;
        updated
            .into_iter()
            .next()
            .ok_or_else(|| AppError::NotFound(format!("record {id}")))
    }

    pub async fn soft_delete(
        db: &SurrealDbClient,
        workspace_id: &str,
        id: &str,
    ) -> Result<(), AppError> {
        db.query(
            "UPDATE type::thing($table, $id)
             SET deleted_at = time::now(), updated_at = time::now()
             WHERE workspace_id = $workspace_id;",
        )
        .bind(("table", Self::table_name()))
        .bind(("id", id.to_owned()))
        .bind(("workspace_id", workspace_id.to_owned()))
        .await?
        .check()?;

        Ok(())
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

    #[test]
    fn entity_type_parsing_rejects_unknown_kinds() {
        assert_eq!(
            RecordEntityType::parse("case").expect("case"),
            RecordEntityType::Case
        );
        assert!(RecordEntityType::parse("spaceship").is_err());
    }

    #[tokio::test]
    async fn set_status_returns_the_updated_record() {
        let db = setup_db().await;
        let record = OperationalRecord::new(
            "ws_1".into(),
            RecordEntityType::Case,
            "VPN down".into(),
            "open".into(),
            Value::Null,
        );
        db.store_item(record.clone()).await.expect("store");

        let updated = OperationalRecord::set_status(&db, "ws_1", &record.id, "escalated")
            .await
            .expect("set status");
        assert_eq!(updated.status, "escalated");

        let foreign = OperationalRecord::set_status(&db, "ws_2", &record.id, "closed").await;
        assert!(matches!(foreign, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn update_fields_merges_partial_updates() {
        let db = setup_db().await;
        let record = OperationalRecord::new(
            "ws_1".into(),
            RecordEntityType::Lead,
            "Acme expansion".into(),
            "new".into(),
            serde_json::json!({"value": 10_000}),
        );
        db.store_item(record.clone()).await.expect("store");

        let updated = OperationalRecord::update_fields(
            &db,
            "ws_1",
            &record.id,
            None,
            Some("qualified".into()),
            None,
        )
        .await
        .expect("update");

        assert_eq!(updated.subject, "Acme expansion");
        assert_eq!(updated.status, "qualified");
        assert_eq!(updated.data, serde_json::json!({"value": 10_000}));
    }

    #[tokio::test]
    async fn list_by_type_excludes_soft_deleted() {
        let db = setup_db().await;
        let keep = OperationalRecord::new(
            "ws_1".into(),
            RecordEntityType::Case,
            "Keep".into(),
            "open".into(),
            Value::Null,
        );
        let gone = OperationalRecord::new(
            "ws_1".into(),
            RecordEntityType::Case,
            "Gone".into(),
            "open".into(),
            Value::Null,
        );
        db.store_item(keep.clone()).await.expect("store");
        db.store_item(gone.clone()).await.expect("store");

        OperationalRecord::soft_delete(&db, "ws_1", &gone.id)
            .await
            .expect("delete");

        let cases = OperationalRecord::list_by_type(&db, "ws_1", RecordEntityType::Case)
            .await
            .expect("list");
        assert_eq!(cases.len(), 1);
        assert_eq!(cases[0].subject, "Keep");
    }
}
