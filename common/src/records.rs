use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use crate::{
    bus::{BusEvent, ChangeType, EventBus, RecordChange},
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::operational_record::{OperationalRecord, RecordEntityType},
    },
};

/// Entity-store port over operational records.
///
/// The CRUD HTTP handlers for these records live outside this core; tools,
/// CDC and the handoff path consume this service, and every mutation fans a
/// `record.*` event onto the bus.
#[derive(Clone)]
pub struct RecordStore {
    db: Arc<SurrealDbClient>,
    bus: Arc<EventBus>,
}

impl RecordStore {
    pub fn new(db: Arc<SurrealDbClient>, bus: Arc<EventBus>) -> Self {
        Self { db, bus }
    }

    pub async fn get(
        &self,
        workspace_id: &str,
        id: &str,
    ) -> Result<Option<OperationalRecord>, AppError> {
        OperationalRecord::get_scoped(&self.db, workspace_id, id).await
    }

    pub async fn list(
        &self,
        workspace_id: &str,
        entity_type: RecordEntityType,
    ) -> Result<Vec<OperationalRecord>, AppError> {
        OperationalRecord::list_by_type(&self.db, workspace_id, entity_type).await
    }

    pub async fn create(
        &self,
        workspace_id: &str,
        entity_type: RecordEntityType,
        subject: String,
        status: String,
        data: Value,
    ) -> Result<OperationalRecord, AppError> {
        let record = OperationalRecord::new(
            workspace_id.to_string(),
            entity_type,
            subject,
            status,
            data,
        );
        let stored = self
            .db
            .store_item(record)
            .await?
            .ok_or_else(|| AppError::InternalError("record insert returned nothing".into()))?;

        self.publish_change(&stored, ChangeType::Created);
        Ok(stored)
    }

    pub async fn update(
        &self,
        workspace_id: &str,
        id: &str,
        subject: Option<String>,
        status: Option<String>,
        data: Option<Value>,
    ) -> Result<OperationalRecord, AppError> {
        let updated =
            OperationalRecord::update_fields(&self.db, workspace_id, id, subject, status, data)
                .await?;

        self.publish_change(&updated, ChangeType::Updated);
        Ok(updated)
    }

    pub async fn set_status(
        &self,
        workspace_id: &str,
        id: &str,
        status: &str,
    ) -> Result<OperationalRecord, AppError> {
        let updated = OperationalRecord::set_status(&self.db, workspace_id, id, status).await?;

        self.publish_change(&updated, ChangeType::Updated);
        Ok(updated)
    }

    pub async fn soft_delete(&self, workspace_id: &str, id: &str) -> Result<(), AppError> {
        let record = self
            .get(workspace_id, id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("record {id}")))?;

        OperationalRecord::soft_delete(&self.db, workspace_id, id).await?;
        self.publish_change(&record, ChangeType::Deleted);
        Ok(())
    }

    fn publish_change(&self, record: &OperationalRecord, change_type: ChangeType) {
        let change = RecordChange {
            entity_type: record.entity_type.as_str().to_string(),
            entity_id: record.id.clone(),
            workspace_id: record.workspace_id.clone(),
            change_type,
            occurred_at: Utc::now(),
        };
        self.bus
            .publish(change_type.topic(), &BusEvent::RecordChanged(change));
    }
}
