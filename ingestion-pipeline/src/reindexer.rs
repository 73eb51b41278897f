use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{mpsc::Receiver, watch};
use tracing::{error, info, instrument};

use common::{
    bus::{BusEvent, ChangeType, RecordChange},
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{
            audit_event::{ActorType, AuditEvent, AuditOutcome},
            embedding_document::EmbeddingDocument,
            knowledge_item::{KnowledgeItem, SourceType},
            operational_record::OperationalRecord,
        },
    },
};

use crate::ingest::{IngestParams, IngestionService};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReindexOutcome {
    Refreshed,
    Removed,
    Skipped,
}

/// Keeps the index synchronized with mutating operational records.
///
/// Events carry `occurred_at`; anything non-increasing for the same entity is
/// ignored, which makes replays and out-of-order delivery harmless.
pub struct Reindexer {
    db: Arc<SurrealDbClient>,
    ingestion: IngestionService,
    seen: Mutex<HashMap<(String, String, String), DateTime<Utc>>>,
}

impl Reindexer {
    pub fn new(db: Arc<SurrealDbClient>, ingestion: IngestionService) -> Self {
        Self {
            db,
            ingestion,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Consumes the three `record.*` topics until shutdown. Fan-in order
    /// between topics is nondeterministic; `occurred_at` ordering is what
    /// keeps the result correct.
    pub async fn run(
        &self,
        mut created: Receiver<BusEvent>,
        mut updated: Receiver<BusEvent>,
        mut deleted: Receiver<BusEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let event = tokio::select! {
                _ = shutdown.changed() => {
                    info!("reindexer received shutdown signal");
                    break;
                }
                event = created.recv() => event,
                event = updated.recv() => event,
                event = deleted.recv() => event,
            };

            let Some(BusEvent::RecordChanged(change)) = event else {
                if event.is_none() {
                    info!("reindexer event channel closed");
                    break;
                }
                continue;
            };

            if let Err(err) = self.handle(&change).await {
                error!(
                    entity_type = %change.entity_type,
                    entity_id = %change.entity_id,
                    error = %err,
                    "reindex failed"
                );
            }
        }
    }

    #[instrument(skip(self), fields(entity_type = %change.entity_type, entity_id = %change.entity_id))]
    pub async fn handle(&self, change: &RecordChange) -> Result<ReindexOutcome, AppError> {
        if !self.is_newer(change) {
            return Ok(ReindexOutcome::Skipped);
        }

        let outcome = match change.change_type {
            ChangeType::Created | ChangeType::Updated => self.refresh(change).await?,
            ChangeType::Deleted => self.remove(change).await?,
        };

        if outcome != ReindexOutcome::Skipped {
            self.mark_seen(change);
            let latency_ms = (Utc::now() - change.occurred_at).num_milliseconds().max(0);
            info!(latency_ms, ?outcome, "index refreshed");

            AuditEvent::log(
                &self.db,
                AuditEvent::new(
                    &change.workspace_id,
                    "cdc-reindexer",
                    ActorType::System,
                    "knowledge.reindex",
                    AuditOutcome::Success,
                )
                .with_entity(change.entity_type.clone(), change.entity_id.clone())
                .with_details(serde_json::json!({
                    "change_type": change.change_type,
                    "latency_ms": latency_ms,
                })),
            )
            .await?;
        }

        Ok(outcome)
    }

    async fn refresh(&self, change: &RecordChange) -> Result<ReindexOutcome, AppError> {
        let record =
            OperationalRecord::get_scoped(&self.db, &change.workspace_id, &change.entity_id)
                .await?
                .ok_or_else(|| {
                    AppError::NotFound(format!(
                        "record {}/{}",
                        change.entity_type, change.entity_id
                    ))
                })?;

        self.ingestion
            .ingest(IngestParams {
                workspace_id: change.workspace_id.clone(),
                source_type: SourceType::Document,
                title: record.subject.clone(),
                raw_content: record_content(&record),
                entity_type: Some(change.entity_type.clone()),
                entity_id: Some(change.entity_id.clone()),
                metadata: Some(serde_json::json!({ "record_status": record.status })),
            })
            .await?;

        Ok(ReindexOutcome::Refreshed)
    }

    async fn remove(&self, change: &RecordChange) -> Result<ReindexOutcome, AppError> {
        let Some(item) = KnowledgeItem::find_by_entity(
            &self.db,
            &change.workspace_id,
            &change.entity_type,
            &change.entity_id,
        )
        .await?
        else {
            return Ok(ReindexOutcome::Skipped);
        };

        KnowledgeItem::soft_delete(&self.db, &change.workspace_id, &item.id).await?;
        EmbeddingDocument::delete_for_item(&self.db, &change.workspace_id, &item.id).await?;

        Ok(ReindexOutcome::Removed)
    }

    fn is_newer(&self, change: &RecordChange) -> bool {
        let seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        match seen.get(&seen_key(change)) {
            Some(last) => change.occurred_at > *last,
            None => true,
        }
    }

    fn mark_seen(&self, change: &RecordChange) {
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        seen.insert(seen_key(change), change.occurred_at);
    }
}

fn seen_key(change: &RecordChange) -> (String, String, String) {
    (
        change.workspace_id.clone(),
        change.entity_type.clone(),
        change.entity_id.clone(),
    )
}

/// Flattens a record into indexable text: subject, status, then every scalar
/// in the data payload.
fn record_content(record: &OperationalRecord) -> String {
    let mut parts = vec![record.subject.clone(), record.status.clone()];
    collect_scalars(&record.data, &mut parts);
    parts.retain(|part| !part.trim().is_empty());
    parts.join("\n")
}

fn collect_scalars(value: &Value, into: &mut Vec<String>) {
    match value {
        Value::String(s) => into.push(s.clone()),
        Value::Number(n) => into.push(n.to_string()),
        Value::Array(items) => items.iter().for_each(|item| collect_scalars(item, into)),
        Value::Object(map) => map.values().for_each(|item| collect_scalars(item, into)),
        Value::Bool(_) | Value::Null => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{
        bus::EventBus,
        storage::types::operational_record::RecordEntityType,
    };
    use uuid::Uuid;

    async fn setup() -> (Reindexer, Arc<SurrealDbClient>) {
        let db = Arc::new(
            SurrealDbClient::memory("test_ns", &Uuid::now_v7().to_string())
                .await
                .expect("Failed to start in-memory surrealdb"),
        );
        db.apply_migrations().await.expect("migrations");
        let bus = EventBus::shared();
        let ingestion = IngestionService::new(db.clone(), bus);
        (Reindexer::new(db.clone(), ingestion), db)
    }

    async fn store_case(db: &SurrealDbClient, ws: &str, subject: &str) -> OperationalRecord {
        let record = OperationalRecord::new(
            ws.to_string(),
            RecordEntityType::Case,
            subject.to_string(),
            "open".to_string(),
            serde_json::json!({ "description": "customer cannot reach the vpn" }),
        );
        db.store_item(record.clone()).await.expect("store record");
        record
    }

    fn change(ws: &str, id: &str, change_type: ChangeType, occurred_at: DateTime<Utc>) -> RecordChange {
        RecordChange {
            entity_type: "case".to_string(),
            entity_id: id.to_string(),
            workspace_id: ws.to_string(),
            change_type,
            occurred_at,
        }
    }

    #[tokio::test]
    async fn updates_refresh_the_linked_knowledge_item() {
        let (reindexer, db) = setup().await;
        let record = store_case(&db, "ws_1", "VPN down").await;

        let outcome = reindexer
            .handle(&change("ws_1", &record.id, ChangeType::Updated, Utc::now()))
            .await
            .expect("handle");
        assert_eq!(outcome, ReindexOutcome::Refreshed);

        let item = KnowledgeItem::find_by_entity(&db, "ws_1", "case", &record.id)
            .await
            .expect("find")
            .expect("item exists");
        assert_eq!(item.title, "VPN down");
        assert!(item.normalized_content.contains("vpn"));
    }

    #[tokio::test]
    async fn non_increasing_occurred_at_is_ignored() {
        let (reindexer, db) = setup().await;
        let record = store_case(&db, "ws_1", "VPN down").await;
        let t1 = Utc::now();

        let first = reindexer
            .handle(&change("ws_1", &record.id, ChangeType::Updated, t1))
            .await
            .expect("first");
        assert_eq!(first, ReindexOutcome::Refreshed);

        let item = KnowledgeItem::find_by_entity(&db, "ws_1", "case", &record.id)
            .await
            .expect("find")
            .expect("item");
        let chunks_after_first = EmbeddingDocument::list_for_item(&db, &item.id)
            .await
            .expect("chunks");

        let replay = reindexer
            .handle(&change("ws_1", &record.id, ChangeType::Updated, t1))
            .await
            .expect("replay");
        assert_eq!(replay, ReindexOutcome::Skipped);

        let stale = reindexer
            .handle(&change(
                "ws_1",
                &record.id,
                ChangeType::Updated,
                t1 - chrono::Duration::seconds(30),
            ))
            .await
            .expect("stale");
        assert_eq!(stale, ReindexOutcome::Skipped);

        let chunks_after_replays = EmbeddingDocument::list_for_item(&db, &item.id)
            .await
            .expect("chunks");
        let ids_first: Vec<&str> = chunks_after_first.iter().map(|c| c.id.as_str()).collect();
        let ids_replay: Vec<&str> = chunks_after_replays.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids_first, ids_replay, "no chunk churn on replay");
    }

    #[tokio::test]
    async fn deletes_soft_delete_item_and_drop_chunks() {
        let (reindexer, db) = setup().await;
        let record = store_case(&db, "ws_1", "VPN down").await;

        reindexer
            .handle(&change("ws_1", &record.id, ChangeType::Created, Utc::now()))
            .await
            .expect("create");
        let item = KnowledgeItem::find_by_entity(&db, "ws_1", "case", &record.id)
            .await
            .expect("find")
            .expect("item");

        let outcome = reindexer
            .handle(&change("ws_1", &record.id, ChangeType::Deleted, Utc::now()))
            .await
            .expect("delete");
        assert_eq!(outcome, ReindexOutcome::Removed);

        let reloaded = KnowledgeItem::get_scoped(&db, "ws_1", &item.id)
            .await
            .expect("get")
            .expect("soft-deleted row remains");
        assert!(reloaded.deleted_at.is_some());

        let chunks = EmbeddingDocument::list_for_item(&db, &item.id)
            .await
            .expect("chunks");
        assert!(chunks.is_empty());
    }

    #[tokio::test]
    async fn delete_without_linked_item_is_skipped() {
        let (reindexer, db) = setup().await;
        let record = store_case(&db, "ws_1", "Unindexed case").await;

        let outcome = reindexer
            .handle(&change("ws_1", &record.id, ChangeType::Deleted, Utc::now()))
            .await
            .expect("handle");
        assert_eq!(outcome, ReindexOutcome::Skipped);
    }

    #[tokio::test]
    async fn refresh_of_missing_record_is_not_found() {
        let (reindexer, _db) = setup().await;
        let result = reindexer
            .handle(&change("ws_1", "ghost", ChangeType::Updated, Utc::now()))
            .await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn reindex_is_audited() {
        let (reindexer, db) = setup().await;
        let record = store_case(&db, "ws_1", "VPN down").await;

        reindexer
            .handle(&change("ws_1", &record.id, ChangeType::Updated, Utc::now()))
            .await
            .expect("handle");

        let audits = AuditEvent::list_by_action(&db, "ws_1", "knowledge.reindex")
            .await
            .expect("audit");
        assert_eq!(audits.len(), 1);
        assert_eq!(audits[0].actor_type, ActorType::System);
    }
}
