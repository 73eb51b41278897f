use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{info, instrument};

use common::{
    bus::{BusEvent, EventBus, TOPIC_KNOWLEDGE_INGESTED},
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{
            chunk_vector::ChunkVector,
            embedding_document::EmbeddingDocument,
            knowledge_item::{KnowledgeItem, SourceType},
            StoredObject,
        },
    },
};

use crate::chunker::{chunk_text, normalize_content};

#[derive(Debug, Clone)]
pub struct IngestParams {
    pub workspace_id: String,
    pub source_type: SourceType,
    pub title: String,
    pub raw_content: String,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub metadata: Option<Value>,
}

/// Normalizes, chunks and persists raw content as pending embedding work.
///
/// The whole write is one transaction; a re-ingest of the same entity
/// linkage replaces the previous item's chunks instead of duplicating them.
#[derive(Clone)]
pub struct IngestionService {
    db: Arc<SurrealDbClient>,
    bus: Arc<EventBus>,
}

impl IngestionService {
    pub fn new(db: Arc<SurrealDbClient>, bus: Arc<EventBus>) -> Self {
        Self { db, bus }
    }

    #[instrument(skip_all, fields(workspace_id = %params.workspace_id))]
    pub async fn ingest(&self, params: IngestParams) -> Result<KnowledgeItem, AppError> {
        if params.title.trim().is_empty() {
            return Err(AppError::InvalidField {
                field: "title".to_string(),
                message: "title must not be empty".to_string(),
            });
        }
        if params.entity_type.is_some() != params.entity_id.is_some() {
            return Err(AppError::InvalidField {
                field: "entity_id".to_string(),
                message: "entity_type and entity_id must be provided together".to_string(),
            });
        }

        let normalized = normalize_content(&params.raw_content);

        let existing = match (&params.entity_type, &params.entity_id) {
            (Some(entity_type), Some(entity_id)) => {
                KnowledgeItem::find_by_entity(
                    &self.db,
                    &params.workspace_id,
                    entity_type,
                    entity_id,
                )
                .await?
            }
            _ => None,
        };

        let item = match existing {
            Some(mut item) => {
                item.title = params.title;
                item.source_type = params.source_type;
                item.raw_content = params.raw_content;
                item.normalized_content = normalized.clone();
                item.metadata = params.metadata.unwrap_or(item.metadata);
                item.deleted_at = None;
                item.updated_at = Utc::now();
                item
            }
            None => KnowledgeItem::new(
                params.workspace_id.clone(),
                params.source_type,
                params.title,
                params.raw_content,
                normalized.clone(),
                params.entity_type,
                params.entity_id,
                params.metadata.unwrap_or(Value::Null),
            ),
        };

        self.replace_item(item).await
    }

    /// Edits an existing item's title or content and re-chunks it through
    /// the same transactional replace as ingest.
    pub async fn update_item(
        &self,
        workspace_id: &str,
        id: &str,
        title: Option<String>,
        raw_content: Option<String>,
    ) -> Result<KnowledgeItem, AppError> {
        let mut item = KnowledgeItem::get_scoped(&self.db, workspace_id, id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("knowledge item {id}")))?;

        if let Some(title) = title {
            if title.trim().is_empty() {
                return Err(AppError::InvalidField {
                    field: "title".to_string(),
                    message: "title must not be empty".to_string(),
                });
            }
            item.title = title;
        }
        if let Some(raw_content) = raw_content {
            item.normalized_content = normalize_content(&raw_content);
            item.raw_content = raw_content;
        }
        item.updated_at = Utc::now();

        self.replace_item(item).await
    }

    /// Replaces the item, its chunks and vectors atomically and announces
    /// the new pending chunks. A failure in any statement rolls the whole
    /// write back.
    async fn replace_item(&self, item: KnowledgeItem) -> Result<KnowledgeItem, AppError> {
        let workspace_id = item.workspace_id.clone();
        let chunks = chunk_text(&item.normalized_content);
        let chunk_count = chunks.len();

        let mut query = self
            .db
            .client
            .query("BEGIN TRANSACTION;")
            .query(format!(
                "DELETE {table} WHERE knowledge_item_id = $item_id AND workspace_id = $workspace_id;",
                table = ChunkVector::table_name(),
            ))
            .query(format!(
                "DELETE {table} WHERE knowledge_item_id = $item_id AND workspace_id = $workspace_id;",
                table = EmbeddingDocument::table_name(),
            ))
            .query(format!(
                "UPSERT type::thing('{table}', $item_id) CONTENT $item;",
                table = KnowledgeItem::table_name(),
            ))
            .bind(("item_id", item.id.clone()))
            .bind(("workspace_id", workspace_id.clone()))
            .bind(("item", item.clone()));

        for chunk in chunks {
            let doc = EmbeddingDocument::new(
                item.id.clone(),
                workspace_id.clone(),
                chunk.index,
                chunk.text,
                chunk.token_count,
            );
            query = query
                .query(format!(
                    "CREATE type::thing('{table}', $doc_id_{i}) CONTENT $doc_{i};",
                    table = EmbeddingDocument::table_name(),
                    i = chunk.index,
                ))
                .bind((format!("doc_id_{}", chunk.index), doc.id.clone()))
                .bind((format!("doc_{}", chunk.index), doc));
        }
        query = query.query("COMMIT TRANSACTION;");

        let response = query.await.map_err(AppError::Database)?;
        response.check().map_err(AppError::Database)?;

        info!(
            knowledge_item_id = %item.id,
            chunk_count,
            "knowledge item ingested"
        );

        self.bus.publish(
            TOPIC_KNOWLEDGE_INGESTED,
            &BusEvent::KnowledgeIngested {
                knowledge_item_id: item.id.clone(),
                workspace_id,
                chunk_count,
            },
        );

        Ok(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::storage::types::embedding_document::EmbeddingStatus;
    use uuid::Uuid;

    async fn setup() -> (IngestionService, Arc<SurrealDbClient>, Arc<EventBus>) {
        let db = Arc::new(
            SurrealDbClient::memory("test_ns", &Uuid::now_v7().to_string())
                .await
                .expect("Failed to start in-memory surrealdb"),
        );
        db.apply_migrations().await.expect("migrations");
        let bus = EventBus::shared();
        (IngestionService::new(db.clone(), bus.clone()), db, bus)
    }

    fn params(ws: &str, title: &str, content: &str) -> IngestParams {
        IngestParams {
            workspace_id: ws.to_string(),
            source_type: SourceType::KbArticle,
            title: title.to_string(),
            raw_content: content.to_string(),
            entity_type: None,
            entity_id: None,
            metadata: None,
        }
    }

    #[tokio::test]
    async fn ingest_creates_item_and_pending_chunks() {
        let (service, db, bus) = setup().await;
        let mut rx = bus.subscribe(TOPIC_KNOWLEDGE_INGESTED);

        let item = service
            .ingest(params("ws_1", "VPN restart", "restart the vpn gateway daily"))
            .await
            .expect("ingest");

        let chunks = EmbeddingDocument::list_for_item(&db, &item.id)
            .await
            .expect("chunks");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].embedding_status, EmbeddingStatus::Pending);
        assert_eq!(chunks[0].chunk_index, 0);

        let event = rx.recv().await.expect("event");
        assert_eq!(
            event,
            BusEvent::KnowledgeIngested {
                knowledge_item_id: item.id,
                workspace_id: "ws_1".to_string(),
                chunk_count: 1,
            }
        );
    }

    #[tokio::test]
    async fn empty_content_still_creates_the_item() {
        let (service, db, bus) = setup().await;
        let mut rx = bus.subscribe(TOPIC_KNOWLEDGE_INGESTED);

        let item = service
            .ingest(params("ws_1", "Empty note", ""))
            .await
            .expect("ingest");

        let stored = KnowledgeItem::get_scoped(&db, "ws_1", &item.id)
            .await
            .expect("get");
        assert!(stored.is_some());

        let chunks = EmbeddingDocument::list_for_item(&db, &item.id)
            .await
            .expect("chunks");
        assert!(chunks.is_empty());

        let event = rx.recv().await.expect("event");
        assert!(matches!(
            event,
            BusEvent::KnowledgeIngested { chunk_count: 0, .. }
        ));
    }

    #[tokio::test]
    async fn reingest_of_same_entity_replaces_instead_of_duplicating() {
        let (service, db, _bus) = setup().await;

        let mut first = params("ws_1", "Case summary", "first revision of the summary");
        first.entity_type = Some("case".to_string());
        first.entity_id = Some("case_7".to_string());
        let original = service.ingest(first).await.expect("first ingest");

        let mut second = params("ws_1", "Case summary v2", "second revision with fresh facts");
        second.entity_type = Some("case".to_string());
        second.entity_id = Some("case_7".to_string());
        let replacement = service.ingest(second).await.expect("second ingest");

        assert_eq!(original.id, replacement.id, "same linkage keeps the id");

        let items: Vec<KnowledgeItem> = db
            .get_all_stored_items()
            .await
            .expect("all items");
        assert_eq!(items.len(), 1, "exactly one knowledge item per linkage");
        assert_eq!(items[0].title, "Case summary v2");

        let chunks = EmbeddingDocument::list_for_item(&db, &replacement.id)
            .await
            .expect("chunks");
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].chunk_text.contains("second revision"));
    }

    #[tokio::test]
    async fn reingest_clears_soft_deletion() {
        let (service, db, _bus) = setup().await;

        let mut linked = params("ws_1", "Case notes", "original body");
        linked.entity_type = Some("case".to_string());
        linked.entity_id = Some("case_3".to_string());
        let item = service.ingest(linked.clone()).await.expect("ingest");

        KnowledgeItem::soft_delete(&db, "ws_1", &item.id)
            .await
            .expect("soft delete");

        let revived = service.ingest(linked).await.expect("re-ingest");
        assert!(revived.deleted_at.is_none());
    }

    #[tokio::test]
    async fn update_item_rechunks_the_new_content() {
        let (service, db, _bus) = setup().await;
        let item = service
            .ingest(params("ws_1", "Runbook", "original body text"))
            .await
            .expect("ingest");

        let updated = service
            .update_item("ws_1", &item.id, None, Some("replacement body text".into()))
            .await
            .expect("update");

        assert_eq!(updated.title, "Runbook");
        assert!(updated.normalized_content.contains("replacement"));

        let chunks = EmbeddingDocument::list_for_item(&db, &item.id)
            .await
            .expect("chunks");
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].chunk_text.contains("replacement"));

        let missing = service
            .update_item("ws_1", "ghost", None, Some("x".into()))
            .await;
        assert!(matches!(missing, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn half_specified_entity_linkage_is_a_validation_error() {
        let (service, _db, _bus) = setup().await;

        let mut bad = params("ws_1", "Broken", "content");
        bad.entity_type = Some("case".to_string());
        let result = service.ingest(bad).await;

        assert!(matches!(result, Err(AppError::InvalidField { .. })));
    }

    #[tokio::test]
    async fn blank_title_is_rejected() {
        let (service, _db, _bus) = setup().await;
        let result = service.ingest(params("ws_1", "  ", "content")).await;
        assert!(matches!(result, Err(AppError::InvalidField { .. })));
    }
}
