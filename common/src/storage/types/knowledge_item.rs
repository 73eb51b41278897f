use serde_json::Value;
use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Document,
    Email,
    CallTranscript,
    KbArticle,
    CaseReply,
}

stored_object!(KnowledgeItem, "knowledge_item", {
    workspace_id: String,
    source_type: SourceType,
    title: String,
    raw_content: String,
    normalized_content: String,
    entity_type: Option<String>,
    entity_id: Option<String>,
    metadata: Value,
    #[serde(
        serialize_with = "serialize_option_datetime",
        deserialize_with = "deserialize_option_datetime",
        default
    )]
    deleted_at: Option<DateTime<Utc>>
});

/// One lexical hit from the BM25 leg of hybrid search.
#[derive(Debug, Clone, PartialEq)]
pub struct Bm25Hit {
    pub knowledge_item_id: String,
    pub title: String,
    pub snippet: String,
    pub bm25_score: f32,
}

impl KnowledgeItem {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        workspace_id: String,
        source_type: SourceType,
        title: String,
        raw_content: String,
        normalized_content: String,
        entity_type: Option<String>,
        entity_id: Option<String>,
        metadata: Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7().to_string(),
            created_at: now,
            updated_at: now,
            workspace_id,
            source_type,
            title,
            raw_content,
            normalized_content,
            entity_type,
            entity_id,
            metadata,
            deleted_at: None,
        }
    }

    /// Workspace-checked fetch; rows from other tenants are invisible.
    pub async fn get_scoped(
        db: &SurrealDbClient,
        workspace_id: &str,
        id: &str,
    ) -> Result<Option<Self>, AppError> {
        let item: Option<Self> = db.get_item(id).await?;
        Ok(item.filter(|item| item.workspace_id == workspace_id))
    }

    /// Resolves the knowledge item linked to an operational record, enabling
    /// idempotent re-ingest of the same entity.
    pub async fn find_by_entity(
        db: &SurrealDbClient,
        workspace_id: &str,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Option<Self>, AppError> {
        let mut response = db
            .query(
                "SELECT * FROM type::table($table)
                 WHERE workspace_id = $workspace_id
                   AND entity_type = $entity_type
                   AND entity_id = $entity_id
                 LIMIT 1;",
            )
            .bind(("table", Self::table_name()))
            .bind(("workspace_id", workspace_id.to_owned()))
            .bind(("entity_type", entity_type.to_owned()))
            .bind(("entity_id", entity_id.to_owned()))
            .await?;

        let items: Vec<Self> = response.take(0)?;
        Ok(items.into_iter().next())
    }

    /// Marks the item deleted without removing the row; search excludes it
    /// from this point on.
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

    /// Full-text match over `normalized_content`, scoped to one workspace and
    /// excluding soft-deleted rows. Raw BM25 scores are only used to order
    /// this list; downstream fusion works on ranks.
    pub async fn fts_search(
        take: usize,
        terms: &str,
        db: &SurrealDbClient,
        workspace_id: &str,
    ) -> Result<Vec<Bm25Hit>, AppError> {
        #[derive(Deserialize)]
        struct Row {
            #[serde(deserialize_with = "deserialize_flexible_id")]
            id: String,
            title: String,
            normalized_content: String,
            score: f32,
        }

        let limit = i64::try_from(take).unwrap_or(i64::MAX);

        let sql = format!(
            r#"
            SELECT
                id,
                title,
                normalized_content,
                IF search::score(0) != NONE THEN search::score(0) ELSE 0 END AS score
            FROM {table}
            WHERE normalized_content @0@ $terms
              AND workspace_id = $workspace_id
              AND deleted_at = NONE
            ORDER BY score DESC
            LIMIT $limit;
            "#,
            table = Self::table_name(),
        );

        let mut response = db
            .query(&sql)
            .bind(("terms", terms.to_owned()))
            .bind(("workspace_id", workspace_id.to_owned()))
            .bind(("limit", limit))
            .await
            .map_err(|e| AppError::InternalError(format!("Surreal query failed: {e}")))?;

        response = response.check().map_err(AppError::Database)?;

        let rows: Vec<Row> = response.take::<Vec<Row>>(0).map_err(AppError::Database)?;

        Ok(rows
            .into_iter()
            .map(|row| Bm25Hit {
                knowledge_item_id: row.id,
                title: row.title,
                snippet: snippet_of(&row.normalized_content),
                bm25_score: row.score,
            })
            .collect())
    }
}

/// First slice of the normalized content, cut at a char boundary.
pub fn snippet_of(content: &str) -> String {
    const SNIPPET_CHARS: usize = 200;
    content.chars().take(SNIPPET_CHARS).collect()
}
