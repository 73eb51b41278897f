use serde_json::Value;
use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

/// Which retrieval leg produced a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalMethod {
    Bm25,
    Vector,
    Hybrid,
}

stored_object!(Evidence, "evidence", {
    knowledge_item_id: String,
    workspace_id: String,
    method: RetrievalMethod,
    score: f32,
    snippet: Option<String>,
    pii_redacted: bool,
    #[serde(default)]
    metadata: Option<Value>
});

impl Evidence {
    pub fn new(
        knowledge_item_id: String,
        workspace_id: String,
        method: RetrievalMethod,
        score: f32,
        snippet: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7().to_string(),
            created_at: now,
            updated_at: now,
            knowledge_item_id,
            workspace_id,
            method,
            score,
            snippet,
            pii_redacted: false,
            metadata: None,
        }
    }

    /// Persists a pack's worth of evidence rows in one transaction. Rows are
    /// immutable once written; there is no update surface.
    pub async fn insert_many(db: &SurrealDbClient, rows: Vec<Self>) -> Result<(), AppError> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut query = db.client.query("BEGIN TRANSACTION;");
        for (i, row) in rows.into_iter().enumerate() {
            query = query
                .query(format!(
                    "CREATE type::thing('{table}', $evidence_id_{i}) CONTENT $evidence_{i};",
                    table = Self::table_name(),
                ))
                .bind((format!("evidence_id_{i}"), row.id.clone()))
                .bind((format!("evidence_{i}"), row));
        }
        query = query.query("COMMIT TRANSACTION;");

        let response = query.await.map_err(AppError::Database)?;
        response.check().map_err(AppError::Database)?;

        Ok(())
    }

    pub async fn get_scoped(
        db: &SurrealDbClient,
        workspace_id: &str,
        id: &str,
    ) -> Result<Option<Self>, AppError> {
        let row: Option<Self> = db.get_item(id).await?;
        Ok(row.filter(|row| row.workspace_id == workspace_id))
    }
}
