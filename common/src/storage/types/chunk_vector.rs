use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

stored_object!(ChunkVector, "chunk_vector", {
    workspace_id: String,
    knowledge_item_id: String,
    embedding: Vec<f32>
});

impl ChunkVector {
    /// A vector row shares its id with the embedding document it belongs to,
    /// keeping the chunk/vector relationship a 1:1 key mapping.
    pub fn for_document(
        doc: &super::embedding_document::EmbeddingDocument,
        embedding: Vec<f32>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: doc.id.clone(),
            created_at: now,
            updated_at: now,
            workspace_id: doc.workspace_id.clone(),
            knowledge_item_id: doc.knowledge_item_id.clone(),
            embedding,
        }
    }

    /// Every embedded vector in the workspace. The semantic leg of hybrid
    /// search scores these in memory; swapping in an ANN index would replace
    /// this call without changing any caller.
    pub async fn fetch_for_workspace(
        db: &SurrealDbClient,
        workspace_id: &str,
    ) -> Result<Vec<Self>, AppError> {
        let mut response = db
            .query(
                "SELECT * FROM type::table($table)
                 WHERE workspace_id = $workspace_id;",
            )
            .bind(("table", Self::table_name()))
            .bind(("workspace_id", workspace_id.to_owned()))
            .await?;

        Ok(response.take(0)?)
    }

    /// The first embedded chunk's vector, used as the item representative in
    /// evidence-pack deduplication.
    pub async fn representative_for_item(
        db: &SurrealDbClient,
        workspace_id: &str,
        knowledge_item_id: &str,
    ) -> Result<Option<Vec<f32>>, AppError> {
        let mut response = db
            .query(
                "SELECT VALUE id FROM embedding_document
                 WHERE knowledge_item_id = $knowledge_item_id
                   AND workspace_id = $workspace_id
                   AND embedding_status = 'embedded'
                 ORDER BY chunk_index ASC
                 LIMIT 1;",
            )
            .bind(("knowledge_item_id", knowledge_item_id.to_owned()))
            .bind(("workspace_id", workspace_id.to_owned()))
            .await?;

        let ids: Vec<surrealdb::sql::Thing> = response.take(0).unwrap_or_default();
        let Some(chunk_id) = ids.into_iter().next() else {
            return Ok(None);
        };

        let vector: Option<Self> = db.get_item(&chunk_id.id.to_raw()).await?;
        Ok(vector.map(|v| v.embedding))
    }
}
