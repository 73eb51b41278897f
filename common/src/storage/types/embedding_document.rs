use uuid::Uuid;

use crate::{
    error::AppError,
    storage::{db::SurrealDbClient, types::chunk_vector::ChunkVector},
    stored_object,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingStatus {
    Pending,
    Embedded,
    Failed,
}

stored_object!(EmbeddingDocument, "embedding_document", {
    knowledge_item_id: String,
    workspace_id: String,
    chunk_index: u32,
    chunk_text: String,
    token_count: u32,
    embedding_status: EmbeddingStatus,
    #[serde(
        serialize_with = "serialize_option_datetime",
        deserialize_with = "deserialize_option_datetime",
        default
    )]
    embedded_at: Option<DateTime<Utc>>
});

impl EmbeddingDocument {
    pub fn new(
        knowledge_item_id: String,
        workspace_id: String,
        chunk_index: u32,
        chunk_text: String,
        token_count: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7().to_string(),
            created_at: now,
            updated_at: now,
            knowledge_item_id,
            workspace_id,
            chunk_index,
            chunk_text,
            token_count,
            embedding_status: EmbeddingStatus::Pending,
            embedded_at: None,
        }
    }

    /// Pending chunks of one knowledge item, in chunk order.
    pub async fn list_pending_for_item(
        db: &SurrealDbClient,
        knowledge_item_id: &str,
    ) -> Result<Vec<Self>, AppError> {
        let mut response = db
            .query(
                "SELECT * FROM type::table($table)
                 WHERE knowledge_item_id = $knowledge_item_id
                   AND embedding_status = 'pending'
                 ORDER BY chunk_index ASC;",
            )
            .bind(("table", Self::table_name()))
            .bind(("knowledge_item_id", knowledge_item_id.to_owned()))
            .await?;

        Ok(response.take(0)?)
    }

    pub async fn list_for_item(
        db: &SurrealDbClient,
        knowledge_item_id: &str,
    ) -> Result<Vec<Self>, AppError> {
        let mut response = db
            .query(
                "SELECT * FROM type::table($table)
                 WHERE knowledge_item_id = $knowledge_item_id
                 ORDER BY chunk_index ASC;",
            )
            .bind(("table", Self::table_name()))
            .bind(("knowledge_item_id", knowledge_item_id.to_owned()))
            .await?;

        Ok(response.take(0)?)
    }

    /// Terminal failure path of the embedder: pending chunks of the item are
    /// flipped to `failed` so they are never retried by later events.
    pub async fn mark_failed(
        db: &SurrealDbClient,
        knowledge_item_id: &str,
    ) -> Result<(), AppError> {
        db.query(
            "UPDATE type::table($table)
             SET embedding_status = 'failed', updated_at = time::now()
             WHERE knowledge_item_id = $knowledge_item_id
               AND embedding_status = 'pending';",
        )
        .bind(("table", Self::table_name()))
        .bind(("knowledge_item_id", knowledge_item_id.to_owned()))
        .await?
        .check()?;

        Ok(())
    }

    /// Writes one vector row per chunk and flips each chunk to `embedded`, in
    /// a single transaction so the chunk/vector invariant cannot be observed
    /// half-applied.
    pub async fn mark_embedded_with_vectors(
        db: &SurrealDbClient,
        chunks: Vec<(Self, Vec<f32>)>,
    ) -> Result<(), AppError> {
        if chunks.is_empty() {
            return Ok(());
        }

        let mut query = db.client.query("BEGIN TRANSACTION;");
        for (i, (doc, embedding)) in chunks.into_iter().enumerate() {
            let vector = ChunkVector::for_document(&doc, embedding);
            query = query
                .query(format!(
                    "CREATE type::thing('{table}', $vec_id_{i}) CONTENT $vec_{i};",
                    table = ChunkVector::table_name(),
                ))
                .query(format!(
                    "UPDATE type::thing('{table}', $doc_id_{i})
                     SET embedding_status = 'embedded', embedded_at = time::now(), updated_at = time::now();",
                    table = Self::table_name(),
                ))
                .bind((format!("vec_id_{i}"), vector.id.clone()))
                .bind((format!("vec_{i}"), vector))
                .bind((format!("doc_id_{i}"), doc.id));
        }
        query = query.query("COMMIT TRANSACTION;");

        let response = query.await.map_err(AppError::Database)?;
        response.check().map_err(AppError::Database)?;

        Ok(())
    }

    /// Removes all chunks and vectors of an item. The ingest path does the
    /// same inline within its own transaction; this standalone variant serves
    /// the CDC delete route.
    pub async fn delete_for_item(
        db: &SurrealDbClient,
        workspace_id: &str,
        knowledge_item_id: &str,
    ) -> Result<(), AppError> {
        db.client
            .query("BEGIN TRANSACTION;")
            .query(format!(
                "DELETE {table} WHERE knowledge_item_id = $knowledge_item_id AND workspace_id = $workspace_id;",
                table = ChunkVector::table_name(),
            ))
            .query(format!(
                "DELETE {table} WHERE knowledge_item_id = $knowledge_item_id AND workspace_id = $workspace_id;",
                table = Self::table_name(),
            ))
            .query("COMMIT TRANSACTION;")
            .bind(("knowledge_item_id", knowledge_item_id.to_owned()))
            .bind(("workspace_id", workspace_id.to_owned()))
            .await?
            .check()?;

        Ok(())
    }
}
