use std::sync::Arc;

use tokio::sync::{mpsc::Receiver, watch};
use tokio_retry::{strategy::ExponentialBackoff, Retry};
use tracing::{error, info, instrument, warn};

use common::{
    bus::BusEvent,
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{
            audit_event::{ActorType, AuditEvent, AuditOutcome},
            embedding_document::EmbeddingDocument,
        },
    },
    utils::llm::LlmProvider,
};

/// Retries after 100, 200 and 400 ms before giving up on an item.
fn embed_retry_strategy() -> impl Iterator<Item = std::time::Duration> {
    ExponentialBackoff::from_millis(2).factor(50).take(3)
}

/// Background consumer of `knowledge.ingested`. One batch-embed request per
/// event; terminal failures mark the item's chunks `failed` without blocking
/// later events.
pub struct Embedder {
    db: Arc<SurrealDbClient>,
    provider: Arc<LlmProvider>,
}

impl Embedder {
    pub fn new(db: Arc<SurrealDbClient>, provider: Arc<LlmProvider>) -> Self {
        Self { db, provider }
    }

    /// Drains `knowledge.ingested` until the channel closes or shutdown is
    /// signalled. The event in flight is always finished before exiting.
    pub async fn run(&self, mut events: Receiver<BusEvent>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("embedder received shutdown signal");
                    break;
                }
                event = events.recv() => {
                    let Some(event) = event else {
                        info!("embedder event channel closed");
                        break;
                    };
                    if let BusEvent::KnowledgeIngested { knowledge_item_id, workspace_id, chunk_count } = event {
                        if chunk_count == 0 {
                            continue;
                        }
                        if let Err(err) = self.process_item(&knowledge_item_id, &workspace_id).await {
                            error!(%knowledge_item_id, error = %err, "embedding failed");
                        }
                    }
                }
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn process_item(
        &self,
        knowledge_item_id: &str,
        workspace_id: &str,
    ) -> Result<(), AppError> {
        let pending = EmbeddingDocument::list_pending_for_item(&self.db, knowledge_item_id).await?;
        if pending.is_empty() {
            return Ok(());
        }

        let texts: Vec<String> = pending.iter().map(|doc| doc.chunk_text.clone()).collect();

        let embedded = Retry::spawn(embed_retry_strategy(), || {
            self.provider.embed_batch(&texts)
        })
        .await;

        let output = match embedded {
            Ok(output) if output.embeddings.len() == pending.len() => output,
            Ok(output) => {
                warn!(
                    expected = pending.len(),
                    received = output.embeddings.len(),
                    "embedding batch size mismatch"
                );
                self.record_failure(knowledge_item_id, workspace_id, "batch size mismatch")
                    .await?;
                return Err(AppError::DependencyUnavailable(
                    "embedding provider returned a short batch".to_string(),
                ));
            }
            Err(err) => {
                self.record_failure(knowledge_item_id, workspace_id, &err.to_string())
                    .await?;
                return Err(err);
            }
        };

        let chunk_count = pending.len();
        EmbeddingDocument::mark_embedded_with_vectors(
            &self.db,
            pending.into_iter().zip(output.embeddings).collect(),
        )
        .await?;

        info!(%knowledge_item_id, chunk_count, "chunks embedded");
        Ok(())
    }

    async fn record_failure(
        &self,
        knowledge_item_id: &str,
        workspace_id: &str,
        reason: &str,
    ) -> Result<(), AppError> {
        EmbeddingDocument::mark_failed(&self.db, knowledge_item_id).await?;

        AuditEvent::log(
            &self.db,
            AuditEvent::new(
                workspace_id,
                "embedder",
                ActorType::System,
                "knowledge.embed",
                AuditOutcome::Error,
            )
            .with_entity("knowledge_item", knowledge_item_id)
            .with_details(serde_json::json!({ "reason": reason })),
        )
        .await
    }
}
