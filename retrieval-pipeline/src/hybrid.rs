use std::{collections::HashMap, sync::Arc, time::Duration};

use serde::Serialize;
use tokio::time::timeout;
use tracing::{instrument, warn};

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{
            chunk_vector::ChunkVector,
            evidence::RetrievalMethod,
            knowledge_item::{snippet_of, Bm25Hit, KnowledgeItem},
        },
    },
    utils::llm::{cosine_similarity, LlmProvider},
};

/// Reciprocal Rank Fusion constant.
pub const RRF_K: f32 = 60.0;
pub const DEFAULT_SEARCH_LIMIT: usize = 20;
pub const MAX_SEARCH_LIMIT: usize = 50;

/// Coerces a requested limit into [1, 50]; zero, negative and missing values
/// fall back to `default`.
pub fn effective_limit(requested: Option<i64>, default: usize) -> usize {
    match requested {
        Some(value) if value >= 1 => (value as usize).min(MAX_SEARCH_LIMIT),
        _ => default.min(MAX_SEARCH_LIMIT),
    }
}

/// RRF contribution of a 0-based rank.
pub fn rrf_contribution(rank: usize) -> f32 {
    1.0 / (RRF_K + rank as f32 + 1.0)
}

#[derive(Debug, Clone, Serialize)]
pub struct RankedResult {
    pub knowledge_item_id: String,
    pub title: String,
    pub snippet: String,
    pub method: RetrievalMethod,
    pub score: f32,
    pub bm25_rank: Option<usize>,
    pub vector_rank: Option<usize>,
}

/// One semantic hit before fusion.
#[derive(Debug, Clone)]
struct VectorHit {
    chunk_id: String,
    knowledge_item_id: String,
    similarity: f32,
}

/// Concurrent BM25 + vector retrieval merged by Reciprocal Rank Fusion.
///
/// Absence of embeddings is a normal operating mode: when the embed call
/// fails or the workspace has no vectors, results are BM25-only and no error
/// surfaces.
pub struct HybridSearch {
    db: Arc<SurrealDbClient>,
    provider: Arc<LlmProvider>,
    budget: Duration,
}

impl HybridSearch {
    pub fn new(db: Arc<SurrealDbClient>, provider: Arc<LlmProvider>, budget: Duration) -> Self {
        Self {
            db,
            provider,
            budget,
        }
    }

    #[instrument(skip(self), fields(workspace_id))]
    pub async fn search(
        &self,
        workspace_id: &str,
        query: &str,
        limit: Option<i64>,
    ) -> Result<Vec<RankedResult>, AppError> {
        if query.trim().is_empty() {
            return Err(AppError::InvalidField {
                field: "query".to_string(),
                message: "query must not be empty".to_string(),
            });
        }

        let limit = effective_limit(limit, DEFAULT_SEARCH_LIMIT);

        timeout(self.budget, self.search_inner(workspace_id, query, limit))
            .await
            .map_err(|_| AppError::DependencyUnavailable("hybrid search timed out".into()))?
    }

    async fn search_inner(
        &self,
        workspace_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<RankedResult>, AppError> {
        let (bm25, vector) = tokio::join!(
            KnowledgeItem::fts_search(limit, query, &self.db, workspace_id),
            self.vector_leg(workspace_id, query, limit),
        );

        let bm25 = bm25?;
        self.fuse(workspace_id, bm25, vector, limit).await
    }

    /// The semantic leg. Any embed failure degrades to an empty list so the
    /// caller still gets lexical results.
    async fn vector_leg(&self, workspace_id: &str, query: &str, limit: usize) -> Vec<VectorHit> {
        let query_embedding = match self.provider.embed_batch(&[query.to_string()]).await {
            Ok(output) => match output.embeddings.into_iter().next() {
                Some(embedding) if !embedding.is_empty() => embedding,
                _ => {
                    warn!("embed returned no vector; degrading to BM25-only");
                    return Vec::new();
                }
            },
            Err(err) => {
                warn!(error = %err, "embed failed; degrading to BM25-only");
                return Vec::new();
            }
        };

        let vectors = match ChunkVector::fetch_for_workspace(&self.db, workspace_id).await {
            Ok(vectors) => vectors,
            Err(err) => {
                warn!(error = %err, "vector fetch failed; degrading to BM25-only");
                return Vec::new();
            }
        };

        let mut hits: Vec<VectorHit> = vectors
            .into_iter()
            .map(|row| VectorHit {
                similarity: cosine_similarity(&query_embedding, &row.embedding),
                chunk_id: row.id,
                knowledge_item_id: row.knowledge_item_id,
            })
            .collect();

        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        hits.truncate(limit);
        hits
    }

    /// Reciprocal Rank Fusion with 0-based ranks, deduplicated by knowledge
    /// item. Ties break by earlier BM25 rank, then earlier vector rank, then
    /// id.
    async fn fuse(
        &self,
        workspace_id: &str,
        bm25: Vec<Bm25Hit>,
        vector: Vec<VectorHit>,
        limit: usize,
    ) -> Result<Vec<RankedResult>, AppError> {
        struct Fused {
            title: Option<String>,
            snippet: Option<String>,
            bm25_rank: Option<usize>,
            vector_rank: Option<usize>,
        }

        let mut by_item: HashMap<String, Fused> = HashMap::new();
        let mut order: Vec<String> = Vec::new();

        for (rank, hit) in bm25.into_iter().enumerate() {
            order.push(hit.knowledge_item_id.clone());
            by_item.insert(
                hit.knowledge_item_id,
                Fused {
                    title: Some(hit.title),
                    snippet: Some(hit.snippet),
                    bm25_rank: Some(rank),
                    vector_rank: None,
                },
            );
        }

        for (rank, hit) in vector.into_iter().enumerate() {
            let entry = by_item
                .entry(hit.knowledge_item_id.clone())
                .or_insert_with(|| {
                    order.push(hit.knowledge_item_id.clone());
                    Fused {
                        title: None,
                        snippet: None,
                        bm25_rank: None,
                        vector_rank: None,
                    }
                });
            // Multiple chunks of one item may rank; the best one counts.
            if entry.vector_rank.is_none() {
                entry.vector_rank = Some(rank);
            }
        }

        let mut results = Vec::with_capacity(order.len());
        for id in order {
            let Some(fused) = by_item.remove(&id) else {
                continue;
            };

            let score = fused.bm25_rank.map_or(0.0, rrf_contribution)
                + fused.vector_rank.map_or(0.0, rrf_contribution);
            let method = match (fused.bm25_rank, fused.vector_rank) {
                (Some(_), Some(_)) => RetrievalMethod::Hybrid,
                (Some(_), None) => RetrievalMethod::Bm25,
                (None, _) => RetrievalMethod::Vector,
            };

            let (title, snippet) = match (fused.title, fused.snippet) {
                (Some(title), Some(snippet)) => (title, snippet),
                _ => {
                    // Vector-only hit: hydrate, dropping rows that were
                    // soft-deleted since their vectors were written.
                    match KnowledgeItem::get_scoped(&self.db, workspace_id, &id).await? {
                        Some(item) if item.deleted_at.is_none() => {
                            (item.title, snippet_of(&item.normalized_content))
                        }
                        _ => continue,
                    }
                }
            };

            results.push(RankedResult {
                knowledge_item_id: id,
                title,
                snippet,
                method,
                score,
                bm25_rank: fused.bm25_rank,
                vector_rank: fused.vector_rank,
            });
        }

        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    a.bm25_rank
                        .unwrap_or(usize::MAX)
                        .cmp(&b.bm25_rank.unwrap_or(usize::MAX))
                })
                .then_with(|| {
                    a.vector_rank
                        .unwrap_or(usize::MAX)
                        .cmp(&b.vector_rank.unwrap_or(usize::MAX))
                })
                .then_with(|| a.knowledge_item_id.cmp(&b.knowledge_item_id))
        });
        results.truncate(limit);

        Ok(results)
    }
}
