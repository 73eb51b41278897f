use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use tracing::instrument;

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{
            chunk_vector::ChunkVector,
            evidence::{Evidence, RetrievalMethod},
            knowledge_item::KnowledgeItem,
        },
    },
    utils::llm::cosine_similarity,
};

use crate::hybrid::{effective_limit, rrf_contribution, HybridSearch, RankedResult};

pub const DEFAULT_TOP_K: usize = 10;
/// Candidate pool requested from hybrid search before filtering.
pub const CANDIDATE_LIMIT: i64 = 50;
/// Cosine similarity above which two items count as duplicates.
pub const DEDUP_THRESHOLD: f32 = 0.95;
pub const FRESHNESS_WINDOW_DAYS: i64 = 30;

/// Contract point for the external ACL engine. The default allows
/// everything; deployments plug their own policy in.
#[async_trait]
pub trait PermissionFilter: Send + Sync {
    async fn can_read(
        &self,
        workspace_id: &str,
        user_id: &str,
        knowledge_item_id: &str,
    ) -> Result<bool, AppError>;
}

pub struct AllowAll;

#[async_trait]
impl PermissionFilter for AllowAll {
    async fn can_read(&self, _: &str, _: &str, _: &str) -> Result<bool, AppError> {
        Ok(true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvidenceSource {
    pub evidence_id: String,
    pub knowledge_item_id: String,
    pub title: String,
    pub snippet: String,
    pub method: RetrievalMethod,
    pub score: f32,
    pub stale: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvidencePack {
    pub sources: Vec<EvidenceSource>,
    pub confidence: Confidence,
    pub total_candidates: usize,
    pub filtered_count: usize,
    pub warnings: Vec<String>,
}

impl EvidencePack {
    pub fn evidence_ids(&self) -> Vec<String> {
        self.sources.iter().map(|s| s.evidence_id.clone()).collect()
    }
}

/// Normalizes a fused score so the theoretical RRF maximum over two lists
/// (rank 0 in both) maps to 1.0.
pub fn normalized_score(score: f32) -> f32 {
    let max = 2.0 * rrf_contribution(0);
    (score / max).clamp(0.0, 1.0)
}

pub fn confidence_for(top_normalized: Option<f32>) -> Confidence {
    match top_normalized {
        Some(score) if score >= 0.8 => Confidence::High,
        Some(score) if score >= 0.5 => Confidence::Medium,
        _ => Confidence::Low,
    }
}

/// Builds the curated, deduplicated, confidence-scored evidence pack that
/// agent runs ground their decisions on. Selected candidates are persisted
/// as immutable evidence rows for audit.
pub struct EvidencePackBuilder {
    db: Arc<SurrealDbClient>,
    search: Arc<HybridSearch>,
    filter: Arc<dyn PermissionFilter>,
}

impl EvidencePackBuilder {
    pub fn new(
        db: Arc<SurrealDbClient>,
        search: Arc<HybridSearch>,
        filter: Arc<dyn PermissionFilter>,
    ) -> Self {
        Self { db, search, filter }
    }

    #[instrument(skip(self), fields(workspace_id))]
    pub async fn build_pack(
        &self,
        workspace_id: &str,
        user_id: &str,
        query: &str,
        limit: Option<i64>,
    ) -> Result<EvidencePack, AppError> {
        let top_k = effective_limit(limit, DEFAULT_TOP_K);

        let candidates = self
            .search
            .search(workspace_id, query, Some(CANDIDATE_LIMIT))
            .await?;
        let total_candidates = candidates.len();

        let mut permitted = Vec::with_capacity(candidates.len());
        let mut permission_filtered = 0usize;
        for candidate in candidates {
            if self
                .filter
                .can_read(workspace_id, user_id, &candidate.knowledge_item_id)
                .await?
            {
                permitted.push(candidate);
            } else {
                permission_filtered += 1;
            }
        }

        let (selected, deduplicated) = self.dedup(workspace_id, permitted, top_k).await?;

        let mut stale_count = 0usize;
        let mut sources = Vec::with_capacity(selected.len());
        let mut rows = Vec::with_capacity(selected.len());
        let freshness_cutoff = Utc::now() - ChronoDuration::days(FRESHNESS_WINDOW_DAYS);

        for candidate in &selected {
            let stale = match KnowledgeItem::get_scoped(
                &self.db,
                workspace_id,
                &candidate.knowledge_item_id,
            )
            .await?
            {
                Some(item) => item.updated_at < freshness_cutoff,
                None => false,
            };
            if stale {
                stale_count += 1;
            }

            let row = Evidence::new(
                candidate.knowledge_item_id.clone(),
                workspace_id.to_string(),
                candidate.method,
                candidate.score,
                Some(candidate.snippet.clone()),
            );
            sources.push(EvidenceSource {
                evidence_id: row.id.clone(),
                knowledge_item_id: candidate.knowledge_item_id.clone(),
                title: candidate.title.clone(),
                snippet: candidate.snippet.clone(),
                method: candidate.method,
                score: candidate.score,
                stale,
            });
            rows.push(row);
        }

        Evidence::insert_many(&self.db, rows).await?;

        let confidence =
            confidence_for(selected.first().map(|top| normalized_score(top.score)));

        let mut warnings = Vec::new();
        if sources.is_empty() {
            warnings.push("no sources found".to_string());
        }
        if deduplicated > 0 {
            warnings.push(format!("{deduplicated} items deduplicated"));
        }
        if stale_count > 0 {
            warnings.push(format!("{stale_count} items stale"));
        }

        Ok(EvidencePack {
            sources,
            confidence,
            total_candidates,
            filtered_count: permission_filtered + deduplicated,
            warnings,
        })
    }

    /// Greedy selection in fused-score order. A candidate whose representative
    /// vector sits within `DEDUP_THRESHOLD` of an already-selected one is
    /// dropped; items without an embedded representative pass through.
    async fn dedup(
        &self,
        workspace_id: &str,
        candidates: Vec<RankedResult>,
        top_k: usize,
    ) -> Result<(Vec<RankedResult>, usize), AppError> {
        let mut selected: Vec<RankedResult> = Vec::with_capacity(top_k);
        let mut representatives: Vec<Vec<f32>> = Vec::with_capacity(top_k);
        let mut deduplicated = 0usize;

        for candidate in candidates {
            if selected.len() >= top_k {
                break;
            }

            let representative = ChunkVector::representative_for_item(
                &self.db,
                workspace_id,
                &candidate.knowledge_item_id,
            )
            .await?;

            match representative {
                Some(vector) => {
                    let duplicate = representatives
                        .iter()
                        .any(|kept| cosine_similarity(kept, &vector) > DEDUP_THRESHOLD);
                    if duplicate {
                        deduplicated += 1;
                    } else {
                        representatives.push(vector);
                        selected.push(candidate);
                    }
                }
                None => selected.push(candidate),
            }
        }

        Ok((selected, deduplicated))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{
        bus::EventBus,
        storage::types::knowledge_item::SourceType,
        utils::llm::LlmProvider,
    };
    use ingestion_pipeline::{Embedder, IngestParams, IngestionService};
    use std::time::Duration;
    use uuid::Uuid;

    struct DenyItem(String);

    #[async_trait]
    impl PermissionFilter for DenyItem {
        async fn can_read(&self, _: &str, _: &str, item: &str) -> Result<bool, AppError> {
            Ok(item != self.0)
        }
    }

    struct Harness {
        db: Arc<SurrealDbClient>,
        ingestion: IngestionService,
        embedder: Embedder,
        search: Arc<HybridSearch>,
    }

    async fn setup() -> Harness {
        let db = Arc::new(
            SurrealDbClient::memory("test_ns", &Uuid::now_v7().to_string())
                .await
                .expect("Failed to start in-memory surrealdb"),
        );
        db.apply_migrations().await.expect("migrations");
        let bus = EventBus::shared();
        let provider = Arc::new(LlmProvider::hashed(64));
        Harness {
            ingestion: IngestionService::new(db.clone(), bus),
            embedder: Embedder::new(db.clone(), provider.clone()),
            search: Arc::new(HybridSearch::new(
                db.clone(),
                provider,
                Duration::from_secs(5),
            )),
            db,
        }
    }

    fn builder(h: &Harness, filter: Arc<dyn PermissionFilter>) -> EvidencePackBuilder {
        EvidencePackBuilder::new(h.db.clone(), h.search.clone(), filter)
    }

    async fn seed(h: &Harness, ws: &str, title: &str, content: &str) -> String {
        let item = h
            .ingestion
            .ingest(IngestParams {
                workspace_id: ws.to_string(),
                source_type: SourceType::KbArticle,
                title: title.to_string(),
                raw_content: content.to_string(),
                entity_type: None,
                entity_id: None,
                metadata: None,
            })
            .await
            .expect("ingest");
        h.embedder.process_item(&item.id, ws).await.expect("embed");
        item.id
    }

    #[test]
    fn normalization_maps_double_rank_zero_to_one() {
        let perfect = 2.0 * rrf_contribution(0);
        assert!((normalized_score(perfect) - 1.0).abs() < 1e-6);
        assert!(normalized_score(rrf_contribution(0)) < 1.0);
    }

    #[test]
    fn confidence_thresholds() {
        assert_eq!(confidence_for(Some(0.95)), Confidence::High);
        assert_eq!(confidence_for(Some(0.8)), Confidence::High);
        assert_eq!(confidence_for(Some(0.6)), Confidence::Medium);
        assert_eq!(confidence_for(Some(0.2)), Confidence::Low);
        assert_eq!(confidence_for(None), Confidence::Low);
    }

    #[tokio::test]
    async fn near_duplicates_are_deduplicated_with_a_warning() {
        let h = setup().await;
        let body = "reset the user password from the admin console then notify the requester";
        seed(&h, "ws_1", "Password reset", body).await;
        seed(&h, "ws_1", "Password reset (copy)", body).await;
        seed(&h, "ws_1", "Password reset (old)", body).await;

        let pack = builder(&h, Arc::new(AllowAll))
            .build_pack("ws_1", "user_1", "password reset", Some(10))
            .await
            .expect("pack");

        assert_eq!(pack.total_candidates, 3);
        assert!(pack.filtered_count >= 1);
        assert!(pack.sources.len() < 3);
        assert_eq!(pack.confidence, Confidence::High);
        assert!(pack
            .warnings
            .iter()
            .any(|w| w.contains("items deduplicated")));
    }

    #[tokio::test]
    async fn empty_pack_has_low_confidence_and_warning() {
        let h = setup().await;
        let pack = builder(&h, Arc::new(AllowAll))
            .build_pack("ws_1", "user_1", "quantum entanglement support", None)
            .await
            .expect("pack");

        assert!(pack.sources.is_empty());
        assert_eq!(pack.confidence, Confidence::Low);
        assert!(pack.warnings.iter().any(|w| w == "no sources found"));
        assert_eq!(pack.total_candidates, 0);
    }

    #[tokio::test]
    async fn permission_filter_drops_candidates() {
        let h = setup().await;
        let denied = seed(&h, "ws_1", "Secret runbook", "privileged escalation runbook").await;
        seed(&h, "ws_1", "Public runbook", "privileged escalation overview for everyone").await;

        let pack = builder(&h, Arc::new(DenyItem(denied.clone())))
            .build_pack("ws_1", "user_1", "escalation runbook", None)
            .await
            .expect("pack");

        assert!(pack.sources.iter().all(|s| s.knowledge_item_id != denied));
        assert!(pack.filtered_count >= 1);
    }

    #[tokio::test]
    async fn selected_sources_are_persisted_as_evidence() {
        let h = setup().await;
        seed(&h, "ws_1", "VPN restart", "restart the vpn appliance").await;

        let pack = builder(&h, Arc::new(AllowAll))
            .build_pack("ws_1", "user_1", "vpn restart", None)
            .await
            .expect("pack");

        assert_eq!(pack.sources.len(), 1);
        let evidence = Evidence::get_scoped(&h.db, "ws_1", &pack.sources[0].evidence_id)
            .await
            .expect("get")
            .expect("evidence row");
        assert_eq!(evidence.knowledge_item_id, pack.sources[0].knowledge_item_id);
        assert_eq!(evidence.method, pack.sources[0].method);
    }

    #[tokio::test]
    async fn stale_items_raise_a_freshness_warning() {
        let h = setup().await;
        let item_id = seed(&h, "ws_1", "Ancient runbook", "legacy mainframe restart steps").await;

        // Age the item past the freshness window.
        h.db.client
            .query(
                "UPDATE type::thing('knowledge_item', $id)
                 SET updated_at = time::now() - 90d;",
            )
            .bind(("id", item_id))
            .await
            .expect("age item")
            .check()
            .expect("aged");

        let pack = builder(&h, Arc::new(AllowAll))
            .build_pack("ws_1", "user_1", "mainframe restart", None)
            .await
            .expect("pack");

        assert_eq!(pack.sources.len(), 1);
        assert!(pack.sources[0].stale);
        assert!(pack.warnings.iter().any(|w| w.contains("items stale")));
    }

    #[tokio::test]
    async fn top_k_is_clamped() {
        let h = setup().await;
        for i in 0..4 {
            seed(
                &h,
                "ws_1",
                &format!("Networking guide {i}"),
                &format!("network switch firmware guide volume {i} with distinct extras {i}"),
            )
            .await;
        }

        let pack = builder(&h, Arc::new(AllowAll))
            .build_pack("ws_1", "user_1", "network firmware guide", Some(2))
            .await
            .expect("pack");

        assert!(pack.sources.len() <= 2);
        assert!(pack.total_candidates >= 2);
    }
}
