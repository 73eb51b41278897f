use std::{sync::Arc, time::Duration};

use agent_runtime::{
    executors::register_builtin_executors, AgentOrchestrator, PromptManager, ToolRegistry,
};
use common::{
    bus::EventBus,
    error::AppError,
    records::RecordStore,
    storage::db::SurrealDbClient,
    utils::{config::AppConfig, llm::LlmProvider},
};
use ingestion_pipeline::IngestionService;
use retrieval_pipeline::{AllowAll, EvidencePackBuilder, HybridSearch, PermissionFilter};

#[derive(Clone)]
pub struct ApiState {
    pub db: Arc<SurrealDbClient>,
    pub config: AppConfig,
    pub bus: Arc<EventBus>,
    pub provider: Arc<LlmProvider>,
    pub ingestion: IngestionService,
    pub reindexer: Arc<ingestion_pipeline::Reindexer>,
    pub search: Arc<HybridSearch>,
    pub evidence: Arc<EvidencePackBuilder>,
    pub registry: Arc<ToolRegistry>,
    pub orchestrator: Arc<AgentOrchestrator>,
    pub prompts: Arc<PromptManager>,
    pub records: RecordStore,
}

impl ApiState {
    /// Wires every core service onto one db/bus/provider triple. The
    /// executor table is fully registered here, before the registry is
    /// shared and becomes read-only.
    pub fn build(
        db: Arc<SurrealDbClient>,
        bus: Arc<EventBus>,
        provider: Arc<LlmProvider>,
        config: AppConfig,
    ) -> Result<Self, AppError> {
        Self::build_with_filter(db, bus, provider, config, Arc::new(AllowAll))
    }

    pub fn build_with_filter(
        db: Arc<SurrealDbClient>,
        bus: Arc<EventBus>,
        provider: Arc<LlmProvider>,
        config: AppConfig,
        filter: Arc<dyn PermissionFilter>,
    ) -> Result<Self, AppError> {
        let records = RecordStore::new(db.clone(), bus.clone());
        let ingestion = IngestionService::new(db.clone(), bus.clone());
        let reindexer = Arc::new(ingestion_pipeline::Reindexer::new(
            db.clone(),
            ingestion.clone(),
        ));

        let search = Arc::new(HybridSearch::new(
            db.clone(),
            provider.clone(),
            Duration::from_secs(config.search_timeout_secs),
        ));
        let evidence = Arc::new(EvidencePackBuilder::new(db.clone(), search.clone(), filter));

        let mut registry = ToolRegistry::new(db.clone());
        register_builtin_executors(
            &mut registry,
            records.clone(),
            ingestion.clone(),
            db.clone(),
        )
        .map_err(AppError::from)?;
        let registry = Arc::new(registry);

        let orchestrator = Arc::new(AgentOrchestrator::new(
            db.clone(),
            bus.clone(),
            registry.clone(),
            evidence.clone(),
            records.clone(),
        ));
        let prompts = Arc::new(PromptManager::new(db.clone()));

        Ok(Self {
            db,
            config,
            bus,
            provider,
            ingestion,
            reindexer,
            search,
            evidence,
            registry,
            orchestrator,
            prompts,
            records,
        })
    }
}
