use std::sync::Arc;

use api_router::{api_routes_v1, api_state::ApiState};
use axum::Router;
use common::{
    bus::{
        EventBus, TOPIC_KNOWLEDGE_INGESTED, TOPIC_RECORD_CREATED, TOPIC_RECORD_DELETED,
        TOPIC_RECORD_UPDATED,
    },
    storage::db::SurrealDbClient,
    utils::{config::get_config, llm::LlmProvider},
};
use ingestion_pipeline::Embedder;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Set up tracing
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    // Get config
    let config = get_config()?;

    let db = Arc::new(
        SurrealDbClient::new(
            &config.surrealdb_address,
            &config.surrealdb_username,
            &config.surrealdb_password,
            &config.surrealdb_namespace,
            &config.surrealdb_database,
        )
        .await?,
    );

    // Ensure db is initialized
    db.apply_migrations().await?;

    let bus = EventBus::shared();
    let provider = Arc::new(LlmProvider::from_config(&config));
    if let Err(err) = provider.health_check().await {
        warn!(error = %err, "LLM provider not reachable at startup; search will degrade to BM25-only");
    }

    let state = ApiState::build(db.clone(), bus.clone(), provider.clone(), config.clone())?;

    // Background consumers. Channels are taken before the server starts so
    // no event published during startup is missed.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let embedder = Arc::new(Embedder::new(db.clone(), provider));
    let embedder_events = bus.subscribe(TOPIC_KNOWLEDGE_INGESTED);
    let embedder_shutdown = shutdown_rx.clone();
    let embedder_handle = tokio::spawn(async move {
        embedder.run(embedder_events, embedder_shutdown).await;
    });

    let reindexer = state.reindexer.clone();
    let created = bus.subscribe(TOPIC_RECORD_CREATED);
    let updated = bus.subscribe(TOPIC_RECORD_UPDATED);
    let deleted = bus.subscribe(TOPIC_RECORD_DELETED);
    let reindexer_shutdown = shutdown_rx;
    let reindexer_handle = tokio::spawn(async move {
        reindexer
            .run(created, updated, deleted, reindexer_shutdown)
            .await;
    });

    let app: Router = api_routes_v1(&state);
    let app = Router::new().nest("/api/v1", app);

    info!("Starting server listening on 0.0.0.0:{}", config.http_port);
    let serve_address = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(serve_address).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!(error = %err, "failed to listen for shutdown signal");
            }
            info!("shutdown signal received");
        })
        .await?;

    // Consumers finish their current event, then exit.
    shutdown_tx.send(true).ok();
    bus.close();
    embedder_handle.await.ok();
    reindexer_handle.await.ok();

    Ok(())
}
