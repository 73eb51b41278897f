use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Clone, Copy, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LlmBackend {
    /// OpenAI-compatible HTTP inference server (the default local provider).
    Http,
    /// Deterministic in-process embeddings, used by tests and offline setups.
    Hashed,
}

fn default_llm_backend() -> LlmBackend {
    LlmBackend::Http
}

#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    pub surrealdb_address: String,
    pub surrealdb_username: String,
    pub surrealdb_password: String,
    pub surrealdb_namespace: String,
    pub surrealdb_database: String,
    pub http_port: u16,
    #[serde(default = "default_llm_backend")]
    pub llm_provider: LlmBackend,
    #[serde(default = "default_llm_base_url")]
    pub llm_base_url: String,
    #[serde(default = "default_llm_api_key")]
    pub llm_api_key: String,
    #[serde(default = "default_embed_model")]
    pub embed_model: String,
    #[serde(default = "default_chat_model")]
    pub chat_model: String,
    #[serde(default = "default_embedding_dimension")]
    pub embedding_dimension: usize,
    #[serde(default = "default_embed_timeout_secs")]
    pub embed_timeout_secs: u64,
    #[serde(default = "default_chat_timeout_secs")]
    pub chat_timeout_secs: u64,
    #[serde(default = "default_search_timeout_secs")]
    pub search_timeout_secs: u64,
}

fn default_llm_base_url() -> String {
    "http://127.0.0.1:8080/v1".to_string()
}

fn default_llm_api_key() -> String {
    "local".to_string()
}

fn default_embed_model() -> String {
    "nomic-embed-text".to_string()
}

fn default_chat_model() -> String {
    "llama3.1:8b".to_string()
}

fn default_embedding_dimension() -> usize {
    768
}

fn default_embed_timeout_secs() -> u64 {
    10
}

fn default_chat_timeout_secs() -> u64 {
    30
}

fn default_search_timeout_secs() -> u64 {
    5
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::default())
        .build()?;

    config.try_deserialize()
}

#[cfg(any(test, feature = "test-utils"))]
impl AppConfig {
    /// Config pointing at an in-memory database and the hashed LLM backend.
    pub fn for_tests() -> Self {
        Self {
            surrealdb_address: "mem://".into(),
            surrealdb_username: "root".into(),
            surrealdb_password: "root".into(),
            surrealdb_namespace: "test_ns".into(),
            surrealdb_database: "test_db".into(),
            http_port: 0,
            llm_provider: LlmBackend::Hashed,
            llm_base_url: default_llm_base_url(),
            llm_api_key: default_llm_api_key(),
            embed_model: default_embed_model(),
            chat_model: default_chat_model(),
            embedding_dimension: 16,
            embed_timeout_secs: default_embed_timeout_secs(),
            chat_timeout_secs: default_chat_timeout_secs(),
            search_timeout_secs: default_search_timeout_secs(),
        }
    }
}
