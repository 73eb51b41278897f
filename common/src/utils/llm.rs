use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    time::Duration,
};

use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs, CreateEmbeddingRequestArgs,
    },
    Client,
};
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::debug;

use crate::{
    error::AppError,
    utils::config::{AppConfig, LlmBackend},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatOutput {
    pub content: String,
    pub tokens: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct EmbedOutput {
    pub embeddings: Vec<Vec<f32>>,
    pub tokens: Option<u32>,
}

/// Provider port consumed by the embedder and hybrid search.
///
/// Batching is mandatory: one `embed_batch` call issues exactly one request
/// against the backing server, whatever the batch size.
#[derive(Clone)]
pub struct LlmProvider {
    inner: ProviderInner,
    embed_timeout: Duration,
    chat_timeout: Duration,
}

#[derive(Clone)]
enum ProviderInner {
    Http {
        client: Client<OpenAIConfig>,
        base_url: String,
        embed_model: String,
        chat_model: String,
    },
    Hashed {
        dimension: usize,
    },
}

impl LlmProvider {
    pub fn from_config(config: &AppConfig) -> Self {
        let inner = match config.llm_provider {
            LlmBackend::Http => ProviderInner::Http {
                client: Client::with_config(
                    OpenAIConfig::new()
                        .with_api_key(&config.llm_api_key)
                        .with_api_base(&config.llm_base_url),
                ),
                base_url: config.llm_base_url.clone(),
                embed_model: config.embed_model.clone(),
                chat_model: config.chat_model.clone(),
            },
            LlmBackend::Hashed => ProviderInner::Hashed {
                dimension: config.embedding_dimension.max(1),
            },
        };

        Self {
            inner,
            embed_timeout: Duration::from_secs(config.embed_timeout_secs),
            chat_timeout: Duration::from_secs(config.chat_timeout_secs),
        }
    }

    /// Deterministic in-process provider. No network, stable across runs.
    pub fn hashed(dimension: usize) -> Self {
        Self {
            inner: ProviderInner::Hashed {
                dimension: dimension.max(1),
            },
            embed_timeout: Duration::from_secs(10),
            chat_timeout: Duration::from_secs(30),
        }
    }

    pub fn backend_label(&self) -> &'static str {
        match self.inner {
            ProviderInner::Http { .. } => "http",
            ProviderInner::Hashed { .. } => "hashed",
        }
    }

    /// Embedding dimension when known up front; the HTTP backend reports it
    /// only through the vectors it returns.
    pub fn dimension(&self) -> Option<usize> {
        match &self.inner {
            ProviderInner::Http { .. } => None,
            ProviderInner::Hashed { dimension } => Some(*dimension),
        }
    }

    pub async fn embed_batch(&self, texts: &[String]) -> Result<EmbedOutput, AppError> {
        if texts.is_empty() {
            return Ok(EmbedOutput {
                embeddings: Vec::new(),
                tokens: None,
            });
        }

        match &self.inner {
            ProviderInner::Hashed { dimension } => Ok(EmbedOutput {
                embeddings: texts
                    .iter()
                    .map(|text| hashed_embedding(text, *dimension))
                    .collect(),
                tokens: None,
            }),
            ProviderInner::Http {
                client,
                embed_model,
                ..
            } => {
                let request = CreateEmbeddingRequestArgs::default()
                    .model(embed_model)
                    .input(texts.to_vec())
                    .build()?;

                let response = timeout(self.embed_timeout, client.embeddings().create(request))
                    .await
                    .map_err(|_| {
                        AppError::DependencyUnavailable("embedding request timed out".into())
                    })??;

                debug!(
                    batch = texts.len(),
                    vectors = response.data.len(),
                    "embedding batch completed"
                );

                let tokens = response.usage.total_tokens;
                Ok(EmbedOutput {
                    embeddings: response.data.into_iter().map(|d| d.embedding).collect(),
                    tokens: Some(tokens),
                })
            }
        }
    }

    pub async fn chat(
        &self,
        messages: Vec<ChatMessage>,
        temperature: Option<f32>,
        max_tokens: Option<u32>,
    ) -> Result<ChatOutput, AppError> {
        match &self.inner {
            ProviderInner::Hashed { .. } => Ok(hashed_chat(&messages)),
            ProviderInner::Http {
                client, chat_model, ..
            } => {
                let request_messages = messages
                    .into_iter()
                    .map(to_request_message)
                    .collect::<Result<Vec<_>, AppError>>()?;

                let mut builder = CreateChatCompletionRequestArgs::default();
                builder.model(chat_model).messages(request_messages);
                if let Some(temperature) = temperature {
                    builder.temperature(temperature);
                }
                if let Some(max_tokens) = max_tokens {
                    builder.max_tokens(max_tokens);
                }
                let request = builder.build()?;

                let response = timeout(self.chat_timeout, client.chat().create(request))
                    .await
                    .map_err(|_| {
                        AppError::DependencyUnavailable("chat request timed out".into())
                    })??;

                let content = response
                    .choices
                    .first()
                    .and_then(|choice| choice.message.content.clone())
                    .unwrap_or_default();

                Ok(ChatOutput {
                    content,
                    tokens: response.usage.map(|u| u.total_tokens),
                })
            }
        }
    }

    pub async fn health_check(&self) -> Result<(), AppError> {
        match &self.inner {
            ProviderInner::Hashed { .. } => Ok(()),
            ProviderInner::Http { base_url, .. } => {
                let url = format!("{}/models", base_url.trim_end_matches('/'));
                let response = reqwest::Client::new()
                    .get(&url)
                    .timeout(Duration::from_secs(5))
                    .send()
                    .await
                    .map_err(|err| {
                        AppError::DependencyUnavailable(format!(
                            "LLM provider unreachable: {err}"
                        ))
                    })?;

                if response.status().is_success() {
                    Ok(())
                } else {
                    Err(AppError::DependencyUnavailable(format!(
                        "LLM provider returned {}",
                        response.status()
                    )))
                }
            }
        }
    }
}

fn to_request_message(message: ChatMessage) -> Result<ChatCompletionRequestMessage, AppError> {
    let built = match message.role {
        ChatRole::System => ChatCompletionRequestSystemMessageArgs::default()
            .content(message.content)
            .build()?
            .into(),
        ChatRole::User => ChatCompletionRequestUserMessageArgs::default()
            .content(message.content)
            .build()?
            .into(),
        ChatRole::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
            .content(message.content)
            .build()?
            .into(),
    };

    Ok(built)
}

/// Bag-of-words embedding hashed into a fixed number of buckets, normalized
/// to unit length. Similar texts land in similar buckets, which is enough
/// for deterministic retrieval tests.
fn hashed_embedding(text: &str, dimension: usize) -> Vec<f32> {
    let dim = dimension.max(1);
    let mut vector = vec![0.0f32; dim];
    if text.is_empty() {
        return vector;
    }

    for token in tokens(text) {
        let idx = bucket(&token, dim);
        if let Some(slot) = vector.get_mut(idx) {
            *slot += 1.0;
        }
    }

    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in &mut vector {
            *value /= norm;
        }
    }

    vector
}

fn hashed_chat(messages: &[ChatMessage]) -> ChatOutput {
    let last_user = messages
        .iter()
        .rev()
        .find(|m| m.role == ChatRole::User)
        .map(|m| m.content.as_str())
        .unwrap_or_default();

    let mut content: String = last_user.chars().take(240).collect();
    if content.is_empty() {
        content = "No user input provided.".to_string();
    }

    ChatOutput {
        content,
        tokens: None,
    }
}

fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(|token| token.to_ascii_lowercase())
}

fn bucket(token: &str, dimension: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    token.hash(&mut hasher);
    (hasher.finish() as usize) % dimension
}

/// Cosine similarity between two vectors of equal dimension; 0.0 when either
/// is empty or the dimensions disagree.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a.sqrt() * norm_b.sqrt())
}
