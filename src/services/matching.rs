// AI matching: rank candidate users by cosine similarity between profile
// embeddings. All embedding calls are awaited through a bounded
// fan-out/fan-in before ranking; there are no fixed timers anywhere in
// this path, so results are complete and deterministic for fixed
// embeddings.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

use crate::config::AiConfig;
use crate::error::{AppError, AppResult};
use crate::models::UserProfile;
use crate::store::MeetStore;

/// Abstract chat-completion/embedding capability. Provider selection and
/// failover live behind this seam.
#[async_trait]
pub trait AiProvider: Send + Sync {
    async fn embed(&self, text: &str) -> AppResult<Vec<f32>>;
    async fn chat_complete(&self, prompt: &str, context: Option<&str>) -> AppResult<String>;
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    input: &'a str,
}

#[derive(Deserialize)]
struct EmbedResponse {
    embedding: Vec<f32>,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<&'a str>,
}

#[derive(Deserialize)]
struct ChatResponse {
    reply: String,
}

/// JSON-over-HTTP provider client.
pub struct HttpAiProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl HttpAiProvider {
    pub fn new(config: &AiConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        }
    }

    fn request(&self, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.client.post(format!("{}{}", self.endpoint, path));
        if !self.api_key.is_empty() {
            builder = builder.bearer_auth(&self.api_key);
        }
        builder
    }
}

#[async_trait]
impl AiProvider for HttpAiProvider {
    async fn embed(&self, text: &str) -> AppResult<Vec<f32>> {
        let response = self
            .request("/embeddings")
            .json(&EmbedRequest { input: text })
            .send()
            .await
            .map_err(|e| AppError::Upstream(format!("Embedding request failed: {}", e)))?
            .error_for_status()
            .map_err(|e| AppError::Upstream(format!("Embedding provider error: {}", e)))?;

        let body: EmbedResponse = response
            .json()
            .await
            .map_err(|e| AppError::Upstream(format!("Invalid embedding response: {}", e)))?;
        Ok(body.embedding)
    }

    async fn chat_complete(&self, prompt: &str, context: Option<&str>) -> AppResult<String> {
        let response = self
            .request("/chat")
            .json(&ChatRequest { prompt, context })
            .send()
            .await
            .map_err(|e| AppError::Upstream(format!("Chat request failed: {}", e)))?
            .error_for_status()
            .map_err(|e| AppError::Upstream(format!("Chat provider error: {}", e)))?;

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| AppError::Upstream(format!("Invalid chat response: {}", e)))?;
        Ok(body.reply)
    }
}

/// `dot(a,b) / (|a| * |b|)`. Zero-magnitude vectors score 0.0 instead of
/// propagating NaN into the ranking.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    dot / (mag_a * mag_b)
}

#[derive(Clone)]
pub struct MatchService {
    store: Arc<MeetStore>,
    provider: Arc<dyn AiProvider>,
    embed_concurrency: usize,
}

impl MatchService {
    pub fn new(store: Arc<MeetStore>, provider: Arc<dyn AiProvider>, embed_concurrency: usize) -> Self {
        Self {
            store,
            provider,
            embed_concurrency: embed_concurrency.max(1),
        }
    }

    pub async fn chat(&self, prompt: &str, context: Option<&str>) -> AppResult<String> {
        self.provider.chat_complete(prompt, context).await
    }

    /// Top-N candidate profiles by embedding similarity to the target
    /// user. Self is never included. A candidate whose embedding call
    /// fails is dropped from the ranking rather than failing the request.
    pub async fn find_top_matches(
        &self,
        user_id: &str,
        top_n: usize,
    ) -> AppResult<Vec<UserProfile>> {
        let target = self
            .store
            .get_user(user_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("User {} not found", user_id)))?;

        let target_embedding = self.provider.embed(&target.profile_text()).await?;

        let candidates: Vec<UserProfile> = self
            .store
            .list_users()
            .await?
            .into_iter()
            .filter(|u| u.id != user_id)
            .collect();

        // Ordered fan-out with a concurrency cap; `buffered` preserves the
        // stable candidate order so ties rank identically on every call.
        let provider = self.provider.clone();
        let scored: Vec<Option<(UserProfile, f32)>> = stream::iter(candidates)
            .map(|candidate| {
                let provider = provider.clone();
                let target_embedding = target_embedding.clone();
                async move {
                    match provider.embed(&candidate.profile_text()).await {
                        Ok(embedding) => {
                            let score = cosine_similarity(&target_embedding, &embedding);
                            Some((candidate, score))
                        }
                        Err(err) => {
                            warn!(candidate = %candidate.id, "Skipping candidate, embedding failed: {}", err);
                            None
                        }
                    }
                }
            })
            .buffered(self.embed_concurrency)
            .collect()
            .await;

        let mut ranked: Vec<(UserProfile, f32)> = scored.into_iter().flatten().collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        ranked.truncate(top_n);

        Ok(ranked.into_iter().map(|(profile, _)| profile).collect())
    }
}
