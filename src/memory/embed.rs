//! Embedding backends for the solution memory.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

const OPENROUTER_EMBEDDINGS_URL: &str = "https://openrouter.ai/api/v1/embeddings";

/// Produces fixed-dimension embedding vectors for similarity keys.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>>;

    /// The dimension every returned vector has.
    fn dimension(&self) -> usize;
}

/// Embedding client using the OpenRouter API.
pub struct OpenRouterEmbedder {
    client: Client,
    api_key: String,
    model: String,
    dimension: usize,
}

impl OpenRouterEmbedder {
    pub fn new(api_key: String, model: String, dimension: usize) -> Self {
        Self {
            client: Client::new(),
            api_key,
            model,
            dimension,
        }
    }
}

#[async_trait]
impl Embedder for OpenRouterEmbedder {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let request = EmbeddingRequest {
            model: self.model.clone(),
            input: vec![text.to_string()],
        };

        let resp = self
            .client
            .post(OPENROUTER_EMBEDDINGS_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .header("X-Title", "autodebug memory")
            .json(&request)
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await?;

        if !status.is_success() {
            anyhow::bail!("Embedding API error: {} - {}", status, text);
        }

        let response: EmbeddingResponse = serde_json::from_str(&text)
            .map_err(|e| anyhow::anyhow!("Failed to parse embedding response: {} - {}", e, text))?;

        let embedding = response
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| anyhow::anyhow!("No embedding returned"))?;

        if embedding.len() != self.dimension {
            tracing::warn!(
                "Embedding has dimension {} but expected {}",
                embedding.len(),
                self.dimension
            );
        }

        Ok(embedding)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Deterministic local embedder: hashed bag-of-tokens, L2-normalized.
///
/// Used when no API key is configured, and in tests. Far weaker than a real
/// embedding model but keeps retrieval meaningful for overlapping wording.
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut vector = vec![0.0f32; self.dimension];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let mut hasher = DefaultHasher::new();
            token.to_lowercase().hash(&mut hasher);
            let index = (hasher.finish() as usize) % self.dimension;
            vector[index] += 1.0;
        }

        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        Ok(vector)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest {
    model: String,
    input: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hash_embedder_is_deterministic_and_normalized() {
        let embedder = HashEmbedder::new(64);
        let a = embedder.embed("off-by-one in pagination").await.unwrap();
        let b = embedder.embed("off-by-one in pagination").await.unwrap();
        assert_eq!(a, b);

        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn similar_wording_scores_higher() {
        let embedder = HashEmbedder::new(64);
        let query = embedder.embed("pagination off by one error").await.unwrap();
        let close = embedder.embed("off-by-one bug in pagination").await.unwrap();
        let far = embedder.embed("nullpointer in login handler").await.unwrap();

        let dot = |x: &[f32], y: &[f32]| -> f32 { x.iter().zip(y).map(|(a, b)| a * b).sum() };
        assert!(dot(&query, &close) > dot(&query, &far));
    }
}
