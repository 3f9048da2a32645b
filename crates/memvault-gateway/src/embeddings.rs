// crates/memvault-gateway/src/embeddings.rs
// Embedding providers used when a request carries no precomputed vector

use crate::config::{EmbeddingProvider, EmbeddingsConfig};
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

/// Approximate chars per token times the common 8192-token input cap
const MAX_TEXT_CHARS: usize = 8192 * 4;

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Provider identifier, for logs and health output
    fn provider(&self) -> &'static str;

    fn dimensions(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Build the embedder named by the config.
pub fn from_config(config: &EmbeddingsConfig, http: reqwest::Client) -> Result<Arc<dyn Embedder>> {
    match config.provider {
        EmbeddingProvider::Hash => Ok(Arc::new(HashEmbedder::new(config.dimensions))),
        EmbeddingProvider::OpenAi => {
            let api_key = config.api_key.clone().ok_or_else(|| {
                GatewayError::invalid("openai embeddings need MEMVAULT_EMBEDDINGS_API_KEY")
            })?;
            Ok(Arc::new(OpenAiCompatibleEmbedder::new(
                http,
                &config.base_url,
                &config.model,
                api_key,
                config.dimensions,
            )))
        }
    }
}

/// Cut at a char boundary at or below `max` bytes.
fn truncate_at_boundary(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Signed feature hashing of lowercased word tokens, L2-normalized.
/// Deterministic and offline; similar wording gives similar vectors.
pub struct HashEmbedder {
    dimensions: usize,
}

impl HashEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }

    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dimensions];
        if self.dimensions == 0 {
            return v;
        }

        let lowered = text.to_lowercase();
        let mut tokens: Vec<&str> = lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .collect();
        let trimmed = lowered.trim();
        if tokens.is_empty() && !trimmed.is_empty() {
            tokens.push(trimmed);
        }

        for token in tokens {
            let h = fnv1a(token.as_bytes());
            let idx = (h % self.dimensions as u64) as usize;
            let sign = if h >> 63 == 0 { 1.0 } else { -1.0 };
            v[idx] += sign;
        }

        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        v
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325u64, |h, b| {
        (h ^ u64::from(*b)).wrapping_mul(0x0100_0000_01b3)
    })
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn provider(&self) -> &'static str {
        "hash"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_sync(truncate_at_boundary(text, MAX_TEXT_CHARS)))
    }
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

/// Any server speaking the OpenAI `/embeddings` shape
pub struct OpenAiCompatibleEmbedder {
    http: reqwest::Client,
    url: String,
    model: String,
    api_key: String,
    dimensions: usize,
}

impl OpenAiCompatibleEmbedder {
    pub fn new(
        http: reqwest::Client,
        base_url: &str,
        model: &str,
        api_key: String,
        dimensions: usize,
    ) -> Self {
        Self {
            http,
            url: format!("{}/embeddings", base_url.trim_end_matches('/')),
            model: model.to_string(),
            api_key,
            dimensions,
        }
    }
}

#[async_trait]
impl Embedder for OpenAiCompatibleEmbedder {
    fn provider(&self) -> &'static str {
        "openai"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let text = truncate_at_boundary(text, MAX_TEXT_CHARS);
        let body = serde_json::json!({
            "model": self.model,
            "input": text,
            "dimensions": self.dimensions,
        });

        let response = self
            .http
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .timeout(crate::http::FAST_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::Internal(format!("embeddings request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorResponse>(&text)
                .map(|e| e.error.message)
                .unwrap_or(text);
            return Err(GatewayError::Internal(format!(
                "embeddings API error {status}: {message}"
            )));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Internal(format!("embeddings response: {e}")))?;
        let embedding = parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| GatewayError::Internal("embeddings response had no data".into()))?;

        debug!(dims = embedding.len(), model = %self.model, "Embedded text");
        Ok(embedding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[test]
    fn test_hash_embedder_normalized_and_deterministic() {
        let e = HashEmbedder::new(384);
        let a = e.embed_sync("hello world");
        assert_eq!(a.len(), 384);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        assert_eq!(a, e.embed_sync("Hello, WORLD!"));
    }

    #[test]
    fn test_hash_embedder_similarity_tracks_overlap() {
        let e = HashEmbedder::new(384);
        let base = e.embed_sync("the cat sat on the mat");
        let near = e.embed_sync("the cat sat on a mat");
        let far = e.embed_sync("quarterly revenue projections");
        assert!(cosine(&base, &near) > cosine(&base, &far));
    }

    #[test]
    fn test_hash_embedder_symbols_only() {
        let e = HashEmbedder::new(16);
        let v = e.embed_sync("!!!");
        assert!(v.iter().any(|x| *x != 0.0));
        assert!(e.embed_sync("   ").iter().all(|x| *x == 0.0));
    }

    #[test]
    fn test_truncate_at_boundary() {
        assert_eq!(truncate_at_boundary("hello", 10), "hello");
        assert_eq!(truncate_at_boundary("hello", 3), "hel");
        // 'é' is two bytes
        assert_eq!(truncate_at_boundary("héllo", 2), "h");
    }

    #[tokio::test]
    async fn test_from_config() {
        let mut config = EmbeddingsConfig::default();
        let e = from_config(&config, reqwest::Client::new()).unwrap();
        assert_eq!(e.provider(), "hash");
        assert_eq!(e.dimensions(), 384);
        assert_eq!(e.embed("hi").await.unwrap().len(), 384);

        config.provider = EmbeddingProvider::OpenAi;
        assert!(from_config(&config, reqwest::Client::new()).is_err());
        config.api_key = Some("sk-test".into());
        assert_eq!(from_config(&config, reqwest::Client::new()).unwrap().provider(), "openai");
    }
}
