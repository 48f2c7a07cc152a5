//! Remote embedding provider.
//!
//! Dense query embeddings come from an OpenAI-compatible `/embeddings`
//! endpoint. A process-scope TTL cache keyed by `text + model` avoids
//! re-embedding repeated queries and HyDE documents.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::cache::TtlCache;
use crate::stores::qdrant::SparseVector;
use crate::types::{CoreError, Result};

/// Embedding provider contract.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed one text into a dense vector.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Optional sparse encoding for hybrid dense+sparse stores. Providers
    /// without a sparse encoder return `None` and the store runs dense-only.
    async fn embed_sparse(&self, _text: &str) -> Result<Option<SparseVector>> {
        Ok(None)
    }

    /// Output dimensionality.
    fn dimensions(&self) -> usize;

    fn model(&self) -> &str;
}

/// Embedder backed by an OpenAI-compatible embeddings endpoint, with a
/// process-scope cache.
pub struct RemoteEmbedder {
    http: reqwest::Client,
    api_base: String,
    api_key: String,
    model: String,
    dimensions: usize,
    cache: Arc<TtlCache<Vec<f32>>>,
}

impl RemoteEmbedder {
    pub fn new(
        api_base: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        dimensions: usize,
        cache_max_entries: usize,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            dimensions,
            cache: Arc::new(TtlCache::new(cache_max_entries, cache_ttl)),
        }
    }

    /// Cache statistics, for warmup and health reporting.
    pub fn cache_stats(&self) -> crate::cache::CacheStats {
        self.cache.stats()
    }
}

#[async_trait]
impl Embedder for RemoteEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let key = TtlCache::<Vec<f32>>::compute_key(&self.model, text);
        if let Some(cached) = self.cache.get(&key) {
            return Ok(cached);
        }

        let url = format!("{}/embeddings", self.api_base);
        let body = json!({
            "model": self.model,
            "input": text,
            "dimensions": self.dimensions,
        });

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| CoreError::Upstream(format!("Embedding request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(CoreError::Upstream(format!(
                "Embedding endpoint returned {}",
                response.status()
            )));
        }

        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| CoreError::Upstream(format!("Embedding response parse failed: {}", e)))?;

        let embedding: Vec<f32> = payload["data"][0]["embedding"]
            .as_array()
            .map(|values| {
                values
                    .iter()
                    .filter_map(|v| v.as_f64().map(|f| f as f32))
                    .collect()
            })
            .unwrap_or_default();

        if embedding.len() != self.dimensions {
            return Err(CoreError::Upstream(format!(
                "Embedding dimension mismatch: expected {}, got {}",
                self.dimensions,
                embedding.len()
            )));
        }

        self.cache.set(&key, embedding.clone());
        Ok(embedding)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_embedder_reports_model_and_dims() {
        let embedder = RemoteEmbedder::new(
            "https://api.openai.com/v1",
            "",
            "text-embedding-3-large",
            3072,
            16,
            Duration::from_secs(60),
        );
        assert_eq!(embedder.dimensions(), 3072);
        assert_eq!(embedder.model(), "text-embedding-3-large");
        assert_eq!(embedder.cache_stats().entry_count, 0);
    }
}
