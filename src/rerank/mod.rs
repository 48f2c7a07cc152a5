//! Reranking providers.
//!
//! Rerankers are interchangeable behind the [`Reranker`] contract. Three
//! providers exist:
//!
//! - **local** - cross-encoder via fastembed (feature `local-rerank`),
//!   loaded lazily, cached for the process lifetime, run in batches
//! - **colbert** - late-interaction MaxSim over token embeddings, with a
//!   TTL + size bounded per-document embedding cache keyed by content hash
//! - **cohere** - remote rerank endpoint, with optional fallback to local
//!
//! Selection is by provider identifier, plus `auto` (development → local,
//! production → cohere). Reranking failures are recoverable: the pipeline
//! degrades to fused order. A fixed additive legal-domain boost is applied
//! to statute and case-law results by every provider.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use serde_json::json;

use crate::config::RagConfig;
use crate::llm::embeddings::Embedder;
use crate::types::{CoreError, Result, RetrievalResult};

/// One rerank score, positionally tied to the candidate slice.
#[derive(Debug, Clone, Copy)]
pub struct RerankScore {
    pub index: usize,
    pub score: f32,
}

/// Common contract for rerank providers.
#[async_trait]
pub trait Reranker: Send + Sync {
    /// Score each candidate's relevance to the query. Scores are positional;
    /// missing indices default to 0.
    async fn score(&self, query: &str, documents: &[String]) -> Result<Vec<RerankScore>>;

    fn id(&self) -> &'static str;
}

// ============================================================================
// Cohere Remote Reranker
// ============================================================================

/// Remote reranker speaking the Cohere v2 rerank protocol.
pub struct CohereReranker {
    http: reqwest::Client,
    api_base: String,
    api_key: String,
    model: String,
}

impl CohereReranker {
    pub fn new(
        api_base: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }
}

#[async_trait]
impl Reranker for CohereReranker {
    async fn score(&self, query: &str, documents: &[String]) -> Result<Vec<RerankScore>> {
        let url = format!("{}/v2/rerank", self.api_base);
        let body = json!({
            "model": self.model,
            "query": query,
            "documents": documents,
            "top_n": documents.len(),
        });

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| CoreError::Upstream(format!("Cohere rerank request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(CoreError::Upstream(format!(
                "Cohere rerank returned {}",
                response.status()
            )));
        }

        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| CoreError::Upstream(format!("Cohere response parse failed: {}", e)))?;

        Ok(payload["results"]
            .as_array()
            .map(|results| {
                results
                    .iter()
                    .filter_map(|r| {
                        Some(RerankScore {
                            index: r["index"].as_u64()? as usize,
                            score: r["relevance_score"].as_f64()? as f32,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    fn id(&self) -> &'static str {
        "cohere"
    }
}

// ============================================================================
// ColBERT-Style Late Interaction
// ============================================================================

struct CachedTokens {
    embeddings: Vec<Vec<f32>>,
    created_at: Instant,
}

/// Late-interaction reranker: MaxSim between query and document token
/// embeddings, averaged over query tokens.
///
/// Document token embeddings are cached per content hash with TTL-bound,
/// size-bounded eviction; within a request the cache turns repeated
/// candidates into lookups.
pub struct ColbertReranker {
    embedder: Arc<dyn Embedder>,
    cache: Mutex<LruCache<String, CachedTokens>>,
    ttl: Duration,
    max_tokens: usize,
}

impl ColbertReranker {
    pub fn new(embedder: Arc<dyn Embedder>, cache_max_entries: usize, ttl: Duration) -> Self {
        Self {
            embedder,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(cache_max_entries.max(1)).expect("non-zero"),
            )),
            ttl,
            max_tokens: 64,
        }
    }

    fn tokens(text: &str, max_tokens: usize) -> Vec<String> {
        text.split_whitespace()
            .filter(|t| t.chars().count() >= 3)
            .take(max_tokens)
            .map(|t| t.to_lowercase())
            .collect()
    }

    async fn embed_tokens(&self, text: &str) -> Result<Vec<Vec<f32>>> {
        let mut embeddings = Vec::new();
        for token in Self::tokens(text, self.max_tokens) {
            embeddings.push(self.embedder.embed(&token).await?);
        }
        Ok(embeddings)
    }

    async fn document_tokens(&self, document: &str) -> Result<Vec<Vec<f32>>> {
        let key = crate::cache::TtlCache::<()>::compute_key("colbert", document);
        {
            let mut cache = self.cache.lock();
            if let Some(entry) = cache.get(&key) {
                if entry.created_at.elapsed() < self.ttl {
                    return Ok(entry.embeddings.clone());
                }
                cache.pop(&key);
            }
        }

        let embeddings = self.embed_tokens(document).await?;
        self.cache.lock().put(
            key,
            CachedTokens {
                embeddings: embeddings.clone(),
                created_at: Instant::now(),
            },
        );
        Ok(embeddings)
    }

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
        let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
        if na == 0.0 || nb == 0.0 {
            0.0
        } else {
            dot / (na * nb)
        }
    }

    fn maxsim(query_tokens: &[Vec<f32>], doc_tokens: &[Vec<f32>]) -> f32 {
        if query_tokens.is_empty() || doc_tokens.is_empty() {
            return 0.0;
        }
        let total: f32 = query_tokens
            .iter()
            .map(|q| {
                doc_tokens
                    .iter()
                    .map(|d| Self::cosine(q, d))
                    .fold(f32::MIN, f32::max)
            })
            .sum();
        total / query_tokens.len() as f32
    }

    /// Cache entry count, for health reporting.
    pub fn cache_len(&self) -> usize {
        self.cache.lock().len()
    }
}

#[async_trait]
impl Reranker for ColbertReranker {
    async fn score(&self, query: &str, documents: &[String]) -> Result<Vec<RerankScore>> {
        let query_tokens = self.embed_tokens(query).await?;
        let mut scores = Vec::with_capacity(documents.len());
        for (index, document) in documents.iter().enumerate() {
            let doc_tokens = self.document_tokens(document).await?;
            scores.push(RerankScore {
                index,
                score: Self::maxsim(&query_tokens, &doc_tokens),
            });
        }
        Ok(scores)
    }

    fn id(&self) -> &'static str {
        "colbert"
    }
}

// ============================================================================
// Local Cross-Encoder (feature-gated)
// ============================================================================

/// Local cross-encoder via fastembed, lazily initialized and batched.
#[cfg(feature = "local-rerank")]
pub struct LocalCrossEncoder {
    model: tokio::sync::OnceCell<Arc<tokio::sync::Mutex<fastembed::TextRerank>>>,
    batch_size: usize,
}

#[cfg(feature = "local-rerank")]
impl LocalCrossEncoder {
    pub fn new(batch_size: usize) -> Self {
        Self {
            model: tokio::sync::OnceCell::new(),
            batch_size: batch_size.max(1),
        }
    }

    async fn get_model(&self) -> Result<Arc<tokio::sync::Mutex<fastembed::TextRerank>>> {
        self.model
            .get_or_try_init(|| async {
                tokio::task::spawn_blocking(|| {
                    let options = fastembed::RerankInitOptions::new(
                        fastembed::RerankerModel::BGERerankerBase,
                    );
                    let model = fastembed::TextRerank::try_new(options).map_err(|e| {
                        CoreError::Internal(format!("Failed to load reranker: {}", e))
                    })?;
                    Ok(Arc::new(tokio::sync::Mutex::new(model)))
                })
                .await
                .map_err(|e| CoreError::Internal(format!("Reranker init task failed: {}", e)))?
            })
            .await
            .map(Arc::clone)
    }
}

#[cfg(feature = "local-rerank")]
#[async_trait]
impl Reranker for LocalCrossEncoder {
    async fn score(&self, query: &str, documents: &[String]) -> Result<Vec<RerankScore>> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }
        let model = self.get_model().await?;
        let mut scores = Vec::with_capacity(documents.len());

        for (batch_index, batch) in documents.chunks(self.batch_size).enumerate() {
            let model = Arc::clone(&model);
            let query = query.to_string();
            let batch_docs: Vec<String> = batch.to_vec();
            let offset = batch_index * self.batch_size;

            let batch_scores = tokio::task::spawn_blocking(move || {
                let mut model = model.blocking_lock();
                model.rerank(query, &batch_docs, true, None)
            })
            .await
            .map_err(|e| CoreError::Internal(format!("Rerank task failed: {}", e)))?
            .map_err(|e| CoreError::Internal(format!("Reranking failed: {}", e)))?;

            for result in batch_scores {
                scores.push(RerankScore {
                    index: offset + result.index,
                    score: result.score,
                });
            }
        }
        Ok(scores)
    }

    fn id(&self) -> &'static str {
        "local"
    }
}

// ============================================================================
// Rerank Service
// ============================================================================

/// Provider selection plus the shared rerank flow: truncate candidate text,
/// score, apply the legal-domain boost, sort, cut to top_k.
pub struct RerankService {
    primary: Arc<dyn Reranker>,
    fallback: Option<Arc<dyn Reranker>>,
    legal_boost: f32,
    max_candidates: usize,
    max_chars: usize,
}

impl RerankService {
    pub fn new(
        primary: Arc<dyn Reranker>,
        fallback: Option<Arc<dyn Reranker>>,
        legal_boost: f32,
        max_candidates: usize,
        max_chars: usize,
    ) -> Self {
        Self {
            primary,
            fallback,
            legal_boost,
            max_candidates,
            max_chars,
        }
    }

    /// Build a service from configuration. Returns `None` when no provider
    /// can be constructed (the pipeline then keeps fused order).
    pub fn from_config(config: &RagConfig, embedder: Arc<dyn Embedder>) -> Option<Self> {
        let cohere = || -> Option<Arc<dyn Reranker>> {
            if config.cohere_api_key.is_empty() {
                None
            } else {
                Some(Arc::new(CohereReranker::new(
                    &config.cohere_api_base,
                    &config.cohere_api_key,
                    &config.cohere_rerank_model,
                )))
            }
        };
        let colbert = || -> Arc<dyn Reranker> {
            Arc::new(ColbertReranker::new(
                Arc::clone(&embedder),
                config.colbert_cache_max_entries,
                Duration::from_secs(config.colbert_cache_ttl_seconds),
            ))
        };
        #[cfg(feature = "local-rerank")]
        let local = || -> Option<Arc<dyn Reranker>> {
            Some(Arc::new(LocalCrossEncoder::new(config.rerank_batch_size)))
        };
        #[cfg(not(feature = "local-rerank"))]
        let local = || -> Option<Arc<dyn Reranker>> { None };

        let (primary, fallback): (Arc<dyn Reranker>, Option<Arc<dyn Reranker>>) =
            match config.rerank_provider.as_str() {
                "local" => (local()?, None),
                "colbert" => (colbert(), None),
                "cohere" => {
                    let fallback = if config.cohere_fallback_to_local {
                        local()
                    } else {
                        None
                    };
                    (cohere()?, fallback)
                }
                // auto: local in development, cohere in production, with the
                // late-interaction scorer as the last resort
                _ => {
                    if config.is_production() {
                        match cohere() {
                            Some(primary) => (primary, local().or(Some(colbert()))),
                            None => (local().unwrap_or_else(colbert), None),
                        }
                    } else {
                        (local().unwrap_or_else(colbert), None)
                    }
                }
            };

        Some(Self::new(
            primary,
            fallback,
            config.rerank_legal_boost,
            config.rerank_max_candidates,
            config.rerank_max_chars,
        ))
    }

    /// Rerank the top candidates, returning them ordered by rerank score with
    /// the legal boost applied. Candidates beyond `max_candidates` keep their
    /// fused order after the reranked head.
    pub async fn rerank(
        &self,
        query: &str,
        mut candidates: Vec<RetrievalResult>,
        top_k: usize,
    ) -> Result<(Vec<RetrievalResult>, &'static str)> {
        if candidates.is_empty() {
            return Ok((candidates, self.primary.id()));
        }

        let head_len = candidates.len().min(self.max_candidates);
        let tail: Vec<RetrievalResult> = candidates.split_off(head_len);

        let documents: Vec<String> = candidates
            .iter()
            .map(|c| c.working_text().chars().take(self.max_chars).collect())
            .collect();

        let (scores, provider) = match self.primary.score(query, &documents).await {
            Ok(scores) => (scores, self.primary.id()),
            Err(e) => match &self.fallback {
                Some(fallback) => {
                    tracing::warn!(
                        provider = self.primary.id(),
                        error = %e,
                        "rerank provider failed, falling back"
                    );
                    (fallback.score(query, &documents).await?, fallback.id())
                }
                None => return Err(e),
            },
        };

        for score in scores {
            if let Some(candidate) = candidates.get_mut(score.index) {
                let boost = if candidate.chunk.source_type.is_primary_legal() {
                    self.legal_boost
                } else {
                    0.0
                };
                candidate.rerank_score = Some(score.score + boost);
                candidate.touch("rerank");
            }
        }
        for candidate in candidates.iter_mut() {
            if candidate.rerank_score.is_none() {
                candidate.rerank_score = Some(0.0);
            }
        }

        candidates.sort_by(|a, b| {
            b.final_score()
                .partial_cmp(&a.final_score())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.chunk.chunk_uid.cmp(&b.chunk.chunk_uid))
        });
        candidates.extend(tail);
        candidates.truncate(top_k.max(1));
        Ok((candidates, provider))
    }
}

// ============================================================================
// Tests
// ============================================================================
