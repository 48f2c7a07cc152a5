//! Vector retriever.
//!
//! Embeds the query once (the HyDE concatenation when present), then fans out
//! over dataset collections with concurrency capped by a semaphore. When the
//! store supports sparse co-scoring and the embedder produces a sparse
//! vector, dense and sparse branches are fused inside the store; this
//! retriever never mutates scores computed upstream.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::Semaphore;

use crate::llm::embeddings::Embedder;
use crate::stores::{ScoredChunk, VectorStore};
use crate::types::{CoreError, Result, RetrieverKind};

use super::{RetrievalQuery, Retriever};

/// Dense (+ optional sparse) similarity retrieval over dataset collections.
pub struct VectorRetriever {
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    /// Caps concurrent per-dataset queries for one request.
    semaphore: Arc<Semaphore>,
    timeout: Duration,
}

impl VectorRetriever {
    pub fn new(
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        max_concurrency: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            embedder,
            semaphore: Arc::new(Semaphore::new(max_concurrency.max(1))),
            timeout,
        }
    }
}

#[async_trait]
impl Retriever for VectorRetriever {
    async fn retrieve(&self, query: &RetrievalQuery) -> Result<Vec<ScoredChunk>> {
        let embed_input = query.embed_text.as_deref().unwrap_or(&query.text);
        if embed_input.trim().is_empty() {
            return Ok(Vec::new());
        }

        let embedding = self.embedder.embed(embed_input).await?;
        let sparse = self.embedder.embed_sparse(embed_input).await?;

        let searches = query.datasets.iter().map(|&dataset| {
            let store = Arc::clone(&self.store);
            let semaphore = Arc::clone(&self.semaphore);
            let embedding = embedding.clone();
            let sparse = sparse.clone();
            let scope = query.scope.clone();
            let fetch_k = query.fetch_k;
            let deadline = self.timeout;
            async move {
                let _permit = semaphore.acquire_owned().await.map_err(|_| {
                    CoreError::Cancelled("vector semaphore closed".to_string())
                })?;
                tokio::time::timeout(
                    deadline,
                    store.search_hybrid(&embedding, sparse.as_ref(), dataset, fetch_k, &scope),
                )
                .await
                .map_err(|_| {
                    CoreError::Timeout(format!("vector search timed out for {}", dataset))
                })?
            }
        });

        let outcomes = join_all(searches).await;
        let total = outcomes.len();
        let mut hits = Vec::new();
        let mut errors = Vec::new();
        for outcome in outcomes {
            match outcome {
                Ok(mut dataset_hits) => hits.append(&mut dataset_hits),
                Err(e) => {
                    tracing::warn!(error = %e, "vector search failed for a dataset");
                    errors.push(e);
                }
            }
        }

        if hits.is_empty() && !errors.is_empty() && errors.len() == total {
            return Err(errors.remove(0));
        }

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.chunk.chunk_uid.cmp(&b.chunk.chunk_uid))
        });
        hits.truncate(query.fetch_k);
        Ok(hits)
    }

    fn kind(&self) -> RetrieverKind {
        RetrieverKind::Vector
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Chunk, ChunkMetadata, ScopeContext, SourceType};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeEmbedder;

    #[async_trait]
    impl Embedder for FakeEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Ok(vec![0.1, 0.2, 0.3])
        }

        fn dimensions(&self) -> usize {
            3
        }

        fn model(&self) -> &str {
            "fake"
        }
    }

    struct CountingStore {
        concurrent: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl VectorStore for CountingStore {
        async fn search(
            &self,
            _embedding: &[f32],
            dataset: SourceType,
            _fetch_k: usize,
            _scope: &ScopeContext,
        ) -> Result<Vec<ScoredChunk>> {
            let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.concurrent.fetch_sub(1, Ordering::SeqCst);
            Ok(vec![ScoredChunk {
                chunk: Chunk {
                    chunk_uid: format!("{}-0", dataset),
                    source_type: dataset,
                    dataset: dataset.to_string(),
                    text: "hit".to_string(),
                    position: 0,
                    doc_id: "d".to_string(),
                    metadata: ChunkMetadata::default(),
                },
                score: 0.7,
            }])
        }

        fn name(&self) -> &'static str {
            "counting"
        }
    }

    #[tokio::test]
    async fn test_concurrency_is_capped() {
        let store = Arc::new(CountingStore {
            concurrent: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let retriever = VectorRetriever::new(
            Arc::clone(&store) as Arc<dyn VectorStore>,
            Arc::new(FakeEmbedder),
            2,
            Duration::from_secs(1),
        );

        let query = RetrievalQuery {
            text: "query".to_string(),
            embed_text: None,
            datasets: SourceType::all().to_vec(),
            fetch_k: 10,
            scope: ScopeContext::global("t1"),
        };
        let hits = retriever.retrieve(&query).await.unwrap();
        assert_eq!(hits.len(), SourceType::all().len());
        assert!(store.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_hyde_text_is_embedded_instead_of_query() {
        struct AssertingEmbedder;

        #[async_trait]
        impl Embedder for AssertingEmbedder {
            async fn embed(&self, text: &str) -> Result<Vec<f32>> {
                assert!(text.contains("hypothetical"));
                Ok(vec![0.0])
            }

            fn dimensions(&self) -> usize {
                1
            }

            fn model(&self) -> &str {
                "asserting"
            }
        }

        let retriever = VectorRetriever::new(
            Arc::new(CountingStore {
                concurrent: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }),
            Arc::new(AssertingEmbedder),
            4,
            Duration::from_secs(1),
        );

        let query = RetrievalQuery {
            text: "original".to_string(),
            embed_text: Some("original\nhypothetical document".to_string()),
            datasets: vec![SourceType::Statute],
            fetch_k: 5,
            scope: ScopeContext::global("t1"),
        };
        retriever.retrieve(&query).await.unwrap();
    }
}
