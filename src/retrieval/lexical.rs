//! Lexical retriever.
//!
//! Fans out over the requested datasets' indices concurrently, each search
//! bounded by the per-dataset deadline. A dataset that errors or times out is
//! logged and skipped; the retriever only fails when every dataset failed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;

use crate::stores::{LexicalIndex, ScoredChunk};
use crate::types::{CoreError, Result, RetrieverKind};

use super::{RetrievalQuery, Retriever};

/// BM25 retrieval over the per-dataset lexical indices.
pub struct LexicalRetriever {
    index: Arc<dyn LexicalIndex>,
    timeout: Duration,
}

impl LexicalRetriever {
    pub fn new(index: Arc<dyn LexicalIndex>, timeout: Duration) -> Self {
        Self { index, timeout }
    }
}

#[async_trait]
impl Retriever for LexicalRetriever {
    async fn retrieve(&self, query: &RetrievalQuery) -> Result<Vec<ScoredChunk>> {
        if query.text.trim().is_empty() {
            return Ok(Vec::new());
        }

        let searches = query.datasets.iter().map(|&dataset| {
            let index = Arc::clone(&self.index);
            let text = query.text.clone();
            let scope = query.scope.clone();
            let fetch_k = query.fetch_k;
            let deadline = self.timeout;
            async move {
                let outcome = tokio::time::timeout(
                    deadline,
                    index.search(&text, dataset, fetch_k, &scope),
                )
                .await;
                (dataset, outcome)
            }
        });

        let mut hits = Vec::new();
        let mut errors = Vec::new();
        for (dataset, outcome) in join_all(searches).await {
            match outcome {
                Ok(Ok(mut dataset_hits)) => hits.append(&mut dataset_hits),
                Ok(Err(e)) => {
                    tracing::warn!(dataset = %dataset, error = %e, "lexical search failed");
                    errors.push(e);
                }
                Err(_) => {
                    tracing::warn!(dataset = %dataset, "lexical search timed out");
                    errors.push(CoreError::Timeout(format!(
                        "lexical search timed out for {}",
                        dataset
                    )));
                }
            }
        }

        if hits.is_empty() && !errors.is_empty() && errors.len() == query.datasets.len() {
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
        RetrieverKind::Lexical
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}

// ============================================================================
// Tests
// ============================================================================
