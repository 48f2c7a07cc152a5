//! Graph-as-retriever.
//!
//! Extracts entity seeds from the query, resolves them against the graph,
//! and returns the chunks that mention the matched entities, ranked by
//! mention count. Feeds the third RRF slot when graph retrieval is enabled.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::graphrag::entities::extract_seeds;
use crate::stores::{GraphStore, ScoredChunk};
use crate::types::{CoreError, Result, RetrieverKind};

use super::{RetrievalQuery, Retriever};

/// Chunk retrieval through entity mentions in the graph store.
pub struct GraphRetriever {
    store: Arc<dyn GraphStore>,
    limit: usize,
    timeout: Duration,
}

impl GraphRetriever {
    pub fn new(store: Arc<dyn GraphStore>, limit: usize, timeout: Duration) -> Self {
        Self {
            store,
            limit,
            timeout,
        }
    }
}

#[async_trait]
impl Retriever for GraphRetriever {
    async fn retrieve(&self, query: &RetrievalQuery) -> Result<Vec<ScoredChunk>> {
        let seeds = extract_seeds(&query.text);
        if seeds.is_empty() {
            return Ok(Vec::new());
        }

        let lookup = async {
            let entities = self
                .store
                .find_entities(&seeds, &query.scope, self.limit)
                .await?;
            if entities.is_empty() {
                return Ok(Vec::new());
            }
            let entity_ids: Vec<String> =
                entities.into_iter().map(|e| e.entity_id).collect();
            self.store
                .chunks_mentioning(&entity_ids, self.limit.min(query.fetch_k), &query.scope)
                .await
        };

        tokio::time::timeout(self.timeout, lookup)
            .await
            .map_err(|_| CoreError::Timeout("graph retrieval timed out".to_string()))?
    }

    fn kind(&self) -> RetrieverKind {
        RetrieverKind::Graph
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
    use crate::stores::{CoMentionDoc, EntitySeed, RawPath};
    use crate::types::{Chunk, ChunkMetadata, Entity, EntityKind, ScopeContext, SourceType};

    struct FakeGraph;

    #[async_trait]
    impl GraphStore for FakeGraph {
        async fn find_entities(
            &self,
            seeds: &[EntitySeed],
            _scope: &ScopeContext,
            _limit: usize,
        ) -> Result<Vec<Entity>> {
            Ok(seeds
                .iter()
                .filter(|s| s.kind == Some(EntityKind::StatuteArticle))
                .map(|s| Entity {
                    entity_id: format!("ent:{}", s.text),
                    kind: EntityKind::StatuteArticle,
                    name: s.text.clone(),
                    tenant_id: None,
                })
                .collect())
        }

        async fn expand(
            &self,
            _entity_ids: &[String],
            _hops: usize,
            _max_nodes: usize,
            _include_candidates: bool,
            _scope: &ScopeContext,
        ) -> Result<Vec<RawPath>> {
            Ok(Vec::new())
        }

        async fn chunks_mentioning(
            &self,
            entity_ids: &[String],
            _limit: usize,
            _scope: &ScopeContext,
        ) -> Result<Vec<ScoredChunk>> {
            Ok(entity_ids
                .iter()
                .map(|id| ScoredChunk {
                    chunk: Chunk {
                        chunk_uid: format!("chunk-{}", id),
                        source_type: SourceType::Statute,
                        dataset: "statute".to_string(),
                        text: "mentioned".to_string(),
                        position: 0,
                        doc_id: "d".to_string(),
                        metadata: ChunkMetadata::default(),
                    },
                    score: 1.0,
                })
                .collect())
        }

        async fn co_mention_docs(
            &self,
            _source_id: &str,
            _target_id: &str,
            _limit: usize,
            _scope: &ScopeContext,
        ) -> Result<Vec<CoMentionDoc>> {
            Ok(Vec::new())
        }

        async fn run_query(
            &self,
            _query: &str,
            _params: serde_json::Value,
        ) -> Result<Vec<serde_json::Value>> {
            Ok(Vec::new())
        }

        fn name(&self) -> &'static str {
            "fake-graph"
        }
    }

    #[tokio::test]
    async fn test_returns_chunks_for_seeded_query() {
        let retriever = GraphRetriever::new(Arc::new(FakeGraph), 20, Duration::from_secs(1));
        let query = RetrievalQuery {
            text: "Art. 319 CPC".to_string(),
            embed_text: None,
            datasets: vec![SourceType::Statute],
            fetch_k: 10,
            scope: ScopeContext::global("t1"),
        };
        let hits = retriever.retrieve(&query).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].chunk.chunk_uid.contains("art. 319"));
    }

    #[tokio::test]
    async fn test_seedless_query_short_circuits() {
        let retriever = GraphRetriever::new(Arc::new(FakeGraph), 20, Duration::from_secs(1));
        let query = RetrievalQuery {
            text: "responsabilidade civil".to_string(),
            embed_text: None,
            datasets: vec![SourceType::Statute],
            fetch_k: 10,
            scope: ScopeContext::global("t1"),
        };
        // Lowercase names produce no structured seeds and no capitalized span
        assert!(retriever.retrieve(&query).await.unwrap().is_empty());
    }
}
