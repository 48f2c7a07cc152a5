//! Store client abstractions.
//!
//! The core does not implement the lexical, vector, or graph stores; it
//! accesses them through their native query protocols behind these traits.
//! Every search method takes the request's [`ScopeContext`]: visibility is
//! applied inside the store query itself, never as a post-filter.
//!
//! Implementations:
//! - [`opensearch::OpenSearchIndex`] - BM25 keyword search over per-dataset
//!   indices (OpenSearch `_search` REST API)
//! - [`qdrant::QdrantStore`] - dense (+ optional sparse prefetch fusion)
//!   nearest-neighbor search (Qdrant query API)
//! - [`neo4j::Neo4jGraphStore`] - parameterized Cypher over the HTTP
//!   transaction API

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{Chunk, Entity, EntityKind, GraphEdge, Result, ScopeContext, SourceType};

/// OpenSearch lexical index client.
pub mod opensearch;
/// Qdrant vector store client.
pub mod qdrant;
/// Neo4j graph store client.
pub mod neo4j;

// ============================================================================
// Shared Result Types
// ============================================================================

/// A chunk with the score its store assigned it, normalized to `[0, 1]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f32,
}

/// A candidate entity mention extracted from free text, used to seed graph
/// lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntitySeed {
    /// Normalized surface text of the mention.
    pub text: String,
    /// Ontology kind, when the extraction pattern implies one.
    pub kind: Option<EntityKind>,
}

/// One traversal path as returned by the graph store, before it is rendered
/// into addressable evidence.
#[derive(Debug, Clone)]
pub struct RawPath {
    /// Entities along the path, in order.
    pub entities: Vec<Entity>,
    /// Edges along the path, in order.
    pub edges: Vec<GraphEdge>,
}

// ============================================================================
// Store Traits
// ============================================================================

/// Typed multi-index keyword search with a server-side visibility predicate.
#[async_trait]
pub trait LexicalIndex: Send + Sync {
    /// Search one dataset's index, scoring with the store's BM25 ranker.
    async fn search(
        &self,
        query: &str,
        dataset: SourceType,
        fetch_k: usize,
        scope: &ScopeContext,
    ) -> Result<Vec<ScoredChunk>>;

    /// Fetch sibling chunks of a document position, within `window` on each
    /// side, ordered by position. Used by chunk expansion.
    async fn fetch_siblings(
        &self,
        doc_id: &str,
        dataset: SourceType,
        position: usize,
        window: usize,
        scope: &ScopeContext,
    ) -> Result<Vec<Chunk>>;

    /// Client name for traces and errors.
    fn name(&self) -> &'static str;
}

/// Named-collection dense (and optional sparse) nearest-neighbor search.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Search one dataset's collection with a pre-computed query embedding.
    async fn search(
        &self,
        embedding: &[f32],
        dataset: SourceType,
        fetch_k: usize,
        scope: &ScopeContext,
    ) -> Result<Vec<ScoredChunk>>;

    /// Hybrid search with an optional sparse co-query, fused inside the
    /// store. Stores without sparse support ignore the sparse vector.
    async fn search_hybrid(
        &self,
        embedding: &[f32],
        _sparse: Option<&qdrant::SparseVector>,
        dataset: SourceType,
        fetch_k: usize,
        scope: &ScopeContext,
    ) -> Result<Vec<ScoredChunk>> {
        self.search(embedding, dataset, fetch_k, scope).await
    }

    fn name(&self) -> &'static str;
}

/// Parameterized queries over a labeled property graph.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Resolve seed mentions to entity nodes visible under the scope.
    async fn find_entities(
        &self,
        seeds: &[EntitySeed],
        scope: &ScopeContext,
        limit: usize,
    ) -> Result<Vec<Entity>>;

    /// Bounded traversal from the given entities. Candidate-layer edges are
    /// excluded unless `include_candidates` is set.
    async fn expand(
        &self,
        entity_ids: &[String],
        hops: usize,
        max_nodes: usize,
        include_candidates: bool,
        scope: &ScopeContext,
    ) -> Result<Vec<RawPath>>;

    /// Chunks mentioning any of the given entities, ranked by mention count.
    /// Backs graph-as-retriever.
    async fn chunks_mentioning(
        &self,
        entity_ids: &[String],
        limit: usize,
        scope: &ScopeContext,
    ) -> Result<Vec<ScoredChunk>>;

    /// Documents that jointly mention two entities (sampled). Supports risk
    /// audit chains.
    async fn co_mention_docs(
        &self,
        source_id: &str,
        target_id: &str,
        limit: usize,
        scope: &ScopeContext,
    ) -> Result<Vec<CoMentionDoc>>;

    /// Run a raw parameterized query, returning one JSON object per row.
    /// The risk detectors build their queries on top of this.
    async fn run_query(
        &self,
        query: &str,
        params: serde_json::Value,
    ) -> Result<Vec<serde_json::Value>>;

    fn name(&self) -> &'static str;
}

/// A document jointly mentioning two entities, with a short preview.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoMentionDoc {
    pub doc_id: String,
    pub preview: String,
}

// ============================================================================
// Visibility Filter Parameters
// ============================================================================

/// Fallback visibility predicate for a store that cannot express the filter
/// natively: the caller resolves document visibility attributes and filters
/// client-side with the exact same admission rules.
pub fn visibility_predicate(
    scope: &ScopeContext,
) -> impl Fn(&crate::types::DocVisibility) -> bool + Send + Sync + 'static {
    let scope = scope.clone();
    move |visibility| scope.admits(visibility)
}

/// The visibility parameters every graph query binds.
///
/// Mirrors the WHERE clause the store enforces:
/// tenant match or global allowance, sigilo always excluded, `local` scope
/// requires a case id.
pub fn scope_params(scope: &ScopeContext) -> serde_json::Value {
    serde_json::json!({
        "tenant_id": scope.tenant_id,
        "include_global": scope.allow_global,
        "include_group": scope.allow_group,
        "group_ids": scope.group_ids,
        "case_id": scope.case_id,
    })
}

/// The document-visibility predicate shared by all graph queries, composed
/// after a `WHERE` or `AND`.
///
/// Bound parameters come from [`scope_params`].
pub const DOC_VISIBILITY_PREDICATE: &str = "(d.tenant_id = $tenant_id \
     OR ($include_global = true AND d.scope = 'global') \
     OR ($include_group = true AND d.scope = 'group' AND any(g IN d.group_ids WHERE g IN $group_ids))) \
  AND (d.sigilo IS NULL OR d.sigilo = false) \
  AND (d.scope <> 'local' OR ($case_id IS NOT NULL AND d.case_id = $case_id))";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_params_binding() {
        let mut scope = ScopeContext::global("t1");
        scope.case_id = Some("c1".to_string());
        let params = scope_params(&scope);
        assert_eq!(params["tenant_id"], "t1");
        assert_eq!(params["include_global"], true);
        assert_eq!(params["case_id"], "c1");
    }

    #[test]
    fn test_visibility_predicate_matches_scope_rules() {
        use crate::types::{DocVisibility, Scope};

        let predicate = visibility_predicate(&ScopeContext::global("t1"));
        let mut vis = DocVisibility {
            tenant_id: "t1".to_string(),
            scope: Scope::Private,
            ..Default::default()
        };
        assert!(predicate(&vis));
        vis.sigilo = true;
        assert!(!predicate(&vis));
    }

    #[test]
    fn test_visibility_clause_mentions_sigilo_and_local() {
        assert!(DOC_VISIBILITY_PREDICATE.contains("sigilo"));
        assert!(DOC_VISIBILITY_PREDICATE.contains("local"));
        assert!(DOC_VISIBILITY_PREDICATE.contains("$case_id"));
    }
}
