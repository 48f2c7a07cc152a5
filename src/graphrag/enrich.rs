//! Graph enrichment: addressable path and triple evidence.
//!
//! Seeds come from the query and the top retrieval results; traversal is
//! bounded by hop and node budgets and restricted to visible scopes and
//! verified edges (candidate edges on explicit opt-in). Each surfaced path
//! carries a stable `path_uid` derived from its node/edge sequence, so
//! downstream reasoners can cite `[path:<uid>]` markers that remain valid in
//! the audit trail.

use std::sync::Arc;
use std::time::Duration;

use crate::stores::{GraphStore, RawPath};
use crate::types::{
    CoreError, GraphPath, GraphTriple, Result, RetrievalResult, ScopeContext,
};

use super::entities::extract_seeds;

/// Evidence blocks attached to a pipeline result.
#[derive(Debug, Clone, Default)]
pub struct GraphEvidence {
    pub paths: Vec<GraphPath>,
    pub triples: Vec<GraphTriple>,
    pub seed_count: usize,
}

/// Bounded traversal and evidence rendering over the graph store.
pub struct GraphEnricher {
    store: Arc<dyn GraphStore>,
    hops: usize,
    max_nodes: usize,
    paths_max: usize,
    triples_max: usize,
    timeout: Duration,
}

impl GraphEnricher {
    pub fn new(
        store: Arc<dyn GraphStore>,
        hops: usize,
        max_nodes: usize,
        paths_max: usize,
        triples_max: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            hops,
            max_nodes,
            paths_max,
            triples_max,
            timeout,
        }
    }

    /// Enrich a result set with graph evidence.
    ///
    /// Seeds are extracted from the query and the top three results' working
    /// text.
    pub async fn enrich(
        &self,
        query: &str,
        results: &[RetrievalResult],
        include_candidates: bool,
        scope: &ScopeContext,
    ) -> Result<GraphEvidence> {
        let mut seed_text = query.to_string();
        for result in results.iter().take(3) {
            seed_text.push('\n');
            seed_text.push_str(result.working_text());
        }
        let seeds = extract_seeds(&seed_text);
        if seeds.is_empty() {
            return Ok(GraphEvidence::default());
        }

        let traversal = async {
            let entities = self
                .store
                .find_entities(&seeds, scope, self.max_nodes)
                .await?;
            if entities.is_empty() {
                return Ok(Vec::new());
            }
            let ids: Vec<String> = entities.into_iter().map(|e| e.entity_id).collect();
            self.store
                .expand(&ids, self.hops, self.max_nodes, include_candidates, scope)
                .await
        };

        let raw_paths = tokio::time::timeout(self.timeout, traversal)
            .await
            .map_err(|_| CoreError::Timeout("graph enrichment timed out".to_string()))??;

        let mut evidence = GraphEvidence {
            seed_count: seeds.len(),
            ..Default::default()
        };
        for raw in raw_paths.iter().take(self.paths_max) {
            evidence.paths.push(render_path(raw));
        }
        for raw in raw_paths {
            for edge in &raw.edges {
                if evidence.triples.len() >= self.triples_max {
                    break;
                }
                let subject = entity_name(&raw, &edge.source);
                let object = entity_name(&raw, &edge.target);
                let predicate = edge.kind.as_rel_type().to_string();
                let text = format!("{} {} {}", subject, predicate, object);
                if evidence.triples.iter().any(|t| t.text == text) {
                    continue;
                }
                evidence.triples.push(GraphTriple {
                    subject,
                    predicate,
                    object,
                    text,
                });
            }
        }

        Ok(evidence)
    }
}

fn entity_name(path: &RawPath, entity_id: &str) -> String {
    path.entities
        .iter()
        .find(|e| e.entity_id == entity_id)
        .map(|e| e.name.clone())
        .unwrap_or_else(|| entity_id.to_string())
}

/// Render a raw path into addressable evidence.
fn render_path(raw: &RawPath) -> GraphPath {
    let entity_ids: Vec<&str> = raw.entities.iter().map(|e| e.entity_id.as_str()).collect();
    let rel_types: Vec<&str> = raw.edges.iter().map(|e| e.kind.as_rel_type()).collect();
    let path_uid = GraphPath::derive_uid(&entity_ids, &rel_types);

    let mut text = String::new();
    for (i, entity) in raw.entities.iter().enumerate() {
        if i > 0 {
            let rel = raw
                .edges
                .get(i - 1)
                .map(|e| e.kind.as_rel_type())
                .unwrap_or("RELATED_TO");
            text.push_str(&format!(" -[{}]-> ", rel));
        }
        text.push_str(&entity.name);
    }

    GraphPath {
        path_uid,
        entities: raw.entities.clone(),
        edges: raw.edges.clone(),
        text,
    }
}

// ============================================================================
// Tests
// ============================================================================
