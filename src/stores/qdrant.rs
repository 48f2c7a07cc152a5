//! Qdrant vector store client.
//!
//! Uses the query API (`/collections/{name}/points/query`) with payload
//! filters for visibility. When sparse co-scoring is enabled and a sparse
//! query vector is supplied, dense and sparse prefetches are fused inside the
//! store (`rrf` or `dbsf`); otherwise a plain dense query runs. Cosine scores
//! come back already in `[0, 1]` and are passed through untouched.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::types::{CoreError, Result, ScopeContext, SourceType};

use super::{opensearch::chunk_from_source, ScoredChunk, VectorStore};

/// Sparse query vector (term indices + weights) produced by a sparse encoder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SparseVector {
    pub indices: Vec<u32>,
    pub values: Vec<f32>,
}

/// Server-side fusion mode for hybrid dense+sparse queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HybridFusion {
    Rrf,
    Dbsf,
}

impl HybridFusion {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "rrf" => Ok(Self::Rrf),
            "dbsf" => Ok(Self::Dbsf),
            other => Err(CoreError::Config(format!(
                "unknown hybrid fusion mode: {}",
                other
            ))),
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Rrf => "rrf",
            Self::Dbsf => "dbsf",
        }
    }
}

/// Client for the Qdrant collections backing dense retrieval.
pub struct QdrantStore {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    sparse_enabled: bool,
    fusion: HybridFusion,
    prefetch_limit: usize,
}

impl QdrantStore {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        sparse_enabled: bool,
        fusion: HybridFusion,
        prefetch_limit: usize,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            sparse_enabled,
            fusion,
            prefetch_limit,
        }
    }

    /// Payload filter enforcing the scope context inside the store.
    fn visibility_filter(scope: &ScopeContext) -> Value {
        let mut should: Vec<Value> = Vec::new();

        if scope.allow_global {
            should.push(json!({"key": "scope", "match": {"value": "global"}}));
        }
        should.push(json!({"must": [
            {"key": "scope", "match": {"value": "private"}},
            {"key": "tenant_id", "match": {"value": scope.tenant_id}}
        ]}));
        if scope.allow_group && !scope.group_ids.is_empty() {
            should.push(json!({"must": [
                {"key": "scope", "match": {"value": "group"}},
                {"key": "group_ids", "match": {"any": scope.group_ids}}
            ]}));
        }
        if let Some(case_id) = &scope.case_id {
            should.push(json!({"must": [
                {"key": "scope", "match": {"value": "local"}},
                {"key": "tenant_id", "match": {"value": scope.tenant_id}},
                {"key": "case_id", "match": {"value": case_id}}
            ]}));
        }

        json!({
            "should": should,
            "must_not": [{"key": "sigilo", "match": {"value": true}}]
        })
    }

    fn query_body(
        &self,
        embedding: &[f32],
        sparse: Option<&SparseVector>,
        fetch_k: usize,
        scope: &ScopeContext,
    ) -> Value {
        let filter = Self::visibility_filter(scope);

        match sparse {
            // Hybrid: dense + sparse prefetch, fused server-side. The fused
            // score replaces per-branch similarity; upstream RRF treats it as
            // this retriever's score and never mutates it.
            Some(sparse) if self.sparse_enabled => json!({
                "prefetch": [
                    {
                        "query": embedding,
                        "using": "dense",
                        "limit": self.prefetch_limit,
                        "filter": filter
                    },
                    {
                        "query": {"indices": sparse.indices, "values": sparse.values},
                        "using": "sparse",
                        "limit": self.prefetch_limit,
                        "filter": filter
                    }
                ],
                "query": {"fusion": self.fusion.as_str()},
                "limit": fetch_k,
                "with_payload": true
            }),
            _ => json!({
                "query": embedding,
                "limit": fetch_k,
                "filter": filter,
                "with_payload": true
            }),
        }
    }

    async fn execute(&self, collection: &str, body: Value) -> Result<Value> {
        let url = format!("{}/collections/{}/points/query", self.base_url, collection);
        let mut request = self.http.post(&url).json(&body);
        if !self.api_key.is_empty() {
            request = request.header("api-key", &self.api_key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| CoreError::Upstream(format!("Qdrant request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(CoreError::Upstream(format!(
                "Qdrant returned {} for collection {}",
                response.status(),
                collection
            )));
        }

        response
            .json()
            .await
            .map_err(|e| CoreError::Upstream(format!("Qdrant response parse failed: {}", e)))
    }

    fn parse_points(body: &Value, dataset: SourceType) -> Vec<ScoredChunk> {
        body["result"]["points"]
            .as_array()
            .map(|points| {
                points
                    .iter()
                    .filter_map(|point| {
                        let chunk = chunk_from_source(&point["payload"], dataset)?;
                        let score = point["score"].as_f64().unwrap_or(0.0) as f32;
                        Some(ScoredChunk { chunk, score })
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn search(
        &self,
        embedding: &[f32],
        dataset: SourceType,
        fetch_k: usize,
        scope: &ScopeContext,
    ) -> Result<Vec<ScoredChunk>> {
        self.search_hybrid(embedding, None, dataset, fetch_k, scope)
            .await
    }

    async fn search_hybrid(
        &self,
        embedding: &[f32],
        sparse: Option<&SparseVector>,
        dataset: SourceType,
        fetch_k: usize,
        scope: &ScopeContext,
    ) -> Result<Vec<ScoredChunk>> {
        let body = self.query_body(embedding, sparse, fetch_k, scope);
        let response = self.execute(dataset.vector_collection(), body).await?;
        Ok(Self::parse_points(&response, dataset))
    }

    fn name(&self) -> &'static str {
        "qdrant"
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn store(sparse: bool) -> QdrantStore {
        QdrantStore::new(
            "http://localhost:6333",
            "",
            sparse,
            HybridFusion::Rrf,
            40,
        )
    }

    #[test]
    fn test_fusion_parse() {
        assert_eq!(HybridFusion::parse("rrf").unwrap(), HybridFusion::Rrf);
        assert_eq!(HybridFusion::parse("dbsf").unwrap(), HybridFusion::Dbsf);
        assert!(HybridFusion::parse("sum").is_err());
    }

    #[test]
    fn test_dense_query_body() {
        let scope = ScopeContext::global("t1");
        let body = store(false).query_body(&[0.1, 0.2], None, 10, &scope);
        assert!(body["prefetch"].is_null());
        assert_eq!(body["limit"], 10);
        assert_eq!(body["with_payload"], true);
    }

    #[test]
    fn test_hybrid_query_body_uses_prefetch_fusion() {
        let scope = ScopeContext::global("t1");
        let sparse = SparseVector {
            indices: vec![3, 17],
            values: vec![0.8, 0.2],
        };
        let body = store(true).query_body(&[0.1], Some(&sparse), 10, &scope);
        let prefetch = body["prefetch"].as_array().unwrap();
        assert_eq!(prefetch.len(), 2);
        assert_eq!(prefetch[0]["using"], "dense");
        assert_eq!(prefetch[1]["using"], "sparse");
        assert_eq!(body["query"]["fusion"], "rrf");
    }

    #[test]
    fn test_sparse_disabled_falls_back_to_dense() {
        let scope = ScopeContext::global("t1");
        let sparse = SparseVector {
            indices: vec![1],
            values: vec![1.0],
        };
        let body = store(false).query_body(&[0.1], Some(&sparse), 5, &scope);
        assert!(body["prefetch"].is_null());
    }

    #[test]
    fn test_visibility_filter_excludes_sigilo() {
        let filter = QdrantStore::visibility_filter(&ScopeContext::global("t1"));
        assert_eq!(filter["must_not"][0]["key"], "sigilo");
    }

    #[test]
    fn test_parse_points() {
        let body = json!({
            "result": {"points": [
                {"score": 0.91, "payload": {"doc_id": "d1", "position": 2, "text": "x"}}
            ]}
        });
        let points = QdrantStore::parse_points(&body, SourceType::CaseLaw);
        assert_eq!(points.len(), 1);
        assert!((points[0].score - 0.91).abs() < 1e-6);
        assert_eq!(points[0].chunk.source_type, SourceType::CaseLaw);
    }
}
