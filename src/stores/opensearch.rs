//! OpenSearch lexical index client.
//!
//! Talks to the `_search` REST API of per-dataset indices. The visibility
//! predicate is compiled into the query body as a bool filter, so the store
//! only ever scores admissible documents. Raw BM25 scores are normalized by
//! the response `max_score` so downstream thresholds compare across stores.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::types::{
    Chunk, ChunkMetadata, CoreError, Result, ScopeContext, SourceType,
};

use super::{LexicalIndex, ScoredChunk};

/// Client for an OpenSearch cluster hosting the per-dataset lexical indices.
pub struct OpenSearchIndex {
    http: reqwest::Client,
    base_url: String,
    user: String,
    password: String,
}

impl OpenSearchIndex {
    pub fn new(base_url: impl Into<String>, user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            user: user.into(),
            password: password.into(),
        }
    }

    /// Build the bool filter enforcing the scope context server-side.
    ///
    /// `should` clauses enumerate the admissible scopes; sigilo documents are
    /// excluded unconditionally; `local` is only admissible with a case id.
    fn visibility_filter(scope: &ScopeContext) -> Value {
        let mut should: Vec<Value> = Vec::new();

        if scope.allow_global {
            should.push(json!({"term": {"scope": "global"}}));
        }
        should.push(json!({"bool": {"must": [
            {"term": {"scope": "private"}},
            {"term": {"tenant_id": scope.tenant_id}}
        ]}}));
        if scope.allow_group && !scope.group_ids.is_empty() {
            should.push(json!({"bool": {"must": [
                {"term": {"scope": "group"}},
                {"terms": {"group_ids": scope.group_ids}}
            ]}}));
        }
        if let Some(case_id) = &scope.case_id {
            should.push(json!({"bool": {"must": [
                {"term": {"scope": "local"}},
                {"term": {"tenant_id": scope.tenant_id}},
                {"term": {"case_id": case_id}}
            ]}}));
        }

        json!({
            "bool": {
                "should": should,
                "minimum_should_match": 1,
                "must_not": [{"term": {"sigilo": true}}]
            }
        })
    }

    async fn execute(&self, index: &str, body: Value) -> Result<Value> {
        let url = format!("{}/{}/_search", self.base_url, index);
        let response = self
            .http
            .post(&url)
            .basic_auth(&self.user, Some(&self.password))
            .json(&body)
            .send()
            .await
            .map_err(|e| CoreError::Upstream(format!("OpenSearch request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(CoreError::Upstream(format!(
                "OpenSearch returned {} for index {}",
                response.status(),
                index
            )));
        }

        response
            .json()
            .await
            .map_err(|e| CoreError::Upstream(format!("OpenSearch response parse failed: {}", e)))
    }

    fn parse_hits(body: &Value, dataset: SourceType) -> Vec<ScoredChunk> {
        let hits = match body["hits"]["hits"].as_array() {
            Some(hits) => hits,
            None => return Vec::new(),
        };
        let max_score = body["hits"]["max_score"].as_f64().unwrap_or(0.0) as f32;

        hits.iter()
            .filter_map(|hit| {
                let source = &hit["_source"];
                let chunk = chunk_from_source(source, dataset)?;
                let raw = hit["_score"].as_f64().unwrap_or(0.0) as f32;
                let score = if max_score > 0.0 { raw / max_score } else { 0.0 };
                Some(ScoredChunk { chunk, score })
            })
            .collect()
    }
}

/// Deserialize a chunk from an index document source.
pub(crate) fn chunk_from_source(source: &Value, dataset: SourceType) -> Option<Chunk> {
    let doc_id = source["doc_id"].as_str()?.to_string();
    let position = source["position"].as_u64().unwrap_or(0) as usize;
    let chunk_uid = source["chunk_uid"]
        .as_str()
        .map(String::from)
        .unwrap_or_else(|| Chunk::uid(&doc_id, position));

    let metadata: ChunkMetadata = source
        .get("metadata")
        .and_then(|m| serde_json::from_value(m.clone()).ok())
        .unwrap_or_default();

    Some(Chunk {
        chunk_uid,
        source_type: dataset,
        dataset: dataset.to_string(),
        text: source["text"].as_str().unwrap_or_default().to_string(),
        position,
        doc_id,
        metadata,
    })
}

#[async_trait]
impl LexicalIndex for OpenSearchIndex {
    async fn search(
        &self,
        query: &str,
        dataset: SourceType,
        fetch_k: usize,
        scope: &ScopeContext,
    ) -> Result<Vec<ScoredChunk>> {
        let body = json!({
            "size": fetch_k,
            "query": {
                "bool": {
                    "must": [{
                        "multi_match": {
                            "query": query,
                            "fields": ["text^2", "metadata.title", "metadata.citation"],
                            "type": "best_fields"
                        }
                    }],
                    "filter": [Self::visibility_filter(scope)]
                }
            }
        });

        let response = self.execute(dataset.lexical_index(), body).await?;
        Ok(Self::parse_hits(&response, dataset))
    }

    async fn fetch_siblings(
        &self,
        doc_id: &str,
        dataset: SourceType,
        position: usize,
        window: usize,
        scope: &ScopeContext,
    ) -> Result<Vec<Chunk>> {
        let low = position.saturating_sub(window);
        let high = position + window;
        let body = json!({
            "size": window * 2 + 1,
            "sort": [{"position": "asc"}],
            "query": {
                "bool": {
                    "must": [
                        {"term": {"doc_id": doc_id}},
                        {"range": {"position": {"gte": low, "lte": high}}}
                    ],
                    "filter": [Self::visibility_filter(scope)]
                }
            }
        });

        let response = self.execute(dataset.lexical_index(), body).await?;
        let chunks = response["hits"]["hits"]
            .as_array()
            .map(|hits| {
                hits.iter()
                    .filter_map(|hit| chunk_from_source(&hit["_source"], dataset))
                    .filter(|c| c.position != position)
                    .collect()
            })
            .unwrap_or_default();
        Ok(chunks)
    }

    fn name(&self) -> &'static str {
        "opensearch"
    }
}

// ============================================================================
// Tests
// ============================================================================
