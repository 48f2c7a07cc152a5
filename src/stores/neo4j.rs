//! Neo4j graph store client.
//!
//! Speaks the HTTP transaction API (`/db/{database}/tx/commit`) with
//! parameterized Cypher. Visibility is enforced by a WHERE clause built from
//! [`DOC_VISIBILITY_PREDICATE`](super::DOC_VISIBILITY_PREDICATE); candidate-
//! layer edges are excluded unless the query explicitly opts in. The core
//! only reads from the graph.

use std::str::FromStr;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::types::{
    Chunk, ChunkMetadata, CoreError, EdgeKind, EdgeLayer, Entity, EntityKind, GraphEdge, Result,
    ScopeContext, SourceType,
};

use super::{
    scope_params, CoMentionDoc, EntitySeed, GraphStore, RawPath, ScoredChunk,
    DOC_VISIBILITY_PREDICATE,
};

/// Client for the labeled property graph behind graph retrieval, enrichment,
/// and the risk-scan suite.
pub struct Neo4jGraphStore {
    http: reqwest::Client,
    base_url: String,
    database: String,
    user: String,
    password: String,
}

impl Neo4jGraphStore {
    pub fn new(
        base_url: impl Into<String>,
        database: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            database: database.into(),
            user: user.into(),
            password: password.into(),
        }
    }

    async fn commit(&self, statement: &str, parameters: Value) -> Result<Vec<Value>> {
        let url = format!("{}/db/{}/tx/commit", self.base_url, self.database);
        let body = json!({
            "statements": [{
                "statement": statement,
                "parameters": parameters
            }]
        });

        let response = self
            .http
            .post(&url)
            .basic_auth(&self.user, Some(&self.password))
            .json(&body)
            .send()
            .await
            .map_err(|e| CoreError::Upstream(format!("Neo4j request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(CoreError::Upstream(format!(
                "Neo4j returned {}",
                response.status()
            )));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| CoreError::Upstream(format!("Neo4j response parse failed: {}", e)))?;

        if let Some(err) = payload["errors"].as_array().and_then(|e| e.first()) {
            return Err(CoreError::Upstream(format!(
                "Neo4j query error: {}",
                err["message"].as_str().unwrap_or("unknown")
            )));
        }

        Ok(rows_from_response(&payload))
    }

    fn merge_scope(mut params: Value, scope: &ScopeContext) -> Value {
        if let (Some(obj), Some(scope_obj)) = (params.as_object_mut(), scope_params(scope).as_object())
        {
            for (k, v) in scope_obj {
                obj.insert(k.clone(), v.clone());
            }
        }
        params
    }
}

/// Flatten the transaction-API response into one JSON object per row, keyed
/// by column name.
fn rows_from_response(payload: &Value) -> Vec<Value> {
    let result = match payload["results"].as_array().and_then(|r| r.first()) {
        Some(result) => result,
        None => return Vec::new(),
    };
    let columns: Vec<&str> = result["columns"]
        .as_array()
        .map(|cols| cols.iter().filter_map(|c| c.as_str()).collect())
        .unwrap_or_default();

    result["data"]
        .as_array()
        .map(|data| {
            data.iter()
                .filter_map(|row| {
                    let values = row["row"].as_array()?;
                    let mut obj = serde_json::Map::new();
                    for (col, value) in columns.iter().zip(values) {
                        obj.insert(col.to_string(), value.clone());
                    }
                    Some(Value::Object(obj))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn entity_from_row(row: &Value) -> Option<Entity> {
    let kind = EntityKind::from_str(row["kind"].as_str()?).ok()?;
    Some(Entity {
        entity_id: row["entity_id"].as_str()?.to_string(),
        kind,
        name: row["name"].as_str().unwrap_or_default().to_string(),
        tenant_id: row["tenant_id"].as_str().map(String::from),
    })
}

fn edge_from_value(value: &Value) -> Option<GraphEdge> {
    let kind = match value["kind"].as_str()? {
        "CITES" => EdgeKind::Cites,
        "REVOKES" => EdgeKind::Revokes,
        "AMENDS" => EdgeKind::Amends,
        "INTERPRETS" => EdgeKind::Interprets,
        "APPLIES" => EdgeKind::Applies,
        "REPRESENTS" => EdgeKind::Represents,
        "PARTICIPATES_IN" => EdgeKind::ParticipatesIn,
        "CO_MENTIONS" => EdgeKind::CoMentions,
        "SUPPORTS" => EdgeKind::Supports,
        "CONTRADICTS" => EdgeKind::Contradicts,
        "MENTIONS" => EdgeKind::Mentions,
        "HAS_CHUNK" => EdgeKind::HasChunk,
        _ => return None,
    };
    let layer = match value["layer"].as_str() {
        Some("candidate") => EdgeLayer::Candidate,
        _ => EdgeLayer::Verified,
    };
    Some(GraphEdge {
        source: value["source"].as_str()?.to_string(),
        target: value["target"].as_str()?.to_string(),
        kind,
        layer,
        weight: value["weight"].as_f64().unwrap_or(1.0),
        samples: value["samples"]
            .as_array()
            .map(|s| {
                s.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default(),
    })
}

#[async_trait]
impl GraphStore for Neo4jGraphStore {
    async fn find_entities(
        &self,
        seeds: &[EntitySeed],
        scope: &ScopeContext,
        limit: usize,
    ) -> Result<Vec<Entity>> {
        if seeds.is_empty() {
            return Ok(Vec::new());
        }
        let names: Vec<String> = seeds.iter().map(|s| s.text.to_lowercase()).collect();

        let statement = "MATCH (e:Entity) \
             WHERE (toLower(e.name) IN $names OR e.entity_id IN $names) \
               AND (e.tenant_id IS NULL OR e.tenant_id = $tenant_id \
                    OR ($include_global = true AND e.scope = 'global')) \
             RETURN e.entity_id AS entity_id, e.kind AS kind, e.name AS name, \
                    e.tenant_id AS tenant_id \
             LIMIT $limit";

        let params = Self::merge_scope(json!({"names": names, "limit": limit}), scope);
        let rows = self.commit(statement, params).await?;
        Ok(rows.iter().filter_map(entity_from_row).collect())
    }

    async fn expand(
        &self,
        entity_ids: &[String],
        hops: usize,
        max_nodes: usize,
        include_candidates: bool,
        scope: &ScopeContext,
    ) -> Result<Vec<RawPath>> {
        if entity_ids.is_empty() {
            return Ok(Vec::new());
        }
        // Variable-length bounds cannot be parameterized in Cypher; the hop
        // count is clamped and inlined.
        let hops = hops.clamp(1, 4);
        let statement = format!(
            "MATCH (a:Entity) WHERE a.entity_id IN $entity_ids \
             MATCH p = (a)-[*1..{hops}]-(b:Entity) \
             WHERE ALL(r IN relationships(p) \
                       WHERE $include_candidates = true OR coalesce(r.layer, 'verified') = 'verified') \
               AND (b.tenant_id IS NULL OR b.tenant_id = $tenant_id \
                    OR ($include_global = true AND b.scope = 'global')) \
             WITH p LIMIT $max_nodes \
             RETURN [n IN nodes(p) | {{entity_id: n.entity_id, kind: n.kind, name: n.name, \
                                       tenant_id: n.tenant_id}}] AS nodes, \
                    [r IN relationships(p) | {{kind: type(r), layer: r.layer, \
                                               weight: r.weight, \
                                               source: startNode(r).entity_id, \
                                               target: endNode(r).entity_id}}] AS rels"
        );

        let params = Self::merge_scope(
            json!({
                "entity_ids": entity_ids,
                "max_nodes": max_nodes,
                "include_candidates": include_candidates,
            }),
            scope,
        );
        let rows = self.commit(&statement, params).await?;

        let paths = rows
            .iter()
            .filter_map(|row| {
                let entities: Vec<Entity> = row["nodes"]
                    .as_array()?
                    .iter()
                    .filter_map(entity_from_row)
                    .collect();
                let edges: Vec<GraphEdge> = row["rels"]
                    .as_array()?
                    .iter()
                    .filter_map(edge_from_value)
                    .collect();
                if entities.len() < 2 || edges.is_empty() {
                    return None;
                }
                Some(RawPath { entities, edges })
            })
            .collect();
        Ok(paths)
    }

    async fn chunks_mentioning(
        &self,
        entity_ids: &[String],
        limit: usize,
        scope: &ScopeContext,
    ) -> Result<Vec<ScoredChunk>> {
        if entity_ids.is_empty() {
            return Ok(Vec::new());
        }
        let statement = format!(
            "MATCH (e:Entity)<-[:MENTIONS]-(c:Chunk)<-[:HAS_CHUNK]-(d:Document) \
             WHERE e.entity_id IN $entity_ids AND {DOC_VISIBILITY_PREDICATE} \
             RETURN c.chunk_uid AS chunk_uid, coalesce(c.text_preview, c.text) AS text, \
                    c.position AS position, d.id AS doc_id, d.dataset AS dataset, \
                    count(DISTINCT e) AS mentions \
             ORDER BY mentions DESC, chunk_uid ASC \
             LIMIT $limit"
        );

        let params = Self::merge_scope(json!({"entity_ids": entity_ids, "limit": limit}), scope);
        let rows = self.commit(&statement, params).await?;

        let max_mentions = rows
            .iter()
            .filter_map(|r| r["mentions"].as_f64())
            .fold(0.0_f64, f64::max)
            .max(1.0);

        let chunks = rows
            .iter()
            .filter_map(|row| {
                let dataset = SourceType::from_str(row["dataset"].as_str()?).ok()?;
                let doc_id = row["doc_id"].as_str()?.to_string();
                let position = row["position"].as_u64().unwrap_or(0) as usize;
                let chunk = Chunk {
                    chunk_uid: row["chunk_uid"]
                        .as_str()
                        .map(String::from)
                        .unwrap_or_else(|| Chunk::uid(&doc_id, position)),
                    source_type: dataset,
                    dataset: dataset.to_string(),
                    text: row["text"].as_str().unwrap_or_default().to_string(),
                    position,
                    doc_id,
                    metadata: ChunkMetadata::default(),
                };
                let score = (row["mentions"].as_f64().unwrap_or(0.0) / max_mentions) as f32;
                Some(ScoredChunk { chunk, score })
            })
            .collect();
        Ok(chunks)
    }

    async fn co_mention_docs(
        &self,
        source_id: &str,
        target_id: &str,
        limit: usize,
        scope: &ScopeContext,
    ) -> Result<Vec<CoMentionDoc>> {
        let statement = format!(
            "MATCH (a:Entity {{entity_id: $a_id}}) \
             MATCH (b:Entity {{entity_id: $b_id}}) \
             MATCH (a)<-[:MENTIONS]-(c:Chunk)-[:MENTIONS]->(b) \
             MATCH (d:Document)-[:HAS_CHUNK]->(c) \
             WHERE {DOC_VISIBILITY_PREDICATE} \
             RETURN d.id AS doc_id, left(coalesce(c.text_preview, ''), 220) AS preview \
             ORDER BY d.id \
             LIMIT $limit"
        );

        let params = Self::merge_scope(
            json!({"a_id": source_id, "b_id": target_id, "limit": limit}),
            scope,
        );
        let rows = self.commit(&statement, params).await?;
        Ok(rows
            .iter()
            .filter_map(|row| {
                Some(CoMentionDoc {
                    doc_id: row["doc_id"].as_str()?.to_string(),
                    preview: row["preview"].as_str().unwrap_or_default().to_string(),
                })
            })
            .collect())
    }

    async fn run_query(&self, query: &str, params: Value) -> Result<Vec<Value>> {
        self.commit(query, params).await
    }

    fn name(&self) -> &'static str {
        "neo4j"
    }
}

// ============================================================================
// Tests
// ============================================================================
