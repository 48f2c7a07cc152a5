//! Deterministic risk-scan suite over the graph store.
//!
//! Each detector is a parameterized graph query behind the uniform
//! [`Detector`] contract; the registry is immutable after startup and
//! selection is by name. Detectors run independently, each under its own
//! timeout; a failed detector becomes a warning, never a failed scan.
//! Aggregate signals are sorted by score and globally capped. Every signal
//! referencing two entities also carries a sampled set (at most five) of the
//! documents that jointly mention them, so audit chains can be followed.
//!
//! Scan reports are persisted per tenant as JSON lines with an expiry stamp;
//! readers honor the TTL.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::audit::{JsonlTraceSink, TraceSink};
use crate::stores::GraphStore;
use crate::types::{Result, ScopeContext};

// ============================================================================
// Signals
// ============================================================================

/// An entity referenced by a signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskEntity {
    pub entity_id: String,
    pub name: String,
    #[serde(default)]
    pub kind: String,
}

/// Documents jointly mentioning a signal's entity pair (sampled).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SupportingDocs {
    pub count: usize,
    pub doc_ids_sample: Vec<String>,
    pub previews_sample: Vec<String>,
}

/// One scored signal emitted by a detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskSignal {
    pub detector: String,
    pub score: f64,
    pub description: String,
    pub entities: Vec<RiskEntity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supporting_docs: Option<SupportingDocs>,
}

/// Tunable scan parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskScanParams {
    /// Global cap on aggregated signals.
    pub limit: usize,
    /// Minimum shared-document count for co-mention detectors.
    pub min_shared_docs: u64,
    /// Include candidate-layer edges.
    pub include_candidates: bool,
}

impl Default for RiskScanParams {
    fn default() -> Self {
        Self {
            limit: 50,
            min_shared_docs: 3,
            include_candidates: false,
        }
    }
}

// ============================================================================
// Detector Contract
// ============================================================================

/// Uniform detector contract. Implementations are pure readers.
#[async_trait]
pub trait Detector: Send + Sync {
    fn name(&self) -> &'static str;

    fn timeout(&self) -> Duration;

    async fn run(
        &self,
        store: &dyn GraphStore,
        scope: &ScopeContext,
        params: &RiskScanParams,
    ) -> Result<Vec<RiskSignal>>;
}

/// A detector backed by one parameterized graph query.
///
/// Every query follows the same RETURN contract: `score` (float),
/// `description` (string), `entities` (list of `{entity_id, name, kind}`),
/// so one mapper serves the whole suite.
struct CypherDetector {
    name: &'static str,
    timeout: Duration,
    query: &'static str,
}

impl CypherDetector {
    fn new(name: &'static str, query: &'static str) -> Self {
        Self {
            name,
            timeout: Duration::from_secs(6),
            query,
        }
    }
}

#[async_trait]
impl Detector for CypherDetector {
    fn name(&self) -> &'static str {
        self.name
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn run(
        &self,
        store: &dyn GraphStore,
        scope: &ScopeContext,
        params: &RiskScanParams,
    ) -> Result<Vec<RiskSignal>> {
        let bound = crate::stores::scope_params(scope);
        let mut parameters = bound;
        if let Some(obj) = parameters.as_object_mut() {
            obj.insert("limit".to_string(), json!(params.limit));
            obj.insert("min_shared_docs".to_string(), json!(params.min_shared_docs));
            obj.insert(
                "include_candidates".to_string(),
                json!(params.include_candidates),
            );
        }

        let rows = store.run_query(self.query, parameters).await?;
        Ok(rows
            .iter()
            .filter_map(|row| signal_from_row(self.name, row))
            .collect())
    }
}

fn signal_from_row(detector: &str, row: &Value) -> Option<RiskSignal> {
    let score = row["score"].as_f64()?;
    let entities = row["entities"]
        .as_array()
        .map(|list| {
            list.iter()
                .filter_map(|e| {
                    Some(RiskEntity {
                        entity_id: e["entity_id"].as_str()?.to_string(),
                        name: e["name"].as_str().unwrap_or_default().to_string(),
                        kind: e["kind"].as_str().unwrap_or_default().to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Some(RiskSignal {
        detector: detector.to_string(),
        score,
        description: row["description"].as_str().unwrap_or_default().to_string(),
        entities,
        supporting_docs: None,
    })
}

// ============================================================================
// Default Detector Suite
// ============================================================================

fn default_detectors() -> Vec<Arc<dyn Detector>> {
    vec![
        Arc::new(CypherDetector::new(
            "org_company_co_mention",
            "MATCH (a:Entity {kind: 'organization'})-[r:CO_MENTIONS]-(b:Entity {kind: 'company'}) \
             WHERE r.weight >= $min_shared_docs AND ($include_candidates = true OR coalesce(r.layer, 'verified') = 'verified') \
             RETURN r.weight AS score, \
                    a.name + ' e ' + b.name + ' compartilham ' + toString(toInteger(r.weight)) + ' documentos' AS description, \
                    [{entity_id: a.entity_id, name: a.name, kind: a.kind}, \
                     {entity_id: b.entity_id, name: b.name, kind: b.kind}] AS entities \
             ORDER BY score DESC LIMIT $limit",
        )),
        Arc::new(CypherDetector::new(
            "article_co_mention_hotspot",
            "MATCH (a:Entity {kind: 'statute_article'})-[r:CO_MENTIONS]-(b:Entity {kind: 'statute_article'}) \
             WHERE r.weight >= $min_shared_docs AND ($include_candidates = true OR coalesce(r.layer, 'verified') = 'verified') \
             RETURN r.weight AS score, \
                    'co-ocorrencia alta entre ' + a.name + ' e ' + b.name AS description, \
                    [{entity_id: a.entity_id, name: a.name, kind: a.kind}, \
                     {entity_id: b.entity_id, name: b.name, kind: b.kind}] AS entities \
             ORDER BY score DESC LIMIT $limit",
        )),
        Arc::new(CypherDetector::new(
            "multi_process_actor",
            "MATCH (p:Entity)-[:PARTICIPATES_IN]->(proc:Entity {kind: 'process'}) \
             WITH p, count(DISTINCT proc) AS n WHERE n >= 3 \
             RETURN toFloat(n) AS score, \
                    p.name + ' participa de ' + toString(n) + ' processos' AS description, \
                    [{entity_id: p.entity_id, name: p.name, kind: p.kind}] AS entities \
             ORDER BY score DESC LIMIT $limit",
        )),
        Arc::new(CypherDetector::new(
            "massive_representation",
            "MATCH (adv:Entity)-[:REPRESENTS]->(cli:Entity) \
             WITH adv, count(DISTINCT cli) AS n WHERE n >= 10 \
             RETURN toFloat(n) AS score, \
                    adv.name + ' representa ' + toString(n) + ' clientes' AS description, \
                    [{entity_id: adv.entity_id, name: adv.name, kind: adv.kind}] AS entities \
             ORDER BY score DESC LIMIT $limit",
        )),
        Arc::new(CypherDetector::new(
            "process_network_hubs",
            "MATCH (e:Entity)-[r]-() \
             WITH e, count(r) AS degree \
             WHERE degree >= 10 \
             RETURN toFloat(degree) AS score, \
                    e.name + ' possui grau ' + toString(degree) AS description, \
                    [{entity_id: e.entity_id, name: e.name, kind: e.kind}] AS entities \
             ORDER BY score DESC LIMIT $limit",
        )),
        Arc::new(CypherDetector::new(
            "isolated_clusters",
            "CALL gds.wcc.stream('lexrag') YIELD nodeId, componentId \
             WITH componentId, collect(gds.util.asNode(nodeId)) AS members \
             WHERE size(members) >= 2 AND size(members) <= 5 \
             RETURN toFloat(size(members)) AS score, \
                    'componente isolado com ' + toString(size(members)) + ' entidades' AS description, \
                    [m IN members | {entity_id: m.entity_id, name: m.name, kind: m.kind}] AS entities \
             LIMIT $limit",
        )),
        Arc::new(CypherDetector::new(
            "propagated_influence",
            "CALL gds.eigenvector.stream('lexrag') YIELD nodeId, score \
             WITH gds.util.asNode(nodeId) AS node, score ORDER BY score DESC \
             RETURN score, \
                    node.name + ' com alta centralidade espectral' AS description, \
                    [{entity_id: node.entity_id, name: node.name, kind: node.kind}] AS entities \
             LIMIT $limit",
        )),
        Arc::new(CypherDetector::new(
            "critical_intermediaries",
            "CALL gds.betweenness.stream('lexrag') YIELD nodeId, score \
             WITH gds.util.asNode(nodeId) AS node, score \
             WHERE score > 0 \
             RETURN score, \
                    node.name + ' intermedia caminhos criticos' AS description, \
                    [{entity_id: node.entity_id, name: node.name, kind: node.kind}] AS entities \
             ORDER BY score DESC LIMIT $limit",
        )),
        Arc::new(CypherDetector::new(
            "hidden_communities",
            "CALL gds.leiden.stream('lexrag') YIELD nodeId, communityId \
             WITH communityId, collect(gds.util.asNode(nodeId)) AS members \
             WHERE size(members) >= 3 \
             RETURN toFloat(size(members)) AS score, \
                    'comunidade modular com ' + toString(size(members)) + ' entidades' AS description, \
                    [m IN members[..5] | {entity_id: m.entity_id, name: m.name, kind: m.kind}] AS entities \
             ORDER BY score DESC LIMIT $limit",
        )),
        Arc::new(CypherDetector::new(
            "behavioral_similarity",
            "CALL gds.nodeSimilarity.stream('lexrag') YIELD node1, node2, similarity \
             WITH gds.util.asNode(node1) AS a, gds.util.asNode(node2) AS b, similarity \
             WHERE similarity >= 0.8 \
             RETURN similarity AS score, \
                    a.name + ' e ' + b.name + ' com vizinhanca sobreposta' AS description, \
                    [{entity_id: a.entity_id, name: a.name, kind: a.kind}, \
                     {entity_id: b.entity_id, name: b.name, kind: b.kind}] AS entities \
             ORDER BY score DESC LIMIT $limit",
        )),
        Arc::new(CypherDetector::new(
            "collusion_triangles",
            "CALL gds.triangleCount.stream('lexrag') YIELD nodeId, triangleCount \
             WITH gds.util.asNode(nodeId) AS node, triangleCount \
             WHERE triangleCount >= 3 \
             RETURN toFloat(triangleCount) AS score, \
                    node.name + ' participa de ' + toString(triangleCount) + ' triangulos' AS description, \
                    [{entity_id: node.entity_id, name: node.name, kind: node.kind}] AS entities \
             ORDER BY score DESC LIMIT $limit",
        )),
        Arc::new(CypherDetector::new(
            "structural_vulnerabilities",
            "CALL gds.articulationPoints.stream('lexrag') YIELD nodeId \
             WITH gds.util.asNode(nodeId) AS node \
             RETURN 1.0 AS score, \
                    node.name + ' e ponto de articulacao da rede' AS description, \
                    [{entity_id: node.entity_id, name: node.name, kind: node.kind}] AS entities \
             LIMIT $limit",
        )),
    ]
}

// ============================================================================
// Registry & Scanner
// ============================================================================

/// Immutable registry of detectors, selected by name.
pub struct DetectorRegistry {
    detectors: HashMap<&'static str, Arc<dyn Detector>>,
}

impl Default for DetectorRegistry {
    fn default() -> Self {
        let mut detectors = HashMap::new();
        for detector in default_detectors() {
            detectors.insert(detector.name(), detector);
        }
        Self { detectors }
    }
}

impl DetectorRegistry {
    /// Detectors matching the requested names, or the full suite when no
    /// filter is given. Unknown names are ignored.
    pub fn select(&self, names: Option<&[String]>) -> Vec<Arc<dyn Detector>> {
        let mut selected: Vec<Arc<dyn Detector>> = match names {
            Some(names) => names
                .iter()
                .filter_map(|n| self.detectors.get(n.as_str()).cloned())
                .collect(),
            None => self.detectors.values().cloned().collect(),
        };
        selected.sort_by_key(|d| d.name());
        selected
    }

    pub fn detector_names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.detectors.keys().copied().collect();
        names.sort();
        names
    }
}

/// A persisted scan report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskScanReport {
    pub report_id: String,
    pub tenant_id: String,
    pub created_at: chrono::DateTime<Utc>,
    pub expires_at: chrono::DateTime<Utc>,
    pub signals: Vec<RiskSignal>,
    pub warnings: Vec<String>,
}

/// Runs the detector suite and persists per-tenant reports.
pub struct RiskScanner {
    store: Arc<dyn GraphStore>,
    registry: DetectorRegistry,
    report_dir: PathBuf,
    report_ttl_days: i64,
}

impl RiskScanner {
    pub fn new(
        store: Arc<dyn GraphStore>,
        report_dir: impl Into<PathBuf>,
        report_ttl_days: i64,
    ) -> Self {
        Self {
            store,
            registry: DetectorRegistry::default(),
            report_dir: report_dir.into(),
            report_ttl_days,
        }
    }

    pub fn registry(&self) -> &DetectorRegistry {
        &self.registry
    }

    /// Run the suite. Detector failures and timeouts degrade to warnings;
    /// the aggregate is sorted by score and capped at `params.limit`.
    pub async fn scan(
        &self,
        scope: &ScopeContext,
        params: &RiskScanParams,
        detector_names: Option<&[String]>,
        persist: bool,
    ) -> Result<RiskScanReport> {
        let detectors = self.registry.select(detector_names);

        let runs = detectors.iter().map(|detector| {
            let store = Arc::clone(&self.store);
            let detector = Arc::clone(detector);
            let scope = scope.clone();
            let params = params.clone();
            async move {
                let name = detector.name();
                let outcome = tokio::time::timeout(
                    detector.timeout(),
                    detector.run(store.as_ref(), &scope, &params),
                )
                .await;
                (name, outcome)
            }
        });

        let mut signals: Vec<RiskSignal> = Vec::new();
        let mut warnings: Vec<String> = Vec::new();
        for (name, outcome) in join_all(runs).await {
            match outcome {
                Ok(Ok(mut detected)) => signals.append(&mut detected),
                Ok(Err(e)) => {
                    tracing::warn!(detector = name, error = %e, "risk detector failed");
                    warnings.push(format!("{}: {}", name, e));
                }
                Err(_) => {
                    tracing::warn!(detector = name, "risk detector timed out");
                    warnings.push(format!("{}: timeout", name));
                }
            }
        }

        signals.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        signals.truncate(params.limit);

        // Audit-chain support for entity-pair signals
        for signal in signals.iter_mut().filter(|s| s.entities.len() == 2) {
            match self
                .store
                .co_mention_docs(
                    &signal.entities[0].entity_id,
                    &signal.entities[1].entity_id,
                    5,
                    scope,
                )
                .await
            {
                Ok(docs) => {
                    signal.supporting_docs = Some(SupportingDocs {
                        count: docs.len(),
                        doc_ids_sample: docs.iter().map(|d| d.doc_id.clone()).collect(),
                        previews_sample: docs
                            .iter()
                            .map(|d| d.preview.clone())
                            .filter(|p| !p.is_empty())
                            .collect(),
                    });
                }
                Err(e) => {
                    warnings.push(format!("co-mention sampling failed: {}", e));
                }
            }
        }

        let now = Utc::now();
        let report = RiskScanReport {
            report_id: uuid::Uuid::new_v4().to_string(),
            tenant_id: scope.tenant_id.clone(),
            created_at: now,
            expires_at: now + ChronoDuration::days(self.report_ttl_days),
            signals,
            warnings,
        };

        if persist {
            let path = self
                .report_dir
                .join(format!("{}.jsonl", scope.tenant_id));
            let sink = JsonlTraceSink::new(path.to_string_lossy().to_string());
            if let Err(e) = sink.append(&serde_json::to_value(&report).unwrap_or_default()) {
                tracing::warn!(error = %e, "failed to persist risk report");
            }
        }

        Ok(report)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::{CoMentionDoc, EntitySeed, RawPath, ScoredChunk};
    use crate::types::Entity;

    struct ScriptedGraph;

    #[async_trait]
    impl GraphStore for ScriptedGraph {
        async fn find_entities(
            &self,
            _seeds: &[EntitySeed],
            _scope: &ScopeContext,
            _limit: usize,
        ) -> Result<Vec<Entity>> {
            Ok(Vec::new())
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
            _entity_ids: &[String],
            _limit: usize,
            _scope: &ScopeContext,
        ) -> Result<Vec<ScoredChunk>> {
            Ok(Vec::new())
        }

        async fn co_mention_docs(
            &self,
            _source_id: &str,
            _target_id: &str,
            limit: usize,
            _scope: &ScopeContext,
        ) -> Result<Vec<CoMentionDoc>> {
            Ok((0..limit)
                .map(|i| CoMentionDoc {
                    doc_id: format!("doc-{}", i),
                    preview: format!("preview {}", i),
                })
                .collect())
        }

        async fn run_query(&self, query: &str, _params: Value) -> Result<Vec<Value>> {
            // Only the co-mention detectors return rows in this script
            if query.contains("CO_MENTIONS") {
                Ok(vec![json!({
                    "score": 7.0,
                    "description": "pair signal",
                    "entities": [
                        {"entity_id": "e1", "name": "Org A", "kind": "organization"},
                        {"entity_id": "e2", "name": "Empresa B", "kind": "company"}
                    ]
                })])
            } else {
                Ok(Vec::new())
            }
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    #[test]
    fn test_registry_has_twelve_detectors() {
        let registry = DetectorRegistry::default();
        assert_eq!(registry.detector_names().len(), 12);
        assert!(registry
            .detector_names()
            .contains(&"org_company_co_mention"));
    }

    #[test]
    fn test_registry_selection_by_name() {
        let registry = DetectorRegistry::default();
        let selected = registry.select(Some(&[
            "hidden_communities".to_string(),
            "does_not_exist".to_string(),
        ]));
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].name(), "hidden_communities");
    }

    #[test]
    fn test_signal_from_row_requires_score() {
        assert!(signal_from_row("d", &json!({"description": "x"})).is_none());
        let signal = signal_from_row(
            "d",
            &json!({"score": 2.5, "description": "x", "entities": []}),
        )
        .unwrap();
        assert_eq!(signal.detector, "d");
        assert!((signal.score - 2.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_scan_samples_co_mention_docs_for_pairs() {
        let scanner = RiskScanner::new(Arc::new(ScriptedGraph), "/tmp/lexrag-risk-test", 30);
        let report = scanner
            .scan(
                &ScopeContext::global("t1"),
                &RiskScanParams::default(),
                None,
                false,
            )
            .await
            .unwrap();

        // Both co-mention detectors fire once each
        assert_eq!(report.signals.len(), 2);
        for signal in &report.signals {
            let docs = signal.supporting_docs.as_ref().unwrap();
            assert_eq!(docs.count, 5);
            assert_eq!(docs.doc_ids_sample.len(), 5);
        }
        assert!(report.expires_at > report.created_at);
    }

    #[tokio::test]
    async fn test_scan_caps_signals_globally() {
        let scanner = RiskScanner::new(Arc::new(ScriptedGraph), "/tmp/lexrag-risk-test", 30);
        let params = RiskScanParams {
            limit: 1,
            ..Default::default()
        };
        let report = scanner
            .scan(&ScopeContext::global("t1"), &params, None, false)
            .await
            .unwrap();
        assert_eq!(report.signals.len(), 1);
    }
}
