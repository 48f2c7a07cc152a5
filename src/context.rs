//! The `CoreContext`: explicit wiring for everything the core owns.
//!
//! There are no module-level singletons. The context is constructed once at
//! startup from an immutable [`RagConfig`] plus the store clients and
//! providers, and is passed to every request. Caches (results, expansion,
//! embeddings, rerank) are fields on the components it owns and live exactly
//! as long as the context.

use std::sync::Arc;
use std::time::Duration;

use futures::Stream;

use crate::agent::{AgentEvent, AgentOrchestrator, AgentRequest};
use crate::audit::{JsonlTraceSink, NoopTraceSink, TraceSink};
use crate::cograg::{CogGragReasoner, CogGragResult, ConsultationMemory};
use crate::compress::ChunkExpander;
use crate::config::{RagConfig, SearchOptions};
use crate::expansion::{ExpansionConfig, QueryExpansionService};
use crate::graphrag::enrich::GraphEnricher;
use crate::graphrag::risk::{RiskScanParams, RiskScanReport, RiskScanner};
use crate::llm::embeddings::{Embedder, RemoteEmbedder};
use crate::llm::{HttpLlmProvider, LlmProvider};
use crate::rerank::RerankService;
use crate::research::ResearchRegistry;
use crate::retrieval::graph::GraphRetriever;
use crate::retrieval::lexical::LexicalRetriever;
use crate::retrieval::pipeline::{PipelineResult, RetrievalOrchestrator};
use crate::retrieval::vector::VectorRetriever;
use crate::retrieval::Retriever;
use crate::stores::neo4j::Neo4jGraphStore;
use crate::stores::opensearch::OpenSearchIndex;
use crate::stores::qdrant::{HybridFusion, QdrantStore};
use crate::stores::{GraphStore, LexicalIndex, VectorStore};
use crate::types::{CoreError, Result, ScopeContext, SourceType};

/// Store clients the core depends on. The lexical index is mandatory; vector
/// and graph stores are optional capabilities.
pub struct CoreStores {
    pub lexical: Arc<dyn LexicalIndex>,
    pub vector: Option<Arc<dyn VectorStore>>,
    pub graph: Option<Arc<dyn GraphStore>>,
    pub embedder: Option<Arc<dyn Embedder>>,
}

impl CoreStores {
    /// Build the production clients from configuration.
    pub fn from_config(config: &RagConfig) -> Result<Self> {
        let lexical: Arc<dyn LexicalIndex> = Arc::new(OpenSearchIndex::new(
            &config.opensearch_url,
            &config.opensearch_user,
            &config.opensearch_password,
        ));
        let vector: Arc<dyn VectorStore> = Arc::new(QdrantStore::new(
            &config.qdrant_url,
            &config.qdrant_api_key,
            config.qdrant_sparse_enabled,
            HybridFusion::parse(&config.qdrant_hybrid_fusion)?,
            config.qdrant_hybrid_prefetch_limit,
        ));
        let graph: Arc<dyn GraphStore> = Arc::new(Neo4jGraphStore::new(
            &config.neo4j_http_url,
            &config.neo4j_database,
            &config.neo4j_user,
            &config.neo4j_password,
        ));
        let embedder: Arc<dyn Embedder> = Arc::new(RemoteEmbedder::new(
            &config.embedding_api_base,
            &config.embedding_api_key,
            &config.embedding_model,
            config.embedding_dimensions,
            config.embedding_cache_max_entries,
            Duration::from_secs(config.embedding_cache_ttl_seconds),
        ));
        Ok(Self {
            lexical,
            vector: Some(vector),
            graph: Some(graph),
            embedder: Some(embedder),
        })
    }
}

/// LLM and deep-research collaborators.
pub struct CoreProviders {
    /// Default generation provider (rewrite, HyDE, multi-query, CogGRAG).
    pub llm: Option<Arc<dyn LlmProvider>>,
    /// Planner for the agentic loop; falls back to `llm` when unset.
    pub planner: Option<Arc<dyn LlmProvider>>,
    /// Deep-research providers exposed as agent tools.
    pub research: ResearchRegistry,
}

impl CoreProviders {
    /// A provider set with one OpenAI-compatible LLM endpoint and no
    /// deep-research providers.
    pub fn with_http_llm(id: &str, api_base: &str, api_key: &str) -> Self {
        let llm: Arc<dyn LlmProvider> = Arc::new(HttpLlmProvider::new(id, api_base, api_key));
        Self {
            llm: Some(llm),
            planner: None,
            research: ResearchRegistry::new(),
        }
    }

    /// No LLM at all: retrieval-only operation, expansion degrades to
    /// heuristics.
    pub fn none() -> Self {
        Self {
            llm: None,
            planner: None,
            research: ResearchRegistry::new(),
        }
    }
}

/// Outcome of the citation-grounding hook.
#[derive(Debug, Clone, Default)]
pub struct CitationReport {
    /// Markers that resolved against the pipeline result.
    pub verified: usize,
    /// Markers with no matching chunk or path.
    pub unverified: Vec<String>,
}

impl CitationReport {
    /// Fidelity of the drafted text: verified markers over all markers.
    pub fn fidelity(&self) -> f32 {
        let total = self.verified + self.unverified.len();
        if total == 0 {
            1.0
        } else {
            self.verified as f32 / total as f32
        }
    }
}

/// The core's three operations — `retrieve`, `reason`, `agent_stream` —
/// plus the risk-scan entry point, behind one explicitly-constructed value.
pub struct CoreContext {
    config: Arc<RagConfig>,
    pipeline: Arc<RetrievalOrchestrator>,
    expansion: Arc<QueryExpansionService>,
    reasoner: Option<Arc<CogGragReasoner>>,
    agent: Option<Arc<AgentOrchestrator>>,
    scanner: Option<Arc<RiskScanner>>,
}

impl CoreContext {
    /// Construct the context. Fails fast on configuration violations.
    pub fn new(config: RagConfig, stores: CoreStores, providers: CoreProviders) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let expansion = Arc::new(QueryExpansionService::new(
            ExpansionConfig {
                hyde_model: config.hyde_model.clone(),
                hyde_max_tokens: config.hyde_max_tokens,
                multi_query_max: config.multi_query_max,
                multi_query_model: config.multi_query_model.clone(),
                rewrite_model: config.rewrite_model.clone(),
            },
            config.expansion_cache_max_entries,
            Duration::from_secs(config.expansion_cache_ttl_seconds),
        ));

        let lexical_retriever: Arc<dyn Retriever> = Arc::new(LexicalRetriever::new(
            Arc::clone(&stores.lexical),
            Duration::from_secs_f64(config.lexical_timeout_seconds),
        ));

        let vector_retriever: Option<Arc<dyn Retriever>> =
            match (&stores.vector, &stores.embedder) {
                (Some(vector), Some(embedder)) => Some(Arc::new(VectorRetriever::new(
                    Arc::clone(vector),
                    Arc::clone(embedder),
                    config.vector_query_max_concurrency,
                    Duration::from_secs_f64(config.vector_timeout_seconds),
                ))),
                (Some(_), None) => {
                    tracing::warn!("vector store configured without an embedder; vector retrieval disabled");
                    None
                }
                _ => None,
            };

        let graph_retriever: Option<Arc<dyn Retriever>> = stores.graph.as_ref().map(|graph| {
            Arc::new(GraphRetriever::new(
                Arc::clone(graph),
                config.graph_retrieval_limit,
                Duration::from_secs_f64(config.graph_search_timeout_seconds),
            )) as Arc<dyn Retriever>
        });

        let enricher = stores.graph.as_ref().map(|graph| {
            Arc::new(GraphEnricher::new(
                Arc::clone(graph),
                config.graph_hops,
                config.graph_max_nodes,
                config.graph_paths_max,
                config.graph_triples_max,
                Duration::from_secs_f64(config.graph_search_timeout_seconds),
            ))
        });

        let chunk_expander = Some(Arc::new(ChunkExpander::new(
            Arc::clone(&stores.lexical),
            config.chunk_expansion_window,
            config.chunk_expansion_max_extra,
            config.chunk_expansion_merge_adjacent,
        )));

        let rerank = stores
            .embedder
            .as_ref()
            .and_then(|embedder| RerankService::from_config(&config, Arc::clone(embedder)))
            .map(Arc::new);

        let (trace_sink, audit_sink): (Arc<dyn TraceSink>, Arc<dyn TraceSink>) =
            if config.enable_tracing {
                (
                    Arc::new(JsonlTraceSink::new(config.trace_log_path.clone())),
                    Arc::new(JsonlTraceSink::new(config.audit_log_path.clone())),
                )
            } else {
                (Arc::new(NoopTraceSink), Arc::new(NoopTraceSink))
            };

        let pipeline = Arc::new(RetrievalOrchestrator::new(
            Arc::clone(&config),
            lexical_retriever,
            vector_retriever,
            graph_retriever,
            enricher,
            chunk_expander,
            Arc::clone(&expansion),
            rerank,
            providers.llm.clone(),
            trace_sink,
            audit_sink,
        ));

        let reasoner = providers.llm.clone().map(|llm| {
            let memory = Arc::new(ConsultationMemory::new(
                config.expansion_cache_max_entries,
                Duration::from_secs(config.expansion_cache_ttl_seconds),
                config.cograg_memory_similarity_threshold,
            ));
            Arc::new(CogGragReasoner::new(
                Arc::clone(&config),
                Arc::clone(&pipeline),
                llm,
                Some(memory),
            ))
        });

        let planner = providers.planner.or_else(|| providers.llm.clone());
        let agent = planner.map(|planner| {
            Arc::new(AgentOrchestrator::new(
                Arc::clone(&config),
                planner,
                Arc::new(providers.research),
                Arc::clone(&pipeline),
            ))
        });

        let scanner = stores.graph.as_ref().map(|graph| {
            Arc::new(RiskScanner::new(
                Arc::clone(graph),
                config.risk_report_dir.clone(),
                config.risk_report_ttl_days,
            ))
        });

        Ok(Self {
            config,
            pipeline,
            expansion,
            reasoner,
            agent,
            scanner,
        })
    }

    /// `Retrieve`: the full pipeline, one call, one complete result.
    pub async fn retrieve(
        &self,
        query: &str,
        top_k: usize,
        sources: Option<Vec<SourceType>>,
        scope: ScopeContext,
        options: SearchOptions,
    ) -> Result<PipelineResult> {
        self.pipeline.search(query, top_k, sources, scope, options).await
    }

    /// `Reason`: cognitive decomposition over the pipeline.
    pub async fn reason(
        &self,
        question: &str,
        scope: ScopeContext,
        options: SearchOptions,
    ) -> Result<CogGragResult> {
        let reasoner = self.reasoner.as_ref().ok_or_else(|| {
            CoreError::InvalidRequest("reasoning requires an LLM provider".to_string())
        })?;
        reasoner.reason(question, scope, options).await
    }

    /// `AgentStream`: the tool-driven research loop, as a stream of typed
    /// events.
    pub fn agent_stream(&self, request: AgentRequest) -> Result<impl Stream<Item = AgentEvent>> {
        let agent = self.agent.as_ref().ok_or_else(|| {
            CoreError::InvalidRequest("the agent loop requires a planner provider".to_string())
        })?;
        Ok(Arc::clone(agent).stream(request))
    }

    /// Deterministic graph risk scan for audit workflows.
    pub async fn risk_scan(
        &self,
        scope: &ScopeContext,
        params: &RiskScanParams,
        detector_names: Option<&[String]>,
        persist: bool,
    ) -> Result<RiskScanReport> {
        let scanner = self.scanner.as_ref().ok_or_else(|| {
            CoreError::InvalidRequest("risk scanning requires a graph store".to_string())
        })?;
        scanner.scan(scope, params, detector_names, persist).await
    }

    /// Post-generation citation grounding hook.
    ///
    /// Downstream generators call this with their drafted text and the
    /// pipeline result it was grounded on; `[ref:..]` / `[path:..]` markers
    /// that do not resolve against the result's attributions or graph paths
    /// are reported as unverified. Returns `None` when citation grounding is
    /// disabled.
    pub fn ground_citations(
        &self,
        text: &str,
        result: &PipelineResult,
    ) -> Option<CitationReport> {
        if !self.config.enable_citation_grounding {
            return None;
        }
        static MARKER_RE: once_cell::sync::Lazy<regex::Regex> = once_cell::sync::Lazy::new(|| {
            regex::Regex::new(r"\[(ref|path):([^\]\s]+)\]").expect("static pattern")
        });

        let mut report = CitationReport::default();
        for caps in MARKER_RE.captures_iter(text) {
            let marker = caps[0].to_string();
            let id = &caps[2];
            let known = match &caps[1] {
                "ref" => result.results.iter().any(|r| r.chunk.chunk_uid == id),
                _ => result.graph_paths.iter().any(|p| p.path_uid == id),
            };
            if known {
                report.verified += 1;
            } else {
                report.unverified.push(marker);
            }
        }
        Some(report)
    }

    /// Per-request options seeded from the configured feature defaults.
    pub fn default_options(&self) -> SearchOptions {
        self.config.default_options()
    }

    pub fn config(&self) -> &RagConfig {
        &self.config
    }

    /// Drop process-scope caches. Store clients close with their own drops.
    pub fn shutdown(&self) {
        self.expansion.clear_caches();
    }
}

// ============================================================================
// Tests
// ============================================================================
