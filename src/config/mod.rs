//! Configuration for the retrieval core.
//!
//! All settings are configurable via environment variables with sensible
//! defaults, or loaded from a TOML file with environment overrides. The
//! configuration is read once at startup into an immutable [`RagConfig`]
//! snapshot; [`SearchOptions`] is the per-request override record merged on
//! top of the snapshot's feature defaults.

use std::env;

use serde::{Deserialize, Serialize};

use crate::types::{CoreError, Result};

// ============================================================================
// Environment Helpers
// ============================================================================

fn env_bool(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(raw) => matches!(raw.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

fn env_str(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

// ============================================================================
// Core Configuration
// ============================================================================

/// Complete retrieval-core configuration.
///
/// Sections:
/// - Feature flags (enable/disable pipeline stages)
/// - CRAG gate thresholds and retry strategies
/// - Query expansion (HyDE, multi-query)
/// - Reranking
/// - Compression and chunk expansion
/// - Graph retrieval and enrichment
/// - Store endpoints (lexical, vector, graph)
/// - RRF fusion weights
/// - Budget caps, timeouts, caches
/// - CogGRAG and the agentic orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RagConfig {
    // ==================== Feature Flags ====================
    pub enable_crag: bool,
    pub enable_hyde: bool,
    pub enable_multi_query: bool,
    pub enable_rerank: bool,
    pub enable_compression: bool,
    pub enable_chunk_expansion: bool,
    pub enable_graph_enrich: bool,
    pub enable_graph_retrieval: bool,
    pub enable_lexical_first_gating: bool,
    pub enable_contextual_embeddings: bool,
    pub enable_citation_grounding: bool,
    pub enable_tracing: bool,
    pub enable_result_cache: bool,

    // ==================== CRAG Gate ====================
    pub crag_min_best_score: f32,
    pub crag_min_avg_score: f32,
    pub crag_strong_best_threshold: f32,
    pub crag_strong_avg_threshold: f32,
    pub crag_max_retries: usize,
    pub crag_aggressive_top_k_multiplier: f32,
    pub crag_aggressive_lexical_weight: f32,
    pub crag_aggressive_vector_weight: f32,

    // ==================== Query Expansion ====================
    pub hyde_model: String,
    pub hyde_max_tokens: u32,
    pub multi_query_max: usize,
    pub multi_query_model: String,
    pub rewrite_model: String,
    pub expansion_cache_ttl_seconds: u64,
    pub expansion_cache_max_entries: usize,

    // ==================== Reranking ====================
    /// Provider: "auto" (development=local, production=cohere), "local",
    /// "colbert", "cohere".
    pub rerank_provider: String,
    pub rerank_model: String,
    pub rerank_batch_size: usize,
    pub rerank_top_k: usize,
    pub rerank_max_candidates: usize,
    pub rerank_max_chars: usize,
    pub cohere_rerank_model: String,
    pub cohere_api_base: String,
    pub cohere_api_key: String,
    pub cohere_fallback_to_local: bool,
    /// Fixed additive boost for statute/jurisprudence results.
    pub rerank_legal_boost: f32,
    pub colbert_cache_max_entries: usize,
    pub colbert_cache_ttl_seconds: u64,

    // ==================== Compression ====================
    pub compression_max_chars: usize,
    pub compression_preserve_full_text: bool,

    // ==================== Chunk Expansion ====================
    pub chunk_expansion_window: usize,
    pub chunk_expansion_max_extra: usize,
    pub chunk_expansion_merge_adjacent: bool,

    // ==================== Graph ====================
    pub graph_hops: usize,
    pub graph_max_nodes: usize,
    pub graph_retrieval_limit: usize,
    pub graph_search_timeout_seconds: f64,
    pub graph_triples_max: usize,
    pub graph_paths_max: usize,
    pub risk_scan_limit: usize,
    pub risk_min_shared_docs: u64,
    pub risk_report_dir: String,
    pub risk_report_ttl_days: i64,

    // ==================== Stores ====================
    pub opensearch_url: String,
    pub opensearch_user: String,
    pub opensearch_password: String,
    pub qdrant_url: String,
    pub qdrant_api_key: String,
    pub qdrant_sparse_enabled: bool,
    /// Server-side hybrid fusion inside the vector store: "rrf" | "dbsf".
    pub qdrant_hybrid_fusion: String,
    pub qdrant_hybrid_prefetch_limit: usize,
    pub vector_query_max_concurrency: usize,
    pub neo4j_http_url: String,
    pub neo4j_user: String,
    pub neo4j_password: String,
    pub neo4j_database: String,

    // ==================== Embeddings ====================
    pub embedding_model: String,
    pub embedding_dimensions: usize,
    pub embedding_api_base: String,
    pub embedding_api_key: String,
    pub embedding_cache_ttl_seconds: u64,
    pub embedding_cache_max_entries: usize,

    // ==================== RRF Fusion ====================
    pub rrf_k: f32,
    pub lexical_weight: f32,
    pub vector_weight: f32,
    pub graph_weight: f32,

    // ==================== Budget Caps ====================
    pub max_tokens_per_request: u64,
    pub max_llm_calls_per_request: u64,
    pub warn_at_budget_percent: f32,
    /// Bounded retries with exponential backoff for remote providers.
    pub max_retries: usize,

    // ==================== Timeouts & Search Defaults ====================
    pub lexical_timeout_seconds: f64,
    pub vector_timeout_seconds: f64,
    pub llm_timeout_seconds: f64,
    pub request_deadline_seconds: f64,
    pub default_fetch_k: usize,
    pub default_top_k: usize,
    pub min_sources_required: usize,

    // ==================== Lexical-First Gating ====================
    /// If the best trial lexical score crosses this and the query matches a
    /// citation pattern, vector search is skipped.
    pub lexical_strong_threshold: f32,
    pub lexical_citation_patterns: Vec<String>,

    // ==================== Result Cache ====================
    pub result_cache_ttl_seconds: u64,
    pub result_cache_max_entries: usize,

    // ==================== Tracing / Audit ====================
    pub trace_log_path: String,
    pub audit_log_path: String,
    pub trace_persist_db: bool,
    pub trace_export_otel: bool,

    // ==================== CogGRAG ====================
    pub cograg_max_depth: usize,
    pub cograg_max_children: usize,
    pub cograg_complexity_threshold: f32,
    pub cograg_abstain_mode: bool,
    pub cograg_abstain_threshold: f32,
    pub cograg_graph_evidence_enabled: bool,
    pub cograg_graph_evidence_max_hops: usize,
    pub cograg_graph_evidence_limit: usize,
    pub cograg_evidence_refinement_enabled: bool,
    pub cograg_memory_similarity_threshold: f32,
    pub cograg_verification_enabled: bool,
    pub cograg_max_rethink_attempts: usize,
    pub cograg_llm_max_concurrency: usize,
    pub cograg_decomposer_model: String,
    pub cograg_verification_model: String,

    // ==================== Agentic Orchestrator ====================
    pub max_agent_iterations: usize,
    pub agent_channel_capacity: usize,
    pub agent_tool_timeout_seconds: f64,
    pub agent_tool_result_max_chars: usize,

    // ==================== Environment ====================
    /// "development" or "production"; drives the "auto" rerank provider.
    pub environment: String,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            // Feature flags
            enable_crag: true,
            enable_hyde: true,
            enable_multi_query: true,
            enable_rerank: true,
            enable_compression: true,
            enable_chunk_expansion: true,
            enable_graph_enrich: true,
            enable_graph_retrieval: true,
            enable_lexical_first_gating: true,
            enable_contextual_embeddings: false,
            enable_citation_grounding: true,
            enable_tracing: true,
            enable_result_cache: true,

            // CRAG
            crag_min_best_score: 0.35,
            crag_min_avg_score: 0.25,
            crag_strong_best_threshold: 0.65,
            crag_strong_avg_threshold: 0.50,
            crag_max_retries: 2,
            crag_aggressive_top_k_multiplier: 2.0,
            crag_aggressive_lexical_weight: 0.45,
            crag_aggressive_vector_weight: 0.55,

            // Expansion
            hyde_model: "gemini-2.0-flash".to_string(),
            hyde_max_tokens: 300,
            multi_query_max: 3,
            multi_query_model: "gemini-2.0-flash".to_string(),
            rewrite_model: "gemini-2.0-flash".to_string(),
            expansion_cache_ttl_seconds: 3600,
            expansion_cache_max_entries: 5000,

            // Reranking
            rerank_provider: "auto".to_string(),
            rerank_model: "cross-encoder/ms-marco-MiniLM-L-6-v2".to_string(),
            rerank_batch_size: 32,
            rerank_top_k: 10,
            rerank_max_candidates: 100,
            rerank_max_chars: 1800,
            cohere_rerank_model: "rerank-v4.0-pro".to_string(),
            cohere_api_base: "https://api.cohere.com".to_string(),
            cohere_api_key: String::new(),
            cohere_fallback_to_local: true,
            rerank_legal_boost: 0.1,
            colbert_cache_max_entries: 2048,
            colbert_cache_ttl_seconds: 3600,

            // Compression
            compression_max_chars: 900,
            compression_preserve_full_text: true,

            // Chunk expansion
            chunk_expansion_window: 1,
            chunk_expansion_max_extra: 12,
            chunk_expansion_merge_adjacent: true,

            // Graph
            graph_hops: 2,
            graph_max_nodes: 50,
            graph_retrieval_limit: 20,
            graph_search_timeout_seconds: 0.5,
            graph_triples_max: 12,
            graph_paths_max: 8,
            risk_scan_limit: 50,
            risk_min_shared_docs: 3,
            risk_report_dir: "logs/risk_reports".to_string(),
            risk_report_ttl_days: 30,

            // Stores
            opensearch_url: "https://localhost:9200".to_string(),
            opensearch_user: "admin".to_string(),
            opensearch_password: "admin".to_string(),
            qdrant_url: "http://localhost:6333".to_string(),
            qdrant_api_key: String::new(),
            qdrant_sparse_enabled: false,
            qdrant_hybrid_fusion: "rrf".to_string(),
            qdrant_hybrid_prefetch_limit: 40,
            vector_query_max_concurrency: 4,
            neo4j_http_url: "http://localhost:7474".to_string(),
            neo4j_user: "neo4j".to_string(),
            neo4j_password: "password".to_string(),
            neo4j_database: "neo4j".to_string(),

            // Embeddings
            embedding_model: "text-embedding-3-large".to_string(),
            embedding_dimensions: 3072,
            embedding_api_base: "https://api.openai.com/v1".to_string(),
            embedding_api_key: String::new(),
            embedding_cache_ttl_seconds: 3600,
            embedding_cache_max_entries: 10_000,

            // RRF
            rrf_k: 60.0,
            lexical_weight: 0.5,
            vector_weight: 0.5,
            graph_weight: 0.3,

            // Budget
            max_tokens_per_request: 50_000,
            max_llm_calls_per_request: 5,
            warn_at_budget_percent: 0.8,
            max_retries: 3,

            // Timeouts & search defaults
            lexical_timeout_seconds: 0.5,
            vector_timeout_seconds: 1.0,
            llm_timeout_seconds: 20.0,
            request_deadline_seconds: 30.0,
            default_fetch_k: 50,
            default_top_k: 10,
            min_sources_required: 1,

            // Lexical-first gating
            lexical_strong_threshold: 0.7,
            lexical_citation_patterns: vec![
                r"art\.?\s*\d+".to_string(),
                r"§\s*\d+".to_string(),
                r"inciso\s+[IVXLCDM]+".to_string(),
                r"lei\s+n?\.?\s*\d+".to_string(),
                r"súmula\s+n?\.?\s*\d+".to_string(),
                r"stf|stj|tst|trf|tjsp".to_string(),
                // CNJ process number
                r"\d{7}-\d{2}\.\d{4}\.\d\.\d{2}\.\d{4}".to_string(),
            ],

            // Result cache
            result_cache_ttl_seconds: 300,
            result_cache_max_entries: 5000,

            // Tracing
            trace_log_path: "logs/rag_trace.jsonl".to_string(),
            audit_log_path: "logs/rag_audit.jsonl".to_string(),
            trace_persist_db: false,
            trace_export_otel: false,

            // CogGRAG
            cograg_max_depth: 3,
            cograg_max_children: 4,
            cograg_complexity_threshold: 0.5,
            cograg_abstain_mode: true,
            cograg_abstain_threshold: 0.3,
            cograg_graph_evidence_enabled: true,
            cograg_graph_evidence_max_hops: 2,
            cograg_graph_evidence_limit: 10,
            cograg_evidence_refinement_enabled: true,
            cograg_memory_similarity_threshold: 0.85,
            cograg_verification_enabled: false,
            cograg_max_rethink_attempts: 2,
            cograg_llm_max_concurrency: 6,
            cograg_decomposer_model: "gemini-2.0-flash".to_string(),
            cograg_verification_model: "gemini-2.0-flash".to_string(),

            // Agent
            max_agent_iterations: 12,
            agent_channel_capacity: 64,
            agent_tool_timeout_seconds: 90.0,
            agent_tool_result_max_chars: 4000,

            environment: "development".to_string(),
        }
    }
}

impl RagConfig {
    /// Load configuration from environment variables.
    ///
    /// A `.env` file is honored when present. Unset variables fall back to
    /// the defaults above.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let d = Self::default();

        let cfg = Self {
            enable_crag: env_bool("RAG_ENABLE_CRAG", d.enable_crag),
            enable_hyde: env_bool("RAG_ENABLE_HYDE", d.enable_hyde),
            enable_multi_query: env_bool("RAG_ENABLE_MULTIQUERY", d.enable_multi_query),
            enable_rerank: env_bool("RAG_ENABLE_RERANK", d.enable_rerank),
            enable_compression: env_bool("RAG_ENABLE_COMPRESSION", d.enable_compression),
            enable_chunk_expansion: env_bool("RAG_ENABLE_CHUNK_EXPANSION", d.enable_chunk_expansion),
            enable_graph_enrich: env_bool("RAG_ENABLE_GRAPH_ENRICH", d.enable_graph_enrich),
            enable_graph_retrieval: env_bool("RAG_ENABLE_GRAPH_RETRIEVAL", d.enable_graph_retrieval),
            enable_lexical_first_gating: env_bool("RAG_ENABLE_LEXICAL_FIRST", d.enable_lexical_first_gating),
            enable_contextual_embeddings: env_bool("RAG_CONTEXTUAL_EMBEDDINGS_ENABLED", d.enable_contextual_embeddings),
            enable_citation_grounding: env_bool("CITATION_GROUNDING_ENABLED", d.enable_citation_grounding),
            enable_tracing: env_bool("RAG_ENABLE_TRACING", d.enable_tracing),
            enable_result_cache: env_bool("RAG_ENABLE_RESULT_CACHE", d.enable_result_cache),

            crag_min_best_score: env_parse("CRAG_MIN_BEST_SCORE", d.crag_min_best_score),
            crag_min_avg_score: env_parse("CRAG_MIN_AVG_SCORE", d.crag_min_avg_score),
            crag_strong_best_threshold: env_parse("CRAG_STRONG_BEST_THRESHOLD", d.crag_strong_best_threshold),
            crag_strong_avg_threshold: env_parse("CRAG_STRONG_AVG_THRESHOLD", d.crag_strong_avg_threshold),
            crag_max_retries: env_parse("CRAG_MAX_RETRY_ROUNDS", d.crag_max_retries),
            crag_aggressive_top_k_multiplier: env_parse("CRAG_AGGRESSIVE_TOP_K_MULT", d.crag_aggressive_top_k_multiplier),
            crag_aggressive_lexical_weight: env_parse("CRAG_AGGRESSIVE_BM25_WEIGHT", d.crag_aggressive_lexical_weight),
            crag_aggressive_vector_weight: env_parse("CRAG_AGGRESSIVE_SEMANTIC_WEIGHT", d.crag_aggressive_vector_weight),

            hyde_model: env_str("RAG_HYDE_MODEL", &d.hyde_model),
            hyde_max_tokens: env_parse("RAG_HYDE_MAX_TOKENS", d.hyde_max_tokens),
            multi_query_max: env_parse("RAG_MULTIQUERY_MAX", d.multi_query_max),
            multi_query_model: env_str("RAG_MULTIQUERY_MODEL", &d.multi_query_model),
            rewrite_model: env_str("RAG_REWRITE_MODEL", &d.rewrite_model),
            expansion_cache_ttl_seconds: env_parse("RAG_EXPANSION_CACHE_TTL", d.expansion_cache_ttl_seconds),
            expansion_cache_max_entries: env_parse("RAG_EXPANSION_CACHE_MAX", d.expansion_cache_max_entries),

            rerank_provider: env_str("RERANK_PROVIDER", &d.rerank_provider),
            rerank_model: env_str("RAG_RERANK_MODEL", &d.rerank_model),
            rerank_batch_size: env_parse("RAG_RERANK_BATCH_SIZE", d.rerank_batch_size),
            rerank_top_k: env_parse("RAG_RERANK_TOP_K", d.rerank_top_k),
            rerank_max_candidates: env_parse("RAG_RERANK_MAX_CANDIDATES", d.rerank_max_candidates),
            rerank_max_chars: env_parse("RAG_RERANK_MAX_CHARS", d.rerank_max_chars),
            cohere_rerank_model: env_str("COHERE_RERANK_MODEL", &d.cohere_rerank_model),
            cohere_api_base: env_str("COHERE_API_BASE", &d.cohere_api_base),
            cohere_api_key: env_str("COHERE_API_KEY", &d.cohere_api_key),
            cohere_fallback_to_local: env_bool("RERANK_FALLBACK_LOCAL", d.cohere_fallback_to_local),
            rerank_legal_boost: env_parse("RERANK_LEGAL_BOOST", d.rerank_legal_boost),
            colbert_cache_max_entries: env_parse("RAG_COLBERT_CACHE_MAX", d.colbert_cache_max_entries),
            colbert_cache_ttl_seconds: env_parse("RAG_COLBERT_CACHE_TTL", d.colbert_cache_ttl_seconds),

            compression_max_chars: env_parse("RAG_COMPRESSION_MAX_CHARS", d.compression_max_chars),
            compression_preserve_full_text: env_bool("RAG_COMPRESSION_PRESERVE_FULL", d.compression_preserve_full_text),

            chunk_expansion_window: env_parse("RAG_CHUNK_EXPANSION_WINDOW", d.chunk_expansion_window),
            chunk_expansion_max_extra: env_parse("RAG_CHUNK_EXPANSION_MAX_EXTRA", d.chunk_expansion_max_extra),
            chunk_expansion_merge_adjacent: env_bool("RAG_CHUNK_EXPANSION_MERGE", d.chunk_expansion_merge_adjacent),

            graph_hops: env_parse("RAG_GRAPH_HOPS", d.graph_hops),
            graph_max_nodes: env_parse("RAG_GRAPH_MAX_NODES", d.graph_max_nodes),
            graph_retrieval_limit: env_parse("RAG_GRAPH_RETRIEVAL_LIMIT", d.graph_retrieval_limit),
            graph_search_timeout_seconds: env_parse("RAG_GRAPH_SEARCH_TIMEOUT", d.graph_search_timeout_seconds),
            graph_triples_max: env_parse("RAG_GRAPH_TRIPLES_MAX", d.graph_triples_max),
            graph_paths_max: env_parse("RAG_GRAPH_PATHS_MAX", d.graph_paths_max),
            risk_scan_limit: env_parse("RAG_RISK_SCAN_LIMIT", d.risk_scan_limit),
            risk_min_shared_docs: env_parse("RAG_RISK_MIN_SHARED_DOCS", d.risk_min_shared_docs),
            risk_report_dir: env_str("RAG_RISK_REPORT_DIR", &d.risk_report_dir),
            risk_report_ttl_days: env_parse("RAG_RISK_REPORT_TTL_DAYS", d.risk_report_ttl_days),

            opensearch_url: env_str("OPENSEARCH_URL", &d.opensearch_url),
            opensearch_user: env_str("OPENSEARCH_USER", &d.opensearch_user),
            opensearch_password: env_str("OPENSEARCH_PASS", &d.opensearch_password),
            qdrant_url: env_str("QDRANT_URL", &d.qdrant_url),
            qdrant_api_key: env_str("QDRANT_API_KEY", &d.qdrant_api_key),
            qdrant_sparse_enabled: env_bool("RAG_QDRANT_SPARSE_ENABLED", d.qdrant_sparse_enabled),
            qdrant_hybrid_fusion: env_str("RAG_QDRANT_HYBRID_FUSION", &d.qdrant_hybrid_fusion),
            qdrant_hybrid_prefetch_limit: env_parse("RAG_QDRANT_HYBRID_PREFETCH_LIMIT", d.qdrant_hybrid_prefetch_limit),
            vector_query_max_concurrency: env_parse("RAG_VECTOR_QUERY_MAX_CONCURRENCY", d.vector_query_max_concurrency),
            neo4j_http_url: env_str("NEO4J_HTTP_URL", &d.neo4j_http_url),
            neo4j_user: env_str("NEO4J_USER", &d.neo4j_user),
            neo4j_password: env_str("NEO4J_PASSWORD", &d.neo4j_password),
            neo4j_database: env_str("NEO4J_DATABASE", &d.neo4j_database),

            embedding_model: env_str("EMBEDDING_MODEL", &d.embedding_model),
            embedding_dimensions: env_parse("EMBEDDING_DIMENSIONS", d.embedding_dimensions),
            embedding_api_base: env_str("EMBEDDING_API_BASE", &d.embedding_api_base),
            embedding_api_key: env_str("EMBEDDING_API_KEY", &d.embedding_api_key),
            embedding_cache_ttl_seconds: env_parse("EMBEDDING_CACHE_TTL", d.embedding_cache_ttl_seconds),
            embedding_cache_max_entries: env_parse("EMBEDDING_CACHE_MAX", d.embedding_cache_max_entries),

            rrf_k: env_parse("RAG_RRF_K", d.rrf_k),
            lexical_weight: env_parse("RAG_LEXICAL_WEIGHT", d.lexical_weight),
            vector_weight: env_parse("RAG_VECTOR_WEIGHT", d.vector_weight),
            graph_weight: env_parse("RAG_GRAPH_WEIGHT", d.graph_weight),

            max_tokens_per_request: env_parse("RAG_MAX_TOKENS_PER_REQUEST", d.max_tokens_per_request),
            max_llm_calls_per_request: env_parse("RAG_MAX_LLM_CALLS_PER_REQUEST", d.max_llm_calls_per_request),
            warn_at_budget_percent: env_parse("RAG_WARN_AT_BUDGET_PERCENT", d.warn_at_budget_percent),
            max_retries: env_parse("RAG_MAX_RETRIES", d.max_retries),

            lexical_timeout_seconds: env_parse("RAG_LEXICAL_TIMEOUT", d.lexical_timeout_seconds),
            vector_timeout_seconds: env_parse("RAG_VECTOR_TIMEOUT", d.vector_timeout_seconds),
            llm_timeout_seconds: env_parse("RAG_LLM_TIMEOUT", d.llm_timeout_seconds),
            request_deadline_seconds: env_parse("RAG_REQUEST_DEADLINE", d.request_deadline_seconds),
            default_fetch_k: env_parse("RAG_DEFAULT_FETCH_K", d.default_fetch_k),
            default_top_k: env_parse("RAG_DEFAULT_TOP_K", d.default_top_k),
            min_sources_required: env_parse("RAG_MIN_SOURCES", d.min_sources_required),

            lexical_strong_threshold: env_parse("RAG_LEXICAL_STRONG_THRESHOLD", d.lexical_strong_threshold),
            lexical_citation_patterns: d.lexical_citation_patterns.clone(),

            result_cache_ttl_seconds: env_parse("RAG_RESULT_CACHE_TTL", d.result_cache_ttl_seconds),
            result_cache_max_entries: env_parse("RAG_RESULT_CACHE_MAX", d.result_cache_max_entries),

            trace_log_path: env_str("RAG_TRACE_LOG_PATH", &d.trace_log_path),
            audit_log_path: env_str("RAG_AUDIT_LOG_PATH", &d.audit_log_path),
            trace_persist_db: env_bool("RAG_TRACE_PERSIST_DB", d.trace_persist_db),
            trace_export_otel: env_bool("RAG_TRACE_EXPORT_OTEL", d.trace_export_otel),

            cograg_max_depth: env_parse("RAG_COGRAG_MAX_DEPTH", d.cograg_max_depth),
            cograg_max_children: env_parse("RAG_COGRAG_MAX_CHILDREN", d.cograg_max_children),
            cograg_complexity_threshold: env_parse("RAG_COGRAG_COMPLEXITY_THRESHOLD", d.cograg_complexity_threshold),
            cograg_abstain_mode: env_bool("RAG_COGRAG_ABSTAIN_MODE", d.cograg_abstain_mode),
            cograg_abstain_threshold: env_parse("RAG_COGRAG_ABSTAIN_THRESHOLD", d.cograg_abstain_threshold),
            cograg_graph_evidence_enabled: env_bool("RAG_COGRAG_GRAPH_EVIDENCE", d.cograg_graph_evidence_enabled),
            cograg_graph_evidence_max_hops: env_parse("RAG_COGRAG_GRAPH_EVIDENCE_MAX_HOPS", d.cograg_graph_evidence_max_hops),
            cograg_graph_evidence_limit: env_parse("RAG_COGRAG_GRAPH_EVIDENCE_LIMIT", d.cograg_graph_evidence_limit),
            cograg_evidence_refinement_enabled: env_bool("RAG_COGRAG_EVIDENCE_REFINEMENT", d.cograg_evidence_refinement_enabled),
            cograg_memory_similarity_threshold: env_parse("RAG_COGRAG_MEMORY_SIMILARITY_THRESHOLD", d.cograg_memory_similarity_threshold),
            cograg_verification_enabled: env_bool("RAG_COGRAG_VERIFICATION", d.cograg_verification_enabled),
            cograg_max_rethink_attempts: env_parse("RAG_COGRAG_MAX_RETHINK", d.cograg_max_rethink_attempts),
            cograg_llm_max_concurrency: env_parse("RAG_COGRAG_LLM_MAX_CONCURRENCY", d.cograg_llm_max_concurrency),
            cograg_decomposer_model: env_str("RAG_COGRAG_DECOMPOSER_MODEL", &d.cograg_decomposer_model),
            cograg_verification_model: env_str("RAG_COGRAG_VERIFICATION_MODEL", &d.cograg_verification_model),

            max_agent_iterations: env_parse("RAG_MAX_AGENT_ITERATIONS", d.max_agent_iterations),
            agent_channel_capacity: env_parse("RAG_AGENT_CHANNEL_CAPACITY", d.agent_channel_capacity),
            agent_tool_timeout_seconds: env_parse("RAG_AGENT_TOOL_TIMEOUT", d.agent_tool_timeout_seconds),
            agent_tool_result_max_chars: env_parse("RAG_AGENT_TOOL_RESULT_MAX_CHARS", d.agent_tool_result_max_chars),

            environment: env_str("LEXRAG_ENV", &d.environment),
        };

        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from a TOML file, layering `RAG_*`-style environment overrides
    /// on top, then validate.
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(true))
            .add_source(config::Environment::default().separator("__"))
            .build()
            .map_err(|e| CoreError::Config(format!("Failed to read config file: {}", e)))?;

        let cfg: RagConfig = settings
            .try_deserialize()
            .map_err(|e| CoreError::Config(format!("Failed to parse config file: {}", e)))?;

        cfg.validate()?;
        Ok(cfg)
    }

    /// Check startup-time invariants. Violations are fatal before any request.
    pub fn validate(&self) -> Result<()> {
        if self.rrf_k <= 0.0 {
            return Err(CoreError::Config("rrf_k must be positive".to_string()));
        }
        if self.lexical_weight < 0.0 || self.vector_weight < 0.0 || self.graph_weight < 0.0 {
            return Err(CoreError::Config("fusion weights must be non-negative".to_string()));
        }
        if self.crag_min_best_score > self.crag_strong_best_threshold
            || self.crag_min_avg_score > self.crag_strong_avg_threshold
        {
            return Err(CoreError::Config(
                "CRAG strong thresholds must be >= minimum thresholds".to_string(),
            ));
        }
        if self.default_top_k == 0 || self.default_top_k > 50 {
            return Err(CoreError::Config("default_top_k must be in [1, 50]".to_string()));
        }
        if self.max_llm_calls_per_request == 0 {
            return Err(CoreError::Config("max_llm_calls_per_request must be >= 1".to_string()));
        }
        if self.min_sources_required == 0 || self.min_sources_required > 3 {
            return Err(CoreError::Config("min_sources_required must be in [1, 3]".to_string()));
        }
        if self.vector_query_max_concurrency == 0 {
            return Err(CoreError::Config("vector_query_max_concurrency must be >= 1".to_string()));
        }
        match self.qdrant_hybrid_fusion.as_str() {
            "rrf" | "dbsf" => {}
            other => {
                return Err(CoreError::Config(format!(
                    "qdrant_hybrid_fusion must be 'rrf' or 'dbsf', got '{}'",
                    other
                )))
            }
        }
        for pattern in &self.lexical_citation_patterns {
            regex::Regex::new(&format!("(?i){}", pattern))
                .map_err(|e| CoreError::Config(format!("invalid citation pattern '{}': {}", pattern, e)))?;
        }
        Ok(())
    }

    /// Per-request options seeded from this configuration's feature defaults.
    pub fn default_options(&self) -> SearchOptions {
        SearchOptions {
            enable_hyde: self.enable_hyde,
            enable_multi_query: self.enable_multi_query,
            enable_crag: self.enable_crag,
            enable_rerank: self.enable_rerank,
            enable_compression: self.enable_compression,
            enable_chunk_expansion: self.enable_chunk_expansion,
            enable_graph_enrich: self.enable_graph_enrich,
            enable_graph_retrieval: self.enable_graph_retrieval,
            enable_lexical_first_gating: self.enable_lexical_first_gating,
            enable_contextual_embeddings: self.enable_contextual_embeddings,
            enable_citation_grounding: self.enable_citation_grounding,
            dense_research: false,
            include_candidate_edges: false,
            graph_only: false,
            conversation_history: Vec::new(),
            conversation_summary: None,
            accept_partial: true,
        }
    }

    /// Whether "auto" rerank selection should pick the remote provider.
    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }
}

// ============================================================================
// Per-Request Options
// ============================================================================

/// Feature toggles and request-scoped inputs merged on top of [`RagConfig`]'s
/// defaults. Build one with [`RagConfig::default_options`] and override the
/// fields the request needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchOptions {
    /// Expand the query via a hypothetical document before vector search.
    pub enable_hyde: bool,
    /// Run paraphrased variants and RRF-merge their results.
    pub enable_multi_query: bool,
    /// Apply the CRAG gate with bounded retry.
    pub enable_crag: bool,
    /// Rerank top candidates with a cross-encoder / late-interaction model.
    pub enable_rerank: bool,
    /// Keyword-guided sentence compression per chunk.
    pub enable_compression: bool,
    /// Include adjacent siblings of retrieved chunks.
    pub enable_chunk_expansion: bool,
    /// Attach graph paths and triples as additional evidence.
    pub enable_graph_enrich: bool,
    /// Include the graph as a third RRF source.
    pub enable_graph_retrieval: bool,
    /// Skip vector search on strong lexical citation matches.
    pub enable_lexical_first_gating: bool,
    /// Metadata-prefixed embeddings at ingest (read-only flag here).
    pub enable_contextual_embeddings: bool,
    /// Post-generation citation verification hook exposed to callers.
    pub enable_citation_grounding: bool,
    /// Raise fetch budgets for breadth-oriented queries.
    pub dense_research: bool,
    /// Include candidate-layer edges in graph traversal.
    pub include_candidate_edges: bool,
    /// Permit an empty query; retrieval runs against the graph only.
    pub graph_only: bool,
    /// Prior conversation turns, oldest first, for standalone-query rewrite.
    #[serde(default)]
    pub conversation_history: Vec<String>,
    /// Optional running summary of the conversation.
    #[serde(default)]
    pub conversation_summary: Option<String>,
    /// Accept partial results when a stage times out.
    #[serde(default = "default_accept_partial")]
    pub accept_partial: bool,
}

fn default_accept_partial() -> bool {
    true
}

impl Default for SearchOptions {
    fn default() -> Self {
        RagConfig::default().default_options()
    }
}

// ============================================================================
// Tests
// ============================================================================
