//! The retrieval pipeline orchestrator.
//!
//! One call, one complete result: `search()` sequences query rewrite,
//! adaptive gating, expansion, concurrent multi-store retrieval, RRF fusion,
//! the CRAG corrective loop, reranking, chunk expansion, compression, graph
//! enrichment, and audit assembly. Every stage is best-effort under a soft
//! deadline; the request carries a hard deadline checked between stages.
//! Stage failures degrade the pipeline as long as `min_sources_required`
//! retrievers produced results; budget exhaustion is fatal.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use once_cell::sync::{Lazy, OnceCell};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::audit::{
    BudgetMeter, CorrectiveActionRecord, PipelineTrace, QueryRewriteKind, StageEvent, TraceSink,
};
use crate::cache::TtlCache;
use crate::compress::{compress_results, ChunkExpander};
use crate::config::{RagConfig, SearchOptions};
use crate::crag::{CragConfig, CragGate, RetryParameters, RetryStrategy};
use crate::expansion::QueryExpansionService;
use crate::graphrag::enrich::GraphEnricher;
use crate::llm::{LlmProvider, LlmSession};
use crate::rerank::RerankService;
use crate::types::{
    CoreError, EvidenceLevel, GraphPath, GraphTriple, Result, RetrievalResult, RetrieverKind,
    ScopeContext, SourceType,
};

use super::fusion::{RankedList, RrfFusion};
use super::{RetrievalQuery, Retriever};

// ============================================================================
// Result Types
// ============================================================================

/// Complete output of one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineResult {
    /// Final ordered results.
    pub results: Vec<RetrievalResult>,
    /// The complete request trace.
    pub trace: PipelineTrace,
    /// Evidence classification of the final scores.
    pub evidence_level: EvidenceLevel,
    /// Compressed text bundle prepared for prompt injection.
    pub context_text: String,
    /// Addressable graph paths, when enrichment ran.
    pub graph_paths: Vec<GraphPath>,
    /// Readable graph triples, when enrichment ran.
    pub graph_triples: Vec<GraphTriple>,
}

/// Cacheable slice of a pipeline result (everything but the trace).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedPipeline {
    results: Vec<RetrievalResult>,
    evidence_level: EvidenceLevel,
    context_text: String,
    graph_paths: Vec<GraphPath>,
    graph_triples: Vec<GraphTriple>,
}

/// Parameters for one retrieval attempt (initial or corrective).
#[derive(Debug, Clone)]
struct AttemptParams {
    variants: Vec<String>,
    embed_text: Option<String>,
    datasets: Vec<SourceType>,
    fetch_k: usize,
    lexical_weight: f32,
    vector_weight: f32,
    vector_skip: bool,
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Top-level pipeline: stage sequencing, gating, budget enforcement, tracing.
pub struct RetrievalOrchestrator {
    config: Arc<RagConfig>,
    lexical: Arc<dyn Retriever>,
    vector: Option<Arc<dyn Retriever>>,
    graph: Option<Arc<dyn Retriever>>,
    enricher: Option<Arc<GraphEnricher>>,
    chunk_expander: Option<Arc<ChunkExpander>>,
    expansion: Arc<QueryExpansionService>,
    rerank: Option<Arc<RerankService>>,
    llm: Option<Arc<dyn LlmProvider>>,
    gate: CragGate,
    fusion: RrfFusion,
    trace_sink: Arc<dyn TraceSink>,
    audit_sink: Arc<dyn TraceSink>,
    result_cache: TtlCache<CachedPipeline>,
    citation_patterns: OnceCell<Vec<Regex>>,
}

impl RetrievalOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<RagConfig>,
        lexical: Arc<dyn Retriever>,
        vector: Option<Arc<dyn Retriever>>,
        graph: Option<Arc<dyn Retriever>>,
        enricher: Option<Arc<GraphEnricher>>,
        chunk_expander: Option<Arc<ChunkExpander>>,
        expansion: Arc<QueryExpansionService>,
        rerank: Option<Arc<RerankService>>,
        llm: Option<Arc<dyn LlmProvider>>,
        trace_sink: Arc<dyn TraceSink>,
        audit_sink: Arc<dyn TraceSink>,
    ) -> Self {
        let gate = CragGate::new(CragConfig::from_config(&config));
        let fusion = RrfFusion::new(config.rrf_k);
        let result_cache = TtlCache::new(
            config.result_cache_max_entries,
            Duration::from_secs(config.result_cache_ttl_seconds),
        );
        Self {
            config,
            lexical,
            vector,
            graph,
            enricher,
            chunk_expander,
            expansion,
            rerank,
            llm,
            gate,
            fusion,
            trace_sink,
            audit_sink,
            result_cache,
            citation_patterns: OnceCell::new(),
        }
    }

    fn citation_patterns(&self) -> &[Regex] {
        self.citation_patterns.get_or_init(|| {
            self.config
                .lexical_citation_patterns
                .iter()
                .filter_map(|p| Regex::new(&format!("(?i){}", p)).ok())
                .collect()
        })
    }

    fn matches_citation_pattern(&self, query: &str) -> bool {
        self.citation_patterns().iter().any(|re| re.is_match(query))
    }

    fn llm_session(&self, meter: &Arc<BudgetMeter>) -> Option<LlmSession> {
        self.llm.as_ref().map(|provider| {
            LlmSession::new(
                Arc::clone(provider),
                Arc::clone(meter),
                self.config.max_retries,
                Duration::from_secs_f64(self.config.llm_timeout_seconds),
            )
        })
    }

    /// Run the full pipeline for one query.
    ///
    /// `sources` restricts the dataset list; `None` means every dataset the
    /// scope admits (`local` only when a case id is present).
    pub async fn search(
        &self,
        query: &str,
        top_k: usize,
        sources: Option<Vec<SourceType>>,
        scope: ScopeContext,
        options: SearchOptions,
    ) -> Result<PipelineResult> {
        // ---- Validation (before any work) ----
        if !(1..=50).contains(&top_k) {
            return Err(CoreError::InvalidRequest(format!(
                "top_k must be in [1, 50], got {}",
                top_k
            )));
        }
        if query.trim().is_empty() && !options.graph_only {
            return Err(CoreError::InvalidRequest(
                "empty query requires graph-only mode".to_string(),
            ));
        }
        if scope.tenant_id.trim().is_empty() {
            return Err(CoreError::InvalidRequest("tenant_id is required".to_string()));
        }

        let explicit_sources = sources.is_some();
        let mut datasets = self.resolve_datasets(sources, &scope);
        let deadline = Instant::now() + Duration::from_secs_f64(self.config.request_deadline_seconds);
        let mut trace = PipelineTrace::new(&scope.tenant_id, query);

        // ---- Stage 2: adaptive routing ----
        // Only when the caller did not pin the dataset list: structured legal
        // references narrow retrieval to the collections that can answer them.
        if !explicit_sources {
            if let Some(routed) = self.route_datasets(query, &datasets) {
                trace.record(StageEvent::Routing {
                    datasets: routed.iter().map(|d| d.to_string()).collect(),
                    refined_query: None,
                });
                datasets = routed;
            }
        }

        // Scope filtering can empty the dataset list (e.g. local-only without
        // a case id). That is a normal empty return, not an error.
        if datasets.is_empty() {
            trace.add_warning("no admissible datasets under this scope".to_string());
            trace.finalize(EvidenceLevel::Insufficient);
            self.flush_trace(&mut trace);
            return Ok(PipelineResult {
                results: Vec::new(),
                evidence_level: EvidenceLevel::Insufficient,
                context_text: String::new(),
                graph_paths: Vec::new(),
                graph_triples: Vec::new(),
                trace,
            });
        }
        let meter = Arc::new(BudgetMeter::new(
            self.config.max_llm_calls_per_request,
            self.config.max_tokens_per_request,
            self.config.warn_at_budget_percent,
        ));
        let session = self.llm_session(&meter);

        // ---- Result cache ----
        let cache_key = self.cache_key(query, top_k, &datasets, &scope, &options);
        if self.config.enable_result_cache {
            if let Some(cached) = self.result_cache.get(&cache_key) {
                trace.record(StageEvent::CacheHit {
                    cache: "result".to_string(),
                });
                trace.attribute_results(&cached.results, cached.evidence_level);
                trace.finalize(cached.evidence_level);
                return Ok(PipelineResult {
                    results: cached.results,
                    evidence_level: cached.evidence_level,
                    context_text: cached.context_text,
                    graph_paths: cached.graph_paths,
                    graph_triples: cached.graph_triples,
                    trace,
                });
            }
        }

        let outcome = self
            .run_pipeline(
                query, top_k, datasets, &scope, &options, &mut trace, session.as_ref(), deadline,
            )
            .await;

        match outcome {
            Ok(mut result) => {
                if self.config.enable_result_cache {
                    self.result_cache.set(
                        &cache_key,
                        CachedPipeline {
                            results: result.results.clone(),
                            evidence_level: result.evidence_level,
                            context_text: result.context_text.clone(),
                            graph_paths: result.graph_paths.clone(),
                            graph_triples: result.graph_triples.clone(),
                        },
                    );
                }
                self.flush_trace(&mut result.trace);
                Ok(result)
            }
            Err(e) => {
                // The partial trace still reaches the sink on terminal errors
                trace.add_error(e.to_string());
                trace.finalize(EvidenceLevel::Insufficient);
                self.flush_trace(&mut trace);
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_pipeline(
        &self,
        query: &str,
        top_k: usize,
        mut datasets: Vec<SourceType>,
        scope: &ScopeContext,
        options: &SearchOptions,
        trace: &mut PipelineTrace,
        session: Option<&LlmSession>,
        deadline: Instant,
    ) -> Result<PipelineResult> {
        // ---- Stage 1: conversational rewrite ----
        let mut working_query = query.to_string();
        if let Some(session) = session {
            if !options.conversation_history.is_empty() {
                let started = Instant::now();
                match self
                    .expansion
                    .rewrite_query(
                        query,
                        &options.conversation_history,
                        options.conversation_summary.as_deref(),
                        session,
                    )
                    .await
                {
                    Ok(Some(rewritten)) => {
                        trace.record(StageEvent::QueryRewrite {
                            rewrite_type: QueryRewriteKind::Conversational,
                            original: query.to_string(),
                            rewritten: vec![rewritten.clone()],
                            latency_ms: started.elapsed().as_millis() as u64,
                        });
                        trace.query_rewritten = Some(rewritten.clone());
                        working_query = rewritten;
                    }
                    Ok(None) => {}
                    Err(CoreError::BudgetExceeded(reason)) => {
                        trace.record(StageEvent::BudgetSkip {
                            stage: "rewrite".to_string(),
                            reason,
                        });
                    }
                    Err(e) => {
                        trace.record(StageEvent::StageError {
                            stage: "rewrite".to_string(),
                            error: e.to_string(),
                        });
                    }
                }
            }
        }

        // ---- Stage 3: lexical-first gating ----
        // Citation match is a necessary condition; a strong lexical score on
        // a non-citation query never skips vector search.
        let mut vector_skip = false;
        let mut gating_hits: Option<Vec<crate::stores::ScoredChunk>> = None;
        if options.enable_lexical_first_gating
            && !working_query.trim().is_empty()
            && self.matches_citation_pattern(&working_query)
        {
            let trial = RetrievalQuery {
                text: working_query.clone(),
                embed_text: None,
                datasets: datasets.clone(),
                fetch_k: 6,
                scope: scope.clone(),
            };
            match self.lexical.retrieve(&trial).await {
                Ok(hits) => {
                    let top_score = hits.first().map(|h| h.score).unwrap_or(0.0);
                    vector_skip = top_score >= self.config.lexical_strong_threshold;
                    trace.record(StageEvent::LexicalGating {
                        pattern_matched: true,
                        top_score,
                        vector_skipped: vector_skip,
                    });
                    if vector_skip {
                        gating_hits = Some(hits);
                    }
                }
                Err(e) => {
                    trace.record(StageEvent::StageError {
                        stage: "lexical_gating".to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }

        // ---- Stage 4: query expansion ----
        let fetch_k = if options.dense_research {
            self.config.default_fetch_k * 2
        } else {
            self.config.default_fetch_k
        };

        let mut hypothetical: Option<String> = None;
        if options.enable_hyde && !vector_skip {
            if let Some(session) = session {
                if session.can_afford_call() {
                    match self
                        .expansion
                        .generate_hypothetical_document(&working_query, session)
                        .await
                    {
                        Ok(hyde) => {
                            trace.record(StageEvent::QueryRewrite {
                                rewrite_type: QueryRewriteKind::Hyde,
                                original: working_query.clone(),
                                rewritten: vec![hyde.chars().take(200).collect()],
                                latency_ms: 0,
                            });
                            hypothetical = Some(hyde);
                        }
                        Err(CoreError::BudgetExceeded(reason)) => {
                            trace.record(StageEvent::BudgetSkip {
                                stage: "hyde".to_string(),
                                reason,
                            });
                        }
                        Err(e) => {
                            trace.record(StageEvent::StageError {
                                stage: "hyde".to_string(),
                                error: e.to_string(),
                            });
                        }
                    }
                } else {
                    trace.record(StageEvent::BudgetSkip {
                        stage: "hyde".to_string(),
                        reason: "LLM call budget exhausted".to_string(),
                    });
                }
            }
        }

        let mut variants = vec![working_query.clone()];
        if options.enable_multi_query {
            if let Some(session) = session {
                variants = self
                    .expansion
                    .generate_query_variants(&working_query, self.config.multi_query_max, session)
                    .await;
                if variants.len() > 1 {
                    trace.record(StageEvent::QueryRewrite {
                        rewrite_type: QueryRewriteKind::MultiQuery,
                        original: working_query.clone(),
                        rewritten: variants[1..].to_vec(),
                        latency_ms: 0,
                    });
                }
            }
        }

        let embed_text = hypothetical
            .as_ref()
            .map(|h| format!("{}\n{}", working_query, h));

        // ---- Stages 5-6: retrieval + fusion (initial attempt) ----
        let mut params = AttemptParams {
            variants,
            embed_text,
            datasets: datasets.clone(),
            fetch_k,
            lexical_weight: self.config.lexical_weight,
            vector_weight: self.config.vector_weight,
            vector_skip,
        };
        let mut results = self
            .run_attempt(&params, options, scope, trace, gating_hits.take())
            .await?;

        // ---- Stage 7: CRAG gate with bounded retry ----
        let mut evaluation = self.gate.evaluate(&results);
        trace.record(StageEvent::CragGate {
            gate_passed: evaluation.gate_passed,
            evidence_level: evaluation.evidence_level,
            best_score: evaluation.best_score,
            avg_top3: evaluation.avg_top3,
            result_count: evaluation.result_count,
        });

        if options.enable_crag {
            let mut round = 0;
            let mut best_results = results.clone();
            let mut best_score = evaluation.best_score;
            let mut used: Vec<RetryStrategy> = Vec::new();

            while self.gate.should_retry(&evaluation, round) && Instant::now() < deadline {
                let Some(retry) =
                    self.gate
                        .next_strategy(&evaluation, top_k, &used, round)
                else {
                    break;
                };
                used.push(retry.strategy);

                let started = Instant::now();
                let attempt = self
                    .corrective_attempt(
                        &retry,
                        &mut params,
                        &working_query,
                        options,
                        scope,
                        trace,
                        session,
                        &mut datasets,
                    )
                    .await;

                let (attempt_results, error) = match attempt {
                    Ok(results) => (results, None),
                    Err(e @ CoreError::BudgetExceeded(_)) => return Err(e),
                    Err(e) => (Vec::new(), Some(e.to_string())),
                };

                evaluation = self.gate.evaluate(&attempt_results);
                trace.record_corrective_action(CorrectiveActionRecord {
                    strategy: retry.strategy.name().to_string(),
                    success: evaluation.gate_passed,
                    duration_ms: started.elapsed().as_millis() as u64,
                    result_count: attempt_results.len(),
                    best_score: evaluation.best_score,
                    avg_top3: evaluation.avg_top3,
                    parameters: serde_json::to_value(&retry).unwrap_or_default(),
                    error,
                });

                if evaluation.best_score > best_score && !attempt_results.is_empty() {
                    best_score = evaluation.best_score;
                    best_results = attempt_results;
                }
                round += 1;
            }

            results = best_results;
            evaluation = self.gate.evaluate(&results);
        }

        // ---- Stage 8: reranking ----
        if options.enable_rerank {
            if let Some(rerank) = &self.rerank {
                let candidate_count = results.len().min(self.config.rerank_max_candidates);
                let started = Instant::now();
                match rerank.rerank(&working_query, results.clone(), top_k).await {
                    Ok((reranked, provider)) => {
                        results = reranked;
                        trace.record(StageEvent::Rerank {
                            provider: provider.to_string(),
                            candidate_count,
                            latency_ms: started.elapsed().as_millis() as u64,
                        });
                    }
                    Err(e) => {
                        // Recoverable: keep fused order
                        trace.record(StageEvent::StageError {
                            stage: "rerank".to_string(),
                            error: e.to_string(),
                        });
                        results.truncate(top_k);
                    }
                }
            } else {
                results.truncate(top_k);
            }
        } else {
            results.truncate(top_k);
        }

        // ---- Stage 9: chunk expansion ----
        if options.enable_chunk_expansion && !self.deadline_passed(trace, "chunk_expansion", deadline) {
            if let Some(expander) = &self.chunk_expander {
                match expander.expand(&mut results, scope).await {
                    Ok(outcome) => trace.record(StageEvent::ChunkExpansion {
                        extra_chunks: outcome.extra_chunks,
                        merged: outcome.merged,
                    }),
                    Err(e) => trace.record(StageEvent::StageError {
                        stage: "chunk_expansion".to_string(),
                        error: e.to_string(),
                    }),
                }
            }
        }

        // ---- Stage 10: compression ----
        if options.enable_compression {
            let outcome = compress_results(
                &mut results,
                &working_query,
                self.config.compression_max_chars,
                self.config.compression_preserve_full_text,
            );
            trace.record(StageEvent::Compression {
                compressed_count: outcome.compressed_count,
                total_chars_saved: outcome.chars_saved,
            });
        }

        // ---- Stage 11: graph enrichment ----
        let mut graph_paths = Vec::new();
        let mut graph_triples = Vec::new();
        if options.enable_graph_enrich && !self.deadline_passed(trace, "graph_enrich", deadline) {
            if let Some(enricher) = &self.enricher {
                let started = Instant::now();
                match enricher
                    .enrich(
                        &working_query,
                        &results,
                        options.include_candidate_edges,
                        scope,
                    )
                    .await
                {
                    Ok(evidence) => {
                        trace.record(StageEvent::GraphEnrichment {
                            seed_entities: evidence.seed_count,
                            paths: evidence.paths.len(),
                            triples: evidence.triples.len(),
                            latency_ms: started.elapsed().as_millis() as u64,
                        });
                        graph_paths = evidence.paths;
                        graph_triples = evidence.triples;
                    }
                    Err(e) => trace.record(StageEvent::StageError {
                        stage: "graph_enrich".to_string(),
                        error: e.to_string(),
                    }),
                }
            }
        }

        // ---- Stage 12: audit and trace ----
        // The hard deadline returns the best partial result, unless the
        // caller refuses partials.
        if Instant::now() >= deadline && !options.accept_partial {
            return Err(CoreError::Timeout(
                "request deadline exceeded and partial results not accepted".to_string(),
            ));
        }
        let evidence_level = self.gate.evaluate(&results).evidence_level;
        trace.attribute_results(&results, evidence_level);
        trace.finalize(evidence_level);

        let context_text = assemble_context(&results, &graph_paths, &graph_triples);

        Ok(PipelineResult {
            results,
            trace: trace.clone(),
            evidence_level,
            context_text,
            graph_paths,
            graph_triples,
        })
    }

    /// Record a timeout event when the hard deadline has passed, so skipped
    /// stages are visible in the trace.
    fn deadline_passed(&self, trace: &mut PipelineTrace, stage: &str, deadline: Instant) -> bool {
        if Instant::now() < deadline {
            return false;
        }
        trace.record(StageEvent::StageTimeout {
            stage: stage.to_string(),
            deadline_ms: (self.config.request_deadline_seconds * 1000.0) as u64,
        });
        true
    }

    /// One retrieval attempt: fan out retrievers across variants, fuse.
    async fn run_attempt(
        &self,
        params: &AttemptParams,
        options: &SearchOptions,
        scope: &ScopeContext,
        trace: &mut PipelineTrace,
        reuse_lexical: Option<Vec<crate::stores::ScoredChunk>>,
    ) -> Result<Vec<RetrievalResult>> {
        let variant_count = params.variants.len().max(1);
        // Per-variant fetch budget, floor of 3
        let per_variant = (params.fetch_k.div_ceil(variant_count)).max(3);

        let mut searches = Vec::new();
        for (variant_index, variant) in params.variants.iter().enumerate() {
            let base_query = RetrievalQuery {
                text: variant.clone(),
                embed_text: if variant_index == 0 {
                    params.embed_text.clone()
                } else {
                    None
                },
                datasets: params.datasets.clone(),
                fetch_k: per_variant,
                scope: scope.clone(),
            };

            if reuse_lexical.is_none() || variant_index > 0 {
                searches.push((
                    RetrieverKind::Lexical,
                    params.lexical_weight,
                    Arc::clone(&self.lexical),
                    base_query.clone(),
                ));
            }
            if !params.vector_skip {
                if let Some(vector) = &self.vector {
                    searches.push((
                        RetrieverKind::Vector,
                        params.vector_weight,
                        Arc::clone(vector),
                        base_query.clone(),
                    ));
                }
            }
            // Graph retrieval runs once, on the primary variant
            if variant_index == 0 && options.enable_graph_retrieval {
                if let Some(graph) = &self.graph {
                    searches.push((
                        RetrieverKind::Graph,
                        self.config.graph_weight,
                        Arc::clone(graph),
                        base_query,
                    ));
                }
            }
        }

        let futures = searches.into_iter().map(|(kind, weight, retriever, query)| {
            async move {
                let started = Instant::now();
                let outcome = retriever.retrieve(&query).await;
                (kind, weight, outcome, started.elapsed())
            }
        });

        let mut lists: Vec<RankedList> = Vec::new();
        if let Some(hits) = reuse_lexical {
            lists.push(RankedList {
                retriever: RetrieverKind::Lexical,
                weight: params.lexical_weight,
                hits,
            });
        }

        let mut succeeded: std::collections::HashSet<RetrieverKind> = lists
            .iter()
            .map(|l| l.retriever)
            .collect();
        let mut attempted: std::collections::HashSet<RetrieverKind> = succeeded.clone();

        for (kind, weight, outcome, elapsed) in join_all(futures).await {
            attempted.insert(kind);
            match outcome {
                Ok(hits) => {
                    trace.record(StageEvent::Retrieval {
                        retriever: kind.to_string(),
                        datasets: params.datasets.iter().map(|d| d.to_string()).collect(),
                        result_count: hits.len(),
                        latency_ms: elapsed.as_millis() as u64,
                    });
                    succeeded.insert(kind);
                    lists.push(RankedList {
                        retriever: kind,
                        weight,
                        hits,
                    });
                }
                Err(e) => {
                    trace.record(StageEvent::StageError {
                        stage: format!("retrieval_{}", kind),
                        error: e.to_string(),
                    });
                }
            }
        }

        if succeeded.len() < self.config.min_sources_required {
            if attempted.is_empty() {
                return Err(CoreError::NoSources(
                    "no retrievers configured for this request".to_string(),
                ));
            }
            return Err(CoreError::NoSources(format!(
                "{} of {} retrievers succeeded, {} required",
                succeeded.len(),
                attempted.len(),
                self.config.min_sources_required
            )));
        }

        let fused = self.fusion.fuse(&lists);
        trace.record(StageEvent::Fusion {
            input_lists: lists.len(),
            merged_count: fused.len(),
        });
        Ok(fused)
    }

    /// Apply one corrective strategy and rerun retrieval.
    #[allow(clippy::too_many_arguments)]
    async fn corrective_attempt(
        &self,
        retry: &RetryParameters,
        params: &mut AttemptParams,
        working_query: &str,
        options: &SearchOptions,
        scope: &ScopeContext,
        trace: &mut PipelineTrace,
        session: Option<&LlmSession>,
        datasets: &mut Vec<SourceType>,
    ) -> Result<Vec<RetrievalResult>> {
        params.lexical_weight = retry.lexical_weight;
        params.vector_weight = retry.vector_weight;
        // Wider strategies raise the fetch budget proportionally to their top_k
        params.fetch_k = params.fetch_k.max(retry.top_k * 3);
        // Corrective attempts never reuse the vector-skip shortcut
        params.vector_skip = false;

        if retry.expand_datasets {
            *datasets = self.resolve_datasets(None, scope);
            params.datasets = datasets.clone();
        }

        if retry.use_multi_query {
            if let Some(session) = session {
                params.variants = self
                    .expansion
                    .generate_query_variants(working_query, retry.multi_query_count, session)
                    .await;
            }
        } else if retry.use_hyde {
            if let Some(session) = session {
                match self
                    .expansion
                    .generate_hypothetical_document(working_query, session)
                    .await
                {
                    Ok(hyde) => {
                        params.embed_text = Some(format!("{}\n{}", working_query, hyde));
                    }
                    Err(e @ CoreError::BudgetExceeded(_)) => return Err(e),
                    Err(e) => {
                        tracing::warn!(error = %e, "corrective HyDE generation failed");
                    }
                }
            }
        } else {
            params.variants = vec![working_query.to_string()];
        }

        self.run_attempt(params, options, scope, trace, None).await
    }

    /// Deterministic dataset routing from structured references in the query.
    ///
    /// Returns `None` when the query carries no routing signal.
    fn route_datasets(&self, query: &str, datasets: &[SourceType]) -> Option<Vec<SourceType>> {
        static SUMULA_OR_COURT: Lazy<Regex> = Lazy::new(|| {
            Regex::new(r"(?i)s[úu]mula|stf|stj|tst|trf|tjsp").expect("static pattern")
        });
        static STATUTE_REF: Lazy<Regex> = Lazy::new(|| {
            Regex::new(r"(?i)\bart(?:igo)?\.?\s*\d+|\blei\s+n?\.?\s*\d+|§\s*\d+")
                .expect("static pattern")
        });

        let preferred: &[SourceType] = if SUMULA_OR_COURT.is_match(query) {
            &[SourceType::CaseLaw, SourceType::Statute, SourceType::Doctrine]
        } else if STATUTE_REF.is_match(query) {
            &[SourceType::Statute, SourceType::CaseLaw, SourceType::Doctrine]
        } else {
            return None;
        };

        // Keep only what the current list (and therefore the scope) admits;
        // local documents always stay reachable when present.
        let mut routed: Vec<SourceType> = preferred
            .iter()
            .copied()
            .filter(|d| datasets.contains(d))
            .collect();
        if datasets.contains(&SourceType::Local) {
            routed.push(SourceType::Local);
        }
        if routed.is_empty() || routed.len() == datasets.len() {
            None
        } else {
            Some(routed)
        }
    }

    fn resolve_datasets(
        &self,
        sources: Option<Vec<SourceType>>,
        scope: &ScopeContext,
    ) -> Vec<SourceType> {
        let mut datasets = match sources {
            Some(sources) if !sources.is_empty() => sources,
            _ => SourceType::all().to_vec(),
        };
        // Local retrieval is meaningless without a case id; the scope filter
        // would reject every hit anyway
        if scope.case_id.is_none() {
            datasets.retain(|d| *d != SourceType::Local);
        }
        datasets.sort_by_key(|d| d.to_string());
        datasets.dedup();
        datasets
    }

    fn cache_key(
        &self,
        query: &str,
        top_k: usize,
        datasets: &[SourceType],
        scope: &ScopeContext,
        options: &SearchOptions,
    ) -> String {
        use sha2::{Digest, Sha256};

        // Hashed without normalization: the scope context (tenant, case,
        // groups) must never case-fold into another tenant's entry.
        let scope_json = serde_json::to_string(scope).unwrap_or_default();
        let options_json = serde_json::to_string(options).unwrap_or_default();
        let datasets_json = datasets
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let mut hasher = Sha256::new();
        hasher.update(b"pipeline|");
        hasher.update(query.trim().as_bytes());
        hasher.update(format!("|{top_k}|{datasets_json}|{scope_json}|{options_json}").as_bytes());
        hex::encode(hasher.finalize())
    }

    fn flush_trace(&self, trace: &mut PipelineTrace) {
        if !self.config.enable_tracing {
            return;
        }
        if let Ok(record) = serde_json::to_value(&*trace) {
            if let Err(e) = self.trace_sink.append(&record) {
                tracing::warn!(error = %e, "failed to write pipeline trace");
            }
        }
        // Audit record: the attribution slice plus gate outcomes
        let audit = serde_json::json!({
            "request_id": trace.request_id,
            "tenant_id": trace.tenant_id,
            "query_original": trace.query_original,
            "query_rewritten": trace.query_rewritten,
            "evidence_level": trace.evidence_level,
            "source_attributions": trace.attributions,
            "corrective_actions": trace.corrective_actions,
            "total_latency_ms": trace.total_latency_ms,
            "warnings": trace.warnings,
            "errors": trace.errors,
        });
        if let Err(e) = self.audit_sink.append(&audit) {
            tracing::warn!(error = %e, "failed to write audit record");
        }
    }
}

/// Assemble the prompt-ready context bundle: ranked chunks, then graph
/// evidence blocks.
fn assemble_context(
    results: &[RetrievalResult],
    paths: &[GraphPath],
    triples: &[GraphTriple],
) -> String {
    let mut blocks: Vec<String> = Vec::new();
    for (i, result) in results.iter().enumerate() {
        let title = if result.chunk.metadata.title.is_empty() {
            result.chunk.doc_id.clone()
        } else {
            result.chunk.metadata.title.clone()
        };
        blocks.push(format!(
            "[{}] ({}) {}\n{}",
            i + 1,
            result.chunk.dataset,
            title,
            result.working_text()
        ));
    }
    if !paths.is_empty() {
        let lines: Vec<String> = paths
            .iter()
            .map(|p| format!("[path:{}] {}", p.path_uid, p.text))
            .collect();
        blocks.push(format!("<KG_PATHS>\n{}\n</KG_PATHS>", lines.join("\n")));
    }
    if !triples.is_empty() {
        let lines: Vec<String> = triples.iter().map(|t| t.text.clone()).collect();
        blocks.push(format!("<KG_TRIPLES>\n{}\n</KG_TRIPLES>", lines.join("\n")));
    }
    blocks.join("\n\n")
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Chunk, ChunkMetadata};

    fn result(uid: &str, score: f32) -> RetrievalResult {
        let chunk = Chunk {
            chunk_uid: uid.to_string(),
            source_type: SourceType::Statute,
            dataset: "statute".to_string(),
            text: format!("conteudo {}", uid),
            position: 0,
            doc_id: "doc-1".to_string(),
            metadata: ChunkMetadata::default(),
        };
        let mut r = RetrievalResult::from_hit(chunk, score, RetrieverKind::Lexical);
        r.fused_score = score;
        r
    }

    #[test]
    fn test_assemble_context_orders_blocks() {
        let results = vec![result("a", 0.9), result("b", 0.8)];
        let paths = vec![GraphPath {
            path_uid: "p1".to_string(),
            entities: vec![],
            edges: vec![],
            text: "A -[CITES]-> B".to_string(),
        }];
        let triples = vec![GraphTriple {
            subject: "A".to_string(),
            predicate: "CITES".to_string(),
            object: "B".to_string(),
            text: "A CITES B".to_string(),
        }];

        let context = assemble_context(&results, &paths, &triples);
        let idx_first = context.find("[1] (statute)").unwrap();
        let idx_paths = context.find("<KG_PATHS>").unwrap();
        let idx_triples = context.find("<KG_TRIPLES>").unwrap();
        assert!(idx_first < idx_paths && idx_paths < idx_triples);
        assert!(context.contains("[path:p1]"));
    }

    #[test]
    fn test_assemble_context_without_graph_blocks() {
        let context = assemble_context(&[result("a", 0.9)], &[], &[]);
        assert!(!context.contains("KG_PATHS"));
        assert!(!context.contains("KG_TRIPLES"));
    }
}
