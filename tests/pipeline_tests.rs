//! End-to-end pipeline scenarios over mock stores.
//!
//! The mocks enforce visibility inside the store query, so these tests
//! exercise the same contract the production clients implement: citation-
//! first gating, the corrective loop, tenant isolation, local-case scoping,
//! budget safety, and attribution cardinality.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::mocks::*;
use rstest::rstest;

use lexrag::audit::{NoopTraceSink, StageEvent};
use lexrag::compress::ChunkExpander;
use lexrag::config::RagConfig;
use lexrag::expansion::{ExpansionConfig, QueryExpansionService};
use lexrag::llm::LlmProvider;
use lexrag::retrieval::lexical::LexicalRetriever;
use lexrag::retrieval::pipeline::RetrievalOrchestrator;
use lexrag::retrieval::vector::VectorRetriever;
use lexrag::retrieval::Retriever;
use lexrag::types::{EvidenceLevel, ScopeContext, SourceType};

fn expansion_service(config: &RagConfig) -> Arc<QueryExpansionService> {
    Arc::new(QueryExpansionService::new(
        ExpansionConfig {
            hyde_model: config.hyde_model.clone(),
            hyde_max_tokens: config.hyde_max_tokens,
            multi_query_max: config.multi_query_max,
            multi_query_model: config.multi_query_model.clone(),
            rewrite_model: config.rewrite_model.clone(),
        },
        config.expansion_cache_max_entries,
        Duration::from_secs(config.expansion_cache_ttl_seconds),
    ))
}

/// Wire an orchestrator over mock stores. Returns the vector store handle so
/// tests can observe whether vector search ran.
fn orchestrator(
    config: RagConfig,
    corpus: Vec<MockDoc>,
    with_vector: bool,
    llm: Option<Arc<dyn LlmProvider>>,
) -> (Arc<RetrievalOrchestrator>, Arc<MockVectorStore>) {
    let config = Arc::new(config);
    let lexical_index = Arc::new(MockLexicalIndex::new(corpus.clone()));
    let vector_store = Arc::new(MockVectorStore::new(corpus));

    let lexical: Arc<dyn Retriever> = Arc::new(LexicalRetriever::new(
        lexical_index.clone(),
        Duration::from_secs(1),
    ));
    let vector: Option<Arc<dyn Retriever>> = if with_vector {
        Some(Arc::new(VectorRetriever::new(
            vector_store.clone(),
            Arc::new(HashEmbedder),
            config.vector_query_max_concurrency,
            Duration::from_secs(1),
        )))
    } else {
        None
    };
    let chunk_expander = Arc::new(ChunkExpander::new(
        lexical_index,
        config.chunk_expansion_window,
        config.chunk_expansion_max_extra,
        config.chunk_expansion_merge_adjacent,
    ));

    let pipeline = Arc::new(RetrievalOrchestrator::new(
        Arc::clone(&config),
        lexical,
        vector,
        None,
        None,
        Some(chunk_expander),
        expansion_service(&config),
        None,
        llm,
        Arc::new(NoopTraceSink),
        Arc::new(NoopTraceSink),
    ));
    (pipeline, vector_store)
}

fn statute_corpus() -> Vec<MockDoc> {
    vec![
        MockDoc {
            chunk: chunk(
                "cpc-319",
                0,
                SourceType::Statute,
                "Art. 319. A petição inicial indicará os requisitos essenciais.",
            ),
            visibility: global_visibility(),
            match_term: "art. 319".to_string(),
            score: 1.0,
        },
        MockDoc {
            chunk: chunk(
                "cpc-319",
                1,
                SourceType::Statute,
                "Art. 319, §1º. Complementos sobre a petição inicial.",
            ),
            visibility: global_visibility(),
            match_term: "art. 319".to_string(),
            score: 0.85,
        },
        MockDoc {
            chunk: chunk(
                "cpc-320",
                0,
                SourceType::Statute,
                "Art. 320. A petição inicial será instruída com documentos.",
            ),
            visibility: global_visibility(),
            match_term: "art. 319".to_string(),
            score: 0.8,
        },
    ]
}

// ============================================================================
// S1: citation-first gating
// ============================================================================

#[tokio::test]
async fn citation_query_skips_vector_search_and_classifies_strong() {
    let config = RagConfig::default();
    let options = config.default_options();
    let (pipeline, vector_store) = orchestrator(config, statute_corpus(), true, None);

    let result = pipeline
        .search(
            "Art. 319 CPC petição inicial requisitos",
            10,
            None,
            ScopeContext::global("t1"),
            options,
        )
        .await
        .unwrap();

    // Gating fired and vector search never ran
    assert_eq!(vector_store.call_count(), 0);
    let gated = result.trace.events.iter().any(|e| {
        matches!(
            e.event,
            StageEvent::LexicalGating {
                pattern_matched: true,
                vector_skipped: true,
                ..
            }
        )
    });
    assert!(gated, "expected a lexical gating event with vector skip");

    assert_eq!(result.evidence_level, EvidenceLevel::Strong);
    assert!(result
        .results
        .iter()
        .any(|r| r.chunk.dataset == "statute" && r.chunk.text.contains("Art. 319")));
}

#[tokio::test]
async fn non_citation_query_still_runs_vector_search() {
    let corpus = vec![MockDoc {
        chunk: chunk("doc-1", 0, SourceType::CaseLaw, "responsabilidade civil"),
        visibility: global_visibility(),
        match_term: "responsabilidade".to_string(),
        score: 0.9,
    }];
    let config = RagConfig::default();
    let options = config.default_options();
    let (pipeline, vector_store) = orchestrator(config, corpus, true, None);

    pipeline
        .search(
            "responsabilidade civil contratual",
            10,
            None,
            ScopeContext::global("t1"),
            options,
        )
        .await
        .unwrap();

    // A strong lexical score without a citation match never skips vector
    assert!(vector_store.call_count() > 0);
}

// ============================================================================
// S2: corrective loop success
// ============================================================================

#[tokio::test]
async fn crag_loop_recovers_low_evidence_with_distinct_strategies() {
    let mut corpus: Vec<MockDoc> = (0..3)
        .map(|i| MockDoc {
            chunk: chunk(
                &format!("weak-{i}"),
                0,
                SourceType::CaseLaw,
                "julgado tangencial sobre responsabilidade",
            ),
            visibility: global_visibility(),
            match_term: "responsabilidade civil".to_string(),
            score: 0.2,
        })
        .collect();
    corpus.push(MockDoc {
        chunk: chunk(
            "strong-1",
            0,
            SourceType::CaseLaw,
            "responsabilidade objetiva do empregador por ato de preposto",
        ),
        visibility: global_visibility(),
        match_term: "responsabilidade objetiva".to_string(),
        score: 0.8,
    });

    let llm = Arc::new(ScriptedLlm::new(vec![(
        "Reformulacoes",
        "responsabilidade objetiva por ato de terceiro",
    )]));

    let config = RagConfig::default();
    let mut options = config.default_options();
    options.enable_hyde = false;
    options.enable_multi_query = false;
    options.enable_lexical_first_gating = false;
    options.enable_rerank = false;
    let (pipeline, _) = orchestrator(config, corpus, false, Some(llm));

    let result = pipeline
        .search(
            "responsabilidade civil por ato de terceiro",
            10,
            None,
            ScopeContext::global("t1"),
            options,
        )
        .await
        .unwrap();

    let actions = &result.trace.corrective_actions;
    assert_eq!(actions.len(), 2, "two corrective rounds expected");
    assert_ne!(actions[0].strategy, actions[1].strategy);
    assert!(actions[1].success, "second strategy should pass the gate");
    assert!(
        matches!(
            result.evidence_level,
            EvidenceLevel::Strong | EvidenceLevel::Moderate
        ),
        "final evidence must be at least moderate, got {}",
        result.evidence_level
    );
    assert!(result
        .results
        .iter()
        .any(|r| r.chunk.doc_id == "strong-1"));
}

#[tokio::test]
async fn crag_never_exceeds_retry_budget() {
    // Nothing ever matches: every strategy fails, bounded by crag_max_retries
    let config = RagConfig::default();
    let max_retries = config.crag_max_retries;
    let mut options = config.default_options();
    options.enable_lexical_first_gating = false;
    let (pipeline, _) = orchestrator(config, vec![], false, None);

    let result = pipeline
        .search(
            "consulta sem qualquer resultado",
            10,
            None,
            ScopeContext::global("t1"),
            options,
        )
        .await
        .unwrap();

    assert!(result.results.is_empty());
    assert_eq!(result.evidence_level, EvidenceLevel::Insufficient);
    assert!(result.trace.corrective_actions.len() <= max_retries);

    let mut names: Vec<&str> = result
        .trace
        .corrective_actions
        .iter()
        .map(|a| a.strategy.as_str())
        .collect();
    let before = names.len();
    names.dedup();
    assert_eq!(before, names.len(), "no strategy may repeat");
}

// ============================================================================
// S3: tenant isolation
// ============================================================================

#[rstest]
#[case("t1", "t1-doc")]
#[case("t2", "t2-doc")]
#[tokio::test]
async fn tenants_only_see_their_own_private_chunks(
    #[case] tenant: &str,
    #[case] expected_doc: &str,
) {
    let corpus = vec![
        MockDoc {
            chunk: chunk("t1-doc", 0, SourceType::InternalFiling, "cláusula α do contrato"),
            visibility: private_visibility("t1"),
            match_term: "cláusula α".to_string(),
            score: 0.9,
        },
        MockDoc {
            chunk: chunk("t2-doc", 0, SourceType::InternalFiling, "cláusula α do contrato"),
            visibility: private_visibility("t2"),
            match_term: "cláusula α".to_string(),
            score: 0.9,
        },
    ];
    let config = RagConfig::default();
    let mut options = config.default_options();
    options.enable_lexical_first_gating = false;
    options.enable_chunk_expansion = false;
    let (pipeline, _) = orchestrator(config, corpus, false, None);

    let mut scope = ScopeContext::global(tenant);
    scope.allow_global = false;
    let result = pipeline
        .search("cláusula α", 10, None, scope, options)
        .await
        .unwrap();

    assert_eq!(result.results.len(), 1, "tenant {} leak", tenant);
    assert_eq!(result.results[0].chunk.doc_id, expected_doc);
}

// ============================================================================
// S4: local-case scope
// ============================================================================

#[tokio::test]
async fn local_scope_requires_matching_case_id() {
    let corpus = vec![
        MockDoc {
            chunk: chunk("local-1", 0, SourceType::Local, "contrato de prestação de serviços"),
            visibility: local_visibility("t1", "case-9"),
            match_term: "contrato de prestação".to_string(),
            score: 0.9,
        },
        MockDoc {
            chunk: chunk("local-1", 1, SourceType::Local, "cláusulas do contrato de prestação"),
            visibility: local_visibility("t1", "case-9"),
            match_term: "contrato de prestação".to_string(),
            score: 0.8,
        },
    ];
    let config = RagConfig::default();
    let mut options = config.default_options();
    options.enable_lexical_first_gating = false;
    options.enable_chunk_expansion = false;
    options.enable_crag = false;
    let (pipeline, _) = orchestrator(config, corpus, false, None);

    // Without a case id the scope filter rejects every local doc
    let mut scope = ScopeContext::global("t1");
    scope.allow_global = false;
    let result = pipeline
        .search(
            "contrato de prestação de serviços",
            10,
            Some(vec![SourceType::Local]),
            scope.clone(),
            options.clone(),
        )
        .await
        .unwrap();
    assert!(result.results.is_empty());
    assert_eq!(result.evidence_level, EvidenceLevel::Insufficient);

    // With the matching case id, exactly the case's chunks come back
    scope.case_id = Some("case-9".to_string());
    let result = pipeline
        .search(
            "contrato de prestação de serviços",
            10,
            Some(vec![SourceType::Local]),
            scope,
            options,
        )
        .await
        .unwrap();
    assert_eq!(result.results.len(), 2);
    assert!(result.results.iter().all(|r| r.chunk.doc_id == "local-1"));
}

// ============================================================================
// Budget safety
// ============================================================================

#[tokio::test]
async fn llm_calls_stay_within_budget_and_expansion_degrades() {
    let llm = Arc::new(ScriptedLlm::new(vec![
        ("paragrafo tecnico-juridico", "documento hipotetico gerado"),
        ("Reformulacoes", "variante um\nvariante dois"),
    ]));
    let llm_handle = Arc::clone(&llm);

    let config = RagConfig {
        max_llm_calls_per_request: 1,
        ..Default::default()
    };
    let mut options = config.default_options();
    options.enable_lexical_first_gating = false;
    options.enable_crag = false;
    let (pipeline, _) = orchestrator(config, statute_corpus(), false, Some(llm));

    let result = pipeline
        .search(
            "petição inicial requisitos art. 319",
            10,
            None,
            ScopeContext::global("t1"),
            options,
        )
        .await
        .unwrap();

    // HyDE consumed the single budgeted call; multi-query fell back to
    // heuristics without another LLM call, and the request still succeeded
    assert_eq!(llm_handle.call_count(), 1);
    assert!(!result.results.is_empty());
}

// ============================================================================
// Attribution round-trip
// ============================================================================

#[tokio::test]
async fn every_result_has_exactly_one_attribution() {
    let config = RagConfig::default();
    let options = config.default_options();
    let (pipeline, _) = orchestrator(config, statute_corpus(), false, None);

    let result = pipeline
        .search(
            "Art. 319 CPC requisitos",
            10,
            None,
            ScopeContext::global("t1"),
            options,
        )
        .await
        .unwrap();

    assert!(!result.results.is_empty());
    assert_eq!(result.trace.attributions.len(), result.results.len());
    for (rank, (attribution, retrieved)) in result
        .trace
        .attributions
        .iter()
        .zip(&result.results)
        .enumerate()
    {
        assert_eq!(attribution.chunk_uid, retrieved.chunk.chunk_uid);
        assert_eq!(attribution.rank, rank + 1);
    }
}

// ============================================================================
// Degradation & validation
// ============================================================================

#[tokio::test]
async fn all_sources_failing_is_no_sources_error() {
    let config = Arc::new(RagConfig::default());
    let lexical: Arc<dyn Retriever> = Arc::new(LexicalRetriever::new(
        Arc::new(FailingLexicalIndex),
        Duration::from_secs(1),
    ));
    let pipeline = RetrievalOrchestrator::new(
        Arc::clone(&config),
        lexical,
        None,
        None,
        None,
        None,
        expansion_service(&config),
        None,
        None,
        Arc::new(NoopTraceSink),
        Arc::new(NoopTraceSink),
    );

    let mut options = config.default_options();
    options.enable_lexical_first_gating = false;
    options.enable_crag = false;
    let result = pipeline
        .search("qualquer consulta", 10, None, ScopeContext::global("t1"), options)
        .await;
    assert!(matches!(result, Err(lexrag::CoreError::NoSources(_))));
}

#[tokio::test]
async fn invalid_requests_fail_before_any_work() {
    let config = RagConfig::default();
    let options = config.default_options();
    let (pipeline, _) = orchestrator(config, vec![], false, None);

    // top_k out of range
    let err = pipeline
        .search("q", 0, None, ScopeContext::global("t1"), options.clone())
        .await;
    assert!(matches!(err, Err(lexrag::CoreError::InvalidRequest(_))));

    let err = pipeline
        .search("q", 51, None, ScopeContext::global("t1"), options.clone())
        .await;
    assert!(matches!(err, Err(lexrag::CoreError::InvalidRequest(_))));

    // empty query without graph-only mode
    let err = pipeline
        .search("   ", 10, None, ScopeContext::global("t1"), options)
        .await;
    assert!(matches!(err, Err(lexrag::CoreError::InvalidRequest(_))));
}

#[tokio::test]
async fn compression_preserves_original_text() {
    let long_text = format!(
        "Art. 319. {} A petição inicial indicará os requisitos. {}",
        "Texto introdutório extenso sobre o tema. ".repeat(30),
        "Considerações finais igualmente extensas. ".repeat(30)
    );
    let corpus = vec![MockDoc {
        chunk: chunk("cpc-long", 0, SourceType::Statute, &long_text),
        visibility: global_visibility(),
        match_term: "petição inicial".to_string(),
        score: 0.9,
    }];
    let config = RagConfig::default();
    let max_chars = config.compression_max_chars;
    let mut options = config.default_options();
    options.enable_lexical_first_gating = false;
    options.enable_chunk_expansion = false;
    let (pipeline, _) = orchestrator(config, corpus, false, None);

    let result = pipeline
        .search(
            "petição inicial requisitos",
            10,
            None,
            ScopeContext::global("t1"),
            options,
        )
        .await
        .unwrap();

    let compressed = &result.results[0];
    let side = compressed.compressed_text.as_ref().expect("compressed");
    assert!(side.len() <= max_chars);
    // Original recoverable
    assert_eq!(compressed.chunk.text, long_text);
    assert!(compressed.working_text().len() <= max_chars);
}

#[tokio::test]
async fn result_cache_serves_repeat_queries() {
    let config = RagConfig::default();
    let options = config.default_options();
    let (pipeline, _) = orchestrator(config, statute_corpus(), false, None);
    let scope = ScopeContext::global("t1");

    let first = pipeline
        .search("Art. 319 CPC", 10, None, scope.clone(), options.clone())
        .await
        .unwrap();
    let second = pipeline
        .search("Art. 319 CPC", 10, None, scope, options)
        .await
        .unwrap();

    assert_eq!(
        first.results.len(),
        second.results.len(),
        "cached result must match"
    );
    let cache_hit = second
        .trace
        .events
        .iter()
        .any(|e| matches!(e.event, StageEvent::CacheHit { .. }));
    assert!(cache_hit, "second call should be served from the result cache");
}
