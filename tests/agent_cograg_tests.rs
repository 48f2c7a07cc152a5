//! Scenarios for the CogGRAG reasoner and the agentic orchestrator.

mod common;

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;

use common::mocks::*;
use lexrag::agent::{AgentEvent, AgentOrchestrator, AgentRequest};
use lexrag::audit::NoopTraceSink;
use lexrag::cograg::{CogGragReasoner, VerificationStatus};
use lexrag::config::RagConfig;
use lexrag::expansion::{ExpansionConfig, QueryExpansionService};
use lexrag::llm::LlmProvider;
use lexrag::research::ResearchRegistry;
use lexrag::retrieval::lexical::LexicalRetriever;
use lexrag::retrieval::pipeline::RetrievalOrchestrator;
use lexrag::retrieval::Retriever;
use lexrag::types::ScopeContext;

fn pipeline_over(
    config: &Arc<RagConfig>,
    corpus: Vec<MockDoc>,
    llm: Option<Arc<dyn LlmProvider>>,
) -> Arc<RetrievalOrchestrator> {
    let lexical: Arc<dyn Retriever> = Arc::new(LexicalRetriever::new(
        Arc::new(MockLexicalIndex::new(corpus)),
        Duration::from_secs(1),
    ));
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
    Arc::new(RetrievalOrchestrator::new(
        Arc::clone(config),
        lexical,
        None,
        None,
        None,
        None,
        expansion,
        None,
        llm,
        Arc::new(NoopTraceSink),
        Arc::new(NoopTraceSink),
    ))
}

// ============================================================================
// S5: CogGRAG abstains over sparse evidence
// ============================================================================

#[tokio::test]
async fn cograg_abstains_when_confidence_is_low() {
    // Empty corpus: every leaf gathers nothing and the answers come back
    // empty, so no confident final answer may be produced
    let llm = Arc::new(ScriptedLlm::new(vec![(
        "Decomponha",
        "qual o prazo aplicavel neste procedimento especifico?\n\
         quais os requisitos legais exigidos pela norma?",
    )]));

    let config = Arc::new(RagConfig::default());
    let pipeline = pipeline_over(&config, vec![], Some(llm.clone()));
    let reasoner = CogGragReasoner::new(Arc::clone(&config), pipeline, llm, None);

    let question = "quais os requisitos da peticao inicial, os vicios que geram indeferimento \
                    e as hipoteses de emenda, bem como os prazos aplicaveis e ou consequencias \
                    do descumprimento em cada caso?";
    let result = reasoner
        .reason(
            question,
            ScopeContext::global("t1"),
            config.default_options(),
        )
        .await
        .unwrap();

    assert_eq!(result.verification_status, VerificationStatus::Abstain);
    assert!(!result.issues.is_empty(), "abstain must list issues");
    assert!(result.answer.is_empty(), "no confident answer on abstain");
    assert!(result.llm_calls <= config.max_llm_calls_per_request);
}

#[tokio::test]
async fn cograg_mind_map_covers_decomposed_children() {
    let llm = Arc::new(ScriptedLlm::new(vec![
        (
            "Decomponha",
            "qual o conceito juridico aplicavel ao caso?\nqual o prazo processual previsto?",
        ),
        (
            "Responda",
            "Conforme a evidencia, aplica-se a regra geral do procedimento comum, \
             observados os requisitos formais e os prazos legais estabelecidos para a hipotese.",
        ),
        ("Sintetize", "FINAL sintetizado com base nas respostas parciais das sub-perguntas."),
    ]));

    let corpus = vec![MockDoc {
        chunk: chunk(
            "doc-a",
            0,
            lexrag::types::SourceType::Doctrine,
            "a regra geral do procedimento comum exige requisitos formais",
        ),
        visibility: global_visibility(),
        match_term: "juridico".to_string(),
        score: 0.7,
    }];

    let config = Arc::new(RagConfig {
        cograg_abstain_mode: false,
        max_llm_calls_per_request: 8,
        ..Default::default()
    });
    let pipeline = pipeline_over(&config, corpus, Some(llm.clone()));
    let reasoner = CogGragReasoner::new(Arc::clone(&config), pipeline, llm, None);

    let question = "qual o conceito juridico aplicavel, qual o prazo processual e quais os \
                    requisitos formais exigidos, bem como as consequencias praticas e ou \
                    excecoes relevantes em cada hipotese concreta?";
    let result = reasoner
        .reason(
            question,
            ScopeContext::global("t1"),
            config.default_options(),
        )
        .await
        .unwrap();

    assert_eq!(result.mind_map.children.len(), 2);
    assert_eq!(result.sub_answers.len(), 2);
    assert!(!result.answer.is_empty());
}

// ============================================================================
// S6: agent tool discipline
// ============================================================================

#[tokio::test]
async fn agent_never_invokes_providers_outside_the_enabled_list() {
    let (p1, p1_calls) = CountingResearchProvider::new("p1");
    let (p2, p2_calls) = CountingResearchProvider::new("p2");
    let (p3, p3_calls) = CountingResearchProvider::new("p3");
    let mut research = ResearchRegistry::new();
    research.register(Arc::new(p1));
    research.register(Arc::new(p2));
    research.register(Arc::new(p3));

    // Rule order matters: later-iteration needles first, so the growing
    // prompt resolves to the most recent step
    let planner = Arc::new(ScriptedLlm::new(vec![
        ("sintese de p1", "FINAL: resposta final consolidada"),
        (
            "Tool desconhecida",
            "{\"tool\": \"search_p1\", \"input\": {\"query\": \"dano moral\"}}",
        ),
        (
            "(nenhum)",
            "{\"tool\": \"search_p3\", \"input\": {\"query\": \"dano moral\"}}",
        ),
    ]));

    let config = Arc::new(RagConfig::default());
    let pipeline = pipeline_over(&config, vec![], None);
    let agent = Arc::new(AgentOrchestrator::new(
        Arc::clone(&config),
        planner,
        Arc::new(research),
        pipeline,
    ));

    let request = AgentRequest {
        query: "responsabilidade por dano moral".to_string(),
        enabled_providers: vec!["p1".to_string(), "p2".to_string()],
        scope: ScopeContext::global("t1"),
        options: config.default_options(),
    };

    let events: Vec<AgentEvent> = agent.stream(request).collect().await;

    // The filtered-out provider was proposed but never executed
    assert_eq!(p3_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    assert_eq!(p1_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(p2_calls.load(std::sync::atomic::Ordering::SeqCst), 0);

    let rejected = events.iter().any(|e| {
        matches!(e, AgentEvent::AgentToolResult { tool, summary }
            if tool == "search_p3" && summary.contains("Tool desconhecida"))
    });
    assert!(rejected, "disabled provider must be rejected, not executed");

    let study_done = events
        .iter()
        .any(|e| matches!(e, AgentEvent::StudyDone { text } if text.contains("resposta final")));
    assert!(study_done);

    let merge_done = events
        .iter()
        .any(|e| matches!(e, AgentEvent::MergeDone { source_count } if *source_count == 1));
    assert!(merge_done, "one deduped source from p1 expected");
}

#[tokio::test]
async fn agent_emits_iterations_and_source_events() {
    let (p1, _) = CountingResearchProvider::new("p1");
    let mut research = ResearchRegistry::new();
    research.register(Arc::new(p1));

    let planner = Arc::new(ScriptedLlm::new(vec![
        ("sintese de p1", "FINAL: concluido"),
        (
            "(nenhum)",
            "{\"tool\": \"search_p1\", \"input\": {\"query\": \"tema\"}}",
        ),
    ]));

    let config = Arc::new(RagConfig::default());
    let pipeline = pipeline_over(&config, vec![], None);
    let agent = Arc::new(AgentOrchestrator::new(
        Arc::clone(&config),
        planner,
        Arc::new(research),
        pipeline,
    ));

    let events: Vec<AgentEvent> = agent
        .stream(AgentRequest {
            query: "tema de estudo".to_string(),
            enabled_providers: vec!["p1".to_string()],
            scope: ScopeContext::global("t1"),
            options: config.default_options(),
        })
        .collect()
        .await;

    assert!(events
        .iter()
        .any(|e| matches!(e, AgentEvent::AgentIteration { iteration: 0 })));
    assert!(events
        .iter()
        .any(|e| matches!(e, AgentEvent::ProviderSource { provider, .. } if provider == "p1")));
    assert!(events
        .iter()
        .any(|e| matches!(e, AgentEvent::AgentToolCall { tool, .. } if tool == "search_p1")));
}
