//! Streaming agentic research orchestrator.
//!
//! Exposes the retrieval pipeline and deep-research providers as tools to an
//! external planner. Each iteration the planner proposes one tool call; the
//! tool runs under its own timeout and returns a bounded text summary plus
//! structured events. Events flow through a bounded channel: a slow consumer
//! blocks the producer (backpressure by construction).
//!
//! The tool surface is filtered by the enabled-provider list; a provider
//! outside the list is never invoked. Collected sources are de-duplicated by
//! URL / content hash across the run and re-ranked with a per-source-type
//! boost table before final assembly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;

use crate::audit::BudgetMeter;
use crate::config::{RagConfig, SearchOptions};
use crate::llm::{LlmProvider, LlmSession};
use crate::research::{ResearchOptions, ResearchRegistry};
use crate::retrieval::pipeline::RetrievalOrchestrator;
use crate::types::{CoreError, Result, ScopeContext};

// ============================================================================
// Events
// ============================================================================

/// Typed events emitted by the agent stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    AgentIteration { iteration: usize },
    AgentThinking { text: String },
    AgentToolCall { tool: String, input: Value },
    AgentToolResult { tool: String, summary: String },
    ProviderSource { provider: String, title: String, url: Option<String> },
    AgentAskUser { question: String },
    StudyToken { token: String },
    MergeDone { source_count: usize },
    StudyDone { text: String },
    Error { message: String },
}

// ============================================================================
// Request & State
// ============================================================================

/// One agent run.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub query: String,
    /// Deep-research providers the planner may call. Providers outside this
    /// list never appear in the tool surface.
    pub enabled_providers: Vec<String>,
    pub scope: ScopeContext,
    pub options: SearchOptions,
}

/// A source collected during the run, before dedupe and boosting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectedSource {
    pub provider: String,
    pub title: String,
    pub url: Option<String>,
    pub snippet: String,
    pub relevance: f32,
}

impl CollectedSource {
    /// Dedupe key: URL when present, content hash otherwise.
    fn dedupe_key(&self) -> String {
        match &self.url {
            Some(url) if !url.is_empty() => url.clone(),
            _ => {
                let mut hasher = Sha256::new();
                hasher.update(self.title.as_bytes());
                hasher.update(self.snippet.as_bytes());
                hex::encode(hasher.finalize())
            }
        }
    }
}

/// Per-source-type additive boost applied before final assembly. Corpus
/// sources outrank open-web results at equal provider relevance.
fn source_boost(provider: &str) -> f32 {
    match provider {
        "rag_local" => 0.25,
        "rag_global" => 0.20,
        _ => 0.05,
    }
}

/// De-duplicate by URL/content hash (best relevance wins) and order by
/// boosted relevance.
pub fn dedupe_and_rank(sources: Vec<CollectedSource>) -> Vec<CollectedSource> {
    let mut best: HashMap<String, CollectedSource> = HashMap::new();
    for source in sources {
        let key = source.dedupe_key();
        match best.get(&key) {
            Some(existing) if existing.relevance >= source.relevance => {}
            _ => {
                best.insert(key, source);
            }
        }
    }
    let mut ranked: Vec<CollectedSource> = best.into_values().collect();
    ranked.sort_by(|a, b| {
        let score_a = a.relevance + source_boost(&a.provider);
        let score_b = b.relevance + source_boost(&b.provider);
        score_b
            .partial_cmp(&score_a)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.title.cmp(&b.title))
    });
    ranked
}

#[derive(Default)]
struct AgentState {
    sources: Vec<CollectedSource>,
    tool_log: Vec<(String, String)>,
    study_sections: Vec<String>,
}

// ============================================================================
// Planner Protocol
// ============================================================================

#[derive(Debug)]
enum PlannerStep {
    ToolCall { tool: String, input: Value },
    Final { text: String },
    Thinking { text: String },
}

/// Parse one planner response: either a fenced/inline JSON tool call
/// (`{"tool": ..., "input": ...}`) or a `FINAL:` answer. Anything else is
/// thinking text.
fn parse_planner_step(text: &str) -> PlannerStep {
    if let Some(rest) = text.trim().strip_prefix("FINAL:") {
        return PlannerStep::Final {
            text: rest.trim().to_string(),
        };
    }
    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
        if start < end {
            if let Ok(value) = serde_json::from_str::<Value>(&text[start..=end]) {
                if let Some(tool) = value["tool"].as_str() {
                    return PlannerStep::ToolCall {
                        tool: tool.to_string(),
                        input: value.get("input").cloned().unwrap_or(json!({})),
                    };
                }
            }
        }
    }
    PlannerStep::Thinking {
        text: text.trim().to_string(),
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

/// The streaming agent loop.
pub struct AgentOrchestrator {
    config: Arc<RagConfig>,
    planner: Arc<dyn LlmProvider>,
    research: Arc<ResearchRegistry>,
    pipeline: Arc<RetrievalOrchestrator>,
}

impl AgentOrchestrator {
    pub fn new(
        config: Arc<RagConfig>,
        planner: Arc<dyn LlmProvider>,
        research: Arc<ResearchRegistry>,
        pipeline: Arc<RetrievalOrchestrator>,
    ) -> Self {
        Self {
            config,
            planner,
            research,
            pipeline,
        }
    }

    /// The tools available to this request's planner.
    fn tool_surface(&self, request: &AgentRequest) -> Vec<String> {
        let mut tools: Vec<String> = request
            .enabled_providers
            .iter()
            .filter(|p| self.research.has_provider(p))
            .map(|p| format!("search_{}", p))
            .collect();
        tools.push("search_rag_global".to_string());
        if request.scope.case_id.is_some() {
            tools.push("search_rag_local".to_string());
        }
        tools.extend(
            [
                "analyze_results",
                "ask_user",
                "generate_study_section",
                "verify_citations",
            ]
            .map(String::from),
        );
        tools
    }

    /// Run the agent loop, returning a stream of typed events.
    ///
    /// The stream is backed by a bounded channel; the loop runs as its own
    /// task and blocks on slow consumers.
    pub fn stream(self: Arc<Self>, request: AgentRequest) -> impl Stream<Item = AgentEvent> {
        let (tx, rx) = mpsc::channel::<AgentEvent>(self.config.agent_channel_capacity.max(1));

        tokio::spawn(async move {
            if let Err(e) = self.run_loop(request, &tx).await {
                let _ = tx
                    .send(AgentEvent::Error {
                        message: e.to_string(),
                    })
                    .await;
            }
        });

        async_stream::stream! {
            let mut rx = rx;
            while let Some(event) = rx.recv().await {
                yield event;
            }
        }
    }

    async fn run_loop(&self, request: AgentRequest, tx: &mpsc::Sender<AgentEvent>) -> Result<()> {
        let tools = self.tool_surface(&request);
        let meter = Arc::new(BudgetMeter::new(
            // The agent loop runs several planner turns plus tool synthesis
            (self.config.max_agent_iterations as u64 + 4).max(self.config.max_llm_calls_per_request),
            self.config.max_tokens_per_request,
            self.config.warn_at_budget_percent,
        ));
        let session = LlmSession::new(
            Arc::clone(&self.planner),
            Arc::clone(&meter),
            self.config.max_retries,
            Duration::from_secs_f64(self.config.llm_timeout_seconds),
        );
        let mut state = AgentState::default();

        for iteration in 0..self.config.max_agent_iterations {
            tx.send(AgentEvent::AgentIteration { iteration })
                .await
                .map_err(|_| CoreError::Cancelled("event consumer dropped".to_string()))?;

            let prompt = self.planner_prompt(&request, &tools, &state);
            let response = match session.generate(&prompt, "planner", 600, 0.2).await {
                Ok(response) => response,
                Err(e @ CoreError::BudgetExceeded(_)) => return Err(e),
                Err(e) => {
                    tx.send(AgentEvent::Error {
                        message: e.to_string(),
                    })
                    .await
                    .ok();
                    break;
                }
            };

            match parse_planner_step(&response.text) {
                PlannerStep::Thinking { text } => {
                    tx.send(AgentEvent::AgentThinking { text })
                        .await
                        .map_err(|_| CoreError::Cancelled("event consumer dropped".to_string()))?;
                }
                PlannerStep::Final { text } => {
                    self.finish(&request, &session, &mut state, text, tx).await?;
                    return Ok(());
                }
                PlannerStep::ToolCall { tool, input } => {
                    tx.send(AgentEvent::AgentToolCall {
                        tool: tool.clone(),
                        input: input.clone(),
                    })
                    .await
                    .map_err(|_| CoreError::Cancelled("event consumer dropped".to_string()))?;

                    if !tools.contains(&tool) {
                        let summary = format!("Tool desconhecida: {}", tool);
                        state.tool_log.push((tool.clone(), summary.clone()));
                        tx.send(AgentEvent::AgentToolResult { tool, summary })
                            .await
                            .ok();
                        continue;
                    }

                    let outcome = tokio::time::timeout(
                        Duration::from_secs_f64(self.config.agent_tool_timeout_seconds),
                        self.execute_tool(&tool, &input, &request, &session, &mut state, tx),
                    )
                    .await;

                    let summary = match outcome {
                        Ok(Ok(summary)) => summary,
                        Ok(Err(e)) => format!("Erro na tool {}: {}", tool, e),
                        Err(_) => format!(
                            "Tool {} excedeu timeout de {}s",
                            tool, self.config.agent_tool_timeout_seconds
                        ),
                    };
                    let summary: String = summary
                        .chars()
                        .take(self.config.agent_tool_result_max_chars)
                        .collect();
                    state.tool_log.push((tool.clone(), summary.clone()));
                    tx.send(AgentEvent::AgentToolResult { tool, summary })
                        .await
                        .map_err(|_| CoreError::Cancelled("event consumer dropped".to_string()))?;
                }
            }
        }

        // Iteration budget spent: assemble whatever was collected
        self.finish(&request, &session, &mut state, String::new(), tx)
            .await
    }

    fn planner_prompt(
        &self,
        request: &AgentRequest,
        tools: &[String],
        state: &AgentState,
    ) -> String {
        let history: Vec<String> = state
            .tool_log
            .iter()
            .map(|(tool, summary)| format!("### {}\n{}", tool, summary))
            .collect();
        format!(
            "Voce e um agente de pesquisa juridica. Tools disponiveis: {}.\n\
             Para usar uma tool responda com JSON {{\"tool\": \"nome\", \"input\": {{\"query\": \"...\"}}}}.\n\
             Quando tiver evidencia suficiente responda 'FINAL: <resposta>'.\n\n\
             Pergunta: {}\n\nResultados anteriores:\n{}",
            tools.join(", "),
            request.query,
            if history.is_empty() {
                "(nenhum)".to_string()
            } else {
                history.join("\n\n")
            }
        )
    }

    async fn execute_tool(
        &self,
        tool: &str,
        input: &Value,
        request: &AgentRequest,
        session: &LlmSession,
        state: &mut AgentState,
        tx: &mpsc::Sender<AgentEvent>,
    ) -> Result<String> {
        let query = input["query"].as_str().unwrap_or(&request.query).to_string();

        if let Some(provider_id) = tool.strip_prefix("search_") {
            match provider_id {
                "rag_global" => return self.tool_rag(&query, request, false, state, tx).await,
                "rag_local" => return self.tool_rag(&query, request, true, state, tx).await,
                _ => return self.tool_provider(provider_id, &query, state, tx).await,
            }
        }

        match tool {
            "analyze_results" => Ok(self.tool_analyze(state)),
            "ask_user" => {
                let question = input["question"]
                    .as_str()
                    .unwrap_or("Pode detalhar o objetivo da pesquisa?")
                    .to_string();
                tx.send(AgentEvent::AgentAskUser {
                    question: question.clone(),
                })
                .await
                .map_err(|_| CoreError::Cancelled("event consumer dropped".to_string()))?;
                Ok(format!("Pergunta enviada ao usuario: {}", question))
            }
            "generate_study_section" => {
                self.tool_generate_section(&query, session, state, tx).await
            }
            "verify_citations" => Ok(self.tool_verify_citations(input, state)),
            _ => Ok(format!("Tool desconhecida: {}", tool)),
        }
    }

    async fn tool_provider(
        &self,
        provider_id: &str,
        query: &str,
        state: &mut AgentState,
        tx: &mpsc::Sender<AgentEvent>,
    ) -> Result<String> {
        let provider = self.research.get(provider_id)?;
        let output = provider
            .research(
                query,
                &ResearchOptions {
                    legal_focus: true,
                    ..Default::default()
                },
            )
            .await?;

        for source in &output.sources {
            tx.send(AgentEvent::ProviderSource {
                provider: provider_id.to_string(),
                title: source.title.clone(),
                url: source.url.clone(),
            })
            .await
            .ok();
            state.sources.push(CollectedSource {
                provider: provider_id.to_string(),
                title: source.title.clone(),
                url: source.url.clone(),
                snippet: source.snippet.clone(),
                relevance: source.relevance,
            });
        }

        Ok(format!(
            "{} fontes de {}. Sintese: {}",
            output.sources.len(),
            provider_id,
            output.text
        ))
    }

    async fn tool_rag(
        &self,
        query: &str,
        request: &AgentRequest,
        local: bool,
        state: &mut AgentState,
        tx: &mpsc::Sender<AgentEvent>,
    ) -> Result<String> {
        let provider_name = if local { "rag_local" } else { "rag_global" };
        let mut scope = request.scope.clone();
        let sources = if local {
            if scope.case_id.is_none() {
                return Ok(
                    "RAG local indisponivel: nenhum caso vinculado a esta pesquisa.".to_string()
                );
            }
            scope.allow_global = false;
            Some(vec![crate::types::SourceType::Local])
        } else {
            scope.case_id = None;
            None
        };

        let result = self
            .pipeline
            .search(query, 8, sources, scope, request.options.clone())
            .await?;

        for retrieved in &result.results {
            let title = if retrieved.chunk.metadata.title.is_empty() {
                retrieved.chunk.doc_id.clone()
            } else {
                retrieved.chunk.metadata.title.clone()
            };
            tx.send(AgentEvent::ProviderSource {
                provider: provider_name.to_string(),
                title: title.clone(),
                url: None,
            })
            .await
            .ok();
            state.sources.push(CollectedSource {
                provider: provider_name.to_string(),
                title,
                url: None,
                snippet: retrieved.working_text().chars().take(300).collect(),
                relevance: retrieved.final_score(),
            });
        }

        Ok(format!(
            "{} resultados ({}), nivel de evidencia {}.\n{}",
            result.results.len(),
            provider_name,
            result.evidence_level,
            result.context_text.chars().take(1500).collect::<String>()
        ))
    }

    fn tool_analyze(&self, state: &AgentState) -> String {
        let mut by_provider: HashMap<&str, usize> = HashMap::new();
        for source in &state.sources {
            *by_provider.entry(source.provider.as_str()).or_insert(0) += 1;
        }
        let mut lines: Vec<String> = by_provider
            .iter()
            .map(|(provider, count)| format!("- {}: {} fontes", provider, count))
            .collect();
        lines.sort();
        format!(
            "Fontes coletadas: {} ({} unicas apos dedupe).\n{}",
            state.sources.len(),
            dedupe_and_rank(state.sources.clone()).len(),
            lines.join("\n")
        )
    }

    async fn tool_generate_section(
        &self,
        topic: &str,
        session: &LlmSession,
        state: &mut AgentState,
        tx: &mpsc::Sender<AgentEvent>,
    ) -> Result<String> {
        let ranked = dedupe_and_rank(state.sources.clone());
        let evidence: Vec<String> = ranked
            .iter()
            .take(10)
            .map(|s| format!("- [{}] {}: {}", s.provider, s.title, s.snippet))
            .collect();
        let prompt = format!(
            "Redija uma secao de estudo juridico sobre '{}' com base nas fontes:\n{}\n\nSecao:",
            topic,
            evidence.join("\n")
        );
        let response = session.generate(&prompt, "planner", 800, 0.3).await?;

        // Stream the section in word-bounded tokens
        for token in response.text.split_inclusive(' ') {
            tx.send(AgentEvent::StudyToken {
                token: token.to_string(),
            })
            .await
            .map_err(|_| CoreError::Cancelled("event consumer dropped".to_string()))?;
        }
        state.study_sections.push(response.text.clone());
        Ok(format!("Secao gerada ({} caracteres)", response.text.len()))
    }

    fn tool_verify_citations(&self, input: &Value, state: &AgentState) -> String {
        let text = input["text"].as_str().unwrap_or_default();
        let titles: Vec<&str> = state.sources.iter().map(|s| s.title.as_str()).collect();
        let mut missing = 0usize;
        let mut verified = 0usize;
        for line in text.lines().filter(|l| l.contains('[')) {
            if titles.iter().any(|t| !t.is_empty() && line.contains(t)) {
                verified += 1;
            } else {
                missing += 1;
            }
        }
        format!(
            "Citacoes verificadas: {}; sem fonte correspondente: {}",
            verified, missing
        )
    }

    async fn finish(
        &self,
        request: &AgentRequest,
        session: &LlmSession,
        state: &mut AgentState,
        final_text: String,
        tx: &mpsc::Sender<AgentEvent>,
    ) -> Result<()> {
        let ranked = dedupe_and_rank(std::mem::take(&mut state.sources));
        tx.send(AgentEvent::MergeDone {
            source_count: ranked.len(),
        })
        .await
        .map_err(|_| CoreError::Cancelled("event consumer dropped".to_string()))?;

        let text = if !final_text.is_empty() {
            final_text
        } else if !state.study_sections.is_empty() {
            state.study_sections.join("\n\n")
        } else if session.can_afford_call() && !ranked.is_empty() {
            let evidence: Vec<String> = ranked
                .iter()
                .take(10)
                .map(|s| format!("- [{}] {}: {}", s.provider, s.title, s.snippet))
                .collect();
            let prompt = format!(
                "Sintetize as fontes abaixo em uma resposta para: {}\n\n{}\n\nResposta:",
                request.query,
                evidence.join("\n")
            );
            session
                .generate(&prompt, "planner", 800, 0.3)
                .await
                .map(|r| r.text)
                .unwrap_or_default()
        } else {
            String::new()
        };

        tx.send(AgentEvent::StudyDone { text })
            .await
            .map_err(|_| CoreError::Cancelled("event consumer dropped".to_string()))?;
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn source(provider: &str, title: &str, url: Option<&str>, relevance: f32) -> CollectedSource {
        CollectedSource {
            provider: provider.to_string(),
            title: title.to_string(),
            url: url.map(String::from),
            snippet: format!("snippet {}", title),
            relevance,
        }
    }

    #[test]
    fn test_parse_planner_tool_call() {
        let step = parse_planner_step(
            "Vou pesquisar.\n{\"tool\": \"search_gemini\", \"input\": {\"query\": \"dano moral\"}}",
        );
        match step {
            PlannerStep::ToolCall { tool, input } => {
                assert_eq!(tool, "search_gemini");
                assert_eq!(input["query"], "dano moral");
            }
            other => panic!("expected tool call, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_planner_final() {
        match parse_planner_step("FINAL: a resposta completa") {
            PlannerStep::Final { text } => assert_eq!(text, "a resposta completa"),
            other => panic!("expected final, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_planner_thinking_fallback() {
        match parse_planner_step("preciso entender melhor o contexto") {
            PlannerStep::Thinking { text } => assert!(text.contains("contexto")),
            other => panic!("expected thinking, got {:?}", other),
        }
    }

    #[test]
    fn test_dedupe_by_url_keeps_best_relevance() {
        let ranked = dedupe_and_rank(vec![
            source("gemini", "Artigo", Some("https://a.example"), 0.4),
            source("perplexity", "Artigo", Some("https://a.example"), 0.9),
        ]);
        assert_eq!(ranked.len(), 1);
        assert!((ranked[0].relevance - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_dedupe_by_content_hash_without_url() {
        let ranked = dedupe_and_rank(vec![
            source("gemini", "Mesmo titulo", None, 0.5),
            source("gemini", "Mesmo titulo", None, 0.5),
            source("gemini", "Outro titulo", None, 0.5),
        ]);
        assert_eq!(ranked.len(), 2);
    }

    #[test]
    fn test_rag_sources_outrank_web_at_equal_relevance() {
        let ranked = dedupe_and_rank(vec![
            source("gemini", "Web", Some("https://w.example"), 0.5),
            source("rag_global", "Corpus", None, 0.5),
        ]);
        assert_eq!(ranked[0].provider, "rag_global");
    }
}
