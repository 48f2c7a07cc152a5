//! Cognitive graph RAG: decompose, gather, refine, reason bottom-up.
//!
//! `reason()` wraps the retrieval pipeline in a multi-step reasoning loop:
//! a sub-question tree is decomposed from the input, evidence is gathered
//! per leaf (pipeline retrieval plus optional graph evidence), duplicates are
//! merged and conflicts marked, then answers are produced bottom-up with
//! `[ref:<chunk_uid>]` / `[path:<path_uid>]` citation markers constrained to
//! the supplied evidence. An abstain gate refuses to produce a
//! confident-looking answer over weak evidence. The mind map is the
//! canonical trace for this wrapper.
//!
//! All LLM calls charge the request budget meter; leaf generation is bounded
//! by a concurrency semaphore.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::audit::BudgetMeter;
use crate::cache::TtlCache;
use crate::compress::extract_keywords;
use crate::config::{RagConfig, SearchOptions};
use crate::llm::{LlmProvider, LlmSession};
use crate::retrieval::pipeline::RetrievalOrchestrator;
use crate::types::{CoreError, Result, RetrievalResult, ScopeContext};

// ============================================================================
// Result Types
// ============================================================================

/// Verification outcome of the final answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationStatus {
    /// Verification passed or was not requested.
    Ok,
    /// Verification kept failing within the rethink budget.
    Unverified,
    /// Confidence too low for a confident answer.
    Abstain,
}

/// Answer for one node of the question tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubAnswer {
    pub node_id: String,
    pub question: String,
    pub answer: String,
    pub confidence: f32,
    /// `[ref:..]` / `[path:..]` markers that survived validation.
    pub citations: Vec<String>,
    pub has_conflicts: bool,
}

/// One node of the mind map (the canonical CogGRAG trace).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MindMapNode {
    pub id: String,
    pub question: String,
    pub depth: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    pub confidence: f32,
    pub evidence_count: usize,
    pub has_conflicts: bool,
    pub children: Vec<MindMapNode>,
}

/// Complete output of one reasoning run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CogGragResult {
    pub answer: String,
    pub sub_answers: Vec<SubAnswer>,
    pub mind_map: MindMapNode,
    pub verification_status: VerificationStatus,
    pub issues: Vec<String>,
    pub llm_calls: u64,
}

// ============================================================================
// Question Tree
// ============================================================================

#[derive(Debug, Clone)]
struct QuestionNode {
    id: String,
    question: String,
    depth: usize,
    children: Vec<QuestionNode>,
}

/// Complexity heuristic for decomposition: long, conjunctive, multi-clause
/// questions score high; short focused questions stay leaves.
fn complexity_score(question: &str) -> f32 {
    let words = question.split_whitespace().count() as f32;
    let conjunctions = [" e ", " ou ", " bem como ", " alem de "]
        .iter()
        .map(|c| question.to_lowercase().matches(c).count())
        .sum::<usize>() as f32;
    let clauses = question.matches([',', ';']).count() as f32;
    ((words / 25.0) + conjunctions * 0.2 + clauses * 0.1).min(1.0)
}

// ============================================================================
// Evidence
// ============================================================================

#[derive(Debug, Clone, Default)]
struct NodeEvidence {
    chunks: Vec<RetrievalResult>,
    path_refs: Vec<(String, String)>, // (path_uid, text)
    triples: Vec<String>,
    quality_score: f32,
    has_conflicts: bool,
}

static NEGATION_MARKERS: &[&str] = &["não ", "nao ", "vedado", "proibid", "ilícit", "ilicit"];

/// Two chunks conflict when their keyword sets overlap heavily but exactly
/// one of them carries a negation marker.
fn chunks_conflict(a: &str, b: &str) -> bool {
    let ka: HashSet<String> = extract_keywords(a).into_iter().collect();
    let kb: HashSet<String> = extract_keywords(b).into_iter().collect();
    if ka.is_empty() || kb.is_empty() {
        return false;
    }
    let intersection = ka.intersection(&kb).count() as f32;
    let union = ka.union(&kb).count() as f32;
    if intersection / union < 0.6 {
        return false;
    }
    let lower_a = a.to_lowercase();
    let lower_b = b.to_lowercase();
    let neg_a = NEGATION_MARKERS.iter().any(|m| lower_a.contains(m));
    let neg_b = NEGATION_MARKERS.iter().any(|m| lower_b.contains(m));
    neg_a != neg_b
}

// ============================================================================
// Consultation Memory
// ============================================================================

/// Remembers which references earlier near-duplicate consultations used, so
/// refinement can penalize evidence the caller has already been shown.
pub struct ConsultationMemory {
    cache: TtlCache<Vec<String>>,
    similarity_threshold: f32,
}

impl ConsultationMemory {
    pub fn new(max_entries: usize, ttl: Duration, similarity_threshold: f32) -> Self {
        Self {
            cache: TtlCache::new(max_entries, ttl),
            similarity_threshold,
        }
    }

    fn keyword_set(question: &str) -> HashSet<String> {
        extract_keywords(question).into_iter().collect()
    }

    /// Chunk uids used by remembered consultations similar to this question.
    pub fn penalized_refs(&self, question: &str, remembered: &[(String, Vec<String>)]) -> HashSet<String> {
        let current = Self::keyword_set(question);
        let mut penalized = HashSet::new();
        for (past_question, refs) in remembered {
            let past = Self::keyword_set(past_question);
            if current.is_empty() || past.is_empty() {
                continue;
            }
            let intersection = current.intersection(&past).count() as f32;
            let union = current.union(&past).count() as f32;
            if intersection / union >= self.similarity_threshold {
                penalized.extend(refs.iter().cloned());
            }
        }
        penalized
    }

    pub fn remember(&self, question: &str, refs: Vec<String>) {
        let key = TtlCache::<Vec<String>>::compute_key("consultation", question);
        self.cache.set(&key, refs);
    }

    pub fn recall(&self, question: &str) -> Option<Vec<String>> {
        let key = TtlCache::<Vec<String>>::compute_key("consultation", question);
        self.cache.get(&key)
    }
}

// ============================================================================
// Citation Markers
// ============================================================================

static MARKER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[(ref|path):([^\]\s]+)\]").expect("static pattern"));

/// Strip markers that do not correspond to the node's evidence; return the
/// cleaned answer and the surviving markers.
fn validate_markers(answer: &str, valid_refs: &HashSet<String>) -> (String, Vec<String>) {
    let mut citations = Vec::new();
    let cleaned = MARKER_RE
        .replace_all(answer, |caps: &regex::Captures<'_>| {
            let id = caps[2].to_string();
            if valid_refs.contains(&id) {
                let marker = caps[0].to_string();
                if !citations.contains(&marker) {
                    citations.push(marker.clone());
                }
                marker
            } else {
                String::new()
            }
        })
        .to_string();
    (cleaned, citations)
}

// ============================================================================
// Reasoner
// ============================================================================

/// The CogGRAG reasoning wrapper around the retrieval pipeline.
pub struct CogGragReasoner {
    config: Arc<RagConfig>,
    pipeline: Arc<RetrievalOrchestrator>,
    llm: Arc<dyn LlmProvider>,
    memory: Option<Arc<ConsultationMemory>>,
}

impl CogGragReasoner {
    pub fn new(
        config: Arc<RagConfig>,
        pipeline: Arc<RetrievalOrchestrator>,
        llm: Arc<dyn LlmProvider>,
        memory: Option<Arc<ConsultationMemory>>,
    ) -> Self {
        Self {
            config,
            pipeline,
            llm,
            memory,
        }
    }

    /// Run the full reasoning loop for a question.
    pub async fn reason(
        &self,
        question: &str,
        scope: ScopeContext,
        options: SearchOptions,
    ) -> Result<CogGragResult> {
        if question.trim().is_empty() {
            return Err(CoreError::InvalidRequest(
                "question must not be empty".to_string(),
            ));
        }

        let meter = Arc::new(BudgetMeter::new(
            self.config.max_llm_calls_per_request,
            self.config.max_tokens_per_request,
            self.config.warn_at_budget_percent,
        ));
        let session = LlmSession::new(
            Arc::clone(&self.llm),
            Arc::clone(&meter),
            self.config.max_retries,
            Duration::from_secs_f64(self.config.llm_timeout_seconds),
        );
        let mut issues: Vec<String> = Vec::new();

        // ---- Stage 1: decompose ----
        let tree = self.decompose(question, &session, &mut issues).await;

        // ---- Stage 2: gather evidence per leaf ----
        let mut leaves: Vec<&QuestionNode> = Vec::new();
        collect_leaves(&tree, &mut leaves);
        let mut evidence: HashMap<String, NodeEvidence> = HashMap::new();
        for leaf in &leaves {
            let node_evidence = self
                .gather_evidence(&leaf.question, &scope, &options, &mut issues)
                .await;
            evidence.insert(leaf.id.clone(), node_evidence);
        }

        // ---- Stage 3: refine ----
        if self.config.cograg_evidence_refinement_enabled {
            self.refine_evidence(question, &mut evidence);
        }

        // ---- Stage 4: detect conflicts ----
        for node_evidence in evidence.values_mut() {
            let texts: Vec<&str> = node_evidence
                .chunks
                .iter()
                .map(|c| c.working_text())
                .collect();
            node_evidence.has_conflicts = texts
                .iter()
                .enumerate()
                .any(|(i, a)| texts.iter().skip(i + 1).any(|b| chunks_conflict(a, b)));
        }

        // ---- Stage 5: reason bottom-up ----
        let semaphore = Arc::new(Semaphore::new(self.config.cograg_llm_max_concurrency.max(1)));
        let answer_futures = leaves.iter().map(|leaf| {
            let node_evidence = evidence.get(&leaf.id).cloned().unwrap_or_default();
            let semaphore = Arc::clone(&semaphore);
            let session = &session;
            async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| CoreError::Cancelled("reasoner semaphore closed".to_string()))?;
                Ok::<_, CoreError>(self.answer_leaf(leaf, &node_evidence, session).await)
            }
        });
        let mut sub_answers: Vec<SubAnswer> = Vec::new();
        for outcome in futures::future::join_all(answer_futures).await {
            let (answer, mut leaf_issues) = outcome?;
            issues.append(&mut leaf_issues);
            sub_answers.push(answer);
        }

        let final_answer = self
            .synthesize(question, &sub_answers, &session, &mut issues)
            .await;

        // ---- Stage 6: abstain gate ----
        let valid: Vec<&SubAnswer> = sub_answers
            .iter()
            .filter(|a| !a.answer.is_empty())
            .collect();
        let avg_confidence = if valid.is_empty() {
            0.0
        } else {
            valid.iter().map(|a| a.confidence).sum::<f32>() / valid.len() as f32
        };

        let mut verification_status = VerificationStatus::Ok;
        if self.config.cograg_abstain_mode
            && (valid.is_empty() || avg_confidence < self.config.cograg_abstain_threshold)
        {
            verification_status = VerificationStatus::Abstain;
            issues.push(format!(
                "average confidence {:.2} below abstain threshold {:.2}",
                avg_confidence, self.config.cograg_abstain_threshold
            ));
        }

        // ---- Stage 7: verify ----
        if verification_status == VerificationStatus::Ok && self.config.cograg_verification_enabled
        {
            verification_status = self
                .verify(question, &final_answer, &session, &mut issues)
                .await;
        }

        if let Some(memory) = &self.memory {
            let refs: Vec<String> = sub_answers
                .iter()
                .flat_map(|a| a.citations.iter().cloned())
                .collect();
            memory.remember(question, refs);
        }

        let mind_map = build_mind_map(&tree, &sub_answers, &evidence);
        let answer = if verification_status == VerificationStatus::Abstain {
            String::new()
        } else {
            final_answer
        };

        Ok(CogGragResult {
            answer,
            sub_answers,
            mind_map,
            verification_status,
            issues,
            llm_calls: meter.llm_calls(),
        })
    }

    async fn decompose(
        &self,
        question: &str,
        session: &LlmSession,
        issues: &mut Vec<String>,
    ) -> QuestionNode {
        let mut root = QuestionNode {
            id: "q0".to_string(),
            question: question.to_string(),
            depth: 0,
            children: Vec::new(),
        };

        if complexity_score(question) < self.config.cograg_complexity_threshold
            || self.config.cograg_max_depth < 2
            || !session.can_afford_call()
        {
            return root;
        }

        let prompt = format!(
            "Decomponha a pergunta juridica abaixo em ate {} sub-perguntas independentes, \
             uma por linha, sem numeracao.\n\nPergunta: {}\n\nSub-perguntas:",
            self.config.cograg_max_children, question
        );
        match session
            .generate(&prompt, &self.config.cograg_decomposer_model, 300, 0.3)
            .await
        {
            Ok(response) => {
                root.children = response
                    .text
                    .lines()
                    .map(|l| l.trim().trim_start_matches(['-', '*', ' ']).to_string())
                    .filter(|l| l.len() > 10)
                    .take(self.config.cograg_max_children)
                    .enumerate()
                    .map(|(i, sub)| QuestionNode {
                        id: format!("q0.{}", i + 1),
                        question: sub,
                        depth: 1,
                        children: Vec::new(),
                    })
                    .collect();
            }
            Err(e) => {
                issues.push(format!("decomposition failed: {}", e));
            }
        }
        root
    }

    async fn gather_evidence(
        &self,
        question: &str,
        scope: &ScopeContext,
        options: &SearchOptions,
        issues: &mut Vec<String>,
    ) -> NodeEvidence {
        // Sub-queries run the pipeline without its own enrichment or CRAG
        // loops; graph evidence is attached here under CogGRAG's own budgets.
        let mut leaf_options = options.clone();
        leaf_options.enable_crag = false;
        leaf_options.enable_graph_enrich = self.config.cograg_graph_evidence_enabled;
        leaf_options.enable_hyde = false;
        leaf_options.enable_multi_query = false;
        leaf_options.conversation_history = Vec::new();

        match self
            .pipeline
            .search(question, 5, None, scope.clone(), leaf_options)
            .await
        {
            Ok(result) => NodeEvidence {
                quality_score: if result.results.is_empty() {
                    0.0
                } else {
                    result
                        .results
                        .iter()
                        .map(|r| r.gate_score())
                        .sum::<f32>()
                        / result.results.len() as f32
                },
                path_refs: result
                    .graph_paths
                    .iter()
                    .take(self.config.cograg_graph_evidence_limit)
                    .map(|p| (p.path_uid.clone(), p.text.clone()))
                    .collect(),
                triples: result
                    .graph_triples
                    .iter()
                    .take(self.config.cograg_graph_evidence_limit)
                    .map(|t| t.text.clone())
                    .collect(),
                chunks: result.results,
                has_conflicts: false,
            },
            Err(e) => {
                issues.push(format!("evidence gathering failed for '{}': {}", question, e));
                NodeEvidence::default()
            }
        }
    }

    /// Merge duplicates across nodes by content hash and apply the memory
    /// penalty to references shown in near-duplicate consultations.
    fn refine_evidence(&self, question: &str, evidence: &mut HashMap<String, NodeEvidence>) {
        let mut best_by_hash: HashMap<String, f32> = HashMap::new();
        for node in evidence.values() {
            for chunk in &node.chunks {
                let hash = chunk.chunk.content_hash();
                let entry = best_by_hash.entry(hash).or_insert(f32::MIN);
                *entry = entry.max(chunk.final_score());
            }
        }

        let penalized: HashSet<String> = match &self.memory {
            Some(memory) => {
                let remembered: Vec<(String, Vec<String>)> = memory
                    .recall(question)
                    .map(|refs| vec![(question.to_string(), refs)])
                    .unwrap_or_default();
                memory.penalized_refs(question, &remembered)
            }
            None => HashSet::new(),
        };

        for node in evidence.values_mut() {
            let mut seen: HashSet<String> = HashSet::new();
            node.chunks.retain(|chunk| {
                let hash = chunk.chunk.content_hash();
                // Keep only the best-scoring copy of duplicated content
                let is_best = best_by_hash
                    .get(&hash)
                    .map(|best| (chunk.final_score() - best).abs() < f32::EPSILON)
                    .unwrap_or(true);
                is_best && seen.insert(hash)
            });
            if !penalized.is_empty() {
                for chunk in &mut node.chunks {
                    if penalized.contains(&format!("[ref:{}]", chunk.chunk.chunk_uid)) {
                        node.quality_score *= 0.8;
                        chunk.touch("memory_penalty");
                    }
                }
            }
        }
    }

    async fn answer_leaf(
        &self,
        leaf: &QuestionNode,
        evidence: &NodeEvidence,
        session: &LlmSession,
    ) -> (SubAnswer, Vec<String>) {
        let mut issues: Vec<String> = Vec::new();
        let mut valid_refs: HashSet<String> = evidence
            .chunks
            .iter()
            .map(|c| c.chunk.chunk_uid.clone())
            .collect();
        valid_refs.extend(evidence.path_refs.iter().map(|(uid, _)| uid.clone()));

        let mut blocks: Vec<String> = evidence
            .chunks
            .iter()
            .take(5)
            .map(|c| {
                format!(
                    "[ref:{}] [fonte: {}] score={:.2}\n{}",
                    c.chunk.chunk_uid,
                    c.chunk.dataset,
                    c.final_score(),
                    c.working_text().chars().take(500).collect::<String>()
                )
            })
            .collect();
        if blocks.is_empty() {
            blocks.push("Nenhuma evidência textual disponível.".to_string());
        }
        for (uid, text) in &evidence.path_refs {
            blocks.push(format!("[path:{}] {}", uid, text));
        }
        if !evidence.triples.is_empty() {
            blocks.push(format!("<KG_TRIPLES>\n{}\n</KG_TRIPLES>", evidence.triples.join("\n")));
        }

        if !session.can_afford_call() {
            issues.push(format!("budget exhausted before answering '{}'", leaf.question));
            return (
                SubAnswer {
                    node_id: leaf.id.clone(),
                    question: leaf.question.clone(),
                    answer: String::new(),
                    confidence: 0.0,
                    citations: Vec::new(),
                    has_conflicts: evidence.has_conflicts,
                },
                issues,
            );
        }

        let conflict_note = if evidence.has_conflicts {
            "\nATENCAO: as evidencias contem afirmacoes conflitantes; aponte o conflito."
        } else {
            ""
        };
        let prompt = format!(
            "Responda de forma objetiva citando APENAS as evidencias fornecidas, usando os \
             marcadores [ref:...] e [path:...] existentes.{}\n\nEvidencias:\n{}\n\n\
             Pergunta: {}\n\nResposta:",
            conflict_note,
            blocks.join("\n\n"),
            leaf.question
        );

        let raw_answer = match session
            .generate(&prompt, &self.config.cograg_decomposer_model, 400, 0.2)
            .await
        {
            Ok(response) => response.text,
            Err(e) => {
                issues.push(format!("answer generation failed for '{}': {}", leaf.question, e));
                String::new()
            }
        };

        let (answer, citations) = validate_markers(&raw_answer, &valid_refs);
        let confidence = answer_confidence(
            &answer,
            evidence.chunks.len(),
            evidence.quality_score,
            evidence.has_conflicts,
        );

        (
            SubAnswer {
                node_id: leaf.id.clone(),
                question: leaf.question.clone(),
                answer: answer.trim().to_string(),
                confidence,
                citations,
                has_conflicts: evidence.has_conflicts,
            },
            issues,
        )
    }

    async fn synthesize(
        &self,
        question: &str,
        sub_answers: &[SubAnswer],
        session: &LlmSession,
        issues: &mut Vec<String>,
    ) -> String {
        let answered: Vec<&SubAnswer> = sub_answers.iter().filter(|a| !a.answer.is_empty()).collect();
        if answered.is_empty() {
            return String::new();
        }
        if answered.len() == 1 {
            return answered[0].answer.clone();
        }

        if !session.can_afford_call() {
            issues.push("budget exhausted before synthesis; concatenating sub-answers".to_string());
            return answered
                .iter()
                .map(|a| format!("{}\n{}", a.question, a.answer))
                .collect::<Vec<_>>()
                .join("\n\n");
        }

        let parts: Vec<String> = answered
            .iter()
            .map(|a| format!("Sub-pergunta: {}\nResposta: {}", a.question, a.answer))
            .collect();
        let prompt = format!(
            "Sintetize uma resposta final para a pergunta a partir das respostas parciais, \
             preservando todos os marcadores [ref:...] e [path:...].\n\n{}\n\n\
             Pergunta: {}\n\nResposta final:",
            parts.join("\n\n"),
            question
        );
        match session
            .generate(&prompt, &self.config.cograg_decomposer_model, 600, 0.2)
            .await
        {
            Ok(response) => response.text.trim().to_string(),
            Err(e) => {
                issues.push(format!("synthesis failed: {}", e));
                answered
                    .iter()
                    .map(|a| a.answer.clone())
                    .collect::<Vec<_>>()
                    .join("\n\n")
            }
        }
    }

    async fn verify(
        &self,
        question: &str,
        answer: &str,
        session: &LlmSession,
        issues: &mut Vec<String>,
    ) -> VerificationStatus {
        for attempt in 0..=self.config.cograg_max_rethink_attempts {
            if !session.can_afford_call() {
                issues.push("budget exhausted during verification".to_string());
                return VerificationStatus::Unverified;
            }
            let prompt = format!(
                "Verifique se a resposta contem afirmacoes sem suporte nos marcadores citados. \
                 Responda exatamente 'APROVADA' ou 'REPROVADA: <motivo>'.\n\n\
                 Pergunta: {}\n\nResposta: {}",
                question, answer
            );
            match session
                .generate(&prompt, &self.config.cograg_verification_model, 150, 0.0)
                .await
            {
                Ok(response) if response.text.to_uppercase().contains("APROVADA")
                    && !response.text.to_uppercase().contains("REPROVADA") =>
                {
                    return VerificationStatus::Ok;
                }
                Ok(response) => {
                    issues.push(format!(
                        "verification attempt {} flagged: {}",
                        attempt + 1,
                        response.text.chars().take(200).collect::<String>()
                    ));
                }
                Err(e) => {
                    issues.push(format!("verification call failed: {}", e));
                    return VerificationStatus::Unverified;
                }
            }
        }
        VerificationStatus::Unverified
    }
}

fn collect_leaves<'a>(node: &'a QuestionNode, leaves: &mut Vec<&'a QuestionNode>) {
    if node.children.is_empty() {
        leaves.push(node);
    } else {
        for child in &node.children {
            collect_leaves(child, leaves);
        }
    }
}

fn build_mind_map(
    node: &QuestionNode,
    sub_answers: &[SubAnswer],
    evidence: &HashMap<String, NodeEvidence>,
) -> MindMapNode {
    let answer = sub_answers.iter().find(|a| a.node_id == node.id);
    MindMapNode {
        id: node.id.clone(),
        question: node.question.clone(),
        depth: node.depth,
        answer: answer.map(|a| a.answer.clone()).filter(|a| !a.is_empty()),
        confidence: answer.map(|a| a.confidence).unwrap_or(0.0),
        evidence_count: evidence.get(&node.id).map(|e| e.chunks.len()).unwrap_or(0),
        has_conflicts: answer.map(|a| a.has_conflicts).unwrap_or(false),
        children: node
            .children
            .iter()
            .map(|c| build_mind_map(c, sub_answers, evidence))
            .collect(),
    }
}

/// Confidence from evidence quantity, quality, conflicts, and answer
/// substance.
fn answer_confidence(
    answer: &str,
    evidence_count: usize,
    quality_score: f32,
    has_conflicts: bool,
) -> f32 {
    if answer.is_empty() {
        return 0.0;
    }
    let mut confidence = 0.5;
    if evidence_count >= 5 {
        confidence += 0.2;
    } else if evidence_count >= 2 {
        confidence += 0.1;
    }
    confidence += quality_score * 0.2;
    if has_conflicts {
        confidence -= 0.15;
    }
    if answer.len() > 200 {
        confidence += 0.1;
    } else if answer.len() < 50 {
        confidence -= 0.1;
    }
    confidence.clamp(0.0, 1.0)
}

// ============================================================================
// Tests
// ============================================================================
