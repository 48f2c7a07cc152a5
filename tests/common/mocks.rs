#![allow(dead_code)]
//! Mock implementations shared across integration tests.
//!
//! Mock stores enforce the visibility predicate server-side, exactly like
//! the real clients: a chunk only comes back when the scope context admits
//! its document. Scoring is controlled per document through a match term, so
//! tests can script exact gate outcomes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use lexrag::llm::embeddings::Embedder;
use lexrag::llm::{GenerateRequest, LlmProvider, LlmResponse, TokenUsage};
use lexrag::research::{ResearchOptions, ResearchOutput, ResearchProvider, ResearchSource};
use lexrag::stores::{
    CoMentionDoc, EntitySeed, GraphStore, LexicalIndex, RawPath, ScoredChunk, VectorStore,
};
use lexrag::types::{
    Chunk, ChunkMetadata, CoreError, DocVisibility, Entity, Result, Scope, ScopeContext,
    SourceType,
};

// ============================================================================
// Corpus
// ============================================================================

/// One scripted document: a chunk, its visibility, the term a query must
/// contain to match it, and the score it matches with.
#[derive(Clone)]
pub struct MockDoc {
    pub chunk: Chunk,
    pub visibility: DocVisibility,
    pub match_term: String,
    pub score: f32,
}

/// Build a chunk for tests.
pub fn chunk(doc_id: &str, position: usize, source_type: SourceType, text: &str) -> Chunk {
    Chunk {
        chunk_uid: Chunk::uid(doc_id, position),
        source_type,
        dataset: source_type.to_string(),
        text: text.to_string(),
        position,
        doc_id: doc_id.to_string(),
        metadata: ChunkMetadata::default(),
    }
}

/// Global-scope visibility for a tenant-owned public document.
pub fn global_visibility() -> DocVisibility {
    DocVisibility {
        tenant_id: "platform".to_string(),
        scope: Scope::Global,
        ..Default::default()
    }
}

/// Private visibility for a tenant.
pub fn private_visibility(tenant: &str) -> DocVisibility {
    DocVisibility {
        tenant_id: tenant.to_string(),
        scope: Scope::Private,
        ..Default::default()
    }
}

/// Local-case visibility.
pub fn local_visibility(tenant: &str, case_id: &str) -> DocVisibility {
    DocVisibility {
        tenant_id: tenant.to_string(),
        scope: Scope::LocalCase,
        case_id: Some(case_id.to_string()),
        ..Default::default()
    }
}

// ============================================================================
// Lexical Index
// ============================================================================

pub struct MockLexicalIndex {
    pub corpus: Vec<MockDoc>,
}

impl MockLexicalIndex {
    pub fn new(corpus: Vec<MockDoc>) -> Self {
        Self { corpus }
    }
}

#[async_trait]
impl LexicalIndex for MockLexicalIndex {
    async fn search(
        &self,
        query: &str,
        dataset: SourceType,
        fetch_k: usize,
        scope: &ScopeContext,
    ) -> Result<Vec<ScoredChunk>> {
        let query = query.to_lowercase();
        let mut hits: Vec<ScoredChunk> = self
            .corpus
            .iter()
            .filter(|doc| doc.chunk.source_type == dataset)
            .filter(|doc| scope.admits(&doc.visibility))
            .filter(|doc| query.contains(&doc.match_term.to_lowercase()))
            .map(|doc| ScoredChunk {
                chunk: doc.chunk.clone(),
                score: doc.score,
            })
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap());
        hits.truncate(fetch_k);
        Ok(hits)
    }

    async fn fetch_siblings(
        &self,
        doc_id: &str,
        _dataset: SourceType,
        position: usize,
        window: usize,
        scope: &ScopeContext,
    ) -> Result<Vec<Chunk>> {
        Ok(self
            .corpus
            .iter()
            .filter(|doc| doc.chunk.doc_id == doc_id)
            .filter(|doc| scope.admits(&doc.visibility))
            .filter(|doc| {
                doc.chunk.position != position
                    && doc.chunk.position >= position.saturating_sub(window)
                    && doc.chunk.position <= position + window
            })
            .map(|doc| doc.chunk.clone())
            .collect())
    }

    fn name(&self) -> &'static str {
        "mock-lexical"
    }
}

// ============================================================================
// Vector Store
// ============================================================================

pub struct MockVectorStore {
    pub corpus: Vec<MockDoc>,
    pub calls: AtomicU64,
}

impl MockVectorStore {
    pub fn new(corpus: Vec<MockDoc>) -> Self {
        Self {
            corpus,
            calls: AtomicU64::new(0),
        }
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VectorStore for MockVectorStore {
    async fn search(
        &self,
        _embedding: &[f32],
        dataset: SourceType,
        fetch_k: usize,
        scope: &ScopeContext,
    ) -> Result<Vec<ScoredChunk>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut hits: Vec<ScoredChunk> = self
            .corpus
            .iter()
            .filter(|doc| doc.chunk.source_type == dataset)
            .filter(|doc| scope.admits(&doc.visibility))
            .map(|doc| ScoredChunk {
                chunk: doc.chunk.clone(),
                score: doc.score,
            })
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap());
        hits.truncate(fetch_k);
        Ok(hits)
    }

    fn name(&self) -> &'static str {
        "mock-vector"
    }
}

// ============================================================================
// Graph Store
// ============================================================================

pub struct EmptyGraphStore;

#[async_trait]
impl GraphStore for EmptyGraphStore {
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
        _limit: usize,
        _scope: &ScopeContext,
    ) -> Result<Vec<CoMentionDoc>> {
        Ok(Vec::new())
    }

    async fn run_query(
        &self,
        _query: &str,
        _params: serde_json::Value,
    ) -> Result<Vec<serde_json::Value>> {
        Ok(Vec::new())
    }

    fn name(&self) -> &'static str {
        "mock-graph"
    }
}

// ============================================================================
// Embedder
// ============================================================================

pub struct HashEmbedder;

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        // Deterministic pseudo-embedding from byte sums
        let mut v = vec![0.0_f32; 8];
        for (i, b) in text.bytes().enumerate() {
            v[i % 8] += b as f32 / 255.0;
        }
        Ok(v)
    }

    fn dimensions(&self) -> usize {
        8
    }

    fn model(&self) -> &str {
        "hash-embedder"
    }
}

// ============================================================================
// LLM
// ============================================================================

/// Scripted LLM: the first rule whose needle appears in the prompt wins.
/// Prompts matching no rule get an empty completion.
pub struct ScriptedLlm {
    rules: Vec<(String, String)>,
    pub calls: AtomicU64,
}

impl ScriptedLlm {
    pub fn new(rules: Vec<(&str, &str)>) -> Self {
        Self {
            rules: rules
                .into_iter()
                .map(|(needle, response)| (needle.to_string(), response.to_string()))
                .collect(),
            calls: AtomicU64::new(0),
        }
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    async fn generate(&self, request: &GenerateRequest) -> Result<LlmResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let text = self
            .rules
            .iter()
            .find(|(needle, _)| request.prompt.contains(needle))
            .map(|(_, response)| response.clone())
            .unwrap_or_default();
        Ok(LlmResponse {
            text,
            usage: TokenUsage {
                prompt_tokens: 20,
                output_tokens: 30,
            },
        })
    }

    fn id(&self) -> &str {
        "scripted"
    }
}

// ============================================================================
// Research Providers
// ============================================================================

/// Deep-research provider that counts invocations.
pub struct CountingResearchProvider {
    id: String,
    pub calls: Arc<AtomicU64>,
}

impl CountingResearchProvider {
    pub fn new(id: &str) -> (Self, Arc<AtomicU64>) {
        let calls = Arc::new(AtomicU64::new(0));
        (
            Self {
                id: id.to_string(),
                calls: Arc::clone(&calls),
            },
            calls,
        )
    }
}

#[async_trait]
impl ResearchProvider for CountingResearchProvider {
    async fn research(&self, query: &str, _options: &ResearchOptions) -> Result<ResearchOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ResearchOutput {
            text: format!("sintese de {} para '{}'", self.id, query),
            sources: vec![ResearchSource {
                title: format!("fonte de {}", self.id),
                url: Some(format!("https://{}.example/artigo", self.id)),
                snippet: "trecho".to_string(),
                relevance: 0.6,
            }],
            thinking_steps: vec![],
        })
    }

    fn id(&self) -> &str {
        &self.id
    }
}

/// Always-failing lexical index, for degradation tests.
pub struct FailingLexicalIndex;

#[async_trait]
impl LexicalIndex for FailingLexicalIndex {
    async fn search(
        &self,
        _query: &str,
        _dataset: SourceType,
        _fetch_k: usize,
        _scope: &ScopeContext,
    ) -> Result<Vec<ScoredChunk>> {
        Err(CoreError::Upstream("index unavailable".to_string()))
    }

    async fn fetch_siblings(
        &self,
        _doc_id: &str,
        _dataset: SourceType,
        _position: usize,
        _window: usize,
        _scope: &ScopeContext,
    ) -> Result<Vec<Chunk>> {
        Err(CoreError::Upstream("index unavailable".to_string()))
    }

    fn name(&self) -> &'static str {
        "failing-lexical"
    }
}
