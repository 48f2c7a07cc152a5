//! Core types used throughout the LexRAG retrieval core.
//!
//! This module contains the common data structures used for:
//! - Chunks, documents, and their visibility attributes
//! - Scope contexts and the tenant/case visibility predicate
//! - Retrieval results and evidence levels
//! - Graph entities, edges, paths, and triples
//! - Error handling

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ============= Source Types / Datasets =============

/// Logical collections a chunk can belong to.
///
/// Each source type maps to a named lexical index and a vector collection.
/// The set is closed; unknown dataset names are an [`CoreError::InvalidRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceType {
    /// Statutes and codified law.
    Statute,
    /// Court decisions and jurisprudence.
    CaseLaw,
    /// Internal administrative filings.
    InternalFiling,
    /// Model briefs and filing templates.
    ModelBrief,
    /// Legal doctrine and commentary.
    Doctrine,
    /// Locally ingested user documents (TTL-bound, case-scoped).
    Local,
}

impl SourceType {
    /// All source types, in canonical order.
    pub fn all() -> &'static [SourceType] {
        &[
            Self::Statute,
            Self::CaseLaw,
            Self::InternalFiling,
            Self::ModelBrief,
            Self::Doctrine,
            Self::Local,
        ]
    }

    /// The globally-visible source types (everything except `Local`).
    pub fn global() -> &'static [SourceType] {
        &[
            Self::Statute,
            Self::CaseLaw,
            Self::InternalFiling,
            Self::ModelBrief,
            Self::Doctrine,
        ]
    }

    /// Named lexical index backing this dataset.
    pub fn lexical_index(&self) -> &'static str {
        match self {
            Self::Statute => "rag-lei",
            Self::CaseLaw => "rag-juris",
            Self::InternalFiling => "rag-sei",
            Self::ModelBrief => "rag-pecas_modelo",
            Self::Doctrine => "rag-doutrina",
            Self::Local => "rag-local",
        }
    }

    /// Named vector collection backing this dataset.
    pub fn vector_collection(&self) -> &'static str {
        match self {
            Self::Statute => "lei",
            Self::CaseLaw => "juris",
            Self::InternalFiling => "sei",
            Self::ModelBrief => "pecas_modelo",
            Self::Doctrine => "doutrina",
            Self::Local => "local_chunks",
        }
    }

    /// Whether results from this dataset receive the legal-domain rerank boost.
    pub fn is_primary_legal(&self) -> bool {
        matches!(self, Self::Statute | Self::CaseLaw)
    }
}

impl FromStr for SourceType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "statute" | "lei" => Ok(Self::Statute),
            "case-law" | "caselaw" | "juris" | "jurisprudencia" => Ok(Self::CaseLaw),
            "internal-filing" | "sei" => Ok(Self::InternalFiling),
            "model-brief" | "pecas" | "pecas_modelo" => Ok(Self::ModelBrief),
            "doctrine" | "doutrina" => Ok(Self::Doctrine),
            "local" => Ok(Self::Local),
            _ => Err(CoreError::InvalidRequest(format!(
                "Unknown dataset: {}. Use: statute, case-law, internal-filing, model-brief, doctrine, local",
                s
            ))),
        }
    }
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Statute => "statute",
            Self::CaseLaw => "case-law",
            Self::InternalFiling => "internal-filing",
            Self::ModelBrief => "model-brief",
            Self::Doctrine => "doctrine",
            Self::Local => "local",
        };
        write!(f, "{}", name)
    }
}

// ============= Scope & Visibility =============

/// Visibility frame of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Scope {
    /// Visible to every tenant (public corpora).
    Global,
    /// Visible only within the owning tenant.
    Private,
    /// Visible to members of the listed groups.
    Group,
    /// Visible only within a specific case.
    LocalCase,
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Global => "global",
            Self::Private => "private",
            Self::Group => "group",
            Self::LocalCase => "local",
        };
        write!(f, "{}", name)
    }
}

/// The visibility frame a query runs under.
///
/// Every retriever applies this context inside its store query; results are
/// never post-filtered for visibility.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeContext {
    /// Tenant issuing the request.
    pub tenant_id: String,
    /// Case the request is associated with, if any. Required for `local` results.
    pub case_id: Option<String>,
    /// Groups the requester belongs to.
    #[serde(default)]
    pub group_ids: Vec<String>,
    /// Whether globally-scoped documents are admissible.
    #[serde(default = "default_true")]
    pub allow_global: bool,
    /// Whether group-scoped documents are admissible.
    #[serde(default)]
    pub allow_group: bool,
}

fn default_true() -> bool {
    true
}

impl ScopeContext {
    /// A global-only scope for a tenant.
    pub fn global(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            case_id: None,
            group_ids: Vec::new(),
            allow_global: true,
            allow_group: false,
        }
    }

    /// Whether a document with the given visibility attributes is admissible.
    ///
    /// Sigilo documents are never admissible. Local-case documents require the
    /// query to carry a matching case id.
    pub fn admits(&self, vis: &DocVisibility) -> bool {
        if vis.sigilo {
            return false;
        }
        match vis.scope {
            Scope::Global => self.allow_global,
            Scope::Private => vis.tenant_id == self.tenant_id,
            Scope::Group => {
                self.allow_group
                    && vis
                        .group_ids
                        .iter()
                        .any(|g| self.group_ids.contains(g))
            }
            Scope::LocalCase => {
                vis.tenant_id == self.tenant_id
                    && match (&self.case_id, &vis.case_id) {
                        (Some(q), Some(d)) => q == d,
                        _ => false,
                    }
            }
        }
    }
}

/// Visibility attributes of a document, inherited by all of its chunks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocVisibility {
    /// Owning tenant.
    pub tenant_id: String,
    /// Visibility scope.
    pub scope: Scope,
    /// Case association for `local` documents.
    pub case_id: Option<String>,
    /// Groups the document is shared with.
    #[serde(default)]
    pub group_ids: Vec<String>,
    /// Whether the document is flagged as shared.
    #[serde(default)]
    pub shared: bool,
    /// Unconditionally hides the document from retrieval.
    #[serde(default)]
    pub sigilo: bool,
}

impl Default for Scope {
    fn default() -> Self {
        Self::Private
    }
}

// ============= Chunks =============

/// Atomic retrieval unit, owned by its parent document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    /// Stable content-addressed identifier (derived from doc id + position).
    pub chunk_uid: String,
    /// Source type of the parent document.
    pub source_type: SourceType,
    /// Dataset tag (lexical index name of the collection it was retrieved from).
    pub dataset: String,
    /// Chunk text.
    pub text: String,
    /// Ordered position within the parent document.
    pub position: usize,
    /// Owning document.
    pub doc_id: String,
    /// Structured metadata.
    #[serde(default)]
    pub metadata: ChunkMetadata,
}

impl Chunk {
    /// Derive the stable chunk identifier for a document position.
    pub fn uid(doc_id: &str, position: usize) -> String {
        let mut hasher = Sha256::new();
        hasher.update(doc_id.as_bytes());
        hasher.update(b"#");
        hasher.update(position.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Content hash of the chunk text, used for dedupe and embedding caches.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.text.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Structured metadata carried by a chunk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkMetadata {
    /// Document or section title.
    #[serde(default)]
    pub title: String,
    /// Formal citation, if known (e.g. "Art. 319, CPC").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub citation: Option<String>,
    /// Publication or decision date.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<DateTime<Utc>>,
    /// Page within the source document.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    /// Issuing court, for case law.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub court: Option<String>,
    /// Article number, for statutes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub article: Option<String>,
    /// Expiry for locally-ingested documents.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_expires_at: Option<DateTime<Utc>>,
    /// Ingest-specific attributes the core passes through untouched.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extra: HashMap<String, serde_json::Value>,
}

// ============= Retrieval Results =============

/// Which retriever produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrieverKind {
    /// BM25-family lexical index.
    Lexical,
    /// Dense (+ optional sparse) vector store.
    Vector,
    /// Labeled property graph.
    Graph,
}

impl std::fmt::Display for RetrieverKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Lexical => "lexical",
            Self::Vector => "vector",
            Self::Graph => "graph",
        };
        write!(f, "{}", name)
    }
}

/// A chunk plus its retrieval-time attributes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalResult {
    /// The retrieved chunk.
    pub chunk: Chunk,
    /// Best per-retriever score.
    pub score: f32,
    /// Fused score after RRF.
    pub fused_score: f32,
    /// Rerank score, when reranking ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rerank_score: Option<f32>,
    /// Retrievers that produced this chunk.
    pub retrievers: Vec<RetrieverKind>,
    /// Compressed text, when compression ran. The original text stays on the
    /// chunk unless full-text preservation is disabled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compressed_text: Option<String>,
    /// Ordered list of pipeline stages that touched this result.
    #[serde(default)]
    pub provenance: Vec<String>,
}

impl RetrievalResult {
    /// Build a fresh result from a single retriever hit.
    pub fn from_hit(chunk: Chunk, score: f32, retriever: RetrieverKind) -> Self {
        Self {
            chunk,
            score,
            fused_score: 0.0,
            rerank_score: None,
            retrievers: vec![retriever],
            compressed_text: None,
            provenance: vec![retriever.to_string()],
        }
    }

    /// The working text for prompt assembly: compressed when available.
    pub fn working_text(&self) -> &str {
        self.compressed_text.as_deref().unwrap_or(&self.chunk.text)
    }

    /// The score downstream stages should rank by.
    pub fn final_score(&self) -> f32 {
        self.rerank_score.unwrap_or(self.fused_score)
    }

    /// The score evidence gates compare against thresholds: the rerank score
    /// when present, otherwise the best per-retriever score. RRF sums live on
    /// a different scale and never reach the gate.
    pub fn gate_score(&self) -> f32 {
        self.rerank_score.unwrap_or(self.score)
    }

    /// Record a stage touching this result.
    pub fn touch(&mut self, stage: &str) {
        self.provenance.push(stage.to_string());
    }
}

// ============= Evidence Levels =============

/// Classification of evidence quality based on retrieval scores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvidenceLevel {
    /// Strong match, high confidence.
    Strong,
    /// Moderate match.
    Moderate,
    /// Weak match, low confidence.
    Low,
    /// Not enough evidence; downstream generators must say they do not know.
    Insufficient,
}

impl EvidenceLevel {
    /// Whether this level requires corrective action.
    pub fn requires_correction(&self) -> bool {
        matches!(self, Self::Low | Self::Insufficient)
    }

    /// Whether this level is acceptable for proceeding.
    pub fn is_acceptable(&self) -> bool {
        matches!(self, Self::Strong | Self::Moderate)
    }
}

impl std::fmt::Display for EvidenceLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Strong => "strong",
            Self::Moderate => "moderate",
            Self::Low => "low",
            Self::Insufficient => "insufficient",
        };
        write!(f, "{}", name)
    }
}

// ============= Graph Types =============

/// Closed legal ontology of graph node types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    StatuteArticle,
    Sumula,
    Court,
    Process,
    Organization,
    Person,
    Company,
    Precedent,
    Claim,
    Evidence,
}

impl FromStr for EntityKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "statute_article" => Ok(Self::StatuteArticle),
            "sumula" => Ok(Self::Sumula),
            "court" => Ok(Self::Court),
            "process" => Ok(Self::Process),
            "organization" => Ok(Self::Organization),
            "person" => Ok(Self::Person),
            "company" => Ok(Self::Company),
            "precedent" => Ok(Self::Precedent),
            "claim" => Ok(Self::Claim),
            "evidence" => Ok(Self::Evidence),
            _ => Err(CoreError::InvalidRequest(format!("Unknown entity kind: {}", s))),
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::StatuteArticle => "statute_article",
            Self::Sumula => "sumula",
            Self::Court => "court",
            Self::Process => "process",
            Self::Organization => "organization",
            Self::Person => "person",
            Self::Company => "company",
            Self::Precedent => "precedent",
            Self::Claim => "claim",
            Self::Evidence => "evidence",
        };
        write!(f, "{}", name)
    }
}

/// A node in the graph store. The core only reads entities; their lifetime is
/// managed by the ingestion layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    /// Stable entity identifier.
    pub entity_id: String,
    /// Ontology type.
    pub kind: EntityKind,
    /// Display name.
    pub name: String,
    /// Explicit tenant tag on the node, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
}

/// Closed set of typed relationships between graph nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EdgeKind {
    Cites,
    Revokes,
    Amends,
    Interprets,
    Applies,
    Represents,
    ParticipatesIn,
    CoMentions,
    Supports,
    Contradicts,
    /// Chunk → entity mention.
    Mentions,
    /// Document → chunk ownership.
    HasChunk,
}

impl EdgeKind {
    /// Relationship type name as stored in the graph.
    pub fn as_rel_type(&self) -> &'static str {
        match self {
            Self::Cites => "CITES",
            Self::Revokes => "REVOKES",
            Self::Amends => "AMENDS",
            Self::Interprets => "INTERPRETS",
            Self::Applies => "APPLIES",
            Self::Represents => "REPRESENTS",
            Self::ParticipatesIn => "PARTICIPATES_IN",
            Self::CoMentions => "CO_MENTIONS",
            Self::Supports => "SUPPORTS",
            Self::Contradicts => "CONTRADICTS",
            Self::Mentions => "MENTIONS",
            Self::HasChunk => "HAS_CHUNK",
        }
    }
}

/// Provenance layer of an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EdgeLayer {
    /// Confirmed by the ingestion pipeline.
    #[default]
    Verified,
    /// Extracted but unconfirmed; included only on explicit opt-in.
    Candidate,
}

/// A typed edge between two entities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEdge {
    /// Source entity id.
    pub source: String,
    /// Target entity id.
    pub target: String,
    /// Relationship type.
    pub kind: EdgeKind,
    /// Provenance layer.
    #[serde(default)]
    pub layer: EdgeLayer,
    /// Weight (co-mention count for `CO_MENTIONS`).
    #[serde(default)]
    pub weight: f64,
    /// Short text previews supporting the edge.
    #[serde(default)]
    pub samples: Vec<String>,
}

/// A traversal path surfaced as addressable evidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphPath {
    /// Stable identifier derived from the node and edge sequence.
    pub path_uid: String,
    /// Entities along the path, in order.
    pub entities: Vec<Entity>,
    /// Edges along the path, in order.
    pub edges: Vec<GraphEdge>,
    /// Short readable rendering of the path.
    pub text: String,
}

impl GraphPath {
    /// Derive the stable path identifier from the node/edge sequence.
    pub fn derive_uid(entity_ids: &[&str], rel_types: &[&str]) -> String {
        let mut hasher = Sha256::new();
        for id in entity_ids {
            hasher.update(id.as_bytes());
            hasher.update(b">");
        }
        for rel in rel_types {
            hasher.update(rel.as_bytes());
            hasher.update(b"|");
        }
        hex::encode(&hasher.finalize()[..12])
    }
}

/// A single (subject, predicate, object) triple rendered for prompts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphTriple {
    pub subject: String,
    pub predicate: String,
    pub object: String,
    /// Readable one-line rendering.
    pub text: String,
}

// ============= Error Types =============

/// Core-wide error type.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Cumulative request cost surpassed a hard cap.
    #[error("Budget exceeded: {0}")]
    BudgetExceeded(String),

    /// A stage or the overall request exceeded its deadline.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// A store or provider call failed.
    #[error("Upstream unavailable: {0}")]
    Upstream(String),

    /// The caller or a parent task aborted the request.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// The request was malformed before any work started.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// No stores were reachable and graph-only retrieval was not requested.
    #[error("No sources available: {0}")]
    NoSources(String),

    /// Retrieval returned nothing and no corrective path remains.
    #[error("No results: {0}")]
    NoResults(String),

    /// Startup-time configuration invariant violated.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Whether the pipeline may continue with partial results after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Upstream(_) | Self::NoResults(_))
    }
}

/// A specialized Result type for LexRAG operations.
pub type Result<T> = std::result::Result<T, CoreError>;

// ============================================================================
// Tests
// ============================================================================
