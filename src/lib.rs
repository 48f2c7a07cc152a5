//! # LexRAG — Legal Retrieval Core
//!
//! A retrieval-augmented generation core for legal-domain AI platforms. Given
//! a natural-language legal query, it produces a ranked, compressed,
//! graph-enriched, auditable evidence context for downstream LLM generators.
//!
//! ## Overview
//!
//! The core combines:
//!
//! - **Hybrid multi-store retrieval** - lexical (BM25 index), vector
//!   (dense + optional sparse), and labeled-property-graph sources merged
//!   with weighted Reciprocal Rank Fusion
//! - **Corrective retrieval (CRAG)** - evidence quality gating with a
//!   bounded ladder of fallback strategies (aggressive hybrid, multi-query,
//!   HyDE)
//! - **Cognitive decomposition (CogGRAG)** - sub-question trees with
//!   per-node evidence, conflict detection, and bottom-up reasoning
//! - **Graph enrichment** - entity seeding, bounded traversal, addressable
//!   path/triple evidence, and a deterministic risk-scan suite
//! - **Agentic orchestration** - a streaming loop exposing retrieval and
//!   deep-research providers as tools to an external planner
//!
//! Everything upstream (HTTP endpoints, ingestion, auth) and downstream
//! (drafting, chat) are external collaborators; this crate only exposes and
//! consumes well-defined interfaces to them.
//!
//! ## Entry points
//!
//! ```rust,ignore
//! use lexrag::{CoreContext, RagConfig, SearchOptions};
//! use lexrag::types::ScopeContext;
//!
//! let config = RagConfig::from_env()?;
//! let ctx = CoreContext::new(config, stores, providers)?;
//!
//! // Retrieve: the full pipeline, one call, one complete result
//! let result = ctx
//!     .retrieve("Art. 319 CPC petição inicial requisitos", 10, None, scope, options)
//!     .await?;
//!
//! // Reason: cognitive decomposition over the pipeline
//! let reasoned = ctx.reason("requisitos e vícios da petição inicial", options).await?;
//!
//! // AgentStream: tool-driven research loop emitting typed events
//! let mut events = ctx.agent_stream(request);
//! while let Some(event) = events.next().await { /* ... */ }
//! ```

/// Streaming agentic research orchestrator and its tool registry.
pub mod agent;
/// Pipeline tracing, source attribution, audit records, and budget metering.
pub mod audit;
/// TTL + size bounded in-memory caches shared across requests.
pub mod cache;
/// Cognitive graph RAG: decompose, gather, refine, reason bottom-up.
pub mod cograg;
/// Keyword-guided compression and parent-document chunk expansion.
pub mod compress;
/// Immutable startup configuration and per-request options.
pub mod config;
/// The `CoreContext` owning stores, providers, and caches.
pub mod context;
/// Corrective RAG gate, retry strategies, and corrective orchestration.
pub mod crag;
/// Query expansion: HyDE, multi-query variants, conversational rewrite.
pub mod expansion;
/// Graph evidence: entity seeding, bounded traversal, risk detectors.
pub mod graphrag;
/// LLM provider abstraction with budget-charged, retried generation.
pub mod llm;
/// Cross-encoder / late-interaction / remote reranking.
pub mod rerank;
/// Deep-research provider abstraction.
pub mod research;
/// Retrievers, fusion, and the retrieval pipeline orchestrator.
pub mod retrieval;
/// Store client traits and their OpenSearch / Qdrant / Neo4j implementations.
pub mod stores;
/// Core data model and error types.
pub mod types;

pub use config::{RagConfig, SearchOptions};
pub use context::CoreContext;
pub use types::{CoreError, Result};
