//! Retrievers, fusion, and the retrieval pipeline orchestrator.
//!
//! # Module Structure
//!
//! - [`lexical`] - BM25 keyword retrieval over per-dataset indices
//! - [`vector`] - dense (+ optional sparse) similarity retrieval
//! - [`graph`] - graph-as-retriever over entity mentions
//! - [`fusion`] - weighted Reciprocal Rank Fusion
//! - [`pipeline`] - the stage-sequencing orchestrator behind `Retrieve`
//!
//! Retrievers are interchangeable behind the [`Retriever`] capability
//! interface; the orchestrator fans them out concurrently, each under its
//! own soft deadline, and fuses whatever came back.

use std::time::Duration;

use async_trait::async_trait;

use crate::stores::ScoredChunk;
use crate::types::{Result, RetrieverKind, ScopeContext, SourceType};

/// Weighted RRF fusion.
pub mod fusion;
/// Graph-as-retriever.
pub mod graph;
/// Lexical retriever.
pub mod lexical;
/// The pipeline orchestrator.
pub mod pipeline;
/// Vector retriever.
pub mod vector;

/// One retrieval request as seen by an individual retriever.
#[derive(Debug, Clone)]
pub struct RetrievalQuery {
    /// Query text. May be empty for graph-only retrieval.
    pub text: String,
    /// Alternate embedding input (HyDE concatenation); falls back to `text`.
    pub embed_text: Option<String>,
    /// Datasets to fan out over.
    pub datasets: Vec<SourceType>,
    /// Per-variant fetch budget.
    pub fetch_k: usize,
    /// Visibility frame.
    pub scope: ScopeContext,
}

/// Capability interface every retriever implements.
#[async_trait]
pub trait Retriever: Send + Sync {
    /// Run the query, returning scored chunks. Per-dataset failures inside a
    /// retriever degrade to partial results; an error means the whole
    /// retriever produced nothing.
    async fn retrieve(&self, query: &RetrievalQuery) -> Result<Vec<ScoredChunk>>;

    /// Which fusion slot this retriever feeds.
    fn kind(&self) -> RetrieverKind;

    /// Soft deadline for one invocation.
    fn timeout(&self) -> Duration;
}
