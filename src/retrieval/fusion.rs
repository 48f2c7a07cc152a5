//! Reciprocal Rank Fusion across retrievers and query variants.
//!
//! `fused_score(chunk) = Σ over lists of weight / (k + rank)`, keyed by chunk
//! identifier. Fusion is associative and commutative over (chunk, rank)
//! pairs, and the output ordering is a deterministic function of the inputs
//! and weights: ties break on the best individual rank, then on chunk
//! identifier ordering.

use std::collections::HashMap;

use crate::stores::ScoredChunk;
use crate::types::{RetrievalResult, RetrieverKind};

/// One ranked list entering fusion: a retriever's hits for one query variant.
#[derive(Debug, Clone)]
pub struct RankedList {
    pub retriever: RetrieverKind,
    pub weight: f32,
    pub hits: Vec<ScoredChunk>,
}

/// Weighted Reciprocal Rank Fusion.
#[derive(Debug, Clone)]
pub struct RrfFusion {
    /// RRF constant (typically 60).
    k: f32,
}

impl Default for RrfFusion {
    fn default() -> Self {
        Self { k: 60.0 }
    }
}

struct FusedEntry {
    result: RetrievalResult,
    best_rank: usize,
}

impl RrfFusion {
    pub fn new(k: f32) -> Self {
        Self { k }
    }

    /// Fuse the ranked lists into a single ordered result list.
    ///
    /// The first occurrence per chunk identifier wins the canonical text and
    /// metadata slot; the retriever set is the union; the per-retriever score
    /// kept is the maximum seen.
    pub fn fuse(&self, lists: &[RankedList]) -> Vec<RetrievalResult> {
        let mut fused: HashMap<String, FusedEntry> = HashMap::new();

        for list in lists {
            for (rank, hit) in list.hits.iter().enumerate() {
                let rrf = list.weight / (self.k + rank as f32 + 1.0);
                match fused.get_mut(&hit.chunk.chunk_uid) {
                    Some(entry) => {
                        entry.result.fused_score += rrf;
                        entry.result.score = entry.result.score.max(hit.score);
                        if !entry.result.retrievers.contains(&list.retriever) {
                            entry.result.retrievers.push(list.retriever);
                            entry.result.touch(&list.retriever.to_string());
                        }
                        entry.best_rank = entry.best_rank.min(rank);
                    }
                    None => {
                        let mut result =
                            RetrievalResult::from_hit(hit.chunk.clone(), hit.score, list.retriever);
                        result.fused_score = rrf;
                        fused.insert(
                            hit.chunk.chunk_uid.clone(),
                            FusedEntry {
                                result,
                                best_rank: rank,
                            },
                        );
                    }
                }
            }
        }

        let mut entries: Vec<FusedEntry> = fused.into_values().collect();
        entries.sort_by(|a, b| {
            b.result
                .fused_score
                .partial_cmp(&a.result.fused_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.best_rank.cmp(&b.best_rank))
                .then(a.result.chunk.chunk_uid.cmp(&b.result.chunk.chunk_uid))
        });
        entries.into_iter().map(|e| e.result).collect()
    }
}

// ============================================================================
// Tests
// ============================================================================
