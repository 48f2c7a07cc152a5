//! Corrective RAG (CRAG) gate.
//!
//! Evaluates fused retrieval results against configurable score thresholds,
//! classifies the evidence level, and plans an ordered ladder of corrective
//! strategies when evidence is weak. The ladder order is fixed: aggressive
//! hybrid, multi-query, HyDE, then combined aggressive multi-query, with
//! dataset expansion as the last resort for insufficient evidence. A strategy
//! runs at most once per request; retries are bounded by `crag_max_retries`.

use serde::{Deserialize, Serialize};

use crate::config::RagConfig;
use crate::types::{EvidenceLevel, RetrievalResult};

// ============================================================================
// Gate Configuration
// ============================================================================

/// Thresholds and strategy knobs for the gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CragConfig {
    /// Minimum acceptable score for the top result.
    pub min_best_score: f32,
    /// Minimum acceptable average over the top 3 results.
    pub min_avg_score: f32,
    /// Best-score threshold for strong evidence.
    pub strong_best_threshold: f32,
    /// Average threshold for strong evidence.
    pub strong_avg_threshold: f32,
    /// Maximum corrective retry loops.
    pub max_retries: usize,
    pub multi_query_max: usize,
    pub aggressive_top_k_multiplier: f32,
    pub aggressive_lexical_weight: f32,
    pub aggressive_vector_weight: f32,
}

impl CragConfig {
    pub fn from_config(config: &RagConfig) -> Self {
        Self {
            min_best_score: config.crag_min_best_score,
            min_avg_score: config.crag_min_avg_score,
            strong_best_threshold: config.crag_strong_best_threshold,
            strong_avg_threshold: config.crag_strong_avg_threshold,
            max_retries: config.crag_max_retries,
            multi_query_max: config.multi_query_max,
            aggressive_top_k_multiplier: config.crag_aggressive_top_k_multiplier,
            aggressive_lexical_weight: config.crag_aggressive_lexical_weight,
            aggressive_vector_weight: config.crag_aggressive_vector_weight,
        }
    }
}

// ============================================================================
// Evaluation
// ============================================================================

/// Result of one gate evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CragEvaluation {
    /// Whether the evidence passes the minimum thresholds.
    pub gate_passed: bool,
    pub evidence_level: EvidenceLevel,
    pub best_score: f32,
    pub avg_top3: f32,
    pub result_count: usize,
    /// Human-readable explanation for the audit trail.
    pub reason: String,
}

// ============================================================================
// Retry Strategies
// ============================================================================

/// Corrective strategies, in their fixed ladder order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    /// Widen top_k by 1.5x. Reserved for moderate evidence.
    ExpandTopK,
    /// Aggressive hybrid weights with a larger top_k.
    AggressiveHybrid,
    /// Paraphrased variants, RRF-merged.
    MultiQuery,
    /// Hypothetical-document expansion.
    Hyde,
    /// Multi-query combined with aggressive parameters.
    AggressiveMultiQuery,
    /// Widen the dataset list to every source type.
    ExpandSources,
}

impl RetryStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ExpandTopK => "expand_top_k",
            Self::AggressiveHybrid => "aggressive_hybrid",
            Self::MultiQuery => "multi_query",
            Self::Hyde => "hyde",
            Self::AggressiveMultiQuery => "aggressive_multi_query",
            Self::ExpandSources => "expand_sources",
        }
    }
}

/// Concrete parameters for one retry attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryParameters {
    pub strategy: RetryStrategy,
    pub top_k: usize,
    pub lexical_weight: f32,
    pub vector_weight: f32,
    pub use_multi_query: bool,
    pub multi_query_count: usize,
    pub use_hyde: bool,
    /// Widen the dataset list to the full closed set.
    pub expand_datasets: bool,
}

// ============================================================================
// The Gate
// ============================================================================

/// Evidence quality assessment and retry planning.
pub struct CragGate {
    config: CragConfig,
}

impl CragGate {
    pub fn new(config: CragConfig) -> Self {
        Self { config }
    }

    /// Evaluate results against the thresholds.
    ///
    /// Scores are the results' gate scores (rerank when present, best
    /// per-retriever score otherwise), assumed sorted descending by the
    /// fusion stage.
    pub fn evaluate(&self, results: &[RetrievalResult]) -> CragEvaluation {
        if results.is_empty() {
            return CragEvaluation {
                gate_passed: false,
                evidence_level: EvidenceLevel::Insufficient,
                best_score: 0.0,
                avg_top3: 0.0,
                result_count: 0,
                reason: "no results returned from search".to_string(),
            };
        }

        let scores: Vec<f32> = results.iter().map(|r| r.gate_score()).collect();
        let best_score = scores.iter().cloned().fold(0.0_f32, f32::max);
        let top3 = &scores[..scores.len().min(3)];
        let avg_top3 = top3.iter().sum::<f32>() / top3.len() as f32;

        let evidence_level = self.classify(best_score, avg_top3);
        let gate_passed = best_score >= self.config.min_best_score
            && avg_top3 >= self.config.min_avg_score;

        CragEvaluation {
            gate_passed,
            evidence_level,
            best_score,
            avg_top3,
            result_count: results.len(),
            reason: format!(
                "best={:.3} (threshold={:.2}), avg_top3={:.3} (threshold={:.2})",
                best_score, self.config.min_best_score, avg_top3, self.config.min_avg_score
            ),
        }
    }

    fn classify(&self, best_score: f32, avg_top3: f32) -> EvidenceLevel {
        if best_score >= self.config.strong_best_threshold
            && avg_top3 >= self.config.strong_avg_threshold
        {
            return EvidenceLevel::Strong;
        }
        if best_score >= self.config.min_best_score && avg_top3 >= self.config.min_avg_score {
            return EvidenceLevel::Moderate;
        }
        if best_score > 0.0 || avg_top3 > 0.0 {
            return EvidenceLevel::Low;
        }
        EvidenceLevel::Insufficient
    }

    /// Whether another corrective loop should run.
    pub fn should_retry(&self, evaluation: &CragEvaluation, current_round: usize) -> bool {
        if evaluation.gate_passed {
            return false;
        }
        if current_round >= self.config.max_retries {
            return false;
        }
        // A second empty round will not improve on an empty first round
        if evaluation.result_count == 0 && current_round > 0 {
            return false;
        }
        evaluation.evidence_level.requires_correction()
            || evaluation.evidence_level == EvidenceLevel::Moderate
    }

    /// The ordered strategy ladder for an evidence level, excluding
    /// strategies already used this request.
    pub fn strategies(
        &self,
        evidence_level: EvidenceLevel,
        base_top_k: usize,
        used: &[RetryStrategy],
    ) -> Vec<RetryParameters> {
        let already = |s: RetryStrategy| used.contains(&s);
        let mut ladder = Vec::new();

        match evidence_level {
            EvidenceLevel::Strong => return ladder,
            EvidenceLevel::Moderate => {
                if !already(RetryStrategy::ExpandTopK) {
                    ladder.push(RetryParameters {
                        strategy: RetryStrategy::ExpandTopK,
                        top_k: ((base_top_k as f32 * 1.5) as usize).min(50),
                        lexical_weight: 0.5,
                        vector_weight: 0.5,
                        use_multi_query: false,
                        multi_query_count: 0,
                        use_hyde: false,
                        expand_datasets: false,
                    });
                }
                return ladder;
            }
            EvidenceLevel::Low | EvidenceLevel::Insufficient => {}
        }

        let aggressive_top_k =
            ((base_top_k as f32 * self.config.aggressive_top_k_multiplier) as usize).min(50);

        if !already(RetryStrategy::AggressiveHybrid) {
            ladder.push(RetryParameters {
                strategy: RetryStrategy::AggressiveHybrid,
                top_k: aggressive_top_k,
                lexical_weight: self.config.aggressive_lexical_weight,
                vector_weight: self.config.aggressive_vector_weight,
                use_multi_query: false,
                multi_query_count: 0,
                use_hyde: false,
                expand_datasets: false,
            });
        }
        if !already(RetryStrategy::MultiQuery) {
            ladder.push(RetryParameters {
                strategy: RetryStrategy::MultiQuery,
                top_k: base_top_k,
                lexical_weight: 0.5,
                vector_weight: 0.5,
                use_multi_query: true,
                multi_query_count: self.config.multi_query_max,
                use_hyde: false,
                expand_datasets: false,
            });
        }
        if !already(RetryStrategy::Hyde) {
            ladder.push(RetryParameters {
                strategy: RetryStrategy::Hyde,
                top_k: base_top_k,
                lexical_weight: 0.4,
                vector_weight: 0.6,
                use_multi_query: false,
                multi_query_count: 0,
                use_hyde: true,
                expand_datasets: false,
            });
        }

        if evidence_level == EvidenceLevel::Insufficient {
            if !already(RetryStrategy::AggressiveMultiQuery) && !already(RetryStrategy::MultiQuery)
            {
                ladder.push(RetryParameters {
                    strategy: RetryStrategy::AggressiveMultiQuery,
                    top_k: aggressive_top_k,
                    lexical_weight: self.config.aggressive_lexical_weight,
                    vector_weight: self.config.aggressive_vector_weight,
                    use_multi_query: true,
                    multi_query_count: self.config.multi_query_max,
                    use_hyde: false,
                    expand_datasets: false,
                });
            }
            if !already(RetryStrategy::ExpandSources) {
                ladder.push(RetryParameters {
                    strategy: RetryStrategy::ExpandSources,
                    top_k: aggressive_top_k,
                    lexical_weight: 0.5,
                    vector_weight: 0.5,
                    use_multi_query: false,
                    multi_query_count: 0,
                    use_hyde: false,
                    expand_datasets: true,
                });
            }
        }

        ladder
    }

    /// Pick the next strategy for this round, or `None` when the ladder is
    /// exhausted.
    pub fn next_strategy(
        &self,
        evaluation: &CragEvaluation,
        base_top_k: usize,
        used: &[RetryStrategy],
        current_round: usize,
    ) -> Option<RetryParameters> {
        if !self.should_retry(evaluation, current_round) {
            return None;
        }
        self.strategies(evaluation.evidence_level, base_top_k, used)
            .into_iter()
            .next()
    }

    pub fn max_retries(&self) -> usize {
        self.config.max_retries
    }
}

// ============================================================================
// Tests
// ============================================================================
