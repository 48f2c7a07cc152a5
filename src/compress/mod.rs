//! Chunk expansion and keyword-guided compression.
//!
//! Expansion pulls adjacent sibling chunks from the parent document, bounded
//! by a per-request extra-chunk cap; adjacent siblings can be merged into one
//! expanded result. Compression keeps the sentences that carry query
//! keywords, preserving the original text in a side field so audit chains
//! can always recover what the store returned.

use std::collections::HashSet;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::stores::LexicalIndex;
use crate::types::{Result, RetrievalResult, ScopeContext};

// ============================================================================
// Keywords & Sentences
// ============================================================================

/// Portuguese stopwords excluded from keyword extraction.
static STOPWORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "para", "com", "sem", "sobre", "entre", "contra", "dentro", "fora", "qual", "como",
        "que", "uma", "umas", "uns", "dos", "das", "por", "mais", "menos", "onde", "quando",
        "porque", "pois", "pela", "pelos", "pelas", "seja", "isso", "esse", "essa", "este",
        "esta", "aquele", "aquela", "seus", "suas", "pelo", "nos", "nas", "aos",
    ]
    .into_iter()
    .collect()
});

static WORD_SPLIT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\W+").expect("static pattern"));

static SENTENCE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^.?!;]+[.?!;]*").expect("static pattern"));

/// Extract query keywords: tokens of length >= 4, stopword-filtered,
/// lowercased.
pub fn extract_keywords(query: &str) -> Vec<String> {
    WORD_SPLIT_RE
        .split(query)
        .map(|t| t.to_lowercase())
        .filter(|t| t.chars().count() >= 4 && !STOPWORDS.contains(t.as_str()))
        .collect()
}

fn split_sentences(text: &str) -> Vec<&str> {
    SENTENCE_RE
        .find_iter(text)
        .map(|m| m.as_str().trim())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Compress text to keyword-bearing sentences within `max_chars`.
///
/// Texts already within budget pass through unchanged. When no sentence
/// carries a keyword, the first two sentences are kept.
pub fn compress_text(text: &str, keywords: &[String], max_chars: usize) -> String {
    let cleaned = text.trim();
    if cleaned.len() <= max_chars {
        return cleaned.to_string();
    }

    let sentences = split_sentences(cleaned);
    let mut selected: Vec<&str> = Vec::new();
    let mut running = 0usize;

    for sentence in &sentences {
        let lower = sentence.to_lowercase();
        if keywords.iter().any(|k| lower.contains(k.as_str())) {
            selected.push(sentence);
            running += sentence.len();
        }
        if running >= max_chars {
            break;
        }
    }

    if selected.is_empty() {
        selected = sentences.into_iter().take(2).collect();
    }

    let mut compressed = selected.join(" ");
    if compressed.len() > max_chars {
        compressed = compressed.chars().take(max_chars).collect();
    }
    compressed
}

// ============================================================================
// Compressor
// ============================================================================

/// Outcome counters for the compression stage.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompressionOutcome {
    pub compressed_count: usize,
    pub chars_saved: usize,
}

/// Compress every over-budget result in place.
///
/// With `preserve_full_text`, the compressed form goes into the result's side
/// field and the chunk text stays intact; otherwise the chunk text itself is
/// replaced.
pub fn compress_results(
    results: &mut [RetrievalResult],
    query: &str,
    max_chars: usize,
    preserve_full_text: bool,
) -> CompressionOutcome {
    let keywords = extract_keywords(query);
    let mut outcome = CompressionOutcome::default();

    for result in results.iter_mut() {
        if result.chunk.text.len() <= max_chars {
            continue;
        }
        let compressed = compress_text(&result.chunk.text, &keywords, max_chars);
        outcome.chars_saved += result.chunk.text.len().saturating_sub(compressed.len());
        outcome.compressed_count += 1;

        if preserve_full_text {
            result.compressed_text = Some(compressed);
        } else {
            result.chunk.text = compressed;
            result.compressed_text = None;
        }
        result.touch("compression");
    }

    outcome
}

// ============================================================================
// Chunk Expander
// ============================================================================

/// Outcome counters for the expansion stage.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExpansionOutcome {
    pub extra_chunks: usize,
    pub merged: usize,
}

/// Sibling-window expansion over the parent documents.
pub struct ChunkExpander {
    index: Arc<dyn LexicalIndex>,
    window: usize,
    max_extra: usize,
    merge_adjacent: bool,
}

impl ChunkExpander {
    pub fn new(
        index: Arc<dyn LexicalIndex>,
        window: usize,
        max_extra: usize,
        merge_adjacent: bool,
    ) -> Self {
        Self {
            index,
            window,
            max_extra,
            merge_adjacent,
        }
    }

    /// Expand results in rank order until the global extra-chunk cap is hit.
    ///
    /// Merged expansion rewrites the result's text to the position-ordered
    /// concatenation of the sibling window; unmerged expansion appends the
    /// siblings as separate results that inherit a slightly discounted fused
    /// score.
    pub async fn expand(
        &self,
        results: &mut Vec<RetrievalResult>,
        scope: &ScopeContext,
    ) -> Result<ExpansionOutcome> {
        let mut outcome = ExpansionOutcome::default();
        if self.window == 0 || self.max_extra == 0 {
            return Ok(outcome);
        }

        let mut seen: HashSet<String> = results
            .iter()
            .map(|r| r.chunk.chunk_uid.clone())
            .collect();
        let mut appended: Vec<RetrievalResult> = Vec::new();

        for result in results.iter_mut() {
            if outcome.extra_chunks >= self.max_extra {
                break;
            }

            let siblings = self
                .index
                .fetch_siblings(
                    &result.chunk.doc_id,
                    result.chunk.source_type,
                    result.chunk.position,
                    self.window,
                    scope,
                )
                .await
                .unwrap_or_else(|e| {
                    tracing::warn!(error = %e, doc_id = %result.chunk.doc_id, "sibling fetch failed");
                    Vec::new()
                });

            let budget = self.max_extra - outcome.extra_chunks;
            let fresh: Vec<_> = siblings
                .into_iter()
                .filter(|s| !seen.contains(&s.chunk_uid))
                .take(budget)
                .collect();
            if fresh.is_empty() {
                continue;
            }

            outcome.extra_chunks += fresh.len();
            for sibling in &fresh {
                seen.insert(sibling.chunk_uid.clone());
            }

            if self.merge_adjacent {
                // Merge window text in position order around the anchor chunk
                let mut window: Vec<(usize, &str)> = fresh
                    .iter()
                    .map(|s| (s.position, s.text.as_str()))
                    .collect();
                window.push((result.chunk.position, result.chunk.text.as_str()));
                window.sort_by_key(|(position, _)| *position);
                let merged_text = window
                    .into_iter()
                    .map(|(_, text)| text)
                    .collect::<Vec<_>>()
                    .join("\n");
                result.chunk.text = merged_text;
                result.touch("chunk_expansion");
                outcome.merged += 1;
            } else {
                for sibling in fresh {
                    let mut expanded = RetrievalResult::from_hit(
                        sibling,
                        result.score * 0.9,
                        result.retrievers[0],
                    );
                    expanded.fused_score = result.fused_score * 0.9;
                    expanded.touch("chunk_expansion");
                    appended.push(expanded);
                }
            }
        }

        results.extend(appended);
        Ok(outcome)
    }
}

// ============================================================================
// Tests
// ============================================================================
