//! Query expansion: conversational rewrite, HyDE, and multi-query variants.
//!
//! Every LLM-backed operation charges the request budget meter through its
//! [`LlmSession`]; when the budget is spent, expansion degrades to heuristic
//! variants (keyword extraction, a closed legal-abbreviation table, the
//! current year) instead of failing the request. Results are cached with TTL,
//! keyed by normalized input.

use std::sync::Arc;
use std::time::Duration;

use chrono::Datelike;
use regex::Regex;

use crate::cache::TtlCache;
use crate::llm::LlmSession;
use crate::types::Result;

/// The outcome of expanding one query.
#[derive(Debug, Clone, Default)]
pub struct Expansion {
    /// Standalone rewrite of the latest conversational turn.
    pub rewritten: Option<String>,
    /// HyDE hypothetical document.
    pub hypothetical: Option<String>,
    /// Query variants for multi-query retrieval. Always includes the
    /// original query first.
    pub variants: Vec<String>,
}

/// Closed table of common Brazilian legal abbreviations.
const LEGAL_ABBREVIATIONS: &[(&str, &str)] = &[
    (r"\bSTF\b", "Supremo Tribunal Federal"),
    (r"\bSTJ\b", "Superior Tribunal de Justica"),
    (r"\bTST\b", "Tribunal Superior do Trabalho"),
    (r"\bCPC\b", "Codigo de Processo Civil"),
    (r"\bCPP\b", "Codigo de Processo Penal"),
    (r"\bCC\b", "Codigo Civil"),
    (r"\bCP\b", "Codigo Penal"),
    (r"\bCLT\b", "Consolidacao das Leis do Trabalho"),
    (r"\bCF\b", "Constituicao Federal"),
    (r"\bCDC\b", "Codigo de Defesa do Consumidor"),
    (r"\bOAB\b", "Ordem dos Advogados do Brasil"),
];

/// Configuration slice for the expansion service.
#[derive(Debug, Clone)]
pub struct ExpansionConfig {
    pub hyde_model: String,
    pub hyde_max_tokens: u32,
    pub multi_query_max: usize,
    pub multi_query_model: String,
    pub rewrite_model: String,
}

/// Query expansion service with process-scope caches.
pub struct QueryExpansionService {
    config: ExpansionConfig,
    hyde_cache: Arc<TtlCache<String>>,
    variant_cache: Arc<TtlCache<Vec<String>>>,
    rewrite_cache: Arc<TtlCache<String>>,
}

impl QueryExpansionService {
    pub fn new(config: ExpansionConfig, cache_max_entries: usize, cache_ttl: Duration) -> Self {
        Self {
            config,
            hyde_cache: Arc::new(TtlCache::new(cache_max_entries, cache_ttl)),
            variant_cache: Arc::new(TtlCache::new(cache_max_entries, cache_ttl)),
            rewrite_cache: Arc::new(TtlCache::new(cache_max_entries, cache_ttl)),
        }
    }

    /// Run every expansion the budget allows: conversational rewrite,
    /// hypothetical document, and paraphrased variants.
    ///
    /// Individual operations degrade independently; the returned variants
    /// always include the (possibly rewritten) query first.
    pub async fn expand(
        &self,
        query: &str,
        history: &[String],
        summary: Option<&str>,
        session: &LlmSession,
    ) -> Expansion {
        let rewritten = self
            .rewrite_query(query, history, summary, session)
            .await
            .unwrap_or_default();
        let effective = rewritten.as_deref().unwrap_or(query);

        let hypothetical = if session.can_afford_call() {
            self.generate_hypothetical_document(effective, session)
                .await
                .ok()
        } else {
            None
        };

        let variants = self
            .generate_query_variants(effective, self.config.multi_query_max, session)
            .await;

        Expansion {
            rewritten,
            hypothetical,
            variants,
        }
    }

    /// Rewrite the latest conversational turn into a standalone search query.
    ///
    /// Returns `None` when there is no history to resolve against or the
    /// budget does not allow a call.
    pub async fn rewrite_query(
        &self,
        query: &str,
        history: &[String],
        summary: Option<&str>,
        session: &LlmSession,
    ) -> Result<Option<String>> {
        if history.is_empty() {
            return Ok(None);
        }
        if !session.can_afford_call() {
            return Ok(None);
        }

        let cache_key = TtlCache::<String>::compute_key(
            "rewrite",
            &format!("{}|{}", query, history.join("|")),
        );
        if let Some(cached) = self.rewrite_cache.get(&cache_key) {
            return Ok(Some(cached));
        }

        let context = summary
            .map(|s| format!("Resumo da conversa:\n{}\n\n", s))
            .unwrap_or_default();
        let turns = history.join("\n");
        let prompt = format!(
            "{context}Historico:\n{turns}\n\nReescreva a ultima pergunta como uma consulta de \
             busca juridica autonoma, preservando artigos, sumulas e numeros de processo. \
             Pergunta: {query}\n\nConsulta reescrita:"
        );

        let response = session
            .generate(&prompt, &self.config.rewrite_model, 150, 0.1)
            .await?;
        let rewritten = response.text.trim().to_string();
        if rewritten.is_empty() {
            return Ok(None);
        }

        self.rewrite_cache.set(&cache_key, rewritten.clone());
        Ok(Some(rewritten))
    }

    /// Generate a HyDE hypothetical document for the query.
    pub async fn generate_hypothetical_document(
        &self,
        query: &str,
        session: &LlmSession,
    ) -> Result<String> {
        let cache_key = TtlCache::<String>::compute_key("hyde", query);
        if let Some(cached) = self.hyde_cache.get(&cache_key) {
            return Ok(cached);
        }

        let prompt = format!(
            "Escreva um paragrafo tecnico-juridico que responderia diretamente a consulta \
             abaixo, como se fosse trecho de doutrina ou decisao. Nao mencione que e hipotetico.\n\n\
             Consulta: {query}\n\nTexto:"
        );
        let response = session
            .generate(
                &prompt,
                &self.config.hyde_model,
                self.config.hyde_max_tokens,
                0.3,
            )
            .await?;

        let hypothetical = response.text.trim().to_string();
        self.hyde_cache.set(&cache_key, hypothetical.clone());
        Ok(hypothetical)
    }

    /// Generate up to `count` paraphrased variants of the query.
    ///
    /// The original query is always first. Falls back to heuristic variants
    /// when the budget is spent or the LLM call fails.
    pub async fn generate_query_variants(
        &self,
        query: &str,
        count: usize,
        session: &LlmSession,
    ) -> Vec<String> {
        let count = count.min(self.config.multi_query_max);
        if count == 0 {
            return vec![query.to_string()];
        }

        let cache_key = TtlCache::<Vec<String>>::compute_key("multi_query", query);
        if let Some(cached) = self.variant_cache.get(&cache_key) {
            return cached;
        }

        let generated = if session.can_afford_call() {
            self.llm_variants(query, count, session).await
        } else {
            tracing::debug!("multi-query budget spent, using heuristic variants");
            Vec::new()
        };

        let mut variants = vec![query.to_string()];
        for v in generated {
            let v = v.trim().to_string();
            if !v.is_empty() && !variants.iter().any(|e| e.eq_ignore_ascii_case(&v)) {
                variants.push(v);
            }
        }
        if variants.len() == 1 {
            for v in self.heuristic_variants(query, count) {
                if !variants.iter().any(|e| e.eq_ignore_ascii_case(&v)) {
                    variants.push(v);
                }
            }
        }
        variants.truncate(count + 1);

        self.variant_cache.set(&cache_key, variants.clone());
        variants
    }

    async fn llm_variants(&self, query: &str, count: usize, session: &LlmSession) -> Vec<String> {
        let prompt = format!(
            "Gere {count} reformulacoes da consulta juridica abaixo, uma por linha, \
             variando vocabulario mas preservando citacoes legais.\n\nConsulta: {query}\n\n\
             Reformulacoes:"
        );
        match session
            .generate(&prompt, &self.config.multi_query_model, 200, 0.7)
            .await
        {
            Ok(response) => response
                .text
                .lines()
                .map(|line| {
                    line.trim()
                        .trim_start_matches(|c: char| c.is_ascii_digit() || c == '.' || c == '-')
                        .trim()
                        .to_string()
                })
                .filter(|line| !line.is_empty())
                .take(count)
                .collect(),
            Err(e) => {
                tracing::warn!(error = %e, "multi-query generation failed, falling back to heuristics");
                Vec::new()
            }
        }
    }

    /// Simple deterministic variants used when no LLM call is possible.
    pub fn heuristic_variants(&self, query: &str, count: usize) -> Vec<String> {
        let mut variants = Vec::new();

        // Keywords only (stopword-filtered)
        let tokens: Vec<String> = crate::compress::extract_keywords(query)
            .into_iter()
            .take(8)
            .collect();
        if !tokens.is_empty() {
            let keywords = tokens.join(" ");
            if !keywords.eq_ignore_ascii_case(query) {
                variants.push(keywords);
            }
        }

        // Question mark removed
        if query.contains('?') {
            let plain = query.replace('?', "").trim().to_string();
            if !plain.eq_ignore_ascii_case(query) {
                variants.push(plain);
            }
        }

        // Expanded legal abbreviations
        let expanded = expand_legal_abbreviations(query);
        if !expanded.eq_ignore_ascii_case(query) {
            variants.push(expanded);
        }

        // Current year appended, for recency-sensitive phrasing
        if variants.len() < count {
            variants.push(format!("{} {}", query, chrono::Utc::now().year()));
        }

        variants.truncate(count);
        variants
    }

    /// Cache statistics for all expansion caches.
    pub fn cache_stats(&self) -> (crate::cache::CacheStats, crate::cache::CacheStats) {
        (self.hyde_cache.stats(), self.variant_cache.stats())
    }

    pub fn clear_caches(&self) {
        self.hyde_cache.clear();
        self.variant_cache.clear();
        self.rewrite_cache.clear();
    }
}

/// Expand common Brazilian legal abbreviations in place.
pub fn expand_legal_abbreviations(text: &str) -> String {
    let mut result = text.to_string();
    for (abbrev, full) in LEGAL_ABBREVIATIONS {
        let re = Regex::new(abbrev).expect("static pattern");
        result = re.replace_all(&result, *full).into_owned();
    }
    result
}

// ============================================================================
// Tests
// ============================================================================
