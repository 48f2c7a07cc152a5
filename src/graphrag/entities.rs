//! Entity seed extraction from free text.
//!
//! Seeds are produced by deterministic pattern matching — statute articles,
//! súmulas, CNJ process numbers — plus normalized matching of capitalized
//! name spans. Seeds feed graph lookups; nothing here talks to a store.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::stores::EntitySeed;
use crate::types::EntityKind;

static ARTICLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bart(?:igo)?\.?\s*(\d+(?:-[A-Z])?)").expect("static pattern"));

static SUMULA_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bs[úu]mula\s+(?:vinculante\s+)?n?[ºo°]?\.?\s*(\d+)").expect("static pattern")
});

static CNJ_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\d{7}-\d{2}\.\d{4}\.\d\.\d{2}\.\d{4}").expect("static pattern"));

static NAME_RE: Lazy<Regex> = Lazy::new(|| {
    // Two or more consecutive capitalized words, allowing Portuguese
    // connectives between them ("Banco do Brasil").
    Regex::new(r"\b([A-ZÀ-Ü][\wÀ-ü]+(?:\s+(?:d[aeo]s?\s+)?[A-ZÀ-Ü][\wÀ-ü]+)+)")
        .expect("static pattern")
});

/// Extract candidate entity seeds from free text, deduplicated, in order of
/// first appearance.
pub fn extract_seeds(text: &str) -> Vec<EntitySeed> {
    let mut seeds: Vec<EntitySeed> = Vec::new();

    let mut push = |seed: EntitySeed| {
        if !seeds.iter().any(|s| s.text == seed.text) {
            seeds.push(seed);
        }
    };

    for capture in ARTICLE_RE.captures_iter(text) {
        push(EntitySeed {
            text: format!("art. {}", capture[1].to_lowercase()),
            kind: Some(EntityKind::StatuteArticle),
        });
    }

    for capture in SUMULA_RE.captures_iter(text) {
        push(EntitySeed {
            text: format!("súmula {}", &capture[1]),
            kind: Some(EntityKind::Sumula),
        });
    }

    for m in CNJ_RE.find_iter(text) {
        push(EntitySeed {
            text: m.as_str().to_string(),
            kind: Some(EntityKind::Process),
        });
    }

    for capture in NAME_RE.captures_iter(text) {
        let name = capture[1].trim().to_string();
        // Skip spans already captured by the structured patterns
        if ARTICLE_RE.is_match(&name) || SUMULA_RE.is_match(&name) {
            continue;
        }
        push(EntitySeed {
            text: name.to_lowercase(),
            kind: None,
        });
    }

    seeds
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracts_statute_article() {
        let seeds = extract_seeds("Art. 319 do CPC exige requisitos");
        assert!(seeds
            .iter()
            .any(|s| s.text == "art. 319" && s.kind == Some(EntityKind::StatuteArticle)));
    }

    #[test]
    fn test_extracts_sumula_variants() {
        let seeds = extract_seeds("conforme Súmula nº 331 do TST e súmula vinculante 13");
        let sumulas: Vec<&EntitySeed> = seeds
            .iter()
            .filter(|s| s.kind == Some(EntityKind::Sumula))
            .collect();
        assert_eq!(sumulas.len(), 2);
        assert_eq!(sumulas[0].text, "súmula 331");
        assert_eq!(sumulas[1].text, "súmula 13");
    }

    #[test]
    fn test_extracts_cnj_process_number() {
        let seeds = extract_seeds("processo 1234567-89.2023.8.26.0100 em curso");
        assert!(seeds
            .iter()
            .any(|s| s.kind == Some(EntityKind::Process)
                && s.text == "1234567-89.2023.8.26.0100"));
    }

    #[test]
    fn test_extracts_capitalized_names() {
        let seeds = extract_seeds("contrato entre Banco do Brasil e Construtora Alfa");
        assert!(seeds.iter().any(|s| s.text == "banco do brasil"));
        assert!(seeds.iter().any(|s| s.text == "construtora alfa"));
    }

    #[test]
    fn test_deduplicates_repeated_mentions() {
        let seeds = extract_seeds("Art. 5 e novamente art. 5");
        let articles: Vec<&EntitySeed> = seeds
            .iter()
            .filter(|s| s.kind == Some(EntityKind::StatuteArticle))
            .collect();
        assert_eq!(articles.len(), 1);
    }

    #[test]
    fn test_plain_text_yields_no_structured_seeds() {
        let seeds = extract_seeds("responsabilidade civil por ato de terceiro");
        assert!(seeds.iter().all(|s| s.kind.is_none()));
    }
}
