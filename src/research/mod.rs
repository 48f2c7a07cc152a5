//! Deep-research provider abstraction.
//!
//! Deep-research providers are richer collaborators than plain LLMs: a
//! single call runs a provider-side research loop and returns synthesized
//! text, the sources it consulted, and its intermediate thinking steps. The
//! agentic orchestrator exposes one `search_<provider>` tool per registered
//! provider.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{CoreError, Result};

/// Options forwarded to a research call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResearchOptions {
    /// Preferred recency window in days, when the provider supports it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recency_days: Option<u32>,
    /// Cap on sources the provider should return.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_sources: Option<usize>,
    /// Restrict to legal-domain sources when the provider supports it.
    #[serde(default)]
    pub legal_focus: bool,
}

/// A source consulted during research.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchSource {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub snippet: String,
    /// Provider-assigned relevance, `[0, 1]` where available.
    #[serde(default)]
    pub relevance: f32,
}

/// Result of one research call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchOutput {
    pub text: String,
    pub sources: Vec<ResearchSource>,
    #[serde(default)]
    pub thinking_steps: Vec<String>,
}

/// Deep-research provider contract.
#[async_trait]
pub trait ResearchProvider: Send + Sync {
    async fn research(&self, query: &str, options: &ResearchOptions) -> Result<ResearchOutput>;

    /// Stable provider identifier ("gemini", "perplexity", "openai", ...).
    fn id(&self) -> &str;
}

/// Registry of research providers, immutable after startup.
pub struct ResearchRegistry {
    providers: HashMap<String, Arc<dyn ResearchProvider>>,
}

impl Default for ResearchRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ResearchRegistry {
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    pub fn register(&mut self, provider: Arc<dyn ResearchProvider>) {
        self.providers.insert(provider.id().to_string(), provider);
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn ResearchProvider>> {
        self.providers
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::InvalidRequest(format!("Unknown research provider: {}", id)))
    }

    pub fn provider_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.providers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn has_provider(&self, id: &str) -> bool {
        self.providers.contains_key(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoProvider(&'static str);

    #[async_trait]
    impl ResearchProvider for EchoProvider {
        async fn research(&self, query: &str, _options: &ResearchOptions) -> Result<ResearchOutput> {
            Ok(ResearchOutput {
                text: format!("{}: {}", self.0, query),
                sources: vec![],
                thinking_steps: vec![],
            })
        }

        fn id(&self) -> &str {
            self.0
        }
    }

    #[tokio::test]
    async fn test_registry_round_trip() {
        let mut registry = ResearchRegistry::new();
        registry.register(Arc::new(EchoProvider("perplexity")));
        registry.register(Arc::new(EchoProvider("gemini")));

        assert_eq!(registry.provider_ids(), vec!["gemini", "perplexity"]);
        let provider = registry.get("gemini").unwrap();
        let output = provider
            .research("dano moral", &ResearchOptions::default())
            .await
            .unwrap();
        assert!(output.text.contains("dano moral"));
        assert!(registry.get("unknown").is_err());
    }
}
