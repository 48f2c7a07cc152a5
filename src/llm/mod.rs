//! LLM provider abstraction.
//!
//! The core uses LLMs for query rewriting, HyDE, multi-query variants,
//! CogGRAG decomposition/reasoning/verification, and the agentic planner.
//! All of it goes through one contract: [`LlmProvider::generate`]. Providers
//! are registered once at startup in a [`ProviderRegistry`]; per-request
//! calls run through an [`LlmSession`] that charges the budget meter and
//! retries transient upstream failures with jittered exponential backoff.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::audit::BudgetMeter;
use crate::types::{CoreError, Result};

/// Remote embedding provider used by the vector retriever.
pub mod embeddings;

// ============================================================================
// Generation Contract
// ============================================================================

/// A single generation request.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub prompt: String,
    pub model_id: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout: Duration,
}

/// Token accounting reported by the provider.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub output_tokens: u64,
}

/// Response from a generation request.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub text: String,
    pub usage: TokenUsage,
}

/// Generic LLM provider contract.
///
/// Provider identifiers are drawn from the registry; multiple providers may
/// be plugged in side by side.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Generate a completion.
    async fn generate(&self, request: &GenerateRequest) -> Result<LlmResponse>;

    /// Stable provider identifier ("gemini", "openai", ...).
    fn id(&self) -> &str;
}

// ============================================================================
// HTTP Provider (OpenAI-compatible chat completions)
// ============================================================================

/// Provider speaking the OpenAI-compatible `/chat/completions` protocol.
///
/// Covers OpenAI itself and the many gateways exposing the same shape
/// (OpenRouter, Gemini's compatibility endpoint, local inference servers).
pub struct HttpLlmProvider {
    http: reqwest::Client,
    id: String,
    api_base: String,
    api_key: String,
}

impl HttpLlmProvider {
    pub fn new(
        id: impl Into<String>,
        api_base: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            id: id.into(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl LlmProvider for HttpLlmProvider {
    async fn generate(&self, request: &GenerateRequest) -> Result<LlmResponse> {
        let url = format!("{}/chat/completions", self.api_base);
        let body = json!({
            "model": request.model_id,
            "messages": [{"role": "user", "content": request.prompt}],
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
        });

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .timeout(request.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CoreError::Timeout(format!("{} generation timed out", self.id))
                } else {
                    CoreError::Upstream(format!("{} request failed: {}", self.id, e))
                }
            })?;

        if !response.status().is_success() {
            return Err(CoreError::Upstream(format!(
                "{} returned {}",
                self.id,
                response.status()
            )));
        }

        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| CoreError::Upstream(format!("{} response parse failed: {}", self.id, e)))?;

        let text = payload["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        let usage = TokenUsage {
            prompt_tokens: payload["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
            output_tokens: payload["usage"]["completion_tokens"].as_u64().unwrap_or(0),
        };

        Ok(LlmResponse { text, usage })
    }

    fn id(&self) -> &str {
        &self.id
    }
}

// ============================================================================
// Provider Registry
// ============================================================================

/// Registry of LLM providers, immutable after startup.
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn LlmProvider>>,
    default_id: String,
}

impl ProviderRegistry {
    pub fn new(default_id: impl Into<String>) -> Self {
        Self {
            providers: HashMap::new(),
            default_id: default_id.into(),
        }
    }

    /// Register a provider under its own id. Startup-time only.
    pub fn register(&mut self, provider: Arc<dyn LlmProvider>) {
        self.providers.insert(provider.id().to_string(), provider);
    }

    /// Look up a provider by id.
    pub fn get(&self, id: &str) -> Result<Arc<dyn LlmProvider>> {
        self.providers
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::InvalidRequest(format!("Unknown LLM provider: {}", id)))
    }

    /// The default provider.
    pub fn default_provider(&self) -> Result<Arc<dyn LlmProvider>> {
        self.get(&self.default_id)
    }

    /// All registered provider ids.
    pub fn provider_ids(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }

    pub fn has_provider(&self, id: &str) -> bool {
        self.providers.contains_key(id)
    }
}

// ============================================================================
// Budget-Charged Session
// ============================================================================

/// Per-request LLM access: every call charges the request's budget meter and
/// transient upstream failures are retried with jittered exponential backoff.
///
/// `BudgetExceeded`, `Timeout`, and `Cancelled` are never retried.
pub struct LlmSession {
    provider: Arc<dyn LlmProvider>,
    meter: Arc<BudgetMeter>,
    max_retries: usize,
    timeout: Duration,
}

impl LlmSession {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        meter: Arc<BudgetMeter>,
        max_retries: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            provider,
            meter,
            max_retries,
            timeout,
        }
    }

    /// Whether another call fits the request budget.
    pub fn can_afford_call(&self) -> bool {
        self.meter.can_afford_call()
    }

    /// Generate a completion, charging the meter with the reported usage.
    pub async fn generate(
        &self,
        prompt: &str,
        model_id: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<LlmResponse> {
        if !self.meter.can_afford_call() {
            return Err(CoreError::BudgetExceeded(
                "LLM call budget exhausted before generation".to_string(),
            ));
        }

        let request = GenerateRequest {
            prompt: prompt.to_string(),
            model_id: model_id.to_string(),
            max_tokens,
            temperature,
            timeout: self.timeout,
        };

        let mut attempt = 0;
        let response = loop {
            match self.provider.generate(&request).await {
                Ok(response) => break response,
                Err(e @ CoreError::Upstream(_)) if attempt < self.max_retries => {
                    let backoff = backoff_with_jitter(attempt);
                    tracing::warn!(
                        provider = self.provider.id(),
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "LLM call failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        };

        self.meter.charge(response.usage.output_tokens)?;
        Ok(response)
    }
}

/// Exponential backoff with uniform jitter: `250ms * 2^attempt + U(0, 250ms)`.
pub(crate) fn backoff_with_jitter(attempt: usize) -> Duration {
    use rand::Rng;
    let base = Duration::from_millis(250) * 2u32.saturating_pow(attempt as u32);
    let jitter = Duration::from_millis(rand::rng().random_range(0..250));
    base + jitter
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedProvider {
        failures_before_success: AtomicUsize,
        tokens: u64,
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        async fn generate(&self, _request: &GenerateRequest) -> Result<LlmResponse> {
            if self.failures_before_success.load(Ordering::SeqCst) > 0 {
                self.failures_before_success.fetch_sub(1, Ordering::SeqCst);
                return Err(CoreError::Upstream("scripted failure".to_string()));
            }
            Ok(LlmResponse {
                text: "ok".to_string(),
                usage: TokenUsage {
                    prompt_tokens: 5,
                    output_tokens: self.tokens,
                },
            })
        }

        fn id(&self) -> &str {
            "scripted"
        }
    }

    fn session(failures: usize, tokens: u64, meter: Arc<BudgetMeter>) -> LlmSession {
        LlmSession::new(
            Arc::new(ScriptedProvider {
                failures_before_success: AtomicUsize::new(failures),
                tokens,
            }),
            meter,
            2,
            Duration::from_secs(5),
        )
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = ProviderRegistry::new("scripted");
        registry.register(Arc::new(ScriptedProvider {
            failures_before_success: AtomicUsize::new(0),
            tokens: 1,
        }));
        assert!(registry.has_provider("scripted"));
        assert!(registry.default_provider().is_ok());
        assert!(registry.get("missing").is_err());
    }

    #[tokio::test]
    async fn test_session_charges_meter() {
        let meter = Arc::new(BudgetMeter::new(5, 1000, 0.8));
        let session = session(0, 42, Arc::clone(&meter));
        let response = session.generate("p", "m", 100, 0.2).await.unwrap();
        assert_eq!(response.text, "ok");
        assert_eq!(meter.llm_calls(), 1);
        assert_eq!(meter.output_tokens(), 42);
    }

    #[tokio::test]
    async fn test_session_retries_upstream_errors() {
        let meter = Arc::new(BudgetMeter::new(5, 1000, 0.8));
        let session = session(2, 10, Arc::clone(&meter));
        let response = session.generate("p", "m", 100, 0.2).await.unwrap();
        assert_eq!(response.text, "ok");
        // Only the successful call is charged
        assert_eq!(meter.llm_calls(), 1);
    }

    #[tokio::test]
    async fn test_session_gives_up_after_max_retries() {
        let meter = Arc::new(BudgetMeter::new(5, 1000, 0.8));
        let session = session(10, 10, meter);
        let result = session.generate("p", "m", 100, 0.2).await;
        assert!(matches!(result, Err(CoreError::Upstream(_))));
    }

    #[tokio::test]
    async fn test_session_refuses_when_budget_spent() {
        let meter = Arc::new(BudgetMeter::new(1, 1000, 0.8));
        let session = session(0, 10, Arc::clone(&meter));
        session.generate("p", "m", 100, 0.2).await.unwrap();
        let result = session.generate("p", "m", 100, 0.2).await;
        assert!(matches!(result, Err(CoreError::BudgetExceeded(_))));
    }

    #[test]
    fn test_backoff_grows_with_attempt() {
        let first = backoff_with_jitter(0);
        let third = backoff_with_jitter(2);
        assert!(first < Duration::from_millis(600));
        assert!(third >= Duration::from_millis(1000));
    }
}
