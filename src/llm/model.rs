//! Model wrapper used by the agent loop.
//!
//! A [`Model`] turns a conversation into one assistant reply and keeps the
//! per-agent call count and dollar cost the loop checks its limits against.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;

use super::cost::{CostTracker, ModelPricing};
use super::litellm::{GenerationRequest, LlmProvider, Message, Usage};
use crate::error::LlmError;

/// Model section of the run configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Model identifier passed to the provider. Empty uses the provider default.
    pub model_name: String,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    /// Prices used for the agent's cost limit.
    pub pricing: ModelPricing,
    /// Retries for rate limits and transport failures.
    pub max_retries: u32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_name: String::new(),
            temperature: Some(0.0),
            max_tokens: None,
            pricing: ModelPricing::default(),
            max_retries: 3,
        }
    }
}

/// Reply of a single model query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelResponse {
    pub content: String,
    pub usage: Usage,
    /// Dollar cost charged for this call.
    pub cost: f64,
}

/// A chat model with call and cost accounting.
#[async_trait]
pub trait Model: Send {
    /// Query the model with the conversation so far.
    async fn query(&mut self, messages: &[Message]) -> Result<ModelResponse, LlmError>;

    /// Number of successful calls made so far.
    fn n_calls(&self) -> u64;

    /// Dollars spent so far.
    fn cost(&self) -> f64;

    /// Variables exposed to the agent's templates.
    fn template_vars(&self) -> Map<String, Value>;
}

/// [`Model`] backed by an [`LlmProvider`].
pub struct LitellmModel {
    provider: Arc<dyn LlmProvider>,
    config: ModelConfig,
    tracker: Option<Arc<CostTracker>>,
    instance_id: Option<String>,
    n_calls: u64,
    cost: f64,
}

impl LitellmModel {
    pub fn new(provider: Arc<dyn LlmProvider>, config: ModelConfig) -> Self {
        Self {
            provider,
            config,
            tracker: None,
            instance_id: None,
            n_calls: 0,
            cost: 0.0,
        }
    }

    /// Report every call to a shared tracker, tagged with `instance_id`.
    pub fn with_tracker(mut self, tracker: Arc<CostTracker>, instance_id: impl Into<String>) -> Self {
        self.tracker = Some(tracker);
        self.instance_id = Some(instance_id.into());
        self
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn build_request(&self, messages: &[Message]) -> GenerationRequest {
        let mut request = GenerationRequest::new(self.config.model_name.clone(), messages.to_vec());
        if let Some(t) = self.config.temperature {
            request = request.with_temperature(t);
        }
        if let Some(m) = self.config.max_tokens {
            request = request.with_max_tokens(m);
        }
        request
    }
}

fn is_retryable(err: &LlmError) -> bool {
    matches!(err, LlmError::RateLimited(_) | LlmError::RequestFailed(_))
        || matches!(err, LlmError::ApiError { code, .. } if *code >= 500)
}

#[async_trait]
impl Model for LitellmModel {
    async fn query(&mut self, messages: &[Message]) -> Result<ModelResponse, LlmError> {
        let mut attempt = 0u32;
        let response = loop {
            match self.provider.generate(self.build_request(messages)).await {
                Ok(response) => break response,
                Err(e) if is_retryable(&e) && attempt < self.config.max_retries => {
                    attempt += 1;
                    let backoff = Duration::from_secs(2u64.pow(attempt));
                    tracing::warn!(attempt, error = %e, "LLM call failed, retrying in {:?}", backoff);
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        };

        let content = response
            .first_content()
            .ok_or_else(|| LlmError::ParseError("Empty LLM response".to_string()))?
            .to_string();

        let usage = response.usage.clone();
        let cost = match &self.tracker {
            Some(tracker) => tracker.record_usage(
                &response.model,
                usage.prompt_tokens,
                usage.completion_tokens,
                &self.config.pricing,
                self.instance_id.as_deref(),
            ),
            None => self
                .config
                .pricing
                .cost(usage.prompt_tokens, usage.completion_tokens),
        };

        self.n_calls += 1;
        self.cost += cost;

        Ok(ModelResponse {
            content,
            usage,
            cost,
        })
    }

    fn n_calls(&self) -> u64 {
        self.n_calls
    }

    fn cost(&self) -> f64 {
        self.cost
    }

    fn template_vars(&self) -> Map<String, Value> {
        let mut vars = Map::new();
        vars.insert("model_name".into(), Value::from(self.config.model_name.clone()));
        vars.insert("n_model_calls".into(), Value::from(self.n_calls));
        vars.insert("model_cost".into(), Value::from(self.cost));
        vars
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::litellm::{Choice, GenerationResponse};
    use std::sync::Mutex;

    struct FlakyProvider {
        failures_left: Mutex<u32>,
    }

    #[async_trait]
    impl LlmProvider for FlakyProvider {
        async fn generate(
            &self,
            request: GenerationRequest,
        ) -> Result<GenerationResponse, LlmError> {
            let mut left = self.failures_left.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                return Err(LlmError::ApiError {
                    code: 400,
                    message: "bad request".to_string(),
                });
            }
            Ok(GenerationResponse {
                id: "r".to_string(),
                model: request.model,
                choices: vec![Choice {
                    index: 0,
                    message: Message::assistant("ok"),
                    finish_reason: "stop".to_string(),
                }],
                usage: Usage {
                    prompt_tokens: 1_000_000,
                    completion_tokens: 0,
                    total_tokens: 1_000_000,
                },
            })
        }
    }

    #[tokio::test]
    async fn test_query_counts_calls_and_cost() {
        let provider = Arc::new(FlakyProvider {
            failures_left: Mutex::new(0),
        });
        let config = ModelConfig {
            model_name: "m".to_string(),
            pricing: ModelPricing::new(2.0, 0.0),
            ..Default::default()
        };
        let mut model = LitellmModel::new(provider, config);

        let reply = model.query(&[Message::user("hi")]).await.unwrap();
        assert_eq!(reply.content, "ok");
        assert_eq!(model.n_calls(), 1);
        assert!((model.cost() - 2.0).abs() < 1e-9);
        assert_eq!(model.template_vars()["n_model_calls"], 1);
    }

    #[tokio::test]
    async fn test_non_retryable_errors_propagate() {
        let provider = Arc::new(FlakyProvider {
            failures_left: Mutex::new(1),
        });
        let mut model = LitellmModel::new(provider, ModelConfig::default());
        let err = model.query(&[Message::user("hi")]).await.unwrap_err();
        assert!(matches!(err, LlmError::ApiError { code: 400, .. }));
        assert_eq!(model.n_calls(), 0);
    }

    #[test]
    fn test_retryable_classification() {
        assert!(is_retryable(&LlmError::RateLimited("slow down".into())));
        assert!(is_retryable(&LlmError::ApiError {
            code: 503,
            message: String::new()
        }));
        assert!(!is_retryable(&LlmError::ParseError("x".into())));
    }
}
