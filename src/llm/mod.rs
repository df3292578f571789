//! LLM integration for swe-runner.
//!
//! Provides an OpenAI-compatible chat client, a [`Model`] wrapper that the
//! agent loop queries, and cost accounting shared across a batch run.
//!
//! ```ignore
//! use swe_runner::llm::{LiteLlmClient, LitellmModel, Model, ModelConfig, Message};
//!
//! let client = Arc::new(LiteLlmClient::from_env()?);
//! let mut model = LitellmModel::new(client, ModelConfig::default());
//! let reply = model.query(&[Message::user("Hello")]).await?;
//! println!("{} (${:.4})", reply.content, model.cost());
//! ```

pub mod cost;
pub mod litellm;
pub mod model;

pub use cost::{CostReport, CostTracker, ModelPricing, UsageRecord};
pub use litellm::{
    Choice, GenerationRequest, GenerationResponse, LiteLlmClient, LlmProvider, Message, Usage,
    DEFAULT_MODEL,
};
pub use model::{LitellmModel, Model, ModelConfig, ModelResponse};
