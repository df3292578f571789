//! Error types for swe-runner operations.
//!
//! Defines error types for the major subsystems:
//! - LLM API interactions
//! - Command execution environments (local shell, Docker)
//! - Retrieval over repository checkouts
//! - SWE-bench dataset loading
//! - Run configuration

use thiserror::Error;

/// Failures talking to the chat completions endpoint.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LITELLM_API_BASE is not set")]
    MissingApiBase,

    #[error("Request to model endpoint failed: {0}")]
    RequestFailed(String),

    #[error("Unreadable model response: {0}")]
    ParseError(String),

    #[error("Rate limited by model endpoint: {0}")]
    RateLimited(String),

    #[error("Prompt exceeds the model's context window: {0}")]
    ContextWindowExceeded(String),

    #[error("Model endpoint returned {code}: {message}")]
    ApiError { code: u16, message: String },
}

/// Errors raised by command execution environments.
#[derive(Debug, Error)]
pub enum EnvironmentError {
    /// The command did not finish in time. `output` holds whatever was captured.
    #[error("Command timed out after {seconds} seconds")]
    Timeout { seconds: u64, output: String },

    #[error("Failed to spawn command: {0}")]
    SpawnFailed(String),

    #[error("Docker error: {0}")]
    Docker(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur while retrieving context from a repository.
#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("Invalid regex pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("Invalid chunking: overlap ({overlap}) must be smaller than chunk size ({chunk_size})")]
    InvalidChunking { chunk_size: usize, overlap: usize },

    #[error("Embedding failed: {0}")]
    Embedding(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Retrieval task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Errors that can occur while loading SWE-bench instances.
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("Rate limited by dataset server")]
    RateLimited,

    #[error("Failed to parse dataset: {0}")]
    ParseError(String),

    #[error("Invalid slice '{0}': expected 'start:end'")]
    InvalidSlice(String),

    #[error("Invalid filter pattern: {0}")]
    InvalidFilter(#[from] regex::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that can occur while loading run configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}
