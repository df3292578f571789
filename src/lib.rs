//! swe-runner: run and evaluate LLM agents on SWE-bench.
//!
//! This library provides a mini-swe-agent style agent loop, Docker and local
//! execution environments, repository retrieval (BM25 and hybrid) to guide
//! the agent, a batch runner producing `preds.json`, and an evaluation
//! harness grading the predicted patches.

// Core modules
pub mod agent;
pub mod cli;
pub mod config;
pub mod dataset;
pub mod environment;
pub mod error;
pub mod evaluation;
pub mod llm;
pub mod retrieval;
pub mod runner;

// Re-export commonly used error types
pub use error::{ConfigError, DatasetError, EnvironmentError, LlmError, RetrievalError};
