//! Run configuration.
//!
//! A YAML document with four sections:
//!
//! ```yaml
//! agent:        # templates and limits, see AgentConfig
//! environment:  # execution backend, see EnvironmentConfig
//! model:        # model name, sampling and pricing, see ModelConfig
//! run:          # retrieval settings, see RunSection
//! ```
//!
//! The built-in SWE-bench configuration is compiled into the binary and used
//! when no file is given.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::agent::AgentConfig;
use crate::environment::EnvironmentConfig;
use crate::error::ConfigError;
use crate::llm::ModelConfig;
use crate::retrieval::hybrid::{
    DEFAULT_BM25_WEIGHT, DEFAULT_CHUNK_OVERLAP, DEFAULT_CHUNK_SIZE, DEFAULT_EMBEDDING_MODEL,
    DEFAULT_EMBEDDING_WEIGHT,
};

/// Built-in configuration for SWE-bench runs.
pub const BUILTIN_SWEBENCH_CONFIG: &str = include_str!("../config/swebench.yaml");

fn default_strategy() -> String {
    "none".to_string()
}

fn default_extensions() -> Vec<String> {
    vec![".py".to_string()]
}

fn default_top_k() -> usize {
    10
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_chunk_overlap() -> usize {
    DEFAULT_CHUNK_OVERLAP
}

fn default_embedding_weight() -> f64 {
    DEFAULT_EMBEDDING_WEIGHT
}

fn default_bm25_weight() -> f64 {
    DEFAULT_BM25_WEIGHT
}

fn default_embedding_model() -> String {
    DEFAULT_EMBEDDING_MODEL.to_string()
}

/// `run` section: how context is retrieved before the agent starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSection {
    #[serde(default = "default_strategy")]
    pub retrieval_strategy: String,
    #[serde(default)]
    pub retrieval_index_all_files: bool,
    #[serde(default = "default_extensions")]
    pub retrieval_file_extensions: Vec<String>,
    #[serde(default = "default_top_k")]
    pub retrieval_top_k: usize,
    /// Directory the `bm25_source` mode restricts to. Inferred when unset.
    #[serde(default)]
    pub retrieval_source_path_prefix: Option<String>,
    #[serde(default)]
    pub retrieval_filter_pattern: Option<String>,
    #[serde(default)]
    pub retrieval_rule_filter: bool,
    #[serde(default)]
    pub retrieval_rule_id_pattern: Option<String>,
    /// Shell command whose output feeds the lint boost.
    #[serde(default)]
    pub retrieval_lint_command: Option<String>,
    #[serde(default = "default_chunk_size")]
    pub retrieval_chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub retrieval_chunk_overlap: usize,
    #[serde(default = "default_embedding_weight")]
    pub retrieval_embedding_weight: f64,
    #[serde(default = "default_bm25_weight")]
    pub retrieval_bm25_weight: f64,
    #[serde(default = "default_embedding_model")]
    pub retrieval_embedding_model: String,
    /// OpenAI-compatible endpoint for embeddings. Local hashing when unset.
    #[serde(default)]
    pub retrieval_embedding_api_base: Option<String>,
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            retrieval_strategy: default_strategy(),
            retrieval_index_all_files: false,
            retrieval_file_extensions: default_extensions(),
            retrieval_top_k: default_top_k(),
            retrieval_source_path_prefix: None,
            retrieval_filter_pattern: None,
            retrieval_rule_filter: false,
            retrieval_rule_id_pattern: None,
            retrieval_lint_command: None,
            retrieval_chunk_size: default_chunk_size(),
            retrieval_chunk_overlap: default_chunk_overlap(),
            retrieval_embedding_weight: default_embedding_weight(),
            retrieval_bm25_weight: default_bm25_weight(),
            retrieval_embedding_model: default_embedding_model(),
            retrieval_embedding_api_base: None,
        }
    }
}

/// Complete run configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerConfig {
    pub agent: AgentConfig,
    #[serde(default)]
    pub environment: EnvironmentConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub run: RunSection,
}

impl RunnerConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&text)
    }

    /// Load `path`, or the built-in SWE-bench configuration.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(p) => Self::from_file(p),
            None => Self::builtin(),
        }
    }

    pub fn builtin() -> Result<Self, ConfigError> {
        Self::from_yaml(BUILTIN_SWEBENCH_CONFIG)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.cost_limit < 0.0 {
            return Err(ConfigError::InvalidValue {
                key: "agent.cost_limit".to_string(),
                message: "must not be negative".to_string(),
            });
        }
        if self.run.retrieval_chunk_overlap >= self.run.retrieval_chunk_size {
            return Err(ConfigError::InvalidValue {
                key: "run.retrieval_chunk_overlap".to_string(),
                message: format!(
                    "must be smaller than retrieval_chunk_size ({})",
                    self.run.retrieval_chunk_size
                ),
            });
        }
        if self.environment.timeout == 0 {
            return Err(ConfigError::InvalidValue {
                key: "environment.timeout".to_string(),
                message: "must be at least 1 second".to_string(),
            });
        }
        Ok(())
    }
}
