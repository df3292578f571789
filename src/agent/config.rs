//! Agent section of the run configuration.

use serde::{Deserialize, Serialize};

fn default_action_regex() -> String {
    r"```bash\s*\n(.*?)\n```".to_string()
}

fn default_cost_limit() -> f64 {
    3.0
}

fn default_source_path_patterns() -> Vec<String> {
    vec!["src/**/*.py".to_string(), "*.py".to_string()]
}

/// Templates and limits of the default agent.
///
/// Every field is also exposed to the templates under its own name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub system_template: String,
    pub instance_template: String,
    pub timeout_template: String,
    pub format_error_template: String,
    pub action_observation_template: String,
    /// Captures the command of a bash block. Dot matches newline.
    #[serde(default = "default_action_regex")]
    pub action_regex: String,
    /// Maximum model calls. 0 disables the limit.
    #[serde(default)]
    pub step_limit: u64,
    /// Maximum dollars spent. 0 disables the limit.
    #[serde(default = "default_cost_limit")]
    pub cost_limit: f64,
    /// Messages kept after the system and instance messages. 0 keeps all.
    #[serde(default)]
    pub max_history_messages: usize,
    /// Reject submissions whose diff touches no source file.
    #[serde(default)]
    pub validate_source_changes: bool,
    #[serde(default = "default_source_path_patterns")]
    pub source_path_patterns: Vec<String>,
}

impl AgentConfig {
    /// Config with the given templates and default limits.
    pub fn new(
        system_template: impl Into<String>,
        instance_template: impl Into<String>,
        timeout_template: impl Into<String>,
        format_error_template: impl Into<String>,
        action_observation_template: impl Into<String>,
    ) -> Self {
        Self {
            system_template: system_template.into(),
            instance_template: instance_template.into(),
            timeout_template: timeout_template.into(),
            format_error_template: format_error_template.into(),
            action_observation_template: action_observation_template.into(),
            action_regex: default_action_regex(),
            step_limit: 0,
            cost_limit: default_cost_limit(),
            max_history_messages: 0,
            validate_source_changes: false,
            source_path_patterns: default_source_path_patterns(),
        }
    }

    pub fn with_step_limit(mut self, limit: u64) -> Self {
        self.step_limit = limit;
        self
    }

    pub fn with_cost_limit(mut self, limit: f64) -> Self {
        self.cost_limit = limit;
        self
    }

    pub fn with_max_history_messages(mut self, n: usize) -> Self {
        self.max_history_messages = n;
        self
    }

    pub fn with_source_validation(mut self, patterns: Vec<String>) -> Self {
        self.validate_source_changes = true;
        self.source_path_patterns = patterns;
        self
    }
}
