//! Step loop of the default agent.
//!
//! One step:
//! 1. Check the step and cost limits, then query the model
//! 2. Parse exactly one bash block from the reply
//! 3. Execute it in the environment
//! 4. Detect a submission marker on the first output line
//! 5. Render the observation as the next user message
//!
//! Format errors and command timeouts are fed back to the model as user
//! messages. Submissions and exhausted limits end the run.

use chrono::Utc;
use glob::Pattern;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tera::{Context, Tera};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::config::AgentConfig;
use crate::environment::{Environment, ExecOutput};
use crate::error::{EnvironmentError, LlmError};
use crate::llm::{Message, Model};

pub const FINAL_OUTPUT_MARKER: &str = "MINI_SWE_AGENT_FINAL_OUTPUT";
pub const COMPLETE_TASK_MARKER: &str = "COMPLETE_TASK_AND_SUBMIT_FINAL_OUTPUT";

/// Ways a step can end other than producing an observation.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The reply did not contain exactly one action. Recoverable.
    #[error("{0}")]
    FormatError(String),

    /// The command timed out. Recoverable.
    #[error("{0}")]
    ExecutionTimeoutError(String),

    /// The agent submitted its final output.
    #[error("{0}")]
    Submitted(String),

    /// The step or cost limit was reached.
    #[error("{0}")]
    LimitsExceeded(String),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Environment error: {0}")]
    Environment(#[from] EnvironmentError),

    #[error("Template error: {0}")]
    Template(String),

    #[error("Invalid action regex: {0}")]
    InvalidActionRegex(#[from] regex::Error),
}

impl AgentError {
    /// Recoverable interruptions are reported to the model and the loop continues.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::FormatError(_) | Self::ExecutionTimeoutError(_))
    }

    /// Interruptions that end the run with an exit status.
    pub fn is_terminating(&self) -> bool {
        matches!(self, Self::Submitted(_) | Self::LimitsExceeded(_))
    }

    /// Exit status recorded for this outcome.
    pub fn exit_status(&self) -> &'static str {
        match self {
            Self::FormatError(_) => "FormatError",
            Self::ExecutionTimeoutError(_) => "ExecutionTimeoutError",
            Self::Submitted(_) => "Submitted",
            Self::LimitsExceeded(_) => "LimitsExceeded",
            Self::Llm(_) => "LlmError",
            Self::Environment(_) => "EnvironmentError",
            Self::Template(_) => "TemplateError",
            Self::InvalidActionRegex(_) => "ConfigError",
        }
    }
}

/// A conversation entry as recorded in the trajectory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMessage {
    pub role: String,
    pub content: String,
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AgentMessage {
    fn to_llm(&self) -> Message {
        Message {
            role: self.role.clone(),
            content: self.content.clone(),
        }
    }
}

/// Render `template` with strict variable lookup.
pub fn render_template(template: &str, vars: &Map<String, Value>) -> Result<String, AgentError> {
    let context = Context::from_serialize(Value::Object(vars.clone()))
        .map_err(|e| AgentError::Template(error_chain(&e)))?;
    Tera::one_off(template, &context, false).map_err(|e| AgentError::Template(error_chain(&e)))
}

fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    message
}

/// Agent driving a [`Model`] against an [`Environment`].
pub struct DefaultAgent<'a> {
    config: AgentConfig,
    action_regex: Regex,
    model: Box<dyn Model + 'a>,
    env: &'a dyn Environment,
    messages: Vec<AgentMessage>,
    extra_template_vars: Map<String, Value>,
}

impl<'a> DefaultAgent<'a> {
    pub fn new(
        config: AgentConfig,
        model: Box<dyn Model + 'a>,
        env: &'a dyn Environment,
    ) -> Result<Self, AgentError> {
        let action_regex = RegexBuilder::new(&config.action_regex)
            .dot_matches_new_line(true)
            .build()?;
        Ok(Self {
            config,
            action_regex,
            model,
            env,
            messages: Vec::new(),
            extra_template_vars: Map::new(),
        })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn messages(&self) -> &[AgentMessage] {
        &self.messages
    }

    pub fn model(&self) -> &dyn Model {
        self.model.as_ref()
    }

    fn template_vars(&self, call_vars: Map<String, Value>) -> Map<String, Value> {
        let mut vars = match serde_json::to_value(&self.config) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        vars.extend(self.env.template_vars());
        vars.extend(self.model.template_vars());
        vars.extend(self.extra_template_vars.clone());
        vars.extend(call_vars);
        vars
    }

    fn render(&self, template: &str, call_vars: Map<String, Value>) -> Result<String, AgentError> {
        render_template(template, &self.template_vars(call_vars))
    }

    fn add_message(&mut self, role: &str, content: impl Into<String>, extra: Map<String, Value>) {
        self.messages.push(AgentMessage {
            role: role.to_string(),
            content: content.into(),
            timestamp: Utc::now().timestamp_millis() as f64 / 1000.0,
            extra,
        });
    }

    /// Run until a terminating interruption. Returns the exit status and the
    /// final message (the submission for `Submitted`).
    pub async fn run(
        &mut self,
        task: &str,
        extra_vars: Map<String, Value>,
    ) -> Result<(String, String), AgentError> {
        self.extra_template_vars
            .insert("task".to_string(), Value::from(task));
        self.extra_template_vars.extend(extra_vars);
        self.messages.clear();

        let system = self.render(&self.config.system_template, Map::new())?;
        self.add_message("system", system, Map::new());
        let instance = self.render(&self.config.instance_template, Map::new())?;
        self.add_message("user", instance, Map::new());

        loop {
            match self.step().await {
                Ok(_) => {}
                Err(e) if e.is_recoverable() => {
                    debug!(status = e.exit_status(), "Recoverable interruption");
                    self.add_message("user", e.to_string(), Map::new());
                }
                Err(e) if e.is_terminating() => {
                    let message = e.to_string();
                    self.add_message("user", message.clone(), Map::new());
                    info!(
                        status = e.exit_status(),
                        steps = self.model.n_calls(),
                        cost = self.model.cost(),
                        "Agent finished"
                    );
                    return Ok((e.exit_status().to_string(), message));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Query, parse, execute and observe once.
    pub async fn step(&mut self) -> Result<Value, AgentError> {
        let response = self.query().await?;
        self.get_observation(&response).await
    }

    /// Query the model with the (possibly truncated) history.
    pub async fn query(&mut self) -> Result<String, AgentError> {
        let step_limit = self.config.step_limit;
        let cost_limit = self.config.cost_limit;
        if (step_limit > 0 && step_limit <= self.model.n_calls())
            || (cost_limit > 0.0 && cost_limit <= self.model.cost())
        {
            return Err(AgentError::LimitsExceeded(String::new()));
        }

        let history = self.history();
        let response = self.model.query(&history).await?;

        let mut extra = Map::new();
        extra.insert("cost".into(), json!(response.cost));
        extra.insert("usage".into(), json!(response.usage));
        self.add_message("assistant", response.content.clone(), extra);
        Ok(response.content)
    }

    /// Messages sent to the model: all of them, or the first two plus the
    /// last `max_history_messages`.
    fn history(&self) -> Vec<Message> {
        let keep = self.config.max_history_messages;
        if keep == 0 || self.messages.len() <= 2 {
            return self.messages.iter().map(AgentMessage::to_llm).collect();
        }
        let rest = &self.messages[2..];
        let tail = &rest[rest.len().saturating_sub(keep)..];
        self.messages[..2]
            .iter()
            .chain(tail.iter())
            .map(AgentMessage::to_llm)
            .collect()
    }

    async fn get_observation(&mut self, response: &str) -> Result<Value, AgentError> {
        let action = self.parse_action(response)?;
        let output = self.execute_action(&action).await?;
        let mut vars = Map::new();
        vars.insert("output".into(), output.clone());
        let observation = self.render(&self.config.action_observation_template, vars)?;
        self.add_message("user", observation, Map::new());
        Ok(output)
    }

    /// The single command in `content`.
    pub fn parse_action(&self, content: &str) -> Result<String, AgentError> {
        let actions: Vec<String> = self
            .action_regex
            .captures_iter(content)
            .filter_map(|caps| caps.get(1).or_else(|| caps.get(0)))
            .map(|m| m.as_str().to_string())
            .collect();

        if actions.len() == 1 {
            return Ok(actions[0].trim().to_string());
        }
        let mut vars = Map::new();
        vars.insert("actions".into(), json!(actions));
        Err(AgentError::FormatError(
            self.render(&self.config.format_error_template, vars)?,
        ))
    }

    /// Run `action`, returning `{output, returncode, action}`.
    pub async fn execute_action(&self, action: &str) -> Result<Value, AgentError> {
        let output: ExecOutput = match self.env.execute(action).await {
            Ok(output) => output,
            Err(EnvironmentError::Timeout { output, .. }) => {
                let mut vars = Map::new();
                vars.insert("action".into(), json!({ "action": action }));
                vars.insert("output".into(), Value::from(output));
                return Err(AgentError::ExecutionTimeoutError(
                    self.render(&self.config.timeout_template, vars)?,
                ));
            }
            Err(e) => return Err(e.into()),
        };

        self.check_finished(&output.output)?;
        Ok(json!({
            "output": output.output,
            "returncode": output.returncode,
            "action": action,
        }))
    }

    /// Raise `Submitted` when the first output line is a submission marker.
    fn check_finished(&self, output: &str) -> Result<(), AgentError> {
        let trimmed = output.trim_start();
        let Some(first_line) = trimmed.split_inclusive('\n').next() else {
            return Ok(());
        };
        let marker = first_line.trim();
        if marker != FINAL_OUTPUT_MARKER && marker != COMPLETE_TASK_MARKER {
            return Ok(());
        }

        let submission = &trimmed[first_line.len()..];
        if self.config.validate_source_changes
            && !has_source_file_changes(submission, &self.config.source_path_patterns)
        {
            return Err(AgentError::FormatError(format!(
                "Submission rejected: No source files were modified. \
                 You must modify at least one source file (matching patterns: {}) \
                 for the submission to be valid.",
                self.config.source_path_patterns.join(", ")
            )));
        }
        Err(AgentError::Submitted(submission.to_string()))
    }
}

/// Files named in the headers of a git diff.
pub fn changed_files(diff: &str) -> Vec<String> {
    let mut files = Vec::new();
    for line in diff.lines() {
        if line.starts_with("diff --git") {
            if let Some(path) = line.split_whitespace().nth(2) {
                files.push(strip_diff_prefix(path).to_string());
            }
        } else if line.starts_with("+++") || line.starts_with("---") {
            if let Some(path) = line.split_whitespace().nth(1) {
                if path != "/dev/null" {
                    files.push(strip_diff_prefix(path).to_string());
                }
            }
        }
    }
    files
}

fn strip_diff_prefix(path: &str) -> &str {
    path.strip_prefix("a/")
        .or_else(|| path.strip_prefix("b/"))
        .unwrap_or(path)
}

/// Whether `diff` touches a file matching one of `patterns` or any `.py` file.
pub fn has_source_file_changes(diff: &str, patterns: &[String]) -> bool {
    let compiled: Vec<Pattern> = patterns
        .iter()
        .filter_map(|p| match Pattern::new(p) {
            Ok(pattern) => Some(pattern),
            Err(e) => {
                warn!("Ignoring invalid source file pattern {:?}: {}", p, e);
                None
            }
        })
        .collect();
    changed_files(diff)
        .iter()
        .any(|f| f.ends_with(".py") || compiled.iter().any(|p| p.matches(f)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ModelResponse, Usage};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct ScriptedModel {
        replies: VecDeque<String>,
        n_calls: u64,
        cost_per_call: f64,
    }

    impl ScriptedModel {
        fn new(replies: &[&str]) -> Self {
            Self {
                replies: replies.iter().map(|r| r.to_string()).collect(),
                n_calls: 0,
                cost_per_call: 0.0,
            }
        }
    }

    #[async_trait]
    impl Model for ScriptedModel {
        async fn query(&mut self, _messages: &[Message]) -> Result<ModelResponse, LlmError> {
            let content = self
                .replies
                .pop_front()
                .ok_or_else(|| LlmError::RequestFailed("script exhausted".into()))?;
            self.n_calls += 1;
            Ok(ModelResponse {
                content,
                usage: Usage::default(),
                cost: self.cost_per_call,
            })
        }

        fn n_calls(&self) -> u64 {
            self.n_calls
        }

        fn cost(&self) -> f64 {
            self.cost_per_call * self.n_calls as f64
        }

        fn template_vars(&self) -> Map<String, Value> {
            Map::new()
        }
    }

    struct FakeEnv {
        outputs: Mutex<VecDeque<Result<ExecOutput, EnvironmentError>>>,
        commands: Mutex<Vec<String>>,
    }

    impl FakeEnv {
        fn new(outputs: Vec<Result<ExecOutput, EnvironmentError>>) -> Self {
            Self {
                outputs: Mutex::new(outputs.into()),
                commands: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Environment for FakeEnv {
        async fn execute(&self, command: &str) -> Result<ExecOutput, EnvironmentError> {
            self.commands.lock().unwrap().push(command.to_string());
            self.outputs
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(ExecOutput::new("", 0)))
        }

        fn template_vars(&self) -> Map<String, Value> {
            let mut vars = Map::new();
            vars.insert("cwd".into(), Value::from("/testbed"));
            vars
        }

        async fn write_file(&self, _path: &str, _content: &str) -> Result<(), EnvironmentError> {
            Ok(())
        }

        async fn copy_repo_to(&self, _dest: &std::path::Path) -> Result<(), EnvironmentError> {
            Ok(())
        }

        async fn cleanup(&self) -> Result<(), EnvironmentError> {
            Ok(())
        }
    }

    fn config() -> AgentConfig {
        AgentConfig::new(
            "You are a helpful assistant.",
            "Task: {{ task }} in {{ cwd }}",
            "Timed out: {{ action.action }} [{{ output }}]",
            "Found {{ actions | length }} actions.",
            "rc={{ output.returncode }}\n{{ output.output }}",
        )
    }

    fn bash(cmd: &str) -> String {
        format!("THOUGHT: do it\n\n```bash\n{}\n```", cmd)
    }

    #[tokio::test]
    async fn test_submission_ends_run() {
        let env = FakeEnv::new(vec![
            Ok(ExecOutput::new("file.py\n", 0)),
            Ok(ExecOutput::new(
                "\nCOMPLETE_TASK_AND_SUBMIT_FINAL_OUTPUT\ndiff --git a/x.py b/x.py\n",
                0,
            )),
        ]);
        let model = ScriptedModel::new(&[&bash("ls"), &bash("echo COMPLETE_TASK_AND_SUBMIT_FINAL_OUTPUT")]);
        let mut agent = DefaultAgent::new(config(), Box::new(model), &env).unwrap();

        let (status, submission) = agent.run("fix it", Map::new()).await.unwrap();
        assert_eq!(status, "Submitted");
        assert_eq!(submission, "diff --git a/x.py b/x.py\n");

        let messages = agent.messages();
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages[1].content, "Task: fix it in /testbed");
        assert_eq!(messages[3].content, "rc=0\nfile.py\n");
        assert_eq!(messages.last().unwrap().content, submission);
        assert_eq!(agent.model().n_calls(), 2);
        assert_eq!(*env.commands.lock().unwrap(), vec!["ls", "echo COMPLETE_TASK_AND_SUBMIT_FINAL_OUTPUT"]);
    }

    #[tokio::test]
    async fn test_format_error_is_recoverable() {
        let env = FakeEnv::new(vec![Ok(ExecOutput::new("MINI_SWE_AGENT_FINAL_OUTPUT\ndone", 0))]);
        let two_blocks = format!("{}\n{}", bash("ls"), bash("pwd"));
        let model = ScriptedModel::new(&["no action here", &two_blocks, &bash("submit")]);
        let mut agent = DefaultAgent::new(config(), Box::new(model), &env).unwrap();

        let (status, submission) = agent.run("t", Map::new()).await.unwrap();
        assert_eq!(status, "Submitted");
        assert_eq!(submission, "done");
        let contents: Vec<&str> = agent.messages().iter().map(|m| m.content.as_str()).collect();
        assert!(contents.contains(&"Found 0 actions."));
        assert!(contents.contains(&"Found 2 actions."));
    }

    #[tokio::test]
    async fn test_step_limit() {
        let env = FakeEnv::new(vec![]);
        let model = ScriptedModel::new(&[&bash("ls"), &bash("ls"), &bash("ls")]);
        let mut agent =
            DefaultAgent::new(config().with_step_limit(2), Box::new(model), &env).unwrap();

        let (status, message) = agent.run("t", Map::new()).await.unwrap();
        assert_eq!(status, "LimitsExceeded");
        assert_eq!(message, "");
        assert_eq!(agent.model().n_calls(), 2);
    }

    #[tokio::test]
    async fn test_cost_limit() {
        let env = FakeEnv::new(vec![]);
        let mut model = ScriptedModel::new(&[&bash("ls"), &bash("ls")]);
        model.cost_per_call = 1.0;
        let mut agent =
            DefaultAgent::new(config().with_cost_limit(1.0), Box::new(model), &env).unwrap();

        let (status, _) = agent.run("t", Map::new()).await.unwrap();
        assert_eq!(status, "LimitsExceeded");
        assert_eq!(agent.model().n_calls(), 1);
    }

    #[tokio::test]
    async fn test_timeout_is_reported() {
        let env = FakeEnv::new(vec![
            Err(EnvironmentError::Timeout {
                seconds: 60,
                output: "partial".to_string(),
            }),
            Ok(ExecOutput::new("MINI_SWE_AGENT_FINAL_OUTPUT\n", 0)),
        ]);
        let model = ScriptedModel::new(&[&bash("sleep 100"), &bash("submit")]);
        let mut agent = DefaultAgent::new(config(), Box::new(model), &env).unwrap();

        let (status, submission) = agent.run("t", Map::new()).await.unwrap();
        assert_eq!(status, "Submitted");
        assert_eq!(submission, "");
        assert!(agent
            .messages()
            .iter()
            .any(|m| m.content == "Timed out: sleep 100 [partial]"));
    }

    #[tokio::test]
    async fn test_environment_failure_propagates() {
        let env = FakeEnv::new(vec![Err(EnvironmentError::Docker("gone".into()))]);
        let model = ScriptedModel::new(&[&bash("ls")]);
        let mut agent = DefaultAgent::new(config(), Box::new(model), &env).unwrap();
        let err = agent.run("t", Map::new()).await.unwrap_err();
        assert!(matches!(err, AgentError::Environment(_)));
    }

    #[tokio::test]
    async fn test_history_truncation() {
        let env = FakeEnv::new(vec![]);
        let model = ScriptedModel::new(&[&bash("a"), &bash("b"), &bash("c")]);
        let mut agent = DefaultAgent::new(
            config().with_step_limit(3).with_max_history_messages(2),
            Box::new(model),
            &env,
        )
        .unwrap();
        agent.run("t", Map::new()).await.unwrap();
        assert_eq!(agent.messages().len(), 9);
        let history = agent.history();
        assert_eq!(history.len(), 4);
        assert_eq!(history[0].role, "system");
        assert_eq!(history[3].content, "");
    }

    #[tokio::test]
    async fn test_source_validation_rejects_non_source_diff() {
        let diff = "COMPLETE_TASK_AND_SUBMIT_FINAL_OUTPUT\ndiff --git a/README.md b/README.md\n--- a/README.md\n+++ b/README.md\n";
        let env = FakeEnv::new(vec![Ok(ExecOutput::new(diff, 0))]);
        let model = ScriptedModel::new(&[&bash("submit")]);
        let cfg = config()
            .with_step_limit(1)
            .with_source_validation(vec!["src/**/*.rs".to_string()]);
        let mut agent = DefaultAgent::new(cfg, Box::new(model), &env).unwrap();

        let (status, _) = agent.run("t", Map::new()).await.unwrap();
        assert_eq!(status, "LimitsExceeded");
        assert!(agent.messages().iter().any(|m| m
            .content
            .starts_with("Submission rejected: No source files were modified.")
            && m.content.contains("(matching patterns: src/**/*.rs)")));
    }

    #[test]
    fn test_has_source_file_changes() {
        let patterns = vec!["src/**/*.rs".to_string()];
        let diff = "diff --git a/src/lib/mod.rs b/src/lib/mod.rs\n";
        assert!(has_source_file_changes(diff, &patterns));
        assert!(has_source_file_changes("+++ b/pkg/util.py\n", &patterns));
        assert!(!has_source_file_changes("--- /dev/null\n+++ b/docs/a.md\n", &patterns));
    }

    #[test]
    fn test_source_patterns_follow_fnmatch() {
        let patterns = vec!["*.toml".to_string(), "lib/[!t]*.rs".to_string()];
        assert!(has_source_file_changes("+++ b/crates/core/Cargo.toml\n", &patterns));
        assert!(has_source_file_changes("+++ b/lib/core.rs\n", &patterns));
        assert!(!has_source_file_changes("+++ b/lib/tests.rs\n", &patterns));

        let bracket = vec!["docs/[[]draft].md".to_string()];
        assert!(has_source_file_changes("+++ b/docs/[draft].md\n", &bracket));
        assert!(!has_source_file_changes("+++ b/docs/draft.md\n", &bracket));
    }

    #[test]
    fn test_changed_files_strips_prefix_once() {
        assert_eq!(
            changed_files("diff --git a/b/app.py b/b/app.py\n"),
            vec!["b/app.py".to_string()]
        );
    }

    #[test]
    fn test_render_template_is_strict() {
        let vars = Map::new();
        assert!(matches!(
            render_template("{{ missing }}", &vars),
            Err(AgentError::Template(_))
        ));
    }

    #[test]
    fn test_exit_status_names() {
        assert_eq!(AgentError::Submitted(String::new()).exit_status(), "Submitted");
        assert!(AgentError::FormatError(String::new()).is_recoverable());
        assert!(!AgentError::Template(String::new()).is_terminating());
    }
}
