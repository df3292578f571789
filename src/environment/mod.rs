//! Command execution environments for the agent.
//!
//! An [`Environment`] runs one shell command at a time and reports its
//! combined output. Two backends exist:
//! - [`LocalEnvironment`]: `bash -c` on the host.
//! - [`DockerEnvironment`]: `docker exec` in a long-lived container started
//!   from the instance image.

pub mod docker;
pub mod local;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Output;

use crate::error::EnvironmentError;

pub use docker::DockerEnvironment;
pub use local::LocalEnvironment;

/// Result of one executed command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecOutput {
    /// stdout followed by stderr.
    pub output: String,
    pub returncode: i32,
}

impl ExecOutput {
    pub fn new(output: impl Into<String>, returncode: i32) -> Self {
        Self {
            output: output.into(),
            returncode,
        }
    }

    pub(crate) fn from_process(output: &Output) -> Self {
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Self {
            output: text,
            returncode: output.status.code().unwrap_or(-1),
        }
    }

    pub fn is_success(&self) -> bool {
        self.returncode == 0
    }
}

/// Where the agent's commands run.
#[async_trait]
pub trait Environment: Send + Sync {
    /// Run `command` in the working directory.
    async fn execute(&self, command: &str) -> Result<ExecOutput, EnvironmentError>;

    /// Variables exposed to the agent's templates.
    fn template_vars(&self) -> Map<String, Value>;

    /// Write `content` to `path`. Relative paths resolve against the
    /// working directory.
    async fn write_file(&self, path: &str, content: &str) -> Result<(), EnvironmentError>;

    /// Copy the working tree to `dest` on the host.
    async fn copy_repo_to(&self, dest: &Path) -> Result<(), EnvironmentError>;

    /// Release resources. Safe to call more than once.
    async fn cleanup(&self) -> Result<(), EnvironmentError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentKind {
    #[default]
    Docker,
    Local,
}

fn default_timeout() -> u64 {
    60
}

fn default_executable() -> String {
    "docker".to_string()
}

fn default_run_args() -> Vec<String> {
    vec!["--rm".to_string()]
}

fn default_container_timeout() -> String {
    "2h".to_string()
}

fn default_pull_timeout() -> u64 {
    600
}

/// Environment section of the run configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    #[serde(default)]
    pub environment_class: EnvironmentKind,
    /// Image for the Docker backend. Set per instance by the runner.
    #[serde(default)]
    pub image: Option<String>,
    /// Working directory. Empty means the process's current directory.
    #[serde(default)]
    pub cwd: String,
    /// Extra variables set for every command.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Host variables forwarded into every command when set.
    #[serde(default)]
    pub forward_env: Vec<String>,
    /// Per-command timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_executable")]
    pub executable: String,
    #[serde(default = "default_run_args")]
    pub run_args: Vec<String>,
    /// Lifetime of the container's `sleep` process.
    #[serde(default = "default_container_timeout")]
    pub container_timeout: String,
    /// Timeout in seconds for `docker run`, which may pull the image.
    #[serde(default = "default_pull_timeout")]
    pub pull_timeout: u64,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            environment_class: EnvironmentKind::default(),
            image: None,
            cwd: String::new(),
            env: BTreeMap::new(),
            forward_env: Vec::new(),
            timeout: default_timeout(),
            executable: default_executable(),
            run_args: default_run_args(),
            container_timeout: default_container_timeout(),
            pull_timeout: default_pull_timeout(),
        }
    }
}

impl EnvironmentConfig {
    /// Fixed variables plus forwarded host variables that are set.
    pub fn resolved_env(&self) -> BTreeMap<String, String> {
        let mut vars = self.env.clone();
        for key in &self.forward_env {
            if let Ok(value) = std::env::var(key) {
                vars.insert(key.clone(), value);
            }
        }
        vars
    }

    pub(crate) fn as_template_vars(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}

/// Start the backend selected by `config`.
pub async fn create_environment(
    config: &EnvironmentConfig,
) -> Result<Box<dyn Environment>, EnvironmentError> {
    match config.environment_class {
        EnvironmentKind::Local => Ok(Box::new(LocalEnvironment::new(config.clone()))),
        EnvironmentKind::Docker => Ok(Box::new(DockerEnvironment::start(config.clone()).await?)),
    }
}
