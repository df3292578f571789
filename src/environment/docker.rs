//! Docker container backend driven through the `docker` CLI.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Environment, EnvironmentConfig, ExecOutput};
use crate::error::EnvironmentError;

/// A container kept alive with `sleep` for the duration of one agent run.
pub struct DockerEnvironment {
    config: EnvironmentConfig,
    container_id: String,
    removed: AtomicBool,
}

/// Container name derived from an id, restricted to docker-safe characters.
pub fn container_name(prefix: &str) -> String {
    let sanitized: String = prefix
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let short = Uuid::new_v4().simple().to_string();
    format!("swe-runner-{}-{}", sanitized, &short[..8])
}

impl DockerEnvironment {
    /// Start a detached container from `config.image`.
    pub async fn start(config: EnvironmentConfig) -> Result<Self, EnvironmentError> {
        let image = config
            .image
            .clone()
            .filter(|i| !i.is_empty())
            .ok_or_else(|| EnvironmentError::Docker("no image configured".to_string()))?;

        let name = container_name(image.rsplit('/').next().unwrap_or(&image));
        let mut cmd = Command::new(&config.executable);
        cmd.args(["run", "-d", "--name", &name]);
        if !config.cwd.is_empty() {
            cmd.args(["-w", &config.cwd]);
        }
        cmd.args(&config.run_args);
        cmd.args([image.as_str(), "sleep", &config.container_timeout]);
        cmd.kill_on_drop(true);

        info!(image = %image, container = %name, "Starting container");
        let output = tokio::time::timeout(Duration::from_secs(config.pull_timeout), cmd.output())
            .await
            .map_err(|_| {
                EnvironmentError::Docker(format!(
                    "docker run timed out after {}s for image {}",
                    config.pull_timeout, image
                ))
            })?
            .map_err(|e| EnvironmentError::SpawnFailed(e.to_string()))?;

        if !output.status.success() {
            return Err(EnvironmentError::Docker(format!(
                "failed to start container from {}: {}",
                image,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        debug!(container_id = %container_id, "Container started");
        Ok(Self {
            config,
            container_id,
            removed: AtomicBool::new(false),
        })
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    fn workdir_args(&self) -> Vec<String> {
        if self.config.cwd.is_empty() {
            Vec::new()
        } else {
            vec!["-w".to_string(), self.config.cwd.clone()]
        }
    }

    /// Run `command` with an explicit timeout instead of the configured one.
    pub async fn execute_with_timeout(
        &self,
        command: &str,
        seconds: u64,
    ) -> Result<ExecOutput, EnvironmentError> {
        let mut cmd = Command::new(&self.config.executable);
        cmd.arg("exec").args(self.workdir_args());
        for (key, value) in self.config.resolved_env() {
            cmd.args(["-e", &format!("{}={}", key, value)]);
        }
        cmd.args([self.container_id.as_str(), "bash", "-lc", command]);
        cmd.kill_on_drop(true);

        match tokio::time::timeout(Duration::from_secs(seconds), cmd.output()).await {
            Ok(Ok(output)) => Ok(ExecOutput::from_process(&output)),
            Ok(Err(e)) => Err(EnvironmentError::SpawnFailed(e.to_string())),
            Err(_) => Err(EnvironmentError::Timeout {
                seconds,
                output: String::new(),
            }),
        }
    }
}

#[async_trait]
impl Environment for DockerEnvironment {
    async fn execute(&self, command: &str) -> Result<ExecOutput, EnvironmentError> {
        self.execute_with_timeout(command, self.config.timeout).await
    }

    fn template_vars(&self) -> Map<String, Value> {
        let mut vars = self.config.as_template_vars();
        vars.insert("container_id".into(), Value::from(self.container_id.clone()));
        vars
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<(), EnvironmentError> {
        use tokio::io::AsyncWriteExt;

        let mut child = Command::new(&self.config.executable)
            .args(["exec", "-i"])
            .args(self.workdir_args())
            .args([self.container_id.as_str(), "bash", "-c"])
            .arg(format!("cat > '{}'", path.replace('\'', "'\\''")))
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| EnvironmentError::SpawnFailed(e.to_string()))?;
        if let Some(ref mut stdin) = child.stdin {
            stdin.write_all(content.as_bytes()).await?;
            stdin.shutdown().await?;
        }
        drop(child.stdin.take());
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(EnvironmentError::Docker(format!(
                "write to {} failed: {}",
                path,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    async fn copy_repo_to(&self, dest: &Path) -> Result<(), EnvironmentError> {
        let source = format!("{}:{}/.", self.container_id, self.config.cwd.trim_end_matches('/'));
        tokio::fs::create_dir_all(dest).await?;
        let output = Command::new(&self.config.executable)
            .arg("cp")
            .arg(&source)
            .arg(dest)
            .output()
            .await
            .map_err(|e| EnvironmentError::SpawnFailed(e.to_string()))?;
        if !output.status.success() {
            return Err(EnvironmentError::Docker(format!(
                "docker cp {} failed: {}",
                source,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    async fn cleanup(&self) -> Result<(), EnvironmentError> {
        if self.removed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!(container_id = %self.container_id, "Removing container");
        let output = Command::new(&self.config.executable)
            .args(["rm", "-f", &self.container_id])
            .output()
            .await
            .map_err(|e| EnvironmentError::SpawnFailed(e.to_string()))?;
        if !output.status.success() {
            warn!(
                container_id = %self.container_id,
                "docker rm failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}
