//! Host shell backend.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use walkdir::WalkDir;

use super::{Environment, EnvironmentConfig, ExecOutput};
use crate::error::EnvironmentError;

/// Runs commands with `bash -c` on the host.
pub struct LocalEnvironment {
    config: EnvironmentConfig,
}

impl LocalEnvironment {
    pub fn new(config: EnvironmentConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EnvironmentConfig {
        &self.config
    }

    fn working_dir(&self) -> Result<PathBuf, EnvironmentError> {
        if self.config.cwd.is_empty() {
            Ok(std::env::current_dir()?)
        } else {
            Ok(PathBuf::from(&self.config.cwd))
        }
    }
}

#[async_trait]
impl Environment for LocalEnvironment {
    async fn execute(&self, command: &str) -> Result<ExecOutput, EnvironmentError> {
        let mut cmd = Command::new("bash");
        cmd.arg("-c")
            .arg(command)
            .current_dir(self.working_dir()?)
            .envs(self.config.resolved_env())
            .kill_on_drop(true);

        let seconds = self.config.timeout;
        match tokio::time::timeout(Duration::from_secs(seconds), cmd.output()).await {
            Ok(Ok(output)) => Ok(ExecOutput::from_process(&output)),
            Ok(Err(e)) => Err(EnvironmentError::SpawnFailed(e.to_string())),
            Err(_) => Err(EnvironmentError::Timeout {
                seconds,
                output: String::new(),
            }),
        }
    }

    fn template_vars(&self) -> Map<String, Value> {
        let mut vars = self.config.as_template_vars();
        vars.insert("system".into(), Value::from(std::env::consts::OS));
        vars.insert("machine".into(), Value::from(std::env::consts::ARCH));
        vars
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<(), EnvironmentError> {
        let target = self.working_dir()?.join(path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, content).await?;
        Ok(())
    }

    async fn copy_repo_to(&self, dest: &Path) -> Result<(), EnvironmentError> {
        let source = self.working_dir()?;
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || copy_tree(&source, &dest))
            .await
            .map_err(|e| EnvironmentError::SpawnFailed(e.to_string()))?
    }

    async fn cleanup(&self) -> Result<(), EnvironmentError> {
        Ok(())
    }
}

/// Copy `source` into `dest`, skipping `.git` and symlinks.
fn copy_tree(source: &Path, dest: &Path) -> Result<(), EnvironmentError> {
    let walker = WalkDir::new(source)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.file_name() != ".git");

    for entry in walker {
        let entry = entry.map_err(|e| EnvironmentError::Io(std::io::Error::other(e.to_string())))?;
        let Ok(relative) = entry.path().strip_prefix(source) else {
            continue;
        };
        let target = dest.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
