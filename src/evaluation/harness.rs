//! SWE-bench evaluation harness.
//!
//! Applies each predicted patch inside the instance image, runs the tests
//! touched by the gold test patch and grades the result against the
//! instance's FAIL_TO_PASS / PASS_TO_PASS lists.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::log_parsers::{grade, parse_log, patch_files, test_command, TestsStatus};
use crate::dataset::{load_instances, SweBenchInstance};
use crate::environment::{Environment, EnvironmentConfig};
use crate::error::{DatasetError, EnvironmentError};
use crate::runner::{EnvironmentFactory, InstanceImageFactory, Prediction};

/// Activates the SWE-bench conda environment when the image has one.
const CONDA_ACTIVATE: &str =
    "if [ -f /opt/miniconda3/bin/activate ]; then source /opt/miniconda3/bin/activate && conda activate testbed; fi";

const PATCH_PATH: &str = "/tmp/patch.diff";
const TEST_PATCH_PATH: &str = "/tmp/test_patch.diff";

#[derive(Debug, Error)]
pub enum EvaluationError {
    #[error("Failed to read predictions '{path}': {message}")]
    Predictions { path: String, message: String },

    #[error("Dataset error: {0}")]
    Dataset(#[from] DatasetError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct EvaluationConfig {
    pub dataset_name: String,
    pub split: String,
    pub predictions_path: PathBuf,
    pub run_id: String,
    pub report_dir: PathBuf,
    pub log_dir: PathBuf,
    pub max_workers: usize,
    /// Test run timeout in seconds.
    pub timeout: u64,
    /// Restrict evaluation to these ids. Empty evaluates all predictions.
    pub instance_ids: Vec<String>,
    /// Replaces the repository's default test command.
    pub test_cmd: Option<String>,
    pub environment: EnvironmentConfig,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            dataset_name: "princeton-nlp/SWE-bench_Lite".to_string(),
            split: "test".to_string(),
            predictions_path: PathBuf::from("preds.json"),
            run_id: "evaluation".to_string(),
            report_dir: PathBuf::from("."),
            log_dir: PathBuf::from("logs/run_evaluation"),
            max_workers: 4,
            timeout: 1800,
            instance_ids: Vec::new(),
            test_cmd: None,
            environment: EnvironmentConfig {
                cwd: "/testbed".to_string(),
                ..Default::default()
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationStatus {
    Resolved,
    Unresolved,
    EmptyPatch,
    Error,
}

impl std::fmt::Display for EvaluationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Resolved => write!(f, "resolved"),
            Self::Unresolved => write!(f, "unresolved"),
            Self::EmptyPatch => write!(f, "empty_patch"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Result for one prediction, also written as `report.json` in its log dir.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceReport {
    pub instance_id: String,
    pub status: EvaluationStatus,
    pub patch_exists: bool,
    pub patch_successfully_applied: bool,
    pub resolved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tests_status: Option<TestsStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_secs: f64,
}

impl InstanceReport {
    fn new(instance_id: &str, status: EvaluationStatus) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            status,
            patch_exists: status != EvaluationStatus::EmptyPatch,
            patch_successfully_applied: false,
            resolved: false,
            tests_status: None,
            error: None,
            duration_secs: 0.0,
        }
    }

    fn error(instance_id: &str, message: impl Into<String>) -> Self {
        let mut report = Self::new(instance_id, EvaluationStatus::Error);
        report.error = Some(message.into());
        report
    }
}

/// Final report at `<report_dir>/<model>.<run_id>.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub total_instances: usize,
    pub submitted_instances: usize,
    pub completed_instances: usize,
    pub resolved_instances: usize,
    pub unresolved_instances: usize,
    pub empty_patch_instances: usize,
    pub error_instances: usize,
    pub submitted_ids: Vec<String>,
    pub completed_ids: Vec<String>,
    pub resolved_ids: Vec<String>,
    pub unresolved_ids: Vec<String>,
    pub empty_patch_ids: Vec<String>,
    pub error_ids: Vec<String>,
    pub schema_version: u32,
}

impl EvaluationReport {
    pub fn from_results(total_instances: usize, results: &[InstanceReport]) -> Self {
        let mut report = Self {
            total_instances,
            schema_version: 2,
            ..Default::default()
        };
        for r in results {
            let id = r.instance_id.clone();
            report.submitted_ids.push(id.clone());
            match r.status {
                EvaluationStatus::Resolved => {
                    report.completed_ids.push(id.clone());
                    report.resolved_ids.push(id);
                }
                EvaluationStatus::Unresolved => {
                    report.completed_ids.push(id.clone());
                    report.unresolved_ids.push(id);
                }
                EvaluationStatus::EmptyPatch => report.empty_patch_ids.push(id),
                EvaluationStatus::Error => report.error_ids.push(id),
            }
        }
        for ids in [
            &mut report.submitted_ids,
            &mut report.completed_ids,
            &mut report.resolved_ids,
            &mut report.unresolved_ids,
            &mut report.empty_patch_ids,
            &mut report.error_ids,
        ] {
            ids.sort();
        }
        report.submitted_instances = report.submitted_ids.len();
        report.completed_instances = report.completed_ids.len();
        report.resolved_instances = report.resolved_ids.len();
        report.unresolved_instances = report.unresolved_ids.len();
        report.empty_patch_instances = report.empty_patch_ids.len();
        report.error_instances = report.error_ids.len();
        report
    }
}

/// Load predictions from a JSON object keyed by id, a JSON array, or JSON lines.
pub fn load_predictions(path: &Path) -> Result<Vec<Prediction>, EvaluationError> {
    let text = std::fs::read_to_string(path).map_err(|e| EvaluationError::Predictions {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    let invalid = |message: String| EvaluationError::Predictions {
        path: path.display().to_string(),
        message,
    };

    let trimmed = text.trim_start();
    let is_jsonl = path.extension().and_then(|e| e.to_str()) == Some("jsonl");
    let predictions: Vec<Prediction> = if trimmed.starts_with('{') && !is_jsonl {
        let map: BTreeMap<String, Prediction> =
            serde_json::from_str(trimmed).map_err(|e| invalid(e.to_string()))?;
        map.into_values().collect()
    } else if trimmed.starts_with('[') {
        serde_json::from_str(trimmed).map_err(|e| invalid(e.to_string()))?
    } else {
        text.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(|e| invalid(e.to_string())))
            .collect::<Result<Vec<Prediction>, _>>()?
    };
    Ok(predictions)
}

/// File-system safe model name.
pub fn model_dir_name(model: &str) -> String {
    model.replace('/', "__")
}

/// Evaluates predictions against a dataset.
pub struct EvaluationHarness {
    config: EvaluationConfig,
    env_factory: Arc<dyn EnvironmentFactory>,
}

impl EvaluationHarness {
    pub fn new(config: EvaluationConfig) -> Self {
        Self {
            config,
            env_factory: Arc::new(InstanceImageFactory),
        }
    }

    pub fn with_env_factory(mut self, factory: Arc<dyn EnvironmentFactory>) -> Self {
        self.env_factory = factory;
        self
    }

    fn instance_log_dir(&self, model: &str, instance_id: &str) -> PathBuf {
        self.config
            .log_dir
            .join(&self.config.run_id)
            .join(model_dir_name(model))
            .join(instance_id)
    }

    /// Load everything, evaluate and write the final report. Returns the
    /// report and its path.
    pub async fn run(&self) -> Result<(EvaluationReport, PathBuf), EvaluationError> {
        let mut predictions = load_predictions(&self.config.predictions_path)?;
        if !self.config.instance_ids.is_empty() {
            let wanted: HashSet<&str> = self.config.instance_ids.iter().map(String::as_str).collect();
            predictions.retain(|p| wanted.contains(p.instance_id.as_str()));
        }
        let instances = load_instances(&self.config.dataset_name, &self.config.split).await?;
        self.evaluate(predictions, instances).await
    }

    /// Evaluate already loaded predictions.
    pub async fn evaluate(
        &self,
        predictions: Vec<Prediction>,
        instances: Vec<SweBenchInstance>,
    ) -> Result<(EvaluationReport, PathBuf), EvaluationError> {
        let total_instances = instances.len();
        let by_id: BTreeMap<String, SweBenchInstance> = instances
            .into_iter()
            .map(|i| (i.instance_id.clone(), i))
            .collect();
        let model = predictions
            .first()
            .map(|p| p.model_name_or_path.clone())
            .unwrap_or_else(|| "unknown".to_string());

        info!(
            predictions = predictions.len(),
            workers = self.config.max_workers,
            run_id = %self.config.run_id,
            "Starting evaluation"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.max_workers.max(1)));
        let by_id = &by_id;
        let futures = predictions.iter().map(|prediction| {
            let sem = semaphore.clone();
            async move {
                let _permit = sem.acquire().await.ok();
                let report = match by_id.get(&prediction.instance_id) {
                    Some(instance) => self.evaluate_prediction(prediction, instance).await,
                    None => InstanceReport::error(
                        &prediction.instance_id,
                        "instance not found in dataset",
                    ),
                };
                info!(instance_id = %report.instance_id, status = %report.status, "Evaluated");
                report
            }
        });
        let results = futures::future::join_all(futures).await;

        let report = EvaluationReport::from_results(total_instances, &results);
        tokio::fs::create_dir_all(&self.config.report_dir).await?;
        let report_path = self
            .config
            .report_dir
            .join(format!("{}.{}.json", model_dir_name(&model), self.config.run_id));
        tokio::fs::write(&report_path, serde_json::to_string_pretty(&report)?).await?;

        info!(
            resolved = report.resolved_instances,
            submitted = report.submitted_instances,
            report = %report_path.display(),
            "Evaluation finished"
        );
        Ok((report, report_path))
    }

    /// Evaluate one prediction and write its logs.
    pub async fn evaluate_prediction(
        &self,
        prediction: &Prediction,
        instance: &SweBenchInstance,
    ) -> InstanceReport {
        let start = Instant::now();
        let id = &prediction.instance_id;
        if prediction.model_patch.trim().is_empty() {
            return InstanceReport::new(id, EvaluationStatus::EmptyPatch);
        }

        let log_dir = self.instance_log_dir(&prediction.model_name_or_path, id);
        if let Err(e) = tokio::fs::create_dir_all(&log_dir).await {
            return InstanceReport::error(id, format!("failed to create log dir: {}", e));
        }
        if let Err(e) = tokio::fs::write(log_dir.join("patch.diff"), &prediction.model_patch).await {
            warn!(instance_id = %id, error = %e, "Failed to write patch.diff");
        }

        let mut env_config = self.config.environment.clone();
        env_config.timeout = self.config.timeout;
        let mut report = match self.env_factory.create(instance, &env_config).await {
            Ok(env) => {
                let report = self
                    .evaluate_in_environment(prediction, instance, env.as_ref(), &log_dir)
                    .await;
                if let Err(e) = env.cleanup().await {
                    warn!(instance_id = %id, error = %e, "Environment cleanup failed");
                }
                report
            }
            Err(e) => InstanceReport::error(id, format!("failed to start environment: {}", e)),
        };
        report.duration_secs = start.elapsed().as_secs_f64();

        match serde_json::to_string_pretty(&report) {
            Ok(json) => {
                if let Err(e) = tokio::fs::write(log_dir.join("report.json"), json).await {
                    warn!(instance_id = %id, error = %e, "Failed to write report.json");
                }
            }
            Err(e) => warn!(instance_id = %id, error = %e, "Failed to serialize report"),
        }
        report
    }

    async fn evaluate_in_environment(
        &self,
        prediction: &Prediction,
        instance: &SweBenchInstance,
        env: &dyn Environment,
        log_dir: &Path,
    ) -> InstanceReport {
        let id = &prediction.instance_id;

        if let Err(e) = apply_patch(env, PATCH_PATH, &prediction.model_patch, true).await {
            return InstanceReport::error(id, format!("model patch failed to apply: {}", e));
        }
        if !instance.test_patch.trim().is_empty() {
            reset_test_files(env, instance).await;
            if let Err(e) = apply_patch(env, TEST_PATCH_PATH, &instance.test_patch, false).await {
                let mut report = InstanceReport::error(id, format!("test patch failed to apply: {}", e));
                report.patch_successfully_applied = true;
                return report;
            }
        }

        let command = format!(
            "{}; {}",
            CONDA_ACTIVATE,
            test_command(instance, self.config.test_cmd.as_deref())
        );
        let output = match env.execute(&command).await {
            Ok(output) => output,
            Err(EnvironmentError::Timeout { seconds, output }) => {
                if let Err(e) = tokio::fs::write(log_dir.join("test_output.txt"), &output).await {
                    warn!(instance_id = %id, error = %e, "Failed to write test_output.txt");
                }
                let mut report = InstanceReport::error(id, format!("tests timed out after {}s", seconds));
                report.patch_successfully_applied = true;
                return report;
            }
            Err(e) => {
                let mut report = InstanceReport::error(id, format!("test run failed: {}", e));
                report.patch_successfully_applied = true;
                return report;
            }
        };
        let log = format!("+ {}\n{}", command, output.output);
        if let Err(e) = tokio::fs::write(log_dir.join("test_output.txt"), &log).await {
            warn!(instance_id = %id, error = %e, "Failed to write test_output.txt");
        }

        let statuses = parse_log(&instance.repo, &output.output);
        let tests_status = grade(instance, &statuses);
        let resolved = tests_status.is_resolved();
        InstanceReport {
            instance_id: id.clone(),
            status: if resolved {
                EvaluationStatus::Resolved
            } else {
                EvaluationStatus::Unresolved
            },
            patch_exists: true,
            patch_successfully_applied: true,
            resolved,
            tests_status: Some(tests_status),
            error: None,
            duration_secs: 0.0,
        }
    }
}

/// Restore the files `test_patch` touches to `base_commit`, so edits the
/// model made to them cannot block the test patch. Files the test patch
/// creates do not exist at `base_commit`; their checkout fails harmlessly.
async fn reset_test_files(env: &dyn Environment, instance: &SweBenchInstance) {
    let files = patch_files(&instance.test_patch);
    if instance.base_commit.is_empty() || files.is_empty() {
        return;
    }
    for file in files {
        let command = format!(
            "git checkout {} -- '{}'",
            instance.base_commit,
            file.replace('\'', "'\\''")
        );
        match env.execute(&command).await {
            Ok(output) if !output.is_success() => {
                debug!(instance_id = %instance.instance_id, file = %file, output = %output.output, "Test file not reset");
            }
            Ok(_) => {}
            Err(e) => {
                warn!(instance_id = %instance.instance_id, file = %file, error = %e, "Test file reset failed");
            }
        }
    }
}

/// Write `patch` to `path` and apply it with `git apply`, falling back to
/// `patch --fuzz` when `allow_fuzz` is set.
async fn apply_patch(
    env: &dyn Environment,
    path: &str,
    patch: &str,
    allow_fuzz: bool,
) -> Result<(), String> {
    let mut contents = patch.to_string();
    if !contents.ends_with('\n') {
        contents.push('\n');
    }
    env.write_file(path, &contents).await.map_err(|e| e.to_string())?;

    let git = env
        .execute(&format!("git apply -v {}", path))
        .await
        .map_err(|e| e.to_string())?;
    if git.is_success() {
        return Ok(());
    }
    if !allow_fuzz {
        return Err(git.output);
    }

    let fuzz = env
        .execute(&format!("patch --batch --fuzz=5 -p1 -i {}", path))
        .await
        .map_err(|e| e.to_string())?;
    if fuzz.is_success() {
        Ok(())
    } else {
        Err(format!("{}\n{}", git.output, fuzz.output))
    }
}
