//! Evaluation harness runs against a scripted environment.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::{Arc, Mutex};
use swe_runner::dataset::SweBenchInstance;
use swe_runner::environment::{Environment, EnvironmentConfig, ExecOutput};
use swe_runner::evaluation::{EvaluationConfig, EvaluationHarness, EvaluationStatus};
use swe_runner::runner::{EnvironmentFactory, Prediction};
use swe_runner::EnvironmentError;

/// Answers `git apply` by patch content and prints a canned pytest summary.
/// The test patch conflicts while the model's edits to `tests/` are in place.
struct ScriptedEnv {
    written: Mutex<Vec<(String, String)>>,
    commands: Arc<Mutex<Vec<String>>>,
    tests_dirty: Mutex<bool>,
}

#[async_trait]
impl Environment for ScriptedEnv {
    async fn execute(&self, command: &str) -> Result<ExecOutput, EnvironmentError> {
        if let Ok(mut commands) = self.commands.lock() {
            commands.push(command.to_string());
        }
        let last_patch = self
            .written
            .lock()
            .ok()
            .and_then(|w| w.last().map(|(_, content)| content.clone()))
            .unwrap_or_default();

        if command.starts_with("git checkout abc123 -- 'tests/") {
            *self.tests_dirty.lock().unwrap() = false;
            return Ok(ExecOutput::new("", 0));
        }
        if command.starts_with("git apply") || command.starts_with("patch ") {
            if last_patch.contains("garbage") {
                return Ok(ExecOutput::new("error: corrupt patch", 1));
            }
            let mut dirty = self.tests_dirty.lock().unwrap();
            if command.contains("test_patch") {
                if *dirty {
                    return Ok(ExecOutput::new("error: tests/test_a.py: patch does not apply", 1));
                }
            } else if last_patch.contains("b/tests/") {
                *dirty = true;
            }
            return Ok(ExecOutput::new("Applied patch cleanly.", 0));
        }
        if command.contains("pytest") {
            let slow = self
                .written
                .lock()
                .map(|w| w.iter().any(|(_, c)| c.contains("sleep")))
                .unwrap_or(false);
            if slow {
                return Err(EnvironmentError::Timeout {
                    seconds: 5,
                    output: "PASSED tests/test_a.py::test_old\n".to_string(),
                });
            }
            let log = if self
                .written
                .lock()
                .map(|w| w.iter().any(|(_, c)| c.contains("fixed")))
                .unwrap_or(false)
            {
                "PASSED tests/test_a.py::test_new\nPASSED tests/test_a.py::test_old\n"
            } else {
                "FAILED tests/test_a.py::test_new - AssertionError\nPASSED tests/test_a.py::test_old\n"
            };
            return Ok(ExecOutput::new(log, 1));
        }
        Ok(ExecOutput::new("", 0))
    }

    fn template_vars(&self) -> Map<String, Value> {
        Map::new()
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<(), EnvironmentError> {
        if let Ok(mut written) = self.written.lock() {
            written.push((path.to_string(), content.to_string()));
        }
        Ok(())
    }

    async fn copy_repo_to(&self, _dest: &Path) -> Result<(), EnvironmentError> {
        Ok(())
    }

    async fn cleanup(&self) -> Result<(), EnvironmentError> {
        Ok(())
    }
}

#[derive(Default)]
struct ScriptedFactory {
    commands: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl EnvironmentFactory for ScriptedFactory {
    async fn create(
        &self,
        _instance: &SweBenchInstance,
        _config: &EnvironmentConfig,
    ) -> Result<Box<dyn Environment>, EnvironmentError> {
        Ok(Box::new(ScriptedEnv {
            written: Mutex::new(Vec::new()),
            commands: self.commands.clone(),
            tests_dirty: Mutex::new(false),
        }))
    }
}

fn instance(id: &str) -> SweBenchInstance {
    serde_json::from_value(serde_json::json!({
        "instance_id": id,
        "repo": "acme/widgets",
        "base_commit": "abc123",
        "test_patch": "diff --git a/tests/test_a.py b/tests/test_a.py\n+def test_new(): pass\n",
        "FAIL_TO_PASS": "[\"tests/test_a.py::test_new\"]",
        "PASS_TO_PASS": ["tests/test_a.py::test_old"],
    }))
    .unwrap()
}

fn prediction(id: &str, patch: &str) -> Prediction {
    Prediction {
        model_name_or_path: "org/model".to_string(),
        instance_id: id.to_string(),
        model_patch: patch.to_string(),
    }
}

#[tokio::test]
async fn test_evaluation_report_and_logs() {
    let tmp = tempfile::tempdir().unwrap();
    let config = EvaluationConfig {
        run_id: "smoke".to_string(),
        report_dir: tmp.path().join("reports"),
        log_dir: tmp.path().join("logs"),
        max_workers: 2,
        ..Default::default()
    };
    let factory = Arc::new(ScriptedFactory::default());
    let harness = EvaluationHarness::new(config).with_env_factory(factory.clone());

    let predictions = vec![
        prediction("acme__widgets-1", "diff --git a/w.py b/w.py\n+fixed\n"),
        prediction("acme__widgets-2", "diff --git a/w.py b/w.py\n+still broken\n"),
        prediction("acme__widgets-3", ""),
        prediction("acme__widgets-4", "garbage"),
        prediction("acme__unknown-1", "diff"),
    ];
    let instances = vec![
        instance("acme__widgets-1"),
        instance("acme__widgets-2"),
        instance("acme__widgets-3"),
        instance("acme__widgets-4"),
    ];

    let (report, path) = harness.evaluate(predictions, instances).await.unwrap();

    assert_eq!(path, tmp.path().join("reports").join("org__model.smoke.json"));
    assert!(path.exists());
    assert_eq!(report.total_instances, 4);
    assert_eq!(report.submitted_instances, 5);
    assert_eq!(report.resolved_ids, vec!["acme__widgets-1"]);
    assert_eq!(report.unresolved_ids, vec!["acme__widgets-2"]);
    assert_eq!(report.empty_patch_ids, vec!["acme__widgets-3"]);
    assert_eq!(report.error_ids, vec!["acme__unknown-1", "acme__widgets-4"]);
    assert_eq!(report.completed_instances, 2);

    let instance_dir = tmp.path().join("logs/smoke/org__model/acme__widgets-1");
    assert!(instance_dir.join("patch.diff").exists());
    assert!(instance_dir.join("test_output.txt").exists());
    let instance_report: Value =
        serde_json::from_str(&std::fs::read_to_string(instance_dir.join("report.json")).unwrap())
            .unwrap();
    assert_eq!(instance_report["status"], "resolved");
    assert_eq!(instance_report["patch_successfully_applied"], true);

    let commands = factory.commands.lock().unwrap();
    assert!(commands.iter().any(|c| c.contains("pytest") && c.contains("tests/test_a.py")));
    assert!(commands.iter().any(|c| c.starts_with("patch --batch --fuzz=5")));
}

#[tokio::test]
async fn test_instance_report_status_serialization() {
    let tmp = tempfile::tempdir().unwrap();
    let harness = EvaluationHarness::new(EvaluationConfig {
        log_dir: tmp.path().to_path_buf(),
        ..Default::default()
    })
    .with_env_factory(Arc::new(ScriptedFactory::default()));

    let report = harness
        .evaluate_prediction(
            &prediction("acme__widgets-2", "diff --git a/w.py b/w.py\n+still broken\n"),
            &instance("acme__widgets-2"),
        )
        .await;
    assert_eq!(report.status, EvaluationStatus::Unresolved);
    let tests_status = report.tests_status.unwrap();
    assert_eq!(tests_status.fail_to_pass.failure, vec!["tests/test_a.py::test_new"]);
    assert_eq!(tests_status.pass_to_pass.success, vec!["tests/test_a.py::test_old"]);
}

#[tokio::test]
async fn test_model_edits_to_test_files_are_reset_before_test_patch() {
    let tmp = tempfile::tempdir().unwrap();
    let factory = Arc::new(ScriptedFactory::default());
    let harness = EvaluationHarness::new(EvaluationConfig {
        log_dir: tmp.path().to_path_buf(),
        ..Default::default()
    })
    .with_env_factory(factory.clone());

    let patch = "diff --git a/w.py b/w.py\n+fixed\ndiff --git a/tests/test_a.py b/tests/test_a.py\n+def test_new(): assert False\n";
    let report = harness
        .evaluate_prediction(&prediction("acme__widgets-5", patch), &instance("acme__widgets-5"))
        .await;
    assert_eq!(report.status, EvaluationStatus::Resolved);

    let commands = factory.commands.lock().unwrap();
    let checkout = commands
        .iter()
        .position(|c| c == "git checkout abc123 -- 'tests/test_a.py'")
        .unwrap();
    let test_patch = commands
        .iter()
        .position(|c| c.starts_with("git apply") && c.contains("test_patch"))
        .unwrap();
    assert!(checkout < test_patch);
}

#[tokio::test]
async fn test_timed_out_test_run_keeps_partial_output() {
    let tmp = tempfile::tempdir().unwrap();
    let harness = EvaluationHarness::new(EvaluationConfig {
        run_id: "slow".to_string(),
        log_dir: tmp.path().to_path_buf(),
        ..Default::default()
    })
    .with_env_factory(Arc::new(ScriptedFactory::default()));

    let report = harness
        .evaluate_prediction(
            &prediction("acme__widgets-6", "diff --git a/w.py b/w.py\n+sleep(600)\n"),
            &instance("acme__widgets-6"),
        )
        .await;
    assert_eq!(report.status, EvaluationStatus::Error);
    assert!(report.patch_successfully_applied);
    assert!(report.error.unwrap().contains("timed out after 5s"));

    let output = std::fs::read_to_string(
        tmp.path().join("slow/org__model/acme__widgets-6/test_output.txt"),
    )
    .unwrap();
    assert_eq!(output, "PASSED tests/test_a.py::test_old\n");
}
