//! Test log parsing and grading.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::dataset::SweBenchInstance;

/// Per-test outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TestStatus {
    Passed,
    Failed,
    Skipped,
    Error,
    Xfail,
}

impl TestStatus {
    const ALL: [TestStatus; 5] = [
        TestStatus::Passed,
        TestStatus::Failed,
        TestStatus::Skipped,
        TestStatus::Error,
        TestStatus::Xfail,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Passed => "PASSED",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
            Self::Error => "ERROR",
            Self::Xfail => "XFAIL",
        }
    }

    /// Whether the test counts as passing for grading.
    pub fn is_pass(&self) -> bool {
        matches!(self, Self::Passed | Self::Xfail)
    }
}

pub type TestStatusMap = HashMap<String, TestStatus>;

/// Parse the short test summary of `pytest -rA`.
pub fn parse_log_pytest(log: &str) -> TestStatusMap {
    let mut map = TestStatusMap::new();
    for line in log.lines() {
        let Some(status) = TestStatus::ALL
            .into_iter()
            .find(|s| line.starts_with(s.as_str()))
        else {
            continue;
        };
        let line = if status == TestStatus::Failed {
            line.replace(" - ", " ")
        } else {
            line.to_string()
        };
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() <= 1 || parts[0] != status.as_str() {
            continue;
        }
        map.insert(parts[1].to_string(), status);
    }
    map
}

/// Parse the verbose output of Django's `runtests.py`.
pub fn parse_log_django(log: &str) -> TestStatusMap {
    let mut map = TestStatusMap::new();
    let mut pending: Option<String> = None;

    for line in log.lines() {
        let line = line.trim_end();

        if let Some((name, outcome)) = line.rsplit_once(" ... ") {
            let status = match outcome.trim() {
                "ok" | "OK" => Some(TestStatus::Passed),
                "FAIL" => Some(TestStatus::Failed),
                "ERROR" => Some(TestStatus::Error),
                "expected failure" => Some(TestStatus::Xfail),
                s if s.starts_with("skipped") => Some(TestStatus::Skipped),
                _ => None,
            };
            if let Some(status) = status {
                let name = if is_django_test_name(name) {
                    name.to_string()
                } else {
                    // Docstring line: the test name was printed on the previous line.
                    pending.take().unwrap_or_else(|| name.to_string())
                };
                map.insert(name, status);
                pending = None;
                continue;
            }
        }

        if is_django_test_name(line) {
            pending = Some(line.to_string());
        }

        for (prefix, status) in [("FAIL: ", TestStatus::Failed), ("ERROR: ", TestStatus::Error)] {
            if let Some(name) = line.strip_prefix(prefix) {
                map.insert(name.trim().to_string(), status);
            }
        }
    }
    map
}

fn is_django_test_name(s: &str) -> bool {
    match s.trim().split_once(" (") {
        Some((method, rest)) => {
            !method.is_empty() && !method.contains(' ') && rest.ends_with(')') && !rest.contains(' ')
        }
        None => false,
    }
}

/// Pick the parser for `repo`.
pub fn parse_log(repo: &str, log: &str) -> TestStatusMap {
    if repo == "django/django" {
        parse_log_django(log)
    } else {
        parse_log_pytest(log)
    }
}

/// Which expected tests passed and failed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestResults {
    pub success: Vec<String>,
    pub failure: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestsStatus {
    #[serde(rename = "FAIL_TO_PASS")]
    pub fail_to_pass: TestResults,
    #[serde(rename = "PASS_TO_PASS")]
    pub pass_to_pass: TestResults,
}

impl TestsStatus {
    /// Every FAIL_TO_PASS and PASS_TO_PASS test passed.
    pub fn is_resolved(&self) -> bool {
        self.fail_to_pass.failure.is_empty() && self.pass_to_pass.failure.is_empty()
    }
}

fn split_results(tests: &[String], statuses: &TestStatusMap) -> TestResults {
    let mut results = TestResults::default();
    for test in tests {
        if statuses.get(test).is_some_and(TestStatus::is_pass) {
            results.success.push(test.clone());
        } else {
            results.failure.push(test.clone());
        }
    }
    results
}

/// Grade parsed statuses against the instance's expected tests. Tests absent
/// from the log count as failures.
pub fn grade(instance: &SweBenchInstance, statuses: &TestStatusMap) -> TestsStatus {
    TestsStatus {
        fail_to_pass: split_results(&instance.fail_to_pass, statuses),
        pass_to_pass: split_results(&instance.pass_to_pass, statuses),
    }
}

/// Files touched by a diff that do not look like data or docs.
const NON_TEST_EXTS: [&str; 11] = [
    ".json", ".png", "csv", ".txt", ".md", ".jpg", ".jpeg", ".pkl", ".yml", ".yaml", ".toml",
];

/// Target paths of the `diff --git` headers in `patch`, deduplicated.
pub fn patch_files(patch: &str) -> Vec<String> {
    let mut files: Vec<String> = patch
        .lines()
        .filter_map(|l| l.strip_prefix("diff --git a/"))
        .filter_map(|rest| rest.split_once(" b/").map(|(_, b)| b.trim().to_string()))
        .collect();
    files.dedup();
    files
}

/// Test targets for the files changed by `test_patch`.
pub fn test_directives(instance: &SweBenchInstance) -> Vec<String> {
    let mut directives: Vec<String> = patch_files(&instance.test_patch)
        .into_iter()
        .filter(|path| !NON_TEST_EXTS.iter().any(|ext| path.ends_with(ext)))
        .collect();

    if instance.repo == "django/django" {
        directives = directives
            .into_iter()
            .map(|d| {
                let d = d.strip_suffix(".py").unwrap_or(&d);
                let d = d.strip_prefix("tests/").unwrap_or(d);
                d.replace('/', ".")
            })
            .collect();
    }
    directives
}

/// Command running the instance's tests.
pub fn test_command(instance: &SweBenchInstance, override_cmd: Option<&str>) -> String {
    let base = match override_cmd {
        Some(cmd) if !cmd.is_empty() => cmd.to_string(),
        _ if instance.repo == "django/django" => {
            "./tests/runtests.py --verbosity 2 --settings=test_sqlite --parallel 1".to_string()
        }
        _ => "pytest --no-header -rA --tb=no -p no:cacheprovider".to_string(),
    };
    let directives = test_directives(instance);
    if directives.is_empty() {
        base
    } else {
        format!("{} {}", base, directives.join(" "))
    }
}
