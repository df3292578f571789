//! SWE-bench instances: loading, naming and selection.
//!
//! Datasets come from the HuggingFace datasets-server rows API or from a
//! local `.json` / `.jsonl` export. Subset shorthands (`lite`, `verified`, ...)
//! resolve to their HuggingFace dataset names.

pub mod huggingface;

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::path::Path;
use tracing::info;

use crate::error::DatasetError;

pub use huggingface::{HuggingFaceRowsClient, RowsClientConfig};

/// Seed used by `--shuffle`.
pub const SHUFFLE_SEED: u64 = 42;

/// HuggingFace dataset for a subset shorthand. Other names pass through.
pub fn resolve_dataset_name(subset: &str) -> &str {
    match subset {
        "lite" => "princeton-nlp/SWE-Bench_Lite",
        "verified" => "princeton-nlp/SWE-Bench_Verified",
        "full" => "princeton-nlp/SWE-Bench",
        "multimodal" => "princeton-nlp/SWE-Bench_Multimodal",
        "multilingual" => "swe-bench/SWE-Bench_Multilingual",
        "smith" => "SWE-bench/SWE-smith",
        "_test" => "klieret/swe-bench-dummy-test-dataset",
        other => other,
    }
}

/// One benchmark task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweBenchInstance {
    pub instance_id: String,
    #[serde(default)]
    pub repo: String,
    #[serde(default)]
    pub base_commit: String,
    #[serde(default)]
    pub problem_statement: String,
    /// Gold patch.
    #[serde(default)]
    pub patch: String,
    #[serde(default)]
    pub test_patch: String,
    #[serde(rename = "FAIL_TO_PASS", default, deserialize_with = "string_or_list")]
    pub fail_to_pass: Vec<String>,
    #[serde(rename = "PASS_TO_PASS", default, deserialize_with = "string_or_list")]
    pub pass_to_pass: Vec<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub version: String,
    #[serde(default)]
    pub environment_setup_commit: Option<String>,
    #[serde(default)]
    pub image_name: Option<String>,
}

impl SweBenchInstance {
    /// Docker image holding the prepared repository at `/testbed`.
    pub fn image_name(&self) -> String {
        if let Some(image) = self.image_name.as_deref().filter(|i| !i.is_empty()) {
            return image.to_string();
        }
        let id = self.instance_id.replace("__", "_1776_");
        format!("docker.io/swebench/sweb.eval.x86_64.{}:latest", id).to_lowercase()
    }
}

/// Accept `["a", "b"]` or its JSON encoding `"[\"a\", \"b\"]"`.
fn string_or_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(Vec::new()),
        Value::String(s) if s.trim().is_empty() => Ok(Vec::new()),
        Value::String(s) => serde_json::from_str(&s).map_err(serde::de::Error::custom),
        Value::Array(items) => items
            .into_iter()
            .map(|v| match v {
                Value::String(s) => Ok(s),
                other => Err(serde::de::Error::custom(format!(
                    "expected test name, got {}",
                    other
                ))),
            })
            .collect(),
        other => Err(serde::de::Error::custom(format!(
            "expected list of tests, got {}",
            other
        ))),
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(String::new()),
        Value::String(s) => Ok(s),
        other => Ok(other.to_string()),
    }
}

/// Load instances from a local export: a JSON array or JSON lines.
pub fn load_local(path: &Path) -> Result<Vec<SweBenchInstance>, DatasetError> {
    let text = std::fs::read_to_string(path)?;
    let trimmed = text.trim_start();
    if trimmed.starts_with('[') {
        return Ok(serde_json::from_str(trimmed)?);
    }
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).map_err(DatasetError::from))
        .collect()
}

fn is_local_dataset(name: &str) -> bool {
    let path = Path::new(name);
    path.is_file()
        && matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("json") | Some("jsonl")
        )
}

/// Load every instance of `subset` / `split`.
pub async fn load_instances(subset: &str, split: &str) -> Result<Vec<SweBenchInstance>, DatasetError> {
    if is_local_dataset(subset) {
        let instances = load_local(Path::new(subset))?;
        info!(path = %subset, count = instances.len(), "Loaded local dataset");
        return Ok(instances);
    }

    let dataset = resolve_dataset_name(subset);
    info!(dataset = %dataset, split = %split, "Loading dataset");
    HuggingFaceRowsClient::new().fetch_all(dataset, split).await
}

/// Parse `start:end` with either bound optional. Negative bounds count from the end.
pub fn parse_slice(spec: &str) -> Result<(Option<i64>, Option<i64>), DatasetError> {
    let invalid = || DatasetError::InvalidSlice(spec.to_string());
    let (start, end) = spec.split_once(':').ok_or_else(invalid)?;
    let parse = |s: &str| -> Result<Option<i64>, DatasetError> {
        let s = s.trim();
        if s.is_empty() {
            Ok(None)
        } else {
            s.parse().map(Some).map_err(|_| invalid())
        }
    };
    Ok((parse(start)?, parse(end)?))
}

fn resolve_bound(bound: Option<i64>, len: usize, default: usize) -> usize {
    match bound {
        None => default,
        Some(b) if b < 0 => len.saturating_sub(b.unsigned_abs() as usize),
        Some(b) => (b as usize).min(len),
    }
}

/// Selection applied to a loaded dataset, in order: shuffle, filter, slice.
///
/// Shuffling sorts by instance id first so the seeded order does not depend
/// on how the dataset was loaded.
#[derive(Debug, Clone, Default)]
pub struct InstanceSelection {
    /// Regex matched against the start of the instance id.
    pub filter: Option<String>,
    pub slice: Option<String>,
    pub shuffle: bool,
}

impl InstanceSelection {
    pub fn apply(&self, instances: Vec<SweBenchInstance>) -> Result<Vec<SweBenchInstance>, DatasetError> {
        let mut selected = instances;

        if self.shuffle {
            selected.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
            let mut rng = ChaCha8Rng::seed_from_u64(SHUFFLE_SEED);
            selected.shuffle(&mut rng);
        }

        if let Some(filter) = self.filter.as_deref().filter(|f| !f.is_empty()) {
            let pattern = Regex::new(&format!("^(?:{})", filter))?;
            selected.retain(|i| pattern.is_match(&i.instance_id));
        }

        if let Some(slice) = self.slice.as_deref().filter(|s| !s.is_empty()) {
            let (start, end) = parse_slice(slice)?;
            let len = selected.len();
            let start = resolve_bound(start, len, 0);
            let end = resolve_bound(end, len, len);
            selected = if start < end {
                selected.drain(start..end).collect()
            } else {
                Vec::new()
            };
        }

        Ok(selected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(id: &str) -> SweBenchInstance {
        SweBenchInstance {
            instance_id: id.to_string(),
            repo: String::new(),
            base_commit: String::new(),
            problem_statement: String::new(),
            patch: String::new(),
            test_patch: String::new(),
            fail_to_pass: Vec::new(),
            pass_to_pass: Vec::new(),
            version: String::new(),
            environment_setup_commit: None,
            image_name: None,
        }
    }

    fn ids(instances: &[SweBenchInstance]) -> Vec<&str> {
        instances.iter().map(|i| i.instance_id.as_str()).collect()
    }

    #[test]
    fn test_subset_names() {
        assert_eq!(resolve_dataset_name("lite"), "princeton-nlp/SWE-Bench_Lite");
        assert_eq!(resolve_dataset_name("verified"), "princeton-nlp/SWE-Bench_Verified");
        assert_eq!(resolve_dataset_name("org/custom"), "org/custom");
    }

    #[test]
    fn test_image_name() {
        let inst = instance("django__django-11099");
        assert_eq!(
            inst.image_name(),
            "docker.io/swebench/sweb.eval.x86_64.django_1776_django-11099:latest"
        );
        let upper = instance("Org__Repo-1");
        assert_eq!(
            upper.image_name(),
            "docker.io/swebench/sweb.eval.x86_64.org_1776_repo-1:latest"
        );
        let mut custom = instance("x__y-1");
        custom.image_name = Some("my/image:tag".to_string());
        assert_eq!(custom.image_name(), "my/image:tag");
    }

    #[test]
    fn test_tests_accept_encoded_and_plain_lists() {
        let encoded = r#"{"instance_id": "a__b-1", "FAIL_TO_PASS": "[\"t1\", \"t2\"]", "PASS_TO_PASS": ["t3"], "version": 3.1}"#;
        let inst: SweBenchInstance = serde_json::from_str(encoded).unwrap();
        assert_eq!(inst.fail_to_pass, vec!["t1", "t2"]);
        assert_eq!(inst.pass_to_pass, vec!["t3"]);
        assert_eq!(inst.version, "3.1");
    }

    #[test]
    fn test_load_local_json_and_jsonl() {
        let tmp = tempfile::tempdir().unwrap();
        let json = tmp.path().join("d.json");
        std::fs::write(&json, r#"[{"instance_id": "a"}, {"instance_id": "b"}]"#).unwrap();
        assert_eq!(ids(&load_local(&json).unwrap()), vec!["a", "b"]);

        let jsonl = tmp.path().join("d.jsonl");
        std::fs::write(&jsonl, "{\"instance_id\": \"c\"}\n\n{\"instance_id\": \"d\"}\n").unwrap();
        assert_eq!(ids(&load_local(&jsonl).unwrap()), vec!["c", "d"]);
    }

    #[test]
    fn test_parse_slice() {
        assert_eq!(parse_slice("0:5").unwrap(), (Some(0), Some(5)));
        assert_eq!(parse_slice(":3").unwrap(), (None, Some(3)));
        assert_eq!(parse_slice("-2:").unwrap(), (Some(-2), None));
        assert!(matches!(parse_slice("5"), Err(DatasetError::InvalidSlice(_))));
        assert!(matches!(parse_slice("a:b"), Err(DatasetError::InvalidSlice(_))));
    }

    #[test]
    fn test_selection_filter_then_slice() {
        let all: Vec<_> = ["django__1", "django__2", "flask__1", "django__3"]
            .iter()
            .map(|i| instance(i))
            .collect();
        let selection = InstanceSelection {
            filter: Some("django".to_string()),
            slice: Some("1:".to_string()),
            shuffle: false,
        };
        assert_eq!(ids(&selection.apply(all).unwrap()), vec!["django__2", "django__3"]);
    }

    #[test]
    fn test_selection_negative_and_empty_slice() {
        let all: Vec<_> = ["a", "b", "c"].iter().map(|i| instance(i)).collect();
        let tail = InstanceSelection {
            slice: Some("-1:".to_string()),
            ..Default::default()
        };
        assert_eq!(ids(&tail.apply(all.clone()).unwrap()), vec!["c"]);
        let empty = InstanceSelection {
            slice: Some("2:1".to_string()),
            ..Default::default()
        };
        assert!(empty.apply(all).unwrap().is_empty());
    }

    #[test]
    fn test_shuffle_is_deterministic() {
        let all: Vec<_> = (0..20).map(|i| instance(&format!("i{}", i))).collect();
        let selection = InstanceSelection {
            shuffle: true,
            ..Default::default()
        };
        let a = selection.apply(all.clone()).unwrap();
        let b = selection.apply(all.clone()).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, all);
    }

    #[test]
    fn test_shuffle_before_slice_samples_whole_dataset() {
        let all: Vec<_> = (0..50).map(|i| instance(&format!("i{:02}", i))).collect();
        let selection = InstanceSelection {
            slice: Some("0:3".to_string()),
            shuffle: true,
            ..Default::default()
        };
        let picked = selection.apply(all.clone()).unwrap();
        assert_eq!(picked.len(), 3);
        let first_three = ["i00", "i01", "i02"];
        assert!(ids(&picked).iter().any(|id| !first_three.contains(id)));

        // Input order does not change the seeded sample.
        let mut reversed = all;
        reversed.reverse();
        assert_eq!(selection.apply(reversed).unwrap(), picked);
    }

    #[test]
    fn test_shuffle_then_filter() {
        let all: Vec<_> = (0..30)
            .map(|i| instance(&format!("{}__{:02}", if i % 2 == 0 { "django" } else { "flask" }, i)))
            .collect();
        let selection = InstanceSelection {
            filter: Some("flask".to_string()),
            slice: Some(":5".to_string()),
            shuffle: true,
        };
        let picked = selection.apply(all).unwrap();
        assert_eq!(picked.len(), 5);
        assert!(ids(&picked).iter().all(|id| id.starts_with("flask")));
    }
}
