//! Files written by a benchmark run.
//!
//! ```text
//! <output>/
//!   preds.json                 {instance_id: Prediction}
//!   exit_statuses.yaml         {status: [instance_id, ...]}
//!   <instance_id>/<instance_id>.traj.json
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use crate::agent::AgentMessage;
use crate::retrieval::RetrievalResult;

pub const PREDS_FILE: &str = "preds.json";
pub const EXIT_STATUSES_FILE: &str = "exit_statuses.yaml";
pub const TRAJECTORY_FORMAT: &str = "swe-runner-1";

/// One entry of `preds.json`, the evaluation harness input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub model_name_or_path: String,
    pub instance_id: String,
    #[serde(default)]
    pub model_patch: String,
}

/// Call and cost counters of one agent run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelStats {
    pub instance_cost: f64,
    pub api_calls: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrajectoryInfo {
    pub exit_status: String,
    pub submission: String,
    pub model_stats: ModelStats,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retrieval: Option<RetrievalResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    /// Effective run configuration.
    pub config: Value,
}

/// Full record of one instance run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trajectory {
    pub instance_id: String,
    pub info: TrajectoryInfo,
    pub messages: Vec<AgentMessage>,
    pub trajectory_format: String,
}

impl Trajectory {
    pub fn path_for(output_dir: &Path, instance_id: &str) -> PathBuf {
        output_dir
            .join(instance_id)
            .join(format!("{}.traj.json", instance_id))
    }

    pub async fn save(&self, output_dir: &Path) -> io::Result<PathBuf> {
        let path = Self::path_for(output_dir, &self.instance_id);
        let json = serde_json::to_string_pretty(self).map_err(io::Error::other)?;
        write_atomic(&path, json).await?;
        Ok(path)
    }
}

/// `preds.json` shared by concurrent workers.
pub struct PredictionStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl PredictionStore {
    pub fn new(output_dir: &Path) -> Self {
        Self {
            path: output_dir.join(PREDS_FILE),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current predictions. A missing file is empty.
    pub async fn load(&self) -> io::Result<BTreeMap<String, Prediction>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) if text.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(text) => serde_json::from_str(&text).map_err(io::Error::other),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e),
        }
    }

    /// Insert or replace one prediction.
    pub async fn update(&self, prediction: Prediction) -> io::Result<()> {
        let _guard = self.lock.lock().await;
        let mut preds = self.load().await?;
        preds.insert(prediction.instance_id.clone(), prediction);
        write_atomic(&self.path, serde_json::to_string_pretty(&preds).map_err(io::Error::other)?).await
    }
}

/// `exit_statuses.yaml` shared by concurrent workers.
pub struct ExitStatusLog {
    path: PathBuf,
    statuses: Mutex<BTreeMap<String, Vec<String>>>,
}

impl ExitStatusLog {
    /// Continue the log of a previous run if one exists.
    pub async fn open(output_dir: &Path) -> io::Result<Self> {
        let path = output_dir.join(EXIT_STATUSES_FILE);
        let statuses = match tokio::fs::read_to_string(&path).await {
            Ok(text) => serde_yaml::from_str::<Option<BTreeMap<String, Vec<String>>>>(&text)
                .map_err(io::Error::other)?
                .unwrap_or_default(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e),
        };
        Ok(Self {
            path,
            statuses: Mutex::new(statuses),
        })
    }

    /// Record `status` for `instance_id`, replacing any earlier status.
    pub async fn record(&self, instance_id: &str, status: &str) -> io::Result<()> {
        let mut statuses = self.statuses.lock().await;
        for ids in statuses.values_mut() {
            ids.retain(|id| id != instance_id);
        }
        statuses.retain(|_, ids| !ids.is_empty());
        statuses
            .entry(status.to_string())
            .or_default()
            .push(instance_id.to_string());

        let yaml = serde_yaml::to_string(&*statuses).map_err(io::Error::other)?;
        write_atomic(&self.path, yaml).await
    }

    pub async fn snapshot(&self) -> BTreeMap<String, Vec<String>> {
        self.statuses.lock().await.clone()
    }
}

async fn write_atomic(path: &Path, contents: String) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, contents).await?;
    tokio::fs::rename(&tmp, path).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pred(id: &str, patch: &str) -> Prediction {
        Prediction {
            model_name_or_path: "m".to_string(),
            instance_id: id.to_string(),
            model_patch: patch.to_string(),
        }
    }

    #[tokio::test]
    async fn test_prediction_store_updates() {
        let tmp = tempfile::tempdir().unwrap();
        let store = PredictionStore::new(tmp.path());
        assert!(store.load().await.unwrap().is_empty());

        store.update(pred("a", "p1")).await.unwrap();
        store.update(pred("b", "p2")).await.unwrap();
        store.update(pred("a", "p3")).await.unwrap();

        let preds = store.load().await.unwrap();
        assert_eq!(preds.len(), 2);
        assert_eq!(preds["a"].model_patch, "p3");

        let raw: Value = serde_json::from_str(&std::fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(raw["b"]["instance_id"], "b");
    }

    #[tokio::test]
    async fn test_concurrent_updates_are_kept() {
        let tmp = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(PredictionStore::new(tmp.path()));
        let futures = (0..8).map(|i| {
            let store = store.clone();
            async move { store.update(pred(&format!("i{}", i), "x")).await }
        });
        for r in futures::future::join_all(futures).await {
            r.unwrap();
        }
        assert_eq!(store.load().await.unwrap().len(), 8);
    }

    #[tokio::test]
    async fn test_exit_status_log_moves_instances() {
        let tmp = tempfile::tempdir().unwrap();
        let log = ExitStatusLog::open(tmp.path()).await.unwrap();
        log.record("a", "LimitsExceeded").await.unwrap();
        log.record("b", "Submitted").await.unwrap();
        log.record("a", "Submitted").await.unwrap();

        let snapshot = log.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot["Submitted"], vec!["b", "a"]);

        let reopened = ExitStatusLog::open(tmp.path()).await.unwrap();
        assert_eq!(reopened.snapshot().await, snapshot);
    }

    #[test]
    fn test_trajectory_path() {
        let path = Trajectory::path_for(Path::new("/out"), "x__y-1");
        assert_eq!(path, PathBuf::from("/out/x__y-1/x__y-1.traj.json"));
    }

    #[tokio::test]
    async fn test_trajectory_save_replaces_file_without_leftovers() {
        let tmp = tempfile::tempdir().unwrap();
        let now = Utc::now();
        let mut trajectory = Trajectory {
            instance_id: "x__y-1".to_string(),
            info: TrajectoryInfo {
                exit_status: "Submitted".to_string(),
                submission: "first".to_string(),
                model_stats: ModelStats::default(),
                retrieval: None,
                error: None,
                started_at: now,
                completed_at: now,
                config: Value::Null,
            },
            messages: Vec::new(),
            trajectory_format: TRAJECTORY_FORMAT.to_string(),
        };
        let path = trajectory.save(tmp.path()).await.unwrap();
        trajectory.info.submission = "second".to_string();
        assert_eq!(trajectory.save(tmp.path()).await.unwrap(), path);

        let saved: Trajectory =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(saved.info.submission, "second");
        let files: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(files, vec![std::ffi::OsString::from("x__y-1.traj.json")]);
    }
}
