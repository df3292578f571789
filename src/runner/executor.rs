//! Batch runner: one agent run per SWE-bench instance.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use super::result::{
    ExitStatusLog, ModelStats, Prediction, PredictionStore, Trajectory, TrajectoryInfo,
    TRAJECTORY_FORMAT,
};
use crate::agent::DefaultAgent;
use crate::config::RunnerConfig;
use crate::dataset::SweBenchInstance;
use crate::environment::{create_environment, Environment, EnvironmentConfig};
use crate::error::EnvironmentError;
use crate::llm::{CostTracker, LitellmModel, LlmProvider, Model};
use crate::retrieval::{retrieve, RetrievalQuery, RetrievalResult, RetrievalStrategy};

/// Errors that abort a whole batch. Per-instance failures are recorded instead.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Failed to prepare output directory: {0}")]
    Setup(#[from] std::io::Error),
}

/// Creates the environment an instance runs in.
#[async_trait]
pub trait EnvironmentFactory: Send + Sync {
    async fn create(
        &self,
        instance: &SweBenchInstance,
        config: &EnvironmentConfig,
    ) -> Result<Box<dyn Environment>, EnvironmentError>;
}

/// Starts the configured backend with the instance's SWE-bench image.
pub struct InstanceImageFactory;

#[async_trait]
impl EnvironmentFactory for InstanceImageFactory {
    async fn create(
        &self,
        instance: &SweBenchInstance,
        config: &EnvironmentConfig,
    ) -> Result<Box<dyn Environment>, EnvironmentError> {
        let mut config = config.clone();
        config.image = Some(instance.image_name());
        create_environment(&config).await
    }
}

/// Outcome of one instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceOutcome {
    pub instance_id: String,
    pub exit_status: String,
    pub cost: f64,
    pub api_calls: u64,
}

/// Totals of a batch run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: usize,
    pub skipped: usize,
    pub completed: usize,
    pub by_status: BTreeMap<String, usize>,
    pub total_cost: f64,
}

/// Runs the agent over many instances with bounded concurrency.
pub struct BatchRunner {
    config: RunnerConfig,
    provider: Arc<dyn LlmProvider>,
    model_name: String,
    output_dir: PathBuf,
    workers: usize,
    redo_existing: bool,
    env_factory: Arc<dyn EnvironmentFactory>,
    tracker: Arc<CostTracker>,
}

impl BatchRunner {
    pub fn new(
        config: RunnerConfig,
        provider: Arc<dyn LlmProvider>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        let model_name = config.model.model_name.clone();
        Self {
            config,
            provider,
            model_name,
            output_dir: output_dir.into(),
            workers: 1,
            redo_existing: false,
            env_factory: Arc::new(InstanceImageFactory),
            tracker: Arc::new(CostTracker::new()),
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_redo_existing(mut self, redo: bool) -> Self {
        self.redo_existing = redo;
        self
    }

    pub fn with_env_factory(mut self, factory: Arc<dyn EnvironmentFactory>) -> Self {
        self.env_factory = factory;
        self
    }

    /// Name written to `model_name_or_path`.
    pub fn with_model_name(mut self, name: impl Into<String>) -> Self {
        self.model_name = name.into();
        self
    }

    pub fn tracker(&self) -> &Arc<CostTracker> {
        &self.tracker
    }

    /// Run every instance not already in `preds.json` (all of them with
    /// `redo_existing`).
    pub async fn run(&self, instances: Vec<SweBenchInstance>) -> Result<BatchSummary, RunnerError> {
        tokio::fs::create_dir_all(&self.output_dir).await?;
        let preds = PredictionStore::new(&self.output_dir);
        let statuses = ExitStatusLog::open(&self.output_dir).await?;

        let total = instances.len();
        let pending: Vec<SweBenchInstance> = if self.redo_existing {
            instances
        } else {
            let existing = preds.load().await?;
            instances
                .into_iter()
                .filter(|i| !existing.contains_key(&i.instance_id))
                .collect()
        };
        let skipped = total - pending.len();
        if skipped > 0 {
            info!(skipped, "Skipping instances with existing predictions");
        }
        info!(
            instances = pending.len(),
            workers = self.workers,
            output = %self.output_dir.display(),
            "Starting batch run"
        );

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let preds = &preds;
        let statuses = &statuses;
        let futures = pending.iter().map(|instance| {
            let sem = semaphore.clone();
            async move {
                let Ok(_permit) = sem.acquire().await else {
                    return None;
                };
                let outcome = self.process_instance(instance, preds).await;
                if let Err(e) = statuses.record(&outcome.instance_id, &outcome.exit_status).await {
                    warn!(instance_id = %outcome.instance_id, error = %e, "Failed to update exit statuses");
                }
                Some(outcome)
            }
        });
        let outcomes = futures::future::join_all(futures).await;

        let mut summary = BatchSummary {
            total,
            skipped,
            ..Default::default()
        };
        for outcome in outcomes.into_iter().flatten() {
            summary.completed += 1;
            summary.total_cost += outcome.cost;
            *summary.by_status.entry(outcome.exit_status).or_insert(0) += 1;
        }
        info!(
            completed = summary.completed,
            total_cost = summary.total_cost,
            "Batch run finished"
        );
        Ok(summary)
    }

    /// Run one instance and persist its trajectory and prediction. Never fails:
    /// errors become the exit status.
    pub async fn process_instance(
        &self,
        instance: &SweBenchInstance,
        preds: &PredictionStore,
    ) -> InstanceOutcome {
        let instance_id = instance.instance_id.clone();
        let started_at = Utc::now();
        info!(instance_id = %instance_id, "Running instance");

        let mut run = InstanceRun::default();
        match self
            .env_factory
            .create(instance, &self.config.environment)
            .await
        {
            Ok(env) => {
                self.run_in_environment(instance, env.as_ref(), &mut run).await;
                if let Err(e) = env.cleanup().await {
                    warn!(instance_id = %instance_id, error = %e, "Environment cleanup failed");
                }
            }
            Err(e) => {
                error!(instance_id = %instance_id, error = %e, "Failed to start environment");
                run.exit_status = "EnvironmentError".to_string();
                run.error = Some(e.to_string());
            }
        }

        let trajectory = Trajectory {
            instance_id: instance_id.clone(),
            info: TrajectoryInfo {
                exit_status: run.exit_status.clone(),
                submission: run.submission.clone(),
                model_stats: ModelStats {
                    instance_cost: run.cost,
                    api_calls: run.api_calls,
                },
                retrieval: run.retrieval.take(),
                error: run.error.take(),
                started_at,
                completed_at: Utc::now(),
                config: serde_json::to_value(&self.config).unwrap_or(Value::Null),
            },
            messages: std::mem::take(&mut run.messages),
            trajectory_format: TRAJECTORY_FORMAT.to_string(),
        };
        if let Err(e) = trajectory.save(&self.output_dir).await {
            warn!(instance_id = %instance_id, error = %e, "Failed to save trajectory");
        }

        let prediction = Prediction {
            model_name_or_path: self.model_name.clone(),
            instance_id: instance_id.clone(),
            model_patch: run.submission.clone(),
        };
        if let Err(e) = preds.update(prediction).await {
            warn!(instance_id = %instance_id, error = %e, "Failed to update predictions");
        }

        info!(
            instance_id = %instance_id,
            exit_status = %run.exit_status,
            cost = run.cost,
            "Instance finished"
        );
        InstanceOutcome {
            instance_id,
            exit_status: run.exit_status,
            cost: run.cost,
            api_calls: run.api_calls,
        }
    }

    async fn run_in_environment(
        &self,
        instance: &SweBenchInstance,
        env: &dyn Environment,
        run: &mut InstanceRun,
    ) {
        let retrieval = self.retrieve_context(instance, env).await;
        let mut extra = Map::new();
        extra.insert(
            "retrieval".to_string(),
            Value::from(retrieval.as_ref().map(RetrievalResult::render).unwrap_or_default()),
        );
        extra.insert("instance_id".to_string(), Value::from(instance.instance_id.clone()));
        run.retrieval = retrieval;

        let model = LitellmModel::new(self.provider.clone(), self.config.model.clone())
            .with_tracker(self.tracker.clone(), instance.instance_id.clone());
        let mut agent = match DefaultAgent::new(self.config.agent.clone(), Box::new(model), env) {
            Ok(agent) => agent,
            Err(e) => {
                run.exit_status = e.exit_status().to_string();
                run.error = Some(e.to_string());
                return;
            }
        };

        match agent.run(&instance.problem_statement, extra).await {
            Ok((status, message)) => {
                run.exit_status = status;
                run.submission = message;
            }
            Err(e) => {
                error!(instance_id = %instance.instance_id, error = %e, "Agent failed");
                run.exit_status = e.exit_status().to_string();
                run.error = Some(e.to_string());
            }
        }
        run.cost = agent.model().cost();
        run.api_calls = agent.model().n_calls();
        run.messages = agent.messages().to_vec();
    }

    /// Retrieval over a host snapshot of the instance's checkout. Failures are
    /// logged and leave the prompt without retrieved context.
    async fn retrieve_context(
        &self,
        instance: &SweBenchInstance,
        env: &dyn Environment,
    ) -> Option<RetrievalResult> {
        let strategy = RetrievalStrategy::parse(&self.config.run.retrieval_strategy);
        if strategy.is_none() {
            return None;
        }

        let snapshot = match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(e) => {
                warn!(instance_id = %instance.instance_id, error = %e, "Failed to create snapshot dir");
                return None;
            }
        };
        if let Err(e) = env.copy_repo_to(snapshot.path()).await {
            warn!(instance_id = %instance.instance_id, error = %e, "Failed to snapshot repository");
            return None;
        }

        let lint_output = match self.config.run.retrieval_lint_command.as_deref() {
            Some(cmd) if !cmd.is_empty() => match env.execute(cmd).await {
                Ok(out) => Some(out.output),
                Err(e) => {
                    warn!(instance_id = %instance.instance_id, error = %e, "Lint command failed");
                    None
                }
            },
            _ => None,
        };

        self.retrieve_from(instance, snapshot.path(), lint_output.as_deref())
            .await
    }

    async fn retrieve_from(
        &self,
        instance: &SweBenchInstance,
        repo: &Path,
        lint_output: Option<&str>,
    ) -> Option<RetrievalResult> {
        let query = RetrievalQuery {
            task: &instance.problem_statement,
            repo,
            repo_slug: Some(&instance.repo),
            lint_output,
        };
        match retrieve(&self.config.run, query).await {
            Ok(result) => Some(result),
            Err(e) => {
                warn!(instance_id = %instance.instance_id, error = %e, "Retrieval failed");
                None
            }
        }
    }
}

#[derive(Default)]
struct InstanceRun {
    exit_status: String,
    submission: String,
    cost: f64,
    api_calls: u64,
    messages: Vec<crate::agent::AgentMessage>,
    retrieval: Option<RetrievalResult>,
    error: Option<String>,
}
