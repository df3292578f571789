//! Benchmark runner.
//!
//! ```text
//! instances → [retrieval on repo snapshot] → DefaultAgent in container → preds.json
//!                                                                      → <id>/<id>.traj.json
//!                                                                      → exit_statuses.yaml
//! ```
//!
//! # Example
//!
//! ```ignore
//! use swe_runner::runner::BatchRunner;
//!
//! let runner = BatchRunner::new(config, provider, "./results").with_workers(4);
//! let summary = runner.run(instances).await?;
//! println!("{} instances, ${:.2}", summary.completed, summary.total_cost);
//! ```

pub mod executor;
pub mod result;

pub use executor::{
    BatchRunner, BatchSummary, EnvironmentFactory, InstanceImageFactory, InstanceOutcome,
    RunnerError,
};
pub use result::{
    ExitStatusLog, ModelStats, Prediction, PredictionStore, Trajectory, TrajectoryInfo,
    EXIT_STATUSES_FILE, PREDS_FILE,
};
