//! CLI command definitions for swe-runner.

use crate::config::RunnerConfig;
use crate::dataset::{load_instances, resolve_dataset_name, InstanceSelection};
use crate::evaluation::{EvaluationConfig, EvaluationHarness};
use crate::llm::{LiteLlmClient, LlmProvider};
use crate::retrieval::{apply_retrieval_to_config, retrieve, RetrievalQuery};
use crate::runner::BatchRunner;
use anyhow::Context;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Default output directory for benchmark runs.
const DEFAULT_OUTPUT_DIR: &str = "./swe-runner-output";

/// Run an LLM agent on SWE-bench and evaluate its patches.
#[derive(Parser)]
#[command(name = "swe-runner")]
#[command(about = "Run and evaluate LLM agents on SWE-bench")]
#[command(version)]
#[command(
    long_about = "swe-runner runs a shell-command agent on SWE-bench instances inside their Docker images, \
optionally guiding it with retrieved repository context, and grades the produced patches.\n\n\
Example usage:\n  swe-runner run --subset lite --split dev --workers 4 --retrieval bm25 -o ./results\n  \
swe-runner evaluate --predictions_path ./results/preds.json --run_id lite-bm25"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the agent on a SWE-bench subset and write preds.json.
    #[command(alias = "swebench")]
    Run(RunArgs),

    /// Evaluate predictions by running the instance tests in Docker.
    #[command(alias = "run-evaluation")]
    Evaluate(EvaluateArgs),

    /// Run a retrieval strategy against a local checkout and print the result.
    Retrieve(RetrieveArgs),
}

/// Arguments for `swe-runner run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// SWE-bench subset (lite, verified, full, multimodal, multilingual, a
    /// HuggingFace dataset path or a local .json/.jsonl file).
    #[arg(long, default_value = "lite")]
    pub subset: String,

    /// Dataset split.
    #[arg(long, default_value = "dev")]
    pub split: String,

    /// Output directory for trajectories and preds.json.
    #[arg(short = 'o', long, default_value = DEFAULT_OUTPUT_DIR)]
    pub output: PathBuf,

    /// Number of instances run concurrently.
    #[arg(short = 'w', long, default_value = "1")]
    pub workers: usize,

    /// Run configuration YAML (defaults to the built-in SWE-bench config).
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Retrieval strategy (none, bm25, bm25_py, bm25_source, bm25_two_stage, hybrid).
    #[arg(long, default_value = "none")]
    pub retrieval: String,

    /// Model name, overrides the configuration file.
    #[arg(short = 'm', long)]
    pub model: Option<String>,

    /// Slice of instances, e.g. `0:5`.
    #[arg(long)]
    pub slice: Option<String>,

    /// Regex matched against instance ids.
    #[arg(long)]
    pub filter: Option<String>,

    /// Shuffle instances (seeded) before filtering and slicing.
    #[arg(long)]
    pub shuffle: bool,

    /// Re-run instances that already have a prediction.
    #[arg(long)]
    pub redo_existing: bool,

    /// OpenRouter API key (otherwise LITELLM_API_BASE / LITELLM_API_KEY are used).
    #[arg(long, env = "OPENROUTER_API_KEY")]
    pub api_key: Option<String>,
}

/// Arguments for `swe-runner evaluate`.
#[derive(Parser, Debug)]
pub struct EvaluateArgs {
    /// Dataset name or local file.
    #[arg(long = "dataset_name", default_value = "princeton-nlp/SWE-bench_Lite")]
    pub dataset_name: String,

    /// Dataset split.
    #[arg(long, default_value = "test")]
    pub split: String,

    /// Predictions file (.json or .jsonl).
    #[arg(long = "predictions_path")]
    pub predictions_path: PathBuf,

    /// Identifier of this evaluation run.
    #[arg(long = "run_id")]
    pub run_id: String,

    /// Directory for the final report.
    #[arg(long = "report_dir", default_value = ".")]
    pub report_dir: PathBuf,

    /// Directory for per-instance logs.
    #[arg(long = "log_dir", default_value = "logs/run_evaluation")]
    pub log_dir: PathBuf,

    /// Number of instances evaluated concurrently.
    #[arg(long = "max_workers", default_value = "4")]
    pub max_workers: usize,

    /// Test run timeout in seconds.
    #[arg(long, default_value = "1800")]
    pub timeout: u64,

    /// Only evaluate these instance ids.
    #[arg(long = "instance_ids", num_args = 1.., value_delimiter = ',')]
    pub instance_ids: Vec<String>,

    /// Replace the repository's default test command.
    #[arg(long = "test-cmd")]
    pub test_cmd: Option<String>,
}

/// Arguments for `swe-runner retrieve`.
#[derive(Parser, Debug)]
pub struct RetrieveArgs {
    /// Repository checkout to search.
    #[arg(short = 'r', long)]
    pub repo: PathBuf,

    /// Task description used as the query.
    #[arg(short = 't', long, conflicts_with = "task_file")]
    pub task: Option<String>,

    /// File containing the task description.
    #[arg(long)]
    pub task_file: Option<PathBuf>,

    /// Retrieval strategy.
    #[arg(short = 's', long, default_value = "bm25")]
    pub strategy: String,

    /// Number of results.
    #[arg(short = 'k', long)]
    pub top_k: Option<usize>,

    /// `owner/name` of the repository, used to infer its source directory.
    #[arg(long)]
    pub repo_slug: Option<String>,

    /// Run configuration YAML supplying the remaining retrieval settings.
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Parse CLI arguments and execute the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_benchmark_command(args).await,
        Commands::Evaluate(args) => run_evaluate_command(args).await,
        Commands::Retrieve(args) => run_retrieve_command(args).await,
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<RunnerConfig> {
    RunnerConfig::load(path).with_context(|| match path {
        Some(p) => format!("Failed to load config {}", p.display()),
        None => "Failed to load built-in config".to_string(),
    })
}

fn build_llm_client(api_key: Option<String>) -> anyhow::Result<LiteLlmClient> {
    if let Some(key) = api_key.filter(|k| !k.is_empty()) {
        info!("Using OpenRouter with specified API key");
        return Ok(LiteLlmClient::new_with_defaults(key));
    }
    info!("Using LiteLLM client from environment");
    LiteLlmClient::from_env().map_err(|e| {
        anyhow::anyhow!(
            "Failed to initialize LLM client: {}. Please provide --api-key or set OPENROUTER_API_KEY/LITELLM_API_BASE env var.",
            e
        )
    })
}

async fn run_benchmark_command(args: RunArgs) -> anyhow::Result<()> {
    let mut config = load_config(args.config.as_deref())?;
    apply_retrieval_to_config(&mut config, &args.retrieval);

    let client = build_llm_client(args.api_key)?;
    if let Some(model) = args.model {
        config.model.model_name = model;
    }
    if config.model.model_name.is_empty() {
        config.model.model_name = client.default_model().to_string();
    }
    let provider: Arc<dyn LlmProvider> = Arc::new(client);

    let dataset = resolve_dataset_name(&args.subset).to_string();
    info!(dataset = %dataset, split = %args.split, "Loading instances");
    let instances = load_instances(&args.subset, &args.split)
        .await
        .with_context(|| format!("Failed to load {} ({})", dataset, args.split))?;
    let selection = InstanceSelection {
        filter: args.filter,
        slice: args.slice,
        shuffle: args.shuffle,
    };
    let instances = selection.apply(instances)?;
    info!(
        instances = instances.len(),
        model = %config.model.model_name,
        retrieval = %config.run.retrieval_strategy,
        "Starting SWE-bench run"
    );

    let runner = BatchRunner::new(config, provider, args.output.clone())
        .with_workers(args.workers)
        .with_redo_existing(args.redo_existing);
    let summary = runner.run(instances).await?;

    println!("\n=== SWE-bench Run ===");
    println!("Instances:   {}", summary.total);
    println!("Skipped:     {}", summary.skipped);
    println!("Completed:   {}", summary.completed);
    println!("Total cost:  ${:.4}", summary.total_cost);
    for (status, count) in &summary.by_status {
        println!("  {:<24} {}", status, count);
    }
    println!("Output:      {}", args.output.display());
    Ok(())
}

async fn run_evaluate_command(args: EvaluateArgs) -> anyhow::Result<()> {
    if !args.predictions_path.exists() {
        anyhow::bail!(
            "Predictions file does not exist: {}",
            args.predictions_path.display()
        );
    }

    let config = EvaluationConfig {
        dataset_name: resolve_dataset_name(&args.dataset_name).to_string(),
        split: args.split,
        predictions_path: args.predictions_path,
        run_id: args.run_id,
        report_dir: args.report_dir,
        log_dir: args.log_dir,
        max_workers: args.max_workers,
        timeout: args.timeout,
        instance_ids: args.instance_ids,
        test_cmd: args.test_cmd,
        ..Default::default()
    };
    let (report, path) = EvaluationHarness::new(config).run().await?;

    println!("\n=== SWE-bench Evaluation ===");
    println!("Total instances:     {}", report.total_instances);
    println!("Submitted:           {}", report.submitted_instances);
    println!("Completed:           {}", report.completed_instances);
    println!("Resolved:            {}", report.resolved_instances);
    println!("Unresolved:          {}", report.unresolved_instances);
    println!("Empty patches:       {}", report.empty_patch_instances);
    println!("Errors:              {}", report.error_instances);
    println!("Report written to {}", path.display());
    Ok(())
}

async fn run_retrieve_command(args: RetrieveArgs) -> anyhow::Result<()> {
    if !args.repo.is_dir() {
        anyhow::bail!("Repository does not exist: {}", args.repo.display());
    }
    let task = match (args.task, args.task_file) {
        (Some(task), _) => task,
        (None, Some(path)) => std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?,
        (None, None) => anyhow::bail!("Provide --task or --task-file"),
    };

    let mut config = load_config(args.config.as_deref())?;
    apply_retrieval_to_config(&mut config, &args.strategy);
    if let Some(top_k) = args.top_k {
        config.run.retrieval_top_k = top_k;
    }

    let result = retrieve(
        &config.run,
        RetrievalQuery {
            task: &task,
            repo: &args.repo,
            repo_slug: args.repo_slug.as_deref(),
            lint_output: None,
        },
    )
    .await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else if result.is_empty() {
        println!("No results for strategy {}", result.strategy);
    } else {
        println!("{}", result.render());
    }
    Ok(())
}
